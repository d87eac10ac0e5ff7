//! Stream-backed LLM request queue with pub/sub result delivery.
//!
//! Producers append requests to a redis stream consumed by a worker group.
//! Results come back out-of-band: the worker stores the response under a
//! TTL'd key, then publishes on a per-request channel. Waiters read the
//! cache, subscribe, and read the cache again before blocking; the second
//! read closes the window where a response lands between the first read and
//! the subscription.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::redis_client::RedisHandle;

pub const REQUEST_STREAM_KEY: &str = "llm:requests";
pub const CONSUMER_GROUP: &str = "llm-workers";

/// A request travelling through the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub request_id: String,
    pub request_type: String,
    pub payload: Value,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
}

impl LlmRequest {
    pub fn new(request_type: &str, payload: Value, priority: i32, timeout_secs: i64) -> Self {
        let now = Utc::now();
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            request_type: request_type.to_string(),
            payload,
            priority,
            created_at: now,
            timeout_at: now + chrono::Duration::seconds(timeout_secs),
            retry_count: 0,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.timeout_at <= Utc::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmResponseStatus {
    Success,
    Error,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub request_id: String,
    pub status: LlmResponseStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub processing_time_ms: u64,
    pub completed_at: DateTime<Utc>,
}

impl LlmResponse {
    pub fn success(request_id: &str, result: Value, processing_time_ms: u64) -> Self {
        Self {
            request_id: request_id.to_string(),
            status: LlmResponseStatus::Success,
            result: Some(result),
            error: None,
            processing_time_ms,
            completed_at: Utc::now(),
        }
    }

    pub fn error(request_id: &str, error: &str, processing_time_ms: u64) -> Self {
        Self {
            request_id: request_id.to_string(),
            status: LlmResponseStatus::Error,
            result: None,
            error: Some(error.to_string()),
            processing_time_ms,
            completed_at: Utc::now(),
        }
    }

    pub fn timeout(request_id: &str, processing_time_ms: u64) -> Self {
        Self {
            request_id: request_id.to_string(),
            status: LlmResponseStatus::Timeout,
            result: None,
            error: Some("request timed out".to_string()),
            processing_time_ms,
            completed_at: Utc::now(),
        }
    }
}

/// One pending stream entry: the entry id to ACK plus the decoded request.
#[derive(Debug)]
pub struct PendingRequest {
    pub entry_id: String,
    pub request: LlmRequest,
}

pub struct LlmRequestQueue {
    redis: RedisHandle,
    stream_key: String,
    group: String,
    response_ttl_secs: u64,
}

impl LlmRequestQueue {
    pub fn new(redis: RedisHandle, response_ttl_secs: u64) -> Self {
        Self {
            redis,
            stream_key: REQUEST_STREAM_KEY.to_string(),
            group: CONSUMER_GROUP.to_string(),
            response_ttl_secs,
        }
    }

    #[cfg(test)]
    fn with_stream_key(mut self, stream_key: &str) -> Self {
        self.stream_key = stream_key.to_string();
        self
    }

    /// Create the consumer group if it does not exist yet.
    pub async fn ensure_group(&self) -> Result<()> {
        let mut redis = self.redis.manager.clone();
        let created: std::result::Result<(), redis::RedisError> = redis
            .xgroup_create_mkstream(&self.stream_key, &self.group, "$")
            .await;

        match created {
            Ok(()) => {
                log::info!("Created consumer group {} on {}", self.group, self.stream_key);
                Ok(())
            }
            // BUSYGROUP means another process created it first.
            Err(err) if err.to_string().contains("BUSYGROUP") => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Append a request to the stream; returns its request id.
    pub async fn enqueue(&self, request: &LlmRequest) -> Result<String> {
        let data = serde_json::to_string(request)
            .map_err(|e| AppError::llm(format!("unserializable request: {}", e)))?;

        let mut redis = self.redis.manager.clone();
        let _: String = redis
            .xadd(&self.stream_key, "*", &[("data", data.as_str())])
            .await?;

        log::debug!(
            "Enqueued {} request {} (priority {})",
            request.request_type,
            request.request_id,
            request.priority
        );
        Ok(request.request_id.clone())
    }

    /// Read up to `count` pending entries for this consumer, blocking up to
    /// `block_ms` when the stream is empty.
    pub async fn read_batch(
        &self,
        consumer: &str,
        count: usize,
        block_ms: usize,
    ) -> Result<Vec<PendingRequest>> {
        let options = StreamReadOptions::default()
            .group(&self.group, consumer)
            .count(count)
            .block(block_ms);

        let mut redis = self.redis.manager.clone();
        let reply: StreamReadReply = redis
            .xread_options(&[&self.stream_key], &[">"], &options)
            .await?;

        let mut pending = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                let Some(data) = entry.get::<String>("data") else {
                    log::warn!("Stream entry {} has no data field, acking away", entry.id);
                    self.ack(&entry.id).await?;
                    continue;
                };
                match serde_json::from_str::<LlmRequest>(&data) {
                    Ok(request) => pending.push(PendingRequest {
                        entry_id: entry.id.clone(),
                        request,
                    }),
                    Err(err) => {
                        log::warn!("Undecodable stream entry {}: {}", entry.id, err);
                        self.ack(&entry.id).await?;
                    }
                }
            }
        }
        Ok(pending)
    }

    pub async fn ack(&self, entry_id: &str) -> Result<()> {
        let mut redis = self.redis.manager.clone();
        let _: i64 = redis.xack(&self.stream_key, &self.group, &[entry_id]).await?;
        Ok(())
    }

    pub async fn len(&self) -> Result<u64> {
        let mut redis = self.redis.manager.clone();
        Ok(redis.xlen(&self.stream_key).await?)
    }

    /// Store a response then publish the wake-up, in that order. Waiters
    /// re-reading the cache after subscribing therefore never miss it.
    pub async fn store_response(&self, response: &LlmResponse) -> Result<()> {
        let data = serde_json::to_string(response)
            .map_err(|e| AppError::llm(format!("unserializable response: {}", e)))?;

        let mut redis = self.redis.manager.clone();
        let _: () = redis
            .set_ex(
                response_key(&response.request_id),
                data,
                self.response_ttl_secs,
            )
            .await?;
        let _: i64 = redis
            .publish(response_channel(&response.request_id), "ready")
            .await?;
        Ok(())
    }

    /// Wait for the response to `request_id`, up to `timeout`.
    pub async fn wait_for_result(
        &self,
        request_id: &str,
        timeout: Duration,
    ) -> Result<LlmResponse> {
        // Fast path: response already cached.
        if let Some(response) = self.read_response(request_id).await? {
            return Ok(response);
        }

        let channel = response_channel(request_id);
        let mut pubsub = self.redis.client.get_async_pubsub().await?;
        pubsub.subscribe(&channel).await?;

        // Re-check after subscribing: the response may have landed between
        // the first read and the SUBSCRIBE.
        let result = match self.read_response(request_id).await? {
            Some(response) => Ok(response),
            None => {
                let mut messages = pubsub.on_message();
                match tokio::time::timeout(timeout, messages.next()).await {
                    Ok(Some(_)) => match self.read_response(request_id).await? {
                        Some(response) => Ok(response),
                        None => Err(AppError::llm(format!(
                            "notified for {} but response key is missing",
                            request_id
                        ))),
                    },
                    Ok(None) => Err(AppError::llm("pub/sub connection closed")),
                    Err(_) => Err(AppError::Timeout(format!("llm request {}", request_id))),
                }
            }
        };

        pubsub.unsubscribe(&channel).await.ok();
        result
    }

    async fn read_response(&self, request_id: &str) -> Result<Option<LlmResponse>> {
        let mut redis = self.redis.manager.clone();
        let raw: Option<String> = redis.get(response_key(request_id)).await?;
        match raw {
            Some(data) => {
                let response = serde_json::from_str(&data)
                    .map_err(|e| AppError::llm(format!("undecodable response: {}", e)))?;
                Ok(Some(response))
            }
            None => Ok(None),
        }
    }
}

pub fn response_key(request_id: &str) -> String {
    format!("llm:response:{}", request_id)
}

pub fn response_channel(request_id: &str) -> String {
    format!("llm:response:notify:{}", request_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_and_channel_naming() {
        assert_eq!(response_key("abc"), "llm:response:abc");
        assert_eq!(response_channel("abc"), "llm:response:notify:abc");
    }

    #[test]
    fn request_expiry() {
        let mut request = LlmRequest::new("extract_fields", serde_json::json!({}), 5, 300);
        assert!(!request.is_expired());
        request.timeout_at = Utc::now() - chrono::Duration::seconds(1);
        assert!(request.is_expired());
    }

    #[test]
    fn response_serde_round_trip() {
        let response = LlmResponse::success("req-1", serde_json::json!({"a": 1}), 42);
        let raw = serde_json::to_string(&response).unwrap();
        let parsed: LlmResponse = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.request_id, "req-1");
        assert_eq!(parsed.status, LlmResponseStatus::Success);
        assert_eq!(parsed.result, Some(serde_json::json!({"a": 1})));
    }

    #[test]
    fn status_serializes_lowercase() {
        let raw = serde_json::to_string(&LlmResponseStatus::Timeout).unwrap();
        assert_eq!(raw, "\"timeout\"");
    }

    // Exercises the full enqueue -> worker-store -> wait path against a
    // local redis. Run with: cargo test -- --ignored
    #[tokio::test]
    #[ignore]
    async fn wait_for_result_round_trip_against_redis() {
        let handle = crate::redis_client::init_redis("redis://localhost:6379/0")
            .await
            .unwrap();
        let queue = LlmRequestQueue::new(handle.clone(), 300).with_stream_key("llm:requests:test");

        let request = LlmRequest::new("extract_fields", serde_json::json!({}), 5, 300);
        let request_id = request.request_id.clone();

        let publisher_queue =
            LlmRequestQueue::new(handle, 300).with_stream_key("llm:requests:test");
        let publisher_id = request_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let response = LlmResponse::success(&publisher_id, serde_json::json!({"ok": true}), 7);
            publisher_queue.store_response(&response).await.unwrap();
        });

        let response = queue
            .wait_for_result(&request_id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(response.status, LlmResponseStatus::Success);
        assert_eq!(response.request_id, request_id);
    }
}
