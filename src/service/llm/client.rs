//! Chat-completions client for the extraction LLM backend.
//!
//! Speaks the OpenAI-compatible API: JSON-object response format, a
//! temperature knob the retry path bumps, and a hard HTTP timeout.

use serde_json::{json, Value};
use std::time::Duration;

use crate::error::{AppError, Result};

#[derive(Debug, Clone)]
pub struct LlmClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub http_timeout_secs: u64,
    pub max_tokens: u32,
}

pub struct LlmClient {
    client: reqwest::Client,
    config: LlmClientConfig,
}

impl LlmClient {
    pub fn new(config: LlmClientConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.http_timeout_secs))
                .build()
                .expect("Failed to create HTTP client"),
            config,
        }
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// One chat call constrained to a JSON object response. Returns the raw
    /// message text; parsing and repair happen at the caller.
    pub async fn chat_json(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        temperature: f64,
    ) -> Result<String> {
        let body = json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt},
            ],
            "response_format": {"type": "json_object"},
            "temperature": temperature,
            "max_tokens": self.config.max_tokens,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url.trim_end_matches('/')))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            log::error!("LLM backend returned {}: {}", status, truncate(&detail, 200));
            return Err(AppError::HttpStatus {
                service: "llm",
                status: status.as_u16(),
            });
        }

        let payload: Value = response.json().await?;
        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| AppError::llm("response missing message content"))?;

        Ok(content.to_string())
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    fn config(base_url: String) -> LlmClientConfig {
        LlmClientConfig {
            base_url,
            api_key: "test-key".into(),
            model: "test-model".into(),
            http_timeout_secs: 10,
            max_tokens: 512,
        }
    }

    #[tokio::test]
    async fn returns_message_content() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(
                r#"{"choices": [{"message": {"content": "{\"facts\": []}"}}]}"#,
            )
            .create_async()
            .await;

        let client = LlmClient::new(config(server.url()));
        let content = client.chat_json("system", "user", 0.1).await.unwrap();
        assert_eq!(content, r#"{"facts": []}"#);
    }

    #[tokio::test]
    async fn server_error_is_retryable() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("POST", "/chat/completions")
            .with_status(500)
            .with_body("overloaded")
            .create_async()
            .await;

        let client = LlmClient::new(config(server.url()));
        let err = client.chat_json("system", "user", 0.1).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn missing_content_is_an_llm_error() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(r#"{"choices": []}"#)
            .create_async()
            .await;

        let client = LlmClient::new(config(server.url()));
        let err = client.chat_json("system", "user", 0.1).await.unwrap_err();
        assert!(matches!(err, AppError::Llm(_)));
    }
}
