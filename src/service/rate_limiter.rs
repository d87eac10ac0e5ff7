//! Per-domain rate limiter backed by redis.
//!
//! Tracks two things per domain:
//! - last request timestamp (enforces a randomized minimum spacing)
//! - a daily counter that expires at local midnight (enforces the quota)
//!
//! The counters live in redis so every worker process shares them; the
//! in-process per-domain mutex only keeps concurrent tasks from sleeping
//! through the same window twice.

use chrono::{Duration as ChronoDuration, Local, NaiveTime};
use dashmap::DashMap;
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::error::{AppError, Result};

/// Last-request keys expire after an hour of inactivity.
const LAST_REQUEST_TTL_SECS: u64 = 3600;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Minimum delay between requests to one domain, seconds.
    pub delay_min: u64,
    /// Maximum delay between requests to one domain, seconds.
    pub delay_max: u64,
    /// Maximum requests per domain per local day.
    pub daily_limit: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            delay_min: 2,
            delay_max: 5,
            daily_limit: 500,
        }
    }
}

pub struct DomainRateLimiter {
    redis: ConnectionManager,
    config: RateLimitConfig,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl DomainRateLimiter {
    pub fn new(redis: ConnectionManager, config: RateLimitConfig) -> Self {
        Self {
            redis,
            config,
            locks: DashMap::new(),
        }
    }

    /// Acquire permission to send one request to `domain`.
    ///
    /// Blocks until the inter-request spacing has elapsed, then records the
    /// request. Fails with `RateLimitExceeded` when the daily quota is
    /// already spent; that error carries the seconds until the counter
    /// resets.
    pub async fn acquire(&self, domain: &str) -> Result<()> {
        let count = self.daily_count(domain).await?;
        if count >= self.config.daily_limit as i64 {
            let reset_in = self.time_until_reset(domain).await?;
            return Err(AppError::RateLimitExceeded {
                domain: domain.to_string(),
                limit: self.config.daily_limit,
                reset_in,
            });
        }

        self.wait_if_needed(domain).await?;
        self.increment_daily_count(domain).await?;
        Ok(())
    }

    /// Sleep out the remainder of the randomized spacing window, then stamp
    /// the last-request time. Serialized per domain within this process.
    async fn wait_if_needed(&self, domain: &str) -> Result<()> {
        let lock = self.domain_lock(domain);
        let _guard = lock.lock().await;

        let key = last_request_key(domain);
        let mut redis = self.redis.clone();
        let last_request: Option<String> = redis.get(&key).await?;

        if let Some(raw) = last_request {
            if let Ok(last) = raw.parse::<f64>() {
                let elapsed = unix_now() - last;
                let delay = sample_delay(&self.config);
                if elapsed < delay {
                    let wait = delay - elapsed;
                    log::debug!("Rate limiter sleeping {:.2}s for {}", wait, domain);
                    sleep(Duration::from_secs_f64(wait)).await;
                }
            }
        }

        let _: () = redis
            .set_ex(&key, unix_now().to_string(), LAST_REQUEST_TTL_SECS)
            .await?;
        Ok(())
    }

    async fn daily_count(&self, domain: &str) -> Result<i64> {
        let mut redis = self.redis.clone();
        let count: Option<i64> = redis.get(daily_count_key(domain)).await?;
        Ok(count.unwrap_or(0))
    }

    /// INCR the daily counter; on first increment of the day, expire the
    /// key at local midnight.
    async fn increment_daily_count(&self, domain: &str) -> Result<i64> {
        let key = daily_count_key(domain);
        let mut redis = self.redis.clone();
        let count: i64 = redis.incr(&key, 1).await?;

        let ttl: i64 = redis.ttl(&key).await?;
        if ttl < 0 {
            let _: () = redis
                .expire(&key, seconds_until_local_midnight())
                .await?;
        }

        Ok(count)
    }

    /// Seconds until the daily counter resets (0 when no counter exists).
    pub async fn time_until_reset(&self, domain: &str) -> Result<i64> {
        let mut redis = self.redis.clone();
        let ttl: i64 = redis.ttl(daily_count_key(domain)).await?;
        Ok(ttl.max(0))
    }

    fn domain_lock(&self, domain: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

fn sample_delay(config: &RateLimitConfig) -> f64 {
    if config.delay_max <= config.delay_min {
        return config.delay_min as f64;
    }
    rand::thread_rng().gen_range(config.delay_min as f64..config.delay_max as f64)
}

fn last_request_key(domain: &str) -> String {
    format!("ratelimit:{}:last_request", domain)
}

fn daily_count_key(domain: &str) -> String {
    let today = Local::now().date_naive();
    format!("ratelimit:{}:daily_count:{}", domain, today)
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn seconds_until_local_midnight() -> i64 {
    let now = Local::now();
    let tomorrow = now.date_naive() + ChronoDuration::days(1);
    let midnight = tomorrow.and_time(NaiveTime::MIN);
    let remaining = midnight - now.naive_local();
    remaining.num_seconds().max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_shapes() {
        assert_eq!(
            last_request_key("example.com"),
            "ratelimit:example.com:last_request"
        );
        let key = daily_count_key("example.com");
        assert!(key.starts_with("ratelimit:example.com:daily_count:"));
        // Date suffix is yyyy-mm-dd.
        let suffix = key.rsplit(':').next().unwrap();
        assert_eq!(suffix.len(), 10);
    }

    #[test]
    fn midnight_ttl_is_within_a_day() {
        let secs = seconds_until_local_midnight();
        assert!(secs >= 1);
        assert!(secs <= 86_400);
    }

    #[test]
    fn delay_sample_stays_in_range() {
        let config = RateLimitConfig {
            delay_min: 2,
            delay_max: 5,
            daily_limit: 10,
        };
        for _ in 0..100 {
            let delay = sample_delay(&config);
            assert!(delay >= 2.0);
            assert!(delay < 5.0);
        }
    }

    #[test]
    fn degenerate_range_uses_min() {
        let config = RateLimitConfig {
            delay_min: 3,
            delay_max: 3,
            daily_limit: 10,
        };
        assert_eq!(sample_delay(&config), 3.0);
    }
}
