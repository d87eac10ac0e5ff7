//! Runtime configuration loaded from the environment.

use anyhow::{bail, Result};
use std::env;

/// API keys that are obviously placeholders and must be rejected.
const TRIVIAL_API_KEYS: &[&str] = &[
    "changeme-changeme",
    "your-api-key-here",
    "test-test-test-test",
    "0000000000000000",
];

/// Application settings.
///
/// Every knob is environment-backed with a production-safe default; only
/// the connection URLs and the API key are required.
#[derive(Debug, Clone)]
pub struct Settings {
    // Auth
    pub api_key: String,

    // Backends
    pub database_url: String,
    pub redis_url: String,
    pub qdrant_url: String,
    pub firecrawl_url: String,
    pub openai_base_url: String,
    pub openai_api_key: String,

    // LLM
    pub llm_model: String,
    pub llm_http_timeout: u64,
    pub llm_queue_enabled: bool,
    pub llm_max_retries: u32,
    pub llm_base_temperature: f64,
    pub llm_retry_temperature_increment: f64,
    pub llm_retry_backoff_min: f64,
    pub llm_retry_backoff_max: f64,
    pub llm_max_tokens: u32,

    // Scraping
    pub scrape_timeout: u64,
    pub scrape_delay_min: u64,
    pub scrape_delay_max: u64,
    pub scrape_daily_limit_per_domain: u32,
    pub scrape_retry_max_attempts: u32,
    pub scrape_retry_base_delay: f64,
    pub scrape_retry_max_delay: f64,
    pub max_concurrent_crawls: usize,

    // Job staleness thresholds (seconds)
    pub job_stale_threshold_scrape: i64,
    pub job_stale_threshold_extract: i64,
    pub job_stale_threshold_crawl: i64,

    // Extraction
    pub extraction_source_quoting_enabled: bool,
    pub extraction_conflict_detection_enabled: bool,

    // Boilerplate detection
    pub boilerplate_threshold_pct: f64,
    pub boilerplate_min_pages: usize,
    pub boilerplate_min_block_chars: usize,

    // Alerting
    pub alert_webhook_url: Option<String>,
    pub alert_webhook_format: String,
    pub alerting_enabled: bool,

    // HTTPS enforcement (consumed by the API layer)
    pub enforce_https: bool,
    pub https_redirect_host: Option<String>,
}

impl Settings {
    /// Load settings from environment variables, applying defaults.
    pub fn from_env() -> Result<Self> {
        let api_key = require("QUARRY_API_KEY")?;
        validate_api_key(&api_key)?;

        let settings = Self {
            api_key,
            database_url: require("DATABASE_URL")?,
            redis_url: get("REDIS_URL", "redis://localhost:6379/0"),
            qdrant_url: get("QDRANT_URL", "http://localhost:6333"),
            firecrawl_url: get("FIRECRAWL_URL", "http://localhost:3002"),
            openai_base_url: get("OPENAI_BASE_URL", "https://api.openai.com/v1"),
            openai_api_key: get("OPENAI_API_KEY", ""),

            llm_model: get("LLM_MODEL", "gpt-4o-mini"),
            llm_http_timeout: parse("LLM_HTTP_TIMEOUT", 120)?,
            llm_queue_enabled: parse("LLM_QUEUE_ENABLED", false)?,
            llm_max_retries: parse("LLM_MAX_RETRIES", 3)?,
            llm_base_temperature: parse("LLM_BASE_TEMPERATURE", 0.1)?,
            llm_retry_temperature_increment: parse("LLM_RETRY_TEMPERATURE_INCREMENT", 0.1)?,
            llm_retry_backoff_min: parse("LLM_RETRY_BACKOFF_MIN", 4.0)?,
            llm_retry_backoff_max: parse("LLM_RETRY_BACKOFF_MAX", 60.0)?,
            llm_max_tokens: parse("LLM_MAX_TOKENS", 4096)?,

            scrape_timeout: parse("SCRAPE_TIMEOUT", 60)?,
            scrape_delay_min: parse("SCRAPE_DELAY_MIN", 2)?,
            scrape_delay_max: parse("SCRAPE_DELAY_MAX", 5)?,
            scrape_daily_limit_per_domain: parse("SCRAPE_DAILY_LIMIT_PER_DOMAIN", 500)?,
            scrape_retry_max_attempts: parse("SCRAPE_RETRY_MAX_ATTEMPTS", 3)?,
            scrape_retry_base_delay: parse("SCRAPE_RETRY_BASE_DELAY", 1.0)?,
            scrape_retry_max_delay: parse("SCRAPE_RETRY_MAX_DELAY", 60.0)?,
            max_concurrent_crawls: parse("MAX_CONCURRENT_CRAWLS", 3)?,

            job_stale_threshold_scrape: parse("JOB_STALE_THRESHOLD_SCRAPE", 300)?,
            job_stale_threshold_extract: parse("JOB_STALE_THRESHOLD_EXTRACT", 900)?,
            job_stale_threshold_crawl: parse("JOB_STALE_THRESHOLD_CRAWL", 1800)?,

            extraction_source_quoting_enabled: parse("EXTRACTION_SOURCE_QUOTING_ENABLED", true)?,
            extraction_conflict_detection_enabled: parse(
                "EXTRACTION_CONFLICT_DETECTION_ENABLED",
                true,
            )?,

            boilerplate_threshold_pct: parse("BOILERPLATE_THRESHOLD_PCT", 0.7)?,
            boilerplate_min_pages: parse("BOILERPLATE_MIN_PAGES", 5)?,
            boilerplate_min_block_chars: parse("BOILERPLATE_MIN_BLOCK_CHARS", 50)?,

            alert_webhook_url: env::var("ALERT_WEBHOOK_URL").ok().filter(|v| !v.is_empty()),
            alert_webhook_format: get("ALERT_WEBHOOK_FORMAT", "json"),
            alerting_enabled: parse("ALERTING_ENABLED", true)?,

            enforce_https: parse("ENFORCE_HTTPS", false)?,
            https_redirect_host: env::var("HTTPS_REDIRECT_HOST").ok().filter(|v| !v.is_empty()),
        };

        if settings.scrape_delay_min > settings.scrape_delay_max {
            bail!(
                "SCRAPE_DELAY_MIN ({}) must not exceed SCRAPE_DELAY_MAX ({})",
                settings.scrape_delay_min,
                settings.scrape_delay_max
            );
        }

        Ok(settings)
    }
}

fn get(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn require(name: &str) -> Result<String> {
    match env::var(name) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => bail!("Required environment variable {} is not set", name),
    }
}

fn parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(v) => Ok(v),
            Err(e) => bail!("Invalid value for {}: {}", name, e),
        },
        Err(_) => Ok(default),
    }
}

fn validate_api_key(key: &str) -> Result<()> {
    if key.len() < 16 {
        bail!("QUARRY_API_KEY must be at least 16 characters");
    }
    let lowered = key.to_lowercase();
    if TRIVIAL_API_KEYS.contains(&lowered.as_str()) {
        bail!("QUARRY_API_KEY must not be a placeholder value");
    }
    // A key that is one repeated character is as good as empty.
    if key.chars().all(|c| c == key.chars().next().unwrap()) {
        bail!("QUARRY_API_KEY must not be a single repeated character");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_api_key_rejected() {
        assert!(validate_api_key("short").is_err());
    }

    #[test]
    fn placeholder_api_key_rejected() {
        assert!(validate_api_key("changeme-changeme").is_err());
        assert!(validate_api_key("aaaaaaaaaaaaaaaaaaaa").is_err());
    }

    #[test]
    fn strong_api_key_accepted() {
        assert!(validate_api_key("f3b1c9d2e4a6+secret-key").is_ok());
    }
}
