//! Client for the scraping backend (Firecrawl-compatible API).
//!
//! `scrape` is a single synchronous call; `crawl` submits a crawl job and
//! polls its status endpoint until the page set is complete.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::sleep;
use url::Url;

use crate::error::{AppError, Result};

/// How often the crawl status endpoint is polled.
const CRAWL_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// One fetched page as returned by the backend.
#[derive(Debug, Clone)]
pub struct ScrapeResult {
    pub success: bool,
    pub url: String,
    pub domain: String,
    pub markdown: Option<String>,
    pub title: Option<String>,
    pub http_status: u16,
    pub metadata: Value,
}

/// Crawl bounds passed through to the backend.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CrawlOptions {
    pub max_depth: u32,
    pub limit: usize,
    pub include_paths: Vec<String>,
    pub exclude_paths: Vec<String>,
    pub allow_backward_links: bool,
}

#[derive(Debug, Deserialize)]
struct ScrapeEnvelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Option<PageData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PageData {
    #[serde(default)]
    markdown: Option<String>,
    #[serde(default)]
    metadata: Value,
}

#[derive(Debug, Deserialize)]
struct CrawlSubmitResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CrawlStatusResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    data: Vec<PageData>,
    #[serde(default)]
    error: Option<String>,
}

pub struct FirecrawlClient {
    client: reqwest::Client,
    base_url: String,
    /// Upper bound on one crawl, submit to completion, in seconds.
    crawl_deadline: Duration,
}

impl FirecrawlClient {
    pub fn new(base_url: &str, request_timeout_secs: u64) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(request_timeout_secs))
                .build()
                .expect("Failed to create HTTP client"),
            base_url: base_url.trim_end_matches('/').to_string(),
            crawl_deadline: Duration::from_secs(30 * 60),
        }
    }

    /// Fetch one URL as markdown.
    pub async fn scrape(&self, url: &str) -> Result<ScrapeResult> {
        let response = self
            .client
            .post(format!("{}/v1/scrape", self.base_url))
            .json(&json!({ "url": url, "formats": ["markdown"] }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::HttpStatus {
                service: "firecrawl",
                status: status.as_u16(),
            });
        }

        let envelope: ScrapeEnvelope = response.json().await?;
        if !envelope.success {
            return Err(AppError::network(
                envelope.error.unwrap_or_else(|| "scrape failed".into()),
            ));
        }

        let data = envelope
            .data
            .ok_or_else(|| AppError::network("scrape response missing data"))?;
        Ok(page_to_result(data, url))
    }

    /// Crawl from a start URL and return every fetched page.
    pub async fn crawl(&self, url: &str, options: &CrawlOptions) -> Result<Vec<ScrapeResult>> {
        let body = json!({
            "url": url,
            "maxDepth": options.max_depth,
            "limit": options.limit,
            "includePaths": options.include_paths,
            "excludePaths": options.exclude_paths,
            "allowBackwardLinks": options.allow_backward_links,
            "scrapeOptions": { "formats": ["markdown"] },
        });

        let response = self
            .client
            .post(format!("{}/v1/crawl", self.base_url))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::HttpStatus {
                service: "firecrawl",
                status: status.as_u16(),
            });
        }

        let submitted: CrawlSubmitResponse = response.json().await?;
        if !submitted.success {
            return Err(AppError::network(
                submitted.error.unwrap_or_else(|| "crawl rejected".into()),
            ));
        }
        let crawl_id = submitted
            .id
            .ok_or_else(|| AppError::network("crawl response missing id"))?;

        log::info!("Crawl {} submitted for {}", crawl_id, url);
        self.poll_crawl(&crawl_id, url).await
    }

    async fn poll_crawl(&self, crawl_id: &str, start_url: &str) -> Result<Vec<ScrapeResult>> {
        let deadline = tokio::time::Instant::now() + self.crawl_deadline;

        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(AppError::Timeout(format!("crawl {}", crawl_id)));
            }

            let response = self
                .client
                .get(format!("{}/v1/crawl/{}", self.base_url, crawl_id))
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                return Err(AppError::HttpStatus {
                    service: "firecrawl",
                    status: status.as_u16(),
                });
            }

            let crawl_status: CrawlStatusResponse = response.json().await?;
            match crawl_status.status.as_str() {
                "completed" => {
                    log::info!(
                        "Crawl {} completed with {} pages",
                        crawl_id,
                        crawl_status.data.len()
                    );
                    return Ok(crawl_status
                        .data
                        .into_iter()
                        .map(|page| page_to_result(page, start_url))
                        .collect());
                }
                "failed" => {
                    return Err(AppError::network(
                        crawl_status.error.unwrap_or_else(|| "crawl failed".into()),
                    ));
                }
                other => {
                    log::debug!("Crawl {} still {}", crawl_id, other);
                    sleep(CRAWL_POLL_INTERVAL).await;
                }
            }
        }
    }
}

fn page_to_result(page: PageData, fallback_url: &str) -> ScrapeResult {
    let source_url = page
        .metadata
        .get("sourceURL")
        .and_then(Value::as_str)
        .unwrap_or(fallback_url)
        .to_string();
    let http_status = page
        .metadata
        .get("statusCode")
        .and_then(Value::as_u64)
        .unwrap_or(200) as u16;
    let title = page
        .metadata
        .get("title")
        .and_then(Value::as_str)
        .map(str::to_string);

    ScrapeResult {
        success: http_status < 400 && page.markdown.is_some(),
        domain: extract_domain(&source_url),
        url: source_url,
        markdown: page.markdown,
        title,
        http_status,
        metadata: page.metadata,
    }
}

/// Host component of a URL, e.g. "www.example.com".
pub fn extract_domain(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    #[test]
    fn extracts_domain() {
        assert_eq!(extract_domain("https://www.example.com/a/b"), "www.example.com");
        assert_eq!(extract_domain("not a url"), "");
    }

    #[tokio::test]
    async fn scrape_returns_markdown_and_metadata() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("POST", "/v1/scrape")
            .with_status(200)
            .with_body(
                r##"{
                    "success": true,
                    "data": {
                        "markdown": "# Hello",
                        "metadata": {
                            "title": "Hello Page",
                            "sourceURL": "https://example.com/hello",
                            "statusCode": 200
                        }
                    }
                }"##,
            )
            .create_async()
            .await;

        let client = FirecrawlClient::new(&server.url(), 10);
        let result = client.scrape("https://example.com/hello").await.unwrap();

        assert!(result.success);
        assert_eq!(result.markdown.as_deref(), Some("# Hello"));
        assert_eq!(result.title.as_deref(), Some("Hello Page"));
        assert_eq!(result.domain, "example.com");
        assert_eq!(result.http_status, 200);
    }

    #[tokio::test]
    async fn scrape_404_is_not_success() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("POST", "/v1/scrape")
            .with_status(200)
            .with_body(
                r#"{
                    "success": true,
                    "data": {
                        "markdown": "Not found",
                        "metadata": {"sourceURL": "https://example.com/gone", "statusCode": 404}
                    }
                }"#,
            )
            .create_async()
            .await;

        let client = FirecrawlClient::new(&server.url(), 10);
        let result = client.scrape("https://example.com/gone").await.unwrap();

        assert!(!result.success);
        assert_eq!(result.http_status, 404);
    }

    #[tokio::test]
    async fn scrape_5xx_maps_to_retryable_error() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("POST", "/v1/scrape")
            .with_status(503)
            .create_async()
            .await;

        let client = FirecrawlClient::new(&server.url(), 10);
        let err = client.scrape("https://example.com").await.unwrap_err();

        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn crawl_submits_then_polls_until_completed() {
        let mut server = Server::new_async().await;
        let _submit = server
            .mock("POST", "/v1/crawl")
            .with_status(200)
            .with_body(r#"{"success": true, "id": "crawl-1"}"#)
            .create_async()
            .await;
        let _status = server
            .mock("GET", "/v1/crawl/crawl-1")
            .with_status(200)
            .with_body(
                r#"{
                    "status": "completed",
                    "data": [
                        {"markdown": "Page A", "metadata": {"sourceURL": "https://example.com/a", "statusCode": 200}},
                        {"markdown": "Page B", "metadata": {"sourceURL": "https://example.com/b", "statusCode": 200}}
                    ]
                }"#,
            )
            .create_async()
            .await;

        let client = FirecrawlClient::new(&server.url(), 10);
        let pages = client
            .crawl("https://example.com", &CrawlOptions::default())
            .await
            .unwrap();

        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].url, "https://example.com/a");
        assert_eq!(pages[1].markdown.as_deref(), Some("Page B"));
    }
}
