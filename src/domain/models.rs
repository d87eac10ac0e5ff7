//! Persistent domain models.
//!
//! These map one-to-one to the relational schema:
//! - `Project` is the logical tenant carrying the extraction schema
//! - `Job` is the unit of queued work (scrape, crawl, extract, report)
//! - `Source` is a fetched document with raw and cleaned markdown
//! - `Extraction` is one structured fact row per (source, field group)
//! - `Entity` is a normalized concept deduplicated per source group
//! - `DomainBoilerplate` is the per-domain block fingerprint set

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ============================================================================
// JOB
// ============================================================================

/// Kind of work a job represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Scrape,
    Crawl,
    Extract,
    Report,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scrape => "scrape",
            Self::Crawl => "crawl",
            Self::Extract => "extract",
            Self::Report => "report",
        }
    }
}

impl std::str::FromStr for JobType {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scrape" => Ok(Self::Scrape),
            "crawl" => Ok(Self::Crawl),
            "extract" => Ok(Self::Extract),
            "report" => Ok(Self::Report),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of a job.
///
/// Exactly one terminal transition per job: `completed`, `failed` and
/// `cancelled` are final. `cancelling` is the window between a cancel
/// request and the worker acknowledging it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Cancelling,
    Cancelled,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Cancelling => "cancelling",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_cancellable(&self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "cancelling" => Ok(Self::Cancelling),
            "cancelled" => Ok(Self::Cancelled),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A queued unit of work. Maps to the `jobs` table.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub project_id: Uuid,
    pub job_type: JobType,
    pub status: JobStatus,
    pub priority: i32,
    pub payload: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancellation_requested_at: Option<DateTime<Utc>>,
}

/// Payload of a scrape job: a flat list of URLs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapePayload {
    pub urls: Vec<String>,
    pub source_group: String,
    #[serde(default)]
    pub auto_extract: bool,
}

/// Payload of a crawl job: a start URL plus crawl bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlPayload {
    pub url: String,
    pub source_group: String,
    #[serde(default = "default_crawl_limit")]
    pub limit: usize,
    #[serde(default = "default_crawl_depth")]
    pub max_depth: u32,
    #[serde(default)]
    pub include_paths: Vec<String>,
    #[serde(default)]
    pub exclude_paths: Vec<String>,
    #[serde(default)]
    pub allow_backward_links: bool,
    #[serde(default)]
    pub auto_extract: bool,
}

fn default_crawl_limit() -> usize {
    50
}

fn default_crawl_depth() -> u32 {
    3
}

/// Payload of an extract job: which sources to process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractPayload {
    pub source_ids: Vec<Uuid>,
    #[serde(default)]
    pub profile: Option<String>,
}

/// Counters written into `job.result` by the scrape/crawl workers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScrapeOutcome {
    pub sources_scraped: u32,
    pub sources_failed: u32,
    pub rate_limited: u32,
    pub total_urls: u32,
}

// ============================================================================
// PROJECT
// ============================================================================

/// Logical tenant. Carries the extraction schema and per-project config.
#[derive(Debug, Clone, Serialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub extraction_schema: Value,
    pub entity_types: Value,
    pub extraction_context: Value,
    pub classification_config: Option<Value>,
    pub crawl_config: Option<Value>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Typed view over `Project.extraction_context`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionContext {
    /// Label for the kind of source being processed, e.g. "company".
    #[serde(default)]
    pub source_type: Option<String>,
    /// Per field-group name of the field that identifies an entity.
    #[serde(default)]
    pub entity_id_fields: std::collections::HashMap<String, String>,
}

impl Project {
    pub fn extraction_context(&self) -> ExtractionContext {
        serde_json::from_value(self.extraction_context.clone()).unwrap_or_default()
    }
}

// ============================================================================
// SOURCE
// ============================================================================

/// A fetched document. `(project_id, uri)` is unique.
#[derive(Debug, Clone, Serialize)]
pub struct Source {
    pub id: Uuid,
    pub project_id: Uuid,
    pub uri: String,
    pub source_group: String,
    pub source_type: String,
    pub title: Option<String>,
    pub content: Option<String>,
    pub cleaned_content: Option<String>,
    pub status: String,
    pub created_by_job_id: Option<Uuid>,
    pub page_type: Option<String>,
    pub relevant_field_groups: Option<Vec<String>>,
    pub classification_method: Option<String>,
    pub classification_confidence: Option<f64>,
    pub meta_data: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Source {
    /// Content handed to the extraction pipeline: the cleaned variant when
    /// available, otherwise the raw markdown.
    pub fn extraction_content(&self) -> &str {
        self.cleaned_content
            .as_deref()
            .or(self.content.as_deref())
            .unwrap_or("")
    }
}

/// Fields for inserting a new source.
#[derive(Debug, Clone)]
pub struct NewSource {
    pub project_id: Uuid,
    pub uri: String,
    pub source_group: String,
    pub source_type: String,
    pub title: Option<String>,
    pub content: Option<String>,
    pub cleaned_content: Option<String>,
    pub status: String,
    pub created_by_job_id: Option<Uuid>,
    pub page_type: Option<String>,
    pub relevant_field_groups: Option<Vec<String>>,
    pub classification_method: Option<String>,
    pub classification_confidence: Option<f64>,
    pub meta_data: Value,
}

// ============================================================================
// EXTRACTION
// ============================================================================

/// One structured fact row. `data` holds the merged field values plus the
/// `_quotes` / `_conflicts` / `_validation` metadata keys.
///
/// An extraction with non-empty `data` but `embedding_id = NULL` is an
/// orphan: readable in relational queries, invisible to vector search.
#[derive(Debug, Clone, Serialize)]
pub struct Extraction {
    pub id: Uuid,
    pub project_id: Uuid,
    pub source_id: Uuid,
    pub source_group: String,
    pub extraction_type: String,
    pub data: Value,
    pub confidence: Option<f64>,
    pub profile_used: Option<String>,
    pub embedding_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Fields for inserting a new extraction (embedding_id starts NULL).
#[derive(Debug, Clone)]
pub struct NewExtraction {
    pub project_id: Uuid,
    pub source_id: Uuid,
    pub source_group: String,
    pub extraction_type: String,
    pub data: Value,
    pub confidence: Option<f64>,
    pub profile_used: Option<String>,
}

// ============================================================================
// ENTITY
// ============================================================================

/// Normalized concept shared by extractions.
/// Dedup key: `(project_id, source_group, entity_type, normalized_value)`.
#[derive(Debug, Clone, Serialize)]
pub struct Entity {
    pub id: Uuid,
    pub project_id: Uuid,
    pub source_group: String,
    pub entity_type: String,
    pub value: String,
    pub normalized_value: String,
    pub attributes: Value,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// DOMAIN BOILERPLATE
// ============================================================================

/// Per-(project, domain) fingerprint of repeating page blocks.
#[derive(Debug, Clone, Serialize)]
pub struct DomainBoilerplate {
    pub id: Uuid,
    pub project_id: Uuid,
    pub domain: String,
    pub boilerplate_hashes: Vec<String>,
    pub pages_analyzed: i32,
    pub blocks_total: i32,
    pub blocks_boilerplate: i32,
    pub bytes_removed_avg: i32,
    pub threshold_pct: f64,
    pub min_pages: i32,
    pub min_block_chars: i32,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn job_status_round_trips() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Cancelling,
            JobStatus::Cancelled,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::from_str(status.as_str()), Ok(status));
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Cancelling.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn only_queued_and_running_are_cancellable() {
        assert!(JobStatus::Queued.is_cancellable());
        assert!(JobStatus::Running.is_cancellable());
        assert!(!JobStatus::Cancelling.is_cancellable());
        assert!(!JobStatus::Completed.is_cancellable());
    }

    #[test]
    fn extraction_content_prefers_cleaned() {
        let source = Source {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            uri: "https://example.com".into(),
            source_group: "acme".into(),
            source_type: "web".into(),
            title: None,
            content: Some("raw".into()),
            cleaned_content: Some("cleaned".into()),
            status: "completed".into(),
            created_by_job_id: None,
            page_type: None,
            relevant_field_groups: None,
            classification_method: None,
            classification_confidence: None,
            meta_data: serde_json::json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(source.extraction_content(), "cleaned");
    }

    #[test]
    fn crawl_payload_defaults() {
        let payload: CrawlPayload =
            serde_json::from_value(serde_json::json!({
                "url": "https://example.com",
                "source_group": "acme"
            }))
            .unwrap();
        assert_eq!(payload.limit, 50);
        assert_eq!(payload.max_depth, 3);
        assert!(!payload.auto_extract);
    }
}
