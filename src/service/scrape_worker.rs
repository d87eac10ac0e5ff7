//! Scrape and crawl workers.
//!
//! Both claim jobs of their type, fetch pages through the external
//! scraping backend (rate-limited per domain, retried on transient
//! failures), classify and store the results as sources, and optionally
//! enqueue a follow-up extract job.

use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::{
    CrawlPayload, ExtractPayload, Job, JobType, NewSource, Project, ScrapeOutcome, ScrapePayload,
};
use crate::error::{AppError, Result};
use crate::repository::{DomainBoilerplateRepository, JobRepository, ProjectRepository, SourceRepository};
use crate::service::alerting::AlertService;
use crate::service::extraction::boilerplate::{analyze_domain, strip_boilerplate, BoilerplateConfig};
use crate::service::extraction::content_cleaner::strip_structural_junk;
use crate::service::extraction::page_classifier::{ClassificationConfig, PageClassifier};
use crate::service::firecrawl::{extract_domain, CrawlOptions, FirecrawlClient, ScrapeResult};
use crate::service::rate_limiter::DomainRateLimiter;
use crate::service::retry::{retry_with_backoff, RetryConfig};

pub struct ScrapeWorker {
    jobs: JobRepository,
    sources: SourceRepository,
    projects: ProjectRepository,
    boilerplate_repo: DomainBoilerplateRepository,
    fetcher: Arc<FirecrawlClient>,
    rate_limiter: Arc<DomainRateLimiter>,
    alerts: Arc<AlertService>,
    retry_config: RetryConfig,
    boilerplate_config: BoilerplateConfig,
}

impl ScrapeWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        jobs: JobRepository,
        sources: SourceRepository,
        projects: ProjectRepository,
        boilerplate_repo: DomainBoilerplateRepository,
        fetcher: Arc<FirecrawlClient>,
        rate_limiter: Arc<DomainRateLimiter>,
        alerts: Arc<AlertService>,
        retry_config: RetryConfig,
        boilerplate_config: BoilerplateConfig,
    ) -> Self {
        Self {
            jobs,
            sources,
            projects,
            boilerplate_repo,
            fetcher,
            rate_limiter,
            alerts,
            retry_config,
            boilerplate_config,
        }
    }

    /// Process one claimed scrape job: fetch each URL, store sources,
    /// write the counters into the job result.
    pub async fn process_scrape_job(&self, job: &Job) -> Result<()> {
        let outcome = match self.run_scrape(job).await {
            Ok(outcome) => outcome,
            Err(AppError::Cancelled) => {
                self.jobs.mark_cancelled(job.id).await?;
                return Ok(());
            }
            Err(err) => {
                self.jobs.mark_failed(job.id, &err.to_string()).await?;
                self.alerts
                    .alert_job_failed(job.id, "scrape", &err.to_string(), Some(job.project_id))
                    .await;
                return Err(err);
            }
        };

        self.finalize(job, outcome).await
    }

    async fn run_scrape(&self, job: &Job) -> Result<ScrapeOutcome> {
        let payload: ScrapePayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| AppError::Other(anyhow::anyhow!("invalid scrape payload: {}", e)))?;
        let project = self.require_project(job.project_id).await?;
        let classifier = build_classifier(&project);

        let mut outcome = ScrapeOutcome {
            total_urls: payload.urls.len() as u32,
            ..ScrapeOutcome::default()
        };
        let mut source_ids: Vec<Uuid> = Vec::new();

        for url in &payload.urls {
            if self.jobs.is_cancellation_requested(job.id).await? {
                log::info!("Scrape job {} cancelled mid-batch", job.id);
                return Err(AppError::Cancelled);
            }
            self.jobs.touch(job.id).await?;

            match self.fetch_one(url).await {
                Ok(result) => {
                    match self
                        .store_page(&project, &result, &payload.source_group, job.id, &classifier)
                        .await?
                    {
                        Some(source_id) => {
                            source_ids.push(source_id);
                            outcome.sources_scraped += 1;
                        }
                        None => outcome.sources_failed += 1,
                    }
                }
                Err(AppError::RateLimitExceeded { domain, reset_in, .. }) => {
                    log::warn!(
                        "Daily quota hit for {} (resets in {}s), skipping {}",
                        domain,
                        reset_in,
                        url
                    );
                    outcome.sources_failed += 1;
                    outcome.rate_limited += 1;
                }
                Err(err) => {
                    log::warn!("Failed to scrape {}: {}", url, err);
                    outcome.sources_failed += 1;
                }
            }
        }

        self.maybe_enqueue_extract(job, payload.auto_extract, source_ids)
            .await?;
        Ok(outcome)
    }

    /// Process one claimed crawl job: one backend crawl, then store every
    /// returned page and fingerprint domain boilerplate.
    pub async fn process_crawl_job(&self, job: &Job) -> Result<()> {
        let outcome = match self.run_crawl(job).await {
            Ok(outcome) => outcome,
            Err(AppError::Cancelled) => {
                self.jobs.mark_cancelled(job.id).await?;
                return Ok(());
            }
            Err(err) => {
                self.jobs.mark_failed(job.id, &err.to_string()).await?;
                self.alerts
                    .alert_job_failed(job.id, "crawl", &err.to_string(), Some(job.project_id))
                    .await;
                return Err(err);
            }
        };

        self.finalize(job, outcome).await
    }

    async fn run_crawl(&self, job: &Job) -> Result<ScrapeOutcome> {
        let payload: CrawlPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| AppError::Other(anyhow::anyhow!("invalid crawl payload: {}", e)))?;
        let project = self.require_project(job.project_id).await?;
        let classifier = build_classifier(&project);

        // One quota slot per crawl; the backend paces its own page fetches.
        let domain = extract_domain(&payload.url);
        if domain.is_empty() {
            return Err(AppError::InvalidUrl(payload.url.clone()));
        }
        self.rate_limiter.acquire(&domain).await?;

        let options = CrawlOptions {
            max_depth: payload.max_depth,
            limit: payload.limit,
            include_paths: payload.include_paths.clone(),
            exclude_paths: payload.exclude_paths.clone(),
            allow_backward_links: payload.allow_backward_links,
        };
        let fetcher = Arc::clone(&self.fetcher);
        let url = payload.url.clone();
        let pages = retry_with_backoff("crawl", &self.retry_config, || {
            let fetcher = Arc::clone(&fetcher);
            let url = url.clone();
            let options = options.clone();
            async move { fetcher.crawl(&url, &options).await }
        })
        .await?;

        let mut outcome = ScrapeOutcome {
            total_urls: pages.len() as u32,
            ..ScrapeOutcome::default()
        };
        let mut source_ids: Vec<Uuid> = Vec::new();
        let mut stored: Vec<(Uuid, ScrapeResult)> = Vec::new();

        for page in pages {
            if self.jobs.is_cancellation_requested(job.id).await? {
                log::info!("Crawl job {} cancelled mid-store", job.id);
                return Err(AppError::Cancelled);
            }
            self.jobs.touch(job.id).await?;

            match self
                .store_page(&project, &page, &payload.source_group, job.id, &classifier)
                .await?
            {
                Some(source_id) => {
                    source_ids.push(source_id);
                    stored.push((source_id, page));
                    outcome.sources_scraped += 1;
                }
                None => outcome.sources_failed += 1,
            }
        }

        self.refresh_domain_boilerplate(&project, &domain, &stored)
            .await;
        self.maybe_enqueue_extract(job, payload.auto_extract, source_ids)
            .await?;
        Ok(outcome)
    }

    /// Rate-limit then fetch one URL with retries around transient
    /// failures.
    async fn fetch_one(&self, url: &str) -> Result<ScrapeResult> {
        let domain = extract_domain(url);
        if domain.is_empty() {
            return Err(AppError::InvalidUrl(url.to_string()));
        }
        self.rate_limiter.acquire(&domain).await?;

        let fetcher = Arc::clone(&self.fetcher);
        let url = url.to_string();
        retry_with_backoff("scrape", &self.retry_config, move || {
            let fetcher = Arc::clone(&fetcher);
            let url = url.clone();
            async move { fetcher.scrape(&url).await }
        })
        .await
    }

    /// Store a fetched page as a source. Error pages are rejected up
    /// front; a re-fetched URI upserts in place. Returns None for pages
    /// that are not stored.
    async fn store_page(
        &self,
        project: &Project,
        result: &ScrapeResult,
        source_group: &str,
        job_id: Uuid,
        classifier: &PageClassifier,
    ) -> Result<Option<Uuid>> {
        if result.http_status >= 400 {
            log::warn!(
                "Rejecting {} with HTTP {} (not stored)",
                result.url,
                result.http_status
            );
            return Ok(None);
        }
        let Some(markdown) = result.markdown.as_deref().filter(|m| !m.trim().is_empty()) else {
            log::warn!("No markdown for {}, skipping", result.url);
            return Ok(None);
        };

        let classification = classifier.classify(&result.url, result.title.as_deref());
        let mut cleaned = strip_structural_junk(markdown);

        // A known fingerprint for this domain strips immediately; fresh
        // domains get theirs after the crawl's analysis pass.
        if let Some(record) = self
            .boilerplate_repo
            .get(project.id, &result.domain)
            .await?
        {
            cleaned = strip_boilerplate(
                &cleaned,
                &record.boilerplate_hashes,
                record.min_block_chars as usize,
            );
        }

        let mut meta_data = result.metadata.clone();
        if let Some(map) = meta_data.as_object_mut() {
            map.insert("domain".into(), json!(result.domain));
            map.insert("http_status".into(), json!(result.http_status));
        }

        let (source, created) = self
            .sources
            .upsert(&NewSource {
                project_id: project.id,
                uri: result.url.clone(),
                source_group: source_group.to_string(),
                source_type: "web".to_string(),
                title: result.title.clone(),
                content: Some(markdown.to_string()),
                cleaned_content: Some(cleaned),
                status: "completed".to_string(),
                created_by_job_id: Some(job_id),
                page_type: Some(classification.page_type.clone()),
                relevant_field_groups: Some(classification.relevant_groups.clone()),
                classification_method: Some(classification.method.as_str().to_string()),
                classification_confidence: Some(classification.confidence),
                meta_data,
            })
            .await?;

        if !created {
            log::debug!("Source for {} refreshed in place", result.url);
        }
        Ok(Some(source.id))
    }

    /// Re-fingerprint the crawl's domain and re-strip the stored pages.
    async fn refresh_domain_boilerplate(
        &self,
        project: &Project,
        domain: &str,
        stored: &[(Uuid, ScrapeResult)],
    ) {
        let pages: Vec<&str> = stored
            .iter()
            .filter_map(|(_, page)| page.markdown.as_deref())
            .collect();

        let Some(analysis) = analyze_domain(&pages, &self.boilerplate_config) else {
            log::debug!(
                "Skipping boilerplate analysis for {} ({} pages < {})",
                domain,
                pages.len(),
                self.boilerplate_config.min_pages
            );
            return;
        };

        let upserted = self
            .boilerplate_repo
            .upsert(
                project.id,
                domain,
                &analysis.boilerplate_hashes,
                analysis.pages_analyzed as i32,
                analysis.blocks_total as i32,
                analysis.blocks_boilerplate as i32,
                analysis.bytes_removed_avg as i32,
                self.boilerplate_config.threshold_pct,
                self.boilerplate_config.min_pages as i32,
                self.boilerplate_config.min_block_chars as i32,
            )
            .await;
        if let Err(err) = upserted {
            log::error!("Failed to store boilerplate fingerprint for {}: {}", domain, err);
            return;
        }

        for (source_id, page) in stored {
            let Some(markdown) = page.markdown.as_deref() else {
                continue;
            };
            let cleaned = strip_boilerplate(
                &strip_structural_junk(markdown),
                &analysis.boilerplate_hashes,
                self.boilerplate_config.min_block_chars,
            );
            if let Err(err) = self.sources.update_cleaned_content(*source_id, &cleaned).await {
                log::warn!("Failed to re-strip source {}: {}", source_id, err);
            }
        }
    }

    async fn maybe_enqueue_extract(
        &self,
        job: &Job,
        auto_extract: bool,
        source_ids: Vec<Uuid>,
    ) -> Result<()> {
        if !auto_extract || source_ids.is_empty() {
            return Ok(());
        }
        let payload = ExtractPayload {
            source_ids,
            profile: None,
        };
        let extract_job = self
            .jobs
            .create(
                job.project_id,
                JobType::Extract,
                job.priority,
                serde_json::to_value(&payload)
                    .map_err(|e| AppError::Other(anyhow::anyhow!(e)))?,
            )
            .await?;
        log::info!(
            "Auto-extract: enqueued job {} for {} sources",
            extract_job.id,
            payload.source_ids.len()
        );
        Ok(())
    }

    async fn finalize(&self, job: &Job, outcome: ScrapeOutcome) -> Result<()> {
        let result = serde_json::to_value(&outcome).map_err(|e| AppError::Other(anyhow::anyhow!(e)))?;

        if outcome.sources_scraped == 0 && outcome.sources_failed > 0 {
            let error = if outcome.rate_limited > 0 {
                format!(
                    "All {} URLs failed ({} rate limited)",
                    outcome.sources_failed, outcome.rate_limited
                )
            } else {
                format!("All {} URLs failed to scrape", outcome.sources_failed)
            };
            self.jobs.mark_failed(job.id, &error).await?;
            return Ok(());
        }

        self.jobs.mark_completed(job.id, result).await?;
        Ok(())
    }

    async fn require_project(&self, project_id: Uuid) -> Result<Project> {
        self.projects
            .get(project_id)
            .await?
            .ok_or_else(|| AppError::Other(anyhow::anyhow!("project {} not found", project_id)))
    }
}

/// Adapter running scrape jobs through the scheduler.
pub struct ScrapeJobHandler(pub Arc<ScrapeWorker>);

#[async_trait::async_trait]
impl crate::service::scheduler::JobHandler for ScrapeJobHandler {
    async fn handle(&self, job: Job) -> Result<()> {
        self.0.process_scrape_job(&job).await
    }
}

/// Adapter running crawl jobs through the scheduler.
pub struct CrawlJobHandler(pub Arc<ScrapeWorker>);

#[async_trait::async_trait]
impl crate::service::scheduler::JobHandler for CrawlJobHandler {
    async fn handle(&self, job: Job) -> Result<()> {
        self.0.process_crawl_job(&job).await
    }
}

fn build_classifier(project: &Project) -> PageClassifier {
    let config = project
        .classification_config
        .as_ref()
        .and_then(|value| serde_json::from_value::<ClassificationConfig>(value.clone()).ok())
        .unwrap_or_default();

    let group_names: Vec<String> = project
        .extraction_schema
        .get("field_groups")
        .and_then(serde_json::Value::as_array)
        .map(|groups| {
            groups
                .iter()
                .filter_map(|g| g.get("name").and_then(serde_json::Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    PageClassifier::new(&config, Some(&group_names))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifier_builds_from_project_config() {
        let project = Project {
            id: Uuid::new_v4(),
            name: "test".into(),
            description: None,
            extraction_schema: json!({
                "field_groups": [
                    {"name": "products_list", "fields": []},
                    {"name": "company_info", "fields": []}
                ]
            }),
            entity_types: json!([]),
            extraction_context: json!({}),
            classification_config: Some(json!({
                "url_patterns": [
                    {"pattern": "/products?($|/)", "groups": ["products_list"]}
                ]
            })),
            crawl_config: None,
            is_active: true,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };

        let classifier = build_classifier(&project);
        let result = classifier.classify("https://example.com/products/", None);
        assert_eq!(result.relevant_groups, vec!["products_list"]);
    }

    #[test]
    fn scrape_outcome_serializes_counters() {
        let outcome = ScrapeOutcome {
            sources_scraped: 2,
            sources_failed: 1,
            rate_limited: 1,
            total_urls: 3,
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["sources_scraped"], 2);
        assert_eq!(value["rate_limited"], 1);
    }
}
