//! Pipeline process entrypoint: wires backends, repositories and workers,
//! then runs the per-type job loops until interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use quarry::config::Settings;
use quarry::db::init_db;
use quarry::domain::JobType;
use quarry::redis_client::init_redis;
use quarry::repository::{
    DomainBoilerplateRepository, EntityRepository, ExtractionRepository, JobRepository,
    ProjectRepository, SourceRepository,
};
use quarry::service::extraction::boilerplate::BoilerplateConfig;
use quarry::service::extraction::orchestrator::{ExtractionOrchestrator, OrchestratorConfig};
use quarry::service::extraction::pipeline::{ExtractionPipeline, PipelineConfig};
use quarry::service::extraction::schema_extractor::{SchemaExtractor, SchemaExtractorConfig};
use quarry::service::llm::queue::LlmRequestQueue;
use quarry::service::llm::worker::{ConcurrencyConfig, LlmWorker, LlmWorkerConfig};
use quarry::service::llm::{LlmClient, LlmClientConfig};
use quarry::service::{
    AlertConfig, AlertService, CrawlJobHandler, DlqService, DomainRateLimiter, EmbeddingClient,
    EmbeddingConfig, ExtractWorker, FirecrawlClient, QdrantClient, RateLimitConfig, RetryConfig,
    ScrapeJobHandler, ScrapeWorker, Scheduler, StaleThresholds, EMBEDDING_DIM,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = Settings::from_env().context("failed to load settings")?;
    log::info!("Starting pipeline (model {})", settings.llm_model);

    let pool = init_db(&settings.database_url).await?;
    let redis = init_redis(&settings.redis_url).await?;

    // External backends
    let fetcher = Arc::new(FirecrawlClient::new(
        &settings.firecrawl_url,
        settings.scrape_timeout,
    ));
    let llm = Arc::new(LlmClient::new(LlmClientConfig {
        base_url: settings.openai_base_url.clone(),
        api_key: settings.openai_api_key.clone(),
        model: settings.llm_model.clone(),
        http_timeout_secs: settings.llm_http_timeout,
        max_tokens: settings.llm_max_tokens,
    }));
    let embeddings = Arc::new(EmbeddingClient::new(EmbeddingConfig {
        base_url: settings.openai_base_url.clone(),
        api_key: settings.openai_api_key.clone(),
        model: "embed-v3".to_string(),
        rerank_model: "rerank-v3".to_string(),
        timeout_secs: settings.llm_http_timeout,
    }));
    let qdrant = Arc::new(QdrantClient::new(&settings.qdrant_url));
    qdrant.init_collection(EMBEDDING_DIM).await?;

    // Shared infrastructure
    let alerts = Arc::new(AlertService::new(AlertConfig {
        webhook_url: settings.alert_webhook_url.clone(),
        webhook_format: settings.alert_webhook_format.clone(),
        enabled: settings.alerting_enabled,
        ..AlertConfig::default()
    }));
    let rate_limiter = Arc::new(DomainRateLimiter::new(
        redis.manager.clone(),
        RateLimitConfig {
            delay_min: settings.scrape_delay_min,
            delay_max: settings.scrape_delay_max,
            daily_limit: settings.scrape_daily_limit_per_domain,
        },
    ));
    let dlq = DlqService::new(redis.manager.clone());
    let llm_queue = Arc::new(LlmRequestQueue::new(redis.clone(), 300));

    let boilerplate_config = BoilerplateConfig {
        threshold_pct: settings.boilerplate_threshold_pct,
        min_pages: settings.boilerplate_min_pages,
        min_block_chars: settings.boilerplate_min_block_chars,
    };

    // Extraction plane
    let extractor = Arc::new(SchemaExtractor::new(
        Arc::clone(&llm),
        settings.llm_queue_enabled.then(|| Arc::clone(&llm_queue)),
        SchemaExtractorConfig {
            base_temperature: settings.llm_base_temperature,
            quoting_enabled: settings.extraction_source_quoting_enabled,
            request_timeout_secs: 300,
        },
    ));
    let orchestrator = Arc::new(ExtractionOrchestrator::new(
        Arc::clone(&extractor),
        OrchestratorConfig {
            conflict_detection_enabled: settings.extraction_conflict_detection_enabled,
            ..OrchestratorConfig::default()
        },
    ));
    let pipeline = Arc::new(ExtractionPipeline::new(
        SourceRepository::new(pool.clone()),
        ExtractionRepository::new(pool.clone()),
        EntityRepository::new(pool.clone()),
        orchestrator,
        Arc::clone(&embeddings),
        Arc::clone(&qdrant),
        Arc::clone(&alerts),
        dlq.clone(),
        PipelineConfig::default(),
    ));

    // Workers
    let scrape_worker = Arc::new(ScrapeWorker::new(
        JobRepository::new(pool.clone()),
        SourceRepository::new(pool.clone()),
        ProjectRepository::new(pool.clone()),
        DomainBoilerplateRepository::new(pool.clone()),
        fetcher,
        rate_limiter,
        Arc::clone(&alerts),
        RetryConfig {
            max_retries: settings.scrape_retry_max_attempts,
            base_delay: settings.scrape_retry_base_delay,
            max_delay: settings.scrape_retry_max_delay,
            ..RetryConfig::default()
        },
        boilerplate_config,
    ));
    let extract_worker = Arc::new(ExtractWorker::new(
        JobRepository::new(pool.clone()),
        ProjectRepository::new(pool.clone()),
        pipeline,
        Arc::clone(&alerts),
    ));

    let thresholds = StaleThresholds {
        scrape_secs: settings.job_stale_threshold_scrape,
        extract_secs: settings.job_stale_threshold_extract,
        crawl_secs: settings.job_stale_threshold_crawl,
    };

    let mut tasks = Vec::new();

    let scheduler = Arc::new(Scheduler::new(JobRepository::new(pool.clone()), thresholds));
    {
        let scheduler = Arc::clone(&scheduler);
        let handler = Arc::new(ScrapeJobHandler(Arc::clone(&scrape_worker)));
        tasks.push(tokio::spawn(async move {
            scheduler.run_loop(JobType::Scrape, handler).await;
        }));
    }
    for _ in 0..settings.max_concurrent_crawls.max(1) {
        let scheduler = Arc::clone(&scheduler);
        let handler = Arc::new(CrawlJobHandler(Arc::clone(&scrape_worker)));
        tasks.push(tokio::spawn(async move {
            scheduler.run_loop(JobType::Crawl, handler).await;
        }));
    }
    {
        let scheduler = Arc::clone(&scheduler);
        let handler: Arc<dyn quarry::service::JobHandler> = extract_worker;
        tasks.push(tokio::spawn(async move {
            scheduler.run_loop(JobType::Extract, handler).await;
        }));
    }

    if settings.llm_queue_enabled {
        let worker = Arc::new(LlmWorker::new(
            llm_queue,
            llm,
            LlmWorkerConfig {
                concurrency: ConcurrencyConfig::default(),
                max_retries: settings.llm_max_retries,
                base_temperature: settings.llm_base_temperature,
                retry_temperature_increment: settings.llm_retry_temperature_increment,
                retry_backoff_min: settings.llm_retry_backoff_min,
                retry_backoff_max: settings.llm_retry_backoff_max,
                ..LlmWorkerConfig::default()
            },
        ));
        tasks.push(tokio::spawn(async move {
            if let Err(err) = worker.run().await {
                log::error!("LLM worker exited: {}", err);
            }
        }));
    }

    log::info!("All worker loops running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("signal handler failed")?;
    log::info!("Shutting down");

    for task in tasks {
        task.abort();
    }
    Ok(())
}
