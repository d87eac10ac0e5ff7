//! LLM worker: consumes the request stream, runs completions, delivers
//! responses, and adapts its own concurrency to observed timeout rates.

use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{AppError, Result};
use crate::service::llm::client::LlmClient;
use crate::service::llm::json_repair::try_repair_json;
use crate::service::llm::queue::{LlmRequest, LlmRequestQueue, LlmResponse, PendingRequest};

// ============================================================================
// DYNAMIC PERMIT LIMITER
// ============================================================================

/// Counting limiter whose capacity can change while permits are out.
///
/// Invariant: permits in flight never exceed the limit observed at acquire
/// time. Shrinking the limit never revokes running work; acquirers simply
/// wait until enough permits drain.
pub struct DynamicLimiter {
    limit: AtomicUsize,
    active: AtomicUsize,
    notify: Notify,
}

impl DynamicLimiter {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit: AtomicUsize::new(limit.max(1)),
            active: AtomicUsize::new(0),
            notify: Notify::new(),
        })
    }

    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_limit(&self, new_limit: usize) {
        self.limit.store(new_limit.max(1), Ordering::Release);
        // Raising the cap may unblock waiters.
        self.notify.notify_waiters();
    }

    pub async fn acquire(self: &Arc<Self>) -> LimiterPermit {
        loop {
            // Register for wake-ups before checking, so a release between
            // the check and the await still wakes us.
            let notified = self.notify.notified();
            if self.try_acquire() {
                return LimiterPermit {
                    limiter: Arc::clone(self),
                };
            }
            notified.await;
        }
    }

    fn try_acquire(&self) -> bool {
        let mut current = self.active.load(Ordering::Acquire);
        loop {
            if current >= self.limit.load(Ordering::Acquire) {
                return false;
            }
            match self.active.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    fn release(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
        self.notify.notify_waiters();
    }
}

/// RAII permit; dropping it releases the slot.
pub struct LimiterPermit {
    limiter: Arc<DynamicLimiter>,
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

// ============================================================================
// ADAPTIVE CONCURRENCY
// ============================================================================

#[derive(Debug, Clone)]
pub struct ConcurrencyConfig {
    pub initial: usize,
    pub min: usize,
    pub max: usize,
    /// Seconds between adjustments.
    pub adjustment_interval_secs: u64,
    /// Minimum outcome samples before adjusting.
    pub sample_threshold: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            initial: 4,
            min: 1,
            max: 16,
            adjustment_interval_secs: 15,
            sample_threshold: 10,
        }
    }
}

/// Tracks request outcomes and periodically retunes the permit limit.
///
/// Scale down 30% when more than 10% of a window's requests time out;
/// scale up 20% when under 2% time out and the window carries real volume.
pub struct ConcurrencyController {
    limiter: Arc<DynamicLimiter>,
    config: ConcurrencyConfig,
    success: AtomicUsize,
    timeout: AtomicUsize,
    error: AtomicUsize,
    last_adjustment: tokio::sync::Mutex<Instant>,
}

impl ConcurrencyController {
    pub fn new(config: ConcurrencyConfig) -> Self {
        let initial = config.initial.clamp(config.min, config.max);
        Self {
            limiter: DynamicLimiter::new(initial),
            config,
            success: AtomicUsize::new(0),
            timeout: AtomicUsize::new(0),
            error: AtomicUsize::new(0),
            last_adjustment: tokio::sync::Mutex::new(Instant::now()),
        }
    }

    pub fn limiter(&self) -> &Arc<DynamicLimiter> {
        &self.limiter
    }

    pub fn concurrency(&self) -> usize {
        self.limiter.limit()
    }

    pub fn record_success(&self) {
        self.success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeout.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.error.fetch_add(1, Ordering::Relaxed);
    }

    fn samples(&self) -> usize {
        self.success.load(Ordering::Relaxed)
            + self.timeout.load(Ordering::Relaxed)
            + self.error.load(Ordering::Relaxed)
    }

    fn reset_window(&self) {
        self.success.store(0, Ordering::Relaxed);
        self.timeout.store(0, Ordering::Relaxed);
        self.error.store(0, Ordering::Relaxed);
    }

    /// Re-evaluate the limit when the interval has elapsed and enough
    /// samples accumulated. Safe to call from the consume loop every pass.
    pub async fn maybe_adjust(&self) {
        let mut last = self.last_adjustment.lock().await;
        if last.elapsed() < Duration::from_secs(self.config.adjustment_interval_secs) {
            return;
        }

        let samples = self.samples();
        if samples < self.config.sample_threshold {
            return;
        }

        let success = self.success.load(Ordering::Relaxed);
        let timeout = self.timeout.load(Ordering::Relaxed);
        let timeout_rate = timeout as f64 / samples as f64;
        let current = self.limiter.limit();

        if timeout_rate > 0.10 {
            let lowered = ((current as f64 * 0.7).floor() as usize).max(self.config.min);
            if lowered != current {
                log::warn!(
                    "Timeout rate {:.0}% over {} samples, lowering concurrency {} -> {}",
                    timeout_rate * 100.0,
                    samples,
                    current,
                    lowered
                );
                self.limiter.set_limit(lowered);
            }
        } else if timeout_rate < 0.02 && success > 50 {
            let raised = ((current as f64 * 1.2).ceil() as usize).min(self.config.max);
            if raised != current {
                log::info!(
                    "Timeout rate {:.1}% over {} samples, raising concurrency {} -> {}",
                    timeout_rate * 100.0,
                    samples,
                    current,
                    raised
                );
                self.limiter.set_limit(raised);
            }
        }

        self.reset_window();
        *last = Instant::now();
    }

    #[cfg(test)]
    async fn force_adjustment_due(&self) {
        let mut last = self.last_adjustment.lock().await;
        *last = Instant::now() - Duration::from_secs(self.config.adjustment_interval_secs + 1);
    }
}

// ============================================================================
// WORKER
// ============================================================================

#[derive(Debug, Clone)]
pub struct LlmWorkerConfig {
    pub worker_id: String,
    pub concurrency: ConcurrencyConfig,
    pub max_retries: u32,
    pub base_temperature: f64,
    pub retry_temperature_increment: f64,
    pub retry_backoff_min: f64,
    pub retry_backoff_max: f64,
}

impl Default for LlmWorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("llm-worker-{}", uuid::Uuid::new_v4()),
            concurrency: ConcurrencyConfig::default(),
            max_retries: 3,
            base_temperature: 0.1,
            retry_temperature_increment: 0.1,
            retry_backoff_min: 4.0,
            retry_backoff_max: 60.0,
        }
    }
}

pub struct LlmWorker {
    queue: Arc<LlmRequestQueue>,
    llm: Arc<LlmClient>,
    config: LlmWorkerConfig,
    controller: ConcurrencyController,
}

impl LlmWorker {
    pub fn new(queue: Arc<LlmRequestQueue>, llm: Arc<LlmClient>, config: LlmWorkerConfig) -> Self {
        Self {
            controller: ConcurrencyController::new(config.concurrency.clone()),
            queue,
            llm,
            config,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.controller.concurrency()
    }

    /// Main consume loop. Runs until the task is aborted.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.queue.ensure_group().await?;
        log::info!(
            "LLM worker {} started (concurrency {})",
            self.config.worker_id,
            self.controller.concurrency()
        );

        loop {
            let batch = match self
                .queue
                .read_batch(&self.config.worker_id, 10, 2000)
                .await
            {
                Ok(batch) => batch,
                Err(err) => {
                    log::error!("Failed to read request stream: {}", err);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
            };

            for pending in batch {
                let worker = Arc::clone(&self);
                tokio::spawn(async move {
                    if let Err(err) = worker.process_entry(pending).await {
                        log::error!("Request processing failed: {}", err);
                    }
                });
            }

            self.controller.maybe_adjust().await;
        }
    }

    /// Handle one stream entry end-to-end: permit, execute, store, ack.
    async fn process_entry(&self, pending: PendingRequest) -> Result<()> {
        let request = pending.request;

        // A request past its deadline is answered without touching the
        // backend; the producer has already given up.
        if request.is_expired() {
            log::warn!("Request {} expired before execution", request.request_id);
            let response = LlmResponse::timeout(&request.request_id, 0);
            self.queue.store_response(&response).await?;
            self.queue.ack(&pending.entry_id).await?;
            self.controller.record_timeout();
            return Ok(());
        }

        let _permit = self.controller.limiter().acquire().await;
        let started = Instant::now();

        let budget = (request.timeout_at - chrono::Utc::now())
            .to_std()
            .unwrap_or(Duration::from_secs(1));

        let outcome = tokio::time::timeout(budget, self.execute_with_retries(&request)).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let response = match outcome {
            Ok(Ok(result)) => {
                self.controller.record_success();
                LlmResponse::success(&request.request_id, result, elapsed_ms)
            }
            Ok(Err(err)) => {
                self.controller.record_error();
                log::error!("Request {} failed: {}", request.request_id, err);
                LlmResponse::error(&request.request_id, &err.to_string(), elapsed_ms)
            }
            Err(_) => {
                self.controller.record_timeout();
                log::warn!(
                    "Request {} timed out after {}ms",
                    request.request_id,
                    elapsed_ms
                );
                LlmResponse::timeout(&request.request_id, elapsed_ms)
            }
        };

        self.queue.store_response(&response).await?;
        self.queue.ack(&pending.entry_id).await?;
        Ok(())
    }

    /// Call the backend, bumping temperature on each retry and attempting
    /// JSON repair before an attempt counts as failed.
    async fn execute_with_retries(&self, request: &LlmRequest) -> Result<Value> {
        let system_prompt = request.payload["system_prompt"].as_str().unwrap_or_default();
        let user_prompt = request.payload["user_prompt"].as_str().unwrap_or_default();

        let mut last_error = AppError::llm("no attempts made");

        for attempt in 0..=self.config.max_retries {
            let temperature = self.config.base_temperature
                + attempt as f64 * self.config.retry_temperature_increment;

            match self.llm.chat_json(system_prompt, user_prompt, temperature).await {
                Ok(raw) => match try_repair_json(&raw, &request.request_type) {
                    Ok(value) => return Ok(value),
                    Err(err) => last_error = err,
                },
                Err(err) if err.is_retryable() => last_error = err,
                Err(err) => return Err(err),
            }

            if attempt < self.config.max_retries {
                let delay = (self.config.retry_backoff_min * 2f64.powi(attempt as i32))
                    .min(self.config.retry_backoff_max);
                log::warn!(
                    "Request {} attempt {} failed, retrying in {:.1}s: {}",
                    request.request_id,
                    attempt + 1,
                    delay,
                    last_error
                );
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            }
        }

        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(initial: usize, min: usize, max: usize) -> ConcurrencyController {
        ConcurrencyController::new(ConcurrencyConfig {
            initial,
            min,
            max,
            ..ConcurrencyConfig::default()
        })
    }

    fn seed(controller: &ConcurrencyController, success: usize, timeout: usize) {
        controller.success.store(success, Ordering::Relaxed);
        controller.timeout.store(timeout, Ordering::Relaxed);
    }

    #[tokio::test]
    async fn permits_never_exceed_limit() {
        let limiter = DynamicLimiter::new(3);
        let max_observed = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let limiter = Arc::clone(&limiter);
            let max_observed = Arc::clone(&max_observed);
            handles.push(tokio::spawn(async move {
                let _permit = limiter.acquire().await;
                let active = limiter.active();
                max_observed.fetch_max(active, Ordering::SeqCst);
                assert!(active <= limiter.limit());
                tokio::time::sleep(Duration::from_millis(10)).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(max_observed.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn shrinking_limit_defers_until_permits_drain() {
        let limiter = DynamicLimiter::new(2);
        let p1 = limiter.acquire().await;
        let p2 = limiter.acquire().await;

        limiter.set_limit(1);
        assert_eq!(limiter.active(), 2, "in-flight permits are not revoked");

        // No new permit until the count drops below the new limit.
        let acquire = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move {
                let _p = limiter.acquire().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!acquire.is_finished());

        drop(p1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!acquire.is_finished(), "still at the new limit of 1");

        drop(p2);
        acquire.await.unwrap();
    }

    #[tokio::test]
    async fn raising_limit_wakes_waiters() {
        let limiter = DynamicLimiter::new(1);
        let _held = limiter.acquire().await;

        let acquire = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move {
                let _p = limiter.acquire().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!acquire.is_finished());

        limiter.set_limit(2);
        acquire.await.unwrap();
    }

    #[tokio::test]
    async fn scales_down_on_high_timeout_rate() {
        let controller = controller(20, 5, 50);
        seed(&controller, 80, 20); // 20% timeouts
        controller.force_adjustment_due().await;

        controller.maybe_adjust().await;

        assert_eq!(controller.concurrency(), 14); // floor(20 * 0.7)
    }

    #[tokio::test]
    async fn scale_down_respects_minimum() {
        let controller = controller(6, 5, 50);
        seed(&controller, 50, 50);
        controller.force_adjustment_due().await;

        controller.maybe_adjust().await;

        assert_eq!(controller.concurrency(), 5);
    }

    #[tokio::test]
    async fn scales_up_on_low_timeout_rate() {
        let controller = controller(10, 5, 50);
        seed(&controller, 100, 1); // ~1% timeouts, >50 successes
        controller.force_adjustment_due().await;

        controller.maybe_adjust().await;

        assert_eq!(controller.concurrency(), 12); // ceil(10 * 1.2)
    }

    #[tokio::test]
    async fn scale_up_respects_maximum() {
        let controller = controller(50, 5, 50);
        seed(&controller, 100, 0);
        controller.force_adjustment_due().await;

        controller.maybe_adjust().await;

        assert_eq!(controller.concurrency(), 50);
    }

    #[tokio::test]
    async fn no_scale_up_without_volume() {
        let controller = controller(10, 5, 50);
        seed(&controller, 30, 0); // clean but thin
        controller.force_adjustment_due().await;

        controller.maybe_adjust().await;

        assert_eq!(controller.concurrency(), 10);
    }

    #[tokio::test]
    async fn no_adjustment_below_sample_threshold() {
        let controller = controller(10, 5, 50);
        seed(&controller, 5, 3);
        controller.force_adjustment_due().await;

        controller.maybe_adjust().await;

        assert_eq!(controller.concurrency(), 10);
    }

    #[tokio::test]
    async fn no_adjustment_before_interval() {
        let controller = controller(10, 5, 50);
        seed(&controller, 80, 20);
        // last_adjustment is fresh; nothing should change.

        controller.maybe_adjust().await;

        assert_eq!(controller.concurrency(), 10);
    }

    #[tokio::test]
    async fn window_resets_after_evaluation() {
        let controller = controller(20, 5, 50);
        seed(&controller, 80, 20);
        controller.force_adjustment_due().await;
        controller.maybe_adjust().await;

        assert_eq!(controller.samples(), 0);
    }
}
