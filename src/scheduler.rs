//! # Pipeline Scheduler
//!
//! Background task that drives every poll-based stage of the pipeline on a
//! fixed interval: lease sweep, job batch, webhook retries and dead-letter
//! replay. Multiple instances may run against the same database; all
//! coordination happens through conditional updates on the rows themselves.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use metrics::{counter, gauge, histogram};
use sea_orm::DatabaseConnection;
use tokio::time::{Duration as TokioDuration, Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::backoff::ExponentialBackoff;
use crate::config::AppConfig;
use crate::dedupe_cache::OperationCache;
use crate::handler::HandlerRegistry;
use crate::ledger::IdempotencyLedger;
use crate::repositories::dead_letter::DeadLetterStore;
use crate::repositories::job_queue::JobQueue;
use crate::webhook_processor::{RetrySummary, WebhookProcessor};
use crate::worker::{DeadLetterReplayer, JobBatchStats, JobWorker, ReplayStats};

/// Counters from one scheduler tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickStats {
    pub jobs_reclaimed: u64,
    pub webhooks_reclaimed: u64,
    pub jobs: JobBatchStats,
    pub webhooks: RetrySummary,
    pub dead_letters: ReplayStats,
    /// Stages that returned an error; later stages still ran
    pub stage_errors: u64,
}

/// Background scheduler service.
#[derive(Clone)]
pub struct PipelineScheduler {
    config: Arc<AppConfig>,
    jobs: JobQueue,
    webhooks: WebhookProcessor,
    worker: JobWorker,
    replayer: DeadLetterReplayer,
}

impl PipelineScheduler {
    /// Wire every stage from configuration and the per-type handler registries.
    pub fn new(
        config: Arc<AppConfig>,
        db: Arc<DatabaseConnection>,
        job_handlers: HandlerRegistry,
        webhook_handlers: HandlerRegistry,
    ) -> Self {
        let worker_cfg = &config.worker;
        let backoff = ExponentialBackoff::from(&config.backoff);

        let mut ledger = IdempotencyLedger::new(db.clone());
        if let Some(cache) = OperationCache::from_config(&config.dedupe_cache) {
            ledger = ledger.with_cache(Arc::new(cache));
        }

        let jobs = JobQueue::new(db.clone(), backoff.clone());
        let dead_letters = DeadLetterStore::new(db.clone(), backoff.clone());
        let webhooks = WebhookProcessor::new(db, webhook_handlers, backoff)
            .with_handler_timeout(worker_cfg.handler_timeout_seconds)
            .with_max_attempts(worker_cfg.webhook_max_attempts);
        let worker = JobWorker::new(jobs.clone(), job_handlers.clone(), ledger.clone())
            .with_limits(worker_cfg.claim_batch, worker_cfg.concurrency)
            .with_handler_timeout(worker_cfg.handler_timeout_seconds);
        let replayer = DeadLetterReplayer::new(
            dead_letters,
            jobs.clone(),
            job_handlers,
            webhooks.clone(),
            ledger,
        )
        .with_batch(worker_cfg.dlq_batch)
        .with_handler_timeout(worker_cfg.handler_timeout_seconds)
        .with_lease(worker_cfg.lease_timeout_seconds);

        Self {
            config,
            jobs,
            webhooks,
            worker,
            replayer,
        }
    }

    pub fn jobs(&self) -> &JobQueue {
        &self.jobs
    }

    pub fn webhooks(&self) -> &WebhookProcessor {
        &self.webhooks
    }

    /// Run the scheduler loop until the provided shutdown token fires.
    ///
    /// Cancellation is observed between ticks; an in-flight tick always
    /// finishes.
    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            tick_interval_ms = self.config.worker.tick_interval_ms,
            "Starting pipeline scheduler"
        );
        let tick_interval = TokioDuration::from_millis(self.config.worker.tick_interval_ms);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Pipeline scheduler shutdown requested");
                    break;
                }
                _ = sleep(tick_interval) => {
                    self.tick().await;
                }
            }
        }

        info!("Pipeline scheduler stopped");
    }

    /// Run every stage once.
    pub async fn tick(&self) -> TickStats {
        let tick_started = Instant::now();
        let mut stats = TickStats::default();
        let lease = StdDuration::from_secs(self.config.worker.lease_timeout_seconds);

        match self.jobs.reclaim_stale(lease).await {
            Ok(count) => stats.jobs_reclaimed = count,
            Err(err) => {
                stats.stage_errors += 1;
                error!(error = %err, "Job lease sweep failed");
            }
        }
        match self.webhooks.reclaim_stale(lease).await {
            Ok(count) => stats.webhooks_reclaimed = count,
            Err(err) => {
                stats.stage_errors += 1;
                error!(error = %err, "Webhook lease sweep failed");
            }
        }
        match self.worker.run_batch().await {
            Ok(batch) => stats.jobs = batch,
            Err(err) => {
                stats.stage_errors += 1;
                error!(error = %err, "Job batch failed");
            }
        }
        match self
            .webhooks
            .retry_failed(self.config.worker.webhook_retry_batch)
            .await
        {
            Ok(summary) => stats.webhooks = summary,
            Err(err) => {
                stats.stage_errors += 1;
                error!(error = %err, "Webhook retry pass failed");
            }
        }
        match self.replayer.run_batch().await {
            Ok(replay) => stats.dead_letters = replay,
            Err(err) => {
                stats.stage_errors += 1;
                error!(error = %err, "Dead-letter replay pass failed");
            }
        }

        if stats.stage_errors > 0 {
            counter!("pipeline_tick_stage_errors_total").increment(stats.stage_errors);
        }
        gauge!("pipeline_jobs_claimed_last_tick").set(stats.jobs.claimed as f64);
        histogram!("pipeline_tick_duration_ms")
            .record(tick_started.elapsed().as_secs_f64() * 1_000.0);

        debug!(
            jobs_reclaimed = stats.jobs_reclaimed,
            webhooks_reclaimed = stats.webhooks_reclaimed,
            jobs_claimed = stats.jobs.claimed,
            webhooks_retried = stats.webhooks.scanned,
            dead_letters_scanned = stats.dead_letters.scanned,
            stage_errors = stats.stage_errors,
            "Scheduler tick completed"
        );

        stats
    }
}
