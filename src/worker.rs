//! # Workers
//!
//! [`JobWorker`] drains the job queue with bounded parallelism and
//! [`DeadLetterReplayer`] re-drives dead-letter entries once their origin row
//! has left its own retry cycle. Both claim their rows before executing, so
//! any number of workers can share the tables.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, FixedOffset, Utc};
use metrics::{counter, histogram};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};

use crate::error::PipelineError;
use crate::handler::{
    HandlerContext, HandlerError, HandlerRegistry, OperationHandler, Origin, execute_with_timeout,
};
use crate::ledger::IdempotencyLedger;
use crate::models::dead_letter;
use crate::models::job_queue::{self, JobStatus};
use crate::models::webhook_event::{self, WebhookStatus};
use crate::repositories::dead_letter::{DeadLetterStore, MarkOutcome};
use crate::repositories::job_queue::{self as job_repo, FailOutcome, JobQueue};
use crate::webhook_processor::{self, WebhookProcessor};

/// Default replay lease; matches the default `worker.lease_timeout_seconds`.
pub const DEFAULT_REPLAY_LEASE_SECONDS: u64 = 900;
const MAX_REPLAY_LEASE_SECONDS: u64 = 7 * 24 * 60 * 60;

/// Per-batch counters for [`JobWorker::run_batch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobBatchStats {
    pub claimed: u64,
    pub completed: u64,
    pub already_applied: u64,
    pub retrying: u64,
    pub dead_lettered: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobResult {
    Completed,
    AlreadyApplied,
    Retrying,
    DeadLettered,
}

#[derive(Clone)]
pub struct JobWorker {
    queue: JobQueue,
    handlers: HandlerRegistry,
    ledger: IdempotencyLedger,
    claim_batch: u64,
    concurrency: usize,
    handler_timeout_seconds: u64,
}

impl JobWorker {
    pub fn new(queue: JobQueue, handlers: HandlerRegistry, ledger: IdempotencyLedger) -> Self {
        Self {
            queue,
            handlers,
            ledger,
            claim_batch: 50,
            concurrency: 10,
            handler_timeout_seconds: webhook_processor::DEFAULT_HANDLER_TIMEOUT_SECONDS,
        }
    }

    pub fn with_limits(mut self, claim_batch: u64, concurrency: usize) -> Self {
        self.claim_batch = claim_batch.max(1);
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_handler_timeout(mut self, seconds: u64) -> Self {
        self.handler_timeout_seconds = seconds.max(1);
        self
    }

    /// Claim one batch and run it to completion.
    #[instrument(skip(self), fields(batch_size = self.claim_batch, concurrency = self.concurrency))]
    pub async fn run_batch(&self) -> Result<JobBatchStats, PipelineError> {
        let jobs = self.queue.claim_batch(self.claim_batch).await?;
        let mut stats = JobBatchStats {
            claimed: jobs.len() as u64,
            ..JobBatchStats::default()
        };
        if jobs.is_empty() {
            debug!("No runnable jobs");
            return Ok(stats);
        }

        let timer = Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::with_capacity(jobs.len());

        for job in jobs {
            let worker = self.clone();
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let job_id = job.id;
                let result = worker.run_single_job(job).await;
                if let Err(err) = &result {
                    error!(job_id = %job_id, error = %err, "Error running job");
                }
                result
            }));
        }

        for handle in handles {
            match handle.await {
                Ok(Ok(JobResult::Completed)) => stats.completed += 1,
                Ok(Ok(JobResult::AlreadyApplied)) => stats.already_applied += 1,
                Ok(Ok(JobResult::Retrying)) => stats.retrying += 1,
                Ok(Ok(JobResult::DeadLettered)) => stats.dead_lettered += 1,
                Ok(Err(_)) => stats.errors += 1,
                Err(join_err) => {
                    stats.errors += 1;
                    error!(error = %join_err, "Job task panicked");
                }
            }
        }

        info!(
            claimed = stats.claimed,
            completed = stats.completed,
            already_applied = stats.already_applied,
            retrying = stats.retrying,
            dead_lettered = stats.dead_lettered,
            errors = stats.errors,
            elapsed_ms = timer.elapsed().as_millis() as u64,
            "Job batch finished"
        );
        Ok(stats)
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, job_type = %job.job_type, attempt = job.attempts + 1))]
    async fn run_single_job(&self, job: job_queue::Model) -> Result<JobResult, PipelineError> {
        if let Some(operation_id) = job.operation_id {
            if self
                .ledger
                .already_applied_uuid(job.tenant_id, operation_id)
                .await?
            {
                info!(operation_id = %operation_id, "Operation already applied; completing without executing");
                self.queue.complete(job.id).await?;
                return Ok(JobResult::AlreadyApplied);
            }
        }

        let handler = match self.handlers.get(&job.job_type) {
            Ok(handler) => handler,
            Err(err) => {
                self.queue
                    .fail_permanently(job.id, &err.to_string(), "UNKNOWN_JOB_TYPE")
                    .await?;
                return Ok(JobResult::DeadLettered);
            }
        };

        let ctx = HandlerContext {
            tenant_id: job.tenant_id,
            operation_id: job.operation_id,
            source_id: job.id,
            attempt: job.attempts + 1,
            origin: Origin::Job,
        };
        let started = Instant::now();
        let outcome = execute_with_timeout(
            handler.as_ref(),
            &ctx,
            &job.payload,
            self.handler_timeout_seconds,
        )
        .await;
        histogram!("pipeline_jobs_duration_ms", "job_type" => job.job_type.clone())
            .record(started.elapsed().as_secs_f64() * 1_000.0);

        match outcome {
            Ok(()) => {
                self.queue.complete(job.id).await?;
                Ok(JobResult::Completed)
            }
            Err(HandlerError::Permanent(message)) => {
                self.queue
                    .fail_permanently(job.id, &message, "JOB_PERMANENT_ERROR")
                    .await?;
                Ok(JobResult::DeadLettered)
            }
            Err(err) => match self.queue.fail(job.id, &err.to_string()).await? {
                FailOutcome::Retrying { .. } => Ok(JobResult::Retrying),
                FailOutcome::DeadLettered { dead_letter_id } => {
                    warn!(dead_letter_id = %dead_letter_id, "Job retries exhausted");
                    Ok(JobResult::DeadLettered)
                }
            },
        }
    }
}

/// Per-batch counters for [`DeadLetterReplayer::run_batch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub scanned: u64,
    /// Handler succeeded; entry removed
    pub replayed: u64,
    /// Origin already applied; entry removed without executing
    pub settled: u64,
    /// Origin still inside its own retry cycle
    pub deferred: u64,
    pub rescheduled: u64,
    pub exhausted: u64,
    /// Claimed by another replayer first
    pub skipped: u64,
    pub errors: u64,
}

enum ReplayResult {
    Skipped,
    Replayed,
    Settled,
    Deferred,
    Rescheduled,
    Exhausted,
}

enum OriginRow {
    Job(job_queue::Model),
    Webhook(webhook_event::Model),
}

#[derive(Clone)]
pub struct DeadLetterReplayer {
    store: DeadLetterStore,
    jobs: JobQueue,
    job_handlers: HandlerRegistry,
    webhooks: WebhookProcessor,
    ledger: IdempotencyLedger,
    batch: u64,
    handler_timeout_seconds: u64,
    lease_seconds: u64,
}

impl DeadLetterReplayer {
    pub fn new(
        store: DeadLetterStore,
        jobs: JobQueue,
        job_handlers: HandlerRegistry,
        webhooks: WebhookProcessor,
        ledger: IdempotencyLedger,
    ) -> Self {
        Self {
            store,
            jobs,
            job_handlers,
            webhooks,
            ledger,
            batch: 50,
            handler_timeout_seconds: webhook_processor::DEFAULT_HANDLER_TIMEOUT_SECONDS,
            lease_seconds: DEFAULT_REPLAY_LEASE_SECONDS,
        }
    }

    pub fn with_batch(mut self, batch: u64) -> Self {
        self.batch = batch.max(1);
        self
    }

    pub fn with_handler_timeout(mut self, seconds: u64) -> Self {
        self.handler_timeout_seconds = seconds.max(1);
        self
    }

    /// How long a claimed entry stays hidden from other replayers (at most a week).
    pub fn with_lease(mut self, seconds: u64) -> Self {
        self.lease_seconds = seconds.clamp(1, MAX_REPLAY_LEASE_SECONDS);
        self
    }

    #[instrument(skip(self), fields(batch_size = self.batch))]
    pub async fn run_batch(&self) -> Result<ReplayStats, PipelineError> {
        let entries = self.store.pending_retry(self.batch).await?;
        let mut stats = ReplayStats {
            scanned: entries.len() as u64,
            ..ReplayStats::default()
        };

        for entry in entries {
            let id = entry.id;
            match self.replay_one(entry).await {
                Ok(ReplayResult::Skipped) => stats.skipped += 1,
                Ok(ReplayResult::Replayed) => stats.replayed += 1,
                Ok(ReplayResult::Settled) => stats.settled += 1,
                Ok(ReplayResult::Deferred) => stats.deferred += 1,
                Ok(ReplayResult::Rescheduled) => stats.rescheduled += 1,
                Ok(ReplayResult::Exhausted) => stats.exhausted += 1,
                Err(err) => {
                    stats.errors += 1;
                    error!(dead_letter_id = %id, error = %err, "Dead-letter replay failed unexpectedly");
                }
            }
        }

        if stats.scanned > 0 {
            info!(
                scanned = stats.scanned,
                replayed = stats.replayed,
                settled = stats.settled,
                deferred = stats.deferred,
                rescheduled = stats.rescheduled,
                exhausted = stats.exhausted,
                skipped = stats.skipped,
                errors = stats.errors,
                "Dead-letter replay pass finished"
            );
        }
        Ok(stats)
    }

    #[instrument(skip(self, entry), fields(dead_letter_id = %entry.id, event_type = %entry.event_type))]
    async fn replay_one(&self, entry: dead_letter::Model) -> Result<ReplayResult, PipelineError> {
        let lease = Duration::seconds(self.lease_seconds as i64);
        if !self.store.claim(&entry, lease).await? {
            return Ok(ReplayResult::Skipped);
        }

        let origin = self.load_origin(&entry).await?;
        let now = Utc::now().fixed_offset();

        match &origin {
            Some(OriginRow::Job(job)) => match job.job_status() {
                Some(JobStatus::Completed) => return self.settle(&entry).await,
                Some(JobStatus::Pending | JobStatus::Processing | JobStatus::Failed) => {
                    return self.defer(&entry, job.retry_after, now).await;
                }
                _ => {}
            },
            Some(OriginRow::Webhook(event)) => match event.event_status() {
                Some(WebhookStatus::Processed) => return self.settle(&entry).await,
                Some(WebhookStatus::Processing | WebhookStatus::Failed) => {
                    return self.defer(&entry, event.retry_after, now).await;
                }
                _ => {}
            },
            None => {}
        }

        if let Some(operation_id) = entry.operation_id {
            if self
                .ledger
                .already_applied_uuid(entry.tenant_id, operation_id)
                .await?
            {
                return self.settle(&entry).await;
            }
        }

        let handler = match self.resolve_handler(&entry, origin.as_ref()) {
            Ok(handler) => handler,
            Err(err) => {
                self.store
                    .exhaust(entry.id, &err.to_string(), Some(err.code()))
                    .await?;
                return Ok(ReplayResult::Exhausted);
            }
        };

        let ctx = HandlerContext {
            tenant_id: entry.tenant_id,
            operation_id: entry.operation_id,
            source_id: entry.id,
            attempt: entry.retry_count + 1,
            origin: Origin::DeadLetterReplay,
        };
        let outcome = execute_with_timeout(
            handler.as_ref(),
            &ctx,
            &entry.payload,
            self.handler_timeout_seconds,
        )
        .await;

        match outcome {
            Ok(()) => {
                match &origin {
                    Some(OriginRow::Job(job)) => self.jobs.complete(job.id).await?,
                    Some(OriginRow::Webhook(event)) => self.webhooks.mark_processed(event.id).await?,
                    None => {}
                }
                self.store.mark_attempt(entry.id, true, None, None).await?;
                info!("Dead-letter entry replayed successfully");
                Ok(ReplayResult::Replayed)
            }
            Err(HandlerError::Permanent(message)) => {
                self.store.exhaust(entry.id, &message, None).await?;
                Ok(ReplayResult::Exhausted)
            }
            Err(err) => self.record_failure(&entry, &err.to_string()).await,
        }
    }

    async fn load_origin(
        &self,
        entry: &dead_letter::Model,
    ) -> Result<Option<OriginRow>, PipelineError> {
        let Some(original_id) = entry.original_id else {
            return Ok(None);
        };
        match entry.original_table.as_deref() {
            Some(job_repo::ORIGIN_TABLE) => Ok(self
                .jobs
                .find(entry.tenant_id, original_id)
                .await?
                .map(OriginRow::Job)),
            Some(webhook_processor::ORIGIN_TABLE) => Ok(self
                .webhooks
                .find(entry.tenant_id, original_id)
                .await?
                .map(OriginRow::Webhook)),
            _ => Ok(None),
        }
    }

    /// Handler from the origin row's type, falling back to the entry's event type.
    fn resolve_handler(
        &self,
        entry: &dead_letter::Model,
        origin: Option<&OriginRow>,
    ) -> Result<Arc<dyn OperationHandler>, PipelineError> {
        match origin {
            Some(OriginRow::Job(job)) => return self.job_handlers.get(&job.job_type),
            Some(OriginRow::Webhook(event)) => {
                return self.webhooks.handlers().get(&event.event_type);
            }
            None => {}
        }

        let event_type = entry.event_type.as_str();
        if let Some(job_type) = event_type
            .strip_prefix("job_")
            .and_then(|rest| rest.strip_suffix("_failed"))
        {
            return self.job_handlers.get(job_type);
        }
        if let Some(kind) = event_type.strip_prefix("webhook_") {
            return self.webhooks.handlers().get(kind);
        }
        self.job_handlers
            .get(event_type)
            .or_else(|_| self.webhooks.handlers().get(event_type))
    }

    async fn settle(&self, entry: &dead_letter::Model) -> Result<ReplayResult, PipelineError> {
        self.store.mark_attempt(entry.id, true, None, None).await?;
        counter!("pipeline_dlq_settled_total").increment(1);
        info!(dead_letter_id = %entry.id, "Origin already applied; dead-letter entry removed");
        Ok(ReplayResult::Settled)
    }

    async fn defer(
        &self,
        entry: &dead_letter::Model,
        origin_retry_after: Option<DateTime<FixedOffset>>,
        now: DateTime<FixedOffset>,
    ) -> Result<ReplayResult, PipelineError> {
        let until = origin_retry_after
            .filter(|retry_after| *retry_after > now)
            .unwrap_or_else(|| now + Duration::minutes(self.store.backoff().delay_minutes(1)));
        self.store.defer(entry.id, until).await?;
        debug!(dead_letter_id = %entry.id, until = %until, "Origin still retrying; replay deferred");
        Ok(ReplayResult::Deferred)
    }

    async fn record_failure(
        &self,
        entry: &dead_letter::Model,
        message: &str,
    ) -> Result<ReplayResult, PipelineError> {
        match self
            .store
            .mark_attempt(entry.id, false, Some(message), None)
            .await?
        {
            MarkOutcome::Exhausted { .. } => Ok(ReplayResult::Exhausted),
            MarkOutcome::Removed | MarkOutcome::Rescheduled { .. } | MarkOutcome::NotFound => {
                Ok(ReplayResult::Rescheduled)
            }
        }
    }
}
