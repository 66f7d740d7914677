//! # Job Queue Repository
//!
//! Durable, tenant-scoped work queue with idempotent enqueue, atomic
//! claiming and retry/dead-letter bookkeeping.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, FixedOffset, Utc};
use metrics::counter;
use sea_orm::sea_query::{Expr, LockBehavior, LockType};
use sea_orm::{
    ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde_json::Value as JsonValue;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::backoff::ExponentialBackoff;
use crate::error::{PipelineError, is_unique_violation};
use crate::models::job_queue::{ActiveModel, Column, Entity as JobQueueEntry, JobStatus, Model};
use crate::repositories::dead_letter::{DeadLetterStore, NewDeadLetter};

pub const ORIGIN_TABLE: &str = "job_queue";
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// Input for [`JobQueue::enqueue`].
#[derive(Debug, Clone)]
pub struct NewJob {
    pub tenant_id: Uuid,
    pub operation_id: Option<Uuid>,
    pub job_type: String,
    pub payload: JsonValue,
    pub priority: i32,
    pub max_attempts: i32,
}

impl NewJob {
    pub fn new(tenant_id: Uuid, job_type: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            tenant_id,
            operation_id: None,
            job_type: job_type.into(),
            payload,
            priority: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn operation_id(mut self, operation_id: Uuid) -> Self {
        self.operation_id = Some(operation_id);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// Result of [`JobQueue::fail`].
#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    Retrying { retry_after: DateTime<FixedOffset> },
    DeadLettered { dead_letter_id: Uuid },
}

/// Repository for `job_queue` rows.
#[derive(Debug, Clone)]
pub struct JobQueue {
    db: Arc<DatabaseConnection>,
    backoff: ExponentialBackoff,
}

impl JobQueue {
    pub fn new(db: Arc<DatabaseConnection>, backoff: ExponentialBackoff) -> Self {
        Self { db, backoff }
    }

    /// Enqueue a job, or return the existing one for `(tenant_id, operation_id)`.
    #[instrument(skip(self, job), fields(tenant_id = %job.tenant_id, job_type = %job.job_type))]
    pub async fn enqueue(&self, job: NewJob) -> Result<Model, PipelineError> {
        if job.job_type.trim().is_empty() {
            return Err(PipelineError::Validation("job_type must not be empty".into()));
        }
        if job.max_attempts < 1 {
            return Err(PipelineError::Validation(
                "max_attempts must be at least 1".into(),
            ));
        }

        if let Some(operation_id) = job.operation_id {
            if let Some(existing) = self.find_by_operation(job.tenant_id, operation_id).await? {
                debug!(job_id = %existing.id, operation_id = %operation_id, "Job already enqueued");
                counter!("pipeline_jobs_deduplicated_total").increment(1);
                return Ok(existing);
            }
        }

        let id = Uuid::new_v4();
        let model = ActiveModel {
            id: Set(id),
            tenant_id: Set(job.tenant_id),
            operation_id: Set(job.operation_id),
            job_type: Set(job.job_type.clone()),
            payload: Set(job.payload),
            status: Set(JobStatus::Pending.as_str().to_string()),
            priority: Set(job.priority),
            attempts: Set(0),
            max_attempts: Set(job.max_attempts),
            created_at: Set(Utc::now().fixed_offset()),
            started_at: Set(None),
            completed_at: Set(None),
            failed_at: Set(None),
            retry_after: Set(None),
            error_message: Set(None),
        };

        match JobQueueEntry::insert(model)
            .exec_without_returning(self.db.as_ref())
            .await
        {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                if let Some(operation_id) = job.operation_id {
                    if let Some(winner) =
                        self.find_by_operation(job.tenant_id, operation_id).await?
                    {
                        debug!(job_id = %winner.id, "Lost enqueue race; returning existing job");
                        counter!("pipeline_jobs_deduplicated_total").increment(1);
                        return Ok(winner);
                    }
                }
                return Err(err.into());
            }
            Err(err) => {
                error!(error = %err, "Failed to enqueue job");
                return Err(err.into());
            }
        }

        let created = JobQueueEntry::find_by_id(id)
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| PipelineError::not_found("job", id))?;

        counter!("pipeline_jobs_enqueued_total", "job_type" => created.job_type.clone())
            .increment(1);
        info!(
            job_id = %created.id,
            operation_id = ?created.operation_id,
            priority = created.priority,
            "Job enqueued"
        );

        Ok(created)
    }

    /// Atomically claim up to `limit` runnable jobs.
    ///
    /// Runnable means `pending`, or `failed` with attempts left and an elapsed
    /// `retry_after`. Each candidate is moved to `processing` by a conditional
    /// update keyed on the status it was read in, so a row claimed by another
    /// worker in the meantime is skipped rather than returned twice.
    #[instrument(skip(self))]
    pub async fn claim_batch(&self, limit: u64) -> Result<Vec<Model>, PipelineError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now().fixed_offset();
        let txn = self.db.begin().await?;

        let candidates = JobQueueEntry::find()
            .filter(
                Condition::any()
                    .add(Column::Status.eq(JobStatus::Pending.as_str()))
                    .add(
                        Condition::all()
                            .add(Column::Status.eq(JobStatus::Failed.as_str()))
                            .add(Expr::col(Column::Attempts).lt(Expr::col(Column::MaxAttempts)))
                            .add(
                                Condition::any()
                                    .add(Column::RetryAfter.is_null())
                                    .add(Column::RetryAfter.lte(now)),
                            ),
                    ),
            )
            .order_by_desc(Column::Priority)
            .order_by_asc(Column::CreatedAt)
            .limit(limit)
            .lock_with_behavior(LockType::Update, LockBehavior::SkipLocked)
            .all(&txn)
            .await?;

        let mut claimed = Vec::with_capacity(candidates.len());
        for mut job in candidates {
            let result = JobQueueEntry::update_many()
                .col_expr(Column::Status, Expr::value(JobStatus::Processing.as_str()))
                .col_expr(Column::StartedAt, Expr::value(now))
                .filter(Column::Id.eq(job.id))
                .filter(Column::Status.eq(job.status.clone()))
                .exec(&txn)
                .await?;

            if result.rows_affected == 1 {
                job.status = JobStatus::Processing.as_str().to_string();
                job.started_at = Some(now);
                claimed.push(job);
            } else {
                debug!(job_id = %job.id, "Job claimed elsewhere; skipping");
            }
        }

        txn.commit().await?;

        if !claimed.is_empty() {
            counter!("pipeline_jobs_claimed_total").increment(claimed.len() as u64);
            debug!(count = claimed.len(), "Claimed jobs");
        }

        Ok(claimed)
    }

    /// Mark a job `completed`. Completing an already completed job is a no-op.
    #[instrument(skip(self))]
    pub async fn complete(&self, id: Uuid) -> Result<(), PipelineError> {
        let now = Utc::now().fixed_offset();
        let result = JobQueueEntry::update_many()
            .col_expr(Column::Status, Expr::value(JobStatus::Completed.as_str()))
            .col_expr(Column::CompletedAt, Expr::value(now))
            .filter(Column::Id.eq(id))
            .filter(Column::Status.ne(JobStatus::Completed.as_str()))
            .exec(self.db.as_ref())
            .await?;

        if result.rows_affected == 0 {
            return match JobQueueEntry::find_by_id(id).one(self.db.as_ref()).await? {
                Some(_) => Ok(()),
                None => Err(PipelineError::not_found("job", id)),
            };
        }

        counter!("pipeline_jobs_completed_total").increment(1);
        info!(job_id = %id, "Job completed");
        Ok(())
    }

    /// Record a failed execution.
    ///
    /// Below `max_attempts` the job goes back to `failed` with a backoff
    /// `retry_after`; on the last attempt it is handed to the dead-letter
    /// queue in the same transaction.
    #[instrument(skip(self, error_message))]
    pub async fn fail(&self, id: Uuid, error_message: &str) -> Result<FailOutcome, PipelineError> {
        let txn = self.db.begin().await?;
        let job = load_active_for_update(&txn, id).await?;

        let now = Utc::now().fixed_offset();
        let attempts = job.attempts + 1;

        if attempts < job.max_attempts {
            let retry_after = now + Duration::minutes(self.backoff.delay_minutes(attempts));
            JobQueueEntry::update_many()
                .col_expr(Column::Status, Expr::value(JobStatus::Failed.as_str()))
                .col_expr(Column::Attempts, Expr::value(attempts))
                .col_expr(Column::FailedAt, Expr::value(now))
                .col_expr(Column::ErrorMessage, Expr::value(error_message))
                .col_expr(Column::RetryAfter, Expr::value(retry_after))
                .filter(Column::Id.eq(id))
                .exec(&txn)
                .await?;
            txn.commit().await?;

            counter!("pipeline_jobs_failed_total", "job_type" => job.job_type.clone())
                .increment(1);
            warn!(
                job_id = %id,
                attempts,
                max_attempts = job.max_attempts,
                retry_after = %retry_after,
                error = error_message,
                "Job failed; scheduled for retry"
            );
            return Ok(FailOutcome::Retrying { retry_after });
        }

        let entry = NewDeadLetter::new(
            job.tenant_id,
            format!("job_{}_failed", job.job_type),
            job.payload.clone(),
            error_message,
        )
        .operation_id(job.operation_id)
        .error_code("JOB_PROCESSING_ERROR")
        .origin(ORIGIN_TABLE, job.id)
        .retries(attempts, job.max_attempts);

        let dead_letter_id =
            dead_letter_and_close(&txn, &job, entry, attempts, error_message, now).await?;
        txn.commit().await?;

        warn!(
            job_id = %id,
            dead_letter_id = %dead_letter_id,
            attempts,
            "Job exhausted its attempts; moved to dead-letter queue"
        );
        Ok(FailOutcome::DeadLettered { dead_letter_id })
    }

    /// Dead-letter a job immediately without consuming an attempt.
    ///
    /// The entry is written with its retries already used up, so it is only
    /// replayed after a manual [`DeadLetterStore::requeue`].
    #[instrument(skip(self, error_message))]
    pub async fn fail_permanently(
        &self,
        id: Uuid,
        error_message: &str,
        error_code: &str,
    ) -> Result<Uuid, PipelineError> {
        let txn = self.db.begin().await?;
        let job = load_active_for_update(&txn, id).await?;
        let now = Utc::now().fixed_offset();

        let entry = NewDeadLetter::new(
            job.tenant_id,
            format!("job_{}_failed", job.job_type),
            job.payload.clone(),
            error_message,
        )
        .operation_id(job.operation_id)
        .error_code(error_code)
        .origin(ORIGIN_TABLE, job.id)
        .retries(job.max_attempts, job.max_attempts);

        let dead_letter_id =
            dead_letter_and_close(&txn, &job, entry, job.attempts, error_message, now).await?;
        txn.commit().await?;

        warn!(
            job_id = %id,
            dead_letter_id = %dead_letter_id,
            error_code,
            "Job failed permanently; moved to dead-letter queue"
        );
        Ok(dead_letter_id)
    }

    /// Return `processing` jobs whose lease expired to `pending`.
    #[instrument(skip(self))]
    pub async fn reclaim_stale(&self, lease_ttl: StdDuration) -> Result<u64, PipelineError> {
        let ttl = Duration::from_std(lease_ttl).unwrap_or_else(|_| Duration::days(365));
        let cutoff = (Utc::now() - ttl).fixed_offset();

        let result = JobQueueEntry::update_many()
            .col_expr(Column::Status, Expr::value(JobStatus::Pending.as_str()))
            .filter(Column::Status.eq(JobStatus::Processing.as_str()))
            .filter(Column::StartedAt.lt(cutoff))
            .exec(self.db.as_ref())
            .await?;

        if result.rows_affected > 0 {
            counter!("pipeline_jobs_reclaimed_total").increment(result.rows_affected);
            warn!(
                count = result.rows_affected,
                lease_seconds = lease_ttl.as_secs(),
                "Reclaimed jobs with expired leases"
            );
        }
        Ok(result.rows_affected)
    }

    pub async fn find(&self, tenant_id: Uuid, id: Uuid) -> Result<Option<Model>, PipelineError> {
        Ok(JobQueueEntry::find_by_id(id)
            .filter(Column::TenantId.eq(tenant_id))
            .one(self.db.as_ref())
            .await?)
    }

    pub async fn find_by_operation(
        &self,
        tenant_id: Uuid,
        operation_id: Uuid,
    ) -> Result<Option<Model>, PipelineError> {
        Ok(JobQueueEntry::find()
            .filter(Column::TenantId.eq(tenant_id))
            .filter(Column::OperationId.eq(operation_id))
            .one(self.db.as_ref())
            .await?)
    }
}

/// Locks a job that can still record a failure.
async fn load_active_for_update<C: ConnectionTrait>(
    conn: &C,
    id: Uuid,
) -> Result<Model, PipelineError> {
    let job = JobQueueEntry::find_by_id(id)
        .lock_exclusive()
        .one(conn)
        .await?
        .ok_or_else(|| PipelineError::not_found("job", id))?;

    match job.job_status() {
        Some(status) if status.is_terminal() => Err(PipelineError::Validation(format!(
            "job {id} is already {status}"
        ))),
        _ => Ok(job),
    }
}

async fn dead_letter_and_close<C: ConnectionTrait>(
    conn: &C,
    job: &Model,
    entry: NewDeadLetter,
    attempts: i32,
    error_message: &str,
    now: DateTime<FixedOffset>,
) -> Result<Uuid, PipelineError> {
    let dead_letter_id = DeadLetterStore::add_with(conn, entry).await?;

    JobQueueEntry::update_many()
        .col_expr(Column::Status, Expr::value(JobStatus::DlqSent.as_str()))
        .col_expr(Column::Attempts, Expr::value(attempts))
        .col_expr(Column::FailedAt, Expr::value(now))
        .col_expr(Column::ErrorMessage, Expr::value(error_message))
        .col_expr(Column::RetryAfter, Expr::value(Option::<DateTime<FixedOffset>>::None))
        .filter(Column::Id.eq(job.id))
        .exec(conn)
        .await?;

    counter!("pipeline_jobs_dead_lettered_total", "job_type" => job.job_type.clone())
        .increment(1);
    Ok(dead_letter_id)
}
