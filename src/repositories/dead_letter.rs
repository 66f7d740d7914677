//! # Dead-Letter Store
//!
//! Durable holding area for work that exhausted its retries or failed
//! unrecoverably. Entries are retried on a backoff schedule until either a
//! replay succeeds (the entry is deleted) or `retry_count` reaches
//! `max_retries` (the entry stays put for manual handling). Unrecoverable
//! failures are written already exhausted; [`DeadLetterStore::requeue`] puts
//! an entry back into rotation by hand.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, Utc};
use metrics::counter;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::backoff::ExponentialBackoff;
use crate::error::PipelineError;
use crate::models::dead_letter::{ActiveModel, Column, Entity as DeadLetter, Model};

pub const DEFAULT_MAX_RETRIES: i32 = 3;

/// Input for [`DeadLetterStore::add`].
#[derive(Debug, Clone)]
pub struct NewDeadLetter {
    pub tenant_id: Uuid,
    pub operation_id: Option<Uuid>,
    pub event_type: String,
    pub payload: JsonValue,
    pub error_message: String,
    pub error_code: Option<String>,
    pub original_table: Option<String>,
    pub original_id: Option<Uuid>,
    pub retry_count: i32,
    pub max_retries: i32,
}

impl NewDeadLetter {
    pub fn new(
        tenant_id: Uuid,
        event_type: impl Into<String>,
        payload: JsonValue,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id,
            operation_id: None,
            event_type: event_type.into(),
            payload,
            error_message: error_message.into(),
            error_code: None,
            original_table: None,
            original_id: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn operation_id(mut self, operation_id: Option<Uuid>) -> Self {
        self.operation_id = operation_id;
        self
    }

    pub fn error_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    pub fn origin(mut self, table: impl Into<String>, id: Uuid) -> Self {
        self.original_table = Some(table.into());
        self.original_id = Some(id);
        self
    }

    pub fn retries(mut self, retry_count: i32, max_retries: i32) -> Self {
        self.retry_count = retry_count;
        self.max_retries = max_retries;
        self
    }
}

/// Result of [`DeadLetterStore::mark_attempt`].
#[derive(Debug, Clone, PartialEq)]
pub enum MarkOutcome {
    /// Replay succeeded; the entry was deleted.
    Removed,
    /// Replay failed with retries left.
    Rescheduled {
        retry_count: i32,
        next_retry_at: DateTime<FixedOffset>,
    },
    /// No retries left; the entry awaits manual handling.
    Exhausted { retry_count: i32 },
    NotFound,
}

/// Aggregate view of the dead-letter queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DlqStats {
    pub total_messages: u64,
    pub pending_retry: u64,
    pub max_retries_exceeded: u64,
    pub by_event_type: BTreeMap<String, u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct DeadLetterStore {
    db: Arc<DatabaseConnection>,
    backoff: ExponentialBackoff,
}

impl DeadLetterStore {
    pub fn new(db: Arc<DatabaseConnection>, backoff: ExponentialBackoff) -> Self {
        Self { db, backoff }
    }

    pub fn backoff(&self) -> &ExponentialBackoff {
        &self.backoff
    }

    /// Records a dead-letter entry and returns its id.
    pub async fn add(&self, entry: NewDeadLetter) -> Result<Uuid, PipelineError> {
        Ok(Self::add_with(self.db.as_ref(), entry).await?)
    }

    /// [`add`](Self::add) on a caller-supplied connection or transaction.
    pub async fn add_with<C: ConnectionTrait>(
        conn: &C,
        entry: NewDeadLetter,
    ) -> Result<Uuid, DbErr> {
        let id = Uuid::new_v4();
        let now = Utc::now().fixed_offset();
        let max_retries = entry.max_retries.max(0);
        let retry_count = entry.retry_count.clamp(0, max_retries);

        let model = ActiveModel {
            id: Set(id),
            tenant_id: Set(entry.tenant_id),
            operation_id: Set(entry.operation_id),
            original_table: Set(entry.original_table.clone()),
            original_id: Set(entry.original_id),
            event_type: Set(entry.event_type.clone()),
            payload: Set(entry.payload),
            error_message: Set(entry.error_message),
            error_code: Set(entry.error_code.clone()),
            retry_count: Set(retry_count),
            max_retries: Set(max_retries),
            created_at: Set(now),
            last_attempt_at: Set(now),
            next_retry_at: Set(None),
        };

        DeadLetter::insert(model).exec_without_returning(conn).await?;

        counter!("pipeline_dlq_entries_added_total", "event_type" => entry.event_type.clone())
            .increment(1);
        warn!(
            dead_letter_id = %id,
            tenant_id = %entry.tenant_id,
            event_type = %entry.event_type,
            error_code = entry.error_code.as_deref().unwrap_or(""),
            original_table = entry.original_table.as_deref().unwrap_or(""),
            original_id = ?entry.original_id,
            retry_count,
            max_retries,
            "Added entry to dead-letter queue"
        );

        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Model>, PipelineError> {
        Ok(DeadLetter::find_by_id(id).one(self.db.as_ref()).await?)
    }

    /// Newest entry pointing at `original_table`/`original_id`.
    pub async fn find_for_origin(
        &self,
        original_table: &str,
        original_id: Uuid,
    ) -> Result<Option<Model>, PipelineError> {
        Ok(DeadLetter::find()
            .filter(Column::OriginalTable.eq(original_table))
            .filter(Column::OriginalId.eq(original_id))
            .order_by_desc(Column::CreatedAt)
            .one(self.db.as_ref())
            .await?)
    }

    /// Overwrites error details on every entry for an origin; returns how many changed.
    pub async fn update_for_origin<C: ConnectionTrait>(
        conn: &C,
        original_table: &str,
        original_id: Uuid,
        error_message: &str,
        error_code: &str,
    ) -> Result<u64, DbErr> {
        let result = DeadLetter::update_many()
            .col_expr(Column::ErrorMessage, Expr::value(error_message))
            .col_expr(Column::ErrorCode, Expr::value(error_code))
            .col_expr(
                Column::LastAttemptAt,
                Expr::value(Utc::now().fixed_offset()),
            )
            .filter(Column::OriginalTable.eq(original_table))
            .filter(Column::OriginalId.eq(original_id))
            .exec(conn)
            .await?;
        Ok(result.rows_affected)
    }

    /// Like [`update_for_origin`](Self::update_for_origin), and also uses up the
    /// remaining retries so the entries are never replayed automatically.
    pub async fn exhaust_for_origin<C: ConnectionTrait>(
        conn: &C,
        original_table: &str,
        original_id: Uuid,
        error_message: &str,
        error_code: &str,
    ) -> Result<u64, DbErr> {
        let result = DeadLetter::update_many()
            .col_expr(Column::ErrorMessage, Expr::value(error_message))
            .col_expr(Column::ErrorCode, Expr::value(error_code))
            .col_expr(Column::RetryCount, Expr::col(Column::MaxRetries).into())
            .col_expr(
                Column::NextRetryAt,
                Expr::value(Option::<DateTime<FixedOffset>>::None),
            )
            .col_expr(
                Column::LastAttemptAt,
                Expr::value(Utc::now().fixed_offset()),
            )
            .filter(Column::OriginalTable.eq(original_table))
            .filter(Column::OriginalId.eq(original_id))
            .exec(conn)
            .await?;
        Ok(result.rows_affected)
    }

    /// Entries with retries left whose `next_retry_at` has passed, oldest first.
    #[instrument(skip(self))]
    pub async fn pending_retry(&self, limit: u64) -> Result<Vec<Model>, PipelineError> {
        let now = Utc::now().fixed_offset();
        let entries = DeadLetter::find()
            .filter(due_for_retry(now))
            .order_by_asc(Column::CreatedAt)
            .limit(limit)
            .all(self.db.as_ref())
            .await?;
        debug!(count = entries.len(), "Loaded dead-letter entries due for retry");
        Ok(entries)
    }

    /// Takes exclusive ownership of a due entry for `lease`.
    ///
    /// `next_retry_at` moves past now only if the entry is still due with the
    /// `retry_count` it was read with, so of several replayers that read the
    /// same entry exactly one gets `true`. A replayer that dies mid-attempt
    /// leaves the entry to come due again once the lease runs out.
    pub async fn claim(&self, entry: &Model, lease: Duration) -> Result<bool, PipelineError> {
        let now = Utc::now().fixed_offset();
        let result = DeadLetter::update_many()
            .col_expr(Column::NextRetryAt, Expr::value(now + lease))
            .filter(Column::Id.eq(entry.id))
            .filter(Column::RetryCount.eq(entry.retry_count))
            .filter(due_for_retry(now))
            .exec(self.db.as_ref())
            .await?;

        let claimed = result.rows_affected == 1;
        if !claimed {
            debug!(dead_letter_id = %entry.id, "Dead-letter entry claimed elsewhere");
        }
        Ok(claimed)
    }

    /// Records one replay attempt.
    ///
    /// Success deletes the entry. Failure bumps `retry_count`, replaces the
    /// error message and, while retries remain, schedules `next_retry_at`
    /// using `delay_minutes` or the backoff policy. An already exhausted entry
    /// is left untouched.
    #[instrument(skip(self, error_message))]
    pub async fn mark_attempt(
        &self,
        id: Uuid,
        success: bool,
        error_message: Option<&str>,
        delay_minutes: Option<i64>,
    ) -> Result<MarkOutcome, PipelineError> {
        let txn = self.db.begin().await?;

        let Some(entry) = DeadLetter::find_by_id(id)
            .lock_exclusive()
            .one(&txn)
            .await?
        else {
            txn.rollback().await?;
            return Ok(MarkOutcome::NotFound);
        };

        if success {
            DeadLetter::delete_by_id(id).exec(&txn).await?;
            txn.commit().await?;
            counter!("pipeline_dlq_replays_total", "outcome" => "removed").increment(1);
            info!(dead_letter_id = %id, event_type = %entry.event_type, "Dead-letter entry resolved");
            return Ok(MarkOutcome::Removed);
        }

        if entry.is_exhausted() {
            txn.rollback().await?;
            return Ok(MarkOutcome::Exhausted {
                retry_count: entry.retry_count,
            });
        }

        let now = Utc::now().fixed_offset();
        let retry_count = entry.retry_count + 1;
        let mut update = DeadLetter::update_many()
            .col_expr(Column::RetryCount, Expr::value(retry_count))
            .col_expr(Column::LastAttemptAt, Expr::value(now));
        if let Some(message) = error_message {
            update = update.col_expr(Column::ErrorMessage, Expr::value(message));
        }

        let outcome = if retry_count < entry.max_retries {
            let delay = delay_minutes.unwrap_or_else(|| self.backoff.delay_minutes(retry_count));
            let next_retry_at = now + Duration::minutes(delay.max(0));
            update = update.col_expr(Column::NextRetryAt, Expr::value(next_retry_at));
            MarkOutcome::Rescheduled {
                retry_count,
                next_retry_at,
            }
        } else {
            MarkOutcome::Exhausted { retry_count }
        };

        update.filter(Column::Id.eq(id)).exec(&txn).await?;
        txn.commit().await?;

        match &outcome {
            MarkOutcome::Rescheduled { next_retry_at, .. } => {
                counter!("pipeline_dlq_replays_total", "outcome" => "rescheduled").increment(1);
                info!(
                    dead_letter_id = %id,
                    retry_count,
                    next_retry_at = %next_retry_at,
                    "Dead-letter replay failed; rescheduled"
                );
            }
            _ => {
                counter!("pipeline_dlq_replays_total", "outcome" => "exhausted").increment(1);
                warn!(
                    dead_letter_id = %id,
                    retry_count,
                    max_retries = entry.max_retries,
                    "Dead-letter entry exhausted; manual intervention required"
                );
            }
        }

        Ok(outcome)
    }

    /// Gives up on an entry: uses up its retries and records why.
    ///
    /// For failures no amount of retrying can fix. The entry stays for manual
    /// handling.
    #[instrument(skip(self, error_message))]
    pub async fn exhaust(
        &self,
        id: Uuid,
        error_message: &str,
        error_code: Option<&str>,
    ) -> Result<MarkOutcome, PipelineError> {
        let mut update = DeadLetter::update_many()
            .col_expr(Column::RetryCount, Expr::col(Column::MaxRetries).into())
            .col_expr(Column::ErrorMessage, Expr::value(error_message))
            .col_expr(
                Column::NextRetryAt,
                Expr::value(Option::<DateTime<FixedOffset>>::None),
            )
            .col_expr(Column::LastAttemptAt, Expr::value(Utc::now().fixed_offset()));
        if let Some(code) = error_code {
            update = update.col_expr(Column::ErrorCode, Expr::value(code));
        }
        update.filter(Column::Id.eq(id)).exec(self.db.as_ref()).await?;

        let Some(entry) = self.get(id).await? else {
            return Ok(MarkOutcome::NotFound);
        };
        counter!("pipeline_dlq_replays_total", "outcome" => "exhausted").increment(1);
        warn!(
            dead_letter_id = %id,
            event_type = %entry.event_type,
            error = error_message,
            "Dead-letter entry cannot be replayed; manual intervention required"
        );
        Ok(MarkOutcome::Exhausted {
            retry_count: entry.retry_count,
        })
    }

    /// Manual replay: resets the retry budget and makes the entry due now.
    pub async fn requeue(&self, id: Uuid) -> Result<bool, PipelineError> {
        let result = DeadLetter::update_many()
            .col_expr(Column::RetryCount, Expr::value(0))
            .col_expr(
                Column::NextRetryAt,
                Expr::value(Option::<DateTime<FixedOffset>>::None),
            )
            .filter(Column::Id.eq(id))
            .exec(self.db.as_ref())
            .await?;

        let requeued = result.rows_affected == 1;
        if requeued {
            info!(dead_letter_id = %id, "Dead-letter entry requeued for replay");
        }
        Ok(requeued)
    }

    /// Pushes `next_retry_at` out without consuming a retry.
    pub async fn defer(&self, id: Uuid, until: DateTime<FixedOffset>) -> Result<(), PipelineError> {
        DeadLetter::update_many()
            .col_expr(Column::NextRetryAt, Expr::value(until))
            .filter(Column::Id.eq(id))
            .exec(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// Aggregate counts, optionally scoped to one tenant.
    pub async fn stats(&self, tenant_id: Option<Uuid>) -> Result<DlqStats, PipelineError> {
        let conn = self.db.as_ref();
        let now = Utc::now().fixed_offset();
        let scoped = || {
            let query = DeadLetter::find();
            match tenant_id {
                Some(tenant_id) => query.filter(Column::TenantId.eq(tenant_id)),
                None => query,
            }
        };

        let total_messages = scoped().count(conn).await?;
        let pending_retry = scoped().filter(due_for_retry(now)).count(conn).await?;
        let max_retries_exceeded = scoped()
            .filter(Expr::col(Column::RetryCount).gte(Expr::col(Column::MaxRetries)))
            .count(conn)
            .await?;

        let by_event_type = scoped()
            .select_only()
            .column(Column::EventType)
            .column_as(Expr::col(Column::Id).count(), "count")
            .group_by(Column::EventType)
            .into_tuple::<(String, i64)>()
            .all(conn)
            .await?
            .into_iter()
            .map(|(event_type, count)| (event_type, count.max(0) as u64))
            .collect();

        Ok(DlqStats {
            total_messages,
            pending_retry,
            max_retries_exceeded,
            by_event_type,
            tenant_id,
        })
    }
}

fn due_for_retry(now: DateTime<FixedOffset>) -> Condition {
    Condition::all()
        .add(Expr::col(Column::RetryCount).lt(Expr::col(Column::MaxRetries)))
        .add(
            Condition::any()
                .add(Column::NextRetryAt.is_null())
                .add(Column::NextRetryAt.lte(now)),
        )
}
