//! # Webhook Event Processor
//!
//! Synchronous, deduplicated handling of inbound events with a background
//! retry path. Every failure is mirrored into the dead-letter queue; the
//! entry is escalated once the event runs out of retries or fails
//! permanently.

use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::{Duration, Utc};
use metrics::{counter, histogram};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect,
    Set, TransactionTrait,
};
use serde_json::Value as JsonValue;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::backoff::ExponentialBackoff;
use crate::error::{PipelineError, is_unique_violation};
use crate::handler::{
    HandlerContext, HandlerError, HandlerRegistry, Origin, execute_with_timeout,
};
use crate::models::webhook_event::{ActiveModel, Column, Entity as WebhookEvent, Model, WebhookStatus};
use crate::repositories::dead_letter::{DEFAULT_MAX_RETRIES, DeadLetterStore, NewDeadLetter};

pub const ORIGIN_TABLE: &str = "webhook_events";
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;
pub const DEFAULT_HANDLER_TIMEOUT_SECONDS: u64 = 300;

const PERMANENT_ERROR_CODE: &str = "WEBHOOK_PERMANENT_ERROR";

/// Counts from one [`WebhookProcessor::retry_failed`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetrySummary {
    pub scanned: u64,
    pub processed: u64,
    pub rescheduled: u64,
    pub dead_lettered: u64,
    /// Claimed by another worker first
    pub skipped: u64,
    pub errors: u64,
}

#[derive(Debug, Clone)]
pub struct WebhookProcessor {
    db: Arc<DatabaseConnection>,
    handlers: HandlerRegistry,
    backoff: ExponentialBackoff,
    handler_timeout_seconds: u64,
    max_attempts: i32,
}

impl WebhookProcessor {
    pub fn new(
        db: Arc<DatabaseConnection>,
        handlers: HandlerRegistry,
        backoff: ExponentialBackoff,
    ) -> Self {
        Self {
            db,
            handlers,
            backoff,
            handler_timeout_seconds: DEFAULT_HANDLER_TIMEOUT_SECONDS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_handler_timeout(mut self, seconds: u64) -> Self {
        self.handler_timeout_seconds = seconds.max(1);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Process an inbound event once.
    ///
    /// A duplicate `(tenant_id, operation_id)` returns the stored event without
    /// running the handler again. A handler failure records a dead-letter entry
    /// and is returned to the caller: retryable failures leave the event
    /// `failed` for [`retry_failed`](Self::retry_failed), permanent ones close it
    /// as `dlq_sent` with an exhausted entry.
    #[instrument(skip(self, payload), fields(tenant_id = %tenant_id, event_type = %event_type))]
    pub async fn process(
        &self,
        tenant_id: Uuid,
        operation_id: Option<Uuid>,
        event_type: &str,
        external_id: Option<&str>,
        payload: JsonValue,
    ) -> Result<Model, PipelineError> {
        if let Some(operation_id) = operation_id {
            if let Some(existing) = self.find_by_operation(tenant_id, operation_id).await? {
                debug!(event_id = %existing.id, status = %existing.status, "Duplicate webhook event");
                counter!("pipeline_webhook_deduplicated_total").increment(1);
                return Ok(existing);
            }
        }

        let handler = self.handlers.get(event_type)?;

        let id = Uuid::new_v4();
        let now = Utc::now().fixed_offset();
        let model = ActiveModel {
            id: Set(id),
            tenant_id: Set(tenant_id),
            operation_id: Set(operation_id),
            event_type: Set(event_type.to_string()),
            external_id: Set(external_id.map(str::to_string)),
            payload: Set(payload.clone()),
            status: Set(WebhookStatus::Processing.as_str().to_string()),
            attempts: Set(0),
            error_message: Set(None),
            created_at: Set(now),
            started_at: Set(Some(now)),
            retry_after: Set(None),
            processed_at: Set(None),
        };

        match WebhookEvent::insert(model)
            .exec_without_returning(self.db.as_ref())
            .await
        {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                if let Some(operation_id) = operation_id {
                    if let Some(winner) = self.find_by_operation(tenant_id, operation_id).await? {
                        debug!(event_id = %winner.id, "Lost webhook insert race; returning existing event");
                        counter!("pipeline_webhook_deduplicated_total").increment(1);
                        return Ok(winner);
                    }
                }
                return Err(err.into());
            }
            Err(err) => return Err(err.into()),
        }

        counter!("pipeline_webhook_received_total", "event_type" => event_type.to_string())
            .increment(1);

        let ctx = HandlerContext {
            tenant_id,
            operation_id,
            source_id: id,
            attempt: 1,
            origin: Origin::Webhook,
        };
        let started = Instant::now();
        let outcome =
            execute_with_timeout(handler.as_ref(), &ctx, &payload, self.handler_timeout_seconds)
                .await;
        histogram!("pipeline_webhook_handler_duration_ms")
            .record(started.elapsed().as_secs_f64() * 1_000.0);

        match outcome {
            Ok(()) => {
                self.mark_processed(id).await?;
                counter!("pipeline_webhook_processed_total").increment(1);
                info!(event_id = %id, "Webhook event processed");
                self.reload(id).await
            }
            Err(handler_err) => {
                let message = handler_err.to_string();
                let permanent = !handler_err.is_retryable();
                let now = Utc::now().fixed_offset();
                let retry_after =
                    (!permanent).then(|| now + Duration::minutes(self.backoff.delay_minutes(1)));
                let (status, error_code) = if permanent {
                    (WebhookStatus::DlqSent, PERMANENT_ERROR_CODE)
                } else {
                    (WebhookStatus::Failed, "WEBHOOK_PROCESSING_ERROR")
                };

                let mut entry = NewDeadLetter::new(
                    tenant_id,
                    format!("webhook_{event_type}"),
                    payload,
                    message.as_str(),
                )
                .operation_id(operation_id)
                .error_code(error_code)
                .origin(ORIGIN_TABLE, id);
                if permanent {
                    entry = entry.retries(DEFAULT_MAX_RETRIES, DEFAULT_MAX_RETRIES);
                }

                let txn = self.db.begin().await?;
                WebhookEvent::update_many()
                    .col_expr(Column::Status, Expr::value(status.as_str()))
                    .col_expr(Column::Attempts, Expr::col(Column::Attempts).add(1))
                    .col_expr(Column::ErrorMessage, Expr::value(message.as_str()))
                    .col_expr(Column::RetryAfter, Expr::value(retry_after))
                    .filter(Column::Id.eq(id))
                    .exec(&txn)
                    .await?;
                let dead_letter_id = DeadLetterStore::add_with(&txn, entry).await?;
                txn.commit().await?;

                counter!("pipeline_webhook_failed_total", "event_type" => event_type.to_string())
                    .increment(1);
                error!(
                    event_id = %id,
                    dead_letter_id = %dead_letter_id,
                    retry_after = ?retry_after,
                    permanent,
                    error = %message,
                    "Webhook handler failed"
                );

                Err(PipelineError::Handler {
                    kind: event_type.to_string(),
                    source: handler_err,
                })
            }
        }
    }

    /// Re-run failed events whose `retry_after` has passed.
    #[instrument(skip(self))]
    pub async fn retry_failed(&self, limit: u64) -> Result<RetrySummary, PipelineError> {
        let now = Utc::now().fixed_offset();
        let candidates = WebhookEvent::find()
            .filter(Column::Status.eq(WebhookStatus::Failed.as_str()))
            .filter(Column::Attempts.lt(self.max_attempts))
            .filter(
                Condition::any()
                    .add(Column::RetryAfter.is_null())
                    .add(Column::RetryAfter.lte(now)),
            )
            .order_by_asc(Column::CreatedAt)
            .limit(limit)
            .all(self.db.as_ref())
            .await?;

        let mut summary = RetrySummary {
            scanned: candidates.len() as u64,
            ..RetrySummary::default()
        };

        for event in candidates {
            match self.retry_one(event).await {
                Ok(RetryResult::Processed) => summary.processed += 1,
                Ok(RetryResult::Rescheduled) => summary.rescheduled += 1,
                Ok(RetryResult::DeadLettered) => summary.dead_lettered += 1,
                Ok(RetryResult::Skipped) => summary.skipped += 1,
                Err(err) => {
                    summary.errors += 1;
                    error!(error = %err, "Webhook retry failed unexpectedly");
                }
            }
        }

        if summary.scanned > 0 {
            info!(
                scanned = summary.scanned,
                processed = summary.processed,
                rescheduled = summary.rescheduled,
                dead_lettered = summary.dead_lettered,
                skipped = summary.skipped,
                errors = summary.errors,
                "Webhook retry pass finished"
            );
        }
        Ok(summary)
    }

    async fn retry_one(&self, event: Model) -> Result<RetryResult, PipelineError> {
        let claimed = WebhookEvent::update_many()
            .col_expr(Column::Status, Expr::value(WebhookStatus::Processing.as_str()))
            .col_expr(Column::StartedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(event.id))
            .filter(Column::Status.eq(WebhookStatus::Failed.as_str()))
            .exec(self.db.as_ref())
            .await?;
        if claimed.rows_affected != 1 {
            return Ok(RetryResult::Skipped);
        }

        let attempt = event.attempts + 1;
        let outcome = match self.handlers.get(&event.event_type) {
            Ok(handler) => {
                let ctx = HandlerContext {
                    tenant_id: event.tenant_id,
                    operation_id: event.operation_id,
                    source_id: event.id,
                    attempt,
                    origin: Origin::Webhook,
                };
                execute_with_timeout(
                    handler.as_ref(),
                    &ctx,
                    &event.payload,
                    self.handler_timeout_seconds,
                )
                .await
            }
            Err(err) => Err(HandlerError::permanent(err.to_string())),
        };

        let (message, permanent) = match outcome {
            Ok(()) => {
                self.mark_processed(event.id).await?;
                counter!("pipeline_webhook_processed_total").increment(1);
                info!(event_id = %event.id, attempt, "Webhook event processed on retry");
                return Ok(RetryResult::Processed);
            }
            Err(err) => (err.to_string(), !err.is_retryable()),
        };

        let now = Utc::now().fixed_offset();
        if !permanent && attempt < self.max_attempts {
            let retry_after = now + Duration::minutes(self.backoff.delay_minutes(attempt));
            WebhookEvent::update_many()
                .col_expr(Column::Status, Expr::value(WebhookStatus::Failed.as_str()))
                .col_expr(Column::Attempts, Expr::value(attempt))
                .col_expr(Column::ErrorMessage, Expr::value(message.as_str()))
                .col_expr(Column::RetryAfter, Expr::value(retry_after))
                .filter(Column::Id.eq(event.id))
                .exec(self.db.as_ref())
                .await?;
            counter!("pipeline_webhook_failed_total", "event_type" => event.event_type.clone())
                .increment(1);
            warn!(
                event_id = %event.id,
                attempt,
                retry_after = %retry_after,
                error = %message,
                "Webhook retry failed; rescheduled"
            );
            return Ok(RetryResult::Rescheduled);
        }

        let txn = self.db.begin().await?;
        WebhookEvent::update_many()
            .col_expr(Column::Status, Expr::value(WebhookStatus::DlqSent.as_str()))
            .col_expr(Column::Attempts, Expr::value(attempt))
            .col_expr(Column::ErrorMessage, Expr::value(message.as_str()))
            .filter(Column::Id.eq(event.id))
            .exec(&txn)
            .await?;

        let error_code = if permanent {
            PERMANENT_ERROR_CODE
        } else {
            "WEBHOOK_RETRY_EXHAUSTED"
        };
        let escalated = if permanent {
            DeadLetterStore::exhaust_for_origin(&txn, ORIGIN_TABLE, event.id, &message, error_code)
                .await?
        } else {
            DeadLetterStore::update_for_origin(&txn, ORIGIN_TABLE, event.id, &message, error_code)
                .await?
        };
        if escalated == 0 {
            let mut entry = NewDeadLetter::new(
                event.tenant_id,
                format!("webhook_{}", event.event_type),
                event.payload.clone(),
                message.as_str(),
            )
            .operation_id(event.operation_id)
            .error_code(error_code)
            .origin(ORIGIN_TABLE, event.id);
            if permanent {
                entry = entry.retries(DEFAULT_MAX_RETRIES, DEFAULT_MAX_RETRIES);
            }
            DeadLetterStore::add_with(&txn, entry).await?;
        }
        txn.commit().await?;

        counter!("pipeline_webhook_dead_lettered_total", "event_type" => event.event_type.clone())
            .increment(1);
        warn!(
            event_id = %event.id,
            attempts = attempt,
            permanent,
            "Webhook event closed; escalated to dead-letter queue"
        );
        Ok(RetryResult::DeadLettered)
    }

    /// Move `processing` events whose lease expired to `failed` for the retry pass.
    #[instrument(skip(self))]
    pub async fn reclaim_stale(&self, lease_ttl: StdDuration) -> Result<u64, PipelineError> {
        let ttl = Duration::from_std(lease_ttl).unwrap_or_else(|_| Duration::days(365));
        let now = Utc::now();
        let cutoff = (now - ttl).fixed_offset();

        let result = WebhookEvent::update_many()
            .col_expr(Column::Status, Expr::value(WebhookStatus::Failed.as_str()))
            .col_expr(Column::RetryAfter, Expr::value(now.fixed_offset()))
            .col_expr(Column::ErrorMessage, Expr::value("processing lease expired"))
            .filter(Column::Status.eq(WebhookStatus::Processing.as_str()))
            .filter(Column::StartedAt.lt(cutoff))
            .exec(self.db.as_ref())
            .await?;

        if result.rows_affected > 0 {
            counter!("pipeline_webhook_reclaimed_total").increment(result.rows_affected);
            warn!(count = result.rows_affected, "Reclaimed webhook events with expired leases");
        }
        Ok(result.rows_affected)
    }

    pub async fn find(&self, tenant_id: Uuid, id: Uuid) -> Result<Option<Model>, PipelineError> {
        Ok(WebhookEvent::find_by_id(id)
            .filter(Column::TenantId.eq(tenant_id))
            .one(self.db.as_ref())
            .await?)
    }

    pub async fn find_by_operation(
        &self,
        tenant_id: Uuid,
        operation_id: Uuid,
    ) -> Result<Option<Model>, PipelineError> {
        Ok(WebhookEvent::find()
            .filter(Column::TenantId.eq(tenant_id))
            .filter(Column::OperationId.eq(operation_id))
            .one(self.db.as_ref())
            .await?)
    }

    /// Settle an event as `processed`. Used by the dead-letter replayer as well.
    pub async fn mark_processed(&self, id: Uuid) -> Result<(), PipelineError> {
        let now = Utc::now().fixed_offset();
        WebhookEvent::update_many()
            .col_expr(Column::Status, Expr::value(WebhookStatus::Processed.as_str()))
            .col_expr(Column::ProcessedAt, Expr::value(now))
            .col_expr(Column::ErrorMessage, Expr::value(Option::<String>::None))
            .filter(Column::Id.eq(id))
            .exec(self.db.as_ref())
            .await?;
        Ok(())
    }

    async fn reload(&self, id: Uuid) -> Result<Model, PipelineError> {
        WebhookEvent::find_by_id(id)
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| PipelineError::not_found("webhook_event", id))
    }
}

enum RetryResult {
    Processed,
    Rescheduled,
    DeadLettered,
    Skipped,
}
