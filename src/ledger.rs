//! # Idempotency Ledger
//!
//! Answers "has this `(tenant, operation_id)` already been applied?" by
//! consulting every durable record an applied operation leaves behind.
//! Unique indexes remain the final arbiter under concurrency; the ledger is
//! the cheap pre-check.

use std::sync::Arc;

use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter};
use tracing::debug;
use uuid::Uuid;

use crate::dedupe_cache::OperationCache;
use crate::error::PipelineError;
use crate::models::job_queue::{self, JobStatus};
use crate::models::message::{self, ROLE_ASSISTANT};
use crate::models::webhook_event::{self, WebhookStatus};
use crate::models::{JobQueueEntry, LlmTurn, Message, WebhookEvent, llm_turn};

#[derive(Debug, Clone)]
pub struct IdempotencyLedger {
    db: Arc<DatabaseConnection>,
    cache: Option<Arc<OperationCache>>,
}

impl IdempotencyLedger {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db, cache: None }
    }

    /// Front the ledger with an in-process cache of positive answers.
    pub fn with_cache(mut self, cache: Arc<OperationCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// `false` when `operation_id` is absent or not a UUID: no dedupe was requested.
    pub async fn already_applied(
        &self,
        tenant_id: Uuid,
        operation_id: Option<&str>,
    ) -> Result<bool, PipelineError> {
        let Some(raw) = operation_id else {
            return Ok(false);
        };
        match Uuid::parse_str(raw.trim()) {
            Ok(operation_id) => self.already_applied_uuid(tenant_id, operation_id).await,
            Err(_) => {
                debug!(operation_id = raw, "Ignoring malformed operation id");
                Ok(false)
            }
        }
    }

    pub async fn already_applied_uuid(
        &self,
        tenant_id: Uuid,
        operation_id: Uuid,
    ) -> Result<bool, PipelineError> {
        if let Some(cache) = &self.cache {
            if cache.contains(tenant_id, operation_id) {
                return Ok(true);
            }
        }

        let applied = self.lookup(tenant_id, operation_id).await?;
        if applied {
            if let Some(cache) = &self.cache {
                cache.remember(tenant_id, operation_id);
            }
        }
        Ok(applied)
    }

    async fn lookup(&self, tenant_id: Uuid, operation_id: Uuid) -> Result<bool, PipelineError> {
        let conn = self.db.as_ref();

        let turns = LlmTurn::find()
            .filter(llm_turn::Column::TenantId.eq(tenant_id))
            .filter(llm_turn::Column::OperationId.eq(operation_id))
            .count(conn)
            .await?;
        if turns > 0 {
            debug!(%operation_id, source = "llm_turns", "Operation already applied");
            return Ok(true);
        }

        let replies = Message::find()
            .filter(message::Column::TenantId.eq(tenant_id))
            .filter(message::Column::OperationId.eq(operation_id))
            .filter(message::Column::Role.eq(ROLE_ASSISTANT))
            .count(conn)
            .await?;
        if replies > 0 {
            debug!(%operation_id, source = "conversation_messages", "Operation already applied");
            return Ok(true);
        }

        let webhooks = WebhookEvent::find()
            .filter(webhook_event::Column::TenantId.eq(tenant_id))
            .filter(webhook_event::Column::OperationId.eq(operation_id))
            .filter(webhook_event::Column::Status.eq(WebhookStatus::Processed.as_str()))
            .count(conn)
            .await?;
        if webhooks > 0 {
            debug!(%operation_id, source = "webhook_events", "Operation already applied");
            return Ok(true);
        }

        let jobs = JobQueueEntry::find()
            .filter(job_queue::Column::TenantId.eq(tenant_id))
            .filter(job_queue::Column::OperationId.eq(operation_id))
            .filter(job_queue::Column::Status.eq(JobStatus::Completed.as_str()))
            .count(conn)
            .await?;
        if jobs > 0 {
            debug!(%operation_id, source = "job_queue", "Operation already applied");
            return Ok(true);
        }

        Ok(false)
    }
}
