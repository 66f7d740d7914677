//! # LLM Turn Repository
//!
//! Idempotent creation of `llm_turns` records keyed by
//! `(tenant_id, operation_id)`.

use std::sync::Arc;

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use serde_json::Value as JsonValue;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{PipelineError, is_unique_violation};
use crate::models::llm_turn::{ActiveModel, Column, Entity as LlmTurn, Model};

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_FAILED: &str = "failed";

/// Repository for LLM turn records
#[derive(Debug, Clone)]
pub struct LlmTurnRepository {
    db: Arc<DatabaseConnection>,
}

impl LlmTurnRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Create a `pending` turn, or return the one already recorded for the operation.
    pub async fn create(
        &self,
        tenant_id: Uuid,
        operation_id: Uuid,
        input_data: JsonValue,
    ) -> Result<Model, PipelineError> {
        if let Some(existing) = self.find_by_operation(tenant_id, operation_id).await? {
            debug!(turn_id = %existing.id, operation_id = %operation_id, "LLM turn already recorded");
            return Ok(existing);
        }

        let id = Uuid::new_v4();
        let model = ActiveModel {
            id: Set(id),
            tenant_id: Set(tenant_id),
            operation_id: Set(operation_id),
            input_data: Set(input_data),
            output_data: Set(None),
            status: Set(STATUS_PENDING.to_string()),
            created_at: Set(Utc::now().fixed_offset()),
            updated_at: Set(None),
        };

        match LlmTurn::insert(model)
            .exec_without_returning(self.db.as_ref())
            .await
        {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                debug!(operation_id = %operation_id, "Lost LLM turn insert race; re-reading");
                return self
                    .find_by_operation(tenant_id, operation_id)
                    .await?
                    .ok_or_else(|| err.into());
            }
            Err(err) => return Err(err.into()),
        }

        info!(turn_id = %id, tenant_id = %tenant_id, operation_id = %operation_id, "LLM turn created");

        LlmTurn::find_by_id(id)
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| PipelineError::not_found("llm_turn", id))
    }

    /// Record the outcome of a turn.
    pub async fn finish(
        &self,
        id: Uuid,
        status: &str,
        output_data: Option<JsonValue>,
    ) -> Result<(), PipelineError> {
        if status != STATUS_SUCCESS && status != STATUS_FAILED {
            return Err(PipelineError::Validation(format!(
                "invalid llm turn status '{status}'"
            )));
        }

        let result = LlmTurn::update_many()
            .col_expr(Column::Status, Expr::value(status))
            .col_expr(Column::OutputData, Expr::value(output_data))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(id))
            .exec(self.db.as_ref())
            .await?;

        if result.rows_affected == 0 {
            return Err(PipelineError::not_found("llm_turn", id));
        }
        Ok(())
    }

    pub async fn find_by_operation(
        &self,
        tenant_id: Uuid,
        operation_id: Uuid,
    ) -> Result<Option<Model>, PipelineError> {
        Ok(LlmTurn::find()
            .filter(Column::TenantId.eq(tenant_id))
            .filter(Column::OperationId.eq(operation_id))
            .one(self.db.as_ref())
            .await?)
    }
}
