//! # Turn Service
//!
//! Executes a conversational turn exactly once per operation id: the user
//! message and the assistant reply are written together, and a replayed
//! operation returns the pair recorded the first time.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use sea_orm::{
    ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set, TransactionTrait,
};
use serde_json::Value as JsonValue;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::{PipelineError, is_unique_violation};
use crate::handler::HandlerError;
use crate::models::message::{self, ROLE_ASSISTANT, ROLE_USER};
use crate::models::{Message, Thread, llm_turn, thread};
use crate::repositories::llm_turn::LlmTurnRepository;

pub const MAX_CONTENT_CHARS: usize = 50_000;

/// Produces the assistant reply for a user message.
#[async_trait]
pub trait TurnResponder: Send + Sync {
    async fn respond(&self, thread: &thread::Model, content: &str) -> Result<String, HandlerError>;
}

/// Replies with the user's own text.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoResponder;

#[async_trait]
impl TurnResponder for EchoResponder {
    async fn respond(&self, _thread: &thread::Model, content: &str) -> Result<String, HandlerError> {
        Ok(content.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub user_message: message::Model,
    pub assistant_message: message::Model,
    /// The operation had already been applied; nothing new was written
    pub replayed: bool,
}

#[derive(Clone)]
pub struct TurnService {
    db: Arc<DatabaseConnection>,
    responder: Arc<dyn TurnResponder>,
    llm_turns: LlmTurnRepository,
}

impl TurnService {
    pub fn new(db: Arc<DatabaseConnection>, responder: Arc<dyn TurnResponder>) -> Self {
        Self {
            llm_turns: LlmTurnRepository::new(db.clone()),
            db,
            responder,
        }
    }

    pub async fn create_thread(
        &self,
        tenant_id: Uuid,
        bot_id: Option<Uuid>,
    ) -> Result<thread::Model, PipelineError> {
        let id = Uuid::new_v4();
        let model = thread::ActiveModel {
            id: Set(id),
            tenant_id: Set(tenant_id),
            bot_id: Set(bot_id),
            status: Set("active".to_string()),
            created_at: Set(Utc::now().fixed_offset()),
        };
        Thread::insert(model)
            .exec_without_returning(self.db.as_ref())
            .await?;

        info!(thread_id = %id, tenant_id = %tenant_id, "Thread created");
        Thread::find_by_id(id)
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| PipelineError::not_found("thread", id))
    }

    /// Run one turn on `thread_id`.
    ///
    /// With an `operation_id`, a turn that already produced a reply is
    /// returned as-is with `replayed = true` and the responder is not called.
    #[instrument(skip(self, content), fields(tenant_id = %tenant_id, thread_id = %thread_id))]
    pub async fn execute_turn(
        &self,
        tenant_id: Uuid,
        thread_id: Uuid,
        operation_id: Option<Uuid>,
        content: &str,
    ) -> Result<TurnOutcome, PipelineError> {
        validate_content(content)?;

        let thread = Thread::find_by_id(thread_id)
            .filter(thread::Column::TenantId.eq(tenant_id))
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| PipelineError::not_found("thread", thread_id))?;

        if let Some(operation_id) = operation_id {
            if let Some(outcome) = self.recorded_turn(tenant_id, thread_id, operation_id).await? {
                debug!(operation_id = %operation_id, "Turn already applied; replaying");
                counter!("pipeline_turns_replayed_total").increment(1);
                return Ok(outcome);
            }
        }

        let reply = self
            .responder
            .respond(&thread, content)
            .await
            .map_err(|source| PipelineError::Handler {
                kind: "turn_responder".to_string(),
                source,
            })?;

        let now = Utc::now().fixed_offset();
        let user_id = Uuid::new_v4();
        let assistant_id = Uuid::new_v4();
        let user = message::ActiveModel {
            id: Set(user_id),
            tenant_id: Set(tenant_id),
            thread_id: Set(thread_id),
            bot_id: Set(thread.bot_id),
            role: Set(ROLE_USER.to_string()),
            content: Set(content.to_string()),
            operation_id: Set(operation_id),
            created_at: Set(now),
        };
        let assistant = message::ActiveModel {
            id: Set(assistant_id),
            tenant_id: Set(tenant_id),
            thread_id: Set(thread_id),
            bot_id: Set(thread.bot_id),
            role: Set(ROLE_ASSISTANT.to_string()),
            content: Set(reply),
            operation_id: Set(operation_id),
            created_at: Set(now),
        };

        let txn = self.db.begin().await?;
        let written: Result<(), DbErr> = async {
            Message::insert(user).exec_without_returning(&txn).await?;
            Message::insert(assistant).exec_without_returning(&txn).await?;
            Ok(())
        }
        .await;

        match written {
            Ok(()) => txn.commit().await?,
            Err(err) => {
                txn.rollback().await?;
                if let (true, Some(operation_id)) = (is_unique_violation(&err), operation_id) {
                    if let Some(outcome) =
                        self.recorded_turn(tenant_id, thread_id, operation_id).await?
                    {
                        debug!(operation_id = %operation_id, "Lost turn race; replaying winner");
                        counter!("pipeline_turns_replayed_total").increment(1);
                        return Ok(outcome);
                    }
                }
                return Err(err.into());
            }
        }

        counter!("pipeline_turns_executed_total").increment(1);
        info!(operation_id = ?operation_id, "Turn executed");

        Ok(TurnOutcome {
            user_message: self.load_message(user_id).await?,
            assistant_message: self.load_message(assistant_id).await?,
            replayed: false,
        })
    }

    /// Record an LLM turn once per `(tenant_id, operation_id)`.
    pub async fn create_llm_turn(
        &self,
        tenant_id: Uuid,
        operation_id: Uuid,
        input_data: JsonValue,
    ) -> Result<llm_turn::Model, PipelineError> {
        self.llm_turns
            .create(tenant_id, operation_id, input_data)
            .await
    }

    async fn recorded_turn(
        &self,
        tenant_id: Uuid,
        thread_id: Uuid,
        operation_id: Uuid,
    ) -> Result<Option<TurnOutcome>, PipelineError> {
        let messages = Message::find()
            .filter(message::Column::TenantId.eq(tenant_id))
            .filter(message::Column::ThreadId.eq(thread_id))
            .filter(message::Column::OperationId.eq(operation_id))
            .all(self.db.as_ref())
            .await?;

        let mut user_message = None;
        let mut assistant_message = None;
        for message in messages {
            match message.role.as_str() {
                ROLE_USER => user_message = Some(message),
                ROLE_ASSISTANT => assistant_message = Some(message),
                _ => {}
            }
        }

        Ok(match (user_message, assistant_message) {
            (Some(user_message), Some(assistant_message)) => Some(TurnOutcome {
                user_message,
                assistant_message,
                replayed: true,
            }),
            _ => None,
        })
    }

    async fn load_message(&self, id: Uuid) -> Result<message::Model, PipelineError> {
        Message::find_by_id(id)
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| PipelineError::not_found("message", id))
    }
}

fn validate_content(content: &str) -> Result<(), PipelineError> {
    if content.trim().is_empty() {
        return Err(PipelineError::Validation("content must not be empty".into()));
    }
    let chars = content.chars().count();
    if chars > MAX_CONTENT_CHARS {
        return Err(PipelineError::Validation(format!(
            "content is {chars} characters; the limit is {MAX_CONTENT_CHARS}"
        )));
    }
    Ok(())
}
