//! Operation handler trait definition
//!
//! Every job type and webhook event type is backed by an [`OperationHandler`]
//! registered under its type key. Handlers hold the business logic; the
//! pipeline owns dedupe, retry and dead-lettering around them.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub mod registry;

pub use registry::HandlerRegistry;

/// Failure reported by a handler.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HandlerError {
    /// Retry later with backoff
    #[error("transient failure: {0}")]
    Transient(String),
    /// Retrying cannot help; goes straight to the dead-letter queue
    #[error("permanent failure: {0}")]
    Permanent(String),
    #[error("handler timed out after {seconds}s")]
    Timeout { seconds: u64 },
}

impl HandlerError {
    pub fn transient<S: Into<String>>(message: S) -> Self {
        HandlerError::Transient(message.into())
    }

    pub fn permanent<S: Into<String>>(message: S) -> Self {
        HandlerError::Permanent(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, HandlerError::Permanent(_))
    }
}

/// Where a handler invocation comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Job,
    Webhook,
    DeadLetterReplay,
}

/// Metadata passed alongside the payload.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub tenant_id: Uuid,
    pub operation_id: Option<Uuid>,
    /// Id of the job, webhook event or dead-letter entry being executed
    pub source_id: Uuid,
    /// 1-based attempt number
    pub attempt: i32,
    pub origin: Origin,
}

/// Pluggable per-type business logic.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn execute(&self, ctx: &HandlerContext, payload: &JsonValue)
    -> Result<(), HandlerError>;
}

/// Runs a handler under a timeout, mapping expiry to [`HandlerError::Timeout`].
pub async fn execute_with_timeout(
    handler: &dyn OperationHandler,
    ctx: &HandlerContext,
    payload: &JsonValue,
    timeout_seconds: u64,
) -> Result<(), HandlerError> {
    match tokio::time::timeout(
        std::time::Duration::from_secs(timeout_seconds),
        handler.execute(ctx, payload),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(HandlerError::Timeout {
            seconds: timeout_seconds,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Sleepy;

    #[async_trait]
    impl OperationHandler for Sleepy {
        async fn execute(
            &self,
            _ctx: &HandlerContext,
            _payload: &JsonValue,
        ) -> Result<(), HandlerError> {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            Ok(())
        }
    }

    fn ctx() -> HandlerContext {
        HandlerContext {
            tenant_id: Uuid::new_v4(),
            operation_id: None,
            source_id: Uuid::new_v4(),
            attempt: 1,
            origin: Origin::Job,
        }
    }

    #[tokio::test]
    async fn timeout_maps_to_handler_error() {
        let result = execute_with_timeout(&Sleepy, &ctx(), &JsonValue::Null, 1).await;
        assert_eq!(result, Err(HandlerError::Timeout { seconds: 1 }));
    }

    #[test]
    fn permanent_errors_are_not_retryable() {
        assert!(HandlerError::transient("x").is_retryable());
        assert!(HandlerError::Timeout { seconds: 1 }.is_retryable());
        assert!(!HandlerError::permanent("x").is_retryable());
    }
}
