//! # Error Handling
//!
//! Unified error type for the pipeline plus helpers for classifying database
//! failures (unique-constraint races are recovered locally, never surfaced).

use sea_orm::{DbErr, RuntimeErr, SqlErr};
use thiserror::Error;
use uuid::Uuid;

use crate::handler::HandlerError;

/// Errors surfaced by the pipeline's public operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("database error: {0}")]
    Database(#[from] DbErr),
    /// Dispatch on a type with no registered handler. Configuration error, never retried.
    #[error("no handler registered for type '{kind}'")]
    UnknownHandler { kind: String },
    #[error("handler '{kind}' failed: {source}")]
    Handler {
        kind: String,
        #[source]
        source: HandlerError,
    },
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("failed to serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        PipelineError::NotFound { entity, id }
    }

    /// Stable SCREAMING_SNAKE_CASE code, also used as the dead-letter `error_code`.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Database(_) => "DATABASE_ERROR",
            PipelineError::UnknownHandler { .. } => "UNKNOWN_HANDLER",
            PipelineError::Handler { source, .. } => match source {
                HandlerError::Transient(_) => "HANDLER_TRANSIENT_ERROR",
                HandlerError::Permanent(_) => "HANDLER_PERMANENT_ERROR",
                HandlerError::Timeout { .. } => "HANDLER_TIMEOUT",
            },
            PipelineError::NotFound { .. } => "NOT_FOUND",
            PipelineError::Validation(_) => "VALIDATION_FAILED",
            PipelineError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Whether a later attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Database(err) => !is_unique_violation(err),
            PipelineError::Handler { source, .. } => source.is_retryable(),
            PipelineError::UnknownHandler { .. }
            | PipelineError::NotFound { .. }
            | PipelineError::Validation(_)
            | PipelineError::Serialization(_) => false,
        }
    }
}

/// Detects unique-constraint violations across Postgres, SQLite and MySQL.
pub(crate) fn is_unique_violation(error: &DbErr) -> bool {
    const PG_UNIQUE: &str = "23505";
    const MYSQL_DUPLICATE_CODES: &[&str] = &["1022", "1062", "1169", "1586"];
    const SQLITE_DUPLICATE_CODES: &[&str] = &["1555", "2067"];

    if matches!(error.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) {
        return true;
    }

    let runtime_err = match error {
        DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => sqlx_err,
        _ => return false,
    };

    let Some(db_error) = runtime_err.as_database_error() else {
        return false;
    };

    if db_error.is_unique_violation() {
        return true;
    }

    db_error.code().is_some_and(|code| {
        let code = code.as_ref();
        code == PG_UNIQUE
            || MYSQL_DUPLICATE_CODES.contains(&code)
            || SQLITE_DUPLICATE_CODES.contains(&code)
    })
}
