//! JobQueue entity model
//!
//! SeaORM entity for the `job_queue` table: asynchronous units of work keyed
//! by tenant and an optional idempotency operation id.

use std::fmt;

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Queued job
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "job_queue")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Tenant (workspace) that owns the job
    pub tenant_id: Uuid,

    /// Idempotency key, unique per tenant when present
    pub operation_id: Option<Uuid>,

    /// Handler key used to dispatch the job
    pub job_type: String,

    /// Opaque handler input
    #[sea_orm(column_type = "JsonBinary")]
    pub payload: JsonValue,

    /// One of [`JobStatus`]
    pub status: String,

    /// Higher values are claimed first
    pub priority: i32,

    /// Failed executions so far
    pub attempts: i32,

    pub max_attempts: i32,

    pub created_at: DateTimeWithTimeZone,

    /// Set on every claim
    pub started_at: Option<DateTimeWithTimeZone>,

    pub completed_at: Option<DateTimeWithTimeZone>,

    pub failed_at: Option<DateTimeWithTimeZone>,

    /// Earliest time a `failed` job may be claimed again
    pub retry_after: Option<DateTimeWithTimeZone>,

    pub error_message: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Parsed status; unknown values map to `None`.
    pub fn job_status(&self) -> Option<JobStatus> {
        JobStatus::parse(&self.status)
    }
}

/// Lifecycle states of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    DlqSent,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::DlqSent => "dlq_sent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "dlq_sent" => Some(JobStatus::DlqSent),
            _ => None,
        }
    }

    /// Never claimed or failed again. A `dlq_sent` job may still be
    /// settled to `completed` by a successful dead-letter replay.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::DlqSent)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
