//! WebhookEvent entity model
//!
//! SeaORM entity for the `webhook_events` table, one row per inbound event.

use std::fmt;

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "webhook_events")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub operation_id: Option<Uuid>,
    pub event_type: String,
    /// Identifier assigned by the sending system
    pub external_id: Option<String>,
    #[sea_orm(column_type = "JsonBinary")]
    pub payload: JsonValue,
    pub status: String,
    /// Failed handler invocations; never decreases
    pub attempts: i32,
    pub error_message: Option<String>,
    pub created_at: DateTimeWithTimeZone,
    pub started_at: Option<DateTimeWithTimeZone>,
    pub retry_after: Option<DateTimeWithTimeZone>,
    /// Only set on success
    pub processed_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn event_status(&self) -> Option<WebhookStatus> {
        WebhookStatus::parse(&self.status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookStatus {
    Processing,
    Processed,
    Failed,
    DlqSent,
}

impl WebhookStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WebhookStatus::Processing => "processing",
            WebhookStatus::Processed => "processed",
            WebhookStatus::Failed => "failed",
            WebhookStatus::DlqSent => "dlq_sent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "processing" => Some(WebhookStatus::Processing),
            "processed" => Some(WebhookStatus::Processed),
            "failed" => Some(WebhookStatus::Failed),
            "dlq_sent" => Some(WebhookStatus::DlqSent),
            _ => None,
        }
    }
}

impl fmt::Display for WebhookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
