//! DeadLetter entity model
//!
//! SeaORM entity for the `dead_letter_queue` table. An entry with
//! `retry_count == max_retries` is terminal and only leaves the table through
//! manual intervention.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::Serialize;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize)]
#[sea_orm(table_name = "dead_letter_queue")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub tenant_id: Uuid,

    pub operation_id: Option<Uuid>,

    /// Table the failed work came from (`job_queue`, `webhook_events`)
    pub original_table: Option<String>,

    /// Row id inside `original_table`
    pub original_id: Option<Uuid>,

    /// Category, e.g. `job_send_email_failed` or `webhook_message_created`
    pub event_type: String,

    /// Full copy of the failed work's input
    #[sea_orm(column_type = "JsonBinary")]
    pub payload: JsonValue,

    pub error_message: String,

    pub error_code: Option<String>,

    pub retry_count: i32,

    pub max_retries: i32,

    pub created_at: DateTimeWithTimeZone,

    pub last_attempt_at: DateTimeWithTimeZone,

    /// `None` means due immediately
    pub next_retry_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// No further automatic retries will be scheduled.
    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}
