//! LLM turn entity model
//!
//! One record per `(tenant_id, operation_id)`; its existence marks the turn as
//! applied.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "llm_turns")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub operation_id: Uuid,
    #[sea_orm(column_type = "JsonBinary")]
    pub input_data: JsonValue,
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub output_data: Option<JsonValue>,
    /// `pending`, `success` or `failed`
    pub status: String,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
