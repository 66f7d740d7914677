//! Creates the `llm_turns` table, one row per `(tenant_id, operation_id)`.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(LlmTurns::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(LlmTurns::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(LlmTurns::TenantId).uuid().not_null())
                    .col(ColumnDef::new(LlmTurns::OperationId).uuid().not_null())
                    .col(ColumnDef::new(LlmTurns::InputData).json_binary().not_null())
                    .col(ColumnDef::new(LlmTurns::OutputData).json_binary().null())
                    .col(
                        ColumnDef::new(LlmTurns::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(LlmTurns::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(LlmTurns::UpdatedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("ux_llm_turns_tenant_operation")
                    .table(LlmTurns::Table)
                    .col(LlmTurns::TenantId)
                    .col(LlmTurns::OperationId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(LlmTurns::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum LlmTurns {
    Table,
    Id,
    TenantId,
    OperationId,
    InputData,
    OutputData,
    Status,
    CreatedAt,
    UpdatedAt,
}
