//! Migration to create the dead_letter_queue table.
//!
//! Holds work that exhausted its retries or failed unrecoverably, together
//! with a pointer back to the originating row (`original_table`, `original_id`).

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(DeadLetterQueue::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(DeadLetterQueue::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(DeadLetterQueue::TenantId).uuid().not_null())
                    .col(ColumnDef::new(DeadLetterQueue::OperationId).uuid().null())
                    .col(ColumnDef::new(DeadLetterQueue::OriginalTable).text().null())
                    .col(ColumnDef::new(DeadLetterQueue::OriginalId).uuid().null())
                    .col(ColumnDef::new(DeadLetterQueue::EventType).text().not_null())
                    .col(
                        ColumnDef::new(DeadLetterQueue::Payload)
                            .json_binary()
                            .not_null(),
                    )
                    .col(ColumnDef::new(DeadLetterQueue::ErrorMessage).text().not_null())
                    .col(ColumnDef::new(DeadLetterQueue::ErrorCode).text().null())
                    .col(
                        ColumnDef::new(DeadLetterQueue::RetryCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(DeadLetterQueue::MaxRetries)
                            .integer()
                            .not_null()
                            .default(3),
                    )
                    .col(
                        ColumnDef::new(DeadLetterQueue::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(DeadLetterQueue::LastAttemptAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(DeadLetterQueue::NextRetryAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_dead_letter_queue_next_retry")
                    .table(DeadLetterQueue::Table)
                    .col(DeadLetterQueue::NextRetryAt)
                    .col(DeadLetterQueue::CreatedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_dead_letter_queue_origin")
                    .table(DeadLetterQueue::Table)
                    .col(DeadLetterQueue::OriginalTable)
                    .col(DeadLetterQueue::OriginalId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_dead_letter_queue_tenant_event")
                    .table(DeadLetterQueue::Table)
                    .col(DeadLetterQueue::TenantId)
                    .col(DeadLetterQueue::EventType)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(DeadLetterQueue::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum DeadLetterQueue {
    Table,
    Id,
    TenantId,
    OperationId,
    OriginalTable,
    OriginalId,
    EventType,
    Payload,
    ErrorMessage,
    ErrorCode,
    RetryCount,
    MaxRetries,
    CreatedAt,
    LastAttemptAt,
    NextRetryAt,
}
