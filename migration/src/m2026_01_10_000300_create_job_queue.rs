//! Migration to create the job_queue table.
//!
//! Durable, priority-ordered queue of asynchronous work. Rows move
//! `pending -> processing -> completed`, may bounce through `failed` while
//! attempts remain, and end in `dlq_sent` once handed to the dead-letter queue.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::Statement;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(JobQueue::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(JobQueue::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(JobQueue::TenantId).uuid().not_null())
                    .col(ColumnDef::new(JobQueue::OperationId).uuid().null())
                    .col(ColumnDef::new(JobQueue::JobType).text().not_null())
                    .col(ColumnDef::new(JobQueue::Payload).json_binary().not_null())
                    .col(
                        ColumnDef::new(JobQueue::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(JobQueue::Priority)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(JobQueue::Attempts)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(JobQueue::MaxAttempts)
                            .integer()
                            .not_null()
                            .default(3),
                    )
                    .col(
                        ColumnDef::new(JobQueue::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(JobQueue::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(JobQueue::CompletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(JobQueue::FailedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(JobQueue::RetryAfter)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(JobQueue::ErrorMessage).text().null())
                    .to_owned(),
            )
            .await?;

        // Claim path: status filter, then priority DESC / created_at ASC
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "CREATE INDEX IF NOT EXISTS idx_job_queue_status_priority_created ON job_queue (status, priority DESC, created_at)".to_string(),
            ))
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_job_queue_tenant_status")
                    .table(JobQueue::Table)
                    .col(JobQueue::TenantId)
                    .col(JobQueue::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_job_queue_status_priority_created")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(Index::drop().name("idx_job_queue_tenant_status").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(JobQueue::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum JobQueue {
    Table,
    Id,
    TenantId,
    OperationId,
    JobType,
    Payload,
    Status,
    Priority,
    Attempts,
    MaxAttempts,
    CreatedAt,
    StartedAt,
    CompletedAt,
    FailedAt,
    RetryAfter,
    ErrorMessage,
}
