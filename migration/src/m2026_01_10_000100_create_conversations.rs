//! Creates `conversation_threads` and `conversation_messages`.
//!
//! A turn writes a user/assistant message pair sharing one operation id; the
//! unique index on `(tenant_id, thread_id, operation_id, role)` is the final
//! arbiter when two retries of the same turn race.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ConversationThreads::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ConversationThreads::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ConversationThreads::TenantId).uuid().not_null())
                    .col(ColumnDef::new(ConversationThreads::BotId).uuid().null())
                    .col(
                        ColumnDef::new(ConversationThreads::Status)
                            .text()
                            .not_null()
                            .default("active"),
                    )
                    .col(
                        ColumnDef::new(ConversationThreads::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_conversation_threads_tenant")
                    .table(ConversationThreads::Table)
                    .col(ConversationThreads::TenantId)
                    .col(ConversationThreads::CreatedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(ConversationMessages::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ConversationMessages::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ConversationMessages::TenantId).uuid().not_null())
                    .col(ColumnDef::new(ConversationMessages::ThreadId).uuid().not_null())
                    .col(ColumnDef::new(ConversationMessages::BotId).uuid().null())
                    .col(ColumnDef::new(ConversationMessages::Role).text().not_null())
                    .col(ColumnDef::new(ConversationMessages::Content).text().not_null())
                    .col(ColumnDef::new(ConversationMessages::OperationId).uuid().null())
                    .col(
                        ColumnDef::new(ConversationMessages::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_conversation_messages_thread_id")
                            .from(ConversationMessages::Table, ConversationMessages::ThreadId)
                            .to(ConversationThreads::Table, ConversationThreads::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("ux_conversation_messages_operation_role")
                    .table(ConversationMessages::Table)
                    .col(ConversationMessages::TenantId)
                    .col(ConversationMessages::ThreadId)
                    .col(ConversationMessages::OperationId)
                    .col(ConversationMessages::Role)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_conversation_messages_thread_created")
                    .table(ConversationMessages::Table)
                    .col(ConversationMessages::ThreadId)
                    .col(ConversationMessages::CreatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ConversationMessages::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(ConversationThreads::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ConversationThreads {
    Table,
    Id,
    TenantId,
    BotId,
    Status,
    CreatedAt,
}

#[derive(DeriveIden)]
enum ConversationMessages {
    Table,
    Id,
    TenantId,
    ThreadId,
    BotId,
    Role,
    Content,
    OperationId,
    CreatedAt,
}
