//! Adds partial unique indexes so each tenant can hold at most one job and one
//! webhook event per operation id.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::{DatabaseBackend, Statement};

const GUARDS: &[(&str, &str)] = &[
    ("ux_job_queue_tenant_operation", "job_queue"),
    ("ux_webhook_events_tenant_operation", "webhook_events"),
];

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let backend = manager.get_database_backend();
        for (index, table) in GUARDS {
            let sql = match backend {
                DatabaseBackend::Postgres => format!(
                    "DO $$\nBEGIN\n    IF NOT EXISTS (\n        SELECT 1 FROM pg_indexes\n        WHERE schemaname = current_schema()\n          AND indexname = '{index}'\n    ) THEN\n        CREATE UNIQUE INDEX {index}\n            ON {table} (tenant_id, operation_id)\n            WHERE operation_id IS NOT NULL;\n    END IF;\nEND\n$$;"
                ),
                _ => format!(
                    "CREATE UNIQUE INDEX IF NOT EXISTS {index} \
                     ON {table} (tenant_id, operation_id) \
                     WHERE operation_id IS NOT NULL"
                ),
            };
            manager
                .get_connection()
                .execute(Statement::from_string(backend, sql))
                .await?;
        }
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        for (index, _) in GUARDS {
            manager
                .get_connection()
                .execute(Statement::from_string(
                    manager.get_database_backend(),
                    format!("DROP INDEX IF EXISTS {index}"),
                ))
                .await?;
        }
        Ok(())
    }
}
