//! Database migrations for the conversations pipeline.
//!
//! Tables: conversation threads/messages, LLM turns, the job queue, webhook
//! events and the dead-letter queue, plus the per-tenant operation guards.

pub use sea_orm_migration::prelude::*;

mod m2026_01_10_000100_create_conversations;
mod m2026_01_10_000200_create_llm_turns;
mod m2026_01_10_000300_create_job_queue;
mod m2026_01_10_000400_create_webhook_events;
mod m2026_01_10_000500_create_dead_letter_queue;
mod m2026_01_10_000600_add_operation_unique_guards;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2026_01_10_000100_create_conversations::Migration),
            Box::new(m2026_01_10_000200_create_llm_turns::Migration),
            Box::new(m2026_01_10_000300_create_job_queue::Migration),
            Box::new(m2026_01_10_000400_create_webhook_events::Migration),
            Box::new(m2026_01_10_000500_create_dead_letter_queue::Migration),
            Box::new(m2026_01_10_000600_add_operation_unique_guards::Migration),
        ]
    }
}
