//! Test utilities for database testing.
//!
//! SQLite databases with migrations applied (in-memory, or file-backed with
//! a real pool for concurrency tests), scriptable handlers, and helpers that
//! move retry timestamps into the past.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration as StdDuration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use conversations::backoff::ExponentialBackoff;
use conversations::handler::{HandlerContext, HandlerError, OperationHandler};
use conversations::models::{dead_letter, job_queue, webhook_event};
use conversations::models::{DeadLetter, JobQueueEntry, WebhookEvent};
use migration::{Migrator, MigratorTrait};
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, ConnectOptions, Database, DatabaseConnection, EntityTrait, QueryFilter};
use serde_json::Value as JsonValue;
use tempfile::TempDir;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

/// Same as [`setup_test_db`], Arc-wrapped for the services.
pub async fn setup_test_db_arc() -> Result<Arc<DatabaseConnection>> {
    Ok(Arc::new(setup_test_db().await?))
}

/// File-backed SQLite with a multi-connection pool, so concurrent callers
/// really race on separate connections. Keep `dir` alive for the test.
pub async fn setup_pooled_db(dir: &TempDir) -> Result<Arc<DatabaseConnection>> {
    let path = dir.path().join("pipeline.db");
    let mut options = ConnectOptions::new(format!("sqlite://{}?mode=rwc", path.display()));
    options
        .max_connections(8)
        .min_connections(1)
        .acquire_timeout(StdDuration::from_secs(10))
        .sqlx_logging(false);
    let db = Database::connect(options).await?;
    Migrator::up(&db, None).await?;
    Ok(Arc::new(db))
}

/// Backoff without jitter so delays are predictable.
pub fn steady_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        jitter: false,
        ..ExponentialBackoff::default()
    }
}

/// What a [`ScriptedHandler`] does on a given call.
#[derive(Debug, Clone)]
pub enum Step {
    Succeed,
    Transient(&'static str),
    Permanent(&'static str),
}

/// Handler that replays a script of outcomes, then succeeds forever.
#[derive(Debug, Default)]
pub struct ScriptedHandler {
    calls: AtomicUsize,
    script: Mutex<Vec<Step>>,
    payloads: Mutex<Vec<JsonValue>>,
    delay: Option<StdDuration>,
}

impl ScriptedHandler {
    pub fn succeeding() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_script(script: Vec<Step>) -> Arc<Self> {
        let mut script = script;
        script.reverse();
        Arc::new(Self {
            script: Mutex::new(script),
            ..Self::default()
        })
    }

    /// Succeeds after sleeping, to hold work in flight while others race.
    pub fn slow(delay: StdDuration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    /// Fails with a transient error on every call.
    pub fn always_transient(times: usize) -> Arc<Self> {
        Self::with_script(vec![Step::Transient("upstream unavailable"); times])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn payloads(&self) -> Vec<JsonValue> {
        self.payloads.lock().await.clone()
    }
}

#[async_trait]
impl OperationHandler for ScriptedHandler {
    async fn execute(
        &self,
        _ctx: &HandlerContext,
        payload: &JsonValue,
    ) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.payloads.lock().await.push(payload.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match self.script.lock().await.pop() {
            None | Some(Step::Succeed) => Ok(()),
            Some(Step::Transient(message)) => Err(HandlerError::transient(message)),
            Some(Step::Permanent(message)) => Err(HandlerError::permanent(message)),
        }
    }
}

/// Makes a failed job eligible for the next claim.
pub async fn make_job_due(db: &DatabaseConnection, id: Uuid) -> Result<()> {
    JobQueueEntry::update_many()
        .col_expr(
            job_queue::Column::RetryAfter,
            Expr::value((Utc::now() - Duration::minutes(1)).fixed_offset()),
        )
        .filter(job_queue::Column::Id.eq(id))
        .exec(db)
        .await?;
    Ok(())
}

/// Makes a failed webhook event eligible for `retry_failed`.
pub async fn make_webhook_due(db: &DatabaseConnection, id: Uuid) -> Result<()> {
    WebhookEvent::update_many()
        .col_expr(
            webhook_event::Column::RetryAfter,
            Expr::value((Utc::now() - Duration::minutes(1)).fixed_offset()),
        )
        .filter(webhook_event::Column::Id.eq(id))
        .exec(db)
        .await?;
    Ok(())
}

/// Makes a dead-letter entry due for replay.
pub async fn make_dead_letter_due(db: &DatabaseConnection, id: Uuid) -> Result<()> {
    DeadLetter::update_many()
        .col_expr(
            dead_letter::Column::NextRetryAt,
            Expr::value((Utc::now() - Duration::minutes(1)).fixed_offset()),
        )
        .filter(dead_letter::Column::Id.eq(id))
        .exec(db)
        .await?;
    Ok(())
}

/// Backdates `started_at` on a job so its lease looks expired.
pub async fn backdate_job_start(db: &DatabaseConnection, id: Uuid, minutes: i64) -> Result<()> {
    JobQueueEntry::update_many()
        .col_expr(
            job_queue::Column::StartedAt,
            Expr::value((Utc::now() - Duration::minutes(minutes)).fixed_offset()),
        )
        .filter(job_queue::Column::Id.eq(id))
        .exec(db)
        .await?;
    Ok(())
}

pub async fn job(db: &DatabaseConnection, id: Uuid) -> Result<job_queue::Model> {
    JobQueueEntry::find_by_id(id)
        .one(db)
        .await?
        .ok_or_else(|| anyhow::anyhow!("job {id} missing"))
}

pub async fn webhook(db: &DatabaseConnection, id: Uuid) -> Result<webhook_event::Model> {
    WebhookEvent::find_by_id(id)
        .one(db)
        .await?
        .ok_or_else(|| anyhow::anyhow!("webhook event {id} missing"))
}

pub async fn dead_letters_for(
    db: &DatabaseConnection,
    original_id: Uuid,
) -> Result<Vec<dead_letter::Model>> {
    Ok(DeadLetter::find()
        .filter(dead_letter::Column::OriginalId.eq(original_id))
        .all(db)
        .await?)
}
