mod test_utils;

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use conversations::repositories::{DeadLetterStore, MarkOutcome, NewDeadLetter};
use sea_orm::DatabaseConnection;
use serde_json::json;
use test_utils::*;
use uuid::Uuid;

async fn store() -> Result<(Arc<DatabaseConnection>, DeadLetterStore)> {
    let db = setup_test_db_arc().await?;
    Ok((db.clone(), DeadLetterStore::new(db, steady_backoff())))
}

fn entry(tenant: Uuid, event_type: &str) -> NewDeadLetter {
    NewDeadLetter::new(tenant, event_type, json!({"k": "v"}), "boom")
}

#[tokio::test]
async fn new_entries_are_due_immediately() -> Result<()> {
    let (_db, store) = store().await?;
    let id = store.add(entry(Uuid::new_v4(), "job_send_email_failed")).await?;

    let stored = store.get(id).await?.expect("entry stored");
    assert_eq!(stored.retry_count, 0);
    assert_eq!(stored.max_retries, 3);
    assert!(stored.next_retry_at.is_none());

    let due = store.pending_retry(10).await?;
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id, id);
    Ok(())
}

#[tokio::test]
async fn pending_retry_is_oldest_first_and_limited() -> Result<()> {
    let (_db, store) = store().await?;
    let tenant = Uuid::new_v4();
    let first = store.add(entry(tenant, "a")).await?;
    let second = store.add(entry(tenant, "b")).await?;
    store.add(entry(tenant, "c")).await?;

    let due: Vec<Uuid> = store.pending_retry(2).await?.iter().map(|e| e.id).collect();
    assert_eq!(due, vec![first, second]);
    Ok(())
}

#[tokio::test]
async fn failed_attempt_reschedules_with_backoff() -> Result<()> {
    let (_db, store) = store().await?;
    let id = store.add(entry(Uuid::new_v4(), "webhook_message_created")).await?;

    let before = Utc::now().fixed_offset();
    let outcome = store
        .mark_attempt(id, false, Some("still failing"), None)
        .await?;
    let MarkOutcome::Rescheduled {
        retry_count,
        next_retry_at,
    } = outcome
    else {
        panic!("expected reschedule, got {outcome:?}");
    };
    assert_eq!(retry_count, 1);
    assert!(next_retry_at >= before + Duration::minutes(1));

    let stored = store.get(id).await?.expect("entry kept");
    assert_eq!(stored.retry_count, 1);
    assert_eq!(stored.error_message, "still failing");
    assert!(stored.last_attempt_at >= before);

    assert!(store.pending_retry(10).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn explicit_delay_overrides_backoff() -> Result<()> {
    let (_db, store) = store().await?;
    let id = store.add(entry(Uuid::new_v4(), "x")).await?;

    let before = Utc::now().fixed_offset();
    let outcome = store.mark_attempt(id, false, None, Some(30)).await?;
    let MarkOutcome::Rescheduled { next_retry_at, .. } = outcome else {
        panic!("expected reschedule");
    };
    assert!(next_retry_at >= before + Duration::minutes(30));
    assert!(next_retry_at <= Utc::now().fixed_offset() + Duration::minutes(30));

    // error message untouched when none is given
    assert_eq!(store.get(id).await?.expect("kept").error_message, "boom");
    Ok(())
}

#[tokio::test]
async fn exhausted_entries_stop_retrying() -> Result<()> {
    let (db, store) = store().await?;
    let id = store
        .add(entry(Uuid::new_v4(), "x").retries(0, 2))
        .await?;

    assert!(matches!(
        store.mark_attempt(id, false, Some("one"), None).await?,
        MarkOutcome::Rescheduled { retry_count: 1, .. }
    ));
    make_dead_letter_due(&db, id).await?;
    assert_eq!(
        store.mark_attempt(id, false, Some("two"), None).await?,
        MarkOutcome::Exhausted { retry_count: 2 }
    );

    make_dead_letter_due(&db, id).await?;
    assert!(store.pending_retry(10).await?.is_empty());

    // further failures leave the entry alone
    assert_eq!(
        store.mark_attempt(id, false, Some("three"), None).await?,
        MarkOutcome::Exhausted { retry_count: 2 }
    );
    let stored = store.get(id).await?.expect("kept for manual handling");
    assert_eq!(stored.retry_count, 2);
    assert_eq!(stored.error_message, "two");
    assert!(stored.is_exhausted());
    Ok(())
}

#[tokio::test]
async fn claim_succeeds_once_per_read() -> Result<()> {
    let (_db, store) = store().await?;
    let id = store.add(entry(Uuid::new_v4(), "job_send_email_failed")).await?;
    let read = store.pending_retry(10).await?.remove(0);

    assert!(store.claim(&read, Duration::minutes(15)).await?);
    assert!(!store.claim(&read, Duration::minutes(15)).await?);
    assert!(store.pending_retry(10).await?.is_empty());

    let leased = store.get(id).await?.expect("entry kept while leased");
    assert_eq!(leased.retry_count, 0);
    assert!(leased.next_retry_at.expect("lease recorded") > Utc::now().fixed_offset());
    Ok(())
}

#[tokio::test]
async fn stale_read_cannot_claim_after_attempt() -> Result<()> {
    let (db, store) = store().await?;
    let id = store.add(entry(Uuid::new_v4(), "x")).await?;
    let read = store.pending_retry(10).await?.remove(0);

    store.mark_attempt(id, false, Some("failed elsewhere"), None).await?;
    make_dead_letter_due(&db, id).await?;

    assert!(!store.claim(&read, Duration::minutes(15)).await?);
    Ok(())
}

#[tokio::test]
async fn exhausted_entry_returns_after_requeue() -> Result<()> {
    let (db, store) = store().await?;
    let id = store.add(entry(Uuid::new_v4(), "job_mystery_failed")).await?;

    assert_eq!(
        store.exhaust(id, "no handler", Some("UNKNOWN_JOB_TYPE")).await?,
        MarkOutcome::Exhausted { retry_count: 3 }
    );
    let stored = store.get(id).await?.expect("kept for manual handling");
    assert!(stored.is_exhausted());
    assert_eq!(stored.error_message, "no handler");
    assert_eq!(stored.error_code.as_deref(), Some("UNKNOWN_JOB_TYPE"));
    make_dead_letter_due(&db, id).await?;
    assert!(store.pending_retry(10).await?.is_empty());

    assert!(store.requeue(id).await?);
    let due = store.pending_retry(10).await?;
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].retry_count, 0);
    assert!(due[0].next_retry_at.is_none());

    assert!(!store.requeue(Uuid::new_v4()).await?);
    assert_eq!(
        store.exhaust(Uuid::new_v4(), "gone", None).await?,
        MarkOutcome::NotFound
    );
    Ok(())
}

#[tokio::test]
async fn successful_attempt_removes_entry() -> Result<()> {
    let (_db, store) = store().await?;
    let id = store.add(entry(Uuid::new_v4(), "x")).await?;

    assert_eq!(store.mark_attempt(id, true, None, None).await?, MarkOutcome::Removed);
    assert!(store.get(id).await?.is_none());
    assert_eq!(
        store.mark_attempt(id, true, None, None).await?,
        MarkOutcome::NotFound
    );
    Ok(())
}

#[tokio::test]
async fn retry_count_is_clamped_to_max() -> Result<()> {
    let (_db, store) = store().await?;
    let id = store.add(entry(Uuid::new_v4(), "x").retries(9, 3)).await?;
    let stored = store.get(id).await?.expect("stored");
    assert_eq!(stored.retry_count, 3);
    assert!(stored.is_exhausted());
    Ok(())
}

#[tokio::test]
async fn origin_lookup_and_escalation() -> Result<()> {
    let (db, store) = store().await?;
    let origin = Uuid::new_v4();
    let id = store
        .add(
            entry(Uuid::new_v4(), "webhook_message_created")
                .origin("webhook_events", origin)
                .error_code("WEBHOOK_PROCESSING_ERROR"),
        )
        .await?;

    let found = store
        .find_for_origin("webhook_events", origin)
        .await?
        .expect("found by origin");
    assert_eq!(found.id, id);
    assert!(store.find_for_origin("job_queue", origin).await?.is_none());

    let changed = DeadLetterStore::update_for_origin(
        db.as_ref(),
        "webhook_events",
        origin,
        "gave up",
        "WEBHOOK_RETRY_EXHAUSTED",
    )
    .await?;
    assert_eq!(changed, 1);
    let stored = store.get(id).await?.expect("stored");
    assert_eq!(stored.error_code.as_deref(), Some("WEBHOOK_RETRY_EXHAUSTED"));
    assert_eq!(stored.error_message, "gave up");
    Ok(())
}

#[tokio::test]
async fn stats_count_by_tenant_and_event_type() -> Result<()> {
    let (_db, store) = store().await?;
    let tenant_a = Uuid::new_v4();
    let tenant_b = Uuid::new_v4();

    store.add(entry(tenant_a, "job_send_email_failed")).await?;
    store.add(entry(tenant_a, "job_send_email_failed")).await?;
    store
        .add(entry(tenant_a, "webhook_message_created").retries(3, 3))
        .await?;
    let deferred = store.add(entry(tenant_b, "webhook_message_created")).await?;
    store
        .defer(deferred, (Utc::now() + Duration::hours(1)).fixed_offset())
        .await?;

    let all = store.stats(None).await?;
    assert_eq!(all.total_messages, 4);
    assert_eq!(all.pending_retry, 2);
    assert_eq!(all.max_retries_exceeded, 1);
    assert_eq!(all.by_event_type.get("webhook_message_created"), Some(&2));
    assert_eq!(all.tenant_id, None);

    let scoped = store.stats(Some(tenant_a)).await?;
    assert_eq!(scoped.total_messages, 3);
    assert_eq!(scoped.pending_retry, 2);
    assert_eq!(scoped.max_retries_exceeded, 1);
    assert_eq!(scoped.by_event_type.get("job_send_email_failed"), Some(&2));
    assert_eq!(scoped.by_event_type.get("webhook_message_created"), Some(&1));
    assert_eq!(scoped.tenant_id, Some(tenant_a));

    let json = serde_json::to_value(&scoped)?;
    assert_eq!(json["total_messages"], 3);
    Ok(())
}
