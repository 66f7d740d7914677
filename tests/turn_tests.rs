mod test_utils;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use conversations::PipelineError;
use conversations::dedupe_cache::OperationCache;
use conversations::handler::HandlerError;
use conversations::ledger::IdempotencyLedger;
use conversations::models::message::{ROLE_ASSISTANT, ROLE_USER};
use conversations::models::{Message, thread};
use conversations::turns::{EchoResponder, TurnResponder, TurnService};
use sea_orm::{EntityTrait, PaginatorTrait};
use serde_json::json;
use test_utils::*;
use uuid::Uuid;

#[derive(Default)]
struct CountingResponder {
    calls: AtomicUsize,
}

#[async_trait]
impl TurnResponder for CountingResponder {
    async fn respond(&self, _thread: &thread::Model, content: &str) -> Result<String, HandlerError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("reply #{n} to {content}"))
    }
}

struct FailingResponder;

#[async_trait]
impl TurnResponder for FailingResponder {
    async fn respond(&self, _thread: &thread::Model, _content: &str) -> Result<String, HandlerError> {
        Err(HandlerError::transient("model overloaded"))
    }
}

#[tokio::test]
async fn turn_writes_user_and_assistant_messages() -> Result<()> {
    let db = setup_test_db_arc().await?;
    let service = TurnService::new(db.clone(), Arc::new(EchoResponder));
    let tenant = Uuid::new_v4();
    let bot = Uuid::new_v4();
    let thread = service.create_thread(tenant, Some(bot)).await?;
    assert_eq!(thread.status, "active");

    let op = Uuid::new_v4();
    let outcome = service.execute_turn(tenant, thread.id, Some(op), "hello").await?;

    assert!(!outcome.replayed);
    assert_eq!(outcome.user_message.role, ROLE_USER);
    assert_eq!(outcome.user_message.content, "hello");
    assert_eq!(outcome.assistant_message.role, ROLE_ASSISTANT);
    assert_eq!(outcome.assistant_message.content, "hello");
    assert_eq!(outcome.assistant_message.operation_id, Some(op));
    assert_eq!(outcome.assistant_message.bot_id, Some(bot));
    assert_eq!(Message::find().count(db.as_ref()).await?, 2);
    Ok(())
}

#[tokio::test]
async fn replayed_turn_returns_original_pair() -> Result<()> {
    let db = setup_test_db_arc().await?;
    let responder = Arc::new(CountingResponder::default());
    let service = TurnService::new(db.clone(), responder.clone());
    let tenant = Uuid::new_v4();
    let thread = service.create_thread(tenant, None).await?;
    let op = Uuid::new_v4();

    let first = service.execute_turn(tenant, thread.id, Some(op), "hi").await?;
    let second = service.execute_turn(tenant, thread.id, Some(op), "hi").await?;

    assert!(second.replayed);
    assert_eq!(second.user_message.id, first.user_message.id);
    assert_eq!(second.assistant_message.id, first.assistant_message.id);
    assert_eq!(second.assistant_message.content, "reply #1 to hi");
    assert_eq!(responder.calls.load(Ordering::SeqCst), 1);
    assert_eq!(Message::find().count(db.as_ref()).await?, 2);
    Ok(())
}

#[tokio::test]
async fn concurrent_turns_with_same_operation_apply_once() -> Result<()> {
    let db = setup_test_db_arc().await?;
    let service = TurnService::new(db.clone(), Arc::new(CountingResponder::default()));
    let tenant = Uuid::new_v4();
    let thread = service.create_thread(tenant, None).await?;
    let op = Uuid::new_v4();

    let (a, b) = tokio::join!(
        service.execute_turn(tenant, thread.id, Some(op), "hi"),
        service.execute_turn(tenant, thread.id, Some(op), "hi"),
    );
    let (a, b) = (a?, b?);

    assert_eq!(a.assistant_message.id, b.assistant_message.id);
    assert!(a.replayed ^ b.replayed);
    assert_eq!(Message::find().count(db.as_ref()).await?, 2);
    Ok(())
}

#[tokio::test]
async fn turns_without_operation_id_always_execute() -> Result<()> {
    let db = setup_test_db_arc().await?;
    let service = TurnService::new(db.clone(), Arc::new(EchoResponder));
    let tenant = Uuid::new_v4();
    let thread = service.create_thread(tenant, None).await?;

    service.execute_turn(tenant, thread.id, None, "one").await?;
    service.execute_turn(tenant, thread.id, None, "two").await?;

    assert_eq!(Message::find().count(db.as_ref()).await?, 4);
    Ok(())
}

#[tokio::test]
async fn turn_requires_thread_owned_by_tenant() -> Result<()> {
    let db = setup_test_db_arc().await?;
    let service = TurnService::new(db.clone(), Arc::new(EchoResponder));
    let owner = Uuid::new_v4();
    let thread = service.create_thread(owner, None).await?;

    let err = service
        .execute_turn(Uuid::new_v4(), thread.id, None, "hi")
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::NotFound { entity: "thread", .. }));

    let err = service
        .execute_turn(owner, Uuid::new_v4(), None, "hi")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");
    Ok(())
}

#[tokio::test]
async fn invalid_content_is_rejected_before_any_write() -> Result<()> {
    let db = setup_test_db_arc().await?;
    let service = TurnService::new(db.clone(), Arc::new(EchoResponder));
    let tenant = Uuid::new_v4();
    let thread = service.create_thread(tenant, None).await?;

    let err = service
        .execute_turn(tenant, thread.id, Some(Uuid::new_v4()), "  ")
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Validation(_)));
    assert_eq!(Message::find().count(db.as_ref()).await?, 0);
    Ok(())
}

#[tokio::test]
async fn responder_failure_writes_nothing() -> Result<()> {
    let db = setup_test_db_arc().await?;
    let service = TurnService::new(db.clone(), Arc::new(FailingResponder));
    let tenant = Uuid::new_v4();
    let thread = service.create_thread(tenant, None).await?;

    let err = service
        .execute_turn(tenant, thread.id, Some(Uuid::new_v4()), "hi")
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(Message::find().count(db.as_ref()).await?, 0);
    Ok(())
}

#[tokio::test]
async fn llm_turn_is_created_once() -> Result<()> {
    let db = setup_test_db_arc().await?;
    let service = TurnService::new(db.clone(), Arc::new(EchoResponder));
    let tenant = Uuid::new_v4();
    let op = Uuid::new_v4();

    let first = service
        .create_llm_turn(tenant, op, json!({"prompt": "hi"}))
        .await?;
    let second = service
        .create_llm_turn(tenant, op, json!({"prompt": "different"}))
        .await?;

    assert_eq!(first.id, second.id);
    assert_eq!(second.input_data, json!({"prompt": "hi"}));
    assert_eq!(first.status, "pending");
    Ok(())
}

#[tokio::test]
async fn ledger_sees_applied_turns() -> Result<()> {
    let db = setup_test_db_arc().await?;
    let service = TurnService::new(db.clone(), Arc::new(EchoResponder));
    let cache = Arc::new(OperationCache::new(16, std::time::Duration::from_secs(60)));
    let ledger = IdempotencyLedger::new(db.clone()).with_cache(cache.clone());
    let tenant = Uuid::new_v4();
    let thread = service.create_thread(tenant, None).await?;
    let op = Uuid::new_v4();
    let op_text = op.to_string();

    assert!(!ledger.already_applied(tenant, Some(&op_text)).await?);
    assert!(cache.is_empty(), "negative answers are not cached");

    service.execute_turn(tenant, thread.id, Some(op), "hi").await?;

    assert!(ledger.already_applied(tenant, Some(&op_text)).await?);
    assert!(cache.contains(tenant, op));
    assert!(!ledger.already_applied(Uuid::new_v4(), Some(&op_text)).await?);
    assert!(!ledger.already_applied(tenant, Some("not-a-uuid")).await?);
    assert!(!ledger.already_applied(tenant, None).await?);

    let llm_op = Uuid::new_v4();
    service.create_llm_turn(tenant, llm_op, json!({})).await?;
    assert!(ledger.already_applied_uuid(tenant, llm_op).await?);
    Ok(())
}

#[tokio::test]
async fn llm_turn_outcome_is_recorded() -> Result<()> {
    use conversations::repositories::LlmTurnRepository;
    use conversations::repositories::llm_turn::{STATUS_FAILED, STATUS_SUCCESS};

    let db = setup_test_db_arc().await?;
    let repo = LlmTurnRepository::new(db.clone());
    let turn = repo
        .create(Uuid::new_v4(), Uuid::new_v4(), json!({"prompt": "hi"}))
        .await?;

    repo.finish(turn.id, STATUS_SUCCESS, Some(json!({"reply": "hello"})))
        .await?;
    let stored = repo
        .find_by_operation(turn.tenant_id, turn.operation_id)
        .await?
        .expect("stored");
    assert_eq!(stored.status, STATUS_SUCCESS);
    assert_eq!(stored.output_data, Some(json!({"reply": "hello"})));
    assert!(stored.updated_at.is_some());

    let err = repo.finish(turn.id, "bogus", None).await.unwrap_err();
    assert!(matches!(err, PipelineError::Validation(_)));
    let err = repo
        .finish(Uuid::new_v4(), STATUS_FAILED, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");
    Ok(())
}
