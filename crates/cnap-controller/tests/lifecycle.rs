//! End-to-end task lifecycle scenarios over the in-memory repository and the
//! file content store.

use std::sync::Arc;

use cnap_controller::{Coordinator, ControllerError, FileContentStore, InMemoryRepository};
use cnap_core::{ChatMessage, ChatRole, RunnerStatus, TaskId, TaskStatus};
use cnap_runner::testing::{Reply, ScriptedInvoker};
use cnap_runner::RunnerRegistry;
use tempfile::TempDir;
use tokio::sync::Notify;

struct Harness {
    coordinator: Arc<Coordinator>,
    invoker: Arc<ScriptedInvoker>,
    _data: TempDir,
}

async fn harness(reply: &str) -> Harness {
    harness_with(ScriptedInvoker::replying(reply)).await
}

async fn harness_with(invoker: Arc<ScriptedInvoker>) -> Harness {
    let data = tempfile::tempdir().unwrap();
    let coordinator = Coordinator::new(
        InMemoryRepository::new(),
        Arc::new(FileContentStore::new(data.path())),
        RunnerRegistry::new(invoker.clone()),
    );
    coordinator
        .create_agent("a1", "test agent", "test-model", "")
        .await
        .unwrap();
    Harness {
        coordinator: Arc::new(coordinator),
        invoker,
        _data: data,
    }
}

#[tokio::test]
async fn dispatch_runs_to_completion_once() {
    let gate = Arc::new(Notify::new());
    let h = harness_with(ScriptedInvoker::with_fallback(Reply::Gated(
        gate.clone(),
        "hello back".to_string(),
    )))
    .await;
    let c = &h.coordinator;
    c.create_task("a1", "t1", Some("hello".to_string()))
        .await
        .unwrap();

    let dispatch = c.send_message("t1").await.unwrap();
    assert_eq!(c.get_task("t1").await.unwrap().status, TaskStatus::Running);
    assert_eq!(c.registry().len().await, 1);
    assert!(matches!(
        c.send_message("t1").await,
        Err(ControllerError::TaskAlreadyRunning(_))
    ));

    gate.notify_one();
    let result = dispatch.wait().await.unwrap();
    assert_eq!(result.output, "hello back");
    assert_eq!(c.get_task("t1").await.unwrap().status, TaskStatus::Completed);

    let runner = c.registry().get_runner(&TaskId::new("t1")).await.unwrap();
    assert_eq!(runner.status(), RunnerStatus::Completed);

    assert!(matches!(
        c.send_message("t1").await,
        Err(ControllerError::TaskAlreadyFinished {
            status: TaskStatus::Completed,
            ..
        })
    ));
    assert_eq!(h.invoker.calls().len(), 1);

    let messages = c.list_messages("t1").await.unwrap();
    assert_eq!(messages, vec![ChatMessage::assistant("hello back")]);
}

#[tokio::test]
async fn conversation_indices_follow_append_order() {
    let h = harness("ok").await;
    let c = &h.coordinator;
    c.create_task("a1", "t1", None).await.unwrap();

    for (role, content) in [
        (ChatRole::User, "first"),
        (ChatRole::Assistant, "second"),
        (ChatRole::User, "third"),
    ] {
        c.add_message("t1", role, content).await.unwrap();
    }

    let rows = c.list_message_index("t1").await.unwrap();
    let shape: Vec<_> = rows
        .iter()
        .map(|r| (r.conversation_index, r.role))
        .collect();
    assert_eq!(
        shape,
        vec![
            (0, ChatRole::User),
            (1, ChatRole::Assistant),
            (2, ChatRole::User)
        ]
    );
    assert_eq!(c.next_conversation_index("t1").await.unwrap(), 3);

    let contents: Vec<_> = c
        .list_messages("t1")
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.content)
        .collect();
    assert_eq!(contents, vec!["first", "second", "third"]);
}

#[tokio::test]
async fn concurrent_appends_stay_gapless() {
    let h = harness("ok").await;
    create_t1(&h.coordinator).await;

    let mut handles = Vec::new();
    for i in 0..20 {
        let c = Arc::clone(&h.coordinator);
        handles.push(tokio::spawn(async move {
            c.add_message("t1", ChatRole::User, &format!("message {i}"))
                .await
                .unwrap()
                .conversation_index
        }));
    }
    let mut indices = Vec::new();
    for handle in handles {
        indices.push(handle.await.unwrap());
    }
    indices.sort_unstable();
    assert_eq!(indices, (0..20).collect::<Vec<u32>>());
    assert_eq!(
        h.coordinator.next_conversation_index("t1").await.unwrap(),
        20
    );
}

#[tokio::test]
async fn concurrent_dispatch_has_single_winner() {
    let h = harness("ok").await;
    create_t1(&h.coordinator).await;
    h.coordinator
        .add_message("t1", ChatRole::User, "go")
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let c = Arc::clone(&h.coordinator);
        handles.push(tokio::spawn(async move { c.send_message("t1").await }));
    }

    let mut dispatches = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(dispatch) => dispatches.push(dispatch),
            Err(ControllerError::TaskAlreadyRunning(_))
            | Err(ControllerError::TaskAlreadyFinished { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(dispatches.len(), 1);
    for dispatch in dispatches {
        dispatch.wait().await.unwrap();
    }
    assert_eq!(h.invoker.calls().len(), 1);
}

#[tokio::test]
async fn add_message_requires_task() {
    let h = harness("ok").await;
    assert!(matches!(
        h.coordinator.add_message("nope", ChatRole::User, "hi").await,
        Err(ControllerError::TaskNotFound(_))
    ));
}

async fn create_t1(c: &Coordinator) {
    c.create_task("a1", "t1", None).await.unwrap();
}
