//! Engine behaviour against the in-memory store.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{ConflictingStore, Recorder, harness, harness_with};
use taskq::engine::{EngineConfig, TaskQueueEngine};
use taskq::error::Error;
use taskq::model::{ResetScope, TaskId, TaskState};

#[tokio::test]
async fn claims_follow_submission_order() {
    let h = harness().await;
    let queue = h.submit("first 1\nsecond 2\nthird 3\n").await;

    let claimed = h
        .engine
        .claim(&h.token, queue, Some("worker-a"))
        .await
        .unwrap();
    assert_eq!(claimed.token, "1");
    assert_eq!(claimed.label, "first");
    assert_eq!(h.claim_token(queue).await, "2");
    assert_eq!(h.claim_token(queue).await, "3");

    let err = h.engine.claim(&h.token, queue, None).await.unwrap_err();
    assert!(matches!(err, Error::EmptyQueue(q) if q == queue));
}

#[tokio::test]
async fn claim_records_caller() {
    let h = harness().await;
    let queue = h.submit("a 1\n").await;
    h.engine
        .claim(&h.token, queue, Some("worker-a"))
        .await
        .unwrap();

    let tasks = h.engine.list_tasks(&h.token, queue).await.unwrap();
    assert_eq!(tasks[0].state, TaskState::Assigned);
    assert_eq!(tasks[0].caller.as_deref(), Some("worker-a"));
}

#[tokio::test]
async fn malformed_submission_creates_nothing() {
    let h = harness().await;
    for text in ["", "\n\n", "only-a-label\n", "a 1\nb\n"] {
        let err = h.engine.submit(&h.token, text).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)), "{text:?} -> {err}");
    }
    assert!(h.engine.list_queues(&h.token).await.unwrap().is_empty());
}

#[tokio::test]
async fn last_report_completes_queue_and_notifies_once() {
    let h = harness().await;
    let queue = h.submit("a 1\nb 2\n").await;
    let first = h.claim_token(queue).await;
    let second = h.claim_token(queue).await;

    h.engine
        .report(&h.token, queue, &first, TaskState::Done)
        .await
        .unwrap();
    assert!(!h.completed(queue).await);
    assert_eq!(h.notified().await, 0);

    h.engine
        .report(&h.token, queue, &second, TaskState::Error)
        .await
        .unwrap();
    assert!(h.completed(queue).await);
    assert_eq!(h.notified().await, 1);

    // A late success report does not reopen the queue or notify again.
    h.engine
        .report(&h.token, queue, &second, TaskState::Done)
        .await
        .unwrap();
    assert!(h.completed(queue).await);
    assert_eq!(h.notified().await, 1);

    let sent = h.notes.sent.lock().await;
    assert_eq!(sent[0].0, "alice-phone");
    assert!(sent[0].1.title.contains(&queue.to_string()));
}

#[tokio::test]
async fn reopened_queue_notifies_again_on_next_completion() {
    let h = harness().await;
    let queue = h.submit("a 1\n").await;
    let token = h.claim_token(queue).await;
    h.engine
        .report(&h.token, queue, &token, TaskState::Error)
        .await
        .unwrap();
    assert_eq!(h.notified().await, 1);

    let moved = h
        .engine
        .reset(&h.token, queue, ResetScope::ErrorOnly)
        .await
        .unwrap();
    assert_eq!(moved, 1);
    assert!(!h.completed(queue).await);

    let token = h.claim_token(queue).await;
    h.engine
        .report(&h.token, queue, &token, TaskState::Done)
        .await
        .unwrap();
    assert!(h.completed(queue).await);
    assert_eq!(h.notified().await, 2);
}

#[tokio::test]
async fn invalid_reports_are_rejected() {
    let h = harness().await;
    let queue = h.submit("a 1\nb 2\n").await;
    let token = h.claim_token(queue).await;

    let err = h
        .engine
        .report(&h.token, queue, &token, TaskState::Assigned)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidTransition {
            from: TaskState::Assigned,
            to: TaskState::Assigned
        }
    ));

    // "2" was never claimed.
    let err = h
        .engine
        .report(&h.token, queue, "2", TaskState::Done)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidTransition {
            from: TaskState::Waiting,
            to: TaskState::Done
        }
    ));

    h.engine
        .report(&h.token, queue, &token, TaskState::Done)
        .await
        .unwrap();
    let err = h
        .engine
        .report(&h.token, queue, &token, TaskState::Error)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { from: TaskState::Done, .. }));

    let err = h
        .engine
        .report(&h.token, queue, "missing", TaskState::Done)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn report_waiting_returns_task_to_its_position() {
    let h = harness().await;
    let queue = h.submit("a 1\nb 2\n").await;
    let token = h.claim_token(queue).await;
    h.engine
        .report(&h.token, queue, &token, TaskState::Waiting)
        .await
        .unwrap();

    assert_eq!(h.claim_token(queue).await, "1");
}

#[tokio::test]
async fn put_back_requeues_at_the_tail() {
    let h = harness().await;
    let queue = h.submit("a 1\nb 2\nc 3\n").await;
    let token = h.claim_token(queue).await;
    assert_eq!(token, "1");

    h.engine.put_back(&h.token, queue, &token).await.unwrap();

    assert_eq!(h.claim_token(queue).await, "2");
    assert_eq!(h.claim_token(queue).await, "3");
    assert_eq!(h.claim_token(queue).await, "1");
}

#[tokio::test]
async fn put_back_refuses_done_tasks() {
    let h = harness().await;
    let queue = h.submit("a 1\n").await;
    let token = h.claim_token(queue).await;
    h.engine
        .report(&h.token, queue, &token, TaskState::Done)
        .await
        .unwrap();

    let err = h.engine.put_back(&h.token, queue, &token).await.unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { from: TaskState::Done, .. }));
    assert_eq!(h.states(queue).await, vec![("1".to_string(), TaskState::Done)]);

    let err = h.engine.put_back(&h.token, queue, "nope").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn reset_all_then_every_task_is_claimed_once() {
    let h = harness().await;
    let queue = h.submit("a 1\nb 2\nc 3\nd 4\n").await;
    let one = h.claim_token(queue).await;
    let two = h.claim_token(queue).await;
    h.claim_token(queue).await;
    h.engine
        .report(&h.token, queue, &one, TaskState::Done)
        .await
        .unwrap();
    h.engine
        .report(&h.token, queue, &two, TaskState::Error)
        .await
        .unwrap();

    let moved = h
        .engine
        .reset(&h.token, queue, ResetScope::AllNonDone)
        .await
        .unwrap();
    assert_eq!(moved, 2);

    let mut seen = Vec::new();
    loop {
        match h.engine.claim(&h.token, queue, None).await {
            Ok(task) => seen.push(task.token),
            Err(Error::EmptyQueue(_)) => break,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    seen.sort();
    assert_eq!(seen, vec!["2", "3", "4"]);
}

#[tokio::test]
async fn reset_scopes_select_their_sources() {
    let h = harness().await;
    let queue = h.submit("a 1\nb 2\nc 3\n").await;
    let one = h.claim_token(queue).await;
    h.claim_token(queue).await;
    h.engine
        .report(&h.token, queue, &one, TaskState::Error)
        .await
        .unwrap();

    let moved = h
        .engine
        .reset(&h.token, queue, ResetScope::AssignedOnly)
        .await
        .unwrap();
    assert_eq!(moved, 1);
    assert_eq!(
        h.states(queue).await,
        vec![
            ("1".to_string(), TaskState::Error),
            ("2".to_string(), TaskState::Waiting),
            ("3".to_string(), TaskState::Waiting),
        ]
    );

    let moved = h
        .engine
        .reset(&h.token, queue, ResetScope::ErrorOnly)
        .await
        .unwrap();
    assert_eq!(moved, 1);

    let moved = h
        .engine
        .reset(&h.token, queue, ResetScope::AllNonDone)
        .await
        .unwrap();
    assert_eq!(moved, 0);
}

#[tokio::test]
async fn append_skips_known_tokens_and_reopens() {
    let h = harness().await;
    let queue = h.submit("a 1\n").await;
    let token = h.claim_token(queue).await;
    h.engine
        .report(&h.token, queue, &token, TaskState::Done)
        .await
        .unwrap();
    assert!(h.completed(queue).await);

    let added = h
        .engine
        .append(&h.token, queue, "again 1\nb 2\n")
        .await
        .unwrap();
    assert_eq!(added, 1);
    assert!(!h.completed(queue).await);
    assert_eq!(
        h.states(queue).await,
        vec![
            ("1".to_string(), TaskState::Done),
            ("2".to_string(), TaskState::Waiting),
        ]
    );

    let added = h.engine.append(&h.token, queue, "b 2\n").await.unwrap();
    assert_eq!(added, 0);
}

#[tokio::test]
async fn deleted_queue_is_gone() {
    let h = harness().await;
    let queue = h.submit("a 1\n").await;
    h.engine.delete(&h.token, queue).await.unwrap();

    let err = h.engine.claim(&h.token, queue, None).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    let err = h.engine.list_tasks(&h.token, queue).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    let err = h.engine.delete(&h.token, queue).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    assert!(h.engine.list_queues(&h.token).await.unwrap().is_empty());
}

#[tokio::test]
async fn other_users_queues_look_missing() {
    let h = harness().await;
    let queue = h.submit("a 1\n").await;
    let bob = h.engine.register_user("bob", "pw", None).await.unwrap();

    let err = h.engine.claim(&bob.token, queue, None).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    let err = h.engine.list_tasks(&bob.token, queue).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    let err = h.engine.delete(&bob.token, queue).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    assert!(h.engine.list_queues(&bob.token).await.unwrap().is_empty());

    let task = h.engine.list_tasks(&h.token, queue).await.unwrap()[0].id;
    let err = h.engine.delete_task(&bob.token, task).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    // Still intact for the owner.
    assert_eq!(h.claim_token(queue).await, "1");
}

#[tokio::test]
async fn unknown_credentials_are_unauthorized() {
    let h = harness().await;
    let queue = h.submit("a 1\n").await;

    for credential in ["", "not-a-token"] {
        let err = h.engine.claim(credential, queue, None).await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized));
        let err = h.engine.list_queues(credential).await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized));
    }
}

#[tokio::test]
async fn reset_task_and_delete_task() {
    let h = harness().await;
    let queue = h.submit("a 1\nb 2\n").await;
    let ids: Vec<TaskId> = h
        .engine
        .list_tasks(&h.token, queue)
        .await
        .unwrap()
        .iter()
        .map(|t| t.id)
        .collect();
    let token = h.claim_token(queue).await;
    assert_eq!(token, "1");

    h.engine.reset_task(&h.token, ids[0]).await.unwrap();
    // Waiting stays Waiting.
    h.engine.reset_task(&h.token, ids[0]).await.unwrap();
    assert_eq!(h.states(queue).await[0].1, TaskState::Waiting);

    h.engine.delete_task(&h.token, ids[0]).await.unwrap();
    assert_eq!(h.states(queue).await, vec![("2".to_string(), TaskState::Waiting)]);

    let err = h.engine.delete_task(&h.token, ids[0]).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    let err = h.engine.reset_task(&h.token, ids[0]).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn reset_task_refuses_done() {
    let h = harness().await;
    let queue = h.submit("a 1\n").await;
    let token = h.claim_token(queue).await;
    h.engine
        .report(&h.token, queue, &token, TaskState::Done)
        .await
        .unwrap();
    let id = h.engine.list_tasks(&h.token, queue).await.unwrap()[0].id;

    let err = h.engine.reset_task(&h.token, id).await.unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { from: TaskState::Done, .. }));
}

#[tokio::test]
async fn deleting_last_pending_task_completes_queue() {
    let h = harness().await;
    let queue = h.submit("a 1\nb 2\n").await;
    let token = h.claim_token(queue).await;
    h.engine
        .report(&h.token, queue, &token, TaskState::Done)
        .await
        .unwrap();
    let pending = h.engine.list_tasks(&h.token, queue).await.unwrap()[1].id;

    h.engine.delete_task(&h.token, pending).await.unwrap();
    assert!(h.completed(queue).await);
    assert_eq!(h.notified().await, 1);
}

#[tokio::test]
async fn list_queues_reports_counts() {
    let h = harness().await;
    let first = h.submit("a 1\nb 2\nc 3\n").await;
    let second = h.submit("x 9\n").await;
    let token = h.claim_token(first).await;
    h.engine
        .report(&h.token, first, &token, TaskState::Error)
        .await
        .unwrap();
    h.claim_token(first).await;

    let queues = h.engine.list_queues(&h.token).await.unwrap();
    assert_eq!(queues.len(), 2);

    let summary = queues.iter().find(|q| q.queue_id == first).unwrap();
    assert_eq!(summary.counts.waiting, 1);
    assert_eq!(summary.counts.assigned, 1);
    assert_eq!(summary.counts.done, 0);
    assert_eq!(summary.counts.error, 1);
    assert_eq!(summary.counts.pending(), 2);
    assert!(!summary.completed);
    assert!(summary.changed_at >= summary.created_at);

    let summary = queues.iter().find(|q| q.queue_id == second).unwrap();
    assert_eq!(summary.counts.waiting, 1);
    assert_eq!(summary.counts.total(), 1);
}

#[tokio::test]
async fn failed_notification_does_not_fail_report() {
    let recorder = Recorder {
        fail: true,
        ..Default::default()
    };
    let h = harness_with(recorder, EngineConfig::default()).await;
    let queue = h.submit("a 1\n").await;
    let token = h.claim_token(queue).await;

    h.engine
        .report(&h.token, queue, &token, TaskState::Done)
        .await
        .unwrap();
    assert!(h.completed(queue).await);
    assert_eq!(h.notified().await, 1);
}

#[tokio::test]
async fn report_returns_before_slow_notification() {
    let recorder = Recorder {
        stall: Some(Duration::from_secs(30)),
        ..Default::default()
    };
    let config = EngineConfig {
        notify_timeout: Duration::from_millis(200),
        ..Default::default()
    };
    let h = harness_with(recorder, config).await;
    let queue = h.submit("a 1\n").await;
    let token = h.claim_token(queue).await;

    let started = std::time::Instant::now();
    h.engine
        .report(&h.token, queue, &token, TaskState::Done)
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(100));
    assert!(h.completed(queue).await);

    // The stalled dispatch is cut off by the timeout, not the 30s stall.
    let flush = tokio::time::timeout(Duration::from_secs(5), h.engine.flush_notifications()).await;
    assert!(flush.is_ok());
    assert_eq!(h.notes.count().await, 1);
}

#[tokio::test]
async fn flush_without_pending_notices_returns() {
    let h = harness().await;
    h.engine.flush_notifications().await;
    let queue = h.submit("a 1\n").await;
    let token = h.claim_token(queue).await;
    h.engine
        .report(&h.token, queue, &token, TaskState::Done)
        .await
        .unwrap();
    assert_eq!(h.notified().await, 1);
    // The tracker is reusable after a flush.
    assert_eq!(h.notified().await, 1);
}

#[tokio::test]
async fn user_without_target_gets_no_notification() {
    let h = harness().await;
    h.engine
        .set_notification_target(&h.token, None)
        .await
        .unwrap();
    let queue = h.submit("a 1\n").await;
    let token = h.claim_token(queue).await;
    h.engine
        .report(&h.token, queue, &token, TaskState::Done)
        .await
        .unwrap();

    assert!(h.completed(queue).await);
    assert_eq!(h.notified().await, 0);
}

#[tokio::test]
async fn register_user_validates_and_rejects_duplicates() {
    let h = harness().await;
    for name in ["", "  ", "two words"] {
        let err = h.engine.register_user(name, "pw", None).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
    let err = h.engine.register_user("alice", "pw", None).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(err.is_client_error());
}

#[tokio::test]
async fn claim_retries_lost_updates() {
    let store = Arc::new(ConflictingStore::new(3));
    let engine = TaskQueueEngine::with_token_auth(
        store.clone(),
        Arc::new(Recorder::default()),
        EngineConfig::default(),
    );
    let user = engine.register_user("alice", "pw", None).await.unwrap();
    let queue = engine.submit(&user.token, "a 1\n").await.unwrap().id;

    let task = engine.claim(&user.token, queue, None).await.unwrap();
    assert_eq!(task.token, "1");
}

#[tokio::test]
async fn claim_gives_up_after_configured_retries() {
    let store = Arc::new(ConflictingStore::new(10));
    let config = EngineConfig {
        claim_retries: 2,
        ..Default::default()
    };
    let engine =
        TaskQueueEngine::with_token_auth(store.clone(), Arc::new(Recorder::default()), config);
    let user = engine.register_user("alice", "pw", None).await.unwrap();
    let queue = engine.submit(&user.token, "a 1\n").await.unwrap().id;

    let err = engine.claim(&user.token, queue, None).await.unwrap_err();
    assert!(matches!(err, Error::Other(_)), "got {err}");
    assert!(!err.is_client_error());
}
