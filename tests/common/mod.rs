//! Shared fixtures: an in-memory engine with a recording dispatcher.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use taskq::engine::{EngineConfig, TaskQueueEngine};
use taskq::error::{Error, Result};
use taskq::model::*;
use taskq::notify::{Message, NotificationDispatcher};
use taskq::store::{Bulk, MemoryStore, QueueStore, Transition};
use tokio::sync::Mutex;

/// Dispatcher that records every call and can be told to fail or stall.
#[derive(Default)]
pub struct Recorder {
    pub sent: Mutex<Vec<(String, Message)>>,
    pub fail: bool,
    pub stall: Option<Duration>,
}

impl Recorder {
    pub async fn count(&self) -> usize {
        self.sent.lock().await.len()
    }
}

#[async_trait]
impl NotificationDispatcher for Recorder {
    async fn dispatch(&self, destination: &str, message: &Message) -> Result<()> {
        self.sent
            .lock()
            .await
            .push((destination.to_string(), message.clone()));
        if let Some(stall) = self.stall {
            tokio::time::sleep(stall).await;
        }
        if self.fail {
            return Err(Error::Notify("push service unavailable".to_string()));
        }
        Ok(())
    }
}

pub struct Harness {
    pub engine: TaskQueueEngine,
    pub store: Arc<MemoryStore>,
    pub notes: Arc<Recorder>,
    /// Token of a user with a notification target.
    pub token: String,
}

pub async fn harness() -> Harness {
    harness_with(Recorder::default(), EngineConfig::default()).await
}

pub async fn harness_with(recorder: Recorder, config: EngineConfig) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let notes = Arc::new(recorder);
    let engine = TaskQueueEngine::with_token_auth(store.clone(), notes.clone(), config);
    let user = engine
        .register_user("alice", "secret", Some("alice-phone"))
        .await
        .expect("register user");
    Harness {
        engine,
        store,
        notes,
        token: user.token,
    }
}

impl Harness {
    pub async fn submit(&self, text: &str) -> QueueId {
        self.engine
            .submit(&self.token, text)
            .await
            .expect("submit")
            .id
    }

    pub async fn claim_token(&self, queue: QueueId) -> String {
        self.engine
            .claim(&self.token, queue, Some("worker"))
            .await
            .expect("claim")
            .token
    }

    pub async fn states(&self, queue: QueueId) -> Vec<(String, TaskState)> {
        self.engine
            .list_tasks(&self.token, queue)
            .await
            .expect("list tasks")
            .into_iter()
            .map(|t| (t.token, t.state))
            .collect()
    }

    /// Notices delivered so far, after draining the ones still in flight.
    pub async fn notified(&self) -> usize {
        self.engine.flush_notifications().await;
        self.notes.count().await
    }

    pub async fn completed(&self, queue: QueueId) -> bool {
        self.store
            .queue(queue)
            .await
            .expect("load queue")
            .expect("queue exists")
            .completed
    }
}

/// Store wrapper whose first `conflicts` claims report a lost update.
pub struct ConflictingStore {
    pub inner: MemoryStore,
    pub conflicts: AtomicU32,
}

impl ConflictingStore {
    pub fn new(conflicts: u32) -> Self {
        Self {
            inner: MemoryStore::new(),
            conflicts: AtomicU32::new(conflicts),
        }
    }
}

#[async_trait]
impl QueueStore for ConflictingStore {
    async fn create_user(
        &self,
        name: &str,
        auth_secret: &str,
        notification_target: Option<&str>,
    ) -> Result<User> {
        self.inner
            .create_user(name, auth_secret, notification_target)
            .await
    }

    async fn user_by_token(&self, token: &str) -> Result<Option<User>> {
        self.inner.user_by_token(token).await
    }

    async fn set_notification_target(&self, user: UserId, target: Option<&str>) -> Result<()> {
        self.inner.set_notification_target(user, target).await
    }

    async fn create_queue(
        &self,
        owner: UserId,
        tasks: &[NewTask],
        now: DateTime<Utc>,
    ) -> Result<Queue> {
        self.inner.create_queue(owner, tasks, now).await
    }

    async fn queue(&self, id: QueueId) -> Result<Option<Queue>> {
        self.inner.queue(id).await
    }

    async fn queue_summaries(&self, owner: UserId) -> Result<Vec<QueueSummary>> {
        self.inner.queue_summaries(owner).await
    }

    async fn delete_queue(&self, id: QueueId) -> Result<bool> {
        self.inner.delete_queue(id).await
    }

    async fn append_tasks(
        &self,
        queue: QueueId,
        tasks: &[NewTask],
        now: DateTime<Utc>,
    ) -> Result<Bulk> {
        self.inner.append_tasks(queue, tasks, now).await
    }

    async fn claim_next(
        &self,
        queue: QueueId,
        caller: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>> {
        let remaining = self.conflicts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.conflicts.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Conflict("injected".to_string()));
        }
        self.inner.claim_next(queue, caller, now).await
    }

    async fn transition(
        &self,
        queue: QueueId,
        task: &TaskRef,
        allowed_from: &[TaskState],
        to: TaskState,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        self.inner
            .transition(queue, task, allowed_from, to, now)
            .await
    }

    async fn requeue(
        &self,
        queue: QueueId,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        self.inner.requeue(queue, token, now).await
    }

    async fn reset(
        &self,
        queue: QueueId,
        sources: &[TaskState],
        now: DateTime<Utc>,
    ) -> Result<Bulk> {
        self.inner.reset(queue, sources, now).await
    }

    async fn delete_task(&self, queue: QueueId, id: TaskId) -> Result<Option<Completion>> {
        self.inner.delete_task(queue, id).await
    }

    async fn task(&self, id: TaskId) -> Result<Option<Task>> {
        self.inner.task(id).await
    }

    async fn tasks(&self, queue: QueueId) -> Result<Vec<Task>> {
        self.inner.tasks(queue).await
    }
}
