//! Repository interface over users, queues and tasks.
//!
//! Every method is one transaction. Mutating task methods are scoped to a
//! single queue and re-derive that queue's cached `completed` flag inside the
//! same transaction, reporting how it moved as a [`Completion`].

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::*;

/// Outcome of a conditional single-task write.
#[derive(Debug, Clone)]
pub enum Transition {
    Applied {
        from: TaskState,
        task: Task,
        completion: Completion,
    },
    /// The task exists but its current state is not an allowed source.
    Rejected(TaskState),
    Missing,
}

/// Outcome of a bulk write over a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bulk {
    pub affected: u64,
    pub completion: Completion,
}

/// Durable, transactional storage for users, queues and tasks.
#[async_trait]
pub trait QueueStore: Send + Sync {
    // --- users -------------------------------------------------------------

    /// Create a user with a freshly generated token.
    async fn create_user(
        &self,
        name: &str,
        auth_secret: &str,
        notification_target: Option<&str>,
    ) -> Result<User>;

    async fn user_by_token(&self, token: &str) -> Result<Option<User>>;

    async fn set_notification_target(&self, user: UserId, target: Option<&str>) -> Result<()>;

    // --- queues ------------------------------------------------------------

    /// Insert a queue and its tasks atomically, tasks in slice order.
    async fn create_queue(
        &self,
        owner: UserId,
        tasks: &[NewTask],
        now: DateTime<Utc>,
    ) -> Result<Queue>;

    async fn queue(&self, id: QueueId) -> Result<Option<Queue>>;

    /// Summaries of every queue owned by `owner`, ordered by queue id.
    async fn queue_summaries(&self, owner: UserId) -> Result<Vec<QueueSummary>>;

    /// Delete a queue and all its tasks. False if it did not exist.
    async fn delete_queue(&self, id: QueueId) -> Result<bool>;

    // --- tasks -------------------------------------------------------------

    /// Append tasks whose token is not yet present in the queue.
    async fn append_tasks(
        &self,
        queue: QueueId,
        tasks: &[NewTask],
        now: DateTime<Utc>,
    ) -> Result<Bulk>;

    /// Move the lowest-id Waiting task to Assigned and return it.
    ///
    /// Returns `Error::Conflict` when another claimer captured the selected
    /// row first; callers retry the selection.
    async fn claim_next(
        &self,
        queue: QueueId,
        caller: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>>;

    /// Set one task to `to` if its current state is in `allowed_from`.
    async fn transition(
        &self,
        queue: QueueId,
        task: &TaskRef,
        allowed_from: &[TaskState],
        to: TaskState,
        now: DateTime<Utc>,
    ) -> Result<Transition>;

    /// Replace the task for `token` with a new Waiting row at the tail.
    /// Done tasks are rejected.
    async fn requeue(&self, queue: QueueId, token: &str, now: DateTime<Utc>)
    -> Result<Transition>;

    /// Return every task whose state is in `sources` to Waiting.
    async fn reset(
        &self,
        queue: QueueId,
        sources: &[TaskState],
        now: DateTime<Utc>,
    ) -> Result<Bulk>;

    /// Delete one task. None if it is not in `queue`.
    async fn delete_task(&self, queue: QueueId, id: TaskId) -> Result<Option<Completion>>;

    async fn task(&self, id: TaskId) -> Result<Option<Task>>;

    /// All tasks of a queue ordered by id.
    async fn tasks(&self, queue: QueueId) -> Result<Vec<Task>>;
}

/// Generate a user token.
pub(crate) fn new_user_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
