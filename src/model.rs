//! Core data model.
//!
//! A user owns queues; a queue owns an ordered set of tasks. Queues never
//! hold task objects, only an id the store resolves to tasks ordered by
//! creation id.

pub mod submission;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use submission::{NewTask, parse_submission};

// ---------------------------------------------------------------------------
// Ids
// ---------------------------------------------------------------------------

macro_rules! id_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse().map(Self)
            }
        }
    };
}

id_newtype!(
    /// User identity.
    UserId
);
id_newtype!(
    /// Queue identity.
    QueueId
);
id_newtype!(
    /// Task identity. Allocated from a monotonically increasing sequence, so
    /// ascending id is creation order and doubles as the FIFO key.
    TaskId
);

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// An account that owns queues.
#[derive(Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    /// Bearer token presented by workers and scripts.
    pub token: String,
    #[serde(skip)]
    pub auth_secret: String,
    /// Push destination for completion notices. None disables them.
    pub notification_target: Option<String>,
}

impl std::fmt::Debug for User {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("User")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("notification_target", &self.notification_target)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// A batch of tasks submitted together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Queue {
    pub id: QueueId,
    pub owner: UserId,
    pub created_at: DateTime<Utc>,
    /// Cached "no task is Waiting or Assigned". Re-derived by the store in
    /// the same transaction as every task mutation.
    pub completed: bool,
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// One unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub queue_id: QueueId,
    /// Payload identifier handed to the worker. Unique within a queue.
    pub token: String,
    pub label: String,
    pub state: TaskState,
    pub last_changed_at: DateTime<Utc>,
    pub last_caller: Option<String>,
}

/// How a store operation addresses a single task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskRef {
    Token(String),
    Id(TaskId),
}

impl std::fmt::Display for TaskRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskRef::Token(token) => write!(f, "token {token}"),
            TaskRef::Id(id) => write!(f, "task {id}"),
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Ready to be claimed.
    Waiting,
    /// Handed to a worker.
    Assigned,
    /// Finished successfully. Terminal.
    Done,
    /// Worker reported failure. Recoverable via reset.
    Error,
}

impl TaskState {
    pub const ALL: [TaskState; 4] = [
        TaskState::Waiting,
        TaskState::Assigned,
        TaskState::Done,
        TaskState::Error,
    ];

    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, to),
            (Waiting, Assigned)     // claim
                | (Assigned, Done)
                | (Assigned, Error)
                | (Assigned, Waiting) // reset, or a worker giving the task back
                | (Error, Waiting)    // reset
                | (Error, Done) // late success report
        )
    }

    /// States from which a report may move a task into `to`. Claim is the
    /// only way into Assigned, so reporting it yields no sources.
    pub fn report_sources(to: TaskState) -> Vec<TaskState> {
        if to == TaskState::Assigned {
            return Vec::new();
        }
        Self::ALL
            .into_iter()
            .filter(|from| from.can_transition_to(to))
            .collect()
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done)
    }

    /// Waiting or Assigned: the queue is not complete while any task is pending.
    pub fn is_pending(self) -> bool {
        matches!(self, TaskState::Waiting | TaskState::Assigned)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Waiting => "waiting",
            TaskState::Assigned => "assigned",
            TaskState::Done => "done",
            TaskState::Error => "error",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskState {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "waiting" => Ok(TaskState::Waiting),
            "assigned" => Ok(TaskState::Assigned),
            "done" => Ok(TaskState::Done),
            "error" => Ok(TaskState::Error),
            _ => Err(crate::error::Error::Validation(format!(
                "unknown task state: {s}"
            ))),
        }
    }
}

/// Which tasks a bulk reset returns to Waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetScope {
    AssignedOnly,
    ErrorOnly,
    AllNonDone,
}

impl ResetScope {
    pub fn sources(self) -> &'static [TaskState] {
        match self {
            ResetScope::AssignedOnly => &[TaskState::Assigned],
            ResetScope::ErrorOnly => &[TaskState::Error],
            ResetScope::AllNonDone => &[TaskState::Assigned, TaskState::Error],
        }
    }
}

impl std::str::FromStr for ResetScope {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "assigned" => Ok(ResetScope::AssignedOnly),
            "error" => Ok(ResetScope::ErrorOnly),
            "all" => Ok(ResetScope::AllNonDone),
            _ => Err(crate::error::Error::Validation(format!(
                "unknown reset scope: {s} (expected assigned, error or all)"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

/// How a mutation moved the queue's cached `completed` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Unchanged,
    /// The last pending task left Waiting/Assigned. Triggers a notification.
    BecameComplete,
    BecameIncomplete,
}

impl Completion {
    /// Compare the cached flag with the freshly derived one.
    pub fn between(was_completed: bool, now_completed: bool) -> Self {
        match (was_completed, now_completed) {
            (false, true) => Completion::BecameComplete,
            (true, false) => Completion::BecameIncomplete,
            _ => Completion::Unchanged,
        }
    }
}

// ---------------------------------------------------------------------------
// Read projections
// ---------------------------------------------------------------------------

/// Per-state task counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub waiting: u64,
    pub assigned: u64,
    pub done: u64,
    pub error: u64,
}

impl StateCounts {
    pub fn add(&mut self, state: TaskState, n: u64) {
        match state {
            TaskState::Waiting => self.waiting += n,
            TaskState::Assigned => self.assigned += n,
            TaskState::Done => self.done += n,
            TaskState::Error => self.error += n,
        }
    }

    pub fn pending(&self) -> u64 {
        self.waiting + self.assigned
    }

    pub fn total(&self) -> u64 {
        self.waiting + self.assigned + self.done + self.error
    }
}

impl<'a> FromIterator<&'a Task> for StateCounts {
    fn from_iter<I: IntoIterator<Item = &'a Task>>(iter: I) -> Self {
        let mut counts = StateCounts::default();
        for task in iter {
            counts.add(task.state, 1);
        }
        counts
    }
}

impl std::fmt::Display for StateCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} waiting, {} assigned, {} done, {} error",
            self.waiting, self.assigned, self.done, self.error
        )
    }
}

/// One row of `list_queues`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSummary {
    pub queue_id: QueueId,
    pub counts: StateCounts,
    pub completed: bool,
    pub created_at: DateTime<Utc>,
    /// Latest task change in this queue, or `created_at` when it has no tasks.
    pub changed_at: DateTime<Utc>,
}

impl QueueSummary {
    pub fn from_tasks(queue: &Queue, tasks: &[Task]) -> Self {
        Self {
            queue_id: queue.id,
            counts: tasks.iter().collect(),
            completed: queue.completed,
            created_at: queue.created_at,
            changed_at: tasks
                .iter()
                .map(|t| t.last_changed_at)
                .max()
                .unwrap_or(queue.created_at),
        }
    }
}

/// One row of `list_tasks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskView {
    pub id: TaskId,
    pub label: String,
    pub token: String,
    pub state: TaskState,
    pub changed_at: DateTime<Utc>,
    pub caller: Option<String>,
}

impl From<Task> for TaskView {
    fn from(task: Task) -> Self {
        Self {
            id: task.id,
            label: task.label,
            token: task.token,
            state: task.state,
            changed_at: task.last_changed_at,
            caller: task.last_caller,
        }
    }
}

/// What a worker receives from `claim`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claimed {
    pub token: String,
    pub label: String,
}
