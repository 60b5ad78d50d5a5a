//! In-memory store for tests and throwaway runs.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{Bulk, QueueStore, Transition, new_user_token};
use crate::error::{Error, Result};
use crate::model::*;

/// In-memory state. Tasks live in one id-ordered map, so iterating a
/// queue's tasks is FIFO order.
#[derive(Default)]
struct Inner {
    users: HashMap<UserId, User>,
    queues: BTreeMap<QueueId, Queue>,
    tasks: BTreeMap<TaskId, Task>,
    next_id: i64,
}

impl Inner {
    fn allocate(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn queue_tasks(&self, queue: QueueId) -> impl Iterator<Item = &Task> {
        self.tasks.values().filter(move |t| t.queue_id == queue)
    }

    fn find(&self, queue: QueueId, task: &TaskRef) -> Option<TaskId> {
        match task {
            TaskRef::Id(id) => self
                .tasks
                .get(id)
                .filter(|t| t.queue_id == queue)
                .map(|t| t.id),
            TaskRef::Token(token) => self
                .queue_tasks(queue)
                .find(|t| &t.token == token)
                .map(|t| t.id),
        }
    }

    fn insert_task(&mut self, queue: QueueId, new: &NewTask, now: DateTime<Utc>) -> TaskId {
        let id = TaskId(self.allocate());
        self.tasks.insert(
            id,
            Task {
                id,
                queue_id: queue,
                token: new.token.clone(),
                label: new.label.clone(),
                state: TaskState::Waiting,
                last_changed_at: now,
                last_caller: None,
            },
        );
        id
    }

    /// Re-derive the cached completion flag for `queue`.
    fn sync_completion(&mut self, queue: QueueId) -> Completion {
        let drained = !self.queue_tasks(queue).any(|t| t.state.is_pending());
        match self.queues.get_mut(&queue) {
            Some(q) => {
                let change = Completion::between(q.completed, drained);
                q.completed = drained;
                change
            }
            None => Completion::Unchanged,
        }
    }

    fn require_queue(&self, queue: QueueId) -> Result<()> {
        if self.queues.contains_key(&queue) {
            Ok(())
        } else {
            Err(Error::NotFound(format!("queue {queue}")))
        }
    }
}

/// `QueueStore` backed by process memory. A single mutex serialises every
/// operation, which makes each one trivially atomic.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn create_user(
        &self,
        name: &str,
        auth_secret: &str,
        notification_target: Option<&str>,
    ) -> Result<User> {
        let mut inner = self.inner.lock().await;
        if inner.users.values().any(|u| u.name == name) {
            return Err(Error::Validation(format!("user name {name} already taken")));
        }
        let user = User {
            id: UserId(inner.allocate()),
            name: name.to_string(),
            token: new_user_token(),
            auth_secret: auth_secret.to_string(),
            notification_target: notification_target.map(str::to_string),
        };
        inner.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn user_by_token(&self, token: &str) -> Result<Option<User>> {
        let inner = self.inner.lock().await;
        Ok(inner.users.values().find(|u| u.token == token).cloned())
    }

    async fn set_notification_target(&self, user: UserId, target: Option<&str>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let user = inner
            .users
            .get_mut(&user)
            .ok_or_else(|| Error::NotFound(format!("user {user}")))?;
        user.notification_target = target.map(str::to_string);
        Ok(())
    }

    async fn create_queue(
        &self,
        owner: UserId,
        tasks: &[NewTask],
        now: DateTime<Utc>,
    ) -> Result<Queue> {
        let mut inner = self.inner.lock().await;
        let queue = Queue {
            id: QueueId(inner.allocate()),
            owner,
            created_at: now,
            completed: tasks.is_empty(),
        };
        inner.queues.insert(queue.id, queue.clone());
        for new in tasks {
            inner.insert_task(queue.id, new, now);
        }
        Ok(queue)
    }

    async fn queue(&self, id: QueueId) -> Result<Option<Queue>> {
        let inner = self.inner.lock().await;
        Ok(inner.queues.get(&id).cloned())
    }

    async fn queue_summaries(&self, owner: UserId) -> Result<Vec<QueueSummary>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .queues
            .values()
            .filter(|q| q.owner == owner)
            .map(|q| {
                let tasks: Vec<Task> = inner.queue_tasks(q.id).cloned().collect();
                QueueSummary::from_tasks(q, &tasks)
            })
            .collect())
    }

    async fn delete_queue(&self, id: QueueId) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.queues.remove(&id).is_none() {
            return Ok(false);
        }
        inner.tasks.retain(|_, t| t.queue_id != id);
        Ok(true)
    }

    async fn append_tasks(
        &self,
        queue: QueueId,
        tasks: &[NewTask],
        now: DateTime<Utc>,
    ) -> Result<Bulk> {
        let mut inner = self.inner.lock().await;
        inner.require_queue(queue)?;
        let mut affected = 0;
        for new in tasks {
            if inner.queue_tasks(queue).any(|t| t.token == new.token) {
                continue;
            }
            inner.insert_task(queue, new, now);
            affected += 1;
        }
        let completion = inner.sync_completion(queue);
        Ok(Bulk {
            affected,
            completion,
        })
    }

    async fn claim_next(
        &self,
        queue: QueueId,
        caller: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>> {
        let mut inner = self.inner.lock().await;
        inner.require_queue(queue)?;
        let Some(task) = inner
            .tasks
            .values_mut()
            .find(|t| t.queue_id == queue && t.state == TaskState::Waiting)
        else {
            return Ok(None);
        };
        task.state = TaskState::Assigned;
        task.last_changed_at = now;
        task.last_caller = caller.map(str::to_string);
        Ok(Some(task.clone()))
    }

    async fn transition(
        &self,
        queue: QueueId,
        task: &TaskRef,
        allowed_from: &[TaskState],
        to: TaskState,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        let mut inner = self.inner.lock().await;
        let Some(id) = inner.find(queue, task) else {
            return Ok(Transition::Missing);
        };
        let Some(row) = inner.tasks.get_mut(&id) else {
            return Ok(Transition::Missing);
        };
        if !allowed_from.contains(&row.state) {
            return Ok(Transition::Rejected(row.state));
        }
        let from = row.state;
        row.state = to;
        row.last_changed_at = now;
        let task = row.clone();
        let completion = inner.sync_completion(queue);
        Ok(Transition::Applied {
            from,
            task,
            completion,
        })
    }

    async fn requeue(
        &self,
        queue: QueueId,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        let mut inner = self.inner.lock().await;
        let Some(id) = inner.find(queue, &TaskRef::Token(token.to_string())) else {
            return Ok(Transition::Missing);
        };
        let Some(old) = inner.tasks.remove(&id) else {
            return Ok(Transition::Missing);
        };
        if old.state.is_terminal() {
            let state = old.state;
            inner.tasks.insert(id, old);
            return Ok(Transition::Rejected(state));
        }
        let from = old.state;
        let new_id = inner.insert_task(queue, &NewTask::new(old.label, old.token), now);
        let completion = inner.sync_completion(queue);
        let task = inner.tasks[&new_id].clone();
        Ok(Transition::Applied {
            from,
            task,
            completion,
        })
    }

    async fn reset(
        &self,
        queue: QueueId,
        sources: &[TaskState],
        now: DateTime<Utc>,
    ) -> Result<Bulk> {
        let mut inner = self.inner.lock().await;
        inner.require_queue(queue)?;
        let mut affected = 0;
        for task in inner.tasks.values_mut() {
            if task.queue_id == queue && sources.contains(&task.state) {
                task.state = TaskState::Waiting;
                task.last_changed_at = now;
                affected += 1;
            }
        }
        let completion = inner.sync_completion(queue);
        Ok(Bulk {
            affected,
            completion,
        })
    }

    async fn delete_task(&self, queue: QueueId, id: TaskId) -> Result<Option<Completion>> {
        let mut inner = self.inner.lock().await;
        if inner.find(queue, &TaskRef::Id(id)).is_none() {
            return Ok(None);
        }
        inner.tasks.remove(&id);
        Ok(Some(inner.sync_completion(queue)))
    }

    async fn task(&self, id: TaskId) -> Result<Option<Task>> {
        let inner = self.inner.lock().await;
        Ok(inner.tasks.get(&id).cloned())
    }

    async fn tasks(&self, queue: QueueId) -> Result<Vec<Task>> {
        let inner = self.inner.lock().await;
        Ok(inner.queue_tasks(queue).cloned().collect())
    }
}
