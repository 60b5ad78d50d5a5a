//! `QueueStore` over Postgres.
//!
//! Mutations that can move a queue's completion lock the queue row first,
//! which serialises them per queue and lets the pending-task check read every
//! previously committed change. Claims skip that lock: they only move
//! Waiting to Assigned, so completion cannot change.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgConnection;

use super::Db;
use crate::error::{Error, Result};
use crate::model::*;
use crate::store::{Bulk, QueueStore, Transition, new_user_token};

const TASK_COLUMNS: &str = "id, queue_id, token, label, state, last_changed_at, last_caller";

fn state_names(states: &[TaskState]) -> Vec<String> {
    states.iter().map(|s| s.to_string()).collect()
}

/// Lock the queue row for the rest of the transaction. Returns the cached
/// completion flag, or None if the queue does not exist.
async fn lock_queue(conn: &mut PgConnection, queue: QueueId) -> Result<Option<bool>> {
    let row: Option<(bool,)> =
        sqlx::query_as("SELECT completed FROM queues WHERE id = $1 FOR UPDATE")
            .bind(queue.0)
            .fetch_optional(conn)
            .await?;
    Ok(row.map(|(completed,)| completed))
}

/// Re-derive the completion flag after a mutation under `lock_queue`.
async fn sync_completion(
    conn: &mut PgConnection,
    queue: QueueId,
    was_completed: bool,
) -> Result<Completion> {
    let (drained,): (bool,) = sqlx::query_as(
        "SELECT NOT EXISTS (
            SELECT 1 FROM tasks WHERE queue_id = $1 AND state IN ('waiting', 'assigned')
         )",
    )
    .bind(queue.0)
    .fetch_one(&mut *conn)
    .await?;

    let change = Completion::between(was_completed, drained);
    if change != Completion::Unchanged {
        sqlx::query("UPDATE queues SET completed = $2 WHERE id = $1")
            .bind(queue.0)
            .bind(drained)
            .execute(conn)
            .await?;
    }
    Ok(change)
}

async fn insert_tasks(
    conn: &mut PgConnection,
    queue: QueueId,
    tasks: &[NewTask],
    now: DateTime<Utc>,
) -> Result<u64> {
    let mut inserted = 0;
    // One statement per row keeps ids in slice order.
    for task in tasks {
        inserted += sqlx::query(
            "INSERT INTO tasks (queue_id, token, label, state, last_changed_at)
             VALUES ($1, $2, $3, 'waiting', $4)
             ON CONFLICT (queue_id, token) DO NOTHING",
        )
        .bind(queue.0)
        .bind(&task.token)
        .bind(&task.label)
        .bind(now)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    }
    Ok(inserted)
}

#[async_trait]
impl QueueStore for Db {
    async fn create_user(
        &self,
        name: &str,
        auth_secret: &str,
        notification_target: Option<&str>,
    ) -> Result<User> {
        let row: Option<UserRow> = sqlx::query_as(
            "INSERT INTO users (name, token, auth_secret, notification_target)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (name) DO NOTHING
             RETURNING id, name, token, auth_secret, notification_target",
        )
        .bind(name)
        .bind(new_user_token())
        .bind(auth_secret)
        .bind(notification_target)
        .fetch_optional(&self.pool)
        .await?;

        row.map(UserRow::into_user)
            .ok_or_else(|| Error::Validation(format!("user name {name} already taken")))
    }

    async fn user_by_token(&self, token: &str) -> Result<Option<User>> {
        let row: Option<UserRow> = sqlx::query_as(
            "SELECT id, name, token, auth_secret, notification_target FROM users WHERE token = $1",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(UserRow::into_user))
    }

    async fn set_notification_target(&self, user: UserId, target: Option<&str>) -> Result<()> {
        let rows = sqlx::query("UPDATE users SET notification_target = $2 WHERE id = $1")
            .bind(user.0)
            .bind(target)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if rows == 0 {
            return Err(Error::NotFound(format!("user {user}")));
        }
        Ok(())
    }

    async fn create_queue(
        &self,
        owner: UserId,
        tasks: &[NewTask],
        now: DateTime<Utc>,
    ) -> Result<Queue> {
        let mut tx = self.pool.begin().await?;
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO queues (owner_id, created_at, completed) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(owner.0)
        .bind(now)
        .bind(tasks.is_empty())
        .fetch_one(&mut *tx)
        .await?;
        insert_tasks(&mut tx, QueueId(id), tasks, now).await?;
        tx.commit().await?;

        Ok(Queue {
            id: QueueId(id),
            owner,
            created_at: now,
            completed: tasks.is_empty(),
        })
    }

    async fn queue(&self, id: QueueId) -> Result<Option<Queue>> {
        let row: Option<(i64, i64, DateTime<Utc>, bool)> =
            sqlx::query_as("SELECT id, owner_id, created_at, completed FROM queues WHERE id = $1")
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id, owner, created_at, completed)| Queue {
            id: QueueId(id),
            owner: UserId(owner),
            created_at,
            completed,
        }))
    }

    async fn queue_summaries(&self, owner: UserId) -> Result<Vec<QueueSummary>> {
        let rows: Vec<SummaryRow> = sqlx::query_as(
            "SELECT q.id, q.created_at, q.completed,
                    COUNT(t.id) FILTER (WHERE t.state = 'waiting')  AS waiting,
                    COUNT(t.id) FILTER (WHERE t.state = 'assigned') AS assigned,
                    COUNT(t.id) FILTER (WHERE t.state = 'done')     AS done,
                    COUNT(t.id) FILTER (WHERE t.state = 'error')    AS error,
                    MAX(t.last_changed_at)                          AS changed_at
             FROM queues q
             LEFT JOIN tasks t ON t.queue_id = q.id
             WHERE q.owner_id = $1
             GROUP BY q.id
             ORDER BY q.id",
        )
        .bind(owner.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(SummaryRow::into_summary).collect())
    }

    async fn delete_queue(&self, id: QueueId) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        if lock_queue(&mut tx, id).await?.is_none() {
            return Ok(false);
        }
        sqlx::query("DELETE FROM tasks WHERE queue_id = $1")
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM queues WHERE id = $1")
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn append_tasks(
        &self,
        queue: QueueId,
        tasks: &[NewTask],
        now: DateTime<Utc>,
    ) -> Result<Bulk> {
        let mut tx = self.pool.begin().await?;
        let was_completed = lock_queue(&mut tx, queue)
            .await?
            .ok_or_else(|| Error::NotFound(format!("queue {queue}")))?;
        let affected = insert_tasks(&mut tx, queue, tasks, now).await?;
        let completion = sync_completion(&mut tx, queue, was_completed).await?;
        tx.commit().await?;
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
        // Conditional update in one round trip: the outer `state = 'waiting'`
        // filter is re-checked after any row lock wait.
        let claimed: Option<TaskRow> = sqlx::query_as(&format!(
            "UPDATE tasks SET state = 'assigned', last_changed_at = $2, last_caller = $3
             WHERE id = (
                SELECT id FROM tasks
                WHERE queue_id = $1 AND state = 'waiting'
                ORDER BY id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
             ) AND state = 'waiting'
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(queue.0)
        .bind(now)
        .bind(caller)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = claimed {
            return row.try_into_task().map(Some);
        }

        // Nothing captured: either the queue is drained or every waiting row
        // was locked by a concurrent claimer.
        let (still_waiting,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM tasks WHERE queue_id = $1 AND state = 'waiting')",
        )
        .bind(queue.0)
        .fetch_one(&self.pool)
        .await?;
        if still_waiting {
            return Err(Error::Conflict(format!("claim on queue {queue} lost a race")));
        }
        Ok(None)
    }

    async fn transition(
        &self,
        queue: QueueId,
        task: &TaskRef,
        allowed_from: &[TaskState],
        to: TaskState,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        let mut tx = self.pool.begin().await?;
        let Some(was_completed) = lock_queue(&mut tx, queue).await? else {
            return Ok(Transition::Missing);
        };

        let current: Option<(i64, String)> = match task {
            TaskRef::Token(token) => {
                sqlx::query_as("SELECT id, state FROM tasks WHERE queue_id = $1 AND token = $2")
                    .bind(queue.0)
                    .bind(token)
                    .fetch_optional(&mut *tx)
                    .await?
            }
            TaskRef::Id(id) => {
                sqlx::query_as("SELECT id, state FROM tasks WHERE queue_id = $1 AND id = $2")
                    .bind(queue.0)
                    .bind(id.0)
                    .fetch_optional(&mut *tx)
                    .await?
            }
        };
        let Some((id, state)) = current else {
            return Ok(Transition::Missing);
        };
        let state: TaskState = state.parse()?;
        if !allowed_from.contains(&state) {
            return Ok(Transition::Rejected(state));
        }

        // Claims do not take the queue lock, so guard on the observed state.
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "UPDATE tasks SET state = $2, last_changed_at = $3
             WHERE id = $1 AND state = $4
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(id)
        .bind(to.to_string())
        .bind(now)
        .bind(state.to_string())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Err(Error::Conflict(format!("task {id} changed state concurrently")));
        };

        let completion = sync_completion(&mut tx, queue, was_completed).await?;
        tx.commit().await?;
        Ok(Transition::Applied {
            from: state,
            task: row.try_into_task()?,
            completion,
        })
    }

    async fn requeue(
        &self,
        queue: QueueId,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        let mut tx = self.pool.begin().await?;
        let Some(was_completed) = lock_queue(&mut tx, queue).await? else {
            return Ok(Transition::Missing);
        };

        let removed: Option<(String, String)> = sqlx::query_as(
            "DELETE FROM tasks WHERE queue_id = $1 AND token = $2 AND state <> 'done'
             RETURNING label, state",
        )
        .bind(queue.0)
        .bind(token)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((label, from)) = removed else {
            let existing: Option<(String,)> =
                sqlx::query_as("SELECT state FROM tasks WHERE queue_id = $1 AND token = $2")
                    .bind(queue.0)
                    .bind(token)
                    .fetch_optional(&mut *tx)
                    .await?;
            return match existing {
                Some((state,)) => Ok(Transition::Rejected(state.parse()?)),
                None => Ok(Transition::Missing),
            };
        };

        let row: TaskRow = sqlx::query_as(&format!(
            "INSERT INTO tasks (queue_id, token, label, state, last_changed_at)
             VALUES ($1, $2, $3, 'waiting', $4)
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(queue.0)
        .bind(token)
        .bind(&label)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        let completion = sync_completion(&mut tx, queue, was_completed).await?;
        tx.commit().await?;
        Ok(Transition::Applied {
            from: from.parse()?,
            task: row.try_into_task()?,
            completion,
        })
    }

    async fn reset(
        &self,
        queue: QueueId,
        sources: &[TaskState],
        now: DateTime<Utc>,
    ) -> Result<Bulk> {
        let mut tx = self.pool.begin().await?;
        let was_completed = lock_queue(&mut tx, queue)
            .await?
            .ok_or_else(|| Error::NotFound(format!("queue {queue}")))?;

        let affected = sqlx::query(
            "UPDATE tasks SET state = 'waiting', last_changed_at = $2
             WHERE queue_id = $1 AND state = ANY($3)",
        )
        .bind(queue.0)
        .bind(now)
        .bind(state_names(sources))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let completion = sync_completion(&mut tx, queue, was_completed).await?;
        tx.commit().await?;
        Ok(Bulk {
            affected,
            completion,
        })
    }

    async fn delete_task(&self, queue: QueueId, id: TaskId) -> Result<Option<Completion>> {
        let mut tx = self.pool.begin().await?;
        let Some(was_completed) = lock_queue(&mut tx, queue).await? else {
            return Ok(None);
        };
        let rows = sqlx::query("DELETE FROM tasks WHERE id = $1 AND queue_id = $2")
            .bind(id.0)
            .bind(queue.0)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if rows == 0 {
            return Ok(None);
        }
        let completion = sync_completion(&mut tx, queue, was_completed).await?;
        tx.commit().await?;
        Ok(Some(completion))
    }

    async fn task(&self, id: TaskId) -> Result<Option<Task>> {
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;
        row.map(TaskRow::try_into_task).transpose()
    }

    async fn tasks(&self, queue: QueueId) -> Result<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE queue_id = $1 ORDER BY id"
        ))
        .bind(queue.0)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TaskRow::try_into_task).collect()
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct UserRow {
    id: i64,
    name: String,
    token: String,
    auth_secret: String,
    notification_target: Option<String>,
}

impl UserRow {
    fn into_user(self) -> User {
        User {
            id: UserId(self.id),
            name: self.name,
            token: self.token,
            auth_secret: self.auth_secret,
            notification_target: self.notification_target,
        }
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: i64,
    queue_id: i64,
    token: String,
    label: String,
    state: String,
    last_changed_at: DateTime<Utc>,
    last_caller: Option<String>,
}

impl TaskRow {
    fn try_into_task(self) -> Result<Task> {
        Ok(Task {
            id: TaskId(self.id),
            queue_id: QueueId(self.queue_id),
            token: self.token,
            label: self.label,
            state: self.state.parse()?,
            last_changed_at: self.last_changed_at,
            last_caller: self.last_caller,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SummaryRow {
    id: i64,
    created_at: DateTime<Utc>,
    completed: bool,
    waiting: i64,
    assigned: i64,
    done: i64,
    error: i64,
    changed_at: Option<DateTime<Utc>>,
}

impl SummaryRow {
    fn into_summary(self) -> QueueSummary {
        QueueSummary {
            queue_id: QueueId(self.id),
            counts: StateCounts {
                waiting: self.waiting as u64,
                assigned: self.assigned as u64,
                done: self.done as u64,
                error: self.error as u64,
            },
            completed: self.completed,
            created_at: self.created_at,
            changed_at: self.changed_at.unwrap_or(self.created_at),
        }
    }
}
