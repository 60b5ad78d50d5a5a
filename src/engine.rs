//! Task queue engine. The public API for submitting and distributing work.
//!
//! Every operation resolves the caller through the `AuthGate`, checks queue
//! ownership, performs exactly one store mutation, and then, if that mutation
//! drained the queue, hands the completion notice to a background task. No
//! operation waits for delivery; `flush_notifications` drains pending ones.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use opentelemetry::KeyValue;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, Span, debug, info, warn};

use crate::auth::{AuthGate, TokenGate};
use crate::error::{Error, Result};
use crate::model::*;
use crate::notify::{Message, NotificationDispatcher};
use crate::store::{QueueStore, Transition};
use crate::telemetry::metrics;
use crate::telemetry::queue::{record_queue, record_state_transition, record_user, start_op_span};

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How many lost-update conflicts a single claim absorbs before failing.
    pub claim_retries: u32,
    /// Upper bound on one background notification attempt.
    pub notify_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            claim_retries: 16,
            notify_timeout: Duration::from_secs(5),
        }
    }
}

/// The task queue engine. Owns handles to its collaborators; cheap to clone.
#[derive(Clone)]
pub struct TaskQueueEngine {
    store: Arc<dyn QueueStore>,
    auth: Arc<dyn AuthGate>,
    notifier: Arc<dyn NotificationDispatcher>,
    config: EngineConfig,
    notices: TaskTracker,
}

impl TaskQueueEngine {
    pub fn new(
        store: Arc<dyn QueueStore>,
        auth: Arc<dyn AuthGate>,
        notifier: Arc<dyn NotificationDispatcher>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            auth,
            notifier,
            config,
            notices: TaskTracker::new(),
        }
    }

    /// Engine that authenticates bearer tokens against the store's users.
    pub fn with_token_auth(
        store: Arc<dyn QueueStore>,
        notifier: Arc<dyn NotificationDispatcher>,
        config: EngineConfig,
    ) -> Self {
        let auth = Arc::new(TokenGate::new(Arc::clone(&store)));
        Self::new(store, auth, notifier, config)
    }

    /// Wait for every completion notice handed off so far. Call before the
    /// process exits; each notice is already bounded by `notify_timeout`.
    pub async fn flush_notifications(&self) {
        self.notices.close();
        self.notices.wait().await;
        self.notices.reopen();
    }

    // -----------------------------------------------------------------------
    // Users
    // -----------------------------------------------------------------------

    /// Create a user. Administrative: not behind the auth gate.
    pub async fn register_user(
        &self,
        name: &str,
        auth_secret: &str,
        notification_target: Option<&str>,
    ) -> Result<User> {
        if name.trim().is_empty() || name.chars().any(char::is_whitespace) {
            return Err(Error::Validation(format!("invalid user name: {name:?}")));
        }
        let user = self
            .store
            .create_user(name, auth_secret, notification_target)
            .await?;
        info!(user.id = user.id.0, user.name = %user.name, "user registered");
        Ok(user)
    }

    /// Change where the caller's completion notices go. None disables them.
    pub async fn set_notification_target(
        &self,
        credential: &str,
        target: Option<&str>,
    ) -> Result<()> {
        let user = self.auth.resolve(credential).await?;
        self.store.set_notification_target(user.id, target).await
    }

    // -----------------------------------------------------------------------
    // Queue lifecycle
    // -----------------------------------------------------------------------

    /// Create a queue from submission text.
    pub async fn submit(&self, credential: &str, text: &str) -> Result<Queue> {
        let span = start_op_span("submit", None);
        async {
            let user = self.authorize(credential).await?;
            let tasks = parse_submission(text)?;
            let queue = self.store.create_queue(user.id, &tasks, Utc::now()).await?;
            record_queue(&Span::current(), queue.id);

            metrics::tasks_created().add(
                tasks.len() as u64,
                &[KeyValue::new("operation", "submit")],
            );
            info!(queue = %queue.id, tasks = tasks.len(), "queue submitted");
            Ok(queue)
        }
        .instrument(span)
        .await
    }

    /// Add tasks to an existing queue. Tokens already in the queue are
    /// skipped. Returns how many tasks were added.
    pub async fn append(&self, credential: &str, queue: QueueId, text: &str) -> Result<u64> {
        let span = start_op_span("append", Some(queue));
        async {
            let user = self.authorize(credential).await?;
            self.owned_queue(&user, queue).await?;
            let tasks = parse_submission(text)?;

            let bulk = self.store.append_tasks(queue, &tasks, Utc::now()).await?;
            metrics::tasks_created().add(bulk.affected, &[KeyValue::new("operation", "append")]);
            info!(
                appended = bulk.affected,
                skipped = tasks.len() as u64 - bulk.affected,
                "tasks appended"
            );
            self.after_mutation(&user, queue, bulk.completion);
            Ok(bulk.affected)
        }
        .instrument(span)
        .await
    }

    /// Delete a queue and all of its tasks.
    pub async fn delete(&self, credential: &str, queue: QueueId) -> Result<()> {
        let span = start_op_span("delete", Some(queue));
        async {
            let user = self.authorize(credential).await?;
            self.owned_queue(&user, queue).await?;
            if !self.store.delete_queue(queue).await? {
                return Err(Error::NotFound(format!("queue {queue}")));
            }
            info!("queue deleted");
            Ok(())
        }
        .instrument(span)
        .await
    }

    // -----------------------------------------------------------------------
    // Worker operations
    // -----------------------------------------------------------------------

    /// Hand the earliest Waiting task to the caller.
    ///
    /// Lost updates against concurrent claimers are retried here; the caller
    /// only ever sees a task, `EmptyQueue`, or a storage failure.
    pub async fn claim(
        &self,
        credential: &str,
        queue: QueueId,
        caller: Option<&str>,
    ) -> Result<Claimed> {
        let span = start_op_span("claim", Some(queue));
        async {
            let user = self.authorize(credential).await?;
            self.owned_queue(&user, queue).await?;

            let mut conflicts = 0u32;
            loop {
                match self.store.claim_next(queue, caller, Utc::now()).await {
                    Ok(Some(task)) => {
                        metrics::claims().add(1, &[KeyValue::new("result", "assigned")]);
                        record_transition(&task.token, TaskState::Waiting, TaskState::Assigned);
                        return Ok(Claimed {
                            token: task.token,
                            label: task.label,
                        });
                    }
                    Ok(None) => {
                        metrics::claims().add(1, &[KeyValue::new("result", "empty")]);
                        return Err(Error::EmptyQueue(queue));
                    }
                    Err(Error::Conflict(reason)) => {
                        metrics::claims().add(1, &[KeyValue::new("result", "conflict")]);
                        if conflicts >= self.config.claim_retries {
                            return Err(Error::Other(format!(
                                "claim on queue {queue} gave up after {conflicts} retries: {reason}"
                            )));
                        }
                        conflicts += 1;
                        debug!(attempt = conflicts, %reason, "claim conflict, retrying");
                        tokio::time::sleep(Duration::from_millis(u64::from(conflicts))).await;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Record a worker's result for the task identified by `token`.
    pub async fn report(
        &self,
        credential: &str,
        queue: QueueId,
        token: &str,
        state: TaskState,
    ) -> Result<()> {
        let span = start_op_span("report", Some(queue));
        async {
            let user = self.authorize(credential).await?;
            self.owned_queue(&user, queue).await?;

            let sources = TaskState::report_sources(state);
            let outcome = self
                .store
                .transition(
                    queue,
                    &TaskRef::Token(token.to_string()),
                    &sources,
                    state,
                    Utc::now(),
                )
                .await?;
            let completion = applied(outcome, token, state)?;
            self.after_mutation(&user, queue, completion);
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Release a task: drop its row and requeue it as Waiting at the tail.
    pub async fn put_back(&self, credential: &str, queue: QueueId, token: &str) -> Result<()> {
        let span = start_op_span("put_back", Some(queue));
        async {
            let user = self.authorize(credential).await?;
            self.owned_queue(&user, queue).await?;

            let outcome = self.store.requeue(queue, token, Utc::now()).await?;
            let completion = applied(outcome, token, TaskState::Waiting)?;
            metrics::tasks_created().add(1, &[KeyValue::new("operation", "put_back")]);
            self.after_mutation(&user, queue, completion);
            Ok(())
        }
        .instrument(span)
        .await
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    /// Return tasks in `scope` to Waiting. Returns how many moved.
    pub async fn reset(&self, credential: &str, queue: QueueId, scope: ResetScope) -> Result<u64> {
        let span = start_op_span("reset", Some(queue));
        async {
            let user = self.authorize(credential).await?;
            self.owned_queue(&user, queue).await?;

            let bulk = self.store.reset(queue, scope.sources(), Utc::now()).await?;
            info!(?scope, reset = bulk.affected, "queue reset");
            self.after_mutation(&user, queue, bulk.completion);
            Ok(bulk.affected)
        }
        .instrument(span)
        .await
    }

    /// Return a single task to Waiting. Already-Waiting tasks are left as is.
    pub async fn reset_task(&self, credential: &str, task: TaskId) -> Result<()> {
        let span = start_op_span("reset_task", None);
        async {
            let user = self.authorize(credential).await?;
            let (queue, _) = self.owned_task(&user, task).await?;

            let outcome = self
                .store
                .transition(
                    queue,
                    &TaskRef::Id(task),
                    &[TaskState::Assigned, TaskState::Error],
                    TaskState::Waiting,
                    Utc::now(),
                )
                .await?;
            let completion = match outcome {
                Transition::Rejected(TaskState::Waiting) => return Ok(()),
                other => applied(other, &task.to_string(), TaskState::Waiting)?,
            };
            self.after_mutation(&user, queue, completion);
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Remove a single task. Removing the last pending task completes the queue.
    pub async fn delete_task(&self, credential: &str, task: TaskId) -> Result<()> {
        let span = start_op_span("delete_task", None);
        async {
            let user = self.authorize(credential).await?;
            let (queue, token) = self.owned_task(&user, task).await?;

            let completion = self
                .store
                .delete_task(queue, task)
                .await?
                .ok_or_else(|| Error::NotFound(format!("task {task}")))?;
            info!(%token, "task deleted");
            self.after_mutation(&user, queue, completion);
            Ok(())
        }
        .instrument(span)
        .await
    }

    // -----------------------------------------------------------------------
    // Read projections
    // -----------------------------------------------------------------------

    pub async fn list_queues(&self, credential: &str) -> Result<Vec<QueueSummary>> {
        let user = self.auth.resolve(credential).await?;
        self.store.queue_summaries(user.id).await
    }

    pub async fn list_tasks(&self, credential: &str, queue: QueueId) -> Result<Vec<TaskView>> {
        let user = self.auth.resolve(credential).await?;
        self.owned_queue(&user, queue).await?;
        let tasks = self.store.tasks(queue).await?;
        Ok(tasks.into_iter().map(TaskView::from).collect())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn authorize(&self, credential: &str) -> Result<User> {
        let user = self.auth.resolve(credential).await?;
        record_user(&Span::current(), user.id);
        Ok(user)
    }

    /// Load a queue the user owns. Foreign queues look exactly like missing ones.
    async fn owned_queue(&self, user: &User, queue: QueueId) -> Result<Queue> {
        self.store
            .queue(queue)
            .await?
            .filter(|q| q.owner == user.id)
            .ok_or_else(|| Error::NotFound(format!("queue {queue}")))
    }

    /// Resolve a task id to its queue, checking ownership of that queue.
    async fn owned_task(&self, user: &User, task: TaskId) -> Result<(QueueId, String)> {
        let found = self
            .store
            .task(task)
            .await?
            .ok_or_else(|| Error::NotFound(format!("task {task}")))?;
        self.owned_queue(user, found.queue_id)
            .await
            .map_err(|_| Error::NotFound(format!("task {task}")))?;
        record_queue(&Span::current(), found.queue_id);
        Ok((found.queue_id, found.token))
    }

    fn after_mutation(&self, user: &User, queue: QueueId, completion: Completion) {
        match completion {
            Completion::BecameComplete => self.notify_complete(user, queue),
            Completion::BecameIncomplete => debug!("queue reopened"),
            Completion::Unchanged => {}
        }
    }

    /// Best-effort completion notice. Spawned after the triggering
    /// transaction has committed; every failure is logged and swallowed.
    fn notify_complete(&self, user: &User, queue: QueueId) {
        info!("queue complete");
        let Some(target) = user.notification_target.clone() else {
            metrics::notifications().add(1, &[KeyValue::new("result", "no_target")]);
            return;
        };

        let store = Arc::clone(&self.store);
        let notifier = Arc::clone(&self.notifier);
        let timeout = self.config.notify_timeout;
        self.notices.spawn(
            async move {
                let counts = match store.tasks(queue).await {
                    Ok(tasks) => tasks.iter().collect(),
                    Err(e) => {
                        warn!("could not load task counts for notification: {e}");
                        StateCounts::default()
                    }
                };
                let message = Message::queue_complete(queue, &counts);

                let result =
                    match tokio::time::timeout(timeout, notifier.dispatch(&target, &message)).await
                    {
                        Ok(Ok(())) => "sent",
                        Ok(Err(e)) => {
                            warn!(destination = %target, "completion notification failed: {e}");
                            "failed"
                        }
                        Err(_) => {
                            warn!(destination = %target, "completion notification timed out");
                            "timeout"
                        }
                    };
                metrics::notifications().add(1, &[KeyValue::new("result", result)]);
            }
            .instrument(Span::current()),
        );
    }
}

/// Unwrap a single-task store outcome into its completion change, mapping
/// the refusal cases onto the engine's error taxonomy.
fn applied(outcome: Transition, task: &str, to: TaskState) -> Result<Completion> {
    match outcome {
        Transition::Applied {
            from,
            task: row,
            completion,
        } => {
            record_transition(&row.token, from, to);
            Ok(completion)
        }
        Transition::Rejected(from) => Err(Error::InvalidTransition { from, to }),
        Transition::Missing => Err(Error::NotFound(format!("task {task}"))),
    }
}

fn record_transition(token: &str, from: TaskState, to: TaskState) {
    metrics::state_transitions().add(
        1,
        &[
            KeyValue::new("from", from.to_string()),
            KeyValue::new("to", to.to_string()),
        ],
    );
    record_state_transition(&Span::current(), token, from.as_str(), to.as_str());
}
