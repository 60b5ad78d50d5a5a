//! Span helpers for engine operations.

use tracing::Span;

use crate::model::QueueId;

/// Start a span for one engine operation. `queue.id` is empty for
/// operations that create the queue or are not queue-scoped; fill it with
/// [`record_queue`].
pub fn start_op_span(op: &'static str, queue: Option<QueueId>) -> Span {
    let span = tracing::info_span!(
        "queue.op",
        "queue.op" = op,
        "queue.id" = tracing::field::Empty,
        "user.id" = tracing::field::Empty,
    );
    if let Some(queue) = queue {
        record_queue(&span, queue);
    }
    span
}

pub fn record_queue(span: &Span, queue: QueueId) {
    span.record("queue.id", queue.0);
}

pub fn record_user(span: &Span, user: crate::model::UserId) {
    span.record("user.id", user.0);
}

/// Emit a task transition event inside `span`.
pub fn record_state_transition(span: &Span, token: &str, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::info!(token, from, to, "state_transition");
    });
}
