//! Metric instrument factories for taskq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"taskq"` meter.

use opentelemetry::metrics::{Counter, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("taskq")
}

/// Counter: tasks inserted by submit/append/put-back.
/// Labels: `operation`.
pub fn tasks_created() -> Counter<u64> {
    meter()
        .u64_counter("taskq.tasks.created")
        .with_description("Number of tasks inserted")
        .build()
}

/// Counter: claim attempts.
/// Labels: `result` ("assigned" | "empty" | "conflict").
pub fn claims() -> Counter<u64> {
    meter()
        .u64_counter("taskq.claims")
        .with_description("Number of claim attempts by result")
        .build()
}

/// Counter: task state transitions.
/// Labels: `from`, `to`.
pub fn state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("taskq.tasks.state_transitions")
        .with_description("Number of task state transitions")
        .build()
}

/// Counter: completion notifications.
/// Labels: `result` ("sent" | "failed" | "timeout" | "no_target").
pub fn notifications() -> Counter<u64> {
    meter()
        .u64_counter("taskq.notifications")
        .with_description("Completion notifications by delivery result")
        .build()
}
