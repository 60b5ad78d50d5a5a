//! # taskq
//!
//! Multi-tenant work distribution. A user submits a batch of tasks as a
//! queue; workers claim one task at a time, report the result, and the
//! owner is notified once the queue drains.
//!
//! The engine runs against any `QueueStore`: Postgres in production
//! ([`db::Db`]) or in process memory for tests ([`store::MemoryStore`]).

pub mod auth;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod model;
pub mod notify;
pub mod store;
pub mod telemetry;
