//! # task-singleton
//!
//! Deduplication of concurrent task submissions through a distributed lock.
//!
//! A submission is fingerprinted into a lock key. The first submitter to
//! create the lock record runs the work; everyone else attaches to the
//! execution recorded in it. Locks are released when the execution
//! finishes, with an optional TTL as a safety net.
//!
//! Provides the lock backends (Redis, in-memory), the dispatcher with its
//! acquire/attach race loop, terminal-event release, and OpenTelemetry
//! observability.

pub mod backend;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fingerprint;
pub mod inspect;
pub mod lifecycle;
pub mod locks;
pub mod model;
pub mod telemetry;

pub use dispatch::{Dispatcher, RaceRetry, SubmitResult, Submitter};
pub use error::{Error, Result};
pub use locks::Locks;
