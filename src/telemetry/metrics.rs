//! Metric instrument factories for task-singleton.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"task-singleton"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for task-singleton instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("task-singleton")
}

/// Counter: submissions by how they resolved.
/// Labels: `task`, `result` ("submitted" | "attached" | "duplicate" | "error" | "contended").
pub fn submissions() -> Counter<u64> {
    meter()
        .u64_counter("singleton.submissions")
        .with_description("Number of submissions by resolution")
        .build()
}

/// Counter: lock backend operations.
/// Labels: `operation` ("lock" | "unlock" | "get" | "clear" | "scan"), `result`.
pub fn lock_operations() -> Counter<u64> {
    meter()
        .u64_counter("singleton.lock.operations")
        .with_description("Number of lock backend operations")
        .build()
}

/// Counter: acquire attempts repeated because the holder released between
/// a failed acquire and the owner read.
/// Labels: `task`.
pub fn race_retries() -> Counter<u64> {
    meter()
        .u64_counter("singleton.race.retries")
        .with_description("Acquire attempts retried after a concurrent release")
        .build()
}

/// Counter: locks released early by terminal events or stale-lock challenges.
/// Labels: `outcome` ("success" | "failure" | "submit_failed" | "stale" | "manual").
pub fn lock_releases() -> Counter<u64> {
    meter()
        .u64_counter("singleton.lock.releases")
        .with_description("Number of locks released before expiry")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("singleton.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
