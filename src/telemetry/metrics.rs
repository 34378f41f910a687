//! Metric instrument factories for runq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"runq"` meter. These mirror
//! the store-side scalar counters, which stay the source of truth for the
//! status surface.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for runq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("runq")
}

/// Counter: runs submitted.
/// Labels: `kind`, `result` ("ok" | "duplicate").
pub fn runs_submitted() -> Counter<u64> {
    meter()
        .u64_counter("runq.runs.submitted")
        .with_description("Number of runs submitted")
        .build()
}

/// Counter: runs executed to success.
/// Labels: `kind`.
pub fn runs_processed() -> Counter<u64> {
    meter()
        .u64_counter("runq.runs.processed")
        .with_description("Number of runs that succeeded")
        .build()
}

/// Counter: runs that exhausted their retry budget or failed permanently.
/// Labels: `kind`.
pub fn runs_failed() -> Counter<u64> {
    meter()
        .u64_counter("runq.runs.failed")
        .with_description("Number of runs that failed terminally")
        .build()
}

/// Counter: queue-level operations outside the normal flow.
/// Labels: `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("runq.queue.operations")
        .with_description("Number of notable queue operations")
        .build()
}

/// Histogram: run execution duration in milliseconds.
/// Labels: `kind`.
pub fn run_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("runq.run.duration_ms")
        .with_description("Run execution duration in milliseconds")
        .with_unit("ms")
        .build()
}
