//! Metric instruments for labpipe.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without an exporter configured these are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("labpipe")
}

/// Counter: work cache lookups.
/// Labels: `work_type`, `result` ("hit" | "miss" | "coalesced").
pub fn cache_lookups() -> Counter<u64> {
    meter()
        .u64_counter("labpipe.cache.lookups")
        .with_description("Work cache lookups by outcome")
        .build()
}

/// Counter: requests handed to a worker by a daemon.
/// Labels: `work_type`.
pub fn work_dispatched() -> Counter<u64> {
    meter()
        .u64_counter("labpipe.work.dispatched")
        .with_description("Requests dispatched to workers")
        .build()
}

/// Counter: requests that reached a terminal outcome.
/// Labels: `work_type`, `result` ("success" | "failure").
pub fn work_finished() -> Counter<u64> {
    meter()
        .u64_counter("labpipe.work.finished")
        .with_description("Requests finished by outcome")
        .build()
}

/// Counter: file references translated.
/// Labels: `direction` ("sender" | "receiver").
pub fn files_translated() -> Counter<u64> {
    meter()
        .u64_counter("labpipe.files.translated")
        .with_description("File references translated between daemons")
        .build()
}

/// Counter: child logs created.
pub fn log_nodes_created() -> Counter<u64> {
    meter()
        .u64_counter("labpipe.log.nodes_created")
        .with_description("Child logs created")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("labpipe.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
