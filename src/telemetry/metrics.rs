//! Metric instrument factories for streamq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"streamq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("streamq")
}

/// Counter: queue-level operations.
/// Labels: `queue`, `operation` ("put" | "get" | "get_empty" | "ack").
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("streamq.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: stuck entries reassigned to a live consumer.
/// Labels: `queue`.
pub fn queue_reclaimed() -> Counter<u64> {
    meter()
        .u64_counter("streamq.queue.reclaimed")
        .with_description("Number of stuck entries reclaimed from dead consumers")
        .build()
}

/// Counter: lock operations.
/// Labels: `lock`, `operation` ("acquired" | "contended" | "timed_out" | "released" | "release_noop").
pub fn lock_operations() -> Counter<u64> {
    meter()
        .u64_counter("streamq.lock.operations")
        .with_description("Number of lock operations")
        .build()
}

/// Histogram: store round-trip duration in milliseconds.
/// Labels: `command`.
pub fn store_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("streamq.store.duration_ms")
        .with_description("Store command round-trip duration in milliseconds")
        .with_unit("ms")
        .build()
}
