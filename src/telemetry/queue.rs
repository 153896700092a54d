//! Queue and lock span helpers.

use tracing::Span;

/// Start a span for one `Queue::get` call.
///
/// `message.id` is declared empty and filled in once something is delivered.
pub fn start_get_span(queue: &str, consumer: &str) -> Span {
    tracing::debug_span!(
        "queue.get",
        "queue.name" = queue,
        "queue.consumer" = consumer,
        "message.id" = tracing::field::Empty,
    )
}

/// Start a span for one `Lock::acquire` call.
pub fn start_acquire_span(lock: &str) -> Span {
    tracing::debug_span!(
        "lock.acquire",
        "lock.key" = lock,
        "lock.acquired" = tracing::field::Empty,
    )
}

/// Record a consumer state transition (`idle` / `delivered`) on a span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::debug!(from = from, to = to, "state_transition");
    });
}
