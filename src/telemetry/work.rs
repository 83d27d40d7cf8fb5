//! Spans around work as it moves through a daemon.

use tracing::Span;

/// Span covering one request from dispatch to its terminal report.
///
/// `work.state` starts empty and follows [`record_state_transition`].
pub fn start_work_span(work_type: &str, task_id: &str) -> Span {
    tracing::info_span!(
        "work.execute",
        "work.type" = work_type,
        "work.task_id" = task_id,
        "work.state" = tracing::field::Empty,
    )
}

/// Note a lifecycle change (`received` → `running` → `succeeded`/`failed`).
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("work.state", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
