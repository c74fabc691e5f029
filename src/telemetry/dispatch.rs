//! Submission span helpers.
//!
//! Provides span creation and state-transition recording for submissions
//! flowing through the dispatcher.

use tracing::Span;

use crate::model::{DispatchState, ExecutionId, LockKey};

/// Start a span for one submission.
///
/// The `dispatch.state` and `dispatch.owner` fields are declared empty and
/// filled in as the submission resolves.
pub fn start_submit_span(task: &str, key: &LockKey, execution_id: &ExecutionId) -> Span {
    tracing::info_span!(
        "singleton.submit",
        "task.name" = task,
        "lock.key" = %key,
        "execution.id" = %execution_id,
        "dispatch.state" = tracing::field::Empty,
        "dispatch.owner" = tracing::field::Empty,
    )
}

/// Record a state transition event on the given span.
pub fn record_state_transition(span: &Span, from: DispatchState, to: DispatchState) {
    span.record("dispatch.state", tracing::field::display(to));
    span.in_scope(|| {
        tracing::debug!(from = %from, to = %to, "state_transition");
    });
}

/// Record which execution ended up owning the lock.
pub fn record_owner(span: &Span, owner: &ExecutionId) {
    span.record("dispatch.owner", tracing::field::display(owner));
}
