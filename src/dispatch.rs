//! Submission dispatch: take the lock, then submit or attach.
//!
//! Every submission computes its lock key and tries to create the lock
//! record with its own execution id. The winner submits the work; losers
//! read the record and attach to whoever holds it. If the record vanished
//! between the failed acquire and the read, the holder has just finished,
//! and the loser goes back to acquiring. "No owner" is never a final answer
//! for a submission that failed to acquire.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use serde_json::Value;
use tracing::{Instrument, Span, debug, info, warn};

use crate::config::Config;
use crate::error::{BoxError, Error, Result};
use crate::inspect::WorkerInspector;
use crate::locks::Locks;
use crate::model::{
    DispatchState, DuplicatePolicy, ExecutionHandle, ExecutionId, Kwargs, LockKey, NewSubmission,
    Submission, TaskDefinition,
};
use crate::telemetry::dispatch::{record_owner, record_state_transition, start_submit_span};
use crate::telemetry::metrics;

/// The underlying task-submission primitive.
#[async_trait]
pub trait Submitter: Send + Sync {
    /// Enqueue the work under `submission.execution_id`.
    async fn submit(&self, submission: &Submission) -> std::result::Result<ExecutionHandle, BoxError>;
}

/// Bounds on the acquire/read loop.
///
/// The default has no cap and no backoff. A cap counts acquire attempts and
/// is at least one. With a cap, exhausting it yields
/// [`Error::Contended`] rather than a result that claims no duplicate exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RaceRetry {
    pub max_attempts: Option<u32>,
    pub backoff: Duration,
}

/// What happened when work was submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitResult {
    /// This call took the lock and the work was submitted.
    Submitted(ExecutionHandle),
    /// The work was already in flight; attached to its execution.
    Attached(ExecutionHandle),
}

impl SubmitResult {
    pub fn handle(&self) -> &ExecutionHandle {
        match self {
            SubmitResult::Submitted(handle) | SubmitResult::Attached(handle) => handle,
        }
    }

    pub fn into_handle(self) -> ExecutionHandle {
        match self {
            SubmitResult::Submitted(handle) | SubmitResult::Attached(handle) => handle,
        }
    }

    pub fn is_attached(&self) -> bool {
        matches!(self, SubmitResult::Attached(_))
    }
}

/// Deduplicating front end over a [`Submitter`].
pub struct Dispatcher {
    locks: Locks,
    submitter: Arc<dyn Submitter>,
    duplicate_policy: DuplicatePolicy,
    race_retry: RaceRetry,
    inspector: Option<Arc<dyn WorkerInspector>>,
}

impl Clone for Dispatcher {
    fn clone(&self) -> Self {
        Self {
            locks: self.locks.clone(),
            submitter: Arc::clone(&self.submitter),
            duplicate_policy: self.duplicate_policy,
            race_retry: self.race_retry,
            inspector: self.inspector.clone(),
        }
    }
}

impl Dispatcher {
    pub fn new(locks: Locks, submitter: Arc<dyn Submitter>) -> Self {
        Self {
            locks,
            submitter,
            duplicate_policy: DuplicatePolicy::AttachToExisting,
            race_retry: RaceRetry::default(),
            inspector: None,
        }
    }

    /// Dispatcher with policy and retry settings taken from configuration.
    pub fn from_config(config: &Config, locks: Locks, submitter: Arc<dyn Submitter>) -> Self {
        Self::new(locks, submitter)
            .with_duplicate_policy(config.duplicate_policy)
            .with_race_retry(config.race_retry)
    }

    /// Policy for definitions that do not set their own.
    pub fn with_duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicate_policy = policy;
        self
    }

    pub fn with_race_retry(mut self, race_retry: RaceRetry) -> Self {
        self.race_retry = race_retry;
        self
    }

    /// Worker inspector used by definitions that challenge locks on startup.
    pub fn with_inspector(mut self, inspector: Arc<dyn WorkerInspector>) -> Self {
        self.inspector = Some(inspector);
        self
    }

    pub fn locks(&self) -> &Locks {
        &self.locks
    }

    /// Lock key for a submission, for diagnostics.
    pub fn lock_key(&self, definition: &TaskDefinition, args: &[Value], kwargs: &Kwargs) -> Result<LockKey> {
        self.locks.lock_key(definition, args, kwargs)
    }

    fn policy_for(&self, definition: &TaskDefinition) -> DuplicatePolicy {
        definition.duplicate_policy.unwrap_or(self.duplicate_policy)
    }

    /// Submit work, or attach to the execution already holding its lock.
    pub async fn submit(&self, definition: &TaskDefinition, new: NewSubmission) -> Result<SubmitResult> {
        let key = self.lock_key(definition, &new.args, &new.kwargs)?;
        let ttl = self.locks.expiry_for(definition, new.lock_expiry).ttl();
        let submission = Submission {
            task: definition.name.clone(),
            execution_id: new.execution_id.unwrap_or_default(),
            args: new.args,
            kwargs: new.kwargs,
            options: new.options,
        };

        let span = start_submit_span(&definition.name, &key, &submission.execution_id);
        let result = self
            .resolve(definition, &key, &submission, ttl, &span)
            .instrument(span.clone())
            .await;

        let label = match &result {
            Ok(SubmitResult::Submitted(_)) => "submitted",
            Ok(SubmitResult::Attached(_)) => "attached",
            Err(Error::Duplicate { .. }) => "duplicate",
            Err(Error::Contended { .. }) => "contended",
            Err(_) => "error",
        };
        metrics::submissions().add(
            1,
            &[
                KeyValue::new("task", definition.name.clone()),
                KeyValue::new("result", label),
            ],
        );
        result
    }

    async fn resolve(
        &self,
        definition: &TaskDefinition,
        key: &LockKey,
        submission: &Submission,
        ttl: Option<Duration>,
        span: &Span,
    ) -> Result<SubmitResult> {
        if definition.challenge_lock_on_startup {
            if let Some(inspector) = &self.inspector {
                self.locks.challenge(key, inspector.as_ref()).await?;
            }
        }

        let mut from = DispatchState::Idle;
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            record_state_transition(span, from, DispatchState::TryAcquire);

            if let Some(handle) = self.acquire_and_submit(key, submission, ttl, span).await? {
                info!(id = %handle.id, "submitted");
                return Ok(SubmitResult::Submitted(handle));
            }

            record_state_transition(span, DispatchState::NotAcquired, DispatchState::ReadOwner);
            if let Some(owner) = self.locks.owner(key).await? {
                record_state_transition(span, DispatchState::ReadOwner, DispatchState::Attached);
                record_owner(span, &owner);
                return self.on_duplicate(definition, owner);
            }

            // Released between our failed acquire and the read.
            record_state_transition(span, DispatchState::ReadOwner, DispatchState::OwnerAbsent);
            metrics::race_retries().add(1, &[KeyValue::new("task", definition.name.clone())]);
            debug!(attempts, "lock released under contention, retrying acquire");

            if self.race_retry.max_attempts.is_some_and(|max| attempts >= max) {
                warn!(attempts, "giving up on contended lock");
                return Err(Error::Contended {
                    key: key.clone(),
                    attempts,
                });
            }
            if !self.race_retry.backoff.is_zero() {
                tokio::time::sleep(self.race_retry.backoff).await;
            }
            from = DispatchState::OwnerAbsent;
        }
    }

    /// Take the lock and submit. `Ok(None)` means someone else holds it.
    async fn acquire_and_submit(
        &self,
        key: &LockKey,
        submission: &Submission,
        ttl: Option<Duration>,
        span: &Span,
    ) -> Result<Option<ExecutionHandle>> {
        if !self.locks.acquire(key, &submission.execution_id, ttl).await? {
            record_state_transition(span, DispatchState::TryAcquire, DispatchState::NotAcquired);
            return Ok(None);
        }
        record_state_transition(span, DispatchState::TryAcquire, DispatchState::Acquired);
        record_owner(span, &submission.execution_id);

        match self.submitter.submit(submission).await {
            Ok(handle) => {
                record_state_transition(span, DispatchState::Acquired, DispatchState::Submitted);
                Ok(Some(handle))
            }
            Err(e) => {
                record_state_transition(span, DispatchState::Acquired, DispatchState::SubmitFailed);
                warn!(error = %e, "submission failed, releasing lock");
                // The submit error wins over an unlock error; the TTL still
                // bounds a lock we failed to release.
                if let Err(unlock_err) = self.locks.unlock(key).await {
                    warn!(error = %unlock_err, "failed to release lock after submit failure");
                } else {
                    metrics::lock_releases().add(1, &[KeyValue::new("outcome", "submit_failed")]);
                }
                Err(Error::Submission(e))
            }
        }
    }

    fn on_duplicate(&self, definition: &TaskDefinition, owner: ExecutionId) -> Result<SubmitResult> {
        match self.policy_for(definition) {
            DuplicatePolicy::AttachToExisting => {
                info!(owner = %owner, "attached to existing execution");
                Ok(SubmitResult::Attached(ExecutionHandle::new(owner)))
            }
            DuplicatePolicy::RaiseOnDuplicate => {
                info!(owner = %owner, "duplicate rejected");
                Err(Error::Duplicate { execution_id: owner })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_result_exposes_its_handle() {
        let submitted = SubmitResult::Submitted(ExecutionHandle::new("a"));
        let attached = SubmitResult::Attached(ExecutionHandle::new("b"));
        assert!(!submitted.is_attached());
        assert!(attached.is_attached());
        assert_eq!(submitted.handle().id.as_str(), "a");
        assert_eq!(attached.into_handle().id, ExecutionId::from("b"));
    }

    #[test]
    fn race_retry_defaults_to_unbounded() {
        let retry = RaceRetry::default();
        assert_eq!(retry.max_attempts, None);
        assert!(retry.backoff.is_zero());
    }
}
