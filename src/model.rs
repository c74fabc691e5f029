//! Core data model.
//!
//! A task definition says how a kind of work is deduplicated; a submission
//! is one request to run it. Identity is the task name plus the arguments
//! selected for uniqueness.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::fingerprint::Signature;

/// Keyword arguments, keyed by parameter name.
pub type Kwargs = BTreeMap<String, Value>;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Identifier of an execution. Stored as the value of a held lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ExecutionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ExecutionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A lock key: key prefix followed by the hex fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockKey(pub String);

impl LockKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to a submitted or attached execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionHandle {
    pub id: ExecutionId,
}

impl ExecutionHandle {
    pub fn new(id: impl Into<ExecutionId>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &ExecutionId {
        &self.id
    }
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// What a losing submitter gets back when the work is already in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Return a handle to the existing execution.
    #[default]
    AttachToExisting,
    /// Fail with [`crate::error::Error::Duplicate`].
    RaiseOnDuplicate,
}

impl DuplicatePolicy {
    pub fn from_raise_flag(raise: bool) -> Self {
        if raise {
            DuplicatePolicy::RaiseOnDuplicate
        } else {
            DuplicatePolicy::AttachToExisting
        }
    }
}

/// How long a lock record may live without an explicit release.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LockExpiry {
    /// The record only disappears on unlock.
    #[default]
    Never,
    After(Duration),
}

impl LockExpiry {
    pub fn ttl(self) -> Option<Duration> {
        match self {
            LockExpiry::Never => None,
            LockExpiry::After(d) => Some(d),
        }
    }
}

impl From<Option<Duration>> for LockExpiry {
    fn from(ttl: Option<Duration>) -> Self {
        ttl.map_or(LockExpiry::Never, LockExpiry::After)
    }
}

/// Which arguments take part in fingerprinting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum UniqueOn {
    /// Every positional and keyword argument.
    #[default]
    All,
    /// Only these named arguments. Empty means the task name alone.
    Only(Vec<String>),
}

// ---------------------------------------------------------------------------
// Task definition
// ---------------------------------------------------------------------------

/// Per-task deduplication settings.
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    pub(crate) name: String,
    pub(crate) unique_on: UniqueOn,
    pub(crate) signature: Option<Signature>,
    pub(crate) lock_expiry: Option<LockExpiry>,
    pub(crate) duplicate_policy: Option<DuplicatePolicy>,
    pub(crate) challenge_lock_on_startup: bool,
}

impl TaskDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unique_on: UniqueOn::All,
            signature: None,
            lock_expiry: None,
            duplicate_policy: None,
            challenge_lock_on_startup: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unique_on<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unique_on = UniqueOn::Only(names.into_iter().map(Into::into).collect());
        self
    }

    /// Parameter list used to bind positional arguments to names.
    pub fn signature(mut self, signature: Signature) -> Self {
        self.signature = Some(signature);
        self
    }

    pub fn lock_expiry(mut self, expiry: LockExpiry) -> Self {
        self.lock_expiry = Some(expiry);
        self
    }

    pub fn duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicate_policy = Some(policy);
        self
    }

    pub fn raise_on_duplicate(self, raise: bool) -> Self {
        self.duplicate_policy(DuplicatePolicy::from_raise_flag(raise))
    }

    /// Remove a lock held by an execution no live worker knows about
    /// before trying to acquire it.
    pub fn challenge_lock_on_startup(mut self, enabled: bool) -> Self {
        self.challenge_lock_on_startup = enabled;
        self
    }

    pub fn selector(&self) -> &UniqueOn {
        &self.unique_on
    }
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

/// Builder for a submission. The public API for requesting work.
#[derive(Debug, Clone, Default)]
pub struct NewSubmission {
    pub(crate) execution_id: Option<ExecutionId>,
    pub(crate) args: Vec<Value>,
    pub(crate) kwargs: Kwargs,
    pub(crate) options: Value,
    pub(crate) lock_expiry: Option<LockExpiry>,
}

impl NewSubmission {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a caller-assigned id instead of a generated one.
    pub fn execution_id(mut self, id: impl Into<ExecutionId>) -> Self {
        self.execution_id = Some(id.into());
        self
    }

    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn arg(mut self, value: Value) -> Self {
        self.args.push(value);
        self
    }

    pub fn kwargs(mut self, kwargs: Kwargs) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(name.into(), value);
        self
    }

    /// Options passed through to the submitter untouched.
    pub fn options(mut self, options: Value) -> Self {
        self.options = options;
        self
    }

    /// Override the lock expiry for this call only.
    pub fn lock_expiry(mut self, expiry: LockExpiry) -> Self {
        self.lock_expiry = Some(expiry);
        self
    }
}

/// A submission as handed to the underlying submitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub task: String,
    pub execution_id: ExecutionId,
    pub args: Vec<Value>,
    pub kwargs: Kwargs,
    pub options: Value,
}

// ---------------------------------------------------------------------------
// Terminal events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        };
        write!(f, "{s}")
    }
}

/// Signal that an execution reached a terminal outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalEvent {
    pub execution_id: ExecutionId,
    pub args: Vec<Value>,
    pub kwargs: Kwargs,
    pub outcome: Outcome,
}

// ---------------------------------------------------------------------------
// Dispatch state
// ---------------------------------------------------------------------------

/// States of a single submission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchState {
    Idle,
    TryAcquire,
    Acquired,
    /// Terminal: the submitter accepted the work.
    Submitted,
    /// Terminal: the submitter failed, the lock was released.
    SubmitFailed,
    NotAcquired,
    ReadOwner,
    /// Terminal: an owner was found and the duplicate policy applied.
    Attached,
    /// The holder released between acquire and read. Loops to `TryAcquire`.
    OwnerAbsent,
}

impl DispatchState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DispatchState::Submitted | DispatchState::SubmitFailed | DispatchState::Attached
        )
    }
}

impl std::fmt::Display for DispatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DispatchState::Idle => "idle",
            DispatchState::TryAcquire => "try_acquire",
            DispatchState::Acquired => "acquired",
            DispatchState::Submitted => "submitted",
            DispatchState::SubmitFailed => "submit_failed",
            DispatchState::NotAcquired => "not_acquired",
            DispatchState::ReadOwner => "read_owner",
            DispatchState::Attached => "attached",
            DispatchState::OwnerAbsent => "owner_absent",
        };
        write!(f, "{s}")
    }
}
