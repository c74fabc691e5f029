//! Error types for task-singleton.

use thiserror::Error;

use crate::model::{ExecutionId, LockKey};

/// Boxed error returned by external collaborators (submitters, inspectors).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
    /// Arguments could not be brought into canonical form.
    #[error("fingerprint error: {0}")]
    Fingerprint(String),

    /// The lock store could not be reached or rejected a command.
    #[error("lock backend unavailable: {0}")]
    Backend(#[from] redis::RedisError),

    /// The underlying submission failed. The lock was released first.
    #[error(transparent)]
    Submission(BoxError),

    /// A duplicate was detected and the duplicate policy says to raise.
    #[error("attempted to queue a duplicate of execution {execution_id}")]
    Duplicate { execution_id: ExecutionId },

    /// The lock kept changing hands for longer than the race retry cap allows.
    #[error("lock {key} still contended after {attempts} attempts")]
    Contended { key: LockKey, attempts: u32 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// The existing execution id carried by a duplicate error.
    pub fn duplicate_of(&self) -> Option<&ExecutionId> {
        match self {
            Error::Duplicate { execution_id } => Some(execution_id),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
