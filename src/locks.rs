//! Lock handle shared by dispatchers and terminal-event hooks.
//!
//! `Locks` owns one backend instance together with the key prefix and the
//! default expiry, so the code that takes a lock and the code that
//! releases it always derive the same key.

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use serde_json::Value;
use tracing::{debug, info};

use crate::backend::{BackendRegistry, LockBackend};
use crate::config::Config;
use crate::error::Result;
use crate::fingerprint::{DEFAULT_KEY_PREFIX, fingerprint, select_arguments};
use crate::model::{ExecutionId, Kwargs, LockExpiry, LockKey, TaskDefinition};
use crate::telemetry::metrics;

#[derive(Clone)]
pub struct Locks {
    backend: Arc<dyn LockBackend>,
    key_prefix: String,
    default_expiry: LockExpiry,
}

impl Locks {
    pub fn new(backend: Arc<dyn LockBackend>) -> Self {
        Self {
            backend,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            default_expiry: LockExpiry::Never,
        }
    }

    /// Build the configured backend through the registry.
    pub fn from_config(config: &Config, registry: &BackendRegistry) -> Result<Self> {
        let backend = registry.build(&config.backend)?;
        info!(backend = %config.backend.kind, prefix = %config.key_prefix, "lock backend ready");
        Ok(Self::new(backend)
            .with_key_prefix(config.key_prefix.clone())
            .with_default_expiry(config.lock_expiry))
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_default_expiry(mut self, expiry: LockExpiry) -> Self {
        self.default_expiry = expiry;
        self
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    pub fn backend(&self) -> &Arc<dyn LockBackend> {
        &self.backend
    }

    /// The lock key a submission of `definition` with these arguments maps to.
    pub fn lock_key(&self, definition: &TaskDefinition, args: &[Value], kwargs: &Kwargs) -> Result<LockKey> {
        let (args, kwargs) = select_arguments(definition, args, kwargs)?;
        fingerprint(&definition.name, &args, &kwargs, &self.key_prefix)
    }

    /// Expiry for a definition, with an optional per-call override.
    pub fn expiry_for(&self, definition: &TaskDefinition, call: Option<LockExpiry>) -> LockExpiry {
        call.or(definition.lock_expiry).unwrap_or(self.default_expiry)
    }

    /// Try to take the lock for `owner`.
    pub async fn acquire(&self, key: &LockKey, owner: &ExecutionId, ttl: Option<Duration>) -> Result<bool> {
        let acquired = self.backend.lock(key, owner, ttl).await?;
        metrics::lock_operations().add(
            1,
            &[
                KeyValue::new("operation", "lock"),
                KeyValue::new("result", if acquired { "acquired" } else { "held" }),
            ],
        );
        debug!(%key, %owner, acquired, "lock attempt");
        Ok(acquired)
    }

    /// Current owner of the lock, if held.
    pub async fn owner(&self, key: &LockKey) -> Result<Option<ExecutionId>> {
        let owner = self.backend.get(key).await?;
        metrics::lock_operations().add(
            1,
            &[
                KeyValue::new("operation", "get"),
                KeyValue::new("result", if owner.is_some() { "found" } else { "absent" }),
            ],
        );
        Ok(owner)
    }

    pub async fn unlock(&self, key: &LockKey) -> Result<()> {
        self.backend.unlock(key).await?;
        metrics::lock_operations().add(
            1,
            &[
                KeyValue::new("operation", "unlock"),
                KeyValue::new("result", "ok"),
            ],
        );
        debug!(%key, "lock released");
        Ok(())
    }

    /// Remove every lock under this prefix, e.g. when workers restart.
    pub async fn clear(&self) -> Result<()> {
        self.backend.clear(&self.key_prefix).await?;
        metrics::lock_operations().add(
            1,
            &[
                KeyValue::new("operation", "clear"),
                KeyValue::new("result", "ok"),
            ],
        );
        info!(prefix = %self.key_prefix, "cleared all locks");
        Ok(())
    }
}
