//! Lock backends: atomic set-if-absent key/value stores.
//!
//! A backend holds one record per held lock, keyed by the lock key, whose
//! value is the owning execution's id. Mutual exclusion is the backend's
//! job; callers never coordinate in-process.

pub mod memory;
pub mod redis;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::model::{ExecutionId, LockKey};

pub use memory::InMemoryBackend;
pub use self::redis::RedisBackend;

/// Capability set every lock store provides.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Create the record only if absent. Returns true iff this call created it.
    /// A `ttl` of `None` means the record never expires on its own.
    async fn lock(&self, key: &LockKey, owner: &ExecutionId, ttl: Option<Duration>) -> Result<bool>;

    /// Delete the record. Deleting an absent key is not an error.
    async fn unlock(&self, key: &LockKey) -> Result<()>;

    /// Current owner, or `None` if the lock is not held.
    async fn get(&self, key: &LockKey) -> Result<Option<ExecutionId>>;

    /// Delete every record whose key starts with `prefix`.
    async fn clear(&self, prefix: &str) -> Result<()>;
}

/// Builds a backend from configuration.
pub type BackendFactory = Box<dyn Fn(&BackendConfig) -> Result<Arc<dyn LockBackend>> + Send + Sync>;

/// Registry of backend constructors, indexed by name.
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl BackendRegistry {
    /// Create an empty registry with no backends.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the built-in `redis` and `memory` backends.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("redis", |config| {
            Ok(Arc::new(RedisBackend::from_config(config)?) as Arc<dyn LockBackend>)
        });
        registry.register("memory", |config| {
            Ok(Arc::new(InMemoryBackend::with_page_size(config.scan_count)) as Arc<dyn LockBackend>)
        });
        registry
    }

    /// Register (or replace) a backend constructor.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&BackendConfig) -> Result<Arc<dyn LockBackend>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Build the backend named in the configuration.
    pub fn build(&self, config: &BackendConfig) -> Result<Arc<dyn LockBackend>> {
        let factory = self.factories.get(&config.kind).ok_or_else(|| {
            let mut known: Vec<_> = self.factories.keys().map(String::as_str).collect();
            known.sort_unstable();
            Error::Config(format!(
                "unknown lock backend `{}` (known: {})",
                config.kind,
                known.join(", ")
            ))
        })?;
        factory(config)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
