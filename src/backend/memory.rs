//! In-process lock backend.
//!
//! Records live in an ordered map behind a mutex, with expiry measured on
//! the tokio clock so tests can drive it with a paused runtime. Only
//! coordinates callers inside one process.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use super::LockBackend;
use crate::error::{Error, Result};
use crate::model::{ExecutionId, LockKey};

const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone)]
struct Record {
    owner: ExecutionId,
    expires_at: Option<Instant>,
}

impl Record {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// Lock backend backed by process memory.
pub struct InMemoryBackend {
    records: Mutex<BTreeMap<String, Record>>,
    page_size: usize,
    pages_scanned: AtomicU64,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    /// Backend whose `clear` walks keys `page_size` at a time.
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
            page_size: page_size.max(1),
            pages_scanned: AtomicU64::new(0),
        }
    }

    /// Number of live records (expired ones are not counted).
    pub fn len(&self) -> Result<usize> {
        let now = Instant::now();
        Ok(self.records()?.values().filter(|r| r.is_live(now)).count())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Pages visited by `clear` since construction.
    pub fn pages_scanned(&self) -> u64 {
        self.pages_scanned.load(Ordering::Relaxed)
    }

    fn records(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Record>>> {
        self.records
            .lock()
            .map_err(|_| Error::Other("memory backend lock poisoned".to_string()))
    }

    /// One page of keys after `cursor` that start with `prefix`.
    /// Returns the keys and the cursor for the next page, `None` when done.
    fn scan_page(&self, cursor: Option<&str>, prefix: &str) -> Result<(Vec<String>, Option<String>)> {
        let records = self.records()?;
        let lower = match cursor {
            Some(c) => Bound::Excluded(c.to_string()),
            None => Bound::Included(prefix.to_string()),
        };
        let keys: Vec<String> = records
            .range((lower, Bound::Unbounded))
            .map(|(k, _)| k)
            .take_while(|k| k.starts_with(prefix))
            .take(self.page_size)
            .cloned()
            .collect();
        self.pages_scanned.fetch_add(1, Ordering::Relaxed);
        let next = if keys.len() < self.page_size {
            None
        } else {
            keys.last().cloned()
        };
        Ok((keys, next))
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockBackend for InMemoryBackend {
    async fn lock(&self, key: &LockKey, owner: &ExecutionId, ttl: Option<Duration>) -> Result<bool> {
        let now = Instant::now();
        let mut records = self.records()?;
        if records.get(key.as_str()).is_some_and(|r| r.is_live(now)) {
            return Ok(false);
        }
        records.insert(
            key.0.clone(),
            Record {
                owner: owner.clone(),
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        debug!(%key, %owner, "memory lock acquired");
        Ok(true)
    }

    async fn unlock(&self, key: &LockKey) -> Result<()> {
        self.records()?.remove(key.as_str());
        Ok(())
    }

    async fn get(&self, key: &LockKey) -> Result<Option<ExecutionId>> {
        let now = Instant::now();
        let mut records = self.records()?;
        match records.get(key.as_str()) {
            Some(record) if record.is_live(now) => Ok(Some(record.owner.clone())),
            Some(_) => {
                records.remove(key.as_str());
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn clear(&self, prefix: &str) -> Result<()> {
        let mut cursor: Option<String> = None;
        let mut removed = 0usize;
        loop {
            let (keys, next) = self.scan_page(cursor.as_deref(), prefix)?;
            let mut records = self.records()?;
            for key in &keys {
                records.remove(key);
            }
            removed += keys.len();
            drop(records);
            match next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        debug!(prefix, removed, "memory locks cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> LockKey {
        LockKey(s.to_string())
    }

    #[tokio::test]
    async fn second_lock_on_same_key_fails() {
        let backend = InMemoryBackend::new();
        let owner = ExecutionId::from("a");
        assert!(backend.lock(&key("k"), &owner, None).await.unwrap());
        assert!(!backend.lock(&key("k"), &ExecutionId::from("b"), None).await.unwrap());
        assert_eq!(backend.get(&key("k")).await.unwrap(), Some(owner));
    }

    #[tokio::test]
    async fn unlock_of_absent_key_is_a_noop() {
        let backend = InMemoryBackend::new();
        backend.unlock(&key("missing")).await.unwrap();
        assert_eq!(backend.get(&key("missing")).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_record_reads_as_absent() {
        let backend = InMemoryBackend::new();
        let ttl = Duration::from_secs(10);
        assert!(backend.lock(&key("k"), &ExecutionId::from("a"), Some(ttl)).await.unwrap());
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(backend.get(&key("k")).await.unwrap(), None);
        assert!(backend.is_empty().unwrap());
    }

    #[tokio::test]
    async fn clear_walks_every_page() {
        let backend = InMemoryBackend::with_page_size(3);
        for i in 0..10 {
            backend
                .lock(&key(&format!("p:{i}")), &ExecutionId::new(), None)
                .await
                .unwrap();
        }
        backend.clear("p:").await.unwrap();
        assert!(backend.is_empty().unwrap());
        assert!(backend.pages_scanned() >= 4);
    }
}
