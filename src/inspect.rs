//! Best-effort worker introspection.
//!
//! Used only to detect stale locks: a lock whose owner no live worker is
//! running, holding, or has scheduled. Nothing on the acquisition path
//! depends on these answers, so query failures read as "not found".

use std::collections::HashMap;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{BoxError, Result};
use crate::locks::Locks;
use crate::model::{ExecutionId, Kwargs, LockKey};
use crate::telemetry::metrics;

/// A unit of work as reported by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: ExecutionId,
    pub name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Kwargs,
}

/// Tasks per worker name.
pub type WorkerTasks = HashMap<String, Vec<TaskInfo>>;

/// Read-only view of what the workers are doing.
#[async_trait]
pub trait WorkerInspector: Send + Sync {
    /// Liveness per worker name; `true` means the worker replied ok.
    async fn ping(&self) -> std::result::Result<HashMap<String, bool>, BoxError>;

    /// Tasks currently executing.
    async fn active(&self) -> std::result::Result<WorkerTasks, BoxError>;

    /// Tasks prefetched but not yet started.
    async fn reserved(&self) -> std::result::Result<WorkerTasks, BoxError>;

    /// Tasks waiting for an ETA or countdown.
    async fn scheduled(&self) -> std::result::Result<WorkerTasks, BoxError>;
}

/// Look for `id` in active, then reserved, then scheduled work.
///
/// Any query failure ends the search with `None`.
pub async fn find_task_by_id(inspector: &dyn WorkerInspector, id: &ExecutionId) -> Option<TaskInfo> {
    match search(inspector, id).await {
        Ok(found) => found,
        Err(e) => {
            debug!(error = %e, %id, "worker inspection failed");
            None
        }
    }
}

async fn search(
    inspector: &dyn WorkerInspector,
    id: &ExecutionId,
) -> std::result::Result<Option<TaskInfo>, BoxError> {
    if let Some(task) = find_in(inspector.active().await?, id) {
        return Ok(Some(task));
    }
    if let Some(task) = find_in(inspector.reserved().await?, id) {
        return Ok(Some(task));
    }
    Ok(find_in(inspector.scheduled().await?, id))
}

fn find_in(tasks: WorkerTasks, id: &ExecutionId) -> Option<TaskInfo> {
    tasks
        .into_values()
        .flatten()
        .find(|task| &task.id == id)
}

/// Whether at least one worker answered a ping. Failures count as no.
pub async fn workers_active(inspector: &dyn WorkerInspector) -> bool {
    match inspector.ping().await {
        Ok(replies) => replies.values().any(|ok| *ok),
        Err(e) => {
            debug!(error = %e, "worker ping failed");
            false
        }
    }
}

impl Locks {
    /// Remove the lock at `key` if its owner is unknown to every live worker.
    ///
    /// Returns `true` when a stale lock was removed. Nothing is removed
    /// while no worker answers, since then nothing can be known.
    pub async fn challenge(&self, key: &LockKey, inspector: &dyn WorkerInspector) -> Result<bool> {
        let Some(owner) = self.owner(key).await? else {
            return Ok(false);
        };
        if !workers_active(inspector).await {
            return Ok(false);
        }
        if find_task_by_id(inspector, &owner).await.is_some() {
            return Ok(false);
        }

        warn!(%key, %owner, "removing stale lock");
        self.unlock(key).await?;
        metrics::lock_releases().add(1, &[KeyValue::new("outcome", "stale")]);
        Ok(true)
    }
}
