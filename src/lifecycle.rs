//! Lock release tied to execution outcome.
//!
//! Hook `on_terminal` into whatever reports finished executions. The lock
//! key is recomputed from the event's arguments, so it matches the key the
//! dispatcher took as long as both share the same definition and `Locks`.

use opentelemetry::KeyValue;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::Result;
use crate::locks::Locks;
use crate::model::{Kwargs, TaskDefinition, TerminalEvent};
use crate::telemetry::metrics;

impl Locks {
    /// Release the lock for a submission of `definition` with these arguments.
    pub async fn release(&self, definition: &TaskDefinition, args: &[Value], kwargs: &Kwargs) -> Result<()> {
        let key = self.lock_key(definition, args, kwargs)?;
        self.unlock(&key).await?;
        metrics::lock_releases().add(1, &[KeyValue::new("outcome", "manual")]);
        info!(task = %definition.name, %key, "lock released");
        Ok(())
    }

    /// Release the lock held for an execution that just finished.
    ///
    /// Success and failure are treated alike. Errors are returned to the
    /// caller; a lock left behind still falls to its TTL, if any.
    pub async fn on_terminal(&self, definition: &TaskDefinition, event: &TerminalEvent) -> Result<()> {
        let key = self.lock_key(definition, &event.args, &event.kwargs)?;
        self.unlock(&key).await?;
        metrics::lock_releases().add(1, &[KeyValue::new("outcome", event.outcome.to_string())]);
        debug!(
            task = %definition.name,
            id = %event.execution_id,
            outcome = %event.outcome,
            %key,
            "released lock on terminal event"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use crate::backend::InMemoryBackend;
    use crate::model::{ExecutionId, Outcome};

    use super::*;

    #[tokio::test]
    async fn terminal_event_releases_the_matching_lock() {
        let locks = Locks::new(Arc::new(InMemoryBackend::new()));
        let def = TaskDefinition::new("report");
        let args = vec![json!(7)];
        let key = locks.lock_key(&def, &args, &Kwargs::new()).unwrap();
        let id = ExecutionId::from("exec-1");
        assert!(locks.acquire(&key, &id, None).await.unwrap());

        let event = TerminalEvent {
            execution_id: id,
            args,
            kwargs: Kwargs::new(),
            outcome: Outcome::Failure,
        };
        locks.on_terminal(&def, &event).await.unwrap();
        assert_eq!(locks.owner(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn releasing_an_unheld_lock_is_a_no_op() {
        let locks = Locks::new(Arc::new(InMemoryBackend::new()));
        let def = TaskDefinition::new("report");
        locks.release(&def, &[], &Kwargs::new()).await.unwrap();
    }
}
