//! Integration tests for the dispatcher: acquire, submit, attach.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use task_singleton::backend::{InMemoryBackend, LockBackend};
use task_singleton::error::BoxError;
use task_singleton::inspect::{TaskInfo, WorkerInspector, WorkerTasks};
use task_singleton::model::*;
use task_singleton::{Dispatcher, Error, Locks, RaceRetry, SubmitResult, Submitter};

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

/// Records every submission; optionally holds each one for a while.
#[derive(Default)]
struct RecordingSubmitter {
    submitted: Mutex<Vec<Submission>>,
    delay: Duration,
}

impl RecordingSubmitter {
    fn with_delay(delay: Duration) -> Self {
        Self {
            submitted: Mutex::new(Vec::new()),
            delay,
        }
    }

    fn count(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }
}

#[async_trait]
impl Submitter for RecordingSubmitter {
    async fn submit(&self, submission: &Submission) -> Result<ExecutionHandle, BoxError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.submitted.lock().unwrap().push(submission.clone());
        Ok(ExecutionHandle::new(submission.execution_id.clone()))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("broker refused: {0}")]
struct BrokerError(&'static str);

struct FailingSubmitter;

#[async_trait]
impl Submitter for FailingSubmitter {
    async fn submit(&self, _submission: &Submission) -> Result<ExecutionHandle, BoxError> {
        Err(Box::new(BrokerError("queue full")))
    }
}

/// Reports the lock as held for the first `held_for` attempts but never
/// has an owner to read, as if the holder released in between every time.
struct ReleasingBackend {
    held_for: u32,
    lock_calls: AtomicU32,
    get_calls: AtomicU32,
}

impl ReleasingBackend {
    fn new(held_for: u32) -> Self {
        Self {
            held_for,
            lock_calls: AtomicU32::new(0),
            get_calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl LockBackend for ReleasingBackend {
    async fn lock(&self, _key: &LockKey, _owner: &ExecutionId, _ttl: Option<Duration>) -> task_singleton::Result<bool> {
        let n = self.lock_calls.fetch_add(1, Ordering::SeqCst);
        Ok(n >= self.held_for)
    }

    async fn unlock(&self, _key: &LockKey) -> task_singleton::Result<()> {
        Ok(())
    }

    async fn get(&self, _key: &LockKey) -> task_singleton::Result<Option<ExecutionId>> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }

    async fn clear(&self, _prefix: &str) -> task_singleton::Result<()> {
        Ok(())
    }
}

/// One live worker running the given task ids.
struct FakeInspector {
    running: Vec<ExecutionId>,
}

#[async_trait]
impl WorkerInspector for FakeInspector {
    async fn ping(&self) -> Result<HashMap<String, bool>, BoxError> {
        Ok(HashMap::from([("worker-1".to_string(), true)]))
    }

    async fn active(&self) -> Result<WorkerTasks, BoxError> {
        let tasks = self
            .running
            .iter()
            .map(|id| TaskInfo {
                id: id.clone(),
                name: "report".to_string(),
                args: vec![],
                kwargs: Kwargs::new(),
            })
            .collect();
        Ok(HashMap::from([("worker-1".to_string(), tasks)]))
    }

    async fn reserved(&self) -> Result<WorkerTasks, BoxError> {
        Ok(WorkerTasks::new())
    }

    async fn scheduled(&self) -> Result<WorkerTasks, BoxError> {
        Ok(WorkerTasks::new())
    }
}

fn memory_locks() -> Locks {
    Locks::new(Arc::new(InMemoryBackend::new()))
}

fn report() -> TaskDefinition {
    TaskDefinition::new("report")
}

fn call(n: i64) -> NewSubmission {
    NewSubmission::new().arg(json!(n)).kwarg("format", json!("pdf"))
}

// ---------------------------------------------------------------------------
// Submit and attach
// ---------------------------------------------------------------------------

#[tokio::test]
async fn first_submission_runs_and_duplicates_attach() {
    let submitter = Arc::new(RecordingSubmitter::default());
    let dispatcher = Dispatcher::new(memory_locks(), submitter.clone());

    let first = dispatcher.submit(&report(), call(1)).await.unwrap();
    assert!(matches!(first, SubmitResult::Submitted(_)));

    let second = dispatcher.submit(&report(), call(1)).await.unwrap();
    assert!(second.is_attached());
    assert_eq!(second.handle(), first.handle());

    let other = dispatcher.submit(&report(), call(2)).await.unwrap();
    assert!(matches!(other, SubmitResult::Submitted(_)));
    assert_ne!(other.handle(), first.handle());

    assert_eq!(submitter.count(), 2);
}

#[tokio::test]
async fn preassigned_execution_id_is_used() {
    let submitter = Arc::new(RecordingSubmitter::default());
    let dispatcher = Dispatcher::new(memory_locks(), submitter.clone());

    let result = dispatcher
        .submit(&report(), call(1).execution_id("exec-42"))
        .await
        .unwrap();
    assert_eq!(result.handle().id.as_str(), "exec-42");

    let key = dispatcher
        .lock_key(&report(), &[json!(1)], &Kwargs::from([("format".to_string(), json!("pdf"))]))
        .unwrap();
    let owner = dispatcher.locks().owner(&key).await.unwrap();
    assert_eq!(owner, Some(ExecutionId::from("exec-42")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_identical_submissions_run_once() {
    let submitter = Arc::new(RecordingSubmitter::with_delay(Duration::from_millis(50)));
    let dispatcher = Dispatcher::new(memory_locks(), submitter.clone());

    let mut handles = Vec::new();
    for _ in 0..16 {
        let dispatcher = dispatcher.clone();
        handles.push(tokio::spawn(async move {
            dispatcher.submit(&report(), call(7)).await
        }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(submitter.count(), 1);
    let winner = submitter.submitted.lock().unwrap()[0].execution_id.clone();
    assert!(results.iter().all(|r| r.handle().id == winner));
    assert_eq!(results.iter().filter(|r| !r.is_attached()).count(), 1);
}

#[tokio::test]
async fn raise_on_duplicate_carries_the_owner() {
    let submitter = Arc::new(RecordingSubmitter::default());
    let dispatcher = Dispatcher::new(memory_locks(), submitter.clone());
    let def = report().raise_on_duplicate(true);

    let first = dispatcher.submit(&def, call(1)).await.unwrap();
    let err = dispatcher.submit(&def, call(1)).await.unwrap_err();
    assert_eq!(err.duplicate_of(), Some(&first.handle().id));
    assert!(err.to_string().contains(first.handle().id.as_str()));
}

#[tokio::test]
async fn dispatcher_policy_applies_when_definition_is_silent() {
    let submitter = Arc::new(RecordingSubmitter::default());
    let dispatcher = Dispatcher::new(memory_locks(), submitter)
        .with_duplicate_policy(DuplicatePolicy::RaiseOnDuplicate);

    dispatcher.submit(&report(), call(1)).await.unwrap();
    let err = dispatcher.submit(&report(), call(1)).await.unwrap_err();
    assert!(matches!(err, Error::Duplicate { .. }));

    // A definition override wins.
    let lenient = report().duplicate_policy(DuplicatePolicy::AttachToExisting);
    assert!(dispatcher.submit(&lenient, call(1)).await.unwrap().is_attached());
}

// ---------------------------------------------------------------------------
// Failure and release
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_submission_releases_the_lock_and_keeps_the_error() {
    let locks = memory_locks();
    let dispatcher = Dispatcher::new(locks.clone(), Arc::new(FailingSubmitter));

    let err = dispatcher.submit(&report(), call(1)).await.unwrap_err();
    match &err {
        Error::Submission(inner) => {
            let broker = inner.downcast_ref::<BrokerError>().expect("broker error");
            assert_eq!(broker.0, "queue full");
        }
        other => panic!("expected Submission, got {other:?}"),
    }
    assert_eq!(err.to_string(), "broker refused: queue full");

    let key = dispatcher
        .lock_key(&report(), &[json!(1)], &Kwargs::from([("format".to_string(), json!("pdf"))]))
        .unwrap();
    assert_eq!(locks.owner(&key).await.unwrap(), None);

    // A retry through a working submitter now goes through.
    let retry = Dispatcher::new(locks, Arc::new(RecordingSubmitter::default()));
    assert!(!retry.submit(&report(), call(1)).await.unwrap().is_attached());
}

#[tokio::test]
async fn resubmission_after_completion_runs_again() {
    let submitter = Arc::new(RecordingSubmitter::default());
    let locks = memory_locks();
    let dispatcher = Dispatcher::new(locks.clone(), submitter.clone());

    let first = dispatcher.submit(&report(), call(3)).await.unwrap();
    let submission = submitter.submitted.lock().unwrap()[0].clone();
    locks
        .on_terminal(
            &report(),
            &TerminalEvent {
                execution_id: first.handle().id.clone(),
                args: submission.args,
                kwargs: submission.kwargs,
                outcome: Outcome::Success,
            },
        )
        .await
        .unwrap();

    let second = dispatcher.submit(&report(), call(3)).await.unwrap();
    assert!(!second.is_attached());
    assert_ne!(second.handle(), first.handle());
    assert_eq!(submitter.count(), 2);
}

#[tokio::test(start_paused = true)]
async fn expired_lock_lets_the_next_submission_run() {
    let submitter = Arc::new(RecordingSubmitter::default());
    let dispatcher = Dispatcher::new(memory_locks(), submitter.clone());
    let def = report().lock_expiry(LockExpiry::After(Duration::from_secs(10)));

    let first = dispatcher.submit(&def, call(1)).await.unwrap();
    tokio::time::advance(Duration::from_secs(5)).await;
    assert!(dispatcher.submit(&def, call(1)).await.unwrap().is_attached());

    tokio::time::advance(Duration::from_secs(6)).await;
    let third = dispatcher.submit(&def, call(1)).await.unwrap();
    assert!(!third.is_attached());
    assert_ne!(third.handle(), first.handle());
}

// ---------------------------------------------------------------------------
// Race loop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn owner_vanishing_between_acquire_and_read_retries_acquire() {
    let backend = Arc::new(ReleasingBackend::new(3));
    let submitter = Arc::new(RecordingSubmitter::default());
    let dispatcher = Dispatcher::new(Locks::new(backend.clone()), submitter.clone());

    let result = dispatcher.submit(&report(), call(1)).await.unwrap();
    assert!(matches!(result, SubmitResult::Submitted(_)));
    assert_eq!(backend.lock_calls.load(Ordering::SeqCst), 4);
    assert_eq!(backend.get_calls.load(Ordering::SeqCst), 3);
    assert_eq!(submitter.count(), 1);
}

#[tokio::test]
async fn capped_race_loop_reports_contention() {
    let backend = Arc::new(ReleasingBackend::new(u32::MAX));
    let dispatcher = Dispatcher::new(Locks::new(backend.clone()), Arc::new(RecordingSubmitter::default()))
        .with_race_retry(RaceRetry {
            max_attempts: Some(5),
            backoff: Duration::ZERO,
        });

    let err = dispatcher.submit(&report(), call(1)).await.unwrap_err();
    match err {
        Error::Contended { attempts, .. } => assert_eq!(attempts, 5),
        other => panic!("expected Contended, got {other:?}"),
    }
    assert_eq!(backend.lock_calls.load(Ordering::SeqCst), 5);
}

#[tokio::test(start_paused = true)]
async fn race_backoff_waits_between_attempts() {
    let backend = Arc::new(ReleasingBackend::new(2));
    let dispatcher = Dispatcher::new(Locks::new(backend), Arc::new(RecordingSubmitter::default()))
        .with_race_retry(RaceRetry {
            max_attempts: None,
            backoff: Duration::from_millis(100),
        });

    let start = tokio::time::Instant::now();
    dispatcher.submit(&report(), call(1)).await.unwrap();
    assert!(start.elapsed() >= Duration::from_millis(200));
}

// ---------------------------------------------------------------------------
// Lock challenge
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stale_lock_is_challenged_on_startup() {
    let locks = memory_locks();
    let submitter = Arc::new(RecordingSubmitter::default());
    let def = report().challenge_lock_on_startup(true);

    let key = locks
        .lock_key(&def, &[json!(1)], &Kwargs::from([("format".to_string(), json!("pdf"))]))
        .unwrap();
    let ghost = ExecutionId::from("ghost");
    assert!(locks.acquire(&key, &ghost, None).await.unwrap());

    let dispatcher = Dispatcher::new(locks.clone(), submitter.clone())
        .with_inspector(Arc::new(FakeInspector { running: vec![] }));
    let result = dispatcher.submit(&def, call(1)).await.unwrap();
    assert!(!result.is_attached());
    assert_eq!(submitter.count(), 1);
}

#[tokio::test]
async fn live_lock_survives_the_challenge() {
    let locks = memory_locks();
    let def = report().challenge_lock_on_startup(true);

    let key = locks
        .lock_key(&def, &[json!(1)], &Kwargs::from([("format".to_string(), json!("pdf"))]))
        .unwrap();
    let running = ExecutionId::from("running");
    assert!(locks.acquire(&key, &running, None).await.unwrap());

    let dispatcher = Dispatcher::new(locks, Arc::new(RecordingSubmitter::default()))
        .with_inspector(Arc::new(FakeInspector {
            running: vec![running.clone()],
        }));
    let result = dispatcher.submit(&def, call(1)).await.unwrap();
    assert_eq!(result, SubmitResult::Attached(ExecutionHandle::new(running)));
}
