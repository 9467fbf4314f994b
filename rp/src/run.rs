//! Run handle - identity, bus and cooperative cancellation for one run
//!
//! Cancellation is advisory. [`RunHandle::cancel`] flips the flag, fires the
//! cancellation token and emits `run/cancelled`; producers are expected to poll
//! [`RunHandle::check_cancelled`] (or await the token) between units of work.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::RunError;
use crate::events::{
    BranchCreated, Cancelled, CommitPayload, Completed, DiffPayload, ErrorPayload, EventBus, EventKind,
    FileChangeSummary, FileDiffHunk, Listener, Progress, ProposalPayload, ProposalState, ProposalStatePayload,
    RetryPayload, RunEvent, RunId, RunStarted, Subscription, UsagePayload,
};
use crate::retry::{RetryPolicy, retry};

struct Inner {
    id: RunId,
    bus: Arc<dyn EventBus>,
    cancelled: AtomicBool,
    token: CancellationToken,
}

/// Shared handle to a run; clones refer to the same run
#[derive(Clone)]
pub struct RunHandle {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("id", &self.inner.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl RunHandle {
    /// Create a run with a freshly generated id
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self::with_id(RunId::generate(), bus)
    }

    pub fn with_id(id: RunId, bus: Arc<dyn EventBus>) -> Self {
        debug!(run_id = %id, "RunHandle::new");
        Self {
            inner: Arc::new(Inner {
                id,
                bus,
                cancelled: AtomicBool::new(false),
                token: CancellationToken::new(),
            }),
        }
    }

    pub fn id(&self) -> &RunId {
        &self.inner.id
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.inner.bus
    }

    /// Subscribe to the run's bus
    pub fn on_event(&self, listener: Listener) -> Subscription {
        self.inner.bus.on(listener)
    }

    /// Stamp `kind` with this run's id and the current time, then emit it
    pub fn emit(&self, kind: EventKind) {
        self.inner.bus.emit(RunEvent::new(self.inner.id.clone(), kind));
    }

    /// Emit a fully-formed event; rejects events that belong to another run
    pub fn publish(&self, event: RunEvent) -> Result<(), RunError> {
        if event.run_id() != &self.inner.id {
            return Err(RunError::Validation(format!(
                "event for run {} published on run {}",
                event.run_id(),
                self.inner.id
            )));
        }
        self.inner.bus.emit(event);
        Ok(())
    }

    // === Cancellation ===

    /// Request cancellation. Only the first call has any effect; returns whether
    /// this call was the one that cancelled.
    pub fn cancel(&self, reason: Option<&str>) -> bool {
        if self
            .inner
            .cancelled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(run_id = %self.inner.id, "RunHandle::cancel: already cancelled");
            return false;
        }
        info!(run_id = %self.inner.id, reason = reason.unwrap_or("none"), "RunHandle::cancel");
        self.inner.token.cancel();
        self.emit(EventKind::Cancelled(Cancelled {
            reason: reason.map(str::to_string),
        }));
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// `Err(Aborted)` once the run has been cancelled
    pub fn check_cancelled(&self) -> Result<(), RunError> {
        if self.is_cancelled() {
            Err(RunError::Aborted(format!("run {} cancelled", self.inner.id)))
        } else {
            Ok(())
        }
    }

    /// Resolves once the run is cancelled
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await;
    }

    /// Token that fires when the run is cancelled
    ///
    /// This is a child token: cancelling it does not cancel the run.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.token.child_token()
    }

    /// Run `op` with retries, emitting `error/retry` before each backoff
    pub async fn retry<T, F, Fut>(&self, policy: &RetryPolicy, op: F) -> Result<T, RunError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RunError>>,
    {
        let token = self.cancellation_token();
        retry(
            policy,
            &token,
            |notice| {
                self.emit(EventKind::Retry(RetryPayload {
                    error: notice.error.to_payload(),
                    attempt: notice.attempt,
                    next_delay_ms: notice.delay.as_millis() as u64,
                }))
            },
            op,
        )
        .await
    }

    // === Convenience emitters ===

    /// Emit a run started event
    pub fn started(&self, project_id: &str, task_id: Option<&str>) {
        self.emit(EventKind::RunStarted(RunStarted {
            project_id: project_id.to_string(),
            task_id: task_id.map(str::to_string),
            ..Default::default()
        }));
    }

    /// Emit a progress update
    pub fn progress(&self, message: &str, progress: Option<f64>) {
        self.emit(EventKind::Progress(Progress {
            message: message.to_string(),
            progress,
            ..Default::default()
        }));
    }

    pub fn usage(&self, usage: UsagePayload) {
        self.emit(EventKind::Usage(usage));
    }

    /// Emit a redacted `run/error` for `error`
    pub fn error(&self, error: &RunError) {
        self.emit(EventKind::Error(error.to_payload()));
    }

    pub fn error_payload(&self, payload: ErrorPayload) {
        self.emit(EventKind::Error(payload));
    }

    pub fn proposal(&self, proposal_id: &str, title: Option<&str>, summary: Option<FileChangeSummary>) {
        self.emit(EventKind::Proposal(ProposalPayload {
            proposal_id: proposal_id.to_string(),
            title: title.map(str::to_string),
            summary,
        }));
    }

    pub fn diff(&self, proposal_id: &str, files: Vec<FileDiffHunk>, summary: FileChangeSummary) {
        self.emit(EventKind::Diff(DiffPayload {
            proposal_id: proposal_id.to_string(),
            files,
            summary,
        }));
    }

    pub fn proposal_state(&self, proposal_id: &str, state: ProposalState) {
        self.emit(EventKind::ProposalState(ProposalStatePayload {
            proposal_id: proposal_id.to_string(),
            state,
        }));
    }

    pub fn branch_created(&self, branch_name: &str, base: Option<&str>) {
        self.emit(EventKind::BranchCreated(BranchCreated {
            branch_name: branch_name.to_string(),
            base: base.map(str::to_string),
        }));
    }

    pub fn commit(&self, proposal_id: &str, commit_sha: &str, message: &str) {
        self.emit(EventKind::Commit(CommitPayload {
            proposal_id: proposal_id.to_string(),
            commit_sha: commit_sha.to_string(),
            message: message.to_string(),
        }));
    }

    /// Emit a run completed event
    pub fn completed(&self, success: bool, usage: Option<UsagePayload>, message: Option<&str>) {
        self.emit(EventKind::Completed(Completed {
            success,
            usage,
            message: message.map(str::to_string),
        }));
    }
}

/// Sleep for `duration` unless `token` fires first (`Err(Aborted)`)
pub async fn abortable_sleep(token: &CancellationToken, duration: Duration) -> Result<(), RunError> {
    if token.is_cancelled() {
        return Err(RunError::Aborted("cancelled before delay".to_string()));
    }
    tokio::select! {
        _ = token.cancelled() => Err(RunError::Aborted("cancelled during delay".to_string())),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventType, SimpleEventBus};
    use std::sync::Mutex;

    fn handle() -> (RunHandle, Arc<Mutex<Vec<RunEvent>>>) {
        let bus: Arc<dyn EventBus> = Arc::new(SimpleEventBus::new());
        let run = RunHandle::with_id(RunId::from("run-h"), bus);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = run.on_event(Arc::new(move |e: &RunEvent| sink.lock().unwrap().push(e.clone())));
        (run, seen)
    }

    #[test]
    fn test_new_generates_id() {
        let bus: Arc<dyn EventBus> = Arc::new(SimpleEventBus::new());
        let a = RunHandle::new(bus.clone());
        let b = RunHandle::new(bus);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let (run, seen) = handle();
        assert!(!run.is_cancelled());

        assert!(run.cancel(Some("user request")));
        assert!(!run.cancel(Some("again")));
        assert!(run.is_cancelled());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        match seen[0].kind() {
            EventKind::Cancelled(c) => assert_eq!(c.reason.as_deref(), Some("user request")),
            other => panic!("Expected cancelled, got {:?}", other),
        }
    }

    #[test]
    fn test_cancel_fires_tokens() {
        let (run, _seen) = handle();
        let token = run.cancellation_token();
        assert!(!token.is_cancelled());
        run.cancel(None);
        assert!(token.is_cancelled());
        assert!(run.cancellation_token().is_cancelled());
    }

    #[test]
    fn test_child_token_does_not_cancel_run() {
        let (run, seen) = handle();
        run.cancellation_token().cancel();
        assert!(!run.is_cancelled());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_check_cancelled() {
        let (run, _seen) = handle();
        assert!(run.check_cancelled().is_ok());
        run.cancel(None);
        assert!(run.check_cancelled().unwrap_err().is_aborted());
    }

    #[test]
    fn test_publish_rejects_foreign_run() {
        let (run, seen) = handle();
        let foreign = RunEvent::new(RunId::from("other"), EventKind::Cancelled(Cancelled { reason: None }));
        assert!(run.publish(foreign).is_err());

        let own = RunEvent::new(RunId::from("run-h"), EventKind::Cancelled(Cancelled { reason: None }));
        assert!(run.publish(own).is_ok());
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_convenience_emitters_stamp_run_id() {
        let (run, seen) = handle();
        run.started("proj", Some("task-1"));
        run.progress("working", Some(0.5));
        run.commit("p1", "abc", "msg");
        run.completed(true, None, None);

        let seen = seen.lock().unwrap();
        let types: Vec<EventType> = seen.iter().map(|e| e.event_type()).collect();
        assert_eq!(
            types,
            vec![EventType::RunStarted, EventType::Progress, EventType::Commit, EventType::Completed]
        );
        assert!(seen.iter().all(|e| e.run_id().as_str() == "run-h"));
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves() {
        let (run, _seen) = handle();
        let waiter = run.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });
        run.cancel(None);
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_abortable_sleep() {
        let token = CancellationToken::new();
        assert!(abortable_sleep(&token, Duration::from_millis(1)).await.is_ok());

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });
        let result = abortable_sleep(&token, Duration::from_secs(30)).await;
        assert!(result.unwrap_err().is_aborted());
    }

    #[tokio::test]
    async fn test_retry_emits_retry_events() {
        let (run, seen) = handle();
        let policy = RetryPolicy {
            retries: 2,
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            factor: 2.0,
            jitter: false,
        };
        let mut calls = 0;
        let result = run
            .retry(&policy, || {
                calls += 1;
                let outcome = if calls < 3 {
                    Err(RunError::from_status(429, "slow down"))
                } else {
                    Ok(calls)
                };
                async move { outcome }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        let seen = seen.lock().unwrap();
        let retries: Vec<&RetryPayload> = seen
            .iter()
            .filter_map(|e| match e.kind() {
                EventKind::Retry(r) => Some(r),
                _ => None,
            })
            .collect();
        assert_eq!(retries.len(), 2);
        assert_eq!(retries[0].attempt, 1);
        assert_eq!(retries[1].attempt, 2);
        assert_eq!(retries[0].error.code.as_deref(), Some("RATE_LIMIT"));
    }
}
