//! Process-scoped registry of run records

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use tracing::{debug, info, warn};

use super::record::{RunRecord, TranscriptLimits};
use super::redact::Redactor;
use crate::events::{RunEvent, RunId, Subscription};
use crate::run::RunHandle;

type SharedRecord = Arc<Mutex<RunRecord>>;

fn lock_record(record: &SharedRecord) -> MutexGuard<'_, RunRecord> {
    record.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Subscribes to runs and keeps a sanitized, capped [`RunRecord`] for each
///
/// Records are created on first reference and live until [`Recorder::evict`];
/// nothing is collected implicitly.
pub struct Recorder {
    limits: TranscriptLimits,
    redactor: Arc<Redactor>,
    runs: RwLock<HashMap<RunId, SharedRecord>>,
    subscriptions: Mutex<HashMap<RunId, Subscription>>,
}

impl Recorder {
    pub fn new(limits: TranscriptLimits, redactor: Arc<Redactor>) -> Arc<Self> {
        debug!(?limits, redact = redactor.is_enabled(), "Recorder::new");
        Arc::new(Self {
            limits,
            redactor,
            runs: RwLock::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(TranscriptLimits::default(), Arc::new(Redactor::default()))
    }

    pub fn limits(&self) -> &TranscriptLimits {
        &self.limits
    }

    pub fn redactor(&self) -> &Redactor {
        &self.redactor
    }

    fn subscriptions(&self) -> MutexGuard<'_, HashMap<RunId, Subscription>> {
        self.subscriptions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn entry(&self, run_id: &RunId) -> SharedRecord {
        if let Some(record) = self.runs.read().unwrap_or_else(|p| p.into_inner()).get(run_id) {
            return Arc::clone(record);
        }
        let mut runs = self.runs.write().unwrap_or_else(|p| p.into_inner());
        Arc::clone(
            runs.entry(run_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(RunRecord::new(run_id.clone())))),
        )
    }

    /// Start recording `handle`'s events; returns false if already attached
    pub fn attach(self: &Arc<Self>, handle: &RunHandle) -> bool {
        let run_id = handle.id().clone();
        let mut subscriptions = self.subscriptions();
        if subscriptions.contains_key(&run_id) {
            debug!(%run_id, "Recorder::attach: already attached");
            return false;
        }

        let record = self.entry(&run_id);
        let recorder: Weak<Self> = Arc::downgrade(self);
        let target = run_id.clone();
        let subscription = handle.on_event(Arc::new(move |event: &RunEvent| {
            if event.run_id() != &target {
                return;
            }
            if let Some(recorder) = recorder.upgrade() {
                recorder.ingest_into(&record, event);
            }
        }));
        subscriptions.insert(run_id.clone(), subscription);
        info!(%run_id, "Recorder: attached");
        true
    }

    /// Stop recording a run; the record itself is kept
    pub fn detach(&self, run_id: &RunId) -> bool {
        let Some(subscription) = self.subscriptions().remove(run_id) else {
            return false;
        };
        subscription.unsubscribe();
        info!(%run_id, "Recorder: detached");
        true
    }

    fn ingest_into(&self, record: &SharedRecord, event: &RunEvent) {
        let result = catch_unwind(AssertUnwindSafe(|| {
            lock_record(record).ingest(event, &self.limits, &self.redactor);
        }));
        if result.is_err() {
            warn!(
                run_id = %event.run_id(),
                event_type = %event.event_type(),
                "Recorder: failed to process event, continuing"
            );
        }
    }

    /// Cloned snapshot of a run's record
    pub fn record(&self, run_id: &RunId) -> Option<RunRecord> {
        let runs = self.runs.read().unwrap_or_else(|p| p.into_inner());
        runs.get(run_id).map(|r| lock_record(r).clone())
    }

    /// Known run ids, sorted
    pub fn run_ids(&self) -> Vec<RunId> {
        let runs = self.runs.read().unwrap_or_else(|p| p.into_inner());
        let mut ids: Vec<RunId> = runs.keys().cloned().collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids
    }

    /// Detach and forget a run, returning its final record
    pub fn evict(&self, run_id: &RunId) -> Option<RunRecord> {
        self.detach(run_id);
        let removed = self.runs.write().unwrap_or_else(|p| p.into_inner()).remove(run_id)?;
        debug!(%run_id, "Recorder::evict");
        let record = lock_record(&removed).clone();
        Some(record)
    }

    /// Install a record built elsewhere (e.g. from an archive), replacing any existing one
    pub fn import(&self, record: RunRecord) {
        let run_id = record.run_id.clone();
        debug!(%run_id, events = record.events.len(), "Recorder::import");
        self.runs
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(run_id, Arc::new(Mutex::new(record)));
    }
}
