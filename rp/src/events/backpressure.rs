//! Backpressure layer - bounded, coalescing staging in front of listeners
//!
//! Producers call [`BufferedEventBus::emit`], which never blocks and never
//! delivers: events are staged in a bounded queue and handed to listeners in
//! batches by a flush task that fires every `flush_interval_ms`.
//!
//! ```text
//!  emit ──► coalesce? ──► append ──► enforce bounds ──► schedule flush
//!                                        │
//!                         drop-oldest / drop-newest / coalesce
//!                         + prepend run/truncated marker
//!
//!  flush ──► detach whole queue ──► listeners (in order) ──► downstream bus
//! ```
//!
//! Bounds are restored before `emit` returns, so after every call the queue
//! holds at most `max_queue_size` events and `max_queue_bytes` serialized bytes,
//! truncation markers included.
//!
//! Flushing needs a tokio runtime. Without one, staged events stay queued until
//! [`BufferedEventBus::flush`] is called.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use super::bus::{EventBus, Listener, ListenerRegistry, Subscription};
use super::types::{EventKind, EventType, RunEvent, RunId, Truncated, TruncationReason, TruncationSide};
use crate::error::RunError;

/// Default flush cadence, roughly one batch per display frame
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 16;

/// Policy for discarding staged events once a bound is exceeded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DropStrategy {
    /// Remove from the head (oldest first)
    DropOldest,
    /// Remove from the tail (newest first)
    DropNewest,
    /// Remove the oldest droppable (progress/usage-like) event, else the head
    #[default]
    Coalesce,
}

/// Combines a still-queued event with its replacement
pub type Reducer = Arc<dyn Fn(&RunEvent, RunEvent) -> RunEvent + Send + Sync>;

/// Collapse events of the listed types staged within `window_ms` of each other
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CoalesceRule {
    pub types: Vec<EventType>,
    pub window_ms: u64,
    /// Optional combination of previous and next; default keeps the newer event
    #[serde(skip)]
    pub reducer: Option<Reducer>,
}

impl CoalesceRule {
    pub fn new(types: Vec<EventType>, window_ms: u64) -> Self {
        Self {
            types,
            window_ms,
            reducer: None,
        }
    }

    pub fn with_reducer(mut self, reducer: Reducer) -> Self {
        self.reducer = Some(reducer);
        self
    }

    fn matches(&self, event_type: EventType) -> bool {
        self.types.contains(&event_type)
    }
}

impl fmt::Debug for CoalesceRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoalesceRule")
            .field("types", &self.types)
            .field("window_ms", &self.window_ms)
            .field("reducer", &self.reducer.is_some())
            .finish()
    }
}

/// Reducers compare by identity
impl PartialEq for CoalesceRule {
    fn eq(&self, other: &Self) -> bool {
        let same_reducer = match (&self.reducer, &other.reducer) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        };
        self.types == other.types && self.window_ms == other.window_ms && same_reducer
    }
}

/// Immutable per-bus configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BackpressureConfig {
    /// Max number of events waiting to flush
    pub max_queue_size: usize,
    /// Max total serialized bytes of queued events
    pub max_queue_bytes: usize,
    /// Periodic flush cadence
    pub flush_interval_ms: u64,
    pub drop_strategy: DropStrategy,
    pub coalesce_rules: Vec<CoalesceRule>,
    /// Prepend a run/truncated marker whenever events are dropped
    pub insert_truncation_marker: bool,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            max_queue_bytes: 500_000,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            drop_strategy: DropStrategy::Coalesce,
            coalesce_rules: vec![CoalesceRule::new(vec![EventType::Progress, EventType::Usage], 50)],
            insert_truncation_marker: true,
        }
    }
}

impl BackpressureConfig {
    /// Reject bounds the queue could never satisfy
    pub fn validate(&self) -> Result<(), RunError> {
        if self.max_queue_size == 0 || self.max_queue_bytes == 0 {
            return Err(RunError::Validation(
                "backpressure queue bounds must be greater than zero".to_string(),
            ));
        }
        if self.flush_interval_ms == 0 {
            return Err(RunError::Validation(
                "backpressure flush interval must be greater than zero".to_string(),
            ));
        }
        if self.insert_truncation_marker && self.max_queue_size < 2 {
            return Err(RunError::Validation(
                "max-queue-size must leave room for a truncation marker (>= 2)".to_string(),
            ));
        }
        if self.coalesce_rules.iter().any(|r| r.types.contains(&EventType::Truncated)) {
            return Err(RunError::Validation(
                "run/truncated markers cannot be coalesced".to_string(),
            ));
        }
        Ok(())
    }

    fn rule_for(&self, event_type: EventType) -> Option<&CoalesceRule> {
        self.coalesce_rules.iter().find(|r| r.matches(event_type))
    }
}

struct Staged {
    event: RunEvent,
    bytes: usize,
    staged_at: Instant,
    /// Marker inserted by this layer rather than by a producer
    synthetic: bool,
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<Staged>,
    bytes: usize,
    flush_scheduled: bool,
    /// Thread currently handing a detached batch to listeners
    delivering: Option<ThreadId>,
    dropped_total: u64,
}

impl QueueState {
    fn within(&self, config: &BackpressureConfig, extra_events: usize, extra_bytes: usize) -> bool {
        self.queue.len() + extra_events <= config.max_queue_size
            && self.bytes + extra_bytes <= config.max_queue_bytes
    }

    fn remove(&mut self, idx: usize) -> Option<Staged> {
        let staged = self.queue.remove(idx)?;
        self.bytes -= staged.bytes;
        Some(staged)
    }
}

struct Shared {
    config: BackpressureConfig,
    listeners: Arc<ListenerRegistry>,
    downstream: Option<Arc<dyn EventBus>>,
    state: Mutex<QueueState>,
    idle: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn enqueue(&self, state: &mut QueueState, event: RunEvent, now: Instant) {
        let event_type = event.event_type();

        if let Some(rule) = self.config.rule_for(event_type)
            && let Some(idx) = state.queue.iter().rposition(|s| !s.synthetic && rule.matches(s.event.event_type()))
            && now.duration_since(state.queue[idx].staged_at) <= Duration::from_millis(rule.window_ms)
        {
            let merged = match &rule.reducer {
                Some(reduce) => reduce(&state.queue[idx].event, event),
                None => event,
            };
            let bytes = merged.serialized_size();
            let slot = &mut state.queue[idx];
            let old_bytes = slot.bytes;
            *slot = Staged {
                event: merged,
                bytes,
                staged_at: now,
                synthetic: false,
            };
            state.bytes = state.bytes - old_bytes + bytes;
            debug!(%event_type, idx, "BufferedEventBus: coalesced into queued event");
        } else {
            let bytes = event.serialized_size();
            state.queue.push_back(Staged {
                event,
                bytes,
                staged_at: now,
                synthetic: false,
            });
            state.bytes += bytes;
        }

        self.enforce_bounds(state);
    }

    /// Drop events until both bounds hold, then prepend one truncation marker.
    ///
    /// The new marker counts only the events removed by this pass. Markers from
    /// earlier passes that have not been flushed yet are folded into a single
    /// marker that stays right behind it, so the queue holds at most two.
    fn enforce_bounds(&self, state: &mut QueueState) -> u64 {
        let config = &self.config;
        if state.within(config, 0, 0) {
            return 0;
        }

        let reason = if state.queue.len() > config.max_queue_size {
            TruncationReason::MaxEvents
        } else {
            TruncationReason::MaxBytes
        };
        let run_id = state
            .queue
            .iter()
            .find(|s| !s.synthetic)
            .map(|s| s.event.run_id().clone())
            .unwrap_or_else(|| RunId::from("unknown"));

        let mut earlier: Vec<Staged> = Vec::new();
        if config.insert_truncation_marker {
            while state.queue.front().is_some_and(|s| s.synthetic) {
                if let Some(old) = state.remove(0) {
                    earlier.push(old);
                }
            }
        }
        let prior = fold_markers(earlier);
        let (prior_slot, prior_bytes) = prior.as_ref().map_or((0, 0), |p| (1, p.bytes));

        // One timestamp for every candidate marker keeps the size estimate exact
        let template = RunEvent::truncation_marker(run_id, 0, reason);
        let marker = |count: u64| {
            template.with_kind(EventKind::Truncated(Truncated {
                side: TruncationSide::Head,
                dropped: count,
                reason,
            }))
        };

        let mut dropped: u64 = 0;
        loop {
            let (slot, marker_bytes) = if config.insert_truncation_marker {
                (1 + prior_slot, marker(dropped + 1).serialized_size() + prior_bytes)
            } else {
                (0, 0)
            };
            if state.within(config, slot, marker_bytes) {
                break;
            }
            let Some(idx) = self.victim(state) else {
                break;
            };
            state.remove(idx);
            dropped += 1;
        }

        state.dropped_total += dropped;
        if dropped > 0 {
            warn!(
                dropped,
                ?reason,
                strategy = ?config.drop_strategy,
                queue_len = state.queue.len(),
                queue_bytes = state.bytes,
                "BufferedEventBus: queue over bounds, dropped events"
            );
        }

        if let Some(prior) = prior {
            if state.within(config, 1, prior.bytes) {
                state.bytes += prior.bytes;
                state.queue.push_front(prior);
            } else {
                warn!("BufferedEventBus: no room to keep earlier truncation marker");
            }
        }

        if config.insert_truncation_marker && dropped > 0 {
            let marker = marker(dropped);
            let bytes = marker.serialized_size();
            if state.within(config, 1, bytes) {
                state.queue.push_front(Staged {
                    event: marker,
                    bytes,
                    staged_at: Instant::now(),
                    synthetic: true,
                });
                state.bytes += bytes;
            } else {
                warn!(dropped, "BufferedEventBus: no room for truncation marker");
            }
        }

        dropped
    }

    fn victim(&self, state: &QueueState) -> Option<usize> {
        if state.queue.is_empty() {
            return None;
        }
        match self.config.drop_strategy {
            DropStrategy::DropNewest => Some(state.queue.len() - 1),
            DropStrategy::DropOldest => Some(0),
            DropStrategy::Coalesce => Some(
                state
                    .queue
                    .iter()
                    .position(|s| s.event.event_type().is_droppable())
                    .unwrap_or(0),
            ),
        }
    }

    /// Detach the queue and deliver it.
    ///
    /// With `wait`, a delivery already running on another thread is waited
    /// out first so that everything staged before the call has reached
    /// listeners on return. The timer passes `wait = false` and leaves the
    /// queue to the running delivery, which reschedules if needed.
    fn flush(self: &Arc<Self>, wait: bool) -> usize {
        let me = thread::current().id();
        let batch: Vec<RunEvent> = {
            let mut state = self.lock();
            state.flush_scheduled = false;
            if let Some(owner) = state.delivering {
                if !wait || owner == me {
                    debug!("BufferedEventBus::flush: delivery already in progress");
                    return 0;
                }
                debug!("BufferedEventBus::flush: waiting for in-flight delivery");
                while state.delivering.is_some() {
                    state = self.idle.wait(state).unwrap_or_else(|poisoned| poisoned.into_inner());
                }
            }
            if state.queue.is_empty() {
                return 0;
            }
            state.delivering = Some(me);
            state.bytes = 0;
            state.queue.drain(..).map(|s| s.event).collect()
        };

        debug!(count = batch.len(), "BufferedEventBus::flush: delivering batch");
        for event in &batch {
            self.listeners.deliver(event);
            if let Some(downstream) = &self.downstream {
                let forwarded = event.clone();
                if catch_unwind(AssertUnwindSafe(|| downstream.emit(forwarded))).is_err() {
                    warn!(event_type = %event.event_type(), "BufferedEventBus: downstream emit panicked");
                }
            }
        }

        let reschedule = {
            let mut state = self.lock();
            state.delivering = None;
            self.idle.notify_all();
            if !state.queue.is_empty() && !state.flush_scheduled {
                state.flush_scheduled = true;
                true
            } else {
                false
            }
        };
        if reschedule {
            schedule_flush(self);
        }

        batch.len()
    }
}

/// Collapse unflushed markers into one carrying their combined count
fn fold_markers(mut markers: Vec<Staged>) -> Option<Staged> {
    if markers.len() <= 1 {
        return markers.pop();
    }
    let total: u64 = markers.iter().filter_map(|m| m.event.truncated_count()).sum();
    let first = markers.swap_remove(0);
    let event = match first.event.kind() {
        EventKind::Truncated(t) => first.event.with_kind(EventKind::Truncated(Truncated {
            dropped: total,
            ..t.clone()
        })),
        _ => first.event.clone(),
    };
    let bytes = event.serialized_size();
    Some(Staged {
        event,
        bytes,
        staged_at: first.staged_at,
        synthetic: true,
    })
}

fn schedule_flush(shared: &Arc<Shared>) {
    match Handle::try_current() {
        Ok(handle) => {
            let delay = Duration::from_millis(shared.config.flush_interval_ms);
            let shared = Arc::clone(shared);
            handle.spawn(async move {
                tokio::time::sleep(delay).await;
                shared.flush(false);
            });
        }
        Err(_) => {
            debug!("BufferedEventBus: no tokio runtime, events stay staged until flush()");
            shared.lock().flush_scheduled = false;
        }
    }
}

/// Event bus that stages, coalesces and batch-delivers events
///
/// Cheap to clone; clones share one queue and listener list.
#[derive(Clone)]
pub struct BufferedEventBus {
    shared: Arc<Shared>,
}

impl BufferedEventBus {
    /// Create a bus, optionally forwarding every flushed event to `downstream`
    pub fn new(config: BackpressureConfig, downstream: Option<Arc<dyn EventBus>>) -> Self {
        debug!(?config, has_downstream = downstream.is_some(), "BufferedEventBus::new");
        Self {
            shared: Arc::new(Shared {
                config,
                listeners: ListenerRegistry::new(),
                downstream,
                state: Mutex::new(QueueState::default()),
                idle: Condvar::new(),
            }),
        }
    }

    pub fn with_default_config() -> Self {
        Self::new(BackpressureConfig::default(), None)
    }

    pub fn config(&self) -> &BackpressureConfig {
        &self.shared.config
    }

    /// Deliver everything staged right now; returns the number of events delivered
    ///
    /// Blocks until a timer delivery running on another thread has finished,
    /// then delivers whatever is still staged. Called from a listener during
    /// delivery it returns 0.
    pub fn flush(&self) -> usize {
        self.shared.flush(true)
    }

    pub fn queue_len(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn queue_bytes(&self) -> usize {
        self.shared.lock().bytes
    }

    /// Copy of the staged events, head first
    pub fn pending(&self) -> Vec<RunEvent> {
        self.shared.lock().queue.iter().map(|s| s.event.clone()).collect()
    }

    /// Events dropped by bound enforcement over the bus lifetime
    pub fn dropped_total(&self) -> u64 {
        self.shared.lock().dropped_total
    }

    pub fn listener_count(&self) -> usize {
        self.shared.listeners.len()
    }

    /// Wrap `downstream` so that `run/progress` is also published as
    /// `run/progress/snapshot` at most once per `interval`.
    ///
    /// A trailing snapshot of the last un-snapshotted progress event is emitted
    /// once the stream goes quiet (requires a tokio runtime).
    pub fn with_progress_snapshots(downstream: Arc<dyn EventBus>, interval: Duration) -> Self {
        let buffered = Self::new(BackpressureConfig::default(), Some(downstream));
        let tracker = Arc::new(Mutex::new(SnapshotTracker::default()));

        let weak = Arc::downgrade(&buffered.shared);
        let listener_tracker = Arc::clone(&tracker);
        let listener: Listener = Arc::new(move |event: &RunEvent| {
            let EventKind::Progress(_) = event.kind() else {
                return;
            };
            let due = {
                let mut t = listener_tracker.lock().unwrap_or_else(|p| p.into_inner());
                let now = Instant::now();
                if t.last.is_none_or(|last| now.duration_since(last) >= interval) {
                    t.last = Some(now);
                    t.pending = None;
                    true
                } else {
                    t.pending = Some(event.clone());
                    false
                }
            };
            if due {
                emit_snapshot(&weak, event);
            }
        });
        let _ = buffered.on(listener);

        if let Ok(handle) = Handle::try_current() {
            let weak = Arc::downgrade(&buffered.shared);
            let period = interval.max(Duration::from_millis(100));
            handle.spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    ticker.tick().await;
                    if weak.strong_count() == 0 {
                        debug!("progress snapshots: bus dropped, stopping trailing timer");
                        break;
                    }
                    let pending = {
                        let mut t = tracker.lock().unwrap_or_else(|p| p.into_inner());
                        let pending = t.pending.take();
                        if pending.is_some() {
                            t.last = Some(Instant::now());
                        }
                        pending
                    };
                    if let Some(event) = pending {
                        emit_snapshot(&weak, &event);
                    }
                }
            });
        }

        buffered
    }
}

#[derive(Default)]
struct SnapshotTracker {
    last: Option<Instant>,
    pending: Option<RunEvent>,
}

fn emit_snapshot(bus: &Weak<Shared>, progress: &RunEvent) {
    let EventKind::Progress(payload) = progress.kind() else {
        return;
    };
    if let Some(shared) = bus.upgrade() {
        let snapshot = progress.with_kind(EventKind::ProgressSnapshot(payload.clone()));
        BufferedEventBus { shared }.emit(snapshot);
    }
}

impl EventBus for BufferedEventBus {
    fn emit(&self, event: RunEvent) {
        debug!(event_type = %event.event_type(), run_id = %event.run_id(), "BufferedEventBus::emit");
        let schedule = {
            let mut state = self.shared.lock();
            self.shared.enqueue(&mut state, event, Instant::now());
            if state.flush_scheduled {
                false
            } else {
                state.flush_scheduled = true;
                true
            }
        };
        if schedule {
            schedule_flush(&self.shared);
        }
    }

    fn on(&self, listener: Listener) -> Subscription {
        self.shared.listeners.add(listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::bus::SimpleEventBus;
    use crate::events::types::{CommitPayload, ErrorPayload, Progress, UsagePayload};
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn run() -> RunId {
        RunId::from("run-bp")
    }

    fn progress(msg: &str) -> RunEvent {
        RunEvent::new(
            run(),
            EventKind::Progress(Progress {
                message: msg.to_string(),
                ..Default::default()
            }),
        )
    }

    fn usage(total: u64) -> RunEvent {
        RunEvent::new(
            run(),
            EventKind::Usage(UsagePayload {
                total_tokens: total,
                ..Default::default()
            }),
        )
    }

    fn commit(sha: &str) -> RunEvent {
        RunEvent::new(
            run(),
            EventKind::Commit(CommitPayload {
                proposal_id: "p1".to_string(),
                commit_sha: sha.to_string(),
                message: "commit".to_string(),
            }),
        )
    }

    fn error(msg: &str) -> RunEvent {
        RunEvent::new(
            run(),
            EventKind::Error(ErrorPayload {
                message: msg.to_string(),
                ..Default::default()
            }),
        )
    }

    fn config(max_queue_size: usize, drop_strategy: DropStrategy) -> BackpressureConfig {
        BackpressureConfig {
            max_queue_size,
            max_queue_bytes: 1_000_000,
            flush_interval_ms: 10_000,
            drop_strategy,
            coalesce_rules: vec![],
            insert_truncation_marker: true,
        }
    }

    fn collect(bus: &dyn EventBus) -> (Subscription, Arc<Mutex<Vec<RunEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = bus.on(Arc::new(move |e: &RunEvent| sink.lock().unwrap().push(e.clone())));
        (sub, seen)
    }

    fn shas(events: &[RunEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e.kind() {
                EventKind::Commit(c) => Some(c.commit_sha.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_emit_stages_without_delivering() {
        let bus = BufferedEventBus::new(config(10, DropStrategy::DropOldest), None);
        let (_sub, seen) = collect(&bus);

        bus.emit(commit("a"));
        bus.emit(commit("b"));

        assert_eq!(bus.queue_len(), 2);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_flush_delivers_in_order_and_resets() {
        let downstream = Arc::new(SimpleEventBus::new());
        let (_ds_sub, ds_seen) = collect(downstream.as_ref());
        let bus = BufferedEventBus::new(config(10, DropStrategy::DropOldest), Some(downstream));
        let (_sub, seen) = collect(&bus);

        bus.emit(commit("a"));
        bus.emit(commit("b"));
        bus.emit(commit("c"));
        assert_eq!(bus.flush(), 3);

        assert_eq!(shas(&seen.lock().unwrap()), vec!["a", "b", "c"]);
        assert_eq!(shas(&ds_seen.lock().unwrap()), vec!["a", "b", "c"]);
        assert_eq!(bus.queue_len(), 0);
        assert_eq!(bus.queue_bytes(), 0);
        assert_eq!(bus.flush(), 0);
    }

    #[test]
    fn test_drop_oldest_inserts_single_marker() {
        let bus = BufferedEventBus::new(config(5, DropStrategy::DropOldest), None);
        for sha in ["a", "b", "c", "d", "e"] {
            bus.emit(commit(sha));
        }
        assert_eq!(bus.queue_len(), 5);

        bus.emit(commit("f"));
        let pending = bus.pending();

        assert_eq!(pending.len(), 5);
        assert_eq!(pending[0].truncated_count(), Some(2));
        assert_eq!(pending.iter().filter(|e| e.event_type() == EventType::Truncated).count(), 1);
        assert_eq!(shas(&pending), vec!["c", "d", "e", "f"]);
        assert_eq!(bus.dropped_total(), 2);
    }

    #[test]
    fn test_each_pass_marker_counts_only_its_own_drops() {
        let bus = BufferedEventBus::new(config(5, DropStrategy::DropOldest), None);
        for sha in ["a", "b", "c", "d", "e", "f"] {
            bus.emit(commit(sha));
        }
        let before = bus.dropped_total();
        assert_eq!(before, 2);

        bus.emit(commit("g"));

        let pending = bus.pending();
        assert_eq!(pending.len(), 5);
        assert_eq!(pending[0].truncated_count(), Some(bus.dropped_total() - before));
        assert_eq!(pending[0].truncated_count(), Some(2));
        assert_eq!(pending[1].truncated_count(), Some(2));
        assert_eq!(shas(&pending), vec!["e", "f", "g"]);
    }

    #[test]
    fn test_marker_matches_dropped_delta_every_pass() {
        let bus = BufferedEventBus::new(config(5, DropStrategy::DropOldest), None);
        for i in 0..30 {
            let before = bus.dropped_total();
            bus.emit(commit(&format!("sha-{}", i)));
            let delta = bus.dropped_total() - before;

            let pending = bus.pending();
            assert!(pending.len() <= 5);
            let markers: Vec<u64> = pending.iter().filter_map(|e| e.truncated_count()).collect();
            assert!(markers.len() <= 2);
            if delta > 0 {
                assert_eq!(pending[0].truncated_count(), Some(delta));
            }
            // Every unflushed drop is still accounted for by some marker
            assert_eq!(markers.iter().sum::<u64>(), bus.dropped_total());
        }
    }

    #[test]
    fn test_drop_newest_keeps_head() {
        let bus = BufferedEventBus::new(config(4, DropStrategy::DropNewest), None);
        for sha in ["a", "b", "c", "d", "e"] {
            bus.emit(commit(sha));
        }

        let pending = bus.pending();
        assert_eq!(pending.len(), 4);
        assert_eq!(pending[0].truncated_count(), Some(2));
        assert_eq!(shas(&pending), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_coalesce_strategy_prefers_droppable_types() {
        let bus = BufferedEventBus::new(config(4, DropStrategy::Coalesce), None);
        bus.emit(error("boom"));
        bus.emit(progress("p1"));
        bus.emit(commit("a"));
        bus.emit(usage(10));
        bus.emit(commit("b"));

        let pending = bus.pending();
        assert_eq!(pending.len(), 4);
        assert_eq!(pending[0].truncated_count(), Some(2));
        let types: Vec<EventType> = pending.iter().map(|e| e.event_type()).collect();
        assert_eq!(
            types,
            vec![EventType::Truncated, EventType::Error, EventType::Commit, EventType::Commit]
        );
    }

    #[test]
    fn test_coalesce_strategy_falls_back_to_head() {
        let bus = BufferedEventBus::new(config(3, DropStrategy::Coalesce), None);
        for sha in ["a", "b", "c", "d"] {
            bus.emit(commit(sha));
        }

        let pending = bus.pending();
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[0].truncated_count(), Some(2));
        assert_eq!(shas(&pending), vec!["c", "d"]);
    }

    #[test]
    fn test_no_marker_when_disabled() {
        let mut cfg = config(3, DropStrategy::DropOldest);
        cfg.insert_truncation_marker = false;
        let bus = BufferedEventBus::new(cfg, None);
        for sha in ["a", "b", "c", "d"] {
            bus.emit(commit(sha));
        }

        let pending = bus.pending();
        assert_eq!(shas(&pending), vec!["b", "c", "d"]);
        assert!(pending.iter().all(|e| e.event_type() != EventType::Truncated));
    }

    #[test]
    fn test_byte_bound_reports_max_bytes() {
        let one = commit("a").serialized_size();
        let mut cfg = config(100, DropStrategy::DropOldest);
        cfg.max_queue_bytes = one * 4;
        let bus = BufferedEventBus::new(cfg.clone(), None);

        for sha in ["a", "b", "c", "d", "e", "f"] {
            bus.emit(commit(sha));
            assert!(bus.queue_bytes() <= cfg.max_queue_bytes);
        }

        let pending = bus.pending();
        match pending[0].kind() {
            EventKind::Truncated(t) => assert_eq!(t.reason, TruncationReason::MaxBytes),
            other => panic!("Expected truncation marker, got {:?}", other),
        }
        let recount: usize = pending.iter().map(|e| e.serialized_size()).sum();
        assert_eq!(recount, bus.queue_bytes());
    }

    #[test]
    fn test_coalescing_keeps_last_within_window() {
        let mut cfg = config(100, DropStrategy::Coalesce);
        cfg.coalesce_rules = vec![CoalesceRule::new(vec![EventType::Progress], 60_000)];
        let bus = BufferedEventBus::new(cfg, None);

        bus.emit(commit("a"));
        for i in 0..10 {
            bus.emit(progress(&format!("step {}", i)));
        }

        let pending = bus.pending();
        assert_eq!(pending.len(), 2);
        match pending[1].kind() {
            EventKind::Progress(p) => assert_eq!(p.message, "step 9"),
            other => panic!("Expected progress, got {:?}", other),
        }
        let recount: usize = pending.iter().map(|e| e.serialized_size()).sum();
        assert_eq!(recount, bus.queue_bytes());
    }

    #[test]
    fn test_coalescing_replaces_in_place_across_rule_types() {
        let mut cfg = config(100, DropStrategy::Coalesce);
        cfg.coalesce_rules = vec![CoalesceRule::new(vec![EventType::Progress, EventType::Usage], 60_000)];
        let bus = BufferedEventBus::new(cfg, None);

        bus.emit(progress("first"));
        bus.emit(commit("a"));
        bus.emit(usage(5));

        // The rule's slot is shared by both types; the usage takes the progress position
        let types: Vec<EventType> = bus.pending().iter().map(|e| e.event_type()).collect();
        assert_eq!(types, vec![EventType::Usage, EventType::Commit]);
    }

    #[test]
    fn test_coalescing_outside_window_appends() {
        let mut cfg = config(100, DropStrategy::Coalesce);
        cfg.coalesce_rules = vec![CoalesceRule::new(vec![EventType::Progress], 0)];
        let bus = BufferedEventBus::new(cfg, None);

        bus.emit(progress("a"));
        std::thread::sleep(Duration::from_millis(5));
        bus.emit(progress("b"));

        assert_eq!(bus.queue_len(), 2);
    }

    #[test]
    fn test_coalescing_reducer() {
        let reducer: Reducer = Arc::new(|prev: &RunEvent, next: RunEvent| match (prev.kind(), next.kind()) {
            (EventKind::Usage(a), EventKind::Usage(b)) => next.with_kind(EventKind::Usage(UsagePayload {
                total_tokens: a.total_tokens + b.total_tokens,
                ..b.clone()
            })),
            _ => next,
        });
        let mut cfg = config(100, DropStrategy::Coalesce);
        cfg.coalesce_rules = vec![CoalesceRule::new(vec![EventType::Usage], 60_000).with_reducer(reducer)];
        let bus = BufferedEventBus::new(cfg, None);

        bus.emit(usage(1));
        bus.emit(usage(2));
        bus.emit(usage(3));

        let pending = bus.pending();
        assert_eq!(pending.len(), 1);
        match pending[0].kind() {
            EventKind::Usage(u) => assert_eq!(u.total_tokens, 6),
            other => panic!("Expected usage, got {:?}", other),
        }
    }

    #[test]
    fn test_panicking_listener_does_not_block_flush() {
        let bus = BufferedEventBus::new(config(10, DropStrategy::DropOldest), None);
        let _bad = bus.on(Arc::new(|e: &RunEvent| {
            if e.event_type() == EventType::Commit {
                panic!("listener bug");
            }
        }));
        let (_sub, seen) = collect(&bus);

        bus.emit(commit("a"));
        bus.emit(commit("b"));
        bus.flush();

        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_config_validation() {
        assert!(BackpressureConfig::default().validate().is_ok());

        let mut cfg = BackpressureConfig::default();
        cfg.max_queue_size = 1;
        assert!(cfg.validate().is_err());
        cfg.insert_truncation_marker = false;
        assert!(cfg.validate().is_ok());

        let mut cfg = BackpressureConfig::default();
        cfg.flush_interval_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_config_from_yaml() {
        let yaml = r#"
max-queue-size: 50
drop-strategy: drop-newest
coalesce-rules:
  - types: ["run/progress"]
    window-ms: 25
"#;
        let cfg: BackpressureConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.max_queue_size, 50);
        assert_eq!(cfg.drop_strategy, DropStrategy::DropNewest);
        assert_eq!(cfg.coalesce_rules[0].types, vec![EventType::Progress]);
        assert_eq!(cfg.max_queue_bytes, 500_000);
    }

    #[tokio::test]
    async fn test_timer_flushes_batch() {
        let mut cfg = config(100, DropStrategy::DropOldest);
        cfg.flush_interval_ms = 5;
        let bus = BufferedEventBus::new(cfg, None);
        let (_sub, seen) = collect(&bus);

        bus.emit(commit("a"));
        bus.emit(commit("b"));
        assert!(seen.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(shas(&seen.lock().unwrap()), vec!["a", "b"]);
        assert_eq!(bus.queue_len(), 0);

        bus.emit(commit("c"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(shas(&seen.lock().unwrap()), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_listener_emitting_during_flush_is_delivered_later() {
        let mut cfg = config(100, DropStrategy::DropOldest);
        cfg.flush_interval_ms = 5;
        let bus = BufferedEventBus::new(cfg, None);

        let echo = bus.clone();
        let _echo = bus.on(Arc::new(move |e: &RunEvent| {
            if let EventKind::Commit(c) = e.kind()
                && c.commit_sha == "a"
            {
                echo.emit(commit("echo"));
            }
        }));
        let (_sub, seen) = collect(&bus);

        bus.emit(commit("a"));
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(shas(&seen.lock().unwrap()), vec!["a", "echo"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_explicit_flush_waits_for_timer_delivery() {
        let mut cfg = config(100, DropStrategy::DropOldest);
        cfg.flush_interval_ms = 1;
        let bus = BufferedEventBus::new(cfg, None);

        let started = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&started);
        let _slow = bus.on(Arc::new(move |e: &RunEvent| {
            if let EventKind::Commit(c) = e.kind()
                && c.commit_sha == "a"
            {
                flag.store(true, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(100));
            }
        }));
        let (_sub, seen) = collect(&bus);

        bus.emit(commit("a"));
        while !started.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        // The timer task is still inside the slow listener
        bus.emit(commit("b"));
        bus.emit(commit("c"));
        bus.flush();

        assert_eq!(shas(&seen.lock().unwrap()), vec!["a", "b", "c"]);
        assert_eq!(bus.queue_len(), 0);
    }

    #[tokio::test]
    async fn test_progress_snapshots() {
        let downstream = Arc::new(SimpleEventBus::new());
        let (_sub, seen) = collect(downstream.as_ref());
        let bus = BufferedEventBus::with_progress_snapshots(downstream, Duration::from_secs(60));

        bus.emit(progress("one"));
        tokio::time::sleep(Duration::from_millis(80)).await;

        let seen = seen.lock().unwrap();
        let types: Vec<EventType> = seen.iter().map(|e| e.event_type()).collect();
        assert_eq!(types, vec![EventType::Progress, EventType::ProgressSnapshot]);
    }

    fn arb_event() -> impl Strategy<Value = RunEvent> {
        (0u8..4, 0usize..300).prop_map(|(kind, len)| {
            let text = "x".repeat(len);
            match kind {
                0 => progress(&text),
                1 => usage(len as u64),
                2 => commit(&text),
                _ => error(&text),
            }
        })
    }

    fn arb_strategy() -> impl Strategy<Value = DropStrategy> {
        prop_oneof![
            Just(DropStrategy::DropOldest),
            Just(DropStrategy::DropNewest),
            Just(DropStrategy::Coalesce),
        ]
    }

    proptest! {
        #[test]
        fn prop_queue_never_exceeds_bounds(
            events in prop::collection::vec(arb_event(), 1..80),
            max_size in 2usize..12,
            max_bytes in 800usize..4000,
            strategy in arb_strategy(),
            marker in any::<bool>(),
        ) {
            let cfg = BackpressureConfig {
                max_queue_size: max_size,
                max_queue_bytes: max_bytes,
                flush_interval_ms: 10_000,
                drop_strategy: strategy,
                coalesce_rules: vec![CoalesceRule::new(vec![EventType::Progress], 60_000)],
                insert_truncation_marker: marker,
            };
            let bus = BufferedEventBus::new(cfg, None);
            for event in events {
                bus.emit(event);
                prop_assert!(bus.queue_len() <= max_size);
                prop_assert!(bus.queue_bytes() <= max_bytes);

                let pending = bus.pending();
                let markers: Vec<u64> = pending.iter().filter_map(|e| e.truncated_count()).collect();
                prop_assert!(markers.len() <= 2);
                prop_assert!(pending.iter().take(markers.len()).all(|e| e.event_type() == EventType::Truncated));
                if marker {
                    prop_assert_eq!(markers.iter().sum::<u64>(), bus.dropped_total());
                } else {
                    prop_assert!(markers.is_empty());
                }
            }
        }
    }
}
