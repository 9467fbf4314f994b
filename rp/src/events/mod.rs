//! Event streaming for run observability
//!
//! Every significant thing a run does becomes a [`RunEvent`]. Producers emit onto
//! the run's bus; the backpressure layer stages and batches; consumers (recorder,
//! JSONL logger, UI bridges) subscribe.
//!
//! # Architecture
//!
//! ```text
//!    Orchestrator      Telemetry        File engine       Git
//!    emits:            emits:           emits:            emits:
//!    - run/started     - run/usage      - file/proposal   - git/branch-created
//!    - run/progress    - llm/request-*  - file/diff       - git/commit
//!    - run/completed   - run/budget-*   - proposal-state
//!         │                 │                 │                │
//!         ↓                 ↓                 ↓                ↓
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      BUFFERED EVENT BUS                           │
//! │   bounded queue · coalescing · drop strategy · run/truncated      │
//! │                 periodic flush (tokio timer)                      │
//! └──────────────────────────────────────────────────────────────────┘
//!         │                 │                 │
//!         ↓                 ↓                 ↓
//! ┌─────────────┐   ┌─────────────┐   ┌─────────────┐
//! │  Recorder   │   │ JSONL file  │   │ Downstream  │
//! │ (transcript)│   │   logger    │   │  bus / UI   │
//! └─────────────┘   └─────────────┘   └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use runplane::events::{BackpressureConfig, BufferedEventBus, EventBus};
//! use runplane::RunHandle;
//! use std::sync::Arc;
//!
//! let bus: Arc<dyn EventBus> = Arc::new(BufferedEventBus::new(BackpressureConfig::default(), None));
//! let run = RunHandle::new(bus.clone());
//!
//! let sub = bus.on(Arc::new(|event| println!("{}", event.event_type())));
//! run.started("proj-1", None);
//! run.progress("planning", Some(0.1));
//! ```

mod backpressure;
mod bus;
mod jsonl;
mod logger;
mod types;

pub use backpressure::{
    BackpressureConfig, BufferedEventBus, CoalesceRule, DEFAULT_FLUSH_INTERVAL_MS, DropStrategy, Reducer,
};
pub use bus::{EventBus, Listener, ListenerRegistry, SimpleEventBus, Subscription, create_event_bus};
pub use jsonl::{JsonlCloser, JsonlLimits, JsonlStream};
pub use logger::{EventLogger, read_run_events, spawn_event_logger};
pub use types::{
    BranchCreated, BudgetExceeded, BudgetMetric, Cancelled, CommitPayload, Completed, DiffPayload, ErrorPayload,
    EventKind, EventType, FileChangeSummary, FileDiffHunk, FileStatus, Progress, ProposalPayload, ProposalState,
    ProposalStatePayload, RequestDelta, RequestFinished, RequestStarted, RetryPayload, RunEvent, RunId, RunStarted,
    Stopped, Truncated, TruncationReason, TruncationSide, UsagePayload,
};
