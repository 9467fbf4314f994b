//! Runplane - run-control plane for coding-agent runs
//!
//! Runplane sits between an agent's producers (orchestrator steps, LLM
//! adapters, file and git collaborators) and its consumers (UIs, logs,
//! archives). Every significant thing a run does is a typed [`RunEvent`] on the
//! run's bus; the core keeps that stream bounded, accounted and recordable.
//!
//! # Core Concepts
//!
//! - **Bounded Streams**: Staging queues, JSONL buffers and transcripts all have
//!   hard caps and say so with a `run/truncated` marker when they drop
//! - **Cooperative Cancellation**: Cancelling a run is a signal; producers check it
//! - **Budgets Stop Runs**: Token/cost ceilings trip once and cancel the run
//! - **Redacted Records**: Nothing secret-shaped reaches a transcript or archive
//!
//! # Modules
//!
//! - [`events`] - Event model, bus, backpressure, JSONL streaming and logging
//! - [`run`] - Run handle with cancellation and convenience emitters
//! - [`telemetry`] - Usage/cost accounting with budget enforcement
//! - [`recorder`] - Transcript records, redaction and archives
//! - [`retry`] - Cancellable exponential backoff
//! - [`error`] - Error taxonomy
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod recorder;
pub mod retry;
pub mod run;
pub mod telemetry;

// Re-export commonly used types
pub use config::{Config, StorageConfig};
pub use error::{ErrorCode, RunError};
pub use events::{
    BackpressureConfig, BufferedEventBus, DropStrategy, EventBus, EventKind, EventType, RunEvent, RunId,
    SimpleEventBus, Subscription, create_event_bus,
};
pub use recorder::{
    ExportOptions, ImportedRun, Recorder, RedactionConfig, Redactor, RunArchive, RunRecord, TranscriptLimits,
    export_run, import_archive,
};
pub use retry::{RetryPolicy, retry};
pub use run::{RunHandle, abortable_sleep};
pub use telemetry::{PricingTable, RunBudget, Telemetry, TelemetrySnapshot, TelemetryStatus};
