//! Event types for run activity streaming
//!
//! Every event a run produces shares one envelope, serialized as
//! `{type, payload, time, runId}`:
//! - Run lifecycle (started, progress, completed, cancelled, stopped)
//! - Usage and budget accounting
//! - File proposals and diffs, git branches and commits
//! - Synthetic truncation markers inserted when history is dropped

use std::borrow::Borrow;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque run identity, unique per run
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Generate a fresh, time-ordered run ID
    pub fn generate() -> Self {
        Self(format!("run-{}", uuid::Uuid::now_v7()))
    }

    /// Get the ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RunId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for RunId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Discriminant of a [`RunEvent`], matching the wire `type` string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "run/started")]
    RunStarted,
    #[serde(rename = "run/progress")]
    Progress,
    #[serde(rename = "run/progress/snapshot")]
    ProgressSnapshot,
    #[serde(rename = "run/usage")]
    Usage,
    #[serde(rename = "run/budget-exceeded")]
    BudgetExceeded,
    #[serde(rename = "run/error")]
    Error,
    #[serde(rename = "error/retry")]
    Retry,
    #[serde(rename = "file/proposal")]
    Proposal,
    #[serde(rename = "file/diff")]
    Diff,
    #[serde(rename = "file/proposal-state")]
    ProposalState,
    #[serde(rename = "git/branch-created")]
    BranchCreated,
    #[serde(rename = "git/commit")]
    Commit,
    #[serde(rename = "llm/request-started")]
    RequestStarted,
    #[serde(rename = "llm/request-delta")]
    RequestDelta,
    #[serde(rename = "llm/request-finished")]
    RequestFinished,
    #[serde(rename = "run/truncated")]
    Truncated,
    #[serde(rename = "run/stopped")]
    Stopped,
    #[serde(rename = "run/completed")]
    Completed,
    #[serde(rename = "run/cancelled")]
    Cancelled,
}

impl EventType {
    /// Wire name of this event type
    pub const fn as_str(self) -> &'static str {
        match self {
            EventType::RunStarted => "run/started",
            EventType::Progress => "run/progress",
            EventType::ProgressSnapshot => "run/progress/snapshot",
            EventType::Usage => "run/usage",
            EventType::BudgetExceeded => "run/budget-exceeded",
            EventType::Error => "run/error",
            EventType::Retry => "error/retry",
            EventType::Proposal => "file/proposal",
            EventType::Diff => "file/diff",
            EventType::ProposalState => "file/proposal-state",
            EventType::BranchCreated => "git/branch-created",
            EventType::Commit => "git/commit",
            EventType::RequestStarted => "llm/request-started",
            EventType::RequestDelta => "llm/request-delta",
            EventType::RequestFinished => "llm/request-finished",
            EventType::Truncated => "run/truncated",
            EventType::Stopped => "run/stopped",
            EventType::Completed => "run/completed",
            EventType::Cancelled => "run/cancelled",
        }
    }

    /// High-frequency types that a newer event of the same kind supersedes.
    ///
    /// These are the first to go when a queue has to shed load.
    pub const fn is_droppable(self) -> bool {
        matches!(
            self,
            EventType::Progress | EventType::ProgressSnapshot | EventType::Usage | EventType::RequestDelta
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type-specific payload of a [`RunEvent`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum EventKind {
    // === Run Lifecycle ===
    #[serde(rename = "run/started")]
    RunStarted(RunStarted),
    #[serde(rename = "run/progress")]
    Progress(Progress),
    /// Coalesced variant of progress
    #[serde(rename = "run/progress/snapshot")]
    ProgressSnapshot(Progress),
    #[serde(rename = "run/completed")]
    Completed(Completed),
    #[serde(rename = "run/cancelled")]
    Cancelled(Cancelled),
    /// Emitted by telemetry once the run has been stopped for good
    #[serde(rename = "run/stopped")]
    Stopped(Stopped),

    // === Usage & Budget ===
    #[serde(rename = "run/usage")]
    Usage(UsagePayload),
    #[serde(rename = "run/budget-exceeded")]
    BudgetExceeded(BudgetExceeded),
    #[serde(rename = "llm/request-started")]
    RequestStarted(RequestStarted),
    #[serde(rename = "llm/request-delta")]
    RequestDelta(RequestDelta),
    #[serde(rename = "llm/request-finished")]
    RequestFinished(RequestFinished),

    // === Errors ===
    #[serde(rename = "run/error")]
    Error(ErrorPayload),
    #[serde(rename = "error/retry")]
    Retry(RetryPayload),

    // === Files & Git ===
    #[serde(rename = "file/proposal")]
    Proposal(ProposalPayload),
    #[serde(rename = "file/diff")]
    Diff(DiffPayload),
    #[serde(rename = "file/proposal-state")]
    ProposalState(ProposalStatePayload),
    #[serde(rename = "git/branch-created")]
    BranchCreated(BranchCreated),
    #[serde(rename = "git/commit")]
    Commit(CommitPayload),

    // === Synthetic ===
    /// Marker recording that earlier events were discarded; never producer-emitted
    #[serde(rename = "run/truncated")]
    Truncated(Truncated),
}

impl EventKind {
    /// Get the event type discriminant
    pub fn event_type(&self) -> EventType {
        match self {
            EventKind::RunStarted(_) => EventType::RunStarted,
            EventKind::Progress(_) => EventType::Progress,
            EventKind::ProgressSnapshot(_) => EventType::ProgressSnapshot,
            EventKind::Completed(_) => EventType::Completed,
            EventKind::Cancelled(_) => EventType::Cancelled,
            EventKind::Stopped(_) => EventType::Stopped,
            EventKind::Usage(_) => EventType::Usage,
            EventKind::BudgetExceeded(_) => EventType::BudgetExceeded,
            EventKind::RequestStarted(_) => EventType::RequestStarted,
            EventKind::RequestDelta(_) => EventType::RequestDelta,
            EventKind::RequestFinished(_) => EventType::RequestFinished,
            EventKind::Error(_) => EventType::Error,
            EventKind::Retry(_) => EventType::Retry,
            EventKind::Proposal(_) => EventType::Proposal,
            EventKind::Diff(_) => EventType::Diff,
            EventKind::ProposalState(_) => EventType::ProposalState,
            EventKind::BranchCreated(_) => EventType::BranchCreated,
            EventKind::Commit(_) => EventType::Commit,
            EventKind::Truncated(_) => EventType::Truncated,
        }
    }
}

/// One immutable event produced by a run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    #[serde(flatten)]
    kind: EventKind,
    time: DateTime<Utc>,
    #[serde(rename = "runId")]
    run_id: RunId,
}

impl RunEvent {
    /// Create an event stamped with the current time
    pub fn new(run_id: RunId, kind: EventKind) -> Self {
        Self::at(run_id, Utc::now(), kind)
    }

    /// Create an event with an explicit timestamp
    pub fn at(run_id: RunId, time: DateTime<Utc>, kind: EventKind) -> Self {
        Self { kind, time, run_id }
    }

    /// Build a `run/truncated` marker for `dropped` discarded events
    pub fn truncation_marker(run_id: RunId, dropped: u64, reason: TruncationReason) -> Self {
        Self::new(
            run_id,
            EventKind::Truncated(Truncated {
                side: TruncationSide::Head,
                dropped,
                reason,
            }),
        )
    }

    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn event_type(&self) -> EventType {
        self.kind.event_type()
    }

    /// Produce a new event with the same identity and time but a different payload
    pub fn with_kind(&self, kind: EventKind) -> Self {
        Self {
            kind,
            time: self.time,
            run_id: self.run_id.clone(),
        }
    }

    /// Consume the event, returning its payload
    pub fn into_kind(self) -> EventKind {
        self.kind
    }

    /// Number of dropped events if this is a truncation marker
    pub fn truncated_count(&self) -> Option<u64> {
        match &self.kind {
            EventKind::Truncated(t) => Some(t.dropped),
            _ => None,
        }
    }

    /// Size of the JSON encoding in bytes (0 if it cannot be encoded)
    pub fn serialized_size(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}

// === Payloads ===

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStarted {
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_id: Option<String>,
    /// Free-form metadata; `labels` is lifted into the run record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    /// Fraction complete, 0.0..=1.0
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsagePayload>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsagePayload {
    pub requests: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    #[serde(rename = "costUSD", default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

/// Which budget ceiling tripped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetMetric {
    Tokens,
    Cost,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BudgetExceeded {
    pub metric: BudgetMetric,
    pub value: f64,
    pub limit: f64,
    #[serde(flatten)]
    pub usage: UsagePayload,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStarted {
    pub request_id: String,
    pub model: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestDelta {
    pub request_id: String,
    pub model: String,
    pub delta_tokens_out: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestFinished {
    pub request_id: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// May be redacted or truncated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPayload {
    pub error: ErrorPayload,
    pub attempt: u32,
    pub next_delay_ms: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChangeSummary {
    pub added: u32,
    pub modified: u32,
    pub deleted: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Added,
    Modified,
    Deleted,
    Renamed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDiffHunk {
    /// Normalized relative to the project root
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_path: Option<String>,
    pub status: FileStatus,
    pub unified_diff: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalPayload {
    pub proposal_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<FileChangeSummary>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffPayload {
    pub proposal_id: String,
    pub files: Vec<FileDiffHunk>,
    pub summary: FileChangeSummary,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalState {
    Open,
    Accepted,
    Rejected,
    Partial,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalStatePayload {
    pub proposal_id: String,
    pub state: ProposalState,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchCreated {
    pub branch_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitPayload {
    pub proposal_id: String,
    pub commit_sha: String,
    pub message: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TruncationSide {
    Head,
    Tail,
}

/// Which bound forced events to be dropped
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TruncationReason {
    #[serde(rename = "maxEvents")]
    MaxEvents,
    #[serde(rename = "maxBytes")]
    MaxBytes,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Truncated {
    #[serde(rename = "where")]
    pub side: TruncationSide,
    pub dropped: u64,
    pub reason: TruncationReason,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Completed {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsagePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Cancelled {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stopped {
    pub reason: String,
}
