//! Per-run transcript record and the ingest pipeline that builds it

use std::borrow::Cow;
use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::redact::{Redactor, TruncateStrategy, truncate_str};
use crate::error::RunError;
use crate::events::{
    ErrorPayload, EventKind, FileChangeSummary, FileDiffHunk, ProposalState, RunEvent, RunId, Truncated,
    TruncationReason, TruncationSide, UsagePayload,
};

/// Per-run caps applied while recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TranscriptLimits {
    /// Events kept, not counting the truncation marker
    pub max_events: usize,
    /// Cumulative serialized bytes, marker included
    pub max_total_bytes: usize,
    /// Cap for free-text payload fields, in characters
    pub max_message_chars: usize,
    pub truncation_strategy: TruncateStrategy,
}

impl Default for TranscriptLimits {
    fn default() -> Self {
        Self {
            max_events: 5000,
            max_total_bytes: 2_000_000,
            max_message_chars: 8000,
            truncation_strategy: TruncateStrategy::Middle,
        }
    }
}

impl TranscriptLimits {
    pub fn validate(&self) -> Result<(), RunError> {
        if self.max_events == 0 || self.max_total_bytes == 0 || self.max_message_chars == 0 {
            return Err(RunError::Validation(
                "transcript max-events, max-total-bytes and max-message-chars must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Metadata seeded from `run/started`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMeta {
    pub run_id: RunId,
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub state: ProposalState,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalSnapshot {
    pub proposal_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<FileChangeSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diffs: Option<Vec<FileDiffHunk>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub states: Vec<StateChange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitSnapshot {
    pub proposal_id: String,
    pub commit_sha: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
}

/// Everything recorded for one run
///
/// Events are sanitized copies: redacted, text fields capped, and bounded by
/// [`TranscriptLimits`]. When events have been dropped the first entry is a
/// single cumulative `run/truncated` marker.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub run_id: RunId,
    pub meta: Option<RunMeta>,
    pub events: Vec<RunEvent>,
    /// Serialized size of `events`
    pub bytes: usize,
    pub usage: Option<UsagePayload>,
    pub proposals: BTreeMap<String, ProposalSnapshot>,
    pub commits: Vec<CommitSnapshot>,
    pub error: Option<ErrorPayload>,
    pub completed: bool,
    pub cancelled: bool,
    pub stop_reason: Option<String>,
    head_marker: bool,
}

impl RunRecord {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            meta: None,
            events: Vec::new(),
            bytes: 0,
            usage: None,
            proposals: BTreeMap::new(),
            commits: Vec::new(),
            error: None,
            completed: false,
            cancelled: false,
            stop_reason: None,
            head_marker: false,
        }
    }

    /// Total events dropped by cap enforcement so far
    pub fn dropped(&self) -> u64 {
        if self.head_marker {
            self.events.first().and_then(RunEvent::truncated_count).unwrap_or(0)
        } else {
            0
        }
    }

    /// Rebuild a record from previously exported parts
    ///
    /// Derived state is taken as given; events are not re-processed.
    pub(crate) fn restore(
        meta: RunMeta,
        usage: Option<UsagePayload>,
        events: Vec<RunEvent>,
        proposals: Vec<ProposalSnapshot>,
        commits: Vec<CommitSnapshot>,
    ) -> Self {
        let mut record = Self::new(meta.run_id.clone());
        record.bytes = events.iter().map(RunEvent::serialized_size).sum();
        for event in &events {
            match event.kind() {
                EventKind::Error(e) => record.error = Some(e.clone()),
                EventKind::Completed(_) => record.completed = true,
                EventKind::Cancelled(_) => record.cancelled = true,
                EventKind::Stopped(s) => record.stop_reason = Some(s.reason.clone()),
                _ => {}
            }
        }
        record.meta = Some(meta);
        record.usage = usage;
        record.events = events;
        record.proposals = proposals.into_iter().map(|p| (p.proposal_id.clone(), p)).collect();
        record.commits = commits;
        record
    }

    /// Sanitize `event`, fold it into derived state and append it under the caps
    pub(crate) fn ingest(&mut self, event: &RunEvent, limits: &TranscriptLimits, redactor: &Redactor) {
        let redacted = redactor.redact_event(event);
        let mut kind = redacted.kind().clone();
        cap_text_fields(&mut kind, limits);
        let sanitized = redacted.with_kind(kind);

        self.fold(&sanitized);

        self.bytes += sanitized.serialized_size();
        self.events.push(sanitized);
        self.enforce_caps(limits);
    }

    fn fold(&mut self, event: &RunEvent) {
        match event.kind() {
            EventKind::RunStarted(started) => {
                self.meta = Some(RunMeta {
                    run_id: self.run_id.clone(),
                    project_id: started.project_id.clone(),
                    task_id: started.task_id.clone(),
                    feature_id: started.feature_id.clone(),
                    created_at: event.time(),
                    labels: started.meta.as_ref().and_then(labels_from_meta),
                });
            }
            EventKind::Usage(usage) => self.usage = Some(usage.clone()),
            EventKind::BudgetExceeded(exceeded) => self.usage = Some(exceeded.usage.clone()),
            EventKind::Proposal(p) => {
                let entry = self.proposal_entry(&p.proposal_id);
                if p.title.is_some() {
                    entry.title = p.title.clone();
                }
                if p.summary.is_some() {
                    entry.summary = p.summary;
                }
            }
            EventKind::Diff(d) => {
                let entry = self.proposal_entry(&d.proposal_id);
                entry.summary = Some(d.summary);
                entry.diffs = Some(d.files.clone());
            }
            EventKind::ProposalState(s) => {
                let time = event.time();
                self.proposal_entry(&s.proposal_id).states.push(StateChange { state: s.state, time });
            }
            EventKind::Commit(c) => self.commits.push(CommitSnapshot {
                proposal_id: c.proposal_id.clone(),
                commit_sha: c.commit_sha.clone(),
                message: Some(c.message.clone()),
                time: Some(event.time()),
            }),
            EventKind::Error(e) => self.error = Some(e.clone()),
            EventKind::Completed(_) => self.completed = true,
            EventKind::Cancelled(_) => self.cancelled = true,
            EventKind::Stopped(s) => self.stop_reason = Some(s.reason.clone()),
            _ => {}
        }
    }

    fn proposal_entry(&mut self, proposal_id: &str) -> &mut ProposalSnapshot {
        self.proposals
            .entry(proposal_id.to_string())
            .or_insert_with(|| ProposalSnapshot {
                proposal_id: proposal_id.to_string(),
                ..Default::default()
            })
    }

    fn kept_events(&self) -> usize {
        self.events.len() - usize::from(self.head_marker)
    }

    /// Drop from the head until both caps hold, leaving one cumulative marker
    fn enforce_caps(&mut self, limits: &TranscriptLimits) {
        let reason = if self.kept_events() > limits.max_events {
            TruncationReason::MaxEvents
        } else if self.bytes > limits.max_total_bytes {
            TruncationReason::MaxBytes
        } else {
            return;
        };

        let mut events: VecDeque<RunEvent> = std::mem::take(&mut self.events).into();
        let mut dropped = 0u64;
        if self.head_marker
            && let Some(marker) = events.pop_front()
        {
            self.bytes -= marker.serialized_size();
            dropped = marker.truncated_count().unwrap_or(0);
            self.head_marker = false;
        }

        // Reserve room for the largest marker this pass could produce
        let template = RunEvent::truncation_marker(self.run_id.clone(), 0, reason);
        let marker_for = |count: u64| {
            template.with_kind(EventKind::Truncated(Truncated {
                side: TruncationSide::Head,
                dropped: count,
                reason,
            }))
        };
        let reserve = marker_for(dropped + events.len() as u64).serialized_size();

        let before = dropped;
        while !events.is_empty()
            && (events.len() > limits.max_events || self.bytes + reserve > limits.max_total_bytes)
        {
            if let Some(victim) = events.pop_front() {
                self.bytes -= victim.serialized_size();
                dropped += 1;
            }
        }

        let marker = marker_for(dropped);
        self.bytes += marker.serialized_size();
        if self.bytes > limits.max_total_bytes {
            warn!(
                run_id = %self.run_id,
                bytes = self.bytes,
                max_total_bytes = limits.max_total_bytes,
                "RunRecord: truncation marker alone exceeds byte cap"
            );
        }
        events.push_front(marker);
        self.head_marker = true;
        self.events = events.into();

        debug!(
            run_id = %self.run_id,
            ?reason,
            dropped_now = dropped - before,
            dropped_total = dropped,
            kept = self.kept_events(),
            bytes = self.bytes,
            "RunRecord: enforced transcript caps"
        );
    }
}

fn labels_from_meta(meta: &Value) -> Option<BTreeMap<String, String>> {
    let labels = meta.get("labels")?.as_object()?;
    Some(
        labels
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect(),
    )
}

/// Cap the free-text fields a run tends to blow up: messages, stacks, reasons
fn cap_text_fields(kind: &mut EventKind, limits: &TranscriptLimits) {
    let cap = |s: &mut String| {
        if let Cow::Owned(capped) = truncate_str(s, limits.max_message_chars, limits.truncation_strategy) {
            *s = capped;
        }
    };
    let cap_opt = |s: &mut Option<String>| {
        if let Some(s) = s.as_mut() {
            cap(s);
        }
    };

    match kind {
        EventKind::Progress(p) | EventKind::ProgressSnapshot(p) => cap(&mut p.message),
        EventKind::Error(e) => {
            cap(&mut e.message);
            cap_opt(&mut e.stack);
        }
        EventKind::Retry(r) => {
            cap(&mut r.error.message);
            cap_opt(&mut r.error.stack);
        }
        EventKind::Commit(c) => cap(&mut c.message),
        EventKind::Completed(c) => cap_opt(&mut c.message),
        EventKind::Cancelled(c) => cap_opt(&mut c.reason),
        EventKind::Stopped(s) => cap(&mut s.reason),
        _ => {}
    }
}
