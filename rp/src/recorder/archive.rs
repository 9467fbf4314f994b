//! Run archive export and import
//!
//! An archive is a single JSON document holding a run's metadata, final usage,
//! its recorded (capped, redacted) events and the derived proposal/commit
//! state. Archives are versioned; import refuses anything but
//! [`ARCHIVE_VERSION`].

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use super::record::{CommitSnapshot, ProposalSnapshot, RunMeta, RunRecord};
use super::redact::Redactor;
use super::registry::Recorder;
use crate::error::RunError;
use crate::events::{EventBus, RunEvent, RunId, UsagePayload};

pub const ARCHIVE_VERSION: &str = "runplane.run-archive.v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveStats {
    pub events: usize,
    /// Size of the exported JSON; absent inside the JSON itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunArchive {
    pub version: String,
    pub meta: RunMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsagePayload>,
    pub events: Vec<RunEvent>,
    #[serde(default)]
    pub proposals: Vec<ProposalSnapshot>,
    #[serde(default)]
    pub commits: Vec<CommitSnapshot>,
    pub stats: ArchiveStats,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportOptions {
    /// Fail if the encoded archive is larger than this
    pub max_bytes: Option<usize>,
    /// Run events through redaction again on the way out
    pub redact_secrets: bool,
    pub pretty: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            max_bytes: None,
            redact_secrets: true,
            pretty: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExportedArchive {
    pub archive: RunArchive,
    pub json: String,
    pub bytes: usize,
}

/// Build an archive from a recorded run
pub fn export_run(recorder: &Recorder, run_id: &RunId, options: &ExportOptions) -> Result<ExportedArchive, RunError> {
    debug!(%run_id, ?options, "export_run");
    let missing = || RunError::Validation(format!("No recorded run found for run id {}", run_id));
    let record = recorder.record(run_id).ok_or_else(missing)?;
    let meta = record.meta.clone().ok_or_else(missing)?;

    let events: Vec<RunEvent> = if options.redact_secrets {
        let redactor = if recorder.redactor().is_enabled() {
            recorder.redactor()
        } else {
            Redactor::shared()
        };
        record.events.iter().map(|e| redactor.redact_event(e)).collect()
    } else {
        record.events.clone()
    };

    let mut archive = RunArchive {
        version: ARCHIVE_VERSION.to_string(),
        meta,
        usage: record.usage.clone(),
        stats: ArchiveStats {
            events: events.len(),
            bytes: None,
        },
        events,
        proposals: record.proposals.values().cloned().collect(),
        commits: record.commits.clone(),
        created_at: Utc::now(),
    };

    let json = if options.pretty {
        serde_json::to_string_pretty(&archive)?
    } else {
        serde_json::to_string(&archive)?
    };
    let bytes = json.len();
    if let Some(max) = options.max_bytes
        && bytes > max
    {
        return Err(RunError::Validation(format!(
            "Archive exceeds size limit ({} > {} bytes)",
            bytes, max
        )));
    }
    archive.stats.bytes = Some(bytes);

    info!(%run_id, events = archive.stats.events, bytes, "export_run: archive built");
    Ok(ExportedArchive { archive, json, bytes })
}

/// Write an exported archive to `path`, creating parent directories
pub fn write_archive(path: &Path, exported: &ExportedArchive) -> Result<(), RunError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, &exported.json)?;
    debug!(path = %path.display(), bytes = exported.bytes, "write_archive");
    Ok(())
}

/// Parse and version-check archive JSON
pub fn parse_archive(json: &str) -> Result<RunArchive, RunError> {
    let value: Value =
        serde_json::from_str(json).map_err(|e| RunError::Validation(format!("Archive is not valid JSON: {}", e)))?;

    let version = value.get("version").and_then(Value::as_str);
    if version != Some(ARCHIVE_VERSION) {
        return Err(RunError::Validation(format!(
            "Unsupported or invalid archive version: {}",
            version.unwrap_or("<missing>")
        )));
    }

    serde_json::from_value(value).map_err(|e| RunError::Validation(format!("Malformed archive: {}", e)))
}

/// Read an archive from disk
pub fn import_archive(path: &Path) -> Result<ImportedRun, RunError> {
    let data = fs::read_to_string(path)?;
    let archive = parse_archive(&data)?;
    info!(path = %path.display(), run_id = %archive.meta.run_id, events = archive.events.len(), "import_archive");
    Ok(ImportedRun {
        run_id: archive.meta.run_id.clone(),
        archive,
    })
}

/// A run loaded back from an archive
#[derive(Debug, Clone)]
pub struct ImportedRun {
    pub run_id: RunId,
    pub archive: RunArchive,
}

impl ImportedRun {
    /// Re-emit the archived events in order; returns how many were emitted
    pub fn replay(&self, bus: &dyn EventBus) -> usize {
        for event in &self.archive.events {
            bus.emit(event.clone());
        }
        debug!(run_id = %self.run_id, count = self.archive.events.len(), "ImportedRun::replay");
        self.archive.events.len()
    }

    /// Rebuild a [`RunRecord`] suitable for [`Recorder::import`]
    pub fn to_record(&self) -> RunRecord {
        RunRecord::restore(
            self.archive.meta.clone(),
            self.archive.usage.clone(),
            self.archive.events.clone(),
            self.archive.proposals.clone(),
            self.archive.commits.clone(),
        )
    }
}
