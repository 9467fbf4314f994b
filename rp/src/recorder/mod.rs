//! Transcript recorder
//!
//! Turns a run's unbounded event stream into a bounded, redacted [`RunRecord`]
//! and exports it as a versioned [`RunArchive`].
//!
//! Each observed event goes through the same pipeline:
//!
//! 1. deep redaction of payload strings and sensitive keys (original untouched)
//! 2. free-text fields capped at `max-message-chars`
//! 3. derived state folded in (meta, usage, proposals, commits, terminal flags)
//! 4. appended, then head-dropped under `max-events` / `max-total-bytes` with a
//!    single cumulative `run/truncated` marker in front

mod archive;
mod record;
mod redact;
mod registry;

pub use archive::{
    ARCHIVE_VERSION, ArchiveStats, ExportOptions, ExportedArchive, ImportedRun, RunArchive, export_run,
    import_archive, parse_archive, write_archive,
};
pub use record::{CommitSnapshot, ProposalSnapshot, RunMeta, RunRecord, StateChange, TranscriptLimits};
pub use redact::{PatternRule, REDACTED, RedactionConfig, Redactor, TruncateStrategy, truncate_str};
pub use registry::Recorder;
