//! Event Logger - persists run events to JSONL files
//!
//! The EventLogger drains a [`JsonlStream`] and appends each line to a per-run
//! `events.jsonl` file for history, debugging, and replay.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, error, warn};

use super::bus::EventBus;
use super::jsonl::{JsonlLimits, JsonlStream};
use super::types::{EventType, RunEvent};

/// Just enough of a line to route it
#[derive(Deserialize)]
struct LineHeader {
    #[serde(rename = "type")]
    event_type: EventType,
    #[serde(rename = "runId")]
    run_id: String,
}

/// Event logger that writes events to JSONL files
///
/// Events are written to `{runs_dir}/{run-id}/events.jsonl`
pub struct EventLogger {
    runs_dir: PathBuf,
    /// Open file writers per run
    writers: HashMap<String, BufWriter<File>>,
}

impl EventLogger {
    /// Create a new event logger
    pub fn new(runs_dir: impl AsRef<Path>) -> Self {
        let runs_dir = runs_dir.as_ref().to_path_buf();
        debug!(?runs_dir, "EventLogger::new: creating logger");
        Self {
            runs_dir,
            writers: HashMap::new(),
        }
    }

    /// Create a logger under `<data_dir>/runs`, creating the directory
    pub fn with_data_dir(data_dir: impl AsRef<Path>) -> eyre::Result<Self> {
        let runs_dir = data_dir.as_ref().join("runs");
        fs::create_dir_all(&runs_dir)?;
        Ok(Self::new(runs_dir))
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    /// Append one encoded line to its run's log; returns the routed event type
    pub fn write_line(&mut self, line: &str) -> eyre::Result<EventType> {
        let line = line.trim_end();
        let header: LineHeader = serde_json::from_str(line)?;
        let run_id = header.run_id.as_str();
        debug!(%run_id, event_type = %header.event_type, "EventLogger::write_line");

        if run_id.is_empty() || run_id.contains(['/', '\\']) || run_id == "." || run_id == ".." {
            return Err(eyre::eyre!("Refusing to log events for run id {:?}", run_id));
        }

        let writer = match self.writers.entry(run_id.to_string()) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                let run_dir = self.runs_dir.join(run_id);
                fs::create_dir_all(&run_dir)?;

                let log_path = run_dir.join("events.jsonl");
                debug!(?log_path, "EventLogger: creating new log file");

                let file = OpenOptions::new().create(true).append(true).open(&log_path)?;
                entry.insert(BufWriter::new(file))
            }
        };

        writeln!(writer, "{}", line)?;
        writer.flush()?;

        Ok(header.event_type)
    }

    /// Write an event to its run's log file
    pub fn write_event(&mut self, event: &RunEvent) -> eyre::Result<()> {
        let json = serde_json::to_string(event)?;
        self.write_line(&json)?;
        Ok(())
    }

    /// Close writer for a run (e.g., when it completes)
    pub fn close_run(&mut self, run_id: &str) {
        debug!(%run_id, "EventLogger::close_run");
        if let Some(mut writer) = self.writers.remove(run_id) {
            let _ = writer.flush();
        }
    }

    /// Run the logger, consuming lines until the stream is closed
    ///
    /// This is meant to be spawned as a background task.
    pub async fn run(mut self, stream: JsonlStream) {
        debug!("EventLogger::run: starting event logger");

        while let Some(line) = stream.next_line().await {
            match self.write_line(&line) {
                Ok(EventType::Completed | EventType::Cancelled) => {
                    if let Ok(header) = serde_json::from_str::<LineHeader>(line.trim_end()) {
                        self.close_run(&header.run_id);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "EventLogger: failed to write event");
                }
            }
        }

        for (run_id, mut writer) in self.writers.drain() {
            debug!(%run_id, "EventLogger: flushing writer on shutdown");
            let _ = writer.flush();
        }
        debug!("EventLogger::run: stream closed, shutting down");
    }
}

/// Read events from a run's log file
pub fn read_run_events(runs_dir: impl AsRef<Path>, run_id: &str) -> eyre::Result<Vec<RunEvent>> {
    let log_path = runs_dir.as_ref().join(run_id).join("events.jsonl");
    debug!(?log_path, "read_run_events: reading log file");

    if !log_path.exists() {
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(&log_path)?;
    let mut events = Vec::new();

    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<RunEvent>(line) {
            Ok(event) => events.push(event),
            Err(e) => {
                warn!(line, error = %e, "read_run_events: failed to parse line");
            }
        }
    }

    debug!(count = events.len(), "read_run_events: loaded events");
    Ok(events)
}

/// Subscribe a logger to `bus` and spawn it as a background task
///
/// Close the returned stream's closer (or drop the bus and close) to stop it.
pub fn spawn_event_logger(
    bus: &Arc<dyn EventBus>,
    runs_dir: impl AsRef<Path>,
) -> eyre::Result<(super::jsonl::JsonlCloser, tokio::task::JoinHandle<()>)> {
    fs::create_dir_all(runs_dir.as_ref())?;
    let logger = EventLogger::new(runs_dir);
    let stream = JsonlStream::subscribe(bus.as_ref(), JsonlLimits::default());
    let closer = stream.closer();
    let handle = tokio::spawn(async move {
        logger.run(stream).await;
    });
    Ok((closer, handle))
}
