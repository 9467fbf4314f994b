//! Runplane CLI
//!
//! Simulates runs end to end and inspects or replays the archives they leave.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use serde_json::json;
use tracing::{debug, info};

use runplane::cli::{Cli, Command, OutputFormat, get_log_path};
use runplane::config::Config;
use runplane::events::{
    BufferedEventBus, EventBus, EventKind, FileChangeSummary, FileDiffHunk, FileStatus, ProposalState, RunEvent,
    SimpleEventBus, create_event_bus, spawn_event_logger,
};
use runplane::recorder::{ExportOptions, Recorder, Redactor, RunArchive, export_run, import_archive, write_archive};
use runplane::run::RunHandle;
use runplane::telemetry::{RunBudget, Telemetry};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Note: Can't log params here since logging isn't initialized yet
    let log_path = get_log_path();
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    // Determine log level with priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(&log_path).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(Mutex::new(log_file))
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration (file chain + RUNPLANE_* overrides)
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    // Setup logging with priority: CLI > config > INFO default
    setup_logging(cli.log_level.as_deref(), config.log_level.as_deref()).context("Failed to setup logging")?;

    config.validate().context("Invalid configuration")?;
    info!(data_dir = %config.storage.data_dir.display(), "Runplane loaded config");

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Simulate {
            steps,
            budget_usd,
            model,
            project,
            output,
        } => cmd_simulate(&config, steps, budget_usd, &model, &project, output).await,
        Command::Inspect { archive, format } => cmd_inspect(&archive, format),
        Command::Replay { archive } => cmd_replay(&archive),
        Command::Config => cmd_config(&config),
    }
}

async fn cmd_simulate(
    config: &Config,
    steps: u32,
    budget_usd: Option<f64>,
    model: &str,
    project: &str,
    output: Option<PathBuf>,
) -> Result<()> {
    info!(steps, ?budget_usd, %model, %project, "cmd_simulate");

    let downstream = create_event_bus();
    let buffered = BufferedEventBus::new(config.backpressure.clone(), Some(downstream));
    let bus: Arc<dyn EventBus> = Arc::new(buffered.clone());

    let redactor = Arc::new(Redactor::new(&config.redaction)?);
    let recorder = Recorder::new(config.transcript, redactor);
    let run = RunHandle::new(Arc::clone(&bus));
    recorder.attach(&run);

    let (closer, logger) = spawn_event_logger(&bus, config.storage.runs_dir())?;

    let budget = RunBudget {
        max_cost_usd: budget_usd.or(config.budget.max_cost_usd),
        max_tokens: config.budget.max_tokens,
    };
    let telemetry = Telemetry::new(run.clone(), Arc::new(config.pricing_table()), Some(budget));

    run.started(project, None);
    for step in 1..=steps {
        if run.check_cancelled().is_err() {
            info!(step, "cmd_simulate: run cancelled, stopping early");
            break;
        }
        run.progress(&format!("step {}/{}", step, steps), Some(step as f64 / steps as f64));

        let request_id = format!("req-{}", step);
        telemetry.request_started(&request_id, model);
        for _ in 0..4 {
            telemetry.stream_delta(&request_id, 50);
            if telemetry.is_stopped() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        telemetry.request_finished(&request_id, model, 400, 200);

        if step == steps.div_ceil(2) && !run.is_cancelled() {
            let proposal_id = format!("proposal-{}", step);
            let summary = FileChangeSummary {
                added: 0,
                modified: 1,
                deleted: 0,
            };
            run.proposal(&proposal_id, Some("Simulated change"), Some(summary));
            run.diff(
                &proposal_id,
                vec![FileDiffHunk {
                    file_path: "src/lib.rs".to_string(),
                    old_path: None,
                    status: FileStatus::Modified,
                    unified_diff: "@@ -1 +1 @@\n-old\n+new\n".to_string(),
                }],
                summary,
            );
            run.proposal_state(&proposal_id, ProposalState::Accepted);
            run.commit(&proposal_id, &format!("{:040x}", step), "Apply simulated change");
        }
    }

    let snapshot = telemetry.snapshot();
    if !run.is_cancelled() {
        run.completed(true, Some(snapshot.usage()), Some("simulation finished"));
    }

    buffered.flush();
    closer.close();
    logger.await.context("Event logger task failed")?;

    let exported = export_run(&recorder, run.id(), &ExportOptions::default())?;
    let path = output.unwrap_or_else(|| {
        config
            .storage
            .archives_dir()
            .join(format!("{}.json", run.id()))
    });
    write_archive(&path, &exported)?;

    let status = if telemetry.is_stopped() {
        format!("stopped ({})", snapshot.stop_reason.as_deref().unwrap_or("unknown")).red()
    } else if run.is_cancelled() {
        "cancelled".yellow()
    } else {
        "completed".green()
    };
    println!("{} {}", "Run:".bold(), run.id());
    println!("  status:   {}", status);
    println!("  tokens:   {}", snapshot.total_tokens);
    println!("  cost:     ${:.6}", snapshot.cost_usd);
    println!("  events:   {}", exported.archive.stats.events);
    println!("  log:      {}", config.storage.runs_dir().join(run.id().as_str()).join("events.jsonl").display());
    println!("  archive:  {}", path.display());
    Ok(())
}

fn dropped_events(archive: &RunArchive) -> u64 {
    archive.events.iter().filter_map(RunEvent::truncated_count).sum()
}

fn cmd_inspect(path: &Path, format: OutputFormat) -> Result<()> {
    debug!(path = %path.display(), %format, "cmd_inspect");
    let imported = import_archive(path)?;
    let archive = &imported.archive;

    let completed = archive
        .events
        .iter()
        .any(|e| matches!(e.kind(), EventKind::Completed(_)));
    let stop_reason = archive.events.iter().find_map(|e| match e.kind() {
        EventKind::Stopped(s) => Some(s.reason.clone()),
        _ => None,
    });

    match format {
        OutputFormat::Json => {
            let summary = json!({
                "runId": imported.run_id,
                "version": archive.version,
                "meta": archive.meta,
                "usage": archive.usage,
                "events": archive.events.len(),
                "dropped": dropped_events(archive),
                "proposals": archive.proposals.len(),
                "commits": archive.commits.len(),
                "completed": completed,
                "stopReason": stop_reason,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        OutputFormat::Text => {
            println!("{} {}", "Run:".bold(), imported.run_id);
            println!("  project:    {}", archive.meta.project_id);
            if let Some(task) = &archive.meta.task_id {
                println!("  task:       {}", task);
            }
            println!("  created:    {}", archive.meta.created_at.to_rfc3339());
            println!("  events:     {} ({} dropped)", archive.events.len(), dropped_events(archive));
            if let Some(usage) = &archive.usage {
                println!(
                    "  usage:      {} requests, {} tokens, ${:.6}",
                    usage.requests,
                    usage.total_tokens,
                    usage.cost_usd.unwrap_or(0.0)
                );
            }
            println!("  proposals:  {}", archive.proposals.len());
            println!("  commits:    {}", archive.commits.len());
            match stop_reason {
                Some(reason) => println!("  status:     {}", format!("stopped ({})", reason).red()),
                None if completed => println!("  status:     {}", "completed".green()),
                None => println!("  status:     {}", "incomplete".yellow()),
            }
        }
    }
    Ok(())
}

fn cmd_replay(path: &Path) -> Result<()> {
    debug!(path = %path.display(), "cmd_replay");
    let imported = import_archive(path)?;

    let bus = SimpleEventBus::new();
    let subscription = bus.on(Arc::new(|event: &RunEvent| match serde_json::to_string(event) {
        Ok(line) => println!("{}", line),
        Err(e) => tracing::warn!(error = %e, "cmd_replay: failed to encode event"),
    }));
    let count = imported.replay(&bus);
    subscription.unsubscribe();

    info!(count, run_id = %imported.run_id, "cmd_replay: replayed events");
    Ok(())
}

fn cmd_config(config: &Config) -> Result<()> {
    debug!("cmd_config");
    println!("{}", "Resolved configuration:".bold());
    print!("{}", config.summary());
    println!("{} {}", "Logs:".bold(), get_log_path().display());
    Ok(())
}
