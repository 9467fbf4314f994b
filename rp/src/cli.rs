//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

/// Runplane - run-control plane for coding-agent runs
#[derive(Parser)]
#[command(
    name = "rp",
    about = "Event streaming, budgets and transcripts for coding-agent runs",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Drive a synthetic run through the bus, telemetry and recorder
    Simulate {
        /// Number of simulated steps (one LLM request each)
        #[arg(short, long, default_value = "5")]
        steps: u32,

        /// Cost ceiling in USD (overrides config)
        #[arg(short, long)]
        budget_usd: Option<f64>,

        /// Model name used for pricing
        #[arg(short, long, default_value = "gpt-4o")]
        model: String,

        /// Project id recorded in the run metadata
        #[arg(short, long, default_value = "demo")]
        project: String,

        /// Where to write the run archive (default: <data-dir>/archives/<run-id>.json)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Summarize a run archive
    Inspect {
        /// Archive file
        archive: PathBuf,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Print an archive's events as JSON lines, in order
    Replay {
        /// Archive file
        archive: PathBuf,
    },

    /// Show the resolved configuration
    Config,
}

/// Get the log file path
pub fn get_log_path() -> PathBuf {
    let path = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("runplane")
        .join("logs")
        .join("runplane.log");
    debug!(?path, "get_log_path: returning path");
    path
}

/// Output format for inspect
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => {
                debug!(%s, "OutputFormat::from_str: unknown format");
                Err(format!("Unknown format: {}. Use: text or json", s))
            }
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_simulate() {
        let cli = Cli::try_parse_from(["rp", "-l", "debug", "simulate", "--steps", "3", "--budget-usd", "0.01"]).unwrap();
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        match cli.command {
            Command::Simulate {
                steps,
                budget_usd,
                model,
                ..
            } => {
                assert_eq!(steps, 3);
                assert_eq!(budget_usd, Some(0.01));
                assert_eq!(model, "gpt-4o");
            }
            other => panic!("Expected simulate, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_inspect_format() {
        let cli = Cli::try_parse_from(["rp", "inspect", "run.json", "--format", "json"]).unwrap();
        match cli.command {
            Command::Inspect { archive, format } => {
                assert_eq!(archive, PathBuf::from("run.json"));
                assert_eq!(format, OutputFormat::Json);
            }
            other => panic!("Expected inspect, got {:?}", other),
        }
        assert!(Cli::try_parse_from(["rp", "inspect", "run.json", "--format", "xml"]).is_err());
    }

    #[test]
    fn test_global_config_flag_after_subcommand() {
        let cli = Cli::try_parse_from(["rp", "config", "--config", "/tmp/rp.yml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/rp.yml")));
    }

    #[test]
    fn test_output_format_roundtrip() {
        assert_eq!("TEXT".parse::<OutputFormat>().unwrap(), OutputFormat::Text);
        assert_eq!(OutputFormat::Json.to_string(), "json");
    }
}
