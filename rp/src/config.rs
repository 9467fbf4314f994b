//! Runplane configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::RunError;
use crate::events::BackpressureConfig;
use crate::recorder::{RedactionConfig, Redactor, TranscriptLimits, TruncateStrategy};
use crate::telemetry::{PricingTable, RunBudget};

/// Main Runplane configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Event staging and flushing
    pub backpressure: BackpressureConfig,

    /// Recorder caps
    pub transcript: TranscriptLimits,

    /// Per-run budget ceilings
    pub budget: RunBudget,

    /// Secret redaction
    pub redaction: RedactionConfig,

    /// Per-model price overrides, merged over the built-in table
    pub pricing: PricingTable,

    /// Storage locations
    pub storage: StorageConfig,

    /// Log level used when `--log-level` is not given
    #[serde(rename = "log-level", skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration with fallback chain, then apply environment overrides
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let mut config = Self::load_files(config_path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn load_files(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, it must load
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .runplane.yml
        let local_config = PathBuf::from(".runplane.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/runplane/runplane.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("runplane").join("runplane.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Apply `RUNPLANE_*` overrides; values that fail to parse are ignored
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            let raw = lookup(key)?;
            match raw.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(%key, value = %raw, "Ignoring unparseable environment override");
                    None
                }
            }
        }

        if let Some(usd) = parsed::<f64>(&lookup, "RUNPLANE_BUDGET_USD") {
            self.budget.max_cost_usd = Some(usd);
        }
        if let Some(tokens) = parsed::<u64>(&lookup, "RUNPLANE_BUDGET_TOKENS") {
            self.budget.max_tokens = Some(tokens);
        }
        if let Some(n) = parsed::<usize>(&lookup, "RUNPLANE_TRANSCRIPT_MAX_EVENTS") {
            self.transcript.max_events = n;
        }
        if let Some(n) = parsed::<usize>(&lookup, "RUNPLANE_TRANSCRIPT_MAX_BYTES") {
            self.transcript.max_total_bytes = n;
        }
        if let Some(n) = parsed::<usize>(&lookup, "RUNPLANE_TRANSCRIPT_MAX_MESSAGE_CHARS") {
            self.transcript.max_message_chars = n;
        }
        if let Some(strategy) = parsed::<TruncateStrategy>(&lookup, "RUNPLANE_TRANSCRIPT_TRUNCATION_STRATEGY") {
            self.transcript.truncation_strategy = strategy;
        }
        if let Some(raw) = lookup("RUNPLANE_REDACT_SECRETS") {
            match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.redaction.enabled = true,
                "0" | "false" | "no" | "off" => self.redaction.enabled = false,
                _ => tracing::warn!(value = %raw, "Ignoring unparseable RUNPLANE_REDACT_SECRETS"),
            }
        }
        if let Some(dir) = lookup("RUNPLANE_DATA_DIR")
            && !dir.trim().is_empty()
        {
            self.storage.data_dir = PathBuf::from(dir.trim());
        }
    }

    /// Validate configuration before use
    ///
    /// Call this early in startup to fail fast with clear error messages.
    pub fn validate(&self) -> Result<(), RunError> {
        self.backpressure.validate()?;
        self.transcript.validate()?;
        self.budget.validate()?;
        Redactor::new(&self.redaction)?;
        Ok(())
    }

    /// Built-in prices with configured overrides applied
    pub fn pricing_table(&self) -> PricingTable {
        PricingTable::builtin().merged(&self.pricing)
    }

    /// Human-readable dump for diagnostics; secret-shaped values are masked
    pub fn summary(&self) -> String {
        let yaml = serde_yaml::to_string(self).unwrap_or_else(|e| format!("<unserializable config: {}>", e));
        Redactor::shared().redact_str(&yaml)
    }
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root for run logs and archives
    #[serde(rename = "data-dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        // XDG data directory (~/.local/share/runplane on Linux)
        let data_dir = dirs::data_local_dir()
            .map(|d| d.join("runplane"))
            .unwrap_or_else(|| PathBuf::from(".runplane"));

        Self { data_dir }
    }
}

impl StorageConfig {
    /// Per-run JSONL event logs
    pub fn runs_dir(&self) -> PathBuf {
        self.data_dir.join("runs")
    }

    /// Exported run archives
    pub fn archives_dir(&self) -> PathBuf {
        self.data_dir.join("archives")
    }
}
