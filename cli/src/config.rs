//! Config file loading and command-line overrides.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use linebatch_core::EngineConfig;
use serde::{Deserialize, Serialize};

use crate::logging::LogConfig;

/// Contents of a `--config` YAML file: engine settings at the top level plus
/// an optional `log:` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(flatten)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Read `path`, or fall back to defaults when no file was given.
pub fn load(path: Option<&Path>) -> Result<FileConfig> {
    let Some(path) = path else {
        return Ok(FileConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
}

/// Engine settings that can be given on the command line.
#[derive(Debug, Clone, Default, Args)]
pub struct Overrides {
    /// Input JSON Lines file
    #[arg(short, long)]
    pub input: Option<PathBuf>,
    /// Output JSON Lines file (appended to, read back on restart)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
    /// Error log file
    #[arg(short, long)]
    pub errors: Option<PathBuf>,
    /// Field holding each record's identity
    #[arg(long)]
    pub id_key: Option<String>,
    /// Output field that forces a record to be reprocessed when truthy
    #[arg(long, conflicts_with = "no_rerun")]
    pub rerun_key: Option<String>,
    /// Disable forced reruns
    #[arg(long)]
    pub no_rerun: bool,
    /// Maximum records in flight
    #[arg(long)]
    pub concurrency: Option<usize>,
    /// Maximum record starts per minute (0 = unlimited)
    #[arg(long)]
    pub rpm: Option<u32>,
    /// Successful results written per batch
    #[arg(long)]
    pub batch_size: Option<usize>,
    /// Retries per record after the first attempt
    #[arg(long)]
    pub retries: Option<u32>,
    /// HTTP request timeout in milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,
}

impl Overrides {
    pub fn apply(&self, config: &mut EngineConfig) {
        if let Some(p) = &self.input {
            config.input_path = p.clone();
        }
        if let Some(p) = &self.output {
            config.output_path = p.clone();
        }
        if let Some(p) = &self.errors {
            config.error_path = p.clone();
        }
        if let Some(k) = &self.id_key {
            config.id_key = k.clone();
        }
        if self.no_rerun {
            config.rerun_key = None;
        } else if let Some(k) = &self.rerun_key {
            config.rerun_key = Some(k.clone());
        }
        if let Some(n) = self.concurrency {
            config.max_concurrency = n;
        }
        if let Some(n) = self.rpm {
            config.requests_per_minute = n;
        }
        if let Some(n) = self.batch_size {
            config.write_batch_size = n;
        }
        if let Some(n) = self.retries {
            config.max_retries = n;
        }
        if let Some(ms) = self.timeout_ms {
            config.http_timeout_ms = ms;
        }
    }
}
