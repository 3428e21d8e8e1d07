//! Log output for the `linebatch` binary.
//!
//! Console output goes to stderr so `status --json` stays clean on stdout.
//! The optional log file is written by a background thread.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// The `log:` section of the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Level for everything not named in `components`.
    #[serde(default = "info_level")]
    pub level: String,
    /// Per-target levels, e.g. `linebatch_core: debug` or `reqwest: warn`.
    #[serde(default)]
    pub components: HashMap<String, String>,
    /// One JSON object per event on stderr instead of text.
    #[serde(default)]
    pub json: bool,
    /// Plain-text copy of the log, appended across runs.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn info_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: info_level(),
            components: HashMap::new(),
            json: false,
            file: None,
        }
    }
}

impl LogConfig {
    /// Filter directives such as `"info,linebatch_core=debug"`.
    pub fn directives(&self) -> String {
        let mut directives = self.level.clone();
        let mut components: Vec<_> = self.components.iter().collect();
        components.sort();
        for (component, level) in components {
            directives.push_str(&format!(",{}={}", component.replace('-', "_"), level));
        }
        directives
    }
}

/// Install the global subscriber. `RUST_LOG`, when set, replaces the
/// configured directives.
///
/// When a log file is configured the returned guard owns its writer thread;
/// keep it alive until the command finishes or buffered lines are lost.
pub fn init_tracing(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.directives()))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match &config.file {
        Some(path) => {
            let (writer, guard) = tracing_appender::non_blocking(file_appender(path)?);
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    if config.json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
            .context("initialising tracing")?;
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()
            .context("initialising tracing")?;
    }
    Ok(guard)
}

/// A never-rotating appender writing to exactly `path`.
fn file_appender(path: &std::path::Path) -> Result<RollingFileAppender> {
    let name = path
        .file_name()
        .with_context(|| format!("log file {} has no file name", path.display()))?;
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
    RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(name.to_string_lossy())
        .build(dir)
        .with_context(|| format!("opening log file {}", path.display()))
}
