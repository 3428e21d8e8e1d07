//! `linebatch status`: summarise output and error log without running.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use linebatch_core::jsonl::JsonLines;
use linebatch_core::{EngineConfig, ResumeTracker, ScanReport};
use serde::Serialize;
use tokio::io::BufReader;

#[derive(Debug, Default, PartialEq, Serialize)]
pub struct Status {
    pub output: ScanReport,
    pub error_entries: u64,
    pub malformed_error_lines: u64,
    /// Error log entries per `error_kind`.
    pub by_kind: BTreeMap<String, u64>,
}

pub async fn run(config: &EngineConfig, json: bool) -> Result<()> {
    let status = collect(config).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    let o = &status.output;
    println!("Output: {}", config.output_path.display());
    println!("  Completed identities: {}", o.completed);
    println!("  Flagged for rerun:    {}", o.reruns);
    println!("  Lines:                {}", o.lines);
    println!("  Malformed lines:      {}", o.malformed);
    println!("  Without identity:     {}", o.missing_identity);
    println!("Error log: {}", config.error_path.display());
    println!("  Entries:              {}", status.error_entries);
    for (kind, count) in &status.by_kind {
        println!("    - {kind}: {count}");
    }
    if status.malformed_error_lines > 0 {
        println!("  Malformed lines:      {}", status.malformed_error_lines);
    }
    Ok(())
}

pub async fn collect(config: &EngineConfig) -> Result<Status> {
    let tracker = ResumeTracker::load(&config.output_path, &config.id_key, config.rerun_key.as_deref())
        .await
        .context("scanning output")?;
    let mut status = Status {
        output: tracker.report(),
        ..Default::default()
    };
    scan_error_log(&config.error_path, &mut status).await?;
    Ok(status)
}

async fn scan_error_log(path: &Path, status: &mut Status) -> Result<()> {
    let file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("opening error log {}", path.display())),
    };
    let mut lines = JsonLines::new(BufReader::new(file));
    while let Some((_, parsed)) = lines
        .next_record()
        .await
        .with_context(|| format!("reading error log {}", path.display()))?
    {
        match parsed {
            Ok(entry) => {
                status.error_entries += 1;
                let kind = entry
                    .get("error_kind")
                    .and_then(|k| k.as_str())
                    .unwrap_or("unknown");
                *status.by_kind.entry(kind.to_string()).or_default() += 1;
            }
            Err(_) => status.malformed_error_lines += 1,
        }
    }
    Ok(())
}
