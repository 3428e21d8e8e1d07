//! Result sink: batched output appends and an immediate error log.
//!
//! Successful records are buffered and appended in one `write_all` per
//! batch, so an interrupted run leaves at most one partial trailing line.
//! When a file is reopened and does not end in a newline, one is written
//! first so the fragment stays on its own line and the next record is not
//! glued onto it. Failures are written as soon as they arrive. Any write
//! error is fatal to the run and poisons the affected file so no later write
//! can interleave with a partially written batch.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::jsonl::encode_line;
use crate::record::{Failure, Outcome, Record};
use crate::report::RunStats;

/// One line of the error log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEntry {
    /// The record's identity, `null` when it had none.
    pub identity: Value,
    pub original_record: Record,
    pub error_kind: String,
    pub error_message: String,
    pub attempts: u32,
    pub timestamp: DateTime<Utc>,
}

impl From<&Failure> for FailureEntry {
    fn from(f: &Failure) -> Self {
        Self {
            identity: f.identity.as_ref().map_or(Value::Null, |id| id.to_value()),
            original_record: f.record.clone(),
            error_kind: f.error.kind().to_string(),
            error_message: f.error.to_string(),
            attempts: f.attempts,
            timestamp: f.at,
        }
    }
}

/// An append-only file that refuses further writes after one has failed.
struct AppendFile {
    path: PathBuf,
    file: File,
    poisoned: bool,
}

impl AppendFile {
    async fn open(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| EngineError::write(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| EngineError::write(path, e))?;
        let mut append = Self {
            path: path.to_path_buf(),
            file,
            poisoned: false,
        };
        if ends_mid_line(path).await.map_err(|e| EngineError::read(path, e))? {
            warn!(path = %path.display(), "file ends in a partial line, terminating it");
            append.append(b"\n").await?;
        }
        Ok(append)
    }

    async fn append(&mut self, bytes: &[u8]) -> Result<(), EngineError> {
        if self.poisoned {
            return Err(EngineError::write(
                &self.path,
                std::io::Error::new(std::io::ErrorKind::Other, "an earlier write to this file failed"),
            ));
        }
        let res = async {
            self.file.write_all(bytes).await?;
            self.file.flush().await
        }
        .await;
        res.map_err(|e| {
            self.poisoned = true;
            error!(path = %self.path.display(), error = %e, "write failed");
            EngineError::write(&self.path, e)
        })
    }
}

/// `true` when `path` is a non-empty regular file whose last byte is not `\n`.
async fn ends_mid_line(path: &Path) -> std::io::Result<bool> {
    let mut file = File::open(path).await?;
    let meta = file.metadata().await?;
    if !meta.is_file() || meta.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1)).await?;
    let mut last = [0_u8; 1];
    file.read_exact(&mut last).await?;
    Ok(last[0] != b'\n')
}

struct OutputBuffer {
    out: AppendFile,
    buf: Vec<u8>,
    pending: usize,
}

impl OutputBuffer {
    async fn flush(&mut self) -> Result<(), EngineError> {
        if self.pending == 0 {
            return Ok(());
        }
        self.out.append(&self.buf).await?;
        debug!(records = self.pending, path = %self.out.path.display(), "flushed output batch");
        self.buf.clear();
        self.pending = 0;
        Ok(())
    }
}

/// Destination for every finished record of a run.
pub struct ResultSink {
    batch_size: usize,
    output: Mutex<OutputBuffer>,
    errors: Mutex<AppendFile>,
    stats: Arc<RunStats>,
}

impl ResultSink {
    /// Open (creating if needed) the output and error log for appending.
    pub async fn open(config: &EngineConfig, stats: Arc<RunStats>) -> Result<Self, EngineError> {
        let out = AppendFile::open(&config.output_path).await?;
        let errors = AppendFile::open(&config.error_path).await?;
        Ok(Self {
            batch_size: config.write_batch_size.max(1),
            output: Mutex::new(OutputBuffer {
                out,
                buf: Vec::new(),
                pending: 0,
            }),
            errors: Mutex::new(errors),
            stats,
        })
    }

    /// Record one finished outcome.
    pub async fn submit(&self, outcome: Outcome) -> Result<(), EngineError> {
        match outcome {
            Outcome::Success(record) => {
                let line = encode_line(&record)?;
                let mut output = self.output.lock().await;
                output.buf.extend_from_slice(&line);
                output.pending += 1;
                self.stats.record_succeeded();
                if output.pending >= self.batch_size {
                    output.flush().await?;
                }
            }
            Outcome::Failure(failure) => {
                let line = encode_line(&FailureEntry::from(&failure))?;
                self.errors.lock().await.append(&line).await?;
                self.stats.record_failed();
            }
            Outcome::Skip => self.stats.record_skipped_empty(),
        }
        Ok(())
    }

    /// Write any buffered results.
    pub async fn flush(&self) -> Result<(), EngineError> {
        self.output.lock().await.flush().await
    }

    /// Number of successful results not yet written.
    pub async fn pending(&self) -> usize {
        self.output.lock().await.pending
    }

    /// Flush remaining results. Called once after all tasks have finished.
    pub async fn finish(&self) -> Result<(), EngineError> {
        self.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use crate::record::Identity;
    use serde_json::json;
    use tempfile::TempDir;

    fn rec(v: Value) -> Record {
        match v {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    fn config(dir: &TempDir, batch: usize) -> EngineConfig {
        EngineConfig {
            input_path: dir.path().join("input.jsonl"),
            output_path: dir.path().join("out/output.jsonl"),
            error_path: dir.path().join("out/error.jsonl"),
            write_batch_size: batch,
            ..Default::default()
        }
    }

    async fn lines(path: &Path) -> Vec<Value> {
        let text = tokio::fs::read_to_string(path).await.unwrap_or_default();
        text.lines().map(|l| serde_json::from_str(l).unwrap()).collect()
    }

    #[tokio::test]
    async fn successes_are_batched() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir, 2);
        let stats = Arc::new(RunStats::new());
        let sink = ResultSink::open(&cfg, Arc::clone(&stats)).await.unwrap();

        sink.submit(Outcome::Success(rec(json!({"id": 1})))).await.unwrap();
        assert_eq!(sink.pending().await, 1);
        assert!(lines(&cfg.output_path).await.is_empty());

        sink.submit(Outcome::Success(rec(json!({"id": 2})))).await.unwrap();
        assert_eq!(sink.pending().await, 0);
        assert_eq!(lines(&cfg.output_path).await.len(), 2);

        sink.submit(Outcome::Success(rec(json!({"id": 3})))).await.unwrap();
        sink.finish().await.unwrap();
        let out = lines(&cfg.output_path).await;
        assert_eq!(out.len(), 3);
        assert_eq!(out[2]["id"], json!(3));
        assert_eq!(stats.snapshot().succeeded, 3);
    }

    #[tokio::test]
    async fn failures_are_written_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir, 100);
        let stats = Arc::new(RunStats::new());
        let sink = ResultSink::open(&cfg, Arc::clone(&stats)).await.unwrap();

        let failure = Failure::new(
            Some(Identity::Number("2".into())),
            rec(json!({"id": 2, "v": 5})),
            TaskError::failed("upstream 503"),
            4,
        );
        sink.submit(Outcome::Failure(failure)).await.unwrap();

        let errs = lines(&cfg.error_path).await;
        assert_eq!(errs.len(), 1);
        let entry: FailureEntry = serde_json::from_value(errs[0].clone()).unwrap();
        assert_eq!(entry.identity, json!(2));
        assert_eq!(entry.original_record, rec(json!({"id": 2, "v": 5})));
        assert_eq!(entry.error_kind, "failed");
        assert_eq!(entry.error_message, "upstream 503");
        assert_eq!(entry.attempts, 4);
        assert_eq!(stats.snapshot().failed, 1);
    }

    #[tokio::test]
    async fn skip_only_counts() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir, 1);
        let stats = Arc::new(RunStats::new());
        let sink = ResultSink::open(&cfg, Arc::clone(&stats)).await.unwrap();
        sink.submit(Outcome::Skip).await.unwrap();
        sink.finish().await.unwrap();
        assert!(lines(&cfg.output_path).await.is_empty());
        assert!(lines(&cfg.error_path).await.is_empty());
        assert_eq!(stats.snapshot().skipped_empty, 1);
    }

    #[tokio::test]
    async fn appends_to_existing_output() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir, 1);
        tokio::fs::create_dir_all(dir.path().join("out")).await.unwrap();
        tokio::fs::write(&cfg.output_path, "{\"id\":0}\n").await.unwrap();

        let sink = ResultSink::open(&cfg, Arc::new(RunStats::new())).await.unwrap();
        sink.submit(Outcome::Success(rec(json!({"id": 1})))).await.unwrap();
        let out = lines(&cfg.output_path).await;
        assert_eq!(out, vec![json!({"id": 0}), json!({"id": 1})]);
    }

    #[tokio::test]
    async fn partial_trailing_line_is_terminated_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir, 1);
        tokio::fs::create_dir_all(dir.path().join("out")).await.unwrap();
        tokio::fs::write(&cfg.output_path, "{\"id\":1}\n{\"id\":2,\"v").await.unwrap();
        tokio::fs::write(&cfg.error_path, "{\"identity\":9").await.unwrap();

        let sink = ResultSink::open(&cfg, Arc::new(RunStats::new())).await.unwrap();
        sink.submit(Outcome::Success(rec(json!({"id": 2})))).await.unwrap();
        sink.submit(Outcome::Failure(Failure::new(
            None,
            rec(json!({"v": 1})),
            TaskError::failed("x"),
            1,
        )))
        .await
        .unwrap();

        let out = tokio::fs::read_to_string(&cfg.output_path).await.unwrap();
        assert_eq!(out, "{\"id\":1}\n{\"id\":2,\"v\n{\"id\":2}\n");
        let errs = tokio::fs::read_to_string(&cfg.error_path).await.unwrap();
        let last = errs.lines().last().unwrap();
        assert!(serde_json::from_str::<FailureEntry>(last).is_ok(), "{errs}");
    }

    #[tokio::test]
    async fn complete_file_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir, 1);
        tokio::fs::create_dir_all(dir.path().join("out")).await.unwrap();
        tokio::fs::write(&cfg.output_path, "{\"id\":1}\n").await.unwrap();
        let _sink = ResultSink::open(&cfg, Arc::new(RunStats::new())).await.unwrap();
        let out = tokio::fs::read_to_string(&cfg.output_path).await.unwrap();
        assert_eq!(out, "{\"id\":1}\n");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn write_failure_is_fatal_and_sticky() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = EngineConfig {
            output_path: "/dev/full".into(),
            ..config(&dir, 1)
        };
        let sink = ResultSink::open(&cfg, Arc::new(RunStats::new())).await.unwrap();
        let err = sink
            .submit(Outcome::Success(rec(json!({"id": 1}))))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Write { .. }));
        assert!(sink.finish().await.is_err());
    }
}
