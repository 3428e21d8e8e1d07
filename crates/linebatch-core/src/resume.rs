//! Resume tracker: reads prior output so a restarted run skips finished work.
//!
//! The completion set is computed once, before any record is launched, and
//! never changes during the run. Output lines are applied in file order: a
//! line carrying a truthy rerun flag removes its identity, any other line
//! (re)inserts it.

use std::collections::HashSet;
use std::path::Path;

use serde::Serialize;
use tokio::fs::File;
use tokio::io::BufReader;
use tracing::{debug, info, warn};

use crate::error::{EngineError, TaskError};
use crate::jsonl::JsonLines;
use crate::record::{extract_identity, is_truthy, Identity, IdentityField, IdentityKind, Record};

/// What the engine should do with one input record.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Launch the transform. `None` when the record carries no identity.
    Process(Option<Identity>),
    /// Already present in the output.
    Skip(Identity),
    /// The identity cannot be used; record a failure without launching.
    Reject(TaskError),
}

/// Counters gathered while scanning prior output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    /// Non-blank lines read.
    pub lines: u64,
    /// Identities in the completion set after the scan.
    pub completed: u64,
    /// Identities whose last line carried a truthy rerun flag.
    pub reruns: u64,
    /// Lines skipped as unparseable or with an unusable identity.
    pub malformed: u64,
    /// Lines without an identity.
    pub missing_identity: u64,
}

#[derive(Debug)]
pub struct ResumeTracker {
    id_key: String,
    completed: HashSet<Identity>,
    /// Latched from the first identity seen, prior output first.
    kind: Option<IdentityKind>,
    report: ScanReport,
}

impl ResumeTracker {
    /// A tracker with an empty completion set.
    pub fn empty(id_key: impl Into<String>) -> Self {
        Self {
            id_key: id_key.into(),
            completed: HashSet::new(),
            kind: None,
            report: ScanReport::default(),
        }
    }

    /// Scan `output` and build the completion set.
    ///
    /// A missing file yields an empty set. Malformed lines are skipped with a
    /// warning. Only failing to open or read an existing file is an error.
    pub async fn load(
        output: &Path,
        id_key: &str,
        rerun_key: Option<&str>,
    ) -> Result<Self, EngineError> {
        let mut tracker = Self::empty(id_key);

        let file = match File::open(output).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %output.display(), "no prior output, starting fresh");
                return Ok(tracker);
            }
            Err(e) => return Err(EngineError::read(output, e)),
        };

        let mut reruns = HashSet::new();
        let mut lines = JsonLines::new(BufReader::new(file));
        while let Some((line, parsed)) = lines
            .next_record()
            .await
            .map_err(|e| EngineError::read(output, e))?
        {
            tracker.report.lines += 1;
            let record = match parsed {
                Ok(r) => r,
                Err(e) => {
                    warn!(path = %output.display(), line, error = %e, "skipping malformed output line");
                    tracker.report.malformed += 1;
                    continue;
                }
            };
            let identity = match extract_identity(&record, id_key) {
                IdentityField::Present(id) => id,
                IdentityField::Missing => {
                    debug!(line, "output line has no identity");
                    tracker.report.missing_identity += 1;
                    continue;
                }
                IdentityField::Invalid(reason) => {
                    warn!(line, %reason, "skipping output line with unusable identity");
                    tracker.report.malformed += 1;
                    continue;
                }
            };
            if let Err(expected) = tracker.latch_kind(&identity) {
                warn!(
                    line,
                    identity = %identity,
                    found = %identity.kind(),
                    %expected,
                    "skipping output line with mismatched identity type"
                );
                tracker.report.malformed += 1;
                continue;
            }

            let rerun = rerun_key
                .and_then(|k| record.get(k))
                .is_some_and(is_truthy);
            if rerun {
                tracker.completed.remove(&identity);
                reruns.insert(identity);
            } else {
                reruns.remove(&identity);
                tracker.completed.insert(identity);
            }
        }

        tracker.report.completed = tracker.completed.len() as u64;
        tracker.report.reruns = reruns.len() as u64;
        info!(
            path = %output.display(),
            completed = tracker.report.completed,
            reruns = tracker.report.reruns,
            malformed = tracker.report.malformed,
            "loaded completion set"
        );
        Ok(tracker)
    }

    /// Decide whether `record` still needs processing.
    ///
    /// The first identity seen fixes the identity type for the run; a later
    /// identity of the other type is rejected rather than compared.
    pub fn should_process(&mut self, record: &Record) -> Decision {
        match extract_identity(record, &self.id_key) {
            IdentityField::Missing => {
                warn!(id_key = %self.id_key, "record has no identity, processing without dedup");
                Decision::Process(None)
            }
            IdentityField::Invalid(reason) => Decision::Reject(TaskError::InvalidIdentity(reason)),
            IdentityField::Present(id) => {
                if let Err(expected) = self.latch_kind(&id) {
                    return Decision::Reject(TaskError::InvalidIdentity(format!(
                        "identity {id} is a {}, expected a {expected}",
                        id.kind()
                    )));
                }
                if self.completed.contains(&id) {
                    Decision::Skip(id)
                } else {
                    Decision::Process(Some(id))
                }
            }
        }
    }

    pub fn is_complete(&self, id: &Identity) -> bool {
        self.completed.contains(id)
    }

    pub fn len(&self) -> usize {
        self.completed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
    }

    pub fn report(&self) -> ScanReport {
        self.report
    }

    fn latch_kind(&mut self, id: &Identity) -> Result<(), IdentityKind> {
        match self.kind {
            None => {
                self.kind = Some(id.kind());
                Ok(())
            }
            Some(k) if k == id.kind() => Ok(()),
            Some(k) => Err(k),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    fn rec(v: Value) -> Record {
        match v {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    async fn load(contents: &str) -> (TempDir, ResumeTracker) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.jsonl");
        tokio::fs::write(&path, contents).await.unwrap();
        let tracker = ResumeTracker::load(&path, "id", Some("force_rerun")).await.unwrap();
        (dir, tracker)
    }

    #[tokio::test]
    async fn missing_file_is_empty_set() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = ResumeTracker::load(&dir.path().join("nope.jsonl"), "id", None)
            .await
            .unwrap();
        assert!(tracker.is_empty());
        assert_eq!(tracker.report(), ScanReport::default());
    }

    #[tokio::test]
    async fn completed_identities_are_skipped() {
        let (_dir, mut tracker) = load("{\"id\":1,\"v\":2}\n{\"id\":3,\"v\":6}\n").await;
        assert_eq!(tracker.len(), 2);
        assert_eq!(
            tracker.should_process(&rec(json!({"id": 1}))),
            Decision::Skip(Identity::Number("1".into()))
        );
        assert_eq!(
            tracker.should_process(&rec(json!({"id": 2}))),
            Decision::Process(Some(Identity::Number("2".into())))
        );
    }

    #[tokio::test]
    async fn rerun_flag_removes_identity() {
        let (_dir, mut tracker) = load(
            "{\"id\":\"a\"}\n{\"id\":\"b\",\"force_rerun\":true}\n{\"id\":\"c\",\"force_rerun\":0}\n",
        )
        .await;
        assert!(tracker.is_complete(&Identity::Text("a".into())));
        assert!(!tracker.is_complete(&Identity::Text("b".into())));
        assert!(tracker.is_complete(&Identity::Text("c".into())));
        assert_eq!(tracker.report().reruns, 1);
        assert!(matches!(
            tracker.should_process(&rec(json!({"id": "b"}))),
            Decision::Process(Some(_))
        ));
    }

    #[tokio::test]
    async fn later_unflagged_line_recompletes() {
        let (_dir, tracker) = load(
            "{\"id\":\"a\"}\n{\"id\":\"a\",\"force_rerun\":\"yes\"}\n{\"id\":\"a\"}\n",
        )
        .await;
        assert!(tracker.is_complete(&Identity::Text("a".into())));
        assert_eq!(tracker.report().reruns, 0);
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let (_dir, tracker) = load("{\"id\":1}\ngarbage\n{\"id\":[1]}\n\n{\"id\":2}\n{\"id\":").await;
        assert_eq!(tracker.len(), 2);
        let report = tracker.report();
        assert_eq!(report.lines, 5);
        assert_eq!(report.malformed, 3);
    }

    #[tokio::test]
    async fn identity_type_is_latched_from_prior_output() {
        let (_dir, mut tracker) = load("{\"id\":1}\n{\"id\":\"2\"}\n").await;
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.report().malformed, 1);

        match tracker.should_process(&rec(json!({"id": "1"}))) {
            Decision::Reject(TaskError::InvalidIdentity(msg)) => {
                assert!(msg.contains("expected a number"), "{msg}")
            }
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[test]
    fn missing_identity_is_processed_and_invalid_rejected() {
        let mut tracker = ResumeTracker::empty("id");
        assert_eq!(tracker.should_process(&rec(json!({"x": 1}))), Decision::Process(None));
        assert_eq!(tracker.should_process(&rec(json!({"id": null}))), Decision::Process(None));
        assert!(matches!(
            tracker.should_process(&rec(json!({"id": false}))),
            Decision::Reject(TaskError::InvalidIdentity(_))
        ));
    }

    #[test]
    fn first_input_identity_latches_when_output_empty() {
        let mut tracker = ResumeTracker::empty("id");
        assert!(matches!(
            tracker.should_process(&rec(json!({"id": "a"}))),
            Decision::Process(Some(_))
        ));
        assert!(matches!(
            tracker.should_process(&rec(json!({"id": 5}))),
            Decision::Reject(_)
        ));
    }
}
