//! Line-by-line JSON object reader.
//!
//! Lines are read as raw bytes so a truncated trailing line (a crash in the
//! middle of a write) or invalid UTF-8 surfaces as a per-line parse error
//! instead of an I/O error that would abort the whole scan.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::record::{json_type, Record};

/// Why a single line could not be turned into a record.
#[derive(Debug, Error)]
pub enum LineError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expected a JSON object, found {0}")]
    NotAnObject(&'static str),
}

/// Async reader yielding one [`Record`] per non-blank line.
pub struct JsonLines<R> {
    reader: R,
    buf: Vec<u8>,
    line: u64,
}

impl<R: AsyncBufRead + Unpin> JsonLines<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::with_capacity(1024),
            line: 0,
        }
    }

    /// Read the next non-blank line.
    ///
    /// Returns `Ok(None)` at end of input, otherwise the 1-based line number
    /// and the parse result for that line.
    pub async fn next_record(
        &mut self,
    ) -> std::io::Result<Option<(u64, Result<Record, LineError>)>> {
        loop {
            self.buf.clear();
            if self.reader.read_until(b'\n', &mut self.buf).await? == 0 {
                return Ok(None);
            }
            self.line += 1;
            if self.buf.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let parsed = match serde_json::from_slice::<Value>(&self.buf) {
                Ok(Value::Object(map)) => Ok(map),
                Ok(other) => Err(LineError::NotAnObject(json_type(&other))),
                Err(e) => Err(LineError::Json(e)),
            };
            return Ok(Some((self.line, parsed)));
        }
    }

    /// The raw text of the line last returned, shortened for log output.
    pub fn snippet(&self) -> String {
        const MAX: usize = 120;
        let text = String::from_utf8_lossy(&self.buf);
        let trimmed = text.trim_end();
        if trimmed.chars().count() <= MAX {
            trimmed.to_string()
        } else {
            let cut: String = trimmed.chars().take(MAX).collect();
            format!("{cut}…")
        }
    }
}

/// Serialise `value` as one newline-terminated JSON line.
pub fn encode_line<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn collect(input: &[u8]) -> Vec<(u64, Result<Record, String>)> {
        let mut lines = JsonLines::new(input);
        let mut out = Vec::new();
        while let Some((n, r)) = lines.next_record().await.unwrap() {
            out.push((n, r.map_err(|e| e.to_string())));
        }
        out
    }

    #[tokio::test]
    async fn reads_objects_and_skips_blank_lines() {
        let out = collect(b"{\"id\":1}\n\n   \n{\"id\":2}").await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].0, 1);
        assert_eq!(out[1].0, 4);
        assert_eq!(out[1].1.as_ref().unwrap()["id"], json!(2));
    }

    #[tokio::test]
    async fn malformed_lines_do_not_stop_the_scan() {
        let out = collect(b"{\"id\":1}\nnot json\n[1,2]\n{\"id\":\xff}\n{\"id\":3}\n{\"id\":").await;
        assert_eq!(out.len(), 6);
        assert!(out[0].1.is_ok());
        assert!(out[1].1.as_ref().unwrap_err().contains("invalid JSON"));
        assert!(out[2].1.as_ref().unwrap_err().contains("array"));
        assert!(out[3].1.is_err());
        assert!(out[4].1.is_ok());
        // truncated final line from an interrupted write
        assert!(out[5].1.is_err());
    }

    #[tokio::test]
    async fn preserves_field_order() {
        let out = collect(b"{\"z\":1,\"a\":2,\"m\":3}\n").await;
        let keys: Vec<_> = out[0].1.as_ref().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
    }

    #[test]
    fn encode_line_appends_newline() {
        let line = encode_line(&json!({"id": 1})).unwrap();
        assert_eq!(line, b"{\"id\":1}\n");
    }
}
