//! Built-in transform: POST each record to an HTTP endpoint.
//!
//! The JSON response is stored under a configurable field of the record.
//! 5xx, 429 and transport errors are retryable; any other non-success status
//! is permanent. `204 No Content` skips the record without writing it.

use std::sync::Arc;

use anyhow::{Context, Result};
use linebatch_core::{Disposition, Hooks, Record, TaskError};
use reqwest::{StatusCode, Url};
use serde_json::Value;

/// Longest response body quoted in an error message.
const MAX_BODY_IN_ERROR: usize = 512;

#[derive(Debug, Clone)]
pub struct HttpTransform {
    endpoint: Url,
    response_field: String,
}

impl HttpTransform {
    pub fn new(endpoint: &str, response_field: impl Into<String>) -> Result<Self> {
        let endpoint = Url::parse(endpoint).with_context(|| format!("invalid endpoint URL '{endpoint}'"))?;
        Ok(Self {
            endpoint,
            response_field: response_field.into(),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Send `record` and merge the response into it.
    pub async fn apply(&self, mut record: Record, client: &reqwest::Client) -> Result<Disposition, TaskError> {
        let resp = client.post(self.endpoint.clone()).json(&record).send().await?;

        let status = resp.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(Disposition::Skip);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify(status, &body));
        }

        let body: Value = resp.json().await?;
        record.insert(self.response_field.clone(), body);
        Ok(Disposition::Emit(record))
    }

    /// Hooks running this transform with the engine's shared client.
    pub fn into_hooks(self) -> Hooks<()> {
        let this = Arc::new(self);
        Hooks::new(move |record: Record, ctx| {
            let this = Arc::clone(&this);
            async move { this.apply(record, &ctx.client).await }
        })
    }
}

/// Map a non-success status to a retryable or permanent error.
pub fn classify(status: StatusCode, body: &str) -> TaskError {
    let body: String = body.chars().take(MAX_BODY_IN_ERROR).collect();
    let message = format!("HTTP {}: {}", status.as_u16(), body.trim());
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        TaskError::Http(message)
    } else {
        TaskError::Permanent(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answer exactly one request with `status` and `body`, returning the
    /// request body that was received.
    async fn serve_once(status: &'static str, body: &'static str) -> (SocketAddr, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0_u8; 4096];
            let request_body = loop {
                let n = socket.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf).to_string();
                if let Some(split) = text.find("\r\n\r\n") {
                    let len = text[..split]
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if buf.len() >= split + 4 + len {
                        break text[split + 4..].to_string();
                    }
                }
                if n == 0 {
                    break String::new();
                }
            };
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            request_body
        });
        (addr, handle)
    }

    fn rec(v: Value) -> Record {
        match v {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify(StatusCode::SERVICE_UNAVAILABLE, "down"),
            TaskError::Http(_)
        ));
        assert!(matches!(
            classify(StatusCode::TOO_MANY_REQUESTS, ""),
            TaskError::Http(_)
        ));
        let e = classify(StatusCode::BAD_REQUEST, "missing field");
        assert!(matches!(e, TaskError::Permanent(_)));
        assert!(!e.is_retryable());
        assert_eq!(e.to_string(), "HTTP 400: missing field");
    }

    #[test]
    fn rejects_invalid_endpoint() {
        assert!(HttpTransform::new("not a url", "response").is_err());
    }

    #[tokio::test]
    async fn merges_json_response() {
        let (addr, server) = serve_once("200 OK", r#"{"label":"ok"}"#).await;
        let transform = HttpTransform::new(&format!("http://{addr}/enrich"), "response").unwrap();

        let out = transform
            .apply(rec(json!({"id": 1, "text": "hi"})), &reqwest::Client::new())
            .await
            .unwrap();
        assert_eq!(
            out,
            Disposition::Emit(rec(json!({"id": 1, "text": "hi", "response": {"label": "ok"}})))
        );

        let sent: Value = serde_json::from_str(&server.await.unwrap()).unwrap();
        assert_eq!(sent, json!({"id": 1, "text": "hi"}));
    }

    #[tokio::test]
    async fn no_content_skips() {
        let (addr, _server) = serve_once("204 No Content", "").await;
        let transform = HttpTransform::new(&format!("http://{addr}/"), "response").unwrap();
        let out = transform
            .apply(rec(json!({"id": 1})), &reqwest::Client::new())
            .await
            .unwrap();
        assert_eq!(out, Disposition::Skip);
    }

    #[tokio::test]
    async fn server_error_is_retryable() {
        let (addr, _server) = serve_once("503 Service Unavailable", r#"{"error":"busy"}"#).await;
        let transform = HttpTransform::new(&format!("http://{addr}/"), "response").unwrap();
        let err = transform
            .apply(rec(json!({"id": 1})), &reqwest::Client::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable(), "{err}");
    }

    #[tokio::test]
    async fn connection_refused_is_retryable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let transform = HttpTransform::new(&format!("http://{addr}/"), "response").unwrap();
        let err = transform
            .apply(rec(json!({"id": 1})), &reqwest::Client::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Http(_)), "{err:?}");
    }
}
