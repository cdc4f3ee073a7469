//! HTTP adapters (reqwest) for the remote seams.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;

use crate::connectivity::ConnectivityProbe;
use crate::gateway::{FetchFuture, SharedFetcher};
use crate::remote::{RemoteError, RemoteWriter, SubmitReceipt, extract_server_id};
use crate::types::{ConnectivityStatus, NetworkType, OperationType, QueueItem};

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

fn build_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder().timeout(timeout).build()
}

fn trim_base(api_url: impl Into<String>) -> String {
    api_url.into().trim_end_matches('/').to_string()
}

/// Writes queue items to the API.
///
/// `SubmitReport` posts to `/reports`; `Custom(name)` posts to `/{name}`.
/// The queue item id is sent as the idempotency key so a retried write after
/// an ambiguous failure does not create a duplicate.
#[derive(Debug, Clone)]
pub struct HttpRemoteWriter {
    client: reqwest::Client,
    api_url: String,
    token: Option<String>,
    timeout: Duration,
}

impl HttpRemoteWriter {
    pub fn new(api_url: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let client = build_client(timeout).map_err(|e| RemoteError::Network(e.to_string()))?;
        Ok(Self {
            client,
            api_url: trim_base(api_url),
            token: None,
            timeout,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn endpoint(&self, operation: &OperationType) -> String {
        let path = match operation {
            OperationType::SubmitReport => "/reports".to_string(),
            OperationType::Custom(name) => format!("/{}", name.trim_start_matches('/')),
        };
        format!("{}{}", self.api_url, path)
    }

    fn map_send_error(&self, err: reqwest::Error) -> RemoteError {
        if err.is_timeout() {
            RemoteError::Timeout(self.timeout)
        } else if err.is_builder() {
            RemoteError::InvalidPayload(err.to_string())
        } else {
            RemoteError::Network(err.to_string())
        }
    }
}

#[async_trait]
impl RemoteWriter for HttpRemoteWriter {
    async fn submit(&self, item: &QueueItem) -> Result<SubmitReceipt, RemoteError> {
        let url = self.endpoint(&item.operation_type);
        let mut req = self
            .client
            .post(&url)
            .header(IDEMPOTENCY_HEADER, item.id.to_string())
            .json(&item.payload);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await.map_err(|e| self.map_send_error(e))?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            tracing::debug!(item_id = %item.id, status = status.as_u16(), "write rejected");
            return Err(RemoteError::status(status.as_u16(), message));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| RemoteError::MalformedResponse(e.to_string()))?;
        let server_id = extract_server_id(&body)?;
        Ok(SubmitReceipt { server_id, body })
    }
}

/// Connectivity probe that asks the backend's `/health` endpoint.
///
/// A transport failure means no usable network; a non-success answer means
/// the network works but the backend is not reachable.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
    api_url: String,
}

impl HttpHealthProbe {
    pub fn new(api_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(timeout).context("failed to build health check client")?,
            api_url: trim_base(api_url),
        })
    }
}

#[async_trait]
impl ConnectivityProbe for HttpHealthProbe {
    async fn probe(&self) -> ConnectivityStatus {
        let url = format!("{}/health", self.api_url);
        match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => ConnectivityStatus::online(NetworkType::Unknown),
            Ok(resp) => {
                tracing::debug!(status = resp.status().as_u16(), "health check returned non-success");
                ConnectivityStatus::unreachable(NetworkType::Unknown)
            }
            Err(err) => {
                tracing::debug!(error = %err, "health check failed");
                ConnectivityStatus::offline()
            }
        }
    }
}

/// JSON GET helper for gateway fetchers.
#[derive(Debug, Clone)]
pub struct HttpReadClient {
    client: reqwest::Client,
    api_url: String,
    token: Option<String>,
}

impl HttpReadClient {
    pub fn new(api_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(timeout).context("failed to build read client")?,
            api_url: trim_base(api_url),
            token: None,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub async fn get_json(&self, path: &str) -> anyhow::Result<Value> {
        let url = format!("{}/{}", self.api_url, path.trim_start_matches('/'));
        let mut req = self.client.get(&url);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await.with_context(|| format!("GET {url} failed"))?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("GET {url} returned {status}");
        }
        resp.json()
            .await
            .with_context(|| format!("GET {url} returned invalid JSON"))
    }

    /// Reusable fetcher for `path`, e.g. for priority reads.
    pub fn fetcher(&self, path: impl Into<String>) -> SharedFetcher {
        let client = self.clone();
        let path = path.into();
        Arc::new(move || -> FetchFuture {
            let client = client.clone();
            let path = path.clone();
            Box::pin(async move { client.get_json(&path).await })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use civicsync_core::FailureKind;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Answer one request with `status` and `body`; yields the raw request.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let content_length = text[..end]
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if raw.len() >= end + 4 + content_length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&raw).to_string()
        });
        (format!("http://{addr}"), handle)
    }

    fn report_item() -> QueueItem {
        QueueItem::new(
            OperationType::SubmitReport,
            json!({"title": "Flooded underpass"}),
            5,
            chrono::Utc::now(),
        )
    }

    #[test]
    fn endpoints_per_operation() {
        let writer = HttpRemoteWriter::new("http://api.local/", Duration::from_secs(1)).unwrap();
        assert_eq!(writer.endpoint(&OperationType::SubmitReport), "http://api.local/reports");
        assert_eq!(
            writer.endpoint(&OperationType::Custom("/tasks/close".into())),
            "http://api.local/tasks/close"
        );
    }

    #[tokio::test]
    async fn submit_sends_idempotency_key_and_reads_id() {
        let (url, server) = serve_once("201 Created", r#"{"_id":"rep-77"}"#).await;
        let writer = HttpRemoteWriter::new(url, Duration::from_secs(5))
            .unwrap()
            .with_token("secret");
        let item = report_item();

        let receipt = writer.submit(&item).await.unwrap();
        assert_eq!(receipt.server_id.as_str(), "rep-77");

        let request = server.await.unwrap().to_ascii_lowercase();
        assert!(request.starts_with("post /reports "));
        assert!(request.contains(&format!("idempotency-key: {}", item.id)));
        assert!(request.contains("authorization: bearer secret"));
        assert!(request.contains("flooded underpass"));
    }

    #[tokio::test]
    async fn validation_rejection_is_permanent() {
        let (url, _server) = serve_once("422 Unprocessable Entity", r#"{"error":"title"}"#).await;
        let writer = HttpRemoteWriter::new(url, Duration::from_secs(5)).unwrap();

        let err = writer.submit(&report_item()).await.unwrap_err();
        assert_eq!(err, RemoteError::status(422, r#"{"error":"title"}"#));
        assert_eq!(err.classify(), FailureKind::Permanent);
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let (url, _server) = serve_once("503 Service Unavailable", "{}").await;
        let writer = HttpRemoteWriter::new(url, Duration::from_secs(5)).unwrap();
        let err = writer.submit(&report_item()).await.unwrap_err();
        assert_eq!(err.classify(), FailureKind::Transient);
    }

    #[tokio::test]
    async fn refused_connection_is_transient_and_probes_offline() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let writer = HttpRemoteWriter::new(url.clone(), Duration::from_secs(2)).unwrap();
        let err = writer.submit(&report_item()).await.unwrap_err();
        assert_eq!(err.classify(), FailureKind::Transient);

        let probe = HttpHealthProbe::new(url, Duration::from_secs(2)).unwrap();
        assert!(!probe.probe().await.is_online());
    }

    #[tokio::test]
    async fn health_probe_and_reads() {
        let (url, _server) = serve_once("200 OK", r#"{"status":"ok"}"#).await;
        let probe = HttpHealthProbe::new(url, Duration::from_secs(2)).unwrap();
        assert!(probe.probe().await.is_online());

        let (url, server) = serve_once("200 OK", r#"[{"id":1}]"#).await;
        let reads = HttpReadClient::new(url, Duration::from_secs(2)).unwrap();
        let fetch = reads.fetcher("/reports?mine=true");
        assert_eq!(fetch().await.unwrap(), json!([{"id": 1}]));
        assert!(server.await.unwrap().starts_with("GET /reports?mine=true "));
    }
}
