use std::path::Path;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::pipeline::{FetchRequest, FetchResponse, Next, TransportStage};
use crate::error::{HubError, Result};

/// Terminal stage: streams `GET url` into the destination file.
///
/// The per-request timeout is a child of the caller's token. When the child
/// trips, the caller's token tells the two apart: cancelled means the caller
/// gave up, otherwise the timeout fired. On any failure the partially written
/// destination is removed, so an existing destination is always complete.
pub struct HttpFetchStage {
    client: Client,
}

impl HttpFetchStage {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    async fn transfer(&self, request: &FetchRequest) -> Result<FetchResponse> {
        if let Some(dir) = request.destination.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| HubError::io(dir, e))?;
        }

        let resp = self
            .client
            .get(&request.url)
            .send()
            .await
            .map_err(classify)?;

        let status = resp.status();
        if !status.is_success() {
            warn!("fetch failed status={} url={}", status.as_u16(), request.url);
            return Err(HubError::ProtocolFailure(format!(
                "GET {} returned HTTP {}",
                request.url,
                status.as_u16()
            )));
        }

        let total = resp.content_length().filter(|len| *len > 0);
        let mut file = tokio::fs::File::create(&request.destination)
            .await
            .map_err(|e| write_failure(&request.destination, e))?;

        request.report_progress(0.0);
        let mut written = 0u64;
        let mut body = resp.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(classify)?;
            file.write_all(&chunk)
                .await
                .map_err(|e| write_failure(&request.destination, e))?;
            written += chunk.len() as u64;
            if let Some(total) = total {
                request.report_progress((written as f64 / total as f64) as f32);
            }
        }
        file.flush()
            .await
            .map_err(|e| write_failure(&request.destination, e))?;
        file.sync_all()
            .await
            .map_err(|e| write_failure(&request.destination, e))?;
        request.report_progress(1.0);

        Ok(FetchResponse {
            bytes_written: written,
        })
    }
}

impl Default for HttpFetchStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportStage for HttpFetchStage {
    async fn handle(
        &self,
        request: &FetchRequest,
        cancel: &CancellationToken,
        _next: Next<'_>,
    ) -> Result<FetchResponse> {
        let linked = cancel.child_token();
        let timer = {
            let linked = linked.clone();
            let timeout = request.timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                linked.cancel();
            })
        };

        debug!("fetch start url={}", request.url);
        let outcome = tokio::select! {
            biased;
            _ = linked.cancelled() => {
                if cancel.is_cancelled() {
                    Err(HubError::Cancelled)
                } else {
                    Err(HubError::Timeout {
                        url: request.url.clone(),
                        secs: request.timeout.as_secs(),
                    })
                }
            }
            result = self.transfer(request) => result,
        };
        timer.abort();

        match &outcome {
            Ok(response) => debug!(
                "fetch done url={} bytes={}",
                request.url, response.bytes_written
            ),
            Err(HubError::Cancelled) => {
                debug!("fetch cancelled url={}", request.url);
                remove_partial(&request.destination).await;
            }
            Err(e) => {
                warn!("fetch error url={}: {}", request.url, e);
                remove_partial(&request.destination).await;
            }
        }
        outcome
    }
}

fn classify(e: reqwest::Error) -> HubError {
    if e.is_status() || e.is_redirect() {
        HubError::ProtocolFailure(e.to_string())
    } else if e.is_body() || e.is_decode() {
        HubError::DataProcessingFailure(e.to_string())
    } else {
        HubError::ConnectionFailure(e.to_string())
    }
}

fn write_failure(path: &Path, e: std::io::Error) -> HubError {
    HubError::DataProcessingFailure(format!("write {}: {}", path.display(), e))
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("removed partial download {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("failed to remove partial download {}: {}", path.display(), e),
    }
}
