use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::pipeline::{FetchRequest, FetchResponse, Next, TransportStage};
use crate::error::{HubError, Result};

/// Re-runs the rest of the chain after connection-level failures, backing
/// off 500 ms times the attempt number. Protocol errors and timeouts are
/// surfaced immediately.
pub struct RetryStage {
    max_retries: u32,
    backoff: Duration,
}

impl RetryStage {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: Duration::from_millis(500),
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }
}

#[async_trait]
impl TransportStage for RetryStage {
    async fn handle(
        &self,
        request: &FetchRequest,
        cancel: &CancellationToken,
        next: Next<'_>,
    ) -> Result<FetchResponse> {
        let mut attempt = 0u32;
        loop {
            match next.run(request, cancel).await {
                Err(HubError::ConnectionFailure(msg)) if attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        "fetch {} failed (attempt {}): {}, retrying",
                        request.url, attempt, msg
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(HubError::Cancelled),
                        _ = tokio::time::sleep(self.backoff * attempt) => {}
                    }
                }
                other => return other,
            }
        }
    }
}
