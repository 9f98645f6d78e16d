use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::admission::AdmissionStage;
use super::http_fetch::HttpFetchStage;
use super::retry::RetryStage;
use crate::error::{HubError, Result};

/// Receives the fraction (0.0..=1.0) of the payload transferred so far.
pub type ProgressFn = Arc<dyn Fn(f32) + Send + Sync>;

/// A single file transfer: `url` into `destination`.
#[derive(Clone)]
pub struct FetchRequest {
    pub url: String,
    pub destination: PathBuf,
    pub timeout: Duration,
    pub progress: Option<ProgressFn>,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
            timeout,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn report_progress(&self, fraction: f32) {
        if let Some(progress) = &self.progress {
            progress(fraction.clamp(0.0, 1.0));
        }
    }
}

impl fmt::Debug for FetchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchRequest")
            .field("url", &self.url)
            .field("destination", &self.destination)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FetchResponse {
    pub bytes_written: u64,
}

/// One link of the transport chain. A stage may do work itself, delegate to
/// `next`, or both. `next` is an immutable view of the remaining stages.
#[async_trait]
pub trait TransportStage: Send + Sync {
    async fn handle(
        &self,
        request: &FetchRequest,
        cancel: &CancellationToken,
        next: Next<'_>,
    ) -> Result<FetchResponse>;
}

/// The rest of the chain after the current stage.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    rest: &'a [Arc<dyn TransportStage>],
}

impl<'a> Next<'a> {
    pub fn new(stages: &'a [Arc<dyn TransportStage>]) -> Self {
        Self { rest: stages }
    }

    /// Remaining stage count, including the one `run` would invoke.
    pub fn remaining(&self) -> usize {
        self.rest.len()
    }

    pub async fn run(self, request: &FetchRequest, cancel: &CancellationToken) -> Result<FetchResponse> {
        match self.rest.split_first() {
            Some((stage, rest)) => stage.handle(request, cancel, Next { rest }).await,
            None => Err(HubError::InvalidState(format!(
                "transport chain for {} ended without a terminal stage",
                request.url
            ))),
        }
    }
}

/// Ordered list of stages. Cloning shares the stages, so admission limits
/// apply across every clone.
#[derive(Clone)]
pub struct Pipeline {
    stages: Arc<[Arc<dyn TransportStage>]>,
}

impl Pipeline {
    pub fn new(stages: Vec<Arc<dyn TransportStage>>) -> Self {
        Self {
            stages: stages.into(),
        }
    }

    /// Admission control in front of the HTTP fetch, with an optional retry
    /// stage between them.
    pub fn with_defaults(capacity: usize, max_retries: u32) -> Result<Self> {
        let mut stages: Vec<Arc<dyn TransportStage>> = vec![Arc::new(AdmissionStage::new(capacity)?)];
        if max_retries > 0 {
            stages.push(Arc::new(RetryStage::new(max_retries)));
        }
        stages.push(Arc::new(HttpFetchStage::new()));
        Ok(Self::new(stages))
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub async fn execute(&self, request: &FetchRequest, cancel: &CancellationToken) -> Result<FetchResponse> {
        Next::new(&self.stages).run(request, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Tag {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl TransportStage for Tag {
        async fn handle(
            &self,
            request: &FetchRequest,
            cancel: &CancellationToken,
            next: Next<'_>,
        ) -> Result<FetchResponse> {
            self.log.lock().push(format!("enter {}", self.name));
            let result = if next.remaining() == 0 {
                Ok(FetchResponse { bytes_written: 7 })
            } else {
                next.run(request, cancel).await
            };
            self.log.lock().push(format!("leave {}", self.name));
            result
        }
    }

    #[tokio::test]
    async fn test_stages_run_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(vec![
            Arc::new(Tag { name: "outer", log: log.clone() }),
            Arc::new(Tag { name: "inner", log: log.clone() }),
        ]);
        let request = FetchRequest::new("http://x/a", "/tmp/a", Duration::from_secs(1));
        let response = pipeline
            .execute(&request, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.bytes_written, 7);
        assert_eq!(
            *log.lock(),
            vec!["enter outer", "enter inner", "leave inner", "leave outer"]
        );
    }

    #[tokio::test]
    async fn test_empty_chain_is_invalid() {
        let pipeline = Pipeline::new(Vec::new());
        let request = FetchRequest::new("http://x/a", "/tmp/a", Duration::from_secs(1));
        let err = pipeline
            .execute(&request, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::InvalidState(_)));
    }

    #[test]
    fn test_progress_is_clamped() {
        let seen: Arc<Mutex<Vec<f32>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let request = FetchRequest::new("u", "d", Duration::from_secs(1))
            .with_progress(Arc::new(move |p: f32| sink.lock().push(p)));
        request.report_progress(1.5);
        request.report_progress(-1.0);
        assert_eq!(*seen.lock(), vec![1.0, 0.0]);
    }
}
