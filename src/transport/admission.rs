// Admission control: bounds how many downstream transfers run at once.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::pipeline::{FetchRequest, FetchResponse, Next, TransportStage};
use crate::error::{HubError, Result};

/// Requests beyond `capacity` wait in a FIFO queue. The semaphore hands a
/// released permit straight to the oldest waiter before the finishing
/// request returns, so a queued transfer never waits for another scheduling
/// round to be admitted.
pub struct AdmissionStage {
    capacity: usize,
    semaphore: Semaphore,
    running: AtomicUsize,
    waiting: AtomicUsize,
}

struct Running<'a>(&'a AtomicUsize);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AdmissionStage {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(HubError::InvalidState(
                "admission capacity must be >= 1".to_string(),
            ));
        }
        Ok(Self {
            capacity,
            semaphore: Semaphore::new(capacity),
            running: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn running_count(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportStage for AdmissionStage {
    async fn handle(
        &self,
        request: &FetchRequest,
        cancel: &CancellationToken,
        next: Next<'_>,
    ) -> Result<FetchResponse> {
        if cancel.is_cancelled() {
            return Err(HubError::Cancelled);
        }

        let permit = match self.semaphore.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                self.waiting.fetch_add(1, Ordering::SeqCst);
                debug!("admission full ({}), queued url={}", self.capacity, request.url);

                // Cancellation wins ties so a cancelled waiter never starts.
                let acquired = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = self.semaphore.acquire() => Some(permit),
                };
                self.waiting.fetch_sub(1, Ordering::SeqCst);

                match acquired {
                    None => {
                        debug!("queued request cancelled before dispatch url={}", request.url);
                        return Err(HubError::Cancelled);
                    }
                    Some(Ok(_)) if cancel.is_cancelled() => {
                        debug!("request cancelled at dispatch url={}", request.url);
                        return Err(HubError::Cancelled);
                    }
                    Some(Ok(permit)) => permit,
                    Some(Err(e)) => {
                        return Err(HubError::InvalidState(format!(
                            "admission semaphore closed: {}",
                            e
                        )))
                    }
                }
            }
        };

        self.running.fetch_add(1, Ordering::SeqCst);
        let running = Running(&self.running);
        debug!("admitted url={} running={}", request.url, self.running_count());

        let result = next.run(request, cancel).await;

        drop(running);
        drop(permit);
        result
    }
}
