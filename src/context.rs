//! Per-request context threaded through engine calls
//!
//! Carries the cancellation token, an optional deadline and the small
//! overrides callers can attach to a single operation (worker concurrency,
//! volume number for the on-disk layout).

use crate::error::{EngineError, Result, TrackedError};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    concurrency: Option<usize>,
    volume: Option<f64>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Child context that is cancelled with its parent and expires after `timeout`
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            cancel: self.cancel.child_token(),
            deadline: Some(deadline),
            concurrency: self.concurrency,
            volume: self.volume,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency.max(1));
        self
    }

    pub fn with_volume(mut self, volume: f64) -> Self {
        self.volume = Some(volume);
        self
    }

    pub fn concurrency(&self) -> Option<usize> {
        self.concurrency
    }

    pub fn volume(&self) -> Option<f64> {
        self.volume
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_done(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Error describing why the context is done
    pub fn done_error(&self) -> TrackedError {
        if self.cancel.is_cancelled() {
            TrackedError::track(EngineError::Cancelled)
        } else {
            TrackedError::track(EngineError::Timeout(self.timeout_budget()))
        }
    }

    fn timeout_budget(&self) -> Duration {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
            .unwrap_or_default()
    }

    /// Resolves when the context is cancelled or its deadline passes
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.cancel.cancelled().await,
        }
    }

    /// Drive `fut` unless the context finishes first
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(TrackedError::track(EngineError::Cancelled));
        }
        let started = Instant::now();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TrackedError::track(EngineError::Cancelled)),
            _ = sleep_until_opt(self.deadline) => {
                Err(TrackedError::track(EngineError::Timeout(started.elapsed())))
            }
            res = fut => res,
        }
    }

    /// Interruptible sleep
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        self.run(async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;

    #[tokio::test(start_paused = true)]
    async fn test_sleep_interrupted_by_cancel() {
        let ctx = RequestContext::new();
        let child = ctx.with_timeout(Duration::from_secs(60));
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });
        let start = Instant::now();
        let err = child.sleep(Duration::from_secs(30)).await.unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(matches!(err.engine_error(), Some(EngineError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expires() {
        let ctx = RequestContext::new().with_timeout(Duration::from_secs(5));
        let err = ctx.sleep(Duration::from_secs(10)).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Timeout);
        assert!(ctx.is_done());
    }

    #[test]
    fn test_child_deadline_never_extends_parent() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async {
            let parent = RequestContext::new().with_timeout(Duration::from_secs(5));
            let child = parent.with_timeout(Duration::from_secs(60));
            assert_eq!(child.deadline(), parent.deadline());
        });
    }

    #[test]
    fn test_overrides() {
        let ctx = RequestContext::new().with_concurrency(0).with_volume(2.0);
        assert_eq!(ctx.concurrency(), Some(1));
        assert_eq!(ctx.volume(), Some(2.0));
    }
}
