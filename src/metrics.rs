/// Request metrics for hosts and providers
///
/// Tracks success rates, error counts and response times per key. The HTTP
/// client records under the request host, the search coordinator under the
/// provider id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{ErrorCategory, TrackedError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMetrics {
    pub key: String,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub average_response_time_ms: f64,
    pub total_response_time_ms: u64,
    pub retry_count: u64,
    pub rate_limit_hits: u64,
    pub timeout_count: u64,
}

impl RequestMetrics {
    pub fn new(key: String) -> Self {
        Self {
            key,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            last_success: None,
            last_failure: None,
            last_error: None,
            average_response_time_ms: 0.0,
            total_response_time_ms: 0,
            retry_count: 0,
            rate_limit_hits: 0,
            timeout_count: 0,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            (self.successful_requests as f64 / self.total_requests as f64) * 100.0
        }
    }

    pub fn record_success(&mut self, response_time: Duration) {
        self.total_requests += 1;
        self.successful_requests += 1;
        self.last_success = Some(Utc::now());

        let response_ms = response_time.as_millis() as u64;
        self.total_response_time_ms += response_ms;
        self.average_response_time_ms =
            self.total_response_time_ms as f64 / self.successful_requests as f64;
    }

    pub fn record_failure(&mut self, category: ErrorCategory, error: String) {
        self.total_requests += 1;
        self.failed_requests += 1;
        self.last_failure = Some(Utc::now());
        self.last_error = Some(error);

        match category {
            ErrorCategory::RateLimit => self.rate_limit_hits += 1,
            ErrorCategory::Timeout => self.timeout_count += 1,
            _ => {}
        }
    }

    pub fn record_retry(&mut self) {
        self.retry_count += 1;
    }
}

/// Shared metrics table
#[derive(Debug, Default)]
pub struct MetricsTracker {
    metrics: Mutex<HashMap<String, RequestMetrics>>,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entry<R>(&self, key: &str, f: impl FnOnce(&mut RequestMetrics) -> R) -> R {
        let mut metrics = self.metrics.lock().unwrap_or_else(|p| p.into_inner());
        let entry = metrics
            .entry(key.to_string())
            .or_insert_with(|| RequestMetrics::new(key.to_string()));
        f(entry)
    }

    pub fn record_success(&self, key: &str, response_time: Duration) {
        let rate = self.with_entry(key, |m| {
            m.record_success(response_time);
            m.success_rate()
        });
        log::debug!(
            "[{}] Success - Response time: {}ms - Success rate: {:.2}%",
            key,
            response_time.as_millis(),
            rate
        );
    }

    pub fn record_failure(&self, key: &str, error: &TrackedError) {
        let rate = self.with_entry(key, |m| {
            m.record_failure(error.category(), error.to_string());
            m.success_rate()
        });
        log::debug!(
            "[{}] Failure - Error: {} - Success rate: {:.2}%",
            key,
            error,
            rate
        );
    }

    pub fn record_retry(&self, key: &str) {
        let retries = self.with_entry(key, |m| {
            m.record_retry();
            m.retry_count
        });
        log::debug!("[{}] Retry attempt - Total retries: {}", key, retries);
    }

    pub fn get_metrics(&self, key: &str) -> Option<RequestMetrics> {
        let metrics = self.metrics.lock().unwrap_or_else(|p| p.into_inner());
        metrics.get(key).cloned()
    }

    /// Snapshot sorted by key
    pub fn get_all_metrics(&self) -> Vec<RequestMetrics> {
        let metrics = self.metrics.lock().unwrap_or_else(|p| p.into_inner());
        let mut all: Vec<RequestMetrics> = metrics.values().cloned().collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }
}

/// Time an operation and record its outcome under `key`
pub async fn track_request<F, T>(
    tracker: &MetricsTracker,
    key: &str,
    operation: F,
) -> Result<T, TrackedError>
where
    F: std::future::Future<Output = Result<T, TrackedError>>,
{
    let start = Instant::now();
    let result = operation.await;
    let duration = start.elapsed();

    match &result {
        Ok(_) => tracker.record_success(key, duration),
        Err(e) => tracker.record_failure(key, e),
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;

    #[test]
    fn test_metrics_creation() {
        let metrics = RequestMetrics::new("api.example.com".to_string());
        assert_eq!(metrics.key, "api.example.com");
        assert_eq!(metrics.total_requests, 0);
        assert_eq!(metrics.success_rate(), 0.0);
    }

    #[test]
    fn test_success_rate_calculation() {
        let mut metrics = RequestMetrics::new("mgd".to_string());

        metrics.record_success(Duration::from_millis(100));
        metrics.record_success(Duration::from_millis(200));
        metrics.record_failure(ErrorCategory::RateLimit, "Error".to_string());

        assert_eq!(metrics.total_requests, 3);
        assert_eq!(metrics.successful_requests, 2);
        assert_eq!(metrics.failed_requests, 1);
        assert_eq!(metrics.rate_limit_hits, 1);
        assert_eq!(metrics.average_response_time_ms, 150.0);
        assert!((metrics.success_rate() - 66.66).abs() < 0.1);
    }

    #[tokio::test]
    async fn test_track_request() {
        let tracker = MetricsTracker::new();

        let ok: Result<u32, TrackedError> = track_request(&tracker, "a", async { Ok(1) }).await;
        assert!(ok.is_ok());
        let err: Result<u32, TrackedError> = track_request(&tracker, "b", async {
            Err(TrackedError::track(EngineError::Timeout(Duration::from_secs(1))))
        })
        .await;
        assert!(err.is_err());
        tracker.record_retry("b");

        let all = tracker.get_all_metrics();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].key, "a");
        assert_eq!(all[0].success_rate(), 100.0);
        assert_eq!(all[1].timeout_count, 1);
        assert_eq!(all[1].retry_count, 1);
    }
}
