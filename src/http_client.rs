use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, ClientBuilder, Method};
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::HttpConfig;
use crate::context::RequestContext;
use crate::error::{EngineError, Result, TrackedError};
use crate::helpers::{body_sample, host_of};
use crate::metrics::MetricsTracker;

/// User agents to rotate through when no fixed one is configured
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.0.0",
];

const DEFAULT_ACCEPT: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,application/json;q=0.9,image/avif,image/webp,*/*;q=0.8";
const DEFAULT_ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";

/// A request as handed to a [`Transport`]
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    /// Lower-case header names
    pub headers: BTreeMap<String, String>,
    pub body: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    /// Lower-case header names
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(|s| s.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Failure below the HTTP layer: DNS, connect, TLS, read, timeout
#[derive(Debug, Error)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
    pub timeout: bool,
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        // reqwest hides the interesting part in the source chain
        let mut message = e.to_string();
        let mut source = std::error::Error::source(&e);
        while let Some(s) = source {
            message.push_str(": ");
            message.push_str(&s.to_string());
            source = s.source();
        }
        Self {
            message,
            timeout: e.is_timeout(),
        }
    }
}

/// Executes one HTTP exchange. Retries and classification happen above it.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &HttpRequest) -> std::result::Result<HttpResponse, TransportError>;
}

/// Default transport backed by a shared `reqwest::Client`
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(config: &HttpConfig) -> std::result::Result<Self, reqwest::Error> {
        let client = ClientBuilder::new()
            .timeout(Duration::from_secs(config.timeout_secs))
            .cookie_store(config.enable_cookies)
            .gzip(config.enable_compression)
            .brotli(config.enable_compression)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .build()?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
        let mut builder = self.client.request(request.method.clone(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_lowercase(), v.to_string())))
            .collect();
        let body = response.bytes().await?.to_vec();
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Retry and backoff settings
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub user_agent: Option<String>,
    pub body_sample_bytes: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self::from(&HttpConfig::default())
    }
}

impl From<&HttpConfig> for HttpClientConfig {
    fn from(c: &HttpConfig) -> Self {
        Self {
            timeout: Duration::from_secs(c.timeout_secs),
            max_retries: c.max_retries,
            backoff_base: Duration::from_millis(c.backoff_base_ms),
            backoff_cap: Duration::from_millis(c.backoff_cap_ms),
            user_agent: c.user_agent.clone(),
            body_sample_bytes: c.body_sample_bytes,
        }
    }
}

/// Per-call knobs
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub headers: BTreeMap<String, String>,
    pub body: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
}

impl RequestOptions {
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_lowercase(), value.into());
        self
    }

    pub fn headers<'a>(mut self, headers: impl IntoIterator<Item = (&'a String, &'a String)>) -> Self {
        for (k, v) in headers {
            self.headers.insert(k.to_lowercase(), v.clone());
        }
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Retrying HTTP client with status classification
pub struct HttpClient {
    transport: Arc<dyn Transport>,
    config: HttpClientConfig,
    metrics: Arc<MetricsTracker>,
}

impl HttpClient {
    pub fn new(config: &HttpConfig, metrics: Arc<MetricsTracker>) -> Result<Self> {
        let transport = ReqwestTransport::new(config).map_err(|e| crate::track!(e))?;
        Ok(Self::with_transport(
            Arc::new(transport),
            HttpClientConfig::from(config),
            metrics,
        ))
    }

    pub fn with_transport(
        transport: Arc<dyn Transport>,
        config: HttpClientConfig,
        metrics: Arc<MetricsTracker>,
    ) -> Self {
        Self {
            transport,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<MetricsTracker> {
        &self.metrics
    }

    fn user_agent(&self) -> String {
        match &self.config.user_agent {
            Some(ua) => ua.clone(),
            None => {
                let mut rng = rand::thread_rng();
                USER_AGENTS[rng.gen_range(0..USER_AGENTS.len())].to_string()
            }
        }
    }

    /// Default headers overlaid with the per-call ones
    fn merged_headers(&self, extra: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut headers = BTreeMap::new();
        headers.insert("accept".to_string(), DEFAULT_ACCEPT.to_string());
        headers.insert("accept-language".to_string(), DEFAULT_ACCEPT_LANGUAGE.to_string());
        headers.insert("user-agent".to_string(), self.user_agent());
        for (k, v) in extra {
            headers.insert(k.to_lowercase(), v.clone());
        }
        headers
    }

    /// Sleep before retry `attempt` (0-based): base * 2^attempt, capped
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.config
            .backoff_base
            .checked_mul(factor)
            .unwrap_or(self.config.backoff_cap)
            .min(self.config.backoff_cap)
    }

    /// Run a request with retries. 2xx and 3xx come back as-is, 4xx and exhausted
    /// 5xx become categorized errors.
    pub async fn execute(
        &self,
        ctx: &RequestContext,
        method: Method,
        url: &str,
        options: RequestOptions,
    ) -> Result<HttpResponse> {
        let host = host_of(url);
        let request = HttpRequest {
            method,
            url: url.to_string(),
            headers: self.merged_headers(&options.headers),
            body: options.body,
            timeout: Some(options.timeout.unwrap_or(self.config.timeout)),
        };
        let retries = options.retries.unwrap_or(self.config.max_retries);
        let attempts = retries + 1;
        let mut last_error: Option<TrackedError> = None;

        for attempt in 0..attempts {
            if ctx.is_done() {
                return Err(crate::track!(ctx.done_error(), "url" => url));
            }

            let started = Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = ctx.done() => return Err(crate::track!(ctx.done_error(), "url" => url)),
                r = self.transport.send(&request) => r,
            };

            let error = match outcome {
                Ok(response) if response.status >= 500 => {
                    log::warn!(
                        "Received status {} for {}, attempt {}/{}",
                        response.status,
                        url,
                        attempt + 1,
                        attempts
                    );
                    self.status_error(&response, url)
                }
                Ok(response) if response.status >= 400 => {
                    let err = self.status_error(&response, url);
                    self.metrics.record_failure(&host, &err);
                    return Err(err);
                }
                Ok(response) => {
                    self.metrics.record_success(&host, started.elapsed());
                    return Ok(response);
                }
                Err(e) => {
                    log::warn!(
                        "Request failed for {}, attempt {}/{}: {}",
                        url,
                        attempt + 1,
                        attempts,
                        e
                    );
                    crate::track!(
                        EngineError::Transport {
                            url: url.to_string(),
                            message: e.message,
                            timeout: e.timeout,
                        },
                        "attempt" => attempt + 1
                    )
                }
            };

            if attempt + 1 < attempts {
                self.metrics.record_retry(&host);
                let delay = self.backoff_delay(attempt);
                log::debug!("Retrying {} in {:?}", url, delay);
                last_error = Some(error);
                if let Err(e) = ctx.sleep(delay).await {
                    return Err(crate::track!(e, "url" => url));
                }
            } else {
                last_error = Some(error);
            }
        }

        let err = match last_error {
            Some(e) => e.with_context("attempts", attempts),
            None => crate::track!(EngineError::InvalidInput("request made no attempts".to_string())),
        };
        self.metrics.record_failure(&host, &err);
        Err(err)
    }

    fn status_error(&self, response: &HttpResponse, url: &str) -> TrackedError {
        let (resource_type, resource_id) = if response.status == 404 {
            resource_from_url(url)
        } else {
            (None, None)
        };
        crate::track!(
            EngineError::HttpStatus {
                status: response.status,
                url: url.to_string(),
                body_sample: body_sample(&response.body, self.config.body_sample_bytes),
                resource_type,
                resource_id,
            },
            "status" => response.status
        )
    }

    pub async fn get(&self, ctx: &RequestContext, url: &str) -> Result<HttpResponse> {
        self.execute(ctx, Method::GET, url, RequestOptions::default()).await
    }

    pub async fn fetch_string(&self, ctx: &RequestContext, url: &str) -> Result<String> {
        Ok(self.get(ctx, url).await?.text())
    }

    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        ctx: &RequestContext,
        url: &str,
        options: RequestOptions,
    ) -> Result<T> {
        let response = self
            .execute(ctx, Method::GET, url, options.header("accept", "application/json"))
            .await?;
        decode_json(&response.body, url, self.config.body_sample_bytes)
    }
}

/// Deserialize a body, reporting a parsing error with a sample on failure
pub fn decode_json<T: DeserializeOwned>(body: &[u8], what: &str, sample_bytes: usize) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| {
        crate::track!(EngineError::Parsing {
            what: what.to_string(),
            message: e.to_string(),
            sample: Some(body_sample(body, sample_bytes)),
        })
    })
}

/// Best-effort `(type, id)` from the last two path segments
fn resource_from_url(url: &str) -> (Option<String>, Option<String>) {
    let Ok(parsed) = url::Url::parse(url) else {
        return (None, None);
    };
    let segments: Vec<&str> = parsed
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).collect())
        .unwrap_or_default();
    match segments.as_slice() {
        [.., kind, id] => (Some(kind.to_string()), Some(id.to_string())),
        [id] => (None, Some(id.to_string())),
        [] => (None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Scripted {
        statuses: Mutex<Vec<u16>>,
        calls: AtomicUsize,
        seen: Mutex<Vec<BTreeMap<String, String>>>,
    }

    impl Scripted {
        fn new(statuses: &[u16]) -> Arc<Self> {
            Arc::new(Self {
                statuses: Mutex::new(statuses.iter().rev().copied().collect()),
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn send(&self, request: &HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(request.headers.clone());
            let status = self.statuses.lock().unwrap().pop().unwrap_or(200);
            if status == 0 {
                return Err(TransportError {
                    message: "connection refused".into(),
                    timeout: false,
                });
            }
            Ok(HttpResponse {
                status,
                headers: HashMap::new(),
                body: br#"{"ok":true}"#.to_vec(),
            })
        }
    }

    fn client(transport: Arc<Scripted>) -> HttpClient {
        HttpClient::with_transport(transport, HttpClientConfig::default(), Arc::new(MetricsTracker::new()))
    }

    #[test]
    fn test_backoff_is_capped() {
        let c = client(Scripted::new(&[]));
        assert_eq!(c.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(c.backoff_delay(2), Duration::from_secs(4));
        assert_eq!(c.backoff_delay(5), Duration::from_secs(30));
        assert_eq!(c.backoff_delay(40), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_then_success() {
        let t = Scripted::new(&[0, 200]);
        let c = client(t.clone());
        let resp = c.get(&RequestContext::new(), "https://h.test/a").await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(t.calls.load(Ordering::SeqCst), 2);
        let m = c.metrics().get_metrics("h.test").unwrap();
        assert_eq!(m.retry_count, 1);
        assert_eq!(m.successful_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_errors_are_not_retried() {
        let cases = [
            (401, ErrorCategory::Auth),
            (403, ErrorCategory::Auth),
            (404, ErrorCategory::NotFound),
            (429, ErrorCategory::RateLimit),
            (422, ErrorCategory::Provider),
        ];
        for (status, category) in cases {
            let t = Scripted::new(&[status]);
            let c = client(t.clone());
            let err = c
                .get(&RequestContext::new(), "https://h.test/manga/abc")
                .await
                .unwrap_err();
            assert_eq!(err.category(), category, "status {}", status);
            assert_eq!(err.http_status(), Some(status));
            assert_eq!(t.calls.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_not_found_names_resource() {
        let c = client(Scripted::new(&[404]));
        let err = c
            .get(&RequestContext::new(), "https://h.test/api/chapter/xyz")
            .await
            .unwrap_err();
        match err.engine_error() {
            Some(EngineError::HttpStatus {
                resource_type,
                resource_id,
                body_sample,
                ..
            }) => {
                assert_eq!(resource_type.as_deref(), Some("chapter"));
                assert_eq!(resource_id.as_deref(), Some("xyz"));
                assert!(body_sample.contains("ok"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_per_call_headers_win() {
        let t = Scripted::new(&[200]);
        let c = client(t.clone());
        let opts = RequestOptions::default().header("Accept", "image/*").header("Referer", "https://h.test/");
        c.execute(&RequestContext::new(), Method::GET, "https://h.test/p.jpg", opts)
            .await
            .unwrap();
        let seen = t.seen.lock().unwrap();
        assert_eq!(seen[0]["accept"], "image/*");
        assert_eq!(seen[0]["referer"], "https://h.test/");
        assert!(USER_AGENTS.contains(&seen[0]["user-agent"].as_str()));
        assert_eq!(seen[0]["accept-language"], DEFAULT_ACCEPT_LANGUAGE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let c = client(Scripted::new(&[500, 500, 500, 500]));
        let ctx = RequestContext::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            canceller.cancel();
        });
        let start = Instant::now();
        let err = c.get(&ctx, "https://h.test/x").await.unwrap_err();
        assert!(matches!(err.engine_error(), Some(EngineError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_fetch_json_parse_error_has_sample() {
        struct Html;
        #[async_trait]
        impl Transport for Html {
            async fn send(&self, _: &HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
                Ok(HttpResponse {
                    status: 200,
                    headers: HashMap::new(),
                    body: b"<html>maintenance</html>".to_vec(),
                })
            }
        }
        let c = HttpClient::with_transport(
            Arc::new(Html),
            HttpClientConfig::default(),
            Arc::new(MetricsTracker::new()),
        );
        let err = c
            .fetch_json::<serde_json::Value>(&RequestContext::new(), "https://h.test/j", RequestOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Parsing);
        match err.engine_error() {
            Some(EngineError::Parsing { sample, .. }) => {
                assert_eq!(sample.as_deref(), Some("<html>maintenance</html>"))
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
