#![allow(dead_code)]

use async_trait::async_trait;
use manga_fetcher::config::Config;
use manga_fetcher::download::DownloadReport;
use manga_fetcher::error::{EngineError, Result};
use manga_fetcher::http_client::{HttpClient, HttpClientConfig, HttpRequest, HttpResponse, Transport, TransportError};
use manga_fetcher::metrics::MetricsTracker;
use manga_fetcher::models::{Chapter, Manga, MangaInfo, SearchOptions};
use manga_fetcher::{Provider, RequestContext, Services};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Transport answering from a table of url prefixes; unknown urls get 404
#[derive(Default)]
pub struct StubTransport {
    routes: Mutex<Vec<(String, Vec<u16>, Vec<u8>)>>,
    pub requests: Mutex<Vec<HttpRequest>>,
}

impl StubTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Serve `body` for urls starting with `prefix`. `statuses` are used in
    /// order, the last one repeating; status 0 is a connection failure.
    pub fn route(&self, prefix: &str, statuses: &[u16], body: &[u8]) {
        self.routes
            .lock()
            .unwrap()
            .push((prefix.to_string(), statuses.to_vec(), body.to_vec()));
    }

    pub fn calls_to(&self, prefix: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl Transport for StubTransport {
    async fn send(&self, request: &HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        let mut routes = self.routes.lock().unwrap();
        let Some((_, statuses, body)) = routes.iter_mut().find(|(p, _, _)| request.url.starts_with(p.as_str())) else {
            return Ok(HttpResponse {
                status: 404,
                headers: HashMap::new(),
                body: b"no route".to_vec(),
            });
        };
        let status = if statuses.len() > 1 { statuses.remove(0) } else { statuses.first().copied().unwrap_or(200) };
        if status == 0 {
            return Err(TransportError {
                message: "connection refused".into(),
                timeout: false,
            });
        }
        Ok(HttpResponse {
            status,
            headers: HashMap::new(),
            body: body.clone(),
        })
    }
}

/// Config with no per-host spacing and no delays, so tests run at full speed
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.rate_limit.default_interval_ms = 0;
    config.search.page_throttle_ms = 0;
    config.download.retry_delay_ms = 0;
    config.http.backoff_base_ms = 10;
    config.http.backoff_cap_ms = 20;
    config
}

pub fn services_with(transport: Arc<StubTransport>, config: Config) -> Services {
    let metrics = Arc::new(MetricsTracker::new());
    let http = HttpClient::with_transport(transport, HttpClientConfig::from(&config.http), metrics.clone());
    Services::with_http(config, Arc::new(http), metrics)
}

/// Provider returning canned search results after a delay
pub struct FakeProvider {
    pub id: String,
    pub results: usize,
    pub delay: Duration,
    pub fail: bool,
    pub panic: bool,
    pub untitled: bool,
    pub in_flight: Arc<AtomicUsize>,
    pub max_in_flight: Arc<AtomicUsize>,
}

impl FakeProvider {
    pub fn new(id: &str, results: usize) -> Self {
        Self {
            id: id.to_string(),
            results,
            delay: Duration::ZERO,
            fail: false,
            panic: false,
            untitled: false,
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn panicking(mut self) -> Self {
        self.panic = true;
        self
    }

    /// Search results come back with empty titles
    pub fn untitled(mut self) -> Self {
        self.untitled = true;
        self
    }

    /// Share in-flight counters with other providers
    pub fn counters(mut self, in_flight: Arc<AtomicUsize>, max_in_flight: Arc<AtomicUsize>) -> Self {
        self.in_flight = in_flight;
        self.max_in_flight = max_in_flight;
        self
    }
}

#[async_trait]
impl Provider for FakeProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        "Fake"
    }

    fn description(&self) -> &str {
        "canned results"
    }

    fn site_url(&self) -> &str {
        "https://fake.test"
    }

    async fn initialize(&self, _ctx: &RequestContext) -> Result<()> {
        Ok(())
    }

    async fn search(&self, _ctx: &RequestContext, query: &str, _options: &SearchOptions) -> Result<Vec<Manga>> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.panic {
            panic!("provider {} exploded", self.id);
        }
        if self.fail {
            return Err(manga_fetcher::track!(EngineError::Transport {
                url: "https://fake.test/search".into(),
                message: "connection refused".into(),
                timeout: false,
            }));
        }
        Ok((0..self.results)
            .map(|i| Manga {
                id: format!("{}-{}", self.id, i),
                title: if self.untitled {
                    String::new()
                } else {
                    format!("{} {} {}", query, self.id, i)
                },
                ..Default::default()
            })
            .collect())
    }

    async fn get_manga(&self, _ctx: &RequestContext, id: &str) -> Result<MangaInfo> {
        Ok(MangaInfo {
            manga: Manga {
                id: id.to_string(),
                alt_titles: vec![" ".into(), "Other".into(), "other".into()],
                ..Default::default()
            },
            ..Default::default()
        })
    }

    async fn get_chapter(&self, _ctx: &RequestContext, chapter_id: &str) -> Result<Chapter> {
        Err(manga_fetcher::track!(EngineError::NotFound(format!("chapter {}", chapter_id))))
    }

    async fn try_get_manga_for_chapter(&self, _ctx: &RequestContext, _chapter_id: &str) -> Result<Option<Manga>> {
        Ok(None)
    }

    async fn download_chapter(&self, _ctx: &RequestContext, chapter_id: &str, _dest: &Path) -> Result<DownloadReport> {
        Err(manga_fetcher::track!(EngineError::NotFound(format!("chapter {}", chapter_id))))
    }
}
