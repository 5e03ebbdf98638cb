//! Chapter download coordinator
//!
//! Lays out `<output>/<manga>/<chapter>/page_<NNN><ext>`, hands page fetches
//! to a bounded pool of workers and aggregates per-page failures. A page is
//! written to `<name>.part` and renamed once complete, so a file with the
//! final name is always whole.

use futures::FutureExt;
use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

use crate::config::DownloadConfig;
use crate::context::RequestContext;
use crate::error::{EngineError, Result, ResultExt, TrackedError};
use crate::helpers::{extension_of, format_number, host_of, sanitize_filename};
use crate::http_client::{HttpClient, RequestOptions};
use crate::models::{ChapterMetadata, Page};
use crate::rate_limiter::RateLimiter;

/// How long a worker waits before a page fetch; the flag is set on retry passes
pub type WaitFn = Arc<dyn Fn(bool) -> Duration + Send + Sync>;

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    /// Zero-based page index; the file is numbered `index + 1`
    pub index: usize,
    pub url: String,
    /// Remote filename, used for the extension
    pub filename: String,
    pub headers: BTreeMap<String, String>,
}

impl DownloadRequest {
    pub fn from_page(page: &Page) -> Self {
        Self {
            index: page.index,
            url: page.url.clone(),
            filename: page.filename.clone(),
            headers: BTreeMap::new(),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_lowercase(), value.to_string());
        self
    }
}

#[derive(Clone)]
pub struct DownloadJobConfig {
    pub metadata: ChapterMetadata,
    pub output_dir: PathBuf,
    pub concurrency: usize,
    pub files: Vec<DownloadRequest>,
    pub wait: WaitFn,
    /// Extra passes over pages that failed
    pub retry_failed: usize,
}

impl DownloadJobConfig {
    pub fn new(metadata: ChapterMetadata, output_dir: impl Into<PathBuf>, files: Vec<DownloadRequest>) -> Self {
        Self {
            metadata,
            output_dir: output_dir.into(),
            concurrency: 4,
            files,
            wait: Arc::new(|_| Duration::ZERO),
            retry_failed: 0,
        }
    }

    /// Concurrency, delays and retry passes from the `[download]` section
    pub fn with_settings(mut self, settings: &DownloadConfig) -> Self {
        self.concurrency = settings.concurrency.max(1);
        self.retry_failed = settings.retry_failed;
        let page_delay = Duration::from_millis(settings.page_delay_ms);
        let retry_delay = Duration::from_millis(settings.retry_delay_ms);
        self.wait = Arc::new(move |is_retry| if is_retry { retry_delay } else { page_delay });
        self
    }
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadReport {
    pub chapter_dir: PathBuf,
    /// Written files in page order
    pub files: Vec<PathBuf>,
    pub total: usize,
}

/// Sanitized path segment, `None` when empty or made only of dots
fn path_segment(raw: &str) -> Option<String> {
    let name = sanitize_filename(raw);
    if name.chars().all(|c| c == '.') {
        None
    } else {
        Some(name)
    }
}

/// Manga directory: sanitized title, else `<provider>-<manga>`, else `Unknown-Manga`
pub fn manga_dir_name(meta: &ChapterMetadata) -> String {
    if let Some(name) = path_segment(&meta.manga_title) {
        return name;
    }
    if meta.provider_id.is_empty() && meta.manga_id.is_empty() {
        return "Unknown-Manga".to_string();
    }
    path_segment(&format!("{}-{}", meta.provider_id, meta.manga_id)).unwrap_or_else(|| "Unknown-Manga".to_string())
}

/// `Vol.<N>_Ch.<M>` with missing parts left out, else `Ch.<chapterId>`
pub fn chapter_dir_name(meta: &ChapterMetadata) -> String {
    let mut parts = Vec::new();
    if let Some(vol) = meta.volume_number {
        parts.push(format!("Vol.{}", format_number(vol)));
    }
    if let Some(ch) = meta.chapter_number {
        parts.push(format!("Ch.{}", format_number(ch)));
    }
    if parts.is_empty() {
        let id = path_segment(&meta.chapter_id).unwrap_or_else(|| "unknown".to_string());
        return format!("Ch.{}", id);
    }
    parts.join("_")
}

/// `page_<NNN><ext>`, numbered from 1 and padded to the width of `total` (at least 3)
pub fn page_filename(index: usize, total: usize, remote_name: &str) -> String {
    let width = total.to_string().len().max(3);
    format!("page_{:0width$}{}", index + 1, extension_of(remote_name), width = width)
}

pub struct DownloadCoordinator {
    http: Arc<HttpClient>,
    limiter: Arc<RateLimiter>,
}

struct Shared {
    http: Arc<HttpClient>,
    limiter: Arc<RateLimiter>,
    chapter_dir: PathBuf,
    total: usize,
    wait: WaitFn,
    is_retry: bool,
}

impl DownloadCoordinator {
    pub fn new(http: Arc<HttpClient>, limiter: Arc<RateLimiter>) -> Self {
        Self { http, limiter }
    }

    pub async fn download(&self, ctx: &RequestContext, mut job: DownloadJobConfig) -> Result<DownloadReport> {
        if let Some(volume) = ctx.volume() {
            job.metadata.volume_number = Some(volume);
        }

        let chapter_dir = job
            .output_dir
            .join(manga_dir_name(&job.metadata))
            .join(chapter_dir_name(&job.metadata));
        create_dir(&chapter_dir).await?;

        let total = job.files.len();
        let concurrency = ctx.concurrency().unwrap_or(job.concurrency).max(1);
        log::info!(
            "Downloading {} pages of '{}' chapter {} into {}",
            total,
            job.metadata.manga_title,
            job.metadata.chapter_id,
            chapter_dir.display()
        );

        let mut saved: BTreeMap<usize, PathBuf> = BTreeMap::new();
        let mut pending = job.files.clone();
        let mut errors: BTreeMap<usize, TrackedError> = BTreeMap::new();

        for pass in 0..=job.retry_failed {
            if pending.is_empty() {
                break;
            }
            let is_retry = pass > 0;
            if is_retry {
                log::info!("Retry pass {}: {} pages", pass, pending.len());
            }
            let shared = Arc::new(Shared {
                http: self.http.clone(),
                limiter: self.limiter.clone(),
                chapter_dir: chapter_dir.clone(),
                total,
                wait: job.wait.clone(),
                is_retry,
            });
            let outcome = run_pool(ctx, shared, pending, concurrency).await;

            errors.clear();
            let mut failed_indices = HashSet::new();
            for (index, result) in outcome {
                match result {
                    Ok(path) => {
                        saved.insert(index, path);
                    }
                    Err(e) => {
                        log::warn!("Page {} failed: {}", index + 1, e);
                        failed_indices.insert(index);
                        errors.insert(index, e);
                    }
                }
            }
            pending = job
                .files
                .iter()
                .filter(|r| failed_indices.contains(&r.index) && !saved.contains_key(&r.index))
                .cloned()
                .collect();

            if ctx.is_done() {
                break;
            }
        }

        if let Some((_, first)) = errors.into_iter().next() {
            let failed = total - saved.len();
            return Err(crate::track!(
                EngineError::Download {
                    failed,
                    total,
                    first: Box::new(first),
                },
                "chapter_id" => &job.metadata.chapter_id,
                "dir" => chapter_dir.display()
            )
            .with_context("provider", &job.metadata.provider_id));
        }

        Ok(DownloadReport {
            chapter_dir,
            files: saved.into_values().collect(),
            total,
        })
    }
}

async fn create_dir(dir: &Path) -> Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o755);
    builder
        .create(dir)
        .await
        .map_err(|e| EngineError::io(dir, e))
        .tracked()
}

/// Run one pass over `requests` with `concurrency` workers
async fn run_pool(
    ctx: &RequestContext,
    shared: Arc<Shared>,
    requests: Vec<DownloadRequest>,
    concurrency: usize,
) -> Vec<(usize, Result<PathBuf>)> {
    let workers = concurrency.min(requests.len()).max(1);
    let (tx, rx) = mpsc::channel(requests.len().max(1));
    for request in requests {
        // capacity covers every request
        let _ = tx.try_send(request);
    }
    drop(tx);
    let rx = Arc::new(Mutex::new(rx));

    let mut set = JoinSet::new();
    for worker in 0..workers {
        let rx = rx.clone();
        let shared = shared.clone();
        let ctx = ctx.clone();
        set.spawn(async move {
            let mut results = Vec::new();
            loop {
                let next = rx.lock().await.recv().await;
                let Some(request) = next else { break };
                let index = request.index;
                if ctx.is_done() {
                    results.push((index, Err(ctx.done_error())));
                    continue;
                }
                let outcome = AssertUnwindSafe(fetch_page(&ctx, &shared, &request))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|payload| {
                        log::error!("worker {} panicked on page {}", worker, index + 1);
                        Err(TrackedError::from_panic(payload).with_context("url", &request.url))
                    });
                results.push((index, outcome));
            }
            results
        });
    }

    let mut all = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(results) => all.extend(results),
            Err(e) if e.is_panic() => {
                log::error!("download worker died: {}", e);
            }
            Err(e) => log::error!("download worker cancelled: {}", e),
        }
    }
    all
}

async fn fetch_page(ctx: &RequestContext, shared: &Shared, request: &DownloadRequest) -> Result<PathBuf> {
    let delay = (shared.wait)(shared.is_retry);
    if !delay.is_zero() {
        ctx.sleep(delay).await?;
    }
    shared.limiter.wait_ctx(ctx, &host_of(&request.url)).await?;

    let options = RequestOptions::default()
        .headers(&request.headers)
        .header("accept", "image/avif,image/webp,image/apng,image/*,*/*;q=0.8");
    let response = shared
        .http
        .execute(ctx, reqwest::Method::GET, &request.url, options)
        .await
        .map_err(|e| crate::track!(e, "page" => request.index + 1))?;
    if !response.is_success() {
        return Err(crate::track!(
            EngineError::HttpStatus {
                status: response.status,
                url: request.url.clone(),
                body_sample: String::new(),
                resource_type: Some("page".to_string()),
                resource_id: Some((request.index + 1).to_string()),
            },
            "page" => request.index + 1
        ));
    }

    let name = page_filename(request.index, shared.total, &request.filename);
    let path = shared.chapter_dir.join(&name);
    let part = shared.chapter_dir.join(format!("{}.part", name));
    tokio::fs::write(&part, &response.body)
        .await
        .map_err(|e| EngineError::io(&part, e))
        .tracked()?;
    tokio::fs::rename(&part, &path)
        .await
        .map_err(|e| EngineError::io(&path, e))
        .tracked()?;
    log::debug!("saved {} ({} bytes)", path.display(), response.body.len());
    Ok(path)
}
