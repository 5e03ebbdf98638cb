//! Composition root
//!
//! [`Engine`] builds one of each shared service from a [`Config`] and owns
//! the provider registry. Providers receive a cloned [`Services`] handle at
//! construction and reach the HTTP stack, rate limiter, cache and download
//! coordinator through it.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::api::{ApiConfig, ApiInvoker};
use crate::cache::ResponseCache;
use crate::config::Config;
use crate::context::RequestContext;
use crate::download::{DownloadCoordinator, DownloadReport};
use crate::error::{Result, ResultExt};
use crate::helpers::{host_of, parse_chapter_id, parse_manga_id};
use crate::http_client::{HttpClient, HttpResponse, RequestOptions};
use crate::metrics::{MetricsTracker, RequestMetrics};
use crate::models::{Chapter, MangaInfo, SearchOptions, SortOrder};
use crate::provider::{Provider, ProviderInfo};
use crate::rate_limiter::RateLimiter;
use crate::registry::ProviderRegistry;
use crate::search::{SearchCoordinator, SearchResults};

/// Shared services handed to providers
#[derive(Clone)]
pub struct Services {
    pub config: Arc<Config>,
    pub http: Arc<HttpClient>,
    pub limiter: Arc<RateLimiter>,
    pub cache: Option<Arc<ResponseCache>>,
    pub metrics: Arc<MetricsTracker>,
    pub downloader: Arc<DownloadCoordinator>,
}

impl Services {
    pub fn new(config: Config) -> Result<Self> {
        let metrics = Arc::new(MetricsTracker::new());
        let http = Arc::new(HttpClient::new(&config.http, metrics.clone())?);
        Ok(Self::with_http(config, http, metrics))
    }

    /// Build around an existing client, e.g. one with a custom transport
    pub fn with_http(config: Config, http: Arc<HttpClient>, metrics: Arc<MetricsTracker>) -> Self {
        let limiter = Arc::new(RateLimiter::from_config(&config.rate_limit));
        let cache = config
            .cache
            .enabled
            .then(|| Arc::new(ResponseCache::from_config(&config.cache)));
        let downloader = Arc::new(DownloadCoordinator::new(http.clone(), limiter.clone()));
        Self {
            config: Arc::new(config),
            http,
            limiter,
            cache,
            metrics,
            downloader,
        }
    }

    /// API invoker over this engine's client, limiter and cache
    pub fn api(&self, config: ApiConfig) -> ApiInvoker {
        ApiInvoker::new(config, self.http.clone(), self.limiter.clone()).with_cache(self.cache.clone())
    }

    /// Rate-limited GET of an HTML page
    pub async fn fetch_page(&self, ctx: &RequestContext, url: &str, referer: Option<&str>) -> Result<HttpResponse> {
        self.limiter.wait_ctx(ctx, &host_of(url)).await?;
        let mut options = RequestOptions::default();
        if let Some(r) = referer {
            options = options.header("referer", r);
        }
        self.http.execute(ctx, reqwest::Method::GET, url, options).await
    }

    /// Rate-limited form POST, used by AJAX endpoints of HTML sites
    pub async fn post_form(
        &self,
        ctx: &RequestContext,
        url: &str,
        form: &[(&str, &str)],
        referer: Option<&str>,
    ) -> Result<HttpResponse> {
        self.limiter.wait_ctx(ctx, &host_of(url)).await?;
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(form)
            .finish();
        let mut options = RequestOptions::default()
            .header("content-type", "application/x-www-form-urlencoded; charset=UTF-8")
            .header("x-requested-with", "XMLHttpRequest");
        if let Some(r) = referer {
            options = options.header("referer", r);
        }
        options.body = Some(body.into_bytes());
        self.http.execute(ctx, reqwest::Method::POST, url, options).await
    }

    pub fn page_throttle(&self) -> Duration {
        self.config.page_throttle()
    }
}

pub struct Engine {
    services: Services,
    registry: ProviderRegistry,
    search: SearchCoordinator,
}

impl Engine {
    pub fn new(config: Config) -> Result<Self> {
        Ok(Self::from_services(Services::new(config)?))
    }

    pub fn from_services(services: Services) -> Self {
        let search = SearchCoordinator::from_config(
            &services.config.search,
            &services.config.rate_limit,
            services.metrics.clone(),
        );
        Self {
            services,
            registry: ProviderRegistry::new(),
            search,
        }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn config(&self) -> &Config {
        &self.services.config
    }

    pub fn register_provider(&self, provider: Arc<dyn Provider>) -> Result<()> {
        self.registry.register(provider)
    }

    pub fn get_provider(&self, id: &str) -> Result<Arc<dyn Provider>> {
        self.registry.require(id)
    }

    pub fn all_providers(&self) -> Vec<Arc<dyn Provider>> {
        self.registry.all()
    }

    pub fn provider_infos(&self) -> Vec<ProviderInfo> {
        self.registry.all().iter().map(|p| p.info()).collect()
    }

    /// Providers named by `only`, or all of them
    fn select_providers(&self, only: &[String]) -> Result<Vec<Arc<dyn Provider>>> {
        if only.is_empty() {
            return Ok(self.registry.all());
        }
        only.iter().map(|id| self.registry.require(id)).collect()
    }

    pub async fn search(
        &self,
        ctx: &RequestContext,
        providers: &[String],
        options: &SearchOptions,
    ) -> Result<SearchResults> {
        let selected = self.select_providers(providers)?;
        Ok(self
            .search
            .search_across(ctx, selected, &options.query, options)
            .await)
    }

    /// Latest updates: an empty query sorted by update time
    pub async fn list(
        &self,
        ctx: &RequestContext,
        providers: &[String],
        limit: usize,
        max_pages: usize,
    ) -> Result<SearchResults> {
        let options = SearchOptions {
            limit,
            max_pages,
            sort: SortOrder::Updated,
            ..SearchOptions::default()
        };
        self.search(ctx, providers, &options).await
    }

    /// Manga info for a `<provider>:<id>` identifier
    pub async fn get_manga(&self, ctx: &RequestContext, id: &str) -> Result<MangaInfo> {
        let (provider_id, local_id) = parse_manga_id(id).tracked()?;
        let provider = self.get_provider(&provider_id)?;
        provider.initialize(ctx).await.tracked_provider(&provider_id)?;
        let mut info = provider
            .get_manga(ctx, &local_id)
            .await
            .tracked_provider(&provider_id)?;
        info.manga = info.manga.normalized();
        Ok(info)
    }

    pub async fn get_chapter(&self, ctx: &RequestContext, id: &str) -> Result<Chapter> {
        let (provider_id, local_id) = parse_chapter_id(id).tracked()?;
        let provider = self.get_provider(&provider_id)?;
        provider.initialize(ctx).await.tracked_provider(&provider_id)?;
        provider
            .get_chapter(ctx, &local_id)
            .await
            .tracked_provider(&provider_id)
    }

    pub async fn download_chapter(&self, ctx: &RequestContext, id: &str, dest_dir: &Path) -> Result<DownloadReport> {
        let (provider_id, local_id) = parse_chapter_id(id).tracked()?;
        let provider = self.get_provider(&provider_id)?;
        provider.initialize(ctx).await.tracked_provider(&provider_id)?;
        provider
            .download_chapter(ctx, &local_id, dest_dir)
            .await
            .tracked_provider(&provider_id)
    }

    pub fn stats(&self) -> Vec<RequestMetrics> {
        self.services.metrics.get_all_metrics()
    }

    pub fn clear_cache(&self) -> Result<usize> {
        match &self.services.cache {
            Some(cache) => cache.clear(),
            None => Ok(0),
        }
    }

    pub fn clean_expired_cache(&self) -> Result<usize> {
        match &self.services.cache {
            Some(cache) => cache.clean_expired(),
            None => Ok(0),
        }
    }
}
