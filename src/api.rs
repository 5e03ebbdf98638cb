//! Declarative JSON API invocation
//!
//! An [`ApiConfig`] lists named [`ApiEndpoint`]s. [`ApiInvoker::invoke`]
//! expands the endpoint path, formats query parameters, waits on the rate
//! limiter, executes through the [`HttpClient`] and deserializes the body
//! into the caller's type. GET responses go through the response cache
//! when one is attached.

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::cache::ResponseCache;
use crate::context::RequestContext;
use crate::error::{EngineError, Result};
use crate::helpers::{body_sample, host_of};
use crate::http_client::{decode_json, HttpClient, RequestOptions};
use crate::rate_limiter::RateLimiter;

pub type PathFormatter = Arc<dyn Fn(&str, &[&str]) -> String + Send + Sync>;
pub type QueryFormatter = Arc<dyn Fn(&Value) -> Vec<(String, String)> + Send + Sync>;

#[derive(Clone)]
pub struct ApiEndpoint {
    /// Path relative to the base url, with `{id}` placeholders
    pub path: String,
    pub method: Method,
    /// Name of the response shape, for diagnostics
    pub response: &'static str,
    pub path_formatter: Option<PathFormatter>,
    pub query_formatter: Option<QueryFormatter>,
}

impl ApiEndpoint {
    pub fn get(path: &str, response: &'static str) -> Self {
        Self {
            path: path.to_string(),
            method: Method::GET,
            response,
            path_formatter: None,
            query_formatter: None,
        }
    }

    pub fn with_path_formatter<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &[&str]) -> String + Send + Sync + 'static,
    {
        self.path_formatter = Some(Arc::new(f));
        self
    }

    pub fn with_query_formatter<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> Vec<(String, String)> + Send + Sync + 'static,
    {
        self.query_formatter = Some(Arc::new(f));
        self
    }

    /// Expand the path with the endpoint's formatter, or bind `{id}` slots in order
    pub fn format_path(&self, args: &[&str]) -> String {
        match &self.path_formatter {
            Some(f) => f(&self.path, args),
            None => substitute_ids(&self.path, args),
        }
    }
}

impl fmt::Debug for ApiEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiEndpoint")
            .field("path", &self.path)
            .field("method", &self.method)
            .field("response", &self.response)
            .finish()
    }
}

/// Replace each `{id}` with the next argument; extra placeholders stay as they are
pub fn substitute_ids(template: &str, args: &[&str]) -> String {
    let mut out = template.to_string();
    for arg in args {
        match out.find("{id}") {
            Some(pos) => out.replace_range(pos..pos + 4, arg),
            None => break,
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub headers: BTreeMap<String, String>,
    /// Overrides the client's retry count when set
    pub retries: Option<u32>,
    /// Minimum spacing between requests to the base host
    pub throttle: Duration,
    pub endpoints: HashMap<String, ApiEndpoint>,
}

impl ApiConfig {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            headers: BTreeMap::new(),
            retries: None,
            throttle: Duration::ZERO,
            endpoints: HashMap::new(),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_lowercase(), value.to_string());
        self
    }

    pub fn throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn endpoint(mut self, name: &str, endpoint: ApiEndpoint) -> Self {
        self.endpoints.insert(name.to_string(), endpoint);
        self
    }
}

pub struct ApiInvoker {
    config: ApiConfig,
    http: Arc<HttpClient>,
    limiter: Arc<RateLimiter>,
    cache: Option<Arc<ResponseCache>>,
}

impl ApiInvoker {
    pub fn new(config: ApiConfig, http: Arc<HttpClient>, limiter: Arc<RateLimiter>) -> Self {
        if !config.throttle.is_zero() {
            let host = host_of(&config.base_url);
            if limiter.interval(&host) < config.throttle {
                limiter.set_interval(&host, config.throttle);
            }
        }
        Self {
            config,
            http,
            limiter,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Option<Arc<ResponseCache>>) -> Self {
        self.cache = cache;
        self
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    fn endpoint(&self, name: &str) -> Result<&ApiEndpoint> {
        self.config
            .endpoints
            .get(name)
            .ok_or_else(|| crate::track!(EngineError::UnknownEndpoint(name.to_string())))
    }

    /// Absolute url for an endpoint call
    pub fn compose_url(
        &self,
        name: &str,
        param: Option<&Value>,
        path_args: &[&str],
        extra_query: &[(String, String)],
    ) -> Result<String> {
        let endpoint = self.endpoint(name)?;
        let path = endpoint.format_path(path_args);
        let raw = format!("{}/{}", self.config.base_url, path.trim_start_matches('/'));
        let mut url = Url::parse(&raw).map_err(|e| {
            crate::track!(EngineError::InvalidInput(format!("bad url '{}': {}", raw, e)))
        })?;

        let mut query: Vec<(String, String)> = match &endpoint.query_formatter {
            Some(f) => f(param.unwrap_or(&Value::Null)),
            None => Vec::new(),
        };
        query.extend(extra_query.iter().cloned());
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in &query {
                pairs.append_pair(k, v);
            }
        }
        Ok(url.to_string())
    }

    /// Call an endpoint and return the raw JSON tree
    pub async fn invoke_value(
        &self,
        ctx: &RequestContext,
        name: &str,
        param: Option<&Value>,
        path_args: &[&str],
        extra_query: &[(String, String)],
    ) -> Result<Value> {
        let endpoint = self.endpoint(name)?;
        let url = self.compose_url(name, param, path_args, extra_query)?;
        let cacheable = endpoint.method == Method::GET;

        if cacheable {
            if let Some(hit) = self.cache.as_ref().and_then(|c| c.get::<Value>(&url)) {
                log::debug!("cache hit for {}", url);
                return Ok(hit);
            }
        }

        self.limiter
            .wait_ctx(ctx, &host_of(&url))
            .await
            .map_err(|e| crate::track!(e, "url" => &url))?;

        let mut options = RequestOptions::default()
            .headers(&self.config.headers)
            .header("accept", "application/json");
        options.retries = self.config.retries;

        log::debug!("{} {} ({})", endpoint.method, url, endpoint.response);
        let response = self
            .http
            .execute(ctx, endpoint.method.clone(), &url, options)
            .await
            .map_err(|e| crate::track!(e, "endpoint" => name))?;

        let value: Value = decode_json(&response.body, endpoint.response, self.http.config().body_sample_bytes)
            .map_err(|e| crate::track!(e, "url" => &url))?;

        if cacheable {
            if let Some(cache) = &self.cache {
                if let Err(e) = cache.set(&url, &value) {
                    log::warn!("failed to cache {}: {}", url, e);
                }
            }
        }
        Ok(value)
    }

    /// Call an endpoint and deserialize into `T`
    pub async fn invoke<T: DeserializeOwned>(
        &self,
        ctx: &RequestContext,
        name: &str,
        param: Option<&Value>,
        path_args: &[&str],
    ) -> Result<T> {
        let value = self.invoke_value(ctx, name, param, path_args, &[]).await?;
        let what = self.endpoint(name)?.response;
        let sample_bytes = self.http.config().body_sample_bytes;
        T::deserialize(&value).map_err(|e| {
            crate::track!(
                EngineError::Parsing {
                    what: what.to_string(),
                    message: e.to_string(),
                    sample: Some(body_sample(value.to_string().as_bytes(), sample_bytes)),
                },
                "endpoint" => name
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsTracker;
    use serde_json::json;

    #[test]
    fn test_substitute_ids_in_order() {
        assert_eq!(substitute_ids("manga/{id}/feed", &["abc"]), "manga/abc/feed");
        assert_eq!(substitute_ids("a/{id}/b/{id}", &["1", "2"]), "a/1/b/2");
        assert_eq!(substitute_ids("a/{id}/b/{id}", &["1"]), "a/1/b/{id}");
        assert_eq!(substitute_ids("static", &["1"]), "static");
    }

    fn invoker() -> ApiInvoker {
        let config = ApiConfig::new("https://api.test/")
            .endpoint("feed", ApiEndpoint::get("/manga/{id}/feed", "feed"))
            .endpoint(
                "search",
                ApiEndpoint::get("/manga", "list").with_query_formatter(|p| {
                    vec![("title".to_string(), p["q"].as_str().unwrap_or_default().to_string())]
                }),
            );
        let http = HttpClient::new(&crate::config::HttpConfig::default(), Arc::new(MetricsTracker::new()))
            .unwrap();
        ApiInvoker::new(config, Arc::new(http), Arc::new(RateLimiter::default()))
    }

    #[test]
    fn test_compose_url_encodes_query() {
        let inv = invoker();
        let url = inv
            .compose_url(
                "search",
                Some(&json!({"q": "one piece & co"})),
                &[],
                &[("limit".to_string(), "10".to_string())],
            )
            .unwrap();
        assert_eq!(url, "https://api.test/manga?title=one+piece+%26+co&limit=10");

        let url = inv.compose_url("feed", None, &["abc"], &[]).unwrap();
        assert_eq!(url, "https://api.test/manga/abc/feed");
    }

    #[test]
    fn test_unknown_endpoint() {
        let err = invoker().compose_url("nope", None, &[], &[]).unwrap_err();
        assert!(matches!(err.engine_error(), Some(EngineError::UnknownEndpoint(n)) if n == "nope"));
    }
}
