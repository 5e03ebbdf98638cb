//! Paginated endpoint iteration
//!
//! Drives an [`ApiInvoker`] endpoint page by page, in limit/offset mode or
//! with an opaque cursor, and runs an [`ExtractorSet`] over each page's items.
//! Results keep the server's order.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

use crate::api::ApiInvoker;
use crate::context::RequestContext;
use crate::error::{EngineError, Result};
use crate::extractor::{resolve_path, ExtractorSet};
use crate::models::SearchOptions;

#[derive(Debug, Clone)]
pub struct PaginationConfig {
    pub limit_param: String,
    pub offset_param: String,
    /// Dotted path to the total item count, when the API reports one
    pub total_path: Option<String>,
    /// Dotted path to the item array
    pub items_path: String,
    pub default_limit: usize,
    pub max_limit: usize,
    /// Cursor mode: query parameter carrying the cursor
    pub cursor_param: Option<String>,
    /// Cursor mode: dotted path to the next cursor; absent or null ends the loop
    pub next_cursor_path: Option<String>,
}

impl PaginationConfig {
    pub fn offset(items_path: &str) -> Self {
        Self {
            limit_param: "limit".to_string(),
            offset_param: "offset".to_string(),
            total_path: None,
            items_path: items_path.to_string(),
            default_limit: 20,
            max_limit: 100,
            cursor_param: None,
            next_cursor_path: None,
        }
    }

    pub fn with_total(mut self, total_path: &str) -> Self {
        self.total_path = Some(total_path.to_string());
        self
    }

    pub fn with_limits(mut self, default_limit: usize, max_limit: usize) -> Self {
        self.default_limit = default_limit.max(1);
        self.max_limit = max_limit.max(self.default_limit);
        self
    }

    pub fn with_cursor(mut self, cursor_param: &str, next_cursor_path: &str) -> Self {
        self.cursor_param = Some(cursor_param.to_string());
        self.next_cursor_path = Some(next_cursor_path.to_string());
        self
    }

    fn effective_limit(&self, requested: usize) -> usize {
        let limit = if requested == 0 { self.default_limit } else { requested };
        limit.clamp(1, self.max_limit)
    }
}

fn path_of(dotted: &str) -> Vec<String> {
    dotted
        .split('.')
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// One page-walk request
#[derive(Debug, Clone)]
pub struct PageRequest<'a> {
    pub endpoint: &'a str,
    pub path_args: &'a [&'a str],
    pub params: Vec<(String, String)>,
    /// Items per page; 0 uses the config default
    pub limit: usize,
    /// 0 means no page cap
    pub max_pages: usize,
}

pub struct Paginator<'a> {
    invoker: &'a ApiInvoker,
    config: &'a PaginationConfig,
    throttle: Duration,
}

impl<'a> Paginator<'a> {
    pub fn new(invoker: &'a ApiInvoker, config: &'a PaginationConfig) -> Self {
        Self {
            invoker,
            config,
            throttle: Duration::from_millis(500),
        }
    }

    pub fn throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    /// Walk pages until the total is reached, a short page arrives, the
    /// cursor runs out or `max_pages` is hit
    pub async fn fetch_all<T>(
        &self,
        ctx: &RequestContext,
        request: PageRequest<'_>,
        set: &ExtractorSet<T>,
    ) -> Result<Vec<T>>
    where
        T: Default + Serialize + DeserializeOwned,
    {
        let limit = self.config.effective_limit(request.limit);
        let items_path = path_of(&self.config.items_path);
        let mut results = Vec::new();
        let mut seen = 0usize;
        let mut cursor: Option<String> = None;
        let mut page = 0usize;

        loop {
            let mut query = request.params.clone();
            query.push((self.config.limit_param.clone(), limit.to_string()));
            match (&self.config.cursor_param, &cursor) {
                (Some(param), Some(c)) => query.push((param.clone(), c.clone())),
                (Some(_), None) => {}
                (None, _) => query.push((self.config.offset_param.clone(), seen.to_string())),
            }

            let response = self
                .invoker
                .invoke_value(ctx, request.endpoint, None, request.path_args, &query)
                .await
                .map_err(|e| crate::track!(e, "page" => page + 1))?;

            let items = match resolve_path(&response, &items_path) {
                Ok(Value::Array(items)) => items.as_slice(),
                Ok(Value::Null) | Err(_) => &[],
                Ok(other) => {
                    return Err(crate::track!(EngineError::TypeMismatch {
                        path: self.config.items_path.clone(),
                        expected: "array".to_string(),
                        found: other.to_string().chars().take(40).collect(),
                    }))
                }
            };
            let count = items.len();
            seen += count;

            for (i, item) in items.iter().enumerate() {
                match set.extract(item) {
                    Ok(record) => results.push(record),
                    Err(e) => log::warn!("{}: skipping item {} on page {}: {}", set.name, i, page + 1, e),
                }
            }

            let total = self
                .config
                .total_path
                .as_deref()
                .and_then(|p| resolve_path(&response, &path_of(p)).ok())
                .and_then(Value::as_u64)
                .map(|t| t as usize);

            page += 1;
            log::debug!(
                "{}: page {} returned {} items ({} so far, total {:?})",
                request.endpoint,
                page,
                count,
                seen,
                total
            );

            let mut done = count < limit
                || total.is_some_and(|t| seen >= t)
                || (request.max_pages > 0 && page >= request.max_pages);

            if !done {
                if let Some(next_path) = &self.config.next_cursor_path {
                    cursor = resolve_path(&response, &path_of(next_path))
                        .ok()
                        .and_then(|v| match v {
                            Value::String(s) if !s.is_empty() => Some(s.clone()),
                            Value::Number(n) => Some(n.to_string()),
                            _ => None,
                        });
                    done = cursor.is_none();
                }
            }
            if done {
                break;
            }
            ctx.sleep(self.throttle).await?;
        }

        Ok(results)
    }

    /// Search over a paginated endpoint: the query string seeds the base
    /// parameters and `extra` carries provider-mapped sort and filter params
    pub async fn search<T>(
        &self,
        ctx: &RequestContext,
        endpoint: &str,
        query_param: &str,
        options: &SearchOptions,
        extra: Vec<(String, String)>,
        set: &ExtractorSet<T>,
    ) -> Result<Vec<T>>
    where
        T: Default + Serialize + DeserializeOwned,
    {
        let mut params = Vec::new();
        if !options.query.trim().is_empty() {
            params.push((query_param.to_string(), options.query.trim().to_string()));
        }
        params.extend(extra);
        self.fetch_all(
            ctx,
            PageRequest {
                endpoint,
                path_args: &[],
                params,
                limit: options.limit,
                max_pages: options.max_pages.max(1),
            },
            set,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_limit() {
        let cfg = PaginationConfig::offset("data").with_limits(10, 50);
        assert_eq!(cfg.effective_limit(0), 10);
        assert_eq!(cfg.effective_limit(500), 50);
        assert_eq!(cfg.effective_limit(7), 7);
    }
}
