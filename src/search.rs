//! Cross-provider search fan-out
//!
//! Runs `initialize` + `search` on every provider in parallel behind a
//! semaphore, under one overall deadline. A failing or panicking provider is
//! logged and left out of the result map; the caller always gets the
//! partial map plus one error per failed provider.

use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::{RateLimitConfig, SearchConfig};
use crate::context::RequestContext;
use crate::error::{Result, TrackedError};
use crate::metrics::{track_request, MetricsTracker};
use crate::models::{Manga, SearchOptions, SortOrder};
use crate::provider::Provider;

#[derive(Debug, Default)]
pub struct SearchResults {
    /// Keyed by provider id
    pub results: BTreeMap<String, Vec<Manga>>,
    pub errors: BTreeMap<String, TrackedError>,
}

impl SearchResults {
    pub fn total(&self) -> usize {
        self.results.values().map(Vec::len).sum()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchSummary<'a> {
    pub results: &'a BTreeMap<String, Vec<Manga>>,
    pub total: usize,
    pub errors: BTreeMap<&'a str, String>,
}

impl SearchResults {
    pub fn summary(&self) -> SearchSummary<'_> {
        SearchSummary {
            results: &self.results,
            total: self.total(),
            errors: self
                .errors
                .iter()
                .map(|(k, v)| (k.as_str(), v.to_string()))
                .collect(),
        }
    }
}

pub struct SearchCoordinator {
    concurrency: usize,
    timeout: Duration,
    /// Throttle and rate-limit wait expected before each page request
    page_wait: Duration,
    metrics: Arc<MetricsTracker>,
}

impl SearchCoordinator {
    pub fn new(concurrency: usize, timeout: Duration, metrics: Arc<MetricsTracker>) -> Self {
        Self {
            concurrency: concurrency.max(1),
            timeout,
            page_wait: Duration::ZERO,
            metrics,
        }
    }

    pub fn from_config(config: &SearchConfig, rate_limit: &RateLimitConfig, metrics: Arc<MetricsTracker>) -> Self {
        let mut coordinator = Self::new(config.concurrency, Duration::from_secs(config.timeout_secs), metrics);
        coordinator.page_wait = Duration::from_millis(config.page_throttle_ms + rate_limit.default_interval_ms);
        coordinator
    }

    /// Overall deadline for a search: the base timeout per requested page,
    /// plus the waits in front of each page
    pub fn budget(&self, options: &SearchOptions) -> Duration {
        let pages = options.max_pages.clamp(1, u32::MAX as usize) as u32;
        (self.timeout + self.page_wait) * pages
    }

    pub async fn search_across(
        &self,
        ctx: &RequestContext,
        providers: Vec<Arc<dyn Provider>>,
        query: &str,
        options: &SearchOptions,
    ) -> SearchResults {
        let ctx = ctx.with_timeout(self.budget(options));
        let permits = Arc::new(Semaphore::new(ctx.concurrency().unwrap_or(self.concurrency)));
        let mut set = JoinSet::new();

        for provider in providers {
            let ctx = ctx.clone();
            let permits = permits.clone();
            let metrics = self.metrics.clone();
            let query = query.to_string();
            let options = options.clone();
            set.spawn(async move {
                let id = provider.id().to_string();
                let result: Result<Vec<Manga>> = AssertUnwindSafe(async {
                    let _permit = permits
                        .acquire_owned()
                        .await
                        .map_err(|e| crate::track!(e))?;
                    track_request(&metrics, &id, ctx.run(async {
                        provider.initialize(&ctx).await?;
                        provider.search(&ctx, &query, &options).await
                    }))
                    .await
                })
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| {
                    let err = TrackedError::from_panic(payload);
                    metrics.record_failure(&id, &err);
                    Err(err)
                });
                (id, result)
            });
        }

        let mut out = SearchResults::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((id, Ok(mangas))) => {
                    log::debug!("{}: {} results", id, mangas.len());
                    out.results.insert(id, mangas.into_iter().map(Manga::normalized).collect());
                }
                Ok((id, Err(e))) => {
                    let e = e.with_context("provider", &id);
                    log::warn!("Search failed for provider {}: {}", id, e);
                    out.errors.insert(id, e);
                }
                Err(e) => log::error!("Search task failed: {}", e),
            }
        }

        for mangas in out.results.values_mut() {
            mangas.retain(|m| matches_filters(m, &options.filters));
            sort_results(mangas, options.sort);
        }
        if let Some(max) = options.max_results {
            apply_global_limit(&mut out.results, max);
        }
        out
    }
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// Case-insensitive match on title, author, status and tag filters
pub fn matches_filters(manga: &Manga, filters: &std::collections::HashMap<String, String>) -> bool {
    filters.iter().all(|(key, want)| {
        let want = want.trim();
        if want.is_empty() {
            return true;
        }
        match key.as_str() {
            "title" => {
                contains_ci(&manga.title, want) || manga.alt_titles.iter().any(|t| contains_ci(t, want))
            }
            "author" => manga.authors.iter().any(|a| contains_ci(a, want)),
            "status" => manga.status.eq_ignore_ascii_case(want),
            "tag" | "genre" => manga.tags.iter().any(|t| contains_ci(t, want) || t.eq_ignore_ascii_case(want)),
            _ => true,
        }
    })
}

/// Local sorts; server-side orders (relevance, popularity, dates) are kept as returned
pub fn sort_results(mangas: &mut [Manga], sort: SortOrder) {
    let key = |s: &str| s.to_lowercase();
    match sort {
        SortOrder::Name => mangas.sort_by_key(|m| key(&m.title)),
        SortOrder::Author => mangas.sort_by(|a, b| {
            let a = a.authors.first().map(|s| key(s));
            let b = b.authors.first().map(|s| key(s));
            // unknown authors last
            match (a, b) {
                (Some(a), Some(b)) => a.cmp(&b),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        }),
        SortOrder::Status => mangas.sort_by_key(|m| key(&m.status)),
        SortOrder::Relevance | SortOrder::Popularity | SortOrder::Newest | SortOrder::Updated => {}
    }
}

/// Keep at most `max` results overall, filling providers in id order
pub fn apply_global_limit(results: &mut BTreeMap<String, Vec<Manga>>, max: usize) {
    let mut remaining = max;
    for mangas in results.values_mut() {
        mangas.truncate(remaining);
        remaining -= mangas.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn manga(id: &str, title: &str, author: &str, status: &str, tags: &[&str]) -> Manga {
        Manga {
            id: id.into(),
            title: title.into(),
            authors: vec![author.into()],
            status: status.into(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_filters() {
        let m = manga("1", "One Piece", "Oda Eiichiro", "ongoing", &["Action", "Adventure"]);
        let f = |pairs: &[(&str, &str)]| -> HashMap<String, String> {
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
        };
        assert!(matches_filters(&m, &f(&[("title", "piece")])));
        assert!(matches_filters(&m, &f(&[("author", "oda"), ("status", "Ongoing")])));
        assert!(matches_filters(&m, &f(&[("tag", "adventure")])));
        assert!(!matches_filters(&m, &f(&[("status", "completed")])));
        assert!(!matches_filters(&m, &f(&[("tag", "romance")])));
    }

    #[test]
    fn test_budget_grows_with_pages() {
        let search = SearchConfig {
            concurrency: 3,
            timeout_secs: 30,
            page_throttle_ms: 500,
        };
        let rate = RateLimitConfig {
            default_interval_ms: 500,
            hosts: HashMap::new(),
        };
        let coordinator = SearchCoordinator::from_config(&search, &rate, Arc::new(MetricsTracker::new()));
        let options = |pages| SearchOptions {
            max_pages: pages,
            ..SearchOptions::new("q")
        };
        assert_eq!(coordinator.budget(&options(0)), Duration::from_secs(31));
        assert_eq!(coordinator.budget(&options(3)), Duration::from_secs(93));
    }

    #[test]
    fn test_sort_by_name() {
        let mut v = vec![
            manga("1", "beta", "", "", &[]),
            manga("2", "Alpha", "", "", &[]),
        ];
        sort_results(&mut v, SortOrder::Name);
        assert_eq!(v[0].title, "Alpha");
    }

    #[test]
    fn test_global_limit_fills_in_id_order() {
        let mut results = BTreeMap::new();
        results.insert("b".to_string(), vec![Manga::default(); 5]);
        results.insert("a".to_string(), vec![Manga::default(); 5]);
        apply_global_limit(&mut results, 7);
        assert_eq!(results["a"].len(), 5);
        assert_eq!(results["b"].len(), 2);
    }
}
