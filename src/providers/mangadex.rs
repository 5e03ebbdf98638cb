use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tokio::sync::OnceCell;

use crate::api::{ApiConfig, ApiEndpoint, ApiInvoker};
use crate::context::RequestContext;
use crate::download::{DownloadJobConfig, DownloadReport, DownloadRequest};
use crate::engine::Services;
use crate::error::{EngineError, Result};
use crate::extractor::{resolve_path, transforms, Extractor, ExtractorSet};
use crate::models::{Chapter, ChapterInfo, ChapterMetadata, Manga, MangaInfo, Page, SearchOptions, SortOrder};
use crate::pagination::{PageRequest, PaginationConfig, Paginator};
use crate::provider::Provider;

pub const PROVIDER_ID: &str = "mgd";

/// Cap on feed pages so a runaway total cannot loop forever
const MAX_FEED_PAGES: usize = 50;

const CONTENT_RATINGS: &[&str] = &["safe", "suggestive", "erotica"];

fn includes(kinds: &[&str]) -> Vec<(String, String)> {
    kinds
        .iter()
        .map(|k| ("includes[]".to_string(), k.to_string()))
        .collect()
}

fn content_ratings() -> Vec<(String, String)> {
    CONTENT_RATINGS
        .iter()
        .map(|r| ("contentRating[]".to_string(), r.to_string()))
        .collect()
}

fn api_config(base_url: &str) -> ApiConfig {
    ApiConfig::new(base_url)
        // ~5 requests per second is the documented global limit
        .throttle(Duration::from_millis(200))
        .endpoint(
            "search",
            ApiEndpoint::get("manga", "manga list")
                .with_query_formatter(|_| [includes(&["cover_art", "author", "artist"]), content_ratings()].concat()),
        )
        .endpoint(
            "manga",
            ApiEndpoint::get("manga/{id}", "manga")
                .with_query_formatter(|_| includes(&["cover_art", "author", "artist"])),
        )
        .endpoint(
            "feed",
            ApiEndpoint::get("manga/{id}/feed", "chapter list").with_query_formatter(|_| {
                let mut q = content_ratings();
                q.push(("order[volume]".to_string(), "asc".to_string()));
                q.push(("order[chapter]".to_string(), "asc".to_string()));
                q
            }),
        )
        .endpoint(
            "chapter",
            ApiEndpoint::get("chapter/{id}", "chapter").with_query_formatter(|_| includes(&["manga"])),
        )
        .endpoint("at-home", ApiEndpoint::get("at-home/server/{id}", "at-home server"))
}

/// Names of related entities of the given types
fn relationship_names(kinds: &'static [&'static str]) -> impl Fn(&Value) -> Result<Value> + Send + Sync {
    move |v| {
        let mut names: Vec<Value> = Vec::new();
        for rel in v.as_array().into_iter().flatten() {
            let kind = rel["type"].as_str().unwrap_or_default();
            if !kinds.contains(&kind) {
                continue;
            }
            if let Some(name) = rel["attributes"]["name"].as_str().map(str::trim) {
                let name = Value::String(name.to_string());
                if !name.as_str().unwrap_or_default().is_empty() && !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        Ok(Value::Array(names))
    }
}

fn tag_names(v: &Value) -> Result<Value> {
    let names = v
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|tag| transforms::pick_localized(&tag["attributes"]["name"], &["en"]))
        .map(Value::String)
        .collect();
    Ok(Value::Array(names))
}

pub fn manga_extractors(uploads_url: &str) -> ExtractorSet<Manga> {
    let uploads = uploads_url.trim_end_matches('/').to_string();
    ExtractorSet::new("mangadex manga")
        .field(Extractor::new("id", "id", "id").required())
        .field(
            Extractor::new("title", "attributes.title", "title")
                .transform(transforms::localized(&["en", "ja-ro", "ja"])),
        )
        .field(Extractor::new("alt titles", "attributes.altTitles", "altTitles").transform(transforms::localized_list))
        .field(
            Extractor::new("description", "attributes.description", "description")
                .transform(transforms::localized(&["en"])),
        )
        .field(Extractor::new("status", "attributes.status", "status"))
        .field(Extractor::new("tags", "attributes.tags", "tags").transform(tag_names))
        .field(
            Extractor::new("authors", "relationships", "authors")
                .transform(relationship_names(&["author", "artist"])),
        )
        .field(Extractor::new("cover", "", "coverUrl").transform(move |item| {
            let id = item["id"].as_str().unwrap_or_default();
            let file = item["relationships"]
                .as_array()
                .into_iter()
                .flatten()
                .find(|r| r["type"] == "cover_art")
                .and_then(|r| r["attributes"]["fileName"].as_str());
            Ok(match file {
                Some(f) if !id.is_empty() => json!(format!("{}/covers/{}/{}", uploads, id, f)),
                _ => Value::Null,
            })
        }))
}

pub fn chapter_extractors() -> ExtractorSet<ChapterInfo> {
    ExtractorSet::new("mangadex chapter")
        .field(Extractor::new("id", "id", "id").required())
        .field(Extractor::new("title", "attributes.title", "title"))
        .field(Extractor::new("number", "attributes.chapter", "number").transform(transforms::number))
        .field(Extractor::new("volume", "attributes.volume", "volume").transform(transforms::number))
        .field(Extractor::new("published", "attributes.publishAt", "publishedAt"))
        .field(Extractor::new("language", "attributes.translatedLanguage", "language").transform(transforms::lowercase))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AtHome {
    base_url: String,
    chapter: AtHomeChapter,
}

#[derive(Debug, Deserialize)]
struct AtHomeChapter {
    hash: String,
    data: Vec<String>,
}

fn sort_params(sort: SortOrder, has_query: bool) -> Vec<(String, String)> {
    let (key, dir) = match sort {
        SortOrder::Relevance if has_query => ("order[relevance]", "desc"),
        SortOrder::Relevance => ("order[followedCount]", "desc"),
        SortOrder::Name => ("order[title]", "asc"),
        SortOrder::Popularity => ("order[followedCount]", "desc"),
        SortOrder::Newest => ("order[createdAt]", "desc"),
        SortOrder::Updated => ("order[latestUploadedChapter]", "desc"),
        // sorted locally by the coordinator
        SortOrder::Author | SortOrder::Status => return Vec::new(),
    };
    vec![(key.to_string(), dir.to_string())]
}

/// MangaDex JSON API
pub struct MangaDex {
    services: Services,
    api: ApiInvoker,
    list_pages: PaginationConfig,
    manga_set: ExtractorSet<Manga>,
    chapter_set: ExtractorSet<ChapterInfo>,
    init: OnceCell<()>,
}

impl MangaDex {
    pub fn new(services: Services) -> Self {
        let api_url = services.config.providers.mangadex_api_url.clone();
        let uploads_url = services.config.providers.mangadex_uploads_url.clone();
        Self {
            api: services.api(api_config(&api_url)),
            list_pages: PaginationConfig::offset("data").with_total("total").with_limits(20, 100),
            manga_set: manga_extractors(&uploads_url),
            chapter_set: chapter_extractors(),
            services,
            init: OnceCell::new(),
        }
    }

    /// Chapter record plus the series it belongs to, from one request
    async fn fetch_chapter(&self, ctx: &RequestContext, chapter_id: &str) -> Result<(Chapter, Option<Manga>)> {
        let response = self
            .api
            .invoke_value(ctx, "chapter", None, &[chapter_id], &[])
            .await?;
        let data = resolve_path(&response, &["data".to_string()])?;
        let info = self.chapter_set.extract(data)?;

        let manga = data["relationships"]
            .as_array()
            .into_iter()
            .flatten()
            .find(|r| r["type"] == "manga")
            .and_then(|rel| match self.manga_set.extract(rel) {
                Ok(m) => Some(m.normalized()),
                Err(e) => {
                    log::debug!("mangadex: chapter {} has no usable manga relation: {}", chapter_id, e);
                    None
                }
            });

        let at_home: AtHome = self.api.invoke(ctx, "at-home", None, &[chapter_id]).await?;
        let base = at_home.base_url.trim_end_matches('/');
        let pages = at_home
            .chapter
            .data
            .iter()
            .enumerate()
            .map(|(i, file)| Page::new(i, format!("{}/data/{}/{}", base, at_home.chapter.hash, file)))
            .collect();

        let chapter = Chapter {
            info,
            manga_id: manga.as_ref().map(|m| m.id.clone()).unwrap_or_default(),
            pages,
        };
        Ok((chapter, manga))
    }
}

#[async_trait]
impl Provider for MangaDex {
    fn id(&self) -> &str {
        PROVIDER_ID
    }

    fn name(&self) -> &str {
        "MangaDex"
    }

    fn description(&self) -> &str {
        "Community scanlation host with a public JSON API"
    }

    fn site_url(&self) -> &str {
        "https://mangadex.org"
    }

    async fn initialize(&self, _ctx: &RequestContext) -> Result<()> {
        self.init
            .get_or_init(|| async {
                log::debug!("mangadex: using API at {}", self.api.config().base_url);
            })
            .await;
        Ok(())
    }

    async fn search(&self, ctx: &RequestContext, query: &str, options: &SearchOptions) -> Result<Vec<Manga>> {
        let mut extra = sort_params(options.sort, !query.trim().is_empty());
        if let Some(status) = options.filters.get("status") {
            extra.push(("status[]".to_string(), status.to_lowercase()));
        }
        for lang in &options.languages {
            extra.push(("availableTranslatedLanguage[]".to_string(), lang.to_lowercase()));
        }
        let options = SearchOptions {
            query: query.to_string(),
            ..options.clone()
        };
        let found = Paginator::new(&self.api, &self.list_pages)
            .throttle(self.services.page_throttle())
            .search(ctx, "search", "title", &options, extra, &self.manga_set)
            .await?;
        Ok(found.into_iter().map(Manga::normalized).collect())
    }

    async fn get_manga(&self, ctx: &RequestContext, id: &str) -> Result<MangaInfo> {
        let response = self.api.invoke_value(ctx, "manga", None, &[id], &[]).await?;
        let data = resolve_path(&response, &["data".to_string()])?;
        let manga = self.manga_set.extract(data)?;
        let last_updated = data["attributes"]["updatedAt"]
            .as_str()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&chrono::Utc));

        let feed = PaginationConfig::offset("data").with_total("total").with_limits(100, 500);
        let chapters = Paginator::new(&self.api, &feed)
            .throttle(self.services.page_throttle())
            .fetch_all(
                ctx,
                PageRequest {
                    endpoint: "feed",
                    path_args: &[id],
                    params: Vec::new(),
                    limit: 500,
                    max_pages: MAX_FEED_PAGES,
                },
                &self.chapter_set,
            )
            .await?;

        Ok(MangaInfo {
            manga,
            chapters,
            last_updated,
        })
    }

    async fn get_chapter(&self, ctx: &RequestContext, chapter_id: &str) -> Result<Chapter> {
        Ok(self.fetch_chapter(ctx, chapter_id).await?.0)
    }

    async fn try_get_manga_for_chapter(&self, ctx: &RequestContext, chapter_id: &str) -> Result<Option<Manga>> {
        let response = self
            .api
            .invoke_value(ctx, "chapter", None, &[chapter_id], &[])
            .await?;
        let manga = response["data"]["relationships"]
            .as_array()
            .into_iter()
            .flatten()
            .find(|r| r["type"] == "manga")
            .and_then(|rel| self.manga_set.extract(rel).ok())
            .map(Manga::normalized);
        Ok(manga)
    }

    async fn download_chapter(&self, ctx: &RequestContext, chapter_id: &str, dest_dir: &Path) -> Result<DownloadReport> {
        let (chapter, manga) = self.fetch_chapter(ctx, chapter_id).await?;
        if chapter.pages.is_empty() {
            return Err(crate::track!(
                EngineError::NotFound(format!("pages for chapter {}", chapter_id)),
                "provider" => PROVIDER_ID
            ));
        }
        let title = manga.map(|m| m.title).unwrap_or_default();
        let requests = chapter.pages.iter().map(DownloadRequest::from_page).collect();
        let job = DownloadJobConfig::new(
            ChapterMetadata::from_chapter(PROVIDER_ID, &title, &chapter),
            dest_dir,
            requests,
        )
        .with_settings(&self.services.config.download);
        self.services.downloader.download(ctx, job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manga_json() -> Value {
        json!({
            "id": "a1",
            "attributes": {
                "title": {"ja-ro": "Wan Pisu"},
                "altTitles": [{"en": "One Piece"}, {"ja-ro": "Wan Pisu"}],
                "description": {"en": "Pirates."},
                "status": "ongoing",
                "tags": [{"attributes": {"name": {"en": "Action"}}}]
            },
            "relationships": [
                {"type": "author", "attributes": {"name": "Oda"}},
                {"type": "artist", "attributes": {"name": "Oda"}},
                {"type": "cover_art", "attributes": {"fileName": "c.jpg"}}
            ]
        })
    }

    #[test]
    fn test_manga_mapping() {
        let m = manga_extractors("https://up.test/")
            .extract(&manga_json())
            .unwrap()
            .normalized();
        assert_eq!(m.title, "Wan Pisu");
        assert_eq!(m.alt_titles, vec!["One Piece"]);
        assert_eq!(m.authors, vec!["Oda"]);
        assert_eq!(m.tags, vec!["Action"]);
        assert_eq!(m.cover_url.as_deref(), Some("https://up.test/covers/a1/c.jpg"));
        assert_eq!(m.description.as_deref(), Some("Pirates."));
    }

    #[test]
    fn test_chapter_mapping() {
        let c = chapter_extractors()
            .extract(&json!({
                "id": "c1",
                "attributes": {
                    "title": null,
                    "chapter": "10.5",
                    "volume": "2",
                    "translatedLanguage": "EN",
                    "publishAt": "2024-01-02T03:04:05+00:00"
                }
            }))
            .unwrap();
        assert_eq!(c.number, 10.5);
        assert_eq!(c.volume, Some(2.0));
        assert_eq!(c.language.as_deref(), Some("en"));
        assert_eq!(c.title, "");
        assert!(c.published_at.is_some());
    }

    #[test]
    fn test_sort_params() {
        assert_eq!(sort_params(SortOrder::Relevance, true)[0].0, "order[relevance]");
        assert_eq!(sort_params(SortOrder::Relevance, false)[0].0, "order[followedCount]");
        assert!(sort_params(SortOrder::Author, true).is_empty());
    }
}
