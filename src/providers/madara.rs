//! Sites running the WP-Manga (Madara) WordPress theme
//!
//! All data comes from HTML pages through the DOM layer. Manga ids are the
//! series slug (`/manga/<slug>/`); chapter ids are `<slug>/<chapter-slug>`.
//! Parsing happens in plain functions over the response bytes because parsed
//! documents cannot be held across `.await`.

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;
use tokio::sync::OnceCell;
use url::Url;

use crate::config::MadaraSite;
use crate::context::RequestContext;
use crate::dom::{parse_fragment, parse_html, Element};
use crate::download::{DownloadJobConfig, DownloadReport, DownloadRequest};
use crate::engine::Services;
use crate::error::{EngineError, Result};
use crate::helpers::{extract_chapter_number, extract_volume_number, join_url};
use crate::models::{Chapter, ChapterInfo, ChapterMetadata, Manga, MangaInfo, Page, SearchOptions, SortOrder};
use crate::provider::Provider;

static MANGA_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"manga_id\s*[=:]\s*(\d+)").expect("valid regex"));

/// Result containers across theme versions, most specific first
const LISTING_SELECTORS: &[(&str, &str)] = &[
    ("div.c-tabs-item__content", "div.post-title h3 a"),
    ("div.page-item-detail", "h3 a"),
    ("div.page-listing-item", "h3 a"),
];

const CHAPTER_SELECTORS: &[&str] = &["li.wp-manga-chapter a", "ul.main.version-chap li a", "div.listing-chapters_wrap a"];

const PAGE_IMAGE_ATTRS: &[&str] = &["data-src", "data-lazy-src", "src"];

/// Series slug from a `/manga/<slug>/...` url
pub fn slug_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let segments: Vec<&str> = parsed.path_segments()?.filter(|s| !s.is_empty()).collect();
    match segments.iter().position(|s| *s == "manga") {
        Some(i) => segments.get(i + 1).map(|s| s.to_string()),
        None => segments.last().map(|s| s.to_string()),
    }
}

/// `<slug>/<chapter-slug>` from a chapter url
pub fn chapter_id_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let segments: Vec<&str> = parsed.path_segments()?.filter(|s| !s.is_empty()).collect();
    let i = segments.iter().position(|s| *s == "manga")?;
    match (segments.get(i + 1), segments.get(i + 2)) {
        (Some(series), Some(chapter)) => Some(format!("{}/{}", series, chapter)),
        _ => None,
    }
}

fn image_url(img: &Element<'_>, base: &str) -> Option<String> {
    PAGE_IMAGE_ATTRS
        .iter()
        .filter_map(|a| img.attr(a))
        .map(str::trim)
        .find(|s| !s.is_empty() && !s.starts_with("data:"))
        .and_then(|s| join_url(base, s).ok())
}

/// Search and listing pages
pub fn parse_listing(html: &[u8], base: &str) -> Result<Vec<Manga>> {
    let doc = parse_html(html);
    let root = doc.root();
    for (container, link) in LISTING_SELECTORS {
        let items = root.find(container)?;
        if items.is_empty() {
            continue;
        }
        let mut out = Vec::new();
        for item in items {
            let Some(a) = item.first(link)? else { continue };
            let Some(href) = a.attr("href") else { continue };
            let Some(id) = slug_from_url(href) else { continue };
            let title = a.text();
            let cover_url = item.first("img")?.and_then(|img| image_url(&img, base));
            let summary = |label: &str| -> Result<Vec<String>> {
                Ok(item
                    .find(&format!("div.{} div.summary-content a", label))?
                    .iter()
                    .map(|e| e.text())
                    .filter(|t| !t.is_empty())
                    .collect())
            };
            let status = item
                .first("div.mg_status div.summary-content")?
                .map(|e| e.text())
                .unwrap_or_default();
            out.push(
                Manga {
                    id,
                    title,
                    cover_url,
                    authors: summary("mg_author")?,
                    tags: summary("mg_genres")?,
                    status: status.to_lowercase(),
                    ..Default::default()
                }
                .normalized(),
            );
        }
        return Ok(out);
    }
    Ok(Vec::new())
}

/// Value of a `post-content_item` row whose heading contains `label`
fn summary_row(root: &Element<'_>, label: &str) -> Result<Option<String>> {
    for row in root.find("div.post-content_item")? {
        let heading = row.first("div.summary-heading")?.map(|h| h.text()).unwrap_or_default();
        if heading.to_lowercase().contains(label) {
            return Ok(row.first("div.summary-content")?.map(|c| c.text()));
        }
    }
    Ok(None)
}

/// Series page. Returns the manga and the numeric post id used by the AJAX chapter list.
pub fn parse_series(html: &[u8], slug: &str, base: &str) -> Result<(Manga, Option<String>)> {
    let doc = parse_html(html);
    let root = doc.root();

    let title = root
        .first("div.post-title h1")?
        .or(root.first("h1")?)
        .map(|h| h.text())
        .unwrap_or_default();
    let cover_url = root
        .first("div.summary_image img")?
        .and_then(|img| image_url(&img, base));
    let description = match root.first("div.description-summary div.summary__content")? {
        Some(d) => Some(d.text()),
        None => root.first("div.manga-excerpt")?.map(|d| d.text()),
    }
    .filter(|d| !d.is_empty());
    let texts = |sel: &str| -> Result<Vec<String>> {
        Ok(root
            .find(sel)?
            .iter()
            .map(|e| e.text())
            .filter(|t| !t.is_empty())
            .collect())
    };
    let alt_titles = summary_row(&root, "alternative")?
        .map(|s| {
            s.split([',', ';', '/'])
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect()
        })
        .unwrap_or_default();
    let status = summary_row(&root, "status")?.unwrap_or_default().to_lowercase();

    let post_id = match root.first("div#manga-chapters-holder")? {
        Some(holder) => holder.attr("data-id").map(String::from),
        None => None,
    }
    .or_else(|| {
        root.find("script").ok()?.iter().find_map(|s| {
            MANGA_ID_RE
                .captures(&s.inner_html())
                .map(|c| c[1].to_string())
        })
    });

    let manga = Manga {
        id: slug.to_string(),
        title,
        cover_url,
        description,
        authors: texts("div.author-content a")?,
        status,
        tags: texts("div.genres-content a")?,
        alt_titles,
    }
    .normalized();
    Ok((manga, post_id))
}

fn parse_release_date(text: &str) -> Option<chrono::DateTime<Utc>> {
    let text = text.trim();
    ["%B %d, %Y", "%b %d, %Y", "%d/%m/%Y", "%Y-%m-%d"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| Utc.from_utc_datetime(&dt))
}

/// Chapter list from a series page or an AJAX fragment, in page order
pub fn parse_chapter_list(html: &[u8], fragment: bool) -> Result<Vec<ChapterInfo>> {
    let doc = if fragment { parse_fragment(html) } else { parse_html(html) };
    let root = doc.root();
    for sel in CHAPTER_SELECTORS {
        let links = root.find(sel)?;
        if links.is_empty() {
            continue;
        }
        let mut chapters = Vec::new();
        for a in links {
            let Some(href) = a.attr("href") else { continue };
            let Some(id) = chapter_id_from_url(href) else { continue };
            let title = a.text();
            let number = match extract_chapter_number(&title) {
                n if n > 0.0 => n,
                _ => extract_chapter_number(href),
            };
            let published_at = a
                .parent()
                .and_then(|li| li.first("span.chapter-release-date").ok().flatten())
                .and_then(|d| parse_release_date(&d.text()));
            chapters.push(ChapterInfo {
                id,
                volume: extract_volume_number(&title),
                title,
                number,
                published_at,
                language: None,
            });
        }
        return Ok(chapters);
    }
    Ok(Vec::new())
}

/// Reader page images in order, plus the chapter heading
pub fn parse_reader(html: &[u8], base: &str) -> Result<(String, Vec<Page>)> {
    let doc = parse_html(html);
    let root = doc.root();
    let heading = root
        .first("h1#chapter-heading")?
        .or(root.first("ol.breadcrumb li.active")?)
        .map(|h| h.text())
        .unwrap_or_default();
    let pages = root
        .find("div.reading-content img")?
        .iter()
        .filter_map(|img| image_url(img, base))
        .enumerate()
        .map(|(i, url)| Page::new(i, url))
        .collect();
    Ok((heading, pages))
}

pub struct Madara {
    site: MadaraSite,
    services: Services,
    init: OnceCell<()>,
}

impl Madara {
    pub fn new(site: MadaraSite, services: Services) -> Self {
        Self {
            site: MadaraSite {
                base_url: site.base_url.trim_end_matches('/').to_string(),
                ..site
            },
            services,
            init: OnceCell::new(),
        }
    }

    fn series_url(&self, slug: &str) -> String {
        format!("{}/manga/{}/", self.site.base_url, slug)
    }

    fn listing_url(&self, query: &str, sort: SortOrder, page: usize) -> String {
        let page_part = if page > 1 { format!("page/{}/", page) } else { String::new() };
        if query.trim().is_empty() {
            let order = match sort {
                SortOrder::Popularity => "views",
                SortOrder::Name => "alphabet",
                SortOrder::Newest => "new-manga",
                _ => "latest",
            };
            return format!("{}/manga/{}?m_orderby={}", self.site.base_url, page_part, order);
        }
        let q = url::form_urlencoded::byte_serialize(query.trim().as_bytes()).collect::<String>();
        format!("{}/{}?s={}&post_type=wp-manga", self.site.base_url, page_part, q)
    }

    async fn fetch(&self, ctx: &RequestContext, url: &str) -> Result<Vec<u8>> {
        let response = self
            .services
            .fetch_page(ctx, url, Some(&self.site.base_url))
            .await
            .map_err(|e| crate::track!(e, "provider" => &self.site.id))?;
        Ok(response.body)
    }

    async fn chapter_list(&self, ctx: &RequestContext, slug: &str, page: &[u8], post_id: Option<String>) -> Result<Vec<ChapterInfo>> {
        let chapters = parse_chapter_list(page, false)?;
        if !chapters.is_empty() {
            return Ok(chapters);
        }

        // Newer theme versions load the list from the series url
        let ajax = format!("{}ajax/chapters/", self.series_url(slug));
        match self.services.post_form(ctx, &ajax, &[], Some(&self.series_url(slug))).await {
            Ok(resp) => {
                let chapters = parse_chapter_list(&resp.body, true)?;
                if !chapters.is_empty() {
                    return Ok(chapters);
                }
            }
            Err(e) => log::debug!("{}: {} failed: {}", self.site.id, ajax, e),
        }

        let Some(post_id) = post_id else {
            return Ok(Vec::new());
        };
        let admin = format!("{}/wp-admin/admin-ajax.php", self.site.base_url);
        let resp = self
            .services
            .post_form(
                ctx,
                &admin,
                &[("action", "manga_get_chapters"), ("manga", post_id.as_str())],
                Some(&self.series_url(slug)),
            )
            .await?;
        parse_chapter_list(&resp.body, true)
    }

    fn chapter_url(&self, chapter_id: &str) -> String {
        format!("{}/manga/{}/", self.site.base_url, chapter_id.trim_matches('/'))
    }
}

#[async_trait]
impl Provider for Madara {
    fn id(&self) -> &str {
        &self.site.id
    }

    fn name(&self) -> &str {
        &self.site.name
    }

    fn description(&self) -> &str {
        "WP-Manga (Madara) site"
    }

    fn site_url(&self) -> &str {
        &self.site.base_url
    }

    async fn initialize(&self, _ctx: &RequestContext) -> Result<()> {
        self.init
            .get_or_init(|| async {
                log::debug!("{}: madara site at {}", self.site.id, self.site.base_url);
            })
            .await;
        Ok(())
    }

    async fn search(&self, ctx: &RequestContext, query: &str, options: &SearchOptions) -> Result<Vec<Manga>> {
        let max_pages = options.max_pages.max(1);
        let mut out: Vec<Manga> = Vec::new();
        for page in 1..=max_pages {
            let url = self.listing_url(query, options.sort, page);
            let body = match self.fetch(ctx, &url).await {
                Ok(b) => b,
                // past the last page WordPress answers 404
                Err(e) if page > 1 && e.http_status() == Some(404) => break,
                Err(e) => return Err(e),
            };
            let found = parse_listing(&body, &self.site.base_url)?;
            let count = found.len();
            for m in found {
                if !out.iter().any(|o| o.id == m.id) {
                    out.push(m);
                }
            }
            if count == 0 || (options.limit > 0 && out.len() >= options.limit * max_pages) {
                break;
            }
            if page < max_pages {
                ctx.sleep(self.services.page_throttle()).await?;
            }
        }
        if options.limit > 0 {
            out.truncate(options.limit * max_pages);
        }
        Ok(out)
    }

    async fn get_manga(&self, ctx: &RequestContext, id: &str) -> Result<MangaInfo> {
        let url = self.series_url(id);
        let body = self.fetch(ctx, &url).await?;
        let (manga, post_id) = parse_series(&body, id, &self.site.base_url)?;
        let chapters = self.chapter_list(ctx, id, &body, post_id).await?;
        let last_updated = chapters.iter().filter_map(|c| c.published_at).max();
        Ok(MangaInfo {
            manga,
            chapters,
            last_updated,
        })
    }

    async fn get_chapter(&self, ctx: &RequestContext, chapter_id: &str) -> Result<Chapter> {
        let url = self.chapter_url(chapter_id);
        let body = self.fetch(ctx, &url).await?;
        let (heading, pages) = parse_reader(&body, &self.site.base_url)?;
        let chapter_slug = chapter_id.rsplit('/').next().unwrap_or(chapter_id);
        let number = match extract_chapter_number(&heading) {
            n if n > 0.0 => n,
            _ => extract_chapter_number(chapter_slug),
        };
        Ok(Chapter {
            info: ChapterInfo {
                id: chapter_id.to_string(),
                volume: extract_volume_number(&heading).or_else(|| extract_volume_number(chapter_slug)),
                title: heading,
                number,
                published_at: None,
                language: None,
            },
            manga_id: chapter_id.split('/').next().unwrap_or_default().to_string(),
            pages,
        })
    }

    async fn try_get_manga_for_chapter(&self, ctx: &RequestContext, chapter_id: &str) -> Result<Option<Manga>> {
        let Some((slug, _)) = chapter_id.split_once('/') else {
            return Ok(None);
        };
        let body = self.fetch(ctx, &self.series_url(slug)).await?;
        let (manga, _) = parse_series(&body, slug, &self.site.base_url)?;
        Ok(Some(manga))
    }

    async fn download_chapter(&self, ctx: &RequestContext, chapter_id: &str, dest_dir: &Path) -> Result<DownloadReport> {
        let chapter = self.get_chapter(ctx, chapter_id).await?;
        if chapter.pages.is_empty() {
            return Err(crate::track!(
                EngineError::NotFound(format!("pages for chapter {}", chapter_id)),
                "provider" => &self.site.id
            ));
        }
        let title = match self.try_get_manga_for_chapter(ctx, chapter_id).await {
            Ok(Some(m)) => m.title,
            Ok(None) => String::new(),
            Err(e) => {
                log::warn!("{}: could not resolve series for {}: {}", self.site.id, chapter_id, e);
                String::new()
            }
        };
        let requests = chapter
            .pages
            .iter()
            .map(|p| DownloadRequest::from_page(p).header("referer", &format!("{}/", self.site.base_url)))
            .collect();
        let job = DownloadJobConfig::new(
            ChapterMetadata::from_chapter(&self.site.id, &title, &chapter),
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

    const BASE: &str = "https://toon.test";

    #[test]
    fn test_slugs() {
        assert_eq!(slug_from_url("https://toon.test/manga/solo-leveling/").as_deref(), Some("solo-leveling"));
        assert_eq!(
            chapter_id_from_url("https://toon.test/manga/solo-leveling/chapter-12/").as_deref(),
            Some("solo-leveling/chapter-12")
        );
        assert!(chapter_id_from_url("https://toon.test/other/x/").is_none());
    }

    #[test]
    fn test_parse_search_results() {
        let html = br#"
          <div class="c-tabs-item__content">
            <div class="tab-thumb"><a href="/manga/solo-leveling/"><img data-src="/img/solo.jpg" src="data:image/gif;base64,x"></a></div>
            <div class="post-title"><h3><a href="https://toon.test/manga/solo-leveling/">Solo Leveling</a></h3></div>
            <div class="mg_author"><div class="summary-content"><a>Chugong</a></div></div>
            <div class="mg_genres"><div class="summary-content"><a>Action</a>, <a>Fantasy</a></div></div>
            <div class="mg_status"><div class="summary-content"> Completed </div></div>
          </div>"#;
        let found = parse_listing(html, BASE).unwrap();
        assert_eq!(found.len(), 1);
        let m = &found[0];
        assert_eq!(m.id, "solo-leveling");
        assert_eq!(m.title, "Solo Leveling");
        assert_eq!(m.cover_url.as_deref(), Some("https://toon.test/img/solo.jpg"));
        assert_eq!(m.authors, vec!["Chugong"]);
        assert_eq!(m.tags, vec!["Action", "Fantasy"]);
        assert_eq!(m.status, "completed");
    }

    #[test]
    fn test_parse_series_and_chapters() {
        let html = r#"
          <div class="post-title"><h1>Solo Leveling</h1></div>
          <div class="summary_image"><img src="https://cdn.test/cover.jpg"></div>
          <div class="post-content_item"><div class="summary-heading">Alternative</div><div class="summary-content">Na Honjaman, 나 혼자만 레벨업</div></div>
          <div class="post-content_item"><div class="summary-heading">Status</div><div class="summary-content">OnGoing</div></div>
          <div class="author-content"><a>Chugong</a></div>
          <div class="genres-content"><a>Action</a></div>
          <div class="description-summary"><div class="summary__content"><p>Hunters.</p></div></div>
          <div id="manga-chapters-holder" data-id="4242"></div>
          <ul class="main version-chap">
            <li class="wp-manga-chapter"><a href="https://toon.test/manga/solo-leveling/chapter-2/">Chapter 2</a>
              <span class="chapter-release-date"><i>January 15, 2024</i></span></li>
            <li class="wp-manga-chapter"><a href="https://toon.test/manga/solo-leveling/chapter-1-5/"> </a></li>
          </ul>"#.as_bytes();
        let (m, post_id) = parse_series(html, "solo-leveling", BASE).unwrap();
        assert_eq!(m.title, "Solo Leveling");
        assert_eq!(m.alt_titles, vec!["Na Honjaman", "나 혼자만 레벨업"]);
        assert_eq!(m.status, "ongoing");
        assert_eq!(m.description.as_deref(), Some("Hunters."));
        assert_eq!(post_id.as_deref(), Some("4242"));

        let chapters = parse_chapter_list(html, false).unwrap();
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0].id, "solo-leveling/chapter-2");
        assert_eq!(chapters[0].number, 2.0);
        assert!(chapters[0].published_at.is_some());
        assert_eq!(chapters[1].number, 1.5);
    }

    #[test]
    fn test_parse_reader() {
        let html = br#"
          <h1 id="chapter-heading">Solo Leveling - Chapter 3</h1>
          <div class="reading-content">
            <img data-src=" https://cdn.test/3/01.jpg ">
            <img src="/uploads/3/02.png">
          </div>"#;
        let (heading, pages) = parse_reader(html, BASE).unwrap();
        assert_eq!(heading, "Solo Leveling - Chapter 3");
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].url, "https://cdn.test/3/01.jpg");
        assert_eq!(pages[1].url, "https://toon.test/uploads/3/02.png");
        assert_eq!(pages[1].filename, "02.png");
    }
}
