use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

use crate::error::EngineError;

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Manga {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub alt_titles: Vec<String>,
}

impl Manga {
    /// Substitute the id for an empty title and drop duplicate alternate titles
    pub fn normalized(mut self) -> Self {
        if self.title.trim().is_empty() {
            self.title = self.id.clone();
        }
        self.alt_titles = crate::helpers::dedup_alt_titles(&self.title, &self.alt_titles);
        self
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MangaInfo {
    #[serde(flatten)]
    pub manga: Manga,
    #[serde(default)]
    pub chapters: Vec<ChapterInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChapterInfo {
    pub id: String,
    #[serde(default)]
    pub title: String,
    /// 0 means unknown
    #[serde(default)]
    pub number: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Chapter {
    #[serde(flatten)]
    pub info: ChapterInfo,
    #[serde(default)]
    pub manga_id: String,
    #[serde(default)]
    pub pages: Vec<Page>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Page {
    pub index: usize,
    pub url: String,
    pub filename: String,
}

impl Page {
    /// Build a page, taking the filename from the url path when it has one
    pub fn new(index: usize, url: impl Into<String>) -> Self {
        let url = url.into();
        let filename = crate::helpers::filename_from_url(&url)
            .unwrap_or_else(|| format!("page_{:03}.jpg", index + 1));
        Self {
            index,
            url,
            filename,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Relevance,
    Name,
    Author,
    Status,
    Popularity,
    Newest,
    Updated,
}

impl FromStr for SortOrder {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "relevance" => Ok(SortOrder::Relevance),
            "name" | "title" => Ok(SortOrder::Name),
            "author" => Ok(SortOrder::Author),
            "status" => Ok(SortOrder::Status),
            "popularity" | "popular" => Ok(SortOrder::Popularity),
            "newest" | "new" => Ok(SortOrder::Newest),
            "updated" | "latest" => Ok(SortOrder::Updated),
            other => Err(EngineError::InvalidInput(format!("unknown sort '{}'", other))),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchOptions {
    pub query: String,
    /// Results requested per page
    pub limit: usize,
    pub max_pages: usize,
    /// Global cap across all providers, applied by the coordinator
    pub max_results: Option<usize>,
    pub fields: Vec<String>,
    /// Recognized keys: title, author, status, tag, genre
    pub filters: HashMap<String, String>,
    pub sort: SortOrder,
    /// Only series with chapters in one of these languages; empty means any
    pub languages: Vec<String>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            query: String::new(),
            limit: 20,
            max_pages: 1,
            max_results: None,
            fields: Vec::new(),
            filters: HashMap::new(),
            sort: SortOrder::Relevance,
            languages: Vec::new(),
        }
    }
}

impl SearchOptions {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    /// Parse a `k=v,k2=v2` filter list
    pub fn parse_filters(spec: &str) -> Result<HashMap<String, String>, EngineError> {
        let mut filters = HashMap::new();
        for pair in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (k, v) = pair
                .split_once('=')
                .ok_or_else(|| EngineError::InvalidInput(format!("filter '{}' is not key=value", pair)))?;
            let key = match k.trim().to_lowercase().as_str() {
                "genre" => "tag".to_string(),
                other => other.to_string(),
            };
            filters.insert(key, v.trim().to_string());
        }
        Ok(filters)
    }
}

/// What the download coordinator needs to lay out a chapter on disk
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChapterMetadata {
    pub manga_id: String,
    pub manga_title: String,
    pub chapter_id: String,
    pub chapter_number: Option<f64>,
    pub volume_number: Option<f64>,
    pub chapter_title: String,
    pub provider_id: String,
}

impl ChapterMetadata {
    pub fn from_chapter(provider_id: &str, manga_title: &str, chapter: &Chapter) -> Self {
        Self {
            manga_id: chapter.manga_id.clone(),
            manga_title: manga_title.to_string(),
            chapter_id: chapter.info.id.clone(),
            chapter_number: (chapter.info.number > 0.0).then_some(chapter.info.number),
            volume_number: chapter.info.volume,
            chapter_title: chapter.info.title.clone(),
            provider_id: provider_id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_title_falls_back_to_id() {
        let manga = Manga {
            id: "abc".into(),
            ..Default::default()
        }
        .normalized();
        assert_eq!(manga.title, "abc");
    }

    #[test]
    fn test_page_filename() {
        assert_eq!(Page::new(0, "https://cdn.example.com/data/x/01-a.png").filename, "01-a.png");
        assert_eq!(Page::new(4, "https://cdn.example.com/").filename, "page_005.jpg");
    }

    #[test]
    fn test_sort_order_parse() {
        assert_eq!("title".parse::<SortOrder>().unwrap(), SortOrder::Name);
        assert_eq!("Updated".parse::<SortOrder>().unwrap(), SortOrder::Updated);
        assert!("sideways".parse::<SortOrder>().is_err());
    }

    #[test]
    fn test_parse_filters() {
        let filters = SearchOptions::parse_filters("genre=Action, status=ongoing").unwrap();
        assert_eq!(filters["tag"], "Action");
        assert_eq!(filters["status"], "ongoing");
        assert!(SearchOptions::parse_filters("broken").is_err());
    }
}
