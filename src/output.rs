//! Result views shared by the CLI and the JSON-RPC server
//!
//! Views turn engine results into user-facing shapes: ids are qualified as
//! `<provider>:<id>`, chapters are ordered and language-filtered, and each
//! view renders either as JSON or as plain terminal text.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::download::DownloadReport;
use crate::error::TrackedError;
use crate::helpers::{format_chapter_id, format_manga_id, format_number, sort_chapters};
use crate::language::{available_languages, filter_chapters_by_language, language_name};
use crate::metrics::RequestMetrics;
use crate::models::{ChapterInfo, Manga, MangaInfo};
use crate::provider::ProviderInfo;
use crate::search::SearchResults;

/// `{status: "success", data}`
pub fn envelope_ok(data: Value) -> Value {
    json!({ "status": "success", "data": data })
}

/// `{status: "error", error}`
pub fn envelope_err(err: &TrackedError) -> Value {
    json!({ "status": "error", "error": err.to_json() })
}

pub fn qualify_manga(provider_id: &str, mut manga: Manga) -> Manga {
    manga.id = format_manga_id(provider_id, &manga.id);
    manga
}

/// Keep only the requested fields of a serialized manga; `id` is always kept
fn project(manga: &Manga, fields: &[String]) -> Value {
    let full = serde_json::to_value(manga).unwrap_or(Value::Null);
    if fields.is_empty() {
        return full;
    }
    let Value::Object(all) = full else {
        return full;
    };
    let mut out = Map::new();
    for (k, v) in all {
        if k == "id" || fields.iter().any(|f| f.eq_ignore_ascii_case(&k)) {
            out.insert(k, v);
        }
    }
    Value::Object(out)
}

pub struct SearchView {
    pub results: BTreeMap<String, Vec<Manga>>,
    pub errors: BTreeMap<String, TrackedError>,
    pub fields: Vec<String>,
}

impl SearchView {
    pub fn new(results: SearchResults, fields: Vec<String>) -> Self {
        let qualified = results
            .results
            .into_iter()
            .map(|(provider, mangas)| {
                let mangas = mangas.into_iter().map(|m| qualify_manga(&provider, m)).collect();
                (provider, mangas)
            })
            .collect();
        Self {
            results: qualified,
            errors: results.errors,
            fields,
        }
    }

    pub fn total(&self) -> usize {
        self.results.values().map(Vec::len).sum()
    }

    pub fn to_json(&self) -> Value {
        let results: Map<String, Value> = self
            .results
            .iter()
            .map(|(p, mangas)| {
                let items = mangas.iter().map(|m| project(m, &self.fields)).collect();
                (p.clone(), Value::Array(items))
            })
            .collect();
        let errors: Map<String, Value> = self
            .errors
            .iter()
            .map(|(p, e)| (p.clone(), e.to_json()))
            .collect();
        json!({ "results": results, "total": self.total(), "errors": errors })
    }

    pub fn render(&self, show_alt_titles: bool) -> String {
        let mut out = String::new();
        for (provider, mangas) in &self.results {
            let _ = writeln!(out, "== {} ({} results)", provider, mangas.len());
            for m in mangas {
                let _ = write!(out, "  {}  {}", m.id, m.title);
                if !m.status.is_empty() {
                    let _ = write!(out, " [{}]", m.status);
                }
                if !m.authors.is_empty() {
                    let _ = write!(out, " by {}", m.authors.join(", "));
                }
                out.push('\n');
                if show_alt_titles && !m.alt_titles.is_empty() {
                    let _ = writeln!(out, "      aka {}", m.alt_titles.join(" / "));
                }
            }
        }
        for (provider, e) in &self.errors {
            let _ = writeln!(out, "!! {}: {}", provider, e);
        }
        let _ = write!(out, "{} results", self.total());
        out
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoView {
    pub manga: Manga,
    pub chapters: Vec<ChapterInfo>,
    pub total_chapters: usize,
    pub languages: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl InfoView {
    /// Qualify ids, order chapters and apply the optional language filter
    pub fn new(provider_id: &str, info: MangaInfo, language: Option<&str>) -> Self {
        let languages = available_languages(&info.chapters);
        let total_chapters = info.chapters.len();
        let mut chapters = match language.map(str::trim).filter(|l| !l.is_empty()) {
            Some(filter) => filter_chapters_by_language(&info.chapters, filter),
            None => info.chapters,
        };
        sort_chapters(&mut chapters);
        for c in &mut chapters {
            c.id = format_chapter_id(provider_id, &c.id);
        }
        Self {
            manga: qualify_manga(provider_id, info.manga),
            chapters,
            total_chapters,
            languages,
            last_updated: info.last_updated,
        }
    }

    pub fn render(&self, show_languages: bool) -> String {
        let m = &self.manga;
        let mut out = String::new();
        let _ = writeln!(out, "{}  ({})", m.title, m.id);
        if !m.alt_titles.is_empty() {
            let _ = writeln!(out, "Also known as: {}", m.alt_titles.join(" / "));
        }
        if !m.authors.is_empty() {
            let _ = writeln!(out, "Authors: {}", m.authors.join(", "));
        }
        if !m.status.is_empty() {
            let _ = writeln!(out, "Status: {}", m.status);
        }
        if !m.tags.is_empty() {
            let _ = writeln!(out, "Tags: {}", m.tags.join(", "));
        }
        if let Some(updated) = self.last_updated {
            let _ = writeln!(out, "Updated: {}", updated.format("%Y-%m-%d"));
        }
        if let Some(d) = &m.description {
            let _ = writeln!(out, "\n{}\n", d);
        }
        if show_languages {
            let names: Vec<String> = self
                .languages
                .iter()
                .map(|code| match language_name(code) {
                    Some(name) => format!("{} ({})", code, name),
                    None => code.clone(),
                })
                .collect();
            let _ = writeln!(out, "Languages: {}", names.join(", "));
        }
        let _ = writeln!(out, "Chapters ({} of {}):", self.chapters.len(), self.total_chapters);
        for c in &self.chapters {
            let mut label = String::new();
            if let Some(v) = c.volume {
                let _ = write!(label, "Vol.{} ", format_number(v));
            }
            let _ = write!(label, "Ch.{}", format_number(c.number));
            let _ = write!(out, "  {:<16} {}", label, c.id);
            if !c.title.is_empty() {
                let _ = write!(out, "  {}", c.title);
            }
            if let Some(lang) = &c.language {
                let _ = write!(out, " [{}]", lang);
            }
            out.push('\n');
        }
        out.trim_end().to_string()
    }
}

/// Outcome of downloading several chapters; failures do not stop the batch
#[derive(Default)]
pub struct DownloadView {
    pub completed: Vec<(String, DownloadReport)>,
    pub failed: Vec<(String, TrackedError)>,
}

impl DownloadView {
    pub fn to_json(&self) -> Value {
        let completed: Vec<Value> = self
            .completed
            .iter()
            .map(|(id, r)| json!({ "id": id, "report": r }))
            .collect();
        let failed: Vec<Value> = self
            .failed
            .iter()
            .map(|(id, e)| json!({ "id": id, "error": e.to_json() }))
            .collect();
        json!({ "completed": completed, "failed": failed })
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (id, r) in &self.completed {
            let _ = writeln!(out, "{}: {} pages -> {}", id, r.total, r.chapter_dir.display());
        }
        for (id, e) in &self.failed {
            let _ = writeln!(out, "{}: failed: {}", id, e);
        }
        out.trim_end().to_string()
    }
}

pub fn render_providers(providers: &[ProviderInfo]) -> String {
    let mut out = String::new();
    for p in providers {
        let _ = writeln!(out, "{:<8} {:<20} {}", p.id, p.name, p.site_url);
    }
    out.trim_end().to_string()
}

pub fn render_stats(stats: &[RequestMetrics]) -> String {
    if stats.is_empty() {
        return "No requests recorded".to_string();
    }
    let mut out = format!(
        "{:<28} {:>7} {:>8} {:>8} {:>8} {:>10}\n",
        "key", "total", "success", "retries", "limited", "avg ms"
    );
    for m in stats {
        let _ = writeln!(
            out,
            "{:<28} {:>7} {:>7.1}% {:>8} {:>8} {:>10.1}",
            m.key,
            m.total_requests,
            m.success_rate(),
            m.retry_count,
            m.rate_limit_hits,
            m.average_response_time_ms
        );
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;

    fn manga(id: &str, title: &str) -> Manga {
        Manga {
            id: id.into(),
            title: title.into(),
            status: "ongoing".into(),
            ..Default::default()
        }
    }

    fn chapter(id: &str, number: f64, lang: Option<&str>) -> ChapterInfo {
        ChapterInfo {
            id: id.into(),
            number,
            language: lang.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn test_search_view_qualifies_and_projects() {
        let mut results = SearchResults::default();
        results.results.insert("mgd".into(), vec![manga("a1", "Alpha")]);
        results
            .errors
            .insert("mdr".into(), crate::track!(EngineError::NotFound("site".into())));
        let view = SearchView::new(results, vec!["title".into()]);
        assert_eq!(view.results["mgd"][0].id, "mgd:a1");

        let data = view.to_json();
        assert_eq!(data["total"], 1);
        assert_eq!(data["results"]["mgd"][0], json!({"id": "mgd:a1", "title": "Alpha"}));
        assert_eq!(data["errors"]["mdr"]["category"], "not-found");
    }

    #[test]
    fn test_info_view_filters_and_orders_chapters() {
        let info = MangaInfo {
            manga: manga("a1", "Alpha"),
            chapters: vec![
                chapter("c3", 3.0, Some("en")),
                chapter("c1", 1.0, Some("en")),
                chapter("c2", 2.0, Some("ja")),
            ],
            last_updated: None,
        };
        let view = InfoView::new("mgd", info, Some("english"));
        let ids: Vec<&str> = view.chapters.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["mgd:c1", "mgd:c3"]);
        assert_eq!(view.total_chapters, 3);
        assert_eq!(view.languages, vec!["en", "ja"]);
        assert!(view.render(true).contains("Chapters (2 of 3):"));
    }

    #[test]
    fn test_envelopes() {
        assert_eq!(envelope_ok(json!([1])), json!({"status": "success", "data": [1]}));
        let err = crate::track!(EngineError::InvalidInput("bad id".into()));
        let env = envelope_err(&err);
        assert_eq!(env["status"], "error");
        assert_eq!(env["error"]["message"], "invalid input: bad id");
    }
}
