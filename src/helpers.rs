//! Helper functions shared by the engine and the providers
//!
//! This module provides the small utilities used throughout the crate:
//! - Identifier formatting and parsing (`<provider>:<local id>`)
//! - Filename sanitization for the on-disk layout
//! - Chapter and volume number extraction from free-form titles
//! - URL joining and filename extraction
//! - Alternate title deduplication and chapter ordering
//!
//! # Examples
//!
//! ```
//! use manga_fetcher::helpers::{extract_chapter_number, parse_manga_id, sanitize_filename};
//!
//! let (provider, id) = parse_manga_id("mgd:abc-123").unwrap();
//! assert_eq!((provider.as_str(), id.as_str()), ("mgd", "abc-123"));
//!
//! assert_eq!(extract_chapter_number("Chapter 12.5 - The End"), 12.5);
//! assert_eq!(sanitize_filename("X: Y"), "X__Y");
//! ```

use crate::error::EngineError;
use crate::models::ChapterInfo;
use once_cell::sync::Lazy;
use regex::Regex;
use std::cmp::Ordering;
use std::collections::HashSet;
use url::Url;

static CHAPTER_DASH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bch(?:apter)?-(\d+)-(\d+)\b").expect("valid regex"));
static CHAPTER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:chapter|chap|ch|episode|ep)\.?[\s_-]*(\d+(?:\.\d+)?)")
        .expect("valid regex")
});
static BARE_NUMBER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*#?(\d+(?:\.\d+)?)\s*$").expect("valid regex"));
static VOLUME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bvol(?:ume)?\.?[\s_-]*(\d+(?:\.\d+)?)").expect("valid regex")
});
static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Join a provider id and a provider-local id
pub fn format_manga_id(provider_id: &str, local_id: &str) -> String {
    format!("{}:{}", provider_id, local_id)
}

/// Split `<provider>:<local id>` on the first colon
pub fn parse_manga_id(id: &str) -> Result<(String, String), EngineError> {
    match id.split_once(':') {
        Some((provider, local)) if !provider.is_empty() && !local.is_empty() => {
            Ok((provider.to_string(), local.to_string()))
        }
        Some(_) => Err(EngineError::InvalidInput(format!(
            "identifier '{}' has an empty provider or local part",
            id
        ))),
        None => Err(EngineError::InvalidInput(format!(
            "identifier '{}' is not of the form <provider>:<id>",
            id
        ))),
    }
}

pub fn format_chapter_id(provider_id: &str, local_id: &str) -> String {
    format_manga_id(provider_id, local_id)
}

pub fn parse_chapter_id(id: &str) -> Result<(String, String), EngineError> {
    parse_manga_id(id)
}

/// Keep `[A-Za-z0-9 _.-]`, turn everything else into `_`, collapse whitespace runs to `_`
///
/// The result may be empty; callers pick their own fallback.
pub fn sanitize_filename(s: &str) -> String {
    let replaced: String = s
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, ' ' | '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    WHITESPACE_RE.replace_all(replaced.trim(), "_").into_owned()
}

/// Chapter number from a title, 0 when none is present
pub fn extract_chapter_number(title: &str) -> f64 {
    if let Some(cap) = CHAPTER_DASH_RE.captures(title) {
        if let Ok(n) = format!("{}.{}", &cap[1], &cap[2]).parse::<f64>() {
            return n;
        }
    }
    CHAPTER_RE
        .captures(title)
        .or_else(|| BARE_NUMBER_RE.captures(title))
        .and_then(|cap| cap[1].parse::<f64>().ok())
        .unwrap_or(0.0)
}

pub fn extract_volume_number(title: &str) -> Option<f64> {
    VOLUME_RE
        .captures(title)
        .and_then(|cap| cap[1].parse::<f64>().ok())
}

/// Render a chapter or volume number without a trailing `.0`
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 {
        format!("{}", n as i64)
    } else {
        let s = format!("{}", n);
        s.trim_end_matches('0').to_string()
    }
}

/// Resolve `path` against `base`; absolute urls pass through
pub fn join_url(base: &str, path: &str) -> Result<String, EngineError> {
    if let Ok(abs) = Url::parse(path) {
        return Ok(abs.to_string());
    }
    let base = Url::parse(base)
        .map_err(|e| EngineError::InvalidInput(format!("bad base url '{}': {}", base, e)))?;
    base.join(path)
        .map(|u| u.to_string())
        .map_err(|e| EngineError::InvalidInput(format!("cannot join '{}': {}", path, e)))
}

/// Last path segment of a url when it looks like a file name
pub fn filename_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let last = parsed.path_segments()?.next_back()?;
    if last.is_empty() || !last.contains('.') {
        return None;
    }
    Some(last.to_string())
}

/// Lowercase extension including the dot, `.jpg` when absent
pub fn extension_of(filename: &str) -> String {
    let name = filename.split(['?', '#']).next().unwrap_or(filename);
    match name.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && !ext.is_empty()
                && ext.len() <= 5
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            format!(".{}", ext.to_lowercase())
        }
        _ => ".jpg".to_string(),
    }
}

/// Host part of a url, used as the rate limiter key
pub fn host_of(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(String::from))
        .unwrap_or_default()
}

/// Drop empty, duplicate (case-insensitive) and primary-title entries, keeping first-seen order
pub fn dedup_alt_titles(primary: &str, titles: &[String]) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    seen.insert(primary.trim().to_lowercase());
    titles
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty() && seen.insert(t.to_lowercase()))
        .map(String::from)
        .collect()
}

/// Order chapters by number, then title
pub fn sort_chapters(chapters: &mut [ChapterInfo]) {
    chapters.sort_by(|a, b| {
        a.number
            .partial_cmp(&b.number)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.title.cmp(&b.title))
    });
}

/// Truncate a body for diagnostics, respecting char boundaries
pub fn body_sample(body: &[u8], max: usize) -> String {
    let text = String::from_utf8_lossy(body);
    if text.len() <= max {
        return text.into_owned();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
