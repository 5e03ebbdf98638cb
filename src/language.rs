//! Language codes and chapter language filtering
//!
//! Chapter languages are stored lower-case. A filter is a comma-separated
//! list of ISO 639-1 codes, extended codes (`zh-cn`, `pt-br`, ...) or full
//! English names; `unknown` and `none` select chapters without a language.

use crate::models::ChapterInfo;
use std::collections::BTreeSet;

const LANGUAGES: &[(&str, &str)] = &[
    ("ar", "arabic"),
    ("bg", "bulgarian"),
    ("bn", "bengali"),
    ("ca", "catalan"),
    ("cs", "czech"),
    ("da", "danish"),
    ("de", "german"),
    ("el", "greek"),
    ("en", "english"),
    ("es", "spanish"),
    ("es-la", "spanish (latin america)"),
    ("fa", "persian"),
    ("fi", "finnish"),
    ("fr", "french"),
    ("he", "hebrew"),
    ("hi", "hindi"),
    ("hr", "croatian"),
    ("hu", "hungarian"),
    ("id", "indonesian"),
    ("it", "italian"),
    ("ja", "japanese"),
    ("ko", "korean"),
    ("lt", "lithuanian"),
    ("ms", "malay"),
    ("mn", "mongolian"),
    ("my", "burmese"),
    ("ne", "nepali"),
    ("nl", "dutch"),
    ("no", "norwegian"),
    ("pl", "polish"),
    ("pt", "portuguese"),
    ("pt-br", "portuguese (brazil)"),
    ("ro", "romanian"),
    ("ru", "russian"),
    ("sk", "slovak"),
    ("sr", "serbian"),
    ("sv", "swedish"),
    ("ta", "tamil"),
    ("th", "thai"),
    ("tl", "tagalog"),
    ("tr", "turkish"),
    ("uk", "ukrainian"),
    ("vi", "vietnamese"),
    ("zh", "chinese"),
    ("zh-cn", "chinese (simplified)"),
    ("zh-hk", "chinese (traditional, hong kong)"),
    ("zh-tw", "chinese (traditional)"),
];

const ABSENT_SENTINELS: &[&str] = &["unknown", "none"];

/// Full English name for a code
pub fn language_name(code: &str) -> Option<&'static str> {
    let code = code.trim().to_lowercase();
    LANGUAGES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, name)| *name)
}

/// Code for a full English name, or the input itself when it already is a known code
pub fn language_code(name_or_code: &str) -> Option<&'static str> {
    let needle = name_or_code.trim().to_lowercase();
    LANGUAGES
        .iter()
        .find(|(c, n)| *c == needle || *n == needle)
        .map(|(c, _)| *c)
}

fn normalize(language: Option<&str>) -> Option<String> {
    language
        .map(|l| l.trim().to_lowercase())
        .filter(|l| !l.is_empty())
}

/// Does a chapter language satisfy one filter token
fn token_matches(language: Option<&str>, token: &str) -> bool {
    match normalize(language) {
        None => ABSENT_SENTINELS.contains(&token),
        Some(lang) => {
            if lang == token {
                return true;
            }
            if language_name(&lang) == Some(token) {
                return true;
            }
            language_code(token).is_some_and(|code| code == lang)
        }
    }
}

/// Does a chapter language satisfy a comma-separated filter
pub fn matches_language(language: Option<&str>, filter: &str) -> bool {
    filter
        .split(',')
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .any(|token| token_matches(language, &token))
}

pub fn filter_chapters_by_language(chapters: &[ChapterInfo], filter: &str) -> Vec<ChapterInfo> {
    if filter.trim().is_empty() {
        return chapters.to_vec();
    }
    chapters
        .iter()
        .filter(|c| matches_language(c.language.as_deref(), filter))
        .cloned()
        .collect()
}

/// Distinct languages present, `unknown` standing in for chapters without one
pub fn available_languages(chapters: &[ChapterInfo]) -> Vec<String> {
    chapters
        .iter()
        .map(|c| normalize(c.language.as_deref()).unwrap_or_else(|| "unknown".to_string()))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chapter(id: &str, lang: Option<&str>) -> ChapterInfo {
        ChapterInfo {
            id: id.to_string(),
            language: lang.map(String::from),
            ..Default::default()
        }
    }

    fn ids(chapters: &[ChapterInfo]) -> Vec<&str> {
        chapters.iter().map(|c| c.id.as_str()).collect()
    }

    #[test]
    fn test_filter_with_unknown() {
        let chapters = vec![chapter("a", Some("en")), chapter("b", None), chapter("c", Some("ja"))];
        let out = filter_chapters_by_language(&chapters, "en,unknown");
        assert_eq!(ids(&out), vec!["a", "b"]);
    }

    #[test]
    fn test_filter_by_full_name_and_case() {
        let chapters = vec![
            chapter("a", Some("EN")),
            chapter("b", Some("pt-br")),
            chapter("c", Some("ja")),
            chapter("d", Some("")),
        ];
        assert_eq!(ids(&filter_chapters_by_language(&chapters, "English")), vec!["a"]);
        assert_eq!(
            ids(&filter_chapters_by_language(&chapters, "portuguese (brazil), japanese")),
            vec!["b", "c"]
        );
        assert_eq!(ids(&filter_chapters_by_language(&chapters, "none")), vec!["d"]);
        assert_eq!(ids(&filter_chapters_by_language(&chapters, "")).len(), 4);
    }

    #[test]
    fn test_available_languages() {
        let chapters = vec![chapter("a", Some("en")), chapter("b", None), chapter("c", Some("EN"))];
        assert_eq!(available_languages(&chapters), vec!["en", "unknown"]);
    }

    #[test]
    fn test_lookup_table() {
        assert_eq!(language_name("zh-TW"), Some("chinese (traditional)"));
        assert_eq!(language_code("Spanish (Latin America)"), Some("es-la"));
        assert_eq!(language_code("klingon"), None);
    }
}
