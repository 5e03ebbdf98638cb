//! Declarative field mapping from response trees to typed records
//!
//! An [`ExtractorSet`] names a target record type and lists [`Extractor`]s,
//! each of which copies one value from a source path in a `serde_json::Value`
//! response into a dotted target path on the record. Providers describe their
//! response shapes as data and share one walker.
//!
//! Extraction starts from `T::default()`, serialized to a JSON object, so the
//! prototype's field types are known before assignment. Values are checked
//! against them (numbers are coerced between integer and float widths and
//! from numeric strings) and the finished tree is deserialized back into `T`.
//!
//! ```
//! use manga_fetcher::extractor::{Extractor, ExtractorSet};
//! use manga_fetcher::models::ChapterInfo;
//! use serde_json::json;
//!
//! let set = ExtractorSet::<ChapterInfo>::new("chapter")
//!     .field(Extractor::new("id", "id", "id").required())
//!     .field(Extractor::new("number", "attributes.chapter", "number"));
//!
//! let chapter = set.extract(&json!({"id": "c1", "attributes": {"chapter": "12.5"}})).unwrap();
//! assert_eq!(chapter.id, "c1");
//! assert_eq!(chapter.number, 12.5);
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Number, Value};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::{EngineError, Result, ResultExt};

pub type Transform = Arc<dyn Fn(&Value) -> Result<Value> + Send + Sync>;

fn split_path(path: &str) -> Vec<String> {
    path.split('.')
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// One source-path to target-path mapping
#[derive(Clone)]
pub struct Extractor {
    pub name: String,
    pub source: Vec<String>,
    pub target: String,
    pub transform: Option<Transform>,
    pub required: bool,
}

impl Extractor {
    /// `source` and `target` are dotted paths; an empty source means the item itself
    pub fn new(name: &str, source: &str, target: &str) -> Self {
        Self {
            name: name.to_string(),
            source: split_path(source),
            target: target.to_string(),
            transform: None,
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn transform<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for Extractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extractor")
            .field("name", &self.name)
            .field("source", &self.source.join("."))
            .field("target", &self.target)
            .field("transform", &self.transform.is_some())
            .field("required", &self.required)
            .finish()
    }
}

/// Walk `path` from `root` through objects and array indices
pub fn resolve_path<'a>(root: &'a Value, path: &[String]) -> Result<&'a Value> {
    let mut current = root;
    for (depth, step) in path.iter().enumerate() {
        let next = match current {
            Value::Object(map) => map.get(step),
            Value::Array(items) => step.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        current = next.ok_or_else(|| {
            crate::track!(EngineError::PathNotFound(path[..=depth].join(".")))
        })?;
    }
    Ok(current)
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Convert `value` so it fits the slot currently holding `existing`
fn coerce(existing: Option<&Value>, value: Value, path: &str) -> Result<Value> {
    let mismatch = |value: &Value, expected: &str| {
        crate::track!(EngineError::TypeMismatch {
            path: path.to_string(),
            expected: expected.to_string(),
            found: type_name(value).to_string(),
        })
    };

    let Some(existing) = existing else {
        return Ok(value);
    };
    match (existing, value) {
        // Option slots and unknown shapes take anything
        (Value::Null, v) => Ok(v),
        (Value::Number(slot), Value::Number(n)) => Ok(Value::Number(fit_number(slot, &n))),
        (Value::Number(slot), Value::String(s)) => {
            match s.trim().parse::<f64>().ok().and_then(Number::from_f64) {
                Some(n) => Ok(Value::Number(fit_number(slot, &n))),
                None => Err(mismatch(&Value::String(s), "number")),
            }
        }
        (Value::String(_), v @ Value::String(_)) => Ok(v),
        (Value::String(_), Value::Number(n)) => Ok(Value::String(n.to_string())),
        (Value::Bool(_), v @ Value::Bool(_)) => Ok(v),
        (Value::Array(_), v @ Value::Array(_)) => Ok(v),
        (Value::Object(_), v @ Value::Object(_)) => Ok(v),
        (slot, v) => Err(mismatch(&v, type_name(slot))),
    }
}

/// Keep integer slots integral when the value has no fraction
fn fit_number(slot: &Number, n: &Number) -> Number {
    if slot.is_f64() {
        return n.as_f64().and_then(Number::from_f64).unwrap_or_else(|| n.clone());
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && n.is_f64() => {
            if f >= 0.0 {
                Number::from(f as u64)
            } else {
                Number::from(f as i64)
            }
        }
        _ => n.clone(),
    }
}

fn assign(record: &mut Value, target: &str, value: Value) -> Result<()> {
    let steps = split_path(target);
    let Some((last, parents)) = steps.split_last() else {
        return Err(crate::track!(EngineError::InvalidInput("empty target path".to_string())));
    };

    let mut current = record;
    for step in parents {
        let Value::Object(map) = current else {
            return Err(crate::track!(EngineError::PathNotFound(target.to_string())));
        };
        current = map
            .entry(step.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    let Value::Object(map) = current else {
        return Err(crate::track!(EngineError::PathNotFound(target.to_string())));
    };
    let value = coerce(map.get(last), value, target)?;
    map.insert(last.clone(), value);
    Ok(())
}

/// A named mapping into records of type `T`
pub struct ExtractorSet<T> {
    pub name: String,
    pub extractors: Vec<Extractor>,
    _record: PhantomData<fn() -> T>,
}

impl<T> Clone for ExtractorSet<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            extractors: self.extractors.clone(),
            _record: PhantomData,
        }
    }
}

impl<T> ExtractorSet<T>
where
    T: Default + Serialize + DeserializeOwned,
{
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            extractors: Vec::new(),
            _record: PhantomData,
        }
    }

    pub fn field(mut self, extractor: Extractor) -> Self {
        self.extractors.push(extractor);
        self
    }

    /// Build one record from `response`
    pub fn extract(&self, response: &Value) -> Result<T> {
        let mut record = serde_json::to_value(T::default()).tracked()?;

        for ex in &self.extractors {
            let found = match resolve_path(response, &ex.source) {
                Ok(Value::Null) => None,
                Ok(v) => Some(v),
                Err(_) => None,
            };
            let Some(raw) = found else {
                if ex.required {
                    return Err(self.field_error(ex, "required field is missing"));
                }
                continue;
            };

            let value = match &ex.transform {
                Some(f) => match f(raw) {
                    Ok(v) => v,
                    Err(e) if ex.required => {
                        return Err(crate::track!(e, "extractor" => &self.name, "field" => &ex.name))
                    }
                    Err(e) => {
                        log::debug!("{}: transform for '{}' failed: {}", self.name, ex.name, e);
                        continue;
                    }
                },
                None => raw.clone(),
            };
            if value.is_null() {
                if ex.required {
                    return Err(self.field_error(ex, "required field is empty"));
                }
                continue;
            }

            assign(&mut record, &ex.target, value)
                .map_err(|e| crate::track!(e, "extractor" => &self.name, "field" => &ex.name))?;
        }

        serde_json::from_value(record).map_err(|e| {
            crate::track!(
                EngineError::Parsing {
                    what: self.name.clone(),
                    message: e.to_string(),
                    sample: None,
                },
                "extractor" => &self.name
            )
        })
    }

    /// Map every element of the array at `list_path`; bad elements are skipped
    pub fn extract_list(&self, response: &Value, list_path: &str) -> Result<Vec<T>> {
        let path = split_path(list_path);
        let list = resolve_path(response, &path)
            .map_err(|e| crate::track!(e, "extractor" => &self.name))?;
        let Value::Array(items) = list else {
            return Err(crate::track!(EngineError::TypeMismatch {
                path: list_path.to_string(),
                expected: "array".to_string(),
                found: type_name(list).to_string(),
            }));
        };

        let mut out = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            match self.extract(item) {
                Ok(record) => out.push(record),
                Err(e) => log::warn!("{}: skipping item {}: {}", self.name, i, e),
            }
        }
        Ok(out)
    }

    fn field_error(&self, ex: &Extractor, message: &str) -> crate::error::TrackedError {
        crate::track!(
            EngineError::Parsing {
                what: format!("{}.{}", self.name, ex.name),
                message: format!("{} at '{}'", message, ex.source.join(".")),
                sample: None,
            },
            "extractor" => &self.name,
            "field" => &ex.name
        )
    }
}

/// Reusable transforms
pub mod transforms {
    use super::*;

    /// Pick a string from a `{lang: text}` map, preferring the given languages
    /// in order, else any non-empty translation.
    pub fn localized(preferred: &'static [&'static str]) -> impl Fn(&Value) -> Result<Value> + Send + Sync {
        move |v| Ok(pick_localized(v, preferred).map(Value::String).unwrap_or(Value::Null))
    }

    pub fn pick_localized(v: &Value, preferred: &[&str]) -> Option<String> {
        let map = v.as_object()?;
        let non_empty = |s: &Value| s.as_str().map(str::trim).filter(|s| !s.is_empty()).map(String::from);
        preferred
            .iter()
            .find_map(|lang| map.get(*lang).and_then(non_empty))
            .or_else(|| map.values().find_map(non_empty))
    }

    /// Flatten an array of `{lang: text}` maps into their texts, in order
    pub fn localized_list(v: &Value) -> Result<Value> {
        let texts = v
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|m| m.as_object())
                    .flat_map(|m| m.values())
                    .filter_map(|s| s.as_str())
                    .filter(|s| !s.trim().is_empty())
                    .map(|s| Value::String(s.trim().to_string()))
                    .collect()
            })
            .unwrap_or_default();
        Ok(Value::Array(texts))
    }

    /// Numeric string or number to a float; unparsable text becomes null
    pub fn number(v: &Value) -> Result<Value> {
        let n = match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        Ok(n.and_then(Number::from_f64).map(Value::Number).unwrap_or(Value::Null))
    }

    pub fn lowercase(v: &Value) -> Result<Value> {
        Ok(v.as_str()
            .map(|s| Value::String(s.trim().to_lowercase()))
            .unwrap_or(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use crate::models::{ChapterInfo, Manga};
    use serde::Deserialize;
    use serde_json::json;

    fn manga_set() -> ExtractorSet<Manga> {
        ExtractorSet::new("manga")
            .field(Extractor::new("id", "id", "id").required())
            .field(
                Extractor::new("title", "attributes.title", "title")
                    .transform(transforms::localized(&["en"])),
            )
            .field(
                Extractor::new("alt", "attributes.altTitles", "altTitles")
                    .transform(transforms::localized_list),
            )
            .field(Extractor::new("status", "attributes.status", "status"))
            .field(Extractor::new("cover", "cover.0.url", "coverUrl"))
    }

    fn response() -> Value {
        json!({
            "id": "abc",
            "attributes": {
                "title": {"ja": "", "en": "One Piece"},
                "altTitles": [{"ja": "ワンピース"}, {"fr": "One Piece"}],
                "status": "ongoing"
            },
            "cover": [{"url": "https://c/1.jpg"}]
        })
    }

    #[test]
    fn test_extract_record() {
        let m = manga_set().extract(&response()).unwrap();
        assert_eq!(m.id, "abc");
        assert_eq!(m.title, "One Piece");
        assert_eq!(m.alt_titles, vec!["ワンピース", "One Piece"]);
        assert_eq!(m.cover_url.as_deref(), Some("https://c/1.jpg"));
        assert_eq!(m.status, "ongoing");
    }

    #[test]
    fn test_extract_is_repeatable() {
        let set = manga_set();
        let r = response();
        assert_eq!(set.extract(&r).unwrap(), set.extract(&r).unwrap());
    }

    #[test]
    fn test_missing_required_field() {
        let err = manga_set().extract(&json!({"attributes": {}})).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Parsing);
        assert!(err.to_string().contains("manga.id"));
    }

    #[test]
    fn test_missing_optional_field_keeps_default() {
        let m = manga_set().extract(&json!({"id": "x"})).unwrap();
        assert_eq!(m.title, "");
        assert!(m.cover_url.is_none());
    }

    #[test]
    fn test_type_mismatch() {
        let set = ExtractorSet::<ChapterInfo>::new("chapter")
            .field(Extractor::new("id", "id", "id"))
            .field(Extractor::new("number", "n", "number"));
        let err = set.extract(&json!({"id": "c", "n": ["x"]})).unwrap_err();
        assert!(matches!(err.engine_error(), Some(EngineError::TypeMismatch { .. })));
    }

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct Counts {
        total: u32,
        nested: Inner,
    }

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct Inner {
        ratio: f32,
    }

    #[test]
    fn test_numeric_widths_and_nested_targets() {
        let set = ExtractorSet::<Counts>::new("counts")
            .field(Extractor::new("total", "meta.total", "total"))
            .field(Extractor::new("ratio", "meta.ratio", "nested.ratio"));
        let c = set
            .extract(&json!({"meta": {"total": 12.0, "ratio": 1}}))
            .unwrap();
        assert_eq!(c.total, 12);
        assert_eq!(c.nested.ratio, 1.0);
    }

    #[test]
    fn test_extract_list_skips_bad_items() {
        let list = json!({"data": [{"id": "a"}, {"title": "no id"}, {"id": "b"}]});
        let out = manga_set().extract_list(&list, "data").unwrap();
        let ids: Vec<_> = out.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let err = manga_set().extract_list(&list, "missing").unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Parsing);
    }

    #[test]
    fn test_resolve_path_indexes_arrays() {
        let v = json!({"a": [{"b": 1}, {"b": 2}]});
        let path = vec!["a".to_string(), "1".to_string(), "b".to_string()];
        assert_eq!(resolve_path(&v, &path).unwrap(), &json!(2));
        let bad = vec!["a".to_string(), "5".to_string()];
        assert!(matches!(
            resolve_path(&v, &bad).unwrap_err().engine_error(),
            Some(EngineError::PathNotFound(p)) if p == "a.5"
        ));
    }
}
