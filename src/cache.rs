//! Response cache with TTL
//!
//! Two tiers: an in-memory map behind a `RwLock`, and an optional directory of
//! `<key>.json` files. Disk entries expire by mtime. Writes go through a
//! temporary file and a rename so readers never see a partial entry.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{Duration, Instant, SystemTime};

use crate::config::CacheConfig;
use crate::error::{EngineError, Result, ResultExt};
use crate::helpers::sanitize_filename;

struct Entry {
    value: Value,
    expires: Instant,
}

pub struct ResponseCache {
    ttl: Duration,
    dir: Option<PathBuf>,
    entries: RwLock<HashMap<String, Entry>>,
}

impl ResponseCache {
    pub fn new(ttl: Duration, dir: Option<PathBuf>) -> Self {
        Self {
            ttl,
            dir,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(Duration::from_secs(config.ttl_secs), config.dir.clone())
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn file_for(&self, key: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(format!("{}.json", file_key(key))))
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let stale = {
            let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
            match entries.get(key) {
                Some(entry) if entry.expires > Instant::now() => {
                    return serde_json::from_value(entry.value.clone()).ok();
                }
                Some(_) => true,
                None => false,
            }
        };
        if stale {
            let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
            // another reader may have refreshed it meanwhile
            if entries.get(key).is_some_and(|e| e.expires <= Instant::now()) {
                entries.remove(key);
            }
        }

        let path = self.file_for(key)?;
        let age = fs::metadata(&path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())?;
        if age >= self.ttl {
            log::debug!("cache: removing expired {}", path.display());
            let _ = fs::remove_file(&path);
            return None;
        }

        let value: Value = fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())?;
        let out = serde_json::from_value(value.clone()).ok()?;

        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires: Instant::now() + (self.ttl - age),
            },
        );
        Some(out)
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value).tracked()?;

        if let Some(path) = self.file_for(key) {
            write_atomic(&path, &value)?;
        }

        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires: Instant::now() + self.ttl,
            },
        );
        Ok(())
    }

    pub fn delete(&self, key: &str) {
        self.entries
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(key);
        if let Some(path) = self.file_for(key) {
            let _ = fs::remove_file(path);
        }
    }

    /// Drop every entry from both tiers
    pub fn clear(&self) -> Result<usize> {
        self.entries
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
        self.sweep(|_| true)
    }

    /// Drop expired entries from both tiers, returning how many files went
    pub fn clean_expired(&self) -> Result<usize> {
        let now = Instant::now();
        self.entries
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|_, e| e.expires > now);
        let ttl = self.ttl;
        self.sweep(move |age| age >= ttl)
    }

    fn sweep(&self, should_remove: impl Fn(Duration) -> bool) -> Result<usize> {
        let Some(dir) = &self.dir else {
            return Ok(0);
        };
        if !dir.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in fs::read_dir(dir).map_err(|e| EngineError::io(dir, e)).tracked()? {
            let entry = entry.map_err(|e| EngineError::io(dir, e)).tracked()?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
                .unwrap_or_default();
            if should_remove(age) && fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn write_atomic(path: &Path, value: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| EngineError::io(parent, e))
            .tracked()?;
    }
    let bytes = serde_json::to_vec(value).tracked()?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes)
        .map_err(|e| EngineError::io(&tmp, e))
        .tracked()?;
    fs::rename(&tmp, path)
        .map_err(|e| EngineError::io(path, e))
        .tracked()
}

/// Filesystem-safe name for a cache key: a readable prefix plus a hash
fn file_key(key: &str) -> String {
    let mut readable = sanitize_filename(key);
    readable.truncate(80);
    format!("{}-{:016x}", readable.trim_end_matches('_'), fnv1a(key.as_bytes()))
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf29ce484222325u64, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(0x100000001b3)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Body {
        title: String,
        count: u32,
    }

    fn body() -> Body {
        Body {
            title: "One Piece".into(),
            count: 3,
        }
    }

    #[test]
    fn test_memory_round_trip_and_delete() {
        let cache = ResponseCache::new(Duration::from_secs(60), None);
        cache.set("k", &body()).unwrap();
        assert_eq!(cache.get::<Body>("k"), Some(body()));
        cache.delete("k");
        assert_eq!(cache.get::<Body>("k"), None);
    }

    #[test]
    fn test_expired_memory_entry_is_not_returned() {
        let cache = ResponseCache::new(Duration::ZERO, None);
        cache.set("k", &body()).unwrap();
        assert_eq!(cache.get::<Body>("k"), None);
        assert!(cache.entries.read().unwrap().is_empty());
    }

    #[test]
    fn test_disk_tier_survives_new_instance() {
        let dir = tempfile::tempdir().unwrap();
        let key = "https://api.test/manga?title=one&limit=10";
        {
            let cache = ResponseCache::new(Duration::from_secs(60), Some(dir.path().to_path_buf()));
            cache.set(key, &body()).unwrap();
        }
        let files: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);

        let cache = ResponseCache::new(Duration::from_secs(60), Some(dir.path().to_path_buf()));
        assert_eq!(cache.get::<Body>(key), Some(body()));
    }

    #[test]
    fn test_expired_disk_entry_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ResponseCache::new(Duration::from_secs(60), Some(dir.path().to_path_buf()));
        writer.set("k", &body()).unwrap();

        let reader = ResponseCache::new(Duration::ZERO, Some(dir.path().to_path_buf()));
        assert_eq!(reader.get::<Body>("k"), None);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_clear_and_clean_expired() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResponseCache::new(Duration::from_secs(60), Some(dir.path().to_path_buf()));
        cache.set("a", &body()).unwrap();
        cache.set("b", &body()).unwrap();
        assert_eq!(cache.clean_expired().unwrap(), 0);
        assert_eq!(cache.clear().unwrap(), 2);
        assert_eq!(cache.get::<Body>("a"), None);
    }

    #[test]
    fn test_file_keys_are_distinct() {
        assert_ne!(file_key("https://x/a?b=1"), file_key("https://x/a?b=2"));
        assert!(file_key("a/b:c").chars().all(|c| c.is_ascii_alphanumeric() || "_.- ".contains(c)));
    }
}
