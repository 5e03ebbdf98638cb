use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{EngineError, Result, ResultExt};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_download_dir")]
    pub download_dir: String,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    /// Timeout for a single request attempt in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Extra attempts after the first one
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Backoff unit; attempt n sleeps base * 2^n
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_ms: u64,

    #[serde(default = "default_true")]
    pub enable_cookies: bool,

    #[serde(default = "default_true")]
    pub enable_compression: bool,

    /// Fixed user agent; a browser one is picked at random when unset
    #[serde(default)]
    pub user_agent: Option<String>,

    /// How much of an error body to keep for diagnostics
    #[serde(default = "default_body_sample")]
    pub body_sample_bytes: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_limit")]
    pub default_interval_ms: u64,

    /// Per-host minimum interval in milliseconds
    #[serde(default)]
    pub hosts: HashMap<String, u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_search_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_page_throttle")]
    pub page_throttle_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DownloadConfig {
    #[serde(default = "default_download_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub page_delay_ms: u64,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
    /// Extra passes over failed pages
    #[serde(default)]
    pub retry_failed: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
    /// Disk tier directory; memory only when unset
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProvidersConfig {
    #[serde(default = "default_mangadex_api")]
    pub mangadex_api_url: String,
    #[serde(default = "default_mangadex_uploads")]
    pub mangadex_uploads_url: String,
    /// Madara (WP-Manga) sites to register, keyed by provider id
    #[serde(default)]
    pub madara: Vec<MadaraSite>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MadaraSite {
    pub id: String,
    pub name: String,
    pub base_url: String,
}

fn default_true() -> bool { true }
fn default_download_dir() -> String { "downloads".to_string() }
fn default_timeout() -> u64 { 30 }
fn default_max_retries() -> u32 { 3 }
fn default_backoff_base() -> u64 { 1000 }
fn default_backoff_cap() -> u64 { 30_000 }
fn default_body_sample() -> usize { 512 }
fn default_rate_limit() -> u64 { 300 }
fn default_search_concurrency() -> usize { 3 }
fn default_page_throttle() -> u64 { 500 }
fn default_download_concurrency() -> usize { 4 }
fn default_retry_delay() -> u64 { 1000 }
fn default_cache_ttl() -> u64 { 3600 }
fn default_log_level() -> String { "info".to_string() }
fn default_mangadex_api() -> String { "https://api.mangadex.org".to_string() }
fn default_mangadex_uploads() -> String { "https://uploads.mangadex.org".to_string() }

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base(),
            backoff_cap_ms: default_backoff_cap(),
            enable_cookies: true,
            enable_compression: true,
            user_agent: None,
            body_sample_bytes: default_body_sample(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_interval_ms: default_rate_limit(),
            hosts: HashMap::new(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            concurrency: default_search_concurrency(),
            timeout_secs: default_timeout(),
            page_throttle_ms: default_page_throttle(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            concurrency: default_download_concurrency(),
            page_delay_ms: 0,
            retry_delay_ms: default_retry_delay(),
            retry_failed: 0,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_secs: default_cache_ttl(),
            dir: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            mangadex_api_url: default_mangadex_api(),
            mangadex_uploads_url: default_mangadex_uploads(),
            madara: Vec::new(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            http: HttpConfig::default(),
            rate_limit: RateLimitConfig::default(),
            search: SearchConfig::default(),
            download: DownloadConfig::default(),
            cache: CacheConfig::default(),
            logging: LoggingConfig::default(),
            providers: ProvidersConfig::default(),
        }
    }
}

impl Config {
    /// Read `config.toml` from the working directory, falling back to defaults
    pub fn load() -> Self {
        let path = Path::new("config.toml");
        if !path.exists() {
            return Self::default();
        }
        match Self::load_from(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                log::warn!("Ignoring config.toml: {}", e);
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| EngineError::io(path, e))
            .tracked()?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str::<Config>(content)
            .map_err(|e| EngineError::Parsing {
                what: "config".to_string(),
                message: e.to_string(),
                sample: None,
            })
            .tracked()
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http.timeout_secs)
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_secs(self.search.timeout_secs)
    }

    pub fn page_throttle(&self) -> Duration {
        Duration::from_millis(self.search.page_throttle_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.download_dir, "downloads");
        assert_eq!(cfg.http.max_retries, 3);
        assert_eq!(cfg.http.backoff_cap_ms, 30_000);
        assert_eq!(cfg.search.concurrency, 3);
        assert_eq!(cfg.page_throttle(), Duration::from_millis(500));
        assert!(!cfg.cache.enabled);
    }

    #[test]
    fn test_partial_file() {
        let cfg = Config::parse(
            r#"
            download_dir = "/tmp/manga"

            [http]
            max_retries = 5

            [rate_limit.hosts]
            "api.mangadex.org" = 250

            [[providers.madara]]
            id = "toonily"
            name = "Toonily"
            base_url = "https://toonily.com"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.download_dir, "/tmp/manga");
        assert_eq!(cfg.http.max_retries, 5);
        assert_eq!(cfg.http.timeout_secs, 30);
        assert_eq!(cfg.rate_limit.hosts["api.mangadex.org"], 250);
        assert_eq!(cfg.providers.madara[0].id, "toonily");
        assert_eq!(cfg.download.concurrency, 4);
    }

    #[test]
    fn test_bad_file_is_parsing_error() {
        let err = Config::parse("download_dir = [").unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Parsing);
    }
}
