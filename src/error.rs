//! Error tracking for the provider engine
//!
//! Every failure that leaves the engine is a [`TrackedError`]: the original
//! error, a category tag, the chain of functions it travelled through and a
//! free-form context map. Errors raised by the engine itself are
//! [`EngineError`] values; anything else (reqwest, serde, io, plain strings)
//! is categorized by type and then by a keyword scan of its message.
//!
//! # Examples
//!
//! ```
//! use manga_fetcher::error::{EngineError, ErrorCategory, ResultExt};
//!
//! fn lookup() -> manga_fetcher::error::Result<()> {
//!     Err(EngineError::NotFound("manga abc".into())).tracked_provider("mgd")
//! }
//!
//! let err = lookup().unwrap_err();
//! assert_eq!(err.category(), ErrorCategory::NotFound);
//! assert_eq!(err.provider_id(), Some("mgd"));
//! assert_eq!(err.call_chain().len(), 1);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::backtrace::Backtrace;
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::panic::Location;
use std::time::Duration;
use thiserror::Error;

pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

pub type Result<T> = std::result::Result<T, TrackedError>;

/// Closed set of failure categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCategory {
    Network,
    Timeout,
    Auth,
    RateLimit,
    NotFound,
    Parsing,
    Filesystem,
    Download,
    Provider,
    Panic,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Auth => "auth",
            ErrorCategory::RateLimit => "rate-limit",
            ErrorCategory::NotFound => "not-found",
            ErrorCategory::Parsing => "parsing",
            ErrorCategory::Filesystem => "filesystem",
            ErrorCategory::Download => "download",
            ErrorCategory::Provider => "provider",
            ErrorCategory::Panic => "panic",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Prefix shown in front of the message on the terminal
    pub fn prefix(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "Network Error",
            ErrorCategory::Timeout => "Timeout",
            ErrorCategory::Auth => "Authentication Error",
            ErrorCategory::RateLimit => "Rate Limited",
            ErrorCategory::NotFound => "Not Found",
            ErrorCategory::Parsing => "Parsing Error",
            ErrorCategory::Filesystem => "File System Error",
            ErrorCategory::Download => "Download Error",
            ErrorCategory::Provider => "Provider Error",
            ErrorCategory::Panic => "Internal Error",
            ErrorCategory::Unknown => "Error",
        }
    }

    /// Troubleshooting hint for the category
    pub fn guidance(&self) -> &'static str {
        match self {
            ErrorCategory::Network => {
                "Check your internet connection and whether the site is reachable."
            }
            ErrorCategory::Timeout => {
                "The server took too long to answer. Try again later or raise the timeout."
            }
            ErrorCategory::Auth => "The source refused access. The content may require a login.",
            ErrorCategory::RateLimit => {
                "The source is throttling requests. Wait a moment or lower the concurrency."
            }
            ErrorCategory::NotFound => "Check the identifier; the resource may have been removed.",
            ErrorCategory::Parsing => {
                "The source returned data in an unexpected shape. The site may have changed."
            }
            ErrorCategory::Filesystem => "Check that the output directory exists and is writable.",
            ErrorCategory::Download => "Some pages could not be saved. Re-run the download to retry.",
            ErrorCategory::Provider => "The provider rejected the request. Check the arguments.",
            ErrorCategory::Panic => "This is a bug. Please report it with the debug output.",
            ErrorCategory::Unknown => "Run with --debug for more details.",
        }
    }

    /// Infer a category from free-form error text
    pub fn from_message(message: &str) -> ErrorCategory {
        let msg = message.to_lowercase();
        let has = |keys: &[&str]| keys.iter().any(|k| msg.contains(k));

        if has(&["dial tcp", "refused", "no such host", "dns error", "connection reset"]) {
            ErrorCategory::Network
        } else if has(&["timeout", "timed out", "deadline exceeded"]) {
            ErrorCategory::Timeout
        } else if has(&["not found", "404"]) {
            ErrorCategory::NotFound
        } else if has(&["unauthorized", "forbidden"]) {
            ErrorCategory::Auth
        } else if has(&["rate limit", "too many requests"]) {
            ErrorCategory::RateLimit
        } else if has(&[
            "json",
            "xml",
            "parse",
            "unmarshal",
            "decode",
            "invalid character",
            "unexpected end",
        ]) {
            ErrorCategory::Parsing
        } else if has(&["permission denied", "no such file"]) {
            ErrorCategory::Filesystem
        } else {
            ErrorCategory::Unknown
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by the engine itself
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("HTTP {status} from {url}")]
    HttpStatus {
        status: u16,
        url: String,
        body_sample: String,
        resource_type: Option<String>,
        resource_id: Option<String>,
    },

    #[error("request to {url} failed: {message}")]
    Transport {
        url: String,
        message: String,
        timeout: bool,
    },

    #[error("failed to parse {what}: {message}")]
    Parsing {
        what: String,
        message: String,
        sample: Option<String>,
    },

    #[error("path not found: {0}")]
    PathNotFound(String),

    #[error("type mismatch at '{path}': cannot assign {found} to {expected}")]
    TypeMismatch {
        path: String,
        expected: String,
        found: String,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("provider '{0}' is already registered")]
    DuplicateProvider(String),

    #[error("unknown endpoint '{0}'")]
    UnknownEndpoint(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("{failed} of {total} pages failed to download")]
    Download {
        failed: usize,
        total: usize,
        #[source]
        first: Box<TrackedError>,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("task panicked: {0}")]
    Panic(String),
}

impl EngineError {
    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        EngineError::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            EngineError::HttpStatus { status, .. } => match status {
                401 | 403 => ErrorCategory::Auth,
                404 => ErrorCategory::NotFound,
                429 => ErrorCategory::RateLimit,
                500..=599 => ErrorCategory::Network,
                _ => ErrorCategory::Provider,
            },
            EngineError::Transport { timeout: true, .. } => ErrorCategory::Timeout,
            EngineError::Transport { .. } => ErrorCategory::Network,
            EngineError::Parsing { .. }
            | EngineError::PathNotFound(_)
            | EngineError::TypeMismatch { .. } => ErrorCategory::Parsing,
            EngineError::NotFound(_) => ErrorCategory::NotFound,
            EngineError::InvalidInput(_)
            | EngineError::DuplicateProvider(_)
            | EngineError::UnknownEndpoint(_) => ErrorCategory::Unknown,
            EngineError::Cancelled | EngineError::Timeout(_) => ErrorCategory::Timeout,
            EngineError::Download { .. } => ErrorCategory::Download,
            EngineError::Io { source, .. } => match source.kind() {
                std::io::ErrorKind::TimedOut => ErrorCategory::Timeout,
                _ => ErrorCategory::Filesystem,
            },
            EngineError::Panic(_) => ErrorCategory::Panic,
        }
    }
}

/// One hop of a tracked error's journey
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub function: String,
    pub package: String,
    pub file: String,
    pub line: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub context: BTreeMap<String, String>,
}

/// Where a failure was observed
#[derive(Debug, Clone)]
pub struct CallSite {
    function: String,
    package: String,
    file: String,
    line: u32,
    operation: Option<String>,
    context: BTreeMap<String, String>,
}

impl CallSite {
    pub fn new(function: &str, package: &str, file: &str, line: u32) -> Self {
        Self {
            function: function.to_string(),
            package: package.to_string(),
            file: file.to_string(),
            line,
            operation: None,
            context: BTreeMap::new(),
        }
    }

    /// Site of the caller of a `#[track_caller]` function
    #[track_caller]
    pub fn caller() -> Self {
        let loc = Location::caller();
        let package = std::path::Path::new(loc.file())
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown");
        Self::new(package, package, loc.file(), loc.line())
    }

    pub fn operation(mut self, op: impl Into<String>) -> Self {
        self.operation = Some(op.into());
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.context.insert(key.into(), value.to_string());
        self
    }

    fn into_call(self) -> FunctionCall {
        FunctionCall {
            function: self.function,
            package: self.package,
            file: self.file,
            line: self.line,
            timestamp: Utc::now(),
            operation: self.operation,
            context: self.context,
        }
    }
}

/// Short name of the enclosing function
#[macro_export]
macro_rules! function_name {
    () => {{
        fn f() {}
        fn type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        let name = type_name_of(f);
        let name = name.strip_suffix("::f").unwrap_or(name);
        let name = name.trim_end_matches("::{{closure}}");
        match name.rfind("::") {
            Some(pos) => &name[pos + 2..],
            None => name,
        }
    }};
}

/// Track an error at the current function, optionally with context pairs
///
/// ```
/// use manga_fetcher::{track, error::EngineError};
///
/// let err = track!(EngineError::NotFound("chapter".into()), "chapter_id" => "abc");
/// assert_eq!(err.call_chain()[0].context["chapter_id"], "abc");
/// ```
#[macro_export]
macro_rules! track {
    ($err:expr) => {
        $crate::error::TrackedError::track_at(
            $err,
            $crate::error::CallSite::new($crate::function_name!(), module_path!(), file!(), line!()),
        )
    };
    ($err:expr, $($key:expr => $value:expr),+ $(,)?) => {{
        let site = $crate::error::CallSite::new($crate::function_name!(), module_path!(), file!(), line!())
            $(.with($key, $value))+;
        $crate::error::TrackedError::track_at($err, site)
    }};
}

/// An error with a category, a call chain and context
pub struct TrackedError {
    original: BoxError,
    category: ErrorCategory,
    chain: Vec<FunctionCall>,
    context: BTreeMap<String, String>,
    user_message: Option<String>,
    backtrace: Option<String>,
}

impl TrackedError {
    #[track_caller]
    pub fn track<E: Into<BoxError>>(err: E) -> Self {
        Self::track_at(err, CallSite::caller())
    }

    /// Append a hop to an existing tracked error, or start tracking a new one
    pub fn track_at<E: Into<BoxError>>(err: E, site: CallSite) -> Self {
        let boxed: BoxError = err.into();
        match boxed.downcast::<TrackedError>() {
            Ok(mut tracked) => {
                tracked.chain.push(site.into_call());
                *tracked
            }
            Err(original) => {
                let category = infer_category(original.as_ref());
                TrackedError {
                    original,
                    category,
                    chain: vec![site.into_call()],
                    context: BTreeMap::new(),
                    user_message: None,
                    backtrace: None,
                }
            }
        }
    }

    /// Convert a caught panic payload
    #[track_caller]
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        let mut err = Self::track(EngineError::Panic(message));
        err.backtrace = Some(Backtrace::force_capture().to_string());
        err
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    pub fn call_chain(&self) -> &[FunctionCall] {
        &self.chain
    }

    pub fn context(&self) -> &BTreeMap<String, String> {
        &self.context
    }

    pub fn user_message(&self) -> Option<&str> {
        self.user_message.as_deref()
    }

    pub fn backtrace(&self) -> Option<&str> {
        self.backtrace.as_deref()
    }

    pub fn original(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self.original.as_ref()
    }

    pub fn engine_error(&self) -> Option<&EngineError> {
        self.original.downcast_ref::<EngineError>()
    }

    /// Deepest error reachable through `source()`
    pub fn root_cause(&self) -> &(dyn StdError + 'static) {
        let mut current: &(dyn StdError + 'static) = self.original.as_ref();
        while let Some(next) = current.source() {
            current = next;
        }
        current
    }

    pub fn provider_id(&self) -> Option<&str> {
        self.context.get("provider").map(|s| s.as_str())
    }

    pub fn http_status(&self) -> Option<u16> {
        match self.engine_error() {
            Some(EngineError::HttpStatus { status, .. }) => Some(*status),
            _ => self.context.get("status").and_then(|s| s.parse().ok()),
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self.engine_error() {
            Some(EngineError::HttpStatus { url, .. }) | Some(EngineError::Transport { url, .. }) => {
                Some(url.as_str())
            }
            _ => self.context.get("url").map(|s| s.as_str()),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.context.insert(key.into(), value.to_string());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.user_message = Some(message.into());
        self
    }

    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = category;
        self
    }

    /// Multi-section report for the terminal
    pub fn format_human(&self, show_chain: bool, show_backtrace: bool) -> String {
        let mut out = format!("[{}] {}", self.category.prefix(), self);
        if self.user_message.is_some() {
            out.push_str(&format!("\n  Cause: {}", self.original));
        }
        out.push_str(&format!("\n  Hint: {}", self.category.guidance()));

        let mut details = Vec::new();
        if let Some(p) = self.provider_id() {
            details.push(format!("provider={}", p));
        }
        if let Some(u) = self.url() {
            details.push(format!("url={}", u));
        }
        if let Some(s) = self.http_status() {
            details.push(format!("status={}", s));
        }
        if !details.is_empty() {
            out.push_str(&format!("\n  Context: {}", details.join(" ")));
        }

        if show_chain && !self.chain.is_empty() {
            out.push_str("\n  Call chain:");
            for (i, call) in self.chain.iter().enumerate() {
                out.push_str(&format!(
                    "\n    {}. {} ({}) {}:{} at {}",
                    i + 1,
                    call.function,
                    call.package,
                    call.file,
                    call.line,
                    call.timestamp.format("%H:%M:%S%.3f")
                ));
                if let Some(op) = &call.operation {
                    out.push_str(&format!(" [{}]", op));
                }
                for (k, v) in &call.context {
                    out.push_str(&format!("\n         {}={}", k, v));
                }
            }
        }
        if show_backtrace {
            if let Some(bt) = &self.backtrace {
                out.push_str("\n  Stack:\n");
                out.push_str(bt);
            }
        }
        out
    }

    pub fn to_json(&self) -> serde_json::Value {
        let report = ErrorReport {
            category: self.category,
            message: self.to_string(),
            original: self.original.to_string(),
            root_cause: self.root_cause().to_string(),
            user_message: self.user_message.clone(),
            provider: self.provider_id().map(String::from),
            url: self.url().map(String::from),
            status: self.http_status(),
            context: self.context.clone(),
            call_chain: self.chain.clone(),
            backtrace: self.backtrace.clone(),
        };
        serde_json::to_value(report).unwrap_or_else(|_| serde_json::json!({ "message": self.to_string() }))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorReport {
    category: ErrorCategory,
    message: String,
    original: String,
    root_cause: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<u16>,
    context: BTreeMap<String, String>,
    call_chain: Vec<FunctionCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    backtrace: Option<String>,
}

fn infer_category(err: &(dyn StdError + Send + Sync + 'static)) -> ErrorCategory {
    if let Some(e) = err.downcast_ref::<EngineError>() {
        return e.category();
    }
    if let Some(e) = err.downcast_ref::<reqwest::Error>() {
        if e.is_timeout() {
            return ErrorCategory::Timeout;
        }
        if e.is_connect() || e.is_request() {
            return ErrorCategory::Network;
        }
        if e.is_decode() {
            return ErrorCategory::Parsing;
        }
    }
    if err.downcast_ref::<serde_json::Error>().is_some() {
        return ErrorCategory::Parsing;
    }
    if let Some(e) = err.downcast_ref::<std::io::Error>() {
        return match e.kind() {
            std::io::ErrorKind::TimedOut => ErrorCategory::Timeout,
            _ => ErrorCategory::Filesystem,
        };
    }

    // Scan the whole source chain, outermost first
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        let category = ErrorCategory::from_message(&e.to_string());
        if category != ErrorCategory::Unknown {
            return category;
        }
        current = e.source();
    }
    ErrorCategory::Unknown
}

impl fmt::Display for TrackedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.user_message {
            Some(m) => f.write_str(m),
            None => write!(f, "{}", self.original),
        }
    }
}

impl fmt::Debug for TrackedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedError")
            .field("category", &self.category)
            .field("original", &self.original)
            .field("context", &self.context)
            .field("chain", &self.chain.len())
            .finish()
    }
}

impl StdError for TrackedError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.original.as_ref())
    }
}

impl From<EngineError> for TrackedError {
    #[track_caller]
    fn from(err: EngineError) -> Self {
        TrackedError::track(err)
    }
}

/// Track with the network category
#[track_caller]
pub fn tn<E: Into<BoxError>>(err: E) -> TrackedError {
    TrackedError::track(err).with_category(ErrorCategory::Network)
}

/// Track with the provider category and id
#[track_caller]
pub fn tp<E: Into<BoxError>>(err: E, provider_id: &str) -> TrackedError {
    let err = TrackedError::track(err);
    // Keep a more specific category when one is already known
    let category = match err.category() {
        ErrorCategory::Unknown => ErrorCategory::Provider,
        c => c,
    };
    err.with_category(category).with_context("provider", provider_id)
}

/// Track with a user-facing message
#[track_caller]
pub fn tm<E: Into<BoxError>>(err: E, message: impl Into<String>) -> TrackedError {
    TrackedError::track(err).with_message(message)
}

/// Track with extra context
#[track_caller]
pub fn tc<E: Into<BoxError>>(err: E, context: &[(&str, &str)]) -> TrackedError {
    context
        .iter()
        .fold(TrackedError::track(err), |e, (k, v)| e.with_context(*k, *v))
}

/// Shorthands for tracking at `?` sites
pub trait ResultExt<T> {
    fn tracked(self) -> Result<T>;
    fn tracked_network(self) -> Result<T>;
    fn tracked_provider(self, provider_id: &str) -> Result<T>;
    fn tracked_message(self, message: impl Into<String>) -> Result<T>;
    fn tracked_context(self, key: &str, value: impl ToString) -> Result<T>;
}

impl<T, E: Into<BoxError>> ResultExt<T> for std::result::Result<T, E> {
    #[track_caller]
    fn tracked(self) -> Result<T> {
        match self {
            Ok(v) => Ok(v),
            Err(e) => Err(TrackedError::track(e)),
        }
    }

    #[track_caller]
    fn tracked_network(self) -> Result<T> {
        match self {
            Ok(v) => Ok(v),
            Err(e) => Err(tn(e)),
        }
    }

    #[track_caller]
    fn tracked_provider(self, provider_id: &str) -> Result<T> {
        match self {
            Ok(v) => Ok(v),
            Err(e) => Err(tp(e, provider_id)),
        }
    }

    #[track_caller]
    fn tracked_message(self, message: impl Into<String>) -> Result<T> {
        match self {
            Ok(v) => Ok(v),
            Err(e) => Err(tm(e, message)),
        }
    }

    #[track_caller]
    fn tracked_context(self, key: &str, value: impl ToString) -> Result<T> {
        match self {
            Ok(v) => Ok(v),
            Err(e) => Err(TrackedError::track(e).with_context(key, value)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inner() -> Result<()> {
        Err(track!(EngineError::Parsing {
            what: "manga".into(),
            message: "missing field".into(),
            sample: None,
        }))
    }

    fn outer() -> Result<()> {
        inner().map_err(|e| track!(e, "step" => "outer"))
    }

    #[test]
    fn test_chain_grows_across_hops() {
        let err = outer().unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Parsing);
        assert_eq!(err.call_chain().len(), 2);
        assert_eq!(err.call_chain()[0].function, "inner");
        assert_eq!(err.call_chain()[1].function, "outer");
        assert_eq!(err.call_chain()[1].context["step"], "outer");
    }

    #[test]
    fn test_keyword_categories() {
        let cases = [
            ("dial tcp 1.2.3.4: connection refused", ErrorCategory::Network),
            ("context deadline exceeded", ErrorCategory::Timeout),
            ("chapter not found", ErrorCategory::NotFound),
            ("403 Forbidden", ErrorCategory::Auth),
            ("429 too many requests", ErrorCategory::RateLimit),
            ("invalid character '<' looking for value", ErrorCategory::Parsing),
            ("open /x: permission denied", ErrorCategory::Filesystem),
            ("something odd", ErrorCategory::Unknown),
        ];
        for (msg, expected) in cases {
            let err = TrackedError::track(msg.to_string());
            assert_eq!(err.category(), expected, "message: {}", msg);
        }
    }

    #[test]
    fn test_root_cause_is_deepest() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = TrackedError::track(EngineError::io("/tmp/x", io));
        assert_eq!(err.category(), ErrorCategory::Filesystem);
        assert_eq!(err.root_cause().to_string(), "denied");
    }

    #[test]
    fn test_http_status_categories() {
        let make = |status| {
            TrackedError::track(EngineError::HttpStatus {
                status,
                url: "https://example.com/manga/1".into(),
                body_sample: String::new(),
                resource_type: None,
                resource_id: None,
            })
        };
        assert_eq!(make(401).category(), ErrorCategory::Auth);
        assert_eq!(make(404).category(), ErrorCategory::NotFound);
        assert_eq!(make(429).category(), ErrorCategory::RateLimit);
        assert_eq!(make(422).category(), ErrorCategory::Provider);
        assert_eq!(make(503).category(), ErrorCategory::Network);
        assert_eq!(make(404).http_status(), Some(404));
    }

    #[test]
    fn test_helpers_enrich() {
        let err = tp("boom", "mgd");
        assert_eq!(err.category(), ErrorCategory::Provider);
        assert_eq!(err.provider_id(), Some("mgd"));

        let err = tm("boom", "Could not load manga");
        assert_eq!(err.to_string(), "Could not load manga");
        assert_eq!(err.original().to_string(), "boom");

        let err = tc("boom", &[("url", "https://x")]);
        assert_eq!(err.url(), Some("https://x"));

        let err = tn("boom");
        assert_eq!(err.category(), ErrorCategory::Network);
    }

    #[test]
    fn test_panic_conversion() {
        let payload = std::panic::catch_unwind(|| panic!("worker exploded")).unwrap_err();
        let err = TrackedError::from_panic(payload);
        assert_eq!(err.category(), ErrorCategory::Panic);
        assert!(err.to_string().contains("worker exploded"));
        assert!(err.backtrace().is_some());
    }

    #[test]
    fn test_formatting() {
        let err = outer().unwrap_err().with_context("provider", "mgd");
        let text = err.format_human(true, false);
        assert!(text.starts_with("[Parsing Error]"));
        assert!(text.contains("provider=mgd"));
        assert!(text.contains("Call chain:"));

        let json = err.to_json();
        assert_eq!(json["category"], "parsing");
        assert_eq!(json["callChain"].as_array().map(|a| a.len()), Some(2));
    }
}
