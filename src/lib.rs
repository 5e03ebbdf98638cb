//! Provider execution engine for searching, inspecting and downloading manga
//!
//! Providers plug into a shared runtime: a retrying HTTP client behind a
//! per-host rate limiter, a DOM layer for HTML sources, a declarative API
//! invoker and extractor layer for JSON sources, pagination, a parallel
//! search fan-out and a chapter download coordinator. The [`engine::Engine`]
//! wires these together; the `cli` and `rpc` modules are thin shells on top.

pub mod api;
pub mod cache;
pub mod cli;
pub mod config;
pub mod context;
pub mod dom;
pub mod download;
pub mod engine;
pub mod error;
pub mod extractor;
pub mod helpers;
pub mod http_client;
pub mod language;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod output;
pub mod pagination;
pub mod provider;
pub mod providers;
pub mod rate_limiter;
pub mod registry;
pub mod rpc;
pub mod search;

pub use context::RequestContext;
pub use engine::{Engine, Services};
pub use error::{EngineError, ErrorCategory, Result, TrackedError};
pub use provider::Provider;
