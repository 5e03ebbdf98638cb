//! Line-delimited JSON-RPC 2.0 over stdin/stdout
//!
//! One request per line, one response per line. Methods are named
//! `<Service>.<Method>` and take a single arguments object (a one-element
//! params array is unwrapped). Application failures use code `-32000` with
//! the numeric application code in `error.data.code`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::context::RequestContext;
use crate::engine::Engine;
use crate::error::{EngineError, ErrorCategory, TrackedError};
use crate::helpers::parse_manga_id;
use crate::models::SearchOptions;
use crate::output::{DownloadView, InfoView, SearchView};

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const APPLICATION_ERROR: i64 = -32000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }
}

impl From<TrackedError> for RpcError {
    fn from(err: TrackedError) -> Self {
        // Bad user input is reported as a params error
        if let Some(EngineError::InvalidInput(msg)) = err.engine_error() {
            return RpcError::invalid_params(msg.clone());
        }
        let mut data = err.to_json();
        if let Value::Object(map) = &mut data {
            map.insert("code".to_string(), json!(application_code(&err)));
        }
        RpcError {
            code: APPLICATION_ERROR,
            message: err.to_string(),
            data: Some(data),
        }
    }
}

/// Application code for an error: 1xxx input, 2xxx resource, 3xxx operation,
/// 4xxx network, 5xxx timeout, 6xxx auth, 7xxx parsing, 8xxx filesystem,
/// 9xxx download, 10xxx system
pub fn application_code(err: &TrackedError) -> i64 {
    if let Some(e) = err.engine_error() {
        match e {
            EngineError::InvalidInput(_) => return 1001,
            EngineError::DuplicateProvider(_) => return 1002,
            EngineError::Cancelled => return 3001,
            EngineError::UnknownEndpoint(_) => return 3002,
            EngineError::HttpStatus { status, .. } if *status >= 500 => return 4002,
            EngineError::PathNotFound(_) | EngineError::TypeMismatch { .. } => return 7002,
            _ => {}
        }
    }
    match err.category() {
        ErrorCategory::NotFound => 2001,
        ErrorCategory::Provider => 3003,
        ErrorCategory::Network => 4001,
        ErrorCategory::RateLimit => 4029,
        ErrorCategory::Timeout => 5001,
        ErrorCategory::Auth => 6001,
        ErrorCategory::Parsing => 7001,
        ErrorCategory::Filesystem => 8001,
        ErrorCategory::Download => 9001,
        ErrorCategory::Panic => 10001,
        ErrorCategory::Unknown => 10000,
    }
}

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    jsonrpc: Option<String>,
    method: String,
    #[serde(default)]
    params: Value,
    /// Absent for notifications
    #[serde(default)]
    id: Option<Value>,
}

#[derive(Debug, Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
    id: Value,
}

impl RpcResponse {
    fn reply(id: Value, outcome: Result<Value, RpcError>) -> Self {
        let (result, error) = match outcome {
            Ok(v) => (Some(v), None),
            Err(e) => (None, Some(e)),
        };
        Self {
            jsonrpc: JSONRPC_VERSION,
            result,
            error,
            id,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchParams {
    pub query: String,
    pub providers: Vec<String>,
    pub provider: Option<String>,
    pub limit: Option<usize>,
    pub pages: Option<usize>,
    pub max_results: Option<usize>,
    pub sort: Option<String>,
    pub fields: Vec<String>,
    pub filters: HashMap<String, String>,
    pub concurrency: Option<usize>,
}

impl SearchParams {
    fn provider_ids(&self) -> Vec<String> {
        let mut ids = self.providers.clone();
        ids.extend(self.provider.iter().cloned());
        ids
    }

    fn options(&self) -> Result<SearchOptions, EngineError> {
        let mut options = SearchOptions::new(self.query.trim());
        if let Some(limit) = self.limit {
            options.limit = limit;
        }
        if let Some(pages) = self.pages {
            options.max_pages = pages.max(1);
        }
        options.max_results = self.max_results;
        options.fields = self.fields.clone();
        options.filters = self
            .filters
            .iter()
            .map(|(k, v)| (k.to_lowercase(), v.clone()))
            .collect();
        if let Some(sort) = &self.sort {
            options.sort = sort.parse()?;
        }
        Ok(options)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InfoParams {
    pub id: String,
    pub language: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DownloadParams {
    pub id: Option<String>,
    pub ids: Vec<String>,
    pub output: Option<PathBuf>,
    pub volume: Option<f64>,
    pub concurrency: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListParams {
    pub providers: Vec<String>,
    pub provider: Option<String>,
    pub limit: Option<usize>,
    pub pages: Option<usize>,
}

fn params<T: DeserializeOwned>(args: Value) -> Result<T, RpcError> {
    let args = match args {
        Value::Null => json!({}),
        Value::Array(mut items) if items.len() == 1 => items.remove(0),
        other => other,
    };
    serde_json::from_value(args).map_err(|e| RpcError::invalid_params(e.to_string()))
}

pub struct RpcServer {
    engine: Arc<Engine>,
    ctx: RequestContext,
}

impl RpcServer {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            ctx: RequestContext::new(),
        }
    }

    /// Serve until the reader is exhausted or the server context is cancelled
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        loop {
            let line = tokio::select! {
                _ = self.ctx.token().cancelled() => break,
                line = lines.next_line() => line?,
            };
            let Some(line) = line else { break };
            if let Some(response) = self.handle_line(&line).await {
                writer.write_all(response.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await?;
            }
        }
        log::info!("JSON-RPC input closed");
        Ok(())
    }

    pub fn shutdown(&self) {
        self.ctx.cancel();
    }

    /// Response line for one request line; `None` for blanks and notifications
    pub async fn handle_line(&self, line: &str) -> Option<String> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let raw: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                let response = RpcResponse::reply(Value::Null, Err(RpcError::new(PARSE_ERROR, e.to_string())));
                return serde_json::to_string(&response).ok();
            }
        };
        let request: RpcRequest = match serde_json::from_value(raw.clone()) {
            Ok(r) => r,
            Err(e) => {
                let id = raw.get("id").cloned().unwrap_or(Value::Null);
                let response = RpcResponse::reply(id, Err(RpcError::new(INVALID_REQUEST, e.to_string())));
                return serde_json::to_string(&response).ok();
            }
        };
        if request.jsonrpc.as_deref().is_some_and(|v| v != JSONRPC_VERSION) {
            log::warn!("JSON-RPC request with version {:?}", request.jsonrpc);
        }

        log::debug!("rpc {}", request.method);
        let outcome = self.dispatch(&request.method, request.params).await;
        if let Err(e) = &outcome {
            log::warn!("rpc {} failed: {}", request.method, e.message);
        }
        let id = request.id?;
        serde_json::to_string(&RpcResponse::reply(id, outcome)).ok()
    }

    pub async fn dispatch(&self, method: &str, args: Value) -> Result<Value, RpcError> {
        match method {
            "VersionService.Get" => Ok(json!({
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            })),
            "ProvidersService.List" => Ok(json!(self.engine.provider_infos())),
            "ProvidersService.Stats" => Ok(json!(self.engine.stats())),
            "SearchService.Search" => self.search(params(args)?).await,
            "InfoService.Get" => self.info(params(args)?).await,
            "DownloadService.Chapter" | "DownloadService.Download" => self.download(params(args)?).await,
            "ListService.Latest" | "ListService.List" => self.list(params(args)?).await,
            other => Err(RpcError::new(METHOD_NOT_FOUND, format!("method '{}' not found", other))),
        }
    }

    async fn search(&self, p: SearchParams) -> Result<Value, RpcError> {
        if p.query.trim().is_empty() {
            return Err(RpcError::invalid_params("query is required"));
        }
        let options = p.options().map_err(|e| RpcError::invalid_params(e.to_string()))?;
        let ctx = match p.concurrency {
            Some(n) => self.ctx.clone().with_concurrency(n),
            None => self.ctx.clone(),
        };
        let results = self.engine.search(&ctx, &p.provider_ids(), &options).await?;
        Ok(SearchView::new(results, options.fields).to_json())
    }

    async fn list(&self, p: ListParams) -> Result<Value, RpcError> {
        let mut providers = p.providers;
        providers.extend(p.provider);
        let results = self
            .engine
            .list(&self.ctx, &providers, p.limit.unwrap_or(20), p.pages.unwrap_or(1).max(1))
            .await?;
        Ok(SearchView::new(results, Vec::new()).to_json())
    }

    async fn info(&self, p: InfoParams) -> Result<Value, RpcError> {
        let (provider_id, _) = parse_manga_id(&p.id).map_err(|e| RpcError::invalid_params(e.to_string()))?;
        let info = self.engine.get_manga(&self.ctx, &p.id).await?;
        let view = InfoView::new(&provider_id, info, p.language.as_deref());
        serde_json::to_value(view).map_err(|e| RpcError::new(APPLICATION_ERROR, e.to_string()))
    }

    async fn download(&self, p: DownloadParams) -> Result<Value, RpcError> {
        let mut ids = p.ids;
        ids.extend(p.id);
        if ids.is_empty() {
            return Err(RpcError::invalid_params("at least one chapter id is required"));
        }
        let output = p
            .output
            .unwrap_or_else(|| PathBuf::from(&self.engine.config().download_dir));
        let mut ctx = self.ctx.clone();
        if let Some(n) = p.concurrency {
            ctx = ctx.with_concurrency(n);
        }
        if let Some(v) = p.volume {
            ctx = ctx.with_volume(v);
        }

        let mut view = DownloadView::default();
        for id in ids {
            match self.engine.download_chapter(&ctx, &id, &output).await {
                Ok(report) => view.completed.push((id, report)),
                Err(e) => view.failed.push((id, e)),
            }
        }
        // A batch where nothing succeeded is reported as the first failure
        if view.completed.is_empty() {
            if let Some((_, e)) = std::mem::take(&mut view.failed).into_iter().next() {
                return Err(e.into());
            }
        }
        Ok(view.to_json())
    }
}
