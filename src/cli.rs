//! Command-line surface
//!
//! Each command maps onto one engine operation. Results print as plain text,
//! or as the `{status, data?, error?}` envelope under `--api-mode`.

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::Config;
use crate::context::RequestContext;
use crate::engine::Engine;
use crate::error::{EngineError, Result, ResultExt, TrackedError};
use crate::helpers::parse_manga_id;
use crate::models::{SearchOptions, SortOrder};
use crate::output::{envelope_err, envelope_ok, render_providers, render_stats, DownloadView, InfoView, SearchView};
use crate::rpc::RpcServer;

/// Search, inspect and download manga chapters from several sources
#[derive(Parser, Debug)]
#[command(name = "manga-fetcher")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Print results as a JSON envelope
    #[arg(long, global = true)]
    pub api_mode: bool,

    /// Debug logging and full error reports
    #[arg(long, global = true)]
    pub debug: bool,

    /// Include the call chain in error output
    #[arg(long, global = true)]
    pub verbose_errors: bool,

    /// Configuration file (defaults to ./config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List registered providers
    Providers {
        /// Show request metrics collected in this process
        #[arg(long)]
        stats: bool,
    },

    /// Search every provider, or the ones given with --provider
    Search {
        query: String,

        #[arg(short, long = "provider", value_name = "ID")]
        providers: Vec<String>,

        /// Results per page and provider
        #[arg(short, long, default_value_t = 20)]
        limit: usize,

        #[arg(long, default_value_t = 1)]
        pages: usize,

        /// Cap on results across all providers
        #[arg(long)]
        max_results: Option<usize>,

        /// relevance, name, author, status, popularity, newest or updated
        #[arg(long, default_value = "relevance")]
        sort: String,

        /// Only these fields in --api-mode output
        #[arg(long, value_delimiter = ',')]
        fields: Vec<String>,

        /// key=value pairs: title, author, status, tag
        #[arg(long)]
        filter: Option<String>,

        /// Show alternate titles
        #[arg(long)]
        alt_titles: bool,

        /// Do not restrict results to series with English chapters
        #[arg(long)]
        all_langs: bool,

        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Latest updates
    List {
        #[arg(short, long = "provider", value_name = "ID")]
        providers: Vec<String>,

        #[arg(short, long, default_value_t = 20)]
        limit: usize,

        #[arg(long, default_value_t = 1)]
        pages: usize,
    },

    /// Series details and chapter list for <provider>:<manga id>
    Info {
        id: String,

        /// Comma-separated language codes or names; `unknown` matches chapters without one
        #[arg(long)]
        language: Option<String>,

        /// List the languages chapters are available in
        #[arg(long)]
        show_languages: bool,
    },

    /// Download one or more <provider>:<chapter id>
    Download {
        #[arg(required = true)]
        ids: Vec<String>,

        /// Output directory (defaults to download_dir from the config)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Volume number for the directory name
        #[arg(long = "vol")]
        volume: Option<f64>,

        #[arg(long)]
        concurrency: Option<usize>,

        /// Extra passes over pages that failed
        #[arg(long)]
        retry: Option<usize>,
    },

    /// Print the version
    Version,

    /// Serve JSON-RPC on stdin/stdout
    Rpc,
}

/// What a finished command hands back for printing
enum Outcome {
    Data { json: Value, text: String },
    /// Partial success; printed, then reported as a failure
    Partial { json: Value, text: String, error: TrackedError },
}

pub fn load_config(cli: &Cli) -> Result<Config> {
    match &cli.config {
        Some(path) => Config::load_from(path),
        None => Ok(Config::load()),
    }
}

/// Run a parsed command line; the return value is the process exit code
pub async fn run(cli: Cli) -> i32 {
    let mut config = match load_config(&cli) {
        Ok(c) => c,
        Err(e) => return report_error(&cli, &e),
    };
    if let Command::Download { retry: Some(n), .. } = &cli.command {
        config.download.retry_failed = *n;
    }
    if let Err(e) = crate::logging::init(&config.logging, cli.debug) {
        eprintln!("failed to initialize logging: {}", e);
    }

    let result: Result<Option<Outcome>> = async {
        let engine = Arc::new(Engine::new(config)?);
        crate::providers::register_builtin(&engine)?;
        execute(&cli, engine).await
    }
    .await;

    match result {
        Ok(None) => 0,
        Ok(Some(Outcome::Data { json, text })) => {
            print_data(&cli, json, &text);
            0
        }
        Ok(Some(Outcome::Partial { json, text, error })) => {
            print_data(&cli, json, &text);
            if !cli.api_mode {
                eprintln!("{}", format_error(&cli, &error));
            }
            1
        }
        Err(e) => report_error(&cli, &e),
    }
}

fn print_data(cli: &Cli, json: Value, text: &str) {
    if cli.api_mode {
        println!("{}", envelope_ok(json));
    } else {
        println!("{}", text);
    }
}

fn format_error(cli: &Cli, err: &TrackedError) -> String {
    if cli.debug {
        err.format_human(true, true)
    } else if cli.verbose_errors {
        err.format_human(true, false)
    } else {
        format!("[{}] {}", err.category().prefix(), err)
    }
}

fn report_error(cli: &Cli, err: &TrackedError) -> i32 {
    if cli.api_mode {
        println!("{}", envelope_err(err));
    } else {
        eprintln!("{}", format_error(cli, err));
    }
    1
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).tracked()
}

async fn execute(cli: &Cli, engine: Arc<Engine>) -> Result<Option<Outcome>> {
    let ctx = RequestContext::new();
    let outcome = match &cli.command {
        Command::Version => {
            let version = env!("CARGO_PKG_VERSION");
            Outcome::Data {
                json: json!({ "name": env!("CARGO_PKG_NAME"), "version": version }),
                text: format!("{} {}", env!("CARGO_PKG_NAME"), version),
            }
        }

        Command::Rpc => {
            let server = RpcServer::new(engine);
            let reader = tokio::io::BufReader::new(tokio::io::stdin());
            server
                .serve(reader, tokio::io::stdout())
                .await
                .map_err(|e| EngineError::io("stdio", e))
                .tracked()?;
            return Ok(None);
        }

        Command::Providers { stats } => {
            if *stats {
                let stats = engine.stats();
                Outcome::Data {
                    json: to_json(&stats)?,
                    text: render_stats(&stats),
                }
            } else {
                let infos = engine.provider_infos();
                Outcome::Data {
                    json: to_json(&infos)?,
                    text: render_providers(&infos),
                }
            }
        }

        Command::Search {
            query,
            providers,
            limit,
            pages,
            max_results,
            sort,
            fields,
            filter,
            alt_titles,
            all_langs,
            concurrency,
        } => {
            let options = SearchOptions {
                query: query.clone(),
                limit: *limit,
                max_pages: (*pages).max(1),
                max_results: *max_results,
                fields: fields.clone(),
                filters: match filter {
                    Some(f) => SearchOptions::parse_filters(f).tracked()?,
                    None => Default::default(),
                },
                sort: sort.parse::<SortOrder>().tracked()?,
                languages: if *all_langs { Vec::new() } else { vec!["en".to_string()] },
            };
            let ctx = match concurrency {
                Some(n) => ctx.with_concurrency(*n),
                None => ctx,
            };
            let results = engine.search(&ctx, providers, &options).await?;
            let view = SearchView::new(results, options.fields);
            Outcome::Data {
                json: view.to_json(),
                text: view.render(*alt_titles),
            }
        }

        Command::List { providers, limit, pages } => {
            let results = engine.list(&ctx, providers, *limit, (*pages).max(1)).await?;
            let view = SearchView::new(results, Vec::new());
            Outcome::Data {
                json: view.to_json(),
                text: view.render(false),
            }
        }

        Command::Info {
            id,
            language,
            show_languages,
        } => {
            let (provider_id, _) = parse_manga_id(id).tracked()?;
            let info = engine.get_manga(&ctx, id).await?;
            let view = InfoView::new(&provider_id, info, language.as_deref());
            Outcome::Data {
                json: to_json(&view)?,
                text: view.render(*show_languages),
            }
        }

        Command::Download {
            ids,
            output,
            volume,
            concurrency,
            ..
        } => {
            let output = output
                .clone()
                .unwrap_or_else(|| PathBuf::from(&engine.config().download_dir));
            let mut ctx = ctx;
            if let Some(n) = concurrency {
                ctx = ctx.with_concurrency(*n);
            }
            if let Some(v) = volume {
                ctx = ctx.with_volume(*v);
            }

            let mut view = DownloadView::default();
            for id in ids {
                log::info!("Downloading {}", id);
                match engine.download_chapter(&ctx, id, &output).await {
                    Ok(report) => view.completed.push((id.clone(), report)),
                    Err(e) => {
                        log::error!("{}: {}", id, e);
                        view.failed.push((id.clone(), e));
                    }
                }
            }
            let json = view.to_json();
            let text = view.render();
            match view.failed.into_iter().next() {
                Some((_, error)) => Outcome::Partial { json, text, error },
                None => Outcome::Data { json, text },
            }
        }
    };
    Ok(Some(outcome))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_search_flags() {
        let cli = Cli::try_parse_from([
            "manga-fetcher",
            "--api-mode",
            "search",
            "one piece",
            "-p",
            "mgd",
            "--limit",
            "5",
            "--fields",
            "title,status",
            "--filter",
            "status=ongoing",
        ])
        .unwrap();
        assert!(cli.api_mode);
        match cli.command {
            Command::Search {
                query,
                providers,
                limit,
                fields,
                filter,
                all_langs,
                ..
            } => {
                assert_eq!(query, "one piece");
                assert_eq!(providers, vec!["mgd"]);
                assert_eq!(limit, 5);
                assert_eq!(fields, vec!["title", "status"]);
                assert_eq!(filter.as_deref(), Some("status=ongoing"));
                assert!(!all_langs);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_download_flags() {
        let cli = Cli::try_parse_from([
            "manga-fetcher",
            "download",
            "mgd:c1",
            "mgd:c2",
            "--vol",
            "2",
            "--concurrency",
            "8",
            "--retry",
            "1",
            "--debug",
        ])
        .unwrap();
        assert!(cli.debug);
        match cli.command {
            Command::Download {
                ids,
                volume,
                concurrency,
                retry,
                output,
            } => {
                assert_eq!(ids, vec!["mgd:c1", "mgd:c2"]);
                assert_eq!(volume, Some(2.0));
                assert_eq!(concurrency, Some(8));
                assert_eq!(retry, Some(1));
                assert!(output.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_download_requires_an_id() {
        assert!(Cli::try_parse_from(["manga-fetcher", "download"]).is_err());
    }

    #[tokio::test]
    async fn test_bad_identifier_exits_non_zero() {
        let cli = Cli::try_parse_from(["manga-fetcher", "--api-mode", "info", "no-colon"]).unwrap();
        assert_eq!(run(cli).await, 1);
    }
}
