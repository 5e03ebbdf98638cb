use clap::Parser;
use manga_fetcher::cli::{self, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = tokio::select! {
        code = cli::run(cli) => code,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Interrupted");
            130
        }
    };
    std::process::exit(code);
}
