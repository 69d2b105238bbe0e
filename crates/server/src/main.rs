mod cli;
mod config;
mod routes;
mod services;
mod state;

use clap::Parser;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info,omm=debug,model_store=debug";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();

    //  Logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    if args.global.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    match args.command {
        Some(cli::Commands::Models(m)) => cli::models::execute(args.global, m).await,
        Some(cli::Commands::Import(a)) => cli::transfer::import(args.global, a).await,
        Some(cli::Commands::Export(a)) => cli::transfer::export(args.global, a).await,
        Some(cli::Commands::Prune) => cli::models::prune(args.global).await,
        Some(cli::Commands::Config(c)) => cli::config_cmd::execute(c).await,
        // Default: start HTTP server
        Some(cli::Commands::Serve(serve_args)) => {
            cli::serve::execute(args.global, serve_args).await
        }
        None => cli::serve::execute(args.global, cli::ServeArgs::default()).await,
    }
}
