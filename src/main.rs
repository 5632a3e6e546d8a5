mod config;
mod context;
mod envelope;
mod error;
mod frame;
mod generator;
mod injector;
mod interceptor;
mod orchestrator;
mod radio;
mod registry;

use clap::Parser;
use tracing_subscriber::EnvFilter;

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() {
    let cli = config::Cli::parse();
    init_tracing(cli.debug);
    let config = config::Config::from(cli);

    if let Err(e) = orchestrator::run(config).await {
        tracing::error!(error = %e, "fatal server error");
        std::process::exit(1);
    }
}
