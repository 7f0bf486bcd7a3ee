// ABOUTME: Binary entrypoint: parses Config, installs tracing, runs the supervisor to completion
// ABOUTME: Exit code is 0 on clean shutdown, non-zero on any startup or supervisor failure

use clap::Parser;
use rtu_broker::config::Config;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::parse();

    if let Err(e) = rtu_broker::supervisor::run(config).await {
        tracing::error!(error = %e, "fatal startup failure");
        std::process::exit(1);
    }
}
