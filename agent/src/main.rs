use std::path::Path;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use agent::config::{Config, DEFAULT_CONFIG_PATH};

#[tokio::main]
async fn main() {
    let config_path = config_path_from_args();
    let config = match Config::load(Path::new(&config_path)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load config {config_path}: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::registry()
        .with(EnvFilter::new(&config.logging.level))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .log_internal_errors(true)
                .with_target(false)
                .flatten_event(true)
                .with_span_list(false),
        )
        .init();

    info!(version = agent::VERSION, config = %config_path, "starting ghost agent");

    if let Err(e) = agent::main(config).await {
        error!(error = %e, "ghost agent terminated");
        std::process::exit(1);
    }
}

fn config_path_from_args() -> String {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(path) = args.next() {
                return path;
            }
        }
    }
    DEFAULT_CONFIG_PATH.to_string()
}
