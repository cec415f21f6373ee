// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

use veneur_server::{Config, Server};

/// Telemetry aggregation daemon: pre-aggregates statsd metrics over fixed
/// windows and forwards derived series to the configured sinks.
#[derive(Parser)]
#[command(version)]
struct Cli {
    /// The config file to read for settings.
    #[arg(short = 'f', value_name = "PATH")]
    config: PathBuf,
}

fn init_logging() {
    let log_level = std::env::var("VENEUR_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or_else(|_| "info".to_string());
    let env_filter = format!("h2=off,hyper=off,rustls=off,{log_level}");

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::try_new(env_filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_level(true)
        .with_target(true)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("logging subsystem was already initialized");
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let cli = Cli::parse();
    debug!("reading configuration from {}", cli.config.display());

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("error reading config file: {e}");
            return ExitCode::from(1);
        }
    };

    let server = match Server::start(config).await {
        Ok(server) => server,
        Err(e) => {
            error!("could not initialize server: {e}");
            return ExitCode::from(e.exit_code() as u8);
        }
    };

    match server.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("server terminated: {e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
