//! Fluxgate - IoT data gateway.
//!
//! # Usage
//!
//! ```bash
//! # Run with the default embedded bus and ./fluxgate.yaml
//! fluxgate
//!
//! # Explicit config, validation only
//! fluxgate --config /etc/fluxgate/gateway.yaml --check
//! ```
//!
//! # Environment Variables
//!
//! - `FLUXGATE_CONFIG`: config file path (CLI `--config` wins)
//! - `RUST_LOG`: log filter override (default from `gateway.log_level`)

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use fluxgate::config::{self, GatewayConfig};
use fluxgate::runtime::Runtime;

#[derive(Parser, Debug)]
#[command(name = "fluxgate")]
#[command(about = "Message-bus-centered IoT data gateway")]
#[command(version)]
struct CliArgs {
    /// Path to the gateway config (YAML or JSON)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,

    /// Override gateway.log_level
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();

    let config_path = config::resolve_path(args.config.clone());
    let loaded = match &config_path {
        Some(path) => GatewayConfig::load(path),
        None => Ok(GatewayConfig::default()),
    };
    let mut gateway_config = match loaded {
        Ok(c) => c,
        Err(e) => {
            eprintln!("fluxgate: configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(level) = args.log_level {
        gateway_config.gateway.log_level = level;
        if let Err(e) = gateway_config.validate() {
            eprintln!("fluxgate: configuration error: {e}");
            return ExitCode::FAILURE;
        }
    }

    if args.check {
        match &config_path {
            Some(path) => println!("fluxgate: {} OK", path.display()),
            None => println!("fluxgate: built-in defaults OK"),
        }
        return ExitCode::SUCCESS;
    }

    init_tracing(&gateway_config.gateway.log_level, args.json_logs);
    config::init(gateway_config.clone());

    match run(gateway_config, config_path).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Fatal gateway error");
            ExitCode::FAILURE
        }
    }
}

async fn run(
    gateway_config: GatewayConfig,
    config_path: Option<PathBuf>,
) -> anyhow::Result<()> {
    let mut runtime = Runtime::new(gateway_config, config_path);
    let cancel = runtime.cancel_token();

    // Ctrl-C / SIGTERM propagate through the root cancellation token.
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "SIGTERM handler install failed");
                    let _ = ctrl_c.await;
                    cancel.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => info!("SIGINT received"),
                _ = sigterm.recv() => info!("SIGTERM received"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("Ctrl-C received");
        }
        cancel.cancel();
    });

    runtime.start().await.context("runtime start")?;
    runtime.run().await
}
