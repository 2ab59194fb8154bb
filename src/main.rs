//! portrelay - TCP forwarders you can add, remove, start and stop at runtime
//!
//! Registers the forwarders from an optional bootstrap file, then serves the
//! control API until Ctrl+C.

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use portrelay_api::{ApiServer, ApiServerConfig};
use portrelay_core::{ForwarderConfig, Registry, RegistryConfig, TracingSink};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::BootstrapConfig;

/// Runtime-controllable TCP forwarder
#[derive(Parser, Debug)]
#[command(name = "portrelay")]
#[command(about = "Relay local TCP ports to remote addresses, managed over an HTTP control API")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
#[command(long_about = r#"
portrelay listens on local addresses and relays every connection to a fixed
remote address. Forwarders are managed at runtime through POST /api/control.

EXAMPLES:
  # Serve the control API with one forwarder from a bootstrap file
  portrelay --token $TOKEN --config portrelay.yml

  # Add a forwarder at runtime
  curl -X POST http://127.0.0.1:9000/api/control \
    -d '{"token":"'$TOKEN'","type":"add","name":"mysql","local":"3307","remote":"127.0.0.1:3306"}'

ENVIRONMENT VARIABLES:
  PORTRELAY_API_ADDR     Control API bind address
  PORTRELAY_TOKEN        Shared secret for control requests
  PORTRELAY_CONFIG       Bootstrap file (YAML)
"#)]
struct Cli {
    /// Control API bind address
    #[arg(long, env = "PORTRELAY_API_ADDR", default_value = "127.0.0.1:9000")]
    api_addr: SocketAddr,

    /// Shared secret every control request must carry
    #[arg(long, env = "PORTRELAY_TOKEN", hide_env_values = true)]
    token: String,

    /// Remote dial timeout in seconds (default: 3)
    #[arg(long, env = "PORTRELAY_DIAL_TIMEOUT_SECS")]
    dial_timeout_secs: Option<u64>,

    /// Refuse to register forwarders whose remote is unreachable
    #[arg(long, env = "PORTRELAY_FAIL_FAST")]
    fail_fast: bool,

    /// Log every relayed chunk (expensive, debugging only)
    #[arg(long, env = "PORTRELAY_TRACE_PAYLOAD")]
    trace_payload: bool,

    /// How many times a stop probes the listener before giving up
    #[arg(long, default_value = "10")]
    shutdown_poll_attempts: u32,

    /// Bootstrap file (YAML) listing forwarders to register at startup
    #[arg(long, short = 'c', env = "PORTRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Setup logging; RUST_LOG wins over --log-level when set
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(log_level)
            .with_context(|| format!("Invalid log level: {}", log_level))?,
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Merge CLI flags with the bootstrap file defaults, flags taking precedence
fn build_registry_config(cli: &Cli, bootstrap: &BootstrapConfig) -> Result<RegistryConfig> {
    let dial_timeout_secs = cli
        .dial_timeout_secs
        .or(bootstrap.defaults.dial_timeout_secs)
        .unwrap_or(3);
    if dial_timeout_secs == 0 {
        anyhow::bail!("Dial timeout must be greater than 0");
    }
    if cli.shutdown_poll_attempts == 0 {
        anyhow::bail!("Shutdown poll attempts must be greater than 0");
    }

    Ok(RegistryConfig {
        forwarder: ForwarderConfig {
            dial_timeout: Duration::from_secs(dial_timeout_secs),
            fail_fast: cli.fail_fast || bootstrap.defaults.fail_fast.unwrap_or(false),
            shutdown_poll_attempts: cli.shutdown_poll_attempts,
            trace_payload: cli.trace_payload,
            ..ForwarderConfig::default()
        },
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        return;
    }
    info!("Received Ctrl+C, shutting down...");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level)?;

    if cli.token.is_empty() {
        anyhow::bail!("Token is required (use --token or PORTRELAY_TOKEN)");
    }

    let bootstrap = match &cli.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            BootstrapConfig::load(path)?
        }
        None => BootstrapConfig::default(),
    };

    let registry_config = build_registry_config(&cli, &bootstrap)?;
    info!(
        "Dial timeout: {:?}, fail fast: {}",
        registry_config.forwarder.dial_timeout, registry_config.forwarder.fail_fast
    );
    if registry_config.forwarder.trace_payload {
        warn!("Payload tracing is enabled: every relayed chunk is logged");
    }

    let registry = Arc::new(Registry::new(
        registry_config,
        Arc::new(TracingSink::new("portrelay_core")),
    ));

    for entry in bootstrap.enabled_forwarders() {
        match registry.add(&entry.name, &entry.local, &entry.remote).await {
            Ok(()) => info!(
                "Forwarder {} ready: {} -> {}",
                entry.name, entry.local, entry.remote
            ),
            Err(e) => error!("Failed to add forwarder {}: {}", entry.name, e),
        }
    }

    let server = ApiServer::new(
        ApiServerConfig {
            bind_addr: cli.api_addr,
            token: cli.token.clone(),
        },
        registry.clone(),
    );

    let served = server.start(shutdown_signal()).await;

    registry.shutdown().await;
    info!("portrelay stopped");

    served
}
