//! Fleet Warden Daemon
//!
//! Starts the configured agents phase by phase, then keeps them healthy until
//! SIGINT/SIGTERM.

use anyhow::Result;
use clap::Parser;
use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use wardend::config::CONFIG_PATH;
use wardend::{server, StartupOptions, Warden, WardenConfig, WardenError};

#[derive(Parser)]
#[command(name = "wardend")]
#[command(about = "Fleet Warden - dependency-aware agent orchestrator", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (TOML, or YAML by extension)
    #[arg(long, default_value = CONFIG_PATH)]
    config: PathBuf,

    /// Only manage agents of this group
    #[arg(long)]
    group: Option<String>,

    /// Only start the first N phases
    #[arg(long)]
    phases: Option<usize>,

    /// Override the API bind host
    #[arg(long)]
    host: Option<String>,

    /// Override the API bind port
    #[arg(long)]
    port: Option<u16>,

    /// Monitor an already running fleet instead of launching it
    #[arg(long)]
    no_launch: bool,
}

fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Resolves on SIGINT or SIGTERM. The SIGTERM handler is installed by the
/// call itself, so a signal arriving during startup is not lost.
fn shutdown_signal() -> impl Future<Output = ()> {
    #[cfg(unix)]
    let term = {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(term) => Some(term),
            Err(e) => {
                error!("Cannot install SIGTERM handler: {}", e);
                None
            }
        }
    };

    async move {
        #[cfg(unix)]
        if let Some(mut term) = term {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
            return;
        }
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn run(cli: Cli) -> Result<()> {
    let stop = shutdown_signal();

    let mut config = if cli.config.exists() {
        WardenConfig::load_from_path(&cli.config)?
    } else {
        WardenConfig::default()
    };
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    info!(
        node = %config.node.name,
        role = %config.node.role,
        "Fleet Warden v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    let addr = config.server.bind_addr();
    let options = StartupOptions {
        group: cli.group,
        phases: cli.phases,
        no_launch: cli.no_launch,
    };
    let warden = Arc::new(Warden::build(config, options).await?);
    let listener = server::bind(&addr).await?;

    warden.run(listener, stop).await
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // The config's log level is only known after loading; RUST_LOG wins
    let level = WardenConfig::load_from_path(&cli.config)
        .map(|c| c.log_level)
        .unwrap_or_else(|_| "info".to_string());
    init_logging(&level);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<WardenError>() {
                Some(err) if err.is_fatal() => error!("Configuration rejected: {}", err),
                _ => error!("Warden failed: {:#}", e),
            }
            ExitCode::FAILURE
        }
    }
}
