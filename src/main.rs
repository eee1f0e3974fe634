//! Flagbox - practice instances with a restricted shell, over HTTP.
//!
//! Usage:
//!   flagbox serve [--port 3000] [--ttl-secs 1200] [--sandbox-root DIR]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use flagbox::config::{
    self, Config, DEFAULT_COMMAND_TIMEOUT_MS, DEFAULT_INSTANCE_TTL_SECS, DEFAULT_MAX_COMMAND_LEN,
    DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_SWEEP_INTERVAL_SECS,
};
use flagbox::{http_server, AppState, Sweeper};

#[derive(Parser, Debug)]
#[command(name = "flagbox")]
#[command(about = "Practice instances with a restricted shell and flag check")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve(ServeArgs),
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 3000)]
    port: u16,

    /// Directory holding per-instance sandboxes
    #[arg(long, env = "FLAGBOX_SANDBOX_ROOT")]
    sandbox_root: Option<PathBuf>,

    /// Instance lifetime in seconds
    #[arg(long, env = "FLAGBOX_TTL_SECS", default_value_t = DEFAULT_INSTANCE_TTL_SECS)]
    ttl_secs: u64,

    /// Seconds between expiry sweeps
    #[arg(long, env = "FLAGBOX_SWEEP_SECS", default_value_t = DEFAULT_SWEEP_INTERVAL_SECS)]
    sweep_secs: u64,

    /// Wall-clock limit per command in milliseconds
    #[arg(long, env = "FLAGBOX_COMMAND_TIMEOUT_MS", default_value_t = DEFAULT_COMMAND_TIMEOUT_MS)]
    command_timeout_ms: u64,

    /// Captured bytes per output stream
    #[arg(long, env = "FLAGBOX_MAX_OUTPUT_BYTES", default_value_t = DEFAULT_MAX_OUTPUT_BYTES)]
    max_output_bytes: usize,

    /// Maximum command length in characters
    #[arg(long, env = "FLAGBOX_MAX_COMMAND_LEN", default_value_t = DEFAULT_MAX_COMMAND_LEN)]
    max_command_len: usize,
}

impl ServeArgs {
    fn to_config(&self) -> Config {
        Config {
            sandbox_root: self
                .sandbox_root
                .clone()
                .unwrap_or_else(config::default_sandbox_root),
            instance_ttl: Duration::from_secs(self.ttl_secs),
            sweep_interval: Duration::from_secs(self.sweep_secs.max(1)),
            command_timeout: Duration::from_millis(self.command_timeout_ms),
            max_output_bytes: self.max_output_bytes,
            max_command_len: self.max_command_len,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    match args.command {
        Commands::Serve(serve) => run_serve(serve).await,
    }
}

async fn run_serve(args: ServeArgs) -> anyhow::Result<()> {
    let config = args.to_config();
    info!(?config, "Loaded configuration");

    let state = AppState::new(&config);
    let sweeper = Sweeper::start(state.store.clone(), config.sweep_interval);

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;

    http_server::serve(listener, state, shutdown_signal())
        .await
        .context("HTTP server failed")?;

    sweeper.stop().await;
    info!("Shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
