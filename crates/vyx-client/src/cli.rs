//! CLI arguments, logging setup, and shutdown signal handling.

use std::io;

use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use vyx_config::LoggingConfig;

/// Vyx client CLI arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "vyx-client", version, about = "Vyx bandwidth-sharing agent")]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Verbose connection logs (includes relay destination addresses).
    #[arg(long)]
    pub verbose: bool,

    /// Log level override, e.g. "debug" or "vyx_session=trace".
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format: pretty (default), compact, or json.
    #[arg(long)]
    pub log_format: Option<String>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the agent (default).
    Run,
    /// Sign in with email and password.
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    /// Create an account and sign in.
    Register {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    /// Sign out and delete the stored token.
    Logout,
}

/// Initialize the tracing subscriber.
pub fn init_tracing(config: &LoggingConfig) {
    let base_level = config.level.as_deref().unwrap_or("info");
    let filter = EnvFilter::try_new(base_level).unwrap_or_else(|_| EnvFilter::new("info"));

    let format = config.format.as_deref().unwrap_or("pretty");
    let output = config.output.as_deref().unwrap_or("stderr");

    match (format, output) {
        ("json", "stdout") => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(io::stdout))
                .init();
        }
        ("json", _) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(io::stderr))
                .init();
        }
        ("compact", "stdout") => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().compact().with_writer(io::stdout))
                .init();
        }
        ("compact", _) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().compact().with_writer(io::stderr))
                .init();
        }
        (_, "stdout") => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(io::stdout))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(io::stderr))
                .init();
        }
    }
}

/// Wait for shutdown signals (SIGTERM, SIGINT).
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
