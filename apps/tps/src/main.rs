//! Turnstile proxy server.
//!
//! Sits in front of an upstream application and sends every client
//! without a valid session through a Cloudflare Turnstile challenge.

mod logging;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal;
use tps_gate::{
    router, Gate, GateConfig, PgRequestLogger, RequestLogger, TracingRequestLogger,
};

use crate::logging::{init_logging, LogFormat, DEFAULT_FILTER};

const ENVIRONMENT_HELP: &str = "\
Environment:
  BIND_ADDR                 listen address, e.g. 0.0.0.0:8080 (required)
  TURNSTILE_SECRET_KEY      Turnstile secret key (required)
  TURNSTILE_SITE_KEY        Turnstile site key (required)
  JWT_SIGNING_KEY           secret used to sign session cookies (required)
  PROXY_TARGET              upstream base URL, e.g. http://app:3000 (required)
  DATABASE_URL              Postgres URL for request audit records
  TEMPLATE_PATH             override template root [default: /var/local/tps/templates]
  TURNSTILE_VERIFY_URL      siteverify endpoint [default: Cloudflare]
  VERIFY_TIMEOUT_SECS       verification timeout [default: 10]
  UPSTREAM_TIMEOUT_SECS     upstream connect and idle read timeout [default: 30]
  PENDING_TTL_SECS          lifetime of captured requests [default: 300]
  PENDING_SWEEP_SECS        expiry sweep period [default: 600]
  PENDING_MAX_BYTES         byte budget for captured requests [default: 268435456]
  MAX_BODY_SIZE_BYTES       largest body captured for a challenge [default: 10485760]
  TRUST_FORWARDED_HEADERS   use X-Forwarded-For / X-Real-IP for client IPs [default: true]
  EXEMPT_PATHS              comma separated paths that bypass the challenge (/x or /x/*)
  RUST_LOG                  log filter [default: info,tps_gate=debug,tps=debug]
  LOG_FORMAT                text or json [default: text]";

/// Turnstile proxy server
#[derive(Parser)]
#[command(name = "tps")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the challenge-gated reverse proxy
    #[command(after_help = ENVIRONMENT_HELP)]
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => serve().await,
    }
}

async fn serve() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    init_logging(DEFAULT_FILTER, LogFormat::from_env())?;

    let config = GateConfig::from_env().context("invalid configuration")?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        bind_addr = %config.bind_addr,
        proxy_target = %config.proxy_target,
        template_path = %config.template_path.display(),
        "starting turnstile proxy server"
    );

    let audit: Arc<dyn RequestLogger> = match config.database_url.as_deref() {
        Some(url) => Arc::new(
            PgRequestLogger::connect(url)
                .await
                .context("failed to connect to the audit database")?,
        ),
        None => {
            tracing::info!("DATABASE_URL not set, audit records go to the log only");
            Arc::new(TracingRequestLogger)
        }
    };

    let bind_addr = config.bind_addr;
    let sweep_every = config.pending_sweep_interval;

    let gate = Arc::new(Gate::from_config(config, audit).context("failed to build the gate")?);
    let sweeper = gate.pending().spawn_sweeper(sweep_every);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!(%bind_addr, "listening");

    axum::serve(
        listener,
        router(gate).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    sweeper.abort();
    tracing::info!("server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("shutdown signal received, draining connections");
}
