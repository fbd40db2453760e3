#![forbid(unsafe_code)]

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::Parser;
use keypool::{config::Config, health, logs, proxy, state::ProxyState};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "keypool",
    version,
    about = "Key-rotating reverse proxy for Ollama Cloud with usage accounting and a key-health dashboard"
)]
struct Cli {
    /// Path to the YAML key file
    #[arg(long, default_value = "config/config.yaml")]
    config: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_ring = logs::LogBuffer::new(1000);
    let filter = EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(logs::RingLayer::new(log_ring.clone()))
        .init();

    let cfg = Config::load(&cli.config)?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(num_cpus::get())
        .thread_name("keypool-worker")
        .build()?;

    rt.block_on(async move {
        let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
        let listener = std::net::TcpListener::bind(addr)
            .map_err(|e| anyhow::anyhow!("failed to bind {addr}: {e}"))?;
        let state = Arc::new(ProxyState::new(cfg, log_ring)?);

        tokio::spawn(health::run(state.clone()));

        tracing::info!(%addr, keys = state.keys.len(), version = %state.version, "listening");
        proxy::serve_http(listener, state, shutdown_signal()).await?;
        tracing::info!("shut down cleanly");
        Ok(())
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received Ctrl+C; shutting down"),
        () = terminate => tracing::info!("received SIGTERM; shutting down"),
    }
}
