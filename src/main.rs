#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use roomcast::config::{LoggingConfig, MediaSettings, ServerConfig};
use roomcast::media::{MediaEngine, MediaEvents};
use roomcast::metrics::ServerMetrics;
use roomcast::session::SessionOrchestrator;
use roomcast::signaling::SignalingServer;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// roomcast command line arguments
#[derive(Parser, Debug)]
#[command(name = "roomcast")]
#[command(version, about = "SFU session orchestration server", long_about = None)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, value_name = "FILE", env = "ROOMCAST_CONFIG")]
    config: Option<PathBuf>,

    /// Debug logging for roomcast modules
    #[arg(short, long)]
    debug: bool,

    /// Listen port (overrides config and PORT)
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,
}

fn init_logging(config: &LoggingConfig, debug: bool) -> Option<WorkerGuard> {
    let level = if debug { "debug" } else { config.level.as_str() };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("roomcast={level},mediasoup=info,tower_http=info")));

    let (file_layer, guard) = match &config.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "roomcast.log".to_string());
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, name));
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();
    guard
}

#[cfg(feature = "mediasoup")]
async fn start_engine(settings: &MediaSettings) -> Result<(Arc<dyn MediaEngine>, MediaEvents)> {
    let (engine, events) = roomcast::media::MediasoupEngine::new(settings)
        .await
        .context("failed to start mediasoup workers")?;
    Ok((Arc::new(engine), events))
}

#[cfg(not(feature = "mediasoup"))]
async fn start_engine(_settings: &MediaSettings) -> Result<(Arc<dyn MediaEngine>, MediaEvents)> {
    warn!("Built without the mediasoup feature, using the loopback media engine (no media flows)");
    let (engine, events) = roomcast::media::LoopbackEngine::new();
    Ok((Arc::new(engine), events))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ServerConfig::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    let _log_guard = init_logging(&config.logging, cli.debug);

    info!("roomcast v{} starting", env!("CARGO_PKG_VERSION"));
    if let Some(path) = &cli.config {
        info!("Loaded configuration from {}", path.display());
    }
    match &config.media.announced_ip {
        Some(ip) => info!("Announcing ICE candidates on {}", ip),
        None => info!("No ANNOUNCE_IP set, candidates use the listen address"),
    }

    let (engine, events) = start_engine(&config.media).await?;
    info!("Media engine initialized");

    let metrics = ServerMetrics::new();
    let shutdown = CancellationToken::new();
    let orchestrator = SessionOrchestrator::new(
        engine,
        events,
        config.rooms,
        metrics.clone(),
        shutdown.clone(),
    );

    let addr = config.bind_address();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let server = SignalingServer::new(
        orchestrator.clone(),
        metrics,
        config.server.clone(),
        shutdown.clone(),
    );
    let mut serve = tokio::spawn(server.serve(listener));
    let mut serve_finished = false;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = shutdown.cancelled() => {
            warn!("Shutdown requested");
        }
        result = &mut serve => {
            serve_finished = true;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Signaling server error: {}", e),
                Err(e) => error!("Signaling server task failed: {}", e),
            }
        }
    }

    shutdown.cancel();
    orchestrator.shutdown().await;
    if !serve_finished {
        match serve.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Signaling server error: {}", e),
            Err(e) => error!("Signaling server task failed: {}", e),
        }
    }

    if !orchestrator.is_accepting() {
        anyhow::bail!("media engine died");
    }
    info!("Server shutdown complete");
    Ok(())
}
