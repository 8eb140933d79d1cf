use std::sync::Arc;

use clap::Parser;
use dotenv::dotenv;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use ingest::config::Config;
use ingest::status::spawn_status_logger;
use ingest::{
    Aggregator, LiveSessions, LogSink, Pipeline, SessionManager, SnapshotPublisher, StartupError,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    let cfg = Config::parse();
    init_tracing(cfg.log_json);

    info!(app_version = env!("CARGO_PKG_VERSION"), "starting");

    if let Err(e) = run(cfg).await {
        error!(error = %e, "startup_failed");
        return Err(e.into());
    }
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        fmt().with_env_filter(filter).json().init();
    } else {
        fmt().with_env_filter(filter).init();
    }
}

async fn run(cfg: Config) -> Result<(), StartupError> {
    tokio::fs::create_dir_all(&cfg.log_dir)
        .await
        .map_err(|source| StartupError::Storage {
            path: cfg.log_dir.clone(),
            source,
        })?;

    let addr = cfg.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| StartupError::Bind {
            addr: addr.clone(),
            source,
        })?;

    let sink = Arc::new(LogSink::new(&cfg.log_dir, cfg.rotation()));
    let stats = Arc::new(Aggregator::new());
    let live = Arc::new(LiveSessions::new());
    let snapshots = Arc::new(SnapshotPublisher::new(cfg.snapshot(), stats.clone(), live.clone()));
    let pipeline = Arc::new(Pipeline::new(sink.clone(), stats).with_snapshots(snapshots.clone()));
    let manager = Arc::new(SessionManager::new(
        pipeline.clone(),
        live.clone(),
        cfg.handshake_timeout(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let snapshot_handle = tokio::spawn(snapshots.clone().run(shutdown_rx.clone()));
    let status_handle = cfg
        .status_interval()
        .map(|period| spawn_status_logger(pipeline.clone(), live.clone(), shutdown_rx.clone(), period));

    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", err);
        }
        info!("shutdown_requested");
        let _ = shutdown_tx.send(true);
    });

    info!(
        addr = %addr,
        log_dir = %cfg.log_dir.display(),
        max_bytes = cfg.max_bytes,
        retention = cfg.retention,
        snapshot = %snapshots.path().display(),
        "ingestion_endpoint_listening"
    );

    manager.serve(listener, shutdown_rx).await;

    let _ = snapshot_handle.await;
    if let Some(handle) = status_handle {
        let _ = handle.await;
    }
    snapshots.finish().await;
    sink.close_all().await;
    info!(
        total_packets = pipeline.stats().total_packets(),
        rejected = pipeline.rejected(),
        "Shutting down gracefully."
    );
    Ok(())
}
