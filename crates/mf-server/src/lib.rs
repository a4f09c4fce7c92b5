//! mf-server: HTTP delivery, realtime progress, job lifecycle and
//! maintenance.
//!
//! This crate ties the other mf-* crates into a running server:
//!
//! - Axum HTTP API with upload ingest, catalog, progress and stats routes
//! - Range-capable stream delivery with per-request session accounting
//! - WebSocket realtime channel fed by the progress registry
//! - Multi-preset transcode orchestration on top of `mf-av`
//! - Periodic orphan cleanup and disk-usage scans
//! - Graceful drain on SIGINT/SIGTERM

pub mod catalog;
pub mod context;
pub mod error;
pub mod lifecycle;
pub mod maintenance;
pub mod progress;
pub mod router;
pub mod routes;
pub mod sessions;
pub mod stats;
pub mod transcode;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use mf_av::{Encoder, FfmpegEncoder, FfprobeProber, MetadataProber, ToolRegistry};
use mf_core::config::Config;

use crate::context::AppContext;
use crate::lifecycle::LifecycleState;

/// Start the mediaforge server.
///
/// Discovers ffmpeg/ffprobe, builds the [`AppContext`], rebuilds the video
/// catalog, spawns the maintenance loops and serves HTTP until a shutdown
/// signal has been handled.
pub async fn start(config: Config) -> mf_core::Result<()> {
    for warning in config.validate() {
        tracing::warn!("Config warning: {warning}");
    }

    let tools = ToolRegistry::discover(&config.tools);
    for info in tools.check_all() {
        if info.available {
            tracing::info!(
                "Tool found: {} ({})",
                info.name,
                info.version.as_deref().unwrap_or("unknown version")
            );
        } else {
            tracing::warn!("Tool not found: {}", info.name);
        }
    }
    let encoder: Arc<dyn Encoder> = Arc::new(FfmpegEncoder::from_registry(&tools)?);
    let prober: Arc<dyn MetadataProber> = Arc::new(FfprobeProber::from_registry(&tools)?);

    let ctx = AppContext::new(config, encoder, prober);
    serve(ctx).await
}

/// Serve an already-built context until shutdown completes.
pub async fn serve(ctx: AppContext) -> mf_core::Result<()> {
    let addr: SocketAddr = format!("{}:{}", ctx.config.server.host, ctx.config.server.port)
        .parse()
        .map_err(|e| mf_core::Error::Internal(format!("Invalid server address: {e}")))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| mf_core::Error::Internal(format!("Failed to bind to {addr}: {e}")))?;
    tracing::info!("Starting server on {addr}");

    serve_on(ctx, listener).await
}

/// Serve on a bound listener. Returns after the drain sequence finished.
pub async fn serve_on(ctx: AppContext, listener: tokio::net::TcpListener) -> mf_core::Result<()> {
    ctx.ensure_storage().await?;
    match ctx.catalog.rebuild().await {
        Ok(count) => tracing::info!("Catalog restored {count} videos"),
        Err(e) => tracing::warn!("Catalog rebuild failed: {e}"),
    }

    let background = spawn_background(&ctx);
    tokio::spawn(handle_signals(ctx.clone()));

    let drain = ctx.lifecycle.drain_token();
    let app = router::build_router(ctx.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { drain.cancelled().await })
        .await
        .map_err(|e| mf_core::Error::Internal(format!("Server error: {e}")))?;

    // The listener is closed; wait for the drain sequence to complete.
    ctx.lifecycle.close_token().cancelled().await;
    for handle in background {
        let _ = handle.await;
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Spawn the maintenance and broadcast loops. They stop when draining
/// begins.
pub fn spawn_background(ctx: &AppContext) -> Vec<JoinHandle<()>> {
    let cancel = ctx.lifecycle.drain_token();
    let settings = &ctx.config.maintenance;

    let cleanup = tokio::spawn(maintenance::run_cleanup_scheduler(
        Arc::clone(&ctx.cleanup),
        Arc::clone(&ctx.lifecycle),
        Duration::from_secs(settings.cleanup_initial_delay_secs),
        Duration::from_secs(settings.cleanup_interval_secs),
        cancel.clone(),
    ));

    let disk = tokio::spawn(Arc::clone(&ctx.disk_usage).run(
        Duration::from_secs(settings.disk_usage_interval_secs),
        cancel.clone(),
    ));

    let stats = tokio::spawn(Arc::clone(&ctx.stats).run_broadcast(
        Arc::clone(&ctx.event_bus),
        Duration::from_secs(ctx.config.stats.broadcast_interval_secs.max(1)),
        cancel,
    ));

    vec![cleanup, disk, stats]
}

/// First signal starts the drain; a second one while draining exits with
/// status 1.
async fn handle_signals(ctx: AppContext) {
    loop {
        if !wait_for_signal().await {
            return;
        }

        match ctx.lifecycle.state() {
            LifecycleState::Running => {
                tracing::info!("Shutdown signal received; draining");
                let lifecycle = Arc::clone(&ctx.lifecycle);
                tokio::spawn(async move {
                    match lifecycle.initiate_shutdown().await {
                        Ok(outcome) if outcome.drained => {
                            tracing::info!(waited_ms = outcome.waited.as_millis() as u64, "Drain complete")
                        }
                        Ok(outcome) => tracing::warn!(
                            abandoned = outcome.abandoned.len(),
                            "Drain timed out; abandoning remaining jobs"
                        ),
                        Err(e) => tracing::warn!("Shutdown not started: {e}"),
                    }
                });
            }
            LifecycleState::Draining => {
                tracing::error!("Second shutdown signal during drain; exiting immediately");
                std::process::exit(1);
            }
            LifecycleState::Stopped => return,
        }
    }
}

/// Wait for SIGINT or SIGTERM. Returns `false` if no handler could be
/// installed.
async fn wait_for_signal() -> bool {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => true,
        _ = terminate => true,
    }
}
