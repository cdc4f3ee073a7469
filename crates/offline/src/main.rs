//! `civicsync-agent`: runs the sync engine headless against the configured API.

use anyhow::Context;
use civicsync_offline::config::EngineConfig;
use civicsync_offline::orchestrator::SyncOutcome;
use civicsync_offline::runtime::OfflineRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EngineConfig::from_env().context("invalid CIVICSYNC_* configuration")?;
    civicsync_observability::init(&config.log);

    if config.auth_token.is_some() {
        tracing::info!("using bearer token for API requests");
    } else {
        tracing::info!("no auth token configured; API requests are anonymous");
    }

    let runtime = OfflineRuntime::open(&config)
        .await
        .context("failed to open offline runtime")?;

    let worker = runtime.orchestrator.start();
    if let SyncOutcome::Completed(report) = runtime.orchestrator.force_sync().await {
        tracing::info!(queue = ?report.queue, "initial sync done");
    }

    let counts = runtime.queue.get_queue_status().await;
    tracing::info!(
        pending = counts.pending,
        failed = counts.failed,
        "civicsync agent running; press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    tracing::info!("shutting down");
    runtime.orchestrator.shutdown();
    worker.await.context("sync worker panicked")?;
    Ok(())
}
