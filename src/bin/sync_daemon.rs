// Binary entrypoint wiring config, logging, the store, and the pipeline
// together into a running process. Grounded on the teacher's
// `forest/daemon/src/daemon.rs` startup sequencing (load config, init
// logging, connect the store, spawn the long-running tasks, wait on a
// cancellation signal) with the CLI argument surface that file has
// stripped out entirely, since this crate's binary takes no flags (spec
// §1 places the CLI surface out of scope).

use std::sync::Arc;
use std::time::Duration;

use observatory::config::ObservatoryConfig;
use observatory::event_bus::Event;
use observatory::{logging, store, Observatory};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init("info");

    let config = ObservatoryConfig::from_env()?;
    info!(network = ?config.chain_client.network, "loaded configuration");

    let pool = store::connect(&config.database).await?;
    store::run_migrations(&pool).await?;
    info!("ran migrations");

    let uptime_interval = config.uptime.calculation_interval;
    let observatory = Observatory::build(config, pool).await?;

    observatory.event_bus.subscribe(|event: &Event| {
        info!(%event, "pipeline event");
    });

    // Spec §4.9: the Uptime Engine also reacts to sync milestones, not just
    // its own timer. The listener itself must return immediately (spec
    // §4.8), so the actual recomputation runs on a spawned task.
    let event_uptime_calculator = observatory.uptime_calculator.clone();
    observatory.event_bus.subscribe(move |event: &Event| {
        if matches!(event, Event::InitialSyncComplete { .. } | Event::RangePersisted { .. }) {
            let uptime_calculator = event_uptime_calculator.clone();
            tokio::spawn(async move {
                if let Err(err) = uptime_calculator.calculate_all_at_latest_round().await {
                    error!(error = %err, "event-triggered uptime calculation failed");
                }
            });
        }
    });

    let cancel = CancellationToken::new();

    let sync_controller = observatory.sync_controller.clone();
    let sync_cancel = cancel.clone();
    let sync_task = tokio::spawn(async move {
        if let Err(err) = sync_controller.run(sync_cancel).await {
            error!(error = %err, "sync controller exited with an error");
        }
    });

    let uptime_calculator = observatory.uptime_calculator.clone();
    let uptime_cancel = cancel.clone();
    let uptime_task = tokio::spawn(async move {
        run_uptime_loop(uptime_calculator, uptime_interval, uptime_cancel).await;
    });

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining in-flight work");
    cancel.cancel();

    let _ = sync_task.await;
    let _ = uptime_task.await;

    Ok(())
}

/// Periodically recomputes uptime snapshots at `UPTIME_CALCULATION_INTERVAL`
/// against the chain's current round, read off the latest persisted block
/// (spec §4.9).
async fn run_uptime_loop(
    uptime_calculator: Arc<observatory::uptime::UptimeCalculator>,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => return,
        }

        if let Err(err) = uptime_calculator.calculate_all_at_latest_round().await {
            error!(error = %err, "uptime calculation pass failed");
        }
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
