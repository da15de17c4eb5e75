#![doc = include_str!("../Readme.md")]

pub mod app;
pub mod chain;
pub mod config;
pub mod counters;
pub mod domain;
pub mod monitoring;
pub mod nonce;
pub mod pipeline;
pub mod policy;
pub mod secret;
pub mod serde_utils;
pub mod server;
pub mod shutdown;
pub mod signer;
pub mod store;
pub mod tracker;
pub mod utils;
pub mod verifier;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use app::App;
use config::Config;
use shutdown::Shutdown;
use tracker::ConfirmationTracker;

/// Cadence of the policy reload and confirmation-tracker task restarts after
/// a failure, independent of each task's own internal scan interval.
const TASK_RESTART_BACKOFF: Duration = Duration::from_secs(2);

/// Builds every capability from `config`, starts the HTTP server and
/// background tasks, and runs until `shutdown` fires, then waits (bounded by
/// `config.app.shutdown_timeout`) for in-flight work to finish.
pub async fn main(config: Config, shutdown: Shutdown) -> anyhow::Result<()> {
    let address = config.server.address;
    let app = Arc::new(App::new(config, shutdown.clone()).await?);

    let listener = tokio::net::TcpListener::bind(address).await?;
    info!(%address, "listening");

    let router = server::router(app.clone());
    let server_shutdown = shutdown.clone();
    let server_task = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { server_shutdown.await_shutdown_begin().await })
            .await
    });

    let policy_reload = spawn_policy_reload(&app);
    let confirmation_tracker = spawn_confirmation_tracker(&app);
    let queue_depth_gauge = spawn_queue_depth_gauge(&app);

    shutdown.await_shutdown_begin().await;
    info!("shutdown initiated, waiting for in-flight work to finish");

    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!(%err, "http server exited with an error"),
        Err(err) => tracing::warn!(?err, "server task did not shut down cleanly"),
    }
    policy_reload.abort();
    confirmation_tracker.abort();
    queue_depth_gauge.abort();

    shutdown.await_shutdown().await;
    Ok(())
}

/// Polls the Store for policy-rule changes on a fixed cadence, independent
/// of the admin surface's explicit `reload` endpoint (spec §4.4).
fn spawn_policy_reload(app: &Arc<App>) -> tokio::task::JoinHandle<()> {
    let app = app.clone();
    let interval = app.config.app.policy_reload_interval;
    utils::spawn_with_backoff_cancel_on_shutdown(
        move || {
            let app = app.clone();
            async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    let rules = app.store.list_policy_rules(None).await?;
                    app.policy.reload(rules);
                }
            }
        },
        TASK_RESTART_BACKOFF,
        app.shutdown.clone(),
    )
}

/// Drives the Confirmation Tracker's (C9) scan loop; `run_once` only
/// returns on a programming error, so this restarts it with backoff rather
/// than aborting the process outright.
fn spawn_confirmation_tracker(app: &Arc<App>) -> tokio::task::JoinHandle<()> {
    let tracker = Arc::new(ConfirmationTracker::new(
        app.store.clone(),
        app.chain.clone(),
        app.nonce.clone(),
        app.config.app.confirmation_scan_interval,
        app.config.app.dropped_grace_window,
    ));
    utils::spawn_with_backoff_cancel_on_shutdown(
        move || {
            let tracker = tracker.clone();
            async move { tracker.run_once().await }
        },
        TASK_RESTART_BACKOFF,
        app.shutdown.clone(),
    )
}

/// Refreshes the `relay_pending_transactions` gauge on the same cadence as
/// the Confirmation Tracker's scan.
fn spawn_queue_depth_gauge(app: &Arc<App>) -> tokio::task::JoinHandle<()> {
    let app = app.clone();
    let interval = app.config.app.confirmation_scan_interval;
    utils::spawn_with_backoff_cancel_on_shutdown(
        move || {
            let app = app.clone();
            async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    monitoring::Monitoring::log_queue_depths(&app.store).await?;
                }
            }
        },
        TASK_RESTART_BACKOFF,
        app.shutdown.clone(),
    )
}
