//! Coordinates graceful shutdown across the HTTP server and background tasks.

use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

/// A cloneable shutdown handle. All clones observe the same shutdown signal.
#[derive(Clone)]
pub struct Shutdown {
    sender: watch::Sender<bool>,
    receiver: watch::Receiver<bool>,
    shutdown_timeout: Duration,
    shutdown_delay: Duration,
}

impl Shutdown {
    /// Spawns the signal listener (SIGINT/SIGTERM) and returns a handle that
    /// background tasks and the server can clone freely.
    #[must_use]
    pub fn spawn(shutdown_timeout: Duration, shutdown_delay: Duration) -> Self {
        let (sender, receiver) = watch::channel(false);

        let this = Self {
            sender,
            receiver,
            shutdown_timeout,
            shutdown_delay,
        };

        tokio::spawn({
            let this = this.clone();
            async move {
                if let Err(err) = signal_shutdown().await {
                    tracing::error!(?err, "error waiting for shutdown signal");
                }
                this.trigger();
            }
        });

        this
    }

    /// Triggers a shutdown programmatically (used by tests and the admin tool).
    pub fn trigger(&self) {
        let _ = self.sender.send(true);
    }

    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    #[must_use]
    pub const fn shutdown_delay(&self) -> Duration {
        self.shutdown_delay
    }

    /// Resolves as soon as a shutdown has been requested.
    pub async fn await_shutdown_begin(&self) {
        let mut receiver = self.receiver.clone();
        if *receiver.borrow_and_update() {
            return;
        }
        let _ = receiver.changed().await;
    }

    /// Resolves after shutdown has begun and the configured grace delay has
    /// elapsed, giving in-flight tasks a chance to reach an await point.
    pub async fn await_shutdown(&self) {
        self.await_shutdown_begin().await;
        tokio::time::sleep(self.shutdown_delay).await;
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.receiver.borrow()
    }
}

#[cfg(unix)]
async fn signal_shutdown() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => { info!("SIGINT received, shutting down"); }
        _ = sigterm.recv() => { info!("SIGTERM received, shutting down"); }
    };
    Ok(())
}

#[cfg(not(unix))]
async fn signal_shutdown() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received, shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn await_shutdown_begin_resolves_after_trigger() {
        let shutdown = Shutdown::spawn(Duration::from_secs(1), Duration::from_millis(1));
        assert!(!shutdown.is_shutting_down());

        shutdown.trigger();
        shutdown.await_shutdown_begin().await;
        assert!(shutdown.is_shutting_down());
    }

    #[tokio::test]
    async fn await_shutdown_waits_for_delay() {
        let shutdown = Shutdown::spawn(Duration::from_secs(1), Duration::from_millis(50));
        let start = tokio::time::Instant::now();

        shutdown.trigger();
        shutdown.await_shutdown().await;

        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
