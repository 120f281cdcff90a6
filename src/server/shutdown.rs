//! Graceful shutdown handling
//!
//! On SIGTERM or SIGINT the watch intakes stop, queued notifications drain
//! through their capturers, and the HTTP server finishes in-flight requests.

use tokio::sync::watch;
use tracing::{error, info};

/// Receiving half, cloned into every long-running task
#[derive(Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Resolve once shutdown is signalled, or the controller is dropped
    ///
    /// Returns immediately when shutdown already happened, so it is safe to
    /// poll from inside a `select!` loop.
    pub async fn wait(&mut self) {
        // wait_for checks the current value before awaiting changes
        let _ = self.receiver.wait_for(|stopped| *stopped).await;
    }

    /// Check whether shutdown has been signalled without waiting
    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }
}

/// Sending half, owned by `main`
pub struct ShutdownController {
    sender: watch::Sender<bool>,
}

impl ShutdownController {
    /// Signal every `ShutdownSignal` clone to stop
    pub fn shutdown(&self) {
        self.sender.send_replace(true);
        info!("Shutdown signal sent");
    }
}

/// Create a connected controller/signal pair
pub fn shutdown_channel() -> (ShutdownController, ShutdownSignal) {
    let (sender, receiver) = watch::channel(false);
    (ShutdownController { sender }, ShutdownSignal { receiver })
}

/// Wait for SIGTERM or SIGINT; returns the signal name
///
/// # Panics
/// Panics if the signal handlers cannot be registered.
#[cfg(unix)]
pub async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let register = |kind: SignalKind, name: &str| match signal(kind) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, signal = name, "Failed to register signal handler");
            panic!("Cannot register {} handler: {}", name, e);
        }
    };
    let mut sigterm = register(SignalKind::terminate(), "SIGTERM");
    let mut sigint = register(SignalKind::interrupt(), "SIGINT");

    let name = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    info!(signal = name, "Received termination signal");
    name
}

/// Wait for Ctrl+C (non-unix targets)
///
/// # Panics
/// Panics if the Ctrl+C handler cannot be registered.
#[cfg(not(unix))]
pub async fn wait_for_signal() -> &'static str {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to wait for Ctrl+C");
        panic!("Cannot wait for Ctrl+C: {}", e);
    }
    info!("Received Ctrl+C");
    "CTRL_C"
}
