//! Graceful shutdown on SIGINT/SIGTERM. Grounded in the original's `core/signal_manager.py`,
//! expressed with `tokio::signal::unix` plumbing into a shared [`CancellationToken`] the way the
//! teacher uses one to unwind its own long-running loops.

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Waits for SIGINT or SIGTERM, then cancels `token` so every loop selecting on it unwinds.
pub async fn wait_for_shutdown(token: CancellationToken) {
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => tracing::info!("received SIGINT, starting graceful shutdown"),
        _ = sigterm.recv() => tracing::info!("received SIGTERM, starting graceful shutdown"),
    }
    token.cancel();
}
