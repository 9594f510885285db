//! Process shutdown coordination.
//!
//! On termination the process-wide roster of live channel locks is drained
//! within a grace window, so peers fail over through the release trigger
//! instead of waiting for the server to reap a dead backend.

use std::time::Duration;

use tracing::{error, info, warn};

use crate::roster;

/// Destroy every live channel lock, bounded by the grace window.
///
/// Returns `true` when every lock released cleanly within the window.
pub async fn release_all(timeout: Duration) -> bool {
    let locks = roster::live();
    if locks.is_empty() {
        return true;
    }

    info!(count = locks.len(), "Releasing channel locks on shutdown");

    let teardown = async {
        let mut clean = true;
        for lock in locks {
            if let Err(e) = lock.destroy().await {
                error!(channel = %lock.channel(), "Lock teardown failed: {}", e);
                clean = false;
            }
        }
        clean
    };

    match tokio::time::timeout(timeout, teardown).await {
        Ok(clean) => clean,
        Err(_) => {
            error!("Shutdown grace window expired with locks still held");
            false
        }
    }
}

/// Spawn a task that waits for SIGINT/SIGTERM, releases all locks within
/// the grace window, and exits the process: 0 on clean release, 1 otherwise.
pub fn install_signal_handler(timeout: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Termination signal received");
        let clean = release_all(timeout).await;
        std::process::exit(if clean { 0 } else { 1 });
    })
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("SIGTERM handler unavailable, watching SIGINT only: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
