use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::signal;
use tracing::{info, warn};

/// Install SIGINT/SIGTERM handlers that flip the shared running flag.
///
/// Handlers only request shutdown; the dispatch loop observes the flag at
/// the top of its next iteration. Sessions already spawned keep running.
pub fn spawn_signal_handlers(running: Arc<AtomicBool>) {
    let ctrl_c_flag = running.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("received SIGINT; shutting down after current scan");
            ctrl_c_flag.store(false, Ordering::SeqCst);
        }
    });

    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!("failed to install SIGTERM handler: {}", err);
                return;
            }
        };
        tokio::spawn(async move {
            if sigterm.recv().await.is_some() {
                info!("received SIGTERM; shutting down after current scan");
                running.store(false, Ordering::SeqCst);
            }
        });
    }
}

/// Sentinel-file trigger for actors without signal privileges. Consumes the
/// stop file when present.
pub fn stop_requested(stop_path: &Path) -> bool {
    if !stop_path.exists() {
        return false;
    }
    if let Err(err) = std::fs::remove_file(stop_path) {
        warn!("failed to remove stop file {}: {}", stop_path.display(), err);
    }
    info!("stop file {} found; shutting down", stop_path.display());
    true
}
