use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crate::gate::ConcurrencyGate;
use crate::session_worker::{run_session, SessionContext, SessionError, SessionRequest};
use crate::shutdown::stop_requested;
use crate::status::StatusPublisher;

/// Process-wide daemon state; created once at startup and shared for the
/// life of the dispatch loop.
pub struct DaemonState {
    pub running: Arc<AtomicBool>,
    pub gate: ConcurrencyGate,
    pub queue_dir: PathBuf,
    pub sessions_dir: PathBuf,
    pub stop_file: PathBuf,
    pub poll_interval: Duration,
    pub status: StatusPublisher,
    pub session: Arc<SessionContext>,
}

/// Top-level dispatch loop: scan, claim, decode, admit, spawn.
///
/// All per-request errors are contained and logged; the loop only exits
/// when the running flag drops (signal or stop file).
pub async fn run(state: &DaemonState) -> Result<()> {
    while state.running.load(Ordering::SeqCst) {
        let requests = scan_queue(&state.queue_dir);

        if requests.is_empty() {
            tokio::time::sleep(state.poll_interval).await;
            finish_scan(state, 0);
            continue;
        }

        for request_path in &requests {
            info!("found request {}", request_path.display());
            if !state.running.load(Ordering::SeqCst) {
                break;
            }

            let Some(processing) = claim(request_path) else {
                continue;
            };

            let request = match consume(&processing) {
                Ok(request) => request,
                Err(err) => {
                    warn!("discarding request {}: {}", processing.display(), err);
                    continue;
                }
            };

            let request = match request.validated(&state.sessions_dir) {
                Ok(request) => request,
                Err(err) => {
                    warn!("rejecting request: {}", err);
                    continue;
                }
            };

            // Deliberate backpressure: scanning stalls here while the gate
            // is saturated, until a running session releases its permit.
            let permit = state.gate.admit().await?;
            tokio::spawn(run_session(request, permit, state.session.clone()));
        }

        finish_scan(state, requests.len());
    }
    Ok(())
}

/// Per-cycle housekeeping: heartbeat plus stop-file check. Consulted once
/// per scan, never per session.
fn finish_scan(state: &DaemonState, queue_depth: usize) {
    if let Err(err) = state.status.publish(queue_depth) {
        warn!("failed to publish status: {}", err);
    }
    if stop_requested(&state.stop_file) {
        state.running.store(false, Ordering::SeqCst);
    }
}

/// List pending request descriptors in filename-sort order. The ordering is
/// the processing order within a scan.
fn scan_queue(queue_dir: &Path) -> Vec<PathBuf> {
    let entries = match fs::read_dir(queue_dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!("failed to scan {}: {}", queue_dir.display(), err);
            return Vec::new();
        }
    };

    let mut requests: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    requests.sort();
    requests
}

/// Atomically claim a descriptor by renaming it to a `.processing` sibling.
/// Rename within one directory is the mutual-exclusion mechanism; a vanished
/// file means another actor got there first and is skipped silently.
fn claim(request_path: &Path) -> Option<PathBuf> {
    let processing = request_path.with_extension("processing");
    match fs::rename(request_path, &processing) {
        Ok(()) => Some(processing),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            info!(
                "request {} disappeared before processing",
                request_path.display()
            );
            None
        }
        Err(err) => {
            warn!("failed to claim {}: {}", request_path.display(), err);
            None
        }
    }
}

/// Read and decode a claimed descriptor, deleting it from disk either way.
/// The on-disk file is not needed once decoded (at-most-once delivery); a
/// decode failure discards the request rather than retrying it.
fn consume(processing: &Path) -> Result<SessionRequest, SessionError> {
    let raw = fs::read_to_string(processing)?;
    let _ = fs::remove_file(processing);
    SessionRequest::decode(&raw)
}
