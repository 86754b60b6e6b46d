//! fifod — file-queue dispatcher daemon.
//!
//! Watches a queue directory for session request descriptors, admits each
//! one through a bounded concurrency gate and spawns a child process wired
//! to the session's pre-created FIFO endpoints.

mod gate;
mod paths;
mod queue_watcher;
mod session_worker;
mod shutdown;
mod status;

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use crate::gate::ConcurrencyGate;
use crate::queue_watcher::DaemonState;
use crate::session_worker::SessionContext;
use crate::status::StatusPublisher;

#[derive(Parser, Debug)]
#[command(name = "fifod", version)]
#[command(about = "File watcher daemon dispatching FIFO-backed child sessions")]
struct Cli {
    /// Directory containing session request files
    #[arg(long, default_value = "tmp/queue")]
    queue_dir: PathBuf,

    /// Directory where session FIFOs live
    #[arg(long, default_value = "tmp/sessions")]
    sessions_dir: PathBuf,

    /// Executable launched for each session
    #[arg(long, default_value = "bin/session-server")]
    entrypoint: PathBuf,

    /// Extra argument passed to the child (repeatable)
    #[arg(long = "arg")]
    args: Vec<String>,

    /// Daemon + child stderr log file
    #[arg(long, default_value = "logs/fifod.log")]
    log_file: PathBuf,

    /// Seconds between queue scans
    #[arg(long, default_value_t = 0.2)]
    poll_interval: f64,

    /// Seconds to wait for FIFOs before failing a session
    #[arg(long, default_value_t = 5.0)]
    session_timeout: f64,

    /// Maximum concurrent sessions
    #[arg(long, default_value_t = 1)]
    max_concurrent: usize,

    /// Path to write the daemon PID
    #[arg(long, default_value = ".fifod.pid")]
    pid_file: PathBuf,

    /// Heartbeat file written by the daemon
    #[arg(long, default_value = "tmp/fifod.status")]
    status_file: PathBuf,

    /// When this file exists, the daemon shuts down
    #[arg(long, default_value = "tmp/fifod.stop")]
    stop_file: PathBuf,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    fs::create_dir_all(&cli.queue_dir)
        .with_context(|| format!("failed to create queue dir {}", cli.queue_dir.display()))?;
    fs::create_dir_all(&cli.sessions_dir)
        .with_context(|| format!("failed to create sessions dir {}", cli.sessions_dir.display()))?;
    for path in [&cli.log_file, &cli.pid_file, &cli.status_file, &cli.stop_file] {
        ensure_parent_dir(path)?;
    }

    // Requests carry absolute paths, so the containment check needs the
    // real sessions root with symlinks resolved.
    let sessions_dir = fs::canonicalize(&cli.sessions_dir)
        .with_context(|| format!("failed to resolve {}", cli.sessions_dir.display()))?;

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&cli.log_file)
        .with_context(|| format!("failed to open log file {}", cli.log_file.display()))?;
    let child_stderr = log_file.try_clone()?;

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(Mutex::new(log_file))
        .init();

    fs::write(&cli.pid_file, std::process::id().to_string())
        .with_context(|| format!("failed to write pid file {}", cli.pid_file.display()))?;

    let running = Arc::new(AtomicBool::new(true));
    shutdown::spawn_signal_handlers(running.clone());

    let state = DaemonState {
        running,
        gate: ConcurrencyGate::new(cli.max_concurrent),
        queue_dir: cli.queue_dir.clone(),
        sessions_dir,
        stop_file: cli.stop_file.clone(),
        poll_interval: Duration::from_secs_f64(cli.poll_interval.max(0.0)),
        status: StatusPublisher::new(cli.status_file.clone()),
        session: Arc::new(SessionContext {
            entrypoint: cli.entrypoint.clone(),
            extra_args: cli.args.clone(),
            session_timeout: Duration::from_secs_f64(cli.session_timeout.max(0.0)),
            child_stderr,
        }),
    };

    info!(
        queue = %cli.queue_dir.display(),
        sessions = %state.sessions_dir.display(),
        max_concurrent = cli.max_concurrent,
        "fifod started"
    );

    let result = queue_watcher::run(&state).await;

    // Teardown runs on every exit path of the loop; in-flight session tasks
    // are not awaited and may briefly outlive the daemon.
    info!("daemon stopping");
    let _ = fs::remove_file(&cli.pid_file);
    let _ = fs::remove_file(&cli.status_file);

    result
}
