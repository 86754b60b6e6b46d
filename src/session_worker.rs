use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tokio::task;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::gate::SessionPermit;
use crate::paths::{ensure_within, PathViolation};

/// Interval between endpoint-existence probes.
const ENDPOINT_POLL: Duration = Duration::from_millis(50);

/// Decoded session request descriptor.
///
/// `stdin`/`stdout` name the endpoints the client creates; `session_dir` is
/// the per-session scratch directory holding the readiness marker.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionRequest {
    pub id: String,
    pub stdin: PathBuf,
    pub stdout: PathBuf,
    pub session_dir: PathBuf,
}

impl SessionRequest {
    pub fn decode(raw: &str) -> Result<Self, SessionError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Normalize all client-supplied paths and require them to live under
    /// the sessions root. A violation discards the request before any
    /// permit is taken.
    pub fn validated(self, sessions_root: &Path) -> Result<Self, SessionError> {
        Ok(Self {
            stdin: ensure_within(&self.stdin, sessions_root)?,
            stdout: ensure_within(&self.stdout, sessions_root)?,
            session_dir: ensure_within(&self.session_dir, sessions_root)?,
            id: self.id,
        })
    }

    fn ready_marker(&self) -> PathBuf {
        self.session_dir.join("ready")
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    PathViolation(#[from] PathViolation),
    #[error("malformed request: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("endpoints were not created within {}s", .0.as_secs_f64())]
    EndpointTimeout(Duration),
    #[error("failed to attach session: {0}")]
    Attach(#[from] io::Error),
}

/// Result of the best-effort teardown. `Partial` means the session
/// directory still holds client-owned files; it is never escalated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    Cleaned,
    Partial,
}

/// Everything a worker needs besides the request itself.
pub struct SessionContext {
    pub entrypoint: PathBuf,
    pub extra_args: Vec<String>,
    pub session_timeout: Duration,
    /// Clone of the daemon log handle; children inherit it as stderr.
    pub child_stderr: File,
}

/// Drive one session to a terminal state.
///
/// The permit is dropped on every exit path, exactly once. On endpoint
/// timeout nothing was created by us, so no cleanup runs; on any later
/// failure the teardown still executes.
pub async fn run_session(request: SessionRequest, permit: SessionPermit, ctx: Arc<SessionContext>) {
    let _permit = permit;

    info!(session = %request.id, "waiting for endpoints");
    if let Err(err) = wait_for_endpoints(&request, ctx.session_timeout).await {
        warn!(session = %request.id, "{}", err);
        return;
    }

    match attach_and_run(&request, &ctx).await {
        Ok(code) => info!(session = %request.id, exit_code = code, "child exited"),
        Err(err) => warn!(session = %request.id, "session failed: {}", err),
    }

    if cleanup(&request) == CleanupOutcome::Partial {
        debug!(session = %request.id, "session directory not fully removed; leaving client files");
    }
}

async fn wait_for_endpoints(
    request: &SessionRequest,
    timeout: Duration,
) -> Result<(), SessionError> {
    let deadline = Instant::now() + timeout;
    loop {
        if request.stdin.exists() && request.stdout.exists() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(SessionError::EndpointTimeout(timeout));
        }
        tokio::time::sleep(ENDPOINT_POLL).await;
    }
}

/// Ready marker, endpoint opens, child spawn, synchronous wait.
async fn attach_and_run(
    request: &SessionRequest,
    ctx: &SessionContext,
) -> Result<i32, SessionError> {
    // Create-if-absent; signals the client that the dispatcher attached.
    OpenOptions::new()
        .create(true)
        .write(true)
        .open(request.ready_marker())?;

    // FIFO opens block until the peer attaches, so keep them off the runtime.
    let input_path = request.stdin.clone();
    let output_path = request.stdout.clone();
    let (input, output) = task::spawn_blocking(move || -> io::Result<(File, File)> {
        let input = File::open(&input_path)?;
        let output = OpenOptions::new().write(true).open(&output_path)?;
        Ok((input, output))
    })
    .await
    .map_err(io::Error::other)??;

    let stderr = ctx.child_stderr.try_clone()?;

    info!(
        session = %request.id,
        command = %ctx.entrypoint.display(),
        "launching child"
    );
    let mut child = Command::new(&ctx.entrypoint)
        .args(&ctx.extra_args)
        .stdin(Stdio::from(input))
        .stdout(Stdio::from(output))
        .stderr(Stdio::from(stderr))
        .spawn()?;

    let status = child.wait().await?;
    Ok(status.code().unwrap_or(-1))
}

/// Remove both endpoints, the readiness marker, and the session directory
/// if it is now empty. Errors are swallowed; the dispatcher does not own
/// arbitrary client files placed inside the directory.
pub fn cleanup(request: &SessionRequest) -> CleanupOutcome {
    let mut partial = false;

    for path in [&request.stdin, &request.stdout, &request.ready_marker()] {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                debug!("failed to remove {}: {}", path.display(), err);
                partial = true;
            }
        }
    }

    match std::fs::remove_dir(&request.session_dir) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(_) => partial = true,
    }

    if partial {
        CleanupOutcome::Partial
    } else {
        CleanupOutcome::Cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::ConcurrencyGate;

    fn request_in(root: &Path, id: &str) -> SessionRequest {
        let session_dir = root.join(id);
        SessionRequest {
            id: id.to_string(),
            stdin: session_dir.join("in"),
            stdout: session_dir.join("out"),
            session_dir,
        }
    }

    fn context(timeout: Duration, entrypoint: &str) -> Arc<SessionContext> {
        let stderr = tempfile::tempfile().unwrap();
        Arc::new(SessionContext {
            entrypoint: PathBuf::from(entrypoint),
            extra_args: Vec::new(),
            session_timeout: timeout,
            child_stderr: stderr,
        })
    }

    #[test]
    fn decode_rejects_malformed_payload() {
        assert!(matches!(
            SessionRequest::decode("{\"id\": \"s1\""),
            Err(SessionError::Malformed(_))
        ));
        assert!(matches!(
            SessionRequest::decode("{\"id\": \"s1\"}"),
            Err(SessionError::Malformed(_))
        ));
    }

    #[test]
    fn validated_rejects_paths_outside_root() {
        let request = SessionRequest {
            id: "s1".into(),
            stdin: "/srv/sessions/s1/in".into(),
            stdout: "/srv/sessions/s1/out".into(),
            session_dir: "/srv/sessions/../elsewhere".into(),
        };
        assert!(matches!(
            request.validated(Path::new("/srv/sessions")),
            Err(SessionError::PathViolation(_))
        ));
    }

    #[tokio::test]
    async fn endpoint_timeout_releases_permit_without_cleanup() {
        let root = tempfile::tempdir().unwrap();
        let request = request_in(root.path(), "s1");
        std::fs::create_dir_all(&request.session_dir).unwrap();

        let gate = ConcurrencyGate::new(1);
        let permit = gate.admit().await.unwrap();
        run_session(
            request.clone(),
            permit,
            context(Duration::from_millis(120), "/bin/true"),
        )
        .await;

        assert_eq!(gate.available(), 1);
        // Timed-out sessions do not tear anything down.
        assert!(request.session_dir.exists());
        assert!(!request.ready_marker().exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_child_and_cleans_up_session() {
        let root = tempfile::tempdir().unwrap();
        let request = request_in(root.path(), "s1");
        std::fs::create_dir_all(&request.session_dir).unwrap();
        std::fs::write(&request.stdin, b"hello").unwrap();
        std::fs::write(&request.stdout, b"").unwrap();

        let gate = ConcurrencyGate::new(1);
        let permit = gate.admit().await.unwrap();
        run_session(
            request.clone(),
            permit,
            context(Duration::from_secs(2), "/bin/cat"),
        )
        .await;

        assert_eq!(gate.available(), 1);
        assert!(!request.stdin.exists());
        assert!(!request.stdout.exists());
        assert!(!request.ready_marker().exists());
        assert!(!request.session_dir.exists());
    }

    #[test]
    fn cleanup_reports_cleaned_when_directory_empties() {
        let root = tempfile::tempdir().unwrap();
        let request = request_in(root.path(), "s1");
        std::fs::create_dir_all(&request.session_dir).unwrap();
        std::fs::write(&request.stdin, b"").unwrap();
        std::fs::write(&request.stdout, b"").unwrap();
        std::fs::write(request.ready_marker(), b"").unwrap();

        assert_eq!(cleanup(&request), CleanupOutcome::Cleaned);
        assert!(!request.session_dir.exists());
    }

    #[test]
    fn cleanup_reports_partial_when_client_files_remain() {
        let root = tempfile::tempdir().unwrap();
        let request = request_in(root.path(), "s1");
        std::fs::create_dir_all(&request.session_dir).unwrap();
        std::fs::write(request.session_dir.join("client.tmp"), b"keep").unwrap();

        assert_eq!(cleanup(&request), CleanupOutcome::Partial);
        assert!(request.session_dir.join("client.tmp").exists());
    }
}
