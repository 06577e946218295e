// ABOUTME: Worker spawn strategy, lifecycle handle, and the persisted status record
// ABOUTME: Production spawns the bridge binary as the session user; tests install a stub spawner

use crate::config::BusConfig;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::net::UnixStream;
use tracing::{debug, warn};

use super::{Principal, SessionId};

/// Worker lifecycle errors.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("worker endpoint {0} not ready within the startup timeout")]
    StartupTimeout(PathBuf),
}

/// Strategy for bringing up a per-session worker.
///
/// The production implementation execs the bridge binary; tests install an
/// in-process stub so session semantics can be exercised without real
/// subprocesses or privileges.
pub trait WorkerSpawner: Send + Sync + 'static {
    fn spawn(
        &self,
        session: &SessionId,
        principal: &Principal,
        config: &BusConfig,
    ) -> BoxFuture<'static, Result<WorkerHandle, WorkerError>>;
}

/// A live worker: its endpoint plus whatever is needed to stop it.
#[derive(Debug)]
pub struct WorkerHandle {
    endpoint: PathBuf,
    child: Option<tokio::process::Child>,
    shutdown: Option<tokio_util::sync::CancellationToken>,
}

impl WorkerHandle {
    /// A worker backed by a real subprocess.
    pub fn process(endpoint: PathBuf, child: tokio::process::Child) -> Self {
        Self {
            endpoint,
            child: Some(child),
            shutdown: None,
        }
    }

    /// A worker with no subprocess (in-process stubs); termination only
    /// unlinks the endpoint.
    pub fn external(endpoint: PathBuf) -> Self {
        Self {
            endpoint,
            child: None,
            shutdown: None,
        }
    }

    /// An in-process worker stopped through a token instead of SIGTERM.
    pub fn with_shutdown(endpoint: PathBuf, shutdown: tokio_util::sync::CancellationToken) -> Self {
        Self {
            endpoint,
            child: None,
            shutdown: Some(shutdown),
        }
    }

    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    /// Stop the worker: SIGTERM, wait up to `grace`, then SIGKILL. The
    /// endpoint is unlinked either way. Returns the exit code if the
    /// worker exited on its own.
    pub async fn terminate(mut self, grace: Duration) -> Option<i32> {
        if let Some(shutdown) = self.shutdown.take() {
            shutdown.cancel();
            // Give the in-process worker its drain moment, as SIGTERM
            // would for a subprocess.
            tokio::task::yield_now().await;
        }
        let exit_code = match self.child.take() {
            Some(mut child) => {
                if let Some(pid) = child.id() {
                    // Ask nicely first; the worker drains in-flight calls.
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGTERM);
                    }
                }
                match tokio::time::timeout(grace, child.wait()).await {
                    Ok(Ok(status)) => status.code(),
                    Ok(Err(e)) => {
                        warn!(error = %e, "waiting for worker failed");
                        None
                    }
                    Err(_) => {
                        warn!("worker ignored SIGTERM; killing");
                        let _ = child.kill().await;
                        None
                    }
                }
            }
            None => None,
        };

        if let Err(e) = std::fs::remove_file(&self.endpoint) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(endpoint = %self.endpoint.display(), error = %e, "endpoint unlink failed");
            }
        }
        exit_code
    }
}

/// Poll the endpoint until the worker accepts connections, bounded by the
/// startup timeout.
pub async fn wait_ready(endpoint: &Path, timeout: Duration) -> Result<(), WorkerError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match UnixStream::connect(endpoint).await {
            Ok(probe) => {
                drop(probe);
                return Ok(());
            }
            Err(e) => {
                if tokio::time::Instant::now() >= deadline {
                    debug!(error = %e, "endpoint readiness probe gave up");
                    return Err(WorkerError::StartupTimeout(endpoint.to_path_buf()));
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

/// Spawns the bridge binary as the session's user.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    /// Path to the `iobus-bridge` executable.
    pub program: PathBuf,
    /// Directory for endpoints and status files.
    pub runtime_dir: PathBuf,
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(
        &self,
        session: &SessionId,
        principal: &Principal,
        _config: &BusConfig,
    ) -> BoxFuture<'static, Result<WorkerHandle, WorkerError>> {
        let endpoint = self.runtime_dir.join(format!("bridge-{session}.sock"));
        let program = self.program.clone();
        let session = session.clone();
        let uid = principal.uid;

        Box::pin(async move {
            let mut cmd = tokio::process::Command::new(&program);
            cmd.arg("--endpoint")
                .arg(&endpoint)
                .arg("--session")
                .arg(session.as_str())
                .kill_on_drop(true);
            // Dropping privileges needs them in the first place.
            if unsafe { libc::geteuid() } == 0 {
                cmd.uid(uid);
            }
            let child = cmd.spawn()?;
            debug!(pid = child.id(), endpoint = %endpoint.display(), "worker spawned");
            Ok(WorkerHandle::process(endpoint, child))
        })
    }
}

/// Per-session worker status persisted under the runtime directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerStatus {
    pub id: String,
    pub status: String,
    pub started_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl WorkerStatus {
    pub fn running(id: &SessionId) -> Self {
        Self::running_since(id, unix_now())
    }

    pub fn running_since(id: &SessionId, started_at: u64) -> Self {
        Self {
            id: id.to_string(),
            status: "running".to_string(),
            started_at,
            finished_at: None,
            exit_code: None,
        }
    }

    pub fn exited(mut self, exit_code: Option<i32>) -> Self {
        self.status = "exited".to_string();
        self.finished_at = Some(unix_now());
        self.exit_code = exit_code;
        self
    }

    /// Best-effort write; status files are advisory.
    pub fn write(&self, runtime_dir: &Path) {
        let path = runtime_dir.join(format!("status-{}.json", self.id));
        match serde_json::to_vec_pretty(self) {
            Ok(body) => {
                if let Err(e) = std::fs::write(&path, body) {
                    warn!(path = %path.display(), error = %e, "status write failed");
                }
            }
            Err(e) => warn!(error = %e, "status serialize failed"),
        }
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrips_through_json() {
        let status = WorkerStatus {
            id: "abc123".to_string(),
            status: "running".to_string(),
            started_at: 1_700_000_000,
            finished_at: None,
            exit_code: None,
        };
        let json = serde_json::to_string(&status).unwrap();
        // Optional fields are omitted while the worker runs.
        assert!(!json.contains("finished_at"));
        let back: WorkerStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, status);
    }

    #[test]
    fn exited_fills_in_the_tail_fields() {
        let status = WorkerStatus {
            id: "abc123".to_string(),
            status: "running".to_string(),
            started_at: 1,
            finished_at: None,
            exit_code: None,
        }
        .exited(Some(0));
        assert_eq!(status.status, "exited");
        assert_eq!(status.exit_code, Some(0));
        assert!(status.finished_at.is_some());
    }

    #[tokio::test]
    async fn wait_ready_times_out_without_listener() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = dir.path().join("missing.sock");
        let result = wait_ready(&endpoint, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(WorkerError::StartupTimeout(_))));
    }

    #[tokio::test]
    async fn wait_ready_connects_to_live_listener() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = dir.path().join("live.sock");
        let listener = tokio::net::UnixListener::bind(&endpoint).unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });
        wait_ready(&endpoint, Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn external_handle_unlinks_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = dir.path().join("stub.sock");
        std::fs::write(&endpoint, b"").unwrap();

        let handle = WorkerHandle::external(endpoint.clone());
        assert_eq!(handle.terminate(Duration::from_millis(10)).await, None);
        assert!(!endpoint.exists());
    }
}
