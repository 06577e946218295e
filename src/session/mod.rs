// ABOUTME: Process-wide session registry: create, touch, revoke, terminate, reap
// ABOUTME: Each session owns exactly one worker; the reaper collects idle sessions

pub mod worker;

pub use worker::{ProcessSpawner, WorkerError, WorkerHandle, WorkerSpawner, WorkerStatus};

use crate::codec::ErrorKind;
use crate::config::BusConfig;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Opaque session identifier (128 random bits, hex).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        let hi: u64 = rand::random();
        let lo: u64 = rand::random();
        SessionId(format!("{hi:016x}{lo:016x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        SessionId(s.to_string())
    }
}

/// The authenticated principal a session runs as. Produced by the external
/// credential exchange; the bus never sees passwords.
#[derive(Debug, Clone)]
pub struct Principal {
    pub username: String,
    pub uid: u32,
    pub privileged: bool,
}

/// Session registry errors.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unknown session")]
    NotFound,

    #[error("session revoked")]
    Revoked,

    #[error("session has no live worker")]
    NoWorker,

    #[error(transparent)]
    Worker(#[from] WorkerError),
}

impl SessionError {
    /// The wire error kind this failure surfaces as.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::NotFound | SessionError::Revoked => ErrorKind::Unauthorized,
            SessionError::NoWorker | SessionError::Worker(_) => ErrorKind::BridgeUnavailable,
        }
    }
}

/// One authenticated principal's engagement with the system.
///
/// Mutated only through the narrow [`SessionManager`] interface; handlers
/// never touch session state directly.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    principal: Principal,
    created_at: Instant,
    created_at_unix: u64,
    last_seen: Mutex<Instant>,
    revoked: AtomicBool,
    shutdown_reason: Mutex<Option<ErrorKind>>,
    worker: Mutex<Option<WorkerHandle>>,
}

impl Session {
    fn new(id: SessionId, principal: Principal) -> Self {
        let now = Instant::now();
        Self {
            id,
            principal,
            created_at: now,
            created_at_unix: worker::unix_now(),
            last_seen: Mutex::new(now),
            revoked: AtomicBool::new(false),
            shutdown_reason: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_seen.lock().elapsed()
    }

    /// The worker's endpoint path, while one is attached.
    pub fn endpoint(&self) -> Option<PathBuf> {
        self.worker
            .lock()
            .as_ref()
            .map(|w| w.endpoint().to_path_buf())
    }

    pub fn worker_pid(&self) -> Option<u32> {
        self.worker.lock().as_ref().and_then(|w| w.pid())
    }

    pub fn shutdown_reason(&self) -> Option<ErrorKind> {
        *self.shutdown_reason.lock()
    }

    fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }
}

/// Process-wide registry of live sessions.
///
/// Reads dominate (every relayed frame resolves a session), so the map is
/// behind a reader-writer lock; mutation happens on login, logout and
/// reaping only.
pub struct SessionManager {
    config: BusConfig,
    spawner: Arc<dyn WorkerSpawner>,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
}

impl SessionManager {
    pub fn new(config: BusConfig, spawner: Arc<dyn WorkerSpawner>) -> Arc<Self> {
        Arc::new(Self {
            config,
            spawner,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Create a session for an authenticated principal: spawn its worker,
    /// wait for the endpoint to come up, record the handle.
    pub async fn create(&self, principal: Principal) -> Result<Arc<Session>, SessionError> {
        let id = SessionId::generate();
        let session = Arc::new(Session::new(id.clone(), principal));

        let handle = self
            .spawner
            .spawn(&id, &session.principal, &self.config)
            .await?;
        let endpoint = handle.endpoint().to_path_buf();

        if let Err(e) = worker::wait_ready(&endpoint, self.config.startup_timeout).await {
            // The worker never came up; reap what was spawned.
            handle.terminate(self.config.kill_grace).await;
            return Err(e.into());
        }

        WorkerStatus::running_since(&id, session.created_at_unix).write(&self.config.runtime_dir);
        *session.worker.lock() = Some(handle);
        self.sessions.write().insert(id.clone(), session.clone());
        info!(session = %id, user = %session.principal.username, "session created");
        Ok(session)
    }

    pub fn lookup(&self, id: &SessionId) -> Result<Arc<Session>, SessionError> {
        let session = self
            .sessions
            .read()
            .get(id)
            .cloned()
            .ok_or(SessionError::NotFound)?;
        if session.is_revoked() {
            return Err(SessionError::Revoked);
        }
        Ok(session)
    }

    /// The endpoint to dial for a session's worker.
    pub fn endpoint(&self, id: &SessionId) -> Result<PathBuf, SessionError> {
        self.lookup(id)?.endpoint().ok_or(SessionError::NoWorker)
    }

    /// Refresh liveness. Any relayed traffic counts, including in-stream
    /// Data, so long-running transfers keep their session alive.
    pub fn touch(&self, id: &SessionId) {
        if let Some(session) = self.sessions.read().get(id) {
            session.touch();
        }
    }

    /// Mark the session revoked: subsequent lookups fail `Unauthorized`.
    /// Idempotent; the worker keeps running until `terminate`.
    pub fn revoke(&self, id: &SessionId) {
        if let Some(session) = self.sessions.read().get(id) {
            session.revoked.store(true, Ordering::Release);
            debug!(session = %id, "session revoked");
        }
    }

    /// Tear a session down: revoke it, stop its worker, drop the record.
    /// Returns the worker's exit code when it exited within the grace
    /// window.
    pub async fn terminate(&self, id: &SessionId, reason: ErrorKind) -> Option<i32> {
        let session = self.sessions.write().remove(id)?;
        session.revoked.store(true, Ordering::Release);
        session.shutdown_reason.lock().get_or_insert(reason);

        let handle = session.worker.lock().take();
        let exit_code = match handle {
            Some(handle) => handle.terminate(self.config.kill_grace).await,
            None => None,
        };
        WorkerStatus::running_since(id, session.created_at_unix)
            .exited(exit_code)
            .write(&self.config.runtime_dir);
        info!(session = %id, %reason, "session terminated");
        exit_code
    }

    /// Sessions currently registered.
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// One reaper sweep: terminate sessions idle past the configured
    /// window. Takes a snapshot first so the lock is never held across a
    /// process kill. Returns how many sessions were collected.
    pub async fn reap_idle(&self) -> usize {
        let expired: Vec<SessionId> = {
            let sessions = self.sessions.read();
            sessions
                .values()
                .filter(|s| s.idle_for() > self.config.idle_window)
                .map(|s| s.id.clone())
                .collect()
        };

        let mut reaped = 0;
        for id in expired {
            warn!(session = %id, "idle window exceeded; reaping");
            self.terminate(&id, ErrorKind::SessionExpired).await;
            reaped += 1;
        }
        reaped
    }

    /// Spawn the periodic reaper. Runs until the returned handle is
    /// aborted.
    pub fn spawn_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.reaper_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.reap_idle().await;
            }
        })
    }

    /// Gateway shutdown: terminate every session.
    pub async fn shutdown_all(&self) {
        let ids: Vec<SessionId> = self.sessions.read().keys().cloned().collect();
        for id in ids {
            self.terminate(&id, ErrorKind::Shutdown).await;
        }
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::BoxFuture;

    /// Spawner that binds an endpoint in-process and accepts forever.
    struct StubSpawner {
        dir: PathBuf,
    }

    impl WorkerSpawner for StubSpawner {
        fn spawn(
            &self,
            session: &SessionId,
            _principal: &Principal,
            _config: &BusConfig,
        ) -> BoxFuture<'static, Result<WorkerHandle, WorkerError>> {
            let endpoint = self.dir.join(format!("bridge-{session}.sock"));
            Box::pin(async move {
                let listener = tokio::net::UnixListener::bind(&endpoint)?;
                tokio::spawn(async move {
                    while let Ok((conn, _)) = listener.accept().await {
                        drop(conn);
                    }
                });
                Ok(WorkerHandle::external(endpoint))
            })
        }
    }

    fn test_principal() -> Principal {
        Principal {
            username: "tester".to_string(),
            uid: 1000,
            privileged: false,
        }
    }

    fn manager(dir: &tempfile::TempDir, config: BusConfig) -> Arc<SessionManager> {
        let config = config.with_runtime_dir(dir.path());
        SessionManager::new(
            config,
            Arc::new(StubSpawner {
                dir: dir.path().to_path_buf(),
            }),
        )
    }

    #[tokio::test]
    async fn create_lookup_terminate() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir, BusConfig::default());

        let session = manager.create(test_principal()).await.unwrap();
        let id = session.id().clone();
        assert!(manager.lookup(&id).is_ok());
        assert!(manager.endpoint(&id).unwrap().exists());

        manager.terminate(&id, ErrorKind::Shutdown).await;
        assert!(matches!(manager.lookup(&id), Err(SessionError::NotFound)));
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn revoke_is_idempotent_and_blocks_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir, BusConfig::default());

        let session = manager.create(test_principal()).await.unwrap();
        let id = session.id().clone();
        manager.revoke(&id);
        manager.revoke(&id);
        assert!(matches!(manager.lookup(&id), Err(SessionError::Revoked)));
        assert_eq!(manager.lookup(&id).unwrap_err().kind(), ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn touch_defers_the_reaper() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(
            &dir,
            BusConfig::default().with_idle_window(std::time::Duration::from_millis(80)),
        );

        let session = manager.create(test_principal()).await.unwrap();
        let id = session.id().clone();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        manager.touch(&id);
        assert_eq!(manager.reap_idle().await, 0);

        tokio::time::sleep(std::time::Duration::from_millis(120)).await;
        assert_eq!(manager.reap_idle().await, 1);
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn unknown_session_is_unauthorized() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir, BusConfig::default());
        let err = manager.lookup(&SessionId::from("deadbeef")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn terminate_writes_exited_status() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir, BusConfig::default());

        let session = manager.create(test_principal()).await.unwrap();
        let id = session.id().clone();
        manager.terminate(&id, ErrorKind::Shutdown).await;

        let path = dir.path().join(format!("status-{id}.json"));
        let status: WorkerStatus =
            serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(status.status, "exited");
        assert!(status.finished_at.is_some());
    }

    #[test]
    fn session_ids_are_unique_and_opaque() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }
}
