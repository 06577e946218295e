// ABOUTME: The per-session bridge worker: endpoint, accept loop, drain and exit
// ABOUTME: One connection at a time by default; a newcomer supersedes the old one

pub mod handlers;

pub use handlers::{HandlerSet, StreamRequest};

use crate::codec::ErrorKind;
use crate::config::BusConfig;
use crate::mux::{Multiplexer, MuxServices, StreamAcceptor};
use crate::rpc::RpcRegistry;
use serde_json::json;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What to do when a connection arrives while another is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttachPolicy {
    /// The new connection wins; the previous one is reset `Superseded`.
    /// This is what a refreshed browser tab needs.
    #[default]
    Supersede,
    /// The newcomer is dropped; the attached connection keeps the worker.
    Refuse,
    /// Any number of simultaneous connections.
    Multi,
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("endpoint setup failed: {0}")]
    Endpoint(#[from] std::io::Error),
}

/// The privileged per-session worker process body.
///
/// Spawned by the session manager, bound to one endpoint, torn down on
/// session end. Hosts the multiplexer and dispatcher for each accepted
/// connection.
pub struct BridgeWorker {
    config: BusConfig,
    registry: Arc<RpcRegistry>,
    acceptor: Arc<dyn StreamAcceptor>,
    policy: AttachPolicy,
}

impl BridgeWorker {
    /// A worker with the build's default handler set.
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            registry: default_registry(),
            acceptor: Arc::new(HandlerSet::new()),
            policy: AttachPolicy::default(),
        }
    }

    /// Replace the RPC handler table (tests install a controlled subset).
    pub fn with_registry(mut self, registry: Arc<RpcRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Replace the stream intake.
    pub fn with_acceptor(mut self, acceptor: Arc<dyn StreamAcceptor>) -> Self {
        self.acceptor = acceptor;
        self
    }

    pub fn with_policy(mut self, policy: AttachPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Bind the endpoint and serve until `shutdown` fires (SIGTERM, parent
    /// death, or session teardown closing the endpoint).
    ///
    /// On shutdown: stop accepting, reset live streams with `Shutdown`,
    /// let in-flight calls drain, then return so the process can exit 0.
    pub async fn run(self, endpoint: &Path, shutdown: CancellationToken) -> Result<(), BridgeError> {
        let listener = bind_endpoint(endpoint)?;
        info!(endpoint = %endpoint.display(), "bridge worker serving");

        let mut attached: Vec<Multiplexer> = Vec::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (conn, _addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    attached.retain(|mux| !mux.is_closed());

                    match self.policy {
                        AttachPolicy::Supersede => {
                            for previous in attached.drain(..) {
                                debug!("superseding previous connection");
                                previous.shutdown(ErrorKind::Superseded);
                            }
                        }
                        AttachPolicy::Refuse if !attached.is_empty() => {
                            debug!("refusing second attach");
                            drop(conn);
                            continue;
                        }
                        AttachPolicy::Refuse | AttachPolicy::Multi => {}
                    }

                    let mux = Multiplexer::serve(
                        conn,
                        self.config.clone(),
                        MuxServices {
                            registry: Some(self.registry.clone()),
                            acceptor: Some(self.acceptor.clone()),
                        },
                    );
                    attached.push(mux);
                }
            }
        }

        info!("bridge worker draining");
        for mux in &attached {
            mux.drain(ErrorKind::Shutdown, self.config.drain_window).await;
        }
        // The endpoint file is unlinked by the session manager; removing it
        // here too keeps standalone runs tidy.
        let _ = std::fs::remove_file(endpoint);
        Ok(())
    }
}

/// Bind the worker endpoint with owner-only permissions. A stale socket
/// from a crashed predecessor is replaced.
fn bind_endpoint(endpoint: &Path) -> Result<UnixListener, BridgeError> {
    if let Some(parent) = endpoint.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::remove_file(endpoint) {
        Ok(()) => debug!(endpoint = %endpoint.display(), "replaced stale endpoint"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let listener = UnixListener::bind(endpoint)?;
    std::fs::set_permissions(endpoint, std::fs::Permissions::from_mode(0o600))?;
    Ok(listener)
}

/// Shutdown signal for a standalone worker process: SIGTERM, or the parent
/// (the session manager) disappearing out from under us.
pub fn shutdown_signal() -> CancellationToken {
    let token = CancellationToken::new();

    {
        let token = token.clone();
        tokio::spawn(async move {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut term) => {
                    term.recv().await;
                    info!("SIGTERM received");
                    token.cancel();
                }
                Err(e) => warn!(error = %e, "cannot install SIGTERM handler"),
            }
        });
    }
    {
        let token = token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(2));
            loop {
                ticker.tick().await;
                // Re-parented to init: the session manager is gone.
                if unsafe { libc::getppid() } == 1 {
                    warn!("parent died; self-terminating");
                    token.cancel();
                    return;
                }
            }
        });
    }

    token
}

/// The worker-side RPC methods every build carries. Host-management
/// categories (docker, filesystem, system tools) are registered on top by
/// the embedding build.
pub fn default_registry() -> Arc<RpcRegistry> {
    RpcRegistry::builder()
        .register("system", "ping", 0..=0, |_ctx, _args, emitter| async move {
            emitter.result(json!("pong")).await;
        })
        .register("system", "version", 0..=0, |_ctx, _args, emitter| async move {
            emitter.result(json!(env!("CARGO_PKG_VERSION"))).await;
        })
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::CallEvent;
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::net::UnixStream;

    async fn start_worker(dir: &tempfile::TempDir, policy: AttachPolicy) -> (PathBuf, CancellationToken) {
        let endpoint = dir.path().join("bridge-test.sock");
        let shutdown = CancellationToken::new();
        let worker = BridgeWorker::new(BusConfig::default()).with_policy(policy);
        let run_endpoint = endpoint.clone();
        let run_shutdown = shutdown.clone();
        tokio::spawn(async move {
            worker.run(&run_endpoint, run_shutdown).await.unwrap();
        });
        crate::session::worker::wait_ready(&endpoint, Duration::from_secs(2))
            .await
            .unwrap();
        (endpoint, shutdown)
    }

    #[tokio::test]
    async fn serves_rpc_over_its_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let (endpoint, shutdown) = start_worker(&dir, AttachPolicy::Supersede).await;

        let conn = UnixStream::connect(&endpoint).await.unwrap();
        let client = Multiplexer::connect(conn, BusConfig::default());
        let value = client
            .call("system", "ping", &[])
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(value, json!("pong"));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn endpoint_mode_is_owner_only() {
        let dir = tempfile::tempdir().unwrap();
        let (endpoint, shutdown) = start_worker(&dir, AttachPolicy::Supersede).await;

        let mode = std::fs::metadata(&endpoint).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn second_attach_supersedes_first() {
        let dir = tempfile::tempdir().unwrap();
        let (endpoint, shutdown) = start_worker(&dir, AttachPolicy::Supersede).await;

        let first = Multiplexer::connect(
            UnixStream::connect(&endpoint).await.unwrap(),
            BusConfig::default(),
        );
        // Prove the first connection is live before the takeover.
        first
            .call("system", "ping", &[])
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        let second = Multiplexer::connect(
            UnixStream::connect(&endpoint).await.unwrap(),
            BusConfig::default(),
        );
        second
            .call("system", "ping", &[])
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        // The worker reset the first connection; its transport is gone.
        first.closed().await;
        assert!(first.is_closed());
        assert!(!second.is_closed());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn shutdown_drains_in_flight_calls() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = dir.path().join("bridge-drain.sock");
        let shutdown = CancellationToken::new();

        let registry = RpcRegistry::builder()
            .register("system", "slow", 0..=0, |_ctx, _args, emitter| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                emitter.result(json!("done")).await;
            })
            .build();
        let worker = BridgeWorker::new(BusConfig::default()).with_registry(registry);
        let run_endpoint = endpoint.clone();
        let run_shutdown = shutdown.clone();
        let worker_task = tokio::spawn(async move {
            worker.run(&run_endpoint, run_shutdown).await.unwrap();
        });
        crate::session::worker::wait_ready(&endpoint, Duration::from_secs(2))
            .await
            .unwrap();

        let client = Multiplexer::connect(
            UnixStream::connect(&endpoint).await.unwrap(),
            BusConfig::default(),
        );
        let mut call = client.call("system", "slow", &[]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Shutdown arrives while the call is in flight; the drain window
        // lets it finish.
        shutdown.cancel();
        match call.next().await {
            Some(CallEvent::Result(value)) => assert_eq!(value, json!("done")),
            other => panic!("unexpected: {other:?}"),
        }
        worker_task.await.unwrap();
    }
}
