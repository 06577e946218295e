// ABOUTME: Front door: terminates browser WebSockets and relays bytes to session workers
// ABOUTME: The gateway never parses bus frames; it is a length-respecting relay

use crate::codec::ErrorKind;
use crate::session::{SessionId, SessionManager};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UnixStream};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Refresh `last_seen` at most this often per connection; every relayed
/// frame counts as liveness but hammering the registry per frame is waste.
const TOUCH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("websocket handshake failed: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("accept failed: {0}")]
    Accept(#[from] std::io::Error),
}

/// The browser-facing front door.
///
/// One WebSocket per session tab; frames are relayed verbatim to the
/// session worker's endpoint. Login/logout and the health probe live in
/// the HTTP layer around this, not here.
pub struct Gateway {
    manager: Arc<SessionManager>,
}

impl Gateway {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Accept browser connections until `shutdown` fires.
    pub async fn run(
        &self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), GatewayError> {
        info!(addr = ?listener.local_addr().ok(), "gateway listening");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    debug!(%peer, "browser connected");
                    let manager = self.manager.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_socket(manager, stream).await {
                            debug!(error = %e, "connection ended with error");
                        }
                    });
                }
            }
        }
    }
}

/// Serve one already-accepted browser socket: WebSocket upgrade, session
/// resolution, worker dial, then the transparent byte pump.
///
/// Generic over the transport so tests can drive it with an in-process
/// duplex pipe.
pub async fn serve_socket<S>(manager: Arc<SessionManager>, stream: S) -> Result<(), GatewayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // The session is resolved during the HTTP upgrade so an unauthorized
    // client is rejected with a status code, not a doomed socket.
    let mut session_id: Option<SessionId> = None;
    let callback = |request: &Request, response: Response| {
        match extract_session(request) {
            Some(id) if manager.lookup(&id).is_ok() => {
                session_id = Some(id);
                Ok(response)
            }
            _ => Err(reject_upgrade()),
        }
    };

    let ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
    let Some(session_id) = session_id else {
        // The callback rejected; accept_hdr_async already returned Err.
        return Ok(());
    };

    // Re-resolve after the handshake; the reaper may have won the race.
    let session = match manager.lookup(&session_id) {
        Ok(session) => session,
        Err(e) => {
            close_ws(ws, e.kind()).await;
            return Ok(());
        }
    };
    let endpoint = match session.endpoint() {
        Some(endpoint) => endpoint,
        None => {
            close_ws(ws, ErrorKind::BridgeUnavailable).await;
            return Ok(());
        }
    };

    // One dial, no retries at this layer.
    let worker = match UnixStream::connect(&endpoint).await {
        Ok(worker) => worker,
        Err(e) => {
            warn!(session = %session_id, error = %e, "worker dial failed");
            close_ws(ws, ErrorKind::BridgeUnavailable).await;
            return Ok(());
        }
    };

    pump(manager, session, ws, worker).await;
    Ok(())
}

/// The relay proper: WS binary frames one way, worker bytes the other.
/// Traffic in either direction refreshes the session's `last_seen`.
async fn pump<S>(
    manager: Arc<SessionManager>,
    session: Arc<crate::session::Session>,
    ws: WebSocketStream<S>,
    worker: UnixStream,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let session_id = session.id().clone();
    let (mut ws_sink, mut ws_stream) = ws.split();
    let (mut worker_read, mut worker_write) = worker.into_split();
    let mut buf = vec![0u8; 32 * 1024];
    let mut last_touch = Instant::now();

    loop {
        tokio::select! {
            message = ws_stream.next() => match message {
                Some(Ok(Message::Binary(data))) => {
                    if last_touch.elapsed() >= TOUCH_INTERVAL {
                        manager.touch(&session_id);
                        last_touch = Instant::now();
                    }
                    if worker_write.write_all(&data).await.is_err() {
                        let reason = teardown_reason(&manager, &session);
                        let _ = ws_sink
                            .send(Message::Close(Some(close_frame(reason))))
                            .await;
                        break;
                    }
                }
                // Browser went away: close our half toward the worker; the
                // worker sees EOF and resets the connection's streams.
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    let _ = worker_write.shutdown().await;
                    break;
                }
                // Text frames are not part of the protocol; WS ping/pong is
                // answered by the library.
                Some(Ok(_)) => {}
            },
            read = worker_read.read(&mut buf) => match read {
                Ok(0) | Err(_) => {
                    let reason = teardown_reason(&manager, &session);
                    debug!(session = %session_id, %reason, "worker side closed");
                    let _ = ws_sink
                        .send(Message::Close(Some(close_frame(reason))))
                        .await;
                    break;
                }
                Ok(n) => {
                    if last_touch.elapsed() >= TOUCH_INTERVAL {
                        manager.touch(&session_id);
                        last_touch = Instant::now();
                    }
                    let payload = Bytes::copy_from_slice(&buf[..n]);
                    if ws_sink.send(Message::Binary(payload)).await.is_err() {
                        let _ = worker_write.shutdown().await;
                        break;
                    }
                }
            }
        }
    }
}

/// Why the worker side went away, best effort, for the WS close frame.
fn teardown_reason(manager: &SessionManager, session: &crate::session::Session) -> ErrorKind {
    if let Some(reason) = session.shutdown_reason() {
        return reason;
    }
    match manager.lookup(session.id()) {
        // Session is fine but its worker is not.
        Ok(_) => ErrorKind::BridgeUnavailable,
        Err(e) => e.kind(),
    }
}

fn extract_session(request: &Request) -> Option<SessionId> {
    let query = request.uri().query()?;
    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix("session=") {
            if !value.is_empty() {
                return Some(SessionId::from(value));
            }
        }
    }
    None
}

fn reject_upgrade() -> ErrorResponse {
    let mut response = ErrorResponse::new(None);
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}

fn close_frame(reason: ErrorKind) -> CloseFrame {
    // 4000-4999 is the private-use close code range; offset by the wire
    // error kind so the UI can map it back.
    CloseFrame {
        code: CloseCode::Library(4000 + u8::from(reason) as u16),
        reason: reason.name().into(),
    }
}

async fn close_ws<S>(ws: WebSocketStream<S>, reason: ErrorKind)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, _) = ws.split();
    let _ = sink.send(Message::Close(Some(close_frame(reason)))).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;
    use crate::session::{Principal, WorkerError, WorkerHandle, WorkerSpawner};
    use futures_util::future::BoxFuture;
    use std::path::PathBuf;

    struct NullSpawner {
        dir: PathBuf,
    }

    impl WorkerSpawner for NullSpawner {
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

    fn manager(dir: &tempfile::TempDir) -> Arc<SessionManager> {
        SessionManager::new(
            BusConfig::default().with_runtime_dir(dir.path()),
            Arc::new(NullSpawner {
                dir: dir.path().to_path_buf(),
            }),
        )
    }

    #[tokio::test]
    async fn handshake_without_session_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);

        let (client, server) = tokio::io::duplex(16 * 1024);
        let server_task = tokio::spawn(serve_socket(manager, server));

        let result = tokio_tungstenite::client_async("ws://bus.local/bus", client).await;
        match result {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            }
            other => panic!("expected 401, got {other:?}"),
        }
        assert!(server_task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn handshake_with_unknown_session_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);

        let (client, server) = tokio::io::duplex(16 * 1024);
        tokio::spawn(serve_socket(manager, server));

        let result =
            tokio_tungstenite::client_async("ws://bus.local/bus?session=deadbeef", client).await;
        assert!(matches!(
            result,
            Err(tokio_tungstenite::tungstenite::Error::Http(ref response))
                if response.status() == StatusCode::UNAUTHORIZED
        ));
    }

    #[tokio::test]
    async fn handshake_with_live_session_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        let session = manager
            .create(Principal {
                username: "tester".to_string(),
                uid: 1000,
                privileged: false,
            })
            .await
            .unwrap();

        let (client, server) = tokio::io::duplex(16 * 1024);
        tokio::spawn(serve_socket(manager, server));

        let url = format!("ws://bus.local/bus?session={}", session.id());
        let (ws, _response) = tokio_tungstenite::client_async(url, client).await.unwrap();
        drop(ws);
    }

    #[test]
    fn session_extraction_from_query() {
        let request = Request::builder()
            .uri("ws://host/bus?a=1&session=cafebabe&b=2")
            .body(())
            .unwrap();
        assert_eq!(
            extract_session(&request),
            Some(SessionId::from("cafebabe"))
        );

        let request = Request::builder().uri("ws://host/bus").body(()).unwrap();
        assert_eq!(extract_session(&request), None);
    }

    #[test]
    fn close_codes_land_in_private_range() {
        let frame = close_frame(ErrorKind::SessionExpired);
        assert_eq!(frame.code, CloseCode::Library(4011));
        assert_eq!(frame.reason.as_str(), "SessionExpired");
    }
}
