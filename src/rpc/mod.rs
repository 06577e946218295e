// ABOUTME: RPC registry and dispatcher for named (category, method) handlers
// ABOUTME: The registry is assembled once at startup; dispatch tracks live calls for cancellation

pub mod emitter;

pub use emitter::Emitter;

use crate::codec::ErrorKind;
use crate::codec::Frame;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error};

/// Handler function: `(cancellation_token, args, emitter)`.
///
/// Handlers are expected to call exactly one of `emitter.result` /
/// `emitter.error`, and to observe the token at every I/O boundary. The
/// dispatcher backstops both: a handler returning without a terminal frame
/// yields `Cancelled` (if its token fired) or `Internal`; a panicking
/// handler yields `Internal`.
pub type HandlerFn =
    Arc<dyn Fn(CancellationToken, Vec<String>, Emitter) -> BoxFuture<'static, ()> + Send + Sync>;

struct Registration {
    arity: RangeInclusive<usize>,
    func: HandlerFn,
}

/// Read-only handler table keyed by `(category, method)`.
///
/// Built once by [`RegistryBuilder`] before the worker starts serving;
/// lookups afterwards need no synchronization.
pub struct RpcRegistry {
    handlers: HashMap<(String, String), Registration>,
}

impl RpcRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder {
            handlers: HashMap::new(),
        }
    }

    fn lookup(&self, category: &str, method: &str) -> Option<&Registration> {
        self.handlers
            .get(&(category.to_string(), method.to_string()))
    }

    pub fn contains(&self, category: &str, method: &str) -> bool {
        self.lookup(category, method).is_some()
    }

    /// Registered `(category, method)` pairs, for startup logging.
    pub fn methods(&self) -> Vec<(String, String)> {
        self.handlers.keys().cloned().collect()
    }
}

impl std::fmt::Debug for RpcRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcRegistry")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// Assembles the handler table for one worker build.
///
/// Tests install a controlled subset the same way production installs the
/// full set; there is no global registration.
pub struct RegistryBuilder {
    handlers: HashMap<(String, String), Registration>,
}

impl RegistryBuilder {
    /// Register a handler accepting between `arity.start()` and
    /// `arity.end()` arguments. Re-registering a name replaces the
    /// previous handler.
    pub fn register<F, Fut>(
        mut self,
        category: &str,
        method: &str,
        arity: RangeInclusive<usize>,
        func: F,
    ) -> Self
    where
        F: Fn(CancellationToken, Vec<String>, Emitter) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let func: HandlerFn = Arc::new(move |ctx, args, emitter| func(ctx, args, emitter).boxed());
        self.handlers.insert(
            (category.to_string(), method.to_string()),
            Registration { arity, func },
        );
        self
    }

    pub fn build(self) -> Arc<RpcRegistry> {
        Arc::new(RpcRegistry {
            handlers: self.handlers,
        })
    }
}

/// Dispatch failures that are protocol violations rather than call-level
/// errors. The connection owner must tear the transport down on these.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("request id {0} already has a call in flight")]
    DuplicateRequest(u32),
}

/// Tracks live calls for one connection and runs handlers to completion.
pub struct Dispatcher {
    registry: Arc<RpcRegistry>,
    out: mpsc::Sender<Frame>,
    live: Arc<Mutex<HashMap<u32, CancellationToken>>>,
    root: CancellationToken,
    tracker: TaskTracker,
}

impl Dispatcher {
    /// `out` is the connection's bounded RPC frame queue; `root` is the
    /// connection-level cancellation token (session teardown and transport
    /// failure both cancel it).
    pub fn new(registry: Arc<RpcRegistry>, out: mpsc::Sender<Frame>, root: CancellationToken) -> Self {
        Self {
            registry,
            out,
            live: Arc::new(Mutex::new(HashMap::new())),
            root,
            tracker: TaskTracker::new(),
        }
    }

    /// Number of calls currently in flight.
    pub fn live_calls(&self) -> usize {
        self.live.lock().len()
    }

    /// Dispatch one RPC_CALL frame. Validation failures are emitted as
    /// call-level errors; only a duplicate request id escalates.
    pub fn dispatch(
        &self,
        request_id: u32,
        category: String,
        method: String,
        args: Vec<String>,
    ) -> Result<(), DispatchError> {
        let emitter = Emitter::new(request_id, self.out.clone());

        let registration = match self.registry.lookup(&category, &method) {
            Some(r) => r,
            None => {
                debug!(%category, %method, request_id, "unknown rpc method");
                self.spawn_terminal(
                    emitter,
                    ErrorKind::NotFound,
                    format!("unknown method {category}.{method}"),
                );
                return Ok(());
            }
        };

        if !registration.arity.contains(&args.len()) {
            self.spawn_terminal(
                emitter,
                ErrorKind::InvalidArgs,
                format!(
                    "{category}.{method} takes {:?} args, got {}",
                    registration.arity,
                    args.len()
                ),
            );
            return Ok(());
        }

        {
            let mut live = self.live.lock();
            if live.contains_key(&request_id) {
                return Err(DispatchError::DuplicateRequest(request_id));
            }
            let token = self.root.child_token();
            live.insert(request_id, token.clone());

            let fut = (registration.func)(token.clone(), args, emitter.clone());
            let live_map = self.live.clone();
            self.tracker.spawn(async move {
                let outcome = std::panic::AssertUnwindSafe(fut).catch_unwind().await;
                live_map.lock().remove(&request_id);

                match outcome {
                    Ok(()) => {
                        if !emitter.is_terminal() {
                            if token.is_cancelled() {
                                emitter.error(ErrorKind::Cancelled, "call cancelled").await;
                            } else {
                                emitter
                                    .error(ErrorKind::Internal, "handler returned no result")
                                    .await;
                            }
                        }
                    }
                    Err(panic) => {
                        let msg = panic_message(&panic);
                        error!(request_id, "rpc handler panicked: {msg}");
                        emitter.error(ErrorKind::Internal, "handler panicked").await;
                    }
                }
            });
        }
        Ok(())
    }

    /// Cancel one live call; no-op for unknown ids (the call may already
    /// have finished).
    pub fn cancel(&self, request_id: u32) {
        if let Some(token) = self.live.lock().get(&request_id) {
            token.cancel();
        }
    }

    /// Cancel every live call. Used on session teardown and transport loss.
    pub fn cancel_all(&self) {
        self.root.cancel();
    }

    /// Stop accepting new work and wait up to `window` for in-flight calls
    /// to finish. Returns `true` if everything drained in time.
    pub async fn drain(&self, window: Duration) -> bool {
        self.tracker.close();
        tokio::time::timeout(window, self.tracker.wait())
            .await
            .is_ok()
    }

    fn spawn_terminal(&self, emitter: Emitter, kind: ErrorKind, message: String) {
        // Emission may suspend on the bounded queue; never block dispatch.
        self.tracker.spawn(async move {
            emitter.error(kind, message).await;
        });
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("live", &self.live_calls())
            .finish_non_exhaustive()
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_registry() -> Arc<RpcRegistry> {
        RpcRegistry::builder()
            .register("system", "echo", 1..=1, |_ctx, args, emitter| async move {
                emitter.result(json!(args[0])).await;
            })
            .register("system", "hang", 0..=0, |ctx, _args, emitter| async move {
                ctx.cancelled().await;
                // Cooperative cancellation: return without a terminal frame
                // and let the dispatcher emit Cancelled.
                let _ = emitter;
            })
            .register("system", "boom", 0..=0, |_ctx, _args, _emitter| async move {
                panic!("kaboom");
            })
            .register("system", "silent", 0..=0, |_ctx, _args, _emitter| async move {})
            .build()
    }

    fn dispatcher() -> (Dispatcher, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(16);
        let dispatcher = Dispatcher::new(test_registry(), tx, CancellationToken::new());
        (dispatcher, rx)
    }

    #[tokio::test]
    async fn happy_path_result() {
        let (dispatcher, mut rx) = dispatcher();
        dispatcher
            .dispatch(7, "system".into(), "echo".into(), vec!["hi".into()])
            .unwrap();

        match rx.recv().await {
            Some(Frame::RpcResult { request_id, value }) => {
                assert_eq!(request_id, 7);
                assert_eq!(value, json!("hi"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_method_emits_not_found() {
        let (dispatcher, mut rx) = dispatcher();
        dispatcher
            .dispatch(1, "docker".into(), "nope".into(), vec![])
            .unwrap();

        match rx.recv().await {
            Some(Frame::RpcError { kind, .. }) => assert_eq!(kind, ErrorKind::NotFound),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn wrong_arity_emits_invalid_args() {
        let (dispatcher, mut rx) = dispatcher();
        dispatcher
            .dispatch(2, "system".into(), "echo".into(), vec![])
            .unwrap();

        match rx.recv().await {
            Some(Frame::RpcError { kind, .. }) => assert_eq!(kind, ErrorKind::InvalidArgs),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_request_id_is_protocol_error() {
        let (dispatcher, _rx) = dispatcher();
        dispatcher
            .dispatch(3, "system".into(), "hang".into(), vec![])
            .unwrap();
        let err = dispatcher
            .dispatch(3, "system".into(), "hang".into(), vec![])
            .unwrap_err();
        assert!(matches!(err, DispatchError::DuplicateRequest(3)));
    }

    #[tokio::test]
    async fn cancel_emits_cancelled() {
        let (dispatcher, mut rx) = dispatcher();
        dispatcher
            .dispatch(4, "system".into(), "hang".into(), vec![])
            .unwrap();
        // Let the handler park on its token first.
        tokio::task::yield_now().await;
        dispatcher.cancel(4);

        match rx.recv().await {
            Some(Frame::RpcError { request_id, kind, .. }) => {
                assert_eq!(request_id, 4);
                assert_eq!(kind, ErrorKind::Cancelled);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(dispatcher.live_calls(), 0);
    }

    #[tokio::test]
    async fn panic_emits_internal() {
        let (dispatcher, mut rx) = dispatcher();
        dispatcher
            .dispatch(5, "system".into(), "boom".into(), vec![])
            .unwrap();

        match rx.recv().await {
            Some(Frame::RpcError { kind, .. }) => assert_eq!(kind, ErrorKind::Internal),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn silent_handler_backstopped_with_internal() {
        let (dispatcher, mut rx) = dispatcher();
        dispatcher
            .dispatch(6, "system".into(), "silent".into(), vec![])
            .unwrap();

        match rx.recv().await {
            Some(Frame::RpcError { kind, .. }) => assert_eq!(kind, ErrorKind::Internal),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn drain_waits_for_live_calls() {
        let (dispatcher, mut rx) = dispatcher();
        dispatcher
            .dispatch(8, "system".into(), "echo".into(), vec!["x".into()])
            .unwrap();
        assert!(dispatcher.drain(Duration::from_secs(1)).await);
        assert!(matches!(rx.recv().await, Some(Frame::RpcResult { .. })));
    }

    #[tokio::test]
    async fn cancel_all_cancels_every_live_call() {
        let (dispatcher, mut rx) = dispatcher();
        dispatcher
            .dispatch(10, "system".into(), "hang".into(), vec![])
            .unwrap();
        dispatcher
            .dispatch(12, "system".into(), "hang".into(), vec![])
            .unwrap();
        tokio::task::yield_now().await;
        dispatcher.cancel_all();

        let mut cancelled = Vec::new();
        for _ in 0..2 {
            match rx.recv().await {
                Some(Frame::RpcError { request_id, kind, .. }) => {
                    assert_eq!(kind, ErrorKind::Cancelled);
                    cancelled.push(request_id);
                }
                other => panic!("unexpected: {other:?}"),
            }
        }
        cancelled.sort_unstable();
        assert_eq!(cancelled, vec![10, 12]);
    }
}
