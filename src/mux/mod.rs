// ABOUTME: Stream multiplexer: many logical streams and RPC calls over one framed transport
// ABOUTME: Runs a read pump, a fair write pump, and a liveness ping per connection

pub mod stream;
pub mod window;

pub use stream::{BusStream, Role, StreamEvent, StreamState};

use crate::codec::{CodecError, ErrorKind, Frame};
use crate::config::BusConfig;
use crate::connection::{FrameReader, FrameWriter};
use crate::rpc::{DispatchError, Dispatcher, RpcRegistry};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use stream::StreamShared;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{StreamExt, StreamMap};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Messages for the write pump's priority lane. Control always jumps the
/// queue ahead of stream Data.
#[derive(Debug)]
pub(crate) enum MuxControl {
    /// A small control frame: WINDOW, PING, PONG, or a client-side error
    /// reply. Never bulk Data.
    Frame(Frame),
    /// A locally opened stream: register its outbox, then emit OPEN.
    OpenStream {
        id: u32,
        open: Frame,
        outbox_rx: mpsc::Receiver<Frame>,
    },
    /// A remotely opened stream: register its outbox only.
    RegisterOutbox {
        id: u32,
        rx: mpsc::Receiver<Frame>,
    },
    /// Tear a stream down, dropping its queues; optionally tell the peer.
    ResetStream {
        id: u32,
        reason: ErrorKind,
        notify_peer: bool,
    },
}

/// Receives streams opened by the peer. The bridge worker installs its
/// handler catalogue here; a mux without an acceptor resets incoming opens.
pub trait StreamAcceptor: Send + Sync + 'static {
    /// Take ownership of a newly opened stream. Must not block; spawn for
    /// anything long-running. `token` is cancelled when the stream is reset
    /// or the connection goes away.
    fn accept(&self, tag: String, args: Vec<String>, stream: BusStream, token: CancellationToken);
}

/// Inbound services an acceptor-side mux runs.
#[derive(Default)]
pub struct MuxServices {
    /// RPC handler table; calls are rejected `NotFound` without one.
    pub registry: Option<Arc<RpcRegistry>>,
    /// Stream intake; opens are reset without one.
    pub acceptor: Option<Arc<dyn StreamAcceptor>>,
}

/// Events observed by the caller of an RPC.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    Progress(serde_json::Value),
    Result(serde_json::Value),
    Error { kind: ErrorKind, message: String },
}

/// Multiplexer API errors.
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("connection closed: {0}")]
    Closed(ErrorKind),

    #[error("rpc failed: {kind}: {message}")]
    Rpc { kind: ErrorKind, message: String },

    #[error("only the opening side may originate streams and calls")]
    NotOpener,
}

struct StreamSlot {
    shared: Arc<StreamShared>,
    inbound_tx: mpsc::UnboundedSender<StreamEvent>,
    handler_token: Option<CancellationToken>,
    result_seen: bool,
}

struct MuxInner {
    config: BusConfig,
    role: Role,
    control_tx: mpsc::UnboundedSender<MuxControl>,
    rpc_tx: mpsc::Sender<Frame>,
    // Held only for table mutation, never across I/O.
    streams: Mutex<HashMap<u32, StreamSlot>>,
    pending_calls: Mutex<HashMap<u32, mpsc::UnboundedSender<CallEvent>>>,
    // Openers allocate odd stream ids and even request ids, so a RESET can
    // be routed by id parity alone.
    next_stream_id: AtomicU32,
    next_request_id: AtomicU32,
    highest_remote_stream: AtomicU32,
    inbound_ping_pending: AtomicBool,
    outstanding_ping: Mutex<Option<(u64, oneshot::Sender<()>)>>,
    handler_root: CancellationToken,
    shutdown: CancellationToken,
    close_reason: Mutex<Option<ErrorKind>>,
    dispatcher: Option<Dispatcher>,
    acceptor: Option<Arc<dyn StreamAcceptor>>,
}

/// One end of a multiplexed connection.
///
/// Cloneable handle; the pumps run as background tasks and stop when the
/// connection fails, the peer goes away, or [`Multiplexer::shutdown`] is
/// called.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<MuxInner>,
}

impl Multiplexer {
    /// Attach the opener side (the browser's seat; also what tests and the
    /// gateway-adjacent tooling use to drive a worker).
    pub fn connect<T>(transport: T, config: BusConfig) -> Multiplexer
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::start(transport, Role::Opener, config, MuxServices::default())
    }

    /// Attach the acceptor side: dispatch RPC calls through `services`'
    /// registry and hand incoming streams to its acceptor.
    pub fn serve<T>(transport: T, config: BusConfig, services: MuxServices) -> Multiplexer
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::start(transport, Role::Acceptor, config, services)
    }

    fn start<T>(transport: T, role: Role, config: BusConfig, services: MuxServices) -> Multiplexer
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(transport);
        let reader = FrameReader::new(read, config.max_frame_size);
        let writer = FrameWriter::new(write, config.max_frame_size);

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (rpc_tx, rpc_rx) = mpsc::channel(config.rpc_queue);

        let shutdown = CancellationToken::new();
        let dispatcher = services
            .registry
            .map(|registry| Dispatcher::new(registry, rpc_tx.clone(), CancellationToken::new()));

        let inner = Arc::new(MuxInner {
            config,
            role,
            control_tx,
            rpc_tx,
            streams: Mutex::new(HashMap::new()),
            pending_calls: Mutex::new(HashMap::new()),
            next_stream_id: AtomicU32::new(1),
            next_request_id: AtomicU32::new(2),
            highest_remote_stream: AtomicU32::new(0),
            inbound_ping_pending: AtomicBool::new(false),
            outstanding_ping: Mutex::new(None),
            handler_root: CancellationToken::new(),
            shutdown,
            close_reason: Mutex::new(None),
            dispatcher,
            acceptor: services.acceptor,
        });

        tokio::spawn(read_pump(inner.clone(), reader));
        tokio::spawn(write_pump(inner.clone(), writer, control_rx, rpc_rx));
        tokio::spawn(keepalive(inner.clone()));

        Multiplexer { inner }
    }

    /// Invoke a named RPC. Events arrive on the returned handle.
    pub async fn call(
        &self,
        category: &str,
        method: &str,
        args: &[&str],
    ) -> Result<CallHandle, MuxError> {
        if self.inner.role != Role::Opener {
            return Err(MuxError::NotOpener);
        }
        self.check_open()?;

        let request_id = self.inner.next_request_id.fetch_add(2, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.pending_calls.lock().insert(request_id, tx);

        let frame = Frame::RpcCall {
            request_id,
            category: category.to_string(),
            method: method.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        };
        if self.inner.rpc_tx.send(frame).await.is_err() {
            self.inner.pending_calls.lock().remove(&request_id);
            return Err(MuxError::Closed(self.reason_or_transport()));
        }

        Ok(CallHandle {
            request_id,
            rx,
            control: self.inner.control_tx.clone(),
        })
    }

    /// Open a logical stream of the given type.
    pub async fn open_stream(&self, tag: &str, args: &[&str]) -> Result<BusStream, MuxError> {
        if self.inner.role != Role::Opener {
            return Err(MuxError::NotOpener);
        }
        self.check_open()?;

        let stream_id = self.inner.next_stream_id.fetch_add(2, Ordering::Relaxed);
        let shared = StreamShared::new(self.inner.config.stream_window);
        let (outbox_tx, outbox_rx) = mpsc::channel(self.inner.config.stream_outbox);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        self.inner.streams.lock().insert(
            stream_id,
            StreamSlot {
                shared: shared.clone(),
                inbound_tx,
                handler_token: None,
                result_seen: false,
            },
        );

        let open = Frame::StreamOpen {
            stream_id,
            tag: tag.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        };
        if self
            .inner
            .control_tx
            .send(MuxControl::OpenStream {
                id: stream_id,
                open,
                outbox_rx,
            })
            .is_err()
        {
            self.inner.streams.lock().remove(&stream_id);
            return Err(MuxError::Closed(self.reason_or_transport()));
        }

        Ok(BusStream::new(
            stream_id,
            Role::Opener,
            shared,
            outbox_tx,
            self.inner.control_tx.clone(),
            inbound_rx,
            self.inner.config.max_frame_size as usize,
        ))
    }

    /// Tear the connection down: every stream resets with `reason`, every
    /// in-flight call is cancelled. Idempotent.
    pub fn shutdown(&self, reason: ErrorKind) {
        self.inner.fail(reason);
    }

    /// Graceful acceptor-side shutdown: reset live streams with `reason`
    /// (the peer is told), let in-flight RPC calls finish within `window`,
    /// flush their terminal frames, then tear down.
    pub async fn drain(&self, reason: ErrorKind, window: std::time::Duration) {
        let ids: Vec<u32> = self.inner.streams.lock().keys().copied().collect();
        for id in ids {
            let _ = self.inner.control_tx.send(MuxControl::ResetStream {
                id,
                reason,
                notify_peer: true,
            });
        }

        if let Some(dispatcher) = &self.inner.dispatcher {
            dispatcher.drain(window).await;
        }

        // Handlers have finished; wait for the write pump to empty the RPC
        // queue so terminal frames reach the wire before teardown.
        let flush_deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(1);
        while self.inner.rpc_tx.capacity() < self.inner.config.rpc_queue
            && tokio::time::Instant::now() < flush_deadline
        {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        self.inner.fail(reason);
    }

    /// Resolves when the connection has been torn down.
    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Why the connection closed, if it has.
    pub fn close_reason(&self) -> Option<ErrorKind> {
        *self.inner.close_reason.lock()
    }

    /// Streams currently tracked. The count drops as streams finish.
    pub fn live_streams(&self) -> usize {
        self.inner.streams.lock().len()
    }

    fn check_open(&self) -> Result<(), MuxError> {
        if self.is_closed() {
            return Err(MuxError::Closed(self.reason_or_transport()));
        }
        Ok(())
    }

    fn reason_or_transport(&self) -> ErrorKind {
        self.close_reason().unwrap_or(ErrorKind::TransportClosed)
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("role", &self.inner.role)
            .field("streams", &self.live_streams())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Client-side handle to one in-flight RPC call.
#[derive(Debug)]
pub struct CallHandle {
    request_id: u32,
    rx: mpsc::UnboundedReceiver<CallEvent>,
    control: mpsc::UnboundedSender<MuxControl>,
}

impl CallHandle {
    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    /// Next event; `None` once the call is finished and drained.
    pub async fn next(&mut self) -> Option<CallEvent> {
        self.rx.recv().await
    }

    /// Ask the worker to cancel this call. The terminal frame (usually
    /// `Cancelled`) still arrives through [`CallHandle::next`].
    pub fn cancel(&self) {
        let _ = self.control.send(MuxControl::Frame(Frame::StreamReset {
            stream_id: self.request_id,
            reason: ErrorKind::Cancelled,
        }));
    }

    /// Drain events until the terminal one, discarding progress.
    pub async fn wait(mut self) -> Result<serde_json::Value, MuxError> {
        loop {
            match self.next().await {
                Some(CallEvent::Progress(_)) => continue,
                Some(CallEvent::Result(value)) => return Ok(value),
                Some(CallEvent::Error { kind, message }) => {
                    return Err(MuxError::Rpc { kind, message });
                }
                None => return Err(MuxError::Closed(ErrorKind::TransportClosed)),
            }
        }
    }
}

// ─── pumps ──────────────────────────────────────────────────────────────

async fn read_pump<R>(inner: Arc<MuxInner>, mut reader: FrameReader<R>)
where
    R: AsyncRead + Unpin,
{
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            result = reader.read_frame() => match result {
                Ok(Some(frame)) => {
                    trace!(?frame, "frame in");
                    if let Err(kind) = inner.handle_frame(frame) {
                        warn!(%kind, "inbound frame violated the protocol");
                        inner.fail(kind);
                        return;
                    }
                }
                Ok(None) => {
                    debug!("peer closed the transport");
                    inner.fail(ErrorKind::TransportClosed);
                    return;
                }
                Err(e) => {
                    let kind = match &e {
                        CodecError::Io(_) => ErrorKind::TransportClosed,
                        _ => ErrorKind::ProtocolError,
                    };
                    warn!(error = %e, "read pump failed");
                    inner.fail(kind);
                    return;
                }
            }
        }
    }
}

async fn write_pump<W>(
    inner: Arc<MuxInner>,
    mut writer: FrameWriter<W>,
    mut control_rx: mpsc::UnboundedReceiver<MuxControl>,
    mut rpc_rx: mpsc::Receiver<Frame>,
) where
    W: AsyncWrite + Unpin,
{
    // Per-stream outboxes drained round-robin; StreamMap rotates its poll
    // start so one busy upload cannot starve the rest.
    let mut outboxes: StreamMap<u32, ReceiverStream<Frame>> = StreamMap::new();

    loop {
        let result: Result<(), CodecError> = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => {
                let _ = writer.shutdown().await;
                return;
            }
            maybe = control_rx.recv() => match maybe {
                None => return,
                Some(ctrl) => handle_control(&inner, ctrl, &mut writer, &mut outboxes).await,
            },
            Some(frame) = rpc_rx.recv() => writer.write_frame(&frame).await,
            Some((id, frame)) = outboxes.next(), if !outboxes.is_empty() => {
                let closes = matches!(frame, Frame::StreamClose { .. });
                let write = writer.write_frame(&frame).await;
                if write.is_ok() && closes {
                    after_local_close(&inner, id, &mut outboxes);
                }
                write
            }
        };

        if let Err(e) = result {
            debug!(error = %e, "write pump failed");
            inner.fail(ErrorKind::TransportClosed);
            return;
        }
    }
}

async fn handle_control<W>(
    inner: &Arc<MuxInner>,
    ctrl: MuxControl,
    writer: &mut FrameWriter<W>,
    outboxes: &mut StreamMap<u32, ReceiverStream<Frame>>,
) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    match ctrl {
        MuxControl::Frame(frame) => {
            if matches!(frame, Frame::Pong { .. }) {
                // The queued pong is on the wire; a new inbound ping is
                // legal again.
                inner.inbound_ping_pending.store(false, Ordering::Release);
            }
            writer.write_frame(&frame).await
        }
        MuxControl::OpenStream {
            id,
            open,
            outbox_rx,
        } => {
            outboxes.insert(id, ReceiverStream::new(outbox_rx));
            writer.write_frame(&open).await
        }
        MuxControl::RegisterOutbox { id, rx } => {
            outboxes.insert(id, ReceiverStream::new(rx));
            Ok(())
        }
        MuxControl::ResetStream {
            id,
            reason,
            notify_peer,
        } => {
            inner.remove_stream(id, reason);
            outboxes.remove(&id);
            if notify_peer {
                writer
                    .write_frame(&Frame::StreamReset {
                        stream_id: id,
                        reason,
                    })
                    .await
            } else {
                Ok(())
            }
        }
    }
}

fn after_local_close(
    inner: &Arc<MuxInner>,
    id: u32,
    outboxes: &mut StreamMap<u32, ReceiverStream<Frame>>,
) {
    let mut streams = inner.streams.lock();
    let fully_closed = streams
        .get(&id)
        .map(|slot| *slot.shared.state.lock() == StreamState::Closed)
        .unwrap_or(false);
    if fully_closed {
        streams.remove(&id);
        drop(streams);
        outboxes.remove(&id);
    }
}

async fn keepalive(inner: Arc<MuxInner>) {
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            _ = tokio::time::sleep(inner.config.ping_interval) => {}
        }

        let nonce: u64 = rand::random();
        let (tx, rx) = oneshot::channel();
        *inner.outstanding_ping.lock() = Some((nonce, tx));
        if inner
            .control_tx
            .send(MuxControl::Frame(Frame::Ping { nonce }))
            .is_err()
        {
            return;
        }

        match tokio::time::timeout(inner.config.ping_timeout, rx).await {
            Ok(Ok(())) => {}
            _ => {
                if !inner.shutdown.is_cancelled() {
                    warn!("liveness ping timed out");
                    inner.fail(ErrorKind::TransportClosed);
                }
                return;
            }
        }
    }
}

// ─── inbound frame handling ─────────────────────────────────────────────

impl MuxInner {
    /// Route one inbound frame. An `Err` is a protocol violation and tears
    /// the whole connection down.
    fn handle_frame(&self, frame: Frame) -> Result<(), ErrorKind> {
        match frame {
            Frame::Ping { nonce } => {
                if self.inbound_ping_pending.swap(true, Ordering::AcqRel) {
                    // A second ping before we answered the first.
                    return Err(ErrorKind::ProtocolError);
                }
                let _ = self.control_tx.send(MuxControl::Frame(Frame::Pong { nonce }));
                Ok(())
            }
            Frame::Pong { nonce } => {
                let mut outstanding = self.outstanding_ping.lock();
                match outstanding.take() {
                    Some((expected, tx)) if expected == nonce => {
                        let _ = tx.send(());
                    }
                    Some(other) => {
                        warn!(nonce, expected = other.0, "pong nonce mismatch");
                        *outstanding = Some(other);
                    }
                    None => warn!(nonce, "unsolicited pong"),
                }
                Ok(())
            }
            Frame::StreamOpen {
                stream_id,
                tag,
                args,
            } => self.on_remote_open(stream_id, tag, args),
            Frame::StreamData { stream_id, payload } => {
                self.on_remote_event(stream_id, StreamEvent::Data(payload))
            }
            Frame::StreamProgress { stream_id, value } => {
                self.on_remote_event(stream_id, StreamEvent::Progress(value))
            }
            Frame::StreamResult { stream_id, value } => {
                self.on_remote_event(stream_id, StreamEvent::Result(value))
            }
            Frame::StreamWindow { stream_id, credit } => {
                if stream_id == 0 {
                    return Err(ErrorKind::ProtocolError);
                }
                let streams = self.streams.lock();
                match streams.get(&stream_id) {
                    Some(slot) => {
                        let mut state = slot.shared.state.lock();
                        if *state == StreamState::Opening {
                            *state = StreamState::Open;
                        }
                        drop(state);
                        slot.shared.send_window.credit(credit);
                    }
                    // Credit for a stream we already forgot; harmless.
                    None => trace!(stream_id, "window update for unknown stream ignored"),
                }
                Ok(())
            }
            Frame::StreamClose { stream_id } => self.on_remote_close(stream_id),
            Frame::StreamReset { stream_id, reason } => {
                self.on_remote_reset(stream_id, reason);
                Ok(())
            }
            Frame::RpcCall {
                request_id,
                category,
                method,
                args,
            } => match &self.dispatcher {
                Some(dispatcher) => {
                    match dispatcher.dispatch(request_id, category, method, args) {
                        Ok(()) => Ok(()),
                        Err(DispatchError::DuplicateRequest(_)) => Err(ErrorKind::ProtocolError),
                    }
                }
                None => {
                    let _ = self.control_tx.send(MuxControl::Frame(Frame::RpcError {
                        request_id,
                        kind: ErrorKind::NotFound,
                        message: "no rpc service on this side".to_string(),
                    }));
                    Ok(())
                }
            },
            Frame::RpcProgress { request_id, value } => {
                self.forward_call_event(request_id, CallEvent::Progress(value), false);
                Ok(())
            }
            Frame::RpcResult { request_id, value } => {
                self.forward_call_event(request_id, CallEvent::Result(value), true);
                Ok(())
            }
            Frame::RpcError {
                request_id,
                kind,
                message,
            } => {
                self.forward_call_event(request_id, CallEvent::Error { kind, message }, true);
                Ok(())
            }
        }
    }

    fn on_remote_open(
        &self,
        stream_id: u32,
        tag: String,
        args: Vec<String>,
    ) -> Result<(), ErrorKind> {
        // Stream ids come from the opener only, odd and strictly
        // increasing; anything else is a duplicate or a reuse.
        if self.role != Role::Acceptor || stream_id == 0 || stream_id % 2 == 0 {
            return Err(ErrorKind::ProtocolError);
        }
        if stream_id <= self.highest_remote_stream.load(Ordering::Acquire) {
            return Err(ErrorKind::ProtocolError);
        }
        self.highest_remote_stream.store(stream_id, Ordering::Release);

        let acceptor = match &self.acceptor {
            Some(a) => a.clone(),
            None => {
                let _ = self.control_tx.send(MuxControl::ResetStream {
                    id: stream_id,
                    reason: ErrorKind::NotFound,
                    notify_peer: true,
                });
                return Ok(());
            }
        };

        let shared = StreamShared::new(self.config.stream_window);
        // Implicit accept: the stream is Open the moment we see it.
        *shared.state.lock() = StreamState::Open;
        let (outbox_tx, outbox_rx) = mpsc::channel(self.config.stream_outbox);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let token = self.handler_root.child_token();

        self.streams.lock().insert(
            stream_id,
            StreamSlot {
                shared: shared.clone(),
                inbound_tx,
                handler_token: Some(token.clone()),
                result_seen: false,
            },
        );
        let _ = self.control_tx.send(MuxControl::RegisterOutbox {
            id: stream_id,
            rx: outbox_rx,
        });

        let handle = BusStream::new(
            stream_id,
            Role::Acceptor,
            shared,
            outbox_tx,
            self.control_tx.clone(),
            inbound_rx,
            self.config.max_frame_size as usize,
        );
        acceptor.accept(tag, args, handle, token);
        Ok(())
    }

    fn on_remote_event(&self, stream_id: u32, event: StreamEvent) -> Result<(), ErrorKind> {
        let mut streams = self.streams.lock();
        let slot = match streams.get_mut(&stream_id) {
            Some(slot) => slot,
            None => {
                drop(streams);
                // Unknown stream: reset reply, idempotent.
                let _ = self.control_tx.send(MuxControl::ResetStream {
                    id: stream_id,
                    reason: ErrorKind::NotFound,
                    notify_peer: true,
                });
                return Ok(());
            }
        };

        {
            let mut state = slot.shared.state.lock();
            if !state.accepts_remote_frames() {
                // Data (or Progress/Result) after the peer's CLOSE.
                return Err(ErrorKind::ProtocolError);
            }
            if *state == StreamState::Opening {
                *state = StreamState::Open;
            }
        }
        if slot.result_seen {
            // Result is the last non-Close frame on a stream.
            return Err(ErrorKind::ProtocolError);
        }

        if let StreamEvent::Data(payload) = &event {
            if !payload.is_empty() && slot.shared.recv_window.on_data(payload.len()).is_err() {
                // Peer overran its credit: reset this stream, keep the
                // connection.
                let token = slot.handler_token.clone();
                streams.remove(&stream_id);
                drop(streams);
                if let Some(token) = token {
                    token.cancel();
                }
                let _ = self.control_tx.send(MuxControl::ResetStream {
                    id: stream_id,
                    reason: ErrorKind::ProtocolError,
                    notify_peer: true,
                });
                return Ok(());
            }
        }
        if matches!(event, StreamEvent::Result(_)) {
            slot.result_seen = true;
        }

        // A full handler queue is unbounded by frame count but bounded in
        // bytes by the receive window.
        let _ = slot.inbound_tx.send(event);
        Ok(())
    }

    fn on_remote_close(&self, stream_id: u32) -> Result<(), ErrorKind> {
        let mut streams = self.streams.lock();
        let slot = match streams.get_mut(&stream_id) {
            Some(slot) => slot,
            None => {
                drop(streams);
                let _ = self.control_tx.send(MuxControl::ResetStream {
                    id: stream_id,
                    reason: ErrorKind::NotFound,
                    notify_peer: true,
                });
                return Ok(());
            }
        };

        let next = {
            let mut state = slot.shared.state.lock();
            if *state == StreamState::Opening {
                *state = StreamState::Open;
            }
            match state.on_remote_close() {
                Ok(next) => {
                    *state = next;
                    next
                }
                // Double CLOSE from the peer.
                Err(_) => return Err(ErrorKind::ProtocolError),
            }
        };

        let _ = slot.inbound_tx.send(StreamEvent::Closed);
        if next == StreamState::Closed {
            streams.remove(&stream_id);
        }
        Ok(())
    }

    fn on_remote_reset(&self, id: u32, reason: ErrorKind) {
        if id % 2 == 0 {
            // Even ids are the request-id space: this cancels an RPC.
            if let Some(dispatcher) = &self.dispatcher {
                dispatcher.cancel(id);
            }
            // Client side: the peer aborted one of our calls.
            if let Some(tx) = self.pending_calls.lock().remove(&id) {
                let _ = tx.send(CallEvent::Error {
                    kind: reason,
                    message: "call reset by peer".to_string(),
                });
            }
            return;
        }
        self.remove_stream(id, reason);
        // Ask the write pump to drop the outbox; no frame back to the peer
        // (replying to a reset with a reset would ping-pong forever).
        let _ = self.control_tx.send(MuxControl::ResetStream {
            id,
            reason,
            notify_peer: false,
        });
    }

    /// Drop a stream slot, marking it reset. Idempotent.
    fn remove_stream(&self, id: u32, reason: ErrorKind) {
        let slot = self.streams.lock().remove(&id);
        if let Some(slot) = slot {
            slot.shared.mark_reset(reason);
            if let Some(token) = slot.handler_token {
                token.cancel();
            }
        }
    }

    fn forward_call_event(&self, request_id: u32, event: CallEvent, terminal: bool) {
        let mut calls = self.pending_calls.lock();
        match calls.get(&request_id) {
            Some(tx) => {
                let _ = tx.send(event);
                if terminal {
                    calls.remove(&request_id);
                }
            }
            None => debug!(request_id, "event for unknown call dropped"),
        }
    }

    /// Tear everything down with `reason`. First caller wins; later calls
    /// are no-ops.
    fn fail(&self, reason: ErrorKind) {
        {
            let mut close_reason = self.close_reason.lock();
            if close_reason.is_some() {
                return;
            }
            *close_reason = Some(reason);
        }
        debug!(%reason, "connection teardown");

        let slots: Vec<StreamSlot> = {
            let mut streams = self.streams.lock();
            streams.drain().map(|(_, slot)| slot).collect()
        };
        for slot in slots {
            slot.shared.mark_reset(reason);
        }
        self.handler_root.cancel();

        let calls: Vec<mpsc::UnboundedSender<CallEvent>> = {
            let mut pending = self.pending_calls.lock();
            pending.drain().map(|(_, tx)| tx).collect()
        };
        for tx in calls {
            let _ = tx.send(CallEvent::Error {
                kind: reason,
                message: "connection closed".to_string(),
            });
        }

        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.cancel_all();
        }
        self.shutdown.cancel();
    }
}
