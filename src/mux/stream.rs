// ABOUTME: Logical stream state machine and the handle user code holds
// ABOUTME: A BusStream sends through the shared write pump and drains its own inbound queue

use super::MuxControl;
use crate::codec::{ErrorKind, Frame};
use crate::mux::window::{RecvWindow, SendWindow, WindowError};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Which side of the connection created the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Opener,
    Acceptor,
}

/// Stream lifecycle states.
///
/// ```text
/// Opening → Open → {HalfClosedLocal, HalfClosedRemote} → Closed
/// ```
/// plus a terminal edge to `Reset` from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// OPEN sent, no frame from the peer yet.
    Opening,
    Open,
    /// We closed; the peer may still send.
    HalfClosedLocal,
    /// The peer closed; we may still send a Result.
    HalfClosedRemote,
    Closed,
    Reset,
}

impl StreamState {
    /// Whether this side may still queue Data/Progress/Result frames.
    pub fn is_writable(self) -> bool {
        matches!(
            self,
            StreamState::Opening | StreamState::Open | StreamState::HalfClosedRemote
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, StreamState::Closed | StreamState::Reset)
    }

    /// Transition for a locally sent CLOSE.
    pub fn on_local_close(self) -> StreamState {
        match self {
            StreamState::Opening | StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        }
    }

    /// Transition for a CLOSE received from the peer. A second CLOSE, or a
    /// CLOSE on an already remote-closed stream, is a protocol violation.
    pub fn on_remote_close(self) -> Result<StreamState, StreamState> {
        match self {
            StreamState::Opening | StreamState::Open => Ok(StreamState::HalfClosedRemote),
            StreamState::HalfClosedLocal => Ok(StreamState::Closed),
            other => Err(other),
        }
    }

    /// Whether Data/Progress/Result from the peer is legal in this state.
    pub fn accepts_remote_frames(self) -> bool {
        matches!(
            self,
            StreamState::Opening | StreamState::Open | StreamState::HalfClosedLocal
        )
    }
}

/// State shared between a stream handle and the connection pumps.
#[derive(Debug)]
pub(crate) struct StreamShared {
    pub(crate) state: Mutex<StreamState>,
    pub(crate) send_window: SendWindow,
    pub(crate) recv_window: RecvWindow,
    pub(crate) reset_reason: Mutex<Option<ErrorKind>>,
}

impl StreamShared {
    pub(crate) fn new(window: u32) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(StreamState::Opening),
            send_window: SendWindow::new(window),
            recv_window: RecvWindow::new(window),
            reset_reason: Mutex::new(None),
        })
    }

    /// Terminal reset; idempotent, first reason wins.
    pub(crate) fn mark_reset(&self, reason: ErrorKind) {
        let mut state = self.state.lock();
        if !state.is_terminal() {
            *state = StreamState::Reset;
            self.reset_reason.lock().get_or_insert(reason);
        }
        self.send_window.close();
    }
}

/// An event delivered to whoever holds the stream's receiving end.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Bulk payload bytes, in send order.
    Data(Bytes),
    /// Small metadata map, ordered relative to Data.
    Progress(serde_json::Value),
    /// Terminal success value; the last non-Close frame on the stream.
    Result(serde_json::Value),
    /// The peer half-closed; no further Data/Progress/Result will arrive.
    Closed,
    /// The stream was torn down; queued bytes were discarded.
    Reset(ErrorKind),
}

/// Stream handle errors.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream reset: {0}")]
    Reset(ErrorKind),

    #[error("stream is no longer writable")]
    NotWritable,

    #[error("connection is gone")]
    Disconnected,
}

impl From<WindowError> for StreamError {
    fn from(err: WindowError) -> Self {
        match err {
            WindowError::Closed => StreamError::Reset(ErrorKind::Cancelled),
            WindowError::Overrun(_) => StreamError::Reset(ErrorKind::ProtocolError),
        }
    }
}

/// One logical bidirectional channel multiplexed onto a connection.
///
/// Data sent here flows through the connection's write pump, subject to the
/// stream's send window and the round-robin discipline. Inbound events are
/// drained with [`BusStream::recv`], which also settles receive-window
/// credit back to the peer.
#[derive(Debug)]
pub struct BusStream {
    id: u32,
    role: Role,
    shared: Arc<StreamShared>,
    outbox: mpsc::Sender<Frame>,
    control: mpsc::UnboundedSender<MuxControl>,
    inbound: mpsc::UnboundedReceiver<StreamEvent>,
    max_chunk: usize,
    reset_delivered: bool,
}

impl BusStream {
    pub(crate) fn new(
        id: u32,
        role: Role,
        shared: Arc<StreamShared>,
        outbox: mpsc::Sender<Frame>,
        control: mpsc::UnboundedSender<MuxControl>,
        inbound: mpsc::UnboundedReceiver<StreamEvent>,
        max_chunk: usize,
    ) -> Self {
        Self {
            id,
            role,
            shared,
            outbox,
            control,
            inbound,
            max_chunk,
            reset_delivered: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> StreamState {
        *self.shared.state.lock()
    }

    /// Bytes this side may still send before waiting on WINDOW credit.
    pub fn send_window(&self) -> i64 {
        self.shared.send_window.available()
    }

    fn check_writable(&self) -> Result<(), StreamError> {
        let state = self.state();
        if state == StreamState::Reset {
            let reason = self
                .shared
                .reset_reason
                .lock()
                .unwrap_or(ErrorKind::Internal);
            return Err(StreamError::Reset(reason));
        }
        if !state.is_writable() {
            return Err(StreamError::NotWritable);
        }
        Ok(())
    }

    /// Send bulk bytes, chunked to the frame limit and gated on the send
    /// window. Suspends while the peer owes credit.
    pub async fn send(&mut self, data: &[u8]) -> Result<(), StreamError> {
        self.check_writable()?;

        if data.is_empty() {
            // Zero-length Data is legal and delivers zero bytes.
            return self.queue(Frame::StreamData {
                stream_id: self.id,
                payload: Bytes::new(),
            })
            .await;
        }

        let mut offset = 0;
        while offset < data.len() {
            let want = (data.len() - offset).min(self.max_chunk);
            let granted = self.shared.send_window.reserve(want).await?;
            let chunk = Bytes::copy_from_slice(&data[offset..offset + granted]);
            offset += granted;
            self.queue(Frame::StreamData {
                stream_id: self.id,
                payload: chunk,
            })
            .await?;
        }
        Ok(())
    }

    /// Emit a progress event. Uncounted by flow control, but ordered with
    /// Data because it rides the same outbox.
    pub async fn progress(&mut self, value: serde_json::Value) -> Result<(), StreamError> {
        self.check_writable()?;
        self.queue(Frame::StreamProgress {
            stream_id: self.id,
            value,
        })
        .await
    }

    /// Terminal success: emits Result followed by Close.
    pub async fn finish(&mut self, value: serde_json::Value) -> Result<(), StreamError> {
        self.check_writable()?;
        self.queue(Frame::StreamResult {
            stream_id: self.id,
            value,
        })
        .await?;
        self.close().await
    }

    /// Graceful half-close: everything queued so far is still delivered.
    pub async fn close(&mut self) -> Result<(), StreamError> {
        {
            let mut state = self.shared.state.lock();
            if state.is_terminal() || *state == StreamState::HalfClosedLocal {
                return Ok(());
            }
            *state = state.on_local_close();
        }
        self.queue(Frame::StreamClose { stream_id: self.id }).await
    }

    /// Hard reset: discard queued bytes on both sides immediately. Used for
    /// cancellation so an abandoned upload stops hitting the disk.
    pub fn reset(&mut self, reason: ErrorKind) {
        self.shared.mark_reset(reason);
        let _ = self.control.send(MuxControl::ResetStream {
            id: self.id,
            reason,
            notify_peer: true,
        });
    }

    /// Receive the next inbound event. Returns `None` once the stream is
    /// finished and the queue is drained.
    ///
    /// A reset takes priority over queued events: anything buffered but not
    /// yet delivered is discarded, and exactly one `Reset` event is
    /// surfaced.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        if self.reset_delivered {
            return None;
        }
        if let Some(event) = self.take_reset() {
            return Some(event);
        }

        match self.inbound.recv().await {
            Some(event) => {
                if let StreamEvent::Data(bytes) = &event {
                    if !bytes.is_empty() {
                        if let Some(credit) = self.shared.recv_window.on_consumed(bytes.len()) {
                            let _ = self.control.send(MuxControl::Frame(Frame::StreamWindow {
                                stream_id: self.id,
                                credit,
                            }));
                        }
                    }
                }
                Some(event)
            }
            // Sender gone: either the stream finished cleanly or it was
            // reset while we were parked.
            None => self.take_reset(),
        }
    }

    /// If the stream is reset, drain the inbound queue and produce the
    /// single Reset event.
    fn take_reset(&mut self) -> Option<StreamEvent> {
        if *self.shared.state.lock() != StreamState::Reset {
            return None;
        }
        while self.inbound.try_recv().is_ok() {}
        self.reset_delivered = true;
        let reason = self
            .shared
            .reset_reason
            .lock()
            .unwrap_or(ErrorKind::Internal);
        Some(StreamEvent::Reset(reason))
    }

    async fn queue(&self, frame: Frame) -> Result<(), StreamError> {
        self.outbox
            .send(frame)
            .await
            .map_err(|_| StreamError::Disconnected)
    }
}

impl Drop for BusStream {
    fn drop(&mut self) {
        // Dropping a live handle without close/finish is an abort, not a
        // graceful end; tell the mux so the slot is reclaimed.
        let state = *self.shared.state.lock();
        if !state.is_terminal() && state != StreamState::HalfClosedLocal {
            self.shared.mark_reset(ErrorKind::Cancelled);
            let _ = self.control.send(MuxControl::ResetStream {
                id: self.id,
                reason: ErrorKind::Cancelled,
                notify_peer: true,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_transitions() {
        assert_eq!(StreamState::Open.on_local_close(), StreamState::HalfClosedLocal);
        assert_eq!(
            StreamState::HalfClosedRemote.on_local_close(),
            StreamState::Closed
        );
        assert_eq!(
            StreamState::Open.on_remote_close(),
            Ok(StreamState::HalfClosedRemote)
        );
        assert_eq!(
            StreamState::HalfClosedLocal.on_remote_close(),
            Ok(StreamState::Closed)
        );
    }

    #[test]
    fn double_remote_close_is_invalid() {
        assert!(StreamState::HalfClosedRemote.on_remote_close().is_err());
        assert!(StreamState::Closed.on_remote_close().is_err());
    }

    #[test]
    fn writability() {
        assert!(StreamState::Opening.is_writable());
        assert!(StreamState::Open.is_writable());
        assert!(StreamState::HalfClosedRemote.is_writable());
        assert!(!StreamState::HalfClosedLocal.is_writable());
        assert!(!StreamState::Closed.is_writable());
        assert!(!StreamState::Reset.is_writable());
    }

    #[test]
    fn remote_frames_after_remote_close_rejected() {
        assert!(StreamState::Open.accepts_remote_frames());
        assert!(StreamState::HalfClosedLocal.accepts_remote_frames());
        assert!(!StreamState::HalfClosedRemote.accepts_remote_frames());
        assert!(!StreamState::Closed.accepts_remote_frames());
    }

    #[test]
    fn mark_reset_is_idempotent_first_reason_wins() {
        let shared = StreamShared::new(16);
        shared.mark_reset(ErrorKind::Shutdown);
        shared.mark_reset(ErrorKind::Cancelled);
        assert_eq!(*shared.state.lock(), StreamState::Reset);
        assert_eq!(*shared.reset_reason.lock(), Some(ErrorKind::Shutdown));
    }
}
