// ABOUTME: Per-call event emitter delivering progress/result/error frames to the write path
// ABOUTME: Enforces the at-most-one-terminal-frame contract for every RPC call

use crate::codec::{ErrorKind, Frame};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::warn;

/// The handler-facing side of an RPC call.
///
/// `progress` may be called any number of times; exactly one of `result`
/// or `error` should follow. Emissions after the terminal event are
/// dropped and logged rather than surfaced, so a sloppy handler cannot
/// violate the one-terminal-frame wire invariant.
///
/// The underlying channel is bounded; a handler producing faster than the
/// connection drains will suspend here, which is the intended backpressure.
#[derive(Debug, Clone)]
pub struct Emitter {
    request_id: u32,
    out: mpsc::Sender<Frame>,
    terminal: Arc<AtomicBool>,
}

impl Emitter {
    pub(crate) fn new(request_id: u32, out: mpsc::Sender<Frame>) -> Self {
        Self {
            request_id,
            out,
            terminal: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    /// Whether a terminal frame has already been emitted.
    pub fn is_terminal(&self) -> bool {
        self.terminal.load(Ordering::Acquire)
    }

    /// Non-terminal progress event.
    pub async fn progress(&self, value: serde_json::Value) {
        if self.is_terminal() {
            warn!(request_id = self.request_id, "progress after terminal frame dropped");
            return;
        }
        self.deliver(Frame::RpcProgress {
            request_id: self.request_id,
            value,
        })
        .await;
    }

    /// Terminal success.
    pub async fn result(&self, value: serde_json::Value) {
        if self.terminal.swap(true, Ordering::AcqRel) {
            warn!(request_id = self.request_id, "result after terminal frame dropped");
            return;
        }
        self.deliver(Frame::RpcResult {
            request_id: self.request_id,
            value,
        })
        .await;
    }

    /// Terminal failure.
    pub async fn error(&self, kind: ErrorKind, message: impl Into<String>) {
        if self.terminal.swap(true, Ordering::AcqRel) {
            warn!(request_id = self.request_id, "error after terminal frame dropped");
            return;
        }
        self.deliver(Frame::RpcError {
            request_id: self.request_id,
            kind,
            message: message.into(),
        })
        .await;
    }

    async fn deliver(&self, frame: Frame) {
        // A closed channel means the connection died; the call is moot.
        if self.out.send(frame).await.is_err() {
            warn!(request_id = self.request_id, "emission dropped: connection gone");
        }
    }
}
