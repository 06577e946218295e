// ABOUTME: Per-stream flow-control accounting for both transfer directions
// ABOUTME: Send side gates writers on peer credit; receive side decides when to re-credit

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::Notify;

/// Flow-control failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowError {
    /// The stream was reset while a sender was waiting for credit.
    #[error("window closed: stream reset")]
    Closed,

    /// The peer sent more Data bytes than we ever credited. Window
    /// accounting must never go negative without an immediate reset.
    #[error("peer overran the receive window by {0} bytes")]
    Overrun(u64),
}

/// Send-side byte window.
///
/// Senders reserve bytes before queueing a Data frame and suspend while the
/// window is exhausted; WINDOW frames from the peer add credit and wake
/// them. The available count can never go negative: a reservation only
/// subtracts what it just observed.
#[derive(Debug)]
pub struct SendWindow {
    available: AtomicI64,
    notify: Notify,
    closed: AtomicBool,
}

impl SendWindow {
    pub fn new(initial: u32) -> Self {
        Self {
            available: AtomicI64::new(i64::from(initial)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Reserve up to `want` bytes, returning how many were granted
    /// (always `1..=want`). Suspends while no credit is available.
    pub async fn reserve(&self, want: usize) -> Result<usize, WindowError> {
        debug_assert!(want > 0);
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(WindowError::Closed);
            }
            let available = self.available.load(Ordering::Acquire);
            if available > 0 {
                let take = available.min(want as i64);
                // Another sender may have raced us; retry on mismatch.
                if self
                    .available
                    .compare_exchange(
                        available,
                        available - take,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    return Ok(take as usize);
                }
                continue;
            }
            self.notify.notified().await;
        }
    }

    /// Add credit from a WINDOW frame and wake any waiting sender.
    pub fn credit(&self, n: u32) {
        self.available.fetch_add(i64::from(n), Ordering::AcqRel);
        self.notify.notify_waiters();
    }

    /// Fail the window; blocked and future reservations return `Closed`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn available(&self) -> i64 {
        self.available.load(Ordering::Acquire)
    }
}

/// Receive-side ledger.
///
/// The read pump records arriving Data bytes; the stream handle records
/// consumption as the handler drains its queue. Every consumed byte is
/// owed back to the peer as WINDOW credit, so after a quiet period the
/// peer's send window always returns to the initial size.
///
/// Arrivals and consumption happen on different tasks, so the counters are
/// atomics; each counter has a single writer.
#[derive(Debug)]
pub struct RecvWindow {
    capacity: u64,
    /// Total credit ever granted to the peer (starts at `capacity`).
    granted: AtomicU64,
    /// Total payload bytes received.
    received: AtomicU64,
    /// Total payload bytes consumed by the handler.
    consumed: AtomicU64,
}

impl RecvWindow {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity: u64::from(capacity),
            granted: AtomicU64::new(u64::from(capacity)),
            received: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
        }
    }

    /// Record `n` arriving payload bytes. Fails if the peer sent beyond
    /// its credit; the caller must reset the stream.
    pub fn on_data(&self, n: usize) -> Result<(), WindowError> {
        let received = self.received.fetch_add(n as u64, Ordering::AcqRel) + n as u64;
        let granted = self.granted.load(Ordering::Acquire);
        if received > granted {
            return Err(WindowError::Overrun(received - granted));
        }
        Ok(())
    }

    /// Record `n` consumed bytes. Returns the credit now owed to the peer.
    pub fn on_consumed(&self, n: usize) -> Option<u32> {
        let consumed = self.consumed.fetch_add(n as u64, Ordering::AcqRel) + n as u64;
        let granted = self.granted.load(Ordering::Acquire);
        // Credit already extended beyond the initial window.
        let granted_extra = granted - self.capacity;
        let pending = consumed.saturating_sub(granted_extra);
        if pending > 0 {
            self.granted.fetch_add(pending, Ordering::AcqRel);
            return Some(pending as u32);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn reserve_takes_at_most_available() {
        let window = SendWindow::new(10);
        assert_eq!(window.reserve(4).await.unwrap(), 4);
        assert_eq!(window.reserve(100).await.unwrap(), 6);
        assert_eq!(window.available(), 0);
    }

    #[tokio::test]
    async fn reserve_blocks_until_credit() {
        let window = Arc::new(SendWindow::new(4));
        assert_eq!(window.reserve(4).await.unwrap(), 4);

        let waiter = {
            let window = window.clone();
            tokio::spawn(async move { window.reserve(8).await })
        };
        // The waiter cannot make progress yet.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        window.credit(3);
        assert_eq!(waiter.await.unwrap().unwrap(), 3);
    }

    #[tokio::test]
    async fn close_releases_blocked_senders() {
        let window = Arc::new(SendWindow::new(1));
        assert_eq!(window.reserve(1).await.unwrap(), 1);

        let waiter = {
            let window = window.clone();
            tokio::spawn(async move { window.reserve(1).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        window.close();
        assert_eq!(waiter.await.unwrap(), Err(WindowError::Closed));

        // Future reservations fail immediately.
        assert_eq!(window.reserve(1).await, Err(WindowError::Closed));
    }

    #[test]
    fn window_never_goes_negative() {
        let window = SendWindow::new(5);
        futures_util::future::FutureExt::now_or_never(window.reserve(100))
            .unwrap()
            .unwrap();
        assert!(window.available() >= 0);
    }

    #[test]
    fn recv_window_detects_overrun() {
        let window = RecvWindow::new(8);
        window.on_data(8).unwrap();
        let err = window.on_data(1).unwrap_err();
        assert_eq!(err, WindowError::Overrun(1));
    }

    #[test]
    fn every_consumed_byte_is_recredited() {
        let window = RecvWindow::new(100);
        window.on_data(60).unwrap();

        assert_eq!(window.on_consumed(30), Some(30));
        assert_eq!(window.on_consumed(25), Some(25));
        // Peer can now spend the refreshed credit without overrunning.
        window.on_data(40).unwrap();
        window.on_data(55).unwrap();
        assert!(window.on_data(1).is_err());
    }

    #[test]
    fn full_cycle_returns_window_to_initial() {
        let window = RecvWindow::new(64);
        let send = SendWindow::new(64);

        // Peer sends the whole window, we consume it all and credit back.
        window.on_data(64).unwrap();
        let credit = window.on_consumed(64).expect("credit due");
        assert_eq!(credit, 64);
        // Mirror of what the peer does with the credit.
        for _ in 0..64 {
            futures_util::future::FutureExt::now_or_never(send.reserve(1))
                .unwrap()
                .unwrap();
        }
        send.credit(credit);
        assert_eq!(send.available(), 64);
    }
}
