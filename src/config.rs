// ABOUTME: Tunable parameters for the bus with protocol defaults and builder-style setters
// ABOUTME: One BusConfig is shared by the multiplexer, dispatcher, session manager and worker

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a bus endpoint (gateway, worker, or test harness).
///
/// All values default to the protocol defaults. Use the `with_*` methods to
/// override individual knobs:
///
/// ```rust
/// use iobus::config::BusConfig;
/// use std::time::Duration;
///
/// let config = BusConfig::default()
///     .with_stream_window(64 * 1024)
///     .with_idle_window(Duration::from_secs(600));
/// ```
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Maximum frame payload size in bytes (default: 1 MiB). Larger
    /// transfers are chunked into multiple STREAM_DATA frames.
    pub max_frame_size: u32,

    /// Initial per-direction flow-control window in bytes (default: 256 KiB).
    pub stream_window: u32,

    /// Bound on each stream's outbox, in frames (default: 8). Senders
    /// suspend when the write pump falls behind.
    pub stream_outbox: usize,

    /// Bound on the dispatcher's RPC event queue, in frames (default: 64).
    pub rpc_queue: usize,

    /// Idle interval between liveness pings (default: 30 s).
    pub ping_interval: Duration,

    /// How long to wait for a PONG before declaring the transport dead
    /// (default: 10 s).
    pub ping_timeout: Duration,

    /// Session idle window; sessions with no traffic for this long are
    /// reaped (default: 30 min).
    pub idle_window: Duration,

    /// Interval between reaper sweeps (default: 30 s).
    pub reaper_interval: Duration,

    /// How long to wait for a freshly spawned worker's endpoint to accept
    /// connections (default: 5 s).
    pub startup_timeout: Duration,

    /// How long a shutting-down worker lets in-flight RPC calls finish
    /// (default: 2 s).
    pub drain_window: Duration,

    /// How long session termination waits for the worker to exit before
    /// killing it (default: 10 s).
    pub kill_grace: Duration,

    /// Directory for worker endpoints and status files
    /// (default: `/run/iobus`).
    pub runtime_dir: PathBuf,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 1024 * 1024,
            stream_window: 256 * 1024,
            stream_outbox: 8,
            rpc_queue: 64,
            ping_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(10),
            idle_window: Duration::from_secs(30 * 60),
            reaper_interval: Duration::from_secs(30),
            startup_timeout: Duration::from_secs(5),
            drain_window: Duration::from_secs(2),
            kill_grace: Duration::from_secs(10),
            runtime_dir: PathBuf::from("/run/iobus"),
        }
    }
}

impl BusConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_frame_size(mut self, bytes: u32) -> Self {
        self.max_frame_size = bytes;
        self
    }

    pub fn with_stream_window(mut self, bytes: u32) -> Self {
        self.stream_window = bytes;
        self
    }

    pub fn with_stream_outbox(mut self, frames: usize) -> Self {
        self.stream_outbox = frames;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    pub fn with_idle_window(mut self, window: Duration) -> Self {
        self.idle_window = window;
        self
    }

    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_drain_window(mut self, window: Duration) -> Self {
        self.drain_window = window;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = dir.into();
        self
    }
}
