pub mod bridge;
pub mod codec;
pub mod config;
pub mod connection;
pub mod gateway;
pub mod mux;
pub mod rpc;
pub mod session;


// Re-export the wire types used at every layer
pub use codec::{CodecError, ErrorKind, Frame, Opcode};
pub use config::BusConfig;

// Re-export the main bus API for easy access
pub use bridge::{AttachPolicy, BridgeWorker, HandlerSet};
pub use gateway::Gateway;
pub use mux::{BusStream, CallEvent, CallHandle, Multiplexer, MuxError, MuxServices, StreamAcceptor, StreamEvent};
pub use rpc::{Emitter, RegistryBuilder, RpcRegistry};
pub use session::{Principal, Session, SessionId, SessionManager};

/// Error returned by most functions.
///
/// Layer-specific failures have their own `thiserror` enums (`CodecError`,
/// `MuxError`, `SessionError`); this boxed alias is for the seams where
/// they meet, such as binary entry points.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// A specialized `Result` type for bus operations.
///
/// # Examples
///
/// Driving a worker the way the browser does:
///
/// ```rust,no_run
/// use iobus::{BusConfig, Multiplexer};
/// use tokio::net::UnixStream;
///
/// #[tokio::main]
/// async fn main() -> iobus::Result<()> {
///     let endpoint = UnixStream::connect("/run/iobus/bridge-abc123.sock").await?;
///     let bus = Multiplexer::connect(endpoint, BusConfig::default());
///
///     let containers = bus
///         .call("docker", "list_containers", &[])
///         .await?
///         .wait()
///         .await?;
///     println!("{containers}");
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, Error>;
