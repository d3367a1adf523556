//! Error taxonomy shared by every socket operation.

use crate::{readiness::Interest, socket::State};

/// Result alias used across this crate.
pub type Result<T> = std::result::Result<T, SocketError>;

/// Every failure a [`Socket`](crate::Socket) operation can surface.
///
/// OS-level failures carry the OS error text; none of them are fatal to
/// the process and all are recoverable by the caller.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    /// Bad resolution input or name lookup failure.
    #[error("address resolution failed: {0}")]
    Resolution(String),

    /// Operation not legal in the socket's current state.
    #[error("`{op}` is not allowed in state {state:?}")]
    InvalidState { op: &'static str, state: State },

    /// Every candidate address was tried and failed.
    #[error("connecting to `{peer}` failed: {last_error}")]
    Connection { peer: String, last_error: String },

    #[error("listen failed: {0}")]
    Listen(String),

    #[error("accept failed: {0}")]
    Accept(String),

    #[error("receive failed: {0}")]
    Receive(String),

    #[error("send failed: {0}")]
    Send(String),

    /// The peer closed the connection during a receive. The socket has
    /// already been closed when this is returned.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// A readiness wait expired with no pending socket error.
    #[error("timed out {0}")]
    Timeout(Interest),

    #[error("`{0}` is not implemented")]
    NotImplemented(&'static str),
}
