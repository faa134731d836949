//! Error taxonomy for the client.
//!
//! Protocol and transport failures are not recoverable locally: the
//! connection drops and the reconnect state machine (see [`crate::client`])
//! takes over. Server errors are data, not control flow — they travel inside
//! [`crate::Reply::Error`], never as an `Err` from this enum. Type and state
//! errors are caller bugs, surfaced immediately.

use thiserror::Error;

/// Errors surfaced to callers of this crate.
#[derive(Debug, Error)]
pub enum RedisError {
    /// The wire stream contained a malformed frame. The connection that
    /// produced this error must be torn down; the decoder cannot resume.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The underlying socket failed during a read or write.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Reconnection attempts were exhausted; the command will never be
    /// retried automatically.
    #[error("network error: reconnect attempts exhausted")]
    Network,

    /// The server replied with a `-ERR ...` frame. Carried as data inside
    /// [`crate::Reply::Error`] in the common case; this variant exists for
    /// call sites (e.g. `auth`, `select`) that want to `?`-propagate it.
    #[error("server error: {0}")]
    Server(String),

    /// A [`crate::Reply`] accessor was used against a reply of the wrong
    /// kind.
    #[error("type error: expected {expected}, found {found}")]
    Type {
        expected: &'static str,
        found: &'static str,
    },

    /// The caller attempted an operation that the current connection state
    /// forbids: sending a command while disconnected, or sending a
    /// non-pub/sub command while in subscriber mode.
    #[error("state error: {0}")]
    State(String),
}

pub type Result<T> = std::result::Result<T, RedisError>;
