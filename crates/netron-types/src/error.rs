//! Error types shared by every Netron layer.

use std::time::Duration;
use thiserror::Error;

/// Top-level error type for the Netron runtime.
#[derive(Error, Debug)]
pub enum NetronError {
    /// Dialing or handshaking with a peer failed, or the peer refused us.
    #[error("{0}")]
    Connect(String),

    /// No response arrived within the configured response timeout.
    #[error("Response timeout {}ms exceeded", .0.as_millis())]
    Timeout(Duration),

    /// The peer went offline while a request was outstanding.
    #[error("Peer {0} disconnected")]
    PeerDisconnected(String),

    /// A context, twin or remote attachment with this name already exists.
    #[error("{0}")]
    Exists(String),

    /// A name, peer, member or definition is not known.
    #[error("{0}")]
    Unknown(String),

    /// The addressed definition no longer has a stub behind it.
    #[error("{0}")]
    NotExists(String),

    /// A context instance failed structural validation.
    #[error("{0}")]
    NotValid(String),

    /// The operation is not permitted (read-only property, anonymous context).
    #[error("{0}")]
    NotAllowed(String),

    /// An argument was rejected before anything was sent.
    #[error("{0}")]
    InvalidArgument(String),

    /// The object is in the wrong state for the requested operation.
    #[error("{0}")]
    IllegalState(String),

    /// An error raised by a remote context, carrying only its message.
    #[error("{0}")]
    Remote(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A packet could not be serialized or deserialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A frame exceeded the configured maximum size.
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge {
        /// Announced frame length.
        size: u32,
        /// Configured limit.
        max: u32,
    },

    /// The two sides speak different protocol versions.
    #[error("Protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch {
        /// Our protocol version.
        local: u32,
        /// The remote's protocol version.
        remote: u32,
    },

    /// The connection was closed by the remote side.
    #[error("Connection closed")]
    ConnectionClosed,
}

impl NetronError {
    /// Numeric code used when the error crosses the wire.
    ///
    /// Control errors keep their kind; anything raised by a context (and
    /// anything else) travels as a generic remote error.
    pub fn code(&self) -> i32 {
        match self {
            NetronError::InvalidArgument(_) => 400,
            NetronError::NotAllowed(_) => 403,
            NetronError::Unknown(_) => 404,
            NetronError::Exists(_) => 409,
            NetronError::NotExists(_) => 410,
            NetronError::NotValid(_) => 422,
            _ => 500,
        }
    }

    /// Rebuild an error received as `(code, message)`.
    pub fn from_code(code: i32, message: String) -> Self {
        match code {
            400 => NetronError::InvalidArgument(message),
            403 => NetronError::NotAllowed(message),
            404 => NetronError::Unknown(message),
            409 => NetronError::Exists(message),
            410 => NetronError::NotExists(message),
            422 => NetronError::NotValid(message),
            _ => NetronError::Remote(message),
        }
    }
}

/// Alias for results returned by Netron operations.
pub type NetronResult<T> = Result<T, NetronError>;
