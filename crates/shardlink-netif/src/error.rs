//! Error taxonomy for the network interface.
//!
//! Every failure an operation can end with is a [`NetworkError`]. The more
//! specific enums describe where the failure came from: acquiring a
//! connection, parsing a frame, or authenticating.

use thiserror::Error;

/// Failure to obtain a connection to a remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    /// The remote end refused (or reset) the TCP connection attempt.
    #[error("connection refused to {addr}: {reason}")]
    Refused {
        /// Endpoint that was dialed.
        addr: String,
        /// Underlying socket error.
        reason: String,
    },

    /// No connection became available before the lease timeout elapsed.
    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    Timeout {
        /// Endpoint that was dialed.
        addr: String,
        /// Timeout that expired.
        timeout_ms: u64,
    },

    /// The host name could not be resolved.
    #[error("failed to resolve {addr}: {reason}")]
    Dns {
        /// Endpoint that was resolved.
        addr: String,
        /// Resolver error.
        reason: String,
    },
}

/// Violation of the wire framing rules.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The header's total length is outside the accepted range, or is one of
    /// the probe sentinels.
    #[error("invalid message length {len}: {reason}")]
    InvalidLength {
        /// Length read from the header.
        len: i32,
        /// Which rule was violated.
        reason: &'static str,
    },

    /// Fewer body bytes arrived than the header declared.
    #[error("truncated message body: expected {expected} bytes, received {received}")]
    Truncated {
        /// Body length declared by the header.
        expected: usize,
        /// Body bytes actually delivered.
        received: usize,
    },

    /// The reply does not answer the request that was sent.
    #[error("mismatched response id: expected {expected}, got {got}")]
    MismatchedResponseId {
        /// Request id of the frame that was sent.
        expected: i32,
        /// `responseTo` field of the frame that arrived.
        got: i32,
    },

    /// The opcode is not one this codec understands.
    #[error("unsupported opcode {0}")]
    UnsupportedOpCode(i32),

    /// The body does not have the layout its opcode requires.
    #[error("malformed message body: {reason}")]
    MalformedBody {
        /// What was wrong.
        reason: String,
    },
}

impl FrameError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        FrameError::MalformedBody {
            reason: reason.into(),
        }
    }
}

/// Failure reported by the authentication hook.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// The server rejected the credentials.
    #[error("authentication failed against {target}: {reason}")]
    Failed {
        /// Endpoint being authenticated against.
        target: String,
        /// Server supplied reason.
        reason: String,
    },

    /// The server does not support the requested mechanism. The caller may
    /// retry with fallback parameters; the connection itself is still usable.
    #[error("authentication mechanism {mechanism} not supported by {target}")]
    MechanismUnavailable {
        /// Endpoint being authenticated against.
        target: String,
        /// Mechanism that was attempted.
        mechanism: String,
    },

    /// Authentication is required but no authenticator is installed.
    #[error("no authentication parameters set for internal user")]
    MissingParameters,
}

impl AuthError {
    /// Whether the failure leaves the connection in a reusable state.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, AuthError::MechanismUnavailable { .. })
    }
}

/// Terminal status of a remote command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    /// Connection acquisition failed.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// The peer sent a frame that violates the protocol.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The authentication hook failed.
    #[error(transparent)]
    Authentication(#[from] AuthError),

    /// A send or receive failed at the socket level.
    #[error("network error talking to {target}: {reason}")]
    HostUnreachable {
        /// Endpoint of the failed connection.
        target: String,
        /// Underlying I/O error.
        reason: String,
    },

    /// The command was canceled by the caller.
    #[error("callback canceled")]
    CallbackCanceled,

    /// The command's timeout fired before it completed.
    #[error("operation exceeded time limit of {timeout_ms}ms")]
    ExceededTimeLimit {
        /// Timeout that fired.
        timeout_ms: u64,
    },

    /// The interface is shutting down.
    #[error("shutdown in progress")]
    ShutdownInProgress,

    /// A command is already in flight under this callback handle.
    #[error("callback handle {0} already has a command in flight")]
    DuplicateHandle(u64),

    /// A local failure unrelated to the connection (hook errors, handshake
    /// rejections).
    #[error("internal error: {0}")]
    InternalError(String),
}

impl NetworkError {
    /// Builds a [`NetworkError::HostUnreachable`] from a socket error.
    pub fn from_io(target: impl ToString, err: &std::io::Error) -> Self {
        NetworkError::HostUnreachable {
            target: target.to_string(),
            reason: err.to_string(),
        }
    }

    /// Whether a connection used by an operation that ended with this error
    /// must be discarded instead of returned to its pool.
    pub fn should_drop_connection(&self) -> bool {
        match self {
            NetworkError::Authentication(AuthError::MissingParameters) => false,
            NetworkError::Authentication(e) => !e.is_recoverable(),
            NetworkError::InternalError(_) | NetworkError::DuplicateHandle(_) => false,
            _ => true,
        }
    }
}

/// Invalid or unreadable configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// TOML syntax or type error.
    #[error("invalid TOML config: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON syntax or type error.
    #[error("invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),

    /// The file extension is neither `.toml` nor `.json`.
    #[error("unsupported config file extension: {0:?}")]
    UnsupportedExtension(String),

    /// A field holds a value the interface cannot run with.
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, NetworkError>;
