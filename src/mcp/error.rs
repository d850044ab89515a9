//! Error taxonomy for tool server sessions.

use std::time::Duration;

use super::connection::ConnectionState;

/// Launch or handshake failure. Fatal to the connection, aborts a
/// manager `start`.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("invalid spec for '{server}': {reason}")]
    InvalidSpec { server: String, reason: String },

    #[error("duplicate tool server name: {0}")]
    DuplicateName(String),

    #[error("session manager already started")]
    AlreadyStarted,

    #[error("failed to launch '{server}': {source}")]
    Spawn {
        server: String,
        #[source]
        source: std::io::Error,
    },

    #[error("handshake with '{server}' timed out after {timeout:?}")]
    HandshakeTimeout { server: String, timeout: Duration },

    #[error("handshake with '{server}' failed: {reason}")]
    Handshake { server: String, reason: String },

    #[error("startup task for '{server}' aborted: {reason}")]
    Aborted { server: String, reason: String },
}

impl ConnectionError {
    /// Name of the backend this error is attributable to, if any.
    pub fn server(&self) -> Option<&str> {
        match self {
            Self::InvalidSpec { server, .. }
            | Self::Spawn { server, .. }
            | Self::HandshakeTimeout { server, .. }
            | Self::Handshake { server, .. }
            | Self::Aborted { server, .. } => Some(server),
            Self::DuplicateName(name) => Some(name),
            Self::AlreadyStarted => None,
        }
    }
}

/// Malformed or unexpected traffic on an otherwise open transport.
///
/// Cloneable so one broken stream can fail every pending request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("transport closed")]
    TransportClosed,

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("text decoding failed: {0}")]
    Encoding(String),

    #[error("i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Failure of a request issued against a live tool server.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolExecutionError {
    #[error("tool server '{server}' is not ready (state: {state})")]
    NotReady { server: String, state: ConnectionState },

    #[error("protocol failure on '{server}': {source}")]
    Protocol {
        server: String,
        #[source]
        source: ProtocolError,
    },

    #[error("'{server}' rejected '{tool}': {message}")]
    BackendRejected { server: String, tool: String, message: String },

    #[error("'{tool}' on '{server}' timed out after {timeout:?}")]
    Timeout { server: String, tool: String, timeout: Duration },

    #[error("unknown server handle")]
    UnknownHandle,
}

impl ToolExecutionError {
    /// Whether this is a business-level rejection rather than a system fault.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::BackendRejected { .. })
    }
}

/// Failure while tearing down a connection. Logged, never propagated.
#[derive(Debug, thiserror::Error)]
pub enum CleanupError {
    #[error("closing streams of '{server}': {reason}")]
    Transport { server: String, reason: String },

    #[error("terminating process of '{server}': {reason}")]
    Process { server: String, reason: String },
}
