//! Error types for relay sessions.

use std::io;

use relay_tunnel_proto::messages::{OpenFailureReason, SessionRole};
use tokio_tungstenite::tungstenite::http::StatusCode;

/// The transport or the session handshake could not be established.
///
/// Fatal to the session that was being started. Never retried internally.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("invalid relay URI: {0}")]
    InvalidUri(String),

    #[error("failed to dial relay: {0}")]
    Dial(String),

    #[error("relay refused the upgrade with status {0}")]
    UpgradeRejected(StatusCode),

    #[error("relay selected sub-protocol {selected:?} instead of {expected:?}")]
    SubprotocolMismatch { expected: String, selected: Option<String> },

    #[error("timed out connecting to relay")]
    Timeout,

    #[error("session handshake failed: {0}")]
    Handshake(String),

    #[error("I/O error while connecting: {0}")]
    Io(#[from] io::Error),

    #[error("peer has role {peer}, but a {expected} was expected")]
    RoleMismatch { expected: SessionRole, peer: SessionRole },
}

/// Errors surfaced by sessions, forwarders and bridges.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("port {0} is not forwarded by this tunnel")]
    PortRejected(u32),

    #[error("channel rejected ({reason}): {description}")]
    ChannelRejected { reason: OpenFailureReason, description: String },

    #[error("failed to bind a local listener for port {port}: {source}")]
    Bind { port: u16, source: io::Error },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out")]
    Timeout,

    #[error("session is closed")]
    SessionClosed,

    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

impl RelayError {
    /// Whether this error means the owning session is gone, as opposed to a failure contained to
    /// a single request, channel or connection.
    pub fn is_session_closed(&self) -> bool {
        matches!(self, Self::SessionClosed)
    }
}
