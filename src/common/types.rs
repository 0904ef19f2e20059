//! Common types used throughout the application

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Connection identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Create a new connection ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a single accepted connection.
///
/// A connection only moves forward through these states; any failure jumps
/// straight to `Closing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Raw socket obtained from the listener
    Accepted,
    /// TLS negotiation in progress
    Handshaking,
    /// Hostname resolved and backend address determined
    Routed,
    /// Bytes are being copied in both directions
    Relaying,
    /// Sockets are being shut down
    Closing,
    /// Both sockets released
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Accepted => write!(f, "Accepted"),
            ConnectionState::Handshaking => write!(f, "Handshaking"),
            ConnectionState::Routed => write!(f, "Routed"),
            ConnectionState::Relaying => write!(f, "Relaying"),
            ConnectionState::Closing => write!(f, "Closing"),
            ConnectionState::Closed => write!(f, "Closed"),
        }
    }
}
