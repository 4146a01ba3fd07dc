//! Basic type definitions for the chat server
//!
//! Provides the `ConnectionId` newtype: a UUID-based identifier for a
//! single live WebSocket connection. Room ids are opaque client-supplied
//! strings and carry no wrapper type.

use uuid::Uuid;

/// Unique connection identifier (newtype pattern)
///
/// Wraps a UUID v4 for type-safe identification of a live connection.
/// Implements Hash and Eq for use as HashMap/HashSet keys. Note that a
/// *user* is identified by username; one user may hold several
/// connections, each with its own `ConnectionId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Create a new random connection ID
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
