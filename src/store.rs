//! Store abstraction for chat state that outlives a connection
//!
//! The hub persists a sliding window of recent messages per room, the
//! active-user set per room, a global active-user set, and a monotone
//! per-room message counter. This module defines the trait the hub
//! programs against plus the fixed key schema; `redis_store` and
//! `memory_store` provide the implementations.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Default TTL for a room's recent-messages list.
pub const DEFAULT_MESSAGE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default TTL for a room's active-user set. Cleans up sets of rooms
/// that went inactive without orderly leaves.
pub const DEFAULT_ROOM_USERS_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// Key of the global set of all active usernames. No TTL; members are
/// removed explicitly on unregistration.
pub const GLOBAL_USERS_KEY: &str = "global:users";

/// List key holding a room's recent messages, newest at the head.
pub fn room_messages_key(room_id: &str) -> String {
    format!("room:{room_id}:messages")
}

/// Set key holding a room's active usernames.
pub fn room_users_key(room_id: &str) -> String {
    format!("room:{room_id}:users")
}

/// Counter key holding a room's cumulative message count.
pub fn room_message_count_key(room_id: &str) -> String {
    format!("room:{room_id}:message_count")
}

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Empty room id, username, or other rejected input
    #[error("Bad argument: {0}")]
    BadArgument(&'static str),

    /// Transport or protocol failure talking to the store
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A stored value does not parse as its expected type
    #[error("Corrupt value at '{key}': {value}")]
    CorruptValue { key: String, value: String },
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Per-room statistics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomStats {
    /// Number of usernames in the room's active set
    pub active_users: i64,
    /// Cumulative message count; 0 when the counter does not exist yet
    pub message_count: i64,
}

/// Chat-specific facade over a key-value store
///
/// The hub owns one implementation behind an `Arc<dyn Store>`. All
/// operations are per-request: a failure affects that call only and the
/// hub decides whether to log and continue or to surface an error.
#[async_trait]
pub trait Store: Send + Sync {
    /// Prepend a serialized message to the room's recent list, trim the
    /// list to `max_messages`, and refresh its expiry, atomically.
    /// `ttl` of `None` (or zero) applies [`DEFAULT_MESSAGE_TTL`];
    /// `max_messages` of 0 skips the trim.
    async fn add_recent_message(
        &self,
        room_id: &str,
        message_json: &str,
        max_messages: usize,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// Up to `count` recent messages, most recent first. A missing key
    /// yields an empty vec; `count` of 0 defaults to 10.
    async fn recent_messages(&self, room_id: &str, count: usize)
        -> Result<Vec<String>, StoreError>;

    /// Add a username to the room's active set and refresh the set's
    /// expiry. `ttl` of `None` (or zero) applies
    /// [`DEFAULT_ROOM_USERS_TTL`]. Idempotent on repeated adds.
    async fn add_active_user_to_room(
        &self,
        room_id: &str,
        username: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// Remove a username from the room's active set. Removing an absent
    /// member is not an error.
    async fn remove_active_user_from_room(
        &self,
        room_id: &str,
        username: &str,
    ) -> Result<(), StoreError>;

    /// All usernames in the room's active set, in no particular order.
    async fn active_users_in_room(&self, room_id: &str) -> Result<Vec<String>, StoreError>;

    /// Add a username to the global active set.
    async fn add_user_to_global_set(&self, username: &str) -> Result<(), StoreError>;

    /// Remove a username from the global active set.
    async fn remove_user_from_global_set(&self, username: &str) -> Result<(), StoreError>;

    /// Size of the global active set.
    async fn global_active_user_count(&self) -> Result<i64, StoreError>;

    /// Atomically increment the room's message counter and return the
    /// new value.
    async fn increment_message_counter(&self, room_id: &str) -> Result<i64, StoreError>;

    /// Active user count and cumulative message count in one call.
    async fn room_stats(&self, room_id: &str) -> Result<RoomStats, StoreError>;
}
