//! Wire message definitions
//!
//! A single JSON envelope carries every message in both directions. The
//! `type` tag selects the semantics; the optional `data` field holds a
//! typed payload whose shape is keyed by the tag.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message type tag
///
/// Closed set of wire tags, serialized as snake_case strings. Tags the
/// server does not know deserialize to `Unknown` so the hub can answer
/// with a targeted error instead of dropping the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Chat message body in `content` (C↔S)
    TextMessage,
    /// Request to switch to a new room (C→S)
    JoinRoom,
    /// Request to leave the current room without disconnecting (C→S)
    LeaveRoom,
    /// `content` is `"start"` or `"stop"` (C↔S)
    UserTyping,
    /// Ask for stats for a room (C→S)
    RequestRoomStats,
    /// Presence notification: a user joined the room (S→C)
    UserJoined,
    /// Presence notification: a user left the room (S→C)
    UserLeft,
    /// Recent history, delivered once after a join (S→C)
    RecentMessages,
    /// Authoritative active-user list for a room (S→C)
    UserListUpdate,
    /// Active user count plus cumulative message count (S→C)
    RoomStatsUpdate,
    /// Total active users across all rooms (S→C)
    GlobalUserCountUpdate,
    /// Targeted error to one connection (S→C)
    ErrorMessage,
    /// Any tag outside the closed set
    #[serde(other)]
    Unknown,
}

/// Wire envelope
///
/// The server overwrites `username` and `timestamp` on every inbound
/// message before routing; clients cannot spoof identity by setting
/// these fields. `room_id` is filled from the connection's current room
/// for types that implicitly target it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type tag
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Text body, typing status, or a JSON join request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Sender, or the user a system event is about
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Room this message pertains to; empty for global messages
    #[serde(rename = "roomID", default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    /// Server-assigned timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// True for server-generated presence/stats messages
    #[serde(default, skip_serializing_if = "is_false")]
    pub system: bool,
    /// Typed payload, present only for certain tags
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Payload>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl Envelope {
    /// Bare envelope of the given type with nothing filled in
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            content: None,
            username: None,
            room_id: None,
            timestamp: None,
            system: false,
            data: None,
        }
    }

    /// Targeted error envelope with human-readable content
    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            timestamp: Some(Utc::now()),
            ..Self::new(MessageType::ErrorMessage)
        }
    }

    /// System message scoped to a room (presence notifications)
    pub fn system_in_room(
        kind: MessageType,
        room_id: impl Into<String>,
        username: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            content: Some(content.into()),
            username: Some(username.into()),
            room_id: Some(room_id.into()),
            timestamp: Some(Utc::now()),
            system: true,
            ..Self::new(kind)
        }
    }

    /// System message carrying a typed payload
    pub fn with_payload(kind: MessageType, room_id: Option<String>, data: Payload) -> Self {
        Self {
            room_id,
            timestamp: Some(Utc::now()),
            system: true,
            data: Some(data),
            ..Self::new(kind)
        }
    }
}

/// Typed payloads for `Envelope::data`
///
/// Untagged: the enclosing envelope's `type` tag selects the variant, so
/// each variant must stay structurally distinguishable. Keep the
/// narrower shapes below the wider ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    /// Recent history for a room: serialized envelopes, newest first
    RecentMessages {
        #[serde(rename = "roomID")]
        room_id: String,
        messages: Vec<String>,
    },
    /// Active user list for a room
    UserList {
        #[serde(rename = "roomID")]
        room_id: String,
        users: Vec<String>,
    },
    /// Active user count and cumulative message count for a room
    RoomStats {
        #[serde(rename = "roomID")]
        room_id: String,
        active_users: i64,
        message_count: i64,
    },
    /// Total active users across all rooms
    GlobalUserCount { count: i64 },
    /// Structured error detail
    ErrorDetail {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<i64>,
        message: String,
    },
    /// Join request target, when the client sends it in `data`
    JoinRoom {
        #[serde(rename = "roomID")]
        room_id: String,
    },
}

/// Join request body, as sent in `content` as a JSON string
#[derive(Debug, Clone, Deserialize)]
pub struct JoinRoomRequest {
    /// Target room the client wishes to join
    #[serde(rename = "roomID")]
    pub room_id: String,
}
