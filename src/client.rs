//! Client handle definitions
//!
//! The hub-side view of one live connection: the authenticated
//! username, the bounded outbound queue, and the shared current-room
//! cell. The transport itself stays in the handler's reader and writer
//! tasks; the hub only ever talks to a connection through this handle.

use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::SendError;
use crate::message::Envelope;
use crate::types::ConnectionId;

/// Shared current-room cell
///
/// Written only by the hub task; read by the connection's reader to
/// fill in the room id on inbound messages that target the current
/// room. This is the connection's non-owning link back into hub state.
pub type RoomCell = Arc<RwLock<Option<String>>>;

/// Create a room cell holding the given initial room, if any.
pub fn room_cell(initial_room: Option<String>) -> RoomCell {
    Arc::new(RwLock::new(initial_room.filter(|room| !room.is_empty())))
}

/// Hub-side record of a connected client
///
/// Cloning is cheap (channel sender + Arc) and is how broadcast loops
/// snapshot recipients without holding a borrow on the hub's maps.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    /// Unique identifier for this connection
    pub id: ConnectionId,
    /// Authenticated username, fixed at registration
    pub username: String,
    /// Producer side of the bounded outbound queue
    pub sender: mpsc::Sender<Envelope>,
    /// Room the connection is currently in
    room: RoomCell,
}

impl ClientHandle {
    /// Create a handle from the pieces assembled at accept time
    pub fn new(
        id: ConnectionId,
        username: String,
        sender: mpsc::Sender<Envelope>,
        room: RoomCell,
    ) -> Self {
        Self {
            id,
            username,
            sender,
            room,
        }
    }

    /// Enqueue a message without blocking
    ///
    /// A full queue means this consumer is not draining; the hub reacts
    /// by scheduling the connection for unregistration.
    pub fn try_send(&self, msg: Envelope) -> Result<(), SendError> {
        self.sender.try_send(msg).map_err(|err| match err {
            TrySendError::Full(_) => SendError::Full,
            TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Room the connection is currently in, if any
    pub fn current_room(&self) -> Option<String> {
        self.room
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Update the current room; hub task only
    pub(crate) fn set_room(&self, room: Option<String>) {
        *self
            .room
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = room;
    }
}

/// Registration event payload handed to the hub for a new connection
#[derive(Debug)]
pub struct Registration {
    /// The hub-side handle for the connection
    pub handle: ClientHandle,
    /// Room to join immediately after registration, if any
    pub initial_room: Option<String>,
}
