//! Hub actor implementation
//!
//! The central actor that owns all routing state: the global connection
//! set and the per-room membership sets. Register, unregister, and
//! parsed inbound messages arrive on one event channel and are handled
//! one at a time, so every mutation and every broadcast decision happens
//! on this single task. Persistence (recent history, presence sets,
//! counters) goes through the [`Store`] on each membership change and
//! text message; store failures are logged and the live fan-out
//! proceeds.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures_util::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::client::{ClientHandle, Registration};
use crate::error::SendError;
use crate::message::{Envelope, JoinRoomRequest, MessageType, Payload};
use crate::room::Room;
use crate::store::Store;
use crate::types::ConnectionId;

/// Maximum number of recent messages kept per room in the store.
const MAX_RECENT_MESSAGES_TO_STORE: usize = 50;

/// Maximum number of recent messages sent to a client on join. Must not
/// exceed [`MAX_RECENT_MESSAGES_TO_STORE`].
const MAX_RECENT_MESSAGES_TO_SEND: usize = 20;

/// Events processed by the hub's event loop
#[derive(Debug)]
pub enum HubEvent {
    /// A new authenticated connection to take ownership of
    Register(Registration),
    /// A connection to tear down
    Unregister(ConnectionId),
    /// A parsed, identity-stamped message from a connection's reader
    Inbound(Envelope),
}

/// The central hub actor
///
/// Owns every [`ClientHandle`] and the room membership map. Exactly one
/// hub runs per process; collaborators hold only the event channel
/// sender.
pub struct Hub {
    /// All registered connections
    clients: HashMap<ConnectionId, ClientHandle>,
    /// Room membership, created lazily and dropped when empty
    rooms: HashMap<String, Room>,
    /// Event receiver channel
    receiver: mpsc::Receiver<HubEvent>,
    /// Sender half of the same channel, for scheduling follow-up events
    /// (slow-consumer unregistration) from outside the current handler
    events: mpsc::Sender<HubEvent>,
    /// Persistence for history, presence, and counters
    store: Arc<dyn Store>,
}

impl Hub {
    /// Create a new hub over the given event channel and store
    pub fn new(
        receiver: mpsc::Receiver<HubEvent>,
        events: mpsc::Sender<HubEvent>,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            clients: HashMap::new(),
            rooms: HashMap::new(),
            receiver,
            events,
            store,
        }
    }

    /// Run the hub event loop
    ///
    /// Processes events until all senders are dropped. A panicking
    /// handler is contained: the event is lost, the hub keeps running.
    pub async fn run(mut self) {
        info!("Hub started");

        while let Some(event) = self.receiver.recv().await {
            if let Err(panic) = AssertUnwindSafe(self.handle_event(event))
                .catch_unwind()
                .await
            {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                error!("Hub event handler panicked: {}", detail);
            }
        }

        info!("Hub shutting down");
    }

    /// Process a single event
    async fn handle_event(&mut self, event: HubEvent) {
        match event {
            HubEvent::Register(registration) => self.handle_register(registration).await,
            HubEvent::Unregister(id) => self.handle_unregister(id).await,
            HubEvent::Inbound(msg) => self.handle_inbound(msg).await,
        }
    }

    /// Handle a new connection
    async fn handle_register(&mut self, registration: Registration) {
        let Registration {
            handle,
            initial_room,
        } = registration;
        info!(
            "Client '{}' registered (room: {:?})",
            handle.username, initial_room
        );

        self.clients.insert(handle.id, handle.clone());

        if let Err(e) = self.store.add_user_to_global_set(&handle.username).await {
            error!(
                "Adding user '{}' to global set failed: {}",
                handle.username, e
            );
        }
        self.broadcast_global_user_count().await;

        match initial_room {
            Some(room_id) if !room_id.is_empty() => self.join_room(&handle, &room_id).await,
            _ => debug!(
                "Client '{}' connected without an initial room",
                handle.username
            ),
        }
    }

    /// Handle a connection teardown
    ///
    /// Dropping the handle closes the outbound queue, which is the
    /// writer task's shutdown signal.
    async fn handle_unregister(&mut self, id: ConnectionId) {
        let Some(handle) = self.clients.remove(&id) else {
            return;
        };
        info!("Client '{}' unregistered", handle.username);

        if let Some(room_id) = handle.current_room() {
            self.leave_room(&handle, &room_id, true).await;
        }

        if let Err(e) = self
            .store
            .remove_user_from_global_set(&handle.username)
            .await
        {
            error!(
                "Removing user '{}' from global set failed: {}",
                handle.username, e
            );
        }
        self.broadcast_global_user_count().await;
    }

    /// Route one inbound message by its type tag
    async fn handle_inbound(&mut self, mut msg: Envelope) {
        // The hub re-stamps the timestamp so every message it emits or
        // stores carries its own clock.
        msg.timestamp = Some(Utc::now());

        let username = msg.username.clone().unwrap_or_default();
        let Some(sender) = self.find_client_by_username(&username) else {
            warn!(
                "Message from unknown or unregistered user '{}' (type {:?}); discarding",
                username, msg.kind
            );
            return;
        };

        match msg.kind {
            MessageType::TextMessage => self.handle_text_message(&sender, msg).await,
            MessageType::JoinRoom => self.handle_join_request(&sender, &msg).await,
            MessageType::LeaveRoom => {
                if let Some(room_id) = sender.current_room() {
                    debug!("Client '{}' leaving room '{}' by request", sender.username, room_id);
                    self.leave_room(&sender, &room_id, false).await;
                }
            }
            MessageType::UserTyping => {
                // Broadcast as-is (content carries "start"/"stop");
                // silently ignored when the room is unknown.
                if msg.room_id.as_deref().is_some_and(|room| !room.is_empty()) {
                    self.broadcast_to_room(&msg);
                }
            }
            MessageType::RequestRoomStats => self.handle_stats_request(&sender, &msg).await,
            _ => {
                warn!(
                    "Unknown message type from user '{}'; answering with error",
                    sender.username
                );
                self.send_to_client(&sender, Envelope::error("Unknown message type received."));
            }
        }
    }

    /// Persist and fan out a chat message
    async fn handle_text_message(&mut self, sender: &ClientHandle, mut msg: Envelope) {
        let room_id = msg.room_id.clone().unwrap_or_default();
        if room_id.is_empty() || msg.username.as_deref().unwrap_or_default().is_empty() {
            warn!(
                "Text message from '{}' missing room or username; rejecting",
                sender.username
            );
            self.send_to_client(
                sender,
                Envelope::error("Your message could not be sent: RoomID or Username was missing."),
            );
            return;
        }
        msg.system = false;

        let serialized = match serde_json::to_string(&msg) {
            Ok(json) => json,
            Err(e) => {
                error!("Serializing text message for storage failed: {}", e);
                return;
            }
        };

        // History and counter are best-effort: a store failure loses
        // persistence for this message, not delivery.
        if let Err(e) = self
            .store
            .add_recent_message(&room_id, &serialized, MAX_RECENT_MESSAGES_TO_STORE, None)
            .await
        {
            error!("Storing message for room '{}' failed: {}", room_id, e);
        }
        if let Err(e) = self.store.increment_message_counter(&room_id).await {
            error!("Incrementing counter for room '{}' failed: {}", room_id, e);
        }

        self.broadcast_to_room(&msg);
        self.broadcast_room_stats(&room_id).await;
    }

    /// Handle a request to switch rooms
    async fn handle_join_request(&mut self, sender: &ClientHandle, msg: &Envelope) {
        let target = msg
            .content
            .as_deref()
            .and_then(|content| serde_json::from_str::<JoinRoomRequest>(content).ok())
            .map(|request| request.room_id)
            .or_else(|| match &msg.data {
                Some(Payload::JoinRoom { room_id }) => Some(room_id.clone()),
                _ => None,
            });

        let Some(target) = target else {
            warn!(
                "Malformed join request from '{}': {:?}",
                sender.username, msg.content
            );
            self.send_to_client(sender, Envelope::error("Invalid join room request format."));
            return;
        };
        if target.is_empty() {
            self.send_to_client(sender, Envelope::error("Cannot join an empty RoomID."));
            return;
        }

        if let Some(current) = sender.current_room() {
            if current != target {
                debug!(
                    "Client '{}' leaving room '{}' to join '{}'",
                    sender.username, current, target
                );
                self.leave_room(sender, &current, false).await;
            }
        }
        self.join_room(sender, &target).await;
    }

    /// Answer a stats request, to the requester only
    async fn handle_stats_request(&mut self, sender: &ClientHandle, msg: &Envelope) {
        let target = msg
            .room_id
            .clone()
            .filter(|room| !room.is_empty())
            .or_else(|| sender.current_room());
        let Some(room_id) = target.filter(|room| !room.is_empty()) else {
            self.send_to_client(sender, Envelope::error("RoomID required for stats request."));
            return;
        };

        match self.store.room_stats(&room_id).await {
            Ok(stats) => {
                let reply = Envelope::with_payload(
                    MessageType::RoomStatsUpdate,
                    Some(room_id.clone()),
                    Payload::RoomStats {
                        room_id,
                        active_users: stats.active_users,
                        message_count: stats.message_count,
                    },
                );
                self.send_to_client(sender, reply);
            }
            Err(e) => {
                error!("Getting stats for room '{}' failed: {}", room_id, e);
                self.send_to_client(
                    sender,
                    Envelope::error(format!("Failed to get room stats for {room_id}")),
                );
            }
        }
    }

    /// Join routine: membership, presence, history, and announcements
    async fn join_room(&mut self, handle: &ClientHandle, room_id: &str) {
        if room_id.is_empty() {
            warn!(
                "Client '{}' attempted to join an empty room id",
                handle.username
            );
            self.send_to_client(handle, Envelope::error("Invalid RoomID. Cannot join."));
            return;
        }
        info!("Client '{}' joining room '{}'", handle.username, room_id);

        self.rooms
            .entry(room_id.to_string())
            .or_insert_with(Room::new)
            .insert(handle.id);
        handle.set_room(Some(room_id.to_string()));

        if let Err(e) = self
            .store
            .add_active_user_to_room(room_id, &handle.username, None)
            .await
        {
            error!(
                "Adding user '{}' to room set '{}' failed: {}",
                handle.username, room_id, e
            );
        }

        // History goes to the joiner only, before the join announcement
        // lands in their queue.
        match self
            .store
            .recent_messages(room_id, MAX_RECENT_MESSAGES_TO_SEND)
            .await
        {
            Ok(messages) if !messages.is_empty() => {
                debug!(
                    "Sending {} recent messages to '{}' for room '{}'",
                    messages.len(),
                    handle.username,
                    room_id
                );
                let history = Envelope::with_payload(
                    MessageType::RecentMessages,
                    Some(room_id.to_string()),
                    Payload::RecentMessages {
                        room_id: room_id.to_string(),
                        messages,
                    },
                );
                self.send_to_client(handle, history);
            }
            Ok(_) => {}
            Err(e) => {
                error!("Getting recent messages for room '{}' failed: {}", room_id, e);
            }
        }

        self.broadcast_to_room(&Envelope::system_in_room(
            MessageType::UserJoined,
            room_id,
            handle.username.clone(),
            format!("User '{}' joined the room.", handle.username),
        ));
        self.broadcast_user_list(room_id).await;
        self.broadcast_room_stats(room_id).await;
    }

    /// Leave routine: membership, presence, and announcements
    ///
    /// `is_disconnect` marks a full teardown, in which case the current
    /// room marker is left for the unregister path rather than cleared.
    async fn leave_room(&mut self, handle: &ClientHandle, room_id: &str, is_disconnect: bool) {
        if room_id.is_empty() {
            return;
        }
        info!(
            "Client '{}' leaving room '{}' (disconnect: {})",
            handle.username, room_id, is_disconnect
        );

        let was_member = match self.rooms.get_mut(room_id) {
            Some(room) => {
                let removed = room.remove(&handle.id);
                if room.is_empty() {
                    debug!("Room '{}' is now empty, dropping it", room_id);
                    self.rooms.remove(room_id);
                }
                removed
            }
            None => false,
        };

        if was_member {
            if let Err(e) = self
                .store
                .remove_active_user_from_room(room_id, &handle.username)
                .await
            {
                error!(
                    "Removing user '{}' from room set '{}' failed: {}",
                    handle.username, room_id, e
                );
            }

            self.broadcast_to_room(&Envelope::system_in_room(
                MessageType::UserLeft,
                room_id,
                handle.username.clone(),
                format!("User '{}' left the room.", handle.username),
            ));
            self.broadcast_user_list(room_id).await;
            self.broadcast_room_stats(room_id).await;
        } else {
            warn!(
                "Client '{}' was not a member of room '{}' during leave",
                handle.username, room_id
            );
        }

        if !is_disconnect {
            handle.set_room(None);
        }
    }

    /// Fan a message out to every member of its room
    ///
    /// Typing notifications skip the originator. Recipients are
    /// snapshotted before any send so a slow peer cannot stall routing;
    /// a failed enqueue schedules that connection for unregistration
    /// and the broadcast continues.
    fn broadcast_to_room(&self, msg: &Envelope) {
        let Some(room_id) = msg.room_id.as_deref().filter(|room| !room.is_empty()) else {
            warn!(
                "Attempted to broadcast message type {:?} with no room",
                msg.kind
            );
            return;
        };
        let Some(room) = self.rooms.get(room_id) else {
            warn!(
                "Room '{}' not found for broadcasting message type {:?}",
                room_id, msg.kind
            );
            return;
        };

        let recipients: Vec<ClientHandle> = room
            .members()
            .filter_map(|id| self.clients.get(id))
            .filter(|client| {
                !(msg.kind == MessageType::UserTyping
                    && Some(client.username.as_str()) == msg.username.as_deref())
            })
            .cloned()
            .collect();

        debug!(
            "Broadcasting {:?} to {} clients in room '{}'",
            msg.kind,
            recipients.len(),
            room_id
        );
        for client in recipients {
            self.send_to_client(&client, msg.clone());
        }
    }

    /// Broadcast the authoritative user list of a room
    async fn broadcast_user_list(&mut self, room_id: &str) {
        let users = match self.store.active_users_in_room(room_id).await {
            Ok(users) => users,
            Err(e) => {
                error!("Getting user list for room '{}' failed: {}", room_id, e);
                return;
            }
        };
        self.broadcast_to_room(&Envelope::with_payload(
            MessageType::UserListUpdate,
            Some(room_id.to_string()),
            Payload::UserList {
                room_id: room_id.to_string(),
                users,
            },
        ));
    }

    /// Broadcast fresh stats for a room
    async fn broadcast_room_stats(&mut self, room_id: &str) {
        let stats = match self.store.room_stats(room_id).await {
            Ok(stats) => stats,
            Err(e) => {
                error!("Getting stats for room '{}' failed: {}", room_id, e);
                return;
            }
        };
        self.broadcast_to_room(&Envelope::with_payload(
            MessageType::RoomStatsUpdate,
            Some(room_id.to_string()),
            Payload::RoomStats {
                room_id: room_id.to_string(),
                active_users: stats.active_users,
                message_count: stats.message_count,
            },
        ));
    }

    /// Broadcast the global active-user count to every connection
    async fn broadcast_global_user_count(&mut self) {
        let count = match self.store.global_active_user_count().await {
            Ok(count) => count,
            Err(e) => {
                error!("Getting global user count failed: {}", e);
                return;
            }
        };
        debug!("Broadcasting global user count: {}", count);

        let msg = Envelope::with_payload(
            MessageType::GlobalUserCountUpdate,
            None,
            Payload::GlobalUserCount { count },
        );
        let recipients: Vec<ClientHandle> = self.clients.values().cloned().collect();
        for client in recipients {
            self.send_to_client(&client, msg.clone());
        }
    }

    /// Enqueue a message for one connection without blocking
    fn send_to_client(&self, client: &ClientHandle, msg: Envelope) {
        match client.try_send(msg) {
            Ok(()) => {}
            Err(SendError::Full) | Err(SendError::Closed) => {
                warn!(
                    "Outbound queue full/closed for '{}'; scheduling unregister",
                    client.username
                );
                // Posted from a fresh task: the event loop must not
                // await its own bounded channel.
                let events = self.events.clone();
                let id = client.id;
                tokio::spawn(async move {
                    let _ = events.send(HubEvent::Unregister(id)).await;
                });
            }
        }
    }

    /// Find a registered connection by username
    ///
    /// Linear scan over the connection set. Duplicate usernames are not
    /// prevented at this layer; when two connections share a name an
    /// arbitrary one is returned.
    fn find_client_by_username(&self, username: &str) -> Option<ClientHandle> {
        self.clients
            .values()
            .find(|client| client.username == username)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::room_cell;
    use crate::memory_store::MemoryStore;
    use std::time::Duration;
    use tokio::sync::mpsc::Receiver;
    use tokio::time::timeout;

    fn test_hub() -> (Hub, mpsc::Sender<HubEvent>, Arc<MemoryStore>) {
        let (tx, rx) = mpsc::channel(64);
        let store = Arc::new(MemoryStore::new());
        let hub = Hub::new(rx, tx.clone(), store.clone());
        (hub, tx, store)
    }

    async fn register(
        hub: &mut Hub,
        username: &str,
        room: &str,
        capacity: usize,
    ) -> (ConnectionId, Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity);
        let id = ConnectionId::new();
        let initial_room = (!room.is_empty()).then(|| room.to_string());
        let handle = ClientHandle::new(
            id,
            username.to_string(),
            tx,
            room_cell(initial_room.clone()),
        );
        hub.handle_register(Registration {
            handle,
            initial_room,
        })
        .await;
        (id, rx)
    }

    /// Inbound envelope as the reader would deliver it.
    fn inbound(kind: MessageType, username: &str, room: Option<&str>, content: Option<&str>) -> Envelope {
        let mut msg = Envelope::new(kind);
        msg.username = Some(username.to_string());
        msg.room_id = room.map(str::to_string);
        msg.content = content.map(str::to_string);
        msg.timestamp = Some(Utc::now());
        msg
    }

    async fn next(rx: &mut Receiver<Envelope>) -> Envelope {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("queue closed")
    }

    fn assert_no_message(rx: &mut Receiver<Envelope>) {
        match rx.try_recv() {
            Err(_) => {}
            Ok(msg) => panic!("unexpected message: {:?}", msg),
        }
    }

    /// Drain the per-room join sequence a fresh member sees after the
    /// global count (user_joined, user_list_update, room_stats_update).
    async fn drain_join(rx: &mut Receiver<Envelope>) {
        assert_eq!(next(rx).await.kind, MessageType::UserJoined);
        assert_eq!(next(rx).await.kind, MessageType::UserListUpdate);
        assert_eq!(next(rx).await.kind, MessageType::RoomStatsUpdate);
    }

    #[tokio::test]
    async fn test_solo_join_delivers_history_and_presence_in_order() {
        let (mut hub, _tx, store) = test_hub();
        for m in ["m1", "m2", "m3"] {
            store.add_recent_message("r1", m, 50, None).await.unwrap();
            store.increment_message_counter("r1").await.unwrap();
        }

        let (_id, mut rx) = register(&mut hub, "alice", "r1", 16).await;

        let count = next(&mut rx).await;
        assert_eq!(count.kind, MessageType::GlobalUserCountUpdate);
        assert_eq!(count.data, Some(Payload::GlobalUserCount { count: 1 }));

        let history = next(&mut rx).await;
        assert_eq!(history.kind, MessageType::RecentMessages);
        assert!(history.system);
        assert_eq!(
            history.data,
            Some(Payload::RecentMessages {
                room_id: "r1".to_string(),
                messages: vec!["m3".to_string(), "m2".to_string(), "m1".to_string()],
            })
        );

        let joined = next(&mut rx).await;
        assert_eq!(joined.kind, MessageType::UserJoined);
        assert_eq!(joined.username.as_deref(), Some("alice"));
        assert_eq!(
            joined.content.as_deref(),
            Some("User 'alice' joined the room.")
        );

        let users = next(&mut rx).await;
        assert_eq!(
            users.data,
            Some(Payload::UserList {
                room_id: "r1".to_string(),
                users: vec!["alice".to_string()],
            })
        );

        let stats = next(&mut rx).await;
        assert_eq!(
            stats.data,
            Some(Payload::RoomStats {
                room_id: "r1".to_string(),
                active_users: 1,
                message_count: 3,
            })
        );
    }

    #[tokio::test]
    async fn test_text_message_fans_out_and_persists() {
        let (mut hub, _tx, store) = test_hub();
        let (_alice, mut alice_rx) = register(&mut hub, "alice", "r1", 32).await;
        let (_bob, mut bob_rx) = register(&mut hub, "bob", "r1", 32).await;

        // alice: her own join sequence, then bob's arrival
        next(&mut alice_rx).await; // global count (alice)
        drain_join(&mut alice_rx).await;
        next(&mut alice_rx).await; // global count (bob)
        drain_join(&mut alice_rx).await;
        next(&mut bob_rx).await; // global count (bob)
        drain_join(&mut bob_rx).await;

        hub.handle_inbound(inbound(
            MessageType::TextMessage,
            "alice",
            Some("r1"),
            Some("hi"),
        ))
        .await;

        for rx in [&mut alice_rx, &mut bob_rx] {
            let text = next(rx).await;
            assert_eq!(text.kind, MessageType::TextMessage);
            assert_eq!(text.username.as_deref(), Some("alice"));
            assert_eq!(text.room_id.as_deref(), Some("r1"));
            assert_eq!(text.content.as_deref(), Some("hi"));
            assert!(text.timestamp.is_some());
            assert!(!text.system);

            let stats = next(rx).await;
            assert_eq!(
                stats.data,
                Some(Payload::RoomStats {
                    room_id: "r1".to_string(),
                    active_users: 2,
                    message_count: 1,
                })
            );
        }

        // head of the stored history is the serialized live envelope
        let stored = store.recent_messages("r1", 1).await.unwrap();
        let head: Envelope = serde_json::from_str(&stored[0]).unwrap();
        assert_eq!(head.kind, MessageType::TextMessage);
        assert_eq!(head.content.as_deref(), Some("hi"));
        assert_eq!(store.room_stats("r1").await.unwrap().message_count, 1);
    }

    #[tokio::test]
    async fn test_typing_is_not_echoed_to_sender() {
        let (mut hub, _tx, _store) = test_hub();
        let (_alice, mut alice_rx) = register(&mut hub, "alice", "r1", 32).await;
        let (_bob, mut bob_rx) = register(&mut hub, "bob", "r1", 32).await;

        next(&mut alice_rx).await;
        drain_join(&mut alice_rx).await;
        next(&mut alice_rx).await;
        drain_join(&mut alice_rx).await;
        next(&mut bob_rx).await;
        drain_join(&mut bob_rx).await;

        hub.handle_inbound(inbound(
            MessageType::UserTyping,
            "alice",
            Some("r1"),
            Some("start"),
        ))
        .await;

        let typing = next(&mut bob_rx).await;
        assert_eq!(typing.kind, MessageType::UserTyping);
        assert_eq!(typing.content.as_deref(), Some("start"));

        assert_no_message(&mut alice_rx);
    }

    #[tokio::test]
    async fn test_room_switch_notifies_both_rooms() {
        let (mut hub, _tx, store) = test_hub();
        store.add_recent_message("r2", "old", 50, None).await.unwrap();

        let (alice_id, mut alice_rx) = register(&mut hub, "alice", "r1", 64).await;
        let (_bob, mut bob_rx) = register(&mut hub, "bob", "r1", 64).await;
        let (_carol, mut carol_rx) = register(&mut hub, "carol", "r2", 64).await;

        next(&mut alice_rx).await;
        drain_join(&mut alice_rx).await;
        next(&mut alice_rx).await;
        drain_join(&mut alice_rx).await;
        next(&mut alice_rx).await; // carol's global count
        next(&mut bob_rx).await;
        drain_join(&mut bob_rx).await;
        next(&mut bob_rx).await;
        next(&mut carol_rx).await; // global count
        next(&mut carol_rx).await; // recent_messages for r2
        drain_join(&mut carol_rx).await;

        hub.handle_inbound(inbound(
            MessageType::JoinRoom,
            "alice",
            None,
            Some(r#"{"roomID":"r2"}"#),
        ))
        .await;

        // r1 sees alice leave
        let left = next(&mut bob_rx).await;
        assert_eq!(left.kind, MessageType::UserLeft);
        assert_eq!(left.username.as_deref(), Some("alice"));
        let users = next(&mut bob_rx).await;
        assert_eq!(
            users.data,
            Some(Payload::UserList {
                room_id: "r1".to_string(),
                users: vec!["bob".to_string()],
            })
        );
        assert_eq!(next(&mut bob_rx).await.kind, MessageType::RoomStatsUpdate);

        // r2 sees alice join; alice gets r2 history first
        let history = next(&mut alice_rx).await;
        assert_eq!(history.kind, MessageType::RecentMessages);
        assert_eq!(history.room_id.as_deref(), Some("r2"));
        let joined = next(&mut alice_rx).await;
        assert_eq!(joined.kind, MessageType::UserJoined);
        assert_eq!(joined.username.as_deref(), Some("alice"));

        let carol_joined = next(&mut carol_rx).await;
        assert_eq!(carol_joined.kind, MessageType::UserJoined);
        assert_eq!(carol_joined.username.as_deref(), Some("alice"));
        let carol_users = next(&mut carol_rx).await;
        assert_eq!(
            carol_users.data,
            Some(Payload::UserList {
                room_id: "r2".to_string(),
                users: vec!["alice".to_string(), "carol".to_string()],
            })
        );

        // hub and store agree on the switch
        assert!(hub.rooms.get("r2").unwrap().contains(&alice_id));
        assert!(!hub.rooms.get("r1").unwrap().contains(&alice_id));
        assert_eq!(
            hub.clients.get(&alice_id).unwrap().current_room(),
            Some("r2".to_string())
        );
        assert_eq!(
            store.active_users_in_room("r1").await.unwrap(),
            vec!["bob"]
        );
    }

    #[tokio::test]
    async fn test_disconnect_cleans_up_room_and_global_state() {
        let (mut hub, _tx, store) = test_hub();
        let (_alice, mut alice_rx) = register(&mut hub, "alice", "r1", 64).await;
        let (bob_id, bob_rx) = register(&mut hub, "bob", "r1", 64).await;

        next(&mut alice_rx).await;
        drain_join(&mut alice_rx).await;
        next(&mut alice_rx).await;
        drain_join(&mut alice_rx).await;
        drop(bob_rx); // bob's transport dies

        hub.handle_unregister(bob_id).await;

        let left = next(&mut alice_rx).await;
        assert_eq!(left.kind, MessageType::UserLeft);
        assert_eq!(left.username.as_deref(), Some("bob"));
        let users = next(&mut alice_rx).await;
        assert_eq!(
            users.data,
            Some(Payload::UserList {
                room_id: "r1".to_string(),
                users: vec!["alice".to_string()],
            })
        );
        assert_eq!(next(&mut alice_rx).await.kind, MessageType::RoomStatsUpdate);
        let count = next(&mut alice_rx).await;
        assert_eq!(count.data, Some(Payload::GlobalUserCount { count: 1 }));

        assert!(!hub.clients.contains_key(&bob_id));
        assert!(!hub.rooms.get("r1").unwrap().contains(&bob_id));
        assert_eq!(store.global_active_user_count().await.unwrap(), 1);
        assert_eq!(
            store.active_users_in_room("r1").await.unwrap(),
            vec!["alice"]
        );
    }

    #[tokio::test]
    async fn test_join_then_leave_restores_state() {
        let (mut hub, _tx, store) = test_hub();
        let (alice_id, _alice_rx) = register(&mut hub, "alice", "", 64).await;

        assert!(hub.rooms.get("r1").is_none());

        hub.handle_inbound(inbound(
            MessageType::JoinRoom,
            "alice",
            None,
            Some(r#"{"roomID":"r1"}"#),
        ))
        .await;
        assert!(hub.rooms.get("r1").unwrap().contains(&alice_id));
        assert_eq!(
            store.active_users_in_room("r1").await.unwrap(),
            vec!["alice"]
        );

        hub.handle_inbound(inbound(MessageType::LeaveRoom, "alice", None, None))
            .await;
        assert!(hub.rooms.get("r1").is_none());
        assert!(store.active_users_in_room("r1").await.unwrap().is_empty());
        assert_eq!(
            hub.clients.get(&alice_id).unwrap().current_room(),
            None
        );
    }

    #[tokio::test]
    async fn test_text_without_room_gets_error_and_no_state_change() {
        let (mut hub, _tx, store) = test_hub();
        let (_alice, mut alice_rx) = register(&mut hub, "alice", "", 16).await;
        next(&mut alice_rx).await; // global count

        hub.handle_inbound(inbound(
            MessageType::TextMessage,
            "alice",
            None,
            Some("hi"),
        ))
        .await;

        let err = next(&mut alice_rx).await;
        assert_eq!(err.kind, MessageType::ErrorMessage);
        assert!(err.content.unwrap().contains("could not be sent"));
        assert!(store.recent_messages("r1", 10).await.unwrap().is_empty());
        assert!(hub.rooms.is_empty());
    }

    #[tokio::test]
    async fn test_join_empty_room_id_gets_error() {
        let (mut hub, _tx, _store) = test_hub();
        let (_alice, mut alice_rx) = register(&mut hub, "alice", "", 16).await;
        next(&mut alice_rx).await;

        hub.handle_inbound(inbound(
            MessageType::JoinRoom,
            "alice",
            None,
            Some(r#"{"roomID":""}"#),
        ))
        .await;

        let err = next(&mut alice_rx).await;
        assert_eq!(err.kind, MessageType::ErrorMessage);
        assert_eq!(err.content.as_deref(), Some("Cannot join an empty RoomID."));
        assert!(hub.rooms.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_type_gets_targeted_error() {
        let (mut hub, _tx, _store) = test_hub();
        let (_alice, mut alice_rx) = register(&mut hub, "alice", "", 16).await;
        next(&mut alice_rx).await;

        hub.handle_inbound(inbound(MessageType::Unknown, "alice", None, None))
            .await;

        let err = next(&mut alice_rx).await;
        assert_eq!(err.kind, MessageType::ErrorMessage);
        assert!(err.content.unwrap().contains("Unknown message type"));
    }

    #[tokio::test]
    async fn test_stats_request_answers_requester_only() {
        let (mut hub, _tx, store) = test_hub();
        let (_alice, mut alice_rx) = register(&mut hub, "alice", "r1", 32).await;
        let (_bob, mut bob_rx) = register(&mut hub, "bob", "r1", 32).await;

        next(&mut alice_rx).await;
        drain_join(&mut alice_rx).await;
        next(&mut alice_rx).await;
        drain_join(&mut alice_rx).await;
        next(&mut bob_rx).await;
        drain_join(&mut bob_rx).await;

        store.increment_message_counter("r1").await.unwrap();

        hub.handle_inbound(inbound(MessageType::RequestRoomStats, "alice", Some("r1"), None))
            .await;

        let stats = next(&mut alice_rx).await;
        assert_eq!(stats.kind, MessageType::RoomStatsUpdate);
        assert_eq!(
            stats.data,
            Some(Payload::RoomStats {
                room_id: "r1".to_string(),
                active_users: 2,
                message_count: 1,
            })
        );
        assert_no_message(&mut bob_rx);
    }

    #[tokio::test]
    async fn test_stats_request_without_any_room_gets_error() {
        let (mut hub, _tx, _store) = test_hub();
        let (_alice, mut alice_rx) = register(&mut hub, "alice", "", 16).await;
        next(&mut alice_rx).await;

        hub.handle_inbound(inbound(MessageType::RequestRoomStats, "alice", None, None))
            .await;

        let err = next(&mut alice_rx).await;
        assert_eq!(err.kind, MessageType::ErrorMessage);
        assert_eq!(
            err.content.as_deref(),
            Some("RoomID required for stats request.")
        );
    }

    #[tokio::test]
    async fn test_message_from_unregistered_user_is_discarded() {
        let (mut hub, _tx, store) = test_hub();
        let (_alice, mut alice_rx) = register(&mut hub, "alice", "r1", 32).await;
        next(&mut alice_rx).await;
        drain_join(&mut alice_rx).await;

        hub.handle_inbound(inbound(
            MessageType::TextMessage,
            "ghost",
            Some("r1"),
            Some("boo"),
        ))
        .await;

        assert_no_message(&mut alice_rx);
        assert!(store.recent_messages("r1", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_slow_consumer_is_evicted_and_broadcast_completes() {
        let (mut hub, _tx, _store) = test_hub();
        let (_alice, mut alice_rx) = register(&mut hub, "alice", "r1", 64).await;

        // carol's queue holds exactly her registration traffic (global
        // count, user_joined, user_list, stats) and is never drained
        let (carol_id, _carol_rx) = register(&mut hub, "carol", "r1", 4).await;

        next(&mut alice_rx).await;
        drain_join(&mut alice_rx).await;
        next(&mut alice_rx).await;
        drain_join(&mut alice_rx).await;

        hub.handle_inbound(inbound(
            MessageType::TextMessage,
            "alice",
            Some("r1"),
            Some("hi"),
        ))
        .await;

        // the broadcast completed for alice
        assert_eq!(next(&mut alice_rx).await.kind, MessageType::TextMessage);
        assert_eq!(next(&mut alice_rx).await.kind, MessageType::RoomStatsUpdate);

        // the failed enqueue scheduled carol's unregistration; pump the
        // scheduled events through the loop
        while hub.clients.contains_key(&carol_id) {
            timeout(Duration::from_secs(1), hub.pump_one())
                .await
                .expect("no scheduled unregister arrived");
        }

        let left = next(&mut alice_rx).await;
        assert_eq!(left.kind, MessageType::UserLeft);
        assert_eq!(left.username.as_deref(), Some("carol"));
        assert_eq!(next(&mut alice_rx).await.kind, MessageType::UserListUpdate);
        assert_eq!(next(&mut alice_rx).await.kind, MessageType::RoomStatsUpdate);
        let count = next(&mut alice_rx).await;
        assert_eq!(count.data, Some(Payload::GlobalUserCount { count: 1 }));
    }

    #[tokio::test]
    async fn test_rejoining_current_room_is_idempotent_for_membership() {
        let (mut hub, _tx, _store) = test_hub();
        let (alice_id, _alice_rx) = register(&mut hub, "alice", "r1", 64).await;

        hub.handle_inbound(inbound(
            MessageType::JoinRoom,
            "alice",
            None,
            Some(r#"{"roomID":"r1"}"#),
        ))
        .await;

        assert_eq!(hub.rooms.get("r1").unwrap().len(), 1);
        assert!(hub.rooms.get("r1").unwrap().contains(&alice_id));
    }
}

#[cfg(test)]
impl Hub {
    /// Pop and handle one queued event; test helper for paths that
    /// schedule follow-up events.
    async fn pump_one(&mut self) {
        if let Some(event) = self.receiver.recv().await {
            self.handle_event(event).await;
        }
    }
}
