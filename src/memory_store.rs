//! In-process implementation of the [`Store`] trait
//!
//! Keeps everything in maps behind a single async mutex. TTL arguments
//! are accepted and ignored: entries live as long as the process, which
//! is the lifetime an in-process store can honestly offer. Sliding-window
//! trimming and set semantics match the Redis implementation, which
//! makes this the store the hub tests run against.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::store::{RoomStats, Store, StoreError};

#[derive(Default)]
struct MemoryInner {
    /// roomID -> recent messages, newest at the front
    messages: HashMap<String, VecDeque<String>>,
    /// roomID -> active usernames
    room_users: HashMap<String, BTreeSet<String>>,
    /// roomID -> cumulative message count
    counters: HashMap<String, i64>,
    /// global active usernames
    global_users: BTreeSet<String>,
}

/// Map-backed store
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn add_recent_message(
        &self,
        room_id: &str,
        message_json: &str,
        max_messages: usize,
        _ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        if room_id.is_empty() {
            return Err(StoreError::BadArgument("roomID cannot be empty"));
        }
        if message_json.is_empty() {
            return Err(StoreError::BadArgument("message cannot be empty"));
        }
        let mut inner = self.inner.lock().await;
        let list = inner.messages.entry(room_id.to_string()).or_default();
        list.push_front(message_json.to_string());
        if max_messages > 0 {
            list.truncate(max_messages);
        }
        Ok(())
    }

    async fn recent_messages(
        &self,
        room_id: &str,
        count: usize,
    ) -> Result<Vec<String>, StoreError> {
        if room_id.is_empty() {
            return Err(StoreError::BadArgument("roomID cannot be empty"));
        }
        let count = if count == 0 { 10 } else { count };
        let inner = self.inner.lock().await;
        Ok(inner
            .messages
            .get(room_id)
            .map(|list| list.iter().take(count).cloned().collect())
            .unwrap_or_default())
    }

    async fn add_active_user_to_room(
        &self,
        room_id: &str,
        username: &str,
        _ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        if room_id.is_empty() || username.is_empty() {
            return Err(StoreError::BadArgument(
                "roomID and username cannot be empty",
            ));
        }
        let mut inner = self.inner.lock().await;
        inner
            .room_users
            .entry(room_id.to_string())
            .or_default()
            .insert(username.to_string());
        Ok(())
    }

    async fn remove_active_user_from_room(
        &self,
        room_id: &str,
        username: &str,
    ) -> Result<(), StoreError> {
        if room_id.is_empty() || username.is_empty() {
            return Err(StoreError::BadArgument(
                "roomID and username cannot be empty",
            ));
        }
        let mut inner = self.inner.lock().await;
        if let Some(users) = inner.room_users.get_mut(room_id) {
            users.remove(username);
        }
        Ok(())
    }

    async fn active_users_in_room(&self, room_id: &str) -> Result<Vec<String>, StoreError> {
        if room_id.is_empty() {
            return Err(StoreError::BadArgument("roomID cannot be empty"));
        }
        let inner = self.inner.lock().await;
        Ok(inner
            .room_users
            .get(room_id)
            .map(|users| users.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn add_user_to_global_set(&self, username: &str) -> Result<(), StoreError> {
        if username.is_empty() {
            return Err(StoreError::BadArgument("username cannot be empty"));
        }
        let mut inner = self.inner.lock().await;
        inner.global_users.insert(username.to_string());
        Ok(())
    }

    async fn remove_user_from_global_set(&self, username: &str) -> Result<(), StoreError> {
        if username.is_empty() {
            return Err(StoreError::BadArgument("username cannot be empty"));
        }
        let mut inner = self.inner.lock().await;
        inner.global_users.remove(username);
        Ok(())
    }

    async fn global_active_user_count(&self) -> Result<i64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.global_users.len() as i64)
    }

    async fn increment_message_counter(&self, room_id: &str) -> Result<i64, StoreError> {
        if room_id.is_empty() {
            return Err(StoreError::BadArgument("roomID cannot be empty"));
        }
        let mut inner = self.inner.lock().await;
        let counter = inner.counters.entry(room_id.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn room_stats(&self, room_id: &str) -> Result<RoomStats, StoreError> {
        if room_id.is_empty() {
            return Err(StoreError::BadArgument("roomID cannot be empty"));
        }
        let inner = self.inner.lock().await;
        Ok(RoomStats {
            active_users: inner
                .room_users
                .get(room_id)
                .map(|users| users.len() as i64)
                .unwrap_or(0),
            message_count: inner.counters.get(room_id).copied().unwrap_or(0),
        })
    }
}
