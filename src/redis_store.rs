//! Redis implementation of the [`Store`] trait
//!
//! Uses a [`ConnectionManager`] so the store handle is cheaply cloneable
//! and reconnects on its own. Multi-step updates (prepend+trim+expire,
//! add+expire) run as atomic MULTI/EXEC pipelines so a room's recent
//! list can never exceed its window after a successful call.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::time::timeout;
use tracing::info;

use crate::store::{
    room_message_count_key, room_messages_key, room_users_key, RoomStats, Store, StoreError,
    DEFAULT_MESSAGE_TTL, DEFAULT_ROOM_USERS_TTL, GLOBAL_USERS_KEY,
};

/// Timeout for the connectivity ping at startup.
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Redis-backed store
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
}

impl RedisStore {
    /// Connect to the Redis server at `url` (e.g.
    /// `redis://localhost:6379/0`) and verify the connection with a
    /// PING. The ping is bounded by [`PING_TIMEOUT`]; the caller treats
    /// failure as fatal.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        if url.is_empty() {
            return Err(StoreError::BadArgument("redis URL cannot be empty"));
        }

        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;

        let mut conn = manager.clone();
        let pong = timeout(
            PING_TIMEOUT,
            redis::cmd("PING").query_async::<_, String>(&mut conn),
        )
        .await
        .map_err(|_| StoreError::Unavailable(format!("ping to '{url}' timed out")))??;
        info!("Connected to Redis at {} ({})", url, pong);

        Ok(Self { manager })
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn add_recent_message(
        &self,
        room_id: &str,
        message_json: &str,
        max_messages: usize,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        if room_id.is_empty() {
            return Err(StoreError::BadArgument("roomID cannot be empty"));
        }
        if message_json.is_empty() {
            return Err(StoreError::BadArgument("message cannot be empty"));
        }
        let key = room_messages_key(room_id);
        let ttl = ttl.filter(|t| !t.is_zero()).unwrap_or(DEFAULT_MESSAGE_TTL);

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.lpush(&key, message_json).ignore();
        if max_messages > 0 {
            pipe.ltrim(&key, 0, max_messages as isize - 1).ignore();
        }
        pipe.expire(&key, ttl.as_secs() as i64).ignore();

        let mut conn = self.manager.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
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
        let key = room_messages_key(room_id);

        // LRANGE on a missing key returns an empty list, not an error.
        let mut conn = self.manager.clone();
        let messages: Vec<String> = conn.lrange(&key, 0, count as isize - 1).await?;
        Ok(messages)
    }

    async fn add_active_user_to_room(
        &self,
        room_id: &str,
        username: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        if room_id.is_empty() || username.is_empty() {
            return Err(StoreError::BadArgument(
                "roomID and username cannot be empty",
            ));
        }
        let key = room_users_key(room_id);
        let ttl = ttl
            .filter(|t| !t.is_zero())
            .unwrap_or(DEFAULT_ROOM_USERS_TTL);

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.sadd(&key, username).ignore();
        pipe.expire(&key, ttl.as_secs() as i64).ignore();

        let mut conn = self.manager.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
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
        let mut conn = self.manager.clone();
        let _: () = conn.srem(room_users_key(room_id), username).await?;
        Ok(())
    }

    async fn active_users_in_room(&self, room_id: &str) -> Result<Vec<String>, StoreError> {
        if room_id.is_empty() {
            return Err(StoreError::BadArgument("roomID cannot be empty"));
        }
        let mut conn = self.manager.clone();
        let users: Vec<String> = conn.smembers(room_users_key(room_id)).await?;
        Ok(users)
    }

    async fn add_user_to_global_set(&self, username: &str) -> Result<(), StoreError> {
        if username.is_empty() {
            return Err(StoreError::BadArgument("username cannot be empty"));
        }
        let mut conn = self.manager.clone();
        let _: () = conn.sadd(GLOBAL_USERS_KEY, username).await?;
        Ok(())
    }

    async fn remove_user_from_global_set(&self, username: &str) -> Result<(), StoreError> {
        if username.is_empty() {
            return Err(StoreError::BadArgument("username cannot be empty"));
        }
        let mut conn = self.manager.clone();
        let _: () = conn.srem(GLOBAL_USERS_KEY, username).await?;
        Ok(())
    }

    async fn global_active_user_count(&self) -> Result<i64, StoreError> {
        let mut conn = self.manager.clone();
        let count: i64 = conn.scard(GLOBAL_USERS_KEY).await?;
        Ok(count)
    }

    async fn increment_message_counter(&self, room_id: &str) -> Result<i64, StoreError> {
        if room_id.is_empty() {
            return Err(StoreError::BadArgument("roomID cannot be empty"));
        }
        let mut conn = self.manager.clone();
        let count: i64 = conn.incr(room_message_count_key(room_id), 1i64).await?;
        Ok(count)
    }

    async fn room_stats(&self, room_id: &str) -> Result<RoomStats, StoreError> {
        if room_id.is_empty() {
            return Err(StoreError::BadArgument("roomID cannot be empty"));
        }
        let mut conn = self.manager.clone();

        let active_users: i64 = conn.scard(room_users_key(room_id)).await?;

        // GET then parse rather than typed GET, to distinguish a missing
        // counter (0) from a corrupt one.
        let key = room_message_count_key(room_id);
        let raw: Option<String> = conn.get(&key).await?;
        let message_count = match raw {
            None => 0,
            Some(value) => value
                .parse::<i64>()
                .map_err(|_| StoreError::CorruptValue { key, value })?,
        };

        Ok(RoomStats {
            active_users,
            message_count,
        })
    }
}
