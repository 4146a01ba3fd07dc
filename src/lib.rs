//! Multi-Room WebSocket Chat Server Library
//!
//! A real-time chat server built with tokio-tungstenite using the Actor
//! pattern for routing and a Redis-backed store for everything that
//! must outlive a single connection.
//!
//! # Features
//! - WebSocket connections identified by `username`/`roomID` query parameters
//! - Named rooms, created lazily and dropped when the last member leaves
//! - Room fan-out with per-connection bounded outbound queues
//! - Recent-message history delivered on join (sliding window in the store)
//! - Presence: join/leave notifications, user lists, typing indicators
//! - Per-room stats (active users, cumulative message count) and a
//!   global active-user count
//! - Keepalive pings with read/write deadlines; slow consumers are evicted
//!
//! # Architecture
//! The `Hub` is the single actor owning the connection set and room
//! membership; it consumes register/unregister/inbound events from one
//! mpsc channel, so no locks guard its maps. Each connection runs a
//! reader task (frames → stamped envelopes → hub) and a writer task
//! (outbound queue → frames + pings). The `Store` trait hides the
//! key-value server; `RedisStore` is the production implementation and
//! `MemoryStore` the in-process one.
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use tokio::sync::mpsc;
//! use roomcast::{handle_connection, Hub, RedisStore, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Arc::new(ServerConfig::default());
//!     let store = Arc::new(RedisStore::connect(&config.redis_url).await.unwrap());
//!     let (events_tx, events_rx) = mpsc::channel(config.hub_queue);
//!
//!     tokio::spawn(Hub::new(events_rx, events_tx.clone(), store).run());
//!
//!     let listener = TcpListener::bind(config.bind_addr()).await.unwrap();
//!     while let Ok((stream, _)) = listener.accept().await {
//!         tokio::spawn(handle_connection(stream, events_tx.clone(), config.clone()));
//!     }
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod hub;
pub mod memory_store;
pub mod message;
pub mod redis_store;
pub mod room;
pub mod store;
pub mod types;

// Re-export main types for convenience
pub use client::{ClientHandle, Registration};
pub use config::ServerConfig;
pub use error::{AppError, SendError};
pub use handler::handle_connection;
pub use hub::{Hub, HubEvent};
pub use memory_store::MemoryStore;
pub use message::{Envelope, MessageType, Payload};
pub use redis_store::RedisStore;
pub use room::Room;
pub use store::{RoomStats, Store, StoreError};
pub use types::ConnectionId;
