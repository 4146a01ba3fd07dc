//! Error types for the chat server
//!
//! Defines application-level errors and outbound-queue send errors.
//! Uses thiserror for ergonomic error definitions. Store errors live in
//! the `store` module next to the trait they belong to.

use thiserror::Error;

/// Application-level errors
///
/// Covers fatal connection errors (handshake, transport, broken internal
/// channels) and startup configuration problems.
#[derive(Debug, Error)]
pub enum AppError {
    /// WebSocket protocol error (fatal for the connection)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Hub did not accept the registration within the allowed time
    #[error("Hub registration timed out")]
    RegistrationTimeout,

    /// Connect URL did not carry the required identity parameters
    #[error("Handshake rejected: {0}")]
    Handshake(String),

    /// Invalid environment configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Outbound-queue send errors
///
/// Produced when enqueuing a message onto a connection's bounded
/// outbound queue fails. A full queue marks a slow consumer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    /// The receiving end of the queue has been closed
    #[error("Outbound queue closed")]
    Closed,

    /// The bounded queue is at capacity
    #[error("Outbound queue full")]
    Full,
}
