//! QUIC-based presence and message relay for a healthcare-connectivity app
//!
//! This library provides the real-time core that connects patients and
//! hospitals: a process-wide presence directory, per-connection lifecycle
//! handling, best-effort direct-message relay, and ephemeral typing
//! indicators. Durable message persistence lives behind the
//! [`storage::MessageStore`] trait and is supplied by the embedding
//! application.

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;
pub mod storage;

pub use client::{ClientEvent, RelayClient, RelayClientConfig};
pub use error::{RelayError, Result};
pub use protocol::messages::Message;
pub use server::RelayServer;

use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Durable account identifier, stable across connections.
pub type UserId = String;

/// Ephemeral identifier, valid only for the lifetime of one live connection.
pub type ConnectionId = String;

/// Generate a unique connection identifier
pub fn generate_connection_id() -> ConnectionId {
    Uuid::new_v4().to_string()
}

/// Generate a unique message ID
pub fn generate_message_id() -> String {
    Uuid::new_v4().to_string()
}

/// Get current timestamp in milliseconds since UNIX epoch
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
