//! Protocol message types for the presence/relay system
//!
//! All message payloads that can be serialized/deserialized within frames.
//! Uses serde for JSON serialization.

use serde::{Deserialize, Serialize};

use crate::{current_timestamp, generate_message_id, UserId};

// =============================================================================
// Control Messages (0x00 - 0x0F)
// =============================================================================

/// Initial handshake from client
///
/// Identity is optional: a connection without a `user_id` is accepted in
/// anonymous/observer mode and never enters the presence directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Hello {
    /// Durable account identifier, if the client is logged in
    pub user_id: Option<UserId>,
}

/// Server response to Hello
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloAck {
    /// Ephemeral connection identifier assigned to this connection
    pub session_id: String,
}

/// Ping message for keepalive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ping {
    /// Timestamp when ping was sent (for RTT measurement)
    pub timestamp: u64,
}

/// Pong response to Ping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pong {
    /// Echo back the timestamp from Ping
    pub timestamp: u64,
}

/// Graceful disconnect
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goodbye {
    /// Reason for disconnect
    pub reason: String,
}

// =============================================================================
// Client Commands (0x10 - 0x2F) - Client -> Server
// =============================================================================

/// Ask the server to persist and relay a direct message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessage {
    /// Sender account id; overridden by the handshake identity when present
    pub sender_id: UserId,
    /// Recipient account id
    pub receiver_id: UserId,
    /// Text payload
    pub content: String,
    /// Optional media reference (image URL etc.)
    pub media_url: Option<String>,
}

// =============================================================================
// Server Events (0x30 - 0x4F) - Server -> Client
// =============================================================================

/// A persisted direct message, as stored by the collaborator
///
/// The relay only ever forwards a copy of this record; `is_read` is mutated
/// by a later mark-read action in the CRUD layer, never here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message ID
    pub id: String,
    /// Sender account id
    pub sender_id: UserId,
    /// Recipient account id
    pub receiver_id: UserId,
    /// Text payload
    pub content: String,
    /// Optional media reference
    pub media_url: Option<String>,
    /// Server-assigned timestamp (Unix ms)
    pub created_at: u64,
    /// Read flag, set by the recipient later
    pub is_read: bool,
}

impl Message {
    pub fn new(
        sender_id: UserId,
        receiver_id: UserId,
        content: String,
        media_url: Option<String>,
    ) -> Self {
        Self {
            id: generate_message_id(),
            sender_id,
            receiver_id,
            content,
            media_url,
            created_at: current_timestamp(),
            is_read: false,
        }
    }
}

/// Live delivery of a freshly persisted message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub message: Message,
}

/// Full presence snapshot, broadcast to every connected client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnlineUsers {
    pub users: Vec<UserId>,
}

// =============================================================================
// Datagram Messages (0x80 - 0x8F) - Unreliable, never persisted
// =============================================================================

/// User is typing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Typing {
    /// Recipient of the signal (set by the client, absent on forward)
    pub receiver_id: Option<UserId>,
    /// Typing user (filled by the server on forward)
    pub user_id: Option<UserId>,
}

/// User stopped typing
///
/// Accepted at any time, including without a preceding `Typing`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopTyping {
    /// Recipient of the signal (set by the client, absent on forward)
    pub receiver_id: Option<UserId>,
    /// User who stopped (filled by the server on forward)
    pub user_id: Option<UserId>,
}

// =============================================================================
// Error Message (0xFF)
// =============================================================================

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    /// Error code
    pub code: u32,
    /// Error message
    pub message: String,
    /// Related entity (message id, user id, etc.)
    pub context: Option<String>,
}

impl ErrorEvent {
    // Common error codes
    pub const UNKNOWN: u32 = 1000;
    pub const INVALID_FRAME: u32 = 1001;
    pub const HANDSHAKE_REQUIRED: u32 = 1002;
    pub const STORAGE_FAILED: u32 = 1003;
    pub const SERVER_ERROR: u32 = 1004;

    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(Self::UNKNOWN, message)
    }

    pub fn invalid_frame(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_FRAME, message)
    }

    pub fn handshake_required() -> Self {
        Self::new(Self::HANDSHAKE_REQUIRED, "Handshake required")
    }

    pub fn storage_failed(message: impl Into<String>) -> Self {
        Self::new(Self::STORAGE_FAILED, message)
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(Self::SERVER_ERROR, message)
    }
}
