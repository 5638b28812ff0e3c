//! Codec for encoding/decoding protocol messages to/from frames
//!
//! This module provides the bridge between typed messages and binary frames.
//! Every wire event is a variant of [`DecodedEvent`], so dispatch happens in
//! one match over a tagged union rather than per-event callback registration.

use super::frame::{Frame, FrameType};
use super::messages::*;
use bytes::Bytes;
use std::io::{self, Error as IoError, ErrorKind};

/// Trait for messages that can be encoded to frames
pub trait Encodable {
    /// Get the frame type for this message
    fn frame_type(&self) -> FrameType;

    /// Encode the message payload to bytes
    fn encode_payload(&self) -> io::Result<Bytes>;

    /// Encode the complete frame
    fn encode_frame(&self) -> io::Result<Frame> {
        Ok(Frame::new(self.frame_type(), self.encode_payload()?))
    }
}

/// Trait for messages that can be decoded from frames
pub trait Decodable: Sized {
    /// Expected frame type for this message
    fn expected_frame_type() -> FrameType;

    /// Decode the message from a payload
    fn decode_payload(payload: &[u8]) -> io::Result<Self>;

    /// Decode from a complete frame, validating the frame type
    fn decode_frame(frame: &Frame) -> io::Result<Self> {
        if frame.frame_type != Self::expected_frame_type() {
            return Err(IoError::new(
                ErrorKind::InvalidData,
                format!(
                    "Expected frame type {:?}, got {:?}",
                    Self::expected_frame_type(),
                    frame.frame_type
                ),
            ));
        }
        Self::decode_payload(&frame.payload)
    }
}

/// Helper macro to implement Encodable and Decodable for a message type
macro_rules! impl_codec {
    ($type:ty, $frame_type:expr) => {
        impl Encodable for $type {
            fn frame_type(&self) -> FrameType {
                $frame_type
            }

            fn encode_payload(&self) -> io::Result<Bytes> {
                serde_json::to_vec(self)
                    .map(Bytes::from)
                    .map_err(|e| IoError::new(ErrorKind::InvalidData, e))
            }
        }

        impl Decodable for $type {
            fn expected_frame_type() -> FrameType {
                $frame_type
            }

            fn decode_payload(payload: &[u8]) -> io::Result<Self> {
                serde_json::from_slice(payload).map_err(|e| IoError::new(ErrorKind::InvalidData, e))
            }
        }
    };
}

// Control messages
impl_codec!(Hello, FrameType::Hello);
impl_codec!(HelloAck, FrameType::HelloAck);
impl_codec!(Ping, FrameType::Ping);
impl_codec!(Pong, FrameType::Pong);
impl_codec!(Goodbye, FrameType::Goodbye);

// Client commands
impl_codec!(SendMessage, FrameType::SendMessage);

// Server events
impl_codec!(NewMessage, FrameType::NewMessage);
impl_codec!(OnlineUsers, FrameType::OnlineUsers);

// Datagram messages
impl_codec!(Typing, FrameType::Typing);
impl_codec!(StopTyping, FrameType::StopTyping);

// Error message
impl_codec!(ErrorEvent, FrameType::Error);

/// Decode any frame into a typed message enum
#[derive(Debug, Clone)]
pub enum DecodedEvent {
    // Control
    Hello(Hello),
    HelloAck(HelloAck),
    Ping(Ping),
    Pong(Pong),
    Goodbye(Goodbye),

    // Client commands
    SendMessage(SendMessage),

    // Server events
    NewMessage(NewMessage),
    OnlineUsers(OnlineUsers),

    // Datagram
    Typing(Typing),
    StopTyping(StopTyping),

    // Error
    Error(ErrorEvent),
}

impl DecodedEvent {
    /// Decode a frame into a typed message
    pub fn decode(frame: &Frame) -> io::Result<Self> {
        let payload = &frame.payload;

        match frame.frame_type {
            FrameType::Hello => Ok(Self::Hello(serde_json::from_slice(payload)?)),
            FrameType::HelloAck => Ok(Self::HelloAck(serde_json::from_slice(payload)?)),
            FrameType::Ping => Ok(Self::Ping(serde_json::from_slice(payload)?)),
            FrameType::Pong => Ok(Self::Pong(serde_json::from_slice(payload)?)),
            FrameType::Goodbye => Ok(Self::Goodbye(serde_json::from_slice(payload)?)),

            FrameType::SendMessage => Ok(Self::SendMessage(serde_json::from_slice(payload)?)),

            FrameType::NewMessage => Ok(Self::NewMessage(serde_json::from_slice(payload)?)),
            FrameType::OnlineUsers => Ok(Self::OnlineUsers(serde_json::from_slice(payload)?)),

            FrameType::Typing => Ok(Self::Typing(serde_json::from_slice(payload)?)),
            FrameType::StopTyping => Ok(Self::StopTyping(serde_json::from_slice(payload)?)),

            FrameType::Error => Ok(Self::Error(serde_json::from_slice(payload)?)),
        }
    }

    /// Get the frame type of this message
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::Hello(_) => FrameType::Hello,
            Self::HelloAck(_) => FrameType::HelloAck,
            Self::Ping(_) => FrameType::Ping,
            Self::Pong(_) => FrameType::Pong,
            Self::Goodbye(_) => FrameType::Goodbye,
            Self::SendMessage(_) => FrameType::SendMessage,
            Self::NewMessage(_) => FrameType::NewMessage,
            Self::OnlineUsers(_) => FrameType::OnlineUsers,
            Self::Typing(_) => FrameType::Typing,
            Self::StopTyping(_) => FrameType::StopTyping,
            Self::Error(_) => FrameType::Error,
        }
    }

    /// Check if this is a control message
    pub fn is_control(&self) -> bool {
        self.frame_type().is_control()
    }

    /// Check if this is a client command
    pub fn is_command(&self) -> bool {
        self.frame_type().is_command()
    }

    /// Check if this is a datagram message
    pub fn is_datagram(&self) -> bool {
        self.frame_type().is_datagram()
    }
}

/// Encode a message directly to bytes (convenience function)
pub fn encode<T: Encodable>(msg: &T) -> io::Result<Bytes> {
    msg.encode_frame().map(|f| f.encode_to_bytes())
}

/// Decode a frame to a specific message type (convenience function)
pub fn decode<T: Decodable>(frame: &Frame) -> io::Result<T> {
    T::decode_frame(frame)
}
