//! Protocol layer for the presence/relay server
//!
//! This module provides:
//! - Binary frame encoding/decoding
//! - Message type definitions
//! - Codec traits for serialization

pub mod codec;
pub mod frame;
pub mod messages;

// Re-export commonly used types
pub use codec::{decode, encode, Decodable, DecodedEvent, Encodable};
pub use frame::{Frame, FrameCodec, FrameType, FRAME_HEADER_SIZE, MAX_FRAME_SIZE};
pub use messages::*;
