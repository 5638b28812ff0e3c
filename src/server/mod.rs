//! QUIC presence and relay server
//!
//! ## Stream Layout
//!
//! - **Control Stream** (bidirectional): handshake, ping/pong, message
//!   commands, reliable server events (deliveries, presence snapshots)
//! - **Datagrams**: typing indicators (unreliable)

pub mod connection;
pub mod presence;
pub mod relay;

pub use connection::{ConnectionCommand, ConnectionHandler, ServerEvent};
pub use presence::PresenceDirectory;
pub use relay::{RelayServer, ServerConfig, ServerStats};
