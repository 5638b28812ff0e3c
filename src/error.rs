//! Error handling for the relay

use std::fmt;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Relay error types
#[derive(Debug, Clone)]
pub enum RelayError {
    /// Network-related errors
    Network(String),
    /// Serialization/deserialization errors
    Serialization(String),
    /// Handshake errors (malformed or out-of-order)
    Handshake(String),
    /// Protocol errors
    Protocol(String),
    /// Connection errors
    Connection(String),
    /// Durable storage collaborator failed
    Storage(String),
    /// Server internal error
    Internal(String),
    /// Configuration error
    Config(String),
    /// Timeout error
    Timeout(String),
}

impl RelayError {
    /// Get error code for this error type
    pub fn code(&self) -> u32 {
        match self {
            RelayError::Network(_) => 1000,
            RelayError::Serialization(_) => 1001,
            RelayError::Handshake(_) => 1002,
            RelayError::Protocol(_) => 1003,
            RelayError::Connection(_) => 1004,
            RelayError::Storage(_) => 1005,
            RelayError::Internal(_) => 1006,
            RelayError::Config(_) => 1007,
            RelayError::Timeout(_) => 1008,
        }
    }

    /// Get human-readable error message
    pub fn message(&self) -> &str {
        match self {
            RelayError::Network(msg) => msg,
            RelayError::Serialization(msg) => msg,
            RelayError::Handshake(msg) => msg,
            RelayError::Protocol(msg) => msg,
            RelayError::Connection(msg) => msg,
            RelayError::Storage(msg) => msg,
            RelayError::Internal(msg) => msg,
            RelayError::Config(msg) => msg,
            RelayError::Timeout(msg) => msg,
        }
    }

    /// Create a network error
    pub fn network<T: Into<String>>(msg: T) -> Self {
        RelayError::Network(msg.into())
    }

    /// Create a serialization error
    pub fn serialization<T: Into<String>>(msg: T) -> Self {
        RelayError::Serialization(msg.into())
    }

    /// Create a handshake error
    pub fn handshake<T: Into<String>>(msg: T) -> Self {
        RelayError::Handshake(msg.into())
    }

    /// Create a protocol error
    pub fn protocol<T: Into<String>>(msg: T) -> Self {
        RelayError::Protocol(msg.into())
    }

    /// Create a connection error
    pub fn connection<T: Into<String>>(msg: T) -> Self {
        RelayError::Connection(msg.into())
    }

    /// Create a storage error
    pub fn storage<T: Into<String>>(msg: T) -> Self {
        RelayError::Storage(msg.into())
    }

    /// Create an internal error
    pub fn internal<T: Into<String>>(msg: T) -> Self {
        RelayError::Internal(msg.into())
    }

    /// Create a configuration error
    pub fn config<T: Into<String>>(msg: T) -> Self {
        RelayError::Config(msg.into())
    }

    /// Create a timeout error
    pub fn timeout<T: Into<String>>(msg: T) -> Self {
        RelayError::Timeout(msg.into())
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::Network(msg) => write!(f, "Network error: {}", msg),
            RelayError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            RelayError::Handshake(msg) => write!(f, "Handshake error: {}", msg),
            RelayError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            RelayError::Connection(msg) => write!(f, "Connection error: {}", msg),
            RelayError::Storage(msg) => write!(f, "Storage error: {}", msg),
            RelayError::Internal(msg) => write!(f, "Internal error: {}", msg),
            RelayError::Config(msg) => write!(f, "Configuration error: {}", msg),
            RelayError::Timeout(msg) => write!(f, "Timeout: {}", msg),
        }
    }
}

impl std::error::Error for RelayError {}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Network(format!("IO error: {}", err))
    }
}

impl From<quinn::ConnectError> for RelayError {
    fn from(err: quinn::ConnectError) -> Self {
        RelayError::Connection(format!("QUIC connection error: {}", err))
    }
}

impl From<quinn::ConnectionError> for RelayError {
    fn from(err: quinn::ConnectionError) -> Self {
        RelayError::Connection(format!("QUIC connection error: {}", err))
    }
}

impl From<quinn::ReadError> for RelayError {
    fn from(err: quinn::ReadError) -> Self {
        RelayError::Network(format!("QUIC read error: {}", err))
    }
}

impl From<quinn::WriteError> for RelayError {
    fn from(err: quinn::WriteError) -> Self {
        RelayError::Network(format!("QUIC write error: {}", err))
    }
}

impl From<quinn::ClosedStream> for RelayError {
    fn from(err: quinn::ClosedStream) -> Self {
        RelayError::Connection(format!("Stream closed: {}", err))
    }
}

impl From<quinn::SendDatagramError> for RelayError {
    fn from(err: quinn::SendDatagramError) -> Self {
        RelayError::Network(format!("Datagram send error: {}", err))
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Serialization(format!("JSON error: {}", err))
    }
}

impl From<uuid::Error> for RelayError {
    fn from(err: uuid::Error) -> Self {
        RelayError::Internal(format!("UUID error: {}", err))
    }
}

impl From<anyhow::Error> for RelayError {
    fn from(err: anyhow::Error) -> Self {
        RelayError::Internal(format!("Anyhow error: {}", err))
    }
}
