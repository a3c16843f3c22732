//! Error types shared across the toolkit.

use std::fmt::{Display, Formatter};

use crate::protocol::jsonrpc::ErrorObject;

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all failure modes.
#[derive(Debug)]
pub enum AppError {
    /// A frame could not be decoded as a JSON-RPC 2.0 message, or a message
    /// could not be encoded. Recoverable: callers log and keep reading.
    Codec(String),
    /// The peer answered a request with a JSON-RPC error object.
    Protocol(ErrorObject),
    /// A request deadline elapsed before the matching response arrived.
    Timeout(String),
    /// The child process exited or the stdio stream closed while requests
    /// were in flight, or the transport was stopped explicitly.
    TransportClosed(String),
    /// The child process could not be spawned.
    Spawn(String),
    /// A gated operation was attempted before initialization completed
    /// (or after the connection was closed).
    NotInitialized(String),
    /// Configuration parsing or validation failure.
    Config(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Codec(msg) => write!(f, "codec: {msg}"),
            Self::Protocol(err) => write!(f, "protocol error {}: {}", err.code, err.message),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::TransportClosed(msg) => write!(f, "transport closed: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::NotInitialized(msg) => write!(f, "not initialized: {msg}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}
