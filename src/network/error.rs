//! Network error types

use thiserror::Error;

use crate::audio::CodecError;
use crate::protocol::OscError;

/// Errors that can occur in the network subsystem
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Connection refused")]
    ConnectionRefused,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,

    #[error("Send buffer full")]
    SendBufferFull,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid packet")]
    InvalidPacket,

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("OSC error: {0}")]
    Osc(#[from] OscError),

    #[error("Unknown address pattern: {0}")]
    UnknownAddress(String),

    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Incompatible protocol version: {0}")]
    VersionMismatch(String),

    #[error("Could not resolve host: {0}")]
    ResolveFailed(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
}

impl NetworkError {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        NetworkError::MalformedMessage(msg.into())
    }
}
