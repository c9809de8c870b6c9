//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Cryptographic errors
    /// Encryption operation failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption operation failed.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// The pre-shared encryption key is not valid base64 or not 32 bytes long.
    #[error("invalid encryption key: {0}")]
    InvalidEncryptionKey(String),

    // Handshake errors
    /// Noise protocol handshake failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Attempted to use transport before handshake completion.
    #[error("handshake incomplete: cannot perform operation before handshake is finished")]
    HandshakeIncomplete,

    /// The device advertised a different name than the one configured.
    #[error("server name mismatch: expected {expected}, got {got}")]
    ServerNameMismatch {
        /// Name the client was configured to accept.
        expected: String,
        /// Name the device reported in its hello.
        got: String,
    },

    // Frame errors
    /// Frame exceeds maximum allowed size.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Actual frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Frame does not start with the indicator byte of the active transport.
    #[error("invalid frame indicator: expected {expected:#04x}, got {got:#04x}")]
    InvalidIndicator {
        /// Indicator byte of the active transport.
        expected: u8,
        /// Byte found at the head of the frame.
        got: u8,
    },

    // Message errors
    /// The type identifier is not part of the message catalog.
    #[error("unknown message type id: {0}")]
    UnknownMessageType(u32),

    /// The type identifier is known but its payload failed to parse.
    #[error("failed to parse message {name} (type id {type_id}): {reason}")]
    MalformedMessage {
        /// Numeric type identifier from the frame header.
        type_id: u32,
        /// Catalog name of the message type.
        name: &'static str,
        /// Decoder failure reason.
        reason: String,
    },

    // Connection errors
    /// Connection was closed unexpectedly.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Socket-level failure.
    #[error("i/o error: {0}")]
    Io(String),
}

impl ProtocolError {
    /// Whether the error leaves the byte stream in a state that is unsafe to
    /// keep reading from.
    ///
    /// Unknown type ids are tolerated so newer devices can add messages; a
    /// known type that fails to parse means the stream is out of sync.
    pub fn is_fatal_decode(&self) -> bool {
        !matches!(self, ProtocolError::UnknownMessageType(_))
    }
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<prost::DecodeError> for ProtocolError {
    fn from(err: prost::DecodeError) -> Self {
        ProtocolError::Deserialization(err.to_string())
    }
}

impl From<prost::EncodeError> for ProtocolError {
    fn from(err: prost::EncodeError) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<snow::Error> for ProtocolError {
    fn from(err: snow::Error) -> Self {
        match err {
            snow::Error::Decrypt => ProtocolError::Decryption(err.to_string()),
            snow::Error::Init(_) | snow::Error::Pattern(_) | snow::Error::State(_) => {
                ProtocolError::HandshakeFailed(err.to_string())
            }
            _ => ProtocolError::Encryption(err.to_string()),
        }
    }
}

impl From<base64::DecodeError> for ProtocolError {
    fn from(err: base64::DecodeError) -> Self {
        ProtocolError::InvalidEncryptionKey(err.to_string())
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(err.to_string()),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed(err.to_string()),
            _ => ProtocolError::Io(err.to_string()),
        }
    }
}
