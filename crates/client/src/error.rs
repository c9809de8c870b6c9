//! Error types for the client crate.

use protocol::{EntityKind, MessageType, ProtocolError};
use thiserror::Error;

/// Errors raised by a [`crate::transport::FrameTransport`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// No link is established; nothing was written.
    #[error("transport is not connected")]
    NotConnected,

    /// A connection attempt is already running on this transport.
    #[error("a connection attempt is already in progress")]
    AlreadyConnecting,

    /// Socket-level failure.
    #[error("socket error: {0}")]
    Io(String),

    /// Framing, handshake or decoding failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl TransportError {
    /// Whether the transport must be closed after this error.
    ///
    /// Only unknown message types leave the stream in a readable state.
    pub fn is_fatal(&self) -> bool {
        match self {
            TransportError::Protocol(err) => err.is_fatal_decode(),
            _ => true,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Errors raised by a [`crate::connection::Connection`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    // Precondition errors
    #[error("not connected")]
    NotConnected,

    #[error("not authorized")]
    NotAuthorized,

    #[error("already connected")]
    AlreadyConnected,

    #[error("host is required")]
    HostRequired,

    /// `disconnect()` was called; the connection cannot be reused.
    #[error("connection has been destroyed")]
    Destroyed,

    // Correlation errors
    /// Another request is already waiting for this reply type.
    #[error("already awaiting a {0} reply")]
    AlreadyAwaiting(MessageType),

    #[error("timed out waiting for {0}")]
    Timeout(MessageType),

    #[error("expected {expected} reply, got {got}")]
    UnexpectedResponse {
        expected: MessageType,
        got: MessageType,
    },

    #[error("{0} entities accept no commands")]
    UnsupportedCommand(EntityKind),

    // Registry errors
    #[error("entity with key {0} already exists")]
    DuplicateEntity(u32),

    #[error("no entity with key {0}")]
    UnknownEntity(u32),

    /// The transport closed while a reply was outstanding.
    #[error("connection closed")]
    ConnectionClosed,

    // Protocol errors
    #[error("invalid password")]
    InvalidPassword,

    /// An automatic reply to a device request could not be sent.
    #[error("failed to respond to {request}: {source}")]
    AutoReply {
        request: MessageType,
        source: Box<ConnectionError>,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Result type alias for connection operations.
pub type Result<T> = std::result::Result<T, ConnectionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display_names_type() {
        let err = ConnectionError::Timeout(MessageType::PingResponse);
        assert_eq!(err.to_string(), "timed out waiting for PingResponse");
    }

    #[test]
    fn test_already_awaiting_display() {
        let err = ConnectionError::AlreadyAwaiting(MessageType::DeviceInfoResponse);
        assert_eq!(err.to_string(), "already awaiting a DeviceInfoResponse reply");
    }

    #[test]
    fn test_auto_reply_display_and_source() {
        let err = ConnectionError::AutoReply {
            request: MessageType::PingRequest,
            source: Box::new(ConnectionError::Transport(TransportError::NotConnected)),
        };
        assert_eq!(
            err.to_string(),
            "failed to respond to PingRequest: transport is not connected"
        );
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_transport_error_fatality() {
        assert!(!TransportError::Protocol(ProtocolError::UnknownMessageType(512)).is_fatal());
        assert!(TransportError::Protocol(ProtocolError::Decryption("tag".into())).is_fatal());
        assert!(TransportError::Io("reset".into()).is_fatal());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: TransportError = io_err.into();
        assert_eq!(err, TransportError::Io("refused".to_string()));
    }

    #[test]
    fn test_protocol_error_is_transparent() {
        let err: ConnectionError = ProtocolError::UnknownMessageType(7000).into();
        assert_eq!(err.to_string(), "unknown message type id: 7000");
    }

    #[test]
    fn test_errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TransportError>();
        assert_send_sync::<ConnectionError>();
    }
}
