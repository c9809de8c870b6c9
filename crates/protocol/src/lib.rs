//! # ESPHome Native API Protocol Library
//!
//! This crate provides the wire-level pieces of the ESPHome native API:
//! frame codecs, the noise handshake and the message catalog. It performs no
//! I/O; the `client` crate drives it over a TCP socket.
//!
//! ## Overview
//!
//! - **Framing**: plaintext varint frames and encrypted `u16` length frames
//! - **Noise Protocol**: `Noise_NNpsk0_25519_ChaChaPoly_SHA256` with a 32-byte pre-shared key
//! - **Message Catalog**: type identifiers, names and protobuf bodies
//! - **Entities**: component kinds and their shared record headers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          Application Messages           │  protobuf (prost)
//! ├─────────────────────────────────────────┤
//! │      Noise Encryption (optional)        │  ChaCha20-Poly1305
//! ├─────────────────────────────────────────┤
//! │              Framing                    │  0x00 varint / 0x01 u16
//! ├─────────────────────────────────────────┤
//! │                 TCP                     │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{Message, PlaintextCodec};
//! use protocol::messages::HelloRequest;
//!
//! let message = Message::from(HelloRequest::new("my-app 1.0"));
//!
//! let codec = PlaintextCodec::new();
//! let bytes = codec.encode(&message.to_frame()).unwrap();
//!
//! let (frame, used) = codec.try_decode(&bytes).unwrap().unwrap();
//! assert_eq!(used, bytes.len());
//! assert_eq!(Message::from_frame(&frame).unwrap(), message);
//! ```
//!
//! ## Modules
//!
//! - [`framing`]: Frame codecs for both transports
//! - [`noise`]: Pre-shared key handshake and encryption
//! - [`messages`]: Message catalog and protobuf bodies
//! - [`entity`]: Entity kinds and record headers
//! - [`error`]: Error types

pub mod entity;
pub mod error;
pub mod framing;
pub mod messages;
pub mod noise;

pub use entity::{EntityInfo, EntityKind, EntityState};
pub use error::{ProtocolError, Result};
pub use framing::{
    NoiseFrameCodec, PlaintextCodec, RawFrame, MAX_FRAME_SIZE, MAX_NOISE_FRAME_SIZE,
    NOISE_HEADER_SIZE, NOISE_INDICATOR, PLAINTEXT_INDICATOR,
};
pub use messages::{Message, MessageType, TypedMessage, API_VERSION_MAJOR, API_VERSION_MINOR};
pub use noise::{
    EncryptionKey, HandshakePhase, NoiseSession, Role, ENCRYPTION_KEY_LENGTH,
    MAX_NOISE_MESSAGE_SIZE, NOISE_OVERHEAD, NOISE_PROLOGUE,
};
