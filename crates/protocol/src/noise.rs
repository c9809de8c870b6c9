//! Noise protocol handshake and transport encryption.
//!
//! Encrypted native API connections authenticate both sides with a 32-byte
//! pre-shared key instead of static keys, using the `NNpsk0` pattern:
//!
//! ```text
//! -> psk, e
//! <- e, ee
//! ```
//!
//! A peer that does not hold the same key cannot produce a valid second
//! message, so a completed handshake proves possession of the key.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use snow::{Builder, HandshakeState, TransportState};

use crate::error::{ProtocolError, Result};

/// The Noise protocol pattern used for handshakes.
///
/// - NNpsk0: no static keys, pre-shared key mixed in before the first message
/// - 25519: Curve25519 for DH key exchange
/// - ChaChaPoly: ChaCha20-Poly1305 for AEAD
/// - SHA256: SHA-256 for hashing
const NOISE_PATTERN: &str = "Noise_NNpsk0_25519_ChaChaPoly_SHA256";

/// Prologue mixed into the handshake hash by both sides.
pub const NOISE_PROLOGUE: &[u8] = b"NoiseAPIInit\x00\x00";

/// Required length of the pre-shared key in bytes.
pub const ENCRYPTION_KEY_LENGTH: usize = 32;

/// Maximum size for a Noise protocol message.
pub const MAX_NOISE_MESSAGE_SIZE: usize = 65535;

/// Overhead added by Noise encryption (Poly1305 tag).
pub const NOISE_OVERHEAD: usize = 16;

/// A validated 32-byte pre-shared key.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; ENCRYPTION_KEY_LENGTH]);

impl EncryptionKey {
    /// Parse a base64-encoded key, as shown in device configuration.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = STANDARD.decode(encoded.trim())?;
        Self::from_bytes(&bytes)
    }

    /// Build a key from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let key: [u8; ENCRYPTION_KEY_LENGTH] = bytes.try_into().map_err(|_| {
            ProtocolError::InvalidEncryptionKey(format!(
                "expected {} bytes, got {}",
                ENCRYPTION_KEY_LENGTH,
                bytes.len()
            ))
        })?;
        Ok(Self(key))
    }

    /// Returns the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; ENCRYPTION_KEY_LENGTH] {
        &self.0
    }

    /// Returns the key in base64 form.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }
}

impl FromStr for EncryptionKey {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_base64(s)
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

/// State of the Noise handshake process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    /// Initiator: Ready to send first message (-> psk, e)
    InitiatorStart,
    /// Initiator: Waiting for response (<- e, ee)
    InitiatorWaitingForResponse,
    /// Responder: Waiting for first message (-> psk, e)
    ResponderStart,
    /// Responder: Ready to send response (<- e, ee)
    ResponderSendResponse,
    /// Handshake complete, ready for transport
    Complete,
}

/// Role in the Noise handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiates the handshake (client)
    Initiator,
    /// Responds to the handshake (device)
    Responder,
}

/// A Noise protocol session for secure communication.
///
/// `NoiseSession` drives the `NNpsk0` handshake and provides the two
/// direction-specific cipher states once it completes.
///
/// ## Usage
///
/// ```ignore
/// let mut initiator = NoiseSession::new_initiator(&key)?;
/// let msg1 = initiator.write_handshake_message(&[])?;
/// // Send msg1 to the device, receive msg2...
/// initiator.read_handshake_message(&msg2)?;
/// initiator.into_transport()?;
/// let ciphertext = initiator.encrypt(b"...")?;
/// ```
pub struct NoiseSession {
    /// The handshake state (only present during handshake phase)
    handshake: Option<HandshakeState>,
    /// The transport state (only present after handshake completion)
    transport: Option<TransportState>,
    /// Current phase of the handshake
    phase: HandshakePhase,
    /// Role in the handshake (initiator or responder)
    role: Role,
    /// Buffer for noise operations
    buffer: Vec<u8>,
}

impl NoiseSession {
    /// Creates a new Noise session as the initiator (client).
    pub fn new_initiator(key: &EncryptionKey) -> Result<Self> {
        let handshake = Self::builder(key)?
            .build_initiator()
            .map_err(|e| ProtocolError::HandshakeFailed(format!("failed to build initiator: {}", e)))?;

        Ok(Self::with_handshake(handshake, Role::Initiator))
    }

    /// Creates a new Noise session as the responder (device side).
    pub fn new_responder(key: &EncryptionKey) -> Result<Self> {
        let handshake = Self::builder(key)?
            .build_responder()
            .map_err(|e| ProtocolError::HandshakeFailed(format!("failed to build responder: {}", e)))?;

        Ok(Self::with_handshake(handshake, Role::Responder))
    }

    fn builder(key: &EncryptionKey) -> Result<Builder<'_>> {
        let params = NOISE_PATTERN.parse().map_err(|e| {
            ProtocolError::HandshakeFailed(format!("invalid noise pattern: {}", e))
        })?;

        Ok(Builder::new(params)
            .prologue(NOISE_PROLOGUE)
            .psk(0, key.as_bytes()))
    }

    fn with_handshake(handshake: HandshakeState, role: Role) -> Self {
        let phase = match role {
            Role::Initiator => HandshakePhase::InitiatorStart,
            Role::Responder => HandshakePhase::ResponderStart,
        };
        Self {
            handshake: Some(handshake),
            transport: None,
            phase,
            role,
            buffer: vec![0u8; MAX_NOISE_MESSAGE_SIZE],
        }
    }

    /// Returns the current handshake phase.
    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    /// Returns the role in the handshake.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Returns whether the handshake is complete.
    pub fn is_handshake_complete(&self) -> bool {
        self.phase == HandshakePhase::Complete
    }

    /// Returns whether the session can encrypt and decrypt.
    pub fn is_transport(&self) -> bool {
        self.transport.is_some()
    }

    /// Writes a handshake message.
    ///
    /// Returns the handshake message to send to the peer.
    pub fn write_handshake_message(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let handshake = self
            .handshake
            .as_mut()
            .ok_or(ProtocolError::HandshakeIncomplete)?;

        let next = match (self.role, self.phase) {
            (Role::Initiator, HandshakePhase::InitiatorStart) => {
                HandshakePhase::InitiatorWaitingForResponse
            }
            (Role::Responder, HandshakePhase::ResponderSendResponse) => HandshakePhase::Complete,
            _ => {
                return Err(ProtocolError::HandshakeFailed(format!(
                    "cannot write in current phase: {:?}",
                    self.phase
                )));
            }
        };

        let len = handshake.write_message(payload, &mut self.buffer)?;
        let message = self.buffer[..len].to_vec();
        self.phase = next;

        Ok(message)
    }

    /// Reads a handshake message from the peer.
    ///
    /// Returns any payload included in the handshake message.
    pub fn read_handshake_message(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        let handshake = self
            .handshake
            .as_mut()
            .ok_or(ProtocolError::HandshakeIncomplete)?;

        let next = match (self.role, self.phase) {
            (Role::Initiator, HandshakePhase::InitiatorWaitingForResponse) => {
                HandshakePhase::Complete
            }
            (Role::Responder, HandshakePhase::ResponderStart) => {
                HandshakePhase::ResponderSendResponse
            }
            _ => {
                return Err(ProtocolError::HandshakeFailed(format!(
                    "cannot read in current phase: {:?}",
                    self.phase
                )));
            }
        };

        let len = handshake
            .read_message(message, &mut self.buffer)
            .map_err(|e| ProtocolError::HandshakeFailed(format!("handshake MAC failure: {}", e)))?;
        let payload = self.buffer[..len].to_vec();
        self.phase = next;

        Ok(payload)
    }

    /// Transitions from handshake to transport mode.
    ///
    /// After this call, the session can encrypt and decrypt messages.
    pub fn into_transport(&mut self) -> Result<()> {
        if self.phase != HandshakePhase::Complete {
            return Err(ProtocolError::HandshakeIncomplete);
        }

        let handshake = self
            .handshake
            .take()
            .ok_or(ProtocolError::HandshakeIncomplete)?;

        self.transport = Some(handshake.into_transport_mode()?);
        Ok(())
    }

    /// Encrypts a plaintext message for transport.
    ///
    /// Returns the ciphertext which includes the authentication tag.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let transport = self
            .transport
            .as_mut()
            .ok_or(ProtocolError::HandshakeIncomplete)?;

        if plaintext.len() > MAX_NOISE_MESSAGE_SIZE - NOISE_OVERHEAD {
            return Err(ProtocolError::Encryption(format!(
                "plaintext too large: {} bytes exceeds maximum of {} bytes",
                plaintext.len(),
                MAX_NOISE_MESSAGE_SIZE - NOISE_OVERHEAD
            )));
        }

        let len = transport.write_message(plaintext, &mut self.buffer)?;
        Ok(self.buffer[..len].to_vec())
    }

    /// Decrypts a ciphertext message from transport.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let transport = self
            .transport
            .as_mut()
            .ok_or(ProtocolError::HandshakeIncomplete)?;

        if ciphertext.len() > MAX_NOISE_MESSAGE_SIZE {
            return Err(ProtocolError::Decryption(format!(
                "ciphertext too large: {} bytes exceeds maximum of {} bytes",
                ciphertext.len(),
                MAX_NOISE_MESSAGE_SIZE
            )));
        }

        let len = transport.read_message(ciphertext, &mut self.buffer)?;
        Ok(self.buffer[..len].to_vec())
    }
}

impl fmt::Debug for NoiseSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NoiseSession")
            .field("phase", &self.phase)
            .field("role", &self.role)
            .field("is_transport", &self.transport.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_B64: &str = "px7tsbK3C7bpXHr2OevEV2ZMg/FrNBw2+O2pNPbedtA=";

    fn key() -> EncryptionKey {
        EncryptionKey::from_base64(KEY_B64).unwrap()
    }

    fn handshake(initiator: &mut NoiseSession, responder: &mut NoiseSession) -> Result<()> {
        let msg1 = initiator.write_handshake_message(&[])?;
        responder.read_handshake_message(&msg1)?;
        let msg2 = responder.write_handshake_message(&[])?;
        initiator.read_handshake_message(&msg2)?;
        Ok(())
    }

    #[test]
    fn test_key_from_base64() {
        let key = key();
        assert_eq!(key.as_bytes().len(), ENCRYPTION_KEY_LENGTH);
        assert_eq!(key.to_base64(), KEY_B64);
        assert_eq!(KEY_B64.parse::<EncryptionKey>().unwrap(), key);
    }

    #[test]
    fn test_key_wrong_length_rejected() {
        let short = STANDARD.encode([7u8; 31]);
        let err = EncryptionKey::from_base64(&short).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidEncryptionKey(_)));
        assert!(err.to_string().contains("got 31"));
    }

    #[test]
    fn test_key_not_base64_rejected() {
        let err = EncryptionKey::from_base64("not base64 !!").unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidEncryptionKey(_)));
    }

    #[test]
    fn test_key_debug_is_redacted() {
        assert_eq!(format!("{:?}", key()), "EncryptionKey(..)");
    }

    #[test]
    fn test_initiator_creation() {
        let session = NoiseSession::new_initiator(&key()).unwrap();
        assert_eq!(session.role(), Role::Initiator);
        assert_eq!(session.phase(), HandshakePhase::InitiatorStart);
        assert!(!session.is_handshake_complete());
    }

    #[test]
    fn test_full_handshake() {
        let mut initiator = NoiseSession::new_initiator(&key()).unwrap();
        let mut responder = NoiseSession::new_responder(&key()).unwrap();

        let msg1 = initiator.write_handshake_message(&[]).unwrap();
        assert_eq!(initiator.phase(), HandshakePhase::InitiatorWaitingForResponse);

        responder.read_handshake_message(&msg1).unwrap();
        assert_eq!(responder.phase(), HandshakePhase::ResponderSendResponse);

        let msg2 = responder.write_handshake_message(&[]).unwrap();
        assert!(responder.is_handshake_complete());

        initiator.read_handshake_message(&msg2).unwrap();
        assert!(initiator.is_handshake_complete());
    }

    #[test]
    fn test_transport_mode() {
        let mut initiator = NoiseSession::new_initiator(&key()).unwrap();
        let mut responder = NoiseSession::new_responder(&key()).unwrap();
        handshake(&mut initiator, &mut responder).unwrap();

        initiator.into_transport().unwrap();
        responder.into_transport().unwrap();

        let ciphertext = initiator.encrypt(b"hello device").unwrap();
        assert_eq!(ciphertext.len(), b"hello device".len() + NOISE_OVERHEAD);
        assert_eq!(responder.decrypt(&ciphertext).unwrap(), b"hello device");

        let ciphertext = responder.encrypt(b"hello client").unwrap();
        assert_eq!(initiator.decrypt(&ciphertext).unwrap(), b"hello client");
    }

    #[test]
    fn test_mismatched_key_fails_handshake() {
        let other = EncryptionKey::from_bytes(&[1u8; 32]).unwrap();
        let mut initiator = NoiseSession::new_initiator(&key()).unwrap();
        let mut responder = NoiseSession::new_responder(&other).unwrap();

        let msg1 = initiator.write_handshake_message(&[]).unwrap();
        let err = responder.read_handshake_message(&msg1).unwrap_err();
        assert!(matches!(err, ProtocolError::HandshakeFailed(_)));
    }

    #[test]
    fn test_encrypt_before_handshake_fails() {
        let mut session = NoiseSession::new_initiator(&key()).unwrap();
        assert!(matches!(
            session.encrypt(b"data"),
            Err(ProtocolError::HandshakeIncomplete)
        ));
        assert!(matches!(
            session.into_transport(),
            Err(ProtocolError::HandshakeIncomplete)
        ));
    }

    #[test]
    fn test_write_out_of_turn_fails() {
        let mut session = NoiseSession::new_initiator(&key()).unwrap();
        session.write_handshake_message(&[]).unwrap();
        let err = session.write_handshake_message(&[]).unwrap_err();
        assert!(err.to_string().contains("cannot write"));
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let mut initiator = NoiseSession::new_initiator(&key()).unwrap();
        let mut responder = NoiseSession::new_responder(&key()).unwrap();
        handshake(&mut initiator, &mut responder).unwrap();
        initiator.into_transport().unwrap();
        responder.into_transport().unwrap();

        let mut ciphertext = initiator.encrypt(b"payload").unwrap();
        ciphertext[0] ^= 0xff;
        assert!(matches!(
            responder.decrypt(&ciphertext),
            Err(ProtocolError::Decryption(_))
        ));
    }
}
