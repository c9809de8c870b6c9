//! Frame codecs for the two native API transports.
//!
//! # Plaintext Frame Format
//!
//! Each frame consists of:
//! - 1 byte: indicator `0x00`
//! - varint: payload length
//! - varint: message type identifier
//! - N bytes: protobuf-encoded message body
//!
//! # Encrypted Frame Format
//!
//! Each frame consists of:
//! - 1 byte: indicator `0x01`
//! - 2 bytes: payload length (big-endian)
//! - N bytes: payload
//!
//! During the handshake the payload carries hello and noise handshake data.
//! Afterwards it carries a noise ciphertext whose plaintext is
//! `[u16 type][u16 length][body]`, both integers big-endian.

use crate::error::{ProtocolError, Result};

/// Indicator byte opening every plaintext frame.
pub const PLAINTEXT_INDICATOR: u8 = 0x00;

/// Indicator byte opening every encrypted frame.
pub const NOISE_INDICATOR: u8 = 0x01;

/// Upper bound on a plaintext payload (1 MB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Upper bound on an encrypted frame payload, fixed by the u16 length field.
pub const MAX_NOISE_FRAME_SIZE: usize = u16::MAX as usize;

/// Encrypted frame header size: 1 (indicator) + 2 (length) = 3 bytes.
pub const NOISE_HEADER_SIZE: usize = 3;

/// Maximum encoded length of a u64 varint.
const MAX_VARINT_LEN: usize = 10;

/// A decoded frame: a message type identifier and its undecoded body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// Numeric message type identifier.
    pub type_id: u32,
    /// Protobuf-encoded message body.
    pub payload: Vec<u8>,
}

impl RawFrame {
    /// Create a new frame.
    pub fn new(type_id: u32, payload: Vec<u8>) -> Self {
        Self { type_id, payload }
    }
}

/// Append `value` to `buf` as an unsigned LEB128 varint.
pub fn encode_varint(value: u64, buf: &mut Vec<u8>) {
    prost::encoding::encode_varint(value, buf);
}

/// Read an unsigned varint from the head of `data`.
///
/// Returns `Ok(None)` when `data` ends before the varint does, and the value
/// together with the number of bytes it occupied otherwise.
pub fn decode_varint(data: &[u8]) -> Result<Option<(u64, usize)>> {
    let mut value: u64 = 0;
    for (i, byte) in data.iter().enumerate() {
        if i >= MAX_VARINT_LEN {
            return Err(ProtocolError::Deserialization(
                "varint exceeds 10 bytes".to_string(),
            ));
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if data.len() >= MAX_VARINT_LEN {
        return Err(ProtocolError::Deserialization(
            "varint exceeds 10 bytes".to_string(),
        ));
    }
    Ok(None)
}

/// Encoder and decoder for plaintext frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaintextCodec;

impl PlaintextCodec {
    /// Create a new plaintext codec.
    pub fn new() -> Self {
        Self
    }

    /// Encode a frame into bytes.
    pub fn encode(&self, frame: &RawFrame) -> Result<Vec<u8>> {
        if frame.payload.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: frame.payload.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        let mut output = Vec::with_capacity(1 + 2 * MAX_VARINT_LEN + frame.payload.len());
        output.push(PLAINTEXT_INDICATOR);
        encode_varint(frame.payload.len() as u64, &mut output);
        encode_varint(u64::from(frame.type_id), &mut output);
        output.extend_from_slice(&frame.payload);
        Ok(output)
    }

    /// Try to decode one frame from the head of `data`.
    ///
    /// Returns `Ok(None)` if `data` holds only part of a frame, otherwise the
    /// frame and the number of bytes it occupied.
    pub fn try_decode(&self, data: &[u8]) -> Result<Option<(RawFrame, usize)>> {
        let Some(&indicator) = data.first() else {
            return Ok(None);
        };
        if indicator != PLAINTEXT_INDICATOR {
            return Err(ProtocolError::InvalidIndicator {
                expected: PLAINTEXT_INDICATOR,
                got: indicator,
            });
        }

        let mut offset = 1;
        let Some((length, used)) = decode_varint(&data[offset..])? else {
            return Ok(None);
        };
        offset += used;

        let length = usize::try_from(length).unwrap_or(usize::MAX);
        if length > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: MAX_FRAME_SIZE,
            });
        }

        let Some((type_id, used)) = decode_varint(&data[offset..])? else {
            return Ok(None);
        };
        offset += used;

        let type_id = u32::try_from(type_id).map_err(|_| {
            ProtocolError::Deserialization(format!("message type id out of range: {}", type_id))
        })?;

        if data.len() < offset + length {
            return Ok(None);
        }

        let payload = data[offset..offset + length].to_vec();
        Ok(Some((RawFrame::new(type_id, payload), offset + length)))
    }
}

/// Encoder and decoder for encrypted-transport frames.
///
/// This codec only deals with the outer `[0x01][u16 length]` envelope and the
/// inner `[u16 type][u16 length]` message header. Encryption itself lives in
/// [`crate::noise::NoiseSession`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NoiseFrameCodec;

impl NoiseFrameCodec {
    /// Create a new encrypted-frame codec.
    pub fn new() -> Self {
        Self
    }

    /// Wrap `payload` in an encrypted-transport frame envelope.
    pub fn encode_frame(&self, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() > MAX_NOISE_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len(),
                max: MAX_NOISE_FRAME_SIZE,
            });
        }

        let mut output = Vec::with_capacity(NOISE_HEADER_SIZE + payload.len());
        output.push(NOISE_INDICATOR);
        output.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        output.extend_from_slice(payload);
        Ok(output)
    }

    /// Try to take one frame envelope from the head of `data`.
    ///
    /// Returns `Ok(None)` if `data` holds only part of a frame, otherwise the
    /// payload and the number of bytes the frame occupied.
    pub fn try_decode_frame(&self, data: &[u8]) -> Result<Option<(Vec<u8>, usize)>> {
        let Some(&indicator) = data.first() else {
            return Ok(None);
        };
        if indicator != NOISE_INDICATOR {
            return Err(ProtocolError::InvalidIndicator {
                expected: NOISE_INDICATOR,
                got: indicator,
            });
        }
        if data.len() < NOISE_HEADER_SIZE {
            return Ok(None);
        }

        let length = usize::from(u16::from_be_bytes([data[1], data[2]]));
        if data.len() < NOISE_HEADER_SIZE + length {
            return Ok(None);
        }

        let payload = data[NOISE_HEADER_SIZE..NOISE_HEADER_SIZE + length].to_vec();
        Ok(Some((payload, NOISE_HEADER_SIZE + length)))
    }

    /// Build the plaintext that gets encrypted for one message.
    pub fn encode_message(&self, frame: &RawFrame) -> Result<Vec<u8>> {
        let type_id = u16::try_from(frame.type_id).map_err(|_| {
            ProtocolError::Serialization(format!(
                "message type id {} does not fit the encrypted header",
                frame.type_id
            ))
        })?;
        let length = u16::try_from(frame.payload.len()).map_err(|_| {
            ProtocolError::FrameTooLarge {
                size: frame.payload.len(),
                max: MAX_NOISE_FRAME_SIZE,
            }
        })?;

        let mut output = Vec::with_capacity(4 + frame.payload.len());
        output.extend_from_slice(&type_id.to_be_bytes());
        output.extend_from_slice(&length.to_be_bytes());
        output.extend_from_slice(&frame.payload);
        Ok(output)
    }

    /// Split a decrypted message plaintext into its type and body.
    pub fn decode_message(&self, plaintext: &[u8]) -> Result<RawFrame> {
        if plaintext.len() < 4 {
            return Err(ProtocolError::Deserialization(format!(
                "encrypted message too short: need 4 header bytes, have {}",
                plaintext.len()
            )));
        }

        let type_id = u16::from_be_bytes([plaintext[0], plaintext[1]]);
        let length = usize::from(u16::from_be_bytes([plaintext[2], plaintext[3]]));
        let body = &plaintext[4..];
        if body.len() < length {
            return Err(ProtocolError::Deserialization(format!(
                "encrypted message body truncated: header says {} bytes, have {}",
                length,
                body.len()
            )));
        }

        Ok(RawFrame::new(u32::from(type_id), body[..length].to_vec()))
    }
}
