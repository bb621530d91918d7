//! Plaintext frame encoding and decoding.
//!
//! Every envelope on the wire carries exactly one frame:
//!
//! ```text
//! Type(1) || Length(4, big-endian) || Data(Length)
//! ```
//!
//! `Length` must equal the number of bytes that follow the header.

use crate::error::{FrameError, Result};
use yuki_crypto::{Opener, Sealer};

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 5;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Raw IP packet
    Data = 0x00,
    /// Keepalive request
    Ping = 0x01,
    /// Keepalive response
    Pong = 0x02,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Data),
            0x01 => Ok(Self::Ping),
            0x02 => Ok(Self::Pong),
            other => Err(FrameError::UnknownFrameType(other)),
        }
    }
}

/// A decoded tunnel frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    frame_type: FrameType,
    payload: Vec<u8>,
}

impl Frame {
    /// Create a frame of any type.
    #[must_use]
    pub fn new(frame_type: FrameType, payload: Vec<u8>) -> Self {
        Self {
            frame_type,
            payload,
        }
    }

    /// Data frame carrying one IP packet.
    #[must_use]
    pub fn data(packet: impl Into<Vec<u8>>) -> Self {
        Self::new(FrameType::Data, packet.into())
    }

    /// Empty keepalive request.
    #[must_use]
    pub fn ping() -> Self {
        Self::new(FrameType::Ping, Vec::new())
    }

    /// Empty keepalive response.
    #[must_use]
    pub fn pong() -> Self {
        Self::new(FrameType::Pong, Vec::new())
    }

    /// Frame type
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    /// Payload bytes
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Take ownership of the payload.
    #[must_use]
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Value of the length field, derived from the payload.
    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Serialize to `Type || Length || Data`.
    ///
    /// Payloads are single IP packets, well inside the `u32` length field.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.push(self.frame_type as u8);
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parse a frame.
    ///
    /// # Errors
    ///
    /// - [`FrameError::FrameTooShort`] if fewer than 5 bytes are given
    /// - [`FrameError::UnknownFrameType`] for a type byte other than 0, 1, 2
    /// - [`FrameError::FrameLengthMismatch`] if the length field disagrees with
    ///   the remaining bytes
    pub fn decode(data: &[u8]) -> std::result::Result<Self, FrameError> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(FrameError::FrameTooShort {
                expected: FRAME_HEADER_SIZE,
                actual: data.len(),
            });
        }

        let frame_type = FrameType::try_from(data[0])?;
        let declared = u32::from_be_bytes([data[1], data[2], data[3], data[4]]) as usize;
        let body = &data[FRAME_HEADER_SIZE..];

        if declared != body.len() {
            return Err(FrameError::FrameLengthMismatch {
                declared,
                actual: body.len(),
            });
        }

        Ok(Self {
            frame_type,
            payload: body.to_vec(),
        })
    }
}

/// Encode and seal a frame into a transport envelope.
///
/// # Errors
///
/// Returns the sealer's error.
pub fn seal_frame(sealer: &mut Sealer, frame: &Frame) -> Result<Vec<u8>> {
    Ok(sealer.seal(&frame.encode())?)
}

/// Open a transport envelope and decode the frame inside.
///
/// # Errors
///
/// Returns the opener's or the decoder's error.
pub fn open_frame(opener: &mut Opener, envelope: &[u8]) -> Result<Frame> {
    let plaintext = opener.open(envelope)?;
    Ok(Frame::decode(&plaintext)?)
}
