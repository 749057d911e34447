//! Codec for encoding/decoding wire frames

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),
}

/// Length-prefixed bincode framing, shared by packets and handshake messages.
pub struct WireCodec;

impl WireCodec {
    /// Maximum frame size (16MB)
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

    /// Length-prefix header size in bytes
    pub const HEADER_SIZE: usize = 4;

    /// Encode a message to bytes
    ///
    /// Format: [length: u32 BE][payload: bincode serialized message]
    pub fn encode<T: Serialize>(msg: &T) -> Result<Bytes, CodecError> {
        let payload = bincode::serialize(msg)?;

        if payload.len() > Self::MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode one message from the front of `buf`
    ///
    /// Returns Ok(Some(message)) if a complete frame was decoded,
    /// Ok(None) if more data is needed,
    /// Err on error
    pub fn decode<T: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<T>, CodecError> {
        if buf.len() < Self::HEADER_SIZE {
            return Ok(None);
        }

        let mut length_bytes = [0u8; Self::HEADER_SIZE];
        length_bytes.copy_from_slice(&buf[..Self::HEADER_SIZE]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > Self::MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(length));
        }

        if buf.len() < Self::HEADER_SIZE + length {
            return Ok(None);
        }

        let _ = buf.split_to(Self::HEADER_SIZE);
        let msg_bytes = buf.split_to(length);
        let msg: T = bincode::deserialize(&msg_bytes)?;

        Ok(Some(msg))
    }

    /// Decode as many complete frames as the buffer holds
    pub fn decode_all<T: DeserializeOwned>(buf: &mut BytesMut) -> Result<Vec<T>, CodecError> {
        let mut messages = Vec::new();

        while let Some(msg) = Self::decode(buf)? {
            messages.push(msg);
        }

        Ok(messages)
    }
}
