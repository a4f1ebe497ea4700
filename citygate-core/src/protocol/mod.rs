//! Envelope codec.
//!
//! A frame is a length prefix followed by that many bytes of payload:
//!
//! ```text
//! varint(len) | postcard(payload)
//! ```
//!
//! The prefix is an unsigned base-128 varint, least significant group first,
//! with the high bit of each byte as the continuation flag. At most
//! [`MAX_VARINT_LEN`] bytes are accepted.

mod error;

pub use error::{ParseResult, ProtocolError};

use serde::{Serialize, de::DeserializeOwned};

use crate::Envelope;

pub const MAX_VARINT_LEN: usize = 10;
/// Largest payload a reader accepts unless configured otherwise.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Incremental varint decoder, fed one byte at a time.
#[derive(Debug, Default, Clone, Copy)]
pub struct VarintDecoder {
    value: u64,
    count: usize,
}

impl VarintDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes consumed so far.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Feed the next byte. Returns the value once the final group is seen.
    pub fn push(&mut self, byte: u8) -> ParseResult<Option<u64>> {
        let more = byte & 0x80 != 0;
        if more && self.count + 1 == MAX_VARINT_LEN {
            return Err(ProtocolError::VarintTooLong {
                max: MAX_VARINT_LEN,
            });
        }

        let group = u64::from(byte & 0x7F);
        let shift = 7 * self.count as u32;
        if group != 0 && shift > group.leading_zeros() {
            return Err(ProtocolError::VarintOverflow);
        }

        self.value |= group << shift;
        self.count += 1;

        if more { Ok(None) } else { Ok(Some(self.value)) }
    }
}

pub fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Decode a varint from the start of `bytes`, returning the value and the
/// number of bytes it occupied.
pub fn decode_varint(bytes: &[u8]) -> ParseResult<(u64, usize)> {
    let mut decoder = VarintDecoder::new();

    for &byte in bytes {
        if let Some(value) = decoder.push(byte)? {
            return Ok((value, decoder.len()));
        }
    }

    Err(ProtocolError::InsufficientData {
        needed: bytes.len() + 1,
        available: bytes.len(),
    })
}

/// Serialize a value into an unframed payload.
pub fn encode_payload<T: Serialize>(value: &T) -> ParseResult<Vec<u8>> {
    Ok(postcard::to_stdvec(value)?)
}

/// Deserialize an unframed payload. The whole slice must be consumed.
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> ParseResult<T> {
    let (value, rest) = postcard::take_from_bytes::<T>(bytes)?;
    if !rest.is_empty() {
        return Err(ProtocolError::Malformed(format!(
            "{} trailing bytes after payload",
            rest.len()
        )));
    }
    Ok(value)
}

/// Serialize a value into a length-prefixed frame.
pub fn encode_frame<T: Serialize>(value: &T) -> ParseResult<Vec<u8>> {
    let payload = encode_payload(value)?;
    let mut frame = Vec::with_capacity(payload.len() + MAX_VARINT_LEN);
    encode_varint(payload.len() as u64, &mut frame);
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode one length-prefixed frame from the start of `bytes`, returning the
/// value and the number of bytes consumed.
pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> ParseResult<(T, usize)> {
    let (len, prefix) = decode_varint(bytes)?;

    if len > DEFAULT_MAX_FRAME_SIZE as u64 {
        return Err(ProtocolError::PayloadTooLarge {
            size: len,
            max: DEFAULT_MAX_FRAME_SIZE,
        });
    }

    let total = prefix + len as usize;
    if bytes.len() < total {
        return Err(ProtocolError::InsufficientData {
            needed: total,
            available: bytes.len(),
        });
    }

    let value = decode_payload(&bytes[prefix..total])?;
    Ok((value, total))
}

pub fn encode(envelope: &Envelope) -> ParseResult<Vec<u8>> {
    encode_frame(envelope)
}

pub fn decode(bytes: &[u8]) -> ParseResult<(Envelope, usize)> {
    decode_frame(bytes)
}
