//! Packing/unpacking of single messages and framing over TCP streams.
//!
//! Wire format: 20-byte little-endian header whose first field is the body
//! length, followed by that many bytes of serde JSON.

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::messages::{Body, Command, Header, Packet, Status};
use crate::{ProtocolError, DEFAULT_MAX_MESSAGE_SIZE, HEADER_SIZE};

/// Build a wire message. The header's `length` is recomputed from the
/// encoded body; whatever the caller put there is ignored.
pub fn pack(
    header: Header,
    cmd: Command,
    status: Status,
    data1: &str,
    data2: &str,
) -> Result<Bytes, ProtocolError> {
    let body = Body {
        cmd,
        status,
        data1: data1.to_owned(),
        data2: data2.to_owned(),
    };
    let payload = serde_json::to_vec(&body)?;
    let length = i32::try_from(payload.len()).map_err(|_| ProtocolError::MessageTooLarge {
        size: payload.len(),
        max: i32::MAX as usize,
    })?;

    let header = Header { length, ..header };
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    header.write_to(&mut buf);
    buf.extend_from_slice(&payload);
    Ok(buf.freeze())
}

/// Decode a wire message. Trailing bytes beyond the declared body are ignored.
pub fn unpack(bytes: &[u8]) -> Result<Packet, ProtocolError> {
    let header = Header::read_from(bytes)?;
    let declared = body_length(header.length)?;

    let available = bytes.len() - HEADER_SIZE;
    if available < declared {
        return Err(ProtocolError::Truncated {
            declared,
            available,
        });
    }

    let body: Body = serde_json::from_slice(&bytes[HEADER_SIZE..HEADER_SIZE + declared])?;
    Ok(Packet { header, body })
}

fn body_length(length: i32) -> Result<usize, ProtocolError> {
    usize::try_from(length).map_err(|_| ProtocolError::InvalidLength(length))
}

/// Splits a byte stream into whole messages (header + declared body).
///
/// Frames are yielded undecoded so the receive path can hand raw bytes to
/// [`unpack`] and drop malformed bodies without tearing down the stream.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_message_size: usize,
}

impl FrameCodec {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size: max_message_size.max(HEADER_SIZE),
        }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        // Peek at the body length
        let length = i32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        let total = HEADER_SIZE + body_length(length)?;

        if total > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size: total,
                max: self.max_message_size,
            });
        }

        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        Ok(Some(src.split_to(total)))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() < HEADER_SIZE {
            return Err(ProtocolError::Undersized {
                size: item.len(),
                min: HEADER_SIZE,
            });
        }
        if item.len() > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size: item.len(),
                max: self.max_message_size,
            });
        }
        dst.reserve(item.len());
        dst.put_slice(&item);
        Ok(())
    }
}
