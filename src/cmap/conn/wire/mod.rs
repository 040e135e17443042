mod buffer;

use std::sync::atomic::{AtomicI32, Ordering};

use bitflags::bitflags;
use bson::Document;

pub(crate) use self::buffer::BufferPool;
use super::Command;
use crate::error::{ErrorKind, Result};

pub(crate) const DEFAULT_MAX_MESSAGE_SIZE: i32 = 48 * 1024 * 1024;

static REQUEST_ID: AtomicI32 = AtomicI32::new(0);

pub(crate) fn next_request_id() -> i32 {
    REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

/// The wire protocol op codes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OpCode {
    Message = 2013,
}

impl OpCode {
    fn from_i32(i: i32) -> Result<Self> {
        match i {
            2013 => Ok(OpCode::Message),
            other => Err(ErrorKind::InvalidResponse {
                message: format!("invalid wire protocol opcode: {}", other),
            }
            .into()),
        }
    }
}

/// The header for any wire protocol message.
#[derive(Debug)]
pub(crate) struct Header {
    pub(crate) length: i32,
    pub(crate) request_id: i32,
    pub(crate) response_to: i32,
    pub(crate) op_code: OpCode,
}

impl Header {
    pub(crate) const LENGTH: usize = 4 * std::mem::size_of::<i32>();

    fn write_to(&self, frame: &mut Vec<u8>) {
        frame.extend_from_slice(&self.length.to_le_bytes());
        frame.extend_from_slice(&self.request_id.to_le_bytes());
        frame.extend_from_slice(&self.response_to.to_le_bytes());
        frame.extend_from_slice(&(self.op_code as i32).to_le_bytes());
    }

    fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::LENGTH {
            return Err(ErrorKind::InvalidResponse {
                message: "truncated message header".to_string(),
            }
            .into());
        }
        Ok(Self {
            length: read_i32_le(bytes, 0),
            request_id: read_i32_le(bytes, 4),
            response_to: read_i32_le(bytes, 8),
            op_code: OpCode::from_i32(read_i32_le(bytes, 12))?,
        })
    }
}

fn read_i32_le(bytes: &[u8], offset: usize) -> i32 {
    let mut quad = [0u8; 4];
    quad.copy_from_slice(&bytes[offset..offset + 4]);
    i32::from_le_bytes(quad)
}

bitflags! {
    /// Represents the bitwise flags of a wire message.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) struct MessageFlags: u32 {
        const CHECKSUM_PRESENT = 0b1;
        const MORE_TO_COME     = 0b10;
        const EXHAUST_ALLOWED  = 1 << 16;
    }
}

/// A single wire protocol message: a header, flag bits, and one document
/// payload.
#[derive(Clone, Debug)]
pub(crate) struct Message {
    pub(crate) request_id: i32,
    pub(crate) response_to: i32,
    pub(crate) flags: MessageFlags,
    pub(crate) document_payload: Document,
}

impl Message {
    pub(crate) fn new(document_payload: Document, request_id: i32) -> Self {
        Self {
            request_id,
            response_to: 0,
            flags: MessageFlags::empty(),
            document_payload,
        }
    }

    /// A response message addressed to `request`.
    #[cfg(test)]
    pub(crate) fn reply_to(request: &Message, document_payload: Document) -> Self {
        Self {
            request_id: next_request_id(),
            response_to: request.request_id,
            flags: MessageFlags::empty(),
            document_payload,
        }
    }

    /// Creates a message carrying `body` on behalf of `command`, stamping the
    /// target database into the payload.
    pub(crate) fn from_command_body(command: &Command, mut body: Document, request_id: i32) -> Self {
        body.insert("$db", command.target_db.clone());
        Self::new(body, request_id)
    }

    /// Serializes this message into a full length-prefixed frame.
    pub(crate) fn to_frame(&self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        self.document_payload.to_writer(&mut payload)?;

        let length = (Header::LENGTH + 4 + payload.len()) as i32;
        let header = Header {
            length,
            request_id: self.request_id,
            response_to: self.response_to,
            op_code: OpCode::Message,
        };

        let mut frame = Vec::with_capacity(length as usize);
        header.write_to(&mut frame);
        frame.extend_from_slice(&self.flags.bits().to_le_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Deserializes a message from a complete frame, as reassembled by
    /// [`BufferPool`].
    pub(crate) fn from_frame(frame: &[u8]) -> Result<Self> {
        let header = Header::from_slice(frame)?;
        if header.length as usize != frame.len() {
            return Err(ErrorKind::InvalidResponse {
                message: format!(
                    "message header declares {} bytes but frame has {}",
                    header.length,
                    frame.len()
                ),
            }
            .into());
        }
        let flags = MessageFlags::from_bits_truncate(
            read_i32_le(frame, Header::LENGTH) as u32,
        );
        let document_payload = Document::from_reader(&frame[Header::LENGTH + 4..])?;
        Ok(Self {
            request_id: header.request_id,
            response_to: header.response_to,
            flags,
            document_payload,
        })
    }
}

#[cfg(test)]
mod test {
    use bson::doc;

    use super::*;

    #[test]
    fn frame_length_prefix_matches_frame_size() {
        let message = Message::new(doc! { "find": "events", "limit": 10 }, next_request_id());
        let frame = message.to_frame().unwrap();
        assert_eq!(read_i32_le(&frame, 0) as usize, frame.len());
        let parsed = Message::from_frame(&frame).unwrap();
        assert_eq!(parsed.document_payload, message.document_payload);
    }

    #[test]
    fn bad_opcode_is_rejected() {
        let message = Message::new(doc! { "ping": 1 }, 7);
        let mut frame = message.to_frame().unwrap();
        frame[12..16].copy_from_slice(&9999_i32.to_le_bytes());
        assert!(Message::from_frame(&frame).is_err());
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let message = Message::new(doc! { "ping": 1 }, 7);
        let mut frame = message.to_frame().unwrap();
        let bogus_len = (frame.len() + 5) as i32;
        frame[0..4].copy_from_slice(&bogus_len.to_le_bytes());
        assert!(Message::from_frame(&frame).is_err());
    }
}
