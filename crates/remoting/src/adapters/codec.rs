//! Reference frame codec.
//!
//! ```text
//! ┌──────────────┬───────────────┬──────────────────┬──────────────┐
//! │ total length │ header length │   header (JSON)  │     body     │
//! │   u32 (BE)   │   u32 (BE)    │                  │              │
//! └──────────────┴───────────────┴──────────────────┴──────────────┘
//!                 <──────────────── total length ────────────────>
//! ```
//!
//! Header flag bits: bit 0 = response, bit 1 = oneway.

use crate::domain::command::{Direction, RemotingCommand};
use crate::domain::config::MAX_FRAME_SIZE_LIMIT;
use crate::domain::correlation::CorrelationId;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const FLAG_RESPONSE: u8 = 0b01;
const FLAG_ONEWAY: u8 = 0b10;

/// Length prefix size
const LENGTH_FIELD: usize = 4;

/// Codec errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("frame of {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },
    #[error("invalid header: {0}")]
    Header(String),
    #[error("malformed frame: {0}")]
    Malformed(String),
}

#[derive(Serialize)]
struct HeaderRef<'a> {
    code: i32,
    opaque: u64,
    flag: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    remark: Option<&'a str>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    ext_fields: &'a HashMap<String, String>,
}

#[derive(Deserialize)]
struct Header {
    code: i32,
    opaque: u64,
    flag: u8,
    #[serde(default)]
    remark: Option<String>,
    #[serde(default)]
    ext_fields: HashMap<String, String>,
}

fn header_bytes(command: &RemotingCommand) -> Result<Vec<u8>, CodecError> {
    let mut flag = 0;
    if command.is_response() {
        flag |= FLAG_RESPONSE;
    }
    if command.is_oneway() {
        flag |= FLAG_ONEWAY;
    }
    let header = HeaderRef {
        code: command.code,
        opaque: command.correlation_id().as_u64(),
        flag,
        remark: command.remark.as_deref(),
        ext_fields: &command.ext_fields,
    };
    serde_json::to_vec(&header).map_err(|e| CodecError::Header(e.to_string()))
}

/// Size of `command` once framed, including the length prefix.
pub fn encoded_len(command: &RemotingCommand) -> usize {
    let header_len = header_bytes(command).map_or(0, |h| h.len());
    LENGTH_FIELD * 2 + header_len + command.body_len()
}

/// Length-prefixed frame codec with a maximum frame size.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Limits above what the length prefix can describe are capped.
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(MAX_FRAME_SIZE_LIMIT),
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode one command into a complete frame.
    pub fn encode(&self, command: &RemotingCommand) -> Result<Bytes, CodecError> {
        let header = header_bytes(command)?;
        let body_len = command.body_len();
        let size = LENGTH_FIELD * 2 + header.len() + body_len;
        if size > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }

        let too_large = || CodecError::FrameTooLarge {
            size,
            max: self.max_frame_size,
        };
        let total = u32::try_from(LENGTH_FIELD + header.len() + body_len).map_err(|_| too_large())?;
        let header_len = u32::try_from(header.len()).map_err(|_| too_large())?;

        let mut buf = BytesMut::with_capacity(size);
        buf.put_u32(total);
        buf.put_u32(header_len);
        buf.put_slice(&header);
        if let Some(body) = &command.body {
            buf.put_slice(body);
        }
        Ok(buf.freeze())
    }

    /// Decode the next complete frame from `src`.
    ///
    /// Returns `Ok(None)` when more bytes are needed; consumed bytes are
    /// removed from `src` only when a whole frame is available.
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<RemotingCommand>, CodecError> {
        if src.len() < LENGTH_FIELD {
            return Ok(None);
        }

        let total = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        let size = LENGTH_FIELD + total;
        if size > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }
        if total < LENGTH_FIELD {
            return Err(CodecError::Malformed(format!(
                "total length {} shorter than header length field",
                total
            )));
        }
        if src.len() < size {
            src.reserve(size - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_FIELD);
        let mut frame = src.split_to(total).freeze();
        let header_len = frame.get_u32() as usize;
        if header_len > frame.remaining() {
            return Err(CodecError::Malformed(format!(
                "header length {} exceeds frame remainder {}",
                header_len,
                frame.remaining()
            )));
        }

        let header_bytes = frame.split_to(header_len);
        let header: Header = serde_json::from_slice(&header_bytes)
            .map_err(|e| CodecError::Header(e.to_string()))?;

        let direction = if header.flag & FLAG_RESPONSE != 0 {
            Direction::Response
        } else {
            Direction::Request
        };
        let body = if frame.is_empty() { None } else { Some(frame) };

        Ok(Some(RemotingCommand::from_parts(
            header.code,
            CorrelationId::from_raw(header.opaque),
            direction,
            header.flag & FLAG_ONEWAY != 0,
            header.remark,
            header.ext_fields,
            body,
        )))
    }
}
