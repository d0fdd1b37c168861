//! Wire protocol: fixed-header frames carrying a JSON argument record
//! and an optional trailing raw body.
//!
//! Request Frame (Header: 10 bytes):
//! [FrameType: 1] [Opcode: 1] [CorrelationID: 4 (BE)] [PayloadLen: 4 (BE)]
//! Payload: [ArgsLen: 4 (BE)] [Args (JSON)] [Body (rest, opaque)]
//!
//! Response Frame (Header: 10 bytes):
//! [FrameType: 1] [Status: 1] [CorrelationID: 4 (BE)] [PayloadLen: 4 (BE)]
//! Payload: same shape; empty for OK/NULL.

use bytemuck::{Pod, Zeroable};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::broker::headers::Headers;
use crate::broker::selector::Selector;
use crate::error::{Error, Result};

// ========================================
// FRAME TYPES
// ========================================
pub const TYPE_REQUEST: u8 = 0x01;
pub const TYPE_RESPONSE: u8 = 0x02;

// ========================================
// RESPONSE STATUS (Meta byte for Response frames)
// ========================================
pub const STATUS_OK: u8 = 0x00;
pub const STATUS_ERR: u8 = 0x01;
pub const STATUS_NULL: u8 = 0x02;
pub const STATUS_DATA: u8 = 0x03;

// ========================================
// OPCODES (Meta byte for Request frames)
// ========================================
pub const OP_PING: u8 = 0x01;
pub const OP_PUT: u8 = 0x10;
pub const OP_GET: u8 = 0x11;
pub const OP_LIST: u8 = 0x12;
pub const OP_PUBLISH: u8 = 0x20;
pub const OP_RETRIEVE: u8 = 0x21;
pub const OP_BEGIN: u8 = 0x30;
pub const OP_COMMIT: u8 = 0x31;
pub const OP_ABORT: u8 = 0x32;

/// Frames above this size are rejected as malformed.
pub const MAX_PAYLOAD: usize = 64 * 1024 * 1024;

// ========================================
// FRAME HEADER
// ========================================

/// Fixed-size header: [FrameType: 1] [Meta: 1] [CorrelationID: 4] [PayloadLen: 4]
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct FrameHeader {
    pub frame_type: u8,
    pub meta: u8,
    pub id: [u8; 4],
    pub payload_len: [u8; 4],
}

impl FrameHeader {
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub fn new(frame_type: u8, meta: u8, id: u32, payload_len: u32) -> Self {
        Self {
            frame_type,
            meta,
            id: id.to_be_bytes(),
            payload_len: payload_len.to_be_bytes(),
        }
    }

    pub fn id(&self) -> u32 {
        u32::from_be_bytes(self.id)
    }

    pub fn payload_len(&self) -> u32 {
        u32::from_be_bytes(self.payload_len)
    }
}

/// A decoded frame, request or response.
#[derive(Debug)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

// ========================================
// PAYLOAD FRAMING
// ========================================

/// `[u32 args_len][args][body]`
pub fn encode_payload(args: &[u8], body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + args.len() + body.len());
    buf.put_u32(args.len() as u32);
    buf.put_slice(args);
    buf.put_slice(body);
    buf.freeze()
}

/// Split a payload into its JSON args record and trailing body.
pub fn split_payload(payload: &[u8]) -> Result<(&[u8], &[u8])> {
    if payload.len() < 4 {
        return Err(Error::InvalidArgument(
            "payload too short for args length prefix".into(),
        ));
    }
    let len = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    if payload.len() < 4 + len {
        return Err(Error::InvalidArgument(format!(
            "incomplete args record: expected {} bytes, got {}",
            4 + len,
            payload.len()
        )));
    }
    Ok((&payload[4..4 + len], &payload[4 + len..]))
}

/// A full frame as raw bytes, for the synchronous client side.
pub fn encode_frame(frame_type: u8, meta: u8, id: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FrameHeader::SIZE + payload.len());
    buf.push(frame_type);
    buf.push(meta);
    buf.extend_from_slice(&id.to_be_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

// ========================================
// ARGUMENT RECORDS
// ========================================

#[derive(Debug, Serialize, Deserialize)]
pub struct PutArgs {
    pub queue: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub tid: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetArgs {
    pub queue: String,
    #[serde(default)]
    pub selector: Selector,
    #[serde(default)]
    pub tid: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListArgs {
    pub queue: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PublishArgs {
    pub topic: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub tid: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RetrieveArgs {
    pub topic: String,
    #[serde(default)]
    pub seen: Option<String>,
    #[serde(default)]
    pub selector: Selector,
    #[serde(default)]
    pub tid: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BeginArgs {
    pub timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TidArgs {
    pub tid: String,
}

// ========================================
// REPLY RECORDS
// ========================================

#[derive(Debug, Serialize, Deserialize)]
pub struct IdReply {
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TidReply {
    pub tid: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HeadersReply {
    pub headers: Vec<Headers>,
}

/// Message metadata; the body rides behind it as raw bytes.
#[derive(Debug, Serialize, Deserialize)]
pub struct MessageMeta {
    pub id: String,
    pub headers: Headers,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorReply {
    pub kind: String,
    pub message: String,
}

/// A response ready for encoding.
#[derive(Debug)]
pub enum Response {
    Ok,
    Null,
    Data { args: Vec<u8>, body: Bytes },
    Error(ErrorReply),
}

impl Response {
    pub fn data<T: Serialize>(args: &T, body: Bytes) -> Result<Self> {
        let args = serde_json::to_vec(args).map_err(|e| Error::InvalidArgument(e.to_string()))?;
        Ok(Response::Data { args, body })
    }
}
