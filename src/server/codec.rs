//! Tokio codec for the framed wire protocol.

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;

use super::protocol::{
    encode_payload, Frame, FrameHeader, Response, MAX_PAYLOAD, STATUS_DATA, STATUS_ERR,
    STATUS_NULL, STATUS_OK, TYPE_RESPONSE,
};

/// An outbound response with its correlation id.
#[derive(Debug)]
pub struct Outbound {
    pub id: u32,
    pub response: Response,
}

#[derive(Debug, Default)]
pub struct RpcCodec;

impl RpcCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for RpcCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < FrameHeader::SIZE {
            return Ok(None);
        }

        let header_ref: &FrameHeader = bytemuck::try_from_bytes(&src[..FrameHeader::SIZE])
            .map_err(|_| Error::InvalidArgument("header alignment or size mismatch".into()))?;

        let payload_len = header_ref.payload_len() as usize;
        if payload_len > MAX_PAYLOAD {
            return Err(Error::InvalidArgument(format!(
                "frame payload of {} bytes exceeds the limit",
                payload_len
            )));
        }
        let total_len = FrameHeader::SIZE + payload_len;
        if src.len() < total_len {
            return Ok(None);
        }

        let header = *header_ref;
        let frame_bytes = src.split_to(total_len).freeze();
        let payload = frame_bytes.slice(FrameHeader::SIZE..);

        Ok(Some(Frame { header, payload }))
    }
}

impl Encoder<Outbound> for RpcCodec {
    type Error = Error;

    fn encode(&mut self, item: Outbound, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (status, payload) = match item.response {
            Response::Ok => (STATUS_OK, Bytes::new()),
            Response::Null => (STATUS_NULL, Bytes::new()),
            Response::Data { args, body } => (STATUS_DATA, encode_payload(&args, &body)),
            Response::Error(reply) => {
                let args = serde_json::to_vec(&reply)
                    .map_err(|e| Error::InvalidArgument(e.to_string()))?;
                (STATUS_ERR, encode_payload(&args, &[]))
            }
        };

        dst.put_u8(TYPE_RESPONSE);
        dst.put_u8(status);
        dst.put_u32(item.id);
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}
