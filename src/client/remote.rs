//! Remote link: synchronous framed TCP with connect retries.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::broker::headers::Headers;
use crate::broker::message::Message;
use crate::broker::selector::Selector;
use crate::config::DEFAULT_PORT;
use crate::error::{Error, Result};
use crate::server::protocol::*;

const RETRY_DELAY: Duration = Duration::from_millis(200);

pub struct RemoteLink {
    addr: String,
    connect_count: u32,
    stream: Option<TcpStream>,
    next_id: u32,
}

impl RemoteLink {
    /// Connect to `host:port`, with or without a `tcp://` scheme.
    /// Connection errors are retried up to `connect_count` times
    /// before surfacing as `RemoteUnavailable`.
    pub fn connect(endpoint: &str, connect_count: u32) -> Result<Self> {
        let addr = normalize_endpoint(endpoint)?;
        let mut link = Self {
            addr,
            connect_count: connect_count.max(1),
            stream: None,
            next_id: 0,
        };
        link.ensure_connected()?;
        Ok(link)
    }

    fn ensure_connected(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let mut last_error = None;
        for attempt in 1..=self.connect_count {
            match TcpStream::connect(&self.addr) {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    debug!(addr = %self.addr, attempt, "connected");
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(e) => {
                    debug!(addr = %self.addr, attempt, "connect failed: {}", e);
                    last_error = Some(e);
                    if attempt < self.connect_count {
                        thread::sleep(RETRY_DELAY);
                    }
                }
            }
        }
        Err(Error::RemoteUnavailable(format!(
            "{}: {}",
            self.addr,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    fn request<A: Serialize>(&mut self, opcode: u8, args: &A, body: &[u8]) -> Result<(u8, Vec<u8>)> {
        let args = serde_json::to_vec(args).map_err(|e| Error::InvalidArgument(e.to_string()))?;
        let payload = encode_payload(&args, body);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.exchange(opcode, &payload) {
                Ok(reply) => return Ok(reply),
                Err(Error::Io(e)) if attempt < self.connect_count => {
                    debug!(addr = %self.addr, "request failed ({}), reconnecting", e);
                    self.stream = None;
                }
                Err(Error::Io(e)) => {
                    return Err(Error::RemoteUnavailable(format!("{}: {}", self.addr, e)))
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn exchange(&mut self, opcode: u8, payload: &[u8]) -> Result<(u8, Vec<u8>)> {
        self.ensure_connected()?;
        self.next_id = self.next_id.wrapping_add(1);
        let id = self.next_id;
        let Some(stream) = self.stream.as_mut() else {
            return Err(Error::RemoteUnavailable(self.addr.clone()));
        };

        stream.write_all(&encode_frame(TYPE_REQUEST, opcode, id, payload))?;

        let mut header_bytes = [0u8; FrameHeader::SIZE];
        stream.read_exact(&mut header_bytes)?;
        let header: FrameHeader = bytemuck::pod_read_unaligned(&header_bytes);
        if header.frame_type != TYPE_RESPONSE || header.id() != id {
            self.stream = None;
            return Err(Error::RemoteUnavailable(format!(
                "{}: response correlation mismatch",
                self.addr
            )));
        }
        if header.payload_len() as usize > MAX_PAYLOAD {
            self.stream = None;
            return Err(Error::RemoteUnavailable(format!(
                "{}: oversized response frame",
                self.addr
            )));
        }

        let mut payload = vec![0u8; header.payload_len() as usize];
        stream.read_exact(&mut payload)?;
        Ok((header.meta, payload))
    }

    fn expect_data<T: DeserializeOwned>(reply: (u8, Vec<u8>)) -> Result<(T, Bytes)> {
        let (status, payload) = reply;
        match status {
            STATUS_DATA => {
                let (args, body) = split_payload(&payload)?;
                let value = serde_json::from_slice(args)
                    .map_err(|e| Error::RemoteUnavailable(format!("malformed reply: {}", e)))?;
                Ok((value, Bytes::copy_from_slice(body)))
            }
            STATUS_ERR => Err(decode_error(&payload)),
            other => Err(Error::RemoteUnavailable(format!(
                "unexpected response status 0x{:02x}",
                other
            ))),
        }
    }

    fn expect_message(reply: (u8, Vec<u8>)) -> Result<Option<Message>> {
        let (status, payload) = reply;
        match status {
            STATUS_NULL => Ok(None),
            STATUS_DATA => {
                let (args, body) = split_payload(&payload)?;
                let meta: MessageMeta = serde_json::from_slice(args)
                    .map_err(|e| Error::RemoteUnavailable(format!("malformed reply: {}", e)))?;
                Ok(Some(Message::new(
                    meta.id,
                    meta.headers,
                    Bytes::copy_from_slice(body),
                )))
            }
            STATUS_ERR => Err(decode_error(&payload)),
            other => Err(Error::RemoteUnavailable(format!(
                "unexpected response status 0x{:02x}",
                other
            ))),
        }
    }

    fn expect_ok(reply: (u8, Vec<u8>)) -> Result<()> {
        let (status, payload) = reply;
        match status {
            STATUS_OK => Ok(()),
            STATUS_ERR => Err(decode_error(&payload)),
            other => Err(Error::RemoteUnavailable(format!(
                "unexpected response status 0x{:02x}",
                other
            ))),
        }
    }

    // --- Typed operations ---

    pub fn put(
        &mut self,
        queue: &str,
        body: &[u8],
        headers: Headers,
        tid: Option<&str>,
    ) -> Result<String> {
        let args = PutArgs {
            queue: queue.to_string(),
            headers,
            tid: tid.map(str::to_string),
        };
        let reply = self.request(OP_PUT, &args, body)?;
        Self::expect_data::<IdReply>(reply).map(|(r, _)| r.id)
    }

    pub fn dequeue(
        &mut self,
        queue: &str,
        selector: &Selector,
        tid: Option<&str>,
    ) -> Result<Option<Message>> {
        let args = GetArgs {
            queue: queue.to_string(),
            selector: selector.clone(),
            tid: tid.map(str::to_string),
        };
        let reply = self.request(OP_GET, &args, &[])?;
        Self::expect_message(reply)
    }

    pub fn list(&mut self, queue: &str) -> Result<Vec<Headers>> {
        let args = ListArgs {
            queue: queue.to_string(),
        };
        let reply = self.request(OP_LIST, &args, &[])?;
        Self::expect_data::<HeadersReply>(reply).map(|(r, _)| r.headers)
    }

    pub fn publish(
        &mut self,
        topic: &str,
        body: &[u8],
        headers: Headers,
        tid: Option<&str>,
    ) -> Result<String> {
        let args = PublishArgs {
            topic: topic.to_string(),
            headers,
            tid: tid.map(str::to_string),
        };
        let reply = self.request(OP_PUBLISH, &args, body)?;
        Self::expect_data::<IdReply>(reply).map(|(r, _)| r.id)
    }

    pub fn retrieve(
        &mut self,
        topic: &str,
        seen: Option<&str>,
        selector: &Selector,
        tid: Option<&str>,
    ) -> Result<Option<Message>> {
        let args = RetrieveArgs {
            topic: topic.to_string(),
            seen: seen.map(str::to_string),
            selector: selector.clone(),
            tid: tid.map(str::to_string),
        };
        let reply = self.request(OP_RETRIEVE, &args, &[])?;
        Self::expect_message(reply)
    }

    pub fn begin(&mut self, timeout: Duration) -> Result<String> {
        let args = BeginArgs {
            timeout_secs: timeout.as_secs(),
        };
        let reply = self.request(OP_BEGIN, &args, &[])?;
        Self::expect_data::<TidReply>(reply).map(|(r, _)| r.tid)
    }

    pub fn commit(&mut self, tid: &str) -> Result<()> {
        let args = TidArgs {
            tid: tid.to_string(),
        };
        let reply = self.request(OP_COMMIT, &args, &[])?;
        Self::expect_ok(reply)
    }

    pub fn abort(&mut self, tid: &str) -> Result<()> {
        let args = TidArgs {
            tid: tid.to_string(),
        };
        let reply = self.request(OP_ABORT, &args, &[])?;
        Self::expect_ok(reply)
    }
}

fn decode_error(payload: &[u8]) -> Error {
    match split_payload(payload).and_then(|(args, _)| {
        serde_json::from_slice::<ErrorReply>(args)
            .map_err(|e| Error::RemoteUnavailable(e.to_string()))
    }) {
        Ok(reply) => Error::from_wire(&reply.kind, reply.message),
        Err(e) => e,
    }
}

fn normalize_endpoint(endpoint: &str) -> Result<String> {
    let trimmed = endpoint
        .strip_prefix("tcp://")
        .or_else(|| endpoint.strip_prefix("reliq://"))
        .unwrap_or(endpoint);
    if trimmed.is_empty() {
        return Err(Error::InvalidArgument("empty endpoint".into()));
    }
    if trimmed.contains(':') {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("{}:{}", trimmed, DEFAULT_PORT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_normalize_to_host_and_port() {
        assert_eq!(
            normalize_endpoint("tcp://localhost:7000").unwrap(),
            "localhost:7000"
        );
        assert_eq!(
            normalize_endpoint("localhost").unwrap(),
            format!("localhost:{}", DEFAULT_PORT)
        );
        assert_eq!(normalize_endpoint("10.0.0.1:6438").unwrap(), "10.0.0.1:6438");
        assert!(normalize_endpoint("tcp://").is_err());
    }
}
