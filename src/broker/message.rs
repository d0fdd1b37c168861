//! Message record: id, headers, opaque body.

use bytes::Bytes;

use super::headers::Headers;

/// A materialized message. The body is opaque to the broker; it is
/// produced and consumed by the client.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl Message {
    pub fn new(id: impl Into<String>, headers: Headers, body: Bytes) -> Self {
        Self {
            id: id.into(),
            headers,
            body,
        }
    }
}
