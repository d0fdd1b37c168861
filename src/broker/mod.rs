//! Broker core: the queue manager and the types it trades in.

pub mod headers;
pub mod manager;
pub mod message;
pub mod selector;
pub mod transaction;
