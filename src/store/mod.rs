//! Message store abstraction and its backends.
//!
//! A store persists queue/topic state and message bodies. It does not
//! handle locking, dead-letter routing or expiration decisions; those
//! belong to the queue manager. It only applies the operation batches
//! the manager hands it, atomically.

pub mod disk;
pub mod index;
pub mod sql;

use bytes::Bytes;

use crate::broker::headers::Headers;
use crate::broker::message::Message;
use crate::error::Result;

/// Reserved dead-letter queue name, shared by all destinations.
pub const DLQ: &str = "$dlq";

/// One atomic unit inside a store transaction.
#[derive(Debug, Clone)]
pub enum StoreOp {
    /// Append a message to a queue, body included.
    Insert {
        queue: String,
        id: String,
        headers: Headers,
        body: Bytes,
    },
    /// Replace a topic's single slot.
    InsertTopic {
        topic: String,
        id: String,
        headers: Headers,
        body: Bytes,
    },
    /// Remove a message from a queue and release its body.
    Delete { queue: String, id: String },
    /// Move a message from a queue to the dead-letter queue, keeping
    /// its id and body.
    MoveToDlq { queue: String, id: String },
    /// Remove a topic's slot iff it still holds the given id.
    DeleteTopic { topic: String, id: String },
    /// Bump the redelivery counter of a queued message (abort path).
    Requeue { queue: String, id: String },
}

/// Persistence contract every backend provides. Backends keep their
/// own interior locking; the manager serializes structural reads by
/// holding its lock across calls.
pub trait MessageStore: Send + Sync {
    /// Idempotently create on-disk / database resources.
    fn setup(&self) -> Result<()>;

    /// Acquire exclusive ownership and load the durable index.
    fn activate(&self) -> Result<()>;

    /// Release ownership and close resources.
    fn deactivate(&self) -> Result<()>;

    /// Apply a batch atomically. On failure the in-memory index is
    /// reloaded from durable storage before the error propagates, so
    /// a partially applied batch is never observable.
    fn transaction(&self, ops: &[StoreOp]) -> Result<()>;

    /// Current header list of a queue, priority order.
    fn queue_headers(&self, queue: &str) -> Result<Vec<Headers>>;

    /// First message in the queue whose headers satisfy the
    /// predicate, body materialized.
    fn get_message(
        &self,
        queue: &str,
        predicate: &dyn Fn(&Headers) -> bool,
    ) -> Result<Option<Message>>;

    /// The topic's current message, unless its id equals `seen` or
    /// the predicate rejects it.
    fn get_last(
        &self,
        topic: &str,
        seen: Option<&str>,
        predicate: &dyn Fn(&Headers) -> bool,
    ) -> Result<Option<Message>>;
}
