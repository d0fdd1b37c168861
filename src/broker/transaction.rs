//! Client transaction records.
//!
//! A transaction stages inserts and deletes on the manager until
//! commit applies them through a single store transaction, or abort
//! discards the inserts and requeues the deletes. Removal from the
//! transaction table is the closing step; any later commit/abort on
//! the same id reports `NoSuchTransaction`.

use std::time::{Duration, Instant};

use crate::store::StoreOp;

/// A delete staged under a transaction. The message stays locked
/// until the transaction closes.
#[derive(Debug, Clone)]
pub struct StagedDelete {
    pub queue: String,
    pub id: String,
}

#[derive(Debug)]
pub struct Transaction {
    pub id: String,
    /// Pending puts/publishes, applied on commit only.
    pub inserts: Vec<StoreOp>,
    /// Pending consumes, applied on commit, requeued on abort.
    pub deletes: Vec<StagedDelete>,
    pub deadline: Instant,
}

impl Transaction {
    pub fn new(id: String, timeout: Duration) -> Self {
        Self {
            id,
            inserts: Vec::new(),
            deletes: Vec::new(),
            deadline: Instant::now() + timeout,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline <= now
    }
}
