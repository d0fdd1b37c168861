//! reliq: a reliable, transactional message broker.
//!
//! Queues are point-to-point, persistent and priority ordered, with
//! best-effort / repeated / once delivery semantics and a shared
//! dead-letter queue. Topics retain their most recent non-expired
//! message. A single queue manager serializes operations against a
//! message store and coordinates client transactions that span
//! multiple puts and gets.

pub mod broker;
pub mod client;
pub mod config;
pub mod error;
pub mod server;
pub mod store;
pub mod utils;

pub use broker::manager::{ManagerOptions, QueueManager};
pub use error::{Error, Result};

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::config::Settings;

// ========================================
// PROCESS-WIDE MANAGER SLOT
// ========================================

static ACTIVE: Lazy<Mutex<Option<Arc<QueueManager>>>> = Lazy::new(|| Mutex::new(None));

/// Start the process-wide queue manager. At most one can be active;
/// a second `start` fails with `ManagerAlreadyStarted`.
pub fn start(settings: &Settings) -> Result<Arc<QueueManager>> {
    let mut slot = ACTIVE.lock();
    if slot.is_some() {
        return Err(Error::ManagerAlreadyStarted);
    }
    let manager = QueueManager::start(settings.store.open(), ManagerOptions::default())?;
    *slot = Some(manager.clone());
    Ok(manager)
}

/// Stop the process-wide queue manager and release its store.
pub fn stop() -> Result<()> {
    let manager = ACTIVE.lock().take().ok_or(Error::ManagerNotStarted)?;
    manager.stop()
}

/// The currently active manager, if any.
pub fn active() -> Option<Arc<QueueManager>> {
    ACTIVE.lock().clone()
}
