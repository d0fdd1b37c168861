//! Queue manager: concurrency control, transaction lifecycle,
//! in-flight locking, expiration/redelivery policy and dead-letter
//! routing.
//!
//! One coarse manager lock protects the lock set and the transaction
//! table, and is held across the store's indexed reads. Body reads
//! and dead-letter housekeeping run outside it; the store's own
//! `transaction` call is atomic on its side of the boundary.

use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::headers::{
    Delivery, HeaderValue, Headers, validate_header_name, H_CREATED, H_DELIVERY, H_EXPIRES,
    H_EXPIRES_AT, H_ID, H_MAX_DELIVERIES, H_PRIORITY, H_REDELIVERY, DEFAULT_MAX_DELIVERIES,
};
use crate::broker::message::Message;
use crate::broker::selector::Selector;
use crate::broker::transaction::{StagedDelete, Transaction};
use crate::error::{Error, Result};
use crate::store::{MessageStore, StoreOp, DLQ};
use crate::utils::epoch_secs;

const REAPER_STEP: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Default transaction deadline when `begin` gets a zero timeout.
    pub tx_timeout: Duration,
    /// Cadence of the transaction timeout reaper.
    pub reaper_interval: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            tx_timeout: Duration::from_secs(120),
            reaper_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Default)]
struct ManagerState {
    /// Ids currently held by an in-flight get. A locked message is
    /// invisible to every other getter.
    locks: HashSet<String>,
    transactions: HashMap<String, Transaction>,
}

pub struct QueueManager {
    store: Box<dyn MessageStore>,
    options: ManagerOptions,
    state: Mutex<ManagerState>,
    shutdown: Arc<AtomicBool>,
}

impl QueueManager {
    /// Set up and activate the store, then spawn the timeout reaper.
    pub fn start(store: Box<dyn MessageStore>, options: ManagerOptions) -> Result<Arc<Self>> {
        store.setup()?;
        store.activate()?;
        let manager = Arc::new(Self {
            store,
            options,
            state: Mutex::new(ManagerState::default()),
            shutdown: Arc::new(AtomicBool::new(false)),
        });
        Self::spawn_reaper(&manager)?;
        info!("queue manager started");
        Ok(manager)
    }

    /// Abort whatever is still open and release the store.
    pub fn stop(&self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        let open: Vec<String> = self.state.lock().transactions.keys().cloned().collect();
        for tid in open {
            if let Err(e) = self.abort(&tid) {
                warn!(tid = %tid, "abort during shutdown failed: {}", e);
            }
        }
        self.store.deactivate()?;
        info!("queue manager stopped");
        Ok(())
    }

    // ==========================================
    // PRODUCERS
    // ==========================================

    /// Accept a message for a queue and return its fresh id.
    pub fn put(
        &self,
        queue: &str,
        body: Bytes,
        headers: Headers,
        tid: Option<&str>,
    ) -> Result<String> {
        let queue = validate_destination(queue, "queue")?;
        let mut headers = headers;
        let id = self.fill_reserved(&mut headers, true)?;
        let op = StoreOp::Insert {
            queue,
            id: id.clone(),
            headers,
            body,
        };
        match tid {
            Some(tid) => self.stage_insert(tid, op)?,
            None => {
                let _state = self.state.lock();
                self.store.transaction(&[op])?;
            }
        }
        Ok(id)
    }

    /// Replace a topic's single slot. Delivery, priority and
    /// max_deliveries are meaningless here and are not filled in.
    pub fn publish(
        &self,
        topic: &str,
        body: Bytes,
        headers: Headers,
        tid: Option<&str>,
    ) -> Result<String> {
        let topic = validate_destination(topic, "topic")?;
        let mut headers = headers;
        let id = self.fill_reserved(&mut headers, false)?;
        let op = StoreOp::InsertTopic {
            topic,
            id: id.clone(),
            headers,
            body,
        };
        match tid {
            Some(tid) => self.stage_insert(tid, op)?,
            None => {
                let _state = self.state.lock();
                self.store.transaction(&[op])?;
            }
        }
        Ok(id)
    }

    // ==========================================
    // CONSUMERS
    // ==========================================

    /// Headers currently visible in the queue. Expired and exhausted
    /// messages found along the way are routed to the DLQ (or
    /// dropped) as a side effect.
    pub fn list(&self, queue: &str) -> Result<Vec<Headers>> {
        let queue = validate_destination(queue, "queue")?;
        let state = self.state.lock();
        let now = epoch_secs();
        let mut visible = Vec::new();
        let mut routing = Vec::new();
        for headers in self.store.queue_headers(&queue)? {
            let Some(id) = headers.id().map(str::to_string) else {
                continue;
            };
            if state.locks.contains(&id) {
                continue;
            }
            if queue != DLQ && (headers.is_expired(now) || headers.is_exhausted()) {
                routing.push(route_dead(&queue, &id, headers.delivery()));
            } else {
                visible.push(headers);
            }
        }
        if !routing.is_empty() {
            debug!(queue = %queue, count = routing.len(), "routing dead messages found by list");
            self.store.transaction(&routing)?;
        }
        Ok(visible)
    }

    /// Take the first visible message matching the selector. Without
    /// a transaction the delete is applied immediately; under one it
    /// is staged and the message stays locked until commit/abort.
    pub fn dequeue(
        &self,
        queue: &str,
        selector: &Selector,
        tid: Option<&str>,
    ) -> Result<Option<Message>> {
        let queue = validate_destination(queue, "queue")?;
        loop {
            // Choose and lock a candidate under the manager lock.
            let id = {
                let mut state = self.state.lock();
                let found = self.store.queue_headers(&queue)?.into_iter().find_map(|h| {
                    let id = h.id()?.to_string();
                    if state.locks.contains(&id) || !selector.matches(&h) {
                        return None;
                    }
                    Some(id)
                });
                match found {
                    Some(id) => {
                        state.locks.insert(id.clone());
                        id
                    }
                    None => return Ok(None),
                }
            };

            // Body materialization runs off the manager lock.
            let message = match self
                .store
                .get_message(&queue, &|h| h.id() == Some(id.as_str()))
            {
                Ok(Some(m)) => m,
                Ok(None) => {
                    // Lost a race with routing; pick again.
                    self.unlock(&id);
                    continue;
                }
                Err(e) => {
                    self.unlock(&id);
                    return Err(e);
                }
            };

            let now = epoch_secs();
            if queue != DLQ && (message.headers.is_expired(now) || message.headers.is_exhausted())
            {
                let op = route_dead(&queue, &id, message.headers.delivery());
                let result = self.store.transaction(&[op]);
                self.unlock(&id);
                result?;
                continue;
            }

            match tid {
                Some(tid) => {
                    if message.headers.delivery() == Delivery::Once && queue != DLQ {
                        // Park the message in the DLQ right away and
                        // stage its DLQ deletion: commit removes it
                        // entirely, abort leaves it dead-lettered
                        // instead of redelivered.
                        if let Err(e) = self.store.transaction(&[StoreOp::MoveToDlq {
                            queue: queue.clone(),
                            id: id.clone(),
                        }]) {
                            self.unlock(&id);
                            return Err(e);
                        }
                        self.stage_delete(tid, DLQ, &id)?;
                    } else {
                        self.stage_delete(tid, &queue, &id)?;
                    }
                }
                None => {
                    let result = self.store.transaction(&[StoreOp::Delete {
                        queue: queue.clone(),
                        id: id.clone(),
                    }]);
                    self.unlock(&id);
                    result?;
                }
            }
            return Ok(Some(message));
        }
    }

    /// Read a topic's current entry, unless the caller has already
    /// seen it. Expired entries are deleted on discovery.
    pub fn retrieve(
        &self,
        topic: &str,
        seen: Option<&str>,
        selector: &Selector,
        tid: Option<&str>,
    ) -> Result<Option<Message>> {
        let topic = validate_destination(topic, "topic")?;
        let state = self.state.lock();
        if let Some(tid) = tid {
            if !state.transactions.contains_key(tid) {
                return Err(Error::NoSuchTransaction(tid.to_string()));
            }
        }
        let Some(message) = self.store.get_last(&topic, seen, &|_| true)? else {
            return Ok(None);
        };
        if message.headers.is_expired(epoch_secs()) {
            self.store.transaction(&[StoreOp::DeleteTopic {
                topic,
                id: message.id.clone(),
            }])?;
            return Ok(None);
        }
        if !selector.matches(&message.headers) {
            return Ok(None);
        }
        Ok(Some(message))
    }

    // ==========================================
    // TRANSACTIONS
    // ==========================================

    /// Open a transaction. A zero timeout falls back to the
    /// configured default.
    pub fn begin(&self, timeout: Duration) -> Result<String> {
        let timeout = if timeout.is_zero() {
            self.options.tx_timeout
        } else {
            timeout
        };
        let tid = Uuid::new_v4().to_string();
        self.state
            .lock()
            .transactions
            .insert(tid.clone(), Transaction::new(tid.clone(), timeout));
        debug!(tid = %tid, timeout_secs = timeout.as_secs(), "transaction opened");
        Ok(tid)
    }

    /// Apply the staged inserts and deletes through a single store
    /// transaction, then release the delete locks. A store failure
    /// forces an abort and surfaces as `TransactionAborted`.
    pub fn commit(&self, tid: &str) -> Result<()> {
        let mut state = self.state.lock();
        let tx = state
            .transactions
            .remove(tid)
            .ok_or_else(|| Error::NoSuchTransaction(tid.to_string()))?;

        let mut ops = tx.inserts.clone();
        ops.extend(tx.deletes.iter().map(|d| StoreOp::Delete {
            queue: d.queue.clone(),
            id: d.id.clone(),
        }));
        let result = if ops.is_empty() {
            Ok(())
        } else {
            self.store.transaction(&ops)
        };

        match result {
            Ok(()) => {
                for d in &tx.deletes {
                    state.locks.remove(&d.id);
                }
                debug!(tid = %tid, "transaction committed");
                Ok(())
            }
            Err(e) => {
                warn!(tid = %tid, "commit failed, aborting: {}", e);
                self.rollback(&mut state, &tx);
                Err(Error::TransactionAborted(e.to_string()))
            }
        }
    }

    /// Discard the staged inserts, release the delete locks and bump
    /// each deleted message's redelivery counter so later consumers
    /// observe the retry count.
    pub fn abort(&self, tid: &str) -> Result<()> {
        let mut state = self.state.lock();
        let tx = state
            .transactions
            .remove(tid)
            .ok_or_else(|| Error::NoSuchTransaction(tid.to_string()))?;
        let mut requeues = Vec::with_capacity(tx.deletes.len());
        for d in &tx.deletes {
            state.locks.remove(&d.id);
            requeues.push(StoreOp::Requeue {
                queue: d.queue.clone(),
                id: d.id.clone(),
            });
        }
        debug!(tid = %tid, requeued = requeues.len(), "transaction aborted");
        if requeues.is_empty() {
            return Ok(());
        }
        self.store.transaction(&requeues)
    }

    // ==========================================
    // INTERNALS
    // ==========================================

    fn stage_insert(&self, tid: &str, op: StoreOp) -> Result<()> {
        let mut state = self.state.lock();
        match state.transactions.get_mut(tid) {
            Some(tx) => {
                tx.inserts.push(op);
                Ok(())
            }
            None => Err(Error::NoSuchTransaction(tid.to_string())),
        }
    }

    fn stage_delete(&self, tid: &str, queue: &str, id: &str) -> Result<()> {
        let mut state = self.state.lock();
        match state.transactions.get_mut(tid) {
            Some(tx) => {
                tx.deletes.push(StagedDelete {
                    queue: queue.to_string(),
                    id: id.to_string(),
                });
                Ok(())
            }
            None => {
                // The transaction closed while we were off the lock;
                // hand the message back.
                state.locks.remove(id);
                Err(Error::NoSuchTransaction(tid.to_string()))
            }
        }
    }

    fn unlock(&self, id: &str) {
        self.state.lock().locks.remove(id);
    }

    /// Abort bookkeeping shared by `abort` and the commit failure
    /// path. Requeue failures are logged, not propagated, since the
    /// caller already carries an error.
    fn rollback(&self, state: &mut ManagerState, tx: &Transaction) {
        let mut requeues = Vec::with_capacity(tx.deletes.len());
        for d in &tx.deletes {
            state.locks.remove(&d.id);
            requeues.push(StoreOp::Requeue {
                queue: d.queue.clone(),
                id: d.id.clone(),
            });
        }
        if !requeues.is_empty() {
            if let Err(e) = self.store.transaction(&requeues) {
                error!("requeue after failed commit also failed: {}", e);
            }
        }
    }

    /// Validate user headers and fill the reserved set. Returns the
    /// fresh message id.
    fn fill_reserved(&self, headers: &mut Headers, queue_mode: bool) -> Result<String> {
        for (name, _) in headers.iter() {
            validate_header_name(name)?;
        }

        let id = Uuid::new_v4().to_string();
        let created = epoch_secs();
        headers.insert(H_ID, id.clone());
        headers.insert(H_CREATED, created);
        // Requeue counting starts at the broker, never at the client.
        headers.remove(H_REDELIVERY);

        if queue_mode {
            match headers.get(H_DELIVERY).cloned() {
                None => headers.insert(H_DELIVERY, HeaderValue::sym(Delivery::BestEffort.as_str())),
                Some(value) => match Delivery::from_value(&value) {
                    Some(mode) => headers.insert(H_DELIVERY, HeaderValue::sym(mode.as_str())),
                    None => {
                        return Err(Error::InvalidArgument(format!(
                            "delivery must be one of best_effort/repeated/once, got {}",
                            value
                        )))
                    }
                },
            }
            match headers.get(H_MAX_DELIVERIES).cloned() {
                None => headers.insert(H_MAX_DELIVERIES, DEFAULT_MAX_DELIVERIES),
                Some(HeaderValue::Int(n)) => headers.insert(H_MAX_DELIVERIES, n.max(1)),
                Some(other) => {
                    return Err(Error::InvalidArgument(format!(
                        "max_deliveries must be an integer, got {}",
                        other
                    )))
                }
            }
            match headers.get(H_PRIORITY).cloned() {
                None => headers.insert(H_PRIORITY, 0i64),
                Some(HeaderValue::Int(n)) => headers.insert(H_PRIORITY, n.max(0)),
                Some(other) => {
                    return Err(Error::InvalidArgument(format!(
                        "priority must be an integer, got {}",
                        other
                    )))
                }
            }
        }

        // Relative `expires` becomes an absolute `expires_at`.
        match headers.remove(H_EXPIRES) {
            None => {}
            Some(HeaderValue::Int(secs)) => {
                headers.insert(H_EXPIRES_AT, created + secs);
            }
            Some(other) => {
                return Err(Error::InvalidArgument(format!(
                    "expires must be an integer number of seconds, got {}",
                    other
                )))
            }
        }
        match headers.get(H_EXPIRES_AT) {
            None | Some(HeaderValue::Int(_)) => {}
            Some(other) => {
                return Err(Error::InvalidArgument(format!(
                    "expires_at must be an integer timestamp, got {}",
                    other
                )))
            }
        }

        Ok(id)
    }

    // ==========================================
    // TIMEOUT REAPER
    // ==========================================

    fn spawn_reaper(manager: &Arc<Self>) -> Result<()> {
        let weak: Weak<Self> = Arc::downgrade(manager);
        let interval = manager.options.reaper_interval;
        let shutdown = manager.shutdown.clone();
        thread::Builder::new()
            .name("reliq-tx-reaper".into())
            .spawn(move || loop {
                let mut waited = Duration::ZERO;
                while waited < interval {
                    if shutdown.load(Ordering::SeqCst) {
                        return;
                    }
                    thread::sleep(REAPER_STEP);
                    waited += REAPER_STEP;
                }
                let Some(manager) = weak.upgrade() else {
                    return;
                };
                // Keep running whatever the scan throws at us.
                if panic::catch_unwind(AssertUnwindSafe(|| manager.reap_expired())).is_err() {
                    error!("transaction reaper crashed, restarting");
                }
            })?;
        Ok(())
    }

    fn reap_expired(&self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .state
            .lock()
            .transactions
            .iter()
            .filter(|(_, tx)| tx.is_expired(now))
            .map(|(tid, _)| tid.clone())
            .collect();
        for tid in expired {
            warn!(tid = %tid, "transaction deadline passed, aborting");
            match self.abort(&tid) {
                Ok(()) | Err(Error::NoSuchTransaction(_)) => {}
                Err(e) => error!(tid = %tid, "reaper abort failed: {}", e),
            }
        }
    }
}

/// Destination names are lowercased before use; empty names are
/// rejected before any side effect.
fn validate_destination(name: &str, what: &str) -> Result<String> {
    let name = name.trim().to_lowercase();
    if name.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "{} name must not be empty",
            what
        )));
    }
    Ok(name)
}

/// Routing for an expired or exhausted message, by delivery mode:
/// once/repeated messages are kept in the DLQ, best-effort ones are
/// dropped outright.
fn route_dead(queue: &str, id: &str, delivery: Delivery) -> StoreOp {
    match delivery {
        Delivery::Once | Delivery::Repeated => StoreOp::MoveToDlq {
            queue: queue.to_string(),
            id: id.to_string(),
        },
        Delivery::BestEffort => StoreOp::Delete {
            queue: queue.to_string(),
            id: id.to_string(),
        },
    }
}
