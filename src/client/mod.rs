//! Client façade: per-destination handles over an in-process manager
//! or a remote endpoint.
//!
//! A `Session` owns the link and the per-topic seen-id map; `queue`
//! and `topic` hand out lightweight handles. `transaction` runs a
//! closure against a fresh transaction, committing on `Ok` and
//! aborting on `Err`.

pub mod remote;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::warn;

use crate::broker::headers::Headers;
use crate::broker::manager::QueueManager;
use crate::broker::message::Message;
use crate::broker::selector::Selector;
use crate::config::DEFAULT_CONNECT_COUNT;
use crate::error::Result;
use crate::utils::epoch_secs;

use remote::RemoteLink;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Deadline passed to `begin` for closure-scoped transactions.
    pub tx_timeout: Duration,
    /// Connect retries before a remote endpoint is declared gone.
    pub connect_count: u32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            tx_timeout: Duration::from_secs(120),
            connect_count: DEFAULT_CONNECT_COUNT,
        }
    }
}

enum Link {
    Local(Arc<QueueManager>),
    Remote(Mutex<RemoteLink>),
}

impl Link {
    fn put(&self, queue: &str, body: Bytes, headers: Headers, tid: Option<&str>) -> Result<String> {
        match self {
            Link::Local(manager) => manager.put(queue, body, headers, tid),
            Link::Remote(link) => link.lock().put(queue, &body, headers, tid),
        }
    }

    fn dequeue(&self, queue: &str, selector: &Selector, tid: Option<&str>) -> Result<Option<Message>> {
        match self {
            Link::Local(manager) => manager.dequeue(queue, selector, tid),
            Link::Remote(link) => link.lock().dequeue(queue, selector, tid),
        }
    }

    fn list(&self, queue: &str) -> Result<Vec<Headers>> {
        match self {
            Link::Local(manager) => manager.list(queue),
            Link::Remote(link) => link.lock().list(queue),
        }
    }

    fn publish(&self, topic: &str, body: Bytes, headers: Headers, tid: Option<&str>) -> Result<String> {
        match self {
            Link::Local(manager) => manager.publish(topic, body, headers, tid),
            Link::Remote(link) => link.lock().publish(topic, &body, headers, tid),
        }
    }

    fn retrieve(
        &self,
        topic: &str,
        seen: Option<&str>,
        selector: &Selector,
        tid: Option<&str>,
    ) -> Result<Option<Message>> {
        match self {
            Link::Local(manager) => manager.retrieve(topic, seen, selector, tid),
            Link::Remote(link) => link.lock().retrieve(topic, seen, selector, tid),
        }
    }

    fn begin(&self, timeout: Duration) -> Result<String> {
        match self {
            Link::Local(manager) => manager.begin(timeout),
            Link::Remote(link) => link.lock().begin(timeout),
        }
    }

    fn commit(&self, tid: &str) -> Result<()> {
        match self {
            Link::Local(manager) => manager.commit(tid),
            Link::Remote(link) => link.lock().commit(tid),
        }
    }

    fn abort(&self, tid: &str) -> Result<()> {
        match self {
            Link::Local(manager) => manager.abort(tid),
            Link::Remote(link) => link.lock().abort(tid),
        }
    }
}

pub struct Session {
    link: Link,
    /// topic name -> last retrieved message id
    seen: DashMap<String, String>,
    options: ClientOptions,
}

impl Session {
    /// A session talking directly to an in-process manager.
    pub fn local(manager: Arc<QueueManager>) -> Self {
        Self {
            link: Link::Local(manager),
            seen: DashMap::new(),
            options: ClientOptions::default(),
        }
    }

    /// A session over the RPC transport.
    pub fn connect(endpoint: &str, options: ClientOptions) -> Result<Self> {
        let link = RemoteLink::connect(endpoint, options.connect_count)?;
        Ok(Self {
            link: Link::Remote(Mutex::new(link)),
            seen: DashMap::new(),
            options,
        })
    }

    pub fn with_options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    pub fn queue<'a>(&'a self, name: &str) -> QueueClient<'a> {
        QueueClient {
            session: self,
            name: name.to_string(),
        }
    }

    pub fn topic<'a>(&'a self, name: &str) -> TopicClient<'a> {
        TopicClient {
            session: self,
            name: name.to_string(),
        }
    }

    /// Run `f` inside a transaction: commit on `Ok`, abort on `Err`.
    pub fn transaction<T>(&self, f: impl FnOnce(&Tx<'_>) -> Result<T>) -> Result<T> {
        let tid = self.link.begin(self.options.tx_timeout)?;
        let tx = Tx { session: self, tid };
        match f(&tx) {
            Ok(value) => {
                self.link.commit(&tx.tid)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort_err) = self.link.abort(&tx.tid) {
                    warn!(tid = %tx.tid, "abort failed: {}", abort_err);
                }
                Err(e)
            }
        }
    }
}

/// Operations scoped to one open transaction.
pub struct Tx<'a> {
    session: &'a Session,
    tid: String,
}

impl Tx<'_> {
    pub fn tid(&self) -> &str {
        &self.tid
    }

    pub fn put(&self, queue: &str, body: impl Into<Bytes>, headers: Headers) -> Result<String> {
        self.session
            .link
            .put(queue, body.into(), headers, Some(&self.tid))
    }

    pub fn get(&self, queue: &str) -> Result<Option<Message>> {
        self.get_with(queue, &Selector::Any)
    }

    pub fn get_with(&self, queue: &str, selector: &Selector) -> Result<Option<Message>> {
        self.session.link.dequeue(queue, selector, Some(&self.tid))
    }

    pub fn publish(&self, topic: &str, body: impl Into<Bytes>, headers: Headers) -> Result<String> {
        self.session
            .link
            .publish(topic, body.into(), headers, Some(&self.tid))
    }
}

/// Handle for one queue.
pub struct QueueClient<'a> {
    session: &'a Session,
    name: String,
}

impl QueueClient<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn put(&self, body: impl Into<Bytes>, headers: Headers) -> Result<String> {
        self.session.link.put(&self.name, body.into(), headers, None)
    }

    pub fn get(&self) -> Result<Option<Message>> {
        self.get_with(&Selector::Any)
    }

    pub fn get_with(&self, selector: &Selector) -> Result<Option<Message>> {
        self.session.link.dequeue(&self.name, selector, None)
    }

    /// Client-side predicate selection: pull the header list, pick
    /// the first match locally, then dequeue it by id. The predicate
    /// sees each header set plus the current epoch seconds; it must
    /// be pure.
    pub fn get_where(&self, predicate: impl Fn(&Headers, i64) -> bool) -> Result<Option<Message>> {
        let now = epoch_secs();
        for headers in self.list()? {
            if predicate(&headers, now) {
                if let Some(id) = headers.id() {
                    return self.get_with(&Selector::id(id));
                }
            }
        }
        Ok(None)
    }

    pub fn list(&self) -> Result<Vec<Headers>> {
        self.session.link.list(&self.name)
    }
}

/// Handle for one topic. Tracks the last seen id so `retrieve`
/// returns each published value once per session.
pub struct TopicClient<'a> {
    session: &'a Session,
    name: String,
}

impl TopicClient<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn publish(&self, body: impl Into<Bytes>, headers: Headers) -> Result<String> {
        self.session
            .link
            .publish(&self.name, body.into(), headers, None)
    }

    pub fn retrieve(&self) -> Result<Option<Message>> {
        self.retrieve_with(&Selector::Any)
    }

    pub fn retrieve_with(&self, selector: &Selector) -> Result<Option<Message>> {
        let seen = self.session.seen.get(&self.name).map(|v| v.clone());
        let message =
            self.session
                .link
                .retrieve(&self.name, seen.as_deref(), selector, None)?;
        if let Some(m) = &message {
            self.session.seen.insert(self.name.clone(), m.id.clone());
        }
        Ok(message)
    }
}
