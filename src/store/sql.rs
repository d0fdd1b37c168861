//! SQLite-backed message store with the same contract as the disk
//! backend.
//!
//! Two tables: `<prefix>queues(id PK, queue, headers BLOB, body BLOB)`
//! and `<prefix>topics(topic PK, headers BLOB, body BLOB)`. Headers
//! are stored as serialized blobs, so the priority-ordered lists are
//! rebuilt in memory on activate and kept current alongside each
//! committed batch. The queue-manager algorithms are identical
//! regardless of backend.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::{debug, info, warn};

use crate::broker::headers::{Headers, H_REDELIVERY};
use crate::broker::message::Message;
use crate::error::{Error, Result};

use super::index::StoreIndex;
use super::{MessageStore, StoreOp, DLQ};

pub struct SqlStore {
    path: PathBuf,
    prefix: String,
    inner: Mutex<SqlInner>,
}

#[derive(Default)]
struct SqlInner {
    conn: Option<Connection>,
    index: StoreIndex,
}

impl SqlStore {
    pub fn new(path: impl AsRef<Path>, prefix: impl Into<String>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            prefix: prefix.into(),
            inner: Mutex::new(SqlInner::default()),
        }
    }

    fn queues_table(&self) -> String {
        format!("{}queues", self.prefix)
    }

    fn topics_table(&self) -> String {
        format!("{}topics", self.prefix)
    }

    fn open_connection(&self) -> Result<Connection> {
        Connection::open(&self.path)
            .map_err(|e| Error::StoreUnavailable(format!("{}: {}", self.path.display(), e)))
    }

    fn create_tables(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id TEXT PRIMARY KEY,
                    queue TEXT NOT NULL,
                    headers BLOB NOT NULL,
                    body BLOB NOT NULL
                )",
                self.queues_table()
            ),
            [],
        )?;
        conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS {}queues_by_queue ON {} (queue)",
                self.prefix,
                self.queues_table()
            ),
            [],
        )?;
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    topic TEXT PRIMARY KEY,
                    headers BLOB NOT NULL,
                    body BLOB NOT NULL
                )",
                self.topics_table()
            ),
            [],
        )?;
        Ok(())
    }

    fn load_index(&self, conn: &Connection) -> Result<StoreIndex> {
        let mut index = StoreIndex::default();

        let mut stmt = conn.prepare(&format!(
            "SELECT queue, headers FROM {}",
            self.queues_table()
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        for row in rows {
            let (queue, blob) = row?;
            let headers: Headers = serde_json::from_slice(&blob)
                .map_err(|e| Error::StoreCorrupt(format!("queue {} headers: {}", queue, e)))?;
            index.queues.entry(queue).or_default().push(headers);
        }
        // Blob storage has no positional column; restore priority
        // order with created-time tie-break.
        for list in index.queues.values_mut() {
            list.sort_by(|a, b| {
                b.priority()
                    .cmp(&a.priority())
                    .then(a.created().cmp(&b.created()))
            });
        }

        let mut stmt = conn.prepare(&format!(
            "SELECT topic, headers FROM {}",
            self.topics_table()
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        for row in rows {
            let (topic, blob) = row?;
            let headers: Headers = serde_json::from_slice(&blob)
                .map_err(|e| Error::StoreCorrupt(format!("topic {} headers: {}", topic, e)))?;
            index.topics.insert(topic, headers);
        }

        Ok(index)
    }

    fn encode_headers(headers: &Headers) -> Result<Vec<u8>> {
        serde_json::to_vec(headers)
            .map_err(|e| Error::StoreUnavailable(format!("headers encode: {}", e)))
    }

    fn run_batch(
        &self,
        conn: &mut Connection,
        index: &StoreIndex,
        ops: &[StoreOp],
    ) -> Result<()> {
        let tx = conn.transaction()?;
        for op in ops {
            match op {
                StoreOp::Insert {
                    queue,
                    id,
                    headers,
                    body,
                } => {
                    tx.execute(
                        &format!(
                            "INSERT INTO {} (id, queue, headers, body) VALUES (?1, ?2, ?3, ?4)",
                            self.queues_table()
                        ),
                        params![id, queue, Self::encode_headers(headers)?, body.as_ref()],
                    )?;
                }
                StoreOp::InsertTopic {
                    topic,
                    headers,
                    body,
                    ..
                } => {
                    tx.execute(
                        &format!(
                            "INSERT OR REPLACE INTO {} (topic, headers, body) VALUES (?1, ?2, ?3)",
                            self.topics_table()
                        ),
                        params![topic, Self::encode_headers(headers)?, body.as_ref()],
                    )?;
                }
                StoreOp::Delete { id, .. } => {
                    tx.execute(
                        &format!("DELETE FROM {} WHERE id = ?1", self.queues_table()),
                        params![id],
                    )?;
                }
                StoreOp::MoveToDlq { id, .. } => {
                    tx.execute(
                        &format!("UPDATE {} SET queue = ?2 WHERE id = ?1", self.queues_table()),
                        params![id, DLQ],
                    )?;
                }
                StoreOp::DeleteTopic { topic, id } => {
                    if index.topics.get(topic).and_then(|h| h.id()) == Some(id.as_str()) {
                        tx.execute(
                            &format!("DELETE FROM {} WHERE topic = ?1", self.topics_table()),
                            params![topic],
                        )?;
                    }
                }
                StoreOp::Requeue { queue, id } => {
                    if let Some(headers) = index
                        .queues
                        .get(queue)
                        .and_then(|list| list.iter().find(|h| h.id() == Some(id.as_str())))
                    {
                        let mut bumped = headers.clone();
                        let next = bumped.redelivery() + 1;
                        bumped.insert(H_REDELIVERY, next);
                        tx.execute(
                            &format!("UPDATE {} SET headers = ?2 WHERE id = ?1", self.queues_table()),
                            params![id, Self::encode_headers(&bumped)?],
                        )?;
                    }
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn apply_to_index(index: &mut StoreIndex, ops: &[StoreOp]) {
        for op in ops {
            match op {
                StoreOp::Insert { queue, headers, .. } => {
                    index.push_queue(queue, headers.clone());
                }
                StoreOp::InsertTopic { topic, headers, .. } => {
                    index.set_topic(topic, headers.clone());
                }
                StoreOp::Delete { queue, id } => {
                    index.remove_queue(queue, id);
                }
                StoreOp::MoveToDlq { queue, id } => {
                    index.move_to_dlq(queue, id);
                }
                StoreOp::DeleteTopic { topic, id } => {
                    index.take_topic_if(topic, id);
                }
                StoreOp::Requeue { queue, id } => {
                    index.bump_redelivery(queue, id);
                }
            }
        }
    }

    fn fetch_body(&self, conn: &Connection, table: &str, key: &str, value: &str) -> Result<Bytes> {
        let blob: Vec<u8> = conn.query_row(
            &format!("SELECT body FROM {} WHERE {} = ?1", table, key),
            params![value],
            |row| row.get(0),
        )?;
        Ok(Bytes::from(blob))
    }
}

impl MessageStore for SqlStore {
    fn setup(&self) -> Result<()> {
        let conn = self.open_connection()?;
        self.create_tables(&conn)
    }

    fn activate(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.conn.is_some() {
            return Ok(());
        }
        let conn = self.open_connection()?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA locking_mode = EXCLUSIVE;",
        )?;
        self.create_tables(&conn)?;
        inner.index = self.load_index(&conn)?;
        info!(
            db = %self.path.display(),
            queues = inner.index.queues.len(),
            topics = inner.index.topics.len(),
            "sql store activated"
        );
        inner.conn = Some(conn);
        Ok(())
    }

    fn deactivate(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.conn = None;
        inner.index = StoreIndex::default();
        debug!(db = %self.path.display(), "sql store deactivated");
        Ok(())
    }

    fn transaction(&self, ops: &[StoreOp]) -> Result<()> {
        let mut inner = self.inner.lock();
        let SqlInner { conn, index } = &mut *inner;
        let Some(conn) = conn.as_mut() else {
            return Err(Error::StoreUnavailable("store not active".into()));
        };
        match self.run_batch(conn, index, ops) {
            Ok(()) => {
                Self::apply_to_index(index, ops);
                Ok(())
            }
            Err(e) => {
                warn!("store transaction failed, reloading index: {}", e);
                *index = self.load_index(conn)?;
                Err(e)
            }
        }
    }

    fn queue_headers(&self, queue: &str) -> Result<Vec<Headers>> {
        let inner = self.inner.lock();
        if inner.conn.is_none() {
            return Err(Error::StoreUnavailable("store not active".into()));
        }
        Ok(inner.index.headers_of(queue))
    }

    fn get_message(
        &self,
        queue: &str,
        predicate: &dyn Fn(&Headers) -> bool,
    ) -> Result<Option<Message>> {
        let inner = self.inner.lock();
        let Some(conn) = inner.conn.as_ref() else {
            return Err(Error::StoreUnavailable("store not active".into()));
        };
        let Some(headers) = inner.index.find(queue, predicate).cloned() else {
            return Ok(None);
        };
        let Some(id) = headers.id().map(str::to_string) else {
            return Err(Error::StoreCorrupt(format!(
                "queue {} holds a header without an id",
                queue
            )));
        };
        let body = self.fetch_body(conn, &self.queues_table(), "id", &id)?;
        Ok(Some(Message::new(id, headers, body)))
    }

    fn get_last(
        &self,
        topic: &str,
        seen: Option<&str>,
        predicate: &dyn Fn(&Headers) -> bool,
    ) -> Result<Option<Message>> {
        let inner = self.inner.lock();
        let Some(conn) = inner.conn.as_ref() else {
            return Err(Error::StoreUnavailable("store not active".into()));
        };
        let Some(headers) = inner.index.topics.get(topic).cloned() else {
            return Ok(None);
        };
        let Some(id) = headers.id().map(str::to_string) else {
            return Err(Error::StoreCorrupt(format!(
                "topic {} holds a header without an id",
                topic
            )));
        };
        if seen == Some(id.as_str()) {
            return Ok(None);
        }
        if !predicate(&headers) {
            return Ok(None);
        }
        let body = self.fetch_body(conn, &self.topics_table(), "topic", topic)?;
        Ok(Some(Message::new(id, headers, body)))
    }
}
