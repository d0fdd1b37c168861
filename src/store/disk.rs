//! Disk-backed message store.
//!
//! A directory holds one `master.idx` plus one `<uuid>.msg` file per
//! live message body. The master index starts with an 8-byte hex
//! pointer to the current index image; each image is an 8-byte hex
//! length followed by a JSON snapshot of queue/topic state, the
//! id-to-file mapping and the free-file list. Images are written by
//! next-fit append and the pointer flip is the last write, so a crash
//! mid-update recovers the previous image.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::headers::Headers;
use crate::broker::message::Message;
use crate::error::{Error, Result};

use super::index::StoreIndex;
use super::{MessageStore, StoreOp};

/// Free body files kept open for reuse; surplus files are unlinked.
pub const MAX_OPEN_FILES: usize = 20;

const INDEX_FILE: &str = "master.idx";
const LOCK_FILE: &str = "master.lock";
const HEADER_LEN: u64 = 8;

/// Durable snapshot layout inside the master index.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Image {
    index: StoreIndex,
    /// message id -> body filename
    messages: HashMap<String, String>,
    /// reusable body files
    free: Vec<String>,
}

struct FreeFile {
    name: String,
    file: File,
}

#[derive(Default)]
struct DiskInner {
    master: Option<File>,
    image_offset: u64,
    image_len: u64,
    index: StoreIndex,
    messages: HashMap<String, String>,
    pool: Vec<FreeFile>,
    active: bool,
}

pub struct DiskStore {
    dir: PathBuf,
    fsync: bool,
    inner: Mutex<DiskInner>,
}

impl DiskStore {
    pub fn new(dir: impl AsRef<Path>, fsync: bool) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            fsync,
            inner: Mutex::new(DiskInner::default()),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    // ==========================================
    // MASTER INDEX
    // ==========================================

    fn read_hex(master: &mut File, at: u64) -> Result<Option<u64>> {
        master.seek(SeekFrom::Start(at))?;
        let mut buf = [0u8; HEADER_LEN as usize];
        if let Err(e) = master.read_exact(&mut buf) {
            if e.kind() == ErrorKind::UnexpectedEof {
                return Ok(None);
            }
            return Err(e.into());
        }
        let text = std::str::from_utf8(&buf)
            .map_err(|_| Error::StoreCorrupt("master index pointer is not hex".into()))?;
        let value = u64::from_str_radix(text, 16)
            .map_err(|_| Error::StoreCorrupt("master index pointer is not hex".into()))?;
        Ok(Some(value))
    }

    /// Discard the cache and reload it from the last durable image.
    fn load(&self, inner: &mut DiskInner) -> Result<()> {
        inner.index = StoreIndex::default();
        inner.messages.clear();
        inner.pool.clear();
        inner.image_offset = 0;
        inner.image_len = 0;

        let master = inner
            .master
            .as_mut()
            .ok_or_else(|| Error::StoreUnavailable("store not active".into()))?;

        let Some(offset) = Self::read_hex(master, 0)? else {
            return Ok(()); // empty file, fresh state
        };
        if offset == 0 {
            return Ok(());
        }

        let len = Self::read_hex(master, offset)?
            .ok_or_else(|| Error::StoreCorrupt("master index image truncated".into()))?;
        let mut data = vec![0u8; len as usize];
        master
            .read_exact(&mut data)
            .map_err(|_| Error::StoreCorrupt("master index image truncated".into()))?;
        let image: Image = serde_json::from_slice(&data)
            .map_err(|e| Error::StoreCorrupt(format!("master index image: {}", e)))?;

        inner.index = image.index;
        inner.messages = image.messages;
        inner.pool = image
            .free
            .iter()
            .filter_map(|name| {
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(self.path(name))
                    .ok()
                    .map(|file| FreeFile {
                        name: name.clone(),
                        file,
                    })
            })
            .collect();
        inner.image_offset = offset;
        inner.image_len = len;
        Ok(())
    }

    /// Serialize the current state and persist it: image first, then
    /// the 8-byte pointer flip.
    fn write_image(&self, inner: &mut DiskInner) -> Result<()> {
        let image = Image {
            index: inner.index.clone(),
            messages: inner.messages.clone(),
            free: inner.pool.iter().map(|f| f.name.clone()).collect(),
        };
        let data = serde_json::to_vec(&image)
            .map_err(|e| Error::StoreUnavailable(format!("index encode: {}", e)))?;

        // Next-fit placement: in front of the current image when the
        // block fits there, otherwise right after it.
        let offset = if inner.image_offset == 0 {
            HEADER_LEN
        } else if HEADER_LEN + HEADER_LEN + data.len() as u64 <= inner.image_offset {
            HEADER_LEN
        } else {
            inner.image_offset + HEADER_LEN + inner.image_len
        };

        let master = inner
            .master
            .as_mut()
            .ok_or_else(|| Error::StoreUnavailable("store not active".into()))?;
        master.seek(SeekFrom::Start(offset))?;
        master.write_all(format!("{:08x}", data.len()).as_bytes())?;
        master.write_all(&data)?;
        if self.fsync {
            master.sync_data()?;
        }

        master.seek(SeekFrom::Start(0))?;
        master.write_all(format!("{:08x}", offset).as_bytes())?;
        if self.fsync {
            master.sync_data()?;
        }

        inner.image_offset = offset;
        inner.image_len = data.len() as u64;
        Ok(())
    }

    // ==========================================
    // MESSAGE FILES
    // ==========================================

    /// Write a body into a reused or fresh file and return its name.
    fn write_body(&self, inner: &mut DiskInner, body: &[u8]) -> Result<String> {
        let (name, mut file) = match inner.pool.pop() {
            Some(free) => (free.name, free.file),
            None => {
                let name = format!("{}.msg", Uuid::new_v4());
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .open(self.path(&name))?;
                (name, file)
            }
        };
        file.seek(SeekFrom::Start(0))?;
        file.write_all(body)?;
        if self.fsync {
            file.sync_data()?;
        }
        file.set_len(body.len() as u64)?;
        Ok(name)
    }

    /// Return a deleted message's file to the pool, or unlink it when
    /// the pool is full.
    fn release_file(&self, inner: &mut DiskInner, id: &str) {
        let Some(name) = inner.messages.remove(id) else {
            return;
        };
        if inner.pool.len() < MAX_OPEN_FILES {
            if let Ok(file) = OpenOptions::new()
                .read(true)
                .write(true)
                .open(self.path(&name))
            {
                inner.pool.push(FreeFile { name, file });
                return;
            }
        }
        if let Err(e) = fs::remove_file(self.path(&name)) {
            warn!(file = %name, "failed to unlink surplus message file: {}", e);
        }
    }

    fn read_body(&self, inner: &DiskInner, id: &str) -> Result<Bytes> {
        let name = inner
            .messages
            .get(id)
            .ok_or_else(|| Error::StoreCorrupt(format!("no body file mapped for {}", id)))?;
        Ok(Bytes::from(fs::read(self.path(name))?))
    }

    fn apply(&self, inner: &mut DiskInner, ops: &[StoreOp]) -> Result<()> {
        for op in ops {
            match op {
                StoreOp::Insert {
                    queue,
                    id,
                    headers,
                    body,
                } => {
                    let name = self.write_body(inner, body)?;
                    inner.messages.insert(id.clone(), name);
                    inner.index.push_queue(queue, headers.clone());
                }
                StoreOp::InsertTopic {
                    topic,
                    id,
                    headers,
                    body,
                } => {
                    if let Some(old) = inner.index.set_topic(topic, headers.clone()) {
                        if let Some(old_id) = old.id().map(str::to_string) {
                            self.release_file(inner, &old_id);
                        }
                    }
                    let name = self.write_body(inner, body)?;
                    inner.messages.insert(id.clone(), name);
                }
                StoreOp::Delete { queue, id } => {
                    if inner.index.remove_queue(queue, id).is_some() {
                        self.release_file(inner, id);
                    }
                }
                StoreOp::MoveToDlq { queue, id } => {
                    inner.index.move_to_dlq(queue, id);
                }
                StoreOp::DeleteTopic { topic, id } => {
                    if inner.index.take_topic_if(topic, id).is_some() {
                        self.release_file(inner, id);
                    }
                }
                StoreOp::Requeue { queue, id } => {
                    inner.index.bump_redelivery(queue, id);
                }
            }
        }
        Ok(())
    }
}

impl MessageStore for DiskStore {
    fn setup(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| Error::StoreUnavailable(format!("{}: {}", self.dir.display(), e)))
    }

    fn activate(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.active {
            return Ok(());
        }
        if !self.dir.is_dir() {
            return Err(Error::StoreUnavailable(format!(
                "{} is not a directory",
                self.dir.display()
            )));
        }

        // Single-writer ownership of the directory.
        let lock_path = self.path(LOCK_FILE);
        let mut lock = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .map_err(|e| {
                if e.kind() == ErrorKind::AlreadyExists {
                    Error::StoreUnavailable(format!(
                        "{} is owned by another process",
                        self.dir.display()
                    ))
                } else {
                    Error::StoreUnavailable(format!("{}: {}", lock_path.display(), e))
                }
            })?;
        let _ = write!(lock, "{}", process::id());

        let master = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(self.path(INDEX_FILE))
            .map_err(|e| Error::StoreUnavailable(format!("master index: {}", e)));
        let master = match master {
            Ok(f) => f,
            Err(e) => {
                let _ = fs::remove_file(&lock_path);
                return Err(e);
            }
        };

        inner.master = Some(master);
        if let Err(e) = self.load(&mut inner) {
            inner.master = None;
            let _ = fs::remove_file(&lock_path);
            return Err(e);
        }
        inner.active = true;
        info!(
            dir = %self.dir.display(),
            queues = inner.index.queues.len(),
            topics = inner.index.topics.len(),
            "disk store activated"
        );
        Ok(())
    }

    fn deactivate(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.active {
            return Ok(());
        }
        inner.active = false;
        inner.master = None;
        inner.pool.clear();
        let _ = fs::remove_file(self.path(LOCK_FILE));
        debug!(dir = %self.dir.display(), "disk store deactivated");
        Ok(())
    }

    fn transaction(&self, ops: &[StoreOp]) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.active {
            return Err(Error::StoreUnavailable("store not active".into()));
        }
        let result = self
            .apply(&mut inner, ops)
            .and_then(|_| self.write_image(&mut inner));
        if let Err(e) = result {
            warn!("store transaction failed, reloading index: {}", e);
            self.load(&mut inner)?;
            return Err(e);
        }
        Ok(())
    }

    fn queue_headers(&self, queue: &str) -> Result<Vec<Headers>> {
        let inner = self.inner.lock();
        if !inner.active {
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
        if !inner.active {
            return Err(Error::StoreUnavailable("store not active".into()));
        }
        let Some(headers) = inner.index.find(queue, predicate).cloned() else {
            return Ok(None);
        };
        let Some(id) = headers.id().map(str::to_string) else {
            return Err(Error::StoreCorrupt(format!(
                "queue {} holds a header without an id",
                queue
            )));
        };
        let body = self.read_body(&inner, &id)?;
        Ok(Some(Message::new(id, headers, body)))
    }

    fn get_last(
        &self,
        topic: &str,
        seen: Option<&str>,
        predicate: &dyn Fn(&Headers) -> bool,
    ) -> Result<Option<Message>> {
        let inner = self.inner.lock();
        if !inner.active {
            return Err(Error::StoreUnavailable("store not active".into()));
        }
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
        let body = self.read_body(&inner, &id)?;
        Ok(Some(Message::new(id, headers, body)))
    }
}

impl Drop for DiskStore {
    fn drop(&mut self) {
        let inner = self.inner.lock();
        if inner.active {
            let _ = fs::remove_file(self.path(LOCK_FILE));
        }
    }
}
