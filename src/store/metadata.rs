use super::error::{Result, StoreError};
use super::{read_json, write_json};
use crate::jid_utils::decode_jid;
use crate::transport::MessageLoader;
use crate::types::contact::ContactRecord;
use crate::types::message::MessagePayload;
use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};

pub const DEFAULT_MAX_MESSAGES_PER_CHAT: usize = 20;
/// Shortest interval the background saver runs at.
pub const MIN_SAVE_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoredMessage {
    id: String,
    payload: MessagePayload,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    contacts: HashMap<String, ContactRecord>,
    #[serde(default)]
    messages: HashMap<String, VecDeque<StoredMessage>>,
}

/// In-memory contact/group metadata plus recent message payloads, written
/// back to a single JSON file.
///
/// Readers and writers never hold a shard lock across an `.await`, so
/// `upsert` and `flush` can interleave freely; `flush` itself is serialized.
pub struct MetadataCache {
    path: PathBuf,
    max_messages_per_chat: usize,
    contacts: DashMap<String, ContactRecord>,
    messages: DashMap<String, VecDeque<StoredMessage>>,
    dirty: AtomicBool,
    flush_lock: Mutex<()>,
}

impl MetadataCache {
    pub fn new(path: impl Into<PathBuf>, max_messages_per_chat: usize) -> Self {
        Self {
            path: path.into(),
            max_messages_per_chat: max_messages_per_chat.max(1),
            contacts: DashMap::new(),
            messages: DashMap::new(),
            dirty: AtomicBool::new(false),
            flush_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Populates the cache from disk. A missing or corrupt file leaves the
    /// cache empty; only genuine I/O failures are returned.
    pub async fn load(&self) -> Result<usize> {
        let snapshot = match read_json::<Snapshot>(&self.path).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                debug!(target: "Store/Metadata", "No metadata store at {}, starting empty", self.path.display());
                return Ok(0);
            }
            Err(StoreError::Corrupt { path, reason }) => {
                warn!(target: "Store/Metadata", "Ignoring corrupt metadata store {path}: {reason}");
                return Ok(0);
            }
            Err(e) => return Err(e),
        };

        for (_, record) in snapshot.contacts {
            self.contacts
                .insert(decode_jid(&record.id).into_owned(), record);
        }
        for (chat, messages) in snapshot.messages {
            self.messages.insert(chat, messages);
        }
        let count = self.contacts.len();
        info!(target: "Store/Metadata", "Loaded {} contacts from {}", count, self.path.display());
        Ok(count)
    }

    /// Inserts or replaces the record for its canonical identifier.
    pub fn upsert(&self, mut record: ContactRecord) {
        let key = decode_jid(&record.id).into_owned();
        record.id.clone_from(&key);
        self.contacts.insert(key, record);
        self.dirty.store(true, Ordering::Release);
    }

    pub fn get(&self, id: &str) -> Option<ContactRecord> {
        self.contacts
            .get(decode_jid(id).as_ref())
            .map(|entry| entry.value().clone())
    }

    pub fn contact_count(&self) -> usize {
        self.contacts.len()
    }

    /// Remembers a message payload so the transport can ask for it again.
    /// The oldest message of the conversation is evicted past the limit.
    pub fn remember_message(&self, chat: &str, id: &str, payload: &MessagePayload) {
        let chat = decode_jid(chat).into_owned();
        let mut queue = self.messages.entry(chat).or_default();
        match queue.iter().position(|m| m.id == id) {
            Some(idx) => queue[idx].payload = payload.clone(),
            None => {
                queue.push_back(StoredMessage {
                    id: id.to_string(),
                    payload: payload.clone(),
                });
                while queue.len() > self.max_messages_per_chat {
                    queue.pop_front();
                }
            }
        }
        drop(queue);
        self.dirty.store(true, Ordering::Release);
    }

    /// Returns the payload previously observed for `message_id`, if still resident.
    pub fn load_message(&self, chat: &str, message_id: &str) -> Option<MessagePayload> {
        self.messages
            .get(decode_jid(chat).as_ref())
            .and_then(|queue| {
                queue
                    .iter()
                    .find(|m| m.id == message_id)
                    .map(|m| m.payload.clone())
            })
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            contacts: self
                .contacts
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect(),
            messages: self
                .messages
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect(),
        }
    }

    /// Writes the full in-memory state to disk.
    pub async fn flush(&self) -> Result<()> {
        let _guard = self.flush_lock.lock().await;
        // Cleared before the snapshot so concurrent upserts re-mark it.
        self.dirty.store(false, Ordering::Release);
        let snapshot = self.snapshot();
        if let Err(e) = write_json(&self.path, &snapshot).await {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        debug!(
            target: "Store/Metadata",
            "Flushed {} contacts and {} conversations",
            snapshot.contacts.len(),
            snapshot.messages.len()
        );
        Ok(())
    }

    pub async fn flush_if_dirty(&self) -> Result<bool> {
        if !self.dirty.load(Ordering::Acquire) {
            return Ok(false);
        }
        self.flush().await.map(|_| true)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Spawns the periodic write-back task.
    pub fn run_background_saver(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let interval = saver_interval(interval);
        debug!(target: "Store/Metadata", "Background saver started with interval {interval:?}");
        tokio::spawn(async move {
            loop {
                sleep(interval).await;
                if let Err(e) = self.flush_if_dirty().await {
                    error!(target: "Store/Metadata", "Error saving metadata store in background: {e}");
                }
            }
        })
    }
}

fn saver_interval(requested: Duration) -> Duration {
    if requested < MIN_SAVE_INTERVAL {
        warn!(
            target: "Store/Metadata",
            "Write interval {requested:?} is too short, using {MIN_SAVE_INTERVAL:?}"
        );
        return MIN_SAVE_INTERVAL;
    }
    requested
}

#[async_trait]
impl MessageLoader for MetadataCache {
    async fn load_message(&self, chat: &str, message_id: &str) -> Option<MessagePayload> {
        MetadataCache::load_message(self, chat, message_id)
    }
}
