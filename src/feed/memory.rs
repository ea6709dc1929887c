//! In-memory backing store with an asynchronous change feed.
//!
//! Stands in for the real document store in tests and local use: documents
//! are JSON values keyed by string, and every put/delete is dispatched to
//! feed listeners from a dedicated worker thread, so notifications arrive
//! asynchronously with respect to the mutating caller, like a real feed.
//! Listeners are matched (and documents read back) at dispatch time, not at
//! enqueue time; tests that need a fixed event sequence call [`settle`]
//! between mutations.
//!
//! [`settle`]: MemoryBackend::settle

use crate::error::{Result, TrackerError};
use crate::feed::{ChangeFeed, ChangeKind, FeedGuard, KeyCallback, PrefixCallback};
use crate::live::EncounterStore;
use crate::timeline::Timeline;
use crate::types::{
    Character, CharacterId, DocumentKey, Group, GroupId, TimelineId, CHARACTER_PREFIX,
};
use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread::JoinHandle;

enum FeedMessage {
    Change(DocumentKey, ChangeKind),
    Flush(Sender<()>),
}

#[derive(Default)]
struct Watchers {
    next_id: u64,
    exact: HashMap<String, HashMap<u64, KeyCallback>>,
    prefix: HashMap<u64, (String, PrefixCallback)>,
}

struct Shared {
    docs: RwLock<BTreeMap<String, serde_json::Value>>,
    watchers: Mutex<Watchers>,
}

/// In-memory document store + change feed.
pub struct MemoryBackend {
    shared: Arc<Shared>,
    tx: Option<Sender<FeedMessage>>,
    worker: Option<JoinHandle<()>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            docs: RwLock::new(BTreeMap::new()),
            watchers: Mutex::new(Watchers::default()),
        });

        let (tx, rx) = unbounded::<FeedMessage>();
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::spawn(move || {
            while let Ok(message) = rx.recv() {
                match message {
                    FeedMessage::Change(key, kind) => {
                        // Snapshot matching callbacks under the lock, invoke
                        // outside it so a callback may resubscribe freely.
                        let (exact, prefix) = {
                            let watchers = worker_shared.watchers.lock();
                            let exact: Vec<KeyCallback> = watchers
                                .exact
                                .get(key.as_str())
                                .map(|m| m.values().cloned().collect())
                                .unwrap_or_default();
                            let prefix: Vec<PrefixCallback> = watchers
                                .prefix
                                .values()
                                .filter(|(p, _)| key.has_prefix(p))
                                .map(|(_, cb)| Arc::clone(cb))
                                .collect();
                            (exact, prefix)
                        };
                        for callback in exact {
                            callback();
                        }
                        for callback in prefix {
                            callback(&key, kind);
                        }
                    }
                    FeedMessage::Flush(reply) => {
                        let _ = reply.send(());
                    }
                }
            }
        });

        Self {
            shared,
            tx: Some(tx),
            worker: Some(worker),
        }
    }

    /// Store a document and notify feed listeners.
    pub fn put_document(&self, key: &DocumentKey, value: serde_json::Value) {
        self.shared
            .docs
            .write()
            .insert(key.as_str().to_string(), value);
        self.notify(key.clone(), ChangeKind::Put);
    }

    /// Serialize and store a document.
    pub fn put<T: Serialize>(&self, key: &DocumentKey, value: &T) -> Result<()> {
        self.put_document(key, serde_json::to_value(value)?);
        Ok(())
    }

    /// Delete a document. The delete notification goes out even if the key
    /// was absent; mirrors must tolerate deletions they never saw created.
    pub fn delete_document(&self, key: &DocumentKey) {
        self.shared.docs.write().remove(key.as_str());
        self.notify(key.clone(), ChangeKind::Delete);
    }

    /// Fetch and deserialize a document.
    pub fn get<T: DeserializeOwned>(&self, key: &DocumentKey) -> Result<T> {
        let docs = self.shared.docs.read();
        let value = docs
            .get(key.as_str())
            .ok_or_else(|| TrackerError::DocumentMissing(key.clone()))?;
        serde_json::from_value(value.clone())
            .map_err(|e| TrackerError::Deserialization(e.to_string()))
    }

    /// Number of exact-key listeners currently registered for a key.
    pub fn watcher_count(&self, key: &DocumentKey) -> usize {
        self.shared
            .watchers
            .lock()
            .exact
            .get(key.as_str())
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Number of prefix listeners currently registered.
    pub fn prefix_watcher_count(&self) -> usize {
        self.shared.watchers.lock().prefix.len()
    }

    /// Block until every notification queued so far has been dispatched.
    pub fn settle(&self) {
        if let Some(tx) = &self.tx {
            let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
            if tx.send(FeedMessage::Flush(reply_tx)).is_ok() {
                let _ = reply_rx.recv();
            }
        }
    }

    fn notify(&self, key: DocumentKey, kind: ChangeKind) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(FeedMessage::Change(key, kind));
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryBackend {
    fn drop(&mut self) {
        // Closing the channel stops the worker.
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl ChangeFeed for MemoryBackend {
    fn subscribe(&self, key: &DocumentKey, on_change: KeyCallback) -> FeedGuard {
        let id = {
            let mut watchers = self.shared.watchers.lock();
            let id = watchers.next_id;
            watchers.next_id += 1;
            watchers
                .exact
                .entry(key.as_str().to_string())
                .or_default()
                .insert(id, on_change);
            id
        };

        let shared = Arc::clone(&self.shared);
        let key = key.as_str().to_string();
        FeedGuard::new(move || {
            let mut watchers = shared.watchers.lock();
            let now_empty = match watchers.exact.get_mut(&key) {
                Some(map) => {
                    map.remove(&id);
                    map.is_empty()
                }
                None => false,
            };
            if now_empty {
                watchers.exact.remove(&key);
            }
        })
    }

    fn subscribe_to_prefix(&self, prefix: &str, on_change: PrefixCallback) -> FeedGuard {
        let id = {
            let mut watchers = self.shared.watchers.lock();
            let id = watchers.next_id;
            watchers.next_id += 1;
            watchers.prefix.insert(id, (prefix.to_string(), on_change));
            id
        };

        let shared = Arc::clone(&self.shared);
        FeedGuard::new(move || {
            shared.watchers.lock().prefix.remove(&id);
        })
    }
}

impl EncounterStore for MemoryBackend {
    fn load_timeline(&self, id: &TimelineId) -> Result<Timeline> {
        self.get(&DocumentKey::timeline(id))
    }

    fn load_character(&self, id: &CharacterId) -> Result<Character> {
        self.get(&DocumentKey::character(id))
    }

    fn load_group(&self, id: &GroupId) -> Result<Group> {
        self.get(&DocumentKey::group(id))
    }

    fn list_characters(&self) -> Result<Vec<Character>> {
        let docs = self.shared.docs.read();
        docs.range(CHARACTER_PREFIX.to_string()..)
            .take_while(|(k, _)| k.starts_with(CHARACTER_PREFIX))
            .map(|(_, v)| {
                serde_json::from_value(v.clone())
                    .map_err(|e| TrackerError::Deserialization(e.to_string()))
            })
            .collect()
    }

    fn save_timeline(&self, timeline: &Timeline) -> Result<()> {
        self.put(&DocumentKey::timeline(&timeline.id), timeline)
    }

    fn save_character(&self, character: &Character) -> Result<()> {
        self.put(&DocumentKey::character(&character.id), character)
    }

    fn save_group(&self, group: &Group) -> Result<()> {
        self.put(&DocumentKey::group(&group.id), group)
    }
}
