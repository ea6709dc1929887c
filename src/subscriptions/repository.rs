//! Collection live mirror: many independently-keyed values under one prefix.

use crate::error::Result;
use crate::feed::{ChangeFeed, ChangeKind, FeedGuard};
use crate::subscriptions::{Claimable, ListenerGuard};
use crate::types::DocumentKey;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Loads the initial item set under the prefix.
pub type ListLoader<V> = Arc<dyn Fn() -> Result<Vec<(DocumentKey, V)>> + Send + Sync>;

/// Loads a single item by key.
pub type ItemLoader<V> = Arc<dyn Fn(&DocumentKey) -> Result<V> + Send + Sync>;

/// Change to the mirrored collection.
#[derive(Clone, Debug)]
pub enum RepositoryEvent<V> {
    Added { key: DocumentKey, value: V },
    Updated { key: DocumentKey, value: V },
    Removed { key: DocumentKey },
}

struct Observer<V> {
    id: u64,
    handle_id: u64,
    callback: Arc<dyn Fn(&RepositoryEvent<V>) + Send + Sync>,
}

struct Inner<V> {
    items: BTreeMap<DocumentKey, V>,
    refs: usize,
    claimed: bool,
    released: bool,
    /// The single prefix listener covering the whole collection.
    watch: Option<FeedGuard>,
    observers: Vec<Observer<V>>,
    next_observer_id: u64,
    next_handle_id: u64,
}

/// A live mirror of an evolving collection, fed by one prefix subscription.
///
/// Same reference-count lifecycle as [`super::Subscription`], but instead of
/// one value it tracks a map of per-item values: puts add or update items,
/// deletes remove them. Deletes for items the mirror never saw are logged
/// and ignored (the feed may outrun the local copy under eventual
/// consistency).
pub struct RepositorySubscription<V: Clone + Send + Sync + 'static> {
    prefix: String,
    items_loader: ItemLoader<V>,
    inner: RwLock<Inner<V>>,
}

impl<V: Clone + Send + Sync + 'static> RepositorySubscription<V> {
    /// Load the initial item set and subscribe to the prefix.
    pub fn create(
        prefix: impl Into<String>,
        list_loader: ListLoader<V>,
        items_loader: ItemLoader<V>,
        feed: Arc<dyn ChangeFeed>,
    ) -> Result<Arc<Self>> {
        let prefix = prefix.into();
        let items: BTreeMap<DocumentKey, V> = list_loader()?.into_iter().collect();

        let subscription = Arc::new(Self {
            prefix,
            items_loader,
            inner: RwLock::new(Inner {
                items,
                refs: 0,
                claimed: false,
                released: false,
                watch: None,
                observers: Vec::new(),
                next_observer_id: 1,
                next_handle_id: 1,
            }),
        });

        let weak = Arc::downgrade(&subscription);
        let guard = feed.subscribe_to_prefix(
            &subscription.prefix,
            Arc::new(move |key, kind| {
                if let Some(subscription) = Weak::upgrade(&weak) {
                    subscription.on_feed_change(key, kind);
                }
            }),
        );
        subscription.inner.write().watch = Some(guard);
        debug!(prefix = %subscription.prefix, "repository subscription created");

        Ok(subscription)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Snapshot of the mirrored items.
    pub fn items(&self) -> BTreeMap<DocumentKey, V> {
        self.inner.read().items.clone()
    }

    pub fn ref_count(&self) -> usize {
        self.inner.read().refs
    }

    /// Claim a handle. Returns `None` once the subscription has released.
    pub fn try_get_handle(self: &Arc<Self>) -> Option<RepositoryHandle<V>> {
        let mut inner = self.inner.write();
        if inner.released {
            return None;
        }
        inner.refs += 1;
        inner.claimed = true;
        let handle_id = inner.next_handle_id;
        inner.next_handle_id += 1;
        Some(RepositoryHandle {
            subscription: Arc::clone(self),
            handle_id,
            released: false,
        })
    }

    /// Force-release regardless of reference count.
    pub fn dispose(&self) {
        let watch = {
            let mut inner = self.inner.write();
            if inner.released {
                return;
            }
            inner.released = true;
            inner.observers.clear();
            inner.watch.take()
        };
        debug!(prefix = %self.prefix, "repository subscription disposed");
        if let Some(guard) = watch {
            guard.cancel();
        }
    }

    fn on_feed_change(self: &Arc<Self>, key: &DocumentKey, kind: ChangeKind) {
        match kind {
            ChangeKind::Put => {
                let value = match (self.items_loader)(key) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(prefix = %self.prefix, key = %key, error = %e,
                              "item load failed on put; keeping last-known-good entry");
                        return;
                    }
                };
                let (event, observers) = {
                    let mut inner = self.inner.write();
                    if inner.released {
                        return;
                    }
                    let known = inner.items.insert(key.clone(), value.clone()).is_some();
                    let event = if known {
                        RepositoryEvent::Updated {
                            key: key.clone(),
                            value,
                        }
                    } else {
                        RepositoryEvent::Added {
                            key: key.clone(),
                            value,
                        }
                    };
                    (event, snapshot_observers(&inner))
                };
                for callback in observers {
                    callback(&event);
                }
            }
            ChangeKind::Delete => {
                let (removed, observers) = {
                    let mut inner = self.inner.write();
                    if inner.released {
                        return;
                    }
                    (inner.items.remove(key).is_some(), snapshot_observers(&inner))
                };
                if !removed {
                    warn!(prefix = %self.prefix, key = %key,
                          "delete for unknown item ignored");
                    return;
                }
                let event = RepositoryEvent::Removed { key: key.clone() };
                for callback in observers {
                    callback(&event);
                }
            }
        }
    }

    fn add_observer(
        &self,
        handle_id: u64,
        callback: Arc<dyn Fn(&RepositoryEvent<V>) + Send + Sync>,
    ) -> u64 {
        let mut inner = self.inner.write();
        let id = inner.next_observer_id;
        inner.next_observer_id += 1;
        inner.observers.push(Observer {
            id,
            handle_id,
            callback,
        });
        id
    }

    fn remove_observer(&self, observer_id: u64) {
        self.inner.write().observers.retain(|o| o.id != observer_id);
    }

    fn release_handle(&self, handle_id: u64) {
        let watch = {
            let mut inner = self.inner.write();
            inner.observers.retain(|o| o.handle_id != handle_id);
            inner.refs = inner.refs.saturating_sub(1);
            if inner.refs == 0 && inner.claimed && !inner.released {
                inner.released = true;
                inner.observers.clear();
                inner.watch.take()
            } else {
                None
            }
        };
        if let Some(guard) = watch {
            guard.cancel();
        }
    }
}

fn snapshot_observers<V>(inner: &Inner<V>) -> Vec<Arc<dyn Fn(&RepositoryEvent<V>) + Send + Sync>> {
    inner
        .observers
        .iter()
        .map(|o| Arc::clone(&o.callback))
        .collect()
}

impl<V: Clone + Send + Sync + 'static> Claimable for RepositorySubscription<V> {
    type Handle = RepositoryHandle<V>;

    fn try_claim(self: &Arc<Self>) -> Option<Self::Handle> {
        self.try_get_handle()
    }
}

/// A caller's reference-counted claim on a [`RepositorySubscription`].
pub struct RepositoryHandle<V: Clone + Send + Sync + 'static> {
    subscription: Arc<RepositorySubscription<V>>,
    handle_id: u64,
    released: bool,
}

impl<V: Clone + Send + Sync + 'static> RepositoryHandle<V> {
    /// Snapshot of the mirrored items.
    pub fn items(&self) -> BTreeMap<DocumentKey, V> {
        self.subscription.items()
    }

    /// Register a listener for added/updated/removed events.
    pub fn on_event(
        &self,
        callback: impl Fn(&RepositoryEvent<V>) + Send + Sync + 'static,
    ) -> ListenerGuard {
        let observer_id = self
            .subscription
            .add_observer(self.handle_id, Arc::new(callback));
        let weak = Arc::downgrade(&self.subscription);
        ListenerGuard::new(move || {
            if let Some(subscription) = Weak::upgrade(&weak) {
                subscription.remove_observer(observer_id);
            }
        })
    }

    /// Release this claim.
    pub fn dispose(self) {
        drop(self);
    }
}

impl<V: Clone + Send + Sync + 'static> Drop for RepositoryHandle<V> {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.subscription.release_handle(self.handle_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::MemoryBackend;
    use crate::live::EncounterStore;
    use crate::types::{Character, CharacterId, CHARACTER_PREFIX};
    use parking_lot::Mutex;

    fn character(id: &str) -> Character {
        Character {
            id: CharacterId::from(id),
            name: id.to_string(),
            group: None,
        }
    }

    fn create_repository(
        backend: &Arc<MemoryBackend>,
    ) -> Arc<RepositorySubscription<Character>> {
        let list_backend = Arc::clone(backend);
        let item_backend = Arc::clone(backend);
        RepositorySubscription::create(
            CHARACTER_PREFIX,
            Arc::new(move || {
                Ok(list_backend
                    .list_characters()?
                    .into_iter()
                    .map(|c| (DocumentKey::character(&c.id), c))
                    .collect())
            }),
            Arc::new(move |key| item_backend.get(key)),
            Arc::clone(backend) as Arc<dyn ChangeFeed>,
        )
        .unwrap()
    }

    #[test]
    fn test_add_update_remove_items() {
        let backend = Arc::new(MemoryBackend::new());
        backend.save_character(&character("alice")).unwrap();
        // Drain the seed notification before the prefix listener attaches.
        backend.settle();

        let repository = create_repository(&backend);
        let handle = repository.try_get_handle().unwrap();
        assert_eq!(handle.items().len(), 1);

        let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let e = Arc::clone(&events);
        let _listener = handle.on_event(move |event| {
            let tag = match event {
                RepositoryEvent::Added { key, .. } => format!("added:{key}"),
                RepositoryEvent::Updated { key, .. } => format!("updated:{key}"),
                RepositoryEvent::Removed { key } => format!("removed:{key}"),
            };
            e.lock().push(tag);
        });

        backend.save_character(&character("bob")).unwrap();
        backend.save_character(&character("alice")).unwrap();
        // Item loads happen at dispatch time; let both puts dispatch before
        // the delete empties bob's document.
        backend.settle();
        backend.delete_document(&DocumentKey::raw("characters/bob"));
        backend.settle();

        assert_eq!(
            *events.lock(),
            vec![
                "added:characters/bob".to_string(),
                "updated:characters/alice".to_string(),
                "removed:characters/bob".to_string(),
            ]
        );
        assert_eq!(handle.items().len(), 1);
    }

    #[test]
    fn test_unknown_delete_ignored() {
        let backend = Arc::new(MemoryBackend::new());
        let repository = create_repository(&backend);
        let handle = repository.try_get_handle().unwrap();

        let events = Arc::new(Mutex::new(0usize));
        let e = Arc::clone(&events);
        let _listener = handle.on_event(move |_| {
            *e.lock() += 1;
        });

        backend.delete_document(&DocumentKey::raw("characters/ghost"));
        backend.settle();

        assert_eq!(*events.lock(), 0);
        assert!(handle.items().is_empty());
    }

    #[test]
    fn test_release_tears_down_prefix_listener() {
        let backend = Arc::new(MemoryBackend::new());
        let repository = create_repository(&backend);
        assert_eq!(backend.prefix_watcher_count(), 1);

        let a = repository.try_get_handle().unwrap();
        let b = repository.try_get_handle().unwrap();
        drop(a);
        assert_eq!(backend.prefix_watcher_count(), 1);
        drop(b);
        assert_eq!(backend.prefix_watcher_count(), 0);
        assert!(repository.try_get_handle().is_none());
    }
}
