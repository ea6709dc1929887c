//! Single-value live mirror with reference-counted shared ownership.

use crate::error::Result;
use crate::feed::{ChangeFeed, FeedGuard};
use crate::subscriptions::{Claimable, ListenerGuard, LiveValue};
use crate::types::DocumentKey;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Loads the authoritative value, including every document it depends on.
pub type ValueLoader<V> = Arc<dyn Fn() -> Result<V> + Send + Sync>;

struct Observer<V> {
    id: u64,
    handle_id: u64,
    callback: Arc<dyn Fn(&V) + Send + Sync>,
}

struct Inner<V> {
    value: V,
    /// Live handles. The subscription starts unclaimed; once claimed and
    /// back at zero it is released for good.
    refs: usize,
    claimed: bool,
    released: bool,
    /// Feed listener per watched dependency key.
    watches: HashMap<DocumentKey, FeedGuard>,
    observers: Vec<Observer<V>>,
    next_observer_id: u64,
    next_handle_id: u64,
}

/// A live mirror of one value and its dependency set.
///
/// Holds exactly one feed listener per dependency key regardless of how many
/// handles are out. Every change notification triggers a full reload through
/// the loader (never an incremental patch): the dependency set itself changes
/// shape with the value, and only a full reload can pick up documents the
/// mirror was not yet subscribed to.
pub struct Subscription<V: LiveValue> {
    key: DocumentKey,
    loader: ValueLoader<V>,
    feed: Arc<dyn ChangeFeed>,
    inner: RwLock<Inner<V>>,
}

impl<V: LiveValue> Subscription<V> {
    /// Load the initial value and subscribe to it plus its dependencies.
    pub fn create(
        key: DocumentKey,
        loader: ValueLoader<V>,
        feed: Arc<dyn ChangeFeed>,
    ) -> Result<Arc<Self>> {
        let value = loader()?;

        let subscription = Arc::new(Self {
            key,
            loader,
            feed,
            inner: RwLock::new(Inner {
                value,
                refs: 0,
                claimed: false,
                released: false,
                watches: HashMap::new(),
                observers: Vec::new(),
                next_observer_id: 1,
                next_handle_id: 1,
            }),
        });

        {
            let mut inner = subscription.inner.write();
            let value = inner.value.clone();
            let stale = subscription.sync_watches_locked(&mut inner, &value);
            debug_assert!(stale.is_empty());
        }
        debug!(key = %subscription.key, "subscription created");

        Ok(subscription)
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    /// Current mirrored value.
    pub fn value(&self) -> V {
        self.inner.read().value.clone()
    }

    /// Number of live handles.
    pub fn ref_count(&self) -> usize {
        self.inner.read().refs
    }

    /// Claim a handle. Returns `None` once the subscription has released.
    pub fn try_get_handle(self: &Arc<Self>) -> Option<SubscriptionHandle<V>> {
        let mut inner = self.inner.write();
        if inner.released {
            return None;
        }
        inner.refs += 1;
        inner.claimed = true;
        let handle_id = inner.next_handle_id;
        inner.next_handle_id += 1;
        debug!(key = %self.key, refs = inner.refs, "handle acquired");
        Some(SubscriptionHandle {
            subscription: Arc::clone(self),
            handle_id,
            released: false,
        })
    }

    /// Force-release regardless of reference count (process shutdown or
    /// creation failure).
    pub fn dispose(&self) {
        let watches = {
            let mut inner = self.inner.write();
            if inner.released {
                return;
            }
            inner.released = true;
            inner.observers.clear();
            std::mem::take(&mut inner.watches)
        };
        debug!(key = %self.key, "subscription disposed");
        for (_, guard) in watches {
            guard.cancel();
        }
    }

    /// Re-fetch the value, rewire feed listeners to the new dependency set,
    /// and fan out to every registered listener.
    ///
    /// Runs once per change notification, possibly concurrently; the listener
    /// map mutation is serialized under the write lock, value adoption is
    /// last-write-wins. Fan-out happens after the lock is released, so
    /// listener callbacks may re-enter the subscription freely.
    pub fn reload(self: &Arc<Self>) {
        let value = match (self.loader)() {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %self.key, error = %e, "reload failed; keeping last-known-good value");
                return;
            }
        };

        let (stale, observers) = {
            let mut inner = self.inner.write();
            if inner.released {
                // Raced with the last release; discard without firing.
                return;
            }
            let stale = self.sync_watches_locked(&mut inner, &value);
            inner.value = value.clone();
            let observers: Vec<_> = inner
                .observers
                .iter()
                .map(|o| Arc::clone(&o.callback))
                .collect();
            (stale, observers)
        };

        for guard in stale {
            guard.cancel();
        }
        for callback in observers {
            callback(&value);
        }
    }

    /// Diff the watched key set against what the value requires. Newly
    /// required keys get listeners, stale listeners are handed back to the
    /// caller for cancellation outside the lock; unchanged keys are left
    /// untouched.
    fn sync_watches_locked(self: &Arc<Self>, inner: &mut Inner<V>, value: &V) -> Vec<FeedGuard> {
        let mut wanted = value.dependency_keys();
        wanted.insert(self.key.clone());

        let stale_keys: Vec<DocumentKey> = inner
            .watches
            .keys()
            .filter(|k| !wanted.contains(*k))
            .cloned()
            .collect();
        let mut stale = Vec::with_capacity(stale_keys.len());
        for key in stale_keys {
            if let Some(guard) = inner.watches.remove(&key) {
                debug!(key = %self.key, dependency = %key, "unwatching dependency");
                stale.push(guard);
            }
        }

        for dep in wanted {
            if !inner.watches.contains_key(&dep) {
                let weak = Arc::downgrade(self);
                let guard = self.feed.subscribe(
                    &dep,
                    Arc::new(move || {
                        if let Some(subscription) = Weak::upgrade(&weak) {
                            subscription.reload();
                        }
                    }),
                );
                inner.watches.insert(dep, guard);
            }
        }

        stale
    }

    fn add_observer(&self, handle_id: u64, callback: Arc<dyn Fn(&V) + Send + Sync>) -> u64 {
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
        let watches = {
            let mut inner = self.inner.write();
            inner.observers.retain(|o| o.handle_id != handle_id);
            inner.refs = inner.refs.saturating_sub(1);
            debug!(key = %self.key, refs = inner.refs, "handle released");
            if inner.refs == 0 && inner.claimed && !inner.released {
                inner.released = true;
                inner.observers.clear();
                std::mem::take(&mut inner.watches)
            } else {
                HashMap::new()
            }
        };
        for (_, guard) in watches {
            guard.cancel();
        }
    }
}

impl<V: LiveValue> Claimable for Subscription<V> {
    type Handle = SubscriptionHandle<V>;

    fn try_claim(self: &Arc<Self>) -> Option<Self::Handle> {
        self.try_get_handle()
    }
}

/// A caller's reference-counted claim on a [`Subscription`].
///
/// Dropping (or [`dispose`](Self::dispose)-ing) the handle decrements the
/// count; the last one tears the shared feed listeners down exactly once.
pub struct SubscriptionHandle<V: LiveValue> {
    subscription: Arc<Subscription<V>>,
    handle_id: u64,
    released: bool,
}

impl<V: LiveValue> SubscriptionHandle<V> {
    pub fn key(&self) -> &DocumentKey {
        self.subscription.key()
    }

    /// Current mirrored value. Eventually consistent: a slow reload may
    /// deliver its result after a later, faster one.
    pub fn value(&self) -> V {
        self.subscription.value()
    }

    /// Register a change listener, invoked with every newly adopted value.
    pub fn on_change(&self, callback: impl Fn(&V) + Send + Sync + 'static) -> ListenerGuard {
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

impl<V: LiveValue> Drop for SubscriptionHandle<V> {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.subscription.release_handle(self.handle_id);
        }
    }
}
