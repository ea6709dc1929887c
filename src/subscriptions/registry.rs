//! Process-wide get-or-create registry for shared subscriptions.

use crate::error::{Result, TrackerError};
use crate::subscriptions::Claimable;
use crate::types::DocumentKey;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// How many times an acquire retries after finding a released subscription
/// between lookup and claim.
pub const MAX_ACQUIRE_ATTEMPTS: usize = 5;

enum SlotState<S> {
    Pending,
    Ready(Arc<S>),
    Failed(String),
}

/// One in-flight or resolved creation, shared by every caller racing on a
/// key.
struct Slot<S> {
    state: Mutex<SlotState<S>>,
    resolved: Condvar,
}

impl<S> Slot<S> {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Pending),
            resolved: Condvar::new(),
        }
    }

    fn resolve(&self, result: std::result::Result<Arc<S>, String>) {
        let mut state = self.state.lock();
        *state = match result {
            Ok(subscription) => SlotState::Ready(subscription),
            Err(message) => SlotState::Failed(message),
        };
        self.resolved.notify_all();
    }

    /// Block until the creation resolves; failures propagate to every joiner.
    fn wait(&self) -> Result<Arc<S>> {
        let mut state = self.state.lock();
        loop {
            match &*state {
                SlotState::Pending => self.resolved.wait(&mut state),
                SlotState::Ready(subscription) => return Ok(Arc::clone(subscription)),
                SlotState::Failed(message) => {
                    return Err(TrackerError::SubscriptionCreation(message.clone()))
                }
            }
        }
    }
}

/// Concurrent map from logical key to its single shared subscription.
///
/// `acquire` implements create-if-absent, join-if-present, and
/// retry-if-disposed-between-lookup-and-claim: exactly one caller runs the
/// creation logic per key, everyone else joins its in-flight slot, and a
/// claim that finds the subscription already torn down removes the stale
/// entry (only if it still matches what was read) and starts over, bounded
/// at [`MAX_ACQUIRE_ATTEMPTS`].
pub struct SubscriptionRegistry<S: Claimable> {
    entries: Mutex<HashMap<DocumentKey, Arc<Slot<S>>>>,
}

impl<S: Claimable> SubscriptionRegistry<S> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Number of keys with a registered (in-flight or ready) subscription.
    pub fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Get a handle for `key`, creating the shared subscription through
    /// `create` if no live one exists.
    pub fn acquire<F>(&self, key: &DocumentKey, create: F) -> Result<S::Handle>
    where
        F: Fn() -> Result<Arc<S>>,
    {
        for attempt in 0..MAX_ACQUIRE_ATTEMPTS {
            let (slot, installed) = {
                let mut entries = self.entries.lock();
                match entries.get(key) {
                    Some(slot) => (Arc::clone(slot), false),
                    None => {
                        let slot = Arc::new(Slot::new());
                        entries.insert(key.clone(), Arc::clone(&slot));
                        (slot, true)
                    }
                }
            };

            if installed {
                // We won the install; run the real creation logic. The map
                // lock is not held across the load.
                match create() {
                    Ok(subscription) => slot.resolve(Ok(subscription)),
                    Err(e) => {
                        slot.resolve(Err(e.to_string()));
                        self.remove_if_current(key, &slot);
                        return Err(e);
                    }
                }
            }

            let subscription = slot.wait()?;
            if let Some(handle) = subscription.try_claim() {
                return Ok(handle);
            }

            // The subscription released between lookup and claim. Clean the
            // stale entry up and start over.
            debug!(key = %key, attempt, "stale subscription; retrying acquire");
            self.remove_if_current(key, &slot);
        }

        Err(TrackerError::AcquireRetriesExhausted {
            key: key.clone(),
            attempts: MAX_ACQUIRE_ATTEMPTS,
        })
    }

    /// Remove the entry for `key` only if it is still the slot we read.
    fn remove_if_current(&self, key: &DocumentKey, slot: &Arc<Slot<S>>) {
        let mut entries = self.entries.lock();
        if let Some(current) = entries.get(key) {
            if Arc::ptr_eq(current, slot) {
                entries.remove(key);
            }
        }
    }
}

impl<S: Claimable> Default for SubscriptionRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Bare-bones claimable: counts claims, can be pre-released.
    struct Fake {
        released: Mutex<bool>,
        claims: AtomicUsize,
    }

    impl Fake {
        fn new(released: bool) -> Arc<Self> {
            Arc::new(Self {
                released: Mutex::new(released),
                claims: AtomicUsize::new(0),
            })
        }
    }

    #[derive(Debug)]
    struct FakeHandle;

    impl Claimable for Fake {
        type Handle = FakeHandle;

        fn try_claim(self: &Arc<Self>) -> Option<FakeHandle> {
            if *self.released.lock() {
                None
            } else {
                self.claims.fetch_add(1, Ordering::SeqCst);
                Some(FakeHandle)
            }
        }
    }

    #[test]
    fn test_create_then_join() {
        let registry = SubscriptionRegistry::<Fake>::new();
        let key = DocumentKey::raw("k");
        let created = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let c = Arc::clone(&created);
            let _handle = registry
                .acquire(&key, || {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(Fake::new(false))
                })
                .unwrap();
        }

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(registry.entry_count(), 1);
    }

    #[test]
    fn test_creation_failure_cleans_up() {
        let registry = SubscriptionRegistry::<Fake>::new();
        let key = DocumentKey::raw("k");

        let err = registry
            .acquire(&key, || {
                Err(TrackerError::SubscriptionCreation("storage down".into()))
            })
            .unwrap_err();
        assert!(matches!(err, TrackerError::SubscriptionCreation(_)));
        assert_eq!(registry.entry_count(), 0, "failed entry removed");

        // Next attempt starts fresh.
        let _handle = registry.acquire(&key, || Ok(Fake::new(false))).unwrap();
        assert_eq!(registry.entry_count(), 1);
    }

    #[test]
    fn test_stale_entry_retried() {
        let registry = SubscriptionRegistry::<Fake>::new();
        let key = DocumentKey::raw("k");

        // First creation yields an already-released subscription, as if it
        // raced to zero before we claimed; the retry creates a live one.
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let _handle = registry
            .acquire(&key, || {
                let released = c.fetch_add(1, Ordering::SeqCst) == 0;
                Ok(Fake::new(released))
            })
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_retries_bounded() {
        let registry = SubscriptionRegistry::<Fake>::new();
        let key = DocumentKey::raw("k");

        let err = registry
            .acquire(&key, || Ok(Fake::new(true)))
            .unwrap_err();
        assert!(matches!(err, TrackerError::AcquireRetriesExhausted { .. }));
    }
}
