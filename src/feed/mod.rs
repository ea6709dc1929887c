//! Change-feed contract consumed from the storage collaborator.

pub mod memory;

use crate::types::DocumentKey;
use std::sync::Arc;

pub use memory::MemoryBackend;

/// Kind of change reported by the feed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Put,
    Delete,
}

/// Callback for a single-key subscription.
pub type KeyCallback = Arc<dyn Fn() + Send + Sync>;

/// Callback for a prefix subscription.
pub type PrefixCallback = Arc<dyn Fn(&DocumentKey, ChangeKind) + Send + Sync>;

/// Delivers asynchronous change notifications for document keys.
///
/// Notifications may arrive concurrently with handle acquisition and release;
/// callbacks run on whatever thread the feed implementation delivers from and
/// must not assume any particular one.
pub trait ChangeFeed: Send + Sync {
    /// Subscribe to changes of a single document key.
    fn subscribe(&self, key: &DocumentKey, on_change: KeyCallback) -> FeedGuard;

    /// Subscribe to changes of every key under a prefix.
    fn subscribe_to_prefix(&self, prefix: &str, on_change: PrefixCallback) -> FeedGuard;
}

/// Opaque cancellation token for one feed listener.
///
/// Cancels exactly once: explicitly via [`FeedGuard::cancel`] or implicitly
/// on drop, whichever comes first. Guards live inside the subscriptions'
/// shared state, so the cancel closure must be shareable across threads.
pub struct FeedGuard {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl FeedGuard {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Cancel the underlying listener.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for FeedGuard {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for FeedGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedGuard")
            .field("armed", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_guard_cancels_once() {
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        let guard = FeedGuard::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        guard.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let c = Arc::clone(&count);
        {
            let _guard = FeedGuard::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
