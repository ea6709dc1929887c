//! Shared live-subscription layer.
//!
//! One [`Subscription`] (or [`RepositorySubscription`]) exists per logical
//! key no matter how many callers are interested; callers hold
//! reference-counted handles, and the underlying feed listeners are torn
//! down exactly once when the last handle goes away. The
//! [`SubscriptionRegistry`] implements the create-if-absent /
//! join-if-present / retry-if-disposed protocol over them.
//!
//! # Example
//!
//! ```ignore
//! let registry = SubscriptionRegistry::new();
//! let handle = registry.acquire(&key, || {
//!     Subscription::create(key.clone(), loader, feed)
//! })?;
//!
//! let _listener = handle.on_change(|view| println!("now at {:?}", view));
//! // Dropping the handle releases the shared subscription.
//! ```

pub mod registry;
pub mod repository;
pub mod subscription;

use crate::types::DocumentKey;
use std::collections::BTreeSet;
use std::sync::Arc;

pub use registry::SubscriptionRegistry;
pub use repository::{
    ItemLoader, ListLoader, RepositoryEvent, RepositoryHandle, RepositorySubscription,
};
pub use subscription::{Subscription, SubscriptionHandle, ValueLoader};

/// A value that can be mirrored live.
///
/// Besides its own document, a mirrored value may depend on further documents
/// (a timeline depends on its group and every in-play character); the
/// subscription re-derives this set after every reload and rewires its feed
/// listeners to match.
pub trait LiveValue: Clone + Send + Sync + 'static {
    /// Document keys this value was assembled from, excluding the value's
    /// own key (the subscription always watches that one).
    fn dependency_keys(&self) -> BTreeSet<DocumentKey>;
}

/// Shared-ownership primitive a registry can hand out claims on.
pub trait Claimable: Send + Sync + 'static {
    type Handle;

    /// Claim a reference-counted handle, or `None` if the primitive already
    /// raced to its released state.
    fn try_claim(self: &Arc<Self>) -> Option<Self::Handle>;
}

/// Removes one registered change listener when cancelled or dropped.
pub struct ListenerGuard {
    remove: Option<Box<dyn FnOnce() + Send>>,
}

impl ListenerGuard {
    pub(crate) fn new(remove: impl FnOnce() + Send + 'static) -> Self {
        Self {
            remove: Some(Box::new(remove)),
        }
    }

    /// Stop receiving notifications.
    pub fn cancel(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}
