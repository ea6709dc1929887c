//! # Tickline
//!
//! Turn-order ("tick") tracking for tabletop combat encounters, with every
//! connected viewer's in-memory copy kept consistent with the backing store
//! in real time.
//!
//! ## Core Concepts
//!
//! - **Timeline**: Ordered ticks (recoveries, action ends, effect ticks and
//!   expirations), active effects, and the ready-set
//! - **Engine**: Transactional timeline mutations with strict structural
//!   invariants, including the bump (reorder) operation
//! - **Subscriptions**: One change-feed listener per logical key, shared by
//!   reference-counted handles and torn down exactly once
//! - **Tracker**: Facade wiring live timeline/character mirrors to the
//!   mutation command surface
//!
//! ## Example
//!
//! ```ignore
//! use tickline::{MemoryBackend, TimelineCommand, Tracker};
//!
//! let backend = Arc::new(MemoryBackend::new());
//! let tracker = Tracker::new(backend.clone(), backend.clone());
//!
//! let handle = tracker.watch_timeline(&timeline_id)?;
//! let _listener = handle.on_change(|view| render(view));
//!
//! tracker.mutate(&timeline_id, &TimelineCommand::BumpCharacter {
//!     character: hero,
//!     delta: -2,
//! })?;
//! ```

pub mod error;
pub mod feed;
pub mod live;
pub mod subscriptions;
pub mod timeline;
pub mod types;

// Re-exports
pub use error::{Result, TrackerError};
pub use feed::{ChangeFeed, ChangeKind, FeedGuard, MemoryBackend};
pub use live::{EncounterStore, TimelineView, Tracker};
pub use subscriptions::{
    Claimable, ListenerGuard, LiveValue, RepositoryEvent, RepositoryHandle,
    RepositorySubscription, Subscription, SubscriptionHandle, SubscriptionRegistry,
};
pub use timeline::{
    apply, check_invariants, offset_of_tick, Effect, Tick, TickKind, Timeline, TimelineCommand,
};
pub use types::*;
