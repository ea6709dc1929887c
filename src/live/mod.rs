//! Live encounter layer: storage contract, the mirrored timeline aggregate,
//! and the tracker facade tying engine and subscriptions together.

use crate::error::{Result, TrackerError};
use crate::feed::ChangeFeed;
use crate::subscriptions::{
    LiveValue, RepositoryHandle, RepositorySubscription, Subscription, SubscriptionHandle,
    SubscriptionRegistry,
};
use crate::timeline::{engine, Timeline, TimelineCommand};
use crate::types::{
    Character, CharacterId, DocumentKey, Group, GroupId, TimelineId, CHARACTER_PREFIX,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Loader/saver contract consumed from the storage collaborator.
///
/// The store is the source of truth; optimistic-concurrency or
/// single-writer-session semantics on its side serialize competing mutation
/// attempts on the same timeline id.
pub trait EncounterStore: Send + Sync {
    fn load_timeline(&self, id: &TimelineId) -> Result<Timeline>;
    fn load_character(&self, id: &CharacterId) -> Result<Character>;
    fn load_group(&self, id: &GroupId) -> Result<Group>;
    /// All character documents (the repository mirror's initial set).
    fn list_characters(&self) -> Result<Vec<Character>>;
    fn save_timeline(&self, timeline: &Timeline) -> Result<()>;
    fn save_character(&self, character: &Character) -> Result<()>;
    fn save_group(&self, group: &Group) -> Result<()>;
}

/// The aggregate a timeline subscription mirrors: the timeline itself, its
/// owning group, and every in-play character document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimelineView {
    pub timeline: Timeline,
    pub group: Group,
    pub characters: BTreeMap<CharacterId, Character>,
}

impl TimelineView {
    /// Assemble the aggregate from the store.
    pub fn load(store: &dyn EncounterStore, id: &TimelineId) -> Result<Self> {
        let timeline = store.load_timeline(id)?;
        let group = store.load_group(&timeline.group)?;
        let mut characters = BTreeMap::new();
        for character_id in timeline.characters_in_play() {
            let character = store.load_character(&character_id)?;
            characters.insert(character_id, character);
        }
        Ok(Self {
            timeline,
            group,
            characters,
        })
    }
}

impl LiveValue for TimelineView {
    fn dependency_keys(&self) -> BTreeSet<DocumentKey> {
        let mut keys = BTreeSet::new();
        keys.insert(DocumentKey::group(&self.timeline.group));
        for character_id in self.characters.keys() {
            keys.insert(DocumentKey::character(character_id));
        }
        keys
    }
}

/// Facade for the application layer: live handles on timelines and
/// characters, plus the closed mutation surface.
pub struct Tracker {
    store: Arc<dyn EncounterStore>,
    feed: Arc<dyn ChangeFeed>,
    timelines: SubscriptionRegistry<Subscription<TimelineView>>,
    characters: SubscriptionRegistry<RepositorySubscription<Character>>,
    /// Serializes load-apply-save cycles within this process. Cross-process
    /// writers are the storage layer's concern.
    write_lock: Mutex<()>,
}

impl Tracker {
    pub fn new(store: Arc<dyn EncounterStore>, feed: Arc<dyn ChangeFeed>) -> Self {
        Self {
            store,
            feed,
            timelines: SubscriptionRegistry::new(),
            characters: SubscriptionRegistry::new(),
            write_lock: Mutex::new(()),
        }
    }

    /// Acquire a live handle on a timeline's aggregate view.
    ///
    /// Joins the existing shared subscription if one is live, otherwise loads
    /// the timeline plus its dependent documents and subscribes to all of
    /// them.
    pub fn watch_timeline(&self, id: &TimelineId) -> Result<SubscriptionHandle<TimelineView>> {
        let key = DocumentKey::timeline(id);
        self.timelines.acquire(&key, || {
            let store = Arc::clone(&self.store);
            let id = id.clone();
            Subscription::create(
                key.clone(),
                Arc::new(move || TimelineView::load(store.as_ref(), &id)),
                Arc::clone(&self.feed),
            )
        })
    }

    /// Acquire a live handle on the character collection.
    pub fn watch_characters(&self) -> Result<RepositoryHandle<Character>> {
        let key = DocumentKey::raw(CHARACTER_PREFIX);
        self.characters.acquire(&key, || {
            let list_store = Arc::clone(&self.store);
            let item_store = Arc::clone(&self.store);
            RepositorySubscription::create(
                CHARACTER_PREFIX,
                Arc::new(move || {
                    Ok(list_store
                        .list_characters()?
                        .into_iter()
                        .map(|c| (DocumentKey::character(&c.id), c))
                        .collect())
                }),
                Arc::new(move |key: &DocumentKey| {
                    let id = key
                        .as_str()
                        .strip_prefix(CHARACTER_PREFIX)
                        .ok_or_else(|| TrackerError::DocumentMissing(key.clone()))?;
                    item_store.load_character(&CharacterId::from(id))
                }),
                Arc::clone(&self.feed),
            )
        })
    }

    /// Apply a mutation command to a timeline and persist the result.
    ///
    /// The engine validates membership and the structural invariants; a
    /// failed command leaves the stored timeline untouched. Live mirrors
    /// pick the new value up through the change feed.
    pub fn mutate(&self, id: &TimelineId, command: &TimelineCommand) -> Result<Timeline> {
        let _lock = self.write_lock.lock();

        let current = self.store.load_timeline(id)?;
        let next = engine::apply(&current, command)?;
        self.store.save_timeline(&next)?;
        Ok(next)
    }
}
