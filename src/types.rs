//! Core identifier and document types for the tracker.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                $name(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(s.to_string())
            }
        }
    };
}

id_type!(
    /// Unique identifier for a character.
    CharacterId
);
id_type!(
    /// Unique identifier for a group (one encounter party).
    GroupId
);
id_type!(
    /// Unique identifier for a timeline.
    TimelineId
);
id_type!(
    /// Unique identifier for an effect.
    EffectId
);

/// Key of a document in the backing store.
///
/// Keys are flat strings with a kind prefix (`"timelines/"`, `"characters/"`,
/// `"groups/"`) so prefix subscriptions can cover a whole collection.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentKey(String);

/// Key prefix covering all timeline documents.
pub const TIMELINE_PREFIX: &str = "timelines/";

/// Key prefix covering all character documents.
pub const CHARACTER_PREFIX: &str = "characters/";

/// Key prefix covering all group documents.
pub const GROUP_PREFIX: &str = "groups/";

impl DocumentKey {
    /// Key for a raw string (already prefixed).
    pub fn raw(key: impl Into<String>) -> Self {
        DocumentKey(key.into())
    }

    /// Key of a timeline document.
    pub fn timeline(id: &TimelineId) -> Self {
        DocumentKey(format!("{TIMELINE_PREFIX}{id}"))
    }

    /// Key of a character document.
    pub fn character(id: &CharacterId) -> Self {
        DocumentKey(format!("{CHARACTER_PREFIX}{id}"))
    }

    /// Key of a group document.
    pub fn group(id: &GroupId) -> Self {
        DocumentKey(format!("{GROUP_PREFIX}{id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this key falls under a collection prefix.
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }
}

impl fmt::Debug for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocumentKey({})", self.0)
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A character document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub id: CharacterId,
    pub name: String,
    /// Group the character currently belongs to, if any.
    pub group: Option<GroupId>,
}

/// A group document (the party owning an encounter).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub members: BTreeSet<CharacterId>,
}
