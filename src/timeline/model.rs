//! Timeline data model.

use crate::types::{CharacterId, EffectId, GroupId, TimelineId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// What a scheduled tick represents.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TickKind {
    /// A character finishes recovering and may act.
    Recovers { character: CharacterId },

    /// A character's ongoing action completes.
    ActionEnds {
        character: CharacterId,
        started_at: i64,
        total_duration: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },

    /// An effect expires.
    EffectEnds { effect: EffectId },

    /// A recurring effect fires one of its periodic ticks.
    EffectTicks { effect: EffectId },
}

impl TickKind {
    /// Character this tick belongs to, if it is character-scoped.
    pub fn character(&self) -> Option<&CharacterId> {
        match self {
            TickKind::Recovers { character } | TickKind::ActionEnds { character, .. } => {
                Some(character)
            }
            TickKind::EffectEnds { .. } | TickKind::EffectTicks { .. } => None,
        }
    }

    /// Effect this tick belongs to, if it is effect-scoped.
    pub fn effect(&self) -> Option<&EffectId> {
        match self {
            TickKind::EffectEnds { effect } | TickKind::EffectTicks { effect } => Some(effect),
            TickKind::Recovers { .. } | TickKind::ActionEnds { .. } => None,
        }
    }
}

/// A scheduled point on the integer timeline axis.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    /// The tick value (ordering key).
    pub at: i64,
    pub kind: TickKind,
}

/// A timed effect with an optional recurring tick interval.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Effect {
    pub id: EffectId,
    pub description: String,
    pub starts_at: i64,
    pub total_duration: i64,
    /// If set, the effect fires a tick at every multiple of the interval
    /// from `starts_at` up to (exclusive) `ends_at`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tick_interval: Option<i64>,
    /// Characters the effect applies to.
    pub affects: BTreeSet<CharacterId>,
}

impl Effect {
    /// The tick value at which the effect expires.
    pub fn ends_at(&self) -> i64 {
        self.starts_at + self.total_duration
    }
}

/// An encounter timeline: ordered ticks, active effects, and the ready-set.
///
/// Mutated exclusively through [`crate::timeline::engine`]; the live layer
/// reloads it wholesale from storage on every change notification rather than
/// patching it incrementally.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    pub id: TimelineId,
    pub group: GroupId,
    /// Ticks ordered by `at`, ties broken by insertion order.
    pub ticks: Vec<Tick>,
    pub effects: BTreeMap<EffectId, Effect>,
    /// Characters with no scheduled event, waiting to act.
    pub ready: BTreeSet<CharacterId>,
}

impl Timeline {
    /// An empty timeline for a group.
    pub fn new(id: TimelineId, group: GroupId) -> Self {
        Self {
            id,
            group,
            ticks: Vec::new(),
            effects: BTreeMap::new(),
            ready: BTreeSet::new(),
        }
    }

    /// Index of the character's scheduled tick, if any.
    pub fn tick_index_of(&self, character: &CharacterId) -> Option<usize> {
        self.ticks
            .iter()
            .position(|t| t.kind.character() == Some(character))
    }

    /// Whether the character is on the timeline (scheduled or ready).
    pub fn is_member(&self, character: &CharacterId) -> bool {
        self.ready.contains(character) || self.tick_index_of(character).is_some()
    }

    /// Characters currently in play: union of tick-referenced and ready ids.
    pub fn characters_in_play(&self) -> BTreeSet<CharacterId> {
        let mut out: BTreeSet<CharacterId> = self.ready.clone();
        for tick in &self.ticks {
            if let Some(c) = tick.kind.character() {
                out.insert(c.clone());
            }
        }
        out
    }

    /// Position of a character in turn order, counting scheduled ticks only.
    pub fn position_of(&self, character: &CharacterId) -> Option<usize> {
        self.ticks
            .iter()
            .filter_map(|t| t.kind.character())
            .position(|c| c == character)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn char_id(s: &str) -> CharacterId {
        CharacterId::from(s)
    }

    #[test]
    fn test_characters_in_play() {
        let mut timeline = Timeline::new(TimelineId::from("t1"), GroupId::from("g1"));
        timeline.ready.insert(char_id("a"));
        timeline.ticks.push(Tick {
            at: 3,
            kind: TickKind::Recovers {
                character: char_id("b"),
            },
        });
        timeline.ticks.push(Tick {
            at: 5,
            kind: TickKind::EffectEnds {
                effect: EffectId::from("e1"),
            },
        });

        let in_play = timeline.characters_in_play();
        assert!(in_play.contains(&char_id("a")));
        assert!(in_play.contains(&char_id("b")));
        assert_eq!(in_play.len(), 2);
    }

    #[test]
    fn test_position_of_counts_character_ticks_only() {
        let mut timeline = Timeline::new(TimelineId::from("t1"), GroupId::from("g1"));
        timeline.ticks.push(Tick {
            at: 2,
            kind: TickKind::Recovers {
                character: char_id("a"),
            },
        });
        timeline.ticks.push(Tick {
            at: 3,
            kind: TickKind::EffectTicks {
                effect: EffectId::from("e1"),
            },
        });
        timeline.ticks.push(Tick {
            at: 4,
            kind: TickKind::Recovers {
                character: char_id("b"),
            },
        });

        // Effect ticks don't occupy a slot in turn order.
        assert_eq!(timeline.position_of(&char_id("a")), Some(0));
        assert_eq!(timeline.position_of(&char_id("b")), Some(1));
        assert_eq!(timeline.position_of(&char_id("c")), None);
    }

    #[test]
    fn test_effect_ends_at() {
        let effect = Effect {
            id: EffectId::from("e1"),
            description: "poison".to_string(),
            starts_at: 10,
            total_duration: 12,
            tick_interval: Some(3),
            affects: BTreeSet::new(),
        };
        assert_eq!(effect.ends_at(), 22);
    }

    #[test]
    fn test_timeline_json_roundtrip() {
        let mut timeline = Timeline::new(TimelineId::from("t1"), GroupId::from("g1"));
        timeline.ticks.push(Tick {
            at: 2,
            kind: TickKind::ActionEnds {
                character: char_id("a"),
                started_at: 0,
                total_duration: 2,
                description: Some("reload".to_string()),
            },
        });
        timeline.ready.insert(char_id("b"));

        let json = serde_json::to_string(&timeline).unwrap();
        let back: Timeline = serde_json::from_str(&json).unwrap();
        assert_eq!(back, timeline);
    }
}
