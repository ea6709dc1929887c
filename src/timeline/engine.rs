//! Timeline mutation engine.
//!
//! Every operation is pure: it copies the timeline into a scratch value,
//! mutates that, validates the structural invariants, and only then returns
//! the new timeline. A failed mutation leaves no partial tick-list changes
//! behind. The engine holds no state of its own and is safe to call from any
//! thread; serializing competing writers on the same timeline id is the
//! storage layer's job.

use crate::error::{Result, TrackerError};
use crate::timeline::model::{Effect, Tick, TickKind, Timeline};
use crate::types::{CharacterId, EffectId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// The closed mutation surface exposed to the application layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum TimelineCommand {
    /// Put a previously-absent character on the timeline: scheduled at `at`
    /// if given, otherwise into the ready-set.
    AddCharacter {
        character: CharacterId,
        at: Option<i64>,
    },
    RemoveCharacter {
        character: CharacterId,
    },
    SetCharacterReady {
        character: CharacterId,
    },
    SetCharacterRecovered {
        character: CharacterId,
        at: i64,
        /// Rank within the group of entries already at `at` (0 = first).
        preempt: Option<usize>,
    },
    SetCharacterActionEnded {
        character: CharacterId,
        at: i64,
        total_duration: i64,
        description: Option<String>,
    },
    /// Nudge a character's tick earlier (negative) or later (positive) by
    /// `delta` positions, crossing tick values as needed.
    BumpCharacter {
        character: CharacterId,
        delta: i64,
    },
    AddEffect {
        effect: Effect,
    },
    RemoveEffect {
        effect: EffectId,
    },
    /// Skip one tick of a recurring effect, leaving the rest intact.
    RemoveEffectTick {
        effect: EffectId,
        at: i64,
    },
}

/// Apply a command to a timeline, returning the mutated copy.
pub fn apply(timeline: &Timeline, command: &TimelineCommand) -> Result<Timeline> {
    match command {
        TimelineCommand::AddCharacter { character, at } => add_character(timeline, character, *at),
        TimelineCommand::RemoveCharacter { character } => remove_character(timeline, character),
        TimelineCommand::SetCharacterReady { character } => set_ready(timeline, character),
        TimelineCommand::SetCharacterRecovered {
            character,
            at,
            preempt,
        } => set_recovered(timeline, character, *at, *preempt),
        TimelineCommand::SetCharacterActionEnded {
            character,
            at,
            total_duration,
            description,
        } => set_action_ended(timeline, character, *at, *total_duration, description.clone()),
        TimelineCommand::BumpCharacter { character, delta } => {
            bump_character(timeline, character, *delta)
        }
        TimelineCommand::AddEffect { effect } => add_effect(timeline, effect.clone()),
        TimelineCommand::RemoveEffect { effect } => remove_effect(timeline, effect),
        TimelineCommand::RemoveEffectTick { effect, at } => {
            remove_effect_tick(timeline, effect, *at)
        }
    }
}

/// Insertion index for a new tick at `at` within the ordered sequence.
///
/// Without `preempt` the new entry lands after all existing entries with the
/// same tick value. With `preempt = p` it lands at rank `p` within that tied
/// group, clamped to the group's bounds (`p = 0` puts it first).
pub fn offset_of_tick(ticks: &[Tick], at: i64, preempt: Option<usize>) -> usize {
    let lower = ticks.partition_point(|t| t.at < at);
    let upper = ticks.partition_point(|t| t.at <= at);
    match preempt {
        None => upper,
        Some(p) => (lower + p).clamp(lower, upper),
    }
}

/// Add a character to the timeline.
///
/// The only operation allowed to introduce a previously-absent character.
pub fn add_character(
    timeline: &Timeline,
    character: &CharacterId,
    at: Option<i64>,
) -> Result<Timeline> {
    if timeline.is_member(character) {
        return Err(TrackerError::AlreadyPresent {
            timeline: timeline.id.clone(),
            character: character.clone(),
        });
    }

    let mut scratch = timeline.clone();
    match at {
        Some(at) => {
            let index = offset_of_tick(&scratch.ticks, at, None);
            scratch.ticks.insert(
                index,
                Tick {
                    at,
                    kind: TickKind::Recovers {
                        character: character.clone(),
                    },
                },
            );
        }
        None => {
            scratch.ready.insert(character.clone());
        }
    }

    check_invariants(&scratch)?;
    Ok(scratch)
}

/// Remove a character from wherever it is placed.
pub fn remove_character(timeline: &Timeline, character: &CharacterId) -> Result<Timeline> {
    require_member(timeline, character)?;

    let mut scratch = timeline.clone();
    remove_placement(&mut scratch, character);

    check_invariants(&scratch)?;
    Ok(scratch)
}

/// Move a character to the ready-set, removing any existing tick first.
pub fn set_ready(timeline: &Timeline, character: &CharacterId) -> Result<Timeline> {
    require_member(timeline, character)?;

    let mut scratch = timeline.clone();
    remove_placement(&mut scratch, character);
    scratch.ready.insert(character.clone());

    check_invariants(&scratch)?;
    Ok(scratch)
}

/// Schedule a character's recovery at `at`, optionally preempting entries
/// already due at that tick.
pub fn set_recovered(
    timeline: &Timeline,
    character: &CharacterId,
    at: i64,
    preempt: Option<usize>,
) -> Result<Timeline> {
    require_member(timeline, character)?;

    let mut scratch = timeline.clone();
    remove_placement(&mut scratch, character);
    let index = offset_of_tick(&scratch.ticks, at, preempt);
    scratch.ticks.insert(
        index,
        Tick {
            at,
            kind: TickKind::Recovers {
                character: character.clone(),
            },
        },
    );

    check_invariants(&scratch)?;
    Ok(scratch)
}

/// Schedule the end of a character's ongoing action at `at`.
pub fn set_action_ended(
    timeline: &Timeline,
    character: &CharacterId,
    at: i64,
    total_duration: i64,
    description: Option<String>,
) -> Result<Timeline> {
    require_member(timeline, character)?;

    let mut scratch = timeline.clone();
    remove_placement(&mut scratch, character);
    let index = offset_of_tick(&scratch.ticks, at, None);
    scratch.ticks.insert(
        index,
        Tick {
            at,
            kind: TickKind::ActionEnds {
                character: character.clone(),
                started_at: at - total_duration,
                total_duration,
                description,
            },
        },
    );

    check_invariants(&scratch)?;
    Ok(scratch)
}

/// Reorder a character's tick by `delta` positions.
///
/// The walk is stepwise: one position per unit of `delta`. Moving earlier, a
/// step either slides left past a neighbor sharing the current tick value or,
/// at the edge of the tied group, retimes the tick one value earlier. Moving
/// later is symmetric. Untouched entries keep their relative order.
pub fn bump_character(timeline: &Timeline, character: &CharacterId, delta: i64) -> Result<Timeline> {
    require_member(timeline, character)?;

    let Some(index) = timeline.tick_index_of(character) else {
        return Err(TrackerError::NotScheduled {
            timeline: timeline.id.clone(),
            character: character.clone(),
        });
    };

    let mut scratch = timeline.clone();
    let pivot = scratch.ticks.remove(index);
    let mut index = index;
    let mut at = pivot.at;

    if delta < 0 {
        for _ in 0..delta.unsigned_abs() {
            if index > 0 && scratch.ticks[index - 1].at >= at {
                index -= 1;
            } else {
                at -= 1;
            }
        }
    } else {
        for _ in 0..delta {
            if index < scratch.ticks.len() && scratch.ticks[index].at <= at {
                index += 1;
            } else {
                at += 1;
            }
        }
    }

    scratch.ticks.insert(
        index,
        Tick {
            at,
            kind: pivot.kind,
        },
    );

    check_invariants(&scratch)?;
    Ok(scratch)
}

/// Add an effect, replacing any previous ticks for the same id (idempotent
/// re-add). Inserts one end tick at `starts_at + total_duration` and, if a
/// tick interval is set, one recurring tick per interval strictly before the
/// end.
pub fn add_effect(timeline: &Timeline, effect: Effect) -> Result<Timeline> {
    if let Some(interval) = effect.tick_interval {
        if interval <= 0 {
            return Err(TrackerError::InvariantViolation {
                rule: "effect-interval",
                detail: format!("effect {} has non-positive tick interval {interval}", effect.id),
            });
        }
    }

    let mut scratch = timeline.clone();
    scratch.ticks.retain(|t| t.kind.effect() != Some(&effect.id));

    let ends_at = effect.ends_at();
    let index = offset_of_tick(&scratch.ticks, ends_at, None);
    scratch.ticks.insert(
        index,
        Tick {
            at: ends_at,
            kind: TickKind::EffectEnds {
                effect: effect.id.clone(),
            },
        },
    );

    if let Some(interval) = effect.tick_interval {
        let mut next_at = effect.starts_at;
        while next_at < ends_at {
            let index = offset_of_tick(&scratch.ticks, next_at, None);
            scratch.ticks.insert(
                index,
                Tick {
                    at: next_at,
                    kind: TickKind::EffectTicks {
                        effect: effect.id.clone(),
                    },
                },
            );
            next_at += interval;
        }
    }

    scratch.effects.insert(effect.id.clone(), effect);

    check_invariants(&scratch)?;
    Ok(scratch)
}

/// Remove an effect and all its ticks.
pub fn remove_effect(timeline: &Timeline, effect: &EffectId) -> Result<Timeline> {
    if !timeline.effects.contains_key(effect) {
        return Err(TrackerError::EffectNotFound {
            timeline: timeline.id.clone(),
            effect: effect.clone(),
        });
    }

    let mut scratch = timeline.clone();
    scratch.effects.remove(effect);
    scratch.ticks.retain(|t| t.kind.effect() != Some(effect));

    check_invariants(&scratch)?;
    Ok(scratch)
}

/// Remove a single recurring tick of an effect, leaving the effect and its
/// other ticks intact. The end tick cannot be skipped this way.
pub fn remove_effect_tick(timeline: &Timeline, effect: &EffectId, at: i64) -> Result<Timeline> {
    if !timeline.effects.contains_key(effect) {
        return Err(TrackerError::EffectNotFound {
            timeline: timeline.id.clone(),
            effect: effect.clone(),
        });
    }

    let mut scratch = timeline.clone();
    let position = scratch.ticks.iter().position(|t| {
        t.at == at && matches!(&t.kind, TickKind::EffectTicks { effect: e } if e == effect)
    });

    match position {
        Some(index) => {
            scratch.ticks.remove(index);
        }
        None => {
            let is_end = scratch.ticks.iter().any(|t| {
                t.at == at && matches!(&t.kind, TickKind::EffectEnds { effect: e } if e == effect)
            });
            if is_end {
                return Err(TrackerError::CannotRemoveEndTick {
                    effect: effect.clone(),
                });
            }
            return Err(TrackerError::EffectTickNotFound {
                effect: effect.clone(),
                at,
            });
        }
    }

    check_invariants(&scratch)?;
    Ok(scratch)
}

/// Check the four structural invariants. Any violation aborts the mutation
/// that produced the timeline; nothing is ever silently repaired.
pub fn check_invariants(timeline: &Timeline) -> Result<()> {
    // 1. Each character appears in at most one tick or the ready-set.
    let mut seen: HashSet<&CharacterId> = timeline.ready.iter().collect();
    for tick in &timeline.ticks {
        if let Some(character) = tick.kind.character() {
            if !seen.insert(character) {
                return Err(TrackerError::InvariantViolation {
                    rule: "unique-character",
                    detail: format!("character {character} appears more than once"),
                });
            }
        }
    }

    // 2. Exactly one end tick per effect, and no ticks for unknown effects.
    let mut end_ticks: HashMap<&EffectId, (usize, i64)> = HashMap::new();
    for tick in &timeline.ticks {
        if let TickKind::EffectEnds { effect } = &tick.kind {
            let entry = end_ticks.entry(effect).or_insert((0, tick.at));
            entry.0 += 1;
            entry.1 = tick.at;
        }
        if let Some(effect) = tick.kind.effect() {
            if !timeline.effects.contains_key(effect) {
                return Err(TrackerError::InvariantViolation {
                    rule: "effect-orphan",
                    detail: format!("tick references unknown effect {effect}"),
                });
            }
        }
    }
    for effect in timeline.effects.keys() {
        match end_ticks.get(effect) {
            Some((1, _)) => {}
            Some((n, _)) => {
                return Err(TrackerError::InvariantViolation {
                    rule: "effect-end",
                    detail: format!("effect {effect} has {n} end ticks, expected exactly one"),
                });
            }
            None => {
                return Err(TrackerError::InvariantViolation {
                    rule: "effect-end",
                    detail: format!("effect {effect} has no end tick"),
                });
            }
        }
    }

    // 3. Recurring ticks occur strictly before their effect's end tick.
    for tick in &timeline.ticks {
        if let TickKind::EffectTicks { effect } = &tick.kind {
            if let Some((_, ends_at)) = end_ticks.get(effect) {
                if tick.at >= *ends_at {
                    return Err(TrackerError::InvariantViolation {
                        rule: "effect-tick-order",
                        detail: format!(
                            "effect {effect} ticks at {} but ends at {ends_at}",
                            tick.at
                        ),
                    });
                }
            }
        }
    }

    // 4. The tick sequence is non-decreasing in `at`.
    for pair in timeline.ticks.windows(2) {
        if pair[0].at > pair[1].at {
            return Err(TrackerError::InvariantViolation {
                rule: "tick-order",
                detail: format!("tick at {} precedes tick at {}", pair[0].at, pair[1].at),
            });
        }
    }

    Ok(())
}

fn require_member(timeline: &Timeline, character: &CharacterId) -> Result<()> {
    if timeline.is_member(character) {
        Ok(())
    } else {
        Err(TrackerError::NotAMember {
            timeline: timeline.id.clone(),
            id: character.to_string(),
        })
    }
}

/// Remove a character's current placement (tick or ready-set), if any.
fn remove_placement(timeline: &mut Timeline, character: &CharacterId) {
    if let Some(index) = timeline.tick_index_of(character) {
        timeline.ticks.remove(index);
    } else {
        timeline.ready.remove(character);
    }
}
