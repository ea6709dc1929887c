//! Engine-level properties: invariants under mutation sequences, insertion
//! points, and the bump algorithm's stepwise reference behavior.

use proptest::prelude::*;
use std::collections::BTreeSet;
use tickline::timeline::engine;
use tickline::{
    check_invariants, offset_of_tick, CharacterId, Effect, EffectId, GroupId, Tick, TickKind,
    Timeline, TimelineId,
};

fn empty() -> Timeline {
    Timeline::new(TimelineId::from("t1"), GroupId::from("g1"))
}

fn char_id(n: usize) -> CharacterId {
    CharacterId::new(format!("char-{n}"))
}

/// The multiset of (character, at) pairs, ignoring tie-break order.
fn placements(timeline: &Timeline) -> Vec<(CharacterId, i64)> {
    let mut out: Vec<_> = timeline
        .ticks
        .iter()
        .filter_map(|t| t.kind.character().map(|c| (c.clone(), t.at)))
        .collect();
    out.sort();
    out
}

#[test]
fn test_character_never_appears_twice() {
    // Walk a character through every placement-changing operation; after
    // each one it must appear in exactly one of tick list / ready-set.
    let alice = CharacterId::from("alice");
    let mut timeline = engine::add_character(&empty(), &alice, None).unwrap();

    let steps: Vec<Box<dyn Fn(&Timeline) -> Timeline>> = vec![
        Box::new(|t| engine::set_recovered(t, &CharacterId::from("alice"), 5, None).unwrap()),
        Box::new(|t| engine::set_ready(t, &CharacterId::from("alice")).unwrap()),
        Box::new(|t| {
            engine::set_action_ended(t, &CharacterId::from("alice"), 9, 4, None).unwrap()
        }),
        Box::new(|t| engine::set_recovered(t, &CharacterId::from("alice"), 9, Some(0)).unwrap()),
    ];

    for step in steps {
        timeline = step(&timeline);
        check_invariants(&timeline).unwrap();
        let on_ticks = timeline.tick_index_of(&alice).is_some();
        let in_ready = timeline.ready.contains(&alice);
        assert!(on_ticks != in_ready, "exactly one placement at all times");
    }

    let removed = engine::remove_character(&timeline, &alice).unwrap();
    assert!(!removed.is_member(&alice));
}

#[test]
fn test_effect_tick_schedule_is_exact() {
    let effect = Effect {
        id: EffectId::from("burn"),
        description: "burning".to_string(),
        starts_at: 7,
        total_duration: 10,
        tick_interval: Some(4),
        affects: BTreeSet::new(),
    };
    let timeline = engine::add_effect(&empty(), effect).unwrap();

    let mut recurring = Vec::new();
    let mut ends = Vec::new();
    for tick in &timeline.ticks {
        match &tick.kind {
            TickKind::EffectTicks { .. } => recurring.push(tick.at),
            TickKind::EffectEnds { .. } => ends.push(tick.at),
            _ => unreachable!(),
        }
    }
    // starts_at + k*interval while strictly before starts_at + duration.
    assert_eq!(recurring, vec![7, 11, 15]);
    assert_eq!(ends, vec![17]);
}

#[test]
fn test_round_trip_preserves_invariants() {
    let mut timeline = empty();
    for (i, at) in [(0, Some(3)), (1, Some(5)), (2, None), (3, Some(5))] {
        timeline = engine::add_character(&timeline, &char_id(i), at).unwrap();
    }
    timeline = engine::add_effect(
        &timeline,
        Effect {
            id: EffectId::from("haste"),
            description: "haste".to_string(),
            starts_at: 2,
            total_duration: 9,
            tick_interval: Some(3),
            affects: [char_id(0)].into_iter().collect(),
        },
    )
    .unwrap();
    timeline = engine::bump_character(&timeline, &char_id(3), -2).unwrap();

    let json = serde_json::to_string(&timeline).unwrap();
    let reloaded: Timeline = serde_json::from_str(&json).unwrap();
    assert_eq!(reloaded, timeline);
    check_invariants(&reloaded).unwrap();
}

#[test]
fn test_offset_of_tick_endpoints() {
    let ticks: Vec<Tick> = [1, 4, 4, 4, 8]
        .iter()
        .enumerate()
        .map(|(i, &at)| Tick {
            at,
            kind: TickKind::Recovers {
                character: char_id(i),
            },
        })
        .collect();

    // Immediately after the last entry with at == 4.
    assert_eq!(offset_of_tick(&ticks, 4, None), 4);
    // Immediately before the first entry with at == 4.
    assert_eq!(offset_of_tick(&ticks, 4, Some(0)), 1);
    // Natural sorted position when the value is absent.
    assert_eq!(offset_of_tick(&ticks, 6, None), 4);
    assert_eq!(offset_of_tick(&ticks, 6, Some(0)), 4);
}

/// A timeline with `n` characters at arbitrary small tick values.
fn arb_timeline(n: usize) -> impl Strategy<Value = Timeline> {
    prop::collection::vec(0i64..12, n).prop_map(|ats| {
        let mut timeline = Timeline::new(TimelineId::from("t1"), GroupId::from("g1"));
        for (i, at) in ats.into_iter().enumerate() {
            timeline = engine::add_character(&timeline, &char_id(i), Some(at)).unwrap();
        }
        timeline
    })
}

proptest! {
    /// Bump by +n then -n restores the multiset of (character, at) pairs.
    #[test]
    fn prop_bump_round_trips(
        timeline in arb_timeline(6),
        target in 0usize..6,
        delta in 1i64..8,
    ) {
        let character = char_id(target);
        let before = placements(&timeline);

        let bumped = engine::bump_character(&timeline, &character, delta).unwrap();
        check_invariants(&bumped).unwrap();
        let restored = engine::bump_character(&bumped, &character, -delta).unwrap();
        check_invariants(&restored).unwrap();

        prop_assert_eq!(placements(&restored), before);
    }

    /// Bumping never disturbs the other characters' (character, at) pairs.
    #[test]
    fn prop_bump_moves_only_the_target(
        timeline in arb_timeline(6),
        target in 0usize..6,
        delta in -8i64..8,
    ) {
        let character = char_id(target);
        let others_before: Vec<_> = placements(&timeline)
            .into_iter()
            .filter(|(c, _)| *c != character)
            .collect();

        let bumped = engine::bump_character(&timeline, &character, delta).unwrap();
        check_invariants(&bumped).unwrap();

        let others_after: Vec<_> = placements(&bumped)
            .into_iter()
            .filter(|(c, _)| *c != character)
            .collect();
        prop_assert_eq!(others_after, others_before);
    }

    /// A bump of +-1 moves the target exactly one position in the flat order.
    #[test]
    fn prop_single_step_moves_one_position(
        timeline in arb_timeline(6),
        target in 0usize..6,
        earlier in any::<bool>(),
    ) {
        let character = char_id(target);
        let delta = if earlier { -1 } else { 1 };
        let before = timeline.tick_index_of(&character).unwrap() as i64;

        let bumped = engine::bump_character(&timeline, &character, delta).unwrap();
        let after = bumped.tick_index_of(&character).unwrap() as i64;

        // The index moves by at most one; a retiming step that does not
        // cross another entry keeps the index but changes `at`.
        prop_assert!((after - before).abs() <= 1);
        if after == before {
            let at_before = timeline.ticks[before as usize].at;
            let at_after = bumped.ticks[after as usize].at;
            prop_assert_eq!(at_after - at_before, delta);
        }
    }
}
