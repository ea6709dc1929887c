//! Tick timeline model and mutation engine.

pub mod engine;
pub mod model;

pub use engine::{apply, check_invariants, offset_of_tick, TimelineCommand};
pub use model::{Effect, Tick, TickKind, Timeline};
