//! Error types for the tracker.

use crate::types::{CharacterId, DocumentKey, EffectId, TimelineId};
use thiserror::Error;

/// Main error type for tracker operations.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Invariant violation ({rule}): {detail}")]
    InvariantViolation { rule: &'static str, detail: String },

    #[error("Not a member of timeline {timeline}: {id}")]
    NotAMember { timeline: TimelineId, id: String },

    #[error("Character already present on timeline {timeline}: {character}")]
    AlreadyPresent {
        timeline: TimelineId,
        character: CharacterId,
    },

    #[error("Character not scheduled on timeline {timeline}: {character}")]
    NotScheduled {
        timeline: TimelineId,
        character: CharacterId,
    },

    #[error("Effect not found on timeline {timeline}: {effect}")]
    EffectNotFound {
        timeline: TimelineId,
        effect: EffectId,
    },

    #[error("Effect {effect} has no tick at {at}")]
    EffectTickNotFound { effect: EffectId, at: i64 },

    #[error("Removing the end tick of effect {effect} is not allowed; remove the effect instead")]
    CannotRemoveEndTick { effect: EffectId },

    #[error("Document not found: {0}")]
    DocumentMissing(DocumentKey),

    #[error("Subscription creation failed: {0}")]
    SubscriptionCreation(String),

    #[error("Gave up acquiring subscription for {key} after {attempts} attempts")]
    AcquireRetriesExhausted { key: DocumentKey, attempts: usize },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

impl From<serde_json::Error> for TrackerError {
    fn from(e: serde_json::Error) -> Self {
        TrackerError::Serialization(e.to_string())
    }
}

/// Result type for tracker operations.
pub type Result<T> = std::result::Result<T, TrackerError>;
