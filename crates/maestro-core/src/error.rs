//! Queue-level error taxonomy.
//!
//! Mission-failure kinds live in [`maestro_db::models::FailureKind`]; this
//! module covers the errors a submitter can observe at admission and
//! operation time.

use thiserror::Error;
use uuid::Uuid;

use maestro_db::StorageError;
use maestro_db::models::MissionStatus;

/// Errors surfaced by the mission queue.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Backpressure: the in-memory queue is at its admission ceiling.
    /// The submitter should slow down and retry; nothing was truncated.
    #[error("mission queue is full (limit {limit})")]
    Full { limit: usize },

    /// Admitting or linking this mission would create a dependency cycle.
    #[error("dependency cycle involving mission {mission_id}")]
    DependencyCycle { mission_id: Uuid },

    /// The addressed mission is not tracked by the queue.
    #[error("mission {0} not found")]
    NotFound(Uuid),

    /// The requested transition is not an edge of the mission state graph.
    #[error("invalid transition {from} -> {to} for mission {mission_id}")]
    InvalidTransition {
        mission_id: Uuid,
        from: MissionStatus,
        to: MissionStatus,
    },

    /// The submission itself is malformed (empty prompt, non-positive
    /// timeout, unknown enum value).
    #[error("invalid mission: {0}")]
    Validation(String),

    /// The gateway refused the write.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl QueueError {
    /// Short kind tag used in structured API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Full { .. } => "queue_full",
            Self::DependencyCycle { .. } => "dependency_cycle",
            Self::NotFound(_) => "notfound",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Validation(_) => "validation",
            Self::Storage(err) => err.kind(),
        }
    }
}
