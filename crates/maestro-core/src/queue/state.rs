//! Mission state machine transitions.

use maestro_db::models::MissionStatus;

/// The mission state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// pending  -> queued | blocked
/// queued   <-> blocked            (the only reversible edge)
/// queued   -> running             (via atomic claim only)
/// queued   -> completed | failed  (external completion/failure)
/// running  -> completed | retrying | failed
/// retrying -> queued | failed
/// pending | queued | blocked | retrying | running -> cancelled
/// ```
///
/// Terminals: completed, failed, cancelled.
pub struct MissionStateMachine;

impl MissionStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge in
    /// the state graph.
    pub fn is_valid_transition(from: MissionStatus, to: MissionStatus) -> bool {
        use MissionStatus::*;
        matches!(
            (from, to),
            (Pending, Queued)
                | (Pending, Blocked)
                | (Queued, Blocked)
                | (Blocked, Queued)
                | (Queued, Running)
                | (Queued, Completed)
                | (Queued, Failed)
                | (Running, Completed)
                | (Running, Retrying)
                | (Running, Failed)
                | (Retrying, Queued)
                | (Retrying, Failed)
                | (Pending, Cancelled)
                | (Queued, Cancelled)
                | (Blocked, Cancelled)
                | (Retrying, Cancelled)
                | (Running, Cancelled)
        )
    }
}
