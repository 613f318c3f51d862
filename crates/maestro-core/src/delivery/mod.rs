//! The delivery substrate: hands a claimed mission to its agent with
//! at-most-once semantics under partial failures of the streaming channel.
//!
//! The durable inbox row is written before the streaming send, so a
//! dropped channel never loses the assignment. Actually starting work
//! always goes through the store's atomic claim, which succeeds at most
//! once per `(queued, null-execution-id)` state; a redelivery that lost
//! the race observes zero affected rows and yields.

pub mod broadcast;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sqlx::PgPool;
use tokio::sync::mpsc;
use uuid::Uuid;

use maestro_db::DbResult;
use maestro_db::models::{Mission, MissionStatus};
use maestro_db::queries::{inbox, missions as mission_db};

/// Shared record of the last checkpoint seen per mission.
///
/// Written by the worker-event fan-in, read by the adaptive timeout
/// enforcer.
#[derive(Clone, Default)]
pub struct CheckpointClock {
    inner: Arc<Mutex<HashMap<Uuid, Instant>>>,
}

impl CheckpointClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a checkpoint for a mission right now.
    pub fn record(&self, mission_id: Uuid) {
        self.inner
            .lock()
            .expect("checkpoint clock poisoned")
            .insert(mission_id, Instant::now());
    }

    /// When the mission last checkpointed, if ever.
    pub fn last(&self, mission_id: Uuid) -> Option<Instant> {
        self.inner
            .lock()
            .expect("checkpoint clock poisoned")
            .get(&mission_id)
            .copied()
    }

    /// Whether the mission checkpointed within the window.
    pub fn has_recent(&self, mission_id: Uuid, window: Duration) -> bool {
        self.last(mission_id)
            .map(|at| at.elapsed() <= window)
            .unwrap_or(false)
    }

    /// Forget a finished mission.
    pub fn clear(&self, mission_id: Uuid) {
        self.inner
            .lock()
            .expect("checkpoint clock poisoned")
            .remove(&mission_id);
    }
}

/// A claimed mission on its way to an agent.
#[derive(Debug, Clone)]
pub struct MissionAssignment {
    pub mission: Mission,
    pub execution_id: String,
    pub agent_id: i64,
}

/// How an assignment reached (or will reach) the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPath {
    /// Sent on the live streaming channel (inbox row retained until ack).
    Streamed,
    /// The channel was down or full; the durable inbox carries it.
    InboxOnly,
}

/// Per-agent streaming channels plus the durable inbox fallback.
#[derive(Clone)]
pub struct DeliveryHub {
    pool: PgPool,
    checkpoints: CheckpointClock,
    channels: Arc<Mutex<HashMap<i64, mpsc::Sender<MissionAssignment>>>>,
}

impl DeliveryHub {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            checkpoints: CheckpointClock::new(),
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Handle to the checkpoint clock shared with the timeout enforcer.
    pub fn checkpoints(&self) -> CheckpointClock {
        self.checkpoints.clone()
    }

    /// Open (or replace) the streaming channel for an agent; returns the
    /// receive side the agent's driver consumes.
    pub fn attach_agent(&self, agent_id: i64, capacity: usize) -> mpsc::Receiver<MissionAssignment> {
        let (tx, rx) = mpsc::channel(capacity);
        self.channels
            .lock()
            .expect("delivery channels poisoned")
            .insert(agent_id, tx);
        rx
    }

    /// Drop an agent's streaming channel (retirement, crash).
    pub fn detach_agent(&self, agent_id: i64) {
        self.channels
            .lock()
            .expect("delivery channels poisoned")
            .remove(&agent_id);
    }

    /// Deliver a claimed mission: durable inbox first, then best-effort
    /// streaming send. A dead or congested channel is not an error.
    pub async fn deliver(&self, assignment: MissionAssignment) -> DbResult<DeliveryPath> {
        let mission_id = assignment.mission.id;
        let agent_id = assignment.agent_id;
        inbox::push_inbox(&self.pool, mission_id, agent_id).await?;

        let sender = {
            let channels = self.channels.lock().expect("delivery channels poisoned");
            channels.get(&agent_id).cloned()
        };

        match sender {
            Some(tx) => match tx.try_send(assignment) {
                Ok(()) => Ok(DeliveryPath::Streamed),
                Err(err) => {
                    tracing::warn!(
                        mission_id = %mission_id,
                        agent_id,
                        error = %err,
                        "streaming send failed, inbox carries the assignment"
                    );
                    Ok(DeliveryPath::InboxOnly)
                }
            },
            None => Ok(DeliveryPath::InboxOnly),
        }
    }

    /// Acknowledge receipt: the agent has the mission, the inbox row is
    /// no longer needed.
    pub async fn acknowledge(&self, mission_id: Uuid) -> DbResult<()> {
        inbox::clear_inbox_entry(&self.pool, mission_id).await?;
        Ok(())
    }

    /// Record a progress checkpoint for a running mission.
    pub fn record_checkpoint(&self, mission_id: Uuid) {
        self.checkpoints.record(mission_id);
    }

    /// Drain an agent's inbox after a reconnect.
    ///
    /// For each carried mission that is back in `(queued, null execution
    /// id)` state -- which only happens after crash recovery released it --
    /// the same atomic claim is attempted with a fresh execution id.
    /// Entries whose mission is already running or terminal observe a
    /// failed claim and are cleaned up or left for the live execution.
    pub async fn redeliver_from_inbox(&self, agent_id: i64) -> DbResult<Vec<MissionAssignment>> {
        let entries = inbox::list_inbox_for_agent(&self.pool, agent_id).await?;
        let mut claimed = Vec::new();

        for entry in entries {
            let Some(mission) = mission_db::get_mission(&self.pool, entry.mission_id).await? else {
                inbox::clear_inbox_entry(&self.pool, entry.mission_id).await?;
                continue;
            };

            if mission.status.is_terminal() {
                inbox::clear_inbox_entry(&self.pool, mission.id).await?;
                continue;
            }
            if mission.status != MissionStatus::Queued || mission.execution_id.is_some() {
                // Still bound to a live execution; the streaming copy won.
                continue;
            }

            let execution_id = format!("exec_{}", Uuid::new_v4().simple());
            let outcome =
                mission_db::atomic_claim(&self.pool, mission.id, agent_id, &execution_id).await?;
            if !outcome.success {
                // Someone else claimed between the read and the update.
                continue;
            }

            tracing::info!(
                mission_id = %mission.id,
                agent_id,
                "mission redelivered from inbox"
            );
            let mut mission = mission;
            mission.status = MissionStatus::Running;
            mission.assigned_to = Some(agent_id);
            mission.execution_id = Some(execution_id.clone());
            claimed.push(MissionAssignment {
                mission,
                execution_id,
                agent_id,
            });
        }

        Ok(claimed)
    }
}
