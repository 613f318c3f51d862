//! The mission queue: ordered admission, priority scheduling, dependency
//! gating, retry with backoff, adaptive timeout enforcement, and crash
//! recovery.
//!
//! The queue owns an in-memory mirror of every non-terminal mission; all
//! mutations serialize through one critical section, and every state
//! transition persists through the gateway before the in-memory mirror is
//! updated. The atomic claim in the store remains the single serialization
//! point for at-most-once execution.

pub mod state;

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use maestro_db::models::{
    FailureKind, Mission, MissionFailure, MissionKind, MissionOutcome, MissionPriority,
    MissionStatus,
};
use maestro_db::queries::missions as db;

use crate::delivery::CheckpointClock;
use crate::error::QueueError;
use crate::retry::calculate_backoff;
use self::state::MissionStateMachine;

/// Tunables for the queue. Defaults match the documented configuration
/// surface.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Admission ceiling for the in-memory non-terminal population.
    pub max_queue_size: usize,
    /// Base delay for exponential retry backoff.
    pub retry_base_delay: Duration,
    /// Cap on the retry backoff before jitter.
    pub retry_max_delay: Duration,
    /// A checkpoint younger than this counts as recent progress.
    pub checkpoint_window: Duration,
    /// Auto-extend when elapsed time is within this much of the budget.
    pub timeout_slack: Duration,
    /// How much budget an auto-extension adds.
    pub timeout_extension: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1_000,
            retry_base_delay: Duration::from_millis(1_000),
            retry_max_delay: Duration::from_millis(60_000),
            checkpoint_window: Duration::from_secs(60),
            timeout_slack: Duration::from_secs(30),
            timeout_extension: Duration::from_secs(60),
        }
    }
}

/// Caller-supplied fields for a new mission.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub prompt: String,
    pub context: Option<String>,
    pub priority: MissionPriority,
    pub kind: MissionKind,
    pub timeout_ms: i64,
    pub max_retries: i32,
    pub retry_delay_ms: i64,
    pub depends_on: Vec<Uuid>,
    pub parent_mission_id: Option<Uuid>,
    pub unified_task_id: Option<i64>,
}

impl Default for EnqueueRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            context: None,
            priority: MissionPriority::Normal,
            kind: MissionKind::General,
            timeout_ms: 300_000,
            max_retries: 3,
            retry_delay_ms: 0,
            depends_on: Vec::new(),
            parent_mission_id: None,
            unified_task_id: None,
        }
    }
}

struct QueueInner {
    /// Every non-terminal mission plus recently-terminal ones awaiting
    /// cleanup.
    missions: HashMap<Uuid, Mission>,
    /// Dispatch order: priority bands, FIFO within a band. Only `queued`
    /// missions appear here.
    ready: Vec<Uuid>,
    /// Pending re-queue timers, abortable on cancellation.
    retry_timers: HashMap<Uuid, JoinHandle<()>>,
    /// The timeout enforcer, when started.
    enforcer: Option<(CancellationToken, JoinHandle<()>)>,
}

/// Priority-ordered mission queue with durable backing.
#[derive(Clone)]
pub struct MissionQueue {
    pool: PgPool,
    inner: Arc<Mutex<QueueInner>>,
    config: Arc<QueueConfig>,
}

impl MissionQueue {
    pub fn new(pool: PgPool, config: QueueConfig) -> Self {
        Self {
            pool,
            inner: Arc::new(Mutex::new(QueueInner {
                missions: HashMap::new(),
                ready: Vec::new(),
                retry_timers: HashMap::new(),
                enforcer: None,
            })),
            config: Arc::new(config),
        }
    }

    /// Handle to the underlying pool, for components that share it.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // -----------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------

    /// Admit a new mission. Returns its id.
    ///
    /// Rejects with [`QueueError::Full`] when the in-memory population is
    /// at the ceiling (backpressure, not truncation), and with
    /// [`QueueError::Validation`] for malformed fields. A mission whose
    /// dependencies are not all completed is admitted as `blocked`.
    pub async fn enqueue(&self, req: EnqueueRequest) -> Result<Uuid, QueueError> {
        if req.prompt.trim().is_empty() {
            return Err(QueueError::Validation("prompt must not be empty".into()));
        }
        if req.timeout_ms <= 0 {
            return Err(QueueError::Validation("timeout_ms must be positive".into()));
        }
        if req.max_retries < 0 {
            return Err(QueueError::Validation("max_retries must be >= 0".into()));
        }

        let mut depends_on = req.depends_on.clone();
        depends_on.sort();
        depends_on.dedup();

        let mut inner = self.inner.lock().await;

        let live = inner
            .missions
            .values()
            .filter(|m| !m.status.is_terminal())
            .count();
        if live >= self.config.max_queue_size {
            return Err(QueueError::Full {
                limit: self.config.max_queue_size,
            });
        }

        // A fresh node cannot close a cycle, but its dependencies must
        // exist and must not be the mission itself.
        let id = Uuid::new_v4();
        let mut all_deps_completed = true;
        for dep in &depends_on {
            if *dep == id {
                return Err(QueueError::DependencyCycle { mission_id: id });
            }
            let dep_status = match inner.missions.get(dep) {
                Some(m) => Some(m.status),
                None => db::get_mission(&self.pool, *dep).await?.map(|m| m.status),
            };
            match dep_status {
                Some(MissionStatus::Completed) => {}
                Some(_) => all_deps_completed = false,
                None => {
                    return Err(QueueError::Validation(format!("unknown dependency {dep}")));
                }
            }
        }

        let status = if all_deps_completed {
            MissionStatus::Queued
        } else {
            MissionStatus::Blocked
        };

        let mission = db::insert_mission(
            &self.pool,
            id,
            &db::NewMission {
                prompt: req.prompt,
                context: req.context,
                priority: req.priority,
                kind: req.kind,
                status,
                timeout_ms: req.timeout_ms,
                max_retries: req.max_retries,
                retry_delay_ms: req.retry_delay_ms,
                depends_on,
                parent_mission_id: req.parent_mission_id,
                unified_task_id: req.unified_task_id,
            },
        )
        .await?;

        tracing::info!(
            mission_id = %id,
            priority = %mission.priority,
            status = %mission.status,
            "mission admitted"
        );

        inner.missions.insert(id, mission);
        if status == MissionStatus::Queued {
            priority_insert(&mut inner, id);
        }

        Ok(id)
    }

    // -----------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------

    /// Claim the highest-priority ready mission for an agent.
    ///
    /// Walks the ready list in priority order and issues the store-side
    /// atomic claim for the first eligible mission. A mission claimed
    /// elsewhere in the meantime is skipped. Returns `None` when nothing
    /// is eligible; never waits for work to arrive.
    pub async fn dequeue(&self, agent_id: i64) -> Result<Option<Mission>, QueueError> {
        let mut inner = self.inner.lock().await;

        let candidates: Vec<Uuid> = inner.ready.clone();
        for id in candidates {
            let Some(mission) = inner.missions.get(&id) else {
                inner.ready.retain(|m| *m != id);
                continue;
            };
            if mission.status != MissionStatus::Queued || !deps_completed(&inner, mission) {
                continue;
            }

            let execution_id = fresh_execution_id();
            let outcome = db::atomic_claim(&self.pool, id, agent_id, &execution_id).await?;

            inner.ready.retain(|m| *m != id);
            if !outcome.success {
                // Claimed elsewhere (redelivery or a competing dispatcher);
                // resync our mirror and keep walking.
                tracing::warn!(mission_id = %id, "lost claim race, skipping");
                if let Some(row) = db::get_mission(&self.pool, id).await? {
                    inner.missions.insert(id, row);
                }
                continue;
            }

            let mission = inner.missions.get_mut(&id).expect("checked above");
            mission.status = MissionStatus::Running;
            mission.assigned_to = Some(agent_id);
            mission.execution_id = Some(execution_id);
            mission.started_at = Some(Utc::now());

            tracing::info!(
                mission_id = %id,
                agent_id,
                execution_id = mission.execution_id.as_deref().unwrap_or(""),
                "mission claimed"
            );
            return Ok(Some(mission.clone()));
        }

        Ok(None)
    }

    /// The mission `dequeue` would hand out next, without claiming it.
    pub async fn peek(&self) -> Option<Mission> {
        let inner = self.inner.lock().await;
        for id in &inner.ready {
            if let Some(mission) = inner.missions.get(id) {
                if mission.status == MissionStatus::Queued && deps_completed(&inner, mission) {
                    return Some(mission.clone());
                }
            }
        }
        None
    }

    // -----------------------------------------------------------------
    // Completion / failure / retry
    // -----------------------------------------------------------------

    /// Record a completion and unblock any dependents whose last
    /// dependency this was. Idempotent on the first completion.
    pub async fn complete(&self, id: Uuid, outcome: MissionOutcome) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let mission = inner.missions.get(&id).ok_or(QueueError::NotFound(id))?;

        match mission.status {
            MissionStatus::Completed => return Ok(()),
            MissionStatus::Failed | MissionStatus::Cancelled => {
                return Err(QueueError::InvalidTransition {
                    mission_id: id,
                    from: mission.status,
                    to: MissionStatus::Completed,
                });
            }
            _ => {}
        }

        db::record_completion(&self.pool, id, &outcome).await?;

        let mission = inner.missions.get_mut(&id).expect("checked above");
        mission.status = MissionStatus::Completed;
        mission.result = Some(sqlx::types::Json(outcome));
        mission.completed_at = Some(Utc::now());
        tracing::info!(mission_id = %id, "mission completed");

        self.unblock_dependents(&mut inner, id).await?;
        Ok(())
    }

    /// Record a failure. Recoverable failures with retry budget left are
    /// delegated to [`Self::retry`]; everything else is terminal.
    pub async fn fail(&self, id: Uuid, failure: MissionFailure) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let mission = inner.missions.get(&id).ok_or(QueueError::NotFound(id))?;

        match mission.status {
            MissionStatus::Failed => return Ok(()),
            MissionStatus::Completed | MissionStatus::Cancelled => {
                return Err(QueueError::InvalidTransition {
                    mission_id: id,
                    from: mission.status,
                    to: MissionStatus::Failed,
                });
            }
            _ => {}
        }

        if failure.recoverable && mission.retry_count < mission.max_retries {
            self.schedule_retry(&mut inner, id, failure).await
        } else {
            self.fail_terminal(&mut inner, id, failure).await
        }
    }

    /// Force another attempt regardless of what failed; still respects the
    /// retry budget.
    pub async fn retry(&self, id: Uuid, reason: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let mission = inner.missions.get(&id).ok_or(QueueError::NotFound(id))?;
        if mission.status.is_terminal() {
            return Err(QueueError::InvalidTransition {
                mission_id: id,
                from: mission.status,
                to: MissionStatus::Retrying,
            });
        }

        let failure = MissionFailure::new(FailureKind::Unknown, reason);
        if mission.retry_count >= mission.max_retries {
            self.fail_terminal(&mut inner, id, failure).await
        } else {
            self.schedule_retry(&mut inner, id, failure).await
        }
    }

    async fn fail_terminal(
        &self,
        inner: &mut QueueInner,
        id: Uuid,
        failure: MissionFailure,
    ) -> Result<(), QueueError> {
        db::record_failure(&self.pool, id, &failure).await?;

        let mission = inner.missions.get_mut(&id).expect("caller checked");
        mission.status = MissionStatus::Failed;
        mission.error = Some(sqlx::types::Json(failure));
        mission.completed_at = Some(Utc::now());
        inner.ready.retain(|m| *m != id);

        tracing::warn!(mission_id = %id, "mission failed terminally");
        Ok(())
    }

    async fn schedule_retry(
        &self,
        inner: &mut QueueInner,
        id: Uuid,
        failure: MissionFailure,
    ) -> Result<(), QueueError> {
        let mission = inner.missions.get_mut(&id).expect("caller checked");
        mission.retry_count += 1;
        mission.status = MissionStatus::Retrying;
        mission.error = Some(sqlx::types::Json(failure.clone()));
        let retry_count = mission.retry_count;
        let fixed_delay = mission.retry_delay_ms;
        inner.ready.retain(|m| *m != id);

        db::mark_retrying(&self.pool, id, retry_count, &failure).await?;

        let delay = if fixed_delay > 0 {
            Duration::from_millis(fixed_delay as u64)
        } else {
            calculate_backoff(
                retry_count as u32,
                self.config.retry_base_delay,
                self.config.retry_max_delay,
                0.25,
            )
        };

        tracing::info!(
            mission_id = %id,
            retry_count,
            delay_ms = delay.as_millis() as u64,
            kind = %failure.kind,
            "mission scheduled for retry"
        );

        let queue = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = queue.finish_retry(id).await {
                tracing::warn!(mission_id = %id, error = %err, "retry re-queue failed");
            }
        });
        if let Some(old) = inner.retry_timers.insert(id, handle) {
            old.abort();
        }
        Ok(())
    }

    /// Timer body: after the backoff delay, put a still-`retrying` mission
    /// back at the head of its priority band with a cleared assignment.
    async fn finish_retry(&self, id: Uuid) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        inner.retry_timers.remove(&id);

        let Some(mission) = inner.missions.get(&id) else {
            return Ok(());
        };
        if mission.status != MissionStatus::Retrying {
            return Ok(());
        }

        let rows = db::requeue_after_retry(&self.pool, id).await?;
        if rows == 0 {
            // The row moved on (e.g. cancelled) while we slept.
            return Ok(());
        }

        let mission = inner.missions.get_mut(&id).expect("checked above");
        mission.status = MissionStatus::Queued;
        mission.assigned_to = None;
        mission.started_at = None;
        mission.execution_id = None;
        priority_insert_front(&mut inner, id);

        tracing::info!(mission_id = %id, "mission re-queued after backoff");
        Ok(())
    }

    async fn unblock_dependents(
        &self,
        inner: &mut QueueInner,
        completed: Uuid,
    ) -> Result<(), QueueError> {
        let dependents: Vec<Uuid> = inner
            .missions
            .values()
            .filter(|m| m.status == MissionStatus::Blocked && m.depends_on.contains(&completed))
            .filter(|m| deps_completed(inner, m))
            .map(|m| m.id)
            .collect();

        for dep_id in dependents {
            let rows = db::transition_status(
                &self.pool,
                dep_id,
                MissionStatus::Blocked,
                MissionStatus::Queued,
            )
            .await?;
            if rows == 0 {
                continue;
            }
            if let Some(m) = inner.missions.get_mut(&dep_id) {
                m.status = MissionStatus::Queued;
            }
            priority_insert(inner, dep_id);
            tracing::info!(mission_id = %dep_id, "mission unblocked");
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Dependency management
    // -----------------------------------------------------------------

    /// Link `id` to depend on `dep`. Rejects edges that would close a
    /// cycle; a queued mission whose new dependency is incomplete moves
    /// to `blocked`.
    pub async fn add_dependency(&self, id: Uuid, dep: Uuid) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        if !inner.missions.contains_key(&id) {
            return Err(QueueError::NotFound(id));
        }
        if id == dep || creates_cycle(&inner, id, dep) {
            return Err(QueueError::DependencyCycle { mission_id: id });
        }

        let dep_completed = match inner.missions.get(&dep) {
            Some(m) => m.status == MissionStatus::Completed,
            None => match db::get_mission(&self.pool, dep).await? {
                Some(m) => m.status == MissionStatus::Completed,
                None => return Err(QueueError::NotFound(dep)),
            },
        };

        let mission = inner.missions.get_mut(&id).expect("checked above");
        if !mission.depends_on.contains(&dep) {
            mission.depends_on.push(dep);
        }
        let depends_on = mission.depends_on.clone();
        let was_queued = mission.status == MissionStatus::Queued;
        db::set_dependencies(&self.pool, id, &depends_on).await?;

        if was_queued && !dep_completed {
            db::transition_status(&self.pool, id, MissionStatus::Queued, MissionStatus::Blocked)
                .await?;
            let mission = inner.missions.get_mut(&id).expect("checked above");
            mission.status = MissionStatus::Blocked;
            inner.ready.retain(|m| *m != id);
        }
        Ok(())
    }

    /// Remove a dependency edge; a blocked mission whose remaining
    /// dependencies are all complete returns to `queued`.
    pub async fn remove_dependency(&self, id: Uuid, dep: Uuid) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let mission = inner.missions.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        mission.depends_on.retain(|d| *d != dep);
        let depends_on = mission.depends_on.clone();
        db::set_dependencies(&self.pool, id, &depends_on).await?;

        let mission = inner.missions.get(&id).expect("checked above");
        if mission.status == MissionStatus::Blocked && deps_completed(&inner, mission) {
            let rows = db::transition_status(
                &self.pool,
                id,
                MissionStatus::Blocked,
                MissionStatus::Queued,
            )
            .await?;
            if rows == 1 {
                inner.missions.get_mut(&id).expect("checked above").status =
                    MissionStatus::Queued;
                priority_insert(&mut inner, id);
            }
        }
        Ok(())
    }

    /// Whether the mission is queued with every dependency completed.
    pub async fn is_ready(&self, id: Uuid) -> bool {
        let inner = self.inner.lock().await;
        inner
            .missions
            .get(&id)
            .map(|m| m.status == MissionStatus::Queued && deps_completed(&inner, m))
            .unwrap_or(false)
    }

    // -----------------------------------------------------------------
    // Introspection and small mutations
    // -----------------------------------------------------------------

    pub async fn get_mission(&self, id: Uuid) -> Option<Mission> {
        self.inner.lock().await.missions.get(&id).cloned()
    }

    pub async fn get_blocked(&self) -> Vec<Mission> {
        self.get_by_status(MissionStatus::Blocked).await
    }

    pub async fn get_by_status(&self, status: MissionStatus) -> Vec<Mission> {
        let inner = self.inner.lock().await;
        inner
            .missions
            .values()
            .filter(|m| m.status == status)
            .cloned()
            .collect()
    }

    pub async fn get_by_priority(&self, priority: MissionPriority) -> Vec<Mission> {
        let inner = self.inner.lock().await;
        inner
            .missions
            .values()
            .filter(|m| m.priority == priority)
            .cloned()
            .collect()
    }

    pub async fn get_retry_count(&self, id: Uuid) -> Option<i32> {
        let inner = self.inner.lock().await;
        inner.missions.get(&id).map(|m| m.retry_count)
    }

    /// Number of missions currently dispatchable.
    pub async fn queued_depth(&self) -> usize {
        let inner = self.inner.lock().await;
        inner
            .missions
            .values()
            .filter(|m| m.status == MissionStatus::Queued)
            .count()
    }

    /// Snapshot of every tracked mission, for the oracle.
    pub async fn snapshot(&self) -> Vec<Mission> {
        let inner = self.inner.lock().await;
        inner.missions.values().cloned().collect()
    }

    /// Move a mission to a new priority band (tail of the band).
    pub async fn set_priority(
        &self,
        id: Uuid,
        priority: MissionPriority,
    ) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let mission = inner.missions.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        if mission.priority == priority {
            return Ok(());
        }
        mission.priority = priority;
        db::set_priority(&self.pool, id, priority).await?;

        if inner.ready.contains(&id) {
            inner.ready.retain(|m| *m != id);
            priority_insert(&mut inner, id);
        }
        Ok(())
    }

    /// Explicit status update for transitions not covered by the dedicated
    /// operations. Validated against the state graph.
    pub async fn update_status(&self, id: Uuid, to: MissionStatus) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let mission = inner.missions.get(&id).ok_or(QueueError::NotFound(id))?;
        let from = mission.status;
        if !MissionStateMachine::is_valid_transition(from, to) {
            return Err(QueueError::InvalidTransition {
                mission_id: id,
                from,
                to,
            });
        }
        db::update_status(&self.pool, id, to).await?;
        let mission = inner.missions.get_mut(&id).expect("checked above");
        mission.status = to;
        match to {
            MissionStatus::Queued => priority_insert(&mut inner, id),
            _ => inner.ready.retain(|m| *m != id),
        }
        Ok(())
    }

    /// Additive extension of an in-flight mission's timeout budget.
    pub async fn extend_timeout(&self, id: Uuid, additional_ms: i64) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let mission = inner.missions.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        mission.timeout_ms += additional_ms;
        let timeout_ms = mission.timeout_ms;
        db::set_timeout_ms(&self.pool, id, timeout_ms).await?;
        tracing::debug!(mission_id = %id, timeout_ms, "timeout extended");
        Ok(())
    }

    /// Fix the retry delay for a mission (0 restores exponential backoff).
    pub async fn set_retry_delay(&self, id: Uuid, delay_ms: i64) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let mission = inner.missions.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        mission.retry_delay_ms = delay_ms;
        db::set_retry_delay(&self.pool, id, delay_ms).await?;
        Ok(())
    }

    /// Cancel a mission. Aborts any pending retry timer and returns the
    /// agent the mission was assigned to, if any, so the caller can signal
    /// it. Cancelling an already-cancelled mission is a no-op.
    pub async fn cancel(&self, id: Uuid) -> Result<Option<i64>, QueueError> {
        let mut inner = self.inner.lock().await;
        let mission = inner.missions.get(&id).ok_or(QueueError::NotFound(id))?;

        match mission.status {
            MissionStatus::Cancelled => return Ok(None),
            MissionStatus::Completed | MissionStatus::Failed => {
                return Err(QueueError::InvalidTransition {
                    mission_id: id,
                    from: mission.status,
                    to: MissionStatus::Cancelled,
                });
            }
            _ => {}
        }

        db::cancel_mission(&self.pool, id).await?;
        if let Some(timer) = inner.retry_timers.remove(&id) {
            timer.abort();
        }
        inner.ready.retain(|m| *m != id);

        let mission = inner.missions.get_mut(&id).expect("checked above");
        mission.status = MissionStatus::Cancelled;
        mission.completed_at = Some(Utc::now());
        tracing::info!(mission_id = %id, "mission cancelled");
        Ok(mission.assigned_to)
    }

    /// Refresh one mission's in-memory mirror from the store.
    ///
    /// Used after out-of-band claims (inbox redelivery) so the dispatch
    /// order stays consistent with the row state.
    pub async fn sync_mission(&self, id: Uuid) -> Result<(), QueueError> {
        let row = db::get_mission(&self.pool, id).await?;
        let mut inner = self.inner.lock().await;
        match row {
            Some(mission) => {
                let queued = mission.status == MissionStatus::Queued;
                inner.missions.insert(id, mission);
                if queued {
                    priority_insert(&mut inner, id);
                } else {
                    inner.ready.retain(|m| *m != id);
                }
            }
            None => {
                inner.missions.remove(&id);
                inner.ready.retain(|m| *m != id);
            }
        }
        Ok(())
    }

    /// Drop in-memory records of terminal missions older than the
    /// threshold. Persisted rows remain untouched.
    pub async fn cleanup(&self, older_than: Duration) {
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or_default();
        let mut inner = self.inner.lock().await;
        let before = inner.missions.len();
        inner.missions.retain(|_, m| {
            !(m.status.is_terminal() && m.completed_at.map(|t| t < cutoff).unwrap_or(false))
        });
        let dropped = before - inner.missions.len();
        if dropped > 0 {
            tracing::debug!(dropped, "cleaned up terminal missions");
        }
    }

    // -----------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------

    /// Rebuild the in-memory state from the store at startup.
    ///
    /// Missions recovered in `running` were interrupted mid-execution:
    /// their assignment is released (`execution_id = NULL` persisted) and
    /// they re-enter the queue so the next claim mints a fresh execution
    /// id. Orphaned `retrying` rows lost their timers with the old
    /// process, so they re-queue immediately.
    pub async fn load_from_db(&self) -> Result<usize, QueueError> {
        let rows = db::load_pending_missions(&self.pool).await?;
        let mut inner = self.inner.lock().await;

        let mut recovered = 0;
        for mut mission in rows {
            match mission.status {
                MissionStatus::Running => {
                    db::release_execution(&self.pool, mission.id).await?;
                    mission.status = MissionStatus::Queued;
                    mission.assigned_to = None;
                    mission.started_at = None;
                    mission.execution_id = None;
                    tracing::warn!(mission_id = %mission.id, "recovered interrupted mission");
                }
                MissionStatus::Retrying => {
                    db::requeue_after_retry(&self.pool, mission.id).await?;
                    mission.status = MissionStatus::Queued;
                    mission.assigned_to = None;
                    mission.started_at = None;
                    mission.execution_id = None;
                    tracing::warn!(mission_id = %mission.id, "recovered mission with lost retry timer");
                }
                _ => {}
            }
            recovered += 1;
            inner.missions.insert(mission.id, mission);
        }

        // A crash between a completion and its dependent-unblock scan can
        // leave a blocked row whose dependencies are all completed (the
        // completed rows are terminal and were not reloaded). Settle those
        // now so they are not stranded.
        let blocked: Vec<(Uuid, Vec<Uuid>)> = inner
            .missions
            .values()
            .filter(|m| m.status == MissionStatus::Blocked)
            .map(|m| (m.id, m.depends_on.clone()))
            .collect();
        for (id, deps) in blocked {
            let mut all_completed = true;
            for dep in deps {
                let status = match inner.missions.get(&dep) {
                    Some(m) => Some(m.status),
                    None => db::get_mission(&self.pool, dep).await?.map(|m| m.status),
                };
                if status != Some(MissionStatus::Completed) {
                    all_completed = false;
                    break;
                }
            }
            if all_completed {
                let rows = db::transition_status(
                    &self.pool,
                    id,
                    MissionStatus::Blocked,
                    MissionStatus::Queued,
                )
                .await?;
                if rows == 1 {
                    if let Some(m) = inner.missions.get_mut(&id) {
                        m.status = MissionStatus::Queued;
                    }
                    tracing::info!(mission_id = %id, "unblocked stranded mission during recovery");
                }
            }
        }

        // Rebuild dispatch order: priority bands, oldest first within a band.
        let mut queued: Vec<(u8, chrono::DateTime<Utc>, Uuid)> = inner
            .missions
            .values()
            .filter(|m| m.status == MissionStatus::Queued)
            .map(|m| (m.priority.rank(), m.created_at, m.id))
            .collect();
        queued.sort_by_key(|(rank, created_at, _)| (*rank, *created_at));
        inner.ready = queued.into_iter().map(|(_, _, id)| id).collect();

        tracing::info!(recovered, "mission queue recovered from store");
        Ok(recovered)
    }

    // -----------------------------------------------------------------
    // Timeout enforcement
    // -----------------------------------------------------------------

    /// Start the periodic timeout scan. Replaces any previous enforcer.
    pub async fn start_timeout_enforcement(
        &self,
        checkpoints: CheckpointClock,
        interval: Duration,
    ) {
        let token = CancellationToken::new();
        let queue = self.clone();
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        queue.enforce_timeouts(&checkpoints).await;
                    }
                }
            }
        });

        let mut inner = self.inner.lock().await;
        if let Some((old_token, old_handle)) = inner.enforcer.replace((token, handle)) {
            old_token.cancel();
            old_handle.abort();
        }
    }

    /// Stop the timeout enforcer if it is running.
    pub async fn stop_timeout_enforcement(&self) {
        let mut inner = self.inner.lock().await;
        if let Some((token, handle)) = inner.enforcer.take() {
            token.cancel();
            handle.abort();
        }
    }

    /// One enforcement pass: auto-extend missions that show recent
    /// checkpoint activity near their deadline, fail the rest once they
    /// run over budget (recoverable `timeout`).
    pub async fn enforce_timeouts(&self, checkpoints: &CheckpointClock) {
        let running: Vec<(Uuid, chrono::DateTime<Utc>, i64)> = {
            let inner = self.inner.lock().await;
            inner
                .missions
                .values()
                .filter(|m| m.status == MissionStatus::Running)
                .filter_map(|m| m.started_at.map(|s| (m.id, s, m.timeout_ms)))
                .collect()
        };

        let now = Utc::now();
        let slack_ms = self.config.timeout_slack.as_millis() as i64;
        for (id, started_at, timeout_ms) in running {
            let elapsed_ms = (now - started_at).num_milliseconds();
            let making_progress = checkpoints.has_recent(id, self.config.checkpoint_window);

            if making_progress && elapsed_ms + slack_ms >= timeout_ms {
                let extension = self.config.timeout_extension.as_millis() as i64;
                if let Err(err) = self.extend_timeout(id, extension).await {
                    tracing::warn!(mission_id = %id, error = %err, "auto-extension failed");
                } else {
                    tracing::info!(mission_id = %id, "auto-extended timeout near deadline");
                }
            } else if elapsed_ms > timeout_ms {
                let failure = MissionFailure::new(
                    FailureKind::Timeout,
                    format!("exceeded budget of {timeout_ms} ms"),
                );
                if let Err(err) = self.fail(id, failure).await {
                    tracing::warn!(mission_id = %id, error = %err, "timeout failure not recorded");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Free helpers over the locked state
// ---------------------------------------------------------------------------

fn fresh_execution_id() -> String {
    format!("exec_{}", Uuid::new_v4().simple())
}

/// A dependency absent from the mirror was terminal and cleaned up, which
/// only happens after completion; treat it as satisfied.
fn deps_completed(inner: &QueueInner, mission: &Mission) -> bool {
    mission.depends_on.iter().all(|dep| {
        inner
            .missions
            .get(dep)
            .map(|m| m.status == MissionStatus::Completed)
            .unwrap_or(true)
    })
}

/// Insert at the tail of the mission's priority band.
fn priority_insert(inner: &mut QueueInner, id: Uuid) {
    if inner.ready.contains(&id) {
        return;
    }
    let Some(rank) = inner.missions.get(&id).map(|m| m.priority.rank()) else {
        return;
    };
    let missions = &inner.missions;
    let pos = inner
        .ready
        .iter()
        .position(|other| missions.get(other).map_or(u8::MAX, |m| m.priority.rank()) > rank)
        .unwrap_or(inner.ready.len());
    inner.ready.insert(pos, id);
}

/// Insert at the head of the mission's priority band (re-queued retries).
fn priority_insert_front(inner: &mut QueueInner, id: Uuid) {
    if inner.ready.contains(&id) {
        return;
    }
    let Some(rank) = inner.missions.get(&id).map(|m| m.priority.rank()) else {
        return;
    };
    let missions = &inner.missions;
    let pos = inner
        .ready
        .iter()
        .position(|other| missions.get(other).map_or(u8::MAX, |m| m.priority.rank()) >= rank)
        .unwrap_or(inner.ready.len());
    inner.ready.insert(pos, id);
}

/// Would adding the edge `from -> dep` close a cycle in the dependency
/// graph? DFS from `dep` looking for `from`, with a visited set so broken
/// data cannot loop us.
fn creates_cycle(inner: &QueueInner, from: Uuid, dep: Uuid) -> bool {
    let mut stack = vec![dep];
    let mut visited = std::collections::HashSet::new();
    while let Some(current) = stack.pop() {
        if current == from {
            return true;
        }
        if !visited.insert(current) {
            continue;
        }
        if let Some(mission) = inner.missions.get(&current) {
            stack.extend(mission.depends_on.iter().copied());
        }
    }
    false
}
