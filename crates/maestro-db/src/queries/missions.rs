//! Query functions for the `missions` table, including the atomic claim
//! primitive the whole delivery protocol hangs off.

use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::DbResult;
use crate::models::{
    Mission, MissionFailure, MissionKind, MissionOutcome, MissionPriority, MissionStatus,
};

/// Fields supplied by the caller when admitting a new mission.
#[derive(Debug, Clone)]
pub struct NewMission {
    pub prompt: String,
    pub context: Option<String>,
    pub priority: MissionPriority,
    pub kind: MissionKind,
    pub status: MissionStatus,
    pub timeout_ms: i64,
    pub max_retries: i32,
    pub retry_delay_ms: i64,
    pub depends_on: Vec<Uuid>,
    pub parent_mission_id: Option<Uuid>,
    pub unified_task_id: Option<i64>,
}

/// Result of an [`atomic_claim`] attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimOutcome {
    pub success: bool,
    pub execution_id: Option<String>,
}

/// Insert a new mission row under a caller-chosen id.
pub async fn insert_mission(pool: &PgPool, id: Uuid, new: &NewMission) -> DbResult<Mission> {
    let mission = sqlx::query_as::<_, Mission>(
        "INSERT INTO missions (id, prompt, context, priority, kind, status, timeout_ms, \
                               max_retries, retry_delay_ms, depends_on, parent_mission_id, \
                               unified_task_id) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
         RETURNING *",
    )
    .bind(id)
    .bind(&new.prompt)
    .bind(&new.context)
    .bind(new.priority)
    .bind(new.kind)
    .bind(new.status)
    .bind(new.timeout_ms)
    .bind(new.max_retries)
    .bind(new.retry_delay_ms)
    .bind(&new.depends_on)
    .bind(new.parent_mission_id)
    .bind(new.unified_task_id)
    .fetch_one(pool)
    .await?;

    Ok(mission)
}

/// Fetch a single mission by id.
pub async fn get_mission(pool: &PgPool, id: Uuid) -> DbResult<Option<Mission>> {
    let mission = sqlx::query_as::<_, Mission>("SELECT * FROM missions WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    Ok(mission)
}

/// Load every mission that is not yet terminal, for startup recovery.
///
/// Rows in `running` are treated as interrupted by the caller and re-queued
/// via [`release_execution`].
pub async fn load_pending_missions(pool: &PgPool) -> DbResult<Vec<Mission>> {
    let missions = sqlx::query_as::<_, Mission>(
        "SELECT * FROM missions \
         WHERE status IN ('pending', 'queued', 'blocked', 'retrying', 'running') \
         ORDER BY created_at ASC",
    )
    .fetch_all(pool)
    .await?;

    Ok(missions)
}

/// Atomically claim a queued mission for an agent.
///
/// A single conditional UPDATE sets status to `running`, records the
/// assignee and the execution id, and stamps `started_at` -- but only if
/// the row is still `queued` with no execution id bound. Duplicate
/// attempts (redelivery, concurrent dispatchers) observe zero affected
/// rows and must silently yield.
pub async fn atomic_claim(
    pool: &PgPool,
    mission_id: Uuid,
    agent_id: i64,
    execution_id: &str,
) -> DbResult<ClaimOutcome> {
    let result = sqlx::query(
        "UPDATE missions \
         SET status = 'running', \
             assigned_to = $2, \
             execution_id = $3, \
             started_at = NOW() \
         WHERE id = $1 AND status = 'queued' AND execution_id IS NULL",
    )
    .bind(mission_id)
    .bind(agent_id)
    .bind(execution_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 1 {
        Ok(ClaimOutcome {
            success: true,
            execution_id: Some(execution_id.to_owned()),
        })
    } else {
        Ok(ClaimOutcome {
            success: false,
            execution_id: None,
        })
    }
}

/// Re-queue an interrupted `running` mission, clearing the assignment.
///
/// `execution_id = NULL` is the canonical released state: the next
/// [`atomic_claim`] mints a fresh execution id. Returns the number of
/// affected rows (0 when the row was not `running`).
pub async fn release_execution(pool: &PgPool, mission_id: Uuid) -> DbResult<u64> {
    let result = sqlx::query(
        "UPDATE missions \
         SET status = 'queued', \
             assigned_to = NULL, \
             started_at = NULL, \
             execution_id = NULL \
         WHERE id = $1 AND status = 'running'",
    )
    .bind(mission_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Unconditional status update. Prefer [`transition_status`] where the
/// prior state matters.
pub async fn update_status(pool: &PgPool, id: Uuid, status: MissionStatus) -> DbResult<u64> {
    let result = sqlx::query("UPDATE missions SET status = $1 WHERE id = $2")
        .bind(status)
        .bind(id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

/// Optimistically transition a mission from one status to another.
///
/// Returns the number of rows affected (0 means the status did not match).
pub async fn transition_status(
    pool: &PgPool,
    id: Uuid,
    from: MissionStatus,
    to: MissionStatus,
) -> DbResult<u64> {
    let result = sqlx::query("UPDATE missions SET status = $1 WHERE id = $2 AND status = $3")
        .bind(to)
        .bind(id)
        .bind(from)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

/// Record a completion. Guarded so the first completion wins: a mission
/// already terminal is left untouched (0 rows affected).
pub async fn record_completion(
    pool: &PgPool,
    id: Uuid,
    outcome: &MissionOutcome,
) -> DbResult<u64> {
    let result = sqlx::query(
        "UPDATE missions \
         SET status = 'completed', \
             result = $2, \
             completed_at = NOW() \
         WHERE id = $1 AND status IN ('queued', 'running')",
    )
    .bind(id)
    .bind(Json(outcome))
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Record a terminal failure.
pub async fn record_failure(pool: &PgPool, id: Uuid, failure: &MissionFailure) -> DbResult<u64> {
    let result = sqlx::query(
        "UPDATE missions \
         SET status = 'failed', \
             error = $2, \
             completed_at = NOW() \
         WHERE id = $1 AND status NOT IN ('completed', 'failed', 'cancelled')",
    )
    .bind(id)
    .bind(Json(failure))
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Move a mission into `retrying`, bumping the retry counter and keeping
/// the triggering error for diagnostics.
pub async fn mark_retrying(
    pool: &PgPool,
    id: Uuid,
    retry_count: i32,
    failure: &MissionFailure,
) -> DbResult<u64> {
    let result = sqlx::query(
        "UPDATE missions \
         SET status = 'retrying', \
             retry_count = $2, \
             error = $3 \
         WHERE id = $1 AND status NOT IN ('completed', 'failed', 'cancelled')",
    )
    .bind(id)
    .bind(retry_count)
    .bind(Json(failure))
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// After the backoff delay, put a `retrying` mission back in the queue
/// with a cleared assignment so it can be claimed afresh.
pub async fn requeue_after_retry(pool: &PgPool, id: Uuid) -> DbResult<u64> {
    let result = sqlx::query(
        "UPDATE missions \
         SET status = 'queued', \
             assigned_to = NULL, \
             started_at = NULL, \
             execution_id = NULL \
         WHERE id = $1 AND status = 'retrying'",
    )
    .bind(id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Cancel a mission that has not yet finished.
pub async fn cancel_mission(pool: &PgPool, id: Uuid) -> DbResult<u64> {
    let result = sqlx::query(
        "UPDATE missions \
         SET status = 'cancelled', \
             completed_at = NOW() \
         WHERE id = $1 AND status IN ('pending', 'queued', 'blocked', 'retrying', 'running')",
    )
    .bind(id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Update a mission's priority band.
pub async fn set_priority(pool: &PgPool, id: Uuid, priority: MissionPriority) -> DbResult<u64> {
    let result = sqlx::query("UPDATE missions SET priority = $1 WHERE id = $2")
        .bind(priority)
        .bind(id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

/// Replace a mission's timeout budget (used by additive extension).
pub async fn set_timeout_ms(pool: &PgPool, id: Uuid, timeout_ms: i64) -> DbResult<u64> {
    let result = sqlx::query("UPDATE missions SET timeout_ms = $1 WHERE id = $2")
        .bind(timeout_ms)
        .bind(id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

/// Override the fixed retry delay for a mission (0 = exponential backoff).
pub async fn set_retry_delay(pool: &PgPool, id: Uuid, delay_ms: i64) -> DbResult<u64> {
    let result = sqlx::query("UPDATE missions SET retry_delay_ms = $1 WHERE id = $2")
        .bind(delay_ms)
        .bind(id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

/// Replace the dependency set of a mission.
pub async fn set_dependencies(pool: &PgPool, id: Uuid, depends_on: &[Uuid]) -> DbResult<u64> {
    let result = sqlx::query("UPDATE missions SET depends_on = $1 WHERE id = $2")
        .bind(depends_on)
        .bind(id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

/// All blocked missions that name the given mission as a dependency.
pub async fn missions_depending_on(pool: &PgPool, id: Uuid) -> DbResult<Vec<Mission>> {
    let missions = sqlx::query_as::<_, Mission>(
        "SELECT * FROM missions WHERE $1 = ANY(depends_on) AND status = 'blocked'",
    )
    .bind(id)
    .fetch_all(pool)
    .await?;

    Ok(missions)
}

/// All missions linked to a unified task.
pub async fn missions_for_unified_task(pool: &PgPool, unified_task_id: i64) -> DbResult<Vec<Mission>> {
    let missions = sqlx::query_as::<_, Mission>(
        "SELECT * FROM missions WHERE unified_task_id = $1 ORDER BY created_at ASC",
    )
    .bind(unified_task_id)
    .fetch_all(pool)
    .await?;

    Ok(missions)
}

/// Status counts across the whole missions table, for the status surface.
pub async fn count_by_status(pool: &PgPool) -> DbResult<Vec<(MissionStatus, i64)>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status::text, COUNT(*) as cnt FROM missions GROUP BY status",
    )
    .fetch_all(pool)
    .await?;

    let mut counts = Vec::with_capacity(rows.len());
    for (status, count) in rows {
        if let Ok(parsed) = status.parse::<MissionStatus>() {
            counts.push((parsed, count));
        }
    }
    Ok(counts)
}
