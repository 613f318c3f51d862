//! Query functions for the `unified_tasks` table (business requirements).

use sqlx::PgPool;

use crate::DbResult;
use crate::models::{MissionPriority, MissionStatus, TaskDomain, UnifiedTask, UnifiedTaskStatus};

/// Insert a new unified task in `open` status.
pub async fn insert_unified_task(
    pool: &PgPool,
    title: &str,
    description: Option<&str>,
    domain: TaskDomain,
    priority: MissionPriority,
    component: Option<&str>,
    session_id: Option<&str>,
) -> DbResult<UnifiedTask> {
    let task = sqlx::query_as::<_, UnifiedTask>(
        "INSERT INTO unified_tasks (title, description, domain, priority, component, session_id) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING *",
    )
    .bind(title)
    .bind(description)
    .bind(domain)
    .bind(priority)
    .bind(component)
    .bind(session_id)
    .fetch_one(pool)
    .await?;

    Ok(task)
}

/// Fetch a unified task by id.
pub async fn get_unified_task(pool: &PgPool, id: i64) -> DbResult<Option<UnifiedTask>> {
    let task = sqlx::query_as::<_, UnifiedTask>("SELECT * FROM unified_tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    Ok(task)
}

/// Update a unified task's status.
pub async fn update_unified_task_status(
    pool: &PgPool,
    id: i64,
    status: UnifiedTaskStatus,
) -> DbResult<u64> {
    let result =
        sqlx::query("UPDATE unified_tasks SET status = $1, updated_at = NOW() WHERE id = $2")
            .bind(status)
            .bind(id)
            .execute(pool)
            .await?;

    Ok(result.rows_affected())
}

/// Close a unified task when every linked mission has completed.
///
/// Returns `true` when the task transitioned to `done`. A task with no
/// linked missions, or with any mission still open or failed, is left
/// untouched.
pub async fn close_if_missions_done(pool: &PgPool, id: i64) -> DbResult<bool> {
    let (total, completed): (i64, i64) = sqlx::query_as(
        "SELECT COUNT(*), \
                COUNT(*) FILTER (WHERE status = $2) \
         FROM missions WHERE unified_task_id = $1",
    )
    .bind(id)
    .bind(MissionStatus::Completed)
    .fetch_one(pool)
    .await?;

    if total == 0 || completed < total {
        return Ok(false);
    }

    let rows = sqlx::query(
        "UPDATE unified_tasks \
         SET status = 'done', updated_at = NOW() \
         WHERE id = $1 AND status != 'done'",
    )
    .bind(id)
    .execute(pool)
    .await?
    .rows_affected();

    Ok(rows == 1)
}
