//! Query functions for the `agents` table.

use sqlx::PgPool;
use uuid::Uuid;

use crate::DbResult;
use crate::models::{AgentRole, AgentRow, AgentStatus, ModelTier};

/// Insert a new agent row in `starting` status. The id is server-assigned.
pub async fn insert_agent(
    pool: &PgPool,
    name: &str,
    role: AgentRole,
    model: ModelTier,
    worktree_path: Option<&str>,
) -> DbResult<AgentRow> {
    let agent = sqlx::query_as::<_, AgentRow>(
        "INSERT INTO agents (name, role, model, worktree_path) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(name)
    .bind(role)
    .bind(model)
    .bind(worktree_path)
    .fetch_one(pool)
    .await?;

    Ok(agent)
}

/// Fetch a single agent by id.
pub async fn get_agent(pool: &PgPool, id: i64) -> DbResult<Option<AgentRow>> {
    let agent = sqlx::query_as::<_, AgentRow>("SELECT * FROM agents WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    Ok(agent)
}

/// List every agent row, oldest first.
pub async fn list_agents(pool: &PgPool) -> DbResult<Vec<AgentRow>> {
    let agents = sqlx::query_as::<_, AgentRow>("SELECT * FROM agents ORDER BY created_at ASC")
        .fetch_all(pool)
        .await?;

    Ok(agents)
}

/// Update an agent's lifecycle status.
pub async fn update_agent_status(pool: &PgPool, id: i64, status: AgentStatus) -> DbResult<u64> {
    let result =
        sqlx::query("UPDATE agents SET status = $1, updated_at = NOW() WHERE id = $2")
            .bind(status)
            .bind(id)
            .execute(pool)
            .await?;

    Ok(result.rows_affected())
}

/// Record the OS pid of the agent's worker process.
pub async fn set_agent_pid(pool: &PgPool, id: i64, pid: Option<i32>) -> DbResult<u64> {
    let result = sqlx::query("UPDATE agents SET pid = $1, updated_at = NOW() WHERE id = $2")
        .bind(pid)
        .bind(id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

/// Bind (or clear) the mission an agent is currently working.
pub async fn set_current_mission(
    pool: &PgPool,
    id: i64,
    mission_id: Option<Uuid>,
    status: AgentStatus,
) -> DbResult<u64> {
    let result = sqlx::query(
        "UPDATE agents \
         SET current_mission_id = $1, status = $2, updated_at = NOW() \
         WHERE id = $3",
    )
    .bind(mission_id)
    .bind(status)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Roll a finished task into the agent's counters.
///
/// Counters only ever grow; the caller decides success vs failure.
pub async fn record_task_outcome(
    pool: &PgPool,
    id: i64,
    success: bool,
    duration_ms: i64,
) -> DbResult<u64> {
    let result = sqlx::query(
        "UPDATE agents \
         SET tasks_completed = tasks_completed + CASE WHEN $2 THEN 1 ELSE 0 END, \
             tasks_failed = tasks_failed + CASE WHEN $2 THEN 0 ELSE 1 END, \
             total_duration_ms = total_duration_ms + $3, \
             current_mission_id = NULL, \
             status = 'idle', \
             updated_at = NOW() \
         WHERE id = $1",
    )
    .bind(id)
    .bind(success)
    .bind(duration_ms)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Change an agent's role assignment.
pub async fn set_agent_role(pool: &PgPool, id: i64, role: AgentRole) -> DbResult<u64> {
    let result = sqlx::query("UPDATE agents SET role = $1, updated_at = NOW() WHERE id = $2")
        .bind(role)
        .bind(id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

/// Remove a retired agent's row.
pub async fn delete_agent(pool: &PgPool, id: i64) -> DbResult<u64> {
    let result = sqlx::query("DELETE FROM agents WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}
