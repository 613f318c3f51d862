//! Query functions for the `agent_tasks` table -- one row per execution
//! attempt, keyed by the opaque execution id minted at claim time.

use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::DbResult;
use crate::models::{ExecutionRow, Mission, MissionFailure, MissionOutcome, MissionStatus};

/// Insert a new execution row for a freshly claimed mission.
pub async fn insert_execution(
    pool: &PgPool,
    execution_id: &str,
    agent_id: i64,
    mission: &Mission,
    session_id: Option<&str>,
) -> DbResult<ExecutionRow> {
    let row = sqlx::query_as::<_, ExecutionRow>(
        "INSERT INTO agent_tasks (id, agent_id, parent_mission_id, prompt, context, priority, \
                                  status, unified_task_id, session_id, started_at) \
         VALUES ($1, $2, $3, $4, $5, $6, 'running', $7, $8, NOW()) \
         RETURNING *",
    )
    .bind(execution_id)
    .bind(agent_id)
    .bind(mission.id)
    .bind(&mission.prompt)
    .bind(&mission.context)
    .bind(mission.priority)
    .bind(mission.unified_task_id)
    .bind(session_id)
    .fetch_one(pool)
    .await?;

    Ok(row)
}

/// Close an execution with its final status and result/error payloads.
pub async fn finish_execution(
    pool: &PgPool,
    execution_id: &str,
    status: MissionStatus,
    result: Option<&MissionOutcome>,
    error: Option<&MissionFailure>,
) -> DbResult<u64> {
    let (input_tokens, output_tokens, duration_ms) = match result {
        Some(r) => (Some(r.input_tokens), Some(r.output_tokens), Some(r.duration_ms)),
        None => (None, None, None),
    };

    let res = sqlx::query(
        "UPDATE agent_tasks \
         SET status = $2, \
             result = $3, \
             error = $4, \
             input_tokens = $5, \
             output_tokens = $6, \
             duration_ms = $7, \
             completed_at = NOW() \
         WHERE id = $1 AND completed_at IS NULL",
    )
    .bind(execution_id)
    .bind(status)
    .bind(result.map(Json))
    .bind(error.map(Json))
    .bind(input_tokens)
    .bind(output_tokens)
    .bind(duration_ms)
    .execute(pool)
    .await?;

    Ok(res.rows_affected())
}

/// All execution attempts for a mission, oldest first.
pub async fn list_executions_for_mission(
    pool: &PgPool,
    mission_id: Uuid,
) -> DbResult<Vec<ExecutionRow>> {
    let rows = sqlx::query_as::<_, ExecutionRow>(
        "SELECT * FROM agent_tasks WHERE parent_mission_id = $1 ORDER BY created_at ASC",
    )
    .bind(mission_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// All execution attempts linked to a unified task.
pub async fn list_executions_for_unified_task(
    pool: &PgPool,
    unified_task_id: i64,
) -> DbResult<Vec<ExecutionRow>> {
    let rows = sqlx::query_as::<_, ExecutionRow>(
        "SELECT * FROM agent_tasks WHERE unified_task_id = $1 ORDER BY created_at ASC",
    )
    .bind(unified_task_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Total token usage across all executions of a unified task.
pub async fn token_usage_for_unified_task(
    pool: &PgPool,
    unified_task_id: i64,
) -> DbResult<(i64, i64)> {
    let row: (Option<i64>, Option<i64>) = sqlx::query_as(
        "SELECT SUM(input_tokens), SUM(output_tokens) \
         FROM agent_tasks WHERE unified_task_id = $1",
    )
    .bind(unified_task_id)
    .fetch_one(pool)
    .await?;

    Ok((row.0.unwrap_or(0), row.1.unwrap_or(0)))
}
