//! Query functions for the `learnings` table plus the task-lineage rollup.

use sqlx::PgPool;
use uuid::Uuid;

use crate::DbResult;
use crate::models::{Confidence, ExecutionRow, Learning, LearningCategory, UnifiedTask};

/// Source links attached to a new learning.
#[derive(Debug, Clone, Default)]
pub struct LearningSource {
    pub session_id: Option<String>,
    pub task_id: Option<i64>,
    pub mission_id: Option<Uuid>,
    pub unified_task_id: Option<i64>,
    pub agent_id: Option<i64>,
}

/// A unified task's full lineage: the requirement itself, every execution
/// attempt, the learnings harvested along the way, and rollup stats.
#[derive(Debug, Clone)]
pub struct TaskLineage {
    pub requirement: UnifiedTask,
    pub executions: Vec<ExecutionRow>,
    pub learnings: Vec<Learning>,
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
    pub total_duration_ms: i64,
}

/// Insert a new learning.
pub async fn create_learning(
    pool: &PgPool,
    category: LearningCategory,
    title: &str,
    description: Option<&str>,
    confidence: Confidence,
    source: &LearningSource,
) -> DbResult<Learning> {
    let learning = sqlx::query_as::<_, Learning>(
        "INSERT INTO learnings (category, title, description, confidence, source_session_id, \
                                source_task_id, source_mission_id, source_unified_task_id, \
                                agent_id) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         RETURNING *",
    )
    .bind(category)
    .bind(title)
    .bind(description)
    .bind(confidence)
    .bind(&source.session_id)
    .bind(source.task_id)
    .bind(source.mission_id)
    .bind(source.unified_task_id)
    .bind(source.agent_id)
    .fetch_one(pool)
    .await?;

    Ok(learning)
}

/// Fetch a learning by id.
pub async fn get_learning_by_id(pool: &PgPool, id: i64) -> DbResult<Option<Learning>> {
    let learning = sqlx::query_as::<_, Learning>("SELECT * FROM learnings WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    Ok(learning)
}

/// Record a successful validation: bump the counter and promote confidence
/// one step (saturating at `proven`).
pub async fn validate_learning(pool: &PgPool, id: i64) -> DbResult<Option<Learning>> {
    let Some(current) = get_learning_by_id(pool, id).await? else {
        return Ok(None);
    };

    let learning = sqlx::query_as::<_, Learning>(
        "UPDATE learnings \
         SET validation_count = validation_count + 1, confidence = $2 \
         WHERE id = $1 \
         RETURNING *",
    )
    .bind(id)
    .bind(current.confidence.promoted())
    .fetch_one(pool)
    .await?;

    Ok(Some(learning))
}

/// Learnings linked to a given source task.
pub async fn get_learnings_by_task(pool: &PgPool, task_id: i64) -> DbResult<Vec<Learning>> {
    let learnings = sqlx::query_as::<_, Learning>(
        "SELECT * FROM learnings WHERE source_task_id = $1 ORDER BY created_at DESC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await?;

    Ok(learnings)
}

/// Learnings harvested from a given mission.
pub async fn get_learnings_by_mission(pool: &PgPool, mission_id: Uuid) -> DbResult<Vec<Learning>> {
    let learnings = sqlx::query_as::<_, Learning>(
        "SELECT * FROM learnings WHERE source_mission_id = $1 ORDER BY created_at DESC",
    )
    .bind(mission_id)
    .fetch_all(pool)
    .await?;

    Ok(learnings)
}

/// Most recent learnings at or above a confidence floor.
pub async fn recent_learnings(
    pool: &PgPool,
    min_confidence: Confidence,
    limit: i64,
) -> DbResult<Vec<Learning>> {
    // Confidence is stored as text, so rank it inline for the comparison.
    let learnings = sqlx::query_as::<_, Learning>(
        "SELECT * FROM learnings \
         WHERE CASE confidence \
                 WHEN 'proven' THEN 3 WHEN 'high' THEN 2 \
                 WHEN 'medium' THEN 1 ELSE 0 END \
               >= CASE $1 \
                 WHEN 'proven' THEN 3 WHEN 'high' THEN 2 \
                 WHEN 'medium' THEN 1 ELSE 0 END \
         ORDER BY created_at DESC \
         LIMIT $2",
    )
    .bind(min_confidence)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(learnings)
}

/// Demote stale learnings: anything older than the cutoff that has never
/// been validated drops one confidence step. Returns the demoted count.
pub async fn decay_stale(pool: &PgPool, older_than_days: i64) -> DbResult<u64> {
    let result = sqlx::query(
        "UPDATE learnings \
         SET confidence = CASE confidence \
             WHEN 'proven' THEN 'high' \
             WHEN 'high' THEN 'medium' \
             ELSE 'low' END \
         WHERE validation_count = 0 \
           AND confidence != 'low' \
           AND created_at < NOW() - ($1::int * INTERVAL '1 day')",
    )
    .bind(older_than_days)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Assemble the full lineage of a unified task.
pub async fn get_task_lineage(pool: &PgPool, unified_task_id: i64) -> DbResult<Option<TaskLineage>> {
    let Some(requirement) =
        super::unified_tasks::get_unified_task(pool, unified_task_id).await?
    else {
        return Ok(None);
    };

    let executions =
        super::executions::list_executions_for_unified_task(pool, unified_task_id).await?;

    let learnings = sqlx::query_as::<_, Learning>(
        "SELECT * FROM learnings WHERE source_unified_task_id = $1 ORDER BY created_at ASC",
    )
    .bind(unified_task_id)
    .fetch_all(pool)
    .await?;

    let total_input_tokens = executions.iter().filter_map(|e| e.input_tokens).sum();
    let total_output_tokens = executions.iter().filter_map(|e| e.output_tokens).sum();
    let total_duration_ms = executions.iter().filter_map(|e| e.duration_ms).sum();

    Ok(Some(TaskLineage {
        requirement,
        executions,
        learnings,
        total_input_tokens,
        total_output_tokens,
        total_duration_ms,
    }))
}
