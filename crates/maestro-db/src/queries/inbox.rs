//! Query functions for the durable delivery inbox.
//!
//! Inbox rows carry an assignment to an agent across streaming-channel
//! drops. They are advisory: actually starting work always goes through
//! `missions::atomic_claim`, so a stale inbox entry can never cause a
//! second execution.

use sqlx::PgPool;
use uuid::Uuid;

use crate::DbResult;
use crate::models::InboxRow;

/// Record an assignment in the inbox. Idempotent per mission.
pub async fn push_inbox(pool: &PgPool, mission_id: Uuid, agent_id: i64) -> DbResult<()> {
    sqlx::query(
        "INSERT INTO mission_inbox (mission_id, agent_id) VALUES ($1, $2) \
         ON CONFLICT (mission_id) DO UPDATE SET agent_id = $2, enqueued_at = NOW()",
    )
    .bind(mission_id)
    .bind(agent_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// All pending inbox entries addressed to an agent, oldest first.
pub async fn list_inbox_for_agent(pool: &PgPool, agent_id: i64) -> DbResult<Vec<InboxRow>> {
    let rows = sqlx::query_as::<_, InboxRow>(
        "SELECT * FROM mission_inbox WHERE agent_id = $1 ORDER BY enqueued_at ASC",
    )
    .bind(agent_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Drop an inbox entry once the agent has acknowledged the assignment.
pub async fn clear_inbox_entry(pool: &PgPool, mission_id: Uuid) -> DbResult<u64> {
    let result = sqlx::query("DELETE FROM mission_inbox WHERE mission_id = $1")
        .bind(mission_id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}
