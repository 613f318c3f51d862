//! Query functions for the `search_feedback` table.

use sqlx::PgPool;
use sqlx::types::Json;

use crate::DbResult;
use crate::models::{FeedbackOutcome, SearchFeedbackRow, SearchType};

/// Fields for a new feedback record.
#[derive(Debug, Clone)]
pub struct NewFeedback {
    pub query: String,
    pub search_type: SearchType,
    pub results_shown: Vec<String>,
    pub result_selected: Option<String>,
    pub result_expected: Option<String>,
    pub position_shown: Option<i32>,
    pub position_expected: Option<i32>,
    pub latency_ms: Option<i32>,
    pub feedback: FeedbackOutcome,
}

/// Insert a feedback record.
pub async fn insert_feedback(pool: &PgPool, new: &NewFeedback) -> DbResult<SearchFeedbackRow> {
    let row = sqlx::query_as::<_, SearchFeedbackRow>(
        "INSERT INTO search_feedback (query, search_type, results_shown, result_selected, \
                                      result_expected, position_shown, position_expected, \
                                      latency_ms, feedback) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         RETURNING *",
    )
    .bind(&new.query)
    .bind(new.search_type)
    .bind(Json(&new.results_shown))
    .bind(&new.result_selected)
    .bind(&new.result_expected)
    .bind(new.position_shown)
    .bind(new.position_expected)
    .bind(new.latency_ms)
    .bind(new.feedback)
    .fetch_one(pool)
    .await?;

    Ok(row)
}

/// Most recent feedback records, newest first.
pub async fn list_recent_feedback(pool: &PgPool, limit: i64) -> DbResult<Vec<SearchFeedbackRow>> {
    let rows = sqlx::query_as::<_, SearchFeedbackRow>(
        "SELECT * FROM search_feedback ORDER BY created_at DESC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
