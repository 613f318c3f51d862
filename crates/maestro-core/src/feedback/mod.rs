//! The search-feedback loop: records per-query retrieval outcomes,
//! computes aggregate quality metrics, and tunes the hybrid retrieval
//! weights from observed vector-vs-keyword wins.

use std::future::Future;
use std::sync::Mutex;

use sqlx::PgPool;

use maestro_db::DbResult;
use maestro_db::models::{FeedbackOutcome, SearchFeedbackRow, SearchType};
use maestro_db::queries::feedback as db;
pub use maestro_db::queries::feedback::NewFeedback;

use crate::index::SearchHit;

/// How far one recommendation may move the weights.
const MAX_SHIFT: f64 = 0.3;
/// Weight bounds; neither retrieval mode is ever fully shut off.
const MIN_WEIGHT: f64 = 0.2;
const MAX_WEIGHT: f64 = 0.8;
/// Sample count at which confidence saturates.
const CONFIDENCE_SATURATION: usize = 20;

/// Aggregate retrieval quality over a set of feedback rows.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackMetrics {
    pub samples: usize,
    /// relevant / (relevant + irrelevant)
    pub precision: Option<f64>,
    /// relevant / (relevant + miss)
    pub recall_estimate: Option<f64>,
    /// mean of 1 / position_shown
    pub mean_reciprocal_rank: Option<f64>,
}

/// Current hybrid weights; always sums to 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HybridWeights {
    pub vector: f64,
    pub keyword: f64,
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self {
            vector: 0.5,
            keyword: 0.5,
        }
    }
}

/// A tuning recommendation.
#[derive(Debug, Clone)]
pub struct WeightRecommendation {
    pub weights: HybridWeights,
    pub confidence: f64,
    pub reason: String,
}

/// One case for [`FeedbackLoop::run_validation_tests`].
#[derive(Debug, Clone)]
pub struct ValidationCase {
    pub query: String,
    /// Key the retrieval is expected to surface.
    pub expected_key: String,
}

/// Outcome of a validation run.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub passed: usize,
    pub failed: usize,
    pub mean_reciprocal_rank: Option<f64>,
}

/// The feedback loop.
pub struct FeedbackLoop {
    pool: PgPool,
    weights: Mutex<HybridWeights>,
}

impl FeedbackLoop {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            weights: Mutex::new(HybridWeights::default()),
        }
    }

    /// Persist one feedback record.
    pub async fn record(&self, feedback: &NewFeedback) -> DbResult<SearchFeedbackRow> {
        db::insert_feedback(&self.pool, feedback).await
    }

    /// Current hybrid weights.
    pub fn current_weights(&self) -> HybridWeights {
        *self.weights.lock().expect("weights poisoned")
    }

    /// Aggregate metrics over the most recent `limit` records.
    pub async fn metrics(&self, limit: i64) -> DbResult<FeedbackMetrics> {
        let rows = db::list_recent_feedback(&self.pool, limit).await?;
        Ok(Self::compute_metrics(&rows))
    }

    /// Pure metric computation, exposed for tests.
    pub fn compute_metrics(rows: &[SearchFeedbackRow]) -> FeedbackMetrics {
        let relevant = rows
            .iter()
            .filter(|r| r.feedback == FeedbackOutcome::Relevant)
            .count() as f64;
        let irrelevant = rows
            .iter()
            .filter(|r| r.feedback == FeedbackOutcome::Irrelevant)
            .count() as f64;
        let miss = rows
            .iter()
            .filter(|r| r.feedback == FeedbackOutcome::Miss)
            .count() as f64;

        let precision = if relevant + irrelevant > 0.0 {
            Some(relevant / (relevant + irrelevant))
        } else {
            None
        };
        let recall_estimate = if relevant + miss > 0.0 {
            Some(relevant / (relevant + miss))
        } else {
            None
        };

        let ranks: Vec<f64> = rows
            .iter()
            .filter_map(|r| r.position_shown)
            .filter(|p| *p >= 1)
            .map(|p| 1.0 / p as f64)
            .collect();
        let mean_reciprocal_rank = if ranks.is_empty() {
            None
        } else {
            Some(ranks.iter().sum::<f64>() / ranks.len() as f64)
        };

        FeedbackMetrics {
            samples: rows.len(),
            precision,
            recall_estimate,
            mean_reciprocal_rank,
        }
    }

    /// Tune the hybrid weights from per-query wins and adopt the result.
    ///
    /// Wins are relevant results per retrieval mode; the shift is
    /// `(wins_vector - wins_keyword) / total * 0.3`, clamped so both
    /// weights stay in `[0.2, 0.8]`. Confidence grows with sample size
    /// and saturates at twenty wins.
    pub async fn recommend_weights(&self, limit: i64) -> DbResult<WeightRecommendation> {
        let rows = db::list_recent_feedback(&self.pool, limit).await?;
        let current = self.current_weights();
        let recommendation = Self::compute_recommendation(current, &rows);
        *self.weights.lock().expect("weights poisoned") = recommendation.weights;
        Ok(recommendation)
    }

    /// Pure weight computation, exposed for tests.
    pub fn compute_recommendation(
        current: HybridWeights,
        rows: &[SearchFeedbackRow],
    ) -> WeightRecommendation {
        let wins_vector = rows
            .iter()
            .filter(|r| {
                r.feedback == FeedbackOutcome::Relevant && r.search_type == SearchType::Vector
            })
            .count();
        let wins_keyword = rows
            .iter()
            .filter(|r| r.feedback == FeedbackOutcome::Relevant && r.search_type == SearchType::Fts)
            .count();
        let total = wins_vector + wins_keyword;

        if total == 0 {
            return WeightRecommendation {
                weights: current,
                confidence: 0.0,
                reason: "no per-mode wins recorded yet".to_string(),
            };
        }

        let shift = (wins_vector as f64 - wins_keyword as f64) / total as f64 * MAX_SHIFT;
        let vector = (current.vector + shift).clamp(MIN_WEIGHT, MAX_WEIGHT);
        let keyword = 1.0 - vector;
        let confidence = total.min(CONFIDENCE_SATURATION) as f64 / CONFIDENCE_SATURATION as f64;

        WeightRecommendation {
            weights: HybridWeights { vector, keyword },
            confidence,
            reason: format!(
                "{wins_vector} vector wins vs {wins_keyword} keyword wins over {total} samples"
            ),
        }
    }

    /// Drive retrieval property tests: run each case through `search_fn`
    /// and check the expected key surfaces.
    pub async fn run_validation_tests<F, Fut>(
        &self,
        cases: &[ValidationCase],
        search_fn: F,
    ) -> ValidationReport
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Vec<SearchHit>>,
    {
        let mut report = ValidationReport::default();
        let mut ranks = Vec::new();

        for case in cases {
            let hits = search_fn(case.query.clone()).await;
            match hits.iter().position(|h| h.key == case.expected_key) {
                Some(position) => {
                    report.passed += 1;
                    ranks.push(1.0 / (position + 1) as f64);
                }
                None => {
                    report.failed += 1;
                    tracing::debug!(query = %case.query, expected = %case.expected_key, "validation miss");
                }
            }
        }

        if !ranks.is_empty() {
            report.mean_reciprocal_rank = Some(ranks.iter().sum::<f64>() / ranks.len() as f64);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sqlx::types::Json;

    fn row(search_type: SearchType, feedback: FeedbackOutcome, position: Option<i32>) -> SearchFeedbackRow {
        SearchFeedbackRow {
            id: 0,
            query: "q".into(),
            search_type,
            results_shown: Json(vec![]),
            result_selected: None,
            result_expected: None,
            position_shown: position,
            position_expected: None,
            latency_ms: None,
            feedback,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn metrics_cover_precision_recall_and_mrr() {
        let rows = vec![
            row(SearchType::Hybrid, FeedbackOutcome::Relevant, Some(1)),
            row(SearchType::Hybrid, FeedbackOutcome::Relevant, Some(2)),
            row(SearchType::Hybrid, FeedbackOutcome::Irrelevant, Some(4)),
            row(SearchType::Hybrid, FeedbackOutcome::Miss, None),
        ];
        let m = FeedbackLoop::compute_metrics(&rows);
        assert_eq!(m.samples, 4);
        assert!((m.precision.unwrap() - 2.0 / 3.0).abs() < 1e-9);
        assert!((m.recall_estimate.unwrap() - 2.0 / 3.0).abs() < 1e-9);
        assert!((m.mean_reciprocal_rank.unwrap() - (1.0 + 0.5 + 0.25) / 3.0).abs() < 1e-9);
    }

    #[test]
    fn empty_rows_yield_no_metrics() {
        let m = FeedbackLoop::compute_metrics(&[]);
        assert_eq!(m.samples, 0);
        assert!(m.precision.is_none());
        assert!(m.recall_estimate.is_none());
        assert!(m.mean_reciprocal_rank.is_none());
    }

    #[test]
    fn vector_wins_shift_the_weights_up() {
        let rows: Vec<SearchFeedbackRow> = (0..6)
            .map(|n| {
                let mode = if n < 5 { SearchType::Vector } else { SearchType::Fts };
                row(mode, FeedbackOutcome::Relevant, Some(1))
            })
            .collect();

        let rec = FeedbackLoop::compute_recommendation(HybridWeights::default(), &rows);
        // shift = (5 - 1) / 6 * 0.3 = 0.2
        assert!((rec.weights.vector - 0.7).abs() < 1e-9);
        assert!((rec.weights.keyword - 0.3).abs() < 1e-9);
        assert!((rec.confidence - 6.0 / 20.0).abs() < 1e-9);
    }

    #[test]
    fn weights_are_clamped_to_the_band() {
        let rows: Vec<SearchFeedbackRow> = (0..30)
            .map(|_| row(SearchType::Vector, FeedbackOutcome::Relevant, Some(1)))
            .collect();

        let start = HybridWeights {
            vector: 0.7,
            keyword: 0.3,
        };
        let rec = FeedbackLoop::compute_recommendation(start, &rows);
        assert!((rec.weights.vector - 0.8).abs() < 1e-9);
        assert!((rec.weights.keyword - 0.2).abs() < 1e-9);
        // Saturated confidence.
        assert!((rec.confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn no_wins_keeps_current_weights() {
        let rows = vec![row(SearchType::Hybrid, FeedbackOutcome::Relevant, Some(1))];
        let start = HybridWeights {
            vector: 0.6,
            keyword: 0.4,
        };
        let rec = FeedbackLoop::compute_recommendation(start, &rows);
        assert_eq!(rec.weights, start);
        assert_eq!(rec.confidence, 0.0);
    }

    #[tokio::test]
    async fn validation_tests_report_rank_quality() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgresql://localhost:5432/unused")
            .expect("lazy pool");
        let feedback = FeedbackLoop::new(pool);

        let cases = vec![
            ValidationCase {
                query: "alpha".into(),
                expected_key: "doc_a".into(),
            },
            ValidationCase {
                query: "beta".into(),
                expected_key: "doc_missing".into(),
            },
        ];

        let report = feedback
            .run_validation_tests(&cases, |query| async move {
                if query == "alpha" {
                    vec![SearchHit {
                        key: "doc_a".into(),
                        score: 1.0,
                        text: String::new(),
                        metadata: serde_json::Value::Null,
                    }]
                } else {
                    Vec::new()
                }
            })
            .await;

        assert_eq!(report.passed, 1);
        assert_eq!(report.failed, 1);
        assert!((report.mean_reciprocal_rank.unwrap() - 1.0).abs() < 1e-9);
    }
}
