//! The learning loop: harvests insights from mission output, analyzes
//! failures, detects success/failure patterns, and recommends agents for
//! new work based on history.
//!
//! Durable learnings go through the gateway; semantic lookups go through
//! the index write queue's read path and tolerate an empty answer.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use regex::Regex;
use sqlx::PgPool;
use uuid::Uuid;

use maestro_db::DbResult;
use maestro_db::models::{
    Confidence, FailureKind, Learning, LearningCategory, Mission, MissionStatus,
};
use maestro_db::queries::learnings as db;
use maestro_db::queries::learnings::LearningSource;

use crate::index::IndexWriteQueue;
use crate::registry::AgentMetrics;

/// Insight length bounds for harvested snippets.
const MIN_INSIGHT_LEN: usize = 20;
const MAX_INSIGHT_LEN: usize = 300;

/// Root-cause category assigned by failure analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    Timeout,
    Logic,
    Resource,
    External,
    Dependency,
    Unknown,
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::Logic => "logic",
            Self::Resource => "resource",
            Self::External => "external",
            Self::Dependency => "dependency",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// What failure analysis concluded about one mission.
#[derive(Debug, Clone)]
pub struct FailureAnalysis {
    pub root_cause: String,
    pub category: FailureCategory,
    pub suggestion: String,
    pub similar_failures: Vec<String>,
}

/// Direction of a detected pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternType {
    Success,
    Failure,
}

/// A detected per-kind pattern over recent missions.
#[derive(Debug, Clone)]
pub struct Pattern {
    pub pattern_type: PatternType,
    pub description: String,
    pub frequency: usize,
    pub affected_missions: Vec<Uuid>,
    pub suggested_action: Option<String>,
    pub confidence: f64,
}

/// An agent recommendation for a task.
#[derive(Debug, Clone)]
pub struct AgentRecommendation {
    pub agent_id: i64,
    pub reason: String,
    pub confidence: f64,
    pub alternatives: Vec<i64>,
}

/// A raw observation in the knowledge collection.
#[derive(Debug, Clone)]
pub struct Knowledge {
    pub topic: String,
    pub content: String,
    pub added_at: DateTime<Utc>,
}

/// A problem -> solution -> outcome triple; deduplicated by problem.
#[derive(Debug, Clone)]
pub struct Lesson {
    pub problem: String,
    pub solution: String,
    pub outcome: String,
    pub added_at: DateTime<Utc>,
}

/// The learning loop.
pub struct LearningLoop {
    pool: PgPool,
    index: Option<IndexWriteQueue>,
    insight_patterns: Vec<Regex>,
    category_keywords: Vec<(LearningCategory, &'static [&'static str])>,
    knowledge: Mutex<Vec<Knowledge>>,
    lessons: Mutex<HashMap<String, Lesson>>,
}

impl LearningLoop {
    pub fn new(pool: PgPool, index: Option<IndexWriteQueue>) -> Self {
        let insight_patterns = [
            r"(?i)\b(?:learned|discovered|realized|found out)\b[^.!\n]{10,280}",
            r"(?i)\bbest practice\b[^.!\n]{5,280}",
            r"(?i)\b(?:should|must|never|always)\b[^.!\n]{10,280}",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("invalid insight pattern"))
        .collect();

        let category_keywords: Vec<(LearningCategory, &'static [&'static str])> = vec![
            (LearningCategory::Performance, &["slow", "latency", "performance", "cache", "throughput"]),
            (LearningCategory::Architecture, &["architecture", "design", "module", "coupling", "interface"]),
            (LearningCategory::Tooling, &["tool", "cli", "build", "script", "pipeline"]),
            (LearningCategory::Debugging, &["bug", "debug", "crash", "stack", "trace"]),
            (LearningCategory::Security, &["security", "auth", "secret", "vulnerab", "permission"]),
            (LearningCategory::Testing, &["test", "coverage", "assert", "fixture", "flaky"]),
            (LearningCategory::Process, &["process", "workflow", "review", "handoff", "planning"]),
        ];

        Self {
            pool,
            index,
            insight_patterns,
            category_keywords,
            knowledge: Mutex::new(Vec::new()),
            lessons: Mutex::new(HashMap::new()),
        }
    }

    // -----------------------------------------------------------------
    // Harvesting
    // -----------------------------------------------------------------

    /// Extract candidate insights from a mission's output text.
    ///
    /// Pure text scan used by [`Self::harvest_from_mission`]; exposed for
    /// tests.
    pub fn extract_insights(&self, output: &str) -> Vec<String> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut insights = Vec::new();
        for pattern in &self.insight_patterns {
            for m in pattern.find_iter(output) {
                let snippet = m.as_str().trim().trim_end_matches(['.', '!']).to_owned();
                if snippet.len() < MIN_INSIGHT_LEN || snippet.len() > MAX_INSIGHT_LEN {
                    continue;
                }
                if seen.insert(snippet.to_lowercase()) {
                    insights.push(snippet);
                }
            }
        }
        insights
    }

    /// Choose a category by keyword frequency; `Insight` when nothing
    /// stands out.
    pub fn detect_category(&self, text: &str) -> LearningCategory {
        let lowered = text.to_lowercase();
        self.category_keywords
            .iter()
            .map(|(category, keywords)| {
                let hits = keywords.iter().filter(|k| lowered.contains(*k)).count();
                (*category, hits)
            })
            .filter(|(_, hits)| *hits > 0)
            .max_by_key(|(_, hits)| *hits)
            .map(|(category, _)| category)
            .unwrap_or(LearningCategory::Insight)
    }

    /// Scan a finished mission's output and persist low-confidence
    /// learnings for every fresh insight. Index writes are best-effort.
    pub async fn harvest_from_mission(&self, mission: &Mission) -> DbResult<Vec<Learning>> {
        let Some(result) = &mission.result else {
            return Ok(Vec::new());
        };

        let mut harvested = Vec::new();
        for insight in self.extract_insights(&result.0.output) {
            let category = self.detect_category(&insight);
            let learning = db::create_learning(
                &self.pool,
                category,
                &insight,
                None,
                Confidence::Low,
                &LearningSource {
                    mission_id: Some(mission.id),
                    unified_task_id: mission.unified_task_id,
                    agent_id: mission.assigned_to,
                    ..LearningSource::default()
                },
            )
            .await?;

            if let Some(index) = &self.index {
                let outcome = index
                    .upsert(
                        &format!("learning_{}", learning.id),
                        &learning.title,
                        serde_json::json!({"category": category.to_string()}),
                    )
                    .await;
                if !outcome.is_completed() {
                    tracing::debug!(learning_id = learning.id, "learning not indexed");
                }
            }
            harvested.push(learning);
        }

        if !harvested.is_empty() {
            tracing::info!(
                mission_id = %mission.id,
                count = harvested.len(),
                "harvested learnings"
            );
        }
        Ok(harvested)
    }

    // -----------------------------------------------------------------
    // Failure analysis
    // -----------------------------------------------------------------

    /// Map a mission's error record to a root-cause category and a
    /// suggestion, with semantically similar past failures when the index
    /// is reachable.
    pub async fn analyze_failure(&self, mission: &Mission) -> FailureAnalysis {
        let (kind, message) = match &mission.error {
            Some(err) => (Some(err.0.kind), err.0.message.clone()),
            None => (None, String::from("no error record")),
        };

        let category = match kind {
            Some(FailureKind::Timeout) => FailureCategory::Timeout,
            Some(FailureKind::RateLimit) | Some(FailureKind::Auth) => FailureCategory::External,
            Some(FailureKind::Resource) => FailureCategory::Resource,
            Some(FailureKind::Validation) | Some(FailureKind::Crash) => FailureCategory::Logic,
            Some(FailureKind::Unknown) | None => {
                if message.to_lowercase().contains("depend") {
                    FailureCategory::Dependency
                } else {
                    FailureCategory::Unknown
                }
            }
        };

        let suggestion = match category {
            FailureCategory::Timeout => {
                "Raise the mission timeout or split the work; slow progress with checkpoints \
                 extends automatically."
            }
            FailureCategory::External => {
                "External services are throttling or rejecting; back off, check credentials, \
                 and retry once the provider recovers."
            }
            FailureCategory::Resource => {
                "The worker ran out of a resource; reduce concurrency or give the fleet more \
                 headroom before retrying."
            }
            FailureCategory::Logic => {
                "The input or the approach is wrong; inspect the prompt and the worker \
                 transcript before resubmitting."
            }
            FailureCategory::Dependency => {
                "A dependency did not complete; check the upstream missions in the chain."
            }
            FailureCategory::Unknown => {
                "No known signature; read the worker output and file a learning once the \
                 cause is understood."
            }
        }
        .to_string();

        let similar_failures = match &self.index {
            Some(index) => index
                .search(&message, 3)
                .await
                .into_iter()
                .map(|hit| hit.text)
                .collect(),
            None => Vec::new(),
        };

        FailureAnalysis {
            root_cause: message,
            category,
            suggestion,
            similar_failures,
        }
    }

    // -----------------------------------------------------------------
    // Patterns
    // -----------------------------------------------------------------

    /// Group the most recent `window` missions by kind and flag kinds
    /// with extreme outcomes: >80% success, or <50% success with at
    /// least three samples.
    pub fn detect_patterns(&self, recent: &[Mission], window: usize) -> Vec<Pattern> {
        let considered: Vec<&Mission> = recent
            .iter()
            .filter(|m| matches!(m.status, MissionStatus::Completed | MissionStatus::Failed))
            .rev()
            .take(window)
            .collect();

        let mut by_kind: HashMap<String, Vec<&Mission>> = HashMap::new();
        for m in considered {
            by_kind.entry(m.kind.to_string()).or_default().push(m);
        }

        let mut patterns = Vec::new();
        for (kind, missions) in by_kind {
            if missions.len() < 3 {
                continue;
            }
            let successes = missions
                .iter()
                .filter(|m| m.status == MissionStatus::Completed)
                .count();
            let rate = successes as f64 / missions.len() as f64;
            let affected: Vec<Uuid> = missions.iter().map(|m| m.id).collect();
            let confidence = (missions.len() as f64 / window as f64).min(1.0);

            if rate > 0.8 {
                patterns.push(Pattern {
                    pattern_type: PatternType::Success,
                    description: format!(
                        "{kind} missions are succeeding at {:.0}%",
                        rate * 100.0
                    ),
                    frequency: missions.len(),
                    affected_missions: affected,
                    suggested_action: None,
                    confidence,
                });
            } else if rate < 0.5 {
                patterns.push(Pattern {
                    pattern_type: PatternType::Failure,
                    description: format!(
                        "{kind} missions are failing at {:.0}%",
                        (1.0 - rate) * 100.0
                    ),
                    frequency: missions.len(),
                    affected_missions: affected,
                    suggested_action: Some(format!(
                        "inspect recent {kind} failures for a shared root cause"
                    )),
                    confidence,
                });
            }
        }
        patterns
    }

    /// Short actionable lines for the oracle's auto-optimize summary.
    pub fn efficiency_insights(&self, missions: &[Mission]) -> Vec<String> {
        self.detect_patterns(missions, 10)
            .into_iter()
            .filter(|p| p.pattern_type == PatternType::Failure)
            .map(|p| match p.suggested_action {
                Some(action) => format!("{} -- {action}", p.description),
                None => p.description,
            })
            .collect()
    }

    // -----------------------------------------------------------------
    // Suggestions and recommendations
    // -----------------------------------------------------------------

    /// Top learnings relevant to a task, best confidence first.
    ///
    /// Prefers semantic retrieval; a stale or absent index falls back to
    /// the most recent medium-or-better learnings.
    pub async fn suggest_learnings(&self, task: &str) -> DbResult<Vec<Learning>> {
        let mut learnings = Vec::new();

        if let Some(index) = &self.index {
            for hit in index.search(task, 10).await {
                if let Some(id) = hit
                    .key
                    .strip_prefix("learning_")
                    .and_then(|raw| raw.parse::<i64>().ok())
                {
                    if let Some(learning) = db::get_learning_by_id(&self.pool, id).await? {
                        learnings.push(learning);
                    }
                }
            }
        }

        if learnings.is_empty() {
            learnings = db::recent_learnings(&self.pool, Confidence::Medium, 10).await?;
        }

        learnings.sort_by(|a, b| b.confidence.cmp(&a.confidence));
        learnings.truncate(3);
        Ok(learnings)
    }

    /// Record that a learning held up in practice.
    pub async fn validate_learning(&self, id: i64) -> DbResult<Option<Learning>> {
        db::validate_learning(&self.pool, id).await
    }

    /// Validation with an audit trail in the logs.
    pub async fn boost_confidence(&self, id: i64, reason: &str) -> DbResult<Option<Learning>> {
        let learning = db::validate_learning(&self.pool, id).await?;
        if let Some(l) = &learning {
            tracing::info!(learning_id = id, confidence = %l.confidence, reason, "confidence boosted");
        }
        Ok(learning)
    }

    /// Demote never-validated learnings older than the cutoff.
    pub async fn decay_stale(&self, older_than_days: i64) -> DbResult<u64> {
        db::decay_stale(&self.pool, older_than_days).await
    }

    /// Rank agents by historical quality: success rate weighted by
    /// `ln(samples + 1)` so a 90% agent with 40 finished tasks beats a
    /// 100% agent with one.
    pub fn recommend_agent(
        &self,
        task: &str,
        agents: &[AgentMetrics],
    ) -> Option<AgentRecommendation> {
        let mut scored: Vec<(f64, &AgentMetrics)> = agents
            .iter()
            .filter(|a| crate::registry::AgentRegistry::is_dispatchable(a.role))
            .filter_map(|a| {
                let rate = a.success_rate?;
                let samples = (a.tasks_completed + a.tasks_failed) as f64;
                Some((rate * (samples + 1.0).ln(), a))
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let (score, best) = scored.first()?;
        let alternatives: Vec<i64> = scored.iter().skip(1).take(2).map(|(_, a)| a.id).collect();
        Some(AgentRecommendation {
            agent_id: best.id,
            reason: format!(
                "best weighted track record (score {score:.2}, {} finished tasks) for: {task}",
                best.tasks_completed + best.tasks_failed
            ),
            confidence: best.success_rate.unwrap_or(0.0),
            alternatives,
        })
    }

    // -----------------------------------------------------------------
    // Knowledge and lessons
    // -----------------------------------------------------------------

    /// Record a raw observation.
    pub async fn add_knowledge(&self, topic: &str, content: &str) {
        let entry = Knowledge {
            topic: topic.to_owned(),
            content: content.to_owned(),
            added_at: Utc::now(),
        };
        self.knowledge.lock().expect("knowledge poisoned").push(entry);

        if let Some(index) = &self.index {
            let _ = index
                .upsert(
                    &format!("knowledge_{topic}"),
                    content,
                    serde_json::json!({"topic": topic}),
                )
                .await;
        }
    }

    /// Record a problem -> solution -> outcome triple. Lessons are
    /// deduplicated by problem; a repeat replaces the stored outcome.
    pub async fn add_lesson(&self, problem: &str, solution: &str, outcome: &str) {
        let key = problem.trim().to_lowercase();
        let lesson = Lesson {
            problem: problem.to_owned(),
            solution: solution.to_owned(),
            outcome: outcome.to_owned(),
            added_at: Utc::now(),
        };
        self.lessons
            .lock()
            .expect("lessons poisoned")
            .insert(key.clone(), lesson);

        if let Some(index) = &self.index {
            let _ = index
                .upsert(
                    &format!("lesson_{key}"),
                    &format!("{problem} => {solution} => {outcome}"),
                    serde_json::json!({"problem": problem}),
                )
                .await;
        }
    }

    /// Search raw observations; semantic first, substring fallback.
    pub async fn search_knowledge(&self, query: &str) -> Vec<Knowledge> {
        if let Some(index) = &self.index {
            let hits = index.search(query, 5).await;
            if !hits.is_empty() {
                let knowledge = self.knowledge.lock().expect("knowledge poisoned");
                return hits
                    .iter()
                    .filter_map(|hit| {
                        let topic = hit.key.strip_prefix("knowledge_")?;
                        knowledge.iter().find(|k| k.topic == topic).cloned()
                    })
                    .collect();
            }
        }
        let lowered = query.to_lowercase();
        self.knowledge
            .lock()
            .expect("knowledge poisoned")
            .iter()
            .filter(|k| {
                k.topic.to_lowercase().contains(&lowered)
                    || k.content.to_lowercase().contains(&lowered)
            })
            .cloned()
            .collect()
    }

    /// Search lessons; semantic first, substring fallback.
    pub async fn search_lessons(&self, query: &str) -> Vec<Lesson> {
        if let Some(index) = &self.index {
            let hits = index.search(query, 5).await;
            if !hits.is_empty() {
                let lessons = self.lessons.lock().expect("lessons poisoned");
                return hits
                    .iter()
                    .filter_map(|hit| lessons.get(hit.key.strip_prefix("lesson_")?).cloned())
                    .collect();
            }
        }
        let lowered = query.to_lowercase();
        self.lessons
            .lock()
            .expect("lessons poisoned")
            .values()
            .filter(|l| {
                l.problem.to_lowercase().contains(&lowered)
                    || l.solution.to_lowercase().contains(&lowered)
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_db::models::{
        AgentRole, AgentStatus, MissionFailure, MissionKind, MissionPriority, ModelTier,
    };

    fn learning_loop() -> LearningLoop {
        // Pool is lazy; these tests never touch the database.
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgresql://localhost:5432/unused")
            .expect("lazy pool");
        LearningLoop::new(pool, None)
    }

    fn mission_with_error(kind: FailureKind) -> Mission {
        Mission {
            id: Uuid::new_v4(),
            prompt: "doomed".into(),
            context: None,
            priority: MissionPriority::Normal,
            kind: MissionKind::General,
            status: MissionStatus::Failed,
            timeout_ms: 1000,
            max_retries: 0,
            retry_count: 0,
            retry_delay_ms: 0,
            depends_on: vec![],
            assigned_to: None,
            error: Some(sqlx::types::Json(MissionFailure::new(kind, "provider said no"))),
            result: None,
            execution_id: None,
            parent_mission_id: None,
            unified_task_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: Some(Utc::now()),
        }
    }

    #[tokio::test]
    async fn insights_are_extracted_and_deduplicated() {
        let ll = learning_loop();
        let output = "We learned that batching the writes halves the latency. \
                      Also, we learned that batching the writes halves the latency. \
                      You should never hold the lock across an await point.";
        let insights = ll.extract_insights(output);
        assert_eq!(insights.len(), 2);
        assert!(insights[0].contains("batching the writes"));
        assert!(insights[1].contains("never hold the lock"));
    }

    #[tokio::test]
    async fn short_snippets_are_dropped() {
        let ll = learning_loop();
        assert!(ll.extract_insights("learned a lot").is_empty());
    }

    #[tokio::test]
    async fn category_detection_follows_keyword_frequency() {
        let ll = learning_loop();
        assert_eq!(
            ll.detect_category("the test fixture was flaky and the coverage lied"),
            LearningCategory::Testing
        );
        assert_eq!(
            ll.detect_category("nothing specific here"),
            LearningCategory::Insight
        );
    }

    #[tokio::test]
    async fn rate_limit_failures_are_external() {
        let ll = learning_loop();
        let analysis = ll
            .analyze_failure(&mission_with_error(FailureKind::RateLimit))
            .await;
        assert_eq!(analysis.category, FailureCategory::External);
        assert!(analysis.suggestion.to_lowercase().contains("external services"));
    }

    #[tokio::test]
    async fn timeout_failures_keep_their_category() {
        let ll = learning_loop();
        let analysis = ll
            .analyze_failure(&mission_with_error(FailureKind::Timeout))
            .await;
        assert_eq!(analysis.category, FailureCategory::Timeout);
    }

    #[tokio::test]
    async fn failure_patterns_need_three_samples() {
        let ll = learning_loop();

        let mut missions = Vec::new();
        for _ in 0..2 {
            missions.push(mission_with_error(FailureKind::Timeout));
        }
        assert!(ll.detect_patterns(&missions, 10).is_empty());

        missions.push(mission_with_error(FailureKind::Timeout));
        let patterns = ll.detect_patterns(&missions, 10);
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].pattern_type, PatternType::Failure);
        assert!(patterns[0].suggested_action.is_some());
    }

    #[tokio::test]
    async fn agent_recommendation_weights_sample_size() {
        let ll = learning_loop();
        let agent = |id, completed, failed| AgentMetrics {
            id,
            role: AgentRole::Coder,
            model: ModelTier::Sonnet,
            status: AgentStatus::Idle,
            tasks_completed: completed,
            tasks_failed: failed,
            success_rate: Some(completed as f64 / (completed + failed) as f64),
            current_mission_id: None,
        };

        // 100% over one task loses to 90% over forty.
        let agents = vec![agent(1, 1, 0), agent(2, 36, 4)];
        let rec = ll.recommend_agent("implement things", &agents).unwrap();
        assert_eq!(rec.agent_id, 2);
        assert_eq!(rec.alternatives, vec![1]);
    }

    #[tokio::test]
    async fn oracle_agents_are_never_recommended() {
        let ll = learning_loop();
        let oracle = AgentMetrics {
            id: 9,
            role: AgentRole::Oracle,
            model: ModelTier::Opus,
            status: AgentStatus::Idle,
            tasks_completed: 100,
            tasks_failed: 0,
            success_rate: Some(1.0),
            current_mission_id: None,
        };
        assert!(ll.recommend_agent("anything", &[oracle]).is_none());
    }

    #[tokio::test]
    async fn lessons_deduplicate_by_problem() {
        let ll = learning_loop();
        ll.add_lesson("Flaky test", "pin the clock", "stable").await;
        ll.add_lesson("flaky test  ", "pin the clock harder", "more stable").await;

        let lessons = ll.search_lessons("flaky").await;
        assert_eq!(lessons.len(), 1);
        assert_eq!(lessons[0].solution, "pin the clock harder");
    }
}
