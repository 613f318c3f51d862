use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use uuid::Uuid;

/// Error returned when parsing an invalid enum string.
///
/// One shared type covers every text enum in this module; `what` names the
/// enum for diagnostics.
#[derive(Debug, Clone)]
pub struct ParseEnumError {
    pub what: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_owned(),
        }
    }
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {:?}", self.what, self.value)
    }
}

impl std::error::Error for ParseEnumError {}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Priority band of a mission. Variant order is the scheduling order:
/// `Critical` sorts before `Low`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MissionPriority {
    Critical,
    High,
    Normal,
    Low,
}

impl MissionPriority {
    /// Scheduling rank; lower runs first.
    pub fn rank(self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }
}

impl fmt::Display for MissionPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        };
        f.write_str(s)
    }
}

impl FromStr for MissionPriority {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            other => Err(ParseEnumError::new("mission priority", other)),
        }
    }
}

/// Kind of work a mission represents; drives role routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MissionKind {
    Extraction,
    Analysis,
    Synthesis,
    Review,
    General,
}

impl fmt::Display for MissionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Extraction => "extraction",
            Self::Analysis => "analysis",
            Self::Synthesis => "synthesis",
            Self::Review => "review",
            Self::General => "general",
        };
        f.write_str(s)
    }
}

impl FromStr for MissionKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "extraction" => Ok(Self::Extraction),
            "analysis" => Ok(Self::Analysis),
            "synthesis" => Ok(Self::Synthesis),
            "review" => Ok(Self::Review),
            "general" => Ok(Self::General),
            other => Err(ParseEnumError::new("mission kind", other)),
        }
    }
}

/// Status of a mission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Retrying,
    Blocked,
    Cancelled,
}

impl MissionStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for MissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
            Self::Blocked => "blocked",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for MissionStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "retrying" => Ok(Self::Retrying),
            "blocked" => Ok(Self::Blocked),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(ParseEnumError::new("mission status", other)),
        }
    }
}

/// Specialization tag of an agent.
///
/// `Oracle` is part of the vocabulary (the controller itself) but is never
/// a dispatch target; see `maestro-core`'s registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Coder,
    Tester,
    Analyst,
    Reviewer,
    Generalist,
    Oracle,
    Architect,
    Debugger,
    Researcher,
    Scribe,
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Coder => "coder",
            Self::Tester => "tester",
            Self::Analyst => "analyst",
            Self::Reviewer => "reviewer",
            Self::Generalist => "generalist",
            Self::Oracle => "oracle",
            Self::Architect => "architect",
            Self::Debugger => "debugger",
            Self::Researcher => "researcher",
            Self::Scribe => "scribe",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentRole {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "coder" => Ok(Self::Coder),
            "tester" => Ok(Self::Tester),
            "analyst" => Ok(Self::Analyst),
            "reviewer" => Ok(Self::Reviewer),
            "generalist" => Ok(Self::Generalist),
            "oracle" => Ok(Self::Oracle),
            "architect" => Ok(Self::Architect),
            "debugger" => Ok(Self::Debugger),
            "researcher" => Ok(Self::Researcher),
            "scribe" => Ok(Self::Scribe),
            other => Err(ParseEnumError::new("agent role", other)),
        }
    }
}

/// Capability/cost band of the model an agent hosts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Haiku,
    Sonnet,
    Opus,
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Haiku => "haiku",
            Self::Sonnet => "sonnet",
            Self::Opus => "opus",
        };
        f.write_str(s)
    }
}

impl FromStr for ModelTier {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "haiku" => Ok(Self::Haiku),
            "sonnet" => Ok(Self::Sonnet),
            "opus" => Ok(Self::Opus),
            other => Err(ParseEnumError::new("model tier", other)),
        }
    }
}

/// Lifecycle status of an agent worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Starting,
    Idle,
    Busy,
    Working,
    Error,
    Crashed,
    Stopping,
    Stopped,
}

impl AgentStatus {
    /// Whether the agent can accept a new mission.
    pub fn is_available(self) -> bool {
        matches!(self, Self::Idle)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Working => "working",
            Self::Error => "error",
            Self::Crashed => "crashed",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(Self::Starting),
            "idle" => Ok(Self::Idle),
            "busy" => Ok(Self::Busy),
            "working" => Ok(Self::Working),
            "error" => Ok(Self::Error),
            "crashed" => Ok(Self::Crashed),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            other => Err(ParseEnumError::new("agent status", other)),
        }
    }
}

/// Domain of a unified task (business requirement).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskDomain {
    System,
    Project,
    Session,
}

impl fmt::Display for TaskDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::System => "system",
            Self::Project => "project",
            Self::Session => "session",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskDomain {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Self::System),
            "project" => Ok(Self::Project),
            "session" => Ok(Self::Session),
            other => Err(ParseEnumError::new("task domain", other)),
        }
    }
}

/// Status of a unified task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum UnifiedTaskStatus {
    Open,
    InProgress,
    Done,
    Blocked,
    WontFix,
}

impl fmt::Display for UnifiedTaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Blocked => "blocked",
            Self::WontFix => "wont_fix",
        };
        f.write_str(s)
    }
}

impl FromStr for UnifiedTaskStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            "blocked" => Ok(Self::Blocked),
            "wont_fix" => Ok(Self::WontFix),
            other => Err(ParseEnumError::new("unified task status", other)),
        }
    }
}

/// Category of an extracted learning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LearningCategory {
    Performance,
    Architecture,
    Tooling,
    Debugging,
    Security,
    Testing,
    Process,
    Philosophy,
    Principle,
    Insight,
    Pattern,
    Retrospective,
}

impl fmt::Display for LearningCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Performance => "performance",
            Self::Architecture => "architecture",
            Self::Tooling => "tooling",
            Self::Debugging => "debugging",
            Self::Security => "security",
            Self::Testing => "testing",
            Self::Process => "process",
            Self::Philosophy => "philosophy",
            Self::Principle => "principle",
            Self::Insight => "insight",
            Self::Pattern => "pattern",
            Self::Retrospective => "retrospective",
        };
        f.write_str(s)
    }
}

impl FromStr for LearningCategory {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "performance" => Ok(Self::Performance),
            "architecture" => Ok(Self::Architecture),
            "tooling" => Ok(Self::Tooling),
            "debugging" => Ok(Self::Debugging),
            "security" => Ok(Self::Security),
            "testing" => Ok(Self::Testing),
            "process" => Ok(Self::Process),
            "philosophy" => Ok(Self::Philosophy),
            "principle" => Ok(Self::Principle),
            "insight" => Ok(Self::Insight),
            "pattern" => Ok(Self::Pattern),
            "retrospective" => Ok(Self::Retrospective),
            other => Err(ParseEnumError::new("learning category", other)),
        }
    }
}

/// Confidence attached to a learning.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
    Proven,
}

impl Confidence {
    /// The next confidence step after another validation.
    pub fn promoted(self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium => Self::High,
            Self::High | Self::Proven => Self::Proven,
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Proven => "proven",
        };
        f.write_str(s)
    }
}

impl FromStr for Confidence {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "proven" => Ok(Self::Proven),
            other => Err(ParseEnumError::new("confidence", other)),
        }
    }
}

/// Retrieval mode a search-feedback record refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SearchType {
    Vector,
    Fts,
    Hybrid,
}

impl fmt::Display for SearchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Vector => "vector",
            Self::Fts => "fts",
            Self::Hybrid => "hybrid",
        };
        f.write_str(s)
    }
}

impl FromStr for SearchType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vector" => Ok(Self::Vector),
            "fts" => Ok(Self::Fts),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(ParseEnumError::new("search type", other)),
        }
    }
}

/// Outcome judgement of a recorded search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FeedbackOutcome {
    Relevant,
    Irrelevant,
    Miss,
    Unknown,
}

impl fmt::Display for FeedbackOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Relevant => "relevant",
            Self::Irrelevant => "irrelevant",
            Self::Miss => "miss",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

impl FromStr for FeedbackOutcome {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "relevant" => Ok(Self::Relevant),
            "irrelevant" => Ok(Self::Irrelevant),
            "miss" => Ok(Self::Miss),
            "unknown" => Ok(Self::Unknown),
            other => Err(ParseEnumError::new("feedback outcome", other)),
        }
    }
}

/// Kind of a mission failure. Stored inside the mission's JSONB error
/// record, not as a column of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Crash,
    Validation,
    Resource,
    Auth,
    RateLimit,
    Unknown,
}

impl FailureKind {
    /// Recoverable failures route through retry-with-backoff; the rest go
    /// straight to terminal failure.
    pub fn is_recoverable(self) -> bool {
        matches!(self, Self::Timeout | Self::RateLimit | Self::Resource)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::Crash => "crash",
            Self::Validation => "validation",
            Self::Resource => "resource",
            Self::Auth => "auth",
            Self::RateLimit => "rate_limit",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

impl FromStr for FailureKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "timeout" => Ok(Self::Timeout),
            "crash" => Ok(Self::Crash),
            "validation" => Ok(Self::Validation),
            "resource" => Ok(Self::Resource),
            "auth" => Ok(Self::Auth),
            "rate_limit" => Ok(Self::RateLimit),
            "unknown" => Ok(Self::Unknown),
            other => Err(ParseEnumError::new("failure kind", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// JSONB payload structs
// ---------------------------------------------------------------------------

/// Error record attached to a failed mission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionFailure {
    pub kind: FailureKind,
    pub message: String,
    pub recoverable: bool,
    pub at: DateTime<Utc>,
}

impl MissionFailure {
    /// Build a failure record; `recoverable` follows the kind's map.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            recoverable: kind.is_recoverable(),
            at: Utc::now(),
        }
    }
}

/// Result record attached to a completed mission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionOutcome {
    pub output: String,
    pub duration_ms: i64,
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A mission -- the unit of scheduled work.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Mission {
    pub id: Uuid,
    pub prompt: String,
    pub context: Option<String>,
    pub priority: MissionPriority,
    pub kind: MissionKind,
    pub status: MissionStatus,
    pub timeout_ms: i64,
    pub max_retries: i32,
    pub retry_count: i32,
    pub retry_delay_ms: i64,
    pub depends_on: Vec<Uuid>,
    pub assigned_to: Option<i64>,
    pub error: Option<Json<MissionFailure>>,
    pub result: Option<Json<MissionOutcome>>,
    pub execution_id: Option<String>,
    pub parent_mission_id: Option<Uuid>,
    pub unified_task_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Mission {
    /// Age of the mission since admission.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }
}

/// An agent -- a long-lived worker with stable identity.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AgentRow {
    pub id: i64,
    pub name: String,
    pub status: AgentStatus,
    pub role: AgentRole,
    pub model: ModelTier,
    pub pid: Option<i32>,
    pub current_mission_id: Option<Uuid>,
    pub tasks_completed: i64,
    pub tasks_failed: i64,
    pub total_duration_ms: i64,
    pub worktree_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentRow {
    /// `tasksCompleted / (tasksCompleted + tasksFailed)`; `None` when the
    /// agent has no finished work yet.
    pub fn success_rate(&self) -> Option<f64> {
        let total = self.tasks_completed + self.tasks_failed;
        if total == 0 {
            None
        } else {
            Some(self.tasks_completed as f64 / total as f64)
        }
    }
}

/// One attempt at running a mission on an agent.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExecutionRow {
    pub id: String,
    pub agent_id: i64,
    pub parent_mission_id: Uuid,
    pub prompt: String,
    pub context: Option<String>,
    pub priority: MissionPriority,
    pub status: MissionStatus,
    pub result: Option<Json<MissionOutcome>>,
    pub error: Option<Json<MissionFailure>>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub duration_ms: Option<i64>,
    pub session_id: Option<String>,
    pub unified_task_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A unified task -- a durable objective spanning multiple missions.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UnifiedTask {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub status: UnifiedTaskStatus,
    pub priority: MissionPriority,
    pub domain: TaskDomain,
    pub component: Option<String>,
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An extracted insight.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Learning {
    pub id: i64,
    pub category: LearningCategory,
    pub title: String,
    pub description: Option<String>,
    pub confidence: Confidence,
    pub validation_count: i32,
    pub source_session_id: Option<String>,
    pub source_task_id: Option<i64>,
    pub source_mission_id: Option<Uuid>,
    pub source_unified_task_id: Option<i64>,
    pub agent_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// One recorded retrieval outcome.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SearchFeedbackRow {
    pub id: i64,
    pub query: String,
    pub search_type: SearchType,
    pub results_shown: Json<Vec<String>>,
    pub result_selected: Option<String>,
    pub result_expected: Option<String>,
    pub position_shown: Option<i32>,
    pub position_expected: Option<i32>,
    pub latency_ms: Option<i32>,
    pub feedback: FeedbackOutcome,
    pub created_at: DateTime<Utc>,
}

/// A durable inbox entry addressed to an agent.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InboxRow {
    pub mission_id: Uuid,
    pub agent_id: i64,
    pub enqueued_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mission_priority_display_roundtrip() {
        let variants = [
            MissionPriority::Critical,
            MissionPriority::High,
            MissionPriority::Normal,
            MissionPriority::Low,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: MissionPriority = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn mission_priority_rank_order() {
        assert!(MissionPriority::Critical.rank() < MissionPriority::High.rank());
        assert!(MissionPriority::High.rank() < MissionPriority::Normal.rank());
        assert!(MissionPriority::Normal.rank() < MissionPriority::Low.rank());
        assert!(MissionPriority::Critical < MissionPriority::Low);
    }

    #[test]
    fn mission_status_display_roundtrip() {
        let variants = [
            MissionStatus::Pending,
            MissionStatus::Queued,
            MissionStatus::Running,
            MissionStatus::Completed,
            MissionStatus::Failed,
            MissionStatus::Retrying,
            MissionStatus::Blocked,
            MissionStatus::Cancelled,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: MissionStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn mission_status_terminal_set() {
        assert!(MissionStatus::Completed.is_terminal());
        assert!(MissionStatus::Failed.is_terminal());
        assert!(MissionStatus::Cancelled.is_terminal());
        assert!(!MissionStatus::Retrying.is_terminal());
        assert!(!MissionStatus::Running.is_terminal());
    }

    #[test]
    fn mission_status_invalid() {
        assert!("bogus".parse::<MissionStatus>().is_err());
    }

    #[test]
    fn agent_role_display_roundtrip() {
        let variants = [
            AgentRole::Coder,
            AgentRole::Tester,
            AgentRole::Analyst,
            AgentRole::Reviewer,
            AgentRole::Generalist,
            AgentRole::Oracle,
            AgentRole::Architect,
            AgentRole::Debugger,
            AgentRole::Researcher,
            AgentRole::Scribe,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: AgentRole = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn model_tier_ordering() {
        assert!(ModelTier::Haiku < ModelTier::Sonnet);
        assert!(ModelTier::Sonnet < ModelTier::Opus);
    }

    #[test]
    fn agent_status_availability() {
        assert!(AgentStatus::Idle.is_available());
        assert!(!AgentStatus::Busy.is_available());
        assert!(!AgentStatus::Starting.is_available());
    }

    #[test]
    fn unified_task_status_roundtrip() {
        for v in [
            UnifiedTaskStatus::Open,
            UnifiedTaskStatus::InProgress,
            UnifiedTaskStatus::Done,
            UnifiedTaskStatus::Blocked,
            UnifiedTaskStatus::WontFix,
        ] {
            assert_eq!(v.to_string().parse::<UnifiedTaskStatus>().unwrap(), v);
        }
    }

    #[test]
    fn confidence_promotion_saturates() {
        assert_eq!(Confidence::Low.promoted(), Confidence::Medium);
        assert_eq!(Confidence::Medium.promoted(), Confidence::High);
        assert_eq!(Confidence::High.promoted(), Confidence::Proven);
        assert_eq!(Confidence::Proven.promoted(), Confidence::Proven);
    }

    #[test]
    fn failure_kind_recoverability_map() {
        assert!(FailureKind::Timeout.is_recoverable());
        assert!(FailureKind::RateLimit.is_recoverable());
        assert!(FailureKind::Resource.is_recoverable());
        assert!(!FailureKind::Crash.is_recoverable());
        assert!(!FailureKind::Validation.is_recoverable());
        assert!(!FailureKind::Auth.is_recoverable());
        assert!(!FailureKind::Unknown.is_recoverable());
    }

    #[test]
    fn failure_kind_rate_limit_spelling() {
        assert_eq!(FailureKind::RateLimit.to_string(), "rate_limit");
        assert_eq!(
            "rate_limit".parse::<FailureKind>().unwrap(),
            FailureKind::RateLimit
        );
    }

    #[test]
    fn success_rate_none_without_samples() {
        let agent = AgentRow {
            id: 1,
            name: "agent-1".into(),
            status: AgentStatus::Idle,
            role: AgentRole::Generalist,
            model: ModelTier::Sonnet,
            pid: None,
            current_mission_id: None,
            tasks_completed: 0,
            tasks_failed: 0,
            total_duration_ms: 0,
            worktree_path: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(agent.success_rate().is_none());

        let seasoned = AgentRow {
            tasks_completed: 3,
            tasks_failed: 1,
            ..agent
        };
        assert_eq!(seasoned.success_rate(), Some(0.75));
    }

    #[test]
    fn mission_failure_serde_roundtrip() {
        let failure = MissionFailure::new(FailureKind::RateLimit, "provider throttled");
        let json = serde_json::to_string(&failure).unwrap();
        assert!(json.contains("\"rate_limit\""));
        let back: MissionFailure = serde_json::from_str(&json).unwrap();
        assert_eq!(back, failure);
        assert!(back.recoverable);
    }
}
