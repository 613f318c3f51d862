//! The oracle controller: workload analysis, bottleneck detection,
//! proactive spawning, priority escalation, and the periodic
//! auto-optimize tick.
//!
//! Analysis functions are pure over snapshots (agent metrics from the
//! registry, missions from the queue) so they can be exercised without a
//! live fleet; only the execute/optimize entry points touch the registry
//! and queue.

pub mod complexity;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use uuid::Uuid;

use maestro_db::models::{
    AgentRole, AgentStatus, Mission, MissionKind, MissionPriority, MissionStatus, ModelTier,
};

use crate::learning::LearningLoop;
use crate::queue::MissionQueue;
use crate::registry::{AgentMetrics, AgentRegistry, SpawnConfig};
use self::complexity::{ComplexityAnalyzer, ComplexityTier};

/// The role a mission kind routes to.
pub fn role_for_mission_kind(kind: MissionKind) -> AgentRole {
    match kind {
        MissionKind::Extraction => AgentRole::Researcher,
        MissionKind::Analysis => AgentRole::Analyst,
        MissionKind::Synthesis => AgentRole::Oracle,
        MissionKind::Review => AgentRole::Reviewer,
        MissionKind::General => AgentRole::Generalist,
    }
}

/// The role actually spawned or dispatched for a mission kind. The oracle
/// role is the controller's own and never receives workers, so synthesis
/// work falls back to generalists.
pub fn dispatch_role_for_kind(kind: MissionKind) -> AgentRole {
    let role = role_for_mission_kind(kind);
    if AgentRegistry::is_dispatchable(role) {
        role
    } else {
        AgentRole::Generalist
    }
}

/// Thresholds driving proactive spawning.
#[derive(Debug, Clone)]
pub struct SpawnTriggers {
    /// Queue growth (missions per minute) that demands a new generalist.
    pub queue_growth_rate: f64,
    /// Per-role backlog that demands a specialist.
    pub queue_depth_threshold: usize,
    /// Idle agents to keep around per busy role.
    pub idle_agent_minimum: usize,
    /// Queued complex tasks that demand an opus worker.
    pub task_complexity_backlog: usize,
}

impl Default for SpawnTriggers {
    fn default() -> Self {
        Self {
            queue_growth_rate: 5.0,
            queue_depth_threshold: 5,
            idle_agent_minimum: 1,
            task_complexity_backlog: 3,
        }
    }
}

/// How urgently a spawn decision should be acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Urgency {
    Immediate,
    Soon,
    Optional,
}

impl std::fmt::Display for Urgency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Immediate => "immediate",
            Self::Soon => "soon",
            Self::Optional => "optional",
        };
        f.write_str(s)
    }
}

/// One proactive spawn recommendation.
#[derive(Debug, Clone)]
pub struct ProactiveSpawnDecision {
    pub should_spawn: bool,
    pub reason: String,
    pub suggested_role: AgentRole,
    pub suggested_model: ModelTier,
    pub urgency: Urgency,
}

/// Per-agent view produced by workload analysis.
#[derive(Debug, Clone)]
pub struct AgentUtilization {
    pub id: i64,
    pub role: AgentRole,
    pub model: ModelTier,
    pub status: AgentStatus,
    pub tasks_completed: i64,
    pub tasks_failed: i64,
    pub success_rate: Option<f64>,
    /// Finished work relative to the busiest agent, in [0, 1].
    pub utilization_score: f64,
}

/// Aggregate workload picture.
#[derive(Debug, Clone)]
pub struct WorkloadAnalysis {
    pub agents: Vec<AgentUtilization>,
    pub role_distribution: HashMap<AgentRole, usize>,
    pub model_distribution: HashMap<ModelTier, usize>,
    pub overloaded_agents: usize,
    pub underutilized_agents: usize,
    pub bottleneck_roles: Vec<AgentRole>,
    pub mean_success_rate: Option<f64>,
    pub queue_depth: usize,
}

/// A detected systemic bottleneck.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bottleneck {
    /// A role has queued demand and zero idle workers.
    RoleShortage { role: AgentRole, queued: usize },
    /// The queue as a whole is backed up.
    QueueBackup { queued: usize },
    /// Failures are spiking in the recent window.
    FailureSpike { failed: usize, total: usize },
    /// A dependency chain is deep enough to serialize the fleet.
    DependencyChain { depth: usize, head: Uuid },
}

/// One applied priority change.
#[derive(Debug, Clone)]
pub struct PriorityAdjustment {
    pub mission_id: Uuid,
    pub from: MissionPriority,
    pub to: MissionPriority,
    pub reason: &'static str,
}

/// Summary returned by one auto-optimize tick.
#[derive(Debug, Clone, Default)]
pub struct OptimizeSummary {
    pub spawned: usize,
    pub bottlenecks: Vec<Bottleneck>,
    pub priority_adjustments: usize,
    pub insights: Vec<String>,
}

/// The controller. Holds the rolling queue-depth window and the compiled
/// complexity tables.
pub struct OracleController {
    triggers: SpawnTriggers,
    /// Rolling `(at, depth)` snapshots, pruned to the window below.
    depth_window: Mutex<VecDeque<(Instant, usize)>>,
    window: Duration,
    analyzer: ComplexityAnalyzer,
    max_spawns_per_tick: usize,
}

impl OracleController {
    pub fn new(triggers: SpawnTriggers) -> Self {
        Self {
            triggers,
            depth_window: Mutex::new(VecDeque::new()),
            window: Duration::from_secs(120),
            analyzer: ComplexityAnalyzer::new(),
            max_spawns_per_tick: 3,
        }
    }

    pub fn analyzer(&self) -> &ComplexityAnalyzer {
        &self.analyzer
    }

    // -----------------------------------------------------------------
    // Workload analysis
    // -----------------------------------------------------------------

    /// Produce the aggregate workload picture from registry and queue
    /// snapshots.
    pub fn analyze_workload(
        &self,
        agents: &[AgentMetrics],
        missions: &[Mission],
    ) -> WorkloadAnalysis {
        let max_total = agents
            .iter()
            .map(|a| a.tasks_completed + a.tasks_failed)
            .max()
            .unwrap_or(0);

        let utilizations: Vec<AgentUtilization> = agents
            .iter()
            .map(|a| {
                let total = a.tasks_completed + a.tasks_failed;
                let utilization_score = if max_total > 0 {
                    total as f64 / max_total as f64
                } else {
                    0.0
                };
                AgentUtilization {
                    id: a.id,
                    role: a.role,
                    model: a.model,
                    status: a.status,
                    tasks_completed: a.tasks_completed,
                    tasks_failed: a.tasks_failed,
                    success_rate: a.success_rate,
                    utilization_score,
                }
            })
            .collect();

        let mut role_distribution = HashMap::new();
        let mut model_distribution = HashMap::new();
        for a in agents {
            *role_distribution.entry(a.role).or_insert(0) += 1;
            *model_distribution.entry(a.model).or_insert(0) += 1;
        }

        let overloaded_agents = utilizations
            .iter()
            .filter(|a| {
                matches!(a.status, AgentStatus::Busy | AgentStatus::Working)
                    && a.utilization_score > 0.8
            })
            .count();
        let underutilized_agents = utilizations
            .iter()
            .filter(|a| a.status == AgentStatus::Idle && a.utilization_score < 0.2)
            .count();

        let queued_by_role = queued_demand_by_role(missions);
        let idle_by_role = idle_counts(agents);
        let mut bottleneck_roles: Vec<AgentRole> = queued_by_role
            .iter()
            .filter(|(role, queued)| {
                **queued >= 1 && idle_by_role.get(*role).copied().unwrap_or(0) == 0
            })
            .map(|(role, _)| *role)
            .collect();
        bottleneck_roles.sort_by_key(|r| r.to_string());

        let rates: Vec<f64> = agents.iter().filter_map(|a| a.success_rate).collect();
        let mean_success_rate = if rates.is_empty() {
            None
        } else {
            Some(rates.iter().sum::<f64>() / rates.len() as f64)
        };

        let queue_depth = missions
            .iter()
            .filter(|m| m.status == MissionStatus::Queued)
            .count();

        WorkloadAnalysis {
            agents: utilizations,
            role_distribution,
            model_distribution,
            overloaded_agents,
            underutilized_agents,
            bottleneck_roles,
            mean_success_rate,
            queue_depth,
        }
    }

    // -----------------------------------------------------------------
    // Queue growth
    // -----------------------------------------------------------------

    /// Add a queue-depth snapshot to the rolling window.
    pub fn record_queue_depth(&self, depth: usize) {
        let mut window = self.depth_window.lock().expect("depth window poisoned");
        let now = Instant::now();
        window.push_back((now, depth));
        while let Some((at, _)) = window.front() {
            if now.duration_since(*at) > self.window {
                window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Missions-per-minute growth over the window; 0 with fewer than two
    /// samples.
    pub fn queue_growth_rate(&self) -> f64 {
        let window = self.depth_window.lock().expect("depth window poisoned");
        let (Some((first_at, first_depth)), Some((last_at, last_depth))) =
            (window.front(), window.back())
        else {
            return 0.0;
        };
        let minutes = last_at.duration_since(*first_at).as_secs_f64() / 60.0;
        if minutes <= 0.0 {
            return 0.0;
        }
        (*last_depth as f64 - *first_depth as f64) / minutes
    }

    // -----------------------------------------------------------------
    // Proactive spawning
    // -----------------------------------------------------------------

    /// Evaluate every spawn trigger against the current snapshots.
    pub fn evaluate_proactive_spawning(
        &self,
        agents: &[AgentMetrics],
        missions: &[Mission],
    ) -> Vec<ProactiveSpawnDecision> {
        let mut decisions = Vec::new();
        let idle_by_role = idle_counts(agents);
        let idle_total: usize = idle_by_role.values().sum();

        // 1. The queue is growing and nobody is free.
        let growth = self.queue_growth_rate();
        if growth > self.triggers.queue_growth_rate && idle_total == 0 {
            decisions.push(ProactiveSpawnDecision {
                should_spawn: true,
                reason: format!("queue growing at {growth:.1}/min with no idle agents"),
                suggested_role: AgentRole::Generalist,
                suggested_model: ModelTier::Sonnet,
                urgency: Urgency::Immediate,
            });
        }

        // 2. A role has backlog and zero idle specialists.
        for (role, queued) in queued_demand_by_role(missions) {
            if queued >= self.triggers.queue_depth_threshold
                && idle_by_role.get(&role).copied().unwrap_or(0) == 0
            {
                decisions.push(ProactiveSpawnDecision {
                    should_spawn: true,
                    reason: format!("{queued} queued missions need a {role} and none are idle"),
                    suggested_role: role,
                    suggested_model: ModelTier::Sonnet,
                    urgency: if queued > 10 {
                        Urgency::Immediate
                    } else {
                        Urgency::Soon
                    },
                });
            }
        }

        // 3. Complex work is piling up with no opus capacity.
        let complex_missions: Vec<&Mission> = missions
            .iter()
            .filter(|m| m.status == MissionStatus::Queued)
            .filter(|m| {
                self.analyzer
                    .analyze(&m.prompt, m.context.as_deref())
                    .tier
                    == ComplexityTier::Complex
            })
            .collect();
        let idle_opus = agents
            .iter()
            .filter(|a| a.model == ModelTier::Opus && a.status == AgentStatus::Idle)
            .count();
        if complex_missions.len() >= self.triggers.task_complexity_backlog && idle_opus == 0 {
            let mut role_counts: HashMap<AgentRole, usize> = HashMap::new();
            for m in &complex_missions {
                *role_counts.entry(dispatch_role_for_kind(m.kind)).or_insert(0) += 1;
            }
            let suggested_role = role_counts
                .into_iter()
                .max_by_key(|(_, count)| *count)
                .map(|(role, _)| role)
                .unwrap_or(AgentRole::Generalist);
            decisions.push(ProactiveSpawnDecision {
                should_spawn: true,
                reason: format!(
                    "{} queued complex tasks and no idle opus workers",
                    complex_missions.len()
                ),
                suggested_role,
                suggested_model: ModelTier::Opus,
                urgency: Urgency::Immediate,
            });
        }

        // 4. Keep a warm spare for every busy role.
        let busy_roles: HashSet<AgentRole> = agents
            .iter()
            .filter(|a| matches!(a.status, AgentStatus::Busy | AgentStatus::Working))
            .map(|a| a.role)
            .collect();
        for role in busy_roles {
            if idle_by_role.get(&role).copied().unwrap_or(0) < self.triggers.idle_agent_minimum {
                decisions.push(ProactiveSpawnDecision {
                    should_spawn: true,
                    reason: format!("no idle spare for busy role {role}"),
                    suggested_role: role,
                    suggested_model: ModelTier::Sonnet,
                    urgency: Urgency::Optional,
                });
            }
        }

        decisions
    }

    /// Act on spawn decisions: sort by urgency, spawn immediate/soon up to
    /// the per-tick cap, skip optional ones. Returns how many spawned.
    pub async fn execute_proactive_spawning(
        &self,
        registry: &AgentRegistry,
        agents: &[AgentMetrics],
        missions: &[Mission],
    ) -> Result<usize> {
        let mut decisions = self.evaluate_proactive_spawning(agents, missions);
        decisions.sort_by_key(|d| d.urgency);

        let mut spawned = 0;
        for decision in decisions {
            if spawned >= self.max_spawns_per_tick {
                break;
            }
            if decision.urgency == Urgency::Optional || !decision.should_spawn {
                continue;
            }
            tracing::info!(
                role = %decision.suggested_role,
                model = %decision.suggested_model,
                urgency = %decision.urgency,
                reason = %decision.reason,
                "proactive spawn"
            );
            registry
                .spawn_agent(SpawnConfig {
                    role: decision.suggested_role,
                    model: decision.suggested_model,
                    ..SpawnConfig::default()
                })
                .await?;
            spawned += 1;
        }
        Ok(spawned)
    }

    // -----------------------------------------------------------------
    // Priority optimization
    // -----------------------------------------------------------------

    /// Compute the target priority for one mission. Rules apply in
    /// sequence over the evolving value, which makes a second pass over
    /// the result a fixed point.
    pub fn target_priority(mission: &Mission, dependents: usize) -> (MissionPriority, &'static str) {
        let age = Utc::now() - mission.created_at;
        let mut priority = mission.priority;
        let mut reason = "unchanged";

        if priority == MissionPriority::Low && age > chrono::Duration::minutes(30) {
            priority = MissionPriority::Normal;
            reason = "aged out of low";
        }
        if priority == MissionPriority::Normal && age > chrono::Duration::minutes(60) {
            priority = MissionPriority::High;
            reason = "aged out of normal";
        }
        if dependents >= 3 && priority != MissionPriority::Critical {
            priority = MissionPriority::Critical;
            reason = "blocking three or more missions";
        }
        if mission.retry_count >= 2 && priority != MissionPriority::Low {
            priority = MissionPriority::Low;
            reason = "quarantined after repeated retries";
        }
        (priority, reason)
    }

    /// Apply the priority rules to every queued/pending mission.
    pub async fn optimize_mission_queue(
        &self,
        queue: &MissionQueue,
    ) -> Result<Vec<PriorityAdjustment>> {
        let snapshot = queue.snapshot().await;

        let mut dependents: HashMap<Uuid, usize> = HashMap::new();
        for m in &snapshot {
            if m.status.is_terminal() {
                continue;
            }
            for dep in &m.depends_on {
                *dependents.entry(*dep).or_insert(0) += 1;
            }
        }

        let mut adjustments = Vec::new();
        for mission in snapshot.iter().filter(|m| {
            matches!(m.status, MissionStatus::Queued | MissionStatus::Pending)
        }) {
            let n_dependents = dependents.get(&mission.id).copied().unwrap_or(0);
            let (target, reason) = Self::target_priority(mission, n_dependents);
            if target != mission.priority {
                queue.set_priority(mission.id, target).await?;
                tracing::info!(
                    mission_id = %mission.id,
                    from = %mission.priority,
                    to = %target,
                    reason,
                    "priority adjusted"
                );
                adjustments.push(PriorityAdjustment {
                    mission_id: mission.id,
                    from: mission.priority,
                    to: target,
                    reason,
                });
            }
        }
        Ok(adjustments)
    }

    // -----------------------------------------------------------------
    // Bottlenecks
    // -----------------------------------------------------------------

    /// Identify systemic bottlenecks from the current snapshots.
    pub fn identify_bottlenecks(
        &self,
        agents: &[AgentMetrics],
        missions: &[Mission],
    ) -> Vec<Bottleneck> {
        let mut bottlenecks = Vec::new();

        // Role shortages, severity by queued count.
        let idle_by_role = idle_counts(agents);
        let mut shortages: Vec<(AgentRole, usize)> = queued_demand_by_role(missions)
            .into_iter()
            .filter(|(role, queued)| {
                *queued >= 1 && idle_by_role.get(role).copied().unwrap_or(0) == 0
            })
            .collect();
        shortages.sort_by(|a, b| b.1.cmp(&a.1));
        for (role, queued) in shortages {
            bottlenecks.push(Bottleneck::RoleShortage { role, queued });
        }

        // Whole-queue backup.
        let queued = missions
            .iter()
            .filter(|m| m.status == MissionStatus::Queued)
            .count();
        if queued > 10 {
            bottlenecks.push(Bottleneck::QueueBackup { queued });
        }

        // Failure spike over the last five minutes.
        let cutoff = Utc::now() - chrono::Duration::minutes(5);
        let recent: Vec<&Mission> = missions
            .iter()
            .filter(|m| {
                matches!(m.status, MissionStatus::Completed | MissionStatus::Failed)
                    && m.completed_at.map(|t| t >= cutoff).unwrap_or(false)
            })
            .collect();
        let failed = recent
            .iter()
            .filter(|m| m.status == MissionStatus::Failed)
            .count();
        if failed >= 3 && !recent.is_empty() && failed as f64 / recent.len() as f64 > 0.3 {
            bottlenecks.push(Bottleneck::FailureSpike {
                failed,
                total: recent.len(),
            });
        }

        // Deep dependency chains.
        if let Some((head, depth)) = deepest_chain(missions) {
            if depth > 3 {
                bottlenecks.push(Bottleneck::DependencyChain { depth, head });
            }
        }

        bottlenecks
    }

    // -----------------------------------------------------------------
    // Auto-optimize
    // -----------------------------------------------------------------

    /// One optimization tick: spawn, detect, re-prioritize, harvest
    /// insights. Returns a summary for logging/API surfaces.
    pub async fn auto_optimize(
        &self,
        registry: &AgentRegistry,
        queue: &MissionQueue,
        learning: &LearningLoop,
    ) -> Result<OptimizeSummary> {
        let agents = registry.metrics_snapshot().await;
        let missions = queue.snapshot().await;
        self.record_queue_depth(
            missions
                .iter()
                .filter(|m| m.status == MissionStatus::Queued)
                .count(),
        );

        let spawned = self
            .execute_proactive_spawning(registry, &agents, &missions)
            .await?;
        let bottlenecks = self.identify_bottlenecks(&agents, &missions);
        let adjustments = self.optimize_mission_queue(queue).await?;
        let insights = learning.efficiency_insights(&missions);

        let summary = OptimizeSummary {
            spawned,
            bottlenecks,
            priority_adjustments: adjustments.len(),
            insights,
        };
        tracing::info!(
            spawned = summary.spawned,
            bottlenecks = summary.bottlenecks.len(),
            priority_adjustments = summary.priority_adjustments,
            "auto-optimize tick"
        );
        Ok(summary)
    }
}

// ---------------------------------------------------------------------------
// Snapshot helpers
// ---------------------------------------------------------------------------

fn idle_counts(agents: &[AgentMetrics]) -> HashMap<AgentRole, usize> {
    let mut counts = HashMap::new();
    for a in agents {
        if a.status == AgentStatus::Idle {
            *counts.entry(a.role).or_insert(0) += 1;
        }
    }
    counts
}

/// Queued missions per dispatch role.
fn queued_demand_by_role(missions: &[Mission]) -> HashMap<AgentRole, usize> {
    let mut counts = HashMap::new();
    for m in missions {
        if m.status == MissionStatus::Queued {
            *counts.entry(dispatch_role_for_kind(m.kind)).or_insert(0) += 1;
        }
    }
    counts
}

/// Longest dependency chain over non-terminal missions, as `(head, depth)`.
/// DFS with a visited set so broken data cannot loop.
fn deepest_chain(missions: &[Mission]) -> Option<(Uuid, usize)> {
    let graph: HashMap<Uuid, &Mission> = missions
        .iter()
        .filter(|m| !m.status.is_terminal())
        .map(|m| (m.id, m))
        .collect();

    fn depth_of(
        id: Uuid,
        graph: &HashMap<Uuid, &Mission>,
        memo: &mut HashMap<Uuid, usize>,
        visiting: &mut HashSet<Uuid>,
    ) -> usize {
        if let Some(d) = memo.get(&id) {
            return *d;
        }
        if !visiting.insert(id) {
            // Cycle guard; treat the back-edge as depth zero.
            return 0;
        }
        let d = match graph.get(&id) {
            Some(mission) => {
                1 + mission
                    .depends_on
                    .iter()
                    .map(|dep| depth_of(*dep, graph, memo, visiting))
                    .max()
                    .unwrap_or(0)
            }
            None => 0,
        };
        visiting.remove(&id);
        memo.insert(id, d);
        d
    }

    let mut memo = HashMap::new();
    let mut best: Option<(Uuid, usize)> = None;
    for id in graph.keys() {
        let mut visiting = HashSet::new();
        let d = depth_of(*id, &graph, &mut memo, &mut visiting);
        if best.map(|(_, bd)| d > bd).unwrap_or(true) {
            best = Some((*id, d));
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use maestro_db::models::AgentStatus;

    fn metrics(
        id: i64,
        role: AgentRole,
        model: ModelTier,
        status: AgentStatus,
        completed: i64,
        failed: i64,
    ) -> AgentMetrics {
        let total = completed + failed;
        AgentMetrics {
            id,
            role,
            model,
            status,
            tasks_completed: completed,
            tasks_failed: failed,
            success_rate: (total > 0).then(|| completed as f64 / total as f64),
            current_mission_id: None,
        }
    }

    fn mission(prompt: &str, kind: MissionKind, status: MissionStatus) -> Mission {
        Mission {
            id: Uuid::new_v4(),
            prompt: prompt.to_owned(),
            context: None,
            priority: MissionPriority::Normal,
            kind,
            status,
            timeout_ms: 300_000,
            max_retries: 3,
            retry_count: 0,
            retry_delay_ms: 0,
            depends_on: vec![],
            assigned_to: None,
            error: None,
            result: None,
            execution_id: None,
            parent_mission_id: None,
            unified_task_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn role_map_matches_mission_kinds() {
        assert_eq!(role_for_mission_kind(MissionKind::Extraction), AgentRole::Researcher);
        assert_eq!(role_for_mission_kind(MissionKind::Analysis), AgentRole::Analyst);
        assert_eq!(role_for_mission_kind(MissionKind::Synthesis), AgentRole::Oracle);
        assert_eq!(role_for_mission_kind(MissionKind::Review), AgentRole::Reviewer);
        assert_eq!(role_for_mission_kind(MissionKind::General), AgentRole::Generalist);
    }

    #[test]
    fn synthesis_never_dispatches_to_the_oracle() {
        assert_eq!(dispatch_role_for_kind(MissionKind::Synthesis), AgentRole::Generalist);
    }

    #[test]
    fn empty_snapshots_produce_no_decisions() {
        let oracle = OracleController::new(SpawnTriggers::default());
        let decisions = oracle.evaluate_proactive_spawning(&[], &[]);
        assert!(decisions.is_empty());
    }

    #[test]
    fn complex_backlog_without_opus_demands_an_opus_worker() {
        let triggers = SpawnTriggers {
            task_complexity_backlog: 2,
            ..SpawnTriggers::default()
        };
        let oracle = OracleController::new(triggers);

        let missions: Vec<Mission> = (0..4)
            .map(|n| {
                mission(
                    &format!("Design the system architecture for module {n}"),
                    MissionKind::General,
                    MissionStatus::Queued,
                )
            })
            .collect();
        // A busy opus agent does not count as idle opus capacity.
        let agents = vec![metrics(1, AgentRole::Coder, ModelTier::Opus, AgentStatus::Busy, 5, 0)];

        let decisions = oracle.evaluate_proactive_spawning(&agents, &missions);
        let opus = decisions
            .iter()
            .find(|d| d.suggested_model == ModelTier::Opus)
            .expect("an opus spawn decision");
        assert!(opus.should_spawn);
        assert_eq!(opus.urgency, Urgency::Immediate);
    }

    #[test]
    fn role_backlog_without_idle_specialists_triggers() {
        let oracle = OracleController::new(SpawnTriggers::default());
        let missions: Vec<Mission> = (0..6)
            .map(|_| mission("look into the data", MissionKind::Analysis, MissionStatus::Queued))
            .collect();
        let agents = vec![metrics(
            1,
            AgentRole::Analyst,
            ModelTier::Sonnet,
            AgentStatus::Busy,
            3,
            0,
        )];

        let decisions = oracle.evaluate_proactive_spawning(&agents, &missions);
        let analyst = decisions
            .iter()
            .find(|d| d.suggested_role == AgentRole::Analyst)
            .expect("an analyst spawn decision");
        assert_eq!(analyst.urgency, Urgency::Soon);
    }

    #[test]
    fn workload_analysis_flags_bottleneck_roles() {
        let oracle = OracleController::new(SpawnTriggers::default());
        let agents = vec![
            metrics(1, AgentRole::Coder, ModelTier::Sonnet, AgentStatus::Busy, 8, 2),
            metrics(2, AgentRole::Tester, ModelTier::Haiku, AgentStatus::Idle, 1, 0),
        ];
        let missions = vec![
            mission("review the change", MissionKind::Review, MissionStatus::Queued),
            mission("more review", MissionKind::Review, MissionStatus::Queued),
        ];

        let analysis = oracle.analyze_workload(&agents, &missions);
        assert_eq!(analysis.queue_depth, 2);
        assert!(analysis.bottleneck_roles.contains(&AgentRole::Reviewer));
        assert_eq!(analysis.role_distribution[&AgentRole::Coder], 1);
        let mean = analysis.mean_success_rate.unwrap();
        assert!((mean - 0.9).abs() < 1e-9);
    }

    #[test]
    fn growth_rate_needs_two_samples() {
        let oracle = OracleController::new(SpawnTriggers::default());
        assert_eq!(oracle.queue_growth_rate(), 0.0);
        oracle.record_queue_depth(3);
        assert_eq!(oracle.queue_growth_rate(), 0.0);
    }

    #[test]
    fn priority_rules_are_a_fixed_point() {
        let mut m = mission("old work", MissionKind::General, MissionStatus::Queued);
        m.priority = MissionPriority::Low;
        m.created_at = Utc::now() - chrono::Duration::minutes(45);

        let (once, _) = OracleController::target_priority(&m, 0);
        assert_eq!(once, MissionPriority::Normal);

        m.priority = once;
        let (twice, _) = OracleController::target_priority(&m, 0);
        assert_eq!(twice, once);
    }

    #[test]
    fn flaky_missions_are_quarantined() {
        let mut m = mission("flaky", MissionKind::General, MissionStatus::Queued);
        m.priority = MissionPriority::High;
        m.retry_count = 2;
        let (target, reason) = OracleController::target_priority(&m, 0);
        assert_eq!(target, MissionPriority::Low);
        assert_eq!(reason, "quarantined after repeated retries");
    }

    #[test]
    fn heavy_dependents_escalate_to_critical() {
        let m = mission("linchpin", MissionKind::General, MissionStatus::Queued);
        let (target, _) = OracleController::target_priority(&m, 3);
        assert_eq!(target, MissionPriority::Critical);
    }

    #[test]
    fn deep_chains_are_reported() {
        let oracle = OracleController::new(SpawnTriggers::default());
        let mut missions: Vec<Mission> = (0..5)
            .map(|n| mission(&format!("step {n}"), MissionKind::General, MissionStatus::Queued))
            .collect();
        for i in 1..5 {
            let dep = missions[i - 1].id;
            missions[i].depends_on.push(dep);
            missions[i].status = MissionStatus::Blocked;
        }
        missions[0].status = MissionStatus::Queued;

        let bottlenecks = oracle.identify_bottlenecks(&[], &missions);
        assert!(bottlenecks
            .iter()
            .any(|b| matches!(b, Bottleneck::DependencyChain { depth, .. } if *depth == 5)));
    }

    #[test]
    fn failure_spike_needs_three_failures() {
        let oracle = OracleController::new(SpawnTriggers::default());
        let mut missions = Vec::new();
        for n in 0..4 {
            let mut m = mission(&format!("m{n}"), MissionKind::General, MissionStatus::Failed);
            m.completed_at = Some(Utc::now());
            missions.push(m);
        }
        let mut ok = mission("fine", MissionKind::General, MissionStatus::Completed);
        ok.completed_at = Some(Utc::now());
        missions.push(ok);

        let bottlenecks = oracle.identify_bottlenecks(&[], &missions);
        assert!(bottlenecks
            .iter()
            .any(|b| matches!(b, Bottleneck::FailureSpike { failed: 4, total: 5 })));
    }
}
