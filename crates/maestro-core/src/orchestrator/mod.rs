//! The root orchestrator: owns every component, drives the dispatcher
//! tick, fans in worker events, and runs the periodic oracle and cleanup
//! loops.
//!
//! Constructed explicitly at startup; capability handles (store pool,
//! worker runtime, LLM provider, semantic index) are passed in and
//! flow downward. Nothing here is global.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use maestro_db::models::{
    FailureKind, Mission, MissionFailure, MissionOutcome, MissionStatus,
};
use maestro_db::queries::{executions, unified_tasks};

use crate::delivery::{DeliveryHub, MissionAssignment};
use crate::feedback::FeedbackLoop;
use crate::index::IndexWriteQueue;
use crate::learning::LearningLoop;
use crate::llm::LanguageModel;
use crate::oracle::{OracleController, SpawnTriggers};
use crate::queue::{MissionQueue, QueueConfig};
use crate::registry::{AgentRegistry, SpawnConfig};
use crate::router::{FleetView, Router};
use crate::runtime::{WorkerEvent, WorkerRuntime};
use crate::decomposer::Decomposer;

/// Control-plane timing knobs.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How often the dispatcher looks for ready missions.
    pub dispatch_interval: Duration,
    /// How often the oracle auto-optimize tick runs.
    pub oracle_interval: Duration,
    /// Timeout enforcer period.
    pub timeout_check_interval: Duration,
    /// How often terminal missions are dropped from memory.
    pub cleanup_interval: Duration,
    /// Terminal missions older than this leave the in-memory mirror.
    pub cleanup_age: Duration,
    /// How long shutdown waits for in-flight events to drain.
    pub drain_deadline: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            dispatch_interval: Duration::from_millis(500),
            oracle_interval: Duration::from_secs(60),
            timeout_check_interval: Duration::from_millis(5_000),
            cleanup_interval: Duration::from_secs(600),
            cleanup_age: Duration::from_millis(3_600_000),
            drain_deadline: Duration::from_secs(10),
        }
    }
}

/// The root value owning the core's components.
pub struct Orchestrator {
    pool: PgPool,
    queue: MissionQueue,
    registry: AgentRegistry,
    delivery: DeliveryHub,
    router: Router,
    decomposer: Decomposer,
    oracle: OracleController,
    learning: Arc<LearningLoop>,
    feedback: Arc<FeedbackLoop>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Wire the components together from the capability handles.
    pub fn new(
        pool: PgPool,
        runtime: Arc<dyn WorkerRuntime>,
        llm: Option<Arc<dyn LanguageModel>>,
        index: Option<IndexWriteQueue>,
        queue_config: QueueConfig,
        triggers: SpawnTriggers,
        config: OrchestratorConfig,
    ) -> Self {
        let queue = MissionQueue::new(pool.clone(), queue_config);
        let registry = AgentRegistry::new(pool.clone(), runtime);
        let delivery = DeliveryHub::new(pool.clone());
        let router = Router::new(llm.clone());
        let decomposer = Decomposer::new(llm);
        let oracle = OracleController::new(triggers);
        let learning = Arc::new(LearningLoop::new(pool.clone(), index));
        let feedback = Arc::new(FeedbackLoop::new(pool.clone()));

        Self {
            pool,
            queue,
            registry,
            delivery,
            router,
            decomposer,
            oracle,
            learning,
            feedback,
            config,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn queue(&self) -> &MissionQueue {
        &self.queue
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn delivery(&self) -> &DeliveryHub {
        &self.delivery
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn decomposer(&self) -> &Decomposer {
        &self.decomposer
    }

    pub fn oracle(&self) -> &OracleController {
        &self.oracle
    }

    pub fn learning(&self) -> &LearningLoop {
        &self.learning
    }

    pub fn feedback(&self) -> &FeedbackLoop {
        &self.feedback
    }

    /// Startup recovery: rebuild the queue from the store and start the
    /// timeout enforcer.
    pub async fn start(&self) -> Result<usize> {
        let recovered = self.queue.load_from_db().await?;
        self.queue
            .start_timeout_enforcement(
                self.delivery.checkpoints(),
                self.config.timeout_check_interval,
            )
            .await;
        Ok(recovered)
    }

    /// Drive the control plane until cancelled, then drain and stop.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut events = self
            .registry
            .take_event_stream()
            .await
            .context("worker event stream was already taken")?;

        let mut dispatch = tokio::time::interval(self.config.dispatch_interval);
        dispatch.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut oracle_tick = tokio::time::interval(self.config.oracle_interval);
        oracle_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut cleanup_tick = tokio::time::interval(self.config.cleanup_interval);
        cleanup_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!("orchestrator control plane running");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = dispatch.tick() => {
                    if let Err(err) = self.dispatch_tick().await {
                        tracing::warn!(error = %err, "dispatch tick failed");
                    }
                }
                maybe_event = events.recv() => {
                    match maybe_event {
                        Some((agent_id, event)) => self.handle_worker_event(agent_id, event).await,
                        None => {
                            tracing::warn!("worker event channel closed");
                            break;
                        }
                    }
                }
                _ = oracle_tick.tick() => {
                    if let Err(err) = self
                        .oracle
                        .auto_optimize(&self.registry, &self.queue, &self.learning)
                        .await
                    {
                        tracing::warn!(error = %err, "auto-optimize tick failed");
                    }
                }
                _ = cleanup_tick.tick() => {
                    self.queue.cleanup(self.config.cleanup_age).await;
                }
            }
        }

        // Drain events already in flight so final completions persist.
        let deadline = tokio::time::Instant::now() + self.config.drain_deadline;
        loop {
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Some((agent_id, event))) => self.handle_worker_event(agent_id, event).await,
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!("drain deadline expired with events still in flight");
                    break;
                }
            }
        }

        self.queue.stop_timeout_enforcement().await;
        tracing::info!("orchestrator control plane stopped");
        Ok(())
    }

    /// Admit work through the router/decomposer front door.
    ///
    /// A task the router marks for decomposition becomes a DAG of
    /// missions wired together through `depends_on`; anything else is
    /// enqueued whole. Returns every admitted mission id, in dependency
    /// order.
    pub async fn distribute(
        &self,
        req: crate::queue::EnqueueRequest,
    ) -> Result<Vec<Uuid>, crate::error::QueueError> {
        let view = FleetView {
            idle_by_role: self.registry.count_idle_by_role().await,
            queue_depth: self.queue.queued_depth().await,
            agents_summary: self.agents_summary().await,
        };
        let decision = self
            .router
            .route(&req.prompt, req.context.as_deref(), Some(req.kind), &view, &[])
            .await;

        if !decision.should_decompose {
            return Ok(vec![self.queue.enqueue(req).await?]);
        }

        let plan = self
            .decomposer
            .decompose(&req.prompt, req.context.as_deref())
            .await;
        if plan.subtasks.len() <= 1 {
            return Ok(vec![self.queue.enqueue(req).await?]);
        }

        tracing::info!(
            subtasks = plan.subtasks.len(),
            order = ?plan.execution_order,
            "task decomposed into a mission DAG"
        );

        // Admit in dependency order so every depends_on edge points at an
        // already-admitted mission.
        let mut id_map: std::collections::HashMap<String, Uuid> = std::collections::HashMap::new();
        let mut admitted = Vec::with_capacity(plan.subtasks.len());
        let mut remaining: Vec<&crate::decomposer::Subtask> = plan.subtasks.iter().collect();
        while !remaining.is_empty() {
            let ready_pos = remaining
                .iter()
                .position(|s| s.depends_on.iter().all(|d| id_map.contains_key(d)));
            // The plan was validated acyclic, so something is always ready.
            let Some(pos) = ready_pos else {
                return Err(crate::error::QueueError::Validation(
                    "decomposition plan is not a DAG".into(),
                ));
            };
            let subtask = remaining.remove(pos);

            let depends_on = subtask
                .depends_on
                .iter()
                .filter_map(|d| id_map.get(d).copied())
                .collect();
            let mission_id = self
                .queue
                .enqueue(crate::queue::EnqueueRequest {
                    prompt: subtask.prompt.clone(),
                    context: req.context.clone(),
                    priority: req.priority,
                    kind: req.kind,
                    timeout_ms: req.timeout_ms,
                    max_retries: req.max_retries,
                    retry_delay_ms: req.retry_delay_ms,
                    depends_on,
                    parent_mission_id: req.parent_mission_id,
                    unified_task_id: req.unified_task_id,
                })
                .await?;
            id_map.insert(subtask.id.clone(), mission_id);
            admitted.push(mission_id);
        }
        Ok(admitted)
    }

    /// One dispatcher pass: match ready missions to idle agents until one
    /// side runs out.
    pub async fn dispatch_tick(&self) -> Result<()> {
        let mut spawned_this_tick = false;
        loop {
            let Some(next) = self.queue.peek().await else {
                break;
            };

            let view = FleetView {
                idle_by_role: self.registry.count_idle_by_role().await,
                queue_depth: self.queue.queued_depth().await,
                agents_summary: self.agents_summary().await,
            };
            let learnings: Vec<String> = self
                .learning
                .suggest_learnings(&next.prompt)
                .await
                .unwrap_or_default()
                .into_iter()
                .map(|l| l.title)
                .collect();
            let decision = self
                .router
                .route(
                    &next.prompt,
                    next.context.as_deref(),
                    Some(next.kind),
                    &view,
                    &learnings,
                )
                .await;

            let mut agent = {
                let specialists = self.registry.get_specialists(decision.recommended_role).await;
                specialists
                    .into_iter()
                    .find(|a| a.status.is_available())
                    .filter(|a| AgentRegistry::is_dispatchable(a.role))
            };
            if agent.is_none() {
                agent = self.registry.get_available_agent(Some(next.kind)).await;
            }

            let Some(agent) = agent else {
                if decision.should_spawn && !spawned_this_tick {
                    spawned_this_tick = true;
                    let role = if AgentRegistry::is_dispatchable(decision.recommended_role) {
                        decision.recommended_role
                    } else {
                        maestro_db::models::AgentRole::Generalist
                    };
                    tracing::info!(
                        role = %role,
                        model = %decision.recommended_model,
                        reason = decision.spawn_reason.as_deref().unwrap_or(""),
                        "router-triggered spawn"
                    );
                    self.registry
                        .spawn_agent(SpawnConfig {
                            role,
                            model: decision.recommended_model,
                            ..SpawnConfig::default()
                        })
                        .await?;
                    continue;
                }
                break;
            };

            let Some(mission) = self.queue.dequeue(agent.id).await? else {
                break;
            };
            let execution_id = mission
                .execution_id
                .clone()
                .context("claimed mission lost its execution id")?;

            executions::insert_execution(&self.pool, &execution_id, agent.id, &mission, None)
                .await?;
            self.registry.assign_mission(agent.id, mission.id).await?;

            let mission_id = mission.id;
            self.delivery
                .deliver(MissionAssignment {
                    mission,
                    execution_id,
                    agent_id: agent.id,
                })
                .await?;
            tracing::info!(mission_id = %mission_id, agent_id = agent.id, "mission dispatched");
        }
        Ok(())
    }

    async fn agents_summary(&self) -> String {
        self.registry
            .list_agents()
            .await
            .iter()
            .map(|a| format!("#{} {} ({}, {}, {})", a.id, a.name, a.role, a.model, a.status))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Apply one worker event to the control plane.
    pub async fn handle_worker_event(&self, agent_id: i64, event: WorkerEvent) {
        self.registry.apply_event(agent_id, &event).await;

        match event {
            WorkerEvent::Checkpoint { mission_id, .. } => {
                let mission_id = match mission_id {
                    Some(id) => Some(id),
                    None => self
                        .registry
                        .get_agent(agent_id)
                        .await
                        .and_then(|a| a.current_mission_id),
                };
                if let Some(id) = mission_id {
                    self.delivery.record_checkpoint(id);
                }
            }

            WorkerEvent::TaskStarted { mission_id } => {
                self.delivery.record_checkpoint(mission_id);
                if let Err(err) = self.delivery.acknowledge(mission_id).await {
                    tracing::warn!(mission_id = %mission_id, error = %err, "inbox ack failed");
                }
            }

            WorkerEvent::TaskCompleted {
                mission_id,
                output,
                duration_ms,
                input_tokens,
                output_tokens,
            } => {
                let outcome = MissionOutcome {
                    output,
                    duration_ms,
                    input_tokens,
                    output_tokens,
                };
                self.finish_mission(agent_id, mission_id, Ok(outcome)).await;
            }

            WorkerEvent::TaskFailed {
                mission_id,
                kind,
                message,
            } => {
                let failure = MissionFailure::new(kind, message);
                self.finish_mission(agent_id, mission_id, Err(failure)).await;
            }

            WorkerEvent::Exited { code } => {
                // A worker that dies mid-mission takes its execution down
                // with it; crashes are not recoverable.
                if let Some(mission_id) = self
                    .registry
                    .get_agent(agent_id)
                    .await
                    .and_then(|a| a.current_mission_id)
                {
                    let failure = MissionFailure::new(
                        FailureKind::Crash,
                        format!("worker exited with code {code:?} mid-mission"),
                    );
                    self.finish_mission(agent_id, mission_id, Err(failure)).await;
                }
                self.delivery.detach_agent(agent_id);
            }

            WorkerEvent::Output { line } => {
                tracing::debug!(agent_id, line = %line, "worker output");
            }

            WorkerEvent::Ready | WorkerEvent::Error { .. } => {}
        }
    }

    /// Shared completion/failure path: queue transition, execution row,
    /// agent counters, learning harvest, unified-task close.
    async fn finish_mission(
        &self,
        agent_id: i64,
        mission_id: Uuid,
        outcome: Result<MissionOutcome, MissionFailure>,
    ) {
        let before = self.queue.get_mission(mission_id).await;
        let execution_id = before.as_ref().and_then(|m| m.execution_id.clone());
        let duration_ms = match &outcome {
            Ok(result) => result.duration_ms,
            Err(_) => before
                .as_ref()
                .and_then(|m| m.started_at)
                .map(|s| (chrono::Utc::now() - s).num_milliseconds().max(0))
                .unwrap_or(0),
        };
        let success = outcome.is_ok();

        match outcome {
            Ok(result) => {
                if let Some(execution_id) = &execution_id {
                    if let Err(err) = executions::finish_execution(
                        &self.pool,
                        execution_id,
                        MissionStatus::Completed,
                        Some(&result),
                        None,
                    )
                    .await
                    {
                        tracing::warn!(mission_id = %mission_id, error = %err, "execution row not closed");
                    }
                }
                if let Err(err) = self.queue.complete(mission_id, result).await {
                    tracing::warn!(mission_id = %mission_id, error = %err, "completion not recorded");
                    return;
                }
            }
            Err(failure) => {
                if let Some(execution_id) = &execution_id {
                    if let Err(err) = executions::finish_execution(
                        &self.pool,
                        execution_id,
                        MissionStatus::Failed,
                        None,
                        Some(&failure),
                    )
                    .await
                    {
                        tracing::warn!(mission_id = %mission_id, error = %err, "execution row not closed");
                    }
                }
                if let Err(err) = self.queue.fail(mission_id, failure).await {
                    tracing::warn!(mission_id = %mission_id, error = %err, "failure not recorded");
                    return;
                }
            }
        }

        if let Err(err) = self
            .registry
            .complete_task(mission_id, success, duration_ms)
            .await
        {
            tracing::warn!(agent_id, error = %err, "agent counters not updated");
        }

        self.delivery.checkpoints().clear(mission_id);
        if let Err(err) = self.delivery.acknowledge(mission_id).await {
            tracing::debug!(mission_id = %mission_id, error = %err, "inbox ack on finish failed");
        }

        if let Some(after) = self.queue.get_mission(mission_id).await {
            match after.status {
                MissionStatus::Completed => {
                    if let Err(err) = self.learning.harvest_from_mission(&after).await {
                        tracing::warn!(mission_id = %mission_id, error = %err, "learning harvest failed");
                    }
                    self.maybe_close_unified_task(&after).await;
                }
                MissionStatus::Failed => {
                    let analysis = self.learning.analyze_failure(&after).await;
                    tracing::warn!(
                        mission_id = %mission_id,
                        category = %analysis.category,
                        suggestion = %analysis.suggestion,
                        "mission failure analyzed"
                    );
                }
                _ => {}
            }
        }
    }

    async fn maybe_close_unified_task(&self, mission: &Mission) {
        let Some(unified_task_id) = mission.unified_task_id else {
            return;
        };
        match unified_tasks::close_if_missions_done(&self.pool, unified_task_id).await {
            Ok(true) => {
                tracing::info!(unified_task_id, "unified task closed");
            }
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(unified_task_id, error = %err, "unified-task close check failed");
            }
        }
    }
}
