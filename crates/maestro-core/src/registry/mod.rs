//! Agent registry and lifecycle manager.
//!
//! Tracks every worker by id/role/model/status, spawns and retires them
//! through the [`WorkerRuntime`] capability, and keeps the counters the
//! oracle reads. Durable agent rows go through the gateway; the in-memory
//! map mirrors them and additionally holds the live worker handles.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use sqlx::PgPool;
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

use maestro_db::models::{AgentRole, AgentRow, AgentStatus, MissionKind, ModelTier};
use maestro_db::queries::agents as db;

use crate::oracle::role_for_mission_kind;
use crate::runtime::{WorkerEvent, WorkerHandle, WorkerRuntime, WorkerSpec};

/// Caller-supplied fields for spawning one worker.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Explicit agent name; generated from the role when absent.
    pub name: Option<String>,
    pub role: AgentRole,
    pub model: ModelTier,
    pub working_dir: PathBuf,
    pub env_vars: HashMap<String, String>,
    /// Optional isolated worktree for the worker.
    pub worktree: Option<PathBuf>,
    pub auto_restart: bool,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            name: None,
            role: AgentRole::Generalist,
            model: ModelTier::Sonnet,
            working_dir: PathBuf::from("."),
            env_vars: HashMap::new(),
            worktree: None,
            auto_restart: true,
        }
    }
}

/// Result of a health probe.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AgentHealth {
    pub id: i64,
    pub name: String,
    pub status: AgentStatus,
    pub alive: bool,
}

/// Per-agent metrics snapshot consumed by the oracle.
#[derive(Debug, Clone)]
pub struct AgentMetrics {
    pub id: i64,
    pub role: AgentRole,
    pub model: ModelTier,
    pub status: AgentStatus,
    pub tasks_completed: i64,
    pub tasks_failed: i64,
    pub success_rate: Option<f64>,
    pub current_mission_id: Option<Uuid>,
}

struct AgentState {
    row: AgentRow,
    spec: WorkerSpec,
    handle: Option<WorkerHandle>,
}

struct RegistryInner {
    agents: HashMap<i64, AgentState>,
    events_rx: Option<mpsc::Receiver<(i64, WorkerEvent)>>,
}

/// The registry. Cloneable; all clones share one critical section.
#[derive(Clone)]
pub struct AgentRegistry {
    pool: PgPool,
    runtime: Arc<dyn WorkerRuntime>,
    inner: Arc<Mutex<RegistryInner>>,
    events_tx: mpsc::Sender<(i64, WorkerEvent)>,
}

impl AgentRegistry {
    pub fn new(pool: PgPool, runtime: Arc<dyn WorkerRuntime>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(256);
        Self {
            pool,
            runtime,
            inner: Arc::new(Mutex::new(RegistryInner {
                agents: HashMap::new(),
                events_rx: Some(events_rx),
            })),
            events_tx,
        }
    }

    /// Whether missions may be dispatched to agents of this role.
    ///
    /// The oracle role belongs to the controller itself and never receives
    /// dispatched work, even though the routing vocabulary names it.
    pub fn is_dispatchable(role: AgentRole) -> bool {
        role != AgentRole::Oracle
    }

    /// Take the fan-in of worker events. Yields `(agent_id, event)` pairs;
    /// only one consumer (the orchestrator) may take it.
    pub async fn take_event_stream(&self) -> Option<mpsc::Receiver<(i64, WorkerEvent)>> {
        self.inner.lock().await.events_rx.take()
    }

    // -----------------------------------------------------------------
    // Spawning and retirement
    // -----------------------------------------------------------------

    /// Spawn one worker: durable row first (status `starting`), then the
    /// process via the runtime capability, then mark it `idle`.
    pub async fn spawn_agent(&self, cfg: SpawnConfig) -> Result<AgentRow> {
        let name = cfg.name.clone().unwrap_or_else(|| {
            format!("{}-{}", cfg.role, &Uuid::new_v4().simple().to_string()[..8])
        });

        let row = db::insert_agent(
            &self.pool,
            &name,
            cfg.role,
            cfg.model,
            cfg.worktree.as_deref().and_then(|p| p.to_str()),
        )
        .await
        .context("failed to persist agent row")?;
        let agent_id = row.id;

        let spec = WorkerSpec {
            agent_name: name.clone(),
            role: cfg.role,
            model: cfg.model,
            working_dir: cfg.working_dir.clone(),
            env_vars: cfg.env_vars.clone(),
            worktree: cfg.worktree.clone(),
            auto_restart: cfg.auto_restart,
        };

        let handle = match self.runtime.spawn(&spec).await {
            Ok(handle) => handle,
            Err(err) => {
                let _ = db::update_agent_status(&self.pool, agent_id, AgentStatus::Error).await;
                return Err(err).with_context(|| format!("failed to spawn worker for {name}"));
            }
        };

        db::set_agent_pid(&self.pool, agent_id, Some(handle.pid as i32)).await?;
        db::update_agent_status(&self.pool, agent_id, AgentStatus::Idle).await?;

        self.pump_events(agent_id, &handle);

        let mut row = row;
        row.pid = Some(handle.pid as i32);
        row.status = AgentStatus::Idle;

        let mut inner = self.inner.lock().await;
        inner.agents.insert(
            agent_id,
            AgentState {
                row: row.clone(),
                spec,
                handle: Some(handle),
            },
        );

        tracing::info!(agent_id, agent = %name, role = %row.role, model = %row.model, "agent spawned");
        Ok(row)
    }

    /// Spawn `n` workers from the same template, with numbered names.
    pub async fn spawn_pool(&self, n: usize, cfg: SpawnConfig) -> Result<Vec<AgentRow>> {
        let base = cfg
            .name
            .clone()
            .unwrap_or_else(|| cfg.role.to_string());
        let mut rows = Vec::with_capacity(n);
        for i in 1..=n {
            let mut cfg = cfg.clone();
            cfg.name = Some(format!("{base}-{i}"));
            rows.push(self.spawn_agent(cfg).await?);
        }
        Ok(rows)
    }

    /// Forward a worker's event stream into the shared fan-in.
    fn pump_events(&self, agent_id: i64, handle: &WorkerHandle) {
        let mut stream = self.runtime.events(handle);
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                if tx.send((agent_id, event)).await.is_err() {
                    break;
                }
            }
        });
    }

    /// Stop an agent's worker process and mark the row `stopped`.
    pub async fn kill(&self, id: i64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let state = inner
            .agents
            .get_mut(&id)
            .with_context(|| format!("agent {id} not found"))?;

        if let Some(handle) = state.handle.take() {
            self.runtime
                .kill(&handle)
                .await
                .with_context(|| format!("failed to kill worker for agent {id}"))?;
        }
        state.row.status = AgentStatus::Stopped;
        state.row.pid = None;
        db::update_agent_status(&self.pool, id, AgentStatus::Stopped).await?;
        db::set_agent_pid(&self.pool, id, None).await?;

        tracing::info!(agent_id = id, "agent stopped");
        Ok(())
    }

    /// Kill and relaunch an agent's worker with its original spec.
    pub async fn restart(&self, id: i64) -> Result<AgentRow> {
        let spec = {
            let mut inner = self.inner.lock().await;
            let state = inner
                .agents
                .get_mut(&id)
                .with_context(|| format!("agent {id} not found"))?;
            if let Some(handle) = state.handle.take() {
                let _ = self.runtime.kill(&handle).await;
            }
            state.spec.clone()
        };

        let handle = self
            .runtime
            .spawn(&spec)
            .await
            .with_context(|| format!("failed to respawn worker for agent {id}"))?;

        db::set_agent_pid(&self.pool, id, Some(handle.pid as i32)).await?;
        db::update_agent_status(&self.pool, id, AgentStatus::Idle).await?;
        self.pump_events(id, &handle);

        let mut inner = self.inner.lock().await;
        let state = inner
            .agents
            .get_mut(&id)
            .with_context(|| format!("agent {id} vanished during restart"))?;
        state.row.status = AgentStatus::Idle;
        state.row.pid = Some(handle.pid as i32);
        state.row.current_mission_id = None;
        state.handle = Some(handle);

        tracing::info!(agent_id = id, "agent restarted");
        Ok(state.row.clone())
    }

    /// Retire an agent: stop the worker and drop it from the live map.
    /// The durable row stays for history.
    pub async fn retire(&self, id: i64) -> Result<()> {
        self.kill(id).await?;
        let mut inner = self.inner.lock().await;
        inner.agents.remove(&id);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Health
    // -----------------------------------------------------------------

    /// Probe one agent.
    pub async fn health_check(&self, id: i64) -> Option<AgentHealth> {
        let (row, alive) = {
            let inner = self.inner.lock().await;
            let state = inner.agents.get(&id)?;
            let alive = match &state.handle {
                Some(handle) => self.runtime.is_running(handle).await,
                None => false,
            };
            (state.row.clone(), alive)
        };
        Some(AgentHealth {
            id: row.id,
            name: row.name,
            status: row.status,
            alive,
        })
    }

    /// Probe every tracked agent.
    pub async fn health_check_all(&self) -> Vec<AgentHealth> {
        let ids: Vec<i64> = {
            let inner = self.inner.lock().await;
            inner.agents.keys().copied().collect()
        };
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(health) = self.health_check(id).await {
                out.push(health);
            }
        }
        out
    }

    // -----------------------------------------------------------------
    // Selection
    // -----------------------------------------------------------------

    /// Pick an idle agent for a mission kind: role match first, then any
    /// idle generalist, then any idle dispatchable agent.
    pub async fn get_available_agent(&self, kind: Option<MissionKind>) -> Option<AgentRow> {
        let inner = self.inner.lock().await;
        let idle: Vec<&AgentRow> = inner
            .agents
            .values()
            .map(|s| &s.row)
            .filter(|r| r.status.is_available() && Self::is_dispatchable(r.role))
            .collect();

        if let Some(kind) = kind {
            let wanted = role_for_mission_kind(kind);
            if let Some(row) = idle.iter().find(|r| r.role == wanted) {
                return Some((*row).clone());
            }
        }
        if let Some(row) = idle.iter().find(|r| r.role == AgentRole::Generalist) {
            return Some((*row).clone());
        }
        idle.first().map(|r| (*r).clone())
    }

    /// The dispatchable agent with the least finished work, idle first.
    pub async fn get_least_busy_agent(&self) -> Option<AgentRow> {
        let inner = self.inner.lock().await;
        inner
            .agents
            .values()
            .map(|s| &s.row)
            .filter(|r| Self::is_dispatchable(r.role) && !matches!(r.status, AgentStatus::Stopped | AgentStatus::Crashed | AgentStatus::Stopping))
            .min_by_key(|r| (!r.status.is_available(), r.tasks_completed + r.tasks_failed))
            .cloned()
    }

    /// All agents holding a given role.
    pub async fn get_specialists(&self, role: AgentRole) -> Vec<AgentRow> {
        let inner = self.inner.lock().await;
        inner
            .agents
            .values()
            .map(|s| &s.row)
            .filter(|r| r.role == role)
            .cloned()
            .collect()
    }

    /// All agents on a given model tier.
    pub async fn get_agents_by_model(&self, model: ModelTier) -> Vec<AgentRow> {
        let inner = self.inner.lock().await;
        inner
            .agents
            .values()
            .map(|s| &s.row)
            .filter(|r| r.model == model)
            .cloned()
            .collect()
    }

    /// Re-tag an agent with a new role.
    pub async fn assign_role(&self, id: i64, role: AgentRole) -> Result<()> {
        db::set_agent_role(&self.pool, id, role).await?;
        let mut inner = self.inner.lock().await;
        if let Some(state) = inner.agents.get_mut(&id) {
            state.row.role = role;
        }
        tracing::info!(agent_id = id, role = %role, "agent role reassigned");
        Ok(())
    }

    // -----------------------------------------------------------------
    // Mission bookkeeping
    // -----------------------------------------------------------------

    /// Bind a freshly claimed mission to its agent.
    pub async fn assign_mission(&self, agent_id: i64, mission_id: Uuid) -> Result<()> {
        db::set_current_mission(&self.pool, agent_id, Some(mission_id), AgentStatus::Busy).await?;
        let mut inner = self.inner.lock().await;
        if let Some(state) = inner.agents.get_mut(&agent_id) {
            state.row.current_mission_id = Some(mission_id);
            state.row.status = AgentStatus::Busy;
        }
        Ok(())
    }

    /// Roll a finished mission into the owning agent's counters and free
    /// it. Returns the agent id, if the mission was bound to one.
    pub async fn complete_task(
        &self,
        mission_id: Uuid,
        success: bool,
        duration_ms: i64,
    ) -> Result<Option<i64>> {
        let agent_id = {
            let inner = self.inner.lock().await;
            inner
                .agents
                .values()
                .find(|s| s.row.current_mission_id == Some(mission_id))
                .map(|s| s.row.id)
        };
        let Some(agent_id) = agent_id else {
            return Ok(None);
        };

        db::record_task_outcome(&self.pool, agent_id, success, duration_ms).await?;

        let mut inner = self.inner.lock().await;
        if let Some(state) = inner.agents.get_mut(&agent_id) {
            if success {
                state.row.tasks_completed += 1;
            } else {
                state.row.tasks_failed += 1;
            }
            state.row.total_duration_ms += duration_ms;
            state.row.current_mission_id = None;
            state.row.status = AgentStatus::Idle;
        }
        Ok(Some(agent_id))
    }

    /// Apply a worker event to the agent's mirrored status.
    pub async fn apply_event(&self, agent_id: i64, event: &WorkerEvent) {
        let new_status = match event {
            WorkerEvent::Ready => Some(AgentStatus::Idle),
            WorkerEvent::TaskStarted { .. } => Some(AgentStatus::Working),
            WorkerEvent::Error { .. } => Some(AgentStatus::Error),
            WorkerEvent::Exited { .. } => Some(AgentStatus::Crashed),
            _ => None,
        };
        let Some(status) = new_status else { return };

        {
            let mut inner = self.inner.lock().await;
            let Some(state) = inner.agents.get_mut(&agent_id) else {
                return;
            };
            // Ready only promotes out of starting; a busy agent stays busy.
            if status == AgentStatus::Idle && state.row.status != AgentStatus::Starting {
                return;
            }
            state.row.status = status;
        }

        if let Err(err) = db::update_agent_status(&self.pool, agent_id, status).await {
            tracing::warn!(agent_id, error = %err, "agent status not persisted");
        }
    }

    // -----------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------

    pub async fn get_agent(&self, id: i64) -> Option<AgentRow> {
        let inner = self.inner.lock().await;
        inner.agents.get(&id).map(|s| s.row.clone())
    }

    pub async fn list_agents(&self) -> Vec<AgentRow> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<AgentRow> = inner.agents.values().map(|s| s.row.clone()).collect();
        rows.sort_by_key(|r| r.id);
        rows
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.agents.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Idle dispatchable agents per role.
    pub async fn count_idle_by_role(&self) -> HashMap<AgentRole, usize> {
        let inner = self.inner.lock().await;
        let mut counts = HashMap::new();
        for state in inner.agents.values() {
            if state.row.status.is_available() && Self::is_dispatchable(state.row.role) {
                *counts.entry(state.row.role).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Metrics snapshot for the oracle.
    pub async fn metrics_snapshot(&self) -> Vec<AgentMetrics> {
        let inner = self.inner.lock().await;
        inner
            .agents
            .values()
            .map(|s| AgentMetrics {
                id: s.row.id,
                role: s.row.role,
                model: s.row.model,
                status: s.row.status,
                tasks_completed: s.row.tasks_completed,
                tasks_failed: s.row.tasks_failed,
                success_rate: s.row.success_rate(),
                current_mission_id: s.row.current_mission_id,
            })
            .collect()
    }
}
