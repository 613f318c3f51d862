//! The worker runtime seam -- the capability through which the registry
//! launches and supervises long-running worker processes.
//!
//! The PTY substrate itself is an external collaborator; the core only
//! owns this object-safe trait plus the event vocabulary. The default
//! production adapter lives in [`claude_session`]; tests use in-memory
//! fakes.

pub mod claude_session;

use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;

use anyhow::Result;
use async_trait::async_trait;
use futures::Stream;
use uuid::Uuid;

use maestro_db::models::{AgentRole, FailureKind, ModelTier};

/// Everything the runtime needs to launch one worker.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    /// Human-readable agent name (also used for log correlation).
    pub agent_name: String,
    pub role: AgentRole,
    pub model: ModelTier,
    /// Directory the worker runs in.
    pub working_dir: PathBuf,
    /// Extra environment merged into the worker process.
    pub env_vars: HashMap<String, String>,
    /// Optional isolated worktree the worker is confined to.
    pub worktree: Option<PathBuf>,
    /// Whether the substrate should relaunch the worker after a crash.
    pub auto_restart: bool,
}

/// Handle to a spawned worker.
#[derive(Debug)]
pub struct WorkerHandle {
    /// OS process id.
    pub pid: u32,
    /// Stdin of the worker, when the runtime exposes it.
    pub stdin: Option<tokio::process::ChildStdin>,
    pub agent_name: String,
    /// Name of the runtime that produced this handle.
    pub runtime_name: String,
}

/// Events a worker reports back to the control plane.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// The worker finished starting up and can take assignments.
    Ready,
    /// A raw output line, kept for diagnostics.
    Output { line: String },
    /// Progress heartbeat for the mission the worker is running.
    Checkpoint { mission_id: Option<Uuid>, note: String },
    /// The worker began executing a mission.
    TaskStarted { mission_id: Uuid },
    /// The worker finished a mission successfully.
    TaskCompleted {
        mission_id: Uuid,
        output: String,
        duration_ms: i64,
        input_tokens: i64,
        output_tokens: i64,
    },
    /// The worker failed a mission.
    TaskFailed {
        mission_id: Uuid,
        kind: FailureKind,
        message: String,
    },
    /// A non-mission error from the worker.
    Error { message: String },
    /// The worker process exited.
    Exited { code: Option<i32> },
}

/// Capability for launching and supervising worker processes.
///
/// # Object Safety
///
/// This trait is object-safe: every method either returns a concrete type
/// or a boxed trait object, so registries can hold `Arc<dyn WorkerRuntime>`.
#[async_trait]
pub trait WorkerRuntime: Send + Sync {
    /// Human-readable name for this runtime (e.g. "claude-session").
    fn name(&self) -> &str;

    /// Launch a worker for the given spec.
    async fn spawn(&self, spec: &WorkerSpec) -> Result<WorkerHandle>;

    /// Stream of events from a running worker. Ends after
    /// [`WorkerEvent::Exited`].
    fn events(&self, handle: &WorkerHandle) -> Pin<Box<dyn Stream<Item = WorkerEvent> + Send>>;

    /// Write a message (e.g. a mission prompt) to the worker's stdin.
    async fn send(&self, handle: &WorkerHandle, message: &str) -> Result<()>;

    /// Terminate the worker. Implementations should terminate gracefully
    /// first, then force-kill if the process lingers.
    async fn kill(&self, handle: &WorkerHandle) -> Result<()>;

    /// Whether the worker process is still alive.
    async fn is_running(&self, handle: &WorkerHandle) -> bool;
}

// Compile-time assertion: WorkerRuntime must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn WorkerRuntime) {}
};
