//! Worker runtime adapter that hosts a Claude CLI session per agent.
//!
//! Spawns `claude --output-format stream-json` as a long-lived subprocess
//! and parses its JSONL output into [`WorkerEvent`] variants. Mission
//! prompts are written to the worker's stdin; progress checkpoints arrive
//! as `checkpoint` lines on stdout.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::Stream;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use maestro_db::models::{FailureKind, ModelTier};

use super::{WorkerEvent, WorkerHandle, WorkerRuntime, WorkerSpec};

/// Internal state kept per spawned worker process.
struct ProcessState {
    /// The child process handle (for kill / is_running).
    child: Child,
    /// Stdout reader; `Option` so it can be `.take()`-ed once for streaming.
    stdout: Option<ChildStdout>,
    /// Stdin writer kept here so `send` works through a shared handle.
    stdin: Option<ChildStdin>,
}

/// Runtime adapter for Claude CLI sessions.
#[derive(Clone)]
pub struct ClaudeSessionRuntime {
    /// Path to the `claude` binary. Defaults to `"claude"` (found via `$PATH`).
    binary_path: String,
    /// Per-process bookkeeping, keyed by OS pid.
    processes: Arc<Mutex<HashMap<u32, ProcessState>>>,
}

impl std::fmt::Debug for ClaudeSessionRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaudeSessionRuntime")
            .field("binary_path", &self.binary_path)
            .finish()
    }
}

impl ClaudeSessionRuntime {
    /// Create a runtime that will look for `claude` on `$PATH`.
    pub fn new() -> Self {
        Self {
            binary_path: "claude".to_string(),
            processes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Use an explicit binary path.
    ///
    /// Useful for testing or when the CLI is installed in a non-standard
    /// location.
    pub fn with_binary(path: impl Into<String>) -> Self {
        Self {
            binary_path: path.into(),
            processes: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for ClaudeSessionRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a capability tier onto the model alias the CLI understands.
fn model_alias(tier: ModelTier) -> &'static str {
    match tier {
        ModelTier::Haiku => "haiku",
        ModelTier::Sonnet => "sonnet",
        ModelTier::Opus => "opus",
    }
}

// ---------------------------------------------------------------------------
// JSONL parsing helpers
// ---------------------------------------------------------------------------

/// Parse a single JSONL line from the worker's stream output into zero or
/// more [`WorkerEvent`] values.
///
/// Returns `Err` if the line is not valid JSON; callers should treat that
/// as a warning and continue reading.
fn parse_stream_line(line: &str) -> Result<Vec<WorkerEvent>> {
    let v: serde_json::Value =
        serde_json::from_str(line).context("malformed JSON in worker output")?;

    let mut events = Vec::new();
    let event_type = v.get("type").and_then(|t| t.as_str()).unwrap_or("");

    match event_type {
        "ready" | "system" => {
            events.push(WorkerEvent::Ready);
        }

        "checkpoint" => {
            let mission_id = v
                .get("mission_id")
                .and_then(|m| m.as_str())
                .and_then(|m| Uuid::parse_str(m).ok());
            let note = v
                .get("note")
                .and_then(|n| n.as_str())
                .unwrap_or("")
                .to_string();
            events.push(WorkerEvent::Checkpoint { mission_id, note });
        }

        "task_started" => {
            if let Some(mission_id) = parse_mission_id(&v) {
                events.push(WorkerEvent::TaskStarted { mission_id });
            }
        }

        "task_completed" | "result" => {
            if let Some(mission_id) = parse_mission_id(&v) {
                let output = v
                    .get("result")
                    .or_else(|| v.get("output"))
                    .and_then(|r| r.as_str())
                    .unwrap_or("")
                    .to_string();
                let duration_ms = v
                    .get("duration_ms")
                    .and_then(|d| d.as_i64())
                    .unwrap_or(0);
                let (input_tokens, output_tokens) = parse_usage(&v);
                events.push(WorkerEvent::TaskCompleted {
                    mission_id,
                    output,
                    duration_ms,
                    input_tokens,
                    output_tokens,
                });
            }
        }

        "task_failed" => {
            if let Some(mission_id) = parse_mission_id(&v) {
                let kind = v
                    .get("kind")
                    .and_then(|k| k.as_str())
                    .and_then(|k| k.parse::<FailureKind>().ok())
                    .unwrap_or(FailureKind::Unknown);
                let message = v
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("worker reported failure")
                    .to_string();
                events.push(WorkerEvent::TaskFailed {
                    mission_id,
                    kind,
                    message,
                });
            }
        }

        "assistant" | "message" => {
            // Conversational output; keep the text lines for diagnostics.
            if let Some(content) = v
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(|c| c.as_array())
            {
                for block in content {
                    if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                        events.push(WorkerEvent::Output {
                            line: text.to_string(),
                        });
                    }
                }
            } else if let Some(text) = v.get("content").and_then(|c| c.as_str()) {
                events.push(WorkerEvent::Output {
                    line: text.to_string(),
                });
            }
        }

        "error" => {
            let message = v
                .get("error")
                .and_then(|e| e.get("message").and_then(|m| m.as_str()))
                .or_else(|| v.get("message").and_then(|m| m.as_str()))
                .unwrap_or("unknown error")
                .to_string();
            events.push(WorkerEvent::Error { message });
        }

        other => {
            debug!(event_type = other, "ignoring unrecognised stream event type");
        }
    }

    Ok(events)
}

fn parse_mission_id(v: &serde_json::Value) -> Option<Uuid> {
    v.get("mission_id")
        .and_then(|m| m.as_str())
        .and_then(|m| Uuid::parse_str(m).ok())
}

fn parse_usage(v: &serde_json::Value) -> (i64, i64) {
    let usage = v.get("usage");
    let input = usage
        .and_then(|u| u.get("input_tokens"))
        .and_then(|t| t.as_i64())
        .unwrap_or(0);
    let output = usage
        .and_then(|u| u.get("output_tokens"))
        .and_then(|t| t.as_i64())
        .unwrap_or(0);
    (input, output)
}

// ---------------------------------------------------------------------------
// WorkerRuntime implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl WorkerRuntime for ClaudeSessionRuntime {
    fn name(&self) -> &str {
        "claude-session"
    }

    async fn spawn(&self, spec: &WorkerSpec) -> Result<WorkerHandle> {
        let system_prompt = format!(
            "You are {name}, a {role} worker in an orchestrated fleet. \
             Missions arrive as JSON lines on stdin. Report progress with \
             checkpoint lines and finish each mission with a task_completed \
             or task_failed line.",
            name = spec.agent_name,
            role = spec.role,
        );

        let mut cmd = Command::new(&self.binary_path);
        cmd.arg("--output-format")
            .arg("stream-json")
            .arg("--model")
            .arg(model_alias(spec.model))
            .arg("--append-system-prompt")
            .arg(&system_prompt);

        let working_dir = spec.worktree.as_ref().unwrap_or(&spec.working_dir);
        cmd.current_dir(working_dir);

        // Merge the extra environment; never replace the inherited one.
        for (key, value) in &spec.env_vars {
            cmd.env(key, value);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::null());

        let mut child = cmd.spawn().with_context(|| {
            format!(
                "failed to spawn worker binary at '{}' -- is it installed and on PATH?",
                self.binary_path
            )
        })?;

        let pid = child.id().context("child process has no pid")?;
        let stdout = child.stdout.take();
        let stdin = child.stdin.take();

        {
            let mut processes = self.processes.lock().await;
            processes.insert(
                pid,
                ProcessState {
                    child,
                    stdout,
                    stdin,
                },
            );
        }

        tracing::info!(
            agent = %spec.agent_name,
            pid,
            model = %spec.model,
            "worker session spawned"
        );

        Ok(WorkerHandle {
            pid,
            stdin: None,
            agent_name: spec.agent_name.clone(),
            runtime_name: self.name().to_string(),
        })
    }

    fn events(&self, handle: &WorkerHandle) -> Pin<Box<dyn Stream<Item = WorkerEvent> + Send>> {
        let pid = handle.pid;
        let processes = Arc::clone(&self.processes);

        let stream = async_stream::stream! {
            // Take stdout out of the process state; only one consumer may
            // stream a given worker.
            let stdout = {
                let mut procs = processes.lock().await;
                procs.get_mut(&pid).and_then(|state| state.stdout.take())
            };

            let Some(stdout) = stdout else {
                warn!(pid, "no stdout available -- events already consumed or process missing");
                yield WorkerEvent::Error {
                    message: "stdout not available (already consumed or process not found)".to_string(),
                };
                yield WorkerEvent::Exited { code: None };
                return;
            };

            let reader = BufReader::new(stdout);
            let mut lines = reader.lines();

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        match parse_stream_line(trimmed) {
                            Ok(events) => {
                                for event in events {
                                    yield event;
                                }
                            }
                            Err(e) => {
                                warn!(line = trimmed, error = %e, "skipping malformed JSONL line");
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "error reading worker stdout");
                        yield WorkerEvent::Error {
                            message: format!("stdout read error: {e}"),
                        };
                        break;
                    }
                }
            }

            // Surface the exit code once stdout closes.
            let code = {
                let mut procs = processes.lock().await;
                match procs.get_mut(&pid) {
                    Some(state) => state.child.try_wait().ok().flatten().and_then(|s| s.code()),
                    None => None,
                }
            };
            yield WorkerEvent::Exited { code };
        };

        Box::pin(stream)
    }

    async fn send(&self, handle: &WorkerHandle, message: &str) -> Result<()> {
        let mut processes = self.processes.lock().await;
        let state = processes
            .get_mut(&handle.pid)
            .with_context(|| format!("no live worker with pid {}", handle.pid))?;
        let stdin = state
            .stdin
            .as_mut()
            .context("worker stdin already closed")?;

        stdin
            .write_all(message.as_bytes())
            .await
            .context("failed to write to worker stdin")?;
        stdin
            .write_all(b"\n")
            .await
            .context("failed to write newline to worker stdin")?;
        stdin.flush().await.context("failed to flush worker stdin")?;
        Ok(())
    }

    async fn kill(&self, handle: &WorkerHandle) -> Result<()> {
        let pid = handle.pid;
        let mut processes = self.processes.lock().await;

        if let Some(state) = processes.get_mut(&pid) {
            // SIGTERM first so the session can flush its transcript.
            #[cfg(unix)]
            {
                // SAFETY: pid is a valid u32 from a child we spawned.
                let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
                if ret != 0 {
                    warn!(pid, "SIGTERM failed, proceeding to SIGKILL");
                }
            }

            let exited = tokio::time::timeout(
                std::time::Duration::from_secs(5),
                state.child.wait(),
            )
            .await;

            match exited {
                Ok(Ok(_status)) => {
                    debug!(pid, "worker exited after SIGTERM");
                }
                _ => {
                    debug!(pid, "worker did not exit after SIGTERM, sending SIGKILL");
                    let _ = state.child.kill().await;
                }
            }

            processes.remove(&pid);
        } else {
            debug!(pid, "kill called but worker not in map (already exited?)");
        }

        Ok(())
    }

    async fn is_running(&self, handle: &WorkerHandle) -> bool {
        let pid = handle.pid;
        let mut processes = self.processes.lock().await;

        if let Some(state) = processes.get_mut(&pid) {
            match state.child.try_wait() {
                Ok(Some(_status)) => {
                    processes.remove(&pid);
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    warn!(pid, error = %e, "error checking worker status");
                    false
                }
            }
        } else {
            false
        }
    }
}
