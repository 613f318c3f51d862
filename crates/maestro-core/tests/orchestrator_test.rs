//! End-to-end control-plane tests with a scripted worker runtime:
//! distribute -> dispatch -> worker events -> completion bookkeeping,
//! plus the inbox redelivery path.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use futures::Stream;

use maestro_core::delivery::DeliveryPath;
use maestro_core::orchestrator::{Orchestrator, OrchestratorConfig};
use maestro_core::oracle::SpawnTriggers;
use maestro_core::queue::{EnqueueRequest, QueueConfig};
use maestro_core::registry::SpawnConfig;
use maestro_core::runtime::{WorkerEvent, WorkerHandle, WorkerRuntime, WorkerSpec};
use maestro_db::models::{
    AgentStatus, FailureKind, MissionKind, MissionPriority, MissionStatus, TaskDomain,
    UnifiedTaskStatus,
};
use maestro_db::queries::{executions, unified_tasks};
use maestro_test_utils::{create_test_db, drop_test_db};

/// Runtime whose workers never speak; the tests feed events by hand.
struct SilentRuntime {
    next_pid: AtomicU32,
}

impl SilentRuntime {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            next_pid: AtomicU32::new(1),
        })
    }
}

#[async_trait]
impl WorkerRuntime for SilentRuntime {
    fn name(&self) -> &str {
        "silent"
    }

    async fn spawn(&self, spec: &WorkerSpec) -> Result<WorkerHandle> {
        Ok(WorkerHandle {
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
            stdin: None,
            agent_name: spec.agent_name.clone(),
            runtime_name: "silent".to_string(),
        })
    }

    fn events(&self, _handle: &WorkerHandle) -> Pin<Box<dyn Stream<Item = WorkerEvent> + Send>> {
        Box::pin(futures::stream::pending())
    }

    async fn send(&self, _handle: &WorkerHandle, _message: &str) -> Result<()> {
        Ok(())
    }

    async fn kill(&self, _handle: &WorkerHandle) -> Result<()> {
        Ok(())
    }

    async fn is_running(&self, _handle: &WorkerHandle) -> bool {
        true
    }
}

fn orchestrator(pool: sqlx::PgPool) -> Orchestrator {
    Orchestrator::new(
        pool,
        SilentRuntime::new(),
        None,
        None,
        QueueConfig::default(),
        SpawnTriggers::default(),
        OrchestratorConfig::default(),
    )
}

#[tokio::test]
async fn dispatch_completes_a_mission_end_to_end() {
    let (pool, db_name) = create_test_db().await;
    let orch = orchestrator(pool.clone());
    orch.start().await.unwrap();

    let task = unified_tasks::insert_unified_task(
        &pool,
        "one-mission objective",
        None,
        TaskDomain::Project,
        MissionPriority::Normal,
        None,
        None,
    )
    .await
    .unwrap();

    let agent = orch
        .registry()
        .spawn_agent(SpawnConfig::default())
        .await
        .unwrap();
    let mut assignments = orch.delivery().attach_agent(agent.id, 8);

    let ids = orch
        .distribute(EnqueueRequest {
            prompt: "summarize the incident log".into(),
            unified_task_id: Some(task.id),
            ..EnqueueRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(ids.len(), 1);
    let mission_id = ids[0];

    orch.dispatch_tick().await.unwrap();

    // The assignment arrived on the streaming channel.
    let assignment = assignments.try_recv().expect("streamed assignment");
    assert_eq!(assignment.mission.id, mission_id);
    assert_eq!(assignment.agent_id, agent.id);
    let execution_id = assignment.execution_id.clone();

    assert_eq!(
        orch.registry().get_agent(agent.id).await.unwrap().status,
        AgentStatus::Busy
    );

    // The worker reports progress and finishes.
    orch.handle_worker_event(
        agent.id,
        WorkerEvent::TaskStarted {
            mission_id,
        },
    )
    .await;
    orch.handle_worker_event(
        agent.id,
        WorkerEvent::TaskCompleted {
            mission_id,
            output: "we learned that the incident tracker needs dedup before paging".into(),
            duration_ms: 420,
            input_tokens: 100,
            output_tokens: 40,
        },
    )
    .await;

    let mission = orch.queue().get_mission(mission_id).await.unwrap();
    assert_eq!(mission.status, MissionStatus::Completed);

    let execs = executions::list_executions_for_mission(&pool, mission_id)
        .await
        .unwrap();
    assert_eq!(execs.len(), 1);
    assert_eq!(execs[0].id, execution_id);
    assert_eq!(execs[0].status, MissionStatus::Completed);
    assert!(execs[0].completed_at.is_some());

    let agent_after = orch.registry().get_agent(agent.id).await.unwrap();
    assert_eq!(agent_after.tasks_completed, 1);
    assert_eq!(agent_after.status, AgentStatus::Idle);
    assert!(agent_after.current_mission_id.is_none());

    // Every linked mission completed, so the unified task closed.
    let closed = unified_tasks::get_unified_task(&pool, task.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(closed.status, UnifiedTaskStatus::Done);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn worker_failure_routes_through_retry() {
    let (pool, db_name) = create_test_db().await;
    let orch = orchestrator(pool.clone());
    orch.start().await.unwrap();

    let agent = orch
        .registry()
        .spawn_agent(SpawnConfig::default())
        .await
        .unwrap();
    let _assignments = orch.delivery().attach_agent(agent.id, 8);

    let ids = orch
        .distribute(EnqueueRequest {
            prompt: "summarize the flaky feed".into(),
            max_retries: 2,
            retry_delay_ms: 10_000,
            ..EnqueueRequest::default()
        })
        .await
        .unwrap();
    let mission_id = ids[0];
    orch.dispatch_tick().await.unwrap();

    orch.handle_worker_event(
        agent.id,
        WorkerEvent::TaskFailed {
            mission_id,
            kind: FailureKind::RateLimit,
            message: "provider throttled".into(),
        },
    )
    .await;

    let mission = orch.queue().get_mission(mission_id).await.unwrap();
    assert_eq!(mission.status, MissionStatus::Retrying);
    assert_eq!(mission.retry_count, 1);

    let agent_after = orch.registry().get_agent(agent.id).await.unwrap();
    assert_eq!(agent_after.tasks_failed, 1);
    assert_eq!(agent_after.status, AgentStatus::Idle);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn decomposable_prompts_become_a_mission_dag() {
    let (pool, db_name) = create_test_db().await;
    let orch = orchestrator(pool.clone());
    orch.start().await.unwrap();

    let ids = orch
        .distribute(EnqueueRequest {
            prompt: "implement the importer and test the edge cases".into(),
            ..EnqueueRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(ids.len(), 2);

    let first = orch.queue().get_mission(ids[0]).await.unwrap();
    let second = orch.queue().get_mission(ids[1]).await.unwrap();
    assert_eq!(first.status, MissionStatus::Queued);
    assert_eq!(second.status, MissionStatus::Blocked);
    assert_eq!(second.depends_on, vec![first.id]);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn dropped_channel_falls_back_to_the_inbox() {
    let (pool, db_name) = create_test_db().await;
    let orch = orchestrator(pool.clone());
    orch.start().await.unwrap();

    let agent = orch
        .registry()
        .spawn_agent(SpawnConfig::default())
        .await
        .unwrap();
    // No channel attached: delivery must fall back to the durable inbox.

    let ids = orch
        .distribute(EnqueueRequest {
            prompt: "summarize quietly".into(),
            ..EnqueueRequest::default()
        })
        .await
        .unwrap();
    let mission_id = ids[0];
    orch.dispatch_tick().await.unwrap();

    let mission = orch.queue().get_mission(mission_id).await.unwrap();
    assert_eq!(mission.status, MissionStatus::Running);

    // While the execution is live, inbox redelivery must not double-claim.
    let redelivered = orch
        .delivery()
        .redeliver_from_inbox(agent.id)
        .await
        .unwrap();
    assert!(redelivered.is_empty());

    // Crash recovery releases the execution; now the inbox claim succeeds
    // with a fresh execution id.
    let old_execution = mission.execution_id.unwrap();
    maestro_db::queries::missions::release_execution(&pool, mission_id)
        .await
        .unwrap();
    let redelivered = orch
        .delivery()
        .redeliver_from_inbox(agent.id)
        .await
        .unwrap();
    assert_eq!(redelivered.len(), 1);
    assert_ne!(redelivered[0].execution_id, old_execution);

    // And only once: the claim is spent.
    let again = orch
        .delivery()
        .redeliver_from_inbox(agent.id)
        .await
        .unwrap();
    assert!(again.is_empty());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn streamed_delivery_reports_its_path() {
    let (pool, db_name) = create_test_db().await;
    let orch = orchestrator(pool.clone());
    orch.start().await.unwrap();

    let agent = orch
        .registry()
        .spawn_agent(SpawnConfig::default())
        .await
        .unwrap();

    let ids = orch
        .distribute(EnqueueRequest {
            prompt: "summarize the day".into(),
            ..EnqueueRequest::default()
        })
        .await
        .unwrap();
    let mission = orch.queue().dequeue(agent.id).await.unwrap().unwrap();
    assert_eq!(mission.id, ids[0]);

    // Without a channel the inbox carries it...
    let path = orch
        .delivery()
        .deliver(maestro_core::delivery::MissionAssignment {
            execution_id: mission.execution_id.clone().unwrap(),
            agent_id: agent.id,
            mission: mission.clone(),
        })
        .await
        .unwrap();
    assert_eq!(path, DeliveryPath::InboxOnly);

    // ...and with one attached the stream wins.
    let mut rx = orch.delivery().attach_agent(agent.id, 4);
    let path = orch
        .delivery()
        .deliver(maestro_core::delivery::MissionAssignment {
            execution_id: mission.execution_id.clone().unwrap(),
            agent_id: agent.id,
            mission,
        })
        .await
        .unwrap();
    assert_eq!(path, DeliveryPath::Streamed);
    assert!(rx.try_recv().is_ok());

    pool.close().await;
    drop_test_db(&db_name).await;
}
