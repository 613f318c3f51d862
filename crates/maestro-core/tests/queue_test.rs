//! Integration tests for the mission queue against a real store:
//! priority ordering, dependency gating, retry/backoff, at-most-once
//! claims, crash recovery, and timeout enforcement.

use std::time::Duration;

use maestro_core::delivery::CheckpointClock;
use maestro_core::error::QueueError;
use maestro_core::queue::{EnqueueRequest, MissionQueue, QueueConfig};
use maestro_db::models::{
    FailureKind, MissionFailure, MissionKind, MissionOutcome, MissionPriority, MissionStatus,
};
use maestro_test_utils::{create_test_db, drop_test_db};

fn request(prompt: &str, priority: MissionPriority) -> EnqueueRequest {
    EnqueueRequest {
        prompt: prompt.to_owned(),
        priority,
        ..EnqueueRequest::default()
    }
}

fn outcome(output: &str, duration_ms: i64) -> MissionOutcome {
    MissionOutcome {
        output: output.to_owned(),
        duration_ms,
        input_tokens: 0,
        output_tokens: 0,
    }
}

#[tokio::test]
async fn dequeue_follows_priority_bands() {
    let (pool, db_name) = create_test_db().await;
    let queue = MissionQueue::new(pool.clone(), QueueConfig::default());

    for priority in [
        MissionPriority::Low,
        MissionPriority::Critical,
        MissionPriority::High,
        MissionPriority::Normal,
    ] {
        queue
            .enqueue(request("same prompt", priority))
            .await
            .expect("enqueue should succeed");
    }

    let mut order = Vec::new();
    for agent_id in 1..=4_i64 {
        let mission = queue
            .dequeue(agent_id)
            .await
            .expect("dequeue should not error")
            .expect("a mission should be ready");
        order.push(mission.priority);
    }

    assert_eq!(
        order,
        vec![
            MissionPriority::Critical,
            MissionPriority::High,
            MissionPriority::Normal,
            MissionPriority::Low,
        ]
    );
    assert!(queue.dequeue(9).await.unwrap().is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn fifo_within_a_priority_band() {
    let (pool, db_name) = create_test_db().await;
    let queue = MissionQueue::new(pool.clone(), QueueConfig::default());

    let first = queue.enqueue(request("first", MissionPriority::Normal)).await.unwrap();
    let second = queue.enqueue(request("second", MissionPriority::Normal)).await.unwrap();

    assert_eq!(queue.dequeue(1).await.unwrap().unwrap().id, first);
    assert_eq!(queue.dequeue(2).await.unwrap().unwrap().id, second);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn completing_a_dependency_unblocks_the_dependent() {
    let (pool, db_name) = create_test_db().await;
    let queue = MissionQueue::new(pool.clone(), QueueConfig::default());

    let a = queue.enqueue(request("mission a", MissionPriority::Normal)).await.unwrap();
    let b = queue
        .enqueue(EnqueueRequest {
            depends_on: vec![a],
            ..request("mission b", MissionPriority::Normal)
        })
        .await
        .unwrap();

    assert_eq!(
        queue.get_mission(b).await.unwrap().status,
        MissionStatus::Blocked
    );
    assert!(!queue.is_ready(b).await);

    let claimed = queue.dequeue(1).await.unwrap().unwrap();
    assert_eq!(claimed.id, a);
    queue.complete(a, outcome("ok", 100)).await.unwrap();

    assert!(queue.is_ready(b).await);
    assert_eq!(
        queue.get_mission(b).await.unwrap().status,
        MissionStatus::Queued
    );
    assert_eq!(queue.dequeue(2).await.unwrap().unwrap().id, b);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn recoverable_failure_retries_then_succeeds() {
    let (pool, db_name) = create_test_db().await;
    let queue = MissionQueue::new(pool.clone(), QueueConfig::default());

    let m = queue
        .enqueue(EnqueueRequest {
            max_retries: 1,
            retry_delay_ms: 50,
            ..request("flaky mission", MissionPriority::Normal)
        })
        .await
        .unwrap();

    queue.dequeue(1).await.unwrap().expect("first claim");
    queue
        .fail(m, MissionFailure::new(FailureKind::Timeout, "went quiet"))
        .await
        .unwrap();
    assert_eq!(
        queue.get_mission(m).await.unwrap().status,
        MissionStatus::Retrying
    );

    // After the fixed delay the mission is queued again with the counter
    // bumped and the assignment cleared.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let requeued = queue.get_mission(m).await.unwrap();
    assert_eq!(requeued.status, MissionStatus::Queued);
    assert_eq!(requeued.retry_count, 1);
    assert!(requeued.assigned_to.is_none());
    assert!(requeued.execution_id.is_none());

    queue.dequeue(2).await.unwrap().expect("second claim");
    queue.complete(m, outcome("ok", 50)).await.unwrap();

    let finished = queue.get_mission(m).await.unwrap();
    assert_eq!(finished.status, MissionStatus::Completed);
    assert_eq!(finished.retry_count, 1);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn retry_budget_exhaustion_is_terminal() {
    let (pool, db_name) = create_test_db().await;
    let queue = MissionQueue::new(pool.clone(), QueueConfig::default());

    let m = queue
        .enqueue(EnqueueRequest {
            max_retries: 0,
            ..request("doomed mission", MissionPriority::Normal)
        })
        .await
        .unwrap();

    queue.dequeue(1).await.unwrap().expect("claim");
    queue
        .fail(m, MissionFailure::new(FailureKind::Timeout, "too slow"))
        .await
        .unwrap();

    let failed = queue.get_mission(m).await.unwrap();
    assert_eq!(failed.status, MissionStatus::Failed);
    assert_eq!(failed.error.unwrap().0.kind, FailureKind::Timeout);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn unrecoverable_failures_bypass_retry() {
    let (pool, db_name) = create_test_db().await;
    let queue = MissionQueue::new(pool.clone(), QueueConfig::default());

    let m = queue
        .enqueue(EnqueueRequest {
            max_retries: 5,
            ..request("bad input", MissionPriority::Normal)
        })
        .await
        .unwrap();

    queue.dequeue(1).await.unwrap().expect("claim");
    queue
        .fail(m, MissionFailure::new(FailureKind::Validation, "malformed"))
        .await
        .unwrap();

    let failed = queue.get_mission(m).await.unwrap();
    assert_eq!(failed.status, MissionStatus::Failed);
    assert_eq!(failed.retry_count, 0);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn five_concurrent_dequeues_yield_one_winner() {
    let (pool, db_name) = create_test_db().await;
    let queue = MissionQueue::new(pool.clone(), QueueConfig::default());

    queue
        .enqueue(request("contended mission", MissionPriority::Critical))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for agent_id in 1..=5_i64 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            queue.dequeue(agent_id).await.unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn admission_ceiling_is_backpressure() {
    let (pool, db_name) = create_test_db().await;
    let queue = MissionQueue::new(
        pool.clone(),
        QueueConfig {
            max_queue_size: 3,
            ..QueueConfig::default()
        },
    );

    for n in 0..3 {
        queue
            .enqueue(request(&format!("mission {n}"), MissionPriority::Normal))
            .await
            .expect("under the ceiling");
    }
    // Exactly at the ceiling: the next admission is refused.
    let err = queue
        .enqueue(request("one too many", MissionPriority::Normal))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::Full { limit: 3 }));

    // Terminal missions free their slot after completion.
    let id = queue.dequeue(1).await.unwrap().unwrap().id;
    queue.complete(id, outcome("done", 1)).await.unwrap();
    queue
        .enqueue(request("fits again", MissionPriority::Normal))
        .await
        .expect("slot freed");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn empty_prompt_is_rejected() {
    let (pool, db_name) = create_test_db().await;
    let queue = MissionQueue::new(pool.clone(), QueueConfig::default());

    let err = queue
        .enqueue(request("   ", MissionPriority::Normal))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::Validation(_)));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn interrupted_missions_recover_with_a_fresh_execution_id() {
    let (pool, db_name) = create_test_db().await;

    // First queue instance claims a mission, then the process "crashes".
    let before = MissionQueue::new(pool.clone(), QueueConfig::default());
    let id = before
        .enqueue(request("interrupted work", MissionPriority::Normal))
        .await
        .unwrap();
    let claimed = before.dequeue(1).await.unwrap().unwrap();
    let old_execution = claimed.execution_id.unwrap();

    // A new queue instance recovers from the store.
    let after = MissionQueue::new(pool.clone(), QueueConfig::default());
    let recovered = after.load_from_db().await.unwrap();
    assert_eq!(recovered, 1);

    let mission = after.get_mission(id).await.unwrap();
    assert_eq!(mission.status, MissionStatus::Queued);
    assert!(mission.assigned_to.is_none());
    assert!(mission.execution_id.is_none());
    assert!(mission.started_at.is_none());

    let reclaimed = after.dequeue(2).await.unwrap().unwrap();
    let new_execution = reclaimed.execution_id.unwrap();
    assert_ne!(new_execution, old_execution);
    assert_eq!(reclaimed.assigned_to, Some(2));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn enqueue_survives_a_reload_round_trip() {
    let (pool, db_name) = create_test_db().await;

    let before = MissionQueue::new(pool.clone(), QueueConfig::default());
    let id = before
        .enqueue(EnqueueRequest {
            context: Some("some context".into()),
            timeout_ms: 120_000,
            max_retries: 2,
            kind: MissionKind::Analysis,
            ..request("round trip", MissionPriority::High)
        })
        .await
        .unwrap();
    let original = before.get_mission(id).await.unwrap();

    let after = MissionQueue::new(pool.clone(), QueueConfig::default());
    after.load_from_db().await.unwrap();
    let reloaded = after.dequeue(1).await.unwrap().unwrap();

    // Equal modulo status and claim bookkeeping.
    assert_eq!(reloaded.id, original.id);
    assert_eq!(reloaded.prompt, original.prompt);
    assert_eq!(reloaded.context, original.context);
    assert_eq!(reloaded.priority, original.priority);
    assert_eq!(reloaded.kind, original.kind);
    assert_eq!(reloaded.timeout_ms, original.timeout_ms);
    assert_eq!(reloaded.max_retries, original.max_retries);
    assert_eq!(reloaded.status, MissionStatus::Running);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn over_budget_missions_fail_with_recoverable_timeout() {
    let (pool, db_name) = create_test_db().await;
    let queue = MissionQueue::new(pool.clone(), QueueConfig::default());
    let checkpoints = CheckpointClock::new();

    let m = queue
        .enqueue(EnqueueRequest {
            timeout_ms: 1,
            max_retries: 0,
            ..request("sluggish mission", MissionPriority::Normal)
        })
        .await
        .unwrap();
    queue.dequeue(1).await.unwrap().expect("claim");

    tokio::time::sleep(Duration::from_millis(20)).await;
    queue.enforce_timeouts(&checkpoints).await;

    let failed = queue.get_mission(m).await.unwrap();
    assert_eq!(failed.status, MissionStatus::Failed);
    let error = failed.error.unwrap().0;
    assert_eq!(error.kind, FailureKind::Timeout);
    assert!(error.recoverable);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn recent_checkpoints_extend_the_budget_near_the_deadline() {
    let (pool, db_name) = create_test_db().await;
    let queue = MissionQueue::new(pool.clone(), QueueConfig::default());
    let checkpoints = CheckpointClock::new();

    let m = queue
        .enqueue(EnqueueRequest {
            // Inside the 30 s slack window from the start.
            timeout_ms: 10_000,
            ..request("slow but alive", MissionPriority::Normal)
        })
        .await
        .unwrap();
    queue.dequeue(1).await.unwrap().expect("claim");
    checkpoints.record(m);

    queue.enforce_timeouts(&checkpoints).await;

    let mission = queue.get_mission(m).await.unwrap();
    assert_eq!(mission.status, MissionStatus::Running);
    assert_eq!(mission.timeout_ms, 70_000);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn cancellation_aborts_a_pending_retry() {
    let (pool, db_name) = create_test_db().await;
    let queue = MissionQueue::new(pool.clone(), QueueConfig::default());

    let m = queue
        .enqueue(EnqueueRequest {
            max_retries: 3,
            retry_delay_ms: 100,
            ..request("cancel me", MissionPriority::Normal)
        })
        .await
        .unwrap();
    let claimed = queue.dequeue(7).await.unwrap().unwrap();
    assert_eq!(claimed.assigned_to, Some(7));

    queue
        .fail(m, MissionFailure::new(FailureKind::RateLimit, "throttled"))
        .await
        .unwrap();
    let assigned = queue.cancel(m).await.unwrap();
    assert_eq!(assigned, Some(7));

    // The scheduled re-queue must not resurrect a cancelled mission.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        queue.get_mission(m).await.unwrap().status,
        MissionStatus::Cancelled
    );
    assert!(queue.dequeue(8).await.unwrap().is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn completion_is_idempotent_on_the_first_result() {
    let (pool, db_name) = create_test_db().await;
    let queue = MissionQueue::new(pool.clone(), QueueConfig::default());

    let m = queue.enqueue(request("complete twice", MissionPriority::Normal)).await.unwrap();
    queue.dequeue(1).await.unwrap().expect("claim");

    queue.complete(m, outcome("first", 10)).await.unwrap();
    queue.complete(m, outcome("second", 20)).await.unwrap();

    let mission = queue.get_mission(m).await.unwrap();
    assert_eq!(mission.result.unwrap().0.output, "first");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn add_dependency_rejects_cycles() {
    let (pool, db_name) = create_test_db().await;
    let queue = MissionQueue::new(pool.clone(), QueueConfig::default());

    let a = queue.enqueue(request("a", MissionPriority::Normal)).await.unwrap();
    let b = queue
        .enqueue(EnqueueRequest {
            depends_on: vec![a],
            ..request("b", MissionPriority::Normal)
        })
        .await
        .unwrap();

    let err = queue.add_dependency(a, b).await.unwrap_err();
    assert!(matches!(err, QueueError::DependencyCycle { .. }));
    let err = queue.add_dependency(a, a).await.unwrap_err();
    assert!(matches!(err, QueueError::DependencyCycle { .. }));

    pool.close().await;
    drop_test_db(&db_name).await;
}
