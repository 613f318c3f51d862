//! Integration tests for the atomic claim protocol -- the serialization
//! point for at-most-once execution.

use uuid::Uuid;

use maestro_db::models::{MissionKind, MissionPriority, MissionStatus};
use maestro_db::queries::missions::{self, NewMission};
use maestro_test_utils::{create_test_db, drop_test_db};

fn queued_mission(prompt: &str) -> NewMission {
    NewMission {
        prompt: prompt.to_owned(),
        context: None,
        priority: MissionPriority::Critical,
        kind: MissionKind::General,
        status: MissionStatus::Queued,
        timeout_ms: 60_000,
        max_retries: 0,
        retry_delay_ms: 0,
        depends_on: vec![],
        parent_mission_id: None,
        unified_task_id: None,
    }
}

#[tokio::test]
async fn claim_succeeds_once() {
    let (pool, db_name) = create_test_db().await;

    let id = Uuid::new_v4();
    missions::insert_mission(&pool, id, &queued_mission("claim me"))
        .await
        .unwrap();

    let first = missions::atomic_claim(&pool, id, 1, "exec_1").await.unwrap();
    assert!(first.success);
    assert_eq!(first.execution_id.as_deref(), Some("exec_1"));

    let row = missions::get_mission(&pool, id).await.unwrap().unwrap();
    assert_eq!(row.status, MissionStatus::Running);
    assert_eq!(row.assigned_to, Some(1));
    assert_eq!(row.execution_id.as_deref(), Some("exec_1"));
    assert!(row.started_at.is_some());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn second_claim_fails_even_with_same_arguments() {
    let (pool, db_name) = create_test_db().await;

    let id = Uuid::new_v4();
    missions::insert_mission(&pool, id, &queued_mission("claim me"))
        .await
        .unwrap();

    let first = missions::atomic_claim(&pool, id, 1, "exec_1").await.unwrap();
    assert!(first.success);

    // Replaying the identical claim observes changes = 0 and yields.
    let replay = missions::atomic_claim(&pool, id, 1, "exec_1").await.unwrap();
    assert!(!replay.success);
    assert!(replay.execution_id.is_none());

    // A different agent cannot steal it either.
    let steal = missions::atomic_claim(&pool, id, 2, "exec_2").await.unwrap();
    assert!(!steal.success);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn concurrent_claims_yield_exactly_one_winner() {
    let (pool, db_name) = create_test_db().await;

    let id = Uuid::new_v4();
    missions::insert_mission(&pool, id, &queued_mission("contended"))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for agent_id in 1..=5_i64 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            let exec = format!("exec_{agent_id}");
            missions::atomic_claim(&pool, id, agent_id, &exec).await.unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().success {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn release_allows_a_fresh_claim() {
    let (pool, db_name) = create_test_db().await;

    let id = Uuid::new_v4();
    missions::insert_mission(&pool, id, &queued_mission("interrupted"))
        .await
        .unwrap();

    missions::atomic_claim(&pool, id, 1, "exec_old").await.unwrap();

    // Recovery: release clears the assignment with execution_id = NULL.
    assert_eq!(missions::release_execution(&pool, id).await.unwrap(), 1);
    let row = missions::get_mission(&pool, id).await.unwrap().unwrap();
    assert_eq!(row.status, MissionStatus::Queued);
    assert!(row.assigned_to.is_none());
    assert!(row.execution_id.is_none());
    assert!(row.started_at.is_none());

    // A new claim mints a fresh execution id.
    let reclaim = missions::atomic_claim(&pool, id, 2, "exec_new").await.unwrap();
    assert!(reclaim.success);
    let row = missions::get_mission(&pool, id).await.unwrap().unwrap();
    assert_eq!(row.execution_id.as_deref(), Some("exec_new"));
    assert_eq!(row.assigned_to, Some(2));

    // Releasing a non-running mission is a no-op.
    assert_eq!(missions::release_execution(&pool, Uuid::new_v4()).await.unwrap(), 0);

    pool.close().await;
    drop_test_db(&db_name).await;
}
