//! Integration tests for the submission service against the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use runq::error::Error;
use runq::model::{NewRun, ProjectId, QueueItem, Run, RunId, Status, fingerprint};
use runq::service::RunService;
use runq::store::{MemoryStore, Reservation, Store};

const TTL: Duration = Duration::from_secs(60);

fn service(store: Arc<MemoryStore>) -> RunService<MemoryStore> {
    RunService::new(store, TTL)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_project_is_rejected_before_any_write() {
    let store = Arc::new(MemoryStore::new());
    let service = service(Arc::clone(&store));

    let err = service
        .submit(NewRun::new(ProjectId::new(), "echo", "hello"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ProjectNotFound(_)));

    // No run, nothing on the channel.
    let depths = store.queue_depths().await.unwrap();
    assert_eq!(depths.pending, 0);
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submit_persists_run_before_publishing() {
    let store = Arc::new(MemoryStore::new());
    let service = service(Arc::clone(&store));
    let project = service.create_project("p1").await.unwrap();

    let submission = service
        .submit(NewRun::new(project.id, "echo", "hello"))
        .await
        .unwrap();
    assert_eq!(submission.status, Status::Queued);
    assert!(!submission.idempotent);

    // Whatever is on the channel must already resolve in the store.
    let delivery = store
        .dequeue(Duration::from_millis(100))
        .await
        .unwrap()
        .expect("item should be queued");
    let item: QueueItem = serde_json::from_str(&delivery.raw).unwrap();
    assert_eq!(item.run_id, submission.run_id);
    assert_eq!(item.attempt, 0);

    let run = store.get_run(item.run_id).await.unwrap().unwrap();
    assert_eq!(run.status, Status::Queued);
    assert_eq!(run.attempt, 0);
    assert_eq!(run.kind, "echo");
    assert_eq!(run.payload, "hello");
}

#[tokio::test]
async fn duplicate_submission_returns_same_run() {
    let store = Arc::new(MemoryStore::new());
    let service = service(Arc::clone(&store));
    let project = service.create_project("p1").await.unwrap();

    let first = service
        .submit(NewRun::new(project.id, "echo", "hello"))
        .await
        .unwrap();
    let second = service
        .submit(NewRun::new(project.id, "echo", "hello"))
        .await
        .unwrap();

    assert_eq!(second.run_id, first.run_id);
    assert!(!first.idempotent);
    assert!(second.idempotent);

    // Exactly one entry across pending + dead-letter.
    let depths = store.queue_depths().await.unwrap();
    assert_eq!(depths.pending + depths.dead, 1);
}

#[tokio::test]
async fn different_payloads_create_different_runs() {
    let store = Arc::new(MemoryStore::new());
    let service = service(store);
    let project = service.create_project("p1").await.unwrap();

    let a = service
        .submit(NewRun::new(project.id, "echo", "hello"))
        .await
        .unwrap();
    let b = service
        .submit(NewRun::new(project.id, "echo", "world"))
        .await
        .unwrap();

    assert_ne!(a.run_id, b.run_id);
    assert!(!b.idempotent);
}

#[tokio::test]
async fn explicit_key_wins_over_fingerprint() {
    let store = Arc::new(MemoryStore::new());
    let service = service(store);
    let project = service.create_project("p1").await.unwrap();

    // Different payloads, same explicit key: deduplicated.
    let a = service
        .submit(NewRun::new(project.id, "echo", "hello").idempotency_key("deploy-42"))
        .await
        .unwrap();
    let b = service
        .submit(NewRun::new(project.id, "echo", "world").idempotency_key("deploy-42"))
        .await
        .unwrap();
    assert_eq!(b.run_id, a.run_id);
    assert!(b.idempotent);

    // Same payload, different explicit key: not deduplicated.
    let c = service
        .submit(NewRun::new(project.id, "echo", "hello").idempotency_key("deploy-43"))
        .await
        .unwrap();
    assert_ne!(c.run_id, a.run_id);
}

#[tokio::test]
async fn dedup_expires_with_the_ttl() {
    let store = Arc::new(MemoryStore::new());
    let service = RunService::new(store, Duration::from_millis(50));
    let project = service.create_project("p1").await.unwrap();

    let first = service
        .submit(NewRun::new(project.id, "echo", "hello"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = service
        .submit(NewRun::new(project.id, "echo", "hello"))
        .await
        .unwrap();
    assert_ne!(second.run_id, first.run_id);
    assert!(!second.idempotent);
}

#[tokio::test]
async fn duplicate_waits_for_a_winner_that_has_not_yet_written_its_run() {
    let store = Arc::new(MemoryStore::new());
    let service = service(Arc::clone(&store));
    let project = service.create_project("p1").await.unwrap();

    // Another submitter holds the reservation but has not yet inserted the
    // run record.
    let winner = RunId::new();
    let key = format!("{}:{}", project.id, fingerprint(project.id, "echo", "hello"));
    assert_eq!(
        store.resolve_or_reserve(&key, winner, TTL).await.unwrap(),
        Reservation::Reserved
    );

    // The record lands while the duplicate submission is in flight.
    let writer = Arc::clone(&store);
    let project_id = project.id;
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let now = chrono::Utc::now();
        let run = Run {
            id: winner,
            project_id,
            kind: "echo".to_string(),
            payload: "hello".to_string(),
            fingerprint: fingerprint(project_id, "echo", "hello"),
            status: Status::Queued,
            attempt: 0,
            created_at: now,
            updated_at: now,
            result: None,
        };
        writer.insert_run(&run).await.unwrap();
    });

    let submission = service
        .submit(NewRun::new(project.id, "echo", "hello"))
        .await
        .unwrap();
    assert_eq!(
        submission.run_id, winner,
        "duplicate must observe the winner's run, not create its own"
    );
    assert!(submission.idempotent);
}

#[tokio::test]
async fn mapping_to_a_purged_run_is_rebound_after_the_grace_window() {
    let store = Arc::new(MemoryStore::new());
    let service = service(Arc::clone(&store));
    let project = service.create_project("p1").await.unwrap();

    // Key maps to a run id whose record never materializes.
    let ghost = RunId::new();
    let key = format!("{}:{}", project.id, fingerprint(project.id, "echo", "hello"));
    store.resolve_or_reserve(&key, ghost, TTL).await.unwrap();

    let submission = service
        .submit(NewRun::new(project.id, "echo", "hello"))
        .await
        .unwrap();
    assert_ne!(submission.run_id, ghost);
    assert!(!submission.idempotent);

    // The key now maps to the fresh run.
    let second = service
        .submit(NewRun::new(project.id, "echo", "hello"))
        .await
        .unwrap();
    assert_eq!(second.run_id, submission.run_id);
    assert!(second.idempotent);
}

// ---------------------------------------------------------------------------
// Read path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn run_selector_resolves_full_id_and_unique_prefix() {
    let store = Arc::new(MemoryStore::new());
    let service = service(store);
    let project = service.create_project("p1").await.unwrap();

    let submission = service
        .submit(NewRun::new(project.id, "echo", "hello"))
        .await
        .unwrap();
    let full = submission.run_id.to_string();

    assert_eq!(service.resolve_run(&full).await.unwrap(), submission.run_id);
    assert_eq!(
        service.resolve_run(&full[..8]).await.unwrap(),
        submission.run_id
    );

    let err = service.resolve_run("zzzzzzzz").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn ambiguous_run_prefix_is_rejected() {
    let store = Arc::new(MemoryStore::new());
    let service = service(store);
    let project = service.create_project("p1").await.unwrap();

    service
        .submit(NewRun::new(project.id, "echo", "one"))
        .await
        .unwrap();
    service
        .submit(NewRun::new(project.id, "echo", "two"))
        .await
        .unwrap();

    // The empty prefix matches every run.
    let err = service.resolve_run("").await.unwrap_err();
    assert!(err.to_string().contains("be more specific"));
}

#[tokio::test]
async fn fetch_returns_run_with_logs() {
    let store = Arc::new(MemoryStore::new());
    let service = service(Arc::clone(&store));
    let project = service.create_project("p1").await.unwrap();

    let submission = service
        .submit(NewRun::new(project.id, "echo", "hello"))
        .await
        .unwrap();
    store
        .append_log(submission.run_id, "Attempt 1")
        .await
        .unwrap();

    let view = service.fetch(submission.run_id).await.unwrap();
    assert_eq!(view.run.id, submission.run_id);
    assert_eq!(view.logs, vec!["Attempt 1"]);
}

#[tokio::test]
async fn fetch_unknown_run_is_not_found() {
    let store = Arc::new(MemoryStore::new());
    let service = service(store);

    let err = service.fetch(runq::model::RunId::new()).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn status_report_aggregates_store_state() {
    let store = Arc::new(MemoryStore::new());
    let service = service(Arc::clone(&store));
    let project = service.create_project("p1").await.unwrap();

    service
        .submit(NewRun::new(project.id, "echo", "hello"))
        .await
        .unwrap();
    store.incr_processed("echo").await.unwrap();
    store.incr_failed().await.unwrap();
    store.dead_letter("x", "r").await.unwrap();
    store
        .record_heartbeat("w1", Duration::from_secs(60))
        .await
        .unwrap();

    let report = service.status().await.unwrap();
    assert_eq!(report.pending, 1);
    assert_eq!(report.dead, 1);
    assert_eq!(report.processed, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.processed_by_kind["echo"], 1);
    assert!(report.heartbeat_age.is_some());
}

#[tokio::test]
async fn projects_list_newest_first() {
    let store = Arc::new(MemoryStore::new());
    let service = service(store);

    service.create_project("first").await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    service.create_project("second").await.unwrap();

    let projects = service.list_projects(10).await.unwrap();
    assert_eq!(projects.len(), 2);
    assert_eq!(projects[0].name, "second");
    assert_eq!(projects[1].name, "first");
}
