//! Integration tests for the in-memory store: channel semantics, idempotency
//! reservations, counters, and heartbeats.

use std::sync::Arc;
use std::time::Duration;

use runq::model::{Project, QueueItem, Run, RunId, Status};
use runq::store::{MemoryStore, Reservation, Store};

fn test_run(project: &Project) -> Run {
    let now = chrono::Utc::now();
    Run {
        id: RunId::new(),
        project_id: project.id,
        kind: "echo".to_string(),
        payload: "hello".to_string(),
        fingerprint: runq::model::fingerprint(project.id, "echo", "hello"),
        status: Status::Queued,
        attempt: 0,
        created_at: now,
        updated_at: now,
        result: None,
    }
}

async fn seeded() -> (MemoryStore, Project, Run) {
    let store = MemoryStore::new();
    let project = Project::new("p1");
    store.insert_project(&project).await.unwrap();
    let run = test_run(&project);
    store.insert_run(&run).await.unwrap();
    (store, project, run)
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dequeue_is_fifo() {
    let (store, _, run) = seeded().await;

    for n in 0..3u32 {
        let item = QueueItem {
            run_id: run.id,
            kind: format!("kind-{n}"),
            payload: "x".to_string(),
            attempt: 0,
        };
        store.enqueue(&item, Duration::ZERO).await.unwrap();
    }

    for n in 0..3u32 {
        let delivery = store
            .dequeue(Duration::from_millis(100))
            .await
            .unwrap()
            .expect("queue should not be empty");
        let item: QueueItem = serde_json::from_str(&delivery.raw).unwrap();
        assert_eq!(item.kind, format!("kind-{n}"));
    }
}

#[tokio::test]
async fn dequeue_times_out_on_empty_queue() {
    let store = MemoryStore::new();
    let delivery = store.dequeue(Duration::from_millis(50)).await.unwrap();
    assert!(delivery.is_none());
}

#[tokio::test]
async fn delayed_item_is_invisible_until_due() {
    let (store, _, run) = seeded().await;
    let item = QueueItem::for_run(&run);

    store
        .enqueue(&item, Duration::from_millis(300))
        .await
        .unwrap();

    // Not yet due.
    assert!(
        store
            .dequeue(Duration::from_millis(50))
            .await
            .unwrap()
            .is_none()
    );

    // Comes due within the blocking window.
    let delivery = store.dequeue(Duration::from_secs(2)).await.unwrap();
    assert!(delivery.is_some());
}

#[tokio::test]
async fn due_items_are_not_blocked_behind_delayed_ones() {
    let (store, _, run) = seeded().await;

    let delayed = QueueItem {
        kind: "delayed".to_string(),
        ..QueueItem::for_run(&run)
    };
    let ready = QueueItem {
        kind: "ready".to_string(),
        ..QueueItem::for_run(&run)
    };

    store.enqueue(&delayed, Duration::from_secs(60)).await.unwrap();
    store.enqueue(&ready, Duration::ZERO).await.unwrap();

    let delivery = store
        .dequeue(Duration::from_millis(100))
        .await
        .unwrap()
        .expect("ready item should be delivered");
    let item: QueueItem = serde_json::from_str(&delivery.raw).unwrap();
    assert_eq!(item.kind, "ready");
}

#[tokio::test]
async fn blocked_dequeue_wakes_on_publish() {
    let (store, _, run) = seeded().await;
    let store = Arc::new(store);

    let publisher = Arc::clone(&store);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        publisher
            .enqueue(&QueueItem::for_run(&run), Duration::ZERO)
            .await
            .unwrap();
    });

    // The waiter must be woken by the publish, not sleep out its timeout.
    let started = std::time::Instant::now();
    let delivery = store.dequeue(Duration::from_secs(10)).await.unwrap();
    assert!(delivery.is_some());
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "dequeue slept through a publish"
    );
}

#[tokio::test]
async fn concurrent_consumers_never_share_a_delivery() {
    let (store, _, run) = seeded().await;
    let store = Arc::new(store);

    const ITEMS: usize = 20;
    const CONSUMERS: usize = 4;

    for n in 0..ITEMS {
        let item = QueueItem {
            kind: format!("item-{n}"),
            ..QueueItem::for_run(&run)
        };
        store.enqueue(&item, Duration::ZERO).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..CONSUMERS {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(delivery) = store.dequeue(Duration::from_millis(100)).await.unwrap() {
                let item: QueueItem = serde_json::from_str(&delivery.raw).unwrap();
                seen.push(item.kind);
            }
            seen
        }));
    }

    let mut all: Vec<String> = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }

    all.sort();
    let before_dedup = all.len();
    all.dedup();
    assert_eq!(all.len(), before_dedup, "an item was delivered twice");
    assert_eq!(all.len(), ITEMS, "an item was lost");
}

// ---------------------------------------------------------------------------
// Dead letters
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dead_letter_appends_one_entry_per_call() {
    let store = MemoryStore::new();

    store.dead_letter("payload-a", "reason one").await.unwrap();
    store.dead_letter("payload-a", "reason two").await.unwrap();

    let items = store.list_dead_letters(10).await.unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].reason, "reason one");
    assert_eq!(items[1].reason, "reason two");

    let depths = store.queue_depths().await.unwrap();
    assert_eq!(depths.pending, 0);
    assert_eq!(depths.dead, 2);
}

#[tokio::test]
async fn requeue_moves_payloads_and_resets_status() {
    let (store, _, mut run) = seeded().await;

    // Drive the run to failed the way a worker would.
    store
        .update_status(run.id, Status::Queued, Status::Running)
        .await
        .unwrap();
    store
        .update_status(run.id, Status::Running, Status::Failed)
        .await
        .unwrap();
    run.attempt = 3;

    let raw = serde_json::to_string(&QueueItem::for_run(&run)).unwrap();
    store.dead_letter(&raw, "exhausted").await.unwrap();

    let moved = store.requeue_dead_letters(10).await.unwrap();
    assert_eq!(moved, 1);

    let depths = store.queue_depths().await.unwrap();
    assert_eq!(depths.pending, 1);
    assert_eq!(depths.dead, 0);

    // Replayed run is claimable again.
    let replayed = store.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(replayed.status, Status::Queued);
}

#[tokio::test]
async fn requeue_respects_limit() {
    let store = MemoryStore::new();
    for n in 0..5 {
        store
            .dead_letter(&format!("p{n}"), "r")
            .await
            .unwrap();
    }

    assert_eq!(store.requeue_dead_letters(2).await.unwrap(), 2);
    let depths = store.queue_depths().await.unwrap();
    assert_eq!(depths.pending, 2);
    assert_eq!(depths.dead, 3);
}

// ---------------------------------------------------------------------------
// Idempotency
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reservation_is_first_writer_wins() {
    let store = MemoryStore::new();
    let ttl = Duration::from_secs(60);

    let first = RunId::new();
    let second = RunId::new();

    assert_eq!(
        store.resolve_or_reserve("key", first, ttl).await.unwrap(),
        Reservation::Reserved
    );
    assert_eq!(
        store.resolve_or_reserve("key", second, ttl).await.unwrap(),
        Reservation::Existing(first)
    );
}

#[tokio::test]
async fn expired_reservation_is_reclaimable() {
    let store = MemoryStore::new();

    let first = RunId::new();
    store
        .resolve_or_reserve("key", first, Duration::from_millis(50))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = RunId::new();
    assert_eq!(
        store
            .resolve_or_reserve("key", second, Duration::from_secs(60))
            .await
            .unwrap(),
        Reservation::Reserved
    );
}

// ---------------------------------------------------------------------------
// Runs and logs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn update_status_rejects_illegal_transitions() {
    let (store, _, run) = seeded().await;

    // queued -> succeeded skips running.
    let err = store
        .update_status(run.id, Status::Queued, Status::Succeeded)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        runq::error::Error::InvalidTransition { .. }
    ));

    // Stale `from` is also rejected.
    let err = store
        .update_status(run.id, Status::Running, Status::Succeeded)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        runq::error::Error::InvalidTransition { .. }
    ));
}

#[tokio::test]
async fn updated_at_is_monotone_across_transitions() {
    let (store, _, run) = seeded().await;
    let before = store.get_run(run.id).await.unwrap().unwrap().updated_at;

    store
        .update_status(run.id, Status::Queued, Status::Running)
        .await
        .unwrap();
    let after = store.get_run(run.id).await.unwrap().unwrap().updated_at;
    assert!(after >= before);
}

#[tokio::test]
async fn logs_are_append_only_and_capped() {
    let store = MemoryStore::with_max_log_lines(3);
    let project = Project::new("p");
    store.insert_project(&project).await.unwrap();
    let run = test_run(&project);
    store.insert_run(&run).await.unwrap();

    for n in 0..5 {
        store
            .append_log(run.id, &format!("line {n}"))
            .await
            .unwrap();
    }

    let logs = store.get_logs(run.id).await.unwrap();
    assert_eq!(logs, vec!["line 0", "line 1", "line 2"]);

    // A later read never sees fewer or reordered lines.
    let again = store.get_logs(run.id).await.unwrap();
    assert_eq!(again, logs);
}

#[tokio::test]
async fn runs_list_newest_first() {
    let (store, project, first) = seeded().await;

    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = test_run(&project);
    store.insert_run(&second).await.unwrap();

    let runs = store.list_runs(10).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].id, second.id);
    assert_eq!(runs[1].id, first.id);

    assert_eq!(store.list_runs(1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn record_attempt_increments() {
    let (store, _, run) = seeded().await;
    assert_eq!(store.record_attempt(run.id).await.unwrap(), 1);
    assert_eq!(store.record_attempt(run.id).await.unwrap(), 2);
    assert_eq!(store.get_run(run.id).await.unwrap().unwrap().attempt, 2);
}

// ---------------------------------------------------------------------------
// Counters and heartbeat
// ---------------------------------------------------------------------------

#[tokio::test]
async fn counters_accumulate_by_kind() {
    let store = MemoryStore::new();

    store.incr_processed("python").await.unwrap();
    store.incr_processed("python").await.unwrap();
    store.incr_processed("shell").await.unwrap();
    store.incr_failed().await.unwrap();

    let counters = store.counters().await.unwrap();
    assert_eq!(counters.processed, 3);
    assert_eq!(counters.failed, 1);
    assert_eq!(counters.processed_by_kind["python"], 2);
    assert_eq!(counters.processed_by_kind["shell"], 1);
}

#[tokio::test]
async fn heartbeat_age_reflects_liveness() {
    let store = MemoryStore::new();
    assert!(store.heartbeat_age().await.unwrap().is_none());

    store
        .record_heartbeat("w1", Duration::from_secs(60))
        .await
        .unwrap();
    let age = store.heartbeat_age().await.unwrap().expect("live heartbeat");
    assert!(age < Duration::from_secs(1));
}

#[tokio::test]
async fn expired_heartbeat_is_invisible() {
    let store = MemoryStore::new();
    store
        .record_heartbeat("w1", Duration::from_millis(50))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(store.heartbeat_age().await.unwrap().is_none());
}
