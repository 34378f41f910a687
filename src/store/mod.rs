//! Storage seam shared by the submission service and workers.
//!
//! One trait covers the whole persisted state layout: projects, run records,
//! per-run log lists, the pending and dead-letter channels, the idempotency
//! mapping, scalar counters, and the worker heartbeat. Implementations are
//! injected at construction time — `MemoryStore` for tests and local dev,
//! `PgStore` for production. There is no environment-driven fallback between
//! the two; backend selection is always explicit.

pub mod memory;
pub mod postgres;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{DeadLetterItem, Project, ProjectId, QueueItem, Run, RunId, Status};

pub use memory::MemoryStore;
pub use postgres::{PgStore, PgStoreOptions};

/// Outcome of an idempotency-key reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// The key already maps to a live run. The caller must not create one.
    Existing(RunId),
    /// The key was atomically reserved for the caller's candidate run id.
    /// Exactly one concurrent caller per key observes this.
    Reserved,
}

/// One message taken off the pending channel. Carries the raw serialized
/// payload so a worker can dead-letter it verbatim when it fails to parse.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub raw: String,
}

/// Depths of the two delivery channels.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueDepths {
    pub pending: u64,
    pub dead: u64,
}

/// Scalar counters maintained by workers.
#[derive(Debug, Clone, Default)]
pub struct Counters {
    pub processed: u64,
    pub failed: u64,
    pub processed_by_kind: HashMap<String, u64>,
}

/// Durable key/value + list storage behind the queue core.
///
/// Concurrency contract: `dequeue` and `resolve_or_reserve` are atomic
/// read-modify-write operations. Everything else relies on them; the core
/// adds no application-level locking.
#[async_trait]
pub trait Store: Send + Sync {
    // -- projects ----------------------------------------------------------

    async fn insert_project(&self, project: &Project) -> Result<()>;

    async fn get_project(&self, id: ProjectId) -> Result<Option<Project>>;

    /// List projects, newest first.
    async fn list_projects(&self, limit: i64) -> Result<Vec<Project>>;

    // -- runs --------------------------------------------------------------

    async fn insert_run(&self, run: &Run) -> Result<()>;

    async fn get_run(&self, id: RunId) -> Result<Option<Run>>;

    /// List runs, newest first. Backs the CLI's id-prefix lookup.
    async fn list_runs(&self, limit: i64) -> Result<Vec<Run>>;

    /// Transition a run's status with optimistic concurrency: the update only
    /// applies while the persisted status equals `from`, and the transition
    /// must be allowed by [`Status::can_transition_to`]. Bumps `updated_at`.
    async fn update_status(&self, id: RunId, from: Status, to: Status) -> Result<()>;

    /// Increment the attempt counter, returning the new value.
    async fn record_attempt(&self, id: RunId) -> Result<u32>;

    /// Persist the terminal result. Set exactly once, on success.
    async fn set_result(&self, id: RunId, result: &str) -> Result<()>;

    // -- logs --------------------------------------------------------------

    /// Append one line to a run's log. Logs are append-only; once the
    /// configured cap is reached further lines are dropped, never rewritten.
    async fn append_log(&self, id: RunId, line: &str) -> Result<()>;

    async fn get_logs(&self, id: RunId) -> Result<Vec<String>>;

    // -- idempotency -------------------------------------------------------

    /// Resolve `key` to an existing run id, or atomically reserve it for
    /// `candidate`. Expired entries are reclaimable as if absent.
    async fn resolve_or_reserve(
        &self,
        key: &str,
        candidate: RunId,
        ttl: Duration,
    ) -> Result<Reservation>;

    /// Force-overwrite the mapping. Used when a mapped run no longer exists
    /// in the store and the key must be rebound.
    async fn record_idempotency(&self, key: &str, run_id: RunId, ttl: Duration) -> Result<()>;

    // -- queue + dead letter ----------------------------------------------

    /// Publish an item on the pending channel. A non-zero `delay` attaches a
    /// not-before timestamp: `dequeue` skips the item until it comes due, so
    /// retry backoff never blocks a worker.
    async fn enqueue(&self, item: &QueueItem, delay: Duration) -> Result<()>;

    /// Block up to `timeout` for the next due item. Atomic pop: no two
    /// concurrent callers ever receive the same delivery.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<Delivery>>;

    /// Append one entry to the dead-letter channel.
    async fn dead_letter(&self, raw: &str, reason: &str) -> Result<()>;

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterItem>>;

    /// Move up to `limit` dead-lettered items back onto the pending channel,
    /// preserving their last-known payload. For payloads that parse, the
    /// run's status is reset `failed -> queued`. Attempt counts are not
    /// reset: a replayed run gets one fresh attempt before it can
    /// dead-letter again. Returns the count moved.
    async fn requeue_dead_letters(&self, limit: usize) -> Result<usize>;

    async fn queue_depths(&self) -> Result<QueueDepths>;

    // -- counters + heartbeat ---------------------------------------------

    async fn incr_processed(&self, kind: &str) -> Result<()>;

    async fn incr_failed(&self) -> Result<()>;

    async fn counters(&self) -> Result<Counters>;

    /// Refresh the worker liveness timestamp with an expiry.
    async fn record_heartbeat(&self, worker_id: &str, ttl: Duration) -> Result<()>;

    /// Age of the freshest unexpired heartbeat, or None when no worker has
    /// beaten recently.
    async fn heartbeat_age(&self) -> Result<Option<Duration>>;
}
