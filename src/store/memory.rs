//! In-memory store.
//!
//! Backs tests and single-process local dev. Mirrors the durable backend's
//! semantics exactly: not-before delays on the pending channel, atomic pop,
//! TTL'd idempotency entries, capped append-only logs. All state lives behind
//! one mutex; a Notify wakes blocked dequeuers when new work is published.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::model::{DeadLetterItem, Project, ProjectId, QueueItem, Run, RunId, Status};

use super::{Counters, Delivery, QueueDepths, Reservation, Store};

struct PendingEntry {
    raw: String,
    available_at: Instant,
}

struct IdemEntry {
    run_id: RunId,
    expires_at: Instant,
}

struct HeartbeatEntry {
    beat_at: Instant,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    projects: HashMap<ProjectId, Project>,
    runs: HashMap<RunId, Run>,
    logs: HashMap<RunId, Vec<String>>,
    idempotency: HashMap<String, IdemEntry>,
    pending: VecDeque<PendingEntry>,
    dead: VecDeque<DeadLetterItem>,
    processed: u64,
    failed: u64,
    processed_by_kind: HashMap<String, u64>,
    heartbeats: HashMap<String, HeartbeatEntry>,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    notify: Notify,
    max_log_lines: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_max_log_lines(1_000)
    }

    /// Operator-configurable cap on per-run log growth.
    pub fn with_max_log_lines(max_log_lines: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            max_log_lines,
        }
    }

    /// Publish a raw string on the pending channel without going through the
    /// typed [`QueueItem`] path. Lets tests exercise the malformed-payload
    /// dead-letter branch.
    pub fn enqueue_raw(&self, raw: impl Into<String>, delay: Duration) {
        {
            let mut inner = self.lock();
            inner.pending.push_back(PendingEntry {
                raw: raw.into(),
                available_at: Instant::now() + delay,
            });
        }
        self.notify.notify_waiters();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Lock poisoning only happens after a panic in a critical section;
        // recover the data rather than cascading.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pop the first due entry, preserving FIFO order among due items.
    fn pop_due(&self) -> Option<String> {
        let mut inner = self.lock();
        let now = Instant::now();
        let idx = inner.pending.iter().position(|e| e.available_at <= now)?;
        inner.pending.remove(idx).map(|e| e.raw)
    }

    /// Time until the earliest not-yet-due entry comes due.
    fn next_due_in(&self) -> Option<Duration> {
        let inner = self.lock();
        let now = Instant::now();
        inner
            .pending
            .iter()
            .map(|e| e.available_at.saturating_duration_since(now))
            .min()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    // -- projects ----------------------------------------------------------

    async fn insert_project(&self, project: &Project) -> Result<()> {
        self.lock().projects.insert(project.id, project.clone());
        Ok(())
    }

    async fn get_project(&self, id: ProjectId) -> Result<Option<Project>> {
        Ok(self.lock().projects.get(&id).cloned())
    }

    async fn list_projects(&self, limit: i64) -> Result<Vec<Project>> {
        let inner = self.lock();
        let mut projects: Vec<Project> = inner.projects.values().cloned().collect();
        projects.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        projects.truncate(limit.max(0) as usize);
        Ok(projects)
    }

    // -- runs --------------------------------------------------------------

    async fn insert_run(&self, run: &Run) -> Result<()> {
        self.lock().runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, id: RunId) -> Result<Option<Run>> {
        Ok(self.lock().runs.get(&id).cloned())
    }

    async fn list_runs(&self, limit: i64) -> Result<Vec<Run>> {
        let inner = self.lock();
        let mut runs: Vec<Run> = inner.runs.values().cloned().collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs.truncate(limit.max(0) as usize);
        Ok(runs)
    }

    async fn update_status(&self, id: RunId, from: Status, to: Status) -> Result<()> {
        let mut inner = self.lock();
        let run = inner
            .runs
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        if run.status != from || !from.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: run.status,
                to,
            });
        }

        run.status = to;
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn record_attempt(&self, id: RunId) -> Result<u32> {
        let mut inner = self.lock();
        let run = inner
            .runs
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        run.attempt += 1;
        run.updated_at = Utc::now();
        Ok(run.attempt)
    }

    async fn set_result(&self, id: RunId, result: &str) -> Result<()> {
        let mut inner = self.lock();
        let run = inner
            .runs
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        run.result = Some(result.to_string());
        run.updated_at = Utc::now();
        Ok(())
    }

    // -- logs --------------------------------------------------------------

    async fn append_log(&self, id: RunId, line: &str) -> Result<()> {
        let mut inner = self.lock();
        if !inner.runs.contains_key(&id) {
            return Err(Error::NotFound(id.to_string()));
        }

        let logs = inner.logs.entry(id).or_default();
        if logs.len() >= self.max_log_lines {
            // Cap reached: drop, never rewrite. The sequence stays
            // append-only and monotone.
            return Ok(());
        }
        logs.push(line.to_string());

        if let Some(run) = inner.runs.get_mut(&id) {
            run.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn get_logs(&self, id: RunId) -> Result<Vec<String>> {
        Ok(self.lock().logs.get(&id).cloned().unwrap_or_default())
    }

    // -- idempotency -------------------------------------------------------

    async fn resolve_or_reserve(
        &self,
        key: &str,
        candidate: RunId,
        ttl: Duration,
    ) -> Result<Reservation> {
        let mut inner = self.lock();
        let now = Instant::now();

        if let Some(entry) = inner.idempotency.get(key) {
            if entry.expires_at > now {
                return Ok(Reservation::Existing(entry.run_id));
            }
        }

        inner.idempotency.insert(
            key.to_string(),
            IdemEntry {
                run_id: candidate,
                expires_at: now + ttl,
            },
        );
        Ok(Reservation::Reserved)
    }

    async fn record_idempotency(&self, key: &str, run_id: RunId, ttl: Duration) -> Result<()> {
        self.lock().idempotency.insert(
            key.to_string(),
            IdemEntry {
                run_id,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    // -- queue + dead letter ----------------------------------------------

    async fn enqueue(&self, item: &QueueItem, delay: Duration) -> Result<()> {
        let raw = serde_json::to_string(item)?;
        self.enqueue_raw(raw, delay);
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Delivery>> {
        let deadline = Instant::now() + timeout;

        loop {
            // Register for wakeups before checking the queue, so a publish
            // landing between the check and the select is never missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(raw) = self.pop_due() {
                return Ok(Some(Delivery { raw }));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            // Wake on a new publish or when the earliest not-before comes
            // due, whichever is sooner.
            let remaining = deadline - now;
            let wait = self.next_due_in().map_or(remaining, |d| d.min(remaining));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn dead_letter(&self, raw: &str, reason: &str) -> Result<()> {
        self.lock().dead.push_back(DeadLetterItem {
            raw: raw.to_string(),
            reason: reason.to_string(),
            dead_at: Utc::now(),
        });
        Ok(())
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterItem>> {
        Ok(self.lock().dead.iter().take(limit).cloned().collect())
    }

    async fn requeue_dead_letters(&self, limit: usize) -> Result<usize> {
        let mut moved = 0;

        for _ in 0..limit {
            let entry = {
                let mut inner = self.lock();
                inner.dead.pop_front()
            };
            let Some(entry) = entry else { break };

            // Reset a replayed run back to queued so a worker can claim it.
            // Payloads that never parsed go back verbatim.
            if let Ok(item) = serde_json::from_str::<QueueItem>(&entry.raw) {
                let _ = self
                    .update_status(item.run_id, Status::Failed, Status::Queued)
                    .await;
            }

            self.enqueue_raw(entry.raw, Duration::ZERO);
            moved += 1;
        }

        Ok(moved)
    }

    async fn queue_depths(&self) -> Result<QueueDepths> {
        let inner = self.lock();
        Ok(QueueDepths {
            pending: inner.pending.len() as u64,
            dead: inner.dead.len() as u64,
        })
    }

    // -- counters + heartbeat ---------------------------------------------

    async fn incr_processed(&self, kind: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.processed += 1;
        *inner.processed_by_kind.entry(kind.to_string()).or_insert(0) += 1;
        Ok(())
    }

    async fn incr_failed(&self) -> Result<()> {
        self.lock().failed += 1;
        Ok(())
    }

    async fn counters(&self) -> Result<Counters> {
        let inner = self.lock();
        Ok(Counters {
            processed: inner.processed,
            failed: inner.failed,
            processed_by_kind: inner.processed_by_kind.clone(),
        })
    }

    async fn record_heartbeat(&self, worker_id: &str, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        self.lock().heartbeats.insert(
            worker_id.to_string(),
            HeartbeatEntry {
                beat_at: now,
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn heartbeat_age(&self) -> Result<Option<Duration>> {
        let inner = self.lock();
        let now = Instant::now();
        Ok(inner
            .heartbeats
            .values()
            .filter(|h| h.expires_at > now)
            .map(|h| now.saturating_duration_since(h.beat_at))
            .min())
    }
}
