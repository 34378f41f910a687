//! Run service. The public API for submitting and inspecting runs.
//!
//! Owns the injected store and enforces the submission contract: project
//! validation, content fingerprinting, reservation-first dedup, and the
//! record-before-enqueue ordering that lets a worker which dequeues
//! immediately always find the run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use opentelemetry::KeyValue;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::model::{
    DeadLetterItem, NewRun, Project, QueueItem, Run, RunId, Status, fingerprint,
};
use crate::store::{Reservation, Store};
use crate::telemetry::metrics;

/// What the caller gets back from a submission.
#[derive(Debug, Clone)]
pub struct Submission {
    pub run_id: RunId,
    pub status: Status,
    /// True when the submission deduplicated onto an existing run.
    pub idempotent: bool,
}

/// Full read view of a run: persisted record plus its log lines.
#[derive(Debug, Clone)]
pub struct RunView {
    pub run: Run,
    pub logs: Vec<String>,
}

/// Read-only aggregation for the metrics/status surface.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub pending: u64,
    pub dead: u64,
    pub processed: u64,
    pub failed: u64,
    pub processed_by_kind: HashMap<String, u64>,
    pub heartbeat_age: Option<Duration>,
}

/// How long a duplicate submission waits for the reservation winner's run
/// record to become visible before treating the mapping as stale.
const REBIND_GRACE: Duration = Duration::from_millis(500);
const REBIND_POLL: Duration = Duration::from_millis(25);

pub struct RunService<S> {
    store: Arc<S>,
    /// How long an idempotency mapping keeps matching re-submissions.
    idempotency_ttl: Duration,
}

impl<S: Store> RunService<S> {
    pub fn new(store: Arc<S>, idempotency_ttl: Duration) -> Self {
        Self {
            store,
            idempotency_ttl,
        }
    }

    // -- projects ----------------------------------------------------------

    pub async fn create_project(&self, name: impl Into<String>) -> Result<Project> {
        let project = Project::new(name);
        self.store.insert_project(&project).await?;
        info!(project_id = %project.id, name = %project.name, "project created");
        Ok(project)
    }

    pub async fn list_projects(&self, limit: i64) -> Result<Vec<Project>> {
        self.store.list_projects(limit).await
    }

    // -- submission --------------------------------------------------------

    /// Submit a run. An explicit idempotency key wins over the derived
    /// content fingerprint; either way, re-submission within the TTL returns
    /// the existing run with `idempotent = true` and does no further writes.
    ///
    /// Any store failure propagates: submission fails closed rather than
    /// skipping dedup and risking duplicate side effects.
    pub async fn submit(&self, new: NewRun) -> Result<Submission> {
        if self.store.get_project(new.project_id).await?.is_none() {
            return Err(Error::ProjectNotFound(new.project_id.to_string()));
        }

        let print = fingerprint(new.project_id, &new.kind, &new.payload);
        let key = new
            .idempotency_key
            .clone()
            .unwrap_or_else(|| format!("{}:{print}", new.project_id));

        // Reserve before creating. Exactly one concurrent caller per key
        // proceeds to create; losers observe the winner's run id.
        let candidate = RunId::new();
        match self
            .store
            .resolve_or_reserve(&key, candidate, self.idempotency_ttl)
            .await?
        {
            Reservation::Existing(existing) => {
                if let Some(run) = self.await_mapped_run(existing).await? {
                    metrics::runs_submitted().add(
                        1,
                        &[
                            KeyValue::new("kind", new.kind.clone()),
                            KeyValue::new("result", "duplicate"),
                        ],
                    );
                    info!(run_id = %run.id, "duplicate submission, returning existing run");
                    return Ok(Submission {
                        run_id: run.id,
                        status: run.status,
                        idempotent: true,
                    });
                }
                // The grace window elapsed with no record: the mapped run
                // was purged. Rebind the key to our candidate and create
                // fresh.
                self.store
                    .record_idempotency(&key, candidate, self.idempotency_ttl)
                    .await?;
            }
            Reservation::Reserved => {}
        }

        let now = Utc::now();
        let run = Run {
            id: candidate,
            project_id: new.project_id,
            kind: new.kind,
            payload: new.payload,
            fingerprint: print,
            status: Status::Queued,
            attempt: 0,
            created_at: now,
            updated_at: now,
            result: None,
        };

        // The record must be durable before the queue item is published.
        self.store.insert_run(&run).await?;

        if let Err(e) = self
            .store
            .enqueue(&QueueItem::for_run(&run), Duration::ZERO)
            .await
        {
            // Never leave the run silently queued with nothing in the
            // channel: mark it failed with the reason, then report.
            warn!(run_id = %run.id, "enqueue failed after run was written: {e}");
            let _ = self
                .store
                .append_log(run.id, &format!("ERROR: enqueue failed: {e}"))
                .await;
            if let Err(mark) = self
                .store
                .update_status(run.id, Status::Queued, Status::Failed)
                .await
            {
                warn!(run_id = %run.id, "could not mark run failed: {mark}");
            }
            return Err(e);
        }

        metrics::runs_submitted().add(
            1,
            &[
                KeyValue::new("kind", run.kind.clone()),
                KeyValue::new("result", "ok"),
            ],
        );
        info!(run_id = %run.id, kind = %run.kind, "run submitted");

        Ok(Submission {
            run_id: run.id,
            status: Status::Queued,
            idempotent: false,
        })
    }

    /// Resolve a key's mapped run, tolerating the window in which another
    /// submitter holds the reservation but has not yet written the record.
    /// Only after the grace window may a mapping be treated as purged.
    async fn await_mapped_run(&self, id: RunId) -> Result<Option<Run>> {
        let deadline = tokio::time::Instant::now() + REBIND_GRACE;
        loop {
            if let Some(run) = self.store.get_run(id).await? {
                return Ok(Some(run));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(REBIND_POLL).await;
        }
    }

    // -- read path ---------------------------------------------------------

    /// Resolve a run selector: a full UUID, or a unique id prefix.
    pub async fn resolve_run(&self, selector: &str) -> Result<RunId> {
        if let Ok(id) = selector.parse::<RunId>() {
            return Ok(id);
        }

        let runs = self.store.list_runs(100).await?;
        let matches: Vec<RunId> = runs
            .iter()
            .map(|run| run.id)
            .filter(|id| id.to_string().starts_with(selector))
            .collect();
        match matches.len() {
            0 => Err(Error::NotFound(selector.to_string())),
            1 => Ok(matches[0]),
            n => Err(Error::Other(format!(
                "{n} runs match prefix '{selector}', be more specific"
            ))),
        }
    }

    /// Fetch a run with its logs. NotFound for unknown ids.
    pub async fn fetch(&self, id: RunId) -> Result<RunView> {
        let run = self
            .store
            .get_run(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        let logs = self.store.get_logs(id).await?;
        Ok(RunView { run, logs })
    }

    /// Queue depths, processed/failed counters, and worker heartbeat age.
    pub async fn status(&self) -> Result<StatusReport> {
        let depths = self.store.queue_depths().await?;
        let counters = self.store.counters().await?;
        let heartbeat_age = self.store.heartbeat_age().await?;
        Ok(StatusReport {
            pending: depths.pending,
            dead: depths.dead,
            processed: counters.processed,
            failed: counters.failed,
            processed_by_kind: counters.processed_by_kind,
            heartbeat_age,
        })
    }

    // -- operator surface --------------------------------------------------

    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterItem>> {
        self.store.list_dead_letters(limit).await
    }

    /// Move up to `limit` dead-lettered items back onto the pending channel.
    /// Operator-triggered; never automatic.
    pub async fn requeue_dead_letters(&self, limit: usize) -> Result<usize> {
        let moved = self.store.requeue_dead_letters(limit).await?;
        if moved > 0 {
            info!(moved, "dead letters requeued");
        }
        Ok(moved)
    }
}
