//! Postgres store.
//!
//! Run records, logs, idempotency keys, counters, and heartbeats live in
//! plain tables (see ./migrations); the pending and dead-letter channels are
//! pgmq queues. pgmq gives us the two primitives the core leans on:
//! `pgmq.pop` is an atomic read-and-delete, and `pgmq.send` takes a delay so
//! retry backoff rides on the message instead of blocking a worker.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{DeadLetterItem, Project, ProjectId, QueueItem, Run, RunId, Status};

use super::{Counters, Delivery, QueueDepths, Reservation, Store};

/// Tuning knobs for the Postgres backend.
#[derive(Debug, Clone)]
pub struct PgStoreOptions {
    /// pgmq queue name for the pending channel.
    pub pending_queue: String,
    /// pgmq queue name for the dead-letter channel.
    pub dead_queue: String,
    /// Per-run log cap. Appends past the cap are dropped.
    pub max_log_lines: i64,
    /// How often `dequeue` re-polls pgmq while blocking.
    pub poll_interval: Duration,
}

impl Default for PgStoreOptions {
    fn default() -> Self {
        Self {
            pending_queue: "runs".to_string(),
            dead_queue: "runs_dead".to_string(),
            max_log_lines: 1_000,
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// Durable store handle. Owns the connection pool.
pub struct PgStore {
    pool: PgPool,
    opts: PgStoreOptions,
}

impl PgStore {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str, opts: PgStoreOptions) -> Result<Self> {
        let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
        Ok(Self { pool, opts })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Create both pgmq queues (idempotent).
    pub async fn create_queues(&self) -> Result<()> {
        for queue in [&self.opts.pending_queue, &self.opts.dead_queue] {
            sqlx::query("SELECT pgmq.create($1)")
                .bind(queue)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Simple health check — run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn send(&self, queue: &str, payload: &serde_json::Value, delay: Duration) -> Result<()> {
        sqlx::query("SELECT pgmq.send($1, $2, $3)")
            .bind(queue)
            .bind(payload)
            .bind(delay.as_secs() as i32)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Atomic pop: read-and-delete the next visible message, or None.
    async fn pop(&self, queue: &str) -> Result<Option<serde_json::Value>> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT message FROM pgmq.pop($1)")
                .bind(queue)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(message,)| message))
    }

    async fn queue_len(&self, queue: &str) -> Result<u64> {
        let row: (i64,) = sqlx::query_as("SELECT queue_length FROM pgmq.metrics($1)")
            .bind(queue)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0.max(0) as u64)
    }
}

#[async_trait]
impl Store for PgStore {
    // -- projects ----------------------------------------------------------

    async fn insert_project(&self, project: &Project) -> Result<()> {
        sqlx::query("INSERT INTO projects (id, name, created_at) VALUES ($1, $2, $3)")
            .bind(project.id.0)
            .bind(&project.name)
            .bind(project.created_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_project(&self, id: ProjectId) -> Result<Option<Project>> {
        let row: Option<(Uuid, String, DateTime<Utc>)> =
            sqlx::query_as("SELECT id, name, created_at FROM projects WHERE id = $1")
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id, name, created_at)| Project {
            id: ProjectId(id),
            name,
            created_at,
        }))
    }

    async fn list_projects(&self, limit: i64) -> Result<Vec<Project>> {
        let rows: Vec<(Uuid, String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT id, name, created_at FROM projects ORDER BY created_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, name, created_at)| Project {
                id: ProjectId(id),
                name,
                created_at,
            })
            .collect())
    }

    // -- runs --------------------------------------------------------------

    async fn insert_run(&self, run: &Run) -> Result<()> {
        sqlx::query(
            "INSERT INTO runs (id, project_id, kind, payload, fingerprint, status, attempt, result, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(run.id.0)
        .bind(run.project_id.0)
        .bind(&run.kind)
        .bind(&run.payload)
        .bind(&run.fingerprint)
        .bind(run.status.to_string())
        .bind(run.attempt as i32)
        .bind(&run.result)
        .bind(run.created_at)
        .bind(run.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_run(&self, id: RunId) -> Result<Option<Run>> {
        let row: Option<RunRow> = sqlx::query_as(
            "SELECT id, project_id, kind, payload, fingerprint, status, attempt, result, created_at, updated_at
             FROM runs WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(RunRow::try_into_run).transpose()
    }

    async fn list_runs(&self, limit: i64) -> Result<Vec<Run>> {
        let rows: Vec<RunRow> = sqlx::query_as(
            "SELECT id, project_id, kind, payload, fingerprint, status, attempt, result, created_at, updated_at
             FROM runs ORDER BY created_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(RunRow::try_into_run).collect()
    }

    async fn update_status(&self, id: RunId, from: Status, to: Status) -> Result<()> {
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition { from, to });
        }

        let rows_affected = sqlx::query(
            "UPDATE runs SET status = $1, updated_at = now() WHERE id = $2 AND status = $3",
        )
        .bind(to.to_string())
        .bind(id.0)
        .bind(from.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            // Distinguish a missing row from a stale `from` status.
            let current: Option<(String,)> =
                sqlx::query_as("SELECT status FROM runs WHERE id = $1")
                    .bind(id.0)
                    .fetch_optional(&self.pool)
                    .await?;
            return match current {
                Some((status,)) => Err(Error::InvalidTransition {
                    from: status.parse()?,
                    to,
                }),
                None => Err(Error::NotFound(id.to_string())),
            };
        }
        Ok(())
    }

    async fn record_attempt(&self, id: RunId) -> Result<u32> {
        let row: Option<(i32,)> = sqlx::query_as(
            "UPDATE runs SET attempt = attempt + 1, updated_at = now() WHERE id = $1 RETURNING attempt",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        let (attempt,) = row.ok_or_else(|| Error::NotFound(id.to_string()))?;
        Ok(attempt as u32)
    }

    async fn set_result(&self, id: RunId, result: &str) -> Result<()> {
        sqlx::query("UPDATE runs SET result = $1, updated_at = now() WHERE id = $2")
            .bind(result)
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // -- logs --------------------------------------------------------------

    async fn append_log(&self, id: RunId, line: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // Guarded insert: appends past the cap are dropped, never rewritten.
        sqlx::query(
            "INSERT INTO run_logs (run_id, line)
             SELECT $1, $2
             WHERE (SELECT count(*) FROM run_logs WHERE run_id = $1) < $3",
        )
        .bind(id.0)
        .bind(line)
        .bind(self.opts.max_log_lines)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE runs SET updated_at = now() WHERE id = $1")
            .bind(id.0)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_logs(&self, id: RunId) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT line FROM run_logs WHERE run_id = $1 ORDER BY id ASC")
                .bind(id.0)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(line,)| line).collect())
    }

    // -- idempotency -------------------------------------------------------

    async fn resolve_or_reserve(
        &self,
        key: &str,
        candidate: RunId,
        ttl: Duration,
    ) -> Result<Reservation> {
        // Single-statement reservation: the insert wins outright, or takes
        // over an expired entry. A conflict with a live entry returns no row.
        let reserved: Option<(Uuid,)> = sqlx::query_as(
            "INSERT INTO idempotency_keys (key, run_id, expires_at)
             VALUES ($1, $2, now() + make_interval(secs => $3))
             ON CONFLICT (key) DO UPDATE
                SET run_id = EXCLUDED.run_id, expires_at = EXCLUDED.expires_at
                WHERE idempotency_keys.expires_at <= now()
             RETURNING run_id",
        )
        .bind(key)
        .bind(candidate.0)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        if reserved.is_some() {
            return Ok(Reservation::Reserved);
        }

        let existing: Option<(Uuid,)> =
            sqlx::query_as("SELECT run_id FROM idempotency_keys WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        match existing {
            Some((run_id,)) => Ok(Reservation::Existing(RunId(run_id))),
            None => {
                // The conflicting entry vanished between statements.
                self.record_idempotency(key, candidate, ttl).await?;
                Ok(Reservation::Reserved)
            }
        }
    }

    async fn record_idempotency(&self, key: &str, run_id: RunId, ttl: Duration) -> Result<()> {
        sqlx::query(
            "INSERT INTO idempotency_keys (key, run_id, expires_at)
             VALUES ($1, $2, now() + make_interval(secs => $3))
             ON CONFLICT (key) DO UPDATE
                SET run_id = EXCLUDED.run_id, expires_at = EXCLUDED.expires_at",
        )
        .bind(key)
        .bind(run_id.0)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // -- queue + dead letter ----------------------------------------------

    async fn enqueue(&self, item: &QueueItem, delay: Duration) -> Result<()> {
        let payload = serde_json::to_value(item)?;
        self.send(&self.opts.pending_queue, &payload, delay).await
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Delivery>> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(message) = self.pop(&self.opts.pending_queue).await? {
                return Ok(Some(Delivery {
                    raw: message.to_string(),
                }));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.opts.poll_interval.min(deadline - now)).await;
        }
    }

    async fn dead_letter(&self, raw: &str, reason: &str) -> Result<()> {
        // Keep the payload as structured JSON when it parses; wrap garbage
        // as a string so it survives the jsonb round trip verbatim.
        let payload = serde_json::from_str::<serde_json::Value>(raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
        let entry = serde_json::json!({
            "payload": payload,
            "reason": reason,
            "dead_at": Utc::now(),
        });
        self.send(&self.opts.dead_queue, &entry, Duration::ZERO).await
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterItem>> {
        // Non-destructive peek at the queue table; pgmq.read would set a
        // visibility timeout and hide entries from requeue.
        let sql = format!(
            "SELECT message FROM pgmq.q_{} ORDER BY msg_id ASC LIMIT $1",
            self.opts.dead_queue
        );
        let rows: Vec<(serde_json::Value,)> = sqlx::query_as(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(message,)| dead_letter_from_message(&message))
            .collect())
    }

    async fn requeue_dead_letters(&self, limit: usize) -> Result<usize> {
        let mut moved = 0;

        for _ in 0..limit {
            let Some(message) = self.pop(&self.opts.dead_queue).await? else {
                break;
            };

            let payload = message
                .get("payload")
                .cloned()
                .unwrap_or(serde_json::Value::Null);

            if let Ok(item) = serde_json::from_value::<QueueItem>(payload.clone()) {
                // Replayed runs become claimable again; invalid transitions
                // (run already replayed or purged) are not fatal here.
                if let Err(e) = self
                    .update_status(item.run_id, Status::Failed, Status::Queued)
                    .await
                {
                    tracing::warn!(run_id = %item.run_id, "dlq requeue status reset skipped: {e}");
                }
            }

            self.send(&self.opts.pending_queue, &payload, Duration::ZERO)
                .await?;
            moved += 1;
        }

        Ok(moved)
    }

    async fn queue_depths(&self) -> Result<QueueDepths> {
        Ok(QueueDepths {
            pending: self.queue_len(&self.opts.pending_queue).await?,
            dead: self.queue_len(&self.opts.dead_queue).await?,
        })
    }

    // -- counters + heartbeat ---------------------------------------------

    async fn incr_processed(&self, kind: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO run_counters (name, value) VALUES ('processed', 1)
             ON CONFLICT (name) DO UPDATE SET value = run_counters.value + 1",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO runs_processed_by_kind (kind, value) VALUES ($1, 1)
             ON CONFLICT (kind) DO UPDATE SET value = runs_processed_by_kind.value + 1",
        )
        .bind(kind)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn incr_failed(&self) -> Result<()> {
        sqlx::query(
            "INSERT INTO run_counters (name, value) VALUES ('failed', 1)
             ON CONFLICT (name) DO UPDATE SET value = run_counters.value + 1",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn counters(&self) -> Result<Counters> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT name, value FROM run_counters")
                .fetch_all(&self.pool)
                .await?;

        let mut counters = Counters::default();
        for (name, value) in rows {
            match name.as_str() {
                "processed" => counters.processed = value.max(0) as u64,
                "failed" => counters.failed = value.max(0) as u64,
                _ => {}
            }
        }

        let by_kind: Vec<(String, i64)> =
            sqlx::query_as("SELECT kind, value FROM runs_processed_by_kind")
                .fetch_all(&self.pool)
                .await?;
        counters.processed_by_kind = by_kind
            .into_iter()
            .map(|(kind, value)| (kind, value.max(0) as u64))
            .collect();

        Ok(counters)
    }

    async fn record_heartbeat(&self, worker_id: &str, ttl: Duration) -> Result<()> {
        sqlx::query(
            "INSERT INTO worker_heartbeats (worker_id, beat_at, expires_at)
             VALUES ($1, now(), now() + make_interval(secs => $2))
             ON CONFLICT (worker_id) DO UPDATE
                SET beat_at = EXCLUDED.beat_at, expires_at = EXCLUDED.expires_at",
        )
        .bind(worker_id)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn heartbeat_age(&self) -> Result<Option<Duration>> {
        let row: (Option<f64>,) = sqlx::query_as(
            "SELECT min(extract(epoch FROM (now() - beat_at)))::float8
             FROM worker_heartbeats WHERE expires_at > now()",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0.map(|secs| Duration::from_secs_f64(secs.max(0.0))))
    }
}

fn dead_letter_from_message(message: &serde_json::Value) -> DeadLetterItem {
    let raw = message
        .get("payload")
        .map(|p| match p {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_else(|| message.to_string());
    let reason = message
        .get("reason")
        .and_then(|r| r.as_str())
        .unwrap_or("unknown")
        .to_string();
    let dead_at = message
        .get("dead_at")
        .and_then(|d| d.as_str())
        .and_then(|d| d.parse().ok())
        .unwrap_or_else(Utc::now);

    DeadLetterItem {
        raw,
        reason,
        dead_at,
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    project_id: Uuid,
    kind: String,
    payload: String,
    fingerprint: String,
    status: String,
    attempt: i32,
    result: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl RunRow {
    fn try_into_run(self) -> Result<Run> {
        Ok(Run {
            id: RunId(self.id),
            project_id: ProjectId(self.project_id),
            kind: self.kind,
            payload: self.payload,
            fingerprint: self.fingerprint,
            status: self.status.parse()?,
            attempt: self.attempt.max(0) as u32,
            result: self.result,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
