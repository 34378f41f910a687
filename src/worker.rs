//! Worker loop: dequeue, execute, retire.
//!
//! Each worker runs a single-threaded dequeue/execute loop plus one
//! independent heartbeat task; the two share no in-process mutable state and
//! communicate only through the store. Retry backoff is attached to the
//! re-enqueued item as a not-before delay, so a backing-off run never costs
//! a worker its availability.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tokio::sync::Notify;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::model::{QueueItem, RunId, Status};
use crate::store::{Delivery, Store};
use crate::telemetry::metrics;

/// Execution failure, as reported by the pluggable unit. The core interprets
/// nothing beyond retryability.
#[derive(Debug)]
pub enum ExecError {
    /// Worth retrying within the run's budget.
    Retryable(String),
    /// Can never succeed. Dead-letters immediately.
    Permanent(String),
}

impl ExecError {
    fn message(&self) -> &str {
        match self {
            ExecError::Retryable(m) | ExecError::Permanent(m) => m,
        }
    }
}

impl std::fmt::Display for ExecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecError::Retryable(m) => write!(f, "retryable: {m}"),
            ExecError::Permanent(m) => write!(f, "permanent: {m}"),
        }
    }
}

/// The pluggable execution unit. Business logic lives behind this seam;
/// the queue core only sees success or a (non-)retryable failure.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, kind: &str, payload: &str) -> std::result::Result<String, ExecError>;
}

/// Worker tuning.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity reported with heartbeats and logs.
    pub worker_id: String,
    /// How long one dequeue call blocks before returning empty.
    pub poll_timeout: Duration,
    /// Delivery attempts before a run is dead-lettered.
    pub max_retries: u32,
    /// Exponential backoff base: delay = min(base * 2^attempt, cap).
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Heartbeat period. The liveness TTL is 5x this.
    pub heartbeat_interval: Duration,
    /// Pause after a store error before re-polling. Worker-level, never
    /// charged against any run's retry budget.
    pub store_retry_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", &Uuid::new_v4().to_string()[..8]),
            poll_timeout: Duration::from_secs(5),
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            store_retry_delay: Duration::from_secs(1),
        }
    }
}

/// Capped exponential backoff for the given attempt number.
fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt.min(16))).min(cap)
}

pub struct Worker<S, E> {
    store: Arc<S>,
    executor: Arc<E>,
    config: WorkerConfig,
    shutdown: Arc<Notify>,
}

impl<S, E> Clone for Worker<S, E> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            executor: Arc::clone(&self.executor),
            config: self.config.clone(),
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}

impl<S, E> Worker<S, E>
where
    S: Store + 'static,
    E: Executor + 'static,
{
    pub fn new(store: Arc<S>, executor: Arc<E>, config: WorkerConfig) -> Self {
        Self {
            store,
            executor,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Signal the worker (and its heartbeat task) to shut down.
    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    /// Run the dequeue/execute loop until shutdown. Spawns the heartbeat
    /// task alongside.
    pub async fn run(&self) -> Result<()> {
        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&self.store),
            self.config.worker_id.clone(),
            self.config.heartbeat_interval,
            Arc::clone(&self.shutdown),
        ));

        info!(worker_id = %self.config.worker_id, "worker started");

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!(worker_id = %self.config.worker_id, "worker shutting down");
                    break;
                }
                dequeued = self.store.dequeue(self.config.poll_timeout) => {
                    match dequeued {
                        Ok(Some(delivery)) => {
                            if let Err(e) = self.process(delivery).await {
                                error!(worker_id = %self.config.worker_id, "process error: {e}");
                            }
                        }
                        Ok(None) => {} // queue empty, poll again
                        Err(e) => {
                            // Backing store trouble is the worker's own
                            // transient problem; back off and re-poll.
                            warn!(worker_id = %self.config.worker_id, "dequeue error, backing off: {e}");
                            tokio::time::sleep(self.config.store_retry_delay).await;
                        }
                    }
                }
            }
        }

        heartbeat.abort();
        Ok(())
    }

    /// Dequeue and process at most one item. Returns whether one was handled.
    pub async fn process_one(&self, timeout: Duration) -> Result<bool> {
        match self.store.dequeue(timeout).await? {
            Some(delivery) => {
                self.process(delivery).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn process(&self, delivery: Delivery) -> Result<()> {
        // A payload that does not deserialize can never succeed: straight to
        // the dead-letter channel, no retry, logged distinctly.
        let item: QueueItem = match serde_json::from_str(&delivery.raw) {
            Ok(item) => item,
            Err(e) => {
                error!("malformed queue payload, dead-lettering: {e}");
                self.store
                    .dead_letter(&delivery.raw, &format!("malformed payload: {e}"))
                    .await?;
                metrics::queue_operations().add(
                    1,
                    &[KeyValue::new("operation", "dead_letter_malformed")],
                );
                return Ok(());
            }
        };

        let run_id = item.run_id;

        // Claim. A delivery whose run cannot enter `running` (record purged,
        // replayed twice) is unprocessable; surface it on the DLQ rather
        // than dropping it on the floor.
        if let Err(e) = self
            .store
            .update_status(run_id, Status::Queued, Status::Running)
            .await
        {
            warn!(run_id = %run_id, "claim failed, dead-lettering: {e}");
            self.store
                .dead_letter(&delivery.raw, &format!("claim failed: {e}"))
                .await?;
            return Ok(());
        }

        let attempt = self.store.record_attempt(run_id).await?;
        self.store
            .append_log(run_id, &format!("Attempt {attempt}"))
            .await?;

        let started = Instant::now();
        let outcome = self.executor.execute(&item.kind, &item.payload).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(output) => {
                self.store.set_result(run_id, &output).await?;
                self.store
                    .update_status(run_id, Status::Running, Status::Succeeded)
                    .await?;
                self.store.append_log(run_id, "DONE").await?;
                self.store.incr_processed(&item.kind).await?;

                metrics::runs_processed().add(1, &[KeyValue::new("kind", item.kind.clone())]);
                metrics::run_duration_ms()
                    .record(duration_ms as f64, &[KeyValue::new("kind", item.kind.clone())]);
                info!(run_id = %run_id, attempt, duration_ms, "run succeeded");
            }
            Err(err) => {
                self.store
                    .append_log(run_id, &format!("ERROR: {}", err.message()))
                    .await?;
                self.retire_failed(&item, attempt, err, duration_ms).await?;
            }
        }

        Ok(())
    }

    /// Retire a failed attempt: re-enqueue with backoff while budget remains,
    /// otherwise dead-letter.
    async fn retire_failed(
        &self,
        item: &QueueItem,
        attempt: u32,
        err: ExecError,
        duration_ms: u64,
    ) -> Result<()> {
        let run_id = item.run_id;
        let retryable = matches!(err, ExecError::Retryable(_));

        if retryable && attempt < self.config.max_retries {
            let delay = backoff_delay(
                self.config.backoff_base,
                self.config.backoff_cap,
                attempt,
            );
            warn!(
                run_id = %run_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "run failed, re-enqueueing with backoff: {}",
                err.message()
            );

            // Publish first, then reset status: a run must never sit in
            // `queued` with nothing on the channel.
            let retry = QueueItem {
                run_id,
                kind: item.kind.clone(),
                payload: item.payload.clone(),
                attempt,
            };
            self.store.enqueue(&retry, delay).await?;
            self.store
                .update_status(run_id, Status::Running, Status::Queued)
                .await?;
            return Ok(());
        }

        let reason = if retryable {
            format!(
                "exhausted {attempt}/{} attempts: {}",
                self.config.max_retries,
                err.message()
            )
        } else {
            format!("non-retryable failure: {}", err.message())
        };
        error!(run_id = %run_id, attempt, duration_ms, "run failed terminally: {reason}");

        self.store
            .update_status(run_id, Status::Running, Status::Failed)
            .await?;
        self.store
            .dead_letter(&serde_json::to_string(item)?, &reason)
            .await?;
        self.store.incr_failed().await?;

        metrics::runs_failed().add(1, &[KeyValue::new("kind", item.kind.clone())]);
        Ok(())
    }
}

/// Periodic liveness beats, TTL'd at 5x the interval so a stalled or crashed
/// worker becomes visible by heartbeat age or absence.
async fn heartbeat_loop<S: Store>(
    store: Arc<S>,
    worker_id: String,
    interval: Duration,
    shutdown: Arc<Notify>,
) {
    let ttl = interval * 5;
    loop {
        if let Err(e) = store.record_heartbeat(&worker_id, ttl).await {
            warn!(worker_id = %worker_id, "heartbeat write failed: {e}");
        }
        tokio::select! {
            _ = shutdown.notified() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_exponential_and_capped() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(30);

        assert_eq!(backoff_delay(base, cap, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, cap, 2), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, cap, 3), Duration::from_secs(8));
        assert_eq!(backoff_delay(base, cap, 10), cap);
        assert_eq!(backoff_delay(base, cap, 1_000), cap);
    }

    #[test]
    fn backoff_is_monotonic() {
        let base = Duration::from_millis(250);
        let cap = Duration::from_secs(30);
        let mut last = Duration::ZERO;
        for attempt in 0..40 {
            let delay = backoff_delay(base, cap, attempt);
            assert!(delay >= last, "delay shrank at attempt {attempt}");
            last = delay;
        }
    }
}
