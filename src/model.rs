//! Core data model.
//!
//! A run is one unit of submitted work tracked through its lifecycle. It has
//! identity, an owning project, an immutable work description (kind + payload),
//! a content fingerprint for dedup, and a lifecycle status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// A unit of submitted work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Unique identifier, generated at submission time.
    pub id: RunId,

    /// Owning project. Existence is checked at submission.
    pub project_id: ProjectId,

    /// What kind of work this is (e.g., "python", "echo"). Routed to the
    /// pluggable executor; the core does not interpret it.
    pub kind: String,

    /// The work description. Opaque to the core, immutable once submitted.
    pub payload: String,

    /// Deterministic SHA-256 over (project_id, kind, payload). Used as the
    /// idempotency key when the caller supplies none.
    pub fingerprint: String,

    /// Current lifecycle status.
    pub status: Status,

    /// Number of delivery attempts so far. Starts at 0, incremented once
    /// per claim.
    pub attempt: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Terminal output. Set exactly once, only on success.
    pub result: Option<String>,
}

/// Newtype for run IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse().map(RunId)
    }
}

/// Newtype for project IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProjectId(pub Uuid);

impl ProjectId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for ProjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::str::FromStr for ProjectId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse().map(ProjectId)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Waiting on the pending channel for a worker.
    Queued,
    /// Claimed by a worker, executing.
    Running,
    /// Done successfully, result set. Terminal.
    Succeeded,
    /// Retry budget exhausted or enqueue failed. Terminal (until an
    /// operator replays it from the dead-letter channel).
    Failed,
}

impl Status {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (Queued, Running)       // claim
                | (Queued, Failed)  // enqueue failed after record was written
                | (Running, Succeeded)
                | (Running, Queued) // transient failure, re-enqueued
                | (Running, Failed) // budget exhausted
                | (Failed, Queued) // operator DLQ replay
        )
    }

    /// Is this a terminal status?
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Succeeded | Status::Failed)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Queued => "queued",
            Status::Running => "running",
            Status::Succeeded => "succeeded",
            Status::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Status {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Status::Queued),
            "running" => Ok(Status::Running),
            "succeeded" => Ok(Status::Succeeded),
            "failed" => Ok(Status::Failed),
            _ => Err(crate::error::Error::Other(format!("unknown status: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Project
// ---------------------------------------------------------------------------

/// An owning project for runs. No cascading delete semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Project {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: ProjectId::new(),
            name: name.into(),
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Queue payloads
// ---------------------------------------------------------------------------

/// The reference placed on the pending channel. Serialized as JSON; the raw
/// string is what travels, so a worker can always dead-letter an
/// undeserializable payload verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub run_id: RunId,
    pub kind: String,
    pub payload: String,
    /// Attempt count at enqueue time. Informational; the persisted run's
    /// `attempt` is authoritative.
    pub attempt: u32,
}

impl QueueItem {
    pub fn for_run(run: &Run) -> Self {
        Self {
            run_id: run.id,
            kind: run.kind.clone(),
            payload: run.payload.clone(),
            attempt: run.attempt,
        }
    }
}

/// A queue item that exhausted its retry budget or failed to deserialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterItem {
    /// The last-known raw payload, preserved even when it never parsed.
    pub raw: String,
    /// Terminal failure reason.
    pub reason: String,
    pub dead_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Submission input
// ---------------------------------------------------------------------------

/// Builder for submitting a new run. The service's public input type.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub(crate) project_id: ProjectId,
    pub(crate) kind: String,
    pub(crate) payload: String,
    pub(crate) idempotency_key: Option<String>,
}

impl NewRun {
    pub fn new(project_id: ProjectId, kind: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            project_id,
            kind: kind.into(),
            payload: payload.into(),
            idempotency_key: None,
        }
    }

    /// Caller-supplied idempotency key. Wins over the derived fingerprint.
    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Deterministic content fingerprint over (project_id, kind, payload).
pub fn fingerprint(project_id: ProjectId, kind: &str, payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(project_id.0.as_bytes());
    hasher.update(b"|");
    hasher.update(kind.as_bytes());
    hasher.update(b"|");
    hasher.update(payload.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic() {
        let pid = ProjectId::new();
        let a = fingerprint(pid, "echo", "hello");
        let b = fingerprint(pid, "echo", "hello");
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_varies_with_any_field() {
        let pid = ProjectId::new();
        let base = fingerprint(pid, "echo", "hello");
        assert_ne!(base, fingerprint(pid, "echo", "world"));
        assert_ne!(base, fingerprint(pid, "python", "hello"));
        assert_ne!(base, fingerprint(ProjectId::new(), "echo", "hello"));
    }

    #[test]
    fn terminal_statuses() {
        assert!(Status::Succeeded.is_terminal());
        assert!(Status::Failed.is_terminal());
        assert!(!Status::Queued.is_terminal());
        assert!(!Status::Running.is_terminal());
    }

    #[test]
    fn transition_matrix() {
        use Status::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(Succeeded));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Queued));
        assert!(Failed.can_transition_to(Queued));

        assert!(!Queued.can_transition_to(Succeeded));
        assert!(!Succeeded.can_transition_to(Queued));
        assert!(!Succeeded.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Running));
    }

    #[test]
    fn status_round_trips_through_display() {
        for s in [Status::Queued, Status::Running, Status::Succeeded, Status::Failed] {
            let parsed: Status = s.to_string().parse().unwrap();
            assert_eq!(parsed, s);
        }
    }
}
