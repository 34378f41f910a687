//! # runq
//!
//! Submit-and-watch run queue core: idempotent submission, at-least-once
//! delivery to a worker pool, bounded retry with capped exponential backoff,
//! dead-lettering, and liveness/metrics reporting.
//!
//! Storage is an injected [`store::Store`] with an in-memory implementation
//! for tests and a Postgres + pgmq implementation for production.

pub mod config;
pub mod error;
pub mod model;
pub mod service;
pub mod store;
pub mod telemetry;
pub mod worker;
