//! Error types for runq.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("run not found: {0}")]
    NotFound(String),

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: crate::model::Status,
        to: crate::model::Status,
    },

    #[error("malformed queue payload: {0}")]
    MalformedPayload(String),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
