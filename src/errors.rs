//! Typed error hierarchy for the agency desk.
//!
//! Two top-level enums cover the two layers:
//! - `SlugError`: slug allocation and key validation failures
//! - `BoardError`: client/project/sprint/task operations

use thiserror::Error;

use crate::board::models::EntityKind;

/// Errors from the slug allocator.
///
/// Compare-and-set conflicts never appear here: the allocator retries them
/// until it succeeds or the retry budget runs out.
#[derive(Debug, Error)]
pub enum SlugError {
    /// The counter record or the target entity vanished mid-allocation.
    #[error("{what} not found")]
    NotFound { what: String },

    #[error("Too much contention allocating a {kind} number for key {key} ({attempts} attempts)")]
    ContentionExceeded {
        key: String,
        kind: EntityKind,
        attempts: u32,
    },

    #[error("Invalid project key '{0}': expected 2-10 ASCII letters or digits")]
    InvalidKey(String),

    #[error("Store error: {0}")]
    Store(#[source] anyhow::Error),
}

impl SlugError {
    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }
}

impl From<anyhow::Error> for SlugError {
    fn from(err: anyhow::Error) -> Self {
        Self::Store(err)
    }
}

/// Errors from board operations (CRUD around the slug allocator).
#[derive(Debug, Error)]
pub enum BoardError {
    #[error("Client {id} not found")]
    ClientNotFound { id: i64 },

    #[error("Project {id} not found")]
    ProjectNotFound { id: i64 },

    #[error("Sprint {id} not found")]
    SprintNotFound { id: i64 },

    #[error("Task {id} not found")]
    TaskNotFound { id: i64 },

    #[error("Project key {key} already belongs to another client")]
    KeyTaken { key: String },

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Slug(#[from] SlugError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for BoardError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Other(err.into())
    }
}

pub type BoardResult<T> = std::result::Result<T, BoardError>;
