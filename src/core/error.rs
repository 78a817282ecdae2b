//! Pipeline error taxonomy.
//!
//! Every failure that crosses a module boundary is a `PipelineError`.
//! Whether a job is retried is decided by [`PipelineError::is_retriable`].

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::domain::{ProjectState, Stage};

use super::queue::QueueError;

/// Errors raised by the pipeline core
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("project {project_id} is at stage {actual}, expected {expected}")]
    StageMismatch {
        project_id: Uuid,
        expected: Stage,
        actual: Stage,
    },

    #[error("project {project_id} is halted in state {state}")]
    ProjectHalted { project_id: Uuid, state: ProjectState },

    #[error("Invalid stage transition: {from} → {to}")]
    InvalidTransition { from: Stage, to: Stage },

    #[error("Invalid state change: {from} → {to}")]
    InvalidStateChange { from: ProjectState, to: ProjectState },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("job {job_id} exhausted after {attempts} attempts: {last_error}")]
    JobExhausted {
        job_id: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Job timed out after {0:?}")]
    Timeout(Duration),
}

impl PipelineError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Whether a job failing with this error should be attempted again.
    ///
    /// Guard and lookup failures will fail the same way on every attempt.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Generation(_) | Self::Persistence(_) | Self::Queue(_) | Self::Timeout(_)
        )
    }

    /// Short machine-readable kind, used in logs and run records
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::StageMismatch { .. } => "stage_mismatch",
            Self::ProjectHalted { .. } => "project_halted",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::InvalidStateChange { .. } => "invalid_state_change",
            Self::InvalidInput(_) => "invalid_input",
            Self::Generation(_) => "generation_failure",
            Self::Validation(_) => "validation_failure",
            Self::Persistence(_) => "persistence_failure",
            Self::Queue(_) => "queue_failure",
            Self::JobExhausted { .. } => "job_exhausted",
            Self::Timeout(_) => "timeout",
        }
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Persistence(format!("serialization: {}", err))
    }
}

impl From<QueueError> for PipelineError {
    fn from(err: QueueError) -> Self {
        Self::Queue(err.to_string())
    }
}
