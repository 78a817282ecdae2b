//! Project state machine.
//!
//! Stage moves strictly forward along
//! `Idea → FeasibilityComplete → PlanningComplete → ExecutionInProgress → ExecutionComplete`.
//! State starts at `Active`; `Rejected` and `Error` are absorbing.

use crate::domain::{Project, ProjectState, Stage, StageName};

use super::error::PipelineError;

/// Stateless rule table consulted by every mutation path
pub struct ProjectStateMachine;

impl ProjectStateMachine {
    /// Check whether a stage transition is allowed
    pub fn can_transition(from: Stage, to: Stage) -> bool {
        matches!(
            (from, to),
            (Stage::Idea, Stage::FeasibilityComplete)
                | (Stage::FeasibilityComplete, Stage::PlanningComplete)
                | (Stage::PlanningComplete, Stage::ExecutionInProgress)
                | (Stage::ExecutionInProgress, Stage::ExecutionComplete)
        )
    }

    /// Validate a stage transition and return the new stage
    pub fn apply_transition(from: Stage, to: Stage) -> Result<Stage, PipelineError> {
        if Self::can_transition(from, to) {
            Ok(to)
        } else {
            Err(PipelineError::InvalidTransition { from, to })
        }
    }

    /// Check whether a lifecycle state change is allowed
    pub fn can_change_state(from: ProjectState, to: ProjectState) -> bool {
        matches!(
            (from, to),
            (ProjectState::Active, ProjectState::Approved)
                | (ProjectState::Active, ProjectState::Rejected)
                | (ProjectState::Active, ProjectState::Error)
                | (ProjectState::Approved, ProjectState::Error)
        )
    }

    /// Validate a state change and return the new state
    pub fn apply_state_change(
        from: ProjectState,
        to: ProjectState,
    ) -> Result<ProjectState, PipelineError> {
        if Self::can_change_state(from, to) {
            Ok(to)
        } else {
            Err(PipelineError::InvalidStateChange { from, to })
        }
    }

    /// Guard run before a stage is enqueued or processed.
    ///
    /// The project must not be halted and must sit exactly at the stage
    /// preceding `stage`.
    pub fn check_trigger(stage: StageName, project: &Project) -> Result<(), PipelineError> {
        if project.is_halted() {
            return Err(PipelineError::ProjectHalted {
                project_id: project.id,
                state: project.state,
            });
        }

        let expected = stage.precondition();
        if project.stage != expected {
            return Err(PipelineError::StageMismatch {
                project_id: project.id,
                expected,
                actual: project.stage,
            });
        }

        Ok(())
    }
}
