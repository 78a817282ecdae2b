//! Persistence gateway.
//!
//! The store is the only component that mutates project state or stage.
//! Every mutation goes through the rules in `core::state_machine`, and
//! the guard is re-checked against the live row inside the same atomic
//! unit that writes artifacts and runs.
//!
//! Two implementations share the guard logic defined here:
//! - `SqliteStore`: relational backend (rusqlite)
//! - `MemoryStore`: in-process test double

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use uuid::Uuid;

use crate::core::error::PipelineError;
use crate::core::state_machine::ProjectStateMachine;
use crate::domain::{
    Artifact, ArtifactType, Decision, Idea, NewArtifact, Project, ProjectState, Run, Stage,
};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Artifacts, runs and a stage transition applied as one unit
#[derive(Debug, Clone)]
pub struct StageCommit {
    pub project_id: Uuid,

    /// Stage the project must be at for the commit to apply
    pub expected_stage: Stage,

    /// Stage the project moves to
    pub new_stage: Stage,

    /// Stages passed through on the way to `new_stage`, each hop checked
    pub via: Vec<Stage>,

    /// Inserted with conflict-ignore on (project, stage, type)
    pub artifacts: Vec<NewArtifact>,

    /// Appended unconditionally
    pub runs: Vec<Run>,
}

impl StageCommit {
    pub fn new(project_id: Uuid, expected_stage: Stage, new_stage: Stage) -> Self {
        Self {
            project_id,
            expected_stage,
            new_stage,
            via: Vec::new(),
            artifacts: Vec::new(),
            runs: Vec::new(),
        }
    }

    /// Write runs or artifacts without moving the project
    pub fn hold(project_id: Uuid, stage: Stage) -> Self {
        Self::new(project_id, stage, stage)
    }

    /// Pass through an intermediate stage inside the same commit
    pub fn through(mut self, stage: Stage) -> Self {
        self.via.push(stage);
        self
    }

    pub fn is_hold(&self) -> bool {
        self.expected_stage == self.new_stage && self.via.is_empty()
    }

    /// Every stage the commit visits, from `expected_stage` to `new_stage`
    pub fn path(&self) -> Vec<Stage> {
        let mut path = Vec::with_capacity(self.via.len() + 2);
        path.push(self.expected_stage);
        path.extend(&self.via);
        path.push(self.new_stage);
        path
    }

    pub fn with_artifact(mut self, artifact: NewArtifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    pub fn with_runs(mut self, runs: impl IntoIterator<Item = Run>) -> Self {
        self.runs.extend(runs);
        self
    }
}

/// Result of a stage commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Writes applied; `ignored` artifacts already existed
    Applied { inserted: usize, ignored: usize },

    /// The project had already reached the target stage; nothing written
    AlreadyApplied,
}

/// Persistence operations used by the pipeline
#[async_trait]
pub trait Store: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str;

    /// Create a project, optionally together with its first idea
    async fn create_project(
        &self,
        project: &Project,
        idea: Option<&Idea>,
    ) -> Result<(), PipelineError>;

    /// Attach another idea to a project still at `Stage::Idea`
    async fn add_idea(&self, idea: &Idea) -> Result<(), PipelineError>;

    async fn get_project(&self, project_id: Uuid) -> Result<Option<Project>, PipelineError>;

    /// All projects, most recently updated first
    async fn list_projects(&self) -> Result<Vec<Project>, PipelineError>;

    /// Most recent idea; ties on `created_at` go to the later insert
    async fn latest_idea(&self, project_id: Uuid) -> Result<Option<Idea>, PipelineError>;

    async fn latest_artifact(
        &self,
        project_id: Uuid,
        artifact_type: ArtifactType,
    ) -> Result<Option<Artifact>, PipelineError>;

    /// Artifacts in creation order
    async fn list_artifacts(&self, project_id: Uuid) -> Result<Vec<Artifact>, PipelineError>;

    /// Runs in creation order
    async fn list_runs(&self, project_id: Uuid) -> Result<Vec<Run>, PipelineError>;

    async fn latest_decision(&self, project_id: Uuid) -> Result<Option<Decision>, PipelineError>;

    /// Apply a stage commit atomically
    async fn commit_stage(&self, commit: StageCommit) -> Result<CommitOutcome, PipelineError>;

    /// Record a review decision and move the project state accordingly
    async fn record_decision(&self, decision: &Decision) -> Result<Decision, PipelineError>;

    /// Force a project into `Error`; idempotent
    async fn mark_error(&self, project_id: Uuid, reason: &str) -> Result<Project, PipelineError>;
}

/// What a commit will do once the guard has run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommitPlan {
    Apply,
    Skip,
}

/// Guard a stage commit against the live project row
pub(crate) fn plan_commit(
    project: &Project,
    commit: &StageCommit,
) -> Result<CommitPlan, PipelineError> {
    if project.is_halted() {
        return Err(PipelineError::ProjectHalted {
            project_id: project.id,
            state: project.state,
        });
    }

    if project.stage == commit.new_stage && !commit.is_hold() {
        return Ok(CommitPlan::Skip);
    }

    if project.stage != commit.expected_stage {
        return Err(PipelineError::StageMismatch {
            project_id: project.id,
            expected: commit.expected_stage,
            actual: project.stage,
        });
    }

    if !commit.is_hold() {
        for hop in commit.path().windows(2) {
            ProjectStateMachine::apply_transition(hop[0], hop[1])?;
        }
    }
    Ok(CommitPlan::Apply)
}

/// Guard idea intake for an existing project
pub(crate) fn check_add_idea(project: &Project) -> Result<(), PipelineError> {
    if project.is_halted() {
        return Err(PipelineError::ProjectHalted {
            project_id: project.id,
            state: project.state,
        });
    }
    if project.stage != Stage::Idea {
        return Err(PipelineError::StageMismatch {
            project_id: project.id,
            expected: Stage::Idea,
            actual: project.stage,
        });
    }
    Ok(())
}

/// What recording a decision will do once the guard has run
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum DecisionPlan {
    /// Same outcome already recorded for this stage
    Existing(Decision),

    /// Insert and move the project into the given state
    Insert(ProjectState),
}

/// Guard a review decision.
///
/// Decisions need a feasibility result to review and an `Active` project.
/// Repeating an identical outcome for the same stage is a no-op.
pub(crate) fn plan_decision(
    project: &Project,
    existing: Option<&Decision>,
    decision: &Decision,
) -> Result<DecisionPlan, PipelineError> {
    let target = decision.outcome.target_state();

    if let Some(existing) = existing {
        if existing.outcome == decision.outcome {
            return Ok(DecisionPlan::Existing(existing.clone()));
        }
        return Err(PipelineError::InvalidStateChange {
            from: project.state,
            to: target,
        });
    }

    if project.stage < Stage::FeasibilityComplete {
        return Err(PipelineError::StageMismatch {
            project_id: project.id,
            expected: Stage::FeasibilityComplete,
            actual: project.stage,
        });
    }

    let state = ProjectStateMachine::apply_state_change(project.state, target)?;
    Ok(DecisionPlan::Insert(state))
}

/// Decide the state after a forced error, or `None` if already in `Error`
pub(crate) fn plan_mark_error(project: &Project) -> Result<Option<ProjectState>, PipelineError> {
    if project.state == ProjectState::Error {
        return Ok(None);
    }
    ProjectStateMachine::apply_state_change(project.state, ProjectState::Error).map(Some)
}
