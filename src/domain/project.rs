//! Projects, ideas and review decisions.
//!
//! A project carries two independent positions: the coarse lifecycle
//! `state` and the fine-grained pipeline `stage`. Only the store mutates
//! either, and only through the rules in `core::state_machine`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A project moving through the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    /// Unique identifier
    pub id: Uuid,

    /// Coarse lifecycle state
    pub state: ProjectState,

    /// Position in the stage sequence
    pub stage: Stage,

    /// When the project was created
    pub created_at: DateTime<Utc>,

    /// When state or stage last changed
    pub updated_at: DateTime<Utc>,
}

impl Project {
    /// Create a fresh project at the start of the pipeline
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            state: ProjectState::Active,
            stage: Stage::Idea,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the project may no longer be worked on
    pub fn is_halted(&self) -> bool {
        self.state.is_terminal()
    }
}

impl Default for Project {
    fn default() -> Self {
        Self::new()
    }
}

/// Coarse lifecycle state of a project
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProjectState {
    Active,
    Approved,
    Rejected,
    Error,
}

impl ProjectState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "Active",
            Self::Approved => "Approved",
            Self::Rejected => "Rejected",
            Self::Error => "Error",
        }
    }

    /// Rejected and Error are absorbing
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Error)
    }
}

impl fmt::Display for ProjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Active" => Ok(Self::Active),
            "Approved" => Ok(Self::Approved),
            "Rejected" => Ok(Self::Rejected),
            "Error" => Ok(Self::Error),
            other => Err(format!("unknown project state: {}", other)),
        }
    }
}

/// Position of a project in the stage sequence.
///
/// Variants are declared in pipeline order so the derived ordering
/// reflects progress: `Idea < FeasibilityComplete < ... < ExecutionComplete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
    Idea,
    FeasibilityComplete,
    PlanningComplete,
    ExecutionInProgress,
    ExecutionComplete,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Idea,
        Stage::FeasibilityComplete,
        Stage::PlanningComplete,
        Stage::ExecutionInProgress,
        Stage::ExecutionComplete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idea => "Idea",
            Self::FeasibilityComplete => "FeasibilityComplete",
            Self::PlanningComplete => "PlanningComplete",
            Self::ExecutionInProgress => "ExecutionInProgress",
            Self::ExecutionComplete => "ExecutionComplete",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown stage: {}", s))
    }
}

/// Free-form idea text attached to a project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Idea {
    /// Unique identifier
    pub id: Uuid,

    /// Owning project
    pub project_id: Uuid,

    /// The idea as submitted
    pub content: String,

    /// Submission time; ties are broken by insertion order
    pub created_at: DateTime<Utc>,
}

impl Idea {
    pub fn new(project_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// Outcome of a feasibility review
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DecisionOutcome {
    Approved,
    Rejected,
}

impl DecisionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "Approved",
            Self::Rejected => "Rejected",
        }
    }

    /// Project state the outcome moves an Active project into
    pub fn target_state(&self) -> ProjectState {
        match self {
            Self::Approved => ProjectState::Approved,
            Self::Rejected => ProjectState::Rejected,
        }
    }
}

impl fmt::Display for DecisionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DecisionOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "approved" | "approve" => Ok(Self::Approved),
            "rejected" | "reject" => Ok(Self::Rejected),
            other => Err(format!("unknown decision outcome: {}", other)),
        }
    }
}

/// A recorded review decision, unique per (project, stage)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// Unique identifier
    pub id: Uuid,

    /// Project the decision applies to
    pub project_id: Uuid,

    /// Stage the project was at when decided
    pub stage: Stage,

    /// Approve or reject
    pub outcome: DecisionOutcome,

    /// Optional free-text reasoning
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,

    /// When the decision was recorded
    pub decided_at: DateTime<Utc>,
}

impl Decision {
    pub fn new(
        project_id: Uuid,
        stage: Stage,
        outcome: DecisionOutcome,
        rationale: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            stage,
            outcome,
            rationale,
            decided_at: Utc::now(),
        }
    }
}
