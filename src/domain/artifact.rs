//! Artifacts produced by pipeline stages.
//!
//! Artifacts are keyed by `(project_id, stage, type)`; a second write with
//! the same key is ignored rather than overwriting the first.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::project::Stage;

/// A stored stage output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Unique identifier
    pub id: Uuid,

    /// Owning project
    pub project_id: Uuid,

    /// Stage that produced this artifact
    pub stage: StageName,

    /// Contract or format of the content
    pub artifact_type: ArtifactType,

    /// Structured content (Markdown artifacts hold a JSON string)
    pub content: serde_json::Value,

    /// First 16 hex chars of the SHA-256 of the serialized content
    pub content_hash: String,

    /// When the artifact was stored
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    /// Build a stored artifact from a pending one
    pub fn from_new(project_id: Uuid, new: NewArtifact) -> Self {
        let content_hash = content_hash(&new.content);
        Self {
            id: Uuid::new_v4(),
            project_id,
            stage: new.stage,
            artifact_type: new.artifact_type,
            content: new.content,
            content_hash,
            created_at: Utc::now(),
        }
    }

    /// Content as text, for Markdown artifacts
    pub fn text(&self) -> Option<&str> {
        self.content.as_str()
    }
}

/// An artifact waiting to be committed together with a stage transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewArtifact {
    pub stage: StageName,
    pub artifact_type: ArtifactType,
    pub content: serde_json::Value,
}

impl NewArtifact {
    pub fn new(stage: StageName, artifact_type: ArtifactType, content: serde_json::Value) -> Self {
        Self {
            stage,
            artifact_type,
            content,
        }
    }

    /// A Markdown artifact stored as a JSON string
    pub fn markdown(stage: StageName, artifact_type: ArtifactType, text: impl Into<String>) -> Self {
        Self::new(stage, artifact_type, serde_json::Value::String(text.into()))
    }
}

/// Types of artifacts stages can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    /// Feasibility contract v1
    #[serde(rename = "feasibility_analysis_v1")]
    FeasibilityAnalysisV1,

    /// Plan contract v1
    #[serde(rename = "execution_plan_v1")]
    ExecutionPlanV1,

    /// Markdown log of execution steps
    ExecutionLog,

    /// JSON summary of an execution
    ExecutionResult,
}

impl ArtifactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FeasibilityAnalysisV1 => "feasibility_analysis_v1",
            Self::ExecutionPlanV1 => "execution_plan_v1",
            Self::ExecutionLog => "execution_log",
            Self::ExecutionResult => "execution_result",
        }
    }
}

impl fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "feasibility_analysis_v1" => Ok(Self::FeasibilityAnalysisV1),
            "execution_plan_v1" => Ok(Self::ExecutionPlanV1),
            "execution_log" => Ok(Self::ExecutionLog),
            "execution_result" => Ok(Self::ExecutionResult),
            other => Err(format!("unknown artifact type: {}", other)),
        }
    }
}

/// The stages a caller can trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Feasibility,
    Planning,
    Execution,
}

impl StageName {
    pub const ALL: [StageName; 3] = [StageName::Feasibility, StageName::Planning, StageName::Execution];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Feasibility => "feasibility",
            Self::Planning => "planning",
            Self::Execution => "execution",
        }
    }

    /// Project stage required before this stage may be triggered
    pub fn precondition(&self) -> Stage {
        match self {
            Self::Feasibility => Stage::Idea,
            Self::Planning => Stage::FeasibilityComplete,
            Self::Execution => Stage::PlanningComplete,
        }
    }

    /// Project stage reached once this stage completes
    pub fn postcondition(&self) -> Stage {
        match self {
            Self::Feasibility => Stage::FeasibilityComplete,
            Self::Planning => Stage::PlanningComplete,
            Self::Execution => Stage::ExecutionComplete,
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "feasibility" => Ok(Self::Feasibility),
            "planning" => Ok(Self::Planning),
            "execution" => Ok(Self::Execution),
            other => Err(format!("unknown stage: {}", other)),
        }
    }
}

/// Hash artifact content (first 16 chars of SHA256)
pub fn content_hash(content: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.to_string().as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8])
}
