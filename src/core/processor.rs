//! Stage processor interface and the helpers shared by every stage.
//!
//! A processor loads the project's context, makes one generation call,
//! validates the result against the stage contract (substituting the
//! fallback when it does not hold), and commits the artifact together with
//! the stage transition.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::adapters::{GenerationRequest, Generator};
use crate::domain::{ArtifactType, Project, StageName};
use crate::store::{CommitOutcome, Store};

use super::contracts::{self, ValidationReport};
use super::error::PipelineError;

/// Limits applied to every generation call
#[derive(Debug, Clone, Copy)]
pub struct GenerationSettings {
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            timeout: Duration::from_secs(120),
        }
    }
}

/// Dependencies shared by the stage processors
#[derive(Clone)]
pub struct StageContext {
    pub store: Arc<dyn Store>,
    pub generator: Arc<dyn Generator>,
    pub generation: GenerationSettings,
}

impl StageContext {
    pub fn new(
        store: Arc<dyn Store>,
        generator: Arc<dyn Generator>,
        generation: GenerationSettings,
    ) -> Self {
        Self {
            store,
            generator,
            generation,
        }
    }

    /// Load a project, failing with `NotFound` when it does not exist
    pub async fn project(&self, project_id: Uuid) -> Result<Project, PipelineError> {
        self.store
            .get_project(project_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("project", project_id))
    }

    /// Make one generation call under the configured timeout
    pub async fn draft(&self, request: GenerationRequest) -> Draft {
        let stage = request.stage;
        let call = self.generator.generate(&request);

        let result = match tokio::time::timeout(self.generation.timeout, call).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(PipelineError::Generation(format!("{:#}", e))),
            Err(_) => Err(PipelineError::Generation(format!(
                "generation timed out after {}s",
                self.generation.timeout.as_secs()
            ))),
        };

        match result {
            Ok(output) => Draft {
                usage: TokenUsage {
                    input: output.input_tokens,
                    output: output.output_tokens,
                },
                text: Ok(output.text),
            },
            Err(err) => {
                warn!(%stage, generator = self.generator.name(), error = %err, "Generation failed; using fallback");
                Draft {
                    text: Err(err.to_string()),
                    usage: TokenUsage::default(),
                }
            }
        }
    }
}

/// Token counts reported by the generator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input + self.output
    }
}

/// Raw result of a generation call
#[derive(Debug, Clone)]
pub struct Draft {
    /// Generated text, or the reason generation failed
    pub text: Result<String, String>,
    pub usage: TokenUsage,
}

impl Draft {
    /// Extract the JSON document from the generated text
    pub fn candidate(&self) -> Result<Value, Vec<String>> {
        match &self.text {
            Ok(text) => contracts::extract_json(text).map_err(|e| vec![e.to_string()]),
            Err(reason) => Err(vec![format!("generation failed: {}", reason)]),
        }
    }
}

/// An artifact that satisfies its contract, either as generated or via fallback
#[derive(Debug, Clone)]
pub struct SettledArtifact {
    pub content: Value,
    /// True when the generated artifact passed validation unchanged
    pub validated: bool,
    /// Errors that sent the artifact to its fallback
    pub errors: Vec<String>,
}

/// Validate a candidate, substituting the fallback when it fails.
///
/// The fallback receives the error list so it can embed it.
pub fn settle(
    stage: StageName,
    artifact_type: ArtifactType,
    candidate: Result<Value, Vec<String>>,
    fallback: impl FnOnce(&[String]) -> Value,
) -> SettledArtifact {
    let errors = match candidate {
        Ok(mut content) => {
            let ValidationReport { ok, errors } = contracts::validate(artifact_type, &mut content);
            if ok {
                return SettledArtifact {
                    content,
                    validated: true,
                    errors,
                };
            }
            errors
        }
        Err(errors) => errors,
    };

    warn!(%stage, artifact = %artifact_type, errors = ?errors, "Artifact failed its contract; using fallback");
    SettledArtifact {
        content: fallback(&errors),
        validated: false,
        errors,
    }
}

/// Progress markers within one processing pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Started,
    ContextLoaded,
    Generated,
    Validated,
    Persisted,
    StageAdvanced,
    Completed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Started => "started",
            Phase::ContextLoaded => "context_loaded",
            Phase::Generated => "generated",
            Phase::Validated => "validated",
            Phase::Persisted => "persisted",
            Phase::StageAdvanced => "stage_advanced",
            Phase::Completed => "completed",
        }
    }
}

pub(crate) fn phase(stage: StageName, project_id: Uuid, phase: Phase) {
    debug!(%stage, %project_id, phase = phase.as_str(), "Stage phase");
}

/// Whether a processing pass did work or found it already done
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Completed,
    Skipped,
}

/// Stage-specific facts about a completed pass
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageDetail {
    None,
    Feasibility { verdict: String, confidence: f64 },
    Planning { timeline_weeks: f64, phases: usize },
    Execution { runs: usize },
}

/// Result of one processing pass
#[derive(Debug, Clone, Serialize)]
pub struct StageOutcome {
    pub project_id: Uuid,
    pub stage: StageName,
    pub status: OutcomeStatus,
    /// False when the persisted artifact is a fallback
    pub validated: bool,
    pub errors: Vec<String>,
    pub detail: StageDetail,
    pub tokens: TokenUsage,
    pub duration: Duration,
}

impl StageOutcome {
    pub fn skipped(project_id: Uuid, stage: StageName, started: Instant) -> Self {
        Self {
            project_id,
            stage,
            status: OutcomeStatus::Skipped,
            validated: true,
            errors: Vec::new(),
            detail: StageDetail::None,
            tokens: TokenUsage::default(),
            duration: started.elapsed(),
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.status == OutcomeStatus::Skipped
    }
}

/// Map a commit result onto the outcome status
pub(crate) fn commit_status(outcome: &CommitOutcome) -> OutcomeStatus {
    match outcome {
        CommitOutcome::Applied { .. } => OutcomeStatus::Completed,
        CommitOutcome::AlreadyApplied => OutcomeStatus::Skipped,
    }
}

/// Whether the project has already moved past `stage`
pub(crate) fn already_done(stage: StageName, project: &Project) -> bool {
    project.stage >= stage.postcondition()
}

/// One stage of the pipeline
#[async_trait]
pub trait StageProcessor: Send + Sync {
    /// The stage this processor handles
    fn stage(&self) -> StageName;

    /// Advance a project through this stage
    async fn process(&self, project_id: Uuid) -> Result<StageOutcome, PipelineError>;
}
