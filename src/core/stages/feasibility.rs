//! Feasibility stage: idea in, `feasibility_analysis_v1` out.

use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::core::contracts;
use crate::core::error::PipelineError;
use crate::core::processor::{
    already_done, commit_status, phase, settle, Phase, StageContext, StageDetail, StageOutcome,
    StageProcessor,
};
use crate::core::state_machine::ProjectStateMachine;
use crate::domain::{ArtifactType, NewArtifact, StageName};
use crate::store::StageCommit;

use super::prompts;

const STAGE: StageName = StageName::Feasibility;

pub struct FeasibilityProcessor {
    ctx: StageContext,
}

impl FeasibilityProcessor {
    pub fn new(ctx: StageContext) -> Self {
        Self { ctx }
    }
}

/// Make sure the artifact names the project and idea it was generated for
fn stamp_idea(candidate: &mut Value, project_id: Uuid, idea_id: Uuid) {
    let Some(root) = candidate.as_object_mut() else {
        return;
    };
    let idea = root
        .entry("idea")
        .or_insert_with(|| Value::Object(Map::new()));
    if let Some(idea) = idea.as_object_mut() {
        idea.insert("project_id".to_string(), json!(project_id.to_string()));
        idea.insert("idea_id".to_string(), json!(idea_id.to_string()));
    }
}

#[async_trait]
impl StageProcessor for FeasibilityProcessor {
    fn stage(&self) -> StageName {
        STAGE
    }

    #[instrument(skip(self), fields(stage = %STAGE))]
    async fn process(&self, project_id: Uuid) -> Result<StageOutcome, PipelineError> {
        let started = Instant::now();
        phase(STAGE, project_id, Phase::Started);

        let project = self.ctx.project(project_id).await?;
        if already_done(STAGE, &project) {
            info!(%project_id, stage = %project.stage, "Feasibility already complete");
            return Ok(StageOutcome::skipped(project_id, STAGE, started));
        }
        ProjectStateMachine::check_trigger(STAGE, &project)?;

        let idea = self
            .ctx
            .store
            .latest_idea(project_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("idea", project_id))?;
        phase(STAGE, project_id, Phase::ContextLoaded);

        let draft = self
            .ctx
            .draft(prompts::feasibility(&idea.content, self.ctx.generation.max_tokens))
            .await;
        phase(STAGE, project_id, Phase::Generated);

        let candidate = draft.candidate().map(|mut value| {
            stamp_idea(&mut value, project_id, idea.id);
            value
        });
        let settled = settle(STAGE, ArtifactType::FeasibilityAnalysisV1, candidate, |errors| {
            contracts::feasibility_fallback(project_id, idea.id, &idea.content, errors)
        });
        phase(STAGE, project_id, Phase::Validated);

        let verdict = settled
            .content
            .get("verdict")
            .and_then(Value::as_str)
            .unwrap_or("revise")
            .to_string();
        let confidence = settled
            .content
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);

        let commit = StageCommit::new(project_id, STAGE.precondition(), STAGE.postcondition())
            .with_artifact(NewArtifact::new(
                STAGE,
                ArtifactType::FeasibilityAnalysisV1,
                settled.content,
            ));
        let committed = self.ctx.store.commit_stage(commit).await?;
        phase(STAGE, project_id, Phase::Persisted);
        phase(STAGE, project_id, Phase::StageAdvanced);

        info!(
            %project_id,
            %verdict,
            confidence,
            validated = settled.validated,
            tokens = draft.usage.total(),
            "Feasibility complete"
        );
        phase(STAGE, project_id, Phase::Completed);

        Ok(StageOutcome {
            project_id,
            stage: STAGE,
            status: commit_status(&committed),
            validated: settled.validated,
            errors: settled.errors,
            detail: StageDetail::Feasibility {
                verdict,
                confidence,
            },
            tokens: draft.usage,
            duration: started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamp_idea_overrides_identity_and_keeps_title() {
        let project_id = Uuid::new_v4();
        let idea_id = Uuid::new_v4();
        let mut candidate = json!({"idea": {"title": "Walkies", "project_id": "bogus"}});

        stamp_idea(&mut candidate, project_id, idea_id);

        assert_eq!(candidate["idea"]["title"], "Walkies");
        assert_eq!(candidate["idea"]["project_id"], project_id.to_string());
        assert_eq!(candidate["idea"]["idea_id"], idea_id.to_string());
    }

    #[test]
    fn test_stamp_idea_creates_missing_object() {
        let mut candidate = json!({"verdict": "go"});
        stamp_idea(&mut candidate, Uuid::new_v4(), Uuid::new_v4());
        assert!(candidate["idea"].is_object());
    }
}
