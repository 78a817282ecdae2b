//! Planning stage: idea and feasibility analysis in, `execution_plan_v1` out.

use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Value};
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

const STAGE: StageName = StageName::Planning;

pub struct PlanningProcessor {
    ctx: StageContext,
}

impl PlanningProcessor {
    pub fn new(ctx: StageContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl StageProcessor for PlanningProcessor {
    fn stage(&self) -> StageName {
        STAGE
    }

    #[instrument(skip(self), fields(stage = %STAGE))]
    async fn process(&self, project_id: Uuid) -> Result<StageOutcome, PipelineError> {
        let started = Instant::now();
        phase(STAGE, project_id, Phase::Started);

        let project = self.ctx.project(project_id).await?;
        if already_done(STAGE, &project) {
            info!(%project_id, stage = %project.stage, "Planning already complete");
            return Ok(StageOutcome::skipped(project_id, STAGE, started));
        }
        ProjectStateMachine::check_trigger(STAGE, &project)?;

        let idea = self
            .ctx
            .store
            .latest_idea(project_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("idea", project_id))?;
        let feasibility = self
            .ctx
            .store
            .latest_artifact(project_id, ArtifactType::FeasibilityAnalysisV1)
            .await?
            .ok_or_else(|| PipelineError::not_found("feasibility artifact", project_id))?;
        phase(STAGE, project_id, Phase::ContextLoaded);

        let draft = self
            .ctx
            .draft(prompts::planning(
                &idea.content,
                &feasibility.content,
                self.ctx.generation.max_tokens,
            ))
            .await;
        phase(STAGE, project_id, Phase::Generated);

        let candidate = draft.candidate().map(|mut value| {
            if let Some(root) = value.as_object_mut() {
                root.insert("project_id".to_string(), json!(project_id.to_string()));
            }
            value
        });
        let settled = settle(STAGE, ArtifactType::ExecutionPlanV1, candidate, |errors| {
            contracts::plan_fallback(project_id, errors)
        });
        phase(STAGE, project_id, Phase::Validated);

        let timeline_weeks = settled
            .content
            .get("timeline_weeks")
            .and_then(contracts::weeks)
            .unwrap_or(0.0);
        let phases = settled
            .content
            .get("phases")
            .and_then(Value::as_array)
            .map_or(0, Vec::len);

        let commit = StageCommit::new(project_id, STAGE.precondition(), STAGE.postcondition())
            .with_artifact(NewArtifact::new(
                STAGE,
                ArtifactType::ExecutionPlanV1,
                settled.content,
            ));
        let committed = self.ctx.store.commit_stage(commit).await?;
        phase(STAGE, project_id, Phase::Persisted);
        phase(STAGE, project_id, Phase::StageAdvanced);

        info!(
            %project_id,
            timeline_weeks,
            phases,
            validated = settled.validated,
            tokens = draft.usage.total(),
            "Planning complete"
        );
        phase(STAGE, project_id, Phase::Completed);

        Ok(StageOutcome {
            project_id,
            stage: STAGE,
            status: commit_status(&committed),
            validated: settled.validated,
            errors: settled.errors,
            detail: StageDetail::Planning {
                timeline_weeks,
                phases,
            },
            tokens: draft.usage,
            duration: started.elapsed(),
        })
    }
}
