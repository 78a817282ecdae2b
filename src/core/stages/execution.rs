//! Execution stage: plan in, three runs plus `execution_log` and
//! `execution_result` out.
//!
//! Everything lands in one commit that walks the project from
//! `PlanningComplete` through `ExecutionInProgress` to `ExecutionComplete`,
//! so a failed attempt leaves the project at `PlanningComplete`. An invalid
//! plan records its failed validate run without moving the stage.

use std::fmt::Write as _;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::core::contracts;
use crate::core::error::PipelineError;
use crate::core::processor::{
    already_done, commit_status, phase, Phase, StageContext, StageDetail, StageOutcome,
    StageProcessor, TokenUsage,
};
use crate::core::state_machine::ProjectStateMachine;
use crate::domain::{ArtifactType, NewArtifact, Run, RunStatus, RunStep, Stage, StageName};
use crate::store::StageCommit;

use super::prompts;

const STAGE: StageName = StageName::Execution;
const FALLBACK_NOTES: usize = 3;

pub struct ExecutionProcessor {
    ctx: StageContext,
}

/// Kickoff notes and where they came from
struct Notes {
    lines: Vec<String>,
    generated: bool,
    usage: TokenUsage,
}

impl ExecutionProcessor {
    pub fn new(ctx: StageContext) -> Self {
        Self { ctx }
    }

    async fn notes(&self, plan: &Value) -> Notes {
        let draft = self
            .ctx
            .draft(prompts::execution(plan, self.ctx.generation.max_tokens))
            .await;

        let generated = draft.candidate().ok().and_then(|value| {
            let lines: Vec<String> = value
                .get("notes")?
                .as_array()?
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(String::from)
                .collect();
            (!lines.is_empty()).then_some(lines)
        });

        match generated {
            Some(lines) => Notes {
                lines,
                generated: true,
                usage: draft.usage,
            },
            None => {
                warn!(stage = %STAGE, "Execution notes unavailable; deriving from plan");
                Notes {
                    lines: fallback_notes(plan),
                    generated: false,
                    usage: draft.usage,
                }
            }
        }
    }
}

/// Notes taken straight from the plan's first next actions
fn fallback_notes(plan: &Value) -> Vec<String> {
    let mut lines: Vec<String> = plan
        .get("immediate_next_actions")
        .and_then(Value::as_array)
        .map(|actions| {
            actions
                .iter()
                .filter_map(Value::as_str)
                .take(FALLBACK_NOTES)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    if lines.is_empty() {
        lines.push("Review the execution plan with the team".to_string());
    }
    lines
}

fn render_log(runs: &[Run], notes: &Notes) -> String {
    let mut log = String::from("# Execution Log\n");
    for (idx, run) in runs.iter().enumerate() {
        let _ = write!(
            log,
            "\n## Step {}: {}\n- Run ID: {}\n- Status: {}\n- Started: {}\n- Ended: {}\n",
            idx + 1,
            capitalize(run.step.as_str()),
            run.id,
            run.status,
            run.started_at.to_rfc3339(),
            run.ended_at.to_rfc3339(),
        );
    }

    let source = if notes.generated { "generated" } else { "derived from plan" };
    let _ = write!(log, "\n## Kickoff Notes ({})\n", source);
    for line in &notes.lines {
        let _ = writeln!(log, "- {}", line);
    }
    log.push_str("\nExecution completed successfully.\n");
    log
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn render_result(plan: &Value, runs: &[Run], notes: &Notes, completed_at: DateTime<Utc>) -> Value {
    let runs: Vec<Value> = runs
        .iter()
        .map(|run| {
            json!({
                "id": run.id,
                "step": run.step,
                "status": run.status,
                "started_at": run.started_at,
                "ended_at": run.ended_at,
            })
        })
        .collect();

    json!({
        "status": "success",
        "runs": runs,
        "notes": notes.lines,
        "notes_source": if notes.generated { "generated" } else { "fallback" },
        "plan": {
            "timeline_weeks": plan.get("timeline_weeks").cloned().unwrap_or(Value::Null),
            "phases": plan.get("phases").and_then(Value::as_array).map_or(0, Vec::len),
        },
        "completed_at": completed_at,
    })
}

#[async_trait]
impl StageProcessor for ExecutionProcessor {
    fn stage(&self) -> StageName {
        STAGE
    }

    #[instrument(skip(self), fields(stage = %STAGE))]
    async fn process(&self, project_id: Uuid) -> Result<StageOutcome, PipelineError> {
        let started = Instant::now();
        phase(STAGE, project_id, Phase::Started);

        let project = self.ctx.project(project_id).await?;
        if already_done(STAGE, &project) {
            info!(%project_id, "Execution already complete");
            return Ok(StageOutcome::skipped(project_id, STAGE, started));
        }
        ProjectStateMachine::check_trigger(STAGE, &project)?;

        let mut plan = self
            .ctx
            .store
            .latest_artifact(project_id, ArtifactType::ExecutionPlanV1)
            .await?
            .ok_or_else(|| PipelineError::not_found("plan artifact", project_id))?
            .content;
        phase(STAGE, project_id, Phase::ContextLoaded);

        let validate_started = Utc::now();
        let report = contracts::validate_plan(&mut plan);
        let validate_ended = Utc::now();
        if !report.ok {
            let run = Run::new(
                project_id,
                RunStep::Validate,
                RunStatus::Failure,
                validate_started,
                validate_ended,
            )
            .with_error(report.errors.join("; "));
            let commit = StageCommit::hold(project_id, STAGE.precondition()).with_runs([run]);
            self.ctx.store.commit_stage(commit).await?;
            return Err(PipelineError::Validation(report.errors));
        }
        let validate = Run::new(
            project_id,
            RunStep::Validate,
            RunStatus::Success,
            validate_started,
            validate_ended,
        );
        phase(STAGE, project_id, Phase::Validated);

        let process_started = Utc::now();
        let notes = self.notes(&plan).await;
        let process = Run::new(
            project_id,
            RunStep::Process,
            RunStatus::Success,
            process_started,
            Utc::now(),
        );
        phase(STAGE, project_id, Phase::Generated);

        let finalize_started = Utc::now();
        let mut runs = vec![validate, process];
        runs.push(Run::new(
            project_id,
            RunStep::Finalize,
            RunStatus::Success,
            finalize_started,
            Utc::now(),
        ));
        let log = render_log(&runs, &notes);
        let result = render_result(&plan, &runs, &notes, Utc::now());
        let run_count = runs.len();

        let commit = StageCommit::new(project_id, STAGE.precondition(), STAGE.postcondition())
            .through(Stage::ExecutionInProgress)
            .with_artifact(NewArtifact::markdown(STAGE, ArtifactType::ExecutionLog, log))
            .with_artifact(NewArtifact::new(STAGE, ArtifactType::ExecutionResult, result))
            .with_runs(runs);
        let committed = self.ctx.store.commit_stage(commit).await?;
        phase(STAGE, project_id, Phase::Persisted);
        phase(STAGE, project_id, Phase::StageAdvanced);

        info!(%project_id, runs = run_count, notes_generated = notes.generated, "Execution complete");
        phase(STAGE, project_id, Phase::Completed);

        Ok(StageOutcome {
            project_id,
            stage: STAGE,
            status: commit_status(&committed),
            validated: notes.generated,
            errors: Vec::new(),
            detail: StageDetail::Execution { runs: run_count },
            tokens: notes.usage,
            duration: started.elapsed(),
        })
    }
}
