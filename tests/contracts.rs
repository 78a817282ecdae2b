//! Artifact Contract Tests
//!
//! Repairs and rejections applied to generated artifacts on their way into
//! the store.

mod common;

use std::time::Duration;

use serde_json::json;

use common::{fast_policies, valid_feasibility, valid_plan, Harness};
use conductor::core::contracts::{feasibility_fallback, plan_fallback, validate_feasibility, validate_plan};
use conductor::core::{JobReport, PipelineError};
use conductor::domain::{
    ArtifactType, NewArtifact, ProjectState, RunStatus, RunStep, Stage, StageName,
};
use conductor::store::{StageCommit, Store};
use conductor::WorkerPool;
use uuid::Uuid;

async fn feasibility_with_confidence(confidence: f64) -> serde_json::Value {
    let harness = Harness::new();
    let mut response = valid_feasibility();
    response["confidence"] = json!(confidence);
    harness
        .generator
        .respond(StageName::Feasibility, response.to_string());

    let project_id = harness
        .orchestrator
        .submit_idea("idea")
        .await
        .unwrap()
        .project
        .id;
    harness
        .orchestrator
        .trigger_stage(StageName::Feasibility, project_id)
        .await
        .unwrap();
    WorkerPool::new(harness.orchestrator.clone(), Duration::from_millis(5))
        .run_until_idle()
        .await
        .unwrap();

    harness
        .store
        .latest_artifact(project_id, ArtifactType::FeasibilityAnalysisV1)
        .await
        .unwrap()
        .unwrap()
        .content
}

#[tokio::test]
async fn test_confidence_is_clamped_before_persisting() {
    let high = feasibility_with_confidence(1.7).await;
    assert_eq!(high["confidence"], json!(1.0));
    assert_eq!(high["verdict"], "go");

    let low = feasibility_with_confidence(-0.3).await;
    assert_eq!(low["confidence"], json!(0.0));
}

#[test]
fn test_fallbacks_satisfy_their_contracts() {
    let errors = vec!["summary must be a string".to_string()];

    let mut feasibility = feasibility_fallback(Uuid::new_v4(), Uuid::new_v4(), "idea", &errors);
    assert!(validate_feasibility(&mut feasibility).ok);

    let mut plan = plan_fallback(Uuid::new_v4(), &errors);
    assert!(validate_plan(&mut plan).ok);
}

#[test]
fn test_zero_timeline_is_rebuilt_from_phases() {
    let mut plan = valid_plan();
    plan["timeline_weeks"] = json!(0);
    plan["phases"][3]["duration_weeks"] = json!(0);

    let report = validate_plan(&mut plan);
    assert!(report.ok, "{:?}", report.errors);
    assert_eq!(plan["timeline_weeks"], json!(9));
}

#[tokio::test]
async fn test_invalid_plan_fails_execution_without_retry() {
    let harness = Harness::new();
    let store = &harness.store;

    let project_id = harness
        .orchestrator
        .submit_idea("idea")
        .await
        .unwrap()
        .project
        .id;
    store
        .commit_stage(StageCommit::new(
            project_id,
            Stage::Idea,
            Stage::FeasibilityComplete,
        ))
        .await
        .unwrap();
    store
        .commit_stage(
            StageCommit::new(project_id, Stage::FeasibilityComplete, Stage::PlanningComplete)
                .with_artifact(NewArtifact::new(
                    StageName::Planning,
                    ArtifactType::ExecutionPlanV1,
                    json!({"schema_version": "v1", "phases": []}),
                )),
        )
        .await
        .unwrap();

    harness
        .orchestrator
        .trigger_stage(StageName::Execution, project_id)
        .await
        .unwrap();
    let job = harness
        .orchestrator
        .claim(StageName::Execution)
        .await
        .unwrap()
        .unwrap();
    let report = harness.orchestrator.execute_job(job).await.unwrap();
    assert!(matches!(
        report,
        JobReport::Failed(PipelineError::Validation(_))
    ));

    let status = harness.orchestrator.project_status(project_id).await.unwrap();
    assert_eq!(status.stage, Stage::PlanningComplete);
    assert_eq!(status.state, ProjectState::Error);

    let runs = harness.orchestrator.list_runs(project_id).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].step, RunStep::Validate);
    assert_eq!(runs[0].status, RunStatus::Failure);
    assert!(runs[0].error.as_deref().unwrap().contains("phases"));
    assert_eq!(harness.generator.calls(StageName::Execution), 0);
}

#[tokio::test]
async fn test_failed_execution_commit_leaves_planning_complete() {
    let mut policies = fast_policies();
    policies.execution.retry.max_attempts = 1;
    let harness = Harness::with_policies(policies);
    let store = &harness.store;

    let project_id = harness
        .orchestrator
        .submit_idea("idea")
        .await
        .unwrap()
        .project
        .id;
    store
        .commit_stage(StageCommit::new(
            project_id,
            Stage::Idea,
            Stage::FeasibilityComplete,
        ))
        .await
        .unwrap();
    store
        .commit_stage(
            StageCommit::new(project_id, Stage::FeasibilityComplete, Stage::PlanningComplete)
                .with_artifact(NewArtifact::new(
                    StageName::Planning,
                    ArtifactType::ExecutionPlanV1,
                    valid_plan(),
                )),
        )
        .await
        .unwrap();
    harness.generator.respond(
        StageName::Execution,
        json!({"notes": ["Book kickoff"]}).to_string(),
    );

    harness
        .orchestrator
        .trigger_stage(StageName::Execution, project_id)
        .await
        .unwrap();
    store.fail_next_commits(1);
    let report = WorkerPool::new(harness.orchestrator.clone(), Duration::from_millis(5))
        .run_until_idle()
        .await
        .unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(harness.generator.calls(StageName::Execution), 1);

    let status = harness.orchestrator.project_status(project_id).await.unwrap();
    assert_eq!(status.stage, Stage::PlanningComplete);
    assert_eq!(status.state, ProjectState::Error);
    assert!(harness.orchestrator.list_runs(project_id).await.unwrap().is_empty());
    assert!(store
        .latest_artifact(project_id, ArtifactType::ExecutionLog)
        .await
        .unwrap()
        .is_none());
}
