//! Pipeline Integration Tests
//!
//! Ideas driven through feasibility, planning and execution with a scripted
//! generator, a memory store and a real JSONL queue.

mod common;

use serde_json::json;

use common::{chatty, valid_feasibility, valid_plan, Harness};
use conductor::core::{JobReport, JobStatus, JobQueue, OutcomeStatus, PipelineError, StageDetail};
use conductor::domain::{ArtifactType, ProjectState, RunStatus, Stage, StageName};
use conductor::store::Store;
use conductor::WorkerPool;
use std::time::Duration;

fn pool(harness: &Harness) -> WorkerPool {
    WorkerPool::new(harness.orchestrator.clone(), Duration::from_millis(10))
}

#[tokio::test]
async fn test_feasibility_then_planning_with_fallback() {
    let harness = Harness::new();
    let orchestrator = &harness.orchestrator;

    harness
        .generator
        .respond(StageName::Feasibility, chatty(&valid_feasibility()));
    harness
        .generator
        .respond(StageName::Planning, "I could not produce a plan, sorry.");

    let intake = orchestrator
        .submit_idea("Marketplace for local dog walkers")
        .await
        .unwrap();
    let project_id = intake.project.id;

    orchestrator
        .trigger_stage(StageName::Feasibility, project_id)
        .await
        .unwrap();
    let report = pool(&harness).run_until_idle().await.unwrap();
    assert_eq!(report.completed, 1);

    let status = orchestrator.project_status(project_id).await.unwrap();
    assert_eq!(status.stage, Stage::FeasibilityComplete);
    assert_eq!(status.state, ProjectState::Active);

    let feasibility = harness
        .store
        .latest_artifact(project_id, ArtifactType::FeasibilityAnalysisV1)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(feasibility.content["verdict"], "go");
    assert_eq!(
        feasibility.content["idea"]["project_id"],
        project_id.to_string()
    );
    assert_eq!(
        feasibility.content["idea"]["idea_id"],
        intake.idea.id.to_string()
    );

    orchestrator
        .trigger_stage(StageName::Planning, project_id)
        .await
        .unwrap();
    pool(&harness).run_until_idle().await.unwrap();

    let status = orchestrator.project_status(project_id).await.unwrap();
    assert_eq!(status.stage, Stage::PlanningComplete);

    let plan = harness
        .store
        .latest_artifact(project_id, ArtifactType::ExecutionPlanV1)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(plan.content["timeline_weeks"], 8);
    let questions = plan.content["open_questions"].as_array().unwrap();
    assert!(questions
        .iter()
        .any(|q| q.as_str().unwrap_or_default().starts_with("Validation errors")));

    let artifacts = orchestrator.list_artifacts(project_id).await.unwrap();
    assert_eq!(artifacts.len(), 2);
    assert_eq!(harness.generator.calls(StageName::Planning), 1);
}

#[tokio::test]
async fn test_full_pipeline_to_execution_complete() {
    let harness = Harness::new();
    let orchestrator = &harness.orchestrator;

    harness
        .generator
        .respond(StageName::Feasibility, valid_feasibility().to_string());
    harness
        .generator
        .respond(StageName::Planning, chatty(&valid_plan()));
    harness.generator.respond(
        StageName::Execution,
        json!({"notes": ["Book kickoff", "Set up repo"]}).to_string(),
    );

    let project_id = orchestrator
        .submit_idea("Marketplace for local dog walkers")
        .await
        .unwrap()
        .project
        .id;

    for stage in StageName::ALL {
        orchestrator.trigger_stage(stage, project_id).await.unwrap();
        pool(&harness).run_until_idle().await.unwrap();
    }

    let status = orchestrator.project_status(project_id).await.unwrap();
    assert_eq!(status.stage, Stage::ExecutionComplete);
    assert_eq!(status.state, ProjectState::Active);

    let runs = orchestrator.list_runs(project_id).await.unwrap();
    assert_eq!(runs.len(), 3);
    assert!(runs.iter().all(|run| run.status == RunStatus::Success));

    let artifacts = orchestrator.list_artifacts(project_id).await.unwrap();
    let types: Vec<ArtifactType> = artifacts.iter().map(|a| a.artifact_type).collect();
    assert!(types.contains(&ArtifactType::ExecutionLog));
    assert!(types.contains(&ArtifactType::ExecutionResult));

    let log = artifacts
        .iter()
        .find(|a| a.artifact_type == ArtifactType::ExecutionLog)
        .unwrap();
    assert!(log.text().unwrap().contains("Book kickoff"));

    let result = artifacts
        .iter()
        .find(|a| a.artifact_type == ArtifactType::ExecutionResult)
        .unwrap();
    assert_eq!(result.content["notes_source"], "generated");
    assert_eq!(result.content["plan"]["timeline_weeks"], 10);

    let summary = orchestrator.run_log().unwrap().summary().await.unwrap();
    assert_eq!(summary.total_runs, 3);
    assert_eq!(summary.by_verdict["go"].count, 1);
}

#[tokio::test]
async fn test_missing_idea_fails_once_and_halts_project() {
    let harness = Harness::new();
    let orchestrator = &harness.orchestrator;

    let project = orchestrator.create_project().await.unwrap();
    let receipt = orchestrator
        .trigger_stage(StageName::Feasibility, project.id)
        .await
        .unwrap();

    let job = orchestrator
        .claim(StageName::Feasibility)
        .await
        .unwrap()
        .unwrap();
    let report = orchestrator.execute_job(job).await.unwrap();
    match report {
        JobReport::Failed(PipelineError::NotFound { entity, .. }) => assert_eq!(entity, "idea"),
        other => panic!("expected NotFound failure, got {:?}", other),
    }

    let job = harness.queue.get(&receipt.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);

    let status = orchestrator.project_status(project.id).await.unwrap();
    assert_eq!(status.state, ProjectState::Error);
    assert_eq!(status.stage, Stage::Idea);
    assert!(orchestrator
        .list_artifacts(project.id)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(harness.generator.calls(StageName::Feasibility), 0);
}

#[tokio::test]
async fn test_out_of_order_trigger_enqueues_nothing() {
    let harness = Harness::new();
    let orchestrator = &harness.orchestrator;

    let project_id = orchestrator.submit_idea("idea").await.unwrap().project.id;
    let err = orchestrator
        .trigger_stage(StageName::Planning, project_id)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::StageMismatch {
            expected: Stage::FeasibilityComplete,
            actual: Stage::Idea,
            ..
        }
    ));
    assert_eq!(harness.queue.status().await.unwrap().total(), 0);
}

#[tokio::test]
async fn test_unknown_project_is_not_found() {
    let harness = Harness::new();
    let id = uuid::Uuid::new_v4();

    let err = harness
        .orchestrator
        .trigger_stage(StageName::Feasibility, id)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::NotFound { .. }));

    let err = harness.orchestrator.list_artifacts(id).await.unwrap_err();
    assert!(matches!(err, PipelineError::NotFound { .. }));
}

#[tokio::test]
async fn test_offline_generation_falls_back_for_feasibility() {
    let harness = Harness::new();
    let orchestrator = &harness.orchestrator;

    // no scripted response: every call fails
    let project_id = orchestrator
        .submit_idea("A CLI that waters plants")
        .await
        .unwrap()
        .project
        .id;
    orchestrator
        .trigger_stage(StageName::Feasibility, project_id)
        .await
        .unwrap();

    let job = orchestrator
        .claim(StageName::Feasibility)
        .await
        .unwrap()
        .unwrap();
    let outcome = match orchestrator.execute_job(job).await.unwrap() {
        JobReport::Completed(outcome) => outcome,
        other => panic!("expected completion, got {:?}", other),
    };

    assert_eq!(outcome.status, OutcomeStatus::Completed);
    assert!(!outcome.validated);
    assert!(outcome.errors[0].starts_with("generation failed"));
    assert_eq!(
        outcome.detail,
        StageDetail::Feasibility {
            verdict: "revise".to_string(),
            confidence: 0.4
        }
    );

    let artifact = harness
        .store
        .latest_artifact(project_id, ArtifactType::FeasibilityAnalysisV1)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(artifact.content["idea"]["title"], "Validation Fallback");
}

#[tokio::test]
async fn test_decision_after_feasibility() {
    let harness = Harness::new();
    let orchestrator = &harness.orchestrator;
    harness
        .generator
        .respond(StageName::Feasibility, valid_feasibility().to_string());

    let project_id = orchestrator.submit_idea("idea").await.unwrap().project.id;
    orchestrator
        .trigger_stage(StageName::Feasibility, project_id)
        .await
        .unwrap();
    pool(&harness).run_until_idle().await.unwrap();

    orchestrator
        .record_decision(
            project_id,
            conductor::domain::DecisionOutcome::Rejected,
            Some("Market too small".to_string()),
        )
        .await
        .unwrap();

    let status = orchestrator.project_status(project_id).await.unwrap();
    assert_eq!(status.state, ProjectState::Rejected);
    assert_eq!(
        status.decision,
        Some(conductor::domain::DecisionOutcome::Rejected)
    );

    let err = orchestrator
        .trigger_stage(StageName::Planning, project_id)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::ProjectHalted { .. }));
}

#[tokio::test]
async fn test_job_for_rejected_project_leaves_state_alone() {
    let harness = Harness::new();
    let orchestrator = &harness.orchestrator;
    harness
        .generator
        .respond(StageName::Feasibility, valid_feasibility().to_string());

    let project_id = orchestrator.submit_idea("idea").await.unwrap().project.id;
    orchestrator
        .trigger_stage(StageName::Feasibility, project_id)
        .await
        .unwrap();
    pool(&harness).run_until_idle().await.unwrap();

    // planning job enqueued just before the rejection landed
    orchestrator
        .jobs()
        .enqueue(StageName::Planning, project_id, json!({"project_id": project_id}))
        .await
        .unwrap();
    orchestrator
        .record_decision(
            project_id,
            conductor::domain::DecisionOutcome::Rejected,
            None,
        )
        .await
        .unwrap();

    let job = orchestrator
        .claim(StageName::Planning)
        .await
        .unwrap()
        .unwrap();
    let report = orchestrator.execute_job(job).await.unwrap();
    assert!(matches!(
        report,
        JobReport::Failed(PipelineError::ProjectHalted { .. })
    ));

    let status = orchestrator.project_status(project_id).await.unwrap();
    assert_eq!(status.state, ProjectState::Rejected);
    assert_eq!(status.stage, Stage::FeasibilityComplete);
    assert_eq!(harness.store.error_marks(), 0);
    assert_eq!(harness.generator.calls(StageName::Planning), 0);
}

#[tokio::test]
async fn test_ideas_added_to_empty_project() {
    let harness = Harness::new();
    let orchestrator = &harness.orchestrator;
    harness
        .generator
        .respond(StageName::Feasibility, valid_feasibility().to_string());

    let project = orchestrator.create_project().await.unwrap();
    let err = orchestrator.add_idea(project.id, "   ").await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidInput(_)));

    orchestrator.add_idea(project.id, "first take").await.unwrap();
    let latest = orchestrator
        .add_idea(project.id, "Marketplace for local dog walkers")
        .await
        .unwrap();
    assert_eq!(latest.project_id, project.id);

    orchestrator
        .trigger_stage(StageName::Feasibility, project.id)
        .await
        .unwrap();
    pool(&harness).run_until_idle().await.unwrap();

    let feasibility = harness
        .store
        .latest_artifact(project.id, ArtifactType::FeasibilityAnalysisV1)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(feasibility.content["idea"]["idea_id"], latest.id.to_string());

    // ideas are closed once feasibility has run
    assert!(orchestrator.add_idea(project.id, "too late").await.is_err());
}
