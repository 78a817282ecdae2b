//! Retry, Exhaustion and Timeout Tests

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use common::{fast_policies, valid_feasibility, Harness};
use conductor::core::{
    JobEvent, JobQueue, JobReport, JobStatus, PipelineError, StagePolicy, StageOutcome,
    StageProcessor,
};
use conductor::domain::{ProjectState, Stage, StageName};
use conductor::WorkerPool;

fn pool(harness: &Harness) -> WorkerPool {
    WorkerPool::new(harness.orchestrator.clone(), Duration::from_millis(5))
}

fn script_feasibility(harness: &Harness, times: usize) {
    for _ in 0..times {
        harness
            .generator
            .respond(StageName::Feasibility, valid_feasibility().to_string());
    }
}

#[tokio::test]
async fn test_transient_commit_failure_is_retried() {
    let harness = Harness::new();
    script_feasibility(&harness, 2);
    harness.store.fail_next_commits(1);

    let project_id = harness
        .orchestrator
        .submit_idea("idea")
        .await
        .unwrap()
        .project
        .id;
    let receipt = harness
        .orchestrator
        .trigger_stage(StageName::Feasibility, project_id)
        .await
        .unwrap();

    let report = pool(&harness).run_until_idle().await.unwrap();
    assert_eq!(report.retried, 1);
    assert_eq!(report.completed, 1);
    assert_eq!(report.failed, 0);

    let job = harness.queue.get(&receipt.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 2);

    let status = harness.orchestrator.project_status(project_id).await.unwrap();
    assert_eq!(status.stage, Stage::FeasibilityComplete);
    assert_eq!(status.state, ProjectState::Active);

    let summary = harness
        .orchestrator
        .run_log()
        .unwrap()
        .summary()
        .await
        .unwrap();
    assert_eq!(summary.total_runs, 2);
    assert_eq!(summary.failed_runs, 1);
}

#[tokio::test]
async fn test_retries_exhaust_and_halt_project() {
    let harness = Harness::new();
    script_feasibility(&harness, 3);
    harness.store.fail_next_commits(3);

    let project_id = harness
        .orchestrator
        .submit_idea("idea")
        .await
        .unwrap()
        .project
        .id;
    let receipt = harness
        .orchestrator
        .trigger_stage(StageName::Feasibility, project_id)
        .await
        .unwrap();

    let mut last = None;
    for _ in 0..3 {
        let job = loop {
            match harness.orchestrator.claim(StageName::Feasibility).await.unwrap() {
                Some(job) => break job,
                None => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        };
        last = Some(harness.orchestrator.execute_job(job).await.unwrap());
    }

    match last {
        Some(JobReport::Failed(PipelineError::JobExhausted { attempts, .. })) => {
            assert_eq!(attempts, 3)
        }
        other => panic!("expected exhaustion, got {:?}", other),
    }

    let job = harness.queue.get(&receipt.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 3);
    assert!(job.last_error.is_some());

    let status = harness.orchestrator.project_status(project_id).await.unwrap();
    assert_eq!(status.state, ProjectState::Error);
    assert_eq!(status.stage, Stage::Idea);
    assert!(harness
        .orchestrator
        .list_artifacts(project_id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_retry_is_not_claimable_before_backoff() {
    let mut policies = fast_policies();
    policies.feasibility.retry.base_delay_ms = 60_000;
    policies.feasibility.retry.max_delay_ms = 60_000;
    let harness = Harness::with_policies(policies);
    script_feasibility(&harness, 1);
    harness.store.fail_next_commits(1);

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

    let job = harness
        .orchestrator
        .claim(StageName::Feasibility)
        .await
        .unwrap()
        .unwrap();
    let report = harness.orchestrator.execute_job(job).await.unwrap();
    assert!(matches!(report, JobReport::Retrying { attempt: 1, .. }));

    assert!(harness
        .orchestrator
        .claim(StageName::Feasibility)
        .await
        .unwrap()
        .is_none());
}

struct SlowProcessor;

#[async_trait]
impl StageProcessor for SlowProcessor {
    fn stage(&self) -> StageName {
        StageName::Feasibility
    }

    async fn process(&self, _project_id: Uuid) -> Result<StageOutcome, PipelineError> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Err(PipelineError::InvalidInput("unreachable".to_string()))
    }
}

#[tokio::test]
async fn test_slow_job_times_out_and_is_retried() {
    let mut policies = fast_policies();
    policies.feasibility = StagePolicy {
        job_timeout_seconds: 1,
        ..policies.feasibility.clone()
    };
    let harness = Harness::build(policies, |orchestrator| {
        orchestrator.with_processor(Arc::new(SlowProcessor))
    });

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

    let job = harness
        .orchestrator
        .claim(StageName::Feasibility)
        .await
        .unwrap()
        .unwrap();
    let report = harness.orchestrator.execute_job(job).await.unwrap();

    match report {
        JobReport::Retrying { attempt, error, .. } => {
            assert_eq!(attempt, 1);
            assert!(matches!(error, PipelineError::Timeout(_)));
        }
        other => panic!("expected a retry, got {:?}", other),
    }

    let status = harness.orchestrator.project_status(project_id).await.unwrap();
    assert_eq!(status.state, ProjectState::Active);
}

#[tokio::test]
async fn test_job_events_are_published() {
    let harness = Harness::new();
    script_feasibility(&harness, 2);
    harness.store.fail_next_commits(1);
    let mut events = harness.orchestrator.subscribe();

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
    pool(&harness).run_until_idle().await.unwrap();

    match events.recv().await.unwrap() {
        JobEvent::RetryScheduled {
            project_id: id,
            attempt,
            ..
        } => {
            assert_eq!(id, project_id);
            assert_eq!(attempt, 1);
        }
        other => panic!("expected a retry event, got {:?}", other),
    }
    match events.recv().await.unwrap() {
        JobEvent::Completed { skipped, stage, .. } => {
            assert!(!skipped);
            assert_eq!(stage, StageName::Feasibility);
        }
        other => panic!("expected a completion event, got {:?}", other),
    }
}
