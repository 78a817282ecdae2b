//! Pipeline orchestrator.
//!
//! Entry point for callers: idea intake, stage triggers, status queries and
//! decisions. Also runs claimed jobs through their stage processor and
//! settles the outcome with the queue, the store and the run log.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::Generator;
use crate::domain::{
    Artifact, Decision, DecisionOutcome, Idea, Project, ProjectState, Run, Stage, StageName,
};
use crate::store::Store;

use super::error::PipelineError;
use super::jobs::{JobDisposition, JobOrchestrator};
use super::policy::StagePolicies;
use super::processor::{GenerationSettings, StageContext, StageOutcome, StageProcessor};
use super::queue::{Job, JobQueue, QueueStatus};
use super::run_log::{RunLog, StageRunRecord};
use super::stages;
use super::state_machine::ProjectStateMachine;

const EVENT_CAPACITY: usize = 256;

/// Acknowledgement returned by `trigger_stage`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerReceipt {
    pub job_id: String,
    pub status: String,
    /// False when an existing job was returned
    pub newly_enqueued: bool,
}

/// Snapshot of a project's position in the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectStatus {
    pub project_id: Uuid,
    pub state: ProjectState,
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<DecisionOutcome>,
}

/// A project created from a new idea
#[derive(Debug, Clone, Serialize)]
pub struct Intake {
    pub project: Project,
    pub idea: Idea,
}

/// Notification published after every job attempt
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Completed {
        job_id: String,
        project_id: Uuid,
        stage: StageName,
        skipped: bool,
    },
    RetryScheduled {
        job_id: String,
        project_id: Uuid,
        stage: StageName,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    Failed {
        job_id: String,
        project_id: Uuid,
        stage: StageName,
        error: String,
    },
}

/// What one job attempt came to
#[derive(Debug)]
pub enum JobReport {
    Completed(StageOutcome),
    Retrying {
        attempt: u32,
        delay: Duration,
        error: PipelineError,
    },
    Failed(PipelineError),
}

/// Main pipeline orchestrator
pub struct Orchestrator {
    store: Arc<dyn Store>,
    jobs: JobOrchestrator,
    processors: HashMap<StageName, Arc<dyn StageProcessor>>,
    run_log: Option<RunLog>,
    events: broadcast::Sender<JobEvent>,
}

impl Orchestrator {
    /// Build an orchestrator with the standard stage processors
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn JobQueue>,
        generator: Arc<dyn Generator>,
        policies: StagePolicies,
        generation: GenerationSettings,
    ) -> Self {
        let ctx = StageContext::new(store.clone(), generator, generation);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let mut orchestrator = Self {
            store,
            jobs: JobOrchestrator::new(queue, policies),
            processors: HashMap::new(),
            run_log: None,
            events,
        };
        for processor in stages::default_processors(&ctx) {
            orchestrator = orchestrator.with_processor(processor);
        }
        orchestrator
    }

    /// Replace the processor for its stage
    pub fn with_processor(mut self, processor: Arc<dyn StageProcessor>) -> Self {
        self.processors.insert(processor.stage(), processor);
        self
    }

    /// Record every job attempt to a run log
    pub fn with_run_log(mut self, run_log: RunLog) -> Self {
        self.run_log = Some(run_log);
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn jobs(&self) -> &JobOrchestrator {
        &self.jobs
    }

    pub fn run_log(&self) -> Option<&RunLog> {
        self.run_log.as_ref()
    }

    /// Subscribe to job attempt notifications
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    async fn project(&self, project_id: Uuid) -> Result<Project, PipelineError> {
        self.store
            .get_project(project_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("project", project_id))
    }

    /// Create a project at `Idea` from free-form idea text
    #[instrument(skip(self, content))]
    pub async fn submit_idea(&self, content: &str) -> Result<Intake, PipelineError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(PipelineError::InvalidInput(
                "idea content must not be empty".to_string(),
            ));
        }

        let project = Project::new();
        let idea = Idea::new(project.id, content);
        self.store.create_project(&project, Some(&idea)).await?;

        info!(project_id = %project.id, "Project created");
        Ok(Intake { project, idea })
    }

    /// Create an empty project; ideas are added with [`Orchestrator::add_idea`]
    pub async fn create_project(&self) -> Result<Project, PipelineError> {
        let project = Project::new();
        self.store.create_project(&project, None).await?;
        info!(project_id = %project.id, "Project created");
        Ok(project)
    }

    /// Add another idea to a project that has not started feasibility
    #[instrument(skip(self, content))]
    pub async fn add_idea(&self, project_id: Uuid, content: &str) -> Result<Idea, PipelineError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(PipelineError::InvalidInput(
                "idea content must not be empty".to_string(),
            ));
        }

        let idea = Idea::new(project_id, content);
        self.store.add_idea(&idea).await?;
        Ok(idea)
    }

    /// Enqueue the job for `stage` after checking the project is ready for it
    #[instrument(skip(self))]
    pub async fn trigger_stage(
        &self,
        stage: StageName,
        project_id: Uuid,
    ) -> Result<TriggerReceipt, PipelineError> {
        let project = self.project(project_id).await?;
        ProjectStateMachine::check_trigger(stage, &project)?;

        let result = self
            .jobs
            .enqueue(stage, project_id, json!({ "project_id": project_id }))
            .await?;
        let newly_enqueued = result.is_new();
        let job = result.into_job();

        info!(job_id = %job.id, newly_enqueued, "Stage triggered");
        Ok(TriggerReceipt {
            job_id: job.id,
            status: "enqueued".to_string(),
            newly_enqueued,
        })
    }

    pub async fn project_status(&self, project_id: Uuid) -> Result<ProjectStatus, PipelineError> {
        let project = self.project(project_id).await?;
        let decision = self.store.latest_decision(project_id).await?;

        Ok(ProjectStatus {
            project_id,
            state: project.state,
            stage: project.stage,
            decision: decision.map(|d| d.outcome),
        })
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>, PipelineError> {
        self.store.list_projects().await
    }

    pub async fn list_artifacts(&self, project_id: Uuid) -> Result<Vec<Artifact>, PipelineError> {
        self.project(project_id).await?;
        self.store.list_artifacts(project_id).await
    }

    pub async fn list_runs(&self, project_id: Uuid) -> Result<Vec<Run>, PipelineError> {
        self.project(project_id).await?;
        self.store.list_runs(project_id).await
    }

    /// Record an approve/reject decision at the project's current stage
    #[instrument(skip(self, rationale))]
    pub async fn record_decision(
        &self,
        project_id: Uuid,
        outcome: DecisionOutcome,
        rationale: Option<String>,
    ) -> Result<Decision, PipelineError> {
        let project = self.project(project_id).await?;
        let decision = Decision::new(project_id, project.stage, outcome, rationale);
        let stored = self.store.record_decision(&decision).await?;

        info!(outcome = %stored.outcome, stage = %stored.stage, "Decision recorded");
        Ok(stored)
    }

    pub async fn queue_status(&self) -> Result<QueueStatus, PipelineError> {
        Ok(self.jobs.queue().status().await?)
    }

    /// Claim the next available job for a stage
    pub async fn claim(&self, stage: StageName) -> Result<Option<Job>, PipelineError> {
        self.jobs.claim(stage).await
    }

    /// Run one claimed job to a settled state.
    ///
    /// The returned error covers queue bookkeeping only; the job's own
    /// failure is reported through [`JobReport`].
    #[instrument(skip(self, job), fields(job_id = %job.id, attempt = job.attempts))]
    pub async fn execute_job(&self, job: Job) -> Result<JobReport, PipelineError> {
        let started = Instant::now();
        let processor = self
            .processors
            .get(&job.stage)
            .ok_or_else(|| PipelineError::not_found("processor", job.stage))?
            .clone();
        let timeout = self.jobs.policy(job.stage).job_timeout();

        let result = match tokio::time::timeout(timeout, processor.process(job.project_id)).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Timeout(timeout)),
        };

        match result {
            Ok(outcome) => {
                self.jobs.complete(&job).await?;
                self.record(StageRunRecord::from_outcome(&outcome, job.attempts))
                    .await;
                self.publish(JobEvent::Completed {
                    job_id: job.id.clone(),
                    project_id: job.project_id,
                    stage: job.stage,
                    skipped: outcome.is_skipped(),
                });
                Ok(JobReport::Completed(outcome))
            }
            Err(err) => {
                let disposition = self.jobs.fail(&job, &err).await?;
                let elapsed = started.elapsed().as_millis() as u64;
                self.record(StageRunRecord::failure(
                    job.project_id,
                    job.stage,
                    job.attempts,
                    !disposition.is_terminal(),
                    elapsed,
                    err.to_string(),
                ))
                .await;

                match disposition {
                    JobDisposition::RetryScheduled { attempt, delay } => {
                        self.publish(JobEvent::RetryScheduled {
                            job_id: job.id.clone(),
                            project_id: job.project_id,
                            stage: job.stage,
                            attempt,
                            delay,
                            error: err.to_string(),
                        });
                        Ok(JobReport::Retrying {
                            attempt,
                            delay,
                            error: err,
                        })
                    }
                    JobDisposition::Exhausted { attempts } => {
                        let err = PipelineError::JobExhausted {
                            job_id: job.id.clone(),
                            attempts,
                            last_error: err.to_string(),
                        };
                        self.halt(&job, &err).await;
                        Ok(JobReport::Failed(err))
                    }
                    JobDisposition::Rejected => {
                        self.halt(&job, &err).await;
                        Ok(JobReport::Failed(err))
                    }
                }
            }
        }
    }

    /// Force the project into `Error` after its job failed for good
    async fn halt(&self, job: &Job, err: &PipelineError) {
        match self.store.get_project(job.project_id).await {
            Ok(Some(project)) if project.is_halted() => {
                info!(project_id = %job.project_id, state = %project.state, error = %err, "Job failed for a halted project")
            }
            Ok(None) => {
                warn!(project_id = %job.project_id, "Job failed for a missing project")
            }
            _ => match self.store.mark_error(job.project_id, &err.to_string()).await {
                Ok(project) => {
                    error!(project_id = %job.project_id, state = %project.state, error = %err, "Job failed permanently")
                }
                Err(PipelineError::NotFound { .. }) => {
                    warn!(project_id = %job.project_id, "Job failed for a missing project")
                }
                Err(mark_err) => {
                    error!(project_id = %job.project_id, error = %mark_err, "Failed to mark project as errored")
                }
            },
        }

        self.publish(JobEvent::Failed {
            job_id: job.id.clone(),
            project_id: job.project_id,
            stage: job.stage,
            error: err.to_string(),
        });
    }

    async fn record(&self, record: StageRunRecord) {
        if let Some(run_log) = &self.run_log {
            if let Err(e) = run_log.append(&record).await {
                warn!(error = %e, "Failed to append run record");
            }
        }
    }

    fn publish(&self, event: JobEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}
