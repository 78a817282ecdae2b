//! Job orchestration: idempotent enqueue and retry decisions.
//!
//! The orchestrator owns the per-stage retry policies and translates a
//! failed attempt into a [`JobDisposition`]. It never touches project
//! state; forcing a project into `Error` is the caller's job.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::domain::StageName;

use super::error::PipelineError;
use super::policy::{StagePolicies, StagePolicy};
use super::queue::{EnqueueResult, Job, JobQueue, JobSpec};

/// What happened to a job after a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum JobDisposition {
    /// Back on the queue; the next attempt starts after `delay`
    RetryScheduled { attempt: u32, delay: Duration },

    /// Every attempt failed
    Exhausted { attempts: u32 },

    /// The error is not retriable; no further attempts
    Rejected,
}

impl JobDisposition {
    /// True when the job will not run again
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::RetryScheduled { .. })
    }
}

/// Wraps the durable queue with stage policies
#[derive(Clone)]
pub struct JobOrchestrator {
    queue: Arc<dyn JobQueue>,
    policies: StagePolicies,
}

impl JobOrchestrator {
    pub fn new(queue: Arc<dyn JobQueue>, policies: StagePolicies) -> Self {
        Self { queue, policies }
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    pub fn policy(&self, stage: StageName) -> &StagePolicy {
        self.policies.get(stage)
    }

    pub fn policies(&self) -> &StagePolicies {
        &self.policies
    }

    /// Enqueue a stage job under the id `{project_id}-{stage}`
    pub async fn enqueue(
        &self,
        stage: StageName,
        project_id: Uuid,
        payload: serde_json::Value,
    ) -> Result<EnqueueResult, PipelineError> {
        let spec = JobSpec {
            stage,
            project_id,
            payload,
            max_attempts: self.policy(stage).retry.max_attempts.max(1),
        };
        let result = self.queue.enqueue(spec).await?;
        debug!(job_id = %result.job().id, new = result.is_new(), "Enqueue");
        Ok(result)
    }

    /// Claim the next available job of a stage
    pub async fn claim(&self, stage: StageName) -> Result<Option<Job>, PipelineError> {
        Ok(self.queue.claim_next(stage, Utc::now()).await?)
    }

    /// Mark a job done
    pub async fn complete(&self, job: &Job) -> Result<Job, PipelineError> {
        Ok(self.queue.complete(&job.id).await?)
    }

    /// Record a failed attempt and decide whether the job runs again
    pub async fn fail(
        &self,
        job: &Job,
        err: &PipelineError,
    ) -> Result<JobDisposition, PipelineError> {
        let message = err.to_string();

        if !err.is_retriable() {
            self.queue.fail_permanently(&job.id, &message).await?;
            error!(job_id = %job.id, kind = err.kind(), error = %message, "Job rejected");
            return Ok(JobDisposition::Rejected);
        }

        let retry = &self.policy(job.stage).retry;

        // the job keeps the budget it was enqueued with
        if retry.should_retry(job.attempts) && job.attempts < job.max_attempts {
            let delay = retry.delay_for_attempt(job.attempts);
            let available_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            self.queue
                .schedule_retry(&job.id, &message, available_at)
                .await?;

            warn!(
                job_id = %job.id,
                attempt = job.attempts,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "Job failed, retrying"
            );
            return Ok(JobDisposition::RetryScheduled {
                attempt: job.attempts,
                delay,
            });
        }

        self.queue.fail_permanently(&job.id, &message).await?;
        error!(
            job_id = %job.id,
            attempts = job.attempts,
            error = %message,
            "Job exhausted its attempts"
        );
        Ok(JobDisposition::Exhausted {
            attempts: job.attempts,
        })
    }
}
