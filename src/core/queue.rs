//! Durable job queue.
//!
//! Follows the append-only JSONL pattern: every state change is a new line
//! and the current state of each job is derived by replaying the log. Each
//! operation runs its read-decide-append cycle under an exclusive `fs2`
//! lock on a sidecar file, so claims stay atomic across worker tasks and
//! across processes sharing the same queue file.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::domain::StageName;

/// Errors that can occur with the job queue
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid job transition for {id}: {from} → {to}")]
    InvalidTransition {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Queue task failed: {0}")]
    Background(String),
}

/// Deterministic job identity: one job per stage per project
pub fn job_id(project_id: Uuid, stage: StageName) -> String {
    format!("{}-{}", project_id, stage)
}

/// Lifecycle of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker (possibly gated by `available_at`)
    Queued,

    /// Claimed by a worker
    Active,

    /// Finished successfully
    Completed,

    /// Failed permanently
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request to enqueue a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub stage: StageName,
    pub project_id: Uuid,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub max_attempts: u32,
}

impl JobSpec {
    pub fn id(&self) -> String {
        job_id(self.project_id, self.stage)
    }
}

/// A job with current state (derived from replaying events)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    /// `{project_id}-{stage}`
    pub id: String,

    /// Stage this job runs
    pub stage: StageName,

    /// Project the stage runs for
    pub project_id: Uuid,

    /// Opaque payload supplied at enqueue time
    pub payload: serde_json::Value,

    /// Current status
    pub status: JobStatus,

    /// Attempts started so far
    pub attempts: u32,

    /// Attempt budget for the current round
    pub max_attempts: u32,

    /// Earliest time a worker may claim the job
    pub available_at: DateTime<Utc>,

    /// Error from the most recent failed attempt
    pub last_error: Option<String>,

    /// When the job was first enqueued
    pub enqueued_at: DateTime<Utc>,

    /// When the current attempt was claimed
    pub claimed_at: Option<DateTime<Utc>>,

    /// When the job completed or failed permanently
    pub finished_at: Option<DateTime<Utc>>,
}

/// Result of enqueueing a job
#[derive(Debug, Clone)]
pub enum EnqueueResult {
    /// Successfully queued (new job)
    Queued(Job),

    /// Already queued or in flight
    AlreadyQueued(Job),

    /// Already completed; nothing enqueued
    AlreadyCompleted(Job),

    /// Failed permanently; nothing enqueued
    AlreadyFailed(Job),
}

impl EnqueueResult {
    /// Get the job regardless of result type
    pub fn job(&self) -> &Job {
        match self {
            Self::Queued(job)
            | Self::AlreadyQueued(job)
            | Self::AlreadyCompleted(job)
            | Self::AlreadyFailed(job) => job,
        }
    }

    pub fn into_job(self) -> Job {
        match self {
            Self::Queued(job)
            | Self::AlreadyQueued(job)
            | Self::AlreadyCompleted(job)
            | Self::AlreadyFailed(job) => job,
        }
    }

    /// Check if this call put new work on the queue
    pub fn is_new(&self) -> bool {
        matches!(self, Self::Queued(_))
    }
}

/// Queue status summary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub queued: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

impl QueueStatus {
    /// Total jobs in queue
    pub fn total(&self) -> usize {
        self.queued + self.active + self.completed + self.failed
    }
}

/// Durable queue operations the job orchestrator relies on
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue idempotently under the job's deterministic id
    async fn enqueue(&self, spec: JobSpec) -> Result<EnqueueResult, QueueError>;

    /// Atomically claim the oldest available job of a stage
    async fn claim_next(
        &self,
        stage: StageName,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, QueueError>;

    /// Mark an active job completed
    async fn complete(&self, id: &str) -> Result<Job, QueueError>;

    /// Put an active job back on the queue after `available_at`
    async fn schedule_retry(
        &self,
        id: &str,
        error: &str,
        available_at: DateTime<Utc>,
    ) -> Result<Job, QueueError>;

    /// Fail a job with no further attempts
    async fn fail_permanently(&self, id: &str, error: &str) -> Result<Job, QueueError>;

    /// Requeue jobs left active since before `claimed_before` (crashed workers)
    async fn requeue_stalled(
        &self,
        stage: StageName,
        claimed_before: DateTime<Utc>,
    ) -> Result<Vec<String>, QueueError>;

    async fn get(&self, id: &str) -> Result<Option<Job>, QueueError>;

    async fn list(&self) -> Result<Vec<Job>, QueueError>;

    /// Earliest `available_at` among queued jobs of a stage
    async fn next_available_at(&self, stage: StageName)
        -> Result<Option<DateTime<Utc>>, QueueError>;

    async fn status(&self) -> Result<QueueStatus, QueueError>;
}

/// An event in the queue log (append-only)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEvent {
    /// When this event occurred
    pub timestamp: DateTime<Utc>,

    /// The job ID
    pub job_id: String,

    /// Type of queue event
    pub event_type: QueueEventType,

    /// Additional data (depends on event type)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Types of queue events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueEventType {
    /// Job added to queue
    Enqueued,

    /// Worker took the job
    Claimed,

    /// Job finished successfully
    Completed,

    /// Attempt failed; job waits for backoff
    RetryScheduled,

    /// Job failed permanently
    Failed,

    /// Active job returned to the queue after its worker vanished
    Requeued,
}

impl QueueEvent {
    fn new(job_id: &str, event_type: QueueEventType, data: Option<serde_json::Value>) -> Self {
        Self {
            timestamp: Utc::now(),
            job_id: job_id.to_string(),
            event_type,
            data,
        }
    }
}

/// Replayed queue contents held while the lock is taken
struct Ledger {
    log: File,
    jobs: HashMap<String, Job>,
}

impl Ledger {
    fn load(path: &Path) -> Result<Self, QueueError> {
        let mut jobs = HashMap::new();
        let mut torn_tail = false;

        if path.exists() {
            let contents = fs::read_to_string(path)?;
            for (index, line) in contents.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<QueueEvent>(line) {
                    Ok(event) => apply_event(&mut jobs, event),
                    Err(e) => warn!(
                        path = %path.display(),
                        line = index + 1,
                        error = %e,
                        "Skipping unreadable queue event"
                    ),
                }
            }
            torn_tail = !contents.is_empty() && !contents.ends_with('\n');
        }

        let mut log = OpenOptions::new().create(true).append(true).open(path)?;
        if torn_tail {
            // keep the next event off the partial line
            writeln!(log)?;
        }
        Ok(Self { log, jobs })
    }

    fn append(&mut self, event: QueueEvent) -> Result<(), QueueError> {
        let json = serde_json::to_string(&event)?;
        writeln!(self.log, "{}", json)?;
        self.log.flush()?;
        apply_event(&mut self.jobs, event);
        Ok(())
    }

    fn job(&self, id: &str) -> Result<&Job, QueueError> {
        self.jobs
            .get(id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))
    }

    fn require(&self, id: &str, allowed: &[JobStatus], to: JobStatus) -> Result<(), QueueError> {
        let job = self.job(id)?;
        if allowed.contains(&job.status) {
            Ok(())
        } else {
            Err(QueueError::InvalidTransition {
                id: id.to_string(),
                from: job.status,
                to,
            })
        }
    }

    fn cloned(&self, id: &str) -> Result<Job, QueueError> {
        self.job(id).cloned()
    }
}

/// Apply a single event to the state
fn apply_event(jobs: &mut HashMap<String, Job>, event: QueueEvent) {
    let error = event
        .data
        .as_ref()
        .and_then(|d| d.get("error"))
        .and_then(|e| e.as_str())
        .map(str::to_string);

    match event.event_type {
        QueueEventType::Enqueued => {
            if let Some(data) = event.data {
                if let Ok(spec) = serde_json::from_value::<JobSpec>(data) {
                    jobs.insert(
                        event.job_id.clone(),
                        Job {
                            id: event.job_id,
                            stage: spec.stage,
                            project_id: spec.project_id,
                            payload: spec.payload,
                            status: JobStatus::Queued,
                            attempts: 0,
                            max_attempts: spec.max_attempts,
                            available_at: event.timestamp,
                            last_error: None,
                            enqueued_at: event.timestamp,
                            claimed_at: None,
                            finished_at: None,
                        },
                    );
                }
            }
        }
        QueueEventType::Claimed => {
            if let Some(job) = jobs.get_mut(&event.job_id) {
                job.status = JobStatus::Active;
                job.attempts += 1;
                job.claimed_at = Some(event.timestamp);
            }
        }
        QueueEventType::Completed => {
            if let Some(job) = jobs.get_mut(&event.job_id) {
                job.status = JobStatus::Completed;
                job.finished_at = Some(event.timestamp);
            }
        }
        QueueEventType::RetryScheduled => {
            if let Some(job) = jobs.get_mut(&event.job_id) {
                job.status = JobStatus::Queued;
                job.last_error = error;
                job.available_at = event
                    .data
                    .as_ref()
                    .and_then(|d| d.get("available_at"))
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or(event.timestamp);
            }
        }
        QueueEventType::Failed => {
            if let Some(job) = jobs.get_mut(&event.job_id) {
                job.status = JobStatus::Failed;
                job.last_error = error;
                job.finished_at = Some(event.timestamp);
            }
        }
        QueueEventType::Requeued => {
            if let Some(job) = jobs.get_mut(&event.job_id) {
                job.status = JobStatus::Queued;
                job.available_at = event.timestamp;
                job.claimed_at = None;
            }
        }
    }
}

/// JSONL-backed job queue
#[derive(Clone)]
pub struct JsonlJobQueue {
    inner: Arc<QueuePaths>,
}

struct QueuePaths {
    /// Path to the queue JSONL file
    queue_path: PathBuf,

    /// Sidecar file the exclusive lock is taken on
    lock_path: PathBuf,
}

impl JsonlJobQueue {
    /// Open a queue at the given log path, creating parent directories
    pub fn open(queue_path: impl Into<PathBuf>) -> Result<Self, QueueError> {
        let queue_path = queue_path.into();
        if let Some(parent) = queue_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let lock_path = queue_path.with_extension("lock");

        Ok(Self {
            inner: Arc::new(QueuePaths {
                queue_path,
                lock_path,
            }),
        })
    }

    /// Path to the queue log
    pub fn path(&self) -> &Path {
        &self.inner.queue_path
    }

    /// Run `f` against the replayed ledger while holding the queue lock
    async fn locked<T, F>(&self, f: F) -> Result<T, QueueError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Ledger) -> Result<T, QueueError> + Send + 'static,
    {
        let paths = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let lock = OpenOptions::new()
                .create(true)
                .write(true)
                .open(&paths.lock_path)?;
            lock.lock_exclusive()?;

            let mut ledger = Ledger::load(&paths.queue_path)?;
            let result = f(&mut ledger);

            // Lock is released when the file is dropped
            drop(lock);
            result
        })
        .await
        .map_err(|e| QueueError::Background(e.to_string()))?
    }
}

#[async_trait]
impl JobQueue for JsonlJobQueue {
    async fn enqueue(&self, spec: JobSpec) -> Result<EnqueueResult, QueueError> {
        self.locked(move |ledger| {
            let id = spec.id();

            if let Some(existing) = ledger.jobs.get(&id) {
                match existing.status {
                    JobStatus::Completed => return Ok(EnqueueResult::AlreadyCompleted(existing.clone())),
                    JobStatus::Queued | JobStatus::Active => {
                        return Ok(EnqueueResult::AlreadyQueued(existing.clone()))
                    }
                    JobStatus::Failed => return Ok(EnqueueResult::AlreadyFailed(existing.clone())),
                }
            }

            ledger.append(QueueEvent::new(
                &id,
                QueueEventType::Enqueued,
                Some(serde_json::to_value(&spec)?),
            ))?;
            Ok(EnqueueResult::Queued(ledger.cloned(&id)?))
        })
        .await
    }

    async fn claim_next(
        &self,
        stage: StageName,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, QueueError> {
        self.locked(move |ledger| {
            let next = ledger
                .jobs
                .values()
                .filter(|job| {
                    job.stage == stage && job.status == JobStatus::Queued && job.available_at <= now
                })
                .min_by(|a, b| {
                    a.available_at
                        .cmp(&b.available_at)
                        .then_with(|| a.enqueued_at.cmp(&b.enqueued_at))
                })
                .map(|job| (job.id.clone(), job.attempts + 1));

            let Some((id, attempt)) = next else {
                return Ok(None);
            };

            ledger.append(QueueEvent::new(
                &id,
                QueueEventType::Claimed,
                Some(json!({ "attempt": attempt })),
            ))?;
            Ok(Some(ledger.cloned(&id)?))
        })
        .await
    }

    async fn complete(&self, id: &str) -> Result<Job, QueueError> {
        let id = id.to_string();
        self.locked(move |ledger| {
            ledger.require(&id, &[JobStatus::Active], JobStatus::Completed)?;
            ledger.append(QueueEvent::new(&id, QueueEventType::Completed, None))?;
            ledger.cloned(&id)
        })
        .await
    }

    async fn schedule_retry(
        &self,
        id: &str,
        error: &str,
        available_at: DateTime<Utc>,
    ) -> Result<Job, QueueError> {
        let id = id.to_string();
        let error = error.to_string();
        self.locked(move |ledger| {
            ledger.require(&id, &[JobStatus::Active], JobStatus::Queued)?;
            ledger.append(QueueEvent::new(
                &id,
                QueueEventType::RetryScheduled,
                Some(json!({ "error": error, "available_at": available_at })),
            ))?;
            ledger.cloned(&id)
        })
        .await
    }

    async fn fail_permanently(&self, id: &str, error: &str) -> Result<Job, QueueError> {
        let id = id.to_string();
        let error = error.to_string();
        self.locked(move |ledger| {
            ledger.require(&id, &[JobStatus::Active, JobStatus::Queued], JobStatus::Failed)?;
            ledger.append(QueueEvent::new(
                &id,
                QueueEventType::Failed,
                Some(json!({ "error": error })),
            ))?;
            ledger.cloned(&id)
        })
        .await
    }

    async fn requeue_stalled(
        &self,
        stage: StageName,
        claimed_before: DateTime<Utc>,
    ) -> Result<Vec<String>, QueueError> {
        self.locked(move |ledger| {
            let stalled: Vec<String> = ledger
                .jobs
                .values()
                .filter(|job| {
                    job.stage == stage
                        && job.status == JobStatus::Active
                        && job.claimed_at.is_some_and(|at| at < claimed_before)
                })
                .map(|job| job.id.clone())
                .collect();

            for id in &stalled {
                ledger.append(QueueEvent::new(id, QueueEventType::Requeued, None))?;
            }
            Ok(stalled)
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<Job>, QueueError> {
        let id = id.to_string();
        self.locked(move |ledger| Ok(ledger.jobs.get(&id).cloned())).await
    }

    async fn list(&self) -> Result<Vec<Job>, QueueError> {
        self.locked(|ledger| {
            let mut jobs: Vec<Job> = ledger.jobs.values().cloned().collect();
            jobs.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at));
            Ok(jobs)
        })
        .await
    }

    async fn next_available_at(
        &self,
        stage: StageName,
    ) -> Result<Option<DateTime<Utc>>, QueueError> {
        self.locked(move |ledger| {
            Ok(ledger
                .jobs
                .values()
                .filter(|job| job.stage == stage && job.status == JobStatus::Queued)
                .map(|job| job.available_at)
                .min())
        })
        .await
    }

    async fn status(&self) -> Result<QueueStatus, QueueError> {
        self.locked(|ledger| {
            let mut status = QueueStatus::default();
            for job in ledger.jobs.values() {
                match job.status {
                    JobStatus::Queued => status.queued += 1,
                    JobStatus::Active => status.active += 1,
                    JobStatus::Completed => status.completed += 1,
                    JobStatus::Failed => status.failed += 1,
                }
            }
            Ok(status)
        })
        .await
    }
}
