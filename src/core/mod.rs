//! Core orchestration logic.
//!
//! This module contains:
//! - ProjectStateMachine: stage and state transition rules
//! - JobQueue / JobOrchestrator: durable queue with idempotent enqueue and retry
//! - Contracts: artifact validation and fallbacks
//! - Stage processors: feasibility, planning, execution
//! - Orchestrator / WorkerPool: caller operations and job execution
//! - RunLog: append-only record of job outcomes

pub mod contracts;
pub mod error;
pub mod jobs;
pub mod orchestrator;
pub mod policy;
pub mod processor;
pub mod queue;
pub mod run_log;
pub mod stages;
pub mod state_machine;
pub mod worker;

// Re-export commonly used types
pub use contracts::{ContractError, ValidationReport};
pub use error::PipelineError;
pub use jobs::{JobDisposition, JobOrchestrator};
pub use orchestrator::{Intake, JobEvent, JobReport, Orchestrator, ProjectStatus, TriggerReceipt};
pub use policy::{RetryPolicy, StagePolicies, StagePolicy};
pub use processor::{
    GenerationSettings, OutcomeStatus, StageContext, StageDetail, StageOutcome, StageProcessor,
};
pub use queue::{EnqueueResult, Job, JobQueue, JobStatus, JsonlJobQueue, QueueError, QueueStatus};
pub use run_log::{RunLog, RunSummary, StageRunRecord};
pub use state_machine::ProjectStateMachine;
pub use worker::{DrainReport, WorkerPool};
