//! conductor - Durable stage pipeline from idea to execution
//!
//! Projects move through a fixed sequence of stages: an idea is assessed
//! for feasibility, turned into an execution plan, then executed. Each
//! stage runs as a job on a durable queue and writes versioned artifacts.
//!
//! # Architecture
//!
//! - Stage jobs are enqueued idempotently under `{project_id}-{stage}`
//! - Workers claim jobs per stage with bounded concurrency and retry with
//!   exponential backoff
//! - Generated artifacts are validated against a contract; anything that
//!   fails is replaced by a schema-valid fallback
//! - Artifacts, runs and the stage transition commit atomically, guarded
//!   by the project state machine
//!
//! # Modules
//!
//! - `adapters`: Generative service integrations (Anthropic, offline)
//! - `core`: Orchestration logic (state machine, queue, processors, workers)
//! - `domain`: Data structures (Project, Artifact, Run)
//! - `store`: Persistence (SQLite, memory)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Submit an idea and run feasibility
//! conductor idea "Marketplace for local dog walkers"
//! conductor trigger feasibility <project-id>
//! conductor work --once
//!
//! # Check where it stands
//! conductor status <project-id>
//! conductor artifacts <project-id> --full
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod store;

// Re-export main types at crate root for convenience
pub use core::{Orchestrator, PipelineError, WorkerPool};
pub use domain::{Artifact, ArtifactType, Project, ProjectState, Stage, StageName};
pub use store::{MemoryStore, SqliteStore, Store};
