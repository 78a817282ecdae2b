//! Domain types for the conductor pipeline.
//!
//! This module contains the core data structures:
//! - Project: lifecycle state, stage position, ideas and decisions
//! - Artifact: stage outputs keyed by (project, stage, type)
//! - Run: execution step records

pub mod artifact;
pub mod project;
pub mod run;

// Re-export commonly used types
pub use artifact::{content_hash, Artifact, ArtifactType, NewArtifact, StageName};
pub use project::{Decision, DecisionOutcome, Idea, Project, ProjectState, Stage};
pub use run::{Run, RunStatus, RunStep};
