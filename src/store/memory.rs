//! In-memory store.
//!
//! Mirrors the relational backend's semantics with typed collections:
//! artifacts live in a map keyed on `(project, stage, type)` so a second
//! insert is skipped rather than overwritten. All writes of one commit are
//! applied under a single lock, after the guard has passed.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::core::error::PipelineError;
use crate::domain::{
    Artifact, ArtifactType, Decision, Idea, Project, Run, Stage, StageName,
};

use super::{
    check_add_idea, plan_commit, plan_decision, plan_mark_error, CommitOutcome, CommitPlan,
    DecisionPlan, StageCommit, Store,
};

type ArtifactKey = (Uuid, StageName, ArtifactType);

#[derive(Default)]
struct MemoryState {
    projects: HashMap<Uuid, Project>,
    ideas: Vec<Idea>,
    /// Insertion sequence kept alongside each artifact for stable ordering
    artifacts: BTreeMap<ArtifactKey, (u64, Artifact)>,
    runs: Vec<Run>,
    decisions: HashMap<(Uuid, Stage), Decision>,
    seq: u64,
}

impl MemoryState {
    fn project(&self, project_id: Uuid) -> Result<&Project, PipelineError> {
        self.projects
            .get(&project_id)
            .ok_or_else(|| PipelineError::not_found("project", project_id))
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

/// Store backed by process memory
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut MemoryState) -> Result<T, PipelineError>,
    ) -> Result<T, PipelineError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| PipelineError::Persistence("memory store lock poisoned".to_string()))?;
        f(&mut state)
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create_project(
        &self,
        project: &Project,
        idea: Option<&Idea>,
    ) -> Result<(), PipelineError> {
        self.with_state(|state| {
            if state.projects.contains_key(&project.id) {
                return Err(PipelineError::Persistence(format!(
                    "project {} already exists",
                    project.id
                )));
            }
            state.projects.insert(project.id, project.clone());
            state.ideas.extend(idea.cloned());
            Ok(())
        })
    }

    async fn add_idea(&self, idea: &Idea) -> Result<(), PipelineError> {
        self.with_state(|state| {
            check_add_idea(state.project(idea.project_id)?)?;
            state.ideas.push(idea.clone());
            Ok(())
        })
    }

    async fn get_project(&self, project_id: Uuid) -> Result<Option<Project>, PipelineError> {
        self.with_state(|state| Ok(state.projects.get(&project_id).cloned()))
    }

    async fn list_projects(&self) -> Result<Vec<Project>, PipelineError> {
        self.with_state(|state| {
            let mut projects: Vec<Project> = state.projects.values().cloned().collect();
            projects.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            Ok(projects)
        })
    }

    async fn latest_idea(&self, project_id: Uuid) -> Result<Option<Idea>, PipelineError> {
        self.with_state(|state| {
            // max_by_key returns the last maximum, so later inserts win ties
            Ok(state
                .ideas
                .iter()
                .filter(|idea| idea.project_id == project_id)
                .max_by_key(|idea| idea.created_at)
                .cloned())
        })
    }

    async fn latest_artifact(
        &self,
        project_id: Uuid,
        artifact_type: ArtifactType,
    ) -> Result<Option<Artifact>, PipelineError> {
        self.with_state(|state| {
            Ok(state
                .artifacts
                .values()
                .filter(|(_, a)| a.project_id == project_id && a.artifact_type == artifact_type)
                .max_by_key(|(seq, a)| (a.created_at, *seq))
                .map(|(_, a)| a.clone()))
        })
    }

    async fn list_artifacts(&self, project_id: Uuid) -> Result<Vec<Artifact>, PipelineError> {
        self.with_state(|state| {
            let mut artifacts: Vec<&(u64, Artifact)> = state
                .artifacts
                .values()
                .filter(|(_, a)| a.project_id == project_id)
                .collect();
            artifacts.sort_by_key(|(seq, _)| *seq);
            Ok(artifacts.into_iter().map(|(_, a)| a.clone()).collect())
        })
    }

    async fn list_runs(&self, project_id: Uuid) -> Result<Vec<Run>, PipelineError> {
        self.with_state(|state| {
            Ok(state
                .runs
                .iter()
                .filter(|run| run.project_id == project_id)
                .cloned()
                .collect())
        })
    }

    async fn latest_decision(&self, project_id: Uuid) -> Result<Option<Decision>, PipelineError> {
        self.with_state(|state| {
            Ok(state
                .decisions
                .values()
                .filter(|d| d.project_id == project_id)
                .max_by_key(|d| (d.decided_at, d.stage))
                .cloned())
        })
    }

    async fn commit_stage(&self, commit: StageCommit) -> Result<CommitOutcome, PipelineError> {
        self.with_state(|state| {
            let project = state.project(commit.project_id)?.clone();
            if plan_commit(&project, &commit)? == CommitPlan::Skip {
                return Ok(CommitOutcome::AlreadyApplied);
            }

            let mut inserted = 0;
            let mut ignored = 0;
            for new in commit.artifacts {
                let key = (commit.project_id, new.stage, new.artifact_type);
                if state.artifacts.contains_key(&key) {
                    ignored += 1;
                    continue;
                }
                let seq = state.next_seq();
                state
                    .artifacts
                    .insert(key, (seq, Artifact::from_new(commit.project_id, new)));
                inserted += 1;
            }

            state.runs.extend(commit.runs);

            if let Some(project) = state.projects.get_mut(&commit.project_id) {
                project.stage = commit.new_stage;
                project.updated_at = Utc::now();
            }

            Ok(CommitOutcome::Applied { inserted, ignored })
        })
    }

    async fn record_decision(&self, decision: &Decision) -> Result<Decision, PipelineError> {
        self.with_state(|state| {
            let project = state.project(decision.project_id)?.clone();
            let existing = state.decisions.get(&(decision.project_id, project.stage));

            match plan_decision(&project, existing, decision)? {
                DecisionPlan::Existing(existing) => Ok(existing),
                DecisionPlan::Insert(new_state) => {
                    let stored = Decision {
                        stage: project.stage,
                        ..decision.clone()
                    };
                    state
                        .decisions
                        .insert((stored.project_id, stored.stage), stored.clone());
                    if let Some(project) = state.projects.get_mut(&decision.project_id) {
                        project.state = new_state;
                        project.updated_at = Utc::now();
                    }
                    Ok(stored)
                }
            }
        })
    }

    async fn mark_error(&self, project_id: Uuid, _reason: &str) -> Result<Project, PipelineError> {
        self.with_state(|state| {
            let project = state.project(project_id)?.clone();
            let Some(new_state) = plan_mark_error(&project)? else {
                return Ok(project);
            };

            let project = state
                .projects
                .get_mut(&project_id)
                .ok_or_else(|| PipelineError::not_found("project", project_id))?;
            project.state = new_state;
            project.updated_at = Utc::now();
            Ok(project.clone())
        })
    }
}
