//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;

use conductor::adapters::{GenerationOutput, GenerationRequest, Generator};
use conductor::core::{
    GenerationSettings, JsonlJobQueue, Orchestrator, RetryPolicy, RunLog, StagePolicies,
    StagePolicy,
};
use conductor::core::PipelineError;
use conductor::domain::{Artifact, ArtifactType, Decision, Idea, Project, Run, StageName};
use conductor::store::{CommitOutcome, MemoryStore, StageCommit, Store};
use uuid::Uuid;

/// Generator that replays canned responses per stage
#[derive(Default)]
pub struct ScriptedGenerator {
    scripts: Mutex<HashMap<StageName, VecDeque<Result<String, String>>>>,
    calls: Mutex<Vec<StageName>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful response for a stage
    pub fn respond(&self, stage: StageName, text: impl Into<String>) {
        self.push(stage, Ok(text.into()));
    }

    /// Queue a failed call for a stage
    pub fn fail(&self, stage: StageName, message: impl Into<String>) {
        self.push(stage, Err(message.into()));
    }

    fn push(&self, stage: StageName, entry: Result<String, String>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(stage)
            .or_default()
            .push_back(entry);
    }

    /// Number of calls made for a stage
    pub fn calls(&self, stage: StageName) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|s| **s == stage)
            .count()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput> {
        self.calls.lock().unwrap().push(request.stage);
        let next = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.stage)
            .and_then(VecDeque::pop_front);

        match next {
            Some(Ok(text)) => Ok(GenerationOutput {
                text,
                input_tokens: 100,
                output_tokens: 50,
            }),
            Some(Err(message)) => anyhow::bail!(message),
            None => anyhow::bail!("no scripted response for {}", request.stage),
        }
    }
}

/// Memory store whose next stage commits can be made to fail
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    failing_commits: AtomicUsize,
    error_marks: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` stage commits with a persistence error
    pub fn fail_next_commits(&self, n: usize) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }

    /// Number of `mark_error` calls seen so far
    pub fn error_marks(&self) -> usize {
        self.error_marks.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        self.failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Store for FlakyStore {
    fn name(&self) -> &str {
        "flaky-memory"
    }

    async fn create_project(
        &self,
        project: &Project,
        idea: Option<&Idea>,
    ) -> Result<(), PipelineError> {
        self.inner.create_project(project, idea).await
    }

    async fn add_idea(&self, idea: &Idea) -> Result<(), PipelineError> {
        self.inner.add_idea(idea).await
    }

    async fn get_project(&self, project_id: Uuid) -> Result<Option<Project>, PipelineError> {
        self.inner.get_project(project_id).await
    }

    async fn list_projects(&self) -> Result<Vec<Project>, PipelineError> {
        self.inner.list_projects().await
    }

    async fn latest_idea(&self, project_id: Uuid) -> Result<Option<Idea>, PipelineError> {
        self.inner.latest_idea(project_id).await
    }

    async fn latest_artifact(
        &self,
        project_id: Uuid,
        artifact_type: ArtifactType,
    ) -> Result<Option<Artifact>, PipelineError> {
        self.inner.latest_artifact(project_id, artifact_type).await
    }

    async fn list_artifacts(&self, project_id: Uuid) -> Result<Vec<Artifact>, PipelineError> {
        self.inner.list_artifacts(project_id).await
    }

    async fn list_runs(&self, project_id: Uuid) -> Result<Vec<Run>, PipelineError> {
        self.inner.list_runs(project_id).await
    }

    async fn latest_decision(&self, project_id: Uuid) -> Result<Option<Decision>, PipelineError> {
        self.inner.latest_decision(project_id).await
    }

    async fn commit_stage(&self, commit: StageCommit) -> Result<CommitOutcome, PipelineError> {
        if self.take_failure() {
            return Err(PipelineError::Persistence(
                "injected commit failure".to_string(),
            ));
        }
        self.inner.commit_stage(commit).await
    }

    async fn record_decision(&self, decision: &Decision) -> Result<Decision, PipelineError> {
        self.inner.record_decision(decision).await
    }

    async fn mark_error(&self, project_id: Uuid, reason: &str) -> Result<Project, PipelineError> {
        self.error_marks.fetch_add(1, Ordering::SeqCst);
        self.inner.mark_error(project_id, reason).await
    }
}

/// Policies with millisecond backoff so retry tests run quickly
pub fn fast_policies() -> StagePolicies {
    StagePolicies::uniform(StagePolicy {
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 10,
            max_delay_ms: 50,
            backoff_multiplier: 2.0,
        },
        concurrency: 5,
        job_timeout_seconds: 5,
    })
}

/// Orchestrator over a flaky memory store and a queue in a temp directory
pub struct Harness {
    pub dir: TempDir,
    pub store: Arc<FlakyStore>,
    pub queue: Arc<JsonlJobQueue>,
    pub generator: Arc<ScriptedGenerator>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_policies(fast_policies())
    }

    pub fn with_policies(policies: StagePolicies) -> Self {
        Self::build(policies, |orchestrator| orchestrator)
    }

    /// Build with a hook to customise the orchestrator before it is shared
    pub fn build(
        policies: StagePolicies,
        customise: impl FnOnce(Orchestrator) -> Orchestrator,
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FlakyStore::new());
        let queue = Arc::new(JsonlJobQueue::open(dir.path().join("queue.jsonl")).unwrap());
        let generator = Arc::new(ScriptedGenerator::new());

        let orchestrator = Orchestrator::new(
            store.clone(),
            queue.clone(),
            generator.clone(),
            policies,
            GenerationSettings {
                max_tokens: 1000,
                timeout: Duration::from_secs(2),
            },
        )
        .with_run_log(RunLog::new(dir.path().join("runs.jsonl")));

        Self {
            dir,
            store,
            queue,
            generator,
            orchestrator: Arc::new(customise(orchestrator)),
        }
    }
}

pub fn risk(n: usize) -> Value {
    json!({
        "risk": format!("Risk number {}", n),
        "likelihood": "medium",
        "impact": "high",
        "mitigation": format!("Mitigation for risk {}", n),
    })
}

/// A feasibility artifact that satisfies its contract
pub fn valid_feasibility() -> Value {
    json!({
        "schema_version": "v1",
        "idea": {"title": "Dog walkers", "one_liner": "Marketplace for local dog walkers"},
        "verdict": "go",
        "confidence": 0.82,
        "summary": "Strong local demand and a simple two-sided model make this viable.",
        "key_assumptions": ["Walkers will pay a listing fee"],
        "risks": (1..=5).map(risk).collect::<Vec<_>>(),
        "unknowns": ["Insurance requirements"],
        "suggested_stack": {"frontend": "React", "backend": "Rust"},
        "estimates": {"mvp_weeks": 8, "team_size": 3},
        "recommended_next_steps": ["Interview ten walkers"],
    })
}

/// A plan artifact that satisfies its contract
pub fn valid_plan() -> Value {
    let phase = |name: &str, weeks: u64| {
        json!({
            "name": name,
            "duration_weeks": weeks,
            "objectives": ["Objective"],
            "deliverables": ["Deliverable"],
        })
    };
    json!({
        "schema_version": "v1",
        "timeline_weeks": 10,
        "phases": [phase("Discovery", 2), phase("Build", 5), phase("Test", 2), phase("Launch", 1)],
        "components": [{"name": "API"}],
        "roles": [{"role": "Engineer"}],
        "milestones": (1..=5).map(|w| json!({"milestone": format!("M{}", w), "week": w * 2})).collect::<Vec<_>>(),
        "open_questions": [],
        "immediate_next_actions": (1..=7).map(|n| format!("Action {}", n)).collect::<Vec<_>>(),
    })
}

/// Wrap JSON in prose the way a chat model tends to
pub fn chatty(value: &Value) -> String {
    format!("Here is the analysis you asked for:\n\n{}\n\nLet me know if you need more.", value)
}
