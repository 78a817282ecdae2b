//! SQLite store.
//!
//! The connection lives behind a mutex and every call runs on the blocking
//! pool. Stage commits use an immediate transaction so the guard re-check
//! and the writes see the same row; dropping the transaction on any error
//! rolls everything back.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::debug;
use uuid::Uuid;

use crate::core::error::PipelineError;
use crate::domain::{Artifact, ArtifactType, Decision, Idea, Project, Run};

use super::{
    check_add_idea, plan_commit, plan_decision, plan_mark_error, CommitOutcome, CommitPlan,
    DecisionPlan, StageCommit, Store,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS projects (
    id          TEXT PRIMARY KEY,
    state       TEXT NOT NULL,
    stage       TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ideas (
    id          TEXT PRIMARY KEY,
    project_id  TEXT NOT NULL REFERENCES projects(id),
    content     TEXT NOT NULL,
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS ideas_project ON ideas(project_id, created_at);

CREATE TABLE IF NOT EXISTS artifacts (
    id            TEXT PRIMARY KEY,
    project_id    TEXT NOT NULL REFERENCES projects(id),
    stage         TEXT NOT NULL,
    type          TEXT NOT NULL,
    content       TEXT NOT NULL,
    content_hash  TEXT NOT NULL,
    created_at    TEXT NOT NULL,
    UNIQUE (project_id, stage, type)
);

CREATE TABLE IF NOT EXISTS runs (
    id          TEXT PRIMARY KEY,
    project_id  TEXT NOT NULL REFERENCES projects(id),
    step        TEXT NOT NULL,
    status      TEXT NOT NULL,
    error       TEXT,
    started_at  TEXT NOT NULL,
    ended_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS runs_project ON runs(project_id);

CREATE TABLE IF NOT EXISTS decisions (
    id          TEXT PRIMARY KEY,
    project_id  TEXT NOT NULL REFERENCES projects(id),
    stage       TEXT NOT NULL,
    outcome     TEXT NOT NULL,
    rationale   TEXT,
    decided_at  TEXT NOT NULL,
    UNIQUE (project_id, stage)
);
";

/// Store backed by a SQLite database
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a database file and bootstrap the schema
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                PipelineError::Persistence(format!(
                    "Failed to create database directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let conn = Connection::open(path)?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        Self::bootstrap(conn)
    }

    /// Private database that disappears with the store
    pub fn open_in_memory() -> Result<Self, PipelineError> {
        Self::bootstrap(Connection::open_in_memory()?)
    }

    fn bootstrap(conn: Connection) -> Result<Self, PipelineError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` with exclusive use of the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T, PipelineError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, PipelineError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|_| {
                PipelineError::Persistence("sqlite connection lock poisoned".to_string())
            })?;
            f(&mut conn)
        })
        .await
        .map_err(|e| PipelineError::Persistence(format!("sqlite task failed: {}", e)))?
    }
}

/// RFC 3339 with fixed precision so text ordering matches time ordering
fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn col_parse<T: FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion(idx, e))
}

fn col_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| conversion(idx, e.to_string()))
}

fn col_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion(idx, e.to_string()))
}

const PROJECT_COLUMNS: &str = "id, state, stage, created_at, updated_at";

fn map_project(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: col_uuid(row, 0)?,
        state: col_parse(row, 1)?,
        stage: col_parse(row, 2)?,
        created_at: col_time(row, 3)?,
        updated_at: col_time(row, 4)?,
    })
}

fn map_idea(row: &Row<'_>) -> rusqlite::Result<Idea> {
    Ok(Idea {
        id: col_uuid(row, 0)?,
        project_id: col_uuid(row, 1)?,
        content: row.get(2)?,
        created_at: col_time(row, 3)?,
    })
}

const ARTIFACT_COLUMNS: &str = "id, project_id, stage, type, content, content_hash, created_at";

fn map_artifact(row: &Row<'_>) -> rusqlite::Result<Artifact> {
    let content: String = row.get(4)?;
    Ok(Artifact {
        id: col_uuid(row, 0)?,
        project_id: col_uuid(row, 1)?,
        stage: col_parse(row, 2)?,
        artifact_type: col_parse(row, 3)?,
        content: serde_json::from_str(&content).map_err(|e| conversion(4, e.to_string()))?,
        content_hash: row.get(5)?,
        created_at: col_time(row, 6)?,
    })
}

fn map_run(row: &Row<'_>) -> rusqlite::Result<Run> {
    Ok(Run {
        id: col_uuid(row, 0)?,
        project_id: col_uuid(row, 1)?,
        step: col_parse(row, 2)?,
        status: col_parse(row, 3)?,
        error: row.get(4)?,
        started_at: col_time(row, 5)?,
        ended_at: col_time(row, 6)?,
    })
}

const DECISION_COLUMNS: &str = "id, project_id, stage, outcome, rationale, decided_at";

fn map_decision(row: &Row<'_>) -> rusqlite::Result<Decision> {
    Ok(Decision {
        id: col_uuid(row, 0)?,
        project_id: col_uuid(row, 1)?,
        stage: col_parse(row, 2)?,
        outcome: col_parse(row, 3)?,
        rationale: row.get(4)?,
        decided_at: col_time(row, 5)?,
    })
}

fn load_project(conn: &Connection, project_id: Uuid) -> Result<Project, PipelineError> {
    conn.query_row(
        &format!("SELECT {} FROM projects WHERE id = ?1", PROJECT_COLUMNS),
        params![project_id.to_string()],
        map_project,
    )
    .optional()?
    .ok_or_else(|| PipelineError::not_found("project", project_id))
}

fn insert_idea(conn: &Connection, idea: &Idea) -> Result<(), PipelineError> {
    conn.execute(
        "INSERT INTO ideas (id, project_id, content, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![
            idea.id.to_string(),
            idea.project_id.to_string(),
            idea.content,
            ts(&idea.created_at)
        ],
    )?;
    Ok(())
}

#[async_trait]
impl Store for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn create_project(
        &self,
        project: &Project,
        idea: Option<&Idea>,
    ) -> Result<(), PipelineError> {
        let project = project.clone();
        let idea = idea.cloned();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO projects (id, state, stage, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    project.id.to_string(),
                    project.state.as_str(),
                    project.stage.as_str(),
                    ts(&project.created_at),
                    ts(&project.updated_at)
                ],
            )?;
            if let Some(idea) = &idea {
                insert_idea(&tx, idea)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn add_idea(&self, idea: &Idea) -> Result<(), PipelineError> {
        let idea = idea.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            check_add_idea(&load_project(&tx, idea.project_id)?)?;
            insert_idea(&tx, &idea)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_project(&self, project_id: Uuid) -> Result<Option<Project>, PipelineError> {
        self.with_conn(move |conn| match load_project(conn, project_id) {
            Ok(project) => Ok(Some(project)),
            Err(PipelineError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        })
        .await
    }

    async fn list_projects(&self) -> Result<Vec<Project>, PipelineError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM projects ORDER BY updated_at DESC, rowid DESC",
                PROJECT_COLUMNS
            ))?;
            let rows = stmt.query_map([], map_project)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn latest_idea(&self, project_id: Uuid) -> Result<Option<Idea>, PipelineError> {
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, project_id, content, created_at FROM ideas
                     WHERE project_id = ?1
                     ORDER BY created_at DESC, rowid DESC
                     LIMIT 1",
                    params![project_id.to_string()],
                    map_idea,
                )
                .optional()?)
        })
        .await
    }

    async fn latest_artifact(
        &self,
        project_id: Uuid,
        artifact_type: ArtifactType,
    ) -> Result<Option<Artifact>, PipelineError> {
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {} FROM artifacts
                         WHERE project_id = ?1 AND type = ?2
                         ORDER BY created_at DESC, rowid DESC
                         LIMIT 1",
                        ARTIFACT_COLUMNS
                    ),
                    params![project_id.to_string(), artifact_type.as_str()],
                    map_artifact,
                )
                .optional()?)
        })
        .await
    }

    async fn list_artifacts(&self, project_id: Uuid) -> Result<Vec<Artifact>, PipelineError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM artifacts WHERE project_id = ?1 ORDER BY created_at, rowid",
                ARTIFACT_COLUMNS
            ))?;
            let rows = stmt.query_map(params![project_id.to_string()], map_artifact)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn list_runs(&self, project_id: Uuid) -> Result<Vec<Run>, PipelineError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, project_id, step, status, error, started_at, ended_at FROM runs
                 WHERE project_id = ?1 ORDER BY rowid",
            )?;
            let rows = stmt.query_map(params![project_id.to_string()], map_run)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn latest_decision(&self, project_id: Uuid) -> Result<Option<Decision>, PipelineError> {
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {} FROM decisions WHERE project_id = ?1
                         ORDER BY decided_at DESC, rowid DESC LIMIT 1",
                        DECISION_COLUMNS
                    ),
                    params![project_id.to_string()],
                    map_decision,
                )
                .optional()?)
        })
        .await
    }

    async fn commit_stage(&self, commit: StageCommit) -> Result<CommitOutcome, PipelineError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let project = load_project(&tx, commit.project_id)?;
            if plan_commit(&project, &commit)? == CommitPlan::Skip {
                debug!(project_id = %commit.project_id, stage = %commit.new_stage, "Commit already applied");
                return Ok(CommitOutcome::AlreadyApplied);
            }

            let mut inserted = 0;
            let mut ignored = 0;
            for new in commit.artifacts {
                let artifact = Artifact::from_new(commit.project_id, new);
                let changed = tx.execute(
                    "INSERT INTO artifacts (id, project_id, stage, type, content, content_hash, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT (project_id, stage, type) DO NOTHING",
                    params![
                        artifact.id.to_string(),
                        artifact.project_id.to_string(),
                        artifact.stage.as_str(),
                        artifact.artifact_type.as_str(),
                        artifact.content.to_string(),
                        artifact.content_hash,
                        ts(&artifact.created_at)
                    ],
                )?;
                if changed == 0 {
                    ignored += 1;
                } else {
                    inserted += 1;
                }
            }

            for run in &commit.runs {
                tx.execute(
                    "INSERT INTO runs (id, project_id, step, status, error, started_at, ended_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        run.id.to_string(),
                        run.project_id.to_string(),
                        run.step.as_str(),
                        run.status.as_str(),
                        run.error,
                        ts(&run.started_at),
                        ts(&run.ended_at)
                    ],
                )?;
            }

            tx.execute(
                "UPDATE projects SET stage = ?1, updated_at = ?2 WHERE id = ?3",
                params![
                    commit.new_stage.as_str(),
                    ts(&Utc::now()),
                    commit.project_id.to_string()
                ],
            )?;

            tx.commit()?;
            Ok(CommitOutcome::Applied { inserted, ignored })
        })
        .await
    }

    async fn record_decision(&self, decision: &Decision) -> Result<Decision, PipelineError> {
        let decision = decision.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let project = load_project(&tx, decision.project_id)?;

            let existing = tx
                .query_row(
                    &format!(
                        "SELECT {} FROM decisions WHERE project_id = ?1 AND stage = ?2",
                        DECISION_COLUMNS
                    ),
                    params![project.id.to_string(), project.stage.as_str()],
                    map_decision,
                )
                .optional()?;

            match plan_decision(&project, existing.as_ref(), &decision)? {
                DecisionPlan::Existing(existing) => Ok(existing),
                DecisionPlan::Insert(new_state) => {
                    let stored = Decision {
                        stage: project.stage,
                        ..decision
                    };
                    tx.execute(
                        "INSERT INTO decisions (id, project_id, stage, outcome, rationale, decided_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![
                            stored.id.to_string(),
                            stored.project_id.to_string(),
                            stored.stage.as_str(),
                            stored.outcome.as_str(),
                            stored.rationale,
                            ts(&stored.decided_at)
                        ],
                    )?;
                    tx.execute(
                        "UPDATE projects SET state = ?1, updated_at = ?2 WHERE id = ?3",
                        params![new_state.as_str(), ts(&Utc::now()), project.id.to_string()],
                    )?;
                    tx.commit()?;
                    Ok(stored)
                }
            }
        })
        .await
    }

    async fn mark_error(&self, project_id: Uuid, reason: &str) -> Result<Project, PipelineError> {
        let reason = reason.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let project = load_project(&tx, project_id)?;
            let Some(new_state) = plan_mark_error(&project)? else {
                return Ok(project);
            };

            tx.execute(
                "UPDATE projects SET state = ?1, updated_at = ?2 WHERE id = ?3",
                params![new_state.as_str(), ts(&Utc::now()), project_id.to_string()],
            )?;
            let updated = load_project(&tx, project_id)?;
            tx.commit()?;

            debug!(%project_id, %reason, "Project marked as Error");
            Ok(updated)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewArtifact, Stage, StageName};
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_schema_bootstrap_is_repeatable() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("db").join("conductor.db");

        let project = Project::new();
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .create_project(&project, Some(&Idea::new(project.id, "A tool for bakers")))
                .await
                .unwrap();
        }

        let reopened = SqliteStore::open(&path).unwrap();
        let loaded = reopened.get_project(project.id).await.unwrap().unwrap();
        assert_eq!(loaded.stage, Stage::Idea);
    }

    #[tokio::test]
    async fn test_artifact_content_round_trips_as_json() {
        let store = SqliteStore::open_in_memory().unwrap();
        let project = Project::new();
        store
            .create_project(&project, Some(&Idea::new(project.id, "idea")))
            .await
            .unwrap();

        let commit = StageCommit::new(project.id, Stage::Idea, Stage::FeasibilityComplete)
            .with_artifact(NewArtifact::new(
                StageName::Feasibility,
                ArtifactType::FeasibilityAnalysisV1,
                json!({ "verdict": "go", "risks": [1, 2] }),
            ));
        store.commit_stage(commit).await.unwrap();

        let artifact = store
            .latest_artifact(project.id, ArtifactType::FeasibilityAnalysisV1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(artifact.content["risks"], json!([1, 2]));
        assert_eq!(artifact.stage, StageName::Feasibility);
    }

    #[tokio::test]
    async fn test_failed_commit_rolls_back() {
        let store = SqliteStore::open_in_memory().unwrap();
        let project = Project::new();
        store
            .create_project(&project, Some(&Idea::new(project.id, "idea")))
            .await
            .unwrap();

        // Two runs with the same id violate the primary key after the artifact insert
        let now = Utc::now();
        let run = Run::new(
            project.id,
            crate::domain::RunStep::Validate,
            crate::domain::RunStatus::Success,
            now,
            now,
        );
        let commit = StageCommit::new(project.id, Stage::Idea, Stage::FeasibilityComplete)
            .with_artifact(NewArtifact::new(
                StageName::Feasibility,
                ArtifactType::FeasibilityAnalysisV1,
                json!({}),
            ))
            .with_runs([run.clone(), run]);

        let err = store.commit_stage(commit).await.unwrap_err();
        assert!(matches!(err, PipelineError::Persistence(_)));

        assert!(store.list_artifacts(project.id).await.unwrap().is_empty());
        assert!(store.list_runs(project.id).await.unwrap().is_empty());
        let project = store.get_project(project.id).await.unwrap().unwrap();
        assert_eq!(project.stage, Stage::Idea);
    }
}
