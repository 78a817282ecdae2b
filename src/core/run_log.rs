//! Append-only log of stage job outcomes.
//!
//! Records are newline-delimited JSON so the log can be inspected with
//! ordinary tools. Writers take an exclusive `fs2` lock so concurrent
//! workers never interleave lines.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use uuid::Uuid;

use crate::domain::StageName;

use super::processor::{OutcomeStatus, StageDetail, StageOutcome};

/// Final status of one job attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Completed,
    Skipped,
    Retrying,
    Failed,
}

/// One line of the run log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRunRecord {
    pub timestamp: DateTime<Utc>,
    pub project_id: Uuid,
    pub stage: StageName,
    pub status: RecordStatus,
    pub attempt: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validated: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeline_weeks: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phases: Option<usize>,

    #[serde(default)]
    pub tokens_input: u64,

    #[serde(default)]
    pub tokens_output: u64,

    #[serde(default)]
    pub tokens_total: u64,

    pub duration_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageRunRecord {
    /// Record a successful pass
    pub fn from_outcome(outcome: &StageOutcome, attempt: u32) -> Self {
        let (verdict, confidence, timeline_weeks, phases) = match &outcome.detail {
            StageDetail::Feasibility {
                verdict,
                confidence,
            } => (Some(verdict.clone()), Some(*confidence), None, None),
            StageDetail::Planning {
                timeline_weeks,
                phases,
            } => (None, None, Some(*timeline_weeks), Some(*phases)),
            StageDetail::Execution { .. } | StageDetail::None => (None, None, None, None),
        };

        Self {
            timestamp: Utc::now(),
            project_id: outcome.project_id,
            stage: outcome.stage,
            status: match outcome.status {
                OutcomeStatus::Completed => RecordStatus::Completed,
                OutcomeStatus::Skipped => RecordStatus::Skipped,
            },
            attempt,
            validated: Some(outcome.validated),
            verdict,
            confidence,
            timeline_weeks,
            phases,
            tokens_input: outcome.tokens.input,
            tokens_output: outcome.tokens.output,
            tokens_total: outcome.tokens.total(),
            duration_ms: outcome.duration.as_millis() as u64,
            error: None,
        }
    }

    /// Record a failed attempt
    pub fn failure(
        project_id: Uuid,
        stage: StageName,
        attempt: u32,
        retrying: bool,
        duration_ms: u64,
        error: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            project_id,
            stage,
            status: if retrying {
                RecordStatus::Retrying
            } else {
                RecordStatus::Failed
            },
            attempt,
            validated: None,
            verdict: None,
            confidence: None,
            timeline_weeks: None,
            phases: None,
            tokens_input: 0,
            tokens_output: 0,
            tokens_total: 0,
            duration_ms,
            error: Some(error.into()),
        }
    }
}

/// Totals for one stage
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageStats {
    pub count: u64,
    pub failed: u64,
    pub fallbacks: u64,
    pub tokens: u64,
    pub duration_ms: u64,
}

/// Totals for one feasibility verdict
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VerdictStats {
    pub count: u64,
    pub avg_confidence: f64,
}

/// Aggregate view over the whole log
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub total_runs: u64,
    pub failed_runs: u64,
    pub total_tokens: u64,
    pub total_duration_ms: u64,
    pub avg_tokens_per_run: u64,
    pub avg_duration_ms: u64,
    pub by_stage: BTreeMap<String, StageStats>,
    pub by_verdict: BTreeMap<String, VerdictStats>,
}

impl RunSummary {
    pub fn from_records(records: &[StageRunRecord]) -> Self {
        let mut summary = RunSummary::default();

        for record in records {
            summary.total_runs += 1;
            summary.total_tokens += record.tokens_total;
            summary.total_duration_ms += record.duration_ms;

            let failed = matches!(record.status, RecordStatus::Failed | RecordStatus::Retrying);
            if failed {
                summary.failed_runs += 1;
            }

            let stage = summary
                .by_stage
                .entry(record.stage.as_str().to_string())
                .or_default();
            stage.count += 1;
            stage.tokens += record.tokens_total;
            stage.duration_ms += record.duration_ms;
            if failed {
                stage.failed += 1;
            }
            if record.validated == Some(false) {
                stage.fallbacks += 1;
            }

            if let (Some(verdict), Some(confidence)) = (&record.verdict, record.confidence) {
                let stats = summary.by_verdict.entry(verdict.clone()).or_default();
                stats.count += 1;
                // running mean
                stats.avg_confidence += (confidence - stats.avg_confidence) / stats.count as f64;
            }
        }

        if summary.total_runs > 0 {
            summary.avg_tokens_per_run = summary.total_tokens / summary.total_runs;
            summary.avg_duration_ms = summary.total_duration_ms / summary.total_runs;
        }

        summary
    }
}

/// File-backed run log
#[derive(Debug, Clone)]
pub struct RunLog {
    path: PathBuf,
}

impl RunLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record under an exclusive file lock
    pub async fn append(&self, record: &StageRunRecord) -> Result<()> {
        let path = self.path.clone();
        let line = serde_json::to_string(record).context("Failed to serialize run record")?;

        tokio::task::spawn_blocking(move || -> Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create run log directory: {}", parent.display())
                })?;
            }

            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open run log: {}", path.display()))?;
            file.lock_exclusive()
                .context("Failed to acquire file lock on run log")?;

            let written = writeln!(file, "{}", line).context("Failed to write run record");
            let _ = file.unlock();
            written
        })
        .await
        .context("Run log writer task failed")?
    }

    /// Replay all records in order
    pub async fn records(&self) -> Result<Vec<StageRunRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.path)
            .await
            .with_context(|| format!("Failed to open run log: {}", self.path.display()))?;

        let mut lines = BufReader::new(file).lines();
        let mut records = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let record: StageRunRecord = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse run record: {}", line))?;
            records.push(record);
        }

        Ok(records)
    }

    pub async fn summary(&self) -> Result<RunSummary> {
        Ok(RunSummary::from_records(&self.records().await?))
    }
}
