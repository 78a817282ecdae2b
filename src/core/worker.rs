//! Per-stage worker pools.
//!
//! Each stage gets its own claim loop, and a `Semaphore` sized to the
//! stage's concurrency bounds how many of its jobs run at once across all
//! projects. Loops stop when the shutdown channel flips and wait for their
//! in-flight jobs before returning.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::domain::StageName;

use super::error::PipelineError;
use super::orchestrator::{JobReport, Orchestrator};

/// Counts from a drain pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub completed: usize,
    pub skipped: usize,
    pub retried: usize,
    pub failed: usize,
}

impl DrainReport {
    fn add(&mut self, report: &JobReport) {
        match report {
            JobReport::Completed(outcome) if outcome.is_skipped() => self.skipped += 1,
            JobReport::Completed(_) => self.completed += 1,
            JobReport::Retrying { .. } => self.retried += 1,
            JobReport::Failed(_) => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.completed + self.skipped + self.retried + self.failed
    }
}

pub struct WorkerPool {
    orchestrator: Arc<Orchestrator>,
    poll_interval: Duration,
}

impl WorkerPool {
    pub fn new(orchestrator: Arc<Orchestrator>, poll_interval: Duration) -> Self {
        Self {
            orchestrator,
            poll_interval,
        }
    }

    /// Put jobs abandoned by a crashed worker back on the queue.
    ///
    /// A job counts as abandoned once it has been active for twice the
    /// stage's job timeout.
    pub async fn recover_stalled(&self) -> Result<usize, PipelineError> {
        let mut requeued = 0;
        for stage in StageName::ALL {
            let timeout = self.orchestrator.jobs().policy(stage).job_timeout();
            let grace = chrono::Duration::from_std(timeout * 2)
                .unwrap_or_else(|_| chrono::Duration::zero());
            let ids = self
                .orchestrator
                .jobs()
                .queue()
                .requeue_stalled(stage, Utc::now() - grace)
                .await?;
            if !ids.is_empty() {
                warn!(%stage, count = ids.len(), "Requeued stalled jobs");
            }
            requeued += ids.len();
        }
        Ok(requeued)
    }

    /// Start one claim loop per stage; they run until `shutdown` turns true
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        StageName::ALL
            .into_iter()
            .map(|stage| {
                let orchestrator = self.orchestrator.clone();
                let shutdown = shutdown.clone();
                let poll_interval = self.poll_interval;
                tokio::spawn(stage_loop(orchestrator, stage, poll_interval, shutdown))
            })
            .collect()
    }

    /// Process jobs until nothing is left that this process can run.
    ///
    /// Waits out retry backoff for queued jobs. Jobs held active by another
    /// process are left alone.
    pub async fn run_until_idle(&self) -> Result<DrainReport, PipelineError> {
        let mut report = DrainReport::default();

        loop {
            let mut set = JoinSet::new();

            for stage in StageName::ALL {
                let concurrency = self.orchestrator.jobs().policy(stage).concurrency.max(1);
                for _ in 0..concurrency {
                    let Some(job) = self.orchestrator.claim(stage).await? else {
                        break;
                    };
                    let orchestrator = self.orchestrator.clone();
                    set.spawn(async move { orchestrator.execute_job(job).await });
                }
            }

            if set.is_empty() {
                match self.next_wakeup().await? {
                    Some(wait) => {
                        debug!(wait_ms = wait.as_millis() as u64, "Waiting for retry backoff");
                        tokio::time::sleep(wait).await;
                        continue;
                    }
                    None => break,
                }
            }

            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(Ok(job_report)) => report.add(&job_report),
                    Ok(Err(e)) => return Err(e),
                    Err(e) => return Err(PipelineError::Queue(format!("job task failed: {}", e))),
                }
            }
        }

        info!(
            completed = report.completed,
            skipped = report.skipped,
            retried = report.retried,
            failed = report.failed,
            "Queue drained"
        );
        Ok(report)
    }

    /// Time until the earliest queued job becomes available, if any is queued
    async fn next_wakeup(&self) -> Result<Option<Duration>, PipelineError> {
        let mut earliest = None;
        for stage in StageName::ALL {
            let next = self
                .orchestrator
                .jobs()
                .queue()
                .next_available_at(stage)
                .await?;
            earliest = match (earliest, next) {
                (Some(a), Some(b)) => Some(std::cmp::min(a, b)),
                (a, b) => a.or(b),
            };
        }

        Ok(earliest.map(|at| {
            (at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .max(Duration::from_millis(1))
        }))
    }
}

async fn stage_loop(
    orchestrator: Arc<Orchestrator>,
    stage: StageName,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let concurrency = orchestrator.jobs().policy(stage).concurrency.max(1);
    let semaphore = Arc::new(Semaphore::new(concurrency));
    info!(%stage, concurrency, "Worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let permit = tokio::select! {
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = shutdown.changed() => break,
        };

        match orchestrator.claim(stage).await {
            Ok(Some(job)) => {
                let orchestrator = orchestrator.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let job_id = job.id.clone();
                    if let Err(e) = orchestrator.execute_job(job).await {
                        error!(%job_id, error = %e, "Failed to settle job");
                    }
                });
            }
            Ok(None) => {
                drop(permit);
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = shutdown.changed() => break,
                }
            }
            Err(e) => {
                drop(permit);
                warn!(%stage, error = %e, "Claim failed");
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
    }

    // wait for in-flight jobs
    let _ = semaphore.acquire_many(concurrency as u32).await;
    info!(%stage, "Worker stopped");
}
