//! Retry and concurrency policy for stage jobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::StageName;

/// Retry policy for failed jobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_concurrency() -> usize {
    5
}
fn default_job_timeout() -> u64 {
    300
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after a failed attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.base_delay_ms.min(self.max_delay_ms));
        }

        let delay =
            self.base_delay_ms as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Everything the worker pool needs to know about one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagePolicy {
    #[serde(flatten)]
    pub retry: RetryPolicy,

    /// Jobs of this stage processed at once, across all projects
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Upper bound on one attempt, including generation
    #[serde(default = "default_job_timeout")]
    pub job_timeout_seconds: u64,
}

impl Default for StagePolicy {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            concurrency: default_concurrency(),
            job_timeout_seconds: default_job_timeout(),
        }
    }
}

impl StagePolicy {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_seconds)
    }
}

/// Policies for every stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StagePolicies {
    #[serde(default)]
    pub feasibility: StagePolicy,
    #[serde(default)]
    pub planning: StagePolicy,
    #[serde(default)]
    pub execution: StagePolicy,
}

impl StagePolicies {
    pub fn get(&self, stage: StageName) -> &StagePolicy {
        match stage {
            StageName::Feasibility => &self.feasibility,
            StageName::Planning => &self.planning,
            StageName::Execution => &self.execution,
        }
    }

    /// Same policy for every stage
    pub fn uniform(policy: StagePolicy) -> Self {
        Self {
            feasibility: policy.clone(),
            planning: policy.clone(),
            execution: policy,
        }
    }
}
