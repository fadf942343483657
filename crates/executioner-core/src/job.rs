//! Data model: jobs, pipelines, runs, and per-attempt job history.
//!
//! Types here are the nouns the rest of the crate operates on. `Job` and
//! `Pipeline` are immutable once loaded; `Run` and `JobAttempt` are mutated
//! only through `StateManager` and `JobRunner` respectively.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One invocation of a named pre/post check with its parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckSpec {
    pub name: String,
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,
}

/// Terminal statuses we know how to reach and persist exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Success,
    Failed,
    Error,
    Timeout,
    Skipped,
    Blocked,
    PrecheckFailed,
    PostcheckFailed,
}

impl JobStatus {
    /// True for anything retry policy considers a "non-success" outcome.
    pub fn is_retry_eligible_kind(self) -> bool {
        matches!(self, JobStatus::Error | JobStatus::Failed | JobStatus::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Success => "SUCCESS",
            JobStatus::Failed => "FAILED",
            JobStatus::Error => "ERROR",
            JobStatus::Timeout => "TIMEOUT",
            JobStatus::Skipped => "SKIPPED",
            JobStatus::Blocked => "BLOCKED",
            JobStatus::PrecheckFailed => "PRECHECK_FAILED",
            JobStatus::PostcheckFailed => "POSTCHECK_FAILED",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry policy attached to a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay_s: f64,
    pub backoff_factor: f64,
    pub jitter_fraction: f64,
    pub max_total_retry_s: f64,
    pub retry_on_status: HashSet<RetryableStatus>,
    pub retry_on_exit_codes: HashSet<i32>,
}

/// The statuses `retry_on_status` may name (a subset of `JobStatus`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryableStatus {
    Error,
    Failed,
    Timeout,
}

impl RetryableStatus {
    pub fn matches(self, status: JobStatus) -> bool {
        matches!(
            (self, status),
            (RetryableStatus::Error, JobStatus::Error)
                | (RetryableStatus::Failed, JobStatus::Failed)
                | (RetryableStatus::Timeout, JobStatus::Timeout)
        )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 0,
            initial_delay_s: 30.0,
            backoff_factor: 1.5,
            jitter_fraction: 0.1,
            max_total_retry_s: 1800.0,
            retry_on_status: [RetryableStatus::Error, RetryableStatus::Failed, RetryableStatus::Timeout]
                .into_iter()
                .collect(),
            retry_on_exit_codes: [1].into_iter().collect(),
        }
    }
}

/// A single named job in a pipeline. Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Resolved timeout; `None` means "use the pipeline default".
    #[serde(default)]
    pub timeout_seconds: Option<i64>,
    #[serde(default)]
    pub dependencies: HashSet<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub pre_checks: Vec<CheckSpec>,
    #[serde(default)]
    pub post_checks: Vec<CheckSpec>,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
}

/// Security policy strictness: warn logs and allows, block refuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityPolicy {
    Warn,
    Block,
}

/// Security level gates which pattern tiers are enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    Low,
    Medium,
    High,
}

/// Inherited-shell-env filtering mode (`EnvResolver`, §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InheritShellEnv {
    All(bool),
    Default(String),
    Names(Vec<String>),
}

impl Default for InheritShellEnv {
    fn default() -> Self {
        InheritShellEnv::All(true)
    }
}

/// A parsed, validated pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub application_name: String,
    pub jobs: Vec<Job>,
    #[serde(default)]
    pub app_env: HashMap<String, String>,
    #[serde(default)]
    pub default_timeout: Option<i64>,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default = "default_max_workers")]
    pub max_workers: i64,
    #[serde(default)]
    pub allow_shell: bool,
    #[serde(default = "default_security_policy")]
    pub security_policy: SecurityPolicy,
    #[serde(default = "default_security_level")]
    pub security_level: SecurityLevel,
    #[serde(default)]
    pub inherit_shell_env: InheritShellEnv,
}

fn default_max_workers() -> i64 {
    1
}
fn default_security_policy() -> SecurityPolicy {
    SecurityPolicy::Warn
}
fn default_security_level() -> SecurityLevel {
    SecurityLevel::Medium
}

impl Pipeline {
    pub fn job(&self, id: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == id)
    }

    /// `max_workers <= 0` is treated as 1 (boundary behavior, §8).
    pub fn effective_max_workers(&self) -> usize {
        if self.max_workers <= 0 {
            1
        } else {
            self.max_workers as usize
        }
    }
}

/// Run-level terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Success => "SUCCESS",
            RunStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// One attempt of a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: i64,
    pub attempt_id: i64,
    pub application_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub total_jobs: i64,
    pub completed_jobs: i64,
    pub failed_jobs: i64,
    pub skipped_jobs: i64,
    pub exit_code: Option<i32>,
    pub working_dir: Option<String>,
}

/// One recorded retry attempt within a `JobAttempt`'s history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryRecord {
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
    pub duration_s: f64,
    pub success: bool,
    pub exit_code: Option<i32>,
}

/// Per-job outcome within one `(run_id, attempt_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAttempt {
    pub run_id: i64,
    pub attempt_id: i64,
    pub job_id: String,
    pub status: JobStatus,
    pub last_run_time: DateTime<Utc>,
    pub duration_s: f64,
    pub retry_count: u32,
    pub retry_history: Vec<RetryRecord>,
    pub last_error: Option<String>,
    pub last_exit_code: Option<i32>,
}
