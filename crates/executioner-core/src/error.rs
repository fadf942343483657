//! Closed error kinds the core surfaces to callers (§7).
//!
//! `ExecutionError` is the discriminable, pattern-matchable error a caller
//! needs to decide fatal-vs-retryable-vs-logged-and-continue. Diagnostic
//! detail that nobody branches on travels as `anyhow::Error` instead.

use thiserror::Error;

/// One of the five error kinds the specification names.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// Invalid schema, bad types, or a missing required field. Fatal
    /// before any job is dispatched.
    #[error("invalid pipeline configuration: {0}")]
    Config(String),

    /// A cycle or a missing dependency in the job graph. Fatal unless
    /// continue-on-error is set (and even then, only missing deps may be
    /// tolerated — cycles are always fatal).
    #[error("dependency graph error: {0}")]
    Graph(String),

    /// Command failure, timeout, a failed check, or a security block for
    /// one job. Carries the job id so a caller can attribute it.
    #[error("job {job_id} failed: {reason}")]
    Job { job_id: String, reason: String },

    /// Could not spawn the process or open its log file. Treated like a
    /// `Job` error for the job in question.
    #[error("resource error running job {job_id}: {reason}")]
    Resource { job_id: String, reason: String },

    /// A history store operation failed. Write failures are logged and
    /// the run continues; read failures at resume setup are fatal for a
    /// resume (but not for a fresh run).
    #[error("history store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl ExecutionError {
    /// Whether this error kind should halt dispatch before any job runs.
    pub fn is_fatal_before_run(&self) -> bool {
        matches!(self, ExecutionError::Config(_) | ExecutionError::Graph(_))
    }
}
