//! C2 — HistoryStore: the narrow interface the core reads and writes
//! through. Concrete storage (SQLite) lives in `history::sqlite`.

pub mod sqlite;

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::job::{JobStatus, RetryRecord, RunStatus};

/// Durable, per-call-atomic operations the scheduler needs from a
/// history backend. Implementations must serialize concurrent writers
/// and reflect all prior committed writes to subsequent readers.
pub trait HistoryStore: Send + Sync {
    /// Next integer greater than any `run_id` this store has ever seen,
    /// across every application sharing the store (global monotone,
    /// per the resolved Open Question in DESIGN.md).
    fn allocate_run_id(&self) -> anyhow::Result<i64>;

    /// `max(attempt_id) + 1` for `run_id`, or `1` if none exists yet.
    fn next_attempt_id(&self, run_id: i64) -> anyhow::Result<i64>;

    #[allow(clippy::too_many_arguments)]
    fn open_run(
        &self,
        run_id: i64,
        attempt_id: i64,
        application_name: &str,
        start_time: DateTime<Utc>,
        total_jobs: i64,
        working_dir: Option<&str>,
    ) -> anyhow::Result<()>;

    #[allow(clippy::too_many_arguments)]
    fn close_run(
        &self,
        run_id: i64,
        attempt_id: i64,
        end_time: DateTime<Utc>,
        status: RunStatus,
        completed: i64,
        failed: i64,
        skipped: i64,
        exit_code: i32,
    ) -> anyhow::Result<()>;

    /// Upsert the terminal (or in-flight) status for one job.
    #[allow(clippy::too_many_arguments)]
    fn record_job(
        &self,
        run_id: i64,
        attempt_id: i64,
        job_id: &str,
        status: JobStatus,
        last_run: DateTime<Utc>,
        duration_s: f64,
        exit_code: Option<i32>,
    ) -> anyhow::Result<()>;

    #[allow(clippy::too_many_arguments)]
    fn record_retry(
        &self,
        run_id: i64,
        attempt_id: i64,
        job_id: &str,
        retry_count: u32,
        retry_history: &[RetryRecord],
        status: JobStatus,
        reason: Option<&str>,
        exit_code: Option<i32>,
    ) -> anyhow::Result<()>;

    /// Cumulative latest status per job across every attempt of
    /// `run_id`, used to compute resume-skip (§4.5).
    fn get_previous_statuses(&self, run_id: i64) -> anyhow::Result<HashMap<String, JobStatus>>;

    fn get_latest_exit_code(&self, run_id: i64, attempt_id: i64, job_id: &str) -> anyhow::Result<Option<i32>>;

    /// Manual remediation: mark jobs successful so a future resume skips
    /// them without actually having run them.
    fn mark_jobs_successful(&self, run_id: i64, job_ids: &[String]) -> anyhow::Result<()>;
}
