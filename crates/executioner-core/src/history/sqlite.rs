//! C11 — SqliteHistoryStore: a concrete `HistoryStore` backed by SQLite.
//!
//! The scheduler calls this store synchronously from worker threads
//! (§5); this store owns a small current-thread Tokio runtime used only
//! to drive `sqlx::sqlite` queries via `block_on`, so callers never see
//! an `async` surface. Migrations are forward-only and idempotent,
//! guarded by a `schema_version` lock row (§9).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};

use crate::job::{JobStatus, RetryRecord, RunStatus};

use super::HistoryStore;

/// Ordered, forward-only migrations. Each statement is written to
/// tolerate re-application (`IF NOT EXISTS` / duplicate-column errors
/// ignored), matching the source's idempotent migration design.
const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        r#"
        CREATE TABLE IF NOT EXISTS run_summary (
            run_id INTEGER NOT NULL,
            attempt_id INTEGER NOT NULL,
            application_name TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT,
            status TEXT NOT NULL,
            total_jobs INTEGER NOT NULL,
            completed_jobs INTEGER NOT NULL DEFAULT 0,
            failed_jobs INTEGER NOT NULL DEFAULT 0,
            skipped_jobs INTEGER NOT NULL DEFAULT 0,
            exit_code INTEGER,
            working_dir TEXT,
            created_at TEXT NOT NULL DEFAULT (STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now')),
            PRIMARY KEY (run_id, attempt_id)
        )
        "#,
    ),
    (
        2,
        r#"
        CREATE TABLE IF NOT EXISTS job_history (
            run_id INTEGER NOT NULL,
            attempt_id INTEGER NOT NULL,
            id TEXT NOT NULL,
            status TEXT NOT NULL,
            duration_seconds REAL NOT NULL DEFAULT 0,
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            retry_history TEXT NOT NULL DEFAULT '[]',
            last_run TEXT NOT NULL,
            last_exit_code INTEGER,
            PRIMARY KEY (run_id, attempt_id, id)
        )
        "#,
    ),
];

pub struct SqliteHistoryStore {
    pool: SqlitePool,
    runtime: tokio::runtime::Runtime,
    // sqlx::SqlitePool serializes writers internally, but we keep an
    // explicit lock so multi-statement sequences (read-modify-write on
    // retry_history) are atomic per §5's "short transactions" guarantee.
    write_lock: Mutex<()>,
}

impl SqliteHistoryStore {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        let path = path.as_ref().to_path_buf();
        let pool = runtime.block_on(async move {
            let options = SqliteConnectOptions::new()
                .filename(&path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal)
                .busy_timeout(std::time::Duration::from_secs(5));
            SqlitePoolOptions::new().max_connections(4).connect_with(options).await
        })?;

        let store = SqliteHistoryStore { pool, runtime, write_lock: Mutex::new(()) };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> anyhow::Result<()> {
        self.runtime.block_on(async {
            sqlx::query("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY, applied_at TEXT NOT NULL)")
                .execute(&self.pool)
                .await?;

            let applied: Vec<i64> = sqlx::query("SELECT version FROM schema_version")
                .fetch_all(&self.pool)
                .await?
                .into_iter()
                .map(|row| row.get::<i64, _>("version"))
                .collect();

            for (version, statements) in MIGRATIONS {
                if applied.contains(version) {
                    continue;
                }
                let mut tx = self.pool.begin().await?;
                for stmt in statements.split(';').map(str::trim).filter(|s| !s.is_empty()) {
                    sqlx::query(stmt).execute(&mut *tx).await?;
                }
                sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (?, ?)")
                    .bind(*version)
                    .bind(Utc::now().to_rfc3339())
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
            }
            Ok::<_, anyhow::Error>(())
        })
    }
}

impl HistoryStore for SqliteHistoryStore {
    fn allocate_run_id(&self) -> anyhow::Result<i64> {
        let _guard = self.write_lock.lock().unwrap();
        self.runtime.block_on(async {
            let max: Option<i64> = sqlx::query("SELECT MAX(run_id) as m FROM run_summary")
                .fetch_one(&self.pool)
                .await?
                .get("m");
            Ok(max.unwrap_or(0) + 1)
        })
    }

    fn next_attempt_id(&self, run_id: i64) -> anyhow::Result<i64> {
        self.runtime.block_on(async {
            let max: Option<i64> = sqlx::query("SELECT MAX(attempt_id) as m FROM run_summary WHERE run_id = ?")
                .bind(run_id)
                .fetch_one(&self.pool)
                .await?
                .get("m");
            Ok(max.map(|m| m + 1).unwrap_or(1))
        })
    }

    fn open_run(
        &self,
        run_id: i64,
        attempt_id: i64,
        application_name: &str,
        start_time: DateTime<Utc>,
        total_jobs: i64,
        working_dir: Option<&str>,
    ) -> anyhow::Result<()> {
        self.runtime.block_on(async {
            sqlx::query(
                "INSERT INTO run_summary (run_id, attempt_id, application_name, start_time, status, total_jobs, working_dir)
                 VALUES (?, ?, ?, ?, 'RUNNING', ?, ?)",
            )
            .bind(run_id)
            .bind(attempt_id)
            .bind(application_name)
            .bind(start_time.to_rfc3339())
            .bind(total_jobs)
            .bind(working_dir)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

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
    ) -> anyhow::Result<()> {
        let status_str = match status {
            RunStatus::Running => "RUNNING",
            RunStatus::Success => "SUCCESS",
            RunStatus::Failed => "FAILED",
        };
        self.runtime.block_on(async {
            sqlx::query(
                "UPDATE run_summary SET end_time = ?, status = ?, completed_jobs = ?, failed_jobs = ?, skipped_jobs = ?, exit_code = ?
                 WHERE run_id = ? AND attempt_id = ?",
            )
            .bind(end_time.to_rfc3339())
            .bind(status_str)
            .bind(completed)
            .bind(failed)
            .bind(skipped)
            .bind(exit_code)
            .bind(run_id)
            .bind(attempt_id)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn record_job(
        &self,
        run_id: i64,
        attempt_id: i64,
        job_id: &str,
        status: JobStatus,
        last_run: DateTime<Utc>,
        duration_s: f64,
        exit_code: Option<i32>,
    ) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        self.runtime.block_on(async {
            sqlx::query(
                "INSERT INTO job_history (run_id, attempt_id, id, status, duration_seconds, last_run, last_exit_code)
                 VALUES (?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(run_id, attempt_id, id) DO UPDATE SET
                    status = excluded.status,
                    duration_seconds = excluded.duration_seconds,
                    last_run = excluded.last_run,
                    last_exit_code = excluded.last_exit_code",
            )
            .bind(run_id)
            .bind(attempt_id)
            .bind(job_id)
            .bind(status.as_str())
            .bind(duration_s)
            .bind(last_run.to_rfc3339())
            .bind(exit_code)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

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
    ) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        let history_json = serde_json::to_string(retry_history)?;
        self.runtime.block_on(async {
            sqlx::query(
                "INSERT INTO job_history (run_id, attempt_id, id, status, retry_count, retry_history, last_error, last_run, last_exit_code)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(run_id, attempt_id, id) DO UPDATE SET
                    status = excluded.status,
                    retry_count = excluded.retry_count,
                    retry_history = excluded.retry_history,
                    last_error = excluded.last_error,
                    last_run = excluded.last_run,
                    last_exit_code = excluded.last_exit_code",
            )
            .bind(run_id)
            .bind(attempt_id)
            .bind(job_id)
            .bind(status.as_str())
            .bind(retry_count)
            .bind(&history_json)
            .bind(reason)
            .bind(Utc::now().to_rfc3339())
            .bind(exit_code)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn get_previous_statuses(&self, run_id: i64) -> anyhow::Result<HashMap<String, JobStatus>> {
        self.runtime.block_on(async {
            // Cumulative latest status per job id across every attempt of
            // this run_id (§4.2), not just the rows of the run's single
            // latest attempt: a job not re-recorded in the latest attempt
            // must still carry forward whatever it last reached.
            let rows = sqlx::query(
                "SELECT id, status FROM job_history jh
                 WHERE run_id = ?
                   AND attempt_id = (
                     SELECT MAX(attempt_id) FROM job_history jh2
                     WHERE jh2.run_id = jh.run_id AND jh2.id = jh.id
                   )",
            )
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;

            let mut out = HashMap::new();
            for row in rows {
                let id: String = row.get("id");
                let status: String = row.get("status");
                if let Some(parsed) = parse_status(&status) {
                    out.insert(id, parsed);
                }
            }
            Ok(out)
        })
    }

    fn get_latest_exit_code(&self, run_id: i64, attempt_id: i64, job_id: &str) -> anyhow::Result<Option<i32>> {
        self.runtime.block_on(async {
            let row = sqlx::query("SELECT last_exit_code FROM job_history WHERE run_id = ? AND attempt_id = ? AND id = ?")
                .bind(run_id)
                .bind(attempt_id)
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row.and_then(|r| r.get("last_exit_code")))
        })
    }

    fn mark_jobs_successful(&self, run_id: i64, job_ids: &[String]) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        self.runtime.block_on(async {
            let attempt_id: i64 = sqlx::query("SELECT MAX(attempt_id) as m FROM run_summary WHERE run_id = ?")
                .bind(run_id)
                .fetch_one(&self.pool)
                .await?
                .get::<Option<i64>, _>("m")
                .unwrap_or(1);
            for job_id in job_ids {
                sqlx::query(
                    "INSERT INTO job_history (run_id, attempt_id, id, status, last_run)
                     VALUES (?, ?, ?, 'SUCCESS', ?)
                     ON CONFLICT(run_id, attempt_id, id) DO UPDATE SET status = 'SUCCESS'",
                )
                .bind(run_id)
                .bind(attempt_id)
                .bind(job_id)
                .bind(Utc::now().to_rfc3339())
                .execute(&self.pool)
                .await?;
            }
            Ok(())
        })
    }
}

fn parse_status(s: &str) -> Option<JobStatus> {
    Some(match s {
        "SUCCESS" => JobStatus::Success,
        "FAILED" => JobStatus::Failed,
        "ERROR" => JobStatus::Error,
        "TIMEOUT" => JobStatus::Timeout,
        "SKIPPED" => JobStatus::Skipped,
        "BLOCKED" => JobStatus::Blocked,
        "PRECHECK_FAILED" => JobStatus::PrecheckFailed,
        "POSTCHECK_FAILED" => JobStatus::PostcheckFailed,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_run_id_is_monotone() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteHistoryStore::open(dir.path().join("history.db")).unwrap();
        let first = store.allocate_run_id().unwrap();
        store.open_run(first, 1, "app", Utc::now(), 1, None).unwrap();
        let second = store.allocate_run_id().unwrap();
        assert!(second > first);
    }

    #[test]
    fn record_and_read_job_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteHistoryStore::open(dir.path().join("history.db")).unwrap();
        let run_id = store.allocate_run_id().unwrap();
        store.open_run(run_id, 1, "app", Utc::now(), 1, None).unwrap();
        store.record_job(run_id, 1, "A", JobStatus::Success, Utc::now(), 1.5, Some(0)).unwrap();
        let statuses = store.get_previous_statuses(run_id).unwrap();
        assert_eq!(statuses.get("A"), Some(&JobStatus::Success));
    }

    #[test]
    fn mark_jobs_successful_then_resume_skips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteHistoryStore::open(dir.path().join("history.db")).unwrap();
        let run_id = store.allocate_run_id().unwrap();
        store.open_run(run_id, 1, "app", Utc::now(), 1, None).unwrap();
        store.mark_jobs_successful(run_id, &["A".to_string()]).unwrap();
        let statuses = store.get_previous_statuses(run_id).unwrap();
        assert_eq!(statuses.get("A"), Some(&JobStatus::Success));
    }

    /// A job recorded in an earlier attempt but not re-recorded in the
    /// run's latest attempt must still carry its status forward — the
    /// contract is "latest status per job across all attempts", not
    /// "status as of the single latest attempt".
    #[test]
    fn previous_statuses_carry_forward_jobs_not_touched_by_latest_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteHistoryStore::open(dir.path().join("history.db")).unwrap();
        let run_id = store.allocate_run_id().unwrap();

        store.open_run(run_id, 1, "app", Utc::now(), 2, None).unwrap();
        store.record_job(run_id, 1, "A", JobStatus::Success, Utc::now(), 1.0, Some(0)).unwrap();
        store.record_job(run_id, 1, "B", JobStatus::Failed, Utc::now(), 1.0, Some(1)).unwrap();

        // Attempt 2 only touches B; A is never re-recorded there.
        let attempt2 = store.next_attempt_id(run_id).unwrap();
        store.open_run(run_id, attempt2, "app", Utc::now(), 2, None).unwrap();
        store.record_job(run_id, attempt2, "B", JobStatus::Success, Utc::now(), 1.0, Some(0)).unwrap();

        let statuses = store.get_previous_statuses(run_id).unwrap();
        assert_eq!(statuses.get("A"), Some(&JobStatus::Success));
        assert_eq!(statuses.get("B"), Some(&JobStatus::Success));
    }
}
