//! C5 — StateManager: run lifecycle (start/finish), resume setup, skip
//! computation, timing, and exit code.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;

use crate::history::HistoryStore;
use crate::job::{JobStatus, Pipeline, Run, RunStatus};

/// Options governing how a run's skip set is computed on resume.
#[derive(Debug, Clone, Default)]
pub struct ResumeOptions {
    pub resume_from: Option<i64>,
    pub resume_failed_only: bool,
    pub explicit_skip: HashSet<String>,
}

pub struct StateManager {
    store: Arc<dyn HistoryStore>,
}

impl StateManager {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        StateManager { store }
    }

    /// Allocate a fresh `run_id` for a new run, or reuse `resume_from`'s
    /// `run_id` for a resume; always allocates a fresh `attempt_id`.
    pub fn start_run(&self, pipeline: &Pipeline, resume: &ResumeOptions, working_dir: Option<&str>) -> anyhow::Result<Run> {
        let run_id = match resume.resume_from {
            Some(id) => id,
            None => self.store.allocate_run_id()?,
        };
        let attempt_id = self.store.next_attempt_id(run_id)?;
        let start_time = Utc::now();
        self.store.open_run(run_id, attempt_id, &pipeline.application_name, start_time, pipeline.jobs.len() as i64, working_dir)?;
        Ok(Run {
            run_id,
            attempt_id,
            application_name: pipeline.application_name.clone(),
            start_time,
            end_time: None,
            status: RunStatus::Running,
            total_jobs: pipeline.jobs.len() as i64,
            completed_jobs: 0,
            failed_jobs: 0,
            skipped_jobs: 0,
            exit_code: None,
            working_dir: working_dir.map(str::to_string),
        })
    }

    /// Compute which jobs should be skipped for this attempt, per §4.5:
    /// - previous status SUCCESS -> always skip.
    /// - `resume_failed_only` and previous in {FAILED, ERROR, TIMEOUT} -> re-run.
    /// - not `resume_failed_only` and previous not in {FAILED, ERROR, TIMEOUT} -> skip.
    pub fn compute_skip_set(&self, pipeline: &Pipeline, resume: &ResumeOptions) -> anyhow::Result<HashSet<String>> {
        let mut skip: HashSet<String> = resume.explicit_skip.clone();
        let Some(run_id) = resume.resume_from else {
            return Ok(skip);
        };
        let previous = self.store.get_previous_statuses(run_id)?;
        for job in &pipeline.jobs {
            let Some(status) = previous.get(&job.id) else { continue };
            match status {
                // A prior SKIPPED only ever results from an earlier real
                // SUCCESS carried forward through a resume; treat it the
                // same as SUCCESS so it doesn't get re-run on a later
                // resume-failed-only attempt.
                JobStatus::Success | JobStatus::Skipped => {
                    skip.insert(job.id.clone());
                }
                JobStatus::Failed | JobStatus::Error | JobStatus::Timeout => {
                    if !resume.resume_failed_only {
                        skip.insert(job.id.clone());
                    }
                }
                _ => {
                    if !resume.resume_failed_only {
                        skip.insert(job.id.clone());
                    }
                }
            }
        }
        Ok(skip)
    }

    /// Terminal status is SUCCESS iff `exit_code == 0` and no job is left
    /// uncompleted (i.e. every job reached completed/skipped or the run
    /// is being closed under fail-fast with at least one failure).
    pub fn finish_run(
        &self,
        run: &Run,
        exit_code: i32,
        completed: i64,
        failed: i64,
        skipped: i64,
    ) -> anyhow::Result<RunStatus> {
        let status = if exit_code == 0 && failed == 0 { RunStatus::Success } else { RunStatus::Failed };
        self.store.close_run(run.run_id, run.attempt_id, Utc::now(), status, completed, failed, skipped, exit_code)?;
        Ok(status)
    }

    pub fn store(&self) -> &Arc<dyn HistoryStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::sqlite::SqliteHistoryStore;
    use crate::job::Job;

    fn pipeline() -> Pipeline {
        Pipeline {
            application_name: "app".into(),
            jobs: vec![
                Job {
                    id: "A".into(),
                    command: "true".into(),
                    description: None,
                    timeout_seconds: None,
                    dependencies: Default::default(),
                    env: Default::default(),
                    pre_checks: vec![],
                    post_checks: vec![],
                    retry_policy: Default::default(),
                },
                Job {
                    id: "B".into(),
                    command: "false".into(),
                    description: None,
                    timeout_seconds: None,
                    dependencies: Default::default(),
                    env: Default::default(),
                    pre_checks: vec![],
                    post_checks: vec![],
                    retry_policy: Default::default(),
                },
            ],
            app_env: Default::default(),
            default_timeout: None,
            parallel: false,
            max_workers: 1,
            allow_shell: false,
            security_policy: crate::job::SecurityPolicy::Warn,
            security_level: crate::job::SecurityLevel::Medium,
            inherit_shell_env: Default::default(),
        }
    }

    #[test]
    fn resume_failed_only_reruns_failures_and_skips_successes() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn HistoryStore> = Arc::new(SqliteHistoryStore::open(dir.path().join("h.db")).unwrap());
        let sm = StateManager::new(store.clone());
        let p = pipeline();
        let resume = ResumeOptions::default();
        let run = sm.start_run(&p, &resume, None).unwrap();
        store.record_job(run.run_id, run.attempt_id, "A", JobStatus::Success, Utc::now(), 1.0, Some(0)).unwrap();
        store.record_job(run.run_id, run.attempt_id, "B", JobStatus::Failed, Utc::now(), 1.0, Some(1)).unwrap();

        let resume2 = ResumeOptions { resume_from: Some(run.run_id), resume_failed_only: true, explicit_skip: Default::default() };
        let skip = sm.compute_skip_set(&p, &resume2).unwrap();
        assert!(skip.contains("A"));
        assert!(!skip.contains("B"));
    }

    /// A job already SKIPPED on a prior resume (because it had truly
    /// succeeded before that) must stay skipped on a later
    /// resume-failed-only attempt instead of being re-run.
    #[test]
    fn skipped_carries_forward_across_repeated_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn HistoryStore> = Arc::new(SqliteHistoryStore::open(dir.path().join("h.db")).unwrap());
        let sm = StateManager::new(store.clone());
        let p = pipeline();

        let run1 = sm.start_run(&p, &ResumeOptions::default(), None).unwrap();
        store.record_job(run1.run_id, run1.attempt_id, "A", JobStatus::Success, Utc::now(), 1.0, Some(0)).unwrap();
        store.record_job(run1.run_id, run1.attempt_id, "B", JobStatus::Failed, Utc::now(), 1.0, Some(1)).unwrap();

        let resume2 = ResumeOptions { resume_from: Some(run1.run_id), resume_failed_only: true, explicit_skip: Default::default() };
        let run2 = sm.start_run(&p, &resume2, None).unwrap();
        store.record_job(run2.run_id, run2.attempt_id, "A", JobStatus::Skipped, Utc::now(), 0.0, None).unwrap();
        store.record_job(run2.run_id, run2.attempt_id, "B", JobStatus::Failed, Utc::now(), 1.0, Some(1)).unwrap();

        let resume3 = ResumeOptions { resume_from: Some(run1.run_id), resume_failed_only: true, explicit_skip: Default::default() };
        let skip = sm.compute_skip_set(&p, &resume3).unwrap();
        assert!(skip.contains("A"));
        assert!(!skip.contains("B"));
    }
}
