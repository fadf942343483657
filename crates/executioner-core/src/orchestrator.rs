//! C6 — Orchestrator: sequential and parallel execution loops, worker
//! pool, signal handling, and dry-run planning.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use crate::checks::CheckRegistry;
use crate::env::EnvResolver;
use crate::graph::GraphAnalyzer;
use crate::job::{JobStatus, Pipeline, RunStatus};
use crate::notify::{NoopNotificationSink, NotificationSink, RunOutcome};
use crate::queue::QueueManager;
use crate::runner::{JobLogSink, JobRunner, NullLogSink};
use crate::state::{ResumeOptions, StateManager};

const SHUTDOWN_DRAIN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    pub dry_run: bool,
    pub continue_on_error: bool,
    pub cli_env: HashMap<String, String>,
    pub resume: ResumeOptions,
    pub log_dir: Option<PathBuf>,
    pub working_dir: Option<String>,
}

/// Final result of one orchestrator run, enough to compute the process
/// exit code and print the summary block (§7).
pub struct RunReport {
    pub run_id: i64,
    pub attempt_id: i64,
    pub status: RunStatus,
    pub exit_code: i32,
    pub dispatch_order: Vec<String>,
    pub completed: Vec<String>,
    pub failed: Vec<(String, Option<String>)>,
    pub skipped: Vec<String>,
}

/// Writes a job's streamed output to `<log_dir>/<job_id>.log`.
struct FileLogSink {
    file: Mutex<File>,
}

impl FileLogSink {
    fn create(dir: &Path, job_id: &str) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let file = File::create(dir.join(format!("{job_id}.log")))?;
        Ok(FileLogSink { file: Mutex::new(file) })
    }
}

impl JobLogSink for FileLogSink {
    fn write_line(&self, line: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "{line}");
        }
    }
}

pub struct Orchestrator {
    pipeline: Pipeline,
    state: StateManager,
    checks: CheckRegistry,
    notifier: Arc<dyn NotificationSink>,
    interrupted: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(pipeline: Pipeline, state: StateManager) -> Self {
        Orchestrator {
            pipeline,
            state,
            checks: CheckRegistry::with_builtins(),
            notifier: Arc::new(NoopNotificationSink),
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_checks(mut self, checks: CheckRegistry) -> Self {
        self.checks = checks;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Install a process-wide SIGINT handler that flips the cooperative
    /// interrupt flag instead of killing the process outright. The
    /// in-flight job is never killed by this; it is left to finish or
    /// hit its own timeout, and the queue stops dispatching new work.
    pub fn install_signal_handler(&self) -> anyhow::Result<()> {
        let flag = self.interrupted.clone();
        ctrlc::set_handler(move || {
            flag.store(true, Ordering::SeqCst);
        })?;
        Ok(())
    }

    pub fn interrupted_flag(&self) -> Arc<AtomicBool> {
        self.interrupted.clone()
    }

    pub fn run(&self, options: &ExecutionOptions) -> anyhow::Result<RunReport> {
        let analyzer = GraphAnalyzer::new(&self.pipeline);

        let missing = analyzer.missing_dependencies();
        if !missing.is_empty() && !options.continue_on_error {
            anyhow::bail!("missing dependencies: {missing:?}");
        }
        if let Some(cycle) = analyzer.find_cycle() {
            anyhow::bail!("dependency cycle detected: {}", cycle.join(" -> "));
        }

        let dispatch_order = analyzer.topological_order().ok_or_else(|| anyhow::anyhow!("graph is not acyclic"))?;

        if options.dry_run {
            return Ok(self.plan_dry_run(&dispatch_order, options));
        }

        let run = self.state.start_run(&self.pipeline, &options.resume, options.working_dir.as_deref())?;
        let skip_set = self.state.compute_skip_set(&self.pipeline, &options.resume)?;

        let queue = Arc::new(QueueManager::new(&self.pipeline));
        queue.set_skip_jobs(&skip_set);
        for id in &skip_set {
            if let Err(e) = self.state.store().record_job(run.run_id, run.attempt_id, id, JobStatus::Skipped, chrono::Utc::now(), 0.0, None) {
                warn!(job_id = %id, error = %e, "failed to record skipped job");
            }
        }
        queue.seed_initial();

        let completed = Arc::new(Mutex::new(Vec::<String>::new()));
        let failed = Arc::new(Mutex::new(Vec::<(String, Option<String>)>::new()));

        if self.pipeline.parallel {
            self.run_parallel(run.run_id, run.attempt_id, &queue, options, &completed, &failed)?;
        } else {
            self.run_sequential(run.run_id, run.attempt_id, &queue, options, &completed, &failed)?;
        }

        let snap = queue.snapshot();
        {
            let mut failed_guard = failed.lock().unwrap();
            let already_recorded: HashSet<String> = failed_guard.iter().map(|(id, _)| id.clone()).collect();

            // Jobs fail-fast transitively marked failed in QueueManager
            // (never dispatched, so `run_one_job` never recorded them)
            // still need exactly one terminal status persisted and must
            // surface in the report (invariant 2).
            for id in &snap.failed {
                if already_recorded.contains(id) {
                    continue;
                }
                let reason = queue
                    .failed_reason(id)
                    .unwrap_or_else(|| "blocked: an upstream dependency failed".to_string());
                if let Err(e) =
                    self.state.store().record_job(run.run_id, run.attempt_id, id, JobStatus::Failed, chrono::Utc::now(), 0.0, None)
                {
                    warn!(job_id = %id, error = %e, "failed to record transitively failed job");
                }
                failed_guard.push((id.clone(), Some(reason)));
            }

            for id in &snap.pending {
                if let Err(e) = self.state.store().record_job(
                    run.run_id,
                    run.attempt_id,
                    id,
                    JobStatus::Blocked,
                    chrono::Utc::now(),
                    0.0,
                    None,
                ) {
                    warn!(job_id = %id, error = %e, "failed to record blocked job");
                }
                failed_guard.push((id.clone(), Some("blocked: an upstream dependency failed".to_string())));
            }
        }

        let completed = completed.lock().unwrap().clone();
        let failed = failed.lock().unwrap().clone();
        let skipped: Vec<String> = skip_set.into_iter().collect();

        let exit_code = if failed.is_empty() { 0 } else { 1 };
        let status = self.state.finish_run(
            &run,
            exit_code,
            snap.completed.len() as i64,
            failed.len() as i64,
            snap.skipped.len() as i64,
        )?;

        self.notifier.notify(&RunOutcome {
            application_name: &self.pipeline.application_name,
            run_id: run.run_id,
            attempt_id: run.attempt_id,
            status,
            exit_code,
            completed: &completed,
            failed: &failed,
            skipped: &skipped,
        });

        Ok(RunReport { run_id: run.run_id, attempt_id: run.attempt_id, status, exit_code, dispatch_order, completed, failed, skipped })
    }

    fn plan_dry_run(&self, dispatch_order: &[String], options: &ExecutionOptions) -> RunReport {
        let skip_set = self
            .state
            .compute_skip_set(&self.pipeline, &options.resume)
            .unwrap_or_default();
        info!(application = %self.pipeline.application_name, "dry run: execution plan");
        for id in dispatch_order {
            if skip_set.contains(id) {
                info!(job_id = %id, "skip (already succeeded / resume policy)");
            } else {
                info!(job_id = %id, "would run");
            }
        }
        RunReport {
            run_id: 0,
            attempt_id: 0,
            status: RunStatus::Success,
            exit_code: 0,
            dispatch_order: dispatch_order.to_vec(),
            completed: vec![],
            failed: vec![],
            skipped: skip_set.into_iter().collect(),
        }
    }

    fn run_one_job(
        &self,
        job_id: &str,
        run_id: i64,
        attempt_id: i64,
        options: &ExecutionOptions,
    ) -> (JobStatus, Option<String>) {
        let job = self.pipeline.job(job_id).expect("queued job exists in pipeline");

        let env = match EnvResolver::resolve(
            &self.pipeline.inherit_shell_env,
            &std::env::vars().collect(),
            &self.pipeline.app_env,
            &job.env,
            &options.cli_env,
        ) {
            Ok(e) => e,
            Err(e) => {
                let reason = format!("environment resolution failed: {e}");
                if let Err(store_err) = self.state.store().record_job(run_id, attempt_id, job_id, JobStatus::Error, chrono::Utc::now(), 0.0, None) {
                    warn!(job_id = %job_id, error = %store_err, "failed to persist job outcome");
                }
                return (JobStatus::Error, Some(reason));
            }
        };

        let log_sink: Arc<dyn JobLogSink> = match &options.log_dir {
            Some(dir) => match FileLogSink::create(dir, job_id) {
                Ok(sink) => Arc::new(sink),
                Err(_) => Arc::new(NullLogSink),
            },
            None => Arc::new(NullLogSink),
        };

        let runner = JobRunner {
            job,
            pipeline: &self.pipeline,
            env,
            checks: &self.checks,
            log_sink,
            interrupted: self.interrupted.clone(),
            working_dir: options.working_dir.clone(),
        };
        let outcome = runner.run();

        let record_result = if outcome.retry_count > 0 {
            self.state.store().record_retry(
                run_id,
                attempt_id,
                job_id,
                outcome.retry_count,
                &outcome.retry_history,
                outcome.status,
                outcome.last_error.as_deref(),
                outcome.last_exit_code,
            )
        } else {
            self.state.store().record_job(
                run_id,
                attempt_id,
                job_id,
                outcome.status,
                chrono::Utc::now(),
                outcome.duration_s,
                outcome.last_exit_code,
            )
        };
        if let Err(e) = record_result {
            warn!(job_id = %job_id, error = %e, "failed to persist job outcome");
        }

        (outcome.status, outcome.last_error)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_sequential(
        &self,
        run_id: i64,
        attempt_id: i64,
        queue: &Arc<QueueManager>,
        options: &ExecutionOptions,
        completed: &Arc<Mutex<Vec<String>>>,
        failed: &Arc<Mutex<Vec<(String, Option<String>)>>>,
    ) -> anyhow::Result<()> {
        loop {
            if self.interrupted.load(Ordering::SeqCst) {
                break;
            }
            let Some(job_id) = queue.next_ready(Duration::from_millis(100)) else {
                if queue.is_empty_and_idle() {
                    break;
                }
                continue;
            };
            queue.mark_active(&job_id);
            let (status, reason) = self.run_one_job(&job_id, run_id, attempt_id, options);

            if status == JobStatus::Success || status == JobStatus::Skipped {
                queue.mark_completed(&job_id);
                completed.lock().unwrap().push(job_id.clone());
                queue.enqueue_dependents(&job_id, false, false);
            } else {
                queue.mark_failed(&job_id, reason.clone());
                failed.lock().unwrap().push((job_id.clone(), reason));
                let fail_fast = !options.continue_on_error;
                queue.enqueue_dependents(&job_id, fail_fast, false);
                if fail_fast {
                    break;
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn run_parallel(
        &self,
        run_id: i64,
        attempt_id: i64,
        queue: &Arc<QueueManager>,
        options: &ExecutionOptions,
        completed: &Arc<Mutex<Vec<String>>>,
        failed: &Arc<Mutex<Vec<(String, Option<String>)>>>,
    ) -> anyhow::Result<()> {
        let max_workers = self.pipeline.effective_max_workers();

        std::thread::scope(|scope| {
            let mut handles: Vec<(String, std::thread::JoinHandle<()>)> = Vec::new();

            loop {
                handles.retain(|(_, h)| !h.is_finished());

                if self.interrupted.load(Ordering::SeqCst) {
                    break;
                }

                let mut submitted = false;
                while handles.len() < max_workers {
                    let Some(job_id) = queue.next_ready(Duration::from_millis(50)) else { break };
                    submitted = true;
                    queue.mark_active(&job_id);
                    let queue = queue.clone();
                    let completed = completed.clone();
                    let failed = failed.clone();
                    let job_id_owned = job_id.clone();
                    let handle = scope.spawn(move || {
                        let (status, reason) = self.run_one_job(&job_id_owned, run_id, attempt_id, options);
                        if status == JobStatus::Success || status == JobStatus::Skipped {
                            queue.mark_completed(&job_id_owned);
                            completed.lock().unwrap().push(job_id_owned.clone());
                            queue.enqueue_dependents(&job_id_owned, false, false);
                        } else {
                            queue.mark_failed(&job_id_owned, reason.clone());
                            failed.lock().unwrap().push((job_id_owned.clone(), reason));
                            let fail_fast = !options.continue_on_error;
                            queue.enqueue_dependents(&job_id_owned, fail_fast, false);
                        }
                    });
                    handles.push((job_id, handle));
                }

                if handles.is_empty() && queue.is_empty_and_idle() {
                    break;
                }

                if !submitted {
                    std::thread::sleep(Duration::from_millis(100));
                }

                if !options.continue_on_error && !failed.lock().unwrap().is_empty() {
                    self.interrupted.store(true, Ordering::SeqCst);
                }
            }

            // Shutdown: bounded drain, then abandon stragglers. An
            // abandoned job is recorded FAILED with a distinguishing
            // reason; there is no separate terminal status for it.
            let drain_deadline = std::time::Instant::now() + SHUTDOWN_DRAIN;
            while handles.iter().any(|(_, h)| !h.is_finished()) && std::time::Instant::now() < drain_deadline {
                std::thread::sleep(Duration::from_millis(100));
            }
            for (job_id, h) in handles.into_iter() {
                if h.is_finished() {
                    let _ = h.join();
                } else {
                    warn!(job_id = %job_id, "worker did not finish within shutdown drain; abandoning");
                    let reason = "abandoned: shutdown drain expired".to_string();
                    if let Err(e) = self.state.store().record_job(
                        run_id,
                        attempt_id,
                        &job_id,
                        JobStatus::Failed,
                        chrono::Utc::now(),
                        SHUTDOWN_DRAIN.as_secs_f64(),
                        None,
                    ) {
                        warn!(job_id = %job_id, error = %e, "failed to record abandoned job");
                    }
                    failed.lock().unwrap().push((job_id, Some(reason)));
                }
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::sqlite::SqliteHistoryStore;
    use crate::job::{Job, SecurityLevel, SecurityPolicy};
    use std::sync::Arc as StdArc;

    fn pipeline(parallel: bool) -> Pipeline {
        Pipeline {
            application_name: "app".into(),
            jobs: vec![
                Job {
                    id: "A".into(),
                    command: "true".into(),
                    description: None,
                    timeout_seconds: Some(5),
                    dependencies: Default::default(),
                    env: Default::default(),
                    pre_checks: vec![],
                    post_checks: vec![],
                    retry_policy: Default::default(),
                },
                Job {
                    id: "B".into(),
                    command: "true".into(),
                    description: None,
                    timeout_seconds: Some(5),
                    dependencies: ["A".to_string()].into_iter().collect(),
                    env: Default::default(),
                    pre_checks: vec![],
                    post_checks: vec![],
                    retry_policy: Default::default(),
                },
            ],
            app_env: Default::default(),
            default_timeout: None,
            parallel,
            max_workers: 2,
            allow_shell: false,
            security_policy: SecurityPolicy::Warn,
            security_level: SecurityLevel::Medium,
            inherit_shell_env: Default::default(),
        }
    }

    fn orchestrator(parallel: bool) -> (Orchestrator, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store: StdArc<dyn crate::history::HistoryStore> =
            StdArc::new(SqliteHistoryStore::open(dir.path().join("h.db")).unwrap());
        let state = StateManager::new(store);
        (Orchestrator::new(pipeline(parallel), state), dir)
    }

    #[test]
    fn sequential_run_completes_in_dependency_order() {
        let (orch, _dir) = orchestrator(false);
        let report = orch.run(&ExecutionOptions::default()).unwrap();
        assert_eq!(report.exit_code, 0);
        assert_eq!(report.completed.len(), 2);
    }

    #[test]
    fn parallel_run_respects_dependencies() {
        let (orch, _dir) = orchestrator(true);
        let report = orch.run(&ExecutionOptions::default()).unwrap();
        assert_eq!(report.exit_code, 0);
        assert_eq!(report.completed.len(), 2);
    }

    #[test]
    fn continue_on_error_records_dependent_as_blocked_not_dispatched() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = pipeline(false);
        p.jobs[0].command = "false".into();
        let store: StdArc<dyn crate::history::HistoryStore> =
            StdArc::new(SqliteHistoryStore::open(dir.path().join("h.db")).unwrap());
        let state = StateManager::new(store);
        let orch = Orchestrator::new(p, state);
        let options = ExecutionOptions { continue_on_error: true, ..Default::default() };
        let report = orch.run(&options).unwrap();
        assert_eq!(report.exit_code, 1);
        assert!(report.completed.is_empty());
        assert!(report.failed.iter().any(|(id, _)| id == "A"));
        assert!(report.failed.iter().any(|(id, reason)| id == "B" && reason.as_deref().unwrap_or("").contains("blocked")));
    }

    #[test]
    fn dry_run_never_touches_the_store() {
        let (orch, _dir) = orchestrator(false);
        let options = ExecutionOptions { dry_run: true, ..Default::default() };
        let report = orch.run(&options).unwrap();
        assert_eq!(report.dispatch_order, vec!["A".to_string(), "B".to_string()]);
        assert!(report.completed.is_empty());
    }
}
