//! End-to-end scenarios driving `Orchestrator` against a real
//! `SqliteHistoryStore`, covering the store + graph + runner + queue
//! working together rather than any one module in isolation.

use std::collections::HashSet;
use std::sync::Arc;

use executioner_core::history::sqlite::SqliteHistoryStore;
use executioner_core::history::HistoryStore;
use executioner_core::job::{Job, Pipeline, RetryPolicy, SecurityLevel, SecurityPolicy};
use executioner_core::{ExecutionOptions, Orchestrator, ResumeOptions, StateManager};

fn job(id: &str, command: &str, deps: &[&str]) -> Job {
    Job {
        id: id.to_string(),
        command: command.to_string(),
        description: None,
        timeout_seconds: Some(5),
        dependencies: deps.iter().map(|s| s.to_string()).collect(),
        env: Default::default(),
        pre_checks: vec![],
        post_checks: vec![],
        retry_policy: RetryPolicy::default(),
    }
}

fn pipeline(jobs: Vec<Job>, parallel: bool) -> Pipeline {
    Pipeline {
        application_name: "scenario".into(),
        jobs,
        app_env: Default::default(),
        default_timeout: None,
        parallel,
        max_workers: 4,
        allow_shell: true,
        security_policy: SecurityPolicy::Warn,
        security_level: SecurityLevel::Medium,
        inherit_shell_env: Default::default(),
    }
}

fn orchestrator(p: Pipeline) -> (Orchestrator, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn HistoryStore> = Arc::new(SqliteHistoryStore::open(dir.path().join("h.db")).unwrap());
    let state = StateManager::new(store);
    (Orchestrator::new(p, state), dir)
}

/// S1 — linear chain, all succeed, dispatched in dependency order.
#[test]
fn s1_linear_success() {
    let p = pipeline(
        vec![job("A", "true", &[]), job("B", "true", &["A"]), job("C", "true", &["B"])],
        false,
    );
    let (orch, _dir) = orchestrator(p);
    let report = orch.run(&ExecutionOptions::default()).unwrap();
    assert_eq!(report.exit_code, 0);
    assert_eq!(report.dispatch_order, vec!["A", "B", "C"]);
    assert_eq!(report.completed, vec!["A".to_string(), "B".to_string(), "C".to_string()]);
}

/// S2 — a cycle is rejected before any job is dispatched; no history
/// record is written for either job.
#[test]
fn s2_cycle_rejected_before_dispatch() {
    let a = job("A", "true", &["B"]);
    let b = job("B", "true", &["A"]);
    let p = pipeline(vec![a, b], false);
    let (orch, _dir) = orchestrator(p);

    let err = orch.run(&ExecutionOptions::default()).unwrap_err();
    assert!(err.to_string().contains("cycle"));
}

/// S3 — fail-fast marks a failed job's dependents as failed without
/// dispatching them, and never reaches jobs beyond that.
#[test]
fn s3_fail_fast_blocks_transitive_dependents() {
    let p = pipeline(
        vec![job("A", "true", &[]), job("B", "false", &["A"]), job("C", "true", &["B"])],
        false,
    );
    let (orch, _dir) = orchestrator(p);
    let report = orch.run(&ExecutionOptions::default()).unwrap();
    assert_eq!(report.exit_code, 1);
    assert_eq!(report.completed, vec!["A".to_string()]);
    assert!(report.failed.iter().any(|(id, _)| id == "B"));
    assert!(report.failed.iter().any(|(id, _)| id == "C"));
}

/// S4 — a job that fails once then succeeds is retried and ends SUCCESS,
/// with the retry recorded in history.
#[test]
fn s4_retry_then_success_is_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("attempted");
    let mut retry_job = job(
        "A",
        &format!("test -f {0} && exit 0 || (touch {0} && exit 1)", marker.display()),
        &[],
    );
    retry_job.retry_policy = RetryPolicy { max_retries: 2, initial_delay_s: 0.05, ..RetryPolicy::default() };
    let p = pipeline(vec![retry_job], false);

    let store: Arc<dyn HistoryStore> = Arc::new(SqliteHistoryStore::open(dir.path().join("h.db")).unwrap());
    let state = StateManager::new(store.clone());
    let orch = Orchestrator::new(p, state);
    let report = orch.run(&ExecutionOptions::default()).unwrap();

    assert_eq!(report.exit_code, 0);
    assert_eq!(report.completed, vec!["A".to_string()]);
    let statuses = store.get_previous_statuses(report.run_id).unwrap();
    assert_eq!(statuses.get("A"), Some(&executioner_core::job::JobStatus::Success));
}

/// S5 — a job that outlives its timeout is killed and recorded TIMEOUT.
#[test]
fn s5_timeout_kills_and_records() {
    let mut j = job("A", "sleep 5", &[]);
    j.timeout_seconds = Some(1);
    let p = pipeline(vec![j], false);
    let (orch, _dir) = orchestrator(p);
    let report = orch.run(&ExecutionOptions::default()).unwrap();
    assert_eq!(report.exit_code, 1);
    assert!(report.failed.iter().any(|(id, reason)| id == "A" && reason.as_deref().unwrap_or("").contains("timed out")));
}

/// S6 — resume-failed-only skips jobs that already succeeded and only
/// re-runs the one that previously failed.
#[test]
fn s6_resume_failed_only_reruns_failures_only() {
    let dir = tempfile::tempdir().unwrap();
    let p = pipeline(vec![job("A", "true", &[]), job("B", "false", &[])], false);
    let store: Arc<dyn HistoryStore> = Arc::new(SqliteHistoryStore::open(dir.path().join("h.db")).unwrap());
    let state = StateManager::new(store.clone());
    let orch = Orchestrator::new(p, state);

    let first = orch.run(&ExecutionOptions::default()).unwrap();
    assert_eq!(first.exit_code, 1);

    let resume_options = ExecutionOptions {
        resume: ResumeOptions { resume_from: Some(first.run_id), resume_failed_only: true, explicit_skip: HashSet::new() },
        ..Default::default()
    };
    let second = orch.run(&resume_options).unwrap();
    assert!(second.completed.is_empty());
    assert!(second.skipped.contains(&"A".to_string()));
    assert!(second.failed.iter().any(|(id, _)| id == "B"));
    assert_eq!(second.run_id, first.run_id);
    assert_eq!(second.attempt_id, first.attempt_id + 1);
}

/// S7 — parallel dispatch still respects dependency ordering: B cannot
/// complete before A does, even though both could run concurrently with
/// an unrelated C.
#[test]
fn s7_parallel_respects_dependencies() {
    let p = pipeline(
        vec![job("A", "true", &[]), job("B", "true", &["A"]), job("C", "true", &[])],
        true,
    );
    let (orch, _dir) = orchestrator(p);
    let report = orch.run(&ExecutionOptions::default()).unwrap();
    assert_eq!(report.exit_code, 0);
    assert_eq!(report.completed.len(), 3);
}
