//! C4 — QueueManager: thread-safe job states, the ready-queue, and
//! dependent enqueue. All mutators take one internal mutex; a condition
//! variable signals "something completed" to idle waiters.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::job::Pipeline;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Queued,
    Active,
    Completed,
    Failed,
    Skipped,
}

struct Inner {
    pending: HashSet<String>,
    queued: HashSet<String>,
    active: HashSet<String>,
    completed: HashSet<String>,
    failed: HashSet<String>,
    skipped: HashSet<String>,
    failed_reasons: HashMap<String, String>,
    ready_queue: VecDeque<String>,
    future_handles: HashMap<u64, String>,
}

/// Snapshot of queue state, cheap to clone for callers that just need to
/// read it without holding the lock.
#[derive(Debug, Clone, Default)]
pub struct QueueSnapshot {
    pub completed: HashSet<String>,
    pub failed: HashSet<String>,
    pub skipped: HashSet<String>,
    pub active: HashSet<String>,
    /// Jobs still unscheduled once dispatch is over: a dependency failed
    /// under continue-on-error, so readiness never became true. Distinct
    /// from `failed`, which is reserved for jobs that were actually run
    /// (or transitively marked under fail-fast).
    pub pending: HashSet<String>,
}

pub struct QueueManager {
    state: Mutex<Inner>,
    completion_cv: Condvar,
    deps: HashMap<String, HashSet<String>>,
    all_jobs: HashSet<String>,
}

impl QueueManager {
    pub fn new(pipeline: &Pipeline) -> Self {
        let mut deps = HashMap::new();
        let mut all_jobs = HashSet::new();
        for job in &pipeline.jobs {
            deps.insert(job.id.clone(), job.dependencies.clone());
            all_jobs.insert(job.id.clone());
        }
        QueueManager {
            state: Mutex::new(Inner {
                pending: all_jobs.clone(),
                queued: HashSet::new(),
                active: HashSet::new(),
                completed: HashSet::new(),
                failed: HashSet::new(),
                skipped: HashSet::new(),
                failed_reasons: HashMap::new(),
                ready_queue: VecDeque::new(),
                future_handles: HashMap::new(),
            }),
            completion_cv: Condvar::new(),
            deps,
            all_jobs,
        }
    }

    /// Pre-seed jobs that should be treated as already-terminal (resume
    /// skip computation, done by `StateManager` before this call).
    pub fn set_skip_jobs(&self, skip: &HashSet<String>) {
        let mut inner = self.state.lock().unwrap();
        for id in skip {
            inner.pending.remove(id);
            inner.skipped.insert(id.clone());
        }
    }

    fn is_ready_locked(&self, inner: &Inner, job_id: &str) -> bool {
        let deps = match self.deps.get(job_id) {
            Some(d) => d,
            None => return false,
        };
        deps.iter().all(|d| inner.completed.contains(d) || inner.skipped.contains(d))
            && deps.iter().all(|d| !inner.failed.contains(d))
    }

    /// Enqueue every pending job whose dependencies are already
    /// satisfied (used once, after `set_skip_jobs`).
    pub fn seed_initial(&self) {
        let mut inner = self.state.lock().unwrap();
        let candidates: Vec<String> = inner
            .pending
            .iter()
            .filter(|id| self.is_ready_locked(&inner, id))
            .cloned()
            .collect();
        for id in candidates {
            inner.pending.remove(&id);
            inner.queued.insert(id.clone());
            inner.ready_queue.push_back(id);
        }
    }

    /// Pop a ready job id, waiting up to `timeout` if the queue is
    /// currently empty.
    pub fn next_ready(&self, timeout: Duration) -> Option<String> {
        let mut inner = self.state.lock().unwrap();
        if inner.ready_queue.is_empty() {
            let (guard, _) = self.completion_cv.wait_timeout(inner, timeout).unwrap();
            inner = guard;
        }
        let id = inner.ready_queue.pop_front()?;
        Some(id)
    }

    pub fn mark_active(&self, job_id: &str) {
        let mut inner = self.state.lock().unwrap();
        inner.queued.remove(job_id);
        inner.active.insert(job_id.to_string());
    }

    pub fn mark_completed(&self, job_id: &str) {
        let mut inner = self.state.lock().unwrap();
        inner.active.remove(job_id);
        inner.completed.insert(job_id.to_string());
        self.completion_cv.notify_all();
    }

    pub fn mark_failed(&self, job_id: &str, reason: Option<String>) {
        let mut inner = self.state.lock().unwrap();
        inner.active.remove(job_id);
        inner.failed.insert(job_id.to_string());
        if let Some(r) = reason {
            inner.failed_reasons.insert(job_id.to_string(), r);
        }
        self.completion_cv.notify_all();
    }

    pub fn mark_skipped(&self, job_id: &str) {
        let mut inner = self.state.lock().unwrap();
        inner.pending.remove(job_id);
        inner.skipped.insert(job_id.to_string());
        self.completion_cv.notify_all();
    }

    pub fn register_future(&self, handle: u64, job_id: &str) {
        let mut inner = self.state.lock().unwrap();
        inner.future_handles.insert(handle, job_id.to_string());
    }

    pub fn unregister_future(&self, handle: u64) -> Option<String> {
        let mut inner = self.state.lock().unwrap();
        inner.future_handles.remove(&handle)
    }

    /// For each job depending on `completed_id`, enqueue it if all of
    /// its dependencies are now satisfied and none have failed. Under
    /// fail-fast with a failed `completed_id`, dependents are instead
    /// transitively marked failed without dispatch; `dry_run` suppresses
    /// both the completion-condvar notify and the mutation audit trail
    /// side effects a real dispatch would have (dry-run never spawns).
    pub fn enqueue_dependents(&self, completed_id: &str, fail_fast_failure: bool, dry_run: bool) {
        let mut inner = self.state.lock().unwrap();
        let dependents: Vec<String> = self
            .all_jobs
            .iter()
            .filter(|id| self.deps.get(*id).map(|d| d.contains(completed_id)).unwrap_or(false))
            .cloned()
            .collect();

        for dep_id in dependents {
            let already_processed = inner.completed.contains(&dep_id)
                || inner.failed.contains(&dep_id)
                || inner.skipped.contains(&dep_id)
                || inner.queued.contains(&dep_id)
                || inner.active.contains(&dep_id);
            if already_processed {
                continue;
            }
            if fail_fast_failure {
                inner.pending.remove(&dep_id);
                inner.failed.insert(dep_id.clone());
                inner.failed_reasons.insert(dep_id, format!("dependency {completed_id} failed"));
                continue;
            }
            if self.is_ready_locked(&inner, &dep_id) {
                inner.pending.remove(&dep_id);
                inner.queued.insert(dep_id.clone());
                inner.ready_queue.push_back(dep_id);
            }
        }
        if !dry_run {
            self.completion_cv.notify_all();
        }
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let inner = self.state.lock().unwrap();
        QueueSnapshot {
            completed: inner.completed.clone(),
            failed: inner.failed.clone(),
            skipped: inner.skipped.clone(),
            active: inner.active.clone(),
            pending: inner.pending.clone(),
        }
    }

    pub fn failed_reason(&self, job_id: &str) -> Option<String> {
        let inner = self.state.lock().unwrap();
        inner.failed_reasons.get(job_id).cloned()
    }

    pub fn is_empty_and_idle(&self) -> bool {
        let inner = self.state.lock().unwrap();
        inner.ready_queue.is_empty() && inner.active.is_empty() && inner.queued.is_empty()
    }

    pub fn notify_completion(&self) {
        self.completion_cv.notify_all();
    }

    pub fn total_jobs(&self) -> usize {
        self.all_jobs.len()
    }
}
