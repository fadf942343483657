//! C3 — JobRunner: the per-job process-supervision state machine.
//!
//! `READY -> PRECHECK -> SPAWN -> STREAM -> WAIT -> POSTCHECK ->
//! DONE(SUCCESS) | FAIL(kind) | ABORT(reason)`, wrapped by the retry
//! policy (§4.3).

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::checks::CheckRegistry;
use crate::job::{Job, JobStatus, Pipeline, RetryRecord};
use crate::security;
use crate::shell;

const DEFAULT_TIMEOUT_S: i64 = 10_800;
const TERMINATE_GRACE: Duration = Duration::from_secs(1);

/// Something to write streamed job output lines to.
pub trait JobLogSink: Send + Sync {
    fn write_line(&self, line: &str);
}

/// Drops lines; used when no per-job log file is configured.
pub struct NullLogSink;
impl JobLogSink for NullLogSink {
    fn write_line(&self, _line: &str) {}
}

/// Outcome of one full (possibly retried) job execution.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub duration_s: f64,
    pub retry_count: u32,
    pub retry_history: Vec<RetryRecord>,
    pub last_error: Option<String>,
    pub last_exit_code: Option<i32>,
}

pub struct JobRunner<'a> {
    pub job: &'a Job,
    pub pipeline: &'a Pipeline,
    pub env: HashMap<String, String>,
    pub checks: &'a CheckRegistry,
    pub log_sink: Arc<dyn JobLogSink>,
    pub interrupted: Arc<AtomicBool>,
    /// Directory the spawned process's cwd is set to; `None` inherits the
    /// orchestrator's own cwd.
    pub working_dir: Option<String>,
}

/// Result of a single (non-retried) attempt.
struct AttemptResult {
    status: JobStatus,
    exit_code: Option<i32>,
    error: Option<String>,
    duration_s: f64,
}

impl<'a> JobRunner<'a> {
    fn resolved_timeout(&self) -> i64 {
        let candidate = self.job.timeout_seconds.or(self.pipeline.default_timeout).unwrap_or(DEFAULT_TIMEOUT_S);
        if candidate > 0 {
            candidate
        } else {
            DEFAULT_TIMEOUT_S
        }
    }

    /// Run the job to a final terminal outcome, applying the retry
    /// policy across attempts.
    pub fn run(&self) -> JobOutcome {
        if self.job.command.trim().is_empty() {
            return JobOutcome {
                status: JobStatus::Success,
                duration_s: 0.0,
                retry_count: 0,
                retry_history: vec![],
                last_error: None,
                last_exit_code: Some(0),
            };
        }

        let policy = &self.job.retry_policy;
        let mut retry_count = 0u32;
        let mut history = Vec::new();
        let first_attempt_start = Instant::now();

        loop {
            let attempt_number = retry_count + 1;
            let result = self.run_one_attempt();
            history.push(RetryRecord {
                attempt: attempt_number,
                timestamp: Utc::now(),
                duration_s: result.duration_s,
                success: result.status == JobStatus::Success,
                exit_code: result.exit_code,
            });

            if result.status == JobStatus::Success {
                return JobOutcome {
                    status: result.status,
                    duration_s: result.duration_s,
                    retry_count,
                    retry_history: history,
                    last_error: result.error,
                    last_exit_code: result.exit_code,
                };
            }

            let kind_eligible = policy.retry_on_status.iter().any(|s| s.matches(result.status))
                || result.exit_code.map(|c| policy.retry_on_exit_codes.contains(&c)).unwrap_or(false);
            let retries_remaining = retry_count < policy.max_retries;
            let elapsed = first_attempt_start.elapsed().as_secs_f64();
            let time_remaining = elapsed < policy.max_total_retry_s;

            // Checks, security blocks, and timeouts that aren't in
            // retry_on_status never retry even if exit code matches,
            // since there's no exit code to match against in that case.
            let result_has_retry_path = matches!(
                result.status,
                JobStatus::Error | JobStatus::Failed | JobStatus::Timeout
            );

            let not_interrupted = !self.interrupted.load(Ordering::SeqCst);

            if result_has_retry_path && kind_eligible && retries_remaining && time_remaining && not_interrupted {
                let delay = Self::backoff_delay(policy.initial_delay_s, policy.backoff_factor, retry_count, policy.jitter_fraction);
                std::thread::sleep(Duration::from_secs_f64(delay));
                retry_count += 1;
                continue;
            }

            return JobOutcome {
                status: result.status,
                duration_s: history.iter().map(|r| r.duration_s).sum(),
                retry_count,
                retry_history: history,
                last_error: result.error,
                last_exit_code: result.exit_code,
            };
        }
    }

    fn backoff_delay(initial: f64, factor: f64, retry_count: u32, jitter_fraction: f64) -> f64 {
        let base = initial * factor.powi(retry_count as i32);
        let jitter = if jitter_fraction > 0.0 {
            let r: f64 = (rand_unit() * 2.0 - 1.0) * jitter_fraction;
            base * r
        } else {
            0.0
        };
        (base + jitter).max(0.1)
    }

    fn run_one_attempt(&self) -> AttemptResult {
        let start = Instant::now();

        // PRECHECK
        if let Err(reason) = self.checks.run_all(&self.job.pre_checks) {
            return AttemptResult {
                status: JobStatus::PrecheckFailed,
                exit_code: None,
                error: Some(reason),
                duration_s: start.elapsed().as_secs_f64(),
            };
        }

        // SPAWN decision: shell-or-not, then security gate.
        let needs_shell = shell::needs_shell(&self.job.command);
        if needs_shell && !self.pipeline.allow_shell {
            return AttemptResult {
                status: JobStatus::Error,
                exit_code: None,
                error: Some("command requires a shell but allow_shell is false".to_string()),
                duration_s: start.elapsed().as_secs_f64(),
            };
        }

        if let Some(m) = security::should_block(&self.job.command, self.pipeline.security_policy, self.pipeline.security_level) {
            return AttemptResult {
                status: JobStatus::Blocked,
                exit_code: None,
                error: Some(format!("blocked by security policy: matched pattern {:?}", m.pattern)),
                duration_s: start.elapsed().as_secs_f64(),
            };
        }

        let mut command = match self.build_command(needs_shell) {
            Ok(c) => c,
            Err(e) => {
                return AttemptResult {
                    status: JobStatus::Error,
                    exit_code: None,
                    error: Some(e),
                    duration_s: start.elapsed().as_secs_f64(),
                }
            }
        };

        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // New process group so a timeout can signal the whole tree.
            command.process_group(0);
        }

        let mut child = match command.spawn() {
            Ok(c) => c,
            Err(e) => {
                return AttemptResult {
                    status: JobStatus::Error,
                    exit_code: None,
                    error: Some(format!("failed to spawn: {e}")),
                    duration_s: start.elapsed().as_secs_f64(),
                }
            }
        };

        // STREAM: a dedicated reader thread forwards combined output.
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let sink = self.log_sink.clone();
        let reader_done = Arc::new(AtomicBool::new(false));
        let reader_done_writer = reader_done.clone();
        let reader = std::thread::spawn(move || {
            if let Some(out) = stdout {
                stream_lines(out, sink.as_ref());
            }
            reader_done_writer.store(true, Ordering::SeqCst);
        });
        let sink2 = self.log_sink.clone();
        let stderr_reader = std::thread::spawn(move || {
            if let Some(err) = stderr {
                stream_lines(err, sink2.as_ref());
            }
        });

        // WAIT up to the timeout.
        let timeout = Duration::from_secs(self.resolved_timeout().max(1) as u64);
        let deadline = Instant::now() + timeout;
        let exit_status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) => {
                    if Instant::now() >= deadline {
                        break None;
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(_) => break None,
            }
        };

        let pid = child.id();
        let (status_opt, timed_out) = match exit_status {
            Some(status) => (Some(status), false),
            None => {
                terminate_process_group(pid, TERMINATE_GRACE);
                let _ = child.wait();
                (None, true)
            }
        };

        let _ = reader.join();
        let _ = stderr_reader.join();

        let duration_s = start.elapsed().as_secs_f64();

        if timed_out {
            return AttemptResult {
                status: JobStatus::Timeout,
                exit_code: None,
                error: Some(format!("timed out after {}s", self.resolved_timeout())),
                duration_s,
            };
        }

        let status = status_opt.expect("non-timeout path always has an exit status");
        let exit_code = status.code();

        if !status.success() {
            return AttemptResult {
                status: JobStatus::Failed,
                exit_code,
                error: Some(format!("exited with status {status}")),
                duration_s,
            };
        }

        // POSTCHECK, only on a successful exit.
        if let Err(reason) = self.checks.run_all(&self.job.post_checks) {
            return AttemptResult {
                status: JobStatus::PostcheckFailed,
                exit_code,
                error: Some(reason),
                duration_s,
            };
        }

        AttemptResult { status: JobStatus::Success, exit_code, error: None, duration_s }
    }

    fn build_command(&self, needs_shell: bool) -> Result<Command, String> {
        let mut command = if needs_shell {
            let mut c = Command::new("/bin/sh");
            c.arg("-c").arg(&self.job.command);
            c
        } else {
            let tokens = shell::tokenize(&self.job.command).map_err(|e| format!("failed to tokenize command: {e}"))?;
            let (program, args) = tokens.split_first().ok_or_else(|| "empty command".to_string())?;
            let mut c = Command::new(program);
            c.args(args);
            c
        };
        command.env_clear();
        command.envs(&self.env);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        Ok(command)
    }
}

fn stream_lines(reader: impl std::io::Read, sink: &dyn JobLogSink) {
    let mut buf = BufReader::new(reader);
    let mut line = String::new();
    loop {
        line.clear();
        match buf.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => sink.write_line(line.trim_end_matches('\n')),
            Err(_) => break,
        }
    }
}

#[cfg(unix)]
fn terminate_process_group(pid: u32, grace: Duration) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;
    let pgid = Pid::from_raw(pid as i32);
    let _ = killpg(pgid, Signal::SIGTERM);
    std::thread::sleep(grace);
    let _ = killpg(pgid, Signal::SIGKILL);
}

#[cfg(not(unix))]
fn terminate_process_group(_pid: u32, _grace: Duration) {}

/// A small, dependency-free uniform(0,1) source used only for retry
/// jitter; not cryptographic, and not meant to be.
fn rand_unit() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.subsec_nanos()).unwrap_or(0);
    (nanos % 1_000_000) as f64 / 1_000_000.0
}
