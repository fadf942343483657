//! C10 — ConfigLoader: parse the pipeline configuration JSON (§6) into a
//! `Pipeline`, with enough validation to fail fast before any job is
//! dispatched. Not a general schema-validation system — just what the
//! core needs to hand itself a `Pipeline`.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::Deserialize;

use crate::error::ExecutionError;
use crate::job::{
    CheckSpec, InheritShellEnv, Job, Pipeline, RetryPolicy, RetryableStatus, SecurityLevel, SecurityPolicy,
};

#[derive(Debug, Deserialize)]
struct RawPipeline {
    application_name: String,
    jobs: Vec<RawJob>,
    #[serde(default)]
    env_variables: HashMap<String, String>,
    #[serde(default)]
    default_timeout: Option<i64>,
    #[serde(default)]
    default_max_retries: Option<u32>,
    #[serde(default)]
    default_retry_delay: Option<f64>,
    #[serde(default)]
    default_retry_backoff: Option<f64>,
    #[serde(default)]
    default_retry_jitter: Option<f64>,
    #[serde(default)]
    default_max_retry_time: Option<f64>,
    #[serde(default)]
    default_retry_on_exit_codes: Option<Vec<i32>>,
    #[serde(default)]
    parallel: bool,
    #[serde(default)]
    max_workers: Option<i64>,
    #[serde(default)]
    allow_shell: bool,
    #[serde(default)]
    security_policy: Option<SecurityPolicy>,
    #[serde(default)]
    security_level: Option<SecurityLevel>,
    #[serde(default)]
    inherit_shell_env: Option<InheritShellEnv>,
}

#[derive(Debug, Deserialize)]
struct RawJob {
    id: String,
    command: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    timeout: Option<i64>,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    env_variables: HashMap<String, String>,
    #[serde(default)]
    pre_checks: Vec<CheckSpec>,
    #[serde(default)]
    post_checks: Vec<CheckSpec>,
    #[serde(default)]
    max_retries: Option<u32>,
    #[serde(default)]
    retry_delay: Option<f64>,
    #[serde(default)]
    retry_backoff: Option<f64>,
    #[serde(default)]
    retry_jitter: Option<f64>,
    #[serde(default)]
    max_retry_time: Option<f64>,
    #[serde(default)]
    retry_on_status: Option<Vec<RetryableStatus>>,
    #[serde(default)]
    retry_on_exit_codes: Option<Vec<i32>>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load(path: impl AsRef<Path>) -> Result<Pipeline, ExecutionError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ExecutionError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::load_str(&text)
    }

    pub fn load_str(text: &str) -> Result<Pipeline, ExecutionError> {
        let raw: RawPipeline =
            serde_json::from_str(text).map_err(|e| ExecutionError::Config(format!("invalid JSON: {e}")))?;
        Self::build(raw)
    }

    fn build(raw: RawPipeline) -> Result<Pipeline, ExecutionError> {
        if raw.application_name.trim().is_empty() {
            return Err(ExecutionError::Config("application_name must be non-empty".to_string()));
        }
        if raw.jobs.is_empty() {
            return Err(ExecutionError::Config("jobs must contain at least one entry".to_string()));
        }

        let mut seen_ids: HashSet<String> = HashSet::new();
        for job in &raw.jobs {
            if job.id.trim().is_empty() {
                return Err(ExecutionError::Config("job id must be non-empty".to_string()));
            }
            if !seen_ids.insert(job.id.clone()) {
                return Err(ExecutionError::Config(format!("duplicate job id: {}", job.id)));
            }
        }
        // Whether every dependency id is actually declared is a graph
        // concern, not a schema one: §7 classifies it as a `GraphError`
        // that `continue_on_error` may tolerate, so the decision belongs
        // to `GraphAnalyzer`/`Orchestrator` (see `missing_dependencies`),
        // not to this load-time, always-fatal pass.

        let mut jobs = Vec::with_capacity(raw.jobs.len());
        for raw_job in raw.jobs {
            jobs.push(Self::build_job(raw_job, &raw)?);
        }

        Ok(Pipeline {
            application_name: raw.application_name,
            jobs,
            app_env: raw.env_variables,
            default_timeout: raw.default_timeout,
            parallel: raw.parallel,
            max_workers: raw.max_workers.unwrap_or(1),
            allow_shell: raw.allow_shell,
            security_policy: raw.security_policy.unwrap_or(SecurityPolicy::Warn),
            security_level: raw.security_level.unwrap_or(SecurityLevel::Medium),
            inherit_shell_env: raw.inherit_shell_env.unwrap_or_default(),
        })
    }

    fn build_job(raw_job: RawJob, defaults: &RawPipeline) -> Result<Job, ExecutionError> {
        let jitter = raw_job.retry_jitter.or(defaults.default_retry_jitter).unwrap_or(0.1);
        if !(0.0..=1.0).contains(&jitter) {
            return Err(ExecutionError::Config(format!(
                "job {}: retry_jitter must be within [0, 1], got {jitter}",
                raw_job.id
            )));
        }

        let retry_on_status = raw_job
            .retry_on_status
            .map(|v| v.into_iter().collect())
            .unwrap_or_else(|| RetryPolicy::default().retry_on_status);
        let retry_on_exit_codes: HashSet<i32> = raw_job
            .retry_on_exit_codes
            .or_else(|| defaults.default_retry_on_exit_codes.clone())
            .map(|v| v.into_iter().collect())
            .unwrap_or_else(|| RetryPolicy::default().retry_on_exit_codes);

        let retry_policy = RetryPolicy {
            max_retries: raw_job.max_retries.or(defaults.default_max_retries).unwrap_or(0),
            initial_delay_s: raw_job.retry_delay.or(defaults.default_retry_delay).unwrap_or(30.0),
            backoff_factor: raw_job.retry_backoff.or(defaults.default_retry_backoff).unwrap_or(1.5),
            jitter_fraction: jitter,
            max_total_retry_s: raw_job.max_retry_time.or(defaults.default_max_retry_time).unwrap_or(1800.0),
            retry_on_status,
            retry_on_exit_codes,
        };

        Ok(Job {
            id: raw_job.id,
            command: raw_job.command,
            description: raw_job.description,
            timeout_seconds: raw_job.timeout,
            dependencies: raw_job.dependencies.into_iter().collect(),
            env: raw_job.env_variables,
            pre_checks: raw_job.pre_checks,
            post_checks: raw_job.post_checks,
            retry_policy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_pipeline() {
        let json = r#"{
            "application_name": "demo",
            "jobs": [{"id": "A", "command": "true"}]
        }"#;
        let pipeline = ConfigLoader::load_str(json).unwrap();
        assert_eq!(pipeline.application_name, "demo");
        assert_eq!(pipeline.jobs.len(), 1);
        assert_eq!(pipeline.jobs[0].retry_policy.max_retries, 0);
    }

    #[test]
    fn rejects_duplicate_ids() {
        let json = r#"{
            "application_name": "demo",
            "jobs": [{"id": "A", "command": "true"}, {"id": "A", "command": "false"}]
        }"#;
        assert!(ConfigLoader::load_str(json).is_err());
    }

    /// An undeclared dependency is a `GraphError` the orchestrator may
    /// tolerate under continue-on-error (§7); the loader itself must not
    /// reject it, or that tolerant path is unreachable from the CLI.
    #[test]
    fn loads_job_with_undeclared_dependency() {
        let json = r#"{
            "application_name": "demo",
            "jobs": [{"id": "A", "command": "true", "dependencies": ["ghost"]}]
        }"#;
        let pipeline = ConfigLoader::load_str(json).unwrap();
        assert!(pipeline.jobs[0].dependencies.contains("ghost"));
    }

    #[test]
    fn rejects_out_of_range_jitter() {
        let json = r#"{
            "application_name": "demo",
            "jobs": [{"id": "A", "command": "true", "retry_jitter": 1.5}]
        }"#;
        assert!(ConfigLoader::load_str(json).is_err());
    }

    #[test]
    fn applies_pipeline_level_retry_defaults() {
        let json = r#"{
            "application_name": "demo",
            "default_max_retries": 3,
            "default_retry_delay": 5.0,
            "jobs": [{"id": "A", "command": "true"}]
        }"#;
        let pipeline = ConfigLoader::load_str(json).unwrap();
        assert_eq!(pipeline.jobs[0].retry_policy.max_retries, 3);
        assert_eq!(pipeline.jobs[0].retry_policy.initial_delay_s, 5.0);
    }
}
