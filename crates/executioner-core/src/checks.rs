//! C8 — CheckRegistry: a compiled-in name -> function mapping backing
//! `pre_checks`/`post_checks`. No dynamic loading (§9).

use std::collections::HashMap;
use std::path::Path;

use crate::job::CheckSpec;

/// Outcome of running one check.
pub type CheckResult = Result<(), String>;

/// A check function: given its params, returns `Ok(())` or a failure
/// reason.
pub type CheckFn = fn(&HashMap<String, serde_json::Value>) -> CheckResult;

/// Static registry of named checks, keyed by name.
pub struct CheckRegistry {
    checks: HashMap<&'static str, CheckFn>,
}

impl CheckRegistry {
    /// The built-in set shipped with this crate. Callers may add more
    /// with `register`.
    pub fn with_builtins() -> Self {
        let mut registry = CheckRegistry { checks: HashMap::new() };
        registry.register("file_exists", check_file_exists);
        registry.register("command_succeeds", check_command_succeeds);
        registry.register("env_var_set", check_env_var_set);
        registry
    }

    pub fn register(&mut self, name: &'static str, f: CheckFn) {
        self.checks.insert(name, f);
    }

    pub fn get(&self, name: &str) -> Option<CheckFn> {
        self.checks.get(name).copied()
    }

    /// Run `checks` in order, short-circuiting (and returning) on the
    /// first failure. An unregistered name is itself a failure.
    pub fn run_all(&self, checks: &[CheckSpec]) -> CheckResult {
        for check in checks {
            match self.get(&check.name) {
                Some(f) => f(&check.params)?,
                None => return Err(format!("unknown check: {}", check.name)),
            }
        }
        Ok(())
    }
}

impl Default for CheckRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn param_str<'a>(params: &'a HashMap<String, serde_json::Value>, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str())
}

fn check_file_exists(params: &HashMap<String, serde_json::Value>) -> CheckResult {
    let path = param_str(params, "path").ok_or_else(|| "file_exists: missing `path` param".to_string())?;
    if Path::new(path).exists() {
        Ok(())
    } else {
        Err(format!("file_exists: {path} does not exist"))
    }
}

fn check_command_succeeds(params: &HashMap<String, serde_json::Value>) -> CheckResult {
    let command = param_str(params, "command").ok_or_else(|| "command_succeeds: missing `command` param".to_string())?;
    let tokens = shell_words::split(command).map_err(|e| format!("command_succeeds: {e}"))?;
    let (program, args) = tokens.split_first().ok_or_else(|| "command_succeeds: empty command".to_string())?;
    let status = std::process::Command::new(program)
        .args(args)
        .status()
        .map_err(|e| format!("command_succeeds: failed to run {program}: {e}"))?;
    if status.success() {
        Ok(())
    } else {
        Err(format!("command_succeeds: {command} exited with {status}"))
    }
}

fn check_env_var_set(params: &HashMap<String, serde_json::Value>) -> CheckResult {
    let name = param_str(params, "name").ok_or_else(|| "env_var_set: missing `name` param".to_string())?;
    if std::env::var(name).is_ok() {
        Ok(())
    } else {
        Err(format!("env_var_set: {name} is not set"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_check_fails_descriptively() {
        let registry = CheckRegistry::with_builtins();
        let specs = vec![CheckSpec { name: "does_not_exist".into(), params: Default::default() }];
        let err = registry.run_all(&specs).unwrap_err();
        assert!(err.contains("unknown check"));
    }

    #[test]
    fn file_exists_passes_for_cwd() {
        let registry = CheckRegistry::with_builtins();
        let mut params = HashMap::new();
        params.insert("path".to_string(), serde_json::json!("."));
        let specs = vec![CheckSpec { name: "file_exists".into(), params }];
        assert!(registry.run_all(&specs).is_ok());
    }
}
