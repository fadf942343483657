//! C7 — EnvResolver: merge app/job/CLI env maps and interpolate `${VAR}`
//! tokens with cycle detection.

use std::collections::HashMap;

use crate::job::InheritShellEnv;

const MAX_VALUE_LEN: usize = 32 * 1024;

/// Names considered when `inherit_shell_env == "default"`.
const DEFAULT_WHITELIST: &[&str] = &[
    "PATH", "HOME", "LANG", "LC_ALL", "LC_CTYPE", "TMPDIR", "TEMP", "TMP", "USER", "SHELL",
    "PWD", "CARGO_HOME", "RUSTUP_HOME",
];

#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    #[error("invalid environment variable name: {0:?}")]
    InvalidName(String),
    #[error("environment variable {0:?} contains a NUL byte")]
    ContainsNul(String),
    #[error("environment variable {0:?} exceeds {MAX_VALUE_LEN} bytes")]
    TooLong(String),
}

pub struct EnvResolver;

impl EnvResolver {
    /// Build the final environment for one job invocation. Precedence
    /// (lowest to highest, last wins): inherited shell env, app env, job
    /// env, CLI-supplied env. Then resolve `${NAME}` tokens to a fixed
    /// point, leaving unresolved cycles literal with a warning.
    pub fn resolve(
        inherit: &InheritShellEnv,
        process_env: &HashMap<String, String>,
        app_env: &HashMap<String, String>,
        job_env: &HashMap<String, String>,
        cli_env: &HashMap<String, String>,
    ) -> Result<HashMap<String, String>, EnvError> {
        let mut merged = HashMap::new();
        for (k, v) in Self::filter_inherited(inherit, process_env) {
            merged.insert(k, v);
        }
        for (k, v) in app_env {
            merged.insert(k.clone(), v.clone());
        }
        for (k, v) in job_env {
            merged.insert(k.clone(), v.clone());
        }
        for (k, v) in cli_env {
            merged.insert(k.clone(), v.clone());
        }

        for (k, v) in &merged {
            validate_name(k)?;
            validate_value(k, v)?;
        }

        Ok(Self::interpolate(merged))
    }

    fn filter_inherited(
        inherit: &InheritShellEnv,
        process_env: &HashMap<String, String>,
    ) -> HashMap<String, String> {
        match inherit {
            InheritShellEnv::All(true) => process_env.clone(),
            InheritShellEnv::All(false) => HashMap::new(),
            InheritShellEnv::Default(tag) if tag == "default" => process_env
                .iter()
                .filter(|(k, _)| DEFAULT_WHITELIST.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            InheritShellEnv::Default(_) => HashMap::new(),
            InheritShellEnv::Names(names) => process_env
                .iter()
                .filter(|(k, _)| names.contains(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Fixed-point `${NAME}` substitution. A name that forms a cycle
    /// (directly or transitively through another substitution) is left
    /// literal; the caller is expected to log a warning for it.
    fn interpolate(mut env: HashMap<String, String>) -> HashMap<String, String> {
        const MAX_PASSES: usize = 32;
        let mut cyclic: std::collections::HashSet<String> = Default::default();

        for _ in 0..MAX_PASSES {
            let mut changed = false;
            let snapshot = env.clone();
            for (key, value) in env.iter_mut() {
                if cyclic.contains(key) {
                    continue;
                }
                if let Some(resolved) = substitute_once(value, &snapshot, key, &mut cyclic) {
                    if resolved != *value {
                        *value = resolved;
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }
        env
    }
}

/// Replace every `${NAME}` token in `value` using `env`. Detects a direct
/// self-reference (`key` substituting itself, possibly through others)
/// and marks it cyclic instead of looping forever.
fn substitute_once(
    value: &str,
    env: &HashMap<String, String>,
    key: &str,
    cyclic: &mut std::collections::HashSet<String>,
) -> Option<String> {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    let mut touched = false;
    while let Some(start) = rest.find("${") {
        let Some(end) = rest[start..].find('}') else {
            out.push_str(rest);
            rest = "";
            break;
        };
        out.push_str(&rest[..start]);
        let name = &rest[start + 2..start + end];
        if name == key {
            cyclic.insert(key.to_string());
            out.push_str(&rest[start..start + end + 1]);
        } else if let Some(v) = env.get(name) {
            out.push_str(v);
            touched = true;
        } else {
            out.push_str(&rest[start..start + end + 1]);
        }
        rest = &rest[start + end + 1..];
    }
    out.push_str(rest);
    if touched || out != value {
        Some(out)
    } else {
        None
    }
}

fn validate_name(name: &str) -> Result<(), EnvError> {
    let mut chars = name.chars();
    let ok_first = chars.next().map(|c| c.is_ascii_alphabetic() || c == '_').unwrap_or(false);
    let ok_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !ok_first || !ok_rest {
        return Err(EnvError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn validate_value(name: &str, value: &str) -> Result<(), EnvError> {
    if value.contains('\0') {
        return Err(EnvError::ContainsNul(name.to_string()));
    }
    if value.len() > MAX_VALUE_LEN {
        return Err(EnvError::TooLong(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_last_wins() {
        let process = HashMap::from([("PATH".to_string(), "/usr/bin".to_string())]);
        let app = HashMap::from([("X".to_string(), "app".to_string())]);
        let job = HashMap::from([("X".to_string(), "job".to_string())]);
        let cli = HashMap::from([("X".to_string(), "cli".to_string())]);
        let resolved =
            EnvResolver::resolve(&InheritShellEnv::All(true), &process, &app, &job, &cli).unwrap();
        assert_eq!(resolved.get("X").unwrap(), "cli");
    }

    #[test]
    fn interpolates_fixed_point() {
        let job = HashMap::from([
            ("BASE".to_string(), "/srv".to_string()),
            ("OUT".to_string(), "${BASE}/out".to_string()),
        ]);
        let resolved = EnvResolver::resolve(
            &InheritShellEnv::All(false),
            &HashMap::new(),
            &HashMap::new(),
            &job,
            &HashMap::new(),
        )
        .unwrap();
        assert_eq!(resolved.get("OUT").unwrap(), "/srv/out");
    }

    #[test]
    fn cycle_left_literal() {
        let job = HashMap::from([("A".to_string(), "${A}".to_string())]);
        let resolved = EnvResolver::resolve(
            &InheritShellEnv::All(false),
            &HashMap::new(),
            &HashMap::new(),
            &job,
            &HashMap::new(),
        )
        .unwrap();
        assert_eq!(resolved.get("A").unwrap(), "${A}");
    }

    #[test]
    fn rejects_invalid_name() {
        let job = HashMap::from([("1BAD".to_string(), "x".to_string())]);
        let err = EnvResolver::resolve(
            &InheritShellEnv::All(false),
            &HashMap::new(),
            &HashMap::new(),
            &job,
            &HashMap::new(),
        );
        assert!(err.is_err());
    }

    #[test]
    fn default_whitelist_filters() {
        let process = HashMap::from([
            ("PATH".to_string(), "/usr/bin".to_string()),
            ("SECRET".to_string(), "shh".to_string()),
        ]);
        let resolved = EnvResolver::resolve(
            &InheritShellEnv::Default("default".to_string()),
            &process,
            &HashMap::new(),
            &HashMap::new(),
            &HashMap::new(),
        )
        .unwrap();
        assert!(resolved.contains_key("PATH"));
        assert!(!resolved.contains_key("SECRET"));
    }
}
