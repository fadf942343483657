//! C9 — security gate run before SPAWN: classify a resolved command
//! against critical/high/medium pattern tiers and decide block vs warn.

use crate::job::{SecurityLevel, SecurityPolicy};

/// A matched pattern and the tier it belongs to.
#[derive(Debug, Clone)]
pub struct SecurityMatch {
    pub tier: SecurityLevel,
    pub pattern: &'static str,
}

/// Patterns that are always blocked, regardless of policy or level.
const CRITICAL_PATTERNS: &[&str] = &["rm -rf /", "mkfs", "dd of=/dev/", ":(){ :|:& };:", "> /dev/sda"];

/// Patterns blocked when `security_level >= High`.
const HIGH_PATTERNS: &[&str] = &["curl | sh", "curl | bash", "wget -O- | sh", "chmod -R 777 /"];

/// Patterns blocked when `security_level >= Medium`.
const MEDIUM_PATTERNS: &[&str] = &["chmod 777", "eval $("];

/// Scan `command` against the tiers and return the first match, if any.
pub fn classify(command: &str) -> Option<SecurityMatch> {
    for p in CRITICAL_PATTERNS {
        if command.contains(p) {
            return Some(SecurityMatch { tier: SecurityLevel::Low, pattern: p });
        }
    }
    for p in HIGH_PATTERNS {
        if command.contains(p) {
            return Some(SecurityMatch { tier: SecurityLevel::High, pattern: p });
        }
    }
    for p in MEDIUM_PATTERNS {
        if command.contains(p) {
            return Some(SecurityMatch { tier: SecurityLevel::Medium, pattern: p });
        }
    }
    None
}

/// Decide whether `command` should be blocked given the pipeline's
/// security configuration. Critical patterns (tier `Low` here, meaning
/// "blocked at every level") are always blocked; medium/high patterns are
/// blocked when the configured level is at least as strict as the
/// pattern's tier, or when the policy itself is `block`.
pub fn should_block(command: &str, policy: SecurityPolicy, level: SecurityLevel) -> Option<SecurityMatch> {
    let m = classify(command)?;
    let is_critical = CRITICAL_PATTERNS.contains(&m.pattern);
    if is_critical {
        return Some(m);
    }
    if policy == SecurityPolicy::Block || level >= m.tier {
        Some(m)
    } else {
        None
    }
}
