//! C13 — NotificationSink: the narrow interface the orchestrator calls
//! on terminal run outcome. Real dispatch (email, webhook) is out of
//! scope; this is the contract a deployment would implement against.

use crate::job::RunStatus;

/// Enough of a finished run to render a notification or the CLI summary
/// block, without exposing internal orchestrator state.
#[derive(Debug, Clone)]
pub struct RunOutcome<'a> {
    pub application_name: &'a str,
    pub run_id: i64,
    pub attempt_id: i64,
    pub status: RunStatus,
    pub exit_code: i32,
    pub completed: &'a [String],
    pub failed: &'a [(String, Option<String>)],
    pub skipped: &'a [String],
}

pub trait NotificationSink: Send + Sync {
    fn notify(&self, outcome: &RunOutcome<'_>);
}

/// Default sink: drops every notification.
pub struct NoopNotificationSink;
impl NotificationSink for NoopNotificationSink {
    fn notify(&self, _outcome: &RunOutcome<'_>) {}
}

/// Prints the same summary block the CLI renders after a run.
pub struct StdoutNotificationSink;
impl NotificationSink for StdoutNotificationSink {
    fn notify(&self, outcome: &RunOutcome<'_>) {
        println!(
            "[{}] run {} attempt {} finished: {} (exit {})",
            outcome.application_name, outcome.run_id, outcome.attempt_id, outcome.status, outcome.exit_code
        );
        println!("  completed: {}", outcome.completed.len());
        if !outcome.failed.is_empty() {
            println!("  failed:");
            for (id, reason) in outcome.failed {
                println!("    {id}: {}", reason.as_deref().unwrap_or("no reason recorded"));
            }
        }
        if !outcome.skipped.is_empty() {
            println!("  skipped: {}", outcome.skipped.join(", "));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_sink_does_not_panic() {
        let outcome = RunOutcome {
            application_name: "app",
            run_id: 1,
            attempt_id: 1,
            status: RunStatus::Success,
            exit_code: 0,
            completed: &[],
            failed: &[],
            skipped: &[],
        };
        NoopNotificationSink.notify(&outcome);
    }
}
