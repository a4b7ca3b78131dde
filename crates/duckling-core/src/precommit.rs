//! Pre-commit runner (C9): executes the configured ordered list of shell
//! checks and collects failures.

use std::time::Duration;

use anyhow::Result;

use crate::process::{exec, ExecOptions};
use crate::types::PrecommitCheck;

const CHECK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct CheckFailure {
    pub name: String,
    pub command: String,
    pub output: String,
}

impl CheckFailure {
    /// Rendered as `"<name>: <output>"`, matching the format the pipeline
    /// feeds back to the assistant bridge as a fix-round prompt.
    pub fn rendered(&self) -> String {
        format!("{}: {}", self.name, self.output.trim())
    }
}

/// Run every check in ascending `(order_index, id)` order against `cwd`.
/// Returns every failure observed; an empty vec means all checks passed.
pub async fn run_checks(cwd: &str, checks: &[PrecommitCheck]) -> Result<Vec<CheckFailure>> {
    let mut ordered: Vec<&PrecommitCheck> = checks.iter().collect();
    ordered.sort_by_key(|c| (c.order_index, c.id));

    let mut failures = Vec::new();
    for check in ordered {
        let opts = ExecOptions {
            cwd: Some(cwd),
            timeout: Some(CHECK_TIMEOUT),
            ..Default::default()
        };
        let result = exec("sh", &["-c", &check.command], opts).await?;
        if !result.success() {
            failures.push(CheckFailure {
                name: check.name.clone(),
                command: check.command.clone(),
                output: if result.timed_out { result.stderr } else { result.combined_output() },
            });
        }
    }
    Ok(failures)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(id: i64, order_index: i64, command: &str) -> PrecommitCheck {
        PrecommitCheck { id, name: format!("check-{id}"), command: command.into(), order_index }
    }

    #[tokio::test]
    async fn all_checks_pass_returns_no_failures() {
        let checks = vec![check(1, 0, "true"), check(2, 1, "true")];
        let failures = run_checks("/tmp", &checks).await.unwrap();
        assert!(failures.is_empty());
    }

    #[tokio::test]
    async fn failing_check_is_reported_with_output() {
        let checks = vec![check(1, 0, "echo boom >&2; exit 1")];
        let failures = run_checks("/tmp", &checks).await.unwrap();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].rendered().contains("boom"));
    }

    #[tokio::test]
    async fn checks_run_in_order_index_then_id_order() {
        let checks = vec![check(2, 0, "exit 1"), check(1, 0, "exit 1")];
        let failures = run_checks("/tmp", &checks).await.unwrap();
        assert_eq!(failures[0].name, "check-1");
        assert_eq!(failures[1].name, "check-2");
    }
}
