//! Per-step execution and reporting for composite actions.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::runner::{command_line, CommandOutput, CommandRunner};
use crate::types::{StepOutcome, StepReport};

/// Captured output kept per step.
const MAX_OUTPUT_BYTES: usize = 4096;

/// Runs sub-steps under a per-step budget and records a report for each.
pub struct StepRecorder<'a> {
    runner: &'a dyn CommandRunner,
    step_timeout: Duration,
    action: String,
    steps: Vec<StepReport>,
    metrics: BTreeMap<String, f64>,
}

impl<'a> StepRecorder<'a> {
    pub fn new(runner: &'a dyn CommandRunner, step_timeout: Duration, action: impl Into<String>) -> Self {
        Self {
            runner,
            step_timeout,
            action: action.into(),
            steps: Vec::new(),
            metrics: BTreeMap::new(),
        }
    }

    /// Run one command as a named step.
    ///
    /// Returns the output when the command exited 0, otherwise the failure
    /// cause (non-zero exit, missing program or step timeout).
    pub async fn run(&mut self, name: &str, program: &str, args: &[&str]) -> Result<CommandOutput, String> {
        self.run_inner(name, program, args, false).await
    }

    /// Like [`StepRecorder::run`], but a missing program records the step
    /// as skipped instead of failed.
    pub async fn run_if_present(
        &mut self,
        name: &str,
        program: &str,
        args: &[&str],
    ) -> Result<CommandOutput, String> {
        self.run_inner(name, program, args, true).await
    }

    async fn run_inner(
        &mut self,
        name: &str,
        program: &str,
        args: &[&str],
        missing_is_skip: bool,
    ) -> Result<CommandOutput, String> {
        let args: Vec<String> = args.iter().map(|a| (*a).to_string()).collect();
        let line = command_line(program, &args);
        info!(action = %self.action, step = name, command = %line, "Step started");

        let started = Instant::now();
        let result = tokio::time::timeout(self.step_timeout, self.runner.run(program, &args)).await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let (outcome, output, ret) = match result {
            Ok(Ok(out)) if out.success() => (StepOutcome::Succeeded, out.stdout.clone(), Ok(out)),
            Ok(Ok(out)) => {
                let cause = out.failure_summary();
                (StepOutcome::Failed(cause.clone()), out.stderr.clone(), Err(cause))
            }
            Ok(Err(e)) if missing_is_skip && e.kind() == std::io::ErrorKind::NotFound => {
                let cause = format!("{program} not installed");
                (StepOutcome::Skipped(cause.clone()), String::new(), Err(cause))
            }
            Ok(Err(e)) => {
                let cause = format!("{program} unavailable: {e}");
                (StepOutcome::Failed(cause.clone()), String::new(), Err(cause))
            }
            Err(_) => {
                let cause = format!("timed out after {:?}", self.step_timeout);
                (StepOutcome::Failed(cause.clone()), String::new(), Err(cause))
            }
        };

        self.push(StepReport {
            name: name.to_string(),
            command: Some(line),
            outcome,
            output: truncate(&output),
            duration_ms,
        });
        ret
    }

    /// Record a step that was deliberately not run.
    pub fn skip(&mut self, name: &str, reason: impl Into<String>) {
        self.push(StepReport {
            name: name.to_string(),
            command: None,
            outcome: StepOutcome::Skipped(reason.into()),
            output: String::new(),
            duration_ms: 0,
        });
    }

    /// Record a numeric result.
    pub fn metric(&mut self, key: &str, value: f64) {
        self.metrics.insert(key.to_string(), value);
    }

    /// Steps recorded so far.
    #[must_use]
    pub fn steps(&self) -> &[StepReport] {
        &self.steps
    }

    /// Names of steps that failed.
    #[must_use]
    pub fn failed_steps(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| matches!(s.outcome, StepOutcome::Failed(_)))
            .map(|s| s.name.clone())
            .collect()
    }

    /// Consume into reports and metrics.
    #[must_use]
    pub fn finish(self) -> (Vec<StepReport>, BTreeMap<String, f64>) {
        (self.steps, self.metrics)
    }

    fn push(&mut self, report: StepReport) {
        match &report.outcome {
            StepOutcome::Succeeded => info!(
                action = %self.action,
                step = %report.name,
                duration_ms = report.duration_ms,
                "Step succeeded"
            ),
            StepOutcome::Failed(cause) => warn!(
                action = %self.action,
                step = %report.name,
                duration_ms = report.duration_ms,
                cause = %cause,
                "Step failed"
            ),
            StepOutcome::Skipped(reason) => info!(
                action = %self.action,
                step = %report.name,
                reason = %reason,
                "Step skipped"
            ),
        }
        self.steps.push(report);
    }
}

fn truncate(output: &str) -> String {
    if output.len() <= MAX_OUTPUT_BYTES {
        return output.to_string();
    }
    let mut end = MAX_OUTPUT_BYTES;
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...[truncated]", &output[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::runner::{Scripted, ScriptedRunner};

    #[tokio::test]
    async fn test_records_each_outcome() {
        let runner = ScriptedRunner::new()
            .ok("sync", "")
            .fail("apt-get", 100, "E: Could not open lock file")
            .on("dnf", Scripted::Missing);
        let mut rec = StepRecorder::new(&runner, Duration::from_secs(5), "clear_cache");

        assert!(rec.run("sync", "sync", &[]).await.is_ok());
        let err = rec.run("apt_clean", "apt-get", &["clean"]).await.unwrap_err();
        assert!(err.contains("exit 100"));
        let err = rec.run("dnf_clean", "dnf", &["clean", "all"]).await.unwrap_err();
        assert!(err.contains("unavailable"));
        rec.skip("drop_caches", "not root");

        assert_eq!(rec.failed_steps(), vec!["apt_clean", "dnf_clean"]);
        let (steps, _) = rec.finish();
        assert_eq!(steps.len(), 4);
        assert_eq!(steps[1].command.as_deref(), Some("apt-get clean"));
        assert!(matches!(steps[3].outcome, StepOutcome::Skipped(_)));
    }

    #[tokio::test]
    async fn test_step_budget_enforced() {
        let runner = ScriptedRunner::new().on(
            "find",
            Scripted::Delayed(Duration::from_secs(5), CommandOutput::ok("")),
        );
        let mut rec = StepRecorder::new(&runner, Duration::from_millis(20), "cleanup_disk");

        let err = rec.run("clean_tmp", "find", &["/tmp"]).await.unwrap_err();
        assert!(err.starts_with("timed out"));
        assert_eq!(rec.failed_steps(), vec!["clean_tmp"]);
    }

    #[tokio::test]
    async fn test_missing_optional_program_is_skipped() {
        let runner = ScriptedRunner::new().on("apt-get", Scripted::Missing);
        let mut rec = StepRecorder::new(&runner, Duration::from_secs(5), "clear_cache");

        assert!(rec.run_if_present("apt_clean", "apt-get", &["clean"]).await.is_err());
        assert!(rec.failed_steps().is_empty());
        assert!(matches!(rec.steps()[0].outcome, StepOutcome::Skipped(_)));
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        let long = "é".repeat(MAX_OUTPUT_BYTES);
        let cut = truncate(&long);
        assert!(cut.ends_with("...[truncated]"));
        assert!(cut.len() < long.len());
    }
}
