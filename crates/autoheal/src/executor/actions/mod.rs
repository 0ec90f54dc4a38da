//! Built-in remediation handlers.

mod cache;
mod diagnostics;
mod disk;
mod reboot;
mod service;

pub use cache::CacheHandler;
pub use diagnostics::DiagnosticsHandler;
pub use disk::DiskHandler;
pub use reboot::RebootHandler;
pub use service::ServiceHandler;

use async_trait::async_trait;

use super::registry::{ActionContext, HandlerOutcome, RemediationHandler};
use super::steps::StepRecorder;
use crate::types::{ActionKind, ActionTag, AttemptStatus, StepOutcome, StepReport};

/// Package managers tried for cache cleanup, first installed one wins.
const PACKAGE_CACHE_COMMANDS: [(&str, &str, &[&str]); 3] = [
    ("apt_clean", "apt-get", &["clean"]),
    ("dnf_clean", "dnf", &["clean", "all"]),
    ("yum_clean", "yum", &["clean", "all"]),
];

/// Deliberately does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpHandler;

#[async_trait]
impl RemediationHandler for NoOpHandler {
    fn tag(&self) -> ActionTag {
        ActionTag::NoOp
    }

    async fn execute(&self, _kind: &ActionKind, _ctx: &ActionContext<'_>) -> HandlerOutcome {
        HandlerOutcome::bare(AttemptStatus::Succeeded, "no action required")
    }
}

/// Clear the package-manager cache with the first installed manager.
///
/// Returns whether a cache was cleared.
pub(crate) async fn clear_package_cache(rec: &mut StepRecorder<'_>) -> bool {
    for (name, program, args) in PACKAGE_CACHE_COMMANDS {
        match rec.run_if_present(name, program, args).await {
            Ok(_) => return true,
            Err(_) if is_skipped(rec.steps().last()) => {}
            Err(_) => return false,
        }
    }
    false
}

fn is_skipped(step: Option<&StepReport>) -> bool {
    step.is_some_and(|s| matches!(s.outcome, StepOutcome::Skipped(_)))
}

/// Parse a `df --output=pcent` style percentage from the last non-empty line.
pub(crate) fn parse_percent(stdout: &str) -> Option<f64> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())?
        .trim_end_matches('%')
        .trim()
        .parse()
        .ok()
}

/// Parse `MemAvailable` (kB) from `/proc/meminfo`.
pub(crate) fn parse_mem_available_kb(meminfo: &str) -> Option<f64> {
    meminfo
        .lines()
        .find_map(|l| l.strip_prefix("MemAvailable:"))?
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

/// One-line account of which steps ran, failed or were skipped.
pub(crate) fn summarize_steps(steps: &[StepReport]) -> String {
    let mut ran = Vec::new();
    let mut failed = Vec::new();
    let mut skipped = Vec::new();
    for step in steps {
        match &step.outcome {
            StepOutcome::Succeeded => ran.push(step.name.clone()),
            StepOutcome::Failed(cause) => failed.push(format!("{} ({cause})", step.name)),
            StepOutcome::Skipped(reason) => skipped.push(format!("{} ({reason})", step.name)),
        }
    }

    let mut parts = vec![format!("ran: {}", join_or_none(&ran))];
    if !failed.is_empty() {
        parts.push(format!("failed: {}", failed.join(", ")));
    }
    if !skipped.is_empty() {
        parts.push(format!("skipped: {}", skipped.join(", ")));
    }
    parts.join("; ")
}

fn join_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.join(", ")
    }
}
