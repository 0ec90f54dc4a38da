use async_trait::async_trait;

use crate::executor::registry::{ActionContext, HandlerOutcome, RemediationHandler};
use crate::types::{ActionKind, ActionTag, AttemptStatus};

/// Gathers a diagnostic snapshot of the node.
///
/// Always succeeds; individual collectors that fail are recorded as failed
/// steps but do not fail the action.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiagnosticsHandler;

#[async_trait]
impl RemediationHandler for DiagnosticsHandler {
    fn tag(&self) -> ActionTag {
        ActionTag::CollectDiagnostics
    }

    async fn execute(&self, kind: &ActionKind, ctx: &ActionContext<'_>) -> HandlerOutcome {
        let mut rec = ctx.recorder(kind);
        let head = ctx.settings.diagnostics_lines + 1;
        let top_cpu = format!("ps aux --sort=-%cpu | head -n {head}");
        let top_mem = format!("ps aux --sort=-%mem | head -n {head}");

        let collectors: [(&str, &str, Vec<&str>); 7] = [
            ("uptime", "uptime", vec![]),
            ("disk", "df", vec!["-h"]),
            ("memory", "free", vec!["-m"]),
            ("load_average", "cat", vec!["/proc/loadavg"]),
            ("top_cpu", "sh", vec!["-c", top_cpu.as_str()]),
            ("top_memory", "sh", vec!["-c", top_mem.as_str()]),
            ("network", "ss", vec!["-s"]),
        ];

        let total = collectors.len();
        let mut collected = 0;
        for (name, program, args) in &collectors {
            if rec.run(name, program, args).await.is_ok() {
                collected += 1;
            }
        }

        if let Some(load) = rec
            .steps()
            .iter()
            .find(|s| s.name == "load_average" && s.succeeded())
            .and_then(|s| s.output.split_whitespace().next())
            .and_then(|v| v.parse::<f64>().ok())
        {
            rec.metric("load_1m", load);
        }

        let mut detail = format!("collected {collected}/{total} diagnostics");
        let failed = rec.failed_steps();
        if !failed.is_empty() {
            detail.push_str(&format!("; unavailable: {}", failed.join(", ")));
        }
        HandlerOutcome::from_recorder(AttemptStatus::Succeeded, detail, rec)
    }
}
