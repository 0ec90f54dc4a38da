use async_trait::async_trait;

use super::{clear_package_cache, parse_percent, summarize_steps};
use crate::executor::registry::{ActionContext, HandlerOutcome, RemediationHandler};
use crate::executor::steps::StepRecorder;
use crate::types::{ActionKind, ActionTag, AttemptStatus};

/// Frees disk space: temp files, old logs, package caches.
///
/// Measures root filesystem usage before and after and reports the
/// percentage-point delta.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskHandler;

#[async_trait]
impl RemediationHandler for DiskHandler {
    fn tag(&self) -> ActionTag {
        ActionTag::CleanupDisk
    }

    async fn execute(&self, kind: &ActionKind, ctx: &ActionContext<'_>) -> HandlerOutcome {
        let settings = ctx.settings;
        let mut rec = ctx.recorder(kind);
        let mut cleaned = false;

        let before = used_percent(&mut rec, "disk_usage_before").await;

        for dir in &settings.temp_dirs {
            let dir = dir.display().to_string();
            cleaned |= rec
                .run(
                    &format!("clean_temp:{dir}"),
                    "find",
                    &[dir.as_str(), "-xdev", "-mindepth", "1", "-type", "f", "-mmin", "+60", "-delete"],
                )
                .await
                .is_ok();
        }

        let log_dir = settings.log_dir.display().to_string();
        let age = format!("+{}", settings.log_max_age_days);
        cleaned |= rec
            .run(
                "compress_logs",
                "find",
                &[log_dir.as_str(), "-type", "f", "-name", "*.log", "-mtime", age.as_str(), "-exec", "gzip", "-f", "{}", "+"],
            )
            .await
            .is_ok();
        cleaned |= rec
            .run(
                "remove_old_archives",
                "find",
                &[log_dir.as_str(), "-type", "f", "-name", "*.gz", "-mtime", age.as_str(), "-delete"],
            )
            .await
            .is_ok();

        cleaned |= clear_package_cache(&mut rec).await;

        let after = used_percent(&mut rec, "disk_usage_after").await;
        let usage = match (before, after) {
            (Some(b), Some(a)) => {
                let delta = a - b;
                rec.metric("disk_used_before_pct", b);
                rec.metric("disk_used_after_pct", a);
                rec.metric("disk_delta_pp", delta);
                format!("disk usage {b:.0}% -> {a:.0}% ({delta:+.0} pp)")
            }
            _ => "disk usage unknown".to_string(),
        };

        let status = if cleaned {
            AttemptStatus::Succeeded
        } else {
            AttemptStatus::Failed
        };
        let detail = format!("{usage}; {}", summarize_steps(rec.steps()));
        HandlerOutcome::from_recorder(status, detail, rec)
    }
}

async fn used_percent(rec: &mut StepRecorder<'_>, step: &str) -> Option<f64> {
    let out = rec.run(step, "df", &["--output=pcent", "/"]).await.ok()?;
    parse_percent(&out.stdout)
}
