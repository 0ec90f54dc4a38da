use async_trait::async_trait;

use super::{clear_package_cache, parse_mem_available_kb, summarize_steps};
use crate::executor::registry::{ActionContext, HandlerOutcome, RemediationHandler};
use crate::executor::steps::StepRecorder;
use crate::types::{ActionKind, ActionTag, AttemptStatus};

const DROP_CACHES: &str = "echo 3 > /proc/sys/vm/drop_caches";

/// Flushes OS page/inode caches and package-manager caches.
///
/// Dropping kernel caches needs root; without it that step is skipped and
/// the package cache is still cleared. Reports the change in available
/// memory as `freed_memory_mb`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheHandler;

#[async_trait]
impl RemediationHandler for CacheHandler {
    fn tag(&self) -> ActionTag {
        ActionTag::ClearCache
    }

    async fn execute(&self, kind: &ActionKind, ctx: &ActionContext<'_>) -> HandlerOutcome {
        let mut rec = ctx.recorder(kind);

        let before = mem_available_kb(&mut rec, "meminfo_before").await;

        let privileged = rec
            .run("check_privilege", "id", &["-u"])
            .await
            .is_ok_and(|out| out.stdout.trim() == "0");

        let _ = rec.run("sync", "sync", &[]).await;

        let dropped = if privileged {
            rec.run("drop_caches", "sh", &["-c", DROP_CACHES]).await.is_ok()
        } else {
            rec.skip("drop_caches", "insufficient privilege (not root)");
            false
        };

        let packages = clear_package_cache(&mut rec).await;

        let after = mem_available_kb(&mut rec, "meminfo_after").await;
        let freed = match (before, after) {
            (Some(b), Some(a)) => {
                let mb = (a - b) / 1024.0;
                rec.metric("freed_memory_mb", mb);
                format!("freed {mb:.0} MB")
            }
            _ => "freed memory unknown".to_string(),
        };

        let status = if dropped || packages {
            AttemptStatus::Succeeded
        } else {
            AttemptStatus::Failed
        };
        let detail = format!("{freed}; {}", summarize_steps(rec.steps()));
        HandlerOutcome::from_recorder(status, detail, rec)
    }
}

async fn mem_available_kb(rec: &mut StepRecorder<'_>, step: &str) -> Option<f64> {
    let out = rec.run(step, "cat", &["/proc/meminfo"]).await.ok()?;
    parse_mem_available_kb(&out.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::actions::test_support::settings;
    use crate::executor::runner::{Scripted, ScriptedRunner};
    use crate::types::StepOutcome;

    const MEM_BEFORE: &str = "MemTotal: 8000000 kB\nMemAvailable: 1048576 kB\n";
    const MEM_AFTER: &str = "MemTotal: 8000000 kB\nMemAvailable: 1572864 kB\n";

    #[tokio::test]
    async fn test_root_drops_caches_and_reports_delta() {
        let runner = ScriptedRunner::new()
            .ok("cat /proc/meminfo", MEM_BEFORE)
            .ok("cat /proc/meminfo", MEM_AFTER)
            .ok("id -u", "0\n");
        let settings = settings();
        let ctx = ActionContext { runner: &runner, settings: &settings };

        let outcome = CacheHandler.execute(&ActionKind::ClearCache, &ctx).await;
        assert_eq!(outcome.status, AttemptStatus::Succeeded);
        assert_eq!(outcome.metrics.get("freed_memory_mb"), Some(&512.0));
        assert!(outcome.detail.starts_with("freed 512 MB"));
        assert!(runner
            .calls()
            .contains(&format!("sh -c {DROP_CACHES}")));
    }

    #[tokio::test]
    async fn test_unprivileged_skips_drop_but_clears_packages() {
        let runner = ScriptedRunner::new()
            .ok("id -u", "1000\n")
            .fail("apt-get", 100, "E: Could not open lock file");
        let settings = settings();
        let ctx = ActionContext { runner: &runner, settings: &settings };

        let outcome = CacheHandler.execute(&ActionKind::ClearCache, &ctx).await;
        assert_eq!(outcome.status, AttemptStatus::Failed);
        let drop = outcome.steps.iter().find(|s| s.name == "drop_caches").unwrap();
        assert!(matches!(drop.outcome, StepOutcome::Skipped(_)));
        assert!(outcome.detail.contains("apt_clean (exit 100"));
    }

    #[tokio::test]
    async fn test_partial_failure_is_visible() {
        let runner = ScriptedRunner::new()
            .ok("id -u", "0")
            .on("apt-get", Scripted::Missing)
            .fail("dnf", 1, "Error: cache locked");
        let settings = settings();
        let ctx = ActionContext { runner: &runner, settings: &settings };

        let outcome = CacheHandler.execute(&ActionKind::ClearCache, &ctx).await;
        assert_eq!(outcome.status, AttemptStatus::Succeeded);
        assert!(outcome.detail.contains("drop_caches"));
        assert!(outcome.detail.contains("failed: dnf_clean"));
        assert!(outcome.detail.contains("apt_clean (apt-get not installed)"));
    }
}
