use async_trait::async_trait;
use regex::Regex;
use std::sync::LazyLock;

use crate::executor::registry::{ActionContext, HandlerOutcome, RemediationHandler};
use crate::types::{ActionKind, ActionTag, AttemptStatus};

static SERVICE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9@._:-]{0,127}$").expect("static regex")
});

/// Restarts a named service.
///
/// Tries the primary service manager first and the legacy `service`
/// wrapper second; the detail names every mechanism tried.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServiceHandler;

#[async_trait]
impl RemediationHandler for ServiceHandler {
    fn tag(&self) -> ActionTag {
        ActionTag::RestartService
    }

    async fn execute(&self, kind: &ActionKind, ctx: &ActionContext<'_>) -> HandlerOutcome {
        let ActionKind::RestartService(name) = kind else {
            return HandlerOutcome::bare(
                AttemptStatus::Failed,
                format!("restart handler cannot run {kind}"),
            );
        };
        if !SERVICE_NAME.is_match(name) {
            return HandlerOutcome::bare(
                AttemptStatus::Failed,
                format!("invalid service name {name:?}"),
            );
        }

        let mut rec = ctx.recorder(kind);

        let primary = match rec.run_if_present("detect_systemd", "systemctl", &["--version"]).await {
            Ok(_) => match rec.run("systemctl_restart", "systemctl", &["restart", name.as_str()]).await {
                Ok(_) => {
                    return HandlerOutcome::from_recorder(
                        AttemptStatus::Succeeded,
                        format!("restarted {name} via systemctl"),
                        rec,
                    );
                }
                Err(cause) => format!("systemctl ({cause})"),
            },
            Err(_) => {
                rec.skip("systemctl_restart", "no service manager");
                "systemctl (no service manager)".to_string()
            }
        };

        match rec.run("service_restart", "service", &[name.as_str(), "restart"]).await {
            Ok(_) => HandlerOutcome::from_recorder(
                AttemptStatus::Succeeded,
                format!("restarted {name} via service (legacy); tried {primary}, then service (succeeded)"),
                rec,
            ),
            Err(cause) => HandlerOutcome::from_recorder(
                AttemptStatus::Failed,
                format!("could not restart {name}; tried {primary}, service ({cause})"),
                rec,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::actions::test_support::settings;
    use crate::executor::runner::{Scripted, ScriptedRunner};
    use crate::types::StepOutcome;

    fn nginx() -> ActionKind {
        ActionKind::RestartService("nginx".into())
    }

    #[tokio::test]
    async fn test_primary_restart() {
        let runner = ScriptedRunner::new();
        let settings = settings();
        let ctx = ActionContext { runner: &runner, settings: &settings };

        let outcome = ServiceHandler.execute(&nginx(), &ctx).await;
        assert_eq!(outcome.status, AttemptStatus::Succeeded);
        assert_eq!(outcome.detail, "restarted nginx via systemctl");
        assert_eq!(runner.calls(), vec!["systemctl --version", "systemctl restart nginx"]);
    }

    #[tokio::test]
    async fn test_legacy_fallback_names_both_mechanisms() {
        let runner = ScriptedRunner::new()
            .ok("systemctl --version", "systemd 252")
            .fail("systemctl restart nginx", 1, "Job for nginx.service failed");
        let settings = settings();
        let ctx = ActionContext { runner: &runner, settings: &settings };

        let outcome = ServiceHandler.execute(&nginx(), &ctx).await;
        assert_eq!(outcome.status, AttemptStatus::Succeeded);
        assert!(outcome.detail.contains("systemctl"));
        assert!(outcome.detail.contains("via service"));
        assert!(matches!(outcome.steps[1].outcome, StepOutcome::Failed(_)));
        assert!(outcome.steps[2].succeeded());
    }

    #[tokio::test]
    async fn test_no_service_manager() {
        let runner = ScriptedRunner::new().on("systemctl", Scripted::Missing);
        let settings = settings();
        let ctx = ActionContext { runner: &runner, settings: &settings };

        let outcome = ServiceHandler.execute(&nginx(), &ctx).await;
        assert_eq!(outcome.status, AttemptStatus::Succeeded);
        assert!(outcome.detail.contains("no service manager"));
    }

    #[tokio::test]
    async fn test_both_mechanisms_fail() {
        let runner = ScriptedRunner::new()
            .fail("systemctl restart nginx", 5, "Unit nginx.service not found.")
            .fail("service", 1, "nginx: unrecognized service");
        let settings = settings();
        let ctx = ActionContext { runner: &runner, settings: &settings };

        let outcome = ServiceHandler.execute(&nginx(), &ctx).await;
        assert_eq!(outcome.status, AttemptStatus::Failed);
        assert!(outcome.detail.contains("systemctl (exit 5"));
        assert!(outcome.detail.contains("service (exit 1"));
    }

    #[tokio::test]
    async fn test_rejects_unsafe_service_name() {
        let runner = ScriptedRunner::new();
        let settings = settings();
        let ctx = ActionContext { runner: &runner, settings: &settings };

        let outcome = ServiceHandler
            .execute(&ActionKind::RestartService("nginx; rm -rf /".into()), &ctx)
            .await;
        assert_eq!(outcome.status, AttemptStatus::Failed);
        assert!(runner.calls().is_empty());
    }
}
