use async_trait::async_trait;

use crate::executor::registry::{ActionContext, HandlerOutcome, RemediationHandler};
use crate::types::{ActionKind, ActionTag, AttemptStatus};

/// Reboots the node.
///
/// Success means the reboot command was accepted. Whether the node comes
/// back healthy is left to the next alert cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct RebootHandler;

#[async_trait]
impl RemediationHandler for RebootHandler {
    fn tag(&self) -> ActionTag {
        ActionTag::Reboot
    }

    async fn execute(&self, kind: &ActionKind, ctx: &ActionContext<'_>) -> HandlerOutcome {
        let mut rec = ctx.recorder(kind);

        let primary = match rec.run("systemctl_reboot", "systemctl", &["reboot"]).await {
            Ok(_) => {
                return HandlerOutcome::from_recorder(
                    AttemptStatus::Succeeded,
                    "reboot accepted by systemctl",
                    rec,
                )
            }
            Err(cause) => cause,
        };

        match rec.run("shutdown_reboot", "shutdown", &["-r", "now"]).await {
            Ok(_) => HandlerOutcome::from_recorder(
                AttemptStatus::Succeeded,
                format!("reboot accepted by shutdown after systemctl failed ({primary})"),
                rec,
            ),
            Err(fallback) => HandlerOutcome::from_recorder(
                AttemptStatus::Failed,
                format!("reboot not accepted; tried systemctl ({primary}), shutdown ({fallback})"),
                rec,
            ),
        }
    }
}
