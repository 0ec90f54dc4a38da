//! Closed registry mapping each action kind to its handler.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;

use super::actions::{
    CacheHandler, DiagnosticsHandler, DiskHandler, NoOpHandler, RebootHandler, ServiceHandler,
};
use super::runner::CommandRunner;
use super::steps::StepRecorder;
use super::ExecutorSettings;
use crate::types::{ActionKind, ActionTag, AttemptStatus, StepReport};

/// What a handler needs from the node.
pub struct ActionContext<'a> {
    pub runner: &'a dyn CommandRunner,
    pub settings: &'a ExecutorSettings,
}

impl ActionContext<'_> {
    /// Step recorder bound to this context's runner and budget.
    #[must_use]
    pub fn recorder(&self, kind: &ActionKind) -> StepRecorder<'_> {
        StepRecorder::new(self.runner, self.settings.step_timeout, kind.to_string())
    }
}

/// Result of running a handler, before lock and timing info is attached.
#[derive(Debug, Clone)]
pub struct HandlerOutcome {
    pub status: AttemptStatus,
    pub detail: String,
    pub steps: Vec<StepReport>,
    pub metrics: BTreeMap<String, f64>,
}

impl HandlerOutcome {
    /// Close out a recorder with a status and detail.
    #[must_use]
    pub fn from_recorder(status: AttemptStatus, detail: impl Into<String>, recorder: StepRecorder<'_>) -> Self {
        let (steps, metrics) = recorder.finish();
        Self {
            status,
            detail: detail.into(),
            steps,
            metrics,
        }
    }

    /// Outcome with no steps.
    #[must_use]
    pub fn bare(status: AttemptStatus, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
            steps: Vec::new(),
            metrics: BTreeMap::new(),
        }
    }
}

/// Executes one kind of remediation on the local node.
///
/// Handlers never return errors: every failure is expressed as a
/// `Failed` outcome with a cause string.
#[async_trait]
pub trait RemediationHandler: Send + Sync {
    /// Action this handler serves
    fn tag(&self) -> ActionTag;

    async fn execute(&self, kind: &ActionKind, ctx: &ActionContext<'_>) -> HandlerOutcome;
}

/// Dispatch table keyed by [`ActionTag`].
#[derive(Default)]
pub struct ActionRegistry {
    handlers: BTreeMap<ActionTag, Box<dyn RemediationHandler>>,
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("tags", &self.tags())
            .finish()
    }
}

impl ActionRegistry {
    /// Registry with no handlers.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with the built-in handler for every action.
    #[must_use]
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(RebootHandler));
        registry.register(Box::new(ServiceHandler));
        registry.register(Box::new(CacheHandler));
        registry.register(Box::new(DiskHandler));
        registry.register(Box::new(DiagnosticsHandler));
        registry.register(Box::new(NoOpHandler));
        registry
    }

    /// Add or replace the handler for its tag.
    pub fn register(&mut self, handler: Box<dyn RemediationHandler>) {
        self.handlers.insert(handler.tag(), handler);
    }

    /// Handler for a tag.
    #[must_use]
    pub fn get(&self, tag: ActionTag) -> Option<&dyn RemediationHandler> {
        self.handlers.get(&tag).map(|h| &**h)
    }

    /// Registered tags in order.
    #[must_use]
    pub fn tags(&self) -> Vec<ActionTag> {
        self.handlers.keys().copied().collect()
    }
}
