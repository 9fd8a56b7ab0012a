// Module: Executors
// Performs one primitive action (wait, click) against the page backend.

pub mod click;
pub mod consent;
pub mod wait;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{instrument, warn};

use crate::backend::BackendError;
use crate::context::RunContext;
use crate::protocol::{ActionDefinition, ActionKind, ActionOutcome, ClickHandlerDefinition, SelectorRef};

pub use click::ClickExecutor;
pub use consent::{dismiss_consent, DEFAULT_CONSENT_SELECTORS};
pub use wait::WaitForSelectorExecutor;

/// Slack past an action's timeout before a backend call that never returns
/// is cut off. The executors themselves stop polling at the timeout.
const HUNG_BACKEND_MARGIN: Duration = Duration::from_millis(250);

/// Trait that defines the contract for any action executor.
///
/// Executors never retry and never judge navigation: a click that lands on
/// an unexpected page still `Succeeded`. The Redirect Monitor decides that.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Checks if this executor is responsible for the given action kind.
    fn can_handle(&self, kind: ActionKind) -> bool;

    /// Runs the action against `candidates` (already resolved, in priority
    /// order) within `timeout`.
    async fn execute(
        &self,
        candidates: &[String],
        timeout: Duration,
        ctx: &mut RunContext<'_>,
    ) -> ActionOutcome;
}

/// Resolves a selector reference to its ordered candidate list.
///
/// Returns `None` for a dangling or empty handler.
pub fn resolve_candidates(
    selector: &SelectorRef,
    handlers: &BTreeMap<String, ClickHandlerDefinition>,
) -> Option<Vec<String>> {
    match selector {
        SelectorRef::Literal(selector) => Some(vec![selector.clone()]),
        SelectorRef::Handler(name) => handlers
            .get(name)
            .filter(|handler| !handler.selectors.is_empty())
            .map(|handler| handler.selectors.clone()),
    }
}

pub(crate) fn outcome_from_backend_error(err: BackendError) -> ActionOutcome {
    match err {
        BackendError::NotInteractable(selector) => ActionOutcome::ElementNotInteractable { selector },
        other => ActionOutcome::BackendError {
            message: other.to_string(),
        },
    }
}

/// Routes each action to the executor that handles its kind.
pub struct ActionDispatcher {
    executors: Vec<Box<dyn ActionExecutor>>,
}

impl ActionDispatcher {
    pub fn new() -> Self {
        Self::with_executors(vec![
            Box::new(WaitForSelectorExecutor::new()),
            Box::new(ClickExecutor::new()),
        ])
    }

    pub fn with_executors(executors: Vec<Box<dyn ActionExecutor>>) -> Self {
        Self { executors }
    }

    #[instrument(skip_all, fields(kind = %action.kind, selector = %action.selector))]
    pub async fn execute(
        &self,
        action: &ActionDefinition,
        handlers: &BTreeMap<String, ClickHandlerDefinition>,
        ctx: &mut RunContext<'_>,
    ) -> ActionOutcome {
        let Some(executor) = self.executors.iter().find(|e| e.can_handle(action.kind)) else {
            return ActionOutcome::BackendError {
                message: format!("no executor registered for '{}'", action.kind),
            };
        };

        // Only reachable with a flow that skipped load-time validation.
        let Some(candidates) = resolve_candidates(&action.selector, handlers) else {
            return ActionOutcome::BackendError {
                message: format!("selector '{}' does not resolve to any candidate", action.selector),
            };
        };

        let timeout = ctx.limits.clamp_action_timeout(action.timeout);
        match tokio::time::timeout(
            timeout + HUNG_BACKEND_MARGIN,
            executor.execute(&candidates, timeout, ctx),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "page backend did not return before the action deadline");
                ActionOutcome::TimedOut {
                    waited_ms: timeout.as_millis() as u64,
                }
            }
        }
    }
}

impl Default for ActionDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
