//! # Executor wait_for_selector
//!
//! Faz polling até que um dos seletores candidatos esteja presente no DOM,
//! ou até o timeout da ação acabar.
//!
//! ## Exemplo no funil:
//!
//! ```json
//! { "type": "wait_for_selector", "selector": "#plan-list", "timeout_ms": 8000 }
//! ```
//!
//! Com handler, o primeiro candidato (na ordem declarada) que aparecer vence.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::backend::ElementState;
use crate::context::RunContext;
use crate::protocol::{ActionKind, ActionOutcome};

use super::{outcome_from_backend_error, ActionExecutor};

/// Executor para ações `wait_for_selector`.
///
/// Presença basta; não exige que o elemento seja clicável.
pub struct WaitForSelectorExecutor;

impl WaitForSelectorExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for WaitForSelectorExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActionExecutor for WaitForSelectorExecutor {
    fn can_handle(&self, kind: ActionKind) -> bool {
        kind == ActionKind::WaitForSelector
    }

    #[instrument(skip_all, fields(candidates = candidates.len(), timeout_ms = timeout.as_millis() as u64))]
    async fn execute(
        &self,
        candidates: &[String],
        timeout: Duration,
        ctx: &mut RunContext<'_>,
    ) -> ActionOutcome {
        let poll_interval = ctx.limits.poll_interval;
        let found = ctx
            .page
            .wait_for_any(candidates, ElementState::Present, timeout, poll_interval)
            .await;

        match found {
            Ok(Some(index)) => match candidates.get(index) {
                Some(selector) => {
                    debug!(selector = %selector, "⏳ seletor presente");
                    ActionOutcome::Succeeded {
                        matched_selector: selector.clone(),
                    }
                }
                None => ActionOutcome::BackendError {
                    message: format!("backend reported candidate #{} of {}", index, candidates.len()),
                },
            },
            Ok(None) => ActionOutcome::TimedOut {
                waited_ms: timeout.as_millis() as u64,
            },
            Err(err) => outcome_from_backend_error(err),
        }
    }
}

// ============================================================================
// TESTES
// ============================================================================
