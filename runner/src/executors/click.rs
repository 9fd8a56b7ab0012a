//! Executor for `click` actions.
//!
//! The target must be interactable, not merely present. Candidates are
//! polled in declared order; the first interactable one is clicked.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};
use tracing::{debug, instrument};

use crate::backend::ElementState;
use crate::context::RunContext;
use crate::protocol::{ActionKind, ActionOutcome};

use super::{outcome_from_backend_error, ActionExecutor};

pub struct ClickExecutor;

impl ClickExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ClickExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActionExecutor for ClickExecutor {
    fn can_handle(&self, kind: ActionKind) -> bool {
        kind == ActionKind::Click
    }

    #[instrument(skip_all, fields(candidates = candidates.len(), timeout_ms = timeout.as_millis() as u64))]
    async fn execute(
        &self,
        candidates: &[String],
        timeout: Duration,
        ctx: &mut RunContext<'_>,
    ) -> ActionOutcome {
        let deadline = Instant::now() + timeout;
        let poll_interval = ctx.limits.poll_interval;

        loop {
            // Present-but-blocked candidate seen on this pass, if any.
            let mut blocked: Option<&String> = None;

            for candidate in candidates {
                match ctx.page.query(candidate).await {
                    Ok(ElementState::Interactable) => {
                        return match ctx.page.click(candidate).await {
                            Ok(()) => {
                                debug!(selector = %candidate, "clicked");
                                ActionOutcome::Succeeded {
                                    matched_selector: candidate.clone(),
                                }
                            }
                            Err(err) => outcome_from_backend_error(err),
                        };
                    }
                    Ok(ElementState::Present) => {
                        blocked.get_or_insert(candidate);
                    }
                    Ok(ElementState::Absent) => {}
                    Err(err) => return outcome_from_backend_error(err),
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return match blocked {
                    Some(selector) => ActionOutcome::ElementNotInteractable {
                        selector: selector.clone(),
                    },
                    None => ActionOutcome::TimedOut {
                        waited_ms: timeout.as_millis() as u64,
                    },
                };
            }
            sleep(poll_interval.min(deadline - now)).await;
        }
    }
}
