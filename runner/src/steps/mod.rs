// Module: Steps
// Runs one flow step: actions in order, redirect check, policy resolution.

pub mod policy;

use std::collections::BTreeMap;

use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, instrument, warn, Span};

use crate::context::RunContext;
use crate::errors::{AuditError, ErrorCode};
use crate::executors::ActionDispatcher;
use crate::monitor::{RedirectMonitor, RedirectVerdict};
use crate::protocol::{
    ActionDefinition, ActionOutcome, ActionRecord, ClickHandlerDefinition, RetryPolicy,
    StepDefinition, StepResult, StepStatus,
};
use crate::retry::{is_retryable, RetrySchedule};

use policy::{Facts, Resolution};

const BACKEND_FAULT_RULE: &str = "backend_fault";

/// What came out of running a step.
#[derive(Debug)]
pub enum StepOutcome {
    Completed(StepResult),
    /// The run was cancelled mid-step; nothing is recorded for it.
    Cancelled,
    /// The page backend broke. `result` is the faulting step, recorded as failed.
    Aborted { result: StepResult, error: AuditError },
}

pub struct StepRunner<'f> {
    handlers: &'f BTreeMap<String, ClickHandlerDefinition>,
    dispatcher: &'f ActionDispatcher,
    monitor: RedirectMonitor,
}

impl<'f> StepRunner<'f> {
    pub fn new(
        handlers: &'f BTreeMap<String, ClickHandlerDefinition>,
        dispatcher: &'f ActionDispatcher,
    ) -> Self {
        Self {
            handlers,
            dispatcher,
            monitor: RedirectMonitor::new(),
        }
    }

    #[instrument(
        name = "step",
        skip_all,
        fields(step.number = step.step_number, step.name = %step.name, step.status = tracing::field::Empty)
    )]
    pub async fn run(&self, step: &StepDefinition, ctx: &mut RunContext<'_>) -> StepOutcome {
        let started = Instant::now();
        let mut records = Vec::with_capacity(step.actions.len());
        let mut failure: Option<(String, ErrorCode)> = None;

        for (index, action) in step.actions.iter().enumerate() {
            if ctx.is_cancelled() {
                return StepOutcome::Cancelled;
            }
            let Some(record) = self.run_action(index, action, step.retry.as_ref(), ctx).await else {
                return StepOutcome::Cancelled;
            };
            let outcome = record.outcome.clone();
            records.push(record);

            match outcome {
                ActionOutcome::Succeeded { .. } => {}
                ActionOutcome::BackendError { message } => {
                    return aborted(step, records, started, None, message);
                }
                other => {
                    failure = Some(describe_failure(index, action, &other));
                    break;
                }
            }
        }
        let actions_succeeded = failure.is_none();

        let limit = ctx.limits.navigation_timeout;
        let observed = match timeout(limit, ctx.page.current_url()).await {
            Ok(Ok(url)) => url,
            Ok(Err(err)) => {
                return aborted(step, records, started, None, format!("could not read current URL: {}", err));
            }
            Err(_) => {
                let message = format!("current URL not reported within {}ms", limit.as_millis());
                return aborted(step, records, started, None, message);
            }
        };

        let verdict = self.monitor.classify(&observed, step, ctx.previous_step_url());
        let facts = Facts {
            verdict: verdict.kind(),
            actions_succeeded,
            optional: step.optional,
            continue_on_failure: step.continue_on_failure,
        };
        let (mut rule, mut resolution) = policy::resolve(&facts);

        if actions_succeeded && verdict == RedirectVerdict::UnexpectedLocation {
            failure = Some((
                format!(
                    "location mismatch: expected '{}', observed '{}'",
                    step.expected_url, observed
                ),
                ErrorCode::LOCATION_MISMATCH,
            ));
        }

        match (resolution, &verdict) {
            (Resolution::Pass, _) => ctx.record_good_url(observed.clone()),
            (Resolution::Recover, RedirectVerdict::KnownRedirect { pattern, target }) => {
                info!(pattern = %pattern, target = %target, "↩️ known redirect, returning");
                match timeout(limit, ctx.page.navigate(target)).await {
                    Ok(Ok(())) => {
                        ctx.record_good_url(target.clone());
                        failure = None;
                    }
                    Ok(Err(err)) => {
                        let message = format!("recovery navigation to '{}' failed: {}", target, err);
                        return aborted(step, records, started, Some(observed), message);
                    }
                    Err(_) => {
                        (rule, resolution) = policy::gate_failure(step.optional, step.continue_on_failure);
                        failure = Some((
                            format!(
                                "recovery navigation to '{}' did not finish within {}ms",
                                target,
                                limit.as_millis()
                            ),
                            ErrorCode::RECOVERY_FAILED,
                        ));
                    }
                }
            }
            _ => {}
        }

        let status = resolution.status();
        Span::current().record("step.status", tracing::field::debug(status));

        let (error, error_code) = match failure {
            Some((message, code)) if !status.counts_as_pass() || status == StepStatus::Skipped => {
                (Some(message), Some(code.formatted()))
            }
            _ => (None, None),
        };
        match status {
            StepStatus::Failed => warn!(rule, error = ?error, "❌ step failed"),
            StepStatus::Skipped => info!(rule, error = ?error, "⏭️ optional step skipped"),
            _ => info!(rule, "✅ step done"),
        }

        StepOutcome::Completed(StepResult {
            step_number: step.step_number,
            name: step.name.clone(),
            status,
            actions: records,
            elapsed_ms: started.elapsed().as_millis() as u64,
            error,
            error_code,
            observed_url: Some(observed),
            verdict: Some(verdict.kind()),
            policy_rule: rule.to_string(),
            halted_flow: resolution.halts(),
        })
    }

    /// Runs one action with the step's retry policy. `None` means the run was
    /// cancelled while waiting to retry.
    async fn run_action(
        &self,
        index: usize,
        action: &ActionDefinition,
        retry: Option<&RetryPolicy>,
        ctx: &mut RunContext<'_>,
    ) -> Option<ActionRecord> {
        let started = Instant::now();
        let cancel = ctx.cancellation().clone();
        let mut schedule = RetrySchedule::new(retry);
        let mut attempts = 1;

        let outcome = loop {
            let outcome = self.dispatcher.execute(action, self.handlers, ctx).await;
            if !is_retryable(&outcome) {
                break outcome;
            }
            let Some(delay) = schedule.next_delay() else {
                break outcome;
            };
            if !ctx.retries.try_increment() {
                warn!(limit = ctx.retries.limit(), "run-wide retry budget exhausted");
                break outcome;
            }
            debug!(attempt = attempts + 1, delay_ms = delay.as_millis() as u64, "🔄 retrying action");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                _ = sleep(delay) => {}
            }
            attempts += 1;
        };

        Some(ActionRecord {
            index,
            kind: action.kind,
            selector: action.selector.to_string(),
            outcome,
            attempts,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }
}

fn describe_failure(index: usize, action: &ActionDefinition, outcome: &ActionOutcome) -> (String, ErrorCode) {
    let label = format!("action {} ({} {})", index + 1, action.kind, action.selector);
    match outcome {
        ActionOutcome::TimedOut { waited_ms } => (
            format!("{} timed out after {}ms", label, waited_ms),
            ErrorCode::ACTION_TIMEOUT,
        ),
        ActionOutcome::ElementNotInteractable { selector } => (
            format!("{}: '{}' is present but not interactable", label, selector),
            ErrorCode::ELEMENT_NOT_INTERACTABLE,
        ),
        ActionOutcome::BackendError { message } => (format!("{}: {}", label, message), ErrorCode::BACKEND_FAULT),
        ActionOutcome::Succeeded { .. } => (format!("{} succeeded", label), ErrorCode::INTERNAL_ERROR),
    }
}

fn aborted(
    step: &StepDefinition,
    actions: Vec<ActionRecord>,
    started: Instant,
    observed_url: Option<String>,
    message: String,
) -> StepOutcome {
    error!(step = step.step_number, error = %message, "💥 page backend fault, aborting run");
    Span::current().record("step.status", tracing::field::debug(StepStatus::Failed));

    let result = StepResult {
        step_number: step.step_number,
        name: step.name.clone(),
        status: StepStatus::Failed,
        actions,
        elapsed_ms: started.elapsed().as_millis() as u64,
        error: Some(message.clone()),
        error_code: Some(ErrorCode::BACKEND_FAULT.formatted()),
        observed_url,
        verdict: None,
        policy_rule: BACKEND_FAULT_RULE.to_string(),
        halted_flow: true,
    };
    StepOutcome::Aborted {
        result,
        error: AuditError::BackendFault {
            step_number: Some(step.step_number),
            message,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, ElementSpec, ElementState, PageBackend, PageSpec, SimulatedPage, SiteMap};
    use async_trait::async_trait;
    use crate::limits::AuditLimits;
    use crate::protocol::{
        ActionKind, RedirectPolicy, ReturnTarget, SelectorRef, VerdictKind,
    };
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    const HOME: &str = "https://tv.test/";
    const PACKAGES: &str = "https://tv.test/packages";
    const LOGIN: &str = "https://tv.test/login";
    const OOPS: &str = "https://tv.test/oops";
    const SLOW: &str = "https://tv.test/slow";

    fn site() -> Arc<SiteMap> {
        Arc::new(
            SiteMap::new()
                .page(
                    HOME,
                    PageSpec::new()
                        .element("#hero", ElementSpec::interactable())
                        .element("#packages", ElementSpec::interactable().navigates_to(PACKAGES))
                        .element("#account", ElementSpec::interactable().navigates_to(LOGIN))
                        .element("#broken-link", ElementSpec::interactable().navigates_to(OOPS))
                        .element("#greyed", ElementSpec::present_only())
                        .element("#crash", ElementSpec::interactable()),
                )
                .page(PACKAGES, PageSpec::new().element("#sports", ElementSpec::interactable()))
                .page(LOGIN, PageSpec::new().element("#to-slow", ElementSpec::interactable().navigates_to(SLOW)))
                .page(OOPS, PageSpec::new())
                .page(SLOW, PageSpec::new().loads_in(2_000))
                .faulty("#crash"),
        )
    }

    fn click(selector: &str) -> ActionDefinition {
        ActionDefinition::new(ActionKind::Click, SelectorRef::Literal(selector.to_string()), Duration::from_millis(40))
    }

    fn wait(selector: &str) -> ActionDefinition {
        ActionDefinition::new(
            ActionKind::WaitForSelector,
            SelectorRef::Literal(selector.to_string()),
            Duration::from_millis(40),
        )
    }

    fn step(expected_url: &str, actions: Vec<ActionDefinition>) -> StepDefinition {
        StepDefinition {
            step_number: 1,
            name: "Browse".to_string(),
            expected_url: expected_url.to_string(),
            actions,
            optional: false,
            continue_on_failure: false,
            redirect_policy: None,
            retry: None,
        }
    }

    async fn home() -> SimulatedPage {
        let mut page = SimulatedPage::new(site());
        page.navigate(HOME).await.unwrap();
        page
    }

    async fn run(page: &mut SimulatedPage, step: &StepDefinition) -> (StepOutcome, Option<String>) {
        let handlers = BTreeMap::new();
        let dispatcher = ActionDispatcher::new();
        let mut ctx = RunContext::new(page, HOME, AuditLimits::strict(), CancellationToken::new());
        let outcome = StepRunner::new(&handlers, &dispatcher).run(step, &mut ctx).await;
        (outcome, ctx.last_good_url.clone())
    }

    fn completed(outcome: StepOutcome) -> StepResult {
        match outcome {
            StepOutcome::Completed(result) => result,
            other => panic!("expected a completed step, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_passing_step_records_good_url() {
        let mut page = home().await;
        let (outcome, good_url) = run(&mut page, &step("/packages", vec![wait("#hero"), click("#packages")])).await;
        let result = completed(outcome);

        assert_eq!(result.status, StepStatus::Passed);
        assert_eq!(result.policy_rule, "on_track");
        assert_eq!(result.actions.len(), 2);
        assert!(result.error.is_none());
        assert_eq!(good_url.as_deref(), Some(PACKAGES));
    }

    #[tokio::test]
    async fn test_first_failed_action_stops_the_step() {
        let mut page = home().await;
        let (outcome, good_url) = run(&mut page, &step("/", vec![click("#missing"), click("#packages")])).await;
        let result = completed(outcome);

        assert_eq!(result.status, StepStatus::Failed);
        assert!(result.halted_flow);
        assert_eq!(result.actions.len(), 1);
        assert_eq!(result.error_code.as_deref(), Some("E2001"));
        assert!(good_url.is_none());
    }

    #[tokio::test]
    async fn test_not_interactable_failure_continues() {
        let mut page = home().await;
        let mut s = step("/", vec![click("#greyed")]);
        s.continue_on_failure = true;
        let result = completed(run(&mut page, &s).await.0);

        assert_eq!(result.status, StepStatus::Failed);
        assert!(!result.halted_flow);
        assert_eq!(result.policy_rule, "continue_on_failure");
        assert_eq!(result.error_code.as_deref(), Some("E2002"));
    }

    #[tokio::test]
    async fn test_optional_failure_is_skipped_with_detail() {
        let mut page = home().await;
        let mut s = step("/", vec![wait("#promo-popup")]);
        s.optional = true;
        let result = completed(run(&mut page, &s).await.0);

        assert_eq!(result.status, StepStatus::Skipped);
        assert!(result.error.is_some());
        assert!(!result.halted_flow);
    }

    #[tokio::test]
    async fn test_location_mismatch_after_successful_actions() {
        let mut page = home().await;
        let result = completed(run(&mut page, &step("/packages", vec![click("#broken-link")])).await.0);

        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.verdict, Some(VerdictKind::UnexpectedLocation));
        assert_eq!(result.error_code.as_deref(), Some("E3001"));
        assert!(result.error.unwrap().contains("location mismatch"));
        assert_eq!(result.observed_url.as_deref(), Some(OOPS));
    }

    #[tokio::test]
    async fn test_known_redirect_navigates_back() {
        let mut page = home().await;
        let mut s = step("/packages", vec![click("#account")]);
        s.redirect_policy = Some(RedirectPolicy {
            detect_patterns: vec!["/login".to_string()],
            return_to: ReturnTarget::PreviousStepUrl,
        });
        let (outcome, good_url) = run(&mut page, &s).await;
        let result = completed(outcome);

        assert_eq!(result.status, StepStatus::RedirectedAndRecovered);
        assert_eq!(result.observed_url.as_deref(), Some(LOGIN));
        // No earlier good step: previous_step_url falls back to the start URL.
        assert_eq!(good_url.as_deref(), Some(HOME));
        assert_eq!(page.current_url().await.unwrap(), HOME);
    }

    #[tokio::test]
    async fn test_recovery_navigation_timeout_is_policy_gated() {
        let mut page = home().await;
        page.navigate(LOGIN).await.unwrap();
        let mut s = step("/packages", vec![]);
        s.optional = true;
        s.redirect_policy = Some(RedirectPolicy {
            detect_patterns: vec!["/login".to_string()],
            return_to: ReturnTarget::Url(SLOW.to_string()),
        });
        let result = completed(run(&mut page, &s).await.0);

        assert_eq!(result.status, StepStatus::Skipped);
        assert_eq!(result.error_code.as_deref(), Some("E3002"));
    }

    #[tokio::test]
    async fn test_backend_fault_aborts() {
        let mut page = home().await;
        let mut s = step("/", vec![wait("#hero"), click("#crash")]);
        s.optional = true;
        match run(&mut page, &s).await.0 {
            StepOutcome::Aborted { result, error } => {
                assert_eq!(result.status, StepStatus::Failed);
                assert_eq!(result.actions.len(), 2);
                assert_eq!(result.error_code.as_deref(), Some("E5001"));
                assert!(matches!(error, AuditError::BackendFault { step_number: Some(1), .. }));
            }
            other => panic!("expected abort, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retry_recovers_late_element() {
        let site = Arc::new(SiteMap::new().page(
            HOME,
            PageSpec::new().element("#late", ElementSpec::interactable().appears_after(60)),
        ));
        let mut page = SimulatedPage::new(site);
        page.navigate(HOME).await.unwrap();
        let mut s = step("/", vec![wait("#late")]);
        s.retry = Some(RetryPolicy {
            max_attempts: 3,
            backoff_ms: 10,
            backoff_factor: 1.0,
        });
        let result = completed(run(&mut page, &s).await.0);

        assert_eq!(result.status, StepStatus::Passed);
        assert!(result.actions[0].attempts >= 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_actions() {
        let mut page = home().await;
        let handlers = BTreeMap::new();
        let dispatcher = ActionDispatcher::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut ctx = RunContext::new(&mut page, HOME, AuditLimits::strict(), cancel);

        let outcome = StepRunner::new(&handlers, &dispatcher)
            .run(&step("/", vec![wait("#hero")]), &mut ctx)
            .await;
        assert!(matches!(outcome, StepOutcome::Cancelled));
    }

    /// Simulated page that can cancel the run after a click or stall URL reads.
    struct Scripted {
        inner: SimulatedPage,
        cancel_after: Option<(&'static str, CancellationToken)>,
        stall_current_url: bool,
        clicked: Vec<String>,
    }

    impl Scripted {
        async fn at_home() -> Self {
            Self {
                inner: home().await,
                cancel_after: None,
                stall_current_url: false,
                clicked: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl PageBackend for Scripted {
        async fn navigate(&mut self, url: &str) -> Result<(), BackendError> {
            self.inner.navigate(url).await
        }

        async fn current_url(&self) -> Result<String, BackendError> {
            if self.stall_current_url {
                sleep(Duration::from_secs(3)).await;
            }
            self.inner.current_url().await
        }

        async fn query(&self, selector: &str) -> Result<ElementState, BackendError> {
            self.inner.query(selector).await
        }

        async fn click(&mut self, selector: &str) -> Result<(), BackendError> {
            self.inner.click(selector).await?;
            self.clicked.push(selector.to_string());
            if let Some((after, cancel)) = &self.cancel_after {
                if *after == selector {
                    cancel.cancel();
                }
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_cancelled_between_actions() {
        let cancel = CancellationToken::new();
        let mut page = Scripted::at_home().await;
        page.cancel_after = Some(("#hero", cancel.clone()));

        let handlers = BTreeMap::new();
        let dispatcher = ActionDispatcher::new();
        let outcome = {
            let mut ctx = RunContext::new(&mut page, HOME, AuditLimits::strict(), cancel);
            StepRunner::new(&handlers, &dispatcher)
                .run(&step("/packages", vec![click("#hero"), click("#packages")]), &mut ctx)
                .await
        };

        assert!(matches!(outcome, StepOutcome::Cancelled));
        assert_eq!(page.clicked, vec!["#hero".to_string()]);
        assert_eq!(page.inner.current_url().await.unwrap(), HOME);
    }

    #[tokio::test]
    async fn test_stalled_current_url_is_a_backend_fault() {
        let mut page = Scripted::at_home().await;
        page.stall_current_url = true;

        let handlers = BTreeMap::new();
        let dispatcher = ActionDispatcher::new();
        let mut ctx = RunContext::new(&mut page, HOME, AuditLimits::strict(), CancellationToken::new());
        let started = Instant::now();
        let outcome = StepRunner::new(&handlers, &dispatcher)
            .run(&step("/", vec![]), &mut ctx)
            .await;

        assert!(started.elapsed() < Duration::from_secs(2));
        match outcome {
            StepOutcome::Aborted { result, error } => {
                assert_eq!(result.error_code.as_deref(), Some("E5001"));
                assert!(result.error.unwrap().contains("current URL not reported"));
                assert!(matches!(error, AuditError::BackendFault { step_number: Some(1), .. }));
            }
            other => panic!("expected abort, got {:?}", other),
        }
    }
}
