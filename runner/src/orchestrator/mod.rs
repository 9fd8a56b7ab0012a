// Module: Orchestrator
// Drives a flow from its start URL through every step, strictly forward.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::backend::PageBackend;
use crate::context::RunContext;
use crate::errors::AuditError;
use crate::executors::{dismiss_consent, ActionDispatcher};
use crate::limits::AuditLimits;
use crate::protocol::{FlowDefinition, FlowState, RunMetadata, RunReport, StepResult};
use crate::reporter::summarize;
use crate::steps::{StepOutcome, StepRunner};
use crate::telemetry::instrumentation::StepSpanContext;

/// A run that hit a run-aborting fault. `report` holds every step recorded
/// up to and including the faulting one.
#[derive(Debug, Error)]
#[error("run aborted: {error}")]
pub struct AbortedRun {
    pub error: AuditError,
    pub report: Box<RunReport>,
}

impl AbortedRun {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            error: AuditError::Internal(message.into()),
            report: Box::new(summarize(Vec::new()).aborted()),
        }
    }
}

#[derive(Clone)]
pub struct FlowOrchestrator {
    limits: AuditLimits,
    dispatcher: Arc<ActionDispatcher>,
    cancel: CancellationToken,
}

impl FlowOrchestrator {
    pub fn new(limits: AuditLimits) -> Self {
        Self {
            limits,
            dispatcher: Arc::new(ActionDispatcher::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Uses `cancel` as the external stop signal for every run.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn limits(&self) -> &AuditLimits {
        &self.limits
    }

    #[instrument(name = "flow", skip_all, fields(flow.name = %flow.flow_name, product = %flow.product_name))]
    pub async fn run(&self, flow: &FlowDefinition, page: &mut dyn PageBackend) -> Result<RunReport, AbortedRun> {
        let started_at = Utc::now();
        let mut state = FlowState::NotStarted;
        let mut results: Vec<StepResult> = Vec::with_capacity(flow.steps.len());
        let mut ctx = RunContext::new(page, flow.start_url.clone(), self.limits.clone(), self.cancel.clone());

        info!(start_url = %flow.start_url, steps = flow.steps.len(), "🚀 starting flow");

        if ctx.is_cancelled() {
            return Ok(self.finish(flow, started_at, summarize(results).cancelled()));
        }

        let limit = self.limits.navigation_timeout;
        let start_error = match timeout(limit, ctx.page.navigate(&flow.start_url)).await {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(format!("start navigation to '{}' failed: {}", flow.start_url, err)),
            Err(_) => Some(format!(
                "start navigation to '{}' did not finish within {}ms",
                flow.start_url,
                limit.as_millis()
            )),
        };
        if let Some(message) = start_error {
            error!(error = %message, "💥 could not open the funnel");
            return Err(self.abort(
                flow,
                started_at,
                results,
                AuditError::BackendFault {
                    step_number: None,
                    message,
                },
            ));
        }

        if flow.dismiss_consent
            && timeout(limit, dismiss_consent(&mut *ctx.page, &flow.consent_selectors))
                .await
                .is_err()
        {
            warn!(timeout_ms = limit.as_millis() as u64, "consent dismissal did not finish, moving on");
        }

        let runner = StepRunner::new(&flow.click_handlers, &self.dispatcher);
        for step in &flow.steps {
            if ctx.is_cancelled() {
                advance(&mut state, FlowState::Cancelled);
                break;
            }
            if state == FlowState::NotStarted {
                advance(&mut state, FlowState::Running);
            }

            match runner.run(step, &mut ctx).await {
                StepOutcome::Completed(result) => {
                    StepSpanContext::from_result(&flow.flow_name, &result).emit();
                    let halts = result.halted_flow;
                    results.push(result);
                    if halts {
                        advance(&mut state, FlowState::HaltedOnFailure);
                        break;
                    }
                }
                StepOutcome::Cancelled => {
                    advance(&mut state, FlowState::Cancelled);
                    break;
                }
                StepOutcome::Aborted { result, error } => {
                    StepSpanContext::from_result(&flow.flow_name, &result).emit();
                    results.push(result);
                    return Err(self.abort(flow, started_at, results, error));
                }
            }
        }
        if !state.is_terminal() {
            advance(&mut state, FlowState::Completed);
        }

        let report = summarize(results);
        let report = if state == FlowState::Cancelled {
            warn!(recorded = report.steps.len(), "🛑 flow cancelled");
            report.cancelled()
        } else {
            report
        };
        info!(overall = ?report.overall, "🏁 flow finished");
        Ok(self.finish(flow, started_at, report))
    }

    /// Runs several flows concurrently, each against its own page from
    /// `factory`, at most `max_parallel_runs` at a time. Results keep the
    /// order of `flows`.
    pub async fn run_parallel<F, P>(&self, flows: Vec<FlowDefinition>, factory: F) -> Vec<Result<RunReport, AbortedRun>>
    where
        F: Fn(&FlowDefinition) -> P,
        P: PageBackend + 'static,
    {
        let total = flows.len();
        let semaphore = Arc::new(Semaphore::new(self.limits.max_parallel_runs.max(1)));
        let mut set = JoinSet::new();

        for (index, flow) in flows.into_iter().enumerate() {
            let mut page = factory(&flow);
            let orchestrator = self.clone();
            let semaphore = semaphore.clone();
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let result = orchestrator.run(&flow, &mut page).await;
                (index, result)
            });
        }

        let mut slots: Vec<Option<Result<RunReport, AbortedRun>>> = (0..total).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(err) => error!(error = %err, "flow run task failed"),
            }
        }
        slots
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| Err(AbortedRun::internal("flow run task did not complete"))))
            .collect()
    }

    fn finish(&self, flow: &FlowDefinition, started_at: chrono::DateTime<Utc>, report: RunReport) -> RunReport {
        report.with_metadata(RunMetadata {
            run_id: Uuid::new_v4(),
            flow_name: flow.flow_name.clone(),
            product_name: flow.product_name.clone(),
            product_type: flow.product_type.clone(),
            start_url: flow.start_url.clone(),
            started_at,
            finished_at: Utc::now(),
            flow_digest: flow.digest(),
        })
    }

    fn abort(
        &self,
        flow: &FlowDefinition,
        started_at: chrono::DateTime<Utc>,
        results: Vec<StepResult>,
        error: AuditError,
    ) -> AbortedRun {
        let report = self.finish(flow, started_at, summarize(results).aborted());
        AbortedRun {
            error,
            report: Box::new(report),
        }
    }
}

fn advance(state: &mut FlowState, next: FlowState) {
    debug!(from = ?state, to = ?next, "flow state");
    *state = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, ElementSpec, ElementState, PageSpec, SimulatedPage, SiteMap};
    use crate::protocol::{OverallStatus, StepStatus};
    use async_trait::async_trait;
    use serde_json::json;

    const HOME: &str = "https://mobile.test/";
    const PLANS: &str = "https://mobile.test/plans";
    const CHECKOUT: &str = "https://mobile.test/checkout";
    const LOGIN: &str = "https://mobile.test/login?next=/plans";
    const CONSENT_SAVED: &str = "https://mobile.test/privacy/saved";

    fn site() -> Arc<SiteMap> {
        Arc::new(
            SiteMap::new()
                .page(
                    HOME,
                    PageSpec::new()
                        .element("#hero", ElementSpec::interactable())
                        .element("#shop", ElementSpec::interactable().navigates_to(PLANS))
                        .element("#onetrust-accept-btn-handler", ElementSpec::interactable().navigates_to(HOME))
                        .element("#sticky-consent", ElementSpec::interactable().navigates_to(CONSENT_SAVED)),
                )
                .page(CONSENT_SAVED, PageSpec::new().loads_in(3_000))
                .page(
                    PLANS,
                    PageSpec::new()
                        .element("#plan-card", ElementSpec::interactable().appears_after(10))
                        .element("#choose", ElementSpec::interactable().navigates_to(CHECKOUT))
                        .element("#account-deal", ElementSpec::interactable().navigates_to(LOGIN))
                        .element("#crash", ElementSpec::interactable()),
                )
                .page(CHECKOUT, PageSpec::new().element("#pay", ElementSpec::interactable()))
                .page(LOGIN, PageSpec::new())
                .unreachable("https://down.test/")
                .faulty("#crash"),
        )
    }

    fn flow(step2: serde_json::Value, step3: serde_json::Value) -> FlowDefinition {
        serde_json::from_value(json!({
            "product_name": "SIM Only 30GB",
            "product_type": "mobile",
            "flow_name": "sim-only-signup",
            "start_url": HOME,
            "click_handlers": { "shop": ["#shop-now", "#shop"] },
            "steps": [
                {
                    "step_number": 1, "name": "Landing", "expected_url": "/plans",
                    "actions": [
                        { "type": "wait_for_selector", "selector": "#hero", "timeout_ms": 50 },
                        { "type": "click", "handler": "shop", "timeout_ms": 50 }
                    ]
                },
                step2,
                step3
            ]
        }))
        .unwrap()
    }

    fn step2_ok() -> serde_json::Value {
        json!({
            "step_number": 2, "name": "Choose plan", "expected_url": "/checkout",
            "actions": [
                { "type": "wait_for_selector", "selector": "#plan-card", "timeout_ms": 50 },
                { "type": "click", "selector": "#choose", "timeout_ms": 50 }
            ]
        })
    }

    fn step3_pay() -> serde_json::Value {
        json!({
            "step_number": 3, "name": "Checkout", "expected_url": "/checkout",
            "actions": [ { "type": "wait_for_selector", "selector": "#pay", "timeout_ms": 50 } ]
        })
    }

    fn orchestrator() -> FlowOrchestrator {
        FlowOrchestrator::new(AuditLimits::strict())
    }

    fn statuses(report: &RunReport) -> Vec<StepStatus> {
        report.steps.iter().map(|s| s.status).collect()
    }

    #[tokio::test]
    async fn test_scenario_a_all_steps_pass() {
        let mut page = SimulatedPage::new(site());
        let report = orchestrator().run(&flow(step2_ok(), step3_pay()), &mut page).await.unwrap();

        assert_eq!(report.overall, OverallStatus::Passed);
        assert_eq!(report.final_state, FlowState::Completed);
        assert_eq!(statuses(&report), vec![StepStatus::Passed; 3]);
        assert_eq!(report.first_blocking_failure, None);
    }

    #[tokio::test]
    async fn test_scenario_b_blocking_click_timeout_halts() {
        let step2 = json!({
            "step_number": 2, "name": "Choose plan", "expected_url": "/checkout",
            "actions": [ { "type": "click", "selector": "#missing-cta", "timeout_ms": 50 } ]
        });
        let mut page = SimulatedPage::new(site());
        let report = orchestrator().run(&flow(step2, step3_pay()), &mut page).await.unwrap();

        assert_eq!(report.overall, OverallStatus::Failed);
        assert_eq!(report.final_state, FlowState::HaltedOnFailure);
        assert_eq!(statuses(&report), vec![StepStatus::Passed, StepStatus::Failed]);
        assert_eq!(report.first_blocking_failure, Some(1));
        assert!(report.steps[1].halted_flow);
    }

    #[tokio::test]
    async fn test_scenario_c_continue_on_failure() {
        let step2 = json!({
            "step_number": 2, "name": "Choose plan", "expected_url": "/checkout",
            "continue_on_failure": true,
            "actions": [
                { "type": "click", "selector": "#choose", "timeout_ms": 50 },
                { "type": "wait_for_selector", "selector": "#promo-banner", "timeout_ms": 50 }
            ]
        });
        let mut page = SimulatedPage::new(site());
        let report = orchestrator().run(&flow(step2, step3_pay()), &mut page).await.unwrap();

        assert_eq!(report.overall, OverallStatus::Failed);
        assert_eq!(report.final_state, FlowState::Completed);
        assert_eq!(
            statuses(&report),
            vec![StepStatus::Passed, StepStatus::Failed, StepStatus::Passed]
        );
        assert_eq!(report.first_blocking_failure, Some(1));
        assert_eq!(report.steps[1].error_code.as_deref(), Some("E2001"));
    }

    #[tokio::test]
    async fn test_scenario_d_known_redirect_recovers() {
        let step2 = json!({
            "step_number": 2, "name": "Pick deal", "expected_url": "/checkout",
            "redirect_policy": { "detect_patterns": ["/login"], "return_to": "previous_step_url" },
            "actions": [ { "type": "click", "selector": "#account-deal", "timeout_ms": 50 } ]
        });
        let step3 = json!({
            "step_number": 3, "name": "Choose plan", "expected_url": "/checkout",
            "actions": [ { "type": "click", "selector": "#choose", "timeout_ms": 50 } ]
        });
        let mut page = SimulatedPage::new(site());
        let report = orchestrator().run(&flow(step2, step3), &mut page).await.unwrap();

        assert_eq!(report.overall, OverallStatus::Passed);
        assert_eq!(
            statuses(&report),
            vec![StepStatus::Passed, StepStatus::RedirectedAndRecovered, StepStatus::Passed]
        );
        assert_eq!(report.totals.redirected_and_recovered, 1);
        // Recovery went back to the URL step 1 ended on.
        let history = page.history();
        let login = history.iter().position(|u| u == LOGIN).unwrap();
        assert_eq!(history[login + 1], PLANS);
    }

    /// Cancels the run right after a given selector is clicked.
    struct CancelAfterClick {
        inner: SimulatedPage,
        selector: &'static str,
        cancel: CancellationToken,
    }

    #[async_trait]
    impl PageBackend for CancelAfterClick {
        async fn navigate(&mut self, url: &str) -> Result<(), BackendError> {
            self.inner.navigate(url).await
        }

        async fn current_url(&self) -> Result<String, BackendError> {
            self.inner.current_url().await
        }

        async fn query(&self, selector: &str) -> Result<ElementState, BackendError> {
            self.inner.query(selector).await
        }

        async fn click(&mut self, selector: &str) -> Result<(), BackendError> {
            self.inner.click(selector).await?;
            if selector == self.selector {
                self.cancel.cancel();
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_cancellation_between_steps() {
        let cancel = CancellationToken::new();
        let orchestrator = orchestrator().with_cancellation(cancel.clone());
        let mut page = CancelAfterClick {
            inner: SimulatedPage::new(site()),
            selector: "#shop",
            cancel,
        };
        let report = orchestrator.run(&flow(step2_ok(), step3_pay()), &mut page).await.unwrap();

        assert_eq!(report.overall, OverallStatus::Cancelled);
        assert_eq!(report.final_state, FlowState::Cancelled);
        assert_eq!(statuses(&report), vec![StepStatus::Passed]);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let orchestrator = orchestrator();
        orchestrator.cancellation_token().cancel();
        let mut page = SimulatedPage::new(site());
        let report = orchestrator.run(&flow(step2_ok(), step3_pay()), &mut page).await.unwrap();

        assert_eq!(report.overall, OverallStatus::Cancelled);
        assert!(report.steps.is_empty());
        assert!(page.history().is_empty());
    }

    #[tokio::test]
    async fn test_backend_fault_aborts_with_partial_report() {
        let step2 = json!({
            "step_number": 2, "name": "Choose plan", "expected_url": "/checkout",
            "optional": true,
            "actions": [ { "type": "click", "selector": "#crash", "timeout_ms": 50 } ]
        });
        let mut page = SimulatedPage::new(site());
        let aborted = orchestrator().run(&flow(step2, step3_pay()), &mut page).await.unwrap_err();

        assert!(matches!(aborted.error, AuditError::BackendFault { step_number: Some(2), .. }));
        assert_eq!(aborted.report.overall, OverallStatus::Aborted);
        assert_eq!(aborted.report.final_state, FlowState::Aborted);
        assert_eq!(aborted.report.steps.len(), 2);
        assert_eq!(aborted.report.steps[1].error_code.as_deref(), Some("E5001"));
    }

    #[tokio::test]
    async fn test_unreachable_start_url_aborts() {
        let mut definition = flow(step2_ok(), step3_pay());
        definition.start_url = "https://down.test/".to_string();
        let mut page = SimulatedPage::new(site());
        let aborted = orchestrator().run(&definition, &mut page).await.unwrap_err();

        assert!(matches!(aborted.error, AuditError::BackendFault { step_number: None, .. }));
        assert!(aborted.report.steps.is_empty());
    }

    #[tokio::test]
    async fn test_consent_banner_is_dismissed_first() {
        let mut definition = flow(step2_ok(), step3_pay());
        definition.dismiss_consent = true;
        let mut page = SimulatedPage::new(site());
        let report = orchestrator().run(&definition, &mut page).await.unwrap();

        assert!(report.is_passed());
        assert_eq!(&page.history()[..2], &[HOME.to_string(), HOME.to_string()]);
    }

    #[tokio::test]
    async fn test_report_metadata() {
        let definition = flow(step2_ok(), step3_pay());
        let mut page = SimulatedPage::new(site());
        let report = orchestrator().run(&definition, &mut page).await.unwrap();

        let metadata = report.metadata.unwrap();
        assert_eq!(metadata.flow_name, "sim-only-signup");
        assert_eq!(metadata.product_type, "mobile");
        assert_eq!(metadata.flow_digest, definition.digest());
        assert!(metadata.finished_at >= metadata.started_at);
    }

    #[tokio::test]
    async fn test_run_parallel_keeps_input_order() {
        let failing = flow(
            json!({
                "step_number": 2, "name": "Choose plan", "expected_url": "/checkout",
                "actions": [ { "type": "click", "selector": "#missing-cta", "timeout_ms": 50 } ]
            }),
            step3_pay(),
        );
        let mut unreachable = flow(step2_ok(), step3_pay());
        unreachable.start_url = "https://down.test/".to_string();
        let flows = vec![failing, flow(step2_ok(), step3_pay()), unreachable];

        let map = site();
        let results = orchestrator()
            .run_parallel(flows, |_| SimulatedPage::new(map.clone()))
            .await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap().overall, OverallStatus::Failed);
        assert_eq!(results[1].as_ref().unwrap().overall, OverallStatus::Passed);
        assert!(results[2].is_err());
        let ids: Vec<_> = results
            .iter()
            .filter_map(|r| r.as_ref().ok())
            .map(|r| r.metadata.as_ref().unwrap().run_id)
            .collect();
        assert_ne!(ids[0], ids[1]);
    }

    #[tokio::test]
    async fn test_run_cancelled_between_actions_of_a_step() {
        let step2 = json!({
            "step_number": 2, "name": "Choose plan", "expected_url": "/checkout",
            "actions": [
                { "type": "click", "selector": "#plan-card", "timeout_ms": 50 },
                { "type": "click", "selector": "#choose", "timeout_ms": 50 }
            ]
        });
        let cancel = CancellationToken::new();
        let orchestrator = orchestrator().with_cancellation(cancel.clone());
        let mut page = CancelAfterClick {
            inner: SimulatedPage::new(site()),
            selector: "#plan-card",
            cancel,
        };
        let report = orchestrator.run(&flow(step2, step3_pay()), &mut page).await.unwrap();

        assert_eq!(report.overall, OverallStatus::Cancelled);
        assert_eq!(statuses(&report), vec![StepStatus::Passed]);
        assert!(!page.inner.history().iter().any(|url| url == CHECKOUT));
    }

    fn promo_step() -> serde_json::Value {
        json!({
            "step_number": 2, "name": "Promo banner", "expected_url": "/plans", "optional": true,
            "actions": [ { "type": "wait_for_selector", "selector": "#promo-banner", "timeout_ms": 50 } ]
        })
    }

    fn choose_step(step_number: u32) -> serde_json::Value {
        let mut step = step2_ok();
        step["step_number"] = json!(step_number);
        step
    }

    #[tokio::test]
    async fn test_optional_failure_does_not_affect_overall() {
        let mut page = SimulatedPage::new(site());
        let report = orchestrator().run(&flow(promo_step(), choose_step(3)), &mut page).await.unwrap();

        assert_eq!(
            statuses(&report),
            vec![StepStatus::Passed, StepStatus::Skipped, StepStatus::Passed]
        );
        assert_eq!(report.overall, OverallStatus::Passed);
        assert_eq!(report.first_blocking_failure, None);
        assert_eq!(report.steps[1].policy_rule, "optional_failure");
    }

    #[tokio::test]
    async fn test_rerun_gives_identical_statuses() {
        let mut definition = flow(promo_step(), choose_step(3));
        for step in &mut definition.steps {
            step.optional = true;
        }

        let mut first_page = SimulatedPage::new(site());
        let first = orchestrator().run(&definition, &mut first_page).await.unwrap();
        let mut second_page = SimulatedPage::new(site());
        let second = orchestrator().run(&definition, &mut second_page).await.unwrap();

        assert_eq!(statuses(&first), statuses(&second));
        assert_eq!(first.totals, second.totals);
        let rules = |report: &RunReport| report.steps.iter().map(|s| s.policy_rule.clone()).collect::<Vec<_>>();
        assert_eq!(rules(&first), rules(&second));
        assert_ne!(
            first.metadata.as_ref().unwrap().run_id,
            second.metadata.as_ref().unwrap().run_id
        );
    }

    #[tokio::test]
    async fn test_slow_consent_click_is_bounded() {
        let mut definition = flow(step2_ok(), step3_pay());
        definition.dismiss_consent = true;
        definition.consent_selectors = vec!["#sticky-consent".to_string()];
        let mut page = SimulatedPage::new(site());

        let started = tokio::time::Instant::now();
        let report = orchestrator().run(&definition, &mut page).await.unwrap();

        assert!(started.elapsed() < std::time::Duration::from_millis(2_000));
        assert!(report.is_passed());
    }
}
