// Module: Protocol
// Flow definitions consumed by the engine and the results it produces.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Timeout applied to actions that do not declare one.
pub const DEFAULT_ACTION_TIMEOUT_MS: u64 = 10_000;

/// Sentinel used by `return_to` to point at the last good step URL.
pub const PREVIOUS_STEP_URL: &str = "previous_step_url";

// ============================================================================
// FLOW DEFINITION
// ============================================================================

/// One product funnel: where it starts, its ordered steps and the named
/// click handlers its actions may reference.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FlowDefinition {
    pub product_name: String,
    #[serde(default)]
    pub product_type: String,
    pub flow_name: String,
    pub start_url: String,
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    /// Click a cookie/consent banner away right after the start navigation.
    #[serde(default)]
    pub dismiss_consent: bool,
    #[serde(default)]
    pub consent_selectors: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_handlers")]
    pub click_handlers: BTreeMap<String, ClickHandlerDefinition>,
    pub steps: Vec<StepDefinition>,
}

impl FlowDefinition {
    pub fn handler(&self, name: &str) -> Option<&ClickHandlerDefinition> {
        self.click_handlers.get(name)
    }

    /// SHA-256 of the canonical JSON form, so two reports can be tied to the
    /// exact same definition.
    pub fn digest(&self) -> Option<String> {
        let canonical = serde_json::to_vec(self).ok()?;
        Some(format!("{:x}", Sha256::digest(&canonical)))
    }
}

/// A logical UI element with fallback selectors, tried in declared order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClickHandlerDefinition {
    pub name: String,
    pub selectors: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum HandlerRepr {
    List(Vec<String>),
    Object { selectors: Vec<String> },
}

fn deserialize_handlers<'de, D>(
    deserializer: D,
) -> Result<BTreeMap<String, ClickHandlerDefinition>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: BTreeMap<String, HandlerRepr> = BTreeMap::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(name, repr)| {
            let selectors = match repr {
                HandlerRepr::List(selectors) | HandlerRepr::Object { selectors } => selectors,
            };
            (name.clone(), ClickHandlerDefinition { name, selectors })
        })
        .collect())
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StepDefinition {
    pub step_number: u32,
    pub name: String,
    pub expected_url: String,
    #[serde(default)]
    pub actions: Vec<ActionDefinition>,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub continue_on_failure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_policy: Option<RedirectPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    WaitForSelector,
    Click,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WaitForSelector => write!(f, "wait_for_selector"),
            Self::Click => write!(f, "click"),
        }
    }
}

/// What an action targets: a literal CSS selector, or a handler name that is
/// resolved against `click_handlers` when the action runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorRef {
    Literal(String),
    Handler(String),
}

impl fmt::Display for SelectorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(selector) => write!(f, "{}", selector),
            Self::Handler(name) => write!(f, "handler:{}", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(try_from = "RawAction", into = "RawAction")]
pub struct ActionDefinition {
    pub kind: ActionKind,
    pub selector: SelectorRef,
    pub timeout: Duration,
}

impl ActionDefinition {
    pub fn new(kind: ActionKind, selector: SelectorRef, timeout: Duration) -> Self {
        Self { kind, selector, timeout }
    }
}

/// Wire form of an action: exactly one of `selector` / `handler`.
#[derive(Debug, Clone, Deserialize, Serialize)]
struct RawAction {
    #[serde(rename = "type")]
    kind: ActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    handler: Option<String>,
    #[serde(default = "default_timeout_ms", alias = "timeout")]
    timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_ACTION_TIMEOUT_MS
}

impl TryFrom<RawAction> for ActionDefinition {
    type Error = String;

    fn try_from(raw: RawAction) -> Result<Self, Self::Error> {
        let selector = match (raw.selector, raw.handler) {
            (Some(selector), None) => SelectorRef::Literal(selector),
            (None, Some(handler)) => SelectorRef::Handler(handler),
            (Some(_), Some(_)) => {
                return Err(format!(
                    "{} action declares both 'selector' and 'handler'",
                    raw.kind
                ))
            }
            (None, None) => {
                return Err(format!(
                    "{} action needs either 'selector' or 'handler'",
                    raw.kind
                ))
            }
        };
        Ok(Self {
            kind: raw.kind,
            selector,
            timeout: Duration::from_millis(raw.timeout_ms),
        })
    }
}

impl From<ActionDefinition> for RawAction {
    fn from(action: ActionDefinition) -> Self {
        let (selector, handler) = match action.selector {
            SelectorRef::Literal(selector) => (Some(selector), None),
            SelectorRef::Handler(name) => (None, Some(name)),
        };
        Self {
            kind: action.kind,
            selector,
            handler,
            timeout_ms: action.timeout.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RedirectPolicy {
    pub detect_patterns: Vec<String>,
    #[serde(default)]
    pub return_to: ReturnTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub enum ReturnTarget {
    #[default]
    PreviousStepUrl,
    Url(String),
}

impl From<String> for ReturnTarget {
    fn from(raw: String) -> Self {
        if raw == PREVIOUS_STEP_URL {
            Self::PreviousStepUrl
        } else {
            Self::Url(raw)
        }
    }
}

impl From<ReturnTarget> for String {
    fn from(target: ReturnTarget) -> Self {
        match target {
            ReturnTarget::PreviousStepUrl => PREVIOUS_STEP_URL.to_string(),
            ReturnTarget::Url(url) => url,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RetryPolicy {
    /// Attempts per action, the first one included.
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

fn default_backoff_factor() -> f64 {
    2.0
}

// ============================================================================
// RESULTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Passed,
    Failed,
    Skipped,
    RedirectedAndRecovered,
}

impl StepStatus {
    /// Whether the step lets the overall run stay `passed`.
    pub fn counts_as_pass(&self) -> bool {
        !matches!(self, Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ActionOutcome {
    Succeeded { matched_selector: String },
    TimedOut { waited_ms: u64 },
    ElementNotInteractable { selector: String },
    BackendError { message: String },
}

impl ActionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

/// Diagnostics for one action of a step.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ActionRecord {
    pub index: usize,
    pub kind: ActionKind,
    pub selector: String,
    #[serde(flatten)]
    pub outcome: ActionOutcome,
    pub attempts: u32,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictKind {
    OnTrack,
    KnownRedirect,
    UnexpectedLocation,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StepResult {
    pub step_number: u32,
    pub name: String,
    pub status: StepStatus,
    pub actions: Vec<ActionRecord>,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<VerdictKind>,
    /// Name of the policy rule that decided `status`.
    pub policy_rule: String,
    #[serde(default)]
    pub halted_flow: bool,
}

// ============================================================================
// RUN REPORT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Passed,
    Failed,
    Cancelled,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    NotStarted,
    Running,
    HaltedOnFailure,
    Completed,
    Cancelled,
    Aborted,
}

impl FlowState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::NotStarted | Self::Running)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct StatusTotals {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub redirected_and_recovered: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RunMetadata {
    pub run_id: Uuid,
    pub flow_name: String,
    pub product_name: String,
    pub product_type: String,
    pub start_url: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_digest: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RunReport {
    pub overall: OverallStatus,
    pub final_state: FlowState,
    /// 0-based index into `steps` of the first failed result.
    pub first_blocking_failure: Option<usize>,
    pub totals: StatusTotals,
    pub steps: Vec<StepResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<RunMetadata>,
}

impl RunReport {
    pub fn is_passed(&self) -> bool {
        self.overall == OverallStatus::Passed
    }

    pub fn cancelled(mut self) -> Self {
        self.overall = OverallStatus::Cancelled;
        self.final_state = FlowState::Cancelled;
        self
    }

    pub fn aborted(mut self) -> Self {
        self.overall = OverallStatus::Aborted;
        self.final_state = FlowState::Aborted;
        self
    }

    pub fn with_metadata(mut self, metadata: RunMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}
