//! Step status decision table.
//!
//! Rules are evaluated top to bottom; the first one that fires decides the
//! step. The rule name ends up in the report as `policy_rule`.

use crate::protocol::{StepStatus, VerdictKind};

/// Everything the table looks at for one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Facts {
    pub verdict: VerdictKind,
    pub actions_succeeded: bool,
    pub optional: bool,
    pub continue_on_failure: bool,
}

impl Facts {
    /// A failed action, or a location that is neither expected nor known.
    pub fn failed(&self) -> bool {
        !self.actions_succeeded || self.verdict == VerdictKind::UnexpectedLocation
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Pass,
    /// Navigate to the redirect's return target, then report recovered.
    Recover,
    Skip,
    FailAndContinue,
    FailAndHalt,
}

impl Resolution {
    pub fn status(&self) -> StepStatus {
        match self {
            Self::Pass => StepStatus::Passed,
            Self::Recover => StepStatus::RedirectedAndRecovered,
            Self::Skip => StepStatus::Skipped,
            Self::FailAndContinue | Self::FailAndHalt => StepStatus::Failed,
        }
    }

    pub fn halts(&self) -> bool {
        matches!(self, Self::FailAndHalt)
    }
}

pub type Rule = fn(&Facts) -> Option<Resolution>;

pub const BLOCKING_FAILURE: &str = "blocking_failure";

pub const RULES: &[(&str, Rule)] = &[
    ("on_track", on_track),
    ("known_redirect", known_redirect),
    ("optional_failure", optional_failure),
    ("continue_on_failure", continue_on_failure),
    (BLOCKING_FAILURE, blocking_failure),
];

fn on_track(facts: &Facts) -> Option<Resolution> {
    (facts.verdict == VerdictKind::OnTrack && facts.actions_succeeded).then_some(Resolution::Pass)
}

fn known_redirect(facts: &Facts) -> Option<Resolution> {
    (facts.verdict == VerdictKind::KnownRedirect).then_some(Resolution::Recover)
}

fn optional_failure(facts: &Facts) -> Option<Resolution> {
    (facts.failed() && facts.optional).then_some(Resolution::Skip)
}

fn continue_on_failure(facts: &Facts) -> Option<Resolution> {
    (facts.failed() && facts.continue_on_failure).then_some(Resolution::FailAndContinue)
}

fn blocking_failure(facts: &Facts) -> Option<Resolution> {
    facts.failed().then_some(Resolution::FailAndHalt)
}

/// Runs the table. Every fact combination is covered by some rule; the
/// trailing fallback only keeps the signature total.
pub fn resolve(facts: &Facts) -> (&'static str, Resolution) {
    RULES
        .iter()
        .find_map(|(name, rule)| rule(facts).map(|resolution| (*name, resolution)))
        .unwrap_or((BLOCKING_FAILURE, Resolution::FailAndHalt))
}

/// Gating for a failure found after the verdict was already acted on
/// (a recovery navigation that did not finish).
pub fn gate_failure(optional: bool, continue_on_failure: bool) -> (&'static str, Resolution) {
    resolve(&Facts {
        verdict: VerdictKind::UnexpectedLocation,
        actions_succeeded: false,
        optional,
        continue_on_failure,
    })
}
