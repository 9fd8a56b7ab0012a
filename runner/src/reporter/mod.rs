// Module: Reporter
// Folds step results into the run report. No I/O.

use crate::protocol::{FlowState, OverallStatus, RunReport, StatusTotals, StepResult, StepStatus};

/// Builds the report for a run that ran to completion or halted.
///
/// Overall is `passed` iff no result is `failed`. Cancelled and aborted runs
/// are derived from this with [`RunReport::cancelled`] / [`RunReport::aborted`].
pub fn summarize(results: Vec<StepResult>) -> RunReport {
    let mut totals = StatusTotals::default();
    for result in &results {
        match result.status {
            StepStatus::Passed => totals.passed += 1,
            StepStatus::Failed => totals.failed += 1,
            StepStatus::Skipped => totals.skipped += 1,
            StepStatus::RedirectedAndRecovered => totals.redirected_and_recovered += 1,
        }
    }

    let first_blocking_failure = results.iter().position(|r| r.status == StepStatus::Failed);
    let overall = if first_blocking_failure.is_some() {
        OverallStatus::Failed
    } else {
        OverallStatus::Passed
    };
    let final_state = if results.iter().any(|r| r.halted_flow) {
        FlowState::HaltedOnFailure
    } else {
        FlowState::Completed
    };

    RunReport {
        overall,
        final_state,
        first_blocking_failure,
        totals,
        steps: results,
        metadata: None,
    }
}
