//! Funnel friction auditor.
//!
//! Replays a product signup funnel (an ordered list of steps, each a few
//! waits and clicks) against a page backend, checks where every step lands,
//! applies the redirect and failure policy, and folds the results into a
//! `RunReport`.
//!
//! ```ignore
//! let flow = load_flow_from_file("flows/fibre-500.json", &AuditLimits::from_env())?;
//! let mut page = SimulatedPage::new(Arc::new(load_site_map("site.json")?));
//! let report = FlowOrchestrator::new(AuditLimits::from_env()).run(&flow, &mut page).await?;
//! ```

pub mod backend;
pub mod context;
pub mod errors;
pub mod executors;
pub mod limits;
pub mod loader;
pub mod monitor;
pub mod orchestrator;
pub mod protocol;
pub mod reporter;
pub mod retry;
pub mod steps;
pub mod telemetry;
pub mod validation;

pub use backend::{PageBackend, SimulatedPage, SiteMap};
pub use errors::{AuditError, ErrorCode};
pub use limits::AuditLimits;
pub use loader::{load_flow_from_file, load_flow_from_str, load_site_map};
pub use orchestrator::{AbortedRun, FlowOrchestrator};
pub use protocol::{FlowDefinition, OverallStatus, RunReport, StepResult, StepStatus};
