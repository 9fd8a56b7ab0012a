use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use funnel_auditor::limits::AuditLimits;
use funnel_auditor::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};
use funnel_auditor::{
    load_flow_from_file, load_site_map, AbortedRun, FlowDefinition, FlowOrchestrator, RunReport,
    SimulatedPage,
};

const EXIT_PASSED: i32 = 0;
const EXIT_FAILED: i32 = 1;
const EXIT_INVALID: i32 = 2;

#[derive(Parser)]
#[command(name = "funnel-auditor")]
#[command(about = "Replays signup funnels and reports where users get stuck", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Checks a flow definition without running it
    Validate {
        /// Path to the flow JSON file
        #[arg(short, long)]
        flow: PathBuf,
    },
    /// Audits one or more flows against a recorded site map
    Audit {
        /// Path to a flow JSON file (repeatable)
        #[arg(short, long, required = true)]
        flow: Vec<PathBuf>,

        /// Path to the site map the simulated page backend replays
        #[arg(short, long)]
        site: PathBuf,

        /// Path to the output report file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(err) = init_telemetry(TelemetryConfig::from_env()) {
        eprintln!("⚠️ telemetry disabled: {:#}", err);
    }

    let code = match cli.command {
        Commands::Validate { flow } => validate(&flow),
        Commands::Audit { flow, site, output } => audit(&flow, &site, output.as_deref()).await,
    };

    shutdown_telemetry();
    process::exit(code);
}

fn validate(path: &Path) -> i32 {
    match load_flow_from_file(path, &AuditLimits::from_env()) {
        Ok(flow) => {
            println!("✅ {} is valid ({} steps)", flow.flow_name, flow.steps.len());
            EXIT_PASSED
        }
        Err(err) => {
            eprintln!("❌ {}", err.user_message());
            EXIT_INVALID
        }
    }
}

async fn audit(flow_paths: &[PathBuf], site_path: &Path, output: Option<&Path>) -> i32 {
    let limits = AuditLimits::from_env();

    let mut flows: Vec<FlowDefinition> = Vec::with_capacity(flow_paths.len());
    for path in flow_paths {
        match load_flow_from_file(path, &limits) {
            Ok(flow) => flows.push(flow),
            Err(err) => {
                eprintln!("❌ {}: {}", path.display(), err.user_message());
                return EXIT_INVALID;
            }
        }
    }
    let site = match load_site_map(site_path) {
        Ok(site) => Arc::new(site),
        Err(err) => {
            eprintln!("❌ {}: {}", site_path.display(), err.user_message());
            return EXIT_INVALID;
        }
    };

    let orchestrator = FlowOrchestrator::new(limits);
    let cancel = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 interrupt received, cancelling runs");
            cancel.cancel();
        }
    });

    info!(flows = flows.len(), "🚀 starting audit");
    let results = orchestrator
        .run_parallel(flows, |_| SimulatedPage::new(site.clone()))
        .await;

    let (reports, code) = collect(results);

    let json = match serde_json::to_string_pretty(&reports) {
        Ok(json) => json,
        Err(err) => {
            eprintln!("❌ failed to serialize reports: {}", err);
            return EXIT_INVALID;
        }
    };
    match output {
        Some(path) => match fs::write(path, json) {
            Ok(()) => eprintln!("📄 Report saved to: {}", path.display()),
            Err(err) => {
                eprintln!("❌ failed to write report to {}: {}", path.display(), err);
                return EXIT_INVALID;
            }
        },
        None => println!("{}", json),
    }
    code
}

/// Unwraps aborted runs into their partial reports and picks the exit code:
/// any abort wins over any failure or cancellation.
fn collect(results: Vec<Result<RunReport, AbortedRun>>) -> (Vec<RunReport>, i32) {
    let mut code = EXIT_PASSED;
    let mut reports = Vec::with_capacity(results.len());

    for result in results {
        match result {
            Ok(report) => {
                if !report.is_passed() && code == EXIT_PASSED {
                    code = EXIT_FAILED;
                }
                reports.push(report);
            }
            Err(aborted) => {
                error!(error = %aborted.error, "💥 {}", aborted.error.user_message());
                code = EXIT_INVALID;
                reports.push(*aborted.report);
            }
        }
    }
    (reports, code)
}
