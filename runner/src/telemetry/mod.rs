//! # Módulo de Telemetria OpenTelemetry
//!
//! Logs estruturados (`tracing`) e, opcionalmente, exportação dos spans de
//! cada execução de funil via OTLP.
//!
//! ## Para todos entenderem:
//!
//! Cada execução vira um trace. Dentro dele:
//!
//! ```text
//! [flow sim-only-signup] ───────────────────────────────>
//!   [step 1 Landing] ──────>
//!     [execute click] ──>
//!                   [step 2 Choose plan] ───────────>
//! ```
//!
//! Os spans levam atributos como `flow.name`, `step.number`, `step.status`.
//! Dá para ver no Jaeger, Grafana Tempo ou qualquer coletor OTLP onde o
//! funil travou e quanto cada step demorou.
//!
//! ## Configuração via variáveis de ambiente:
//!
//! - `RUST_LOG`: filtro de logs (padrão `info`)
//! - `OTEL_SERVICE_NAME`: Nome do serviço
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: URL do coletor OTLP (sem ela, só console)
//! - `OTEL_TRACES_SAMPLER_ARG`: Taxa de sampling (0.0-1.0)
//!
//! ## Exemplo de uso:
//!
//! ```ignore
//! init_telemetry(TelemetryConfig::from_env())?;
//!
//! // ... auditar funis ...
//!
//! shutdown_telemetry(); // Flush dos dados
//! ```

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::runtime::Tokio;
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, Tracer, TracerProvider};
use opentelemetry_sdk::{trace as sdktrace, Resource};
use tracing::Level;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

// ============================================================================
// CONFIGURAÇÃO
// ============================================================================

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Aparece como `service.name` nos traces.
    pub service_name: String,

    /// Coletor OTLP/gRPC, ex: "http://localhost:4317". `None` = só console.
    pub otlp_endpoint: Option<String>,

    /// Fração de execuções rastreadas (0.0 a 1.0).
    pub sampling_ratio: f64,

    pub enable_console_logging: bool,

    /// Nível usado quando `RUST_LOG` não está definida.
    pub log_level: Level,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "funnel-auditor".to_string(),
            otlp_endpoint: None,
            sampling_ratio: 1.0,
            enable_console_logging: true,
            log_level: Level::INFO,
        }
    }
}

impl TelemetryConfig {
    /// Lê `OTEL_SERVICE_NAME`, `OTEL_EXPORTER_OTLP_ENDPOINT` e
    /// `OTEL_TRACES_SAMPLER_ARG`. O resto fica no padrão.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(name) = std::env::var("OTEL_SERVICE_NAME") {
            config.service_name = name;
        }
        if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
            if !endpoint.trim().is_empty() {
                config.otlp_endpoint = Some(endpoint);
            }
        }
        if let Some(ratio) = std::env::var("OTEL_TRACES_SAMPLER_ARG")
            .ok()
            .and_then(|raw| raw.parse::<f64>().ok())
        {
            config.sampling_ratio = ratio.clamp(0.0, 1.0);
        }

        config
    }
}

// ============================================================================
// INICIALIZAÇÃO
// ============================================================================

/// Instala o subscriber global: filtro (`RUST_LOG`), saída compacta no
/// console e, com endpoint configurado, a layer OpenTelemetry.
///
/// Retorna o tracer OTLP quando há exportação.
pub fn init_telemetry(config: TelemetryConfig) -> anyhow::Result<Option<Tracer>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));
    let console = config.enable_console_logging;

    let Some(endpoint) = &config.otlp_endpoint else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console.then(|| fmt::layer().compact().with_writer(std::io::stderr)))
            .try_init()?;
        tracing::debug!("Telemetria inicializada (apenas console, sem OTLP)");
        return Ok(None);
    };

    let tracer = init_otlp_tracer(&config.service_name, endpoint, config.sampling_ratio)?;
    tracing_subscriber::registry()
        .with(env_filter)
        .with(OpenTelemetryLayer::new(tracer.clone()))
        .with(console.then(|| fmt::layer().compact().with_writer(std::io::stderr)))
        .try_init()?;

    tracing::info!(
        service_name = %config.service_name,
        endpoint = %endpoint,
        sampling_ratio = config.sampling_ratio,
        "📡 Telemetria OTEL inicializada"
    );
    Ok(Some(tracer))
}

fn sampler_for(ratio: f64) -> Sampler {
    if ratio >= 1.0 {
        Sampler::AlwaysOn
    } else if ratio <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::TraceIdRatioBased(ratio)
    }
}

/// Tracer com exporter OTLP em lote sobre o runtime Tokio.
fn init_otlp_tracer(service_name: &str, endpoint: &str, sampling_ratio: f64) -> anyhow::Result<Tracer> {
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()?;

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .with_config(
            sdktrace::Config::default()
                .with_sampler(sampler_for(sampling_ratio))
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![KeyValue::new(
                    "service.name",
                    service_name.to_string(),
                )])),
        )
        .build();

    let tracer = provider.tracer(service_name.to_string());
    global::set_tracer_provider(provider);
    Ok(tracer)
}

/// Flush dos spans pendentes. Chamar antes de sair do processo.
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}

/// Atributos de span por step.
pub mod instrumentation {
    use crate::protocol::{StepResult, StepStatus};

    /// Resumo de um step pronto para virar atributos de span.
    #[derive(Debug, Clone)]
    pub struct StepSpanContext {
        pub flow_name: String,
        pub step_number: u32,
        pub step_name: String,
        pub status: StepStatus,
        pub duration_ms: u64,
        pub error_code: Option<String>,
    }

    impl StepSpanContext {
        pub fn from_result(flow_name: &str, result: &StepResult) -> Self {
            Self {
                flow_name: flow_name.to_string(),
                step_number: result.step_number,
                step_name: result.name.clone(),
                status: result.status,
                duration_ms: result.elapsed_ms,
                error_code: result.error_code.clone(),
            }
        }

        /// Retorna os atributos como pares chave/valor para OTEL.
        pub fn attributes(&self) -> Vec<(&'static str, String)> {
            let mut attrs = vec![
                ("flow.name", self.flow_name.clone()),
                ("step.number", self.step_number.to_string()),
                ("step.name", self.step_name.clone()),
                ("step.status", status_label(self.status).to_string()),
                ("step.duration_ms", self.duration_ms.to_string()),
            ];

            if let Some(code) = &self.error_code {
                attrs.push(("step.error_code", code.clone()));
            }

            attrs
        }

        /// Emite um evento com os atributos do step.
        pub fn emit(&self) {
            tracing::info!(
                flow.name = %self.flow_name,
                step.number = self.step_number,
                step.name = %self.step_name,
                step.status = status_label(self.status),
                step.duration_ms = self.duration_ms,
                step.error_code = self.error_code.as_deref().unwrap_or(""),
                "step recorded"
            );
        }
    }

    fn status_label(status: StepStatus) -> &'static str {
        match status {
            StepStatus::Passed => "passed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::RedirectedAndRecovered => "redirected_and_recovered",
        }
    }
}
