//! # Módulo de Limites de Execução
//!
//! Define os limites que protegem o auditor contra funis malformados e
//! garantem que nenhuma espera bloqueie sem fim.
//!
//! ## Para todos entenderem:
//!
//! Um funil descreve a jornada de um usuário. Se um seletor nunca aparece,
//! o usuário real desistiria; o auditor também precisa desistir, dentro de
//! um tempo conhecido. Estes limites fazem isso.
//!
//! ## Limites configuráveis:
//!
//! | Limite              | Padrão | Variável de ambiente            |
//! |---------------------|--------|---------------------------------|
//! | max_steps           | 100    | FUNNEL_MAX_STEPS                |
//! | max_action_timeout  | 60s    | FUNNEL_MAX_ACTION_TIMEOUT_MS    |
//! | poll_interval       | 100ms  | FUNNEL_POLL_INTERVAL_MS         |
//! | navigation_timeout  | 30s    | FUNNEL_NAVIGATION_TIMEOUT_MS    |
//! | max_retries_total   | 50     | FUNNEL_MAX_RETRIES              |
//! | max_parallel_runs   | 4      | FUNNEL_MAX_PARALLEL_RUNS        |

use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::protocol::FlowDefinition;

// ============================================================================
// LIMITES PADRÃO (CONSTANTES)
// ============================================================================

/// Número máximo de steps em um funil.
pub const DEFAULT_MAX_STEPS: usize = 100;

/// Timeout máximo de uma ação; timeouts maiores são reduzidos a este valor.
pub const DEFAULT_MAX_ACTION_TIMEOUT_MS: u64 = 60_000;

/// Intervalo entre consultas ao DOM durante o polling.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// Limite para a navegação inicial e para navegações de recuperação.
pub const DEFAULT_NAVIGATION_TIMEOUT_MS: u64 = 30_000;

/// Retries permitidos na execução inteira (soma de todos os steps).
pub const DEFAULT_MAX_RETRIES_TOTAL: u32 = 50;

/// Funis auditados ao mesmo tempo, cada um com seu próprio backend.
pub const DEFAULT_MAX_PARALLEL_RUNS: usize = 4;

// ============================================================================
// ESTRUTURA DE LIMITES
// ============================================================================

/// Configuração de limites de execução.
///
/// ```rust
/// use funnel_auditor::limits::AuditLimits;
///
/// let limits = AuditLimits {
///     max_steps: 20,
///     ..Default::default()
/// };
/// assert_eq!(limits.max_parallel_runs, 4);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct AuditLimits {
    pub max_steps: usize,
    pub max_action_timeout: Duration,
    pub poll_interval: Duration,
    pub navigation_timeout: Duration,
    pub max_retries_total: u32,
    pub max_parallel_runs: usize,
}

impl Default for AuditLimits {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            max_action_timeout: Duration::from_millis(DEFAULT_MAX_ACTION_TIMEOUT_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            navigation_timeout: Duration::from_millis(DEFAULT_NAVIGATION_TIMEOUT_MS),
            max_retries_total: DEFAULT_MAX_RETRIES_TOTAL,
            max_parallel_runs: DEFAULT_MAX_PARALLEL_RUNS,
        }
    }
}

impl AuditLimits {
    /// Cria limites a partir de variáveis de ambiente.
    ///
    /// Valores ausentes ou que não parseiam mantêm o padrão.
    pub fn from_env() -> Self {
        let mut limits = Self::default();

        if let Some(n) = env_value("FUNNEL_MAX_STEPS") {
            limits.max_steps = n;
        }
        if let Some(ms) = env_value("FUNNEL_MAX_ACTION_TIMEOUT_MS") {
            limits.max_action_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_value::<u64>("FUNNEL_POLL_INTERVAL_MS") {
            // Polling com intervalo zero seria busy-loop.
            limits.poll_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(ms) = env_value("FUNNEL_NAVIGATION_TIMEOUT_MS") {
            limits.navigation_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = env_value("FUNNEL_MAX_RETRIES") {
            limits.max_retries_total = n;
        }
        if let Some(n) = env_value::<usize>("FUNNEL_MAX_PARALLEL_RUNS") {
            limits.max_parallel_runs = n.max(1);
        }

        limits
    }

    /// Limites curtos, usados nos testes.
    pub fn strict() -> Self {
        Self {
            max_steps: 10,
            max_action_timeout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(5),
            navigation_timeout: Duration::from_millis(500),
            max_retries_total: 5,
            max_parallel_runs: 2,
        }
    }

    /// Limites permissivos para sites lentos (staging, VPN).
    pub fn relaxed() -> Self {
        Self {
            max_steps: 500,
            max_action_timeout: Duration::from_secs(180),
            poll_interval: Duration::from_millis(250),
            navigation_timeout: Duration::from_secs(120),
            max_retries_total: 200,
            max_parallel_runs: 16,
        }
    }

    /// Reduz o timeout de uma ação ao máximo permitido.
    pub fn clamp_action_timeout(&self, requested: Duration) -> Duration {
        requested.min(self.max_action_timeout)
    }
}

fn env_value<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|val| val.parse().ok())
}

// ============================================================================
// VALIDAÇÃO DE LIMITES
// ============================================================================

/// Violação de limite detectada em um funil.
#[derive(Debug, Clone, PartialEq)]
pub struct LimitViolation {
    pub limit_name: String,
    pub limit_value: String,
    pub actual_value: String,
    pub message: String,
}

/// Verifica se um funil cabe nos limites.
///
/// - quantidade de steps
/// - pior caso de retries declarados (`(max_attempts - 1)` por ação)
pub fn validate_limits(flow: &FlowDefinition, limits: &AuditLimits) -> Vec<LimitViolation> {
    let mut violations = Vec::new();

    let step_count = flow.steps.len();
    if step_count > limits.max_steps {
        violations.push(LimitViolation {
            limit_name: "max_steps".to_string(),
            limit_value: limits.max_steps.to_string(),
            actual_value: step_count.to_string(),
            message: format!(
                "Funil tem {} steps, máximo permitido é {}",
                step_count, limits.max_steps
            ),
        });
    }

    let declared_retries: u64 = flow
        .steps
        .iter()
        .filter_map(|step| {
            step.retry.as_ref().map(|retry| {
                u64::from(retry.max_attempts.saturating_sub(1)) * step.actions.len() as u64
            })
        })
        .sum();
    if declared_retries > u64::from(limits.max_retries_total) {
        violations.push(LimitViolation {
            limit_name: "max_retries_total".to_string(),
            limit_value: limits.max_retries_total.to_string(),
            actual_value: declared_retries.to_string(),
            message: format!(
                "Funil pode fazer até {} retries, máximo permitido é {}",
                declared_retries, limits.max_retries_total
            ),
        });
    }

    violations
}

// ============================================================================
// CONTADOR DE RETRIES (RUNTIME)
// ============================================================================

/// Orçamento de retries de uma execução.
///
/// Um contador por execução; execuções paralelas não compartilham.
#[derive(Debug, Default)]
pub struct RetryCounter {
    count: AtomicU32,
    limit: u32,
}

impl RetryCounter {
    pub fn new(limit: u32) -> Self {
        Self {
            count: AtomicU32::new(0),
            limit,
        }
    }

    /// Consome um retry. Retorna `false` quando o orçamento acabou.
    pub fn try_increment(&self) -> bool {
        let current = self.count.fetch_add(1, Ordering::SeqCst);
        current < self.limit
    }

    pub fn current(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }
}

// ============================================================================
// TESTES
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ActionDefinition, ActionKind, RetryPolicy, SelectorRef, StepDefinition};

    fn flow_with_steps(count: usize, retry: Option<RetryPolicy>) -> FlowDefinition {
        let steps = (1..=count as u32)
            .map(|n| StepDefinition {
                step_number: n,
                name: format!("step {}", n),
                expected_url: "/".to_string(),
                actions: vec![ActionDefinition::new(
                    ActionKind::Click,
                    SelectorRef::Literal("#next".to_string()),
                    Duration::from_millis(100),
                )],
                optional: false,
                continue_on_failure: false,
                redirect_policy: None,
                retry: retry.clone(),
            })
            .collect();
        FlowDefinition {
            product_name: "Mobile".to_string(),
            product_type: "mobile".to_string(),
            flow_name: "sim-only".to_string(),
            start_url: "https://example.com".to_string(),
            variables: Default::default(),
            dismiss_consent: false,
            consent_selectors: vec![],
            click_handlers: Default::default(),
            steps,
        }
    }

    #[test]
    fn test_default_limits() {
        let limits = AuditLimits::default();
        assert_eq!(limits.max_steps, 100);
        assert_eq!(limits.max_retries_total, 50);
        assert_eq!(limits.poll_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_clamp_action_timeout() {
        let limits = AuditLimits::strict();
        assert_eq!(
            limits.clamp_action_timeout(Duration::from_secs(10)),
            Duration::from_millis(500)
        );
        assert_eq!(
            limits.clamp_action_timeout(Duration::from_millis(50)),
            Duration::from_millis(50)
        );
    }

    #[test]
    fn test_validate_limits_ok() {
        let flow = flow_with_steps(5, None);
        assert!(validate_limits(&flow, &AuditLimits::default()).is_empty());
    }

    #[test]
    fn test_validate_limits_steps_exceeded() {
        let flow = flow_with_steps(11, None);
        let violations = validate_limits(&flow, &AuditLimits::strict());
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].limit_name, "max_steps");
    }

    #[test]
    fn test_validate_limits_retries_exceeded() {
        let retry = RetryPolicy {
            max_attempts: 3,
            backoff_ms: 10,
            backoff_factor: 2.0,
        };
        // 4 steps * 1 ação * 2 retries = 8 > 5
        let flow = flow_with_steps(4, Some(retry));
        let violations = validate_limits(&flow, &AuditLimits::strict());
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].limit_name, "max_retries_total");
        assert_eq!(violations[0].actual_value, "8");
    }

    #[test]
    fn test_retry_counter() {
        let counter = RetryCounter::new(2);

        assert!(counter.try_increment());
        assert!(counter.try_increment());
        assert!(!counter.try_increment()); // excedeu

        assert_eq!(counter.current(), 3);
        assert_eq!(counter.limit(), 2);
    }
}
