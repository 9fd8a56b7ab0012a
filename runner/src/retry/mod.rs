//! Módulo de Retry de ações.
//!
//! O executor de ações nunca repete nada: o timeout dele é um limite rígido.
//! A repetição mora uma camada acima, no Step Runner, e segue a `retry`
//! declarada no step:
//!
//! - só `timed_out` e `element_not_interactable` são repetidos
//! - `backend_error` nunca é repetido (o backend quebrou)
//! - o delay cresce exponencialmente por `backoff_factor`
//! - o orçamento global `max_retries_total` vale para a execução inteira

use std::time::Duration;

use crate::protocol::{ActionOutcome, RetryPolicy};

/// Agenda de tentativas de uma ação.
///
/// Sem política, permite uma única tentativa.
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    max_attempts: u32,
    attempt: u32,
    next_backoff_ms: u64,
    backoff_factor: f64,
}

impl RetrySchedule {
    pub fn new(policy: Option<&RetryPolicy>) -> Self {
        match policy {
            Some(policy) => Self {
                max_attempts: policy.max_attempts.max(1),
                attempt: 1,
                next_backoff_ms: policy.backoff_ms,
                backoff_factor: policy.backoff_factor,
            },
            None => Self::single_attempt(),
        }
    }

    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            attempt: 1,
            next_backoff_ms: 0,
            backoff_factor: 1.0,
        }
    }

    /// Tentativa atual (começa em 1).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Avança para a próxima tentativa e retorna o delay antes dela,
    /// ou `None` se as tentativas acabaram.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let delay = Duration::from_millis(self.next_backoff_ms);
        self.attempt += 1;
        // Fatores inválidos (negativos, NaN) viram backoff constante.
        let factor = if self.backoff_factor.is_finite() && self.backoff_factor >= 1.0 {
            self.backoff_factor
        } else {
            1.0
        };
        self.next_backoff_ms = (self.next_backoff_ms as f64 * factor) as u64;
        Some(delay)
    }
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self::single_attempt()
    }
}

/// Se vale a pena tentar a ação de novo depois deste resultado.
pub fn is_retryable(outcome: &ActionOutcome) -> bool {
    matches!(
        outcome,
        ActionOutcome::TimedOut { .. } | ActionOutcome::ElementNotInteractable { .. }
    )
}
