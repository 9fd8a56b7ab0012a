//! # Módulo de Validação de Funis
//!
//! Valida definições de funil antes da execução. Um funil inválido nunca
//! chega a abrir o navegador: a falha é imediata (fail-fast) e o loader a
//! transforma em `AuditError::SchemaViolation`.
//!
//! ## Para leigos:
//!
//! Antes de mandar alguém percorrer a loja, conferimos o roteiro: os passos
//! estão numerados em ordem? Todo botão citado existe na lista de botões?
//! Os padrões de URL fazem sentido?
//!
//! ## Duas camadas:
//!
//! 1. **Estrutura** (`validate_json_schema`): o JSON bruto contra um JSON
//!    Schema embutido (tipos, campos obrigatórios)
//! 2. **Semântica** (`validate_flow`): regras que o schema não expressa
//!    (numeração crescente, handlers referenciados, regex válidas, limites)
//!
//! Todas as violações são coletadas, não só a primeira.

use std::collections::BTreeSet;

use jsonschema::{Draft, JSONSchema};
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use thiserror::Error;

use crate::errors::ErrorCode;
use crate::limits::{validate_limits, AuditLimits};
use crate::monitor::UrlPattern;
use crate::protocol::{FlowDefinition, ReturnTarget, SelectorRef, StepDefinition};

// ============================================================================
// TIPOS DE ERRO
// ============================================================================

/// Erros de validação de um funil.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    /// Funil sem nenhum step.
    #[error("Funil vazio: nenhum step definido")]
    EmptyFlow,

    #[error("start_url não pode ser vazia")]
    EmptyStartUrl,

    #[error("step_number {step_number} aparece mais de uma vez")]
    DuplicateStepNumber { step_number: u32 },

    /// Os steps precisam estar em ordem estritamente crescente.
    #[error("Step {step_number}: vem depois do step {previous}, numeração deve ser crescente")]
    StepOrder { step_number: u32, previous: u32 },

    /// Ação referencia um handler que não existe em `click_handlers`.
    #[error("Step {step_number}: handler '{handler}' não existe em click_handlers")]
    UnknownHandler { step_number: u32, handler: String },

    #[error("Handler '{handler}' não tem nenhum seletor")]
    EmptyHandler { handler: String },

    #[error("Step {step_number}, ação {action_index}: seletor vazio")]
    EmptySelector { step_number: u32, action_index: usize },

    #[error("Step {step_number}, ação {action_index}: timeout deve ser maior que zero")]
    InvalidTimeout { step_number: u32, action_index: usize },

    #[error("Step {step_number}: padrão de URL '{pattern}' inválido: {reason}")]
    InvalidUrlPattern {
        step_number: u32,
        pattern: String,
        reason: String,
    },

    /// `redirect_policy` sem nenhum padrão nunca classificaria um redirect.
    #[error("Step {step_number}: redirect_policy sem detect_patterns")]
    EmptyRedirectPolicy { step_number: u32 },

    #[error("Step {step_number}: retry.max_attempts deve ser pelo menos 1")]
    InvalidRetry { step_number: u32 },

    #[error("Limite '{limit}' excedido: {message}")]
    LimitExceeded { limit: String, message: String },

    /// JSON não bate com o schema de funil.
    #[error("Formato inválido: {0}")]
    InvalidFormat(String),
}

impl ValidationError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::EmptyFlow | Self::EmptyStartUrl => ErrorCode::EMPTY_FLOW,
            Self::DuplicateStepNumber { .. } => ErrorCode::DUPLICATE_STEP_NUMBER,
            Self::StepOrder { .. } => ErrorCode::STEP_ORDER,
            Self::UnknownHandler { .. } => ErrorCode::UNKNOWN_HANDLER,
            Self::EmptyHandler { .. } => ErrorCode::EMPTY_HANDLER,
            Self::EmptySelector { .. } => ErrorCode::EMPTY_SELECTOR,
            Self::InvalidTimeout { .. } => ErrorCode::INVALID_TIMEOUT,
            Self::InvalidUrlPattern { .. } => ErrorCode::INVALID_URL_PATTERN,
            Self::EmptyRedirectPolicy { .. } => ErrorCode::EMPTY_REDIRECT_POLICY,
            Self::InvalidRetry { .. } => ErrorCode::INVALID_RETRY,
            Self::LimitExceeded { .. } => ErrorCode::LIMIT_EXCEEDED,
            Self::InvalidFormat(_) => ErrorCode::INVALID_FLOW_FORMAT,
        }
    }
}

/// `Ok(())` ou a lista completa de problemas.
pub type ValidationResult = Result<(), Vec<ValidationError>>;

// ============================================================================
// JSON SCHEMA
// ============================================================================

static FLOW_SCHEMA: Lazy<Value> = Lazy::new(|| {
    let string_list = json!({ "type": "array", "items": { "type": "string" } });
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "title": "Funnel flow definition",
        "type": "object",
        "required": ["product_name", "flow_name", "start_url", "steps"],
        "properties": {
            "product_name": { "type": "string" },
            "product_type": { "type": "string" },
            "flow_name": { "type": "string" },
            "start_url": { "type": "string" },
            "variables": { "type": "object" },
            "dismiss_consent": { "type": "boolean" },
            "consent_selectors": string_list,
            "click_handlers": {
                "type": "object",
                "additionalProperties": {
                    "oneOf": [
                        string_list,
                        {
                            "type": "object",
                            "required": ["selectors"],
                            "properties": { "selectors": string_list }
                        }
                    ]
                }
            },
            "steps": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["step_number", "name", "expected_url"],
                    "properties": {
                        "step_number": { "type": "integer", "minimum": 0 },
                        "name": { "type": "string" },
                        "expected_url": { "type": "string" },
                        "optional": { "type": "boolean" },
                        "continue_on_failure": { "type": "boolean" },
                        "actions": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "required": ["type"],
                                "properties": {
                                    "type": { "enum": ["wait_for_selector", "click"] },
                                    "selector": { "type": "string" },
                                    "handler": { "type": "string" },
                                    "timeout_ms": { "type": "integer", "minimum": 0 },
                                    "timeout": { "type": "integer", "minimum": 0 }
                                }
                            }
                        },
                        "redirect_policy": {
                            "type": "object",
                            "required": ["detect_patterns"],
                            "properties": {
                                "detect_patterns": string_list,
                                "return_to": { "type": "string" }
                            }
                        },
                        "retry": {
                            "type": "object",
                            "required": ["max_attempts"],
                            "properties": {
                                "max_attempts": { "type": "integer", "minimum": 0 },
                                "backoff_ms": { "type": "integer", "minimum": 0 },
                                "backoff_factor": { "type": "number" }
                            }
                        }
                    }
                }
            }
        }
    })
});

static COMPILED_SCHEMA: Lazy<JSONSchema> = Lazy::new(|| {
    JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(&FLOW_SCHEMA)
        .expect("embedded flow schema must compile")
});

/// Valida o JSON bruto de um funil contra o schema embutido.
pub fn validate_json_schema(raw: &Value) -> ValidationResult {
    match COMPILED_SCHEMA.validate(raw) {
        Ok(()) => Ok(()),
        Err(errors) => Err(errors
            .map(|err| {
                let path = err.instance_path.to_string();
                let at = if path.is_empty() { "/".to_string() } else { path };
                ValidationError::InvalidFormat(format!("{} (em {})", err, at))
            })
            .collect()),
    }
}

// ============================================================================
// VALIDAÇÃO SEMÂNTICA
// ============================================================================

/// Valida um funil já deserializado.
///
/// ## Regras:
///
/// 1. `start_url` preenchida e ao menos um step
/// 2. `step_number` únicos e estritamente crescentes
/// 3. handlers com pelo menos um seletor
/// 4. cada ação: seletor não vazio, handler existente, timeout > 0
/// 5. padrões de URL (`expected_url`, `detect_patterns`) compiláveis
/// 6. `redirect_policy` com padrões, `retry` com `max_attempts >= 1`
/// 7. limites de execução (`AuditLimits`)
pub fn validate_flow(flow: &FlowDefinition, limits: &AuditLimits) -> ValidationResult {
    let mut errors = Vec::new();

    if flow.start_url.trim().is_empty() {
        errors.push(ValidationError::EmptyStartUrl);
    }
    if flow.steps.is_empty() {
        errors.push(ValidationError::EmptyFlow);
        // Sem steps não há mais nada a conferir.
        return Err(errors);
    }

    validate_numbering(&flow.steps, &mut errors);

    for handler in flow.click_handlers.values() {
        if handler.selectors.iter().all(|s| s.trim().is_empty()) {
            errors.push(ValidationError::EmptyHandler {
                handler: handler.name.clone(),
            });
        }
    }

    for step in &flow.steps {
        validate_step(step, flow, &mut errors);
    }

    errors.extend(
        validate_limits(flow, limits)
            .into_iter()
            .map(|violation| ValidationError::LimitExceeded {
                limit: violation.limit_name,
                message: violation.message,
            }),
    );

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_numbering(steps: &[StepDefinition], errors: &mut Vec<ValidationError>) {
    let mut seen = BTreeSet::new();
    let mut previous: Option<u32> = None;

    for step in steps {
        let number = step.step_number;
        if !seen.insert(number) {
            errors.push(ValidationError::DuplicateStepNumber { step_number: number });
        } else if let Some(prev) = previous.filter(|prev| number <= *prev) {
            errors.push(ValidationError::StepOrder {
                step_number: number,
                previous: prev,
            });
        }
        previous = Some(number);
    }
}

fn validate_step(step: &StepDefinition, flow: &FlowDefinition, errors: &mut Vec<ValidationError>) {
    let number = step.step_number;

    for (index, action) in step.actions.iter().enumerate() {
        let action_index = index + 1;
        match &action.selector {
            SelectorRef::Literal(selector) if selector.trim().is_empty() => {
                errors.push(ValidationError::EmptySelector {
                    step_number: number,
                    action_index,
                });
            }
            SelectorRef::Handler(name) if flow.handler(name).is_none() => {
                errors.push(ValidationError::UnknownHandler {
                    step_number: number,
                    handler: name.clone(),
                });
            }
            _ => {}
        }
        if action.timeout.is_zero() {
            errors.push(ValidationError::InvalidTimeout {
                step_number: number,
                action_index,
            });
        }
    }

    check_pattern(number, &step.expected_url, errors);

    if let Some(policy) = &step.redirect_policy {
        if policy.detect_patterns.is_empty() {
            errors.push(ValidationError::EmptyRedirectPolicy { step_number: number });
        }
        for pattern in &policy.detect_patterns {
            check_pattern(number, pattern, errors);
        }
        if let ReturnTarget::Url(url) = &policy.return_to {
            if url.trim().is_empty() {
                errors.push(ValidationError::InvalidUrlPattern {
                    step_number: number,
                    pattern: url.clone(),
                    reason: "return_to vazio".to_string(),
                });
            }
        }
    }

    if step.retry.as_ref().is_some_and(|retry| retry.max_attempts == 0) {
        errors.push(ValidationError::InvalidRetry { step_number: number });
    }
}

fn check_pattern(step_number: u32, pattern: &str, errors: &mut Vec<ValidationError>) {
    if pattern.trim().is_empty() {
        errors.push(ValidationError::InvalidUrlPattern {
            step_number,
            pattern: pattern.to_string(),
            reason: "padrão vazio".to_string(),
        });
        return;
    }
    if let Err(err) = UrlPattern::parse(pattern) {
        errors.push(ValidationError::InvalidUrlPattern {
            step_number,
            pattern: pattern.to_string(),
            reason: err.to_string(),
        });
    }
}

// ============================================================================
// TESTES
// ============================================================================
