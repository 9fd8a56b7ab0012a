//! # Módulo de Carregamento - Leitura de Funis
//!
//! Lê definições de funil (e mapas de site simulados) do disco.
//!
//! ## O que este módulo faz?
//!
//! 1. Lê o arquivo
//! 2. Confere o JSON contra o schema embutido
//! 3. Converte em `FlowDefinition`
//! 4. Resolve placeholders `${nome}` / `${ENV_NOME}`
//! 5. Roda a validação semântica
//!
//! Qualquer falha de formato ou de regra vira `AuditError::SchemaViolation`,
//! e a execução nem começa.
//!
//! ## Exemplo de uso:
//!
//! ```ignore
//! let flow = load_flow_from_file("./flows/fibre-500.json", &AuditLimits::from_env())?;
//! println!("Funil carregado: {}", flow.flow_name);
//! ```

use std::fs;
use std::path::Path;

use serde_json::Value;
use tracing::info;

use crate::backend::SiteMap;
use crate::context::Variables;
use crate::errors::AuditError;
use crate::limits::AuditLimits;
use crate::protocol::{FlowDefinition, ReturnTarget};
use crate::validation::{validate_flow, validate_json_schema, ValidationError};

/// Carrega e valida um funil de um arquivo JSON.
///
/// ## Exemplos de erro:
/// - `E4003` arquivo não existe
/// - `E1009` JSON malformado ou fora do schema
/// - `E1xxx` regra semântica violada (ver `validation`)
/// - `E4001` / `E4002` placeholder sem valor
pub fn load_flow_from_file<P: AsRef<Path>>(path: P, limits: &AuditLimits) -> Result<FlowDefinition, AuditError> {
    let path_ref = path.as_ref();
    let content = fs::read_to_string(path_ref)
        .map_err(|err| AuditError::from_io(path_ref.display().to_string(), err))?;

    let flow = load_flow_from_str(&content, limits)?;
    info!(path = %path_ref.display(), flow = %flow.flow_name, steps = flow.steps.len(), "📋 funil carregado");
    Ok(flow)
}

/// Mesmo pipeline de `load_flow_from_file`, a partir de uma string.
pub fn load_flow_from_str(content: &str, limits: &AuditLimits) -> Result<FlowDefinition, AuditError> {
    let raw: Value = serde_json::from_str(content)
        .map_err(|err| format_violation(format!("JSON inválido: {}", err)))?;

    validate_json_schema(&raw).map_err(AuditError::SchemaViolation)?;

    let mut flow: FlowDefinition =
        serde_json::from_value(raw).map_err(|err| format_violation(err.to_string()))?;

    interpolate_flow(&mut flow)?;

    validate_flow(&flow, limits).map_err(AuditError::SchemaViolation)?;
    Ok(flow)
}

/// Lê o mapa de site usado pelo backend simulado.
pub fn load_site_map<P: AsRef<Path>>(path: P) -> Result<SiteMap, AuditError> {
    let path_ref = path.as_ref();
    let content = fs::read_to_string(path_ref)
        .map_err(|err| AuditError::from_io(path_ref.display().to_string(), err))?;
    Ok(serde_json::from_str(&content)?)
}

fn format_violation(message: String) -> AuditError {
    AuditError::SchemaViolation(vec![ValidationError::InvalidFormat(message)])
}

/// Resolve placeholders nos campos de URL do funil. Seletores ficam como estão.
fn interpolate_flow(flow: &mut FlowDefinition) -> Result<(), AuditError> {
    let vars = Variables::from_map(&flow.variables);

    flow.start_url = vars.interpolate_str(&flow.start_url)?;
    for step in &mut flow.steps {
        step.expected_url = vars.interpolate_str(&step.expected_url)?;
        if let Some(policy) = &mut step.redirect_policy {
            for pattern in &mut policy.detect_patterns {
                *pattern = vars.interpolate_str(pattern)?;
            }
            if let ReturnTarget::Url(url) = &mut policy.return_to {
                *url = vars.interpolate_str(url)?;
            }
        }
    }
    Ok(())
}

// ============================================================================
// TESTES
// ============================================================================
