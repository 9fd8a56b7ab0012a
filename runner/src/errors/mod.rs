//! # Módulo de Códigos de Erro Estruturados
//!
//! Define códigos de erro padronizados para o auditor de funis e o
//! erro `AuditError`, que é o único tipo de erro que atravessa a
//! fronteira do motor.
//!
//! ## Categorias de Erro
//!
//! | Faixa  | Categoria       | Descrição                                  |
//! |--------|-----------------|--------------------------------------------|
//! | E1xxx  | Schema          | Definição de funil inválida                |
//! | E2xxx  | Ação            | Espera ou clique não concluído             |
//! | E3xxx  | Localização     | Página fora do esperado / recuperação      |
//! | E4xxx  | Configuração    | Arquivo, variável de ambiente, variável    |
//! | E5xxx  | Backend         | O próprio harness quebrou                  |
//!
//! ## Exemplo:
//!
//! ```text
//! [E2001] action #1 (click handler:buy) timed out after 5000ms (step 2)
//! ```
//!
//! Falhas de step (E2xxx, E3xxx) ficam registradas no `StepResult`.
//! Só `SchemaViolation` e `BackendFault` abortam uma execução.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::validation::ValidationError;

// ============================================================================
// CÓDIGO DE ERRO
// ============================================================================

/// Código de erro estruturado com categoria e número.
///
/// Primeiro dígito: categoria (1-5). Últimos 3 dígitos: erro específico.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(u16);

impl ErrorCode {
    // ========================================================================
    // E1xxx: Schema
    // ========================================================================
    // Detectados no carregamento. Impedem a execução de começar.

    /// Funil sem nenhum step.
    pub const EMPTY_FLOW: Self = Self(1001);

    /// Dois steps com o mesmo `step_number`.
    pub const DUPLICATE_STEP_NUMBER: Self = Self(1002);

    /// `step_number` fora de ordem crescente.
    pub const STEP_ORDER: Self = Self(1003);

    /// Ação referencia um handler que não existe em `click_handlers`.
    pub const UNKNOWN_HANDLER: Self = Self(1004);

    /// Handler sem nenhum seletor candidato.
    pub const EMPTY_HANDLER: Self = Self(1005);

    /// Seletor vazio ou só espaços.
    pub const EMPTY_SELECTOR: Self = Self(1006);

    /// Timeout de ação igual a zero.
    pub const INVALID_TIMEOUT: Self = Self(1007);

    /// Padrão de URL inválido (regex que não compila, ou vazio).
    pub const INVALID_URL_PATTERN: Self = Self(1008);

    /// JSON malformado ou fora do schema.
    pub const INVALID_FLOW_FORMAT: Self = Self(1009);

    /// Funil excede um limite de execução.
    pub const LIMIT_EXCEEDED: Self = Self(1010);

    /// Política de retry com `max_attempts == 0`.
    pub const INVALID_RETRY: Self = Self(1011);

    /// `redirect_policy` sem nenhum padrão de detecção.
    pub const EMPTY_REDIRECT_POLICY: Self = Self(1012);

    // ========================================================================
    // E2xxx: Ações
    // ========================================================================

    /// Espera/polling excedeu o timeout da ação.
    pub const ACTION_TIMEOUT: Self = Self(2001);

    /// Elemento encontrado, mas não clicável.
    pub const ELEMENT_NOT_INTERACTABLE: Self = Self(2002);

    // ========================================================================
    // E3xxx: Localização
    // ========================================================================

    /// Página terminou fora da URL esperada e fora de um redirect conhecido.
    pub const LOCATION_MISMATCH: Self = Self(3001);

    /// Navegação de recuperação após redirect conhecido não concluiu.
    pub const RECOVERY_FAILED: Self = Self(3002);

    // ========================================================================
    // E4xxx: Configuração
    // ========================================================================

    /// `${ENV_X}` usado mas X não existe.
    pub const ENV_VAR_NOT_FOUND: Self = Self(4001);

    /// `${nome}` usado mas não declarado em `variables`.
    pub const FLOW_VARIABLE_NOT_FOUND: Self = Self(4002);

    /// Arquivo de funil (ou site map) não encontrado.
    pub const FLOW_FILE_NOT_FOUND: Self = Self(4003);

    /// Sem permissão para ler o arquivo.
    pub const FILE_PERMISSION_ERROR: Self = Self(4004);

    // ========================================================================
    // E5xxx: Backend / Interno
    // ========================================================================

    /// O backend de página falhou (crash, desconexão).
    pub const BACKEND_FAULT: Self = Self(5001);

    /// Erro interno inesperado.
    pub const INTERNAL_ERROR: Self = Self(5002);

    /// Erro de serialização.
    pub const SERIALIZATION_ERROR: Self = Self(5003);

    pub fn code(&self) -> u16 {
        self.0
    }

    /// Exemplo: `ErrorCode::EMPTY_FLOW.formatted() == "E1001"`
    pub fn formatted(&self) -> String {
        format!("E{:04}", self.0)
    }

    pub fn category(&self) -> ErrorCategory {
        match self.0 / 1000 {
            1 => ErrorCategory::Schema,
            2 => ErrorCategory::Action,
            3 => ErrorCategory::Location,
            4 => ErrorCategory::Configuration,
            5 => ErrorCategory::Backend,
            _ => ErrorCategory::Unknown,
        }
    }

    pub fn description(&self) -> &'static str {
        match self.0 {
            1001 => "Funil vazio",
            1002 => "step_number duplicado",
            1003 => "step_number fora de ordem",
            1004 => "Handler desconhecido",
            1005 => "Handler sem seletores",
            1006 => "Seletor vazio",
            1007 => "Timeout inválido",
            1008 => "Padrão de URL inválido",
            1009 => "Formato de funil inválido",
            1010 => "Limite de execução excedido",
            1011 => "Política de retry inválida",
            1012 => "Política de redirect sem padrões",
            2001 => "Timeout de ação",
            2002 => "Elemento não interagível",
            3001 => "Localização inesperada",
            3002 => "Recuperação de redirect falhou",
            4001 => "Variável de ambiente não definida",
            4002 => "Variável do funil não encontrada",
            4003 => "Arquivo não encontrado",
            4004 => "Erro de permissão",
            5001 => "Falha do backend de página",
            5002 => "Erro interno",
            5003 => "Erro de serialização",
            _ => "Erro desconhecido",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.formatted())
    }
}

// ============================================================================
// CATEGORIA DE ERRO
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// E1xxx: problema está no arquivo do funil.
    Schema,
    /// E2xxx: o site não respondeu como o usuário precisaria.
    Action,
    /// E3xxx: o usuário foi parar onde não deveria.
    Location,
    /// E4xxx: problema de setup.
    Configuration,
    /// E5xxx: o harness quebrou, não o produto.
    Backend,
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Schema => write!(f, "Schema"),
            Self::Action => write!(f, "Ação"),
            Self::Location => write!(f, "Localização"),
            Self::Configuration => write!(f, "Configuração"),
            Self::Backend => write!(f, "Backend"),
            Self::Unknown => write!(f, "Desconhecido"),
        }
    }
}

// ============================================================================
// ERRO DE AUDITORIA
// ============================================================================

/// Erros que abortam o carregamento ou a execução de um funil.
#[derive(Debug, Error)]
pub enum AuditError {
    /// Definição rejeitada no carregamento (fail-fast, nunca por step).
    #[error("flow definition rejected: {}", join_violations(.0))]
    SchemaViolation(Vec<ValidationError>),

    #[error("failed to read {path}: {message}")]
    FlowFile {
        path: String,
        kind: io::ErrorKind,
        message: String,
    },

    #[error("missing environment variable '{0}'")]
    MissingEnvVar(String),

    #[error("missing flow variable '{0}'")]
    MissingVariable(String),

    /// O backend de página falhou; `step_number` é `None` se a falha
    /// aconteceu antes do primeiro step (navegação inicial).
    #[error("page backend fault{}: {message}", step_suffix(.step_number))]
    BackendFault {
        step_number: Option<u32>,
        message: String,
    },

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AuditError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::SchemaViolation(violations) => violations
                .first()
                .map(ValidationError::code)
                .unwrap_or(ErrorCode::INVALID_FLOW_FORMAT),
            Self::FlowFile { kind, .. } => match kind {
                io::ErrorKind::NotFound => ErrorCode::FLOW_FILE_NOT_FOUND,
                io::ErrorKind::PermissionDenied => ErrorCode::FILE_PERMISSION_ERROR,
                _ => ErrorCode::INTERNAL_ERROR,
            },
            Self::MissingEnvVar(_) => ErrorCode::ENV_VAR_NOT_FOUND,
            Self::MissingVariable(_) => ErrorCode::FLOW_VARIABLE_NOT_FOUND,
            Self::BackendFault { .. } => ErrorCode::BACKEND_FAULT,
            Self::Serialization(_) => ErrorCode::SERIALIZATION_ERROR,
            Self::Internal(_) => ErrorCode::INTERNAL_ERROR,
        }
    }

    /// Mensagem para o usuário final, prefixada com o código.
    pub fn user_message(&self) -> String {
        format!("[{}] {}", self.code(), self)
    }

    pub fn from_io(path: impl Into<String>, err: io::Error) -> Self {
        Self::FlowFile {
            path: path.into(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

fn join_violations(violations: &[ValidationError]) -> String {
    violations
        .iter()
        .map(|v| format!("[{}] {}", v.code(), v))
        .collect::<Vec<_>>()
        .join("; ")
}

fn step_suffix(step_number: &Option<u32>) -> String {
    step_number
        .map(|n| format!(" at step {}", n))
        .unwrap_or_default()
}
