// Module: Context
// Flow variable interpolation and the state carried across the steps of one run.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::backend::PageBackend;
use crate::errors::AuditError;
use crate::limits::{AuditLimits, RetryCounter};

static INTERPOLATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z0-9_.:-]+)\}").expect("valid interpolation regex")
});

/// Values available to `${name}` placeholders in a flow definition.
#[derive(Debug, Default, Clone)]
pub struct Variables {
    pub values: BTreeMap<String, Value>,
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(values: &BTreeMap<String, Value>) -> Self {
        Self {
            values: values.clone(),
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Interpolates placeholders like ${host} or ${ENV_SHOP_HOST} inside a string.
    pub fn interpolate_str(&self, input: &str) -> Result<String, AuditError> {
        let mut result = String::with_capacity(input.len());
        let mut last_index = 0;

        for capture in INTERPOLATION_RE.captures_iter(input) {
            let (Some(matched), Some(token)) = (capture.get(0), capture.get(1)) else {
                continue;
            };
            result.push_str(&input[last_index..matched.start()]);
            result.push_str(&self.resolve_token(token.as_str())?);
            last_index = matched.end();
        }

        result.push_str(&input[last_index..]);
        Ok(result)
    }

    fn resolve_token(&self, token: &str) -> Result<String, AuditError> {
        if let Some(rest) = token.strip_prefix("ENV_") {
            std::env::var(rest).map_err(|_| AuditError::MissingEnvVar(rest.to_string()))
        } else if let Some(value) = self.values.get(token) {
            match value {
                Value::String(s) => Ok(s.clone()),
                primitive => Ok(primitive.to_string()),
            }
        } else {
            Err(AuditError::MissingVariable(token.to_string()))
        }
    }
}

/// Run-scoped state handed to every component call of a single flow run.
///
/// Holds the exclusive page handle, so two steps can never touch the page at
/// the same time, and the last URL reached by a passing step.
pub struct RunContext<'a> {
    pub page: &'a mut dyn PageBackend,
    pub start_url: String,
    pub last_good_url: Option<String>,
    pub limits: AuditLimits,
    pub retries: RetryCounter,
    cancel: CancellationToken,
}

impl<'a> RunContext<'a> {
    pub fn new(
        page: &'a mut dyn PageBackend,
        start_url: impl Into<String>,
        limits: AuditLimits,
        cancel: CancellationToken,
    ) -> Self {
        let retries = RetryCounter::new(limits.max_retries_total);
        Self {
            page,
            start_url: start_url.into(),
            last_good_url: None,
            limits,
            retries,
            cancel,
        }
    }

    /// Target of `previous_step_url`: the URL recorded by the last step that
    /// passed or recovered, or the flow's start URL when there is none yet.
    pub fn previous_step_url(&self) -> &str {
        self.last_good_url.as_deref().unwrap_or(&self.start_url)
    }

    pub fn record_good_url(&mut self, url: impl Into<String>) {
        self.last_good_url = Some(url.into());
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}
