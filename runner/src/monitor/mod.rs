// Module: Monitor
// Classifies where the page ended up after a step's actions.

use regex::Regex;

use crate::protocol::{ReturnTarget, StepDefinition, VerdictKind};

const REGEX_PREFIX: &str = "regex:";

/// A URL pattern as written in a flow definition.
///
/// - `regex:<expr>` is a regular expression searched in the full URL
/// - a pattern containing `*` is a glob matched against the whole URL
/// - anything else is a plain substring
///
/// Substring and glob patterns ignore the query string and fragment unless
/// the pattern itself contains `?` or `#`, so `/login?next=/plans` does not
/// satisfy `/plans`.
#[derive(Debug, Clone)]
pub enum UrlPattern {
    Substring { needle: String, full_url: bool },
    Glob { re: Regex, full_url: bool },
    Regex(Regex),
}

impl UrlPattern {
    pub fn parse(raw: &str) -> Result<Self, regex::Error> {
        if let Some(expr) = raw.strip_prefix(REGEX_PREFIX) {
            return Regex::new(expr).map(Self::Regex);
        }
        let full_url = raw.contains(['?', '#']);
        if raw.contains('*') {
            let body = raw
                .split('*')
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(".*");
            return Regex::new(&format!("^{}$", body)).map(|re| Self::Glob { re, full_url });
        }
        Ok(Self::Substring {
            needle: raw.to_string(),
            full_url,
        })
    }

    pub fn matches(&self, url: &str) -> bool {
        match self {
            Self::Substring { needle, full_url } => scoped(url, *full_url).contains(needle.as_str()),
            Self::Glob { re, full_url } => re.is_match(scoped(url, *full_url)),
            Self::Regex(re) => re.is_match(url),
        }
    }
}

/// Scheme, host and path of `url`, or all of it when `full_url` is set.
fn scoped(url: &str, full_url: bool) -> &str {
    if full_url {
        return url;
    }
    url.find(['?', '#']).map_or(url, |end| &url[..end])
}

/// Unparseable patterns never match; validation rejects them before a run.
fn pattern_matches(raw: &str, url: &str) -> bool {
    UrlPattern::parse(raw)
        .map(|pattern| pattern.matches(url))
        .unwrap_or(false)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectVerdict {
    OnTrack,
    KnownRedirect { pattern: String, target: String },
    UnexpectedLocation,
}

impl RedirectVerdict {
    pub fn kind(&self) -> VerdictKind {
        match self {
            Self::OnTrack => VerdictKind::OnTrack,
            Self::KnownRedirect { .. } => VerdictKind::KnownRedirect,
            Self::UnexpectedLocation => VerdictKind::UnexpectedLocation,
        }
    }
}

/// Advisory only: classifies, never navigates.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedirectMonitor;

impl RedirectMonitor {
    pub fn new() -> Self {
        Self
    }

    /// `previous_step_url` is what the `previous_step_url` sentinel resolves to
    /// for this step.
    pub fn classify(
        &self,
        current_url: &str,
        step: &StepDefinition,
        previous_step_url: &str,
    ) -> RedirectVerdict {
        if pattern_matches(&step.expected_url, current_url) {
            return RedirectVerdict::OnTrack;
        }

        let Some(policy) = &step.redirect_policy else {
            return RedirectVerdict::UnexpectedLocation;
        };
        let detected = policy
            .detect_patterns
            .iter()
            .find(|pattern| pattern_matches(pattern, current_url));

        match detected {
            Some(pattern) => {
                let target = match &policy.return_to {
                    ReturnTarget::PreviousStepUrl => previous_step_url.to_string(),
                    ReturnTarget::Url(url) => url.clone(),
                };
                RedirectVerdict::KnownRedirect {
                    pattern: pattern.clone(),
                    target,
                }
            }
            None => RedirectVerdict::UnexpectedLocation,
        }
    }
}
