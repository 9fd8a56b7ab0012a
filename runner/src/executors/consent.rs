//! Cookie/consent banner dismissal before the first step.
//!
//! Best-effort: a banner that is missing or refuses the click never fails
//! the run, it only gets logged.

use tracing::{debug, info, instrument, warn};

use crate::backend::{ElementState, PageBackend};

/// Accept buttons of the consent managers seen most often on retail sites
/// (OneTrust, Cookiebot, Quantcast, TrustArc, Didomi, Usercentrics).
pub const DEFAULT_CONSENT_SELECTORS: &[&str] = &[
    "#onetrust-accept-btn-handler",
    "button[aria-label*='Accept']",
    "button[title*='Accept']",
    "#CybotCookiebotDialogBodyButtonAccept",
    "#CybotCookiebotDialogBodyLevelButtonLevelOptinAllowAll",
    ".qc-cmp2-summary-buttons .qc-cmp2-accept-all",
    "#truste-consent-button",
    ".didomi-accept-button",
    "#didomi-notice-agree-button",
    "button[data-testid='uc-accept-all-button']",
];

/// Clicks the first interactable selector from `selectors`, or from
/// [`DEFAULT_CONSENT_SELECTORS`] when `selectors` is empty.
///
/// Returns the selector that was clicked.
#[instrument(skip_all, fields(custom = !selectors.is_empty()))]
pub async fn dismiss_consent(page: &mut dyn PageBackend, selectors: &[String]) -> Option<String> {
    let candidates: Vec<String> = if selectors.is_empty() {
        DEFAULT_CONSENT_SELECTORS.iter().map(|s| s.to_string()).collect()
    } else {
        selectors.to_vec()
    };

    for selector in &candidates {
        match page.query(selector).await {
            Ok(ElementState::Interactable) => match page.click(selector).await {
                Ok(()) => {
                    info!(selector = %selector, "🍪 consent banner dismissed");
                    return Some(selector.clone());
                }
                Err(err) => {
                    warn!(selector = %selector, error = %err, "consent click failed, trying next");
                }
            },
            Ok(_) => {}
            Err(err) => {
                warn!(selector = %selector, error = %err, "consent lookup failed");
            }
        }
    }

    debug!("no consent banner found");
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ElementSpec, PageSpec, SimulatedPage, SiteMap};
    use std::sync::Arc;

    const URL: &str = "https://broadband.test/";

    #[tokio::test]
    async fn test_dismisses_known_banner() {
        let site = SiteMap::new().page(
            URL,
            PageSpec::new().element("#didomi-notice-agree-button", ElementSpec::interactable()),
        );
        let mut page = SimulatedPage::new(Arc::new(site));
        page.navigate(URL).await.unwrap();

        let clicked = dismiss_consent(&mut page, &[]).await;
        assert_eq!(clicked.as_deref(), Some("#didomi-notice-agree-button"));
    }

    #[tokio::test]
    async fn test_custom_selectors_replace_defaults() {
        let site = SiteMap::new().page(
            URL,
            PageSpec::new()
                .element("#onetrust-accept-btn-handler", ElementSpec::interactable())
                .element(".cookie-ok", ElementSpec::interactable()),
        );
        let mut page = SimulatedPage::new(Arc::new(site));
        page.navigate(URL).await.unwrap();

        let clicked = dismiss_consent(&mut page, &[".cookie-ok".to_string()]).await;
        assert_eq!(clicked.as_deref(), Some(".cookie-ok"));
    }

    #[tokio::test]
    async fn test_missing_or_broken_banner_is_not_an_error() {
        let site = SiteMap::new()
            .page(
                URL,
                PageSpec::new().element("#truste-consent-button", ElementSpec::present_only()),
            )
            .faulty("#onetrust-accept-btn-handler");
        let mut page = SimulatedPage::new(Arc::new(site));
        page.navigate(URL).await.unwrap();

        assert_eq!(dismiss_consent(&mut page, &[]).await, None);
    }
}
