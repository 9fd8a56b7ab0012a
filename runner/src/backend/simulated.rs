//! Deterministic page backend that replays a recorded site map.
//!
//! Used for dry runs of a flow definition (`funnel-auditor audit --site`)
//! and by the engine tests.
//!
//! ```json
//! {
//!   "pages": {
//!     "https://shop.example.com/": {
//!       "elements": {
//!         "#buy": { "state": "interactable", "navigates_to": "https://shop.example.com/plans" },
//!         "#hero": { "state": "present", "appears_after_ms": 200 }
//!       }
//!     },
//!     "https://shop.example.com/plans": { "redirect_to": "https://shop.example.com/login" }
//!   },
//!   "unreachable": ["https://shop.example.com/down"],
//!   "faulty_selectors": ["#crashes-the-tab"]
//! }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Duration, Instant};
use tracing::debug;

use super::{BackendError, ElementState, PageBackend};

/// Server-side redirects followed per navigation before giving up.
const MAX_REDIRECT_HOPS: usize = 10;

const BLANK_URL: &str = "about:blank";

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SiteMap {
    #[serde(default)]
    pub pages: BTreeMap<String, PageSpec>,
    /// URLs whose navigation fails at the network level.
    #[serde(default)]
    pub unreachable: Vec<String>,
    /// Selectors whose lookup crashes the backend.
    #[serde(default)]
    pub faulty_selectors: Vec<String>,
}

impl SiteMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(mut self, url: impl Into<String>, spec: PageSpec) -> Self {
        self.pages.insert(url.into(), spec);
        self
    }

    pub fn unreachable(mut self, url: impl Into<String>) -> Self {
        self.unreachable.push(url.into());
        self
    }

    pub fn faulty(mut self, selector: impl Into<String>) -> Self {
        self.faulty_selectors.push(selector.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct PageSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_to: Option<String>,
    /// Time the page takes to finish loading.
    #[serde(default)]
    pub load_ms: u64,
    #[serde(default)]
    pub elements: BTreeMap<String, ElementSpec>,
}

impl PageSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn redirect(url: impl Into<String>) -> Self {
        Self {
            redirect_to: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn loads_in(mut self, ms: u64) -> Self {
        self.load_ms = ms;
        self
    }

    pub fn element(mut self, selector: impl Into<String>, spec: ElementSpec) -> Self {
        self.elements.insert(selector.into(), spec);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ElementSpec {
    #[serde(default = "default_state")]
    pub state: ElementState,
    /// Delay after page load before the element shows up.
    #[serde(default)]
    pub appears_after_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub navigates_to: Option<String>,
}

fn default_state() -> ElementState {
    ElementState::Interactable
}

impl ElementSpec {
    pub fn interactable() -> Self {
        Self {
            state: ElementState::Interactable,
            appears_after_ms: 0,
            navigates_to: None,
        }
    }

    pub fn present_only() -> Self {
        Self {
            state: ElementState::Present,
            ..Self::interactable()
        }
    }

    pub fn appears_after(mut self, ms: u64) -> Self {
        self.appears_after_ms = ms;
        self
    }

    pub fn navigates_to(mut self, url: impl Into<String>) -> Self {
        self.navigates_to = Some(url.into());
        self
    }
}

/// One simulated browser tab over a shared site map.
#[derive(Debug)]
pub struct SimulatedPage {
    site: Arc<SiteMap>,
    current: Option<String>,
    loaded_at: Instant,
    history: Vec<String>,
}

impl SimulatedPage {
    pub fn new(site: Arc<SiteMap>) -> Self {
        Self {
            site,
            current: None,
            loaded_at: Instant::now(),
            history: Vec::new(),
        }
    }

    /// Every URL the tab landed on, redirect hops included.
    pub fn history(&self) -> &[String] {
        &self.history
    }

    fn current_page(&self) -> Option<&PageSpec> {
        self.current.as_ref().and_then(|url| self.site.pages.get(url))
    }

    fn element_state(&self, selector: &str) -> Result<ElementState, BackendError> {
        if self.site.faulty_selectors.iter().any(|s| s == selector) {
            return Err(BackendError::Disconnected(format!(
                "target crashed while resolving '{}'",
                selector
            )));
        }
        let Some(element) = self.current_page().and_then(|page| page.elements.get(selector)) else {
            return Ok(ElementState::Absent);
        };
        if self.loaded_at.elapsed().as_millis() < u128::from(element.appears_after_ms) {
            return Ok(ElementState::Absent);
        }
        Ok(element.state)
    }
}

#[async_trait]
impl PageBackend for SimulatedPage {
    async fn navigate(&mut self, url: &str) -> Result<(), BackendError> {
        let mut target = url.to_string();
        for _ in 0..=MAX_REDIRECT_HOPS {
            if self.site.unreachable.iter().any(|u| *u == target) {
                return Err(BackendError::Navigation {
                    url: target,
                    reason: "host unreachable".to_string(),
                });
            }
            self.history.push(target.clone());
            let (redirect, load_ms) = match self.site.pages.get(&target) {
                Some(page) => (page.redirect_to.clone(), page.load_ms),
                None => (None, 0),
            };
            if load_ms > 0 {
                sleep(Duration::from_millis(load_ms)).await;
            }
            match redirect {
                Some(next) => {
                    debug!(from = %target, to = %next, "simulated redirect");
                    target = next;
                }
                None => {
                    self.current = Some(target);
                    self.loaded_at = Instant::now();
                    return Ok(());
                }
            }
        }
        Err(BackendError::Navigation {
            url: url.to_string(),
            reason: format!("more than {} redirects", MAX_REDIRECT_HOPS),
        })
    }

    async fn current_url(&self) -> Result<String, BackendError> {
        Ok(self
            .current
            .clone()
            .unwrap_or_else(|| BLANK_URL.to_string()))
    }

    async fn query(&self, selector: &str) -> Result<ElementState, BackendError> {
        self.element_state(selector)
    }

    async fn click(&mut self, selector: &str) -> Result<(), BackendError> {
        match self.element_state(selector)? {
            ElementState::Interactable => {}
            ElementState::Present => return Err(BackendError::NotInteractable(selector.to_string())),
            ElementState::Absent => {
                return Err(BackendError::Other(format!("no element matches '{}'", selector)))
            }
        }
        let destination = self
            .current_page()
            .and_then(|page| page.elements.get(selector))
            .and_then(|element| element.navigates_to.clone());
        if let Some(url) = destination {
            self.navigate(&url).await?;
        }
        Ok(())
    }
}
