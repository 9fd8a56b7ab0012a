// Module: Backend
// The page automation capability the engine drives. Concrete browsers live
// outside this crate; `simulated` replays a recorded site map.

pub mod simulated;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{sleep, Instant};

pub use simulated::{ElementSpec, PageSpec, SimulatedPage, SiteMap};

/// How far along an element is. Ordered: an interactable element is also present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementState {
    Absent,
    Present,
    Interactable,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The backend refused a click because the element cannot take input.
    #[error("element '{0}' is not interactable")]
    NotInteractable(String),

    #[error("navigation to '{url}' failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("page backend disconnected: {0}")]
    Disconnected(String),

    #[error("page backend error: {0}")]
    Other(String),
}

/// Capability set the engine needs from a browser context.
///
/// Implementations are exclusively owned by one run at a time; the engine
/// never calls into the same backend concurrently.
#[async_trait]
pub trait PageBackend: Send + Sync {
    async fn navigate(&mut self, url: &str) -> Result<(), BackendError>;

    async fn current_url(&self) -> Result<String, BackendError>;

    async fn query(&self, selector: &str) -> Result<ElementState, BackendError>;

    async fn click(&mut self, selector: &str) -> Result<(), BackendError>;

    /// Polls `selectors` in order until one reaches `at_least` or `timeout`
    /// elapses. Returns the index of the first candidate that matched.
    ///
    /// Backends with a native wait primitive may override this.
    async fn wait_for_any(
        &self,
        selectors: &[String],
        at_least: ElementState,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Option<usize>, BackendError> {
        let deadline = Instant::now() + timeout;
        loop {
            for (index, selector) in selectors.iter().enumerate() {
                if self.query(selector).await? >= at_least {
                    return Ok(Some(index));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            sleep(poll_interval.min(deadline - now)).await;
        }
    }
}
