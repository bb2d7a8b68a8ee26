// =============================================================================
// Provider adapters — per-provider strategies for fetching ETF holdings
// =============================================================================
//
// Three families share one interface: file drop-in, direct HTTP API, and
// browser automation over a driver subprocess. The registry dispatches by
// ISIN, tries the file-drop adapter first, caps global concurrency, and
// serializes requests per provider so no host sees parallel traffic.
// =============================================================================

pub mod browser;
pub mod file_drop;
pub mod ishares;
pub mod tickers;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::contracts::schemas::Holding;

/// Typed adapter failure; rate limits surface upward instead of being
/// retried inside a run.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("rate limited by provider")]
    RateLimited,
    #[error("request timed out")]
    Timeout,
    #[error("http error: {0}")]
    Http(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("io error: {0}")]
    Io(String),
}

pub type AdapterResult = Result<Option<Vec<Holding>>, AdapterError>;

/// Hint surfaced to the user when every automatic tier fails.
#[derive(Debug, Clone)]
pub struct ProviderHint {
    pub provider: String,
    pub download_url: Option<String>,
}

/// A holdings-retrieval strategy for one provider.
#[async_trait]
pub trait HoldingsAdapter: Send + Sync {
    /// Provider name, e.g. "ishares".
    fn provider(&self) -> &str;

    /// Whether this adapter knows how to fetch the given ISIN.
    fn handles(&self, isin: &str) -> bool;

    /// Fetch and normalize holdings. `Ok(None)` means the adapter cannot
    /// produce data for this ISIN (not an error).
    async fn fetch_holdings(&self, isin: &str) -> AdapterResult;

    /// Product download page, if the adapter can construct one.
    fn download_url(&self, _isin: &str) -> Option<String> {
        None
    }
}

/// Registry of adapters with global and per-provider concurrency control.
pub struct AdapterRegistry {
    adapters: Vec<Arc<dyn HoldingsAdapter>>,
    /// Global cap on in-flight network fetches across all providers.
    inflight: Arc<Semaphore>,
}

impl AdapterRegistry {
    pub fn new(max_inflight: usize) -> Self {
        Self {
            adapters: Vec::new(),
            inflight: Arc::new(Semaphore::new(max_inflight.max(1))),
        }
    }

    pub fn register(&mut self, adapter: Arc<dyn HoldingsAdapter>) {
        self.adapters.push(adapter);
    }

    /// First adapter claiming the ISIN, in registration order (file-drop
    /// registers first so user-provided files always win).
    pub fn adapter_for(&self, isin: &str) -> Option<&Arc<dyn HoldingsAdapter>> {
        self.adapters.iter().find(|a| a.handles(isin))
    }

    pub fn has_adapter(&self, isin: &str) -> bool {
        self.adapter_for(isin).is_some()
    }

    pub fn provider_hint(&self, isin: &str) -> Option<ProviderHint> {
        self.adapter_for(isin).map(|a| ProviderHint {
            provider: a.provider().to_string(),
            download_url: a.download_url(isin),
        })
    }

    /// Fetch holdings via the first matching adapter, under the global
    /// in-flight cap. Per-provider serialization lives inside each adapter.
    pub async fn fetch_holdings(&self, isin: &str) -> AdapterResult {
        let Some(adapter) = self.adapter_for(isin) else {
            debug!(isin, "no adapter registered");
            return Ok(None);
        };

        let _permit = self
            .inflight
            .acquire()
            .await
            .map_err(|_| AdapterError::Io("adapter semaphore closed".to_string()))?;

        match adapter.fetch_holdings(isin).await {
            Ok(Some(holdings)) if holdings.is_empty() => {
                warn!(isin, provider = adapter.provider(), "adapter returned empty holdings");
                Ok(None)
            }
            other => other,
        }
    }
}

/// Map an HTTP status into the adapter error taxonomy.
pub fn classify_status(status: reqwest::StatusCode, body: &str) -> AdapterError {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        AdapterError::RateLimited
    } else {
        AdapterError::Http(format!("{status}: {body}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticAdapter {
        provider: &'static str,
        isin: &'static str,
        holdings: Vec<Holding>,
    }

    #[async_trait]
    impl HoldingsAdapter for StaticAdapter {
        fn provider(&self) -> &str {
            self.provider
        }

        fn handles(&self, isin: &str) -> bool {
            isin == self.isin
        }

        async fn fetch_holdings(&self, _isin: &str) -> AdapterResult {
            Ok(Some(self.holdings.clone()))
        }
    }

    #[tokio::test]
    async fn registry_dispatches_in_registration_order() {
        let mut registry = AdapterRegistry::new(8);
        registry.register(Arc::new(StaticAdapter {
            provider: "first",
            isin: "IE00B4L5Y983",
            holdings: vec![Holding::new("AAPL", "Apple Inc.", 10.0)],
        }));
        registry.register(Arc::new(StaticAdapter {
            provider: "second",
            isin: "IE00B4L5Y983",
            holdings: vec![],
        }));

        let adapter = registry.adapter_for("IE00B4L5Y983").unwrap();
        assert_eq!(adapter.provider(), "first");

        let holdings = registry.fetch_holdings("IE00B4L5Y983").await.unwrap().unwrap();
        assert_eq!(holdings.len(), 1);
    }

    #[tokio::test]
    async fn unknown_isin_yields_none() {
        let registry = AdapterRegistry::new(8);
        assert!(registry.fetch_holdings("LU0000000000").await.unwrap().is_none());
        assert!(!registry.has_adapter("LU0000000000"));
        assert!(registry.provider_hint("LU0000000000").is_none());
    }

    #[tokio::test]
    async fn empty_adapter_result_collapses_to_none() {
        let mut registry = AdapterRegistry::new(8);
        registry.register(Arc::new(StaticAdapter {
            provider: "empty",
            isin: "IE00B4L5Y983",
            holdings: vec![],
        }));
        assert!(registry.fetch_holdings("IE00B4L5Y983").await.unwrap().is_none());
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS, ""),
            AdapterError::RateLimited
        ));
        assert!(matches!(
            classify_status(reqwest::StatusCode::INTERNAL_SERVER_ERROR, "boom"),
            AdapterError::Http(_)
        ));
    }
}
