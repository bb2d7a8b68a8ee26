// =============================================================================
// External API cascade — Wikidata, Finnhub, YFinance ISIN lookups
// =============================================================================
//
// Tier-1 holdings only. Every provider call is paced with a per-call sleep
// instead of a token bucket; the cascade runs rarely enough that simple
// sleeps keep us inside every provider's limits. A 429 surfaces as a typed
// rate-limit error and is never retried within a run.
//
// When a shared proxy is configured (PROXY_URL / PROXY_API_KEY) the Finnhub
// profile call routes through it; the cascade logic is identical, only the
// transport changes.
// =============================================================================

use std::sync::atomic::{AtomicU32, Ordering};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::adapters::AdapterError;
use crate::isin::normalize_isin;

const WIKIDATA_PAUSE: std::time::Duration = std::time::Duration::from_millis(500);
const FINNHUB_PAUSE: std::time::Duration = std::time::Duration::from_millis(1100);
const YFINANCE_PAUSE: std::time::Duration = std::time::Duration::from_millis(500);

// =============================================================================
// Call budget tracking
// =============================================================================

/// Lock-free counters of external calls spent this run, per provider.
/// Snapshots feed the pipeline health report.
#[derive(Default)]
pub struct CallBudget {
    wikidata: AtomicU32,
    finnhub: AtomicU32,
    yfinance: AtomicU32,
    rate_limited: AtomicU32,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallBudgetSnapshot {
    pub wikidata_calls: u32,
    pub finnhub_calls: u32,
    pub yfinance_calls: u32,
    pub rate_limited: u32,
}

impl CallBudget {
    pub fn snapshot(&self) -> CallBudgetSnapshot {
        CallBudgetSnapshot {
            wikidata_calls: self.wikidata.load(Ordering::Relaxed),
            finnhub_calls: self.finnhub.load(Ordering::Relaxed),
            yfinance_calls: self.yfinance.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.wikidata.store(0, Ordering::Relaxed);
        self.finnhub.store(0, Ordering::Relaxed);
        self.yfinance.store(0, Ordering::Relaxed);
        self.rate_limited.store(0, Ordering::Relaxed);
    }

    fn record_rate_limit(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }
}

/// Classification metadata for one security, as far as a provider knows it.
#[derive(Debug, Clone)]
pub struct AssetProfile {
    pub name: String,
    pub sector: Option<String>,
    pub geography: Option<String>,
}

// =============================================================================
// External resolver
// =============================================================================

pub struct ExternalResolver {
    client: reqwest::Client,
    enabled: bool,
    finnhub_key: Option<String>,
    proxy_url: Option<String>,
    proxy_key: Option<String>,
    wikidata_base: String,
    finnhub_base: String,
    yfinance_base: String,
    pub budget: CallBudget,
    /// One in-flight Wikidata request per resolver instance.
    wikidata_lock: Mutex<()>,
}

impl ExternalResolver {
    pub fn from_env() -> Self {
        let client = reqwest::Client::builder()
            .user_agent("PortfolioPrism/1.2 (portfolio analytics engine)")
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            client,
            enabled: true,
            finnhub_key: std::env::var("FINNHUB_API_KEY").ok().filter(|k| !k.is_empty()),
            proxy_url: std::env::var("PROXY_URL").ok().filter(|u| !u.is_empty()),
            proxy_key: std::env::var("PROXY_API_KEY").ok().filter(|k| !k.is_empty()),
            wikidata_base: "https://www.wikidata.org/w/api.php".to_string(),
            finnhub_base: "https://finnhub.io/api/v1".to_string(),
            yfinance_base: "https://query2.finance.yahoo.com".to_string(),
            budget: CallBudget::default(),
            wikidata_lock: Mutex::new(()),
        }
    }

    /// A resolver that never touches the network; used in sealed mode and
    /// by tests.
    pub fn disabled() -> Self {
        let mut resolver = Self::from_env();
        resolver.enabled = false;
        resolver
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    // -------------------------------------------------------------------------
    // Wikidata
    // -------------------------------------------------------------------------

    /// Search entities for the name variants and extract the ISIN property
    /// (P946) from the first matching entity.
    pub async fn resolve_wikidata(&self, name: &str, ticker: &str) -> Result<Option<String>, AdapterError> {
        if !self.enabled || name.trim().is_empty() {
            return Ok(None);
        }
        let _guard = self.wikidata_lock.lock().await;

        for variant in name_variants(name, ticker) {
            self.budget.wikidata.fetch_add(1, Ordering::Relaxed);

            let search: serde_json::Value = self
                .get_json(&format!(
                    "{}?action=wbsearchentities&search={}&language=en&format=json&limit=3",
                    self.wikidata_base,
                    urlencode(&variant)
                ))
                .await?;

            let Some(results) = search.get("search").and_then(|v| v.as_array()) else {
                continue;
            };

            for result in results {
                let Some(entity_id) = result.get("id").and_then(|v| v.as_str()) else {
                    continue;
                };

                tokio::time::sleep(WIKIDATA_PAUSE).await;
                self.budget.wikidata.fetch_add(1, Ordering::Relaxed);

                let entity: serde_json::Value = self
                    .get_json(&format!(
                        "{}?action=wbgetentities&ids={entity_id}&props=claims&format=json",
                        self.wikidata_base
                    ))
                    .await?;

                let isin = entity
                    .pointer(&format!(
                        "/entities/{entity_id}/claims/P946/0/mainsnak/datavalue/value"
                    ))
                    .and_then(|v| v.as_str())
                    .and_then(normalize_isin);

                if let Some(isin) = isin {
                    debug!(name, isin, "wikidata resolved");
                    return Ok(Some(isin));
                }
            }

            tokio::time::sleep(WIKIDATA_PAUSE).await;
        }

        Ok(None)
    }

    // -------------------------------------------------------------------------
    // Finnhub
    // -------------------------------------------------------------------------

    /// One company-profile call with the primary ticker; no variant fan-out.
    pub async fn resolve_finnhub(&self, ticker: &str) -> Result<Option<String>, AdapterError> {
        if !self.enabled || ticker.trim().is_empty() {
            return Ok(None);
        }
        self.budget.finnhub.fetch_add(1, Ordering::Relaxed);

        let profile = if let (Some(proxy_url), Some(proxy_key)) = (&self.proxy_url, &self.proxy_key) {
            // Proxy transport: same profile endpoint behind the shared worker.
            let url = format!("{proxy_url}/finnhub/profile?symbol={}", urlencode(ticker));
            self.get_json_with_header(&url, "X-Proxy-Api-Key", proxy_key).await?
        } else if let Some(key) = &self.finnhub_key {
            let url = format!(
                "{}/stock/profile2?symbol={}",
                self.finnhub_base,
                urlencode(ticker)
            );
            self.get_json_with_header(&url, "X-Finnhub-Token", key).await?
        } else {
            debug!("finnhub skipped: no API key and no proxy configured");
            return Ok(None);
        };

        tokio::time::sleep(FINNHUB_PAUSE).await;

        let isin = profile
            .get("isin")
            .and_then(|v| v.as_str())
            .and_then(normalize_isin);
        if let Some(ref isin) = isin {
            debug!(ticker, isin, "finnhub resolved");
        }
        Ok(isin)
    }

    // -------------------------------------------------------------------------
    // YFinance
    // -------------------------------------------------------------------------

    /// At most two ticker variants: as supplied, and stripped of its
    /// exchange suffix.
    pub async fn resolve_yfinance(&self, ticker: &str) -> Result<Option<String>, AdapterError> {
        if !self.enabled || ticker.trim().is_empty() {
            return Ok(None);
        }

        let mut variants = vec![ticker.to_string()];
        if let Some(base) = ticker.split('.').next() {
            if base != ticker && !base.is_empty() {
                variants.push(base.to_string());
            }
        }

        for variant in variants.into_iter().take(2) {
            self.budget.yfinance.fetch_add(1, Ordering::Relaxed);

            let url = format!(
                "{}/v1/finance/search?q={}&quotesCount=1&newsCount=0",
                self.yfinance_base,
                urlencode(&variant)
            );
            let body = self.get_json(&url).await?;
            tokio::time::sleep(YFINANCE_PAUSE).await;

            let isin = body
                .pointer("/quotes/0/isin")
                .and_then(|v| v.as_str())
                .and_then(normalize_isin);
            if let Some(isin) = isin {
                debug!(ticker = variant, isin, "yfinance resolved");
                return Ok(Some(isin));
            }
        }

        Ok(None)
    }

    // -------------------------------------------------------------------------
    // Metadata profiles (enrichment fallback path)
    // -------------------------------------------------------------------------

    /// Company profile by ISIN via Finnhub: name, sector, country.
    pub async fn fetch_profile_finnhub(
        &self,
        isin: &str,
    ) -> Result<Option<AssetProfile>, AdapterError> {
        if !self.enabled {
            return Ok(None);
        }
        self.budget.finnhub.fetch_add(1, Ordering::Relaxed);

        let profile = if let (Some(proxy_url), Some(proxy_key)) = (&self.proxy_url, &self.proxy_key)
        {
            let url = format!("{proxy_url}/finnhub/profile?isin={}", urlencode(isin));
            self.get_json_with_header(&url, "X-Proxy-Api-Key", proxy_key).await?
        } else if let Some(key) = &self.finnhub_key {
            let url = format!("{}/stock/profile2?isin={}", self.finnhub_base, urlencode(isin));
            self.get_json_with_header(&url, "X-Finnhub-Token", key).await?
        } else {
            return Ok(None);
        };

        tokio::time::sleep(FINNHUB_PAUSE).await;

        let name = profile.get("name").and_then(|v| v.as_str());
        let Some(name) = name.filter(|n| !n.is_empty()) else {
            return Ok(None);
        };
        Ok(Some(AssetProfile {
            name: name.to_string(),
            sector: profile
                .get("finnhubIndustry")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            geography: profile
                .get("country")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        }))
    }

    /// Best-effort profile by ISIN via the Yahoo search endpoint; usually
    /// only the name comes back.
    pub async fn fetch_profile_yfinance(
        &self,
        isin: &str,
    ) -> Result<Option<AssetProfile>, AdapterError> {
        if !self.enabled {
            return Ok(None);
        }
        self.budget.yfinance.fetch_add(1, Ordering::Relaxed);

        let url = format!(
            "{}/v1/finance/search?q={}&quotesCount=1&newsCount=0",
            self.yfinance_base,
            urlencode(isin)
        );
        let body = self.get_json(&url).await?;
        tokio::time::sleep(YFINANCE_PAUSE).await;

        let name = body
            .pointer("/quotes/0/longname")
            .or_else(|| body.pointer("/quotes/0/shortname"))
            .and_then(|v| v.as_str());
        let Some(name) = name.filter(|n| !n.is_empty()) else {
            return Ok(None);
        };
        Ok(Some(AssetProfile {
            name: name.to_string(),
            sector: body
                .pointer("/quotes/0/sector")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            geography: None,
        }))
    }

    // -------------------------------------------------------------------------
    // Transport helpers
    // -------------------------------------------------------------------------

    async fn get_json(&self, url: &str) -> Result<serde_json::Value, AdapterError> {
        let resp = self.client.get(url).send().await.map_err(request_error)?;
        self.check_status(resp).await
    }

    async fn get_json_with_header(
        &self,
        url: &str,
        header: &str,
        value: &str,
    ) -> Result<serde_json::Value, AdapterError> {
        let resp = self
            .client
            .get(url)
            .header(header, value)
            .send()
            .await
            .map_err(request_error)?;
        self.check_status(resp).await
    }

    async fn check_status(&self, resp: reqwest::Response) -> Result<serde_json::Value, AdapterError> {
        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            self.budget.record_rate_limit();
            warn!("external API rate limit hit");
            return Err(AdapterError::RateLimited);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let preview: String = body.chars().take(200).collect();
            return Err(AdapterError::Http(format!("{status}: {preview}")));
        }
        resp.json()
            .await
            .map_err(|e| AdapterError::Parse(e.to_string()))
    }
}

fn request_error(e: reqwest::Error) -> AdapterError {
    if e.is_timeout() {
        AdapterError::Timeout
    } else {
        AdapterError::Http(e.to_string())
    }
}

/// Name variants for entity search: the full provider name and a version
/// stripped of corporate suffixes. The ticker is a last resort.
fn name_variants(name: &str, ticker: &str) -> Vec<String> {
    let name = name.trim();
    let mut variants = vec![name.to_string()];

    const SUFFIXES: &[&str] = &[
        " INC", " INC.", " CORP", " CORP.", " LTD", " LTD.", " PLC", " SE", " AG", " SA", " NV",
        " CO", " CLASS A", " CLASS B", " CLASS C",
    ];
    let upper = name.to_uppercase();
    for suffix in SUFFIXES {
        if upper.ends_with(suffix) {
            let stripped = name[..name.len() - suffix.len()].trim().to_string();
            if !stripped.is_empty() && !variants.contains(&stripped) {
                variants.push(stripped);
            }
            break;
        }
    }

    if variants.len() < 2 && !ticker.trim().is_empty() {
        variants.push(ticker.trim().to_string());
    }
    variants
}

fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            b' ' => out.push_str("%20"),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_variants_strip_corporate_suffixes() {
        let variants = name_variants("Apple Inc.", "AAPL");
        assert_eq!(variants[0], "Apple Inc.");
        assert_eq!(variants[1], "Apple");

        let variants = name_variants("Siemens AG", "SIE.DE");
        assert_eq!(variants, vec!["Siemens AG".to_string(), "Siemens".to_string()]);
    }

    #[test]
    fn name_variants_fall_back_to_ticker() {
        let variants = name_variants("Odd Holdings Name", "ODD");
        assert_eq!(variants, vec!["Odd Holdings Name".to_string(), "ODD".to_string()]);
    }

    #[test]
    fn urlencode_escapes_reserved_characters() {
        assert_eq!(urlencode("S&P 500"), "S%26P%20500");
        assert_eq!(urlencode("AAPL"), "AAPL");
        assert_eq!(urlencode("a+b/c"), "a%2Bb%2Fc");
    }

    #[tokio::test]
    async fn disabled_resolver_never_calls_out() {
        let resolver = ExternalResolver::disabled();
        assert!(resolver.resolve_wikidata("Apple Inc.", "AAPL").await.unwrap().is_none());
        assert!(resolver.resolve_finnhub("AAPL").await.unwrap().is_none());
        assert!(resolver.resolve_yfinance("AAPL").await.unwrap().is_none());

        let snapshot = resolver.budget.snapshot();
        assert_eq!(snapshot.wikidata_calls, 0);
        assert_eq!(snapshot.finnhub_calls, 0);
        assert_eq!(snapshot.yfinance_calls, 0);
    }

    #[test]
    fn budget_snapshot_and_reset() {
        let budget = CallBudget::default();
        budget.wikidata.store(3, Ordering::Relaxed);
        budget.record_rate_limit();
        let snap = budget.snapshot();
        assert_eq!(snap.wikidata_calls, 3);
        assert_eq!(snap.rate_limited, 1);

        budget.reset();
        assert_eq!(budget.snapshot().wikidata_calls, 0);
    }
}
