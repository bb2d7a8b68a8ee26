// =============================================================================
// Hive client — community asset-identity database over PostgREST RPC
// =============================================================================
//
// The Hive is a remote key-value service holding assets, exchange listings,
// name aliases, and shared ETF holdings. Reads are best-effort: every
// failure degrades to a local-only run instead of failing the pipeline.
// The anon key is never logged.
// =============================================================================

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::contracts::schemas::Holding;
use crate::isin::normalize_isin;

/// A single asset record in the Hive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetEntry {
    pub isin: String,
    pub name: String,
    #[serde(default = "default_asset_class")]
    pub asset_class: String,
    #[serde(default)]
    pub sector: Option<String>,
    #[serde(default)]
    pub geography: Option<String>,
    #[serde(default = "default_currency")]
    pub base_currency: String,
}

fn default_asset_class() -> String {
    "Stock".to_string()
}

fn default_currency() -> String {
    "EUR".to_string()
}

/// Full identity domain pulled during background sync.
#[derive(Debug, Default, Deserialize)]
pub struct IdentityDomain {
    pub assets: Vec<AssetEntry>,
    pub listings: Vec<ListingRow>,
    pub aliases: Vec<AliasRow>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListingRow {
    pub ticker: String,
    pub isin: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AliasRow {
    pub alias: String,
    pub isin: String,
}

#[derive(Clone)]
pub struct HiveClient {
    base_url: String,
    anon_key: String,
    client: reqwest::Client,
}

impl HiveClient {
    /// Build from `SUPABASE_URL` / `SUPABASE_ANON_KEY`. Both empty is a
    /// valid state: every call then reports not-configured.
    pub fn from_env() -> Self {
        Self::new(
            std::env::var("SUPABASE_URL").unwrap_or_default(),
            std::env::var("SUPABASE_ANON_KEY").unwrap_or_default(),
        )
    }

    pub fn new(base_url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        let base_url = base_url.into();
        let anon_key = anon_key.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&anon_key) {
            default_headers.insert("apikey", val);
        }
        if let Ok(val) = HeaderValue::from_str(&format!("Bearer {anon_key}")) {
            default_headers.insert(reqwest::header::AUTHORIZATION, val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url,
            anon_key,
            client,
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.base_url.is_empty() && !self.anon_key.is_empty()
    }

    /// POST an RPC function with a JSON payload, returning the raw response
    /// value. Non-success statuses become errors carrying the body.
    async fn rpc(&self, function: &str, payload: serde_json::Value) -> Result<serde_json::Value> {
        let url = format!("{}/rest/v1/rpc/{function}", self.base_url);

        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("POST rpc/{function} request failed"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .unwrap_or(serde_json::Value::Null);

        if !status.is_success() {
            anyhow::bail!("Hive rpc/{function} returned {status}: {body}");
        }
        Ok(body)
    }

    // -------------------------------------------------------------------------
    // Resolution
    // -------------------------------------------------------------------------

    /// Resolve a ticker (optionally scoped to an exchange) to an ISIN.
    pub async fn resolve_ticker(&self, ticker: &str, exchange: Option<&str>) -> Result<Option<String>> {
        if !self.is_configured() {
            return Ok(None);
        }

        let body = self
            .rpc(
                "resolve_ticker_rpc",
                serde_json::json!({ "p_ticker": ticker, "p_exchange": exchange }),
            )
            .await?;

        let isin = body
            .as_array()
            .and_then(|rows| rows.first())
            .and_then(|row| row.get("isin"))
            .and_then(|v| v.as_str())
            .and_then(normalize_isin);

        if let Some(ref isin) = isin {
            debug!(ticker, isin, "hive resolved ticker");
        }
        Ok(isin)
    }

    /// Resolve a security name alias to an ISIN.
    pub async fn lookup_alias_isin(&self, alias: &str) -> Result<Option<String>> {
        if !self.is_configured() || alias.trim().is_empty() {
            return Ok(None);
        }

        let body = self
            .rpc(
                "lookup_alias_rpc",
                serde_json::json!({ "p_alias": alias.trim() }),
            )
            .await?;

        let isin = body
            .as_array()
            .and_then(|rows| rows.first())
            .and_then(|row| row.get("isin"))
            .and_then(|v| v.as_str())
            .and_then(normalize_isin);

        if let Some(ref isin) = isin {
            debug!(alias, isin, "hive resolved alias");
        }
        Ok(isin)
    }

    // -------------------------------------------------------------------------
    // Metadata
    // -------------------------------------------------------------------------

    /// Batch lookup of asset metadata by ISIN.
    pub async fn batch_lookup(&self, isins: &[String]) -> Result<HashMap<String, AssetEntry>> {
        if !self.is_configured() || isins.is_empty() {
            return Ok(HashMap::new());
        }

        let body = self
            .rpc("batch_lookup_assets_rpc", serde_json::json!({ "p_isins": isins }))
            .await?;

        let entries: Vec<AssetEntry> = serde_json::from_value(body).unwrap_or_default();
        let found = entries.len();
        let map = entries.into_iter().map(|a| (a.isin.clone(), a)).collect();
        debug!(requested = isins.len(), found, "hive batch lookup complete");
        Ok(map)
    }

    /// Contribute a batch of asset records.
    pub async fn batch_contribute(&self, assets: &[AssetEntry]) -> Result<usize> {
        if !self.is_configured() || assets.is_empty() {
            return Ok(0);
        }

        self.rpc(
            "batch_contribute_assets_rpc",
            serde_json::json!({ "p_assets": assets }),
        )
        .await?;

        info!(count = assets.len(), "contributed assets to hive");
        Ok(assets.len())
    }

    pub async fn contribute_alias(&self, alias: &str, isin: &str) -> Result<()> {
        if !self.is_configured() {
            return Ok(());
        }
        self.rpc(
            "contribute_alias_rpc",
            serde_json::json!({ "p_alias": alias, "p_isin": isin, "p_alias_type": "name" }),
        )
        .await?;
        Ok(())
    }

    pub async fn contribute_listing(&self, ticker: &str, isin: &str) -> Result<()> {
        if !self.is_configured() {
            return Ok(());
        }
        self.rpc(
            "contribute_listing_rpc",
            serde_json::json!({ "p_ticker": ticker, "p_isin": isin }),
        )
        .await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // ETF holdings
    // -------------------------------------------------------------------------

    /// Fetch community-shared holdings for an ETF.
    pub async fn get_etf_holdings(&self, etf_isin: &str) -> Result<Option<Vec<Holding>>> {
        if !self.is_configured() {
            return Ok(None);
        }

        let body = self
            .rpc("get_etf_holdings_rpc", serde_json::json!({ "p_etf_isin": etf_isin }))
            .await?;

        let Some(rows) = body.as_array() else {
            return Ok(None);
        };
        if rows.is_empty() {
            return Ok(None);
        }

        let mut holdings = Vec::with_capacity(rows.len());
        for row in rows {
            let name = row
                .get("holding_name")
                .and_then(|v| v.as_str())
                .unwrap_or("Unknown")
                .to_string();
            let weight = row
                .get("weight_percentage")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            let mut holding = Holding::new("", name, weight);
            holding.isin = row
                .get("holding_isin")
                .and_then(|v| v.as_str())
                .and_then(normalize_isin);
            if let Some(sector) = row.get("sector").and_then(|v| v.as_str()) {
                holding.sector = sector.to_string();
            }
            if let Some(geo) = row.get("geography").and_then(|v| v.as_str()) {
                holding.geography = geo.to_string();
            }
            holdings.push(holding);
        }

        info!(etf_isin, count = holdings.len(), "holdings fetched from hive");
        Ok(Some(holdings))
    }

    /// Share a freshly scraped holdings table with the community.
    pub async fn contribute_etf_holdings(&self, etf_isin: &str, holdings: &[Holding]) -> Result<()> {
        if !self.is_configured() || holdings.is_empty() {
            return Ok(());
        }

        let rows: Vec<serde_json::Value> = holdings
            .iter()
            .map(|h| {
                serde_json::json!({
                    "etf_isin": etf_isin,
                    "holding_isin": h.isin.as_deref().unwrap_or(""),
                    "holding_name": h.name,
                    "weight_percentage": h.weight_percentage,
                    "sector": h.sector,
                    "geography": h.geography,
                })
            })
            .collect();

        self.rpc(
            "batch_contribute_holdings",
            serde_json::json!({ "p_etf_isin": etf_isin, "p_holdings": rows }),
        )
        .await?;

        info!(etf_isin, count = holdings.len(), "contributed holdings to hive");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Identity domain sync
    // -------------------------------------------------------------------------

    /// Pull the full identity domain (assets, listings, aliases) for local
    /// offline operation.
    pub async fn sync_identity_domain(&self) -> Result<IdentityDomain> {
        if !self.is_configured() {
            return Ok(IdentityDomain::default());
        }

        let mut domain = IdentityDomain::default();

        match self.rpc("get_all_assets_rpc", serde_json::json!({})).await {
            Ok(body) => {
                domain.assets = serde_json::from_value(body).unwrap_or_default();
                info!(count = domain.assets.len(), "synced assets from hive");
            }
            Err(e) => warn!(error = %e, "failed to sync assets"),
        }

        match self.rpc("get_all_listings_rpc", serde_json::json!({})).await {
            Ok(body) => {
                domain.listings = serde_json::from_value(body).unwrap_or_default();
                info!(count = domain.listings.len(), "synced listings from hive");
            }
            Err(e) => warn!(error = %e, "failed to sync listings"),
        }

        match self.rpc("get_all_aliases_rpc", serde_json::json!({})).await {
            Ok(body) => {
                domain.aliases = serde_json::from_value(body).unwrap_or_default();
                info!(count = domain.aliases.len(), "synced aliases from hive");
            }
            Err(e) => warn!(error = %e, "failed to sync aliases"),
        }

        Ok(domain)
    }
}

impl std::fmt::Debug for HiveClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HiveClient")
            .field("base_url", &self.base_url)
            .field("anon_key", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_client_reports_itself() {
        let client = HiveClient::new("", "");
        assert!(!client.is_configured());
        let client = HiveClient::new("https://hive.example", "key");
        assert!(client.is_configured());
    }

    #[tokio::test]
    async fn unconfigured_reads_return_empty_without_network() {
        let client = HiveClient::new("", "");
        assert!(client.resolve_ticker("AAPL", None).await.unwrap().is_none());
        assert!(client.lookup_alias_isin("Apple Inc.").await.unwrap().is_none());
        assert!(client.batch_lookup(&["US0378331005".into()]).await.unwrap().is_empty());
        assert!(client.get_etf_holdings("IE00B4L5Y983").await.unwrap().is_none());
        let domain = client.sync_identity_domain().await.unwrap();
        assert!(domain.assets.is_empty());
    }

    #[test]
    fn debug_redacts_anon_key() {
        let client = HiveClient::new("https://hive.example", "secret-key");
        let debug = format!("{client:?}");
        assert!(!debug.contains("secret-key"));
        assert!(debug.contains("<redacted>"));
    }
}
