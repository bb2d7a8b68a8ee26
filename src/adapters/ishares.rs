// =============================================================================
// iShares adapter — direct CSV download from a constructed product URL
// =============================================================================
//
// The provider serves a full holdings CSV at a predictable URL keyed by a
// numeric product id. Per-ISIN product ids live in a small JSON registry
// (config/ishares_config.json); missing entries trigger an auto-discovery
// pass against the site's search endpoint.
//
// The downloaded CSV is German-localised: two preamble lines above the
// header, comma decimal separators, and exchange names that feed the
// Yahoo-ticker suffix mapping.
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::adapters::{classify_status, AdapterError, AdapterResult, HoldingsAdapter};
use crate::adapters::tickers::{to_yahoo_ticker, yahoo_suffix};
use crate::holdings::normalizer::{normalize_table, read_csv_str};

const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductConfig {
    pub product_id: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_user_type")]
    pub user_type: String,
}

fn default_region() -> String {
    "de".to_string()
}

fn default_user_type() -> String {
    "privatanleger".to_string()
}

pub struct ISharesAdapter {
    base_url: String,
    config_path: PathBuf,
    config: RwLock<HashMap<String, ProductConfig>>,
    client: reqwest::Client,
    /// One request at a time against the provider host.
    host_lock: Mutex<()>,
}

impl ISharesAdapter {
    pub fn new(config_path: PathBuf) -> Self {
        Self::with_base_url("https://www.ishares.com".to_string(), config_path)
    }

    pub fn with_base_url(base_url: String, config_path: PathBuf) -> Self {
        let config = load_config(&config_path);
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("failed to build reqwest client");

        debug!(entries = config.len(), "iShares adapter initialised");

        Self {
            base_url,
            config_path,
            config: RwLock::new(config),
            client,
            host_lock: Mutex::new(()),
        }
    }

    fn save_config(&self) {
        let snapshot = self.config.read().clone();
        match serde_json::to_string_pretty(&snapshot) {
            Ok(json) => {
                if let Some(parent) = self.config_path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                if std::fs::write(&self.config_path, json).is_err() {
                    warn!("failed to save iShares product config");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialise iShares product config"),
        }
    }

    /// Scrape the search endpoint for the numeric product id
    /// (a `/produkte/{id}/` path segment in the result page).
    async fn discover_product_id(&self, isin: &str) -> Result<Option<String>, AdapterError> {
        let url = format!(
            "{}/de/privatanleger/de/suche/search-results?searchTerm={isin}",
            self.base_url
        );
        info!(isin, "attempting product id auto-discovery");

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(request_error)?;

        let status = resp.status();
        let body = resp.text().await.map_err(request_error)?;
        if !status.is_success() {
            let preview: String = body.chars().take(200).collect();
            return Err(classify_status(status, &preview));
        }

        Ok(extract_product_id(&body))
    }

    fn url_for(&self, cfg: &ProductConfig, isin: &str) -> String {
        format!(
            "{base}/{region}/{user_type}/{region}/produkte/{id}/fund/1478358465952.ajax?fileType=csv&fileName={isin}_holdings&dataType=fund",
            base = self.base_url,
            region = cfg.region,
            user_type = cfg.user_type,
            id = cfg.product_id,
        )
    }

    /// Parse the downloaded CSV: skip the preamble, normalize, and map
    /// provider tickers to Yahoo form while preserving the raw ticker.
    fn parse_csv(&self, content: &str) -> Result<Vec<crate::contracts::schemas::Holding>, AdapterError> {
        let body = skip_preamble(content);
        let table = read_csv_str(body).map_err(|e| AdapterError::Parse(e.to_string()))?;

        // Exchange/location columns drive the suffix before normalization
        // flattens the table into canonical holdings.
        let exchange_col = table.headers.iter().position(|h| h == "börse" || h == "exchange");
        let location_col = table.headers.iter().position(|h| h == "standort" || h == "location");
        let ticker_col = table
            .headers
            .iter()
            .position(|h| h == "emittententicker" || h == "ticker");

        let mut holdings = normalize_table(&table, "ishares");

        if let (Some(t_col), Some(e_col)) = (ticker_col, exchange_col) {
            // Rebuild a raw-ticker -> (exchange, location) index from the raw
            // rows; normalization may have dropped footer rows, so match by
            // ticker value rather than position.
            let mut venue: HashMap<String, (String, String)> = HashMap::new();
            for row in &table.rows {
                let ticker = row.get(t_col).cloned().unwrap_or_default();
                let exchange = row.get(e_col).cloned().unwrap_or_default();
                let location = location_col
                    .and_then(|i| row.get(i))
                    .cloned()
                    .unwrap_or_default();
                venue.entry(ticker).or_insert((exchange, location));
            }

            for holding in &mut holdings {
                if let Some((exchange, location)) = venue.get(&holding.raw_ticker) {
                    let suffix = yahoo_suffix(exchange, location);
                    holding.ticker = to_yahoo_ticker(&holding.raw_ticker, suffix);
                }
            }
        }

        Ok(holdings)
    }
}

#[async_trait]
impl HoldingsAdapter for ISharesAdapter {
    fn provider(&self) -> &str {
        "ishares"
    }

    /// iShares funds are Irish-domiciled UCITS; the IE prefix plus a
    /// configured or discoverable product id is the claim.
    fn handles(&self, isin: &str) -> bool {
        self.config.read().contains_key(isin) || isin.starts_with("IE")
    }

    fn download_url(&self, isin: &str) -> Option<String> {
        let config = self.config.read();
        let cfg = config.get(isin)?;
        Some(format!(
            "{}/{}/{}/{}/produkte/{}",
            self.base_url, cfg.region, cfg.user_type, cfg.region, cfg.product_id
        ))
    }

    async fn fetch_holdings(&self, isin: &str) -> AdapterResult {
        let _host = self.host_lock.lock().await;

        let existing_cfg = self.config.read().get(isin).cloned();
        let cfg = match existing_cfg {
            Some(cfg) => cfg,
            None => {
                let Some(product_id) = self.discover_product_id(isin).await? else {
                    warn!(isin, "could not discover product id");
                    return Ok(None);
                };
                let cfg = ProductConfig {
                    product_id,
                    region: default_region(),
                    user_type: default_user_type(),
                };
                self.config.write().insert(isin.to_string(), cfg.clone());
                self.save_config();
                cfg
            }
        };

        let url = self.url_for(&cfg, isin);
        debug!(isin, url, "downloading holdings CSV");

        let resp = self.client.get(&url).send().await.map_err(request_error)?;
        let status = resp.status();
        let body = resp.text().await.map_err(request_error)?;
        if !status.is_success() {
            let preview: String = body.chars().take(200).collect();
            return Err(classify_status(status, &preview));
        }

        let holdings = self.parse_csv(&body)?;
        if holdings.is_empty() {
            return Ok(None);
        }
        info!(isin, count = holdings.len(), "holdings downloaded");
        Ok(Some(holdings))
    }
}

fn request_error(e: reqwest::Error) -> AdapterError {
    if e.is_timeout() {
        AdapterError::Timeout
    } else {
        AdapterError::Http(e.to_string())
    }
}

/// Find the first `/produkte/{digits}/` segment in a search results page.
fn extract_product_id(html: &str) -> Option<String> {
    let marker = "/produkte/";
    let mut rest = html;
    while let Some(pos) = rest.find(marker) {
        let after = &rest[pos + marker.len()..];
        let digits: String = after.chars().take_while(|c| c.is_ascii_digit()).collect();
        if !digits.is_empty() && after[digits.len()..].starts_with('/') {
            return Some(digits);
        }
        rest = &rest[pos + marker.len()..];
    }
    None
}

/// The download carries two metadata lines above the real header.
fn skip_preamble(content: &str) -> &str {
    let mut offset = 0;
    let mut lines = 0;
    for (i, b) in content.bytes().enumerate() {
        if b == b'\n' {
            lines += 1;
            if lines == 2 {
                offset = i + 1;
                break;
            }
        }
    }
    // A short response without a preamble is handed over unchanged.
    if lines < 2 {
        content
    } else {
        &content[offset..]
    }
}

fn load_config(path: &std::path::Path) -> HashMap<String, ProductConfig> {
    if !path.exists() {
        return HashMap::new();
    }
    match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "failed to parse iShares config");
            HashMap::new()
        }),
        Err(_) => HashMap::new(),
    }
}
