// =============================================================================
// Phase contracts — the exact data shapes at every pipeline boundary
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::isin::{group_id, is_valid_isin};
use crate::types::{AssetClass, HoldingClass, ResolutionStatus};

// =============================================================================
// Loaded positions
// =============================================================================

/// A single position as loaded from the position store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub isin: String,
    pub name: String,
    pub quantity: f64,
    #[serde(default)]
    pub unit_price: Option<f64>,
    #[serde(default)]
    pub cost_basis: Option<f64>,
    /// Tolerant parsing: providers ship free-form class strings and one bad
    /// value must not reject the whole position store.
    #[serde(default, deserialize_with = "de_asset_class")]
    pub asset_class: AssetClass,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub symbol: Option<String>,
}

fn default_currency() -> String {
    "EUR".to_string()
}

fn de_asset_class<'de, D>(deserializer: D) -> Result<AssetClass, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.map(|s| AssetClass::parse(&s)).unwrap_or_default())
}

impl Position {
    /// Market value derives from quantity and unit price, falling back to
    /// cost basis when no live price is available.
    pub fn market_value(&self) -> f64 {
        let price = self.unit_price.or(self.cost_basis).unwrap_or(0.0);
        self.quantity * price
    }
}

/// Container for Load phase results: positions split by asset class.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadOutput {
    pub direct_positions: Vec<Position>,
    pub etf_positions: Vec<Position>,
}

impl LoadOutput {
    pub fn total_positions(&self) -> usize {
        self.direct_positions.len() + self.etf_positions.len()
    }

    /// True portfolio value computed top-down from loaded positions. This is
    /// the denominator for every portfolio percentage so that weight-sum
    /// noise inside an ETF never leaks into portfolio-wide stats.
    pub fn total_value(&self) -> f64 {
        self.direct_positions
            .iter()
            .chain(self.etf_positions.iter())
            .map(Position::market_value)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.direct_positions.is_empty() && self.etf_positions.is_empty()
    }
}

// =============================================================================
// Holdings & decompositions
// =============================================================================

/// A single constituent inside an ETF, with resolution provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Holding {
    #[serde(default)]
    pub ticker: String,
    /// Ticker exactly as the provider shipped it, before suffix mapping.
    #[serde(default)]
    pub raw_ticker: String,
    pub name: String,
    #[serde(default)]
    pub weight_percentage: f64,
    #[serde(default)]
    pub isin: Option<String>,
    #[serde(default)]
    pub asset_class: HoldingClass,
    #[serde(default)]
    pub resolution_status: ResolutionStatus,
    #[serde(default)]
    pub resolution_source: Option<String>,
    #[serde(default)]
    pub resolution_confidence: f64,
    #[serde(default)]
    pub resolution_detail: Option<String>,
    #[serde(default = "unknown_string")]
    pub sector: String,
    #[serde(default = "unknown_string")]
    pub geography: String,
    #[serde(default)]
    pub enrichment_source: Option<String>,
}

fn unknown_string() -> String {
    "Unknown".to_string()
}

impl Holding {
    pub fn new(ticker: impl Into<String>, name: impl Into<String>, weight: f64) -> Self {
        let ticker = ticker.into();
        Self {
            raw_ticker: ticker.clone(),
            ticker,
            name: name.into(),
            weight_percentage: weight,
            isin: None,
            asset_class: HoldingClass::Equity,
            resolution_status: ResolutionStatus::Unresolved,
            resolution_source: None,
            resolution_confidence: 0.0,
            resolution_detail: None,
            sector: unknown_string(),
            geography: unknown_string(),
            enrichment_source: None,
        }
    }

    pub fn has_valid_isin(&self) -> bool {
        self.isin.as_deref().is_some_and(is_valid_isin)
    }

    /// Aggregation group id: the ISIN when valid, else the deterministic
    /// `UNRESOLVED:` key.
    pub fn group_id(&self) -> String {
        group_id(self.isin.as_deref(), &self.ticker, &self.name)
    }
}

/// Decomposition result for a single ETF.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtfDecomposition {
    pub etf_isin: String,
    pub etf_name: String,
    pub etf_value: f64,
    pub source: String,
    pub holdings: Vec<Holding>,
}

impl EtfDecomposition {
    pub fn weight_sum(&self) -> f64 {
        self.holdings.iter().map(|h| h.weight_percentage).sum()
    }

    pub fn holdings_count(&self) -> usize {
        self.holdings.len()
    }

    pub fn resolved_count(&self) -> usize {
        self.holdings
            .iter()
            .filter(|h| h.resolution_status == ResolutionStatus::Resolved)
            .count()
    }

    pub fn unresolved_count(&self) -> usize {
        self.holdings.len() - self.resolved_count()
    }
}

/// Container for Decompose phase results.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecomposeOutput {
    pub decompositions: Vec<EtfDecomposition>,
    pub etfs_failed: usize,
}

impl DecomposeOutput {
    pub fn total_holdings(&self) -> usize {
        self.decompositions.iter().map(|d| d.holdings.len()).sum()
    }
}

// =============================================================================
// Aggregated exposures
// =============================================================================

/// One row of the true-exposure report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedExposure {
    /// ISIN, canonical cash id, or an `UNRESOLVED:` group key.
    pub isin: String,
    pub name: String,
    pub sector: String,
    pub geography: String,
    pub asset_class: HoldingClass,
    pub direct: f64,
    pub indirect: f64,
    pub total_exposure: f64,
    pub portfolio_percentage: f64,
    pub resolution_confidence: f64,
    #[serde(default)]
    pub resolution_source: Option<String>,
}

/// Container for Aggregate phase results.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateOutput {
    pub exposures: Vec<AggregatedExposure>,
    pub total_portfolio_value: f64,
}

impl AggregateOutput {
    pub fn unique_securities(&self) -> usize {
        self.exposures.len()
    }

    pub fn unresolved_securities(&self) -> usize {
        self.exposures
            .iter()
            .filter(|e| e.isin.starts_with("UNRESOLVED:"))
            .count()
    }

    pub fn calculated_total(&self) -> f64 {
        self.exposures.iter().map(|e| e.total_exposure).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn market_value_prefers_unit_price() {
        let pos = Position {
            isin: "US0378331005".into(),
            name: "Apple Inc.".into(),
            quantity: 10.0,
            unit_price: Some(150.0),
            cost_basis: Some(120.0),
            asset_class: AssetClass::Stock,
            currency: "EUR".into(),
            symbol: None,
        };
        assert_eq!(pos.market_value(), 1500.0);
    }

    #[test]
    fn market_value_falls_back_to_cost_basis() {
        let pos = Position {
            isin: "US0378331005".into(),
            name: "Apple Inc.".into(),
            quantity: 10.0,
            unit_price: None,
            cost_basis: Some(120.0),
            asset_class: AssetClass::Stock,
            currency: "EUR".into(),
            symbol: None,
        };
        assert_eq!(pos.market_value(), 1200.0);
    }

    #[test]
    fn position_asset_class_parses_free_form_strings() {
        let json = r#"{"isin":"US0378331005","name":"Apple","quantity":1.0,"asset_class":"equity"}"#;
        let pos: Position = serde_json::from_str(json).unwrap();
        assert_eq!(pos.asset_class, AssetClass::Stock);

        let json = r#"{"isin":"IE00B4L5Y983","name":"Fund","quantity":1.0,"asset_class":"etf"}"#;
        let pos: Position = serde_json::from_str(json).unwrap();
        assert_eq!(pos.asset_class, AssetClass::Etf);

        // Unrecognised classes degrade to Unknown instead of failing the load.
        let json = r#"{"isin":"US0378331005","name":"Apple","quantity":1.0,"asset_class":"warrant"}"#;
        let pos: Position = serde_json::from_str(json).unwrap();
        assert_eq!(pos.asset_class, AssetClass::Unknown);
    }

    #[test]
    fn decomposition_stats_derive_from_holdings() {
        let mut resolved = Holding::new("AAPL", "Apple Inc.", 10.0);
        resolved.isin = Some("US0378331005".into());
        resolved.resolution_status = ResolutionStatus::Resolved;

        let decomp = EtfDecomposition {
            etf_isin: "IE00B4L5Y983".into(),
            etf_name: "Core World".into(),
            etf_value: 1000.0,
            source: "local_cache".into(),
            holdings: vec![resolved, Holding::new("XYZ", "XYZ Corp", 5.0)],
        };

        assert_eq!(decomp.holdings_count(), 2);
        assert_eq!(decomp.resolved_count(), 1);
        assert_eq!(decomp.unresolved_count(), 1);
        assert!((decomp.weight_sum() - 15.0).abs() < 1e-9);
    }

    #[test]
    fn load_output_total_value_spans_both_buckets() {
        let mk = |isin: &str, qty: f64, price: f64, class: AssetClass| Position {
            isin: isin.into(),
            name: "x".into(),
            quantity: qty,
            unit_price: Some(price),
            cost_basis: None,
            asset_class: class,
            currency: "EUR".into(),
            symbol: None,
        };
        let output = LoadOutput {
            direct_positions: vec![mk("US0378331005", 10.0, 150.0, AssetClass::Stock)],
            etf_positions: vec![mk("IE00B4L5Y983", 2.0, 500.0, AssetClass::Etf)],
        };
        assert_eq!(output.total_value(), 2500.0);
        assert_eq!(output.total_positions(), 2);
    }
}
