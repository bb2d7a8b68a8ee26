// =============================================================================
// Loader — reads normalized positions and splits direct vs ETF buckets
// =============================================================================

use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::contracts::quality::{IssueCategory, IssueSeverity, ValidationIssue};
use crate::contracts::schemas::{LoadOutput, Position};
use crate::isin::is_valid_isin;
use crate::types::AssetClass;

/// Source of normalized positions. The Trade Republic sync daemon (an
/// external collaborator) writes the position store this engine reads.
#[async_trait]
pub trait PositionSource: Send + Sync {
    async fn list_positions(&self, portfolio_id: u32) -> anyhow::Result<Vec<Position>>;
}

/// Default source: the JSON position store under `inputs/positions.json`.
pub struct JsonPositionStore {
    path: PathBuf,
}

impl JsonPositionStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl PositionSource for JsonPositionStore {
    async fn list_positions(&self, _portfolio_id: u32) -> anyhow::Result<Vec<Position>> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "position store missing");
            return Ok(Vec::new());
        }
        let content = tokio::fs::read_to_string(&self.path).await?;
        let positions: Vec<Position> = serde_json::from_str(&content)?;
        Ok(positions)
    }
}

/// Tokens that mark a position name as fund-like when the provider shipped
/// no usable asset class.
const ETF_NAME_TOKENS: &[&str] = &[
    "etf", "ishares", "msci", "stoxx", "s&p", "nasdaq", "vanguard", "amundi", "core",
];

fn looks_like_etf(name: &str) -> bool {
    let lower = name.to_lowercase();
    ETF_NAME_TOKENS.iter().any(|token| lower.contains(token))
}

/// Load positions and split them into direct and ETF buckets. Rows with an
/// invalid ISIN are dropped and surfaced as a MEDIUM issue each.
pub async fn load_portfolio(
    source: &dyn PositionSource,
    portfolio_id: u32,
) -> anyhow::Result<(LoadOutput, Vec<ValidationIssue>)> {
    let positions = source.list_positions(portfolio_id).await?;
    let mut output = LoadOutput::default();
    let mut issues = Vec::new();

    for mut position in positions {
        position.isin = position.isin.trim().to_uppercase();
        if !is_valid_isin(&position.isin) {
            warn!(isin = %position.isin, name = %position.name, "dropping position with invalid ISIN");
            issues.push(
                ValidationIssue::new(
                    IssueSeverity::Medium,
                    IssueCategory::Schema,
                    "INVALID_POSITION_ISIN",
                    format!("Position '{}' dropped: malformed ISIN", position.isin),
                    "Fix the ISIN in the position store and sync again",
                    position.isin.clone(),
                    "DATA_LOADING",
                )
                .expected_actual("[A-Z]{2}[A-Z0-9]{9}[0-9]", position.isin.clone()),
            );
            continue;
        }

        // Refine unknown classes by name before bucketing.
        if position.asset_class == AssetClass::Unknown && looks_like_etf(&position.name) {
            position.asset_class = AssetClass::Etf;
        }

        if position.asset_class == AssetClass::Etf {
            output.etf_positions.push(position);
        } else {
            output.direct_positions.push(position);
        }
    }

    info!(
        direct = output.direct_positions.len(),
        etfs = output.etf_positions.len(),
        total_value = output.total_value(),
        "portfolio loaded"
    );
    Ok((output, issues))
}


#[cfg(test)]
mod tests {
    use super::testing::{position, StaticSource};
    use super::*;

    #[tokio::test]
    async fn splits_on_asset_class() {
        let source = StaticSource(vec![
            position("US0378331005", "Apple Inc.", 10.0, 150.0, AssetClass::Stock),
            position("IE00B4L5Y983", "Core World Fund", 2.0, 80.0, AssetClass::Etf),
        ]);
        let (output, issues) = load_portfolio(&source, 1).await.unwrap();
        assert_eq!(output.direct_positions.len(), 1);
        assert_eq!(output.etf_positions.len(), 1);
        assert!(issues.is_empty());
    }

    #[tokio::test]
    async fn name_heuristic_refines_unknown_class() {
        let source = StaticSource(vec![
            position(
                "IE00B4L5Y983",
                "iShares Core MSCI World UCITS",
                2.0,
                80.0,
                AssetClass::Unknown,
            ),
            position(
                "US0378331005",
                "Apple Inc.",
                10.0,
                150.0,
                AssetClass::Unknown,
            ),
        ]);
        let (output, _) = load_portfolio(&source, 1).await.unwrap();
        // Fund-looking name moves to the ETF bucket; plain Unknown stays direct.
        assert_eq!(output.etf_positions.len(), 1);
        assert_eq!(output.direct_positions.len(), 1);
        assert_eq!(output.etf_positions[0].asset_class, AssetClass::Etf);
    }

    #[tokio::test]
    async fn invalid_isin_rows_dropped_with_issue() {
        let source = StaticSource(vec![
            position("BADISIN", "Broken Row", 1.0, 1.0, AssetClass::Stock),
            position("US0378331005", "Apple Inc.", 10.0, 150.0, AssetClass::Stock),
        ]);
        let (output, issues) = load_portfolio(&source, 1).await.unwrap();
        assert_eq!(output.total_positions(), 1);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, "INVALID_POSITION_ISIN");
        assert_eq!(issues[0].severity, IssueSeverity::Medium);
    }

    #[tokio::test]
    async fn lowercase_isin_is_normalized() {
        let source = StaticSource(vec![position(
            "us0378331005",
            "Apple Inc.",
            10.0,
            150.0,
            AssetClass::Stock,
        )]);
        let (output, issues) = load_portfolio(&source, 1).await.unwrap();
        assert!(issues.is_empty());
        assert_eq!(output.direct_positions[0].isin, "US0378331005");
    }

    #[tokio::test]
    async fn missing_store_yields_empty_output() {
        let store = JsonPositionStore::new(std::path::PathBuf::from("/nonexistent/positions.json"));
        let (output, issues) = load_portfolio(&store, 1).await.unwrap();
        assert!(output.is_empty());
        assert!(issues.is_empty());
    }

    #[tokio::test]
    async fn json_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("positions.json");
        let positions = vec![position(
            "US0378331005",
            "Apple Inc.",
            10.0,
            150.0,
            AssetClass::Stock,
        )];
        std::fs::write(&path, serde_json::to_string(&positions).unwrap()).unwrap();

        let store = JsonPositionStore::new(path);
        let (output, _) = load_portfolio(&store, 1).await.unwrap();
        assert_eq!(output.direct_positions.len(), 1);
        assert_eq!(output.total_value(), 1500.0);
    }
}
