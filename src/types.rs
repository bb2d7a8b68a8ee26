// =============================================================================
// Shared types used across the Prism analytics engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Asset classification for a loaded position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssetClass {
    Stock,
    #[serde(rename = "ETF", alias = "Etf")]
    Etf,
    Bond,
    Crypto,
    Cash,
    Fund,
    Unknown,
}

impl Default for AssetClass {
    fn default() -> Self {
        Self::Unknown
    }
}

impl std::fmt::Display for AssetClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stock => write!(f, "Stock"),
            Self::Etf => write!(f, "ETF"),
            Self::Bond => write!(f, "Bond"),
            Self::Crypto => write!(f, "Crypto"),
            Self::Cash => write!(f, "Cash"),
            Self::Fund => write!(f, "Fund"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

impl AssetClass {
    /// Parse a provider-supplied string. Anything unrecognised maps to
    /// `Unknown` so that one bad row never aborts a load.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_uppercase().as_str() {
            "STOCK" | "EQUITY" => Self::Stock,
            "ETF" => Self::Etf,
            "BOND" => Self::Bond,
            "CRYPTO" => Self::Crypto,
            "CASH" => Self::Cash,
            "FUND" => Self::Fund,
            _ => Self::Unknown,
        }
    }
}

/// Classification of a single constituent inside an ETF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HoldingClass {
    Equity,
    Cash,
    Derivative,
}

impl Default for HoldingClass {
    fn default() -> Self {
        Self::Equity
    }
}

impl std::fmt::Display for HoldingClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Equity => write!(f, "Equity"),
            Self::Cash => write!(f, "Cash"),
            Self::Derivative => write!(f, "Derivative"),
        }
    }
}

/// Outcome of an ISIN resolution attempt for a holding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionStatus {
    Resolved,
    Unresolved,
    Skipped,
}

impl Default for ResolutionStatus {
    fn default() -> Self {
        Self::Unresolved
    }
}

impl std::fmt::Display for ResolutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Resolved => write!(f, "resolved"),
            Self::Unresolved => write!(f, "unresolved"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Pipeline phase names as surfaced to the UI over SSE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelinePhase {
    Sync,
    Loading,
    Decomposition,
    Enrichment,
    Aggregation,
    Reporting,
    Complete,
}

impl std::fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sync => write!(f, "sync"),
            Self::Loading => write!(f, "loading"),
            Self::Decomposition => write!(f, "decomposition"),
            Self::Enrichment => write!(f, "enrichment"),
            Self::Aggregation => write!(f, "aggregation"),
            Self::Reporting => write!(f, "reporting"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asset_class_parse_is_case_insensitive() {
        assert_eq!(AssetClass::parse("etf"), AssetClass::Etf);
        assert_eq!(AssetClass::parse("ETF"), AssetClass::Etf);
        assert_eq!(AssetClass::parse("  stock "), AssetClass::Stock);
        assert_eq!(AssetClass::parse("equity"), AssetClass::Stock);
        assert_eq!(AssetClass::parse("warrant"), AssetClass::Unknown);
        assert_eq!(AssetClass::parse(""), AssetClass::Unknown);
    }

    #[test]
    fn resolution_status_serializes_lowercase() {
        let json = serde_json::to_string(&ResolutionStatus::Resolved).unwrap();
        assert_eq!(json, "\"resolved\"");
        let back: ResolutionStatus = serde_json::from_str("\"skipped\"").unwrap();
        assert_eq!(back, ResolutionStatus::Skipped);
    }

    #[test]
    fn phase_display_matches_sse_contract() {
        assert_eq!(PipelinePhase::Decomposition.to_string(), "decomposition");
        assert_eq!(PipelinePhase::Complete.to_string(), "complete");
    }
}
