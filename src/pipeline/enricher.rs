// =============================================================================
// Enricher — sector / geography / asset-class metadata for every security
// =============================================================================
//
// The unique ISIN set across all decomposed holdings and direct positions
// is collected first, so each security costs exactly one lookup regardless
// of how many ETFs hold it. Tier order: local universe, Hive batch lookup,
// external profile APIs. API-sourced records are contributed back to the
// Hive (best-effort, toggle-gated).
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::contracts::schemas::{EtfDecomposition, Position};
use crate::errors::{ErrorPhase, ErrorType, PipelineError};
use crate::hive::client::AssetEntry;
use crate::hive::contributions::Contribution;
use crate::hive::{ContributionQueue, HiveClient};
use crate::resolve::external::ExternalResolver;
use crate::resolve::universe::AssetUniverse;

/// Metadata for one ISIN, with the tier that produced it.
#[derive(Debug, Clone)]
pub struct AssetMetadata {
    pub name: String,
    pub sector: String,
    pub geography: String,
    pub asset_class: String,
    pub source: String,
}

#[derive(Debug, Default)]
pub struct EnrichmentSummary {
    /// ISIN -> source tier, for the monitor's hit-rate accounting.
    pub sources: HashMap<String, String>,
    /// ISINs contributed to the Hive this run.
    pub contributions: Vec<String>,
}

pub struct Enricher {
    universe: Arc<AssetUniverse>,
    hive: Arc<HiveClient>,
    external: Arc<ExternalResolver>,
    contributions: Arc<ContributionQueue>,
}

impl Enricher {
    pub fn new(
        universe: Arc<AssetUniverse>,
        hive: Arc<HiveClient>,
        external: Arc<ExternalResolver>,
        contributions: Arc<ContributionQueue>,
    ) -> Self {
        Self {
            universe,
            hive,
            external,
            contributions,
        }
    }

    /// Enrich all decomposed holdings in place and return the metadata map
    /// (keyed by ISIN) for direct-position use in aggregation.
    pub async fn enrich(
        &self,
        decompositions: &mut [EtfDecomposition],
        direct_positions: &[Position],
        progress: &(dyn Fn(usize, usize) + Send + Sync),
    ) -> (
        HashMap<String, AssetMetadata>,
        EnrichmentSummary,
        Vec<PipelineError>,
    ) {
        let mut errors = Vec::new();

        // One lookup per unique ISIN across the whole portfolio.
        let isins = self.collect_unique_isins(decompositions, direct_positions);
        info!(unique = isins.len(), "collected unique ISIN set for enrichment");

        let (metadata, summary) = match self.get_metadata_batch(&isins, progress).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "metadata batch failed, holdings keep defaults");
                errors.push(
                    PipelineError::new(
                        ErrorPhase::Enrichment,
                        ErrorType::ApiFailure,
                        "enrichment",
                        e.to_string(),
                    )
                    .with_hint("Check API connectivity or add manual enrichment data"),
                );
                (HashMap::new(), EnrichmentSummary::default())
            }
        };

        // Apply in place. A holding that misses keeps its defaults
        // (Unknown/Unknown/Equity) and the run continues.
        for decomposition in decompositions.iter_mut() {
            for holding in &mut decomposition.holdings {
                let Some(isin) = holding.isin.as_deref() else {
                    continue;
                };
                if let Some(meta) = metadata.get(isin) {
                    if meta.sector != "Unknown" {
                        holding.sector = meta.sector.clone();
                    }
                    if meta.geography != "Unknown" {
                        holding.geography = meta.geography.clone();
                    }
                    holding.enrichment_source = Some(meta.source.clone());
                }
            }
        }

        (metadata, summary, errors)
    }

    fn collect_unique_isins(
        &self,
        decompositions: &[EtfDecomposition],
        direct_positions: &[Position],
    ) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut isins = Vec::new();

        for position in direct_positions {
            if seen.insert(position.isin.clone()) {
                isins.push(position.isin.clone());
            }
        }
        for decomposition in decompositions {
            for holding in &decomposition.holdings {
                if let Some(isin) = holding.isin.as_deref() {
                    if seen.insert(isin.to_string()) {
                        isins.push(isin.to_string());
                    }
                }
            }
        }
        isins
    }

    async fn get_metadata_batch(
        &self,
        isins: &[String],
        progress: &(dyn Fn(usize, usize) + Send + Sync),
    ) -> anyhow::Result<(HashMap<String, AssetMetadata>, EnrichmentSummary)> {
        let mut metadata = HashMap::new();
        let mut summary = EnrichmentSummary::default();
        let total = isins.len();

        // Tier 1: local universe.
        let mut remaining = Vec::new();
        for isin in isins {
            match self.universe.get_by_isin(isin) {
                Some((name, asset_class)) if !name.is_empty() && name != "Unknown" => {
                    metadata.insert(
                        isin.clone(),
                        AssetMetadata {
                            name,
                            sector: "Unknown".to_string(),
                            geography: "Unknown".to_string(),
                            asset_class,
                            source: "local".to_string(),
                        },
                    );
                    summary.sources.insert(isin.clone(), "local".to_string());
                }
                _ => remaining.push(isin.clone()),
            }
        }
        let local_hits = metadata.len();
        if local_hits > 0 {
            debug!(hits = local_hits, total, "local metadata tier");
        }
        progress(metadata.len(), total);

        // Tier 2: Hive batch lookup for the misses.
        let mut missing = Vec::new();
        if !remaining.is_empty() {
            match self.hive.batch_lookup(&remaining).await {
                Ok(hive_results) => {
                    for isin in &remaining {
                        match hive_results.get(isin) {
                            Some(asset) if asset.name != "Unknown" => {
                                metadata.insert(
                                    isin.clone(),
                                    AssetMetadata {
                                        name: asset.name.clone(),
                                        sector: asset
                                            .sector
                                            .clone()
                                            .unwrap_or_else(|| "Unknown".to_string()),
                                        geography: asset
                                            .geography
                                            .clone()
                                            .unwrap_or_else(|| "Unknown".to_string()),
                                        asset_class: asset.asset_class.clone(),
                                        source: "hive".to_string(),
                                    },
                                );
                                summary.sources.insert(isin.clone(), "hive".to_string());
                            }
                            _ => missing.push(isin.clone()),
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "hive metadata lookup failed");
                    missing = remaining;
                }
            }
        }
        progress(metadata.len(), total);

        // Tier 3: external profile APIs, one security at a time.
        if !missing.is_empty() {
            info!(count = missing.len(), "hive metadata misses, falling back to APIs");
        }
        for isin in &missing {
            let profile = match self.external.fetch_profile_finnhub(isin).await {
                Ok(Some(profile)) => Some(("api_finnhub", profile)),
                Ok(None) => match self.external.fetch_profile_yfinance(isin).await {
                    Ok(Some(profile)) => Some(("api_yfinance", profile)),
                    Ok(None) => None,
                    Err(e) => {
                        debug!(isin, error = %e, "yfinance profile failed");
                        None
                    }
                },
                Err(e) => {
                    debug!(isin, error = %e, "finnhub profile failed");
                    None
                }
            };

            if let Some((source, profile)) = profile {
                let meta = AssetMetadata {
                    name: profile.name,
                    sector: profile.sector.unwrap_or_else(|| "Unknown".to_string()),
                    geography: profile.geography.unwrap_or_else(|| "Unknown".to_string()),
                    asset_class: "Stock".to_string(),
                    source: source.to_string(),
                };

                // Newly learned records flow back to the community.
                self.contributions.submit(Contribution::Asset(AssetEntry {
                    isin: isin.clone(),
                    name: meta.name.clone(),
                    asset_class: meta.asset_class.clone(),
                    sector: Some(meta.sector.clone()).filter(|s| s != "Unknown"),
                    geography: Some(meta.geography.clone()).filter(|g| g != "Unknown"),
                    base_currency: "EUR".to_string(),
                }));
                summary.contributions.push(isin.clone());
                summary.sources.insert(isin.clone(), source.to_string());
                metadata.insert(isin.clone(), meta);
            }
            progress(metadata.len(), total);
        }

        Ok((metadata, summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::schemas::Holding;
    use crate::pipeline::loader::testing::position;
    use crate::types::AssetClass;

    fn build_enricher(dir: &tempfile::TempDir) -> Enricher {
        let universe_path = dir.path().join("asset_universe.csv");
        std::fs::write(
            &universe_path,
            "ISIN,TR_Ticker,Yahoo_Ticker,Name,Aliases,Provider,Asset_Class,Source,Added_Date,Last_Verified\n\
             US0378331005,AAPL,AAPL,Apple Inc.,,iShares,Stock,provider,2024-01-01,\n",
        )
        .unwrap();

        Enricher::new(
            Arc::new(AssetUniverse::load(universe_path)),
            Arc::new(HiveClient::new("", "")),
            Arc::new(ExternalResolver::disabled()),
            ContributionQueue::new(false),
        )
    }

    fn decomposition_holding(ticker: &str, isin: Option<&str>) -> Holding {
        let mut holding = Holding::new(ticker, format!("{ticker} Corp"), 10.0);
        holding.isin = isin.map(str::to_string);
        holding
    }

    #[tokio::test]
    async fn unique_isin_set_spans_direct_and_holdings() {
        let dir = tempfile::tempdir().unwrap();
        let enricher = build_enricher(&dir);

        let decompositions = vec![
            EtfDecomposition {
                etf_isin: "IE00B4L5Y983".into(),
                etf_name: "Core World".into(),
                etf_value: 1000.0,
                source: "local_cache".into(),
                holdings: vec![
                    decomposition_holding("AAPL", Some("US0378331005")),
                    decomposition_holding("MSFT", Some("US5949181045")),
                    decomposition_holding("GHOST", None),
                ],
            },
            EtfDecomposition {
                etf_isin: "IE00B5BMR087".into(),
                etf_name: "Core S&P".into(),
                etf_value: 500.0,
                source: "local_cache".into(),
                // AAPL appears again: must not produce a second lookup.
                holdings: vec![decomposition_holding("AAPL", Some("US0378331005"))],
            },
        ];
        let direct = vec![position("US0378331005", "Apple Inc.", 1.0, 150.0, AssetClass::Stock)];

        let isins = enricher.collect_unique_isins(&decompositions, &direct);
        assert_eq!(isins, vec!["US0378331005".to_string(), "US5949181045".to_string()]);
    }

    #[tokio::test]
    async fn local_tier_enriches_known_isins() {
        let dir = tempfile::tempdir().unwrap();
        let enricher = build_enricher(&dir);

        let mut decompositions = vec![EtfDecomposition {
            etf_isin: "IE00B4L5Y983".into(),
            etf_name: "Core World".into(),
            etf_value: 1000.0,
            source: "local_cache".into(),
            holdings: vec![
                decomposition_holding("AAPL", Some("US0378331005")),
                decomposition_holding("GHOST", None),
            ],
        }];

        let (metadata, summary, errors) =
            enricher.enrich(&mut decompositions, &[], &|_, _| {}).await;

        assert!(errors.is_empty());
        assert_eq!(metadata.len(), 1);
        assert_eq!(summary.sources["US0378331005"], "local");
        assert!(summary.contributions.is_empty());

        let enriched = &decompositions[0].holdings[0];
        assert_eq!(enriched.enrichment_source.as_deref(), Some("local"));
        // The local tier knows no sector; the default survives.
        assert_eq!(enriched.sector, "Unknown");

        // Unresolved rows keep defaults and no enrichment source.
        let ghost = &decompositions[0].holdings[1];
        assert!(ghost.enrichment_source.is_none());
        assert_eq!(ghost.sector, "Unknown");
    }

    #[tokio::test]
    async fn progress_reports_monotonically() {
        let dir = tempfile::tempdir().unwrap();
        let enricher = build_enricher(&dir);

        let mut decompositions = vec![EtfDecomposition {
            etf_isin: "IE00B4L5Y983".into(),
            etf_name: "Core World".into(),
            etf_value: 1000.0,
            source: "local_cache".into(),
            holdings: vec![decomposition_holding("AAPL", Some("US0378331005"))],
        }];

        let calls = std::sync::Mutex::new(Vec::new());
        enricher
            .enrich(&mut decompositions, &[], &|done, total| {
                calls.lock().unwrap().push((done, total));
            })
            .await;

        let calls = calls.into_inner().unwrap();
        assert!(!calls.is_empty());
        assert!(calls.windows(2).all(|w| w[0].0 <= w[1].0));
    }
}
