// =============================================================================
// Decomposer — turns ETF positions into constituent tables with provenance
// =============================================================================
//
// Acquisition order per ETF: cached tiers (local fresh, bundled community),
// remote Hive holdings, provider adapter, manual upload. Whatever succeeds
// is written back into the local cache; adapter successes are additionally
// shared with the Hive (fire-and-forget). Every constituent row then runs
// through the ISIN resolver.
// =============================================================================

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::adapters::{AdapterError, AdapterRegistry};
use crate::contracts::schemas::{DecomposeOutput, EtfDecomposition, Holding, Position};
use crate::errors::{ErrorPhase, ErrorType, PipelineError};
use crate::hive::contributions::Contribution;
use crate::hive::{ContributionQueue, HiveClient};
use crate::holdings::HoldingsCache;
use crate::resolve::IsinResolver;
use crate::types::ResolutionStatus;

pub struct Decomposer {
    cache: Arc<HoldingsCache>,
    registry: Arc<AdapterRegistry>,
    resolver: Arc<IsinResolver>,
    hive: Arc<HiveClient>,
    contributions: Arc<ContributionQueue>,
    sealed: bool,
}

impl Decomposer {
    pub fn new(
        cache: Arc<HoldingsCache>,
        registry: Arc<AdapterRegistry>,
        resolver: Arc<IsinResolver>,
        hive: Arc<HiveClient>,
        contributions: Arc<ContributionQueue>,
        sealed: bool,
    ) -> Self {
        Self {
            cache,
            registry,
            resolver,
            hive,
            contributions,
            sealed,
        }
    }

    /// Decompose every ETF position. Per-ETF failures are recorded and the
    /// run continues; `progress` fires after each ETF completes.
    pub async fn decompose(
        &self,
        etf_positions: &[Position],
        progress: &(dyn Fn(usize, usize, &str) + Send + Sync),
    ) -> (DecomposeOutput, Vec<PipelineError>) {
        let mut output = DecomposeOutput::default();
        let mut errors = Vec::new();
        let total = etf_positions.len();

        for (index, etf) in etf_positions.iter().enumerate() {
            match self.decompose_one(etf).await {
                Ok(decomposition) => {
                    info!(
                        isin = %etf.isin,
                        holdings = decomposition.holdings.len(),
                        source = %decomposition.source,
                        "ETF decomposed"
                    );
                    output.decompositions.push(decomposition);
                }
                Err(error) => {
                    warn!(isin = %etf.isin, error = %error.message, "ETF decomposition failed");
                    errors.push(error);
                    output.etfs_failed += 1;
                }
            }
            progress(index + 1, total, &etf.isin);
        }

        (output, errors)
    }

    async fn decompose_one(&self, etf: &Position) -> Result<EtfDecomposition, PipelineError> {
        let isin = etf.isin.as_str();
        let (mut holdings, source) = self.acquire_holdings(isin).await?;

        self.resolve_rows(&mut holdings, isin).await;

        Ok(EtfDecomposition {
            etf_isin: isin.to_string(),
            etf_name: etf.name.clone(),
            etf_value: etf.market_value(),
            source,
            holdings,
        })
    }

    /// Tiered acquisition: cache, Hive, adapter, manual upload.
    async fn acquire_holdings(&self, isin: &str) -> Result<(Vec<Holding>, String), PipelineError> {
        // Tiers 1-2: fresh local file, bundled community data.
        if let Some((holdings, source)) = self.cache.lookup_cached(isin) {
            return Ok((holdings, source));
        }

        // Community remote: the Hive may have the table another user shared.
        match self.hive.get_etf_holdings(isin).await {
            Ok(Some(holdings)) if !holdings.is_empty() => {
                self.cache.save_local(isin, &holdings, "community", None);
                return Ok((holdings, "community".to_string()));
            }
            Ok(_) => {}
            Err(e) => debug!(isin, error = %e, "hive holdings lookup failed"),
        }

        // Tier 3: provider adapter (disabled in sealed mode).
        if !self.sealed {
            if self.registry.has_adapter(isin) {
                match self.registry.fetch_holdings(isin).await {
                    Ok(Some(holdings)) => {
                        self.cache.save_local(isin, &holdings, "adapter", None);
                        // Share the discovery; failures are invisible by design.
                        self.contributions.submit(Contribution::EtfHoldings {
                            etf_isin: isin.to_string(),
                            holdings: holdings.clone(),
                        });
                        return Ok((holdings, "adapter".to_string()));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        // Typed adapter failures map straight onto the error
                        // taxonomy; a rate limit is not retried this run.
                        let error_type = match e {
                            AdapterError::RateLimited => ErrorType::RateLimited,
                            AdapterError::Timeout => ErrorType::Timeout,
                            _ => ErrorType::ApiFailure,
                        };
                        return Err(PipelineError::new(
                            ErrorPhase::EtfDecomposition,
                            error_type,
                            isin,
                            format!("Adapter fetch failed: {e}"),
                        )
                        .with_hint("Check network connectivity or provider API limits"));
                    }
                }
            } else {
                debug!(isin, "no adapter registered");
            }
        }

        // Tier 4: manual upload.
        if let Some(holdings) = self.cache.lookup_manual(isin) {
            self.cache.save_local(isin, &holdings, "manual_upload", None);
            return Ok((holdings, "manual_upload".to_string()));
        }

        // Exhausted. Tell the user exactly what to do.
        let hint = match self.registry.provider_hint(isin) {
            Some(hint) => match hint.download_url {
                Some(url) => format!(
                    "Download holdings from {url} and upload to inputs/manual_holdings/{isin}.csv"
                ),
                None => format!(
                    "Get the holdings file from {} and upload to inputs/manual_holdings/{isin}.csv",
                    hint.provider
                ),
            },
            None => format!("Upload holdings to inputs/manual_holdings/{isin}.csv"),
        };

        Err(PipelineError::new(
            ErrorPhase::EtfDecomposition,
            ErrorType::ManualUploadRequired,
            isin,
            "No holdings data available from any tier",
        )
        .with_hint(hint))
    }

    /// Resolve ISINs row by row. Rows already carrying a valid ISIN are
    /// provider-grade and skip the cascade entirely.
    async fn resolve_rows(&self, holdings: &mut [Holding], etf_isin: &str) {
        let mut resolved = 0usize;

        for holding in holdings.iter_mut() {
            if holding.has_valid_isin() {
                holding.resolution_status = ResolutionStatus::Resolved;
                holding.resolution_source = Some("existing".to_string());
                holding.resolution_confidence = 1.0;
                holding.resolution_detail = Some("existing".to_string());
                resolved += 1;
                continue;
            }

            if holding.ticker.is_empty() && holding.name.is_empty() {
                holding.resolution_status = ResolutionStatus::Unresolved;
                holding.resolution_detail = Some("no_identifiers".to_string());
                continue;
            }

            let result = self
                .resolver
                .resolve(
                    &holding.ticker,
                    &holding.name,
                    holding.isin.as_deref(),
                    holding.weight_percentage,
                )
                .await;

            holding.resolution_status = result.status;
            holding.resolution_confidence = result.confidence;
            holding.resolution_detail = Some(result.detail);
            if !result.source.is_empty() {
                holding.resolution_source = Some(result.source);
            }
            if result.status == ResolutionStatus::Resolved {
                holding.isin = result.isin;
                resolved += 1;
            }
        }

        info!(
            etf_isin,
            resolved,
            total = holdings.len(),
            "constituent resolution complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{AdapterResult, HoldingsAdapter};
    use crate::pipeline::loader::testing::position;
    use crate::resolve::external::ExternalResolver;
    use crate::resolve::negative::NegativeCache;
    use crate::resolve::universe::AssetUniverse;
    use crate::runtime_config::DataDirs;
    use crate::types::AssetClass;
    use async_trait::async_trait;

    struct FixtureAdapter {
        holdings: Vec<Holding>,
    }

    #[async_trait]
    impl HoldingsAdapter for FixtureAdapter {
        fn provider(&self) -> &str {
            "fixture"
        }
        fn handles(&self, _isin: &str) -> bool {
            true
        }
        async fn fetch_holdings(&self, _isin: &str) -> AdapterResult {
            Ok(Some(self.holdings.clone()))
        }
    }

    struct RateLimitedAdapter;

    #[async_trait]
    impl HoldingsAdapter for RateLimitedAdapter {
        fn provider(&self) -> &str {
            "limited"
        }
        fn handles(&self, _isin: &str) -> bool {
            true
        }
        async fn fetch_holdings(&self, _isin: &str) -> AdapterResult {
            Err(AdapterError::RateLimited)
        }
    }

    fn build(
        dirs: &DataDirs,
        adapter: Option<Arc<dyn HoldingsAdapter>>,
        sealed: bool,
    ) -> Decomposer {
        let universe_path = dirs.asset_universe_file();
        std::fs::write(
            &universe_path,
            "ISIN,TR_Ticker,Yahoo_Ticker,Name,Aliases,Provider,Asset_Class,Source,Added_Date,Last_Verified\n\
             US5949181045,,MSFT,Microsoft Corp,,iShares,Stock,provider,2024-01-01,\n",
        )
        .unwrap();

        let contributions = ContributionQueue::new(false);
        let resolver = Arc::new(IsinResolver::new(
            Arc::new(AssetUniverse::load(universe_path)),
            &dirs.manual_overrides_file(),
            &dirs.enrichment_cache_file(),
            NegativeCache::load(dirs.negative_cache_file()),
            Arc::new(HiveClient::new("", "")),
            Arc::new(ExternalResolver::disabled()),
            Arc::clone(&contributions),
            1.0,
        ));

        let mut registry = AdapterRegistry::new(8);
        if let Some(adapter) = adapter {
            registry.register(adapter);
        }

        Decomposer::new(
            Arc::new(HoldingsCache::new(dirs, 7).unwrap()),
            Arc::new(registry),
            resolver,
            Arc::new(HiveClient::new("", "")),
            contributions,
            sealed,
        )
    }

    fn etf_position() -> Position {
        position("IE00B4L5Y983", "Core World", 10.0, 100.0, AssetClass::Etf)
    }

    fn fixture_holdings() -> Vec<Holding> {
        let mut with_isin = Holding::new("AAPL", "Apple Inc.", 10.0);
        with_isin.isin = Some("US0378331005".into());
        vec![
            with_isin,
            Holding::new("MSFT", "Microsoft Corp", 5.0),
            Holding::new("GHOST", "Ghost Corp", 2.0),
            Holding::new("DUST", "Dust Corp", 0.5),
        ]
    }

    #[tokio::test]
    async fn adapter_fetch_resolves_and_caches() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = DataDirs::new(tmp.path());
        dirs.ensure().unwrap();

        let decomposer = build(
            &dirs,
            Some(Arc::new(FixtureAdapter {
                holdings: fixture_holdings(),
            })),
            false,
        );

        let (output, errors) = decomposer.decompose(&[etf_position()], &|_, _, _| {}).await;
        assert!(errors.is_empty());
        assert_eq!(output.decompositions.len(), 1);

        let decomp = &output.decompositions[0];
        assert_eq!(decomp.source, "adapter");
        assert_eq!(decomp.etf_value, 1000.0);
        assert_eq!(decomp.holdings.len(), 4);

        let by_ticker = |t: &str| decomp.holdings.iter().find(|h| h.ticker == t).unwrap();

        // Pre-valid ISIN is provider-grade.
        let apple = by_ticker("AAPL");
        assert_eq!(apple.resolution_source.as_deref(), Some("existing"));
        assert_eq!(apple.resolution_confidence, 1.0);
        assert_eq!(apple.resolution_status, ResolutionStatus::Resolved);

        // Universe resolves MSFT.
        let msft = by_ticker("MSFT");
        assert_eq!(msft.isin.as_deref(), Some("US5949181045"));
        assert_eq!(msft.resolution_detail.as_deref(), Some("local_cache_ticker"));

        // Above-threshold miss is unresolved, below-threshold is skipped.
        assert_eq!(by_ticker("GHOST").resolution_status, ResolutionStatus::Unresolved);
        assert_eq!(by_ticker("DUST").resolution_status, ResolutionStatus::Skipped);
        assert_eq!(
            by_ticker("DUST").resolution_detail.as_deref(),
            Some("tier2_skipped")
        );

        // Result landed in the local cache; a re-run serves from there.
        let (output2, _) = decomposer.decompose(&[etf_position()], &|_, _, _| {}).await;
        assert_eq!(output2.decompositions[0].source, "local_cache");
    }

    #[tokio::test]
    async fn exhausted_tiers_yield_manual_upload_error() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = DataDirs::new(tmp.path());
        dirs.ensure().unwrap();

        let decomposer = build(&dirs, None, false);
        let (output, errors) = decomposer.decompose(&[etf_position()], &|_, _, _| {}).await;

        assert_eq!(output.decompositions.len(), 0);
        assert_eq!(output.etfs_failed, 1);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error_type, ErrorType::ManualUploadRequired);
        assert!(errors[0]
            .fix_hint
            .as_deref()
            .unwrap()
            .contains("inputs/manual_holdings/IE00B4L5Y983.csv"));
    }

    #[tokio::test]
    async fn rate_limited_adapter_surfaces_typed_error() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = DataDirs::new(tmp.path());
        dirs.ensure().unwrap();

        let decomposer = build(&dirs, Some(Arc::new(RateLimitedAdapter)), false);
        let (_, errors) = decomposer.decompose(&[etf_position()], &|_, _, _| {}).await;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error_type, ErrorType::RateLimited);
    }

    #[tokio::test]
    async fn sealed_mode_skips_adapter_but_uses_manual() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = DataDirs::new(tmp.path());
        dirs.ensure().unwrap();

        std::fs::write(
            dirs.manual_uploads_dir().join("IE00B4L5Y983.csv"),
            "name,weight,ticker\nApple Inc.,10.0,AAPL\n",
        )
        .unwrap();

        // The adapter would succeed, but sealed mode must never invoke it.
        let decomposer = build(
            &dirs,
            Some(Arc::new(FixtureAdapter {
                holdings: fixture_holdings(),
            })),
            true,
        );
        let (output, errors) = decomposer.decompose(&[etf_position()], &|_, _, _| {}).await;
        assert!(errors.is_empty());
        assert_eq!(output.decompositions[0].source, "manual_upload");
        assert_eq!(output.decompositions[0].holdings.len(), 1);
    }

    #[tokio::test]
    async fn progress_fires_per_etf() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = DataDirs::new(tmp.path());
        dirs.ensure().unwrap();

        let decomposer = build(&dirs, None, false);
        let seen = std::sync::Mutex::new(Vec::new());
        let etfs = vec![etf_position(), {
            position("IE00B5BMR087", "Core S&P 500", 1.0, 500.0, AssetClass::Etf)
        }];
        decomposer
            .decompose(&etfs, &|done, total, isin| {
                seen.lock().unwrap().push((done, total, isin.to_string()));
            })
            .await;

        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], (1, 2, "IE00B4L5Y983".to_string()));
        assert_eq!(seen[1], (2, 2, "IE00B5BMR087".to_string()));
    }
}
