// =============================================================================
// Pipeline orchestrator — Load, Decompose, Enrich, Aggregate, Report
// =============================================================================
//
// Thin coordinator: calls the phase services in order, gates each output,
// emits progress, collects errors, writes the three report artifacts, and
// flushes the resolver's discoveries into the local universe. Business
// logic lives in the services, not here.
// =============================================================================

pub mod aggregator;
pub mod decomposer;
pub mod enricher;
pub mod loader;
pub mod monitor;
pub mod reports;

use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};

use crate::adapters::AdapterRegistry;
use crate::contracts::schemas::LoadOutput;
use crate::contracts::ValidationGates;
use crate::errors::{ErrorPhase, ErrorType, PipelineError, PipelineResult};
use crate::hive::{ContributionQueue, HiveClient};
use crate::holdings::HoldingsCache;
use crate::isin::is_valid_isin;
use crate::pipeline::decomposer::Decomposer;
use crate::pipeline::enricher::Enricher;
use crate::pipeline::loader::PositionSource;
use crate::pipeline::monitor::PipelineMonitor;
use crate::resolve::universe::AssetUniverse;
use crate::resolve::IsinResolver;
use crate::runtime_config::{DataDirs, EngineConfig};
use crate::types::PipelinePhase;

/// Progress callback: (phase, fraction in [0,1], message).
pub type ProgressSink = Arc<dyn Fn(PipelinePhase, f64, &str) + Send + Sync>;

/// What a run leaves behind in memory: the result plus the summary payload
/// pushed over SSE.
pub struct RunArtifacts {
    pub result: PipelineResult,
    pub summary: serde_json::Value,
}

pub struct Pipeline {
    dirs: DataDirs,
    config: EngineConfig,
    source: Arc<dyn PositionSource>,
    cache: Arc<HoldingsCache>,
    registry: Arc<AdapterRegistry>,
    resolver: Arc<IsinResolver>,
    universe: Arc<AssetUniverse>,
    hive: Arc<HiveClient>,
    external: Arc<crate::resolve::external::ExternalResolver>,
    contributions: Arc<ContributionQueue>,
    sealed: bool,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dirs: DataDirs,
        config: EngineConfig,
        source: Arc<dyn PositionSource>,
        cache: Arc<HoldingsCache>,
        registry: Arc<AdapterRegistry>,
        resolver: Arc<IsinResolver>,
        universe: Arc<AssetUniverse>,
        hive: Arc<HiveClient>,
        external: Arc<crate::resolve::external::ExternalResolver>,
        contributions: Arc<ContributionQueue>,
        sealed: bool,
    ) -> Self {
        Self {
            dirs,
            config,
            source,
            cache,
            registry,
            resolver,
            universe,
            hive,
            external,
            contributions,
            sealed,
        }
    }

    /// Run the full analytics pipeline. Reports are written even for failed
    /// runs where possible.
    pub async fn run(&self, progress: ProgressSink) -> RunArtifacts {
        let mut monitor = PipelineMonitor::new();
        let mut gates = ValidationGates::new(
            self.config.min_resolution_rate,
            self.config.total_tolerance,
            &self.config.reporting_currency,
        );
        let mut errors: Vec<PipelineError> = Vec::new();
        self.resolver.reset_stats();

        progress(PipelinePhase::Loading, 0.05, "Initializing services...");

        // ── Phase 1: Load ───────────────────────────────────────────────
        let start = Instant::now();
        progress(PipelinePhase::Loading, 0.10, "Loading portfolio...");
        let (load_output, load_issues) = match loader::load_portfolio(self.source.as_ref(), 1).await
        {
            Ok(loaded) => loaded,
            Err(e) => {
                error!(error = %e, "portfolio load failed");
                errors.push(PipelineError::new(
                    ErrorPhase::DataLoading,
                    ErrorType::Unknown,
                    "portfolio",
                    e.to_string(),
                ));
                return self.finish_failed(errors, gates, monitor, &LoadOutput::default()).await;
            }
        };
        gates.absorb(load_issues);
        monitor.record_phase("data_loading", start.elapsed().as_secs_f64());

        let stock_count = load_output.direct_positions.len();
        let etf_count = load_output.etf_positions.len();
        let total_value = load_output.total_value();
        progress(
            PipelinePhase::Loading,
            0.15,
            &format!("Found {} holdings ({stock_count} stocks, {etf_count} ETFs)", stock_count + etf_count),
        );

        gates.check_load(&load_output);

        if load_output.is_empty() {
            errors.push(
                PipelineError::new(
                    ErrorPhase::DataLoading,
                    ErrorType::FileNotFound,
                    "portfolio",
                    "No portfolio data found",
                )
                .with_hint("Sync your portfolio first"),
            );
            return self.finish_failed(errors, gates, monitor, &load_output).await;
        }

        // ── Phase 2: Decompose ──────────────────────────────────────────
        let start = Instant::now();
        progress(
            PipelinePhase::Decomposition,
            0.25,
            &format!("Decomposing {etf_count} ETFs..."),
        );

        let decomposer = Decomposer::new(
            Arc::clone(&self.cache),
            Arc::clone(&self.registry),
            Arc::clone(&self.resolver),
            Arc::clone(&self.hive),
            Arc::clone(&self.contributions),
            self.sealed,
        );
        let progress_decompose = Arc::clone(&progress);
        let (mut decompose_output, decompose_errors) = decomposer
            .decompose(&load_output.etf_positions, &move |done, total, isin| {
                let fraction = 0.25 + 0.15 * done as f64 / total.max(1) as f64;
                progress_decompose(
                    PipelinePhase::Decomposition,
                    fraction,
                    &format!("Decomposed {done}/{total} ETFs ({isin})"),
                );
            })
            .await;
        let etfs_failed = decompose_errors.len();
        errors.extend(decompose_errors);
        monitor.record_phase("etf_decomposition", start.elapsed().as_secs_f64());

        let resolution_stats = self.resolver.stats();
        if resolution_stats.total > 0 {
            progress(
                PipelinePhase::Decomposition,
                0.40,
                &format!(
                    "Resolved {}/{} ISINs ({:.1}%)",
                    resolution_stats.resolved,
                    resolution_stats.total,
                    resolution_stats.resolution_rate() * 100.0
                ),
            );
        }

        let decompose_gate = gates.check_decompose(&decompose_output);
        if !decompose_gate.passed {
            errors.push(
                PipelineError::new(
                    ErrorPhase::EtfDecomposition,
                    ErrorType::ValidationFailed,
                    "decomposition",
                    "Decomposition output failed validation with critical issues",
                )
                .with_hint("Inspect the pipeline health report for weight-sum details"),
            );
            return self.finish_failed(errors, gates, monitor, &load_output).await;
        }

        // ── Phase 3: Enrich ─────────────────────────────────────────────
        let start = Instant::now();
        let total_to_enrich = decompose_output.total_holdings() + stock_count;
        progress(
            PipelinePhase::Enrichment,
            0.50,
            &format!("Enriching {total_to_enrich} securities with sector/geography data..."),
        );

        let enricher = Enricher::new(
            Arc::clone(&self.universe),
            Arc::clone(&self.hive),
            Arc::clone(&self.external),
            Arc::clone(&self.contributions),
        );
        let progress_enrich = Arc::clone(&progress);
        let (metadata, enrichment_summary, enrich_errors) = enricher
            .enrich(
                &mut decompose_output.decompositions,
                &load_output.direct_positions,
                &move |done, total| {
                    let fraction = 0.50 + 0.10 * done as f64 / total.max(1) as f64;
                    progress_enrich(
                        PipelinePhase::Enrichment,
                        fraction,
                        &format!("Enriched {done}/{total} securities"),
                    );
                },
            )
            .await;
        errors.extend(enrich_errors);
        monitor.record_phase("enrichment", start.elapsed().as_secs_f64());

        for (isin, source) in &enrichment_summary.sources {
            monitor.record_enrichment(isin, source);
        }
        for isin in &enrichment_summary.contributions {
            monitor.record_contribution(isin);
        }

        gates.check_enrich(&decompose_output.decompositions);

        // ── Phase 4: Aggregate ──────────────────────────────────────────
        let start = Instant::now();
        progress(PipelinePhase::Aggregation, 0.70, "Calculating true exposure...");

        let (aggregate_output, aggregate_errors) = aggregator::aggregate(
            &load_output.direct_positions,
            &decompose_output.decompositions,
            &metadata,
            total_value,
        );
        errors.extend(aggregate_errors);
        monitor.record_phase("aggregation", start.elapsed().as_secs_f64());

        progress(
            PipelinePhase::Aggregation,
            0.80,
            &format!("Aggregated {} unique securities", aggregate_output.unique_securities()),
        );

        let aggregate_gate = gates.check_aggregate(&aggregate_output, total_value);

        // ── Phase 5: Reports ────────────────────────────────────────────
        let start = Instant::now();
        progress(PipelinePhase::Reporting, 0.85, "Writing reports...");

        if let Err(e) = reports::write_exposure_report(&self.dirs.exposure_report_file(), &aggregate_output)
        {
            error!(error = %e, "failed to write exposure report");
            errors.push(PipelineError::new(
                ErrorPhase::Reporting,
                ErrorType::Unknown,
                "true_exposure.csv",
                e.to_string(),
            ));
        }
        if let Err(e) = reports::write_breakdown_report(
            &self.dirs.breakdown_report_file(),
            &load_output.direct_positions,
            &decompose_output.decompositions,
            &metadata,
        ) {
            error!(error = %e, "failed to write breakdown report");
            errors.push(PipelineError::new(
                ErrorPhase::Reporting,
                ErrorType::Unknown,
                "holdings_breakdown.csv",
                e.to_string(),
            ));
        }
        monitor.record_phase("reporting", start.elapsed().as_secs_f64());

        // ── Phase 6: Harvest ────────────────────────────────────────────
        progress(PipelinePhase::Reporting, 0.95, "Harvesting new securities...");
        let harvested_count = self.resolver.flush_to_universe();

        let resolution_stats = self.resolver.stats();
        let quality = gates.pipeline_quality().clone();
        if let Err(e) = reports::write_health_report(
            &self.dirs.health_report_file(),
            &errors,
            &load_output.direct_positions,
            &load_output.etf_positions,
            &decompose_output.decompositions,
            &monitor,
            &resolution_stats,
            &self.external.budget.snapshot(),
            &enrichment_summary,
            &quality,
        ) {
            warn!(error = %e, "failed to write health report");
        }

        crate::telemetry::TelemetryReporter::load(self.dirs.telemetry_state_file())
            .report_run(&quality.issues, &errors);

        let success = aggregate_gate.passed;
        progress(
            PipelinePhase::Complete,
            1.0,
            if success { "Analysis complete!" } else { "Analysis finished with critical issues" },
        );

        let summary = self.build_summary(
            &load_output,
            &decompose_output.decompositions,
            etfs_failed,
            &resolution_stats,
            &monitor,
            total_value,
        );

        info!(
            success,
            etfs_processed = decompose_output.decompositions.len(),
            etfs_failed,
            total_value,
            quality = quality.score,
            "pipeline run finished"
        );

        RunArtifacts {
            result: PipelineResult {
                success,
                etfs_processed: decompose_output.decompositions.len(),
                etfs_failed,
                total_value,
                errors,
                quality_score: quality.score,
                harvested_count,
            },
            summary,
        }
    }

    /// Terminal failure path: write whatever artifacts can still be written
    /// and return an unsuccessful result.
    async fn finish_failed(
        &self,
        errors: Vec<PipelineError>,
        gates: ValidationGates,
        monitor: PipelineMonitor,
        load_output: &LoadOutput,
    ) -> RunArtifacts {
        let quality = gates.into_quality();
        let resolution_stats = self.resolver.stats();

        let _ = reports::write_exposure_report(
            &self.dirs.exposure_report_file(),
            &crate::contracts::schemas::AggregateOutput::default(),
        );
        let _ = reports::write_breakdown_report(
            &self.dirs.breakdown_report_file(),
            &load_output.direct_positions,
            &[],
            &std::collections::HashMap::new(),
        );
        let _ = reports::write_health_report(
            &self.dirs.health_report_file(),
            &errors,
            &load_output.direct_positions,
            &load_output.etf_positions,
            &[],
            &monitor,
            &resolution_stats,
            &self.external.budget.snapshot(),
            &Default::default(),
            &quality,
        );

        let summary = self.build_summary(
            load_output,
            &[],
            errors.len(),
            &resolution_stats,
            &monitor,
            load_output.total_value(),
        );

        let mut result = PipelineResult::failed(errors);
        result.quality_score = quality.score;
        RunArtifacts { result, summary }
    }

    /// Summary payload for the SSE `pipeline_summary` event.
    fn build_summary(
        &self,
        load_output: &LoadOutput,
        decompositions: &[crate::contracts::schemas::EtfDecomposition],
        etfs_failed: usize,
        resolution: &crate::resolve::ResolutionStats,
        monitor: &PipelineMonitor,
        total_value: f64,
    ) -> serde_json::Value {
        let per_etf: Vec<serde_json::Value> = decompositions
            .iter()
            .map(|d| {
                serde_json::json!({
                    "isin": d.etf_isin,
                    "name": d.etf_name,
                    "holdings_count": d.holdings_count(),
                    "status": if d.holdings.is_empty() { "partial" } else { "success" },
                    "source": d.source,
                })
            })
            .collect();

        // Unresolved constituents, heaviest first, capped for the wire.
        let mut unresolved: Vec<serde_json::Value> = Vec::new();
        for decomposition in decompositions {
            for holding in &decomposition.holdings {
                if holding.isin.as_deref().is_some_and(is_valid_isin) {
                    continue;
                }
                let reason = if holding.ticker.is_empty() {
                    "no_ticker"
                } else {
                    holding.resolution_detail.as_deref().unwrap_or("api_all_failed")
                };
                let ticker = if holding.ticker.is_empty() {
                    "N/A".to_string()
                } else {
                    holding.ticker.clone()
                };
                unresolved.push(serde_json::json!({
                    "ticker": ticker,
                    "name": holding.name,
                    "weight": holding.weight_percentage,
                    "parent_etf": decomposition.etf_name,
                    "reason": reason,
                }));
            }
        }
        unresolved.sort_by(|a, b| {
            b["weight"]
                .as_f64()
                .unwrap_or(0.0)
                .partial_cmp(&a["weight"].as_f64().unwrap_or(0.0))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let unresolved_total = unresolved.len();
        const MAX_UNRESOLVED: usize = 100;
        unresolved.truncate(MAX_UNRESOLVED);

        let metrics = monitor.metrics();
        let mut by_source = resolution.by_source.clone();
        let tier2_skipped = by_source.remove("tier2_skipped").unwrap_or(0);

        serde_json::json!({
            "holdings": {
                "stocks": load_output.direct_positions.len(),
                "etfs": load_output.etf_positions.len(),
                "total_value": total_value,
            },
            "decomposition": {
                "etfs_processed": decompositions.len(),
                "etfs_failed": etfs_failed,
                "total_underlying": decompositions.iter().map(|d| d.holdings.len()).sum::<usize>(),
                "per_etf": per_etf,
            },
            "resolution": {
                "total": resolution.total,
                "resolved": resolution.resolved,
                "unresolved": resolution.unresolved,
                "skipped_tier2": tier2_skipped,
                "by_source": by_source,
            },
            "timing": {
                "total_seconds": metrics.execution_time_seconds,
                "phases": metrics.phase_durations,
            },
            "unresolved": unresolved,
            "unresolved_truncated": unresolved_total > MAX_UNRESOLVED,
            "unresolved_total": unresolved_total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{AdapterResult, HoldingsAdapter};
    use crate::contracts::schemas::Holding;
    use crate::pipeline::loader::testing::{position, StaticSource};
    use crate::resolve::external::ExternalResolver;
    use crate::resolve::negative::NegativeCache;
    use crate::types::AssetClass;
    use async_trait::async_trait;

    struct FixtureAdapter(Vec<Holding>);

    #[async_trait]
    impl HoldingsAdapter for FixtureAdapter {
        fn provider(&self) -> &str {
            "fixture"
        }
        fn handles(&self, _isin: &str) -> bool {
            true
        }
        async fn fetch_holdings(&self, _isin: &str) -> AdapterResult {
            Ok(Some(self.0.clone()))
        }
    }

    fn build_pipeline(
        dirs: &DataDirs,
        positions: Vec<crate::contracts::schemas::Position>,
        adapter_holdings: Option<Vec<Holding>>,
    ) -> Pipeline {
        let universe = Arc::new(crate::resolve::universe::AssetUniverse::load(
            dirs.asset_universe_file(),
        ));
        let hive = Arc::new(HiveClient::new("", ""));
        let external = Arc::new(ExternalResolver::disabled());
        let contributions = ContributionQueue::new(false);

        let resolver = Arc::new(IsinResolver::new(
            Arc::clone(&universe),
            &dirs.manual_overrides_file(),
            &dirs.enrichment_cache_file(),
            NegativeCache::load(dirs.negative_cache_file()),
            Arc::clone(&hive),
            Arc::clone(&external),
            Arc::clone(&contributions),
            1.0,
        ));

        let mut registry = AdapterRegistry::new(8);
        if let Some(holdings) = adapter_holdings {
            registry.register(Arc::new(FixtureAdapter(holdings)));
        }

        Pipeline::new(
            dirs.clone(),
            EngineConfig::default(),
            Arc::new(StaticSource(positions)),
            Arc::new(HoldingsCache::new(dirs, 7).unwrap()),
            Arc::new(registry),
            resolver,
            universe,
            hive,
            external,
            contributions,
            false,
        )
    }

    fn no_progress() -> ProgressSink {
        Arc::new(|_, _, _| {})
    }

    #[tokio::test]
    async fn empty_portfolio_fails_with_file_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = DataDirs::new(tmp.path());
        dirs.ensure().unwrap();

        let pipeline = build_pipeline(&dirs, vec![], None);
        let artifacts = pipeline.run(no_progress()).await;

        assert!(!artifacts.result.success);
        assert_eq!(artifacts.result.errors.len(), 1);
        assert_eq!(artifacts.result.errors[0].error_type, ErrorType::FileNotFound);

        // Header-only reports still exist.
        let exposure = std::fs::read_to_string(dirs.exposure_report_file()).unwrap();
        assert_eq!(exposure.lines().count(), 1);
        assert!(dirs.health_report_file().exists());
    }

    #[tokio::test]
    async fn single_direct_position_produces_full_exposure() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = DataDirs::new(tmp.path());
        dirs.ensure().unwrap();

        let pipeline = build_pipeline(
            &dirs,
            vec![position("US0378331005", "Apple Inc.", 10.0, 150.0, AssetClass::Stock)],
            None,
        );
        let artifacts = pipeline.run(no_progress()).await;

        assert!(artifacts.result.success, "errors: {:?}", artifacts.result.errors);
        assert_eq!(artifacts.result.total_value, 1500.0);
        assert_eq!(artifacts.result.etfs_processed, 0);

        let exposure = std::fs::read_to_string(dirs.exposure_report_file()).unwrap();
        let data_row = exposure.lines().nth(1).unwrap();
        assert!(data_row.contains("US0378331005"));
        assert!(data_row.contains("1500.00"));
        assert!(data_row.contains("100.0000"));
    }

    #[tokio::test]
    async fn etf_run_decomposes_and_reports() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = DataDirs::new(tmp.path());
        dirs.ensure().unwrap();

        let mut apple = Holding::new("AAPL", "Apple Inc.", 60.0);
        apple.isin = Some("US0378331005".into());
        let mut msft = Holding::new("MSFT", "Microsoft Corp", 40.0);
        msft.isin = Some("US5949181045".into());

        let pipeline = build_pipeline(
            &dirs,
            vec![position("IE00B4L5Y983", "Core World ETF", 10.0, 100.0, AssetClass::Etf)],
            Some(vec![apple, msft]),
        );

        let events = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink_events = Arc::clone(&events);
        let sink: ProgressSink = Arc::new(move |phase, fraction, message: &str| {
            sink_events.lock().unwrap().push((phase, fraction, message.to_string()));
        });

        let artifacts = pipeline.run(sink).await;
        assert!(artifacts.result.success, "errors: {:?}", artifacts.result.errors);
        assert_eq!(artifacts.result.etfs_processed, 1);
        assert_eq!(artifacts.result.etfs_failed, 0);

        // Exposure: two rows, 60/40 of 1000.
        let exposure = std::fs::read_to_string(dirs.exposure_report_file()).unwrap();
        assert_eq!(exposure.lines().count(), 3);
        assert!(exposure.contains("600.00"));
        assert!(exposure.contains("400.00"));

        // Breakdown carries the parent ETF.
        let breakdown = std::fs::read_to_string(dirs.breakdown_report_file()).unwrap();
        assert!(breakdown.contains("IE00B4L5Y983,Core World ETF,ETF,US0378331005"));

        // Progress moved through the phases in order and ended complete.
        let events = events.lock().unwrap();
        assert!(events.iter().any(|(p, _, _)| *p == PipelinePhase::Decomposition));
        assert!(events.iter().any(|(p, _, _)| *p == PipelinePhase::Aggregation));
        assert_eq!(events.last().unwrap().0, PipelinePhase::Complete);
        assert!(events.windows(2).all(|w| w[0].1 <= w[1].1 + 1e-9));

        // Summary payload mirrors the run.
        assert_eq!(artifacts.summary["decomposition"]["etfs_processed"], 1);
        assert_eq!(artifacts.summary["holdings"]["etfs"], 1);
    }

    #[tokio::test]
    async fn failed_etf_continues_run_and_lands_in_health_report() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = DataDirs::new(tmp.path());
        dirs.ensure().unwrap();

        let pipeline = build_pipeline(
            &dirs,
            vec![
                position("US0378331005", "Apple Inc.", 10.0, 150.0, AssetClass::Stock),
                position("IE00B4L5Y983", "Mystery ETF", 1.0, 100.0, AssetClass::Etf),
            ],
            None,
        );
        let artifacts = pipeline.run(no_progress()).await;

        // The ETF failed but the direct position still produced a report.
        assert!(artifacts.result.success);
        assert_eq!(artifacts.result.etfs_failed, 1);
        assert_eq!(
            artifacts.result.errors[0].error_type,
            ErrorType::ManualUploadRequired
        );

        let health: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dirs.health_report_file()).unwrap())
                .unwrap();
        assert_eq!(health["failures"].as_array().unwrap().len(), 1);
        assert_eq!(health["failures"][0]["issue"], "MANUAL_UPLOAD_REQUIRED");
    }

    #[tokio::test]
    async fn rerun_with_unchanged_inputs_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = DataDirs::new(tmp.path());
        dirs.ensure().unwrap();

        let mut apple = Holding::new("AAPL", "Apple Inc.", 100.0);
        apple.isin = Some("US0378331005".into());

        let pipeline = build_pipeline(
            &dirs,
            vec![position("IE00B4L5Y983", "Core World ETF", 10.0, 100.0, AssetClass::Etf)],
            Some(vec![apple]),
        );

        pipeline.run(no_progress()).await;
        let first_exposure = std::fs::read_to_string(dirs.exposure_report_file()).unwrap();
        let first_breakdown = std::fs::read_to_string(dirs.breakdown_report_file()).unwrap();

        pipeline.run(no_progress()).await;
        let second_exposure = std::fs::read_to_string(dirs.exposure_report_file()).unwrap();
        let second_breakdown = std::fs::read_to_string(dirs.breakdown_report_file()).unwrap();

        assert_eq!(first_exposure, second_exposure);
        assert_eq!(first_breakdown, second_breakdown);
    }
}
