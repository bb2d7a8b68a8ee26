// =============================================================================
// Report writers — the three artifacts every run leaves behind
// =============================================================================
//
//   outputs/true_exposure.csv       aggregated exposure per unique security
//   outputs/holdings_breakdown.csv  every constituent with its parent ETF
//   outputs/pipeline_health.json    per-ETF stats, timings, failures
//
// Reports are written even for failed runs where possible; the JSON file
// uses an atomic tmp + rename write.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::info;

use crate::contracts::quality::DataQuality;
use crate::contracts::schemas::{AggregateOutput, EtfDecomposition, Position};
use crate::errors::PipelineError;
use crate::pipeline::enricher::{AssetMetadata, EnrichmentSummary};
use crate::pipeline::monitor::PipelineMonitor;
use crate::resolve::external::CallBudgetSnapshot;
use crate::resolve::ResolutionStats;

// =============================================================================
// True exposure report
// =============================================================================

pub fn write_exposure_report(path: &Path, output: &AggregateOutput) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("failed to create {}", path.display()))?;

    writer.write_record([
        "isin",
        "name",
        "sector",
        "geography",
        "asset_class",
        "direct",
        "indirect",
        "total_exposure",
        "portfolio_percentage",
        "resolution_confidence",
        "resolution_source",
    ])?;

    for exposure in &output.exposures {
        let asset_class = exposure.asset_class.to_string();
        let direct = format!("{:.2}", exposure.direct);
        let indirect = format!("{:.2}", exposure.indirect);
        let total = format!("{:.2}", exposure.total_exposure);
        let percentage = format!("{:.4}", exposure.portfolio_percentage);
        let confidence = format!("{:.2}", exposure.resolution_confidence);
        writer.write_record([
            exposure.isin.as_str(),
            exposure.name.as_str(),
            exposure.sector.as_str(),
            exposure.geography.as_str(),
            asset_class.as_str(),
            direct.as_str(),
            indirect.as_str(),
            total.as_str(),
            percentage.as_str(),
            confidence.as_str(),
            exposure.resolution_source.as_deref().unwrap_or(""),
        ])?;
    }
    writer.flush().context("failed to flush exposure report")?;
    info!(path = %path.display(), rows = output.exposures.len(), "exposure report written");
    Ok(())
}

// =============================================================================
// Holdings breakdown report
// =============================================================================

pub fn write_breakdown_report(
    path: &Path,
    direct_positions: &[Position],
    decompositions: &[EtfDecomposition],
    metadata: &HashMap<String, AssetMetadata>,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("failed to create {}", path.display()))?;

    writer.write_record([
        "parent_isin",
        "parent_name",
        "source",
        "child_isin",
        "child_name",
        "weight_percent",
        "value_eur",
        "sector",
        "geography",
        "resolution_status",
        "resolution_source",
        "resolution_confidence",
        "resolution_detail",
        "ticker",
    ])?;

    for position in direct_positions {
        let meta = metadata.get(&position.isin);
        let value = format!("{:.2}", position.market_value());
        writer.write_record([
            "DIRECT",
            "Direct Holdings",
            "Direct",
            position.isin.as_str(),
            position.name.as_str(),
            "100.0",
            value.as_str(),
            meta.map(|m| m.sector.as_str()).unwrap_or("Unknown"),
            meta.map(|m| m.geography.as_str()).unwrap_or("Unknown"),
            "resolved",
            "provider",
            "1.00",
            "",
            position.symbol.as_deref().unwrap_or(""),
        ])?;
    }

    for decomposition in decompositions {
        for holding in &decomposition.holdings {
            let weight = format!("{:.4}", holding.weight_percentage);
            let value = format!("{:.2}", holding.weight_percentage / 100.0 * decomposition.etf_value);
            let status = holding.resolution_status.to_string();
            let confidence = format!("{:.2}", holding.resolution_confidence);
            writer.write_record([
                decomposition.etf_isin.as_str(),
                decomposition.etf_name.as_str(),
                "ETF",
                holding.isin.as_deref().unwrap_or("UNKNOWN"),
                holding.name.as_str(),
                weight.as_str(),
                value.as_str(),
                holding.sector.as_str(),
                holding.geography.as_str(),
                status.as_str(),
                holding.resolution_source.as_deref().unwrap_or("unknown"),
                confidence.as_str(),
                holding.resolution_detail.as_deref().unwrap_or(""),
                holding.ticker.as_str(),
            ])?;
        }
    }

    writer.flush().context("failed to flush breakdown report")?;
    info!(path = %path.display(), "holdings breakdown written");
    Ok(())
}

// =============================================================================
// Pipeline health report
// =============================================================================

#[allow(clippy::too_many_arguments)]
pub fn write_health_report(
    path: &Path,
    errors: &[PipelineError],
    direct_positions: &[Position],
    etf_positions: &[Position],
    decompositions: &[EtfDecomposition],
    monitor: &PipelineMonitor,
    resolution: &ResolutionStats,
    external_budget: &CallBudgetSnapshot,
    enrichment: &EnrichmentSummary,
    quality: &DataQuality,
) -> Result<()> {
    let per_etf: Vec<serde_json::Value> = decompositions
        .iter()
        .map(|d| {
            serde_json::json!({
                "isin": d.etf_isin,
                "name": d.etf_name,
                "holdings_count": d.holdings_count(),
                "weight_sum": (d.weight_sum() * 100.0).round() / 100.0,
                "status": if d.holdings.is_empty() { "failed" } else { "success" },
                "source": d.source,
            })
        })
        .collect();

    let metrics = monitor.metrics();

    let health = serde_json::json!({
        "timestamp": Utc::now().to_rfc3339(),
        "metrics": {
            "direct_holdings": direct_positions.len(),
            "etf_positions": etf_positions.len(),
            "etfs_processed": decompositions.iter().filter(|d| !d.holdings.is_empty()).count(),
        },
        "performance": {
            "execution_time_seconds": metrics.execution_time_seconds,
            "phase_durations": metrics.phase_durations,
            "hive_hit_rate": metrics.hive_hit_rate,
            "api_fallback_rate": metrics.api_fallback_rate,
            "total_assets_processed": metrics.total_assets_processed,
            "external_calls": external_budget,
        },
        "decomposition": { "per_etf": per_etf },
        "resolution": {
            "total": resolution.total,
            "resolved": resolution.resolved,
            "unresolved": resolution.unresolved,
            "skipped_tier2": resolution.skipped,
            "by_source": resolution.by_source,
        },
        "enrichment": {
            "stats": {
                "hive_hits": metrics.hive_hits_count,
                "api_calls": metrics.api_calls_count,
                "new_contributions": enrichment.contributions.len(),
            },
            "hive_log": monitor.hive_log(),
        },
        "quality": quality.to_summary(),
        "failures": errors
            .iter()
            .map(|e| {
                serde_json::json!({
                    "severity": "ERROR",
                    "stage": e.phase,
                    "item": e.item,
                    "issue": e.error_type,
                    "error": e.message,
                    "fix": e.fix_hint,
                })
            })
            .collect::<Vec<_>>(),
    });

    write_json_atomic(path, &health)?;
    info!(path = %path.display(), "pipeline health report written");
    Ok(())
}

/// Atomic JSON write: tmp sibling then rename.
pub fn write_json_atomic(path: &Path, value: &serde_json::Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(value)?)
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("failed to rename to {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::schemas::{AggregatedExposure, Holding};
    use crate::pipeline::loader::testing::position;
    use crate::types::{AssetClass, HoldingClass};

    fn sample_output() -> AggregateOutput {
        AggregateOutput {
            exposures: vec![AggregatedExposure {
                isin: "US0378331005".into(),
                name: "Apple Inc.".into(),
                sector: "Technology".into(),
                geography: "US".into(),
                asset_class: HoldingClass::Equity,
                direct: 1500.0,
                indirect: 100.0,
                total_exposure: 1600.0,
                portfolio_percentage: 64.0,
                resolution_confidence: 1.0,
                resolution_source: Some("provider".into()),
            }],
            total_portfolio_value: 2500.0,
        }
    }

    #[test]
    fn exposure_report_has_contracted_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("true_exposure.csv");
        write_exposure_report(&path, &sample_output()).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        assert_eq!(
            lines.next().unwrap(),
            "isin,name,sector,geography,asset_class,direct,indirect,total_exposure,portfolio_percentage,resolution_confidence,resolution_source"
        );
        let row = lines.next().unwrap();
        assert!(row.starts_with("US0378331005,Apple Inc.,Technology,US,Equity,1500.00,100.00,1600.00,64.0000,1.00,provider"));
    }

    #[test]
    fn empty_run_still_writes_header_only_reports() {
        let dir = tempfile::tempdir().unwrap();
        let exposure_path = dir.path().join("true_exposure.csv");
        let breakdown_path = dir.path().join("holdings_breakdown.csv");

        write_exposure_report(
            &exposure_path,
            &AggregateOutput {
                exposures: vec![],
                total_portfolio_value: 0.0,
            },
        )
        .unwrap();
        write_breakdown_report(&breakdown_path, &[], &[], &HashMap::new()).unwrap();

        assert_eq!(std::fs::read_to_string(&exposure_path).unwrap().lines().count(), 1);
        assert_eq!(std::fs::read_to_string(&breakdown_path).unwrap().lines().count(), 1);
    }

    #[test]
    fn breakdown_includes_direct_and_etf_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("holdings_breakdown.csv");

        let direct = vec![position("US0378331005", "Apple Inc.", 10.0, 150.0, AssetClass::Stock)];
        let mut holding = Holding::new("MSFT", "Microsoft", 5.0);
        holding.isin = Some("US5949181045".into());
        let decompositions = vec![EtfDecomposition {
            etf_isin: "IE00B4L5Y983".into(),
            etf_name: "Core World".into(),
            etf_value: 1000.0,
            source: "adapter".into(),
            holdings: vec![holding],
        }];

        write_breakdown_report(&path, &direct, &decompositions, &HashMap::new()).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("DIRECT,Direct Holdings,Direct,US0378331005"));
        assert!(lines[2].starts_with("IE00B4L5Y983,Core World,ETF,US5949181045,Microsoft,5.0000,50.00"));
    }

    #[test]
    fn health_report_is_valid_json_with_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline_health.json");

        write_health_report(
            &path,
            &[],
            &[],
            &[],
            &[],
            &PipelineMonitor::new(),
            &ResolutionStats::default(),
            &CallBudgetSnapshot {
                wikidata_calls: 0,
                finnhub_calls: 0,
                yfinance_calls: 0,
                rate_limited: 0,
            },
            &EnrichmentSummary::default(),
            &DataQuality::default(),
        )
        .unwrap();

        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(parsed.get("timestamp").is_some());
        assert!(parsed.get("metrics").is_some());
        assert!(parsed.get("performance").is_some());
        assert!(parsed.get("decomposition").is_some());
        assert!(parsed.get("failures").unwrap().as_array().unwrap().is_empty());
        assert_eq!(parsed["quality"]["quality_score"], 1.0);
    }
}
