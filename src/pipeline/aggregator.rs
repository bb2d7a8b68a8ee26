// =============================================================================
// Aggregator — per-security sum of direct and indirect exposure
// =============================================================================
//
// Merge rule on conflicts: rows are sorted by (resolution confidence desc,
// unknown-field count asc) before grouping, so the first row of each group
// carries the most trustworthy name/sector/geography. Numeric fields are
// summed; confidence takes the group max, and the source travels with it.
//
// Portfolio percentages divide by the TOP-DOWN portfolio value from the
// Loader, never the bottom-up sum, so weight-sum noise inside one ETF
// cannot leak into portfolio-wide numbers.
// =============================================================================

use std::collections::HashMap;

use tracing::{debug, info};

use crate::contracts::schemas::{AggregateOutput, AggregatedExposure, EtfDecomposition, Position};
use crate::errors::{ErrorPhase, ErrorType, PipelineError};
use crate::isin::{CASH_GROUP_ID, CASH_GROUP_NAME};
use crate::pipeline::enricher::AssetMetadata;
use crate::types::HoldingClass;

struct ExposureRow {
    group_id: String,
    name: String,
    sector: String,
    geography: String,
    asset_class: HoldingClass,
    direct: f64,
    indirect: f64,
    confidence: f64,
    source: Option<String>,
}

impl ExposureRow {
    fn unknown_count(&self) -> usize {
        [&self.name, &self.sector, &self.geography]
            .iter()
            .filter(|v| v.as_str() == "Unknown")
            .count()
    }
}

/// Aggregate direct positions and decomposed holdings into the final
/// exposure table.
pub fn aggregate(
    direct_positions: &[Position],
    decompositions: &[EtfDecomposition],
    metadata: &HashMap<String, AssetMetadata>,
    true_total_value: f64,
) -> (AggregateOutput, Vec<PipelineError>) {
    let mut errors = Vec::new();
    let mut rows: Vec<ExposureRow> = Vec::new();

    // Direct positions: one row per ISIN, provider-grade provenance. Cash
    // positions are excluded so broker cash never shows up as a security.
    for position in direct_positions {
        if position.name.to_uppercase().contains("CASH") {
            continue;
        }
        let meta = metadata.get(&position.isin);
        rows.push(ExposureRow {
            group_id: position.isin.clone(),
            name: position.name.clone(),
            sector: meta.map(|m| m.sector.clone()).unwrap_or_else(|| "Unknown".to_string()),
            geography: meta
                .map(|m| m.geography.clone())
                .unwrap_or_else(|| "Unknown".to_string()),
            asset_class: HoldingClass::Equity,
            direct: position.market_value(),
            indirect: 0.0,
            confidence: 1.0,
            source: Some("provider".to_string()),
        });
    }

    // Decomposed holdings: indirect = weight/100 x parent value. Cash-like
    // rows collapse to the canonical cash group across every parent ETF.
    for decomposition in decompositions {
        for holding in &decomposition.holdings {
            let indirect = holding.weight_percentage / 100.0 * decomposition.etf_value;

            let (group_id, name) = if holding.asset_class == HoldingClass::Cash {
                (CASH_GROUP_ID.to_string(), CASH_GROUP_NAME.to_string())
            } else {
                (holding.group_id(), holding.name.clone())
            };

            rows.push(ExposureRow {
                group_id,
                name,
                sector: holding.sector.clone(),
                geography: holding.geography.clone(),
                asset_class: holding.asset_class,
                direct: 0.0,
                indirect,
                confidence: holding.resolution_confidence,
                source: holding.resolution_source.clone(),
            });
        }
    }

    if rows.is_empty() {
        debug!("no exposure rows to aggregate");
        return (
            AggregateOutput {
                exposures: Vec::new(),
                total_portfolio_value: true_total_value,
            },
            errors,
        );
    }

    // Confidence-weighted first-wins: best-provenance row leads each group.
    rows.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.unknown_count().cmp(&b.unknown_count()))
    });

    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, AggregatedExposure> = HashMap::new();

    for row in rows {
        match groups.get_mut(&row.group_id) {
            None => {
                order.push(row.group_id.clone());
                groups.insert(
                    row.group_id.clone(),
                    AggregatedExposure {
                        isin: row.group_id,
                        name: row.name,
                        sector: row.sector,
                        geography: row.geography,
                        asset_class: row.asset_class,
                        direct: row.direct,
                        indirect: row.indirect,
                        total_exposure: 0.0,
                        portfolio_percentage: 0.0,
                        resolution_confidence: row.confidence,
                        resolution_source: row.source,
                    },
                );
            }
            Some(existing) => {
                existing.direct += row.direct;
                existing.indirect += row.indirect;
                if row.confidence > existing.resolution_confidence {
                    existing.resolution_confidence = row.confidence;
                    existing.resolution_source = row.source;
                }
            }
        }
    }

    let mut exposures: Vec<AggregatedExposure> = order
        .into_iter()
        .filter_map(|id| groups.remove(&id))
        .collect();

    for exposure in &mut exposures {
        exposure.total_exposure = exposure.direct + exposure.indirect;
        // Explicitly zero when the portfolio has no value: no NaN, no
        // divide-by-zero.
        exposure.portfolio_percentage = if true_total_value > 0.0 {
            exposure.total_exposure / true_total_value * 100.0
        } else {
            0.0
        };
    }

    exposures.sort_by(|a, b| {
        b.total_exposure
            .partial_cmp(&a.total_exposure)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    if exposures.is_empty() {
        errors.push(PipelineError::new(
            ErrorPhase::Aggregation,
            ErrorType::ValidationFailed,
            "aggregation",
            "Aggregation produced no exposure rows",
        ));
    }

    info!(unique = exposures.len(), "aggregation complete");
    (
        AggregateOutput {
            exposures,
            total_portfolio_value: true_total_value,
        },
        errors,
    )
}
