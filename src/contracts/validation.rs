// =============================================================================
// Phase validators — check data at phase boundaries, return issues, never panic
// =============================================================================

use crate::contracts::quality::{IssueCategory, IssueSeverity, ValidationIssue};
use crate::contracts::schemas::{
    AggregateOutput, DecomposeOutput, EtfDecomposition, LoadOutput,
};
use crate::types::AssetClass;

const PHASE_LOADING: &str = "DATA_LOADING";
const PHASE_DECOMPOSITION: &str = "ETF_DECOMPOSITION";
const PHASE_ENRICHMENT: &str = "ENRICHMENT";
const PHASE_AGGREGATION: &str = "AGGREGATION";

/// Target ISIN resolution rate below which an ETF gets flagged.
pub const DEFAULT_MIN_RESOLUTION_RATE: f64 = 0.80;
/// Relative tolerance between the aggregated and the expected total.
pub const DEFAULT_TOTAL_TOLERANCE: f64 = 0.01;

// =============================================================================
// Load phase
// =============================================================================

pub fn validate_load_output(output: &LoadOutput, reporting_currency: &str) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if output.is_empty() {
        issues.push(ValidationIssue::new(
            IssueSeverity::High,
            IssueCategory::Schema,
            "NO_POSITIONS",
            "No positions found in portfolio",
            "Sync your portfolio or check the position store",
            "portfolio",
            PHASE_LOADING,
        ));
        return issues;
    }

    let all = output
        .direct_positions
        .iter()
        .chain(output.etf_positions.iter());

    let mut zero_value = 0usize;
    let mut unknown_class = 0usize;
    let mut foreign_currencies: Vec<String> = Vec::new();

    for pos in all {
        if pos.market_value() <= 0.0 {
            zero_value += 1;
        }
        if pos.asset_class == AssetClass::Unknown {
            unknown_class += 1;
        }
        if pos.currency != reporting_currency && !foreign_currencies.contains(&pos.currency) {
            foreign_currencies.push(pos.currency.clone());
        }
    }

    if zero_value > 0 {
        issues.push(
            ValidationIssue::new(
                IssueSeverity::Medium,
                IssueCategory::Value,
                "ZERO_VALUE_POSITIONS",
                format!("{zero_value} position(s) have zero or negative market value"),
                "Check that unit_price or cost_basis is set for all positions",
                "portfolio",
                PHASE_LOADING,
            )
            .expected_actual("market_value > 0", format!("{zero_value} positions <= 0")),
        );
    }

    if unknown_class > 0 {
        issues.push(ValidationIssue::new(
            IssueSeverity::Low,
            IssueCategory::Enrichment,
            "UNKNOWN_ASSET_CLASS",
            format!("{unknown_class} position(s) have unknown asset class"),
            "Asset class will be refined during enrichment",
            "portfolio",
            PHASE_LOADING,
        ));
    }

    if !foreign_currencies.is_empty() {
        issues.push(
            ValidationIssue::new(
                IssueSeverity::High,
                IssueCategory::Currency,
                "NON_EUR_CURRENCY",
                format!(
                    "Positions with non-{reporting_currency} currencies detected: {}",
                    foreign_currencies.join(", ")
                ),
                "Values are reported unconverted; flagged positions may skew totals",
                "portfolio",
                PHASE_LOADING,
            )
            .expected_actual(reporting_currency, foreign_currencies.join(", ")),
        );
    }

    issues
}

// =============================================================================
// Decompose phase
// =============================================================================

/// Weight-sum checks for one decomposition.
///
/// Boundary semantics (inclusive where shown):
///   sum in [0.5, 1.5] and no row above 1.5  -> WEIGHT_DECIMAL_FORMAT (critical)
///   sum < 50                                 -> WEIGHT_SUM_VERY_LOW  (critical)
///   sum in [50, 90)                          -> WEIGHT_SUM_LOW       (high)
///   sum > 110                                -> WEIGHT_SUM_HIGH      (medium)
pub fn validate_holdings_weights(decomposition: &EtfDecomposition) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    let isin = &decomposition.etf_isin;

    if decomposition.holdings.is_empty() {
        issues.push(ValidationIssue::new(
            IssueSeverity::High,
            IssueCategory::Schema,
            "NO_HOLDINGS",
            format!("ETF {isin} has no holdings data"),
            "Check the ETF data source or upload holdings manually",
            isin.clone(),
            PHASE_DECOMPOSITION,
        ));
        return issues;
    }

    let weight_sum = decomposition.weight_sum();
    let max_weight = decomposition
        .holdings
        .iter()
        .map(|h| h.weight_percentage)
        .fold(0.0_f64, f64::max);

    if (0.5..=1.5).contains(&weight_sum) && max_weight <= 1.5 {
        issues.push(
            ValidationIssue::new(
                IssueSeverity::Critical,
                IssueCategory::Weight,
                "WEIGHT_DECIMAL_FORMAT",
                format!("ETF {isin} weights appear to be in decimal format (sum: {weight_sum:.2})"),
                "Weights should be percentages (0-100), not decimals (0-1)",
                isin.clone(),
                PHASE_DECOMPOSITION,
            )
            .expected_actual("sum ~100", format!("{weight_sum:.2}")),
        );
    } else if weight_sum < 50.0 {
        issues.push(
            ValidationIssue::new(
                IssueSeverity::Critical,
                IssueCategory::Weight,
                "WEIGHT_SUM_VERY_LOW",
                format!("ETF {isin} weight sum is critically low: {weight_sum:.1}%"),
                "Holdings data may be incomplete or corrupted",
                isin.clone(),
                PHASE_DECOMPOSITION,
            )
            .expected_actual("sum ~100", format!("{weight_sum:.1}%")),
        );
    } else if weight_sum < 90.0 {
        issues.push(
            ValidationIssue::new(
                IssueSeverity::High,
                IssueCategory::Weight,
                "WEIGHT_SUM_LOW",
                format!("ETF {isin} weight sum is low: {weight_sum:.1}%"),
                "Some holdings may be missing from the data source",
                isin.clone(),
                PHASE_DECOMPOSITION,
            )
            .expected_actual("sum ~100", format!("{weight_sum:.1}%")),
        );
    } else if weight_sum > 110.0 {
        issues.push(
            ValidationIssue::new(
                IssueSeverity::Medium,
                IssueCategory::Weight,
                "WEIGHT_SUM_HIGH",
                format!("ETF {isin} weight sum exceeds 100%: {weight_sum:.1}%"),
                "Normal for leveraged ETFs, otherwise indicates duplicate holdings",
                isin.clone(),
                PHASE_DECOMPOSITION,
            )
            .expected_actual("sum ~100", format!("{weight_sum:.1}%")),
        );
    }

    issues
}

pub fn validate_resolution_rate(
    decomposition: &EtfDecomposition,
    min_rate: f64,
) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    if decomposition.holdings.is_empty() {
        return issues;
    }

    let isin = &decomposition.etf_isin;
    let total = decomposition.holdings.len();
    let rate = decomposition.resolved_count() as f64 / total as f64;

    if rate < 0.50 {
        issues.push(
            ValidationIssue::new(
                IssueSeverity::High,
                IssueCategory::Resolution,
                "LOW_RESOLUTION_RATE",
                format!("ETF {isin} has low ISIN resolution rate: {:.0}%", rate * 100.0),
                "Consider contributing unresolved tickers to the community Hive",
                isin.clone(),
                PHASE_DECOMPOSITION,
            )
            .expected_actual(
                format!(">= {:.0}%", min_rate * 100.0),
                format!("{:.0}%", rate * 100.0),
            ),
        );
    } else if rate < min_rate {
        issues.push(
            ValidationIssue::new(
                IssueSeverity::Medium,
                IssueCategory::Resolution,
                "MODERATE_RESOLUTION_RATE",
                format!("ETF {isin} resolution rate is below target: {:.0}%", rate * 100.0),
                "Some holdings could not be resolved to ISINs",
                isin.clone(),
                PHASE_DECOMPOSITION,
            )
            .expected_actual(
                format!(">= {:.0}%", min_rate * 100.0),
                format!("{:.0}%", rate * 100.0),
            ),
        );
    }

    issues
}

pub fn validate_decompose_output(
    output: &DecomposeOutput,
    min_resolution_rate: f64,
) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    for decomposition in &output.decompositions {
        issues.extend(validate_holdings_weights(decomposition));
        issues.extend(validate_resolution_rate(decomposition, min_resolution_rate));
    }
    issues
}

// =============================================================================
// Enrich phase
// =============================================================================

pub fn validate_enrichment_coverage(decomposition: &EtfDecomposition) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    let total = decomposition.holdings.len();
    if total == 0 {
        return issues;
    }

    let isin = &decomposition.etf_isin;
    let unknown_sector = decomposition
        .holdings
        .iter()
        .filter(|h| h.sector == "Unknown")
        .count();
    let unknown_geography = decomposition
        .holdings
        .iter()
        .filter(|h| h.geography == "Unknown")
        .count();

    let sector_coverage = 1.0 - unknown_sector as f64 / total as f64;
    let geography_coverage = 1.0 - unknown_geography as f64 / total as f64;

    if sector_coverage < 0.50 {
        issues.push(
            ValidationIssue::new(
                IssueSeverity::Medium,
                IssueCategory::Enrichment,
                "LOW_SECTOR_COVERAGE",
                format!("ETF {isin} has low sector coverage: {:.0}%", sector_coverage * 100.0),
                "Sector data may be unavailable for some holdings",
                isin.clone(),
                PHASE_ENRICHMENT,
            )
            .expected_actual(">= 50%", format!("{:.0}%", sector_coverage * 100.0)),
        );
    }

    if geography_coverage < 0.50 {
        issues.push(
            ValidationIssue::new(
                IssueSeverity::Medium,
                IssueCategory::Enrichment,
                "LOW_GEOGRAPHY_COVERAGE",
                format!(
                    "ETF {isin} has low geography coverage: {:.0}%",
                    geography_coverage * 100.0
                ),
                "Geography data may be unavailable for some holdings",
                isin.clone(),
                PHASE_ENRICHMENT,
            )
            .expected_actual(">= 50%", format!("{:.0}%", geography_coverage * 100.0)),
        );
    }

    issues
}

pub fn validate_enrich_output(decompositions: &[EtfDecomposition]) -> Vec<ValidationIssue> {
    decompositions
        .iter()
        .flat_map(validate_enrichment_coverage)
        .collect()
}

// =============================================================================
// Aggregate phase
// =============================================================================

pub fn validate_aggregation_totals(
    calculated_total: f64,
    expected_total: f64,
    tolerance: f64,
) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if expected_total <= 0.0 {
        issues.push(
            ValidationIssue::new(
                IssueSeverity::Critical,
                IssueCategory::Value,
                "ZERO_PORTFOLIO_VALUE",
                "Expected portfolio value is zero or negative",
                "Check that positions have valid prices and quantities",
                "portfolio",
                PHASE_AGGREGATION,
            )
            .expected_actual("> 0", format!("{expected_total:.2}")),
        );
        return issues;
    }

    let difference = (calculated_total - expected_total).abs() / expected_total;

    if difference > 0.10 {
        issues.push(
            ValidationIssue::new(
                IssueSeverity::Critical,
                IssueCategory::Value,
                "TOTAL_MISMATCH_LARGE",
                format!("Aggregated total differs from expected by {:.1}%", difference * 100.0),
                "Large discrepancy indicates calculation errors or missing data",
                "portfolio",
                PHASE_AGGREGATION,
            )
            .expected_actual(format!("{expected_total:.2}"), format!("{calculated_total:.2}")),
        );
    } else if difference > tolerance {
        issues.push(
            ValidationIssue::new(
                IssueSeverity::High,
                IssueCategory::Value,
                "TOTAL_MISMATCH",
                format!("Aggregated total differs from expected by {:.1}%", difference * 100.0),
                "Minor discrepancy may be due to incomplete ETF weight coverage",
                "portfolio",
                PHASE_AGGREGATION,
            )
            .expected_actual(format!("{expected_total:.2}"), format!("{calculated_total:.2}")),
        );
    }

    issues
}

pub fn validate_percentage_sum(output: &AggregateOutput) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    if output.exposures.is_empty() {
        return issues;
    }

    let percentage_sum: f64 = output.exposures.iter().map(|e| e.portfolio_percentage).sum();

    if percentage_sum < 95.0 {
        issues.push(
            ValidationIssue::new(
                IssueSeverity::High,
                IssueCategory::Value,
                "PERCENTAGE_SUM_LOW",
                format!("Portfolio percentages sum to only {percentage_sum:.1}%"),
                "Some exposures may be missing from the aggregation",
                "portfolio",
                PHASE_AGGREGATION,
            )
            .expected_actual("~100%", format!("{percentage_sum:.1}%")),
        );
    } else if percentage_sum > 105.0 {
        issues.push(
            ValidationIssue::new(
                IssueSeverity::Medium,
                IssueCategory::Value,
                "PERCENTAGE_SUM_HIGH",
                format!("Portfolio percentages sum to {percentage_sum:.1}%"),
                "May indicate overlapping exposures or leveraged positions",
                "portfolio",
                PHASE_AGGREGATION,
            )
            .expected_actual("~100%", format!("{percentage_sum:.1}%")),
        );
    }

    issues
}

pub fn validate_aggregate_output(
    output: &AggregateOutput,
    expected_total: f64,
    tolerance: f64,
) -> Vec<ValidationIssue> {
    let mut issues = validate_aggregation_totals(output.calculated_total(), expected_total, tolerance);
    issues.extend(validate_percentage_sum(output));
    issues
}
