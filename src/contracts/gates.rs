// =============================================================================
// Validation gates — orchestrate validators at phase boundaries
// =============================================================================
//
// Each gate validates one phase output, folds the issues into the run-wide
// quality record, and reports pass/fail. A gate fails only on CRITICAL
// issues; everything else degrades the score and the run continues.
// =============================================================================

use tracing::{debug, error, info, warn};

use crate::contracts::quality::{DataQuality, IssueSeverity, ValidationIssue};
use crate::contracts::schemas::{AggregateOutput, DecomposeOutput, EtfDecomposition, LoadOutput};
use crate::contracts::validation;

/// Result from a single validation gate.
#[derive(Debug)]
pub struct GateResult {
    pub passed: bool,
    pub quality: DataQuality,
}

/// Accumulates run-wide quality across every gate of a pipeline run.
#[derive(Default)]
pub struct ValidationGates {
    pipeline_quality: DataQuality,
    min_resolution_rate: f64,
    total_tolerance: f64,
    reporting_currency: String,
}

impl ValidationGates {
    pub fn new(min_resolution_rate: f64, total_tolerance: f64, reporting_currency: &str) -> Self {
        Self {
            pipeline_quality: DataQuality::default(),
            min_resolution_rate,
            total_tolerance,
            reporting_currency: reporting_currency.to_string(),
        }
    }

    fn apply(&mut self, issues: Vec<ValidationIssue>) -> GateResult {
        let mut quality = DataQuality::default();
        for issue in issues {
            log_issue(&issue);
            quality.add_issue(issue);
        }
        let passed = !quality.has_critical_issues();
        self.pipeline_quality.merge(quality.clone());
        GateResult { passed, quality }
    }

    pub fn check_load(&mut self, output: &LoadOutput) -> GateResult {
        let currency = self.reporting_currency.clone();
        self.apply(validation::validate_load_output(output, &currency))
    }

    pub fn check_decompose(&mut self, output: &DecomposeOutput) -> GateResult {
        let rate = self.min_resolution_rate;
        self.apply(validation::validate_decompose_output(output, rate))
    }

    pub fn check_enrich(&mut self, decompositions: &[EtfDecomposition]) -> GateResult {
        self.apply(validation::validate_enrich_output(decompositions))
    }

    pub fn check_aggregate(&mut self, output: &AggregateOutput, expected_total: f64) -> GateResult {
        let tolerance = self.total_tolerance;
        self.apply(validation::validate_aggregate_output(
            output,
            expected_total,
            tolerance,
        ))
    }

    /// Fold issues produced outside a gate (e.g. rows dropped by the
    /// Loader) into the run-wide quality.
    pub fn absorb(&mut self, issues: Vec<ValidationIssue>) {
        let mut quality = DataQuality::default();
        for issue in issues {
            log_issue(&issue);
            quality.add_issue(issue);
        }
        self.pipeline_quality.merge(quality);
    }

    pub fn pipeline_quality(&self) -> &DataQuality {
        &self.pipeline_quality
    }

    pub fn into_quality(self) -> DataQuality {
        self.pipeline_quality
    }
}

fn log_issue(issue: &ValidationIssue) {
    match issue.severity {
        IssueSeverity::Critical => {
            error!(code = %issue.code, phase = %issue.phase, item = %issue.item, "{}", issue.message)
        }
        IssueSeverity::High => {
            warn!(code = %issue.code, phase = %issue.phase, item = %issue.item, "{}", issue.message)
        }
        IssueSeverity::Medium => {
            info!(code = %issue.code, phase = %issue.phase, "{}", issue.message)
        }
        IssueSeverity::Low => {
            debug!(code = %issue.code, phase = %issue.phase, "{}", issue.message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::schemas::Holding;

    #[test]
    fn load_gate_fails_only_on_critical() {
        let mut gates = ValidationGates::new(0.80, 0.01, "EUR");
        // Empty portfolio yields a HIGH issue — gate passes, score degrades.
        let result = gates.check_load(&LoadOutput::default());
        assert!(result.passed);
        assert!(!result.quality.is_trustworthy());
        assert_eq!(gates.pipeline_quality().issues.len(), 1);
    }

    #[test]
    fn decompose_gate_fails_on_decimal_weights() {
        let mut gates = ValidationGates::new(0.80, 0.01, "EUR");
        let output = DecomposeOutput {
            decompositions: vec![EtfDecomposition {
                etf_isin: "IE00B4L5Y983".into(),
                etf_name: "Core World".into(),
                etf_value: 1000.0,
                source: "adapter".into(),
                holdings: vec![
                    Holding::new("AAPL", "Apple Inc.", 0.10),
                    Holding::new("MSFT", "Microsoft", 0.05),
                ],
            }],
            etfs_failed: 0,
        };
        let result = gates.check_decompose(&output);
        assert!(!result.passed);
        assert!(result.quality.has_critical_issues());
    }

    #[test]
    fn quality_accumulates_across_gates() {
        let mut gates = ValidationGates::new(0.80, 0.01, "EUR");
        gates.check_load(&LoadOutput::default());
        gates.check_aggregate(&AggregateOutput::default(), 0.0);
        // NO_POSITIONS (high) + ZERO_PORTFOLIO_VALUE (critical)
        let quality = gates.pipeline_quality();
        assert_eq!(quality.issues.len(), 2);
        assert!(quality.has_critical_issues());
        assert!((quality.score - 0.65).abs() < 1e-9);
    }
}
