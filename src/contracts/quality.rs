// =============================================================================
// Data quality tracking — degrades a score as validation issues accumulate
// =============================================================================
//
// The score starts at 1.0 and each issue subtracts a severity-based penalty,
// floored at 0.0. A report is trustworthy at score >= 0.95.
// =============================================================================

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Severity levels for data quality issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    /// Calculation WILL be wrong.
    Critical,
    /// Calculation MAY be wrong.
    High,
    /// Data is incomplete.
    Medium,
    /// Cosmetic.
    Low,
}

impl IssueSeverity {
    pub fn penalty(self) -> f64 {
        match self {
            Self::Critical => 0.25,
            Self::High => 0.10,
            Self::Medium => 0.03,
            Self::Low => 0.01,
        }
    }
}

/// Categories for grouping issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueCategory {
    Schema,
    Weight,
    Resolution,
    Enrichment,
    Currency,
    Value,
}

/// A single validation issue detected at a phase boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub severity: IssueSeverity,
    pub category: IssueCategory,
    pub code: String,
    pub message: String,
    pub fix_hint: String,
    /// ISIN or other public identifier — safe to share.
    pub item: String,
    pub phase: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
}

impl ValidationIssue {
    pub fn new(
        severity: IssueSeverity,
        category: IssueCategory,
        code: &str,
        message: impl Into<String>,
        fix_hint: impl Into<String>,
        item: impl Into<String>,
        phase: &str,
    ) -> Self {
        Self {
            severity,
            category,
            code: code.to_string(),
            message: message.into(),
            fix_hint: fix_hint.into(),
            item: item.into(),
            phase: phase.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            expected: None,
            actual: None,
        }
    }

    pub fn expected_actual(
        mut self,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        self.expected = Some(expected.into());
        self.actual = Some(actual.into());
        self
    }

    /// Anonymized form for telemetry: no names, no identifiers beyond the
    /// phase and machine codes.
    pub fn to_telemetry(&self) -> serde_json::Value {
        serde_json::json!({
            "severity": self.severity,
            "category": self.category,
            "code": self.code,
            "phase": self.phase,
            "expected": self.expected,
            "actual": self.actual,
        })
    }
}

/// Quality score plus the issues that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataQuality {
    pub score: f64,
    pub issues: Vec<ValidationIssue>,
}

impl Default for DataQuality {
    fn default() -> Self {
        Self {
            score: 1.0,
            issues: Vec::new(),
        }
    }
}

impl DataQuality {
    pub fn add_issue(&mut self, issue: ValidationIssue) {
        self.score = (self.score - issue.severity.penalty()).max(0.0);
        self.issues.push(issue);
    }

    pub fn add_issues(&mut self, issues: impl IntoIterator<Item = ValidationIssue>) {
        for issue in issues {
            self.add_issue(issue);
        }
    }

    pub fn is_trustworthy(&self) -> bool {
        self.score >= 0.95
    }

    pub fn has_critical_issues(&self) -> bool {
        self.issues
            .iter()
            .any(|i| i.severity == IssueSeverity::Critical)
    }

    /// Merge another quality record and recompute the score from scratch so
    /// the result is order-independent.
    pub fn merge(&mut self, other: DataQuality) {
        self.issues.extend(other.issues);
        self.score = 1.0;
        let total: f64 = self.issues.iter().map(|i| i.severity.penalty()).sum();
        self.score = (self.score - total).max(0.0);
    }

    pub fn count_by_severity(&self, severity: IssueSeverity) -> usize {
        self.issues.iter().filter(|i| i.severity == severity).count()
    }

    /// JSON summary for the health report and the UI.
    pub fn to_summary(&self) -> serde_json::Value {
        serde_json::json!({
            "quality_score": (self.score * 1e4).round() / 1e4,
            "is_trustworthy": self.is_trustworthy(),
            "has_critical_issues": self.has_critical_issues(),
            "total_issues": self.issues.len(),
            "by_severity": {
                "critical": self.count_by_severity(IssueSeverity::Critical),
                "high": self.count_by_severity(IssueSeverity::High),
                "medium": self.count_by_severity(IssueSeverity::Medium),
                "low": self.count_by_severity(IssueSeverity::Low),
            },
            "issues": self.issues,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(severity: IssueSeverity) -> ValidationIssue {
        ValidationIssue::new(
            severity,
            IssueCategory::Weight,
            "WEIGHT_SUM_LOW",
            "weight sum is low",
            "check holdings data",
            "IE00B4L5Y983",
            "ETF_DECOMPOSITION",
        )
    }

    #[test]
    fn penalties_match_contract() {
        assert_eq!(IssueSeverity::Critical.penalty(), 0.25);
        assert_eq!(IssueSeverity::High.penalty(), 0.10);
        assert_eq!(IssueSeverity::Medium.penalty(), 0.03);
        assert_eq!(IssueSeverity::Low.penalty(), 0.01);
    }

    #[test]
    fn score_degrades_and_floors_at_zero() {
        let mut q = DataQuality::default();
        assert!(q.is_trustworthy());

        q.add_issue(issue(IssueSeverity::High));
        assert!((q.score - 0.90).abs() < 1e-9);
        assert!(!q.is_trustworthy());

        for _ in 0..10 {
            q.add_issue(issue(IssueSeverity::Critical));
        }
        assert_eq!(q.score, 0.0);
    }

    #[test]
    fn one_medium_issue_stays_trustworthy_boundary() {
        let mut q = DataQuality::default();
        q.add_issue(issue(IssueSeverity::Medium));
        // 0.97 >= 0.95
        assert!(q.is_trustworthy());
        q.add_issue(issue(IssueSeverity::Medium));
        // 0.94 < 0.95
        assert!(!q.is_trustworthy());
    }

    #[test]
    fn merge_recomputes_score_from_all_issues() {
        let mut a = DataQuality::default();
        a.add_issue(issue(IssueSeverity::High));

        let mut b = DataQuality::default();
        b.add_issue(issue(IssueSeverity::Medium));
        b.add_issue(issue(IssueSeverity::Low));

        a.merge(b);
        assert_eq!(a.issues.len(), 3);
        assert!((a.score - 0.86).abs() < 1e-9);
    }

    #[test]
    fn telemetry_omits_item_and_message() {
        let i = issue(IssueSeverity::Critical).expected_actual("sum ~100", "42.0");
        let t = i.to_telemetry();
        let text = t.to_string();
        assert!(!text.contains("IE00B4L5Y983"));
        assert!(!text.contains("weight sum is low"));
        assert_eq!(t["code"], "WEIGHT_SUM_LOW");
        assert_eq!(t["actual"], "42.0");
    }
}
