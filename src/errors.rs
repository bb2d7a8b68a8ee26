// =============================================================================
// Pipeline error taxonomy
// =============================================================================
//
// Errors are data: every per-item failure is recorded, written to the health
// report, and shown to the user with an actionable fix hint. Only CRITICAL
// validation gate failures abort a run.
// =============================================================================

use serde::{Deserialize, Serialize};

/// The pipeline phase in which an error was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorPhase {
    DataLoading,
    EtfDecomposition,
    Enrichment,
    Aggregation,
    Reporting,
}

impl std::fmt::Display for ErrorPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DataLoading => write!(f, "DATA_LOADING"),
            Self::EtfDecomposition => write!(f, "ETF_DECOMPOSITION"),
            Self::Enrichment => write!(f, "ENRICHMENT"),
            Self::Aggregation => write!(f, "AGGREGATION"),
            Self::Reporting => write!(f, "REPORTING"),
        }
    }
}

/// Machine-readable error kinds consumed by the health report and the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    #[error("FILE_NOT_FOUND")]
    FileNotFound,
    #[error("NO_ADAPTER")]
    NoAdapter,
    #[error("API_FAILURE")]
    ApiFailure,
    #[error("CACHE_MISS")]
    CacheMiss,
    #[error("VALIDATION_FAILED")]
    ValidationFailed,
    #[error("MANUAL_UPLOAD_REQUIRED")]
    ManualUploadRequired,
    #[error("RATE_LIMITED")]
    RateLimited,
    #[error("TIMEOUT")]
    Timeout,
    #[error("UNKNOWN")]
    Unknown,
}

/// A single recorded pipeline failure.
///
/// `item` is an ISIN or other public identifier — never a holding name or
/// quantity, so the record is safe to forward in anonymized telemetry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineError {
    pub phase: ErrorPhase,
    pub error_type: ErrorType,
    pub item: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix_hint: Option<String>,
}

impl PipelineError {
    pub fn new(
        phase: ErrorPhase,
        error_type: ErrorType,
        item: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            phase,
            error_type,
            item: item.into(),
            message: message.into(),
            fix_hint: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Anonymized form: only the fields safe to leave the process.
    pub fn to_telemetry(&self) -> serde_json::Value {
        serde_json::json!({
            "error_type": self.error_type,
            "phase": self.phase,
        })
    }
}

/// Final result of a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub success: bool,
    pub etfs_processed: usize,
    pub etfs_failed: usize,
    pub total_value: f64,
    pub errors: Vec<PipelineError>,
    #[serde(default)]
    pub quality_score: f64,
    #[serde(default)]
    pub harvested_count: usize,
}

impl PipelineResult {
    pub fn failed(errors: Vec<PipelineError>) -> Self {
        Self {
            success: false,
            etfs_processed: 0,
            etfs_failed: 0,
            total_value: 0.0,
            errors,
            quality_score: 0.0,
            harvested_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_type_serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorType::ManualUploadRequired).unwrap();
        assert_eq!(json, "\"MANUAL_UPLOAD_REQUIRED\"");
    }

    #[test]
    fn telemetry_form_carries_no_identifiers() {
        let err = PipelineError::new(
            ErrorPhase::EtfDecomposition,
            ErrorType::ApiFailure,
            "IE00B4L5Y983",
            "adapter returned empty holdings",
        )
        .with_hint("Check provider website or API limits");

        let telemetry = err.to_telemetry();
        let as_text = telemetry.to_string();
        assert!(!as_text.contains("IE00B4L5Y983"));
        assert!(!as_text.contains("adapter returned"));
        assert_eq!(telemetry["error_type"], "API_FAILURE");
        assert_eq!(telemetry["phase"], "ETF_DECOMPOSITION");
    }

    #[test]
    fn phase_display_matches_report_strings() {
        assert_eq!(ErrorPhase::DataLoading.to_string(), "DATA_LOADING");
        assert_eq!(ErrorPhase::EtfDecomposition.to_string(), "ETF_DECOMPOSITION");
    }
}
