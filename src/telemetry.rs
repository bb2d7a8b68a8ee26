// =============================================================================
// Telemetry — rate-limited anonymized error forwarding
// =============================================================================
//
// Strictly opt-in via TELEMETRY_ENABLED. The anonymization contract: only
// machine codes, phases, severities, and expected/actual strings leave the
// process. Never holdings, names, or identifiers — the item id is used
// locally as a dedup key only.
//
// Reports are rate-limited to avoid spam, with the dedup state persisted in
// working/.telemetry_state.json like the other caches:
//   - structural failures (no adapter, manual upload required, ...):
//     once per item, ever
//   - transient failures (API errors, timeouts, rate limits) and
//     validation issues: once per (code, item) per day
//   - uncategorized errors: at most 5 per day in total
//
// Delivery is fire-and-forget on a detached task; failures are only logged.
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::contracts::quality::ValidationIssue;
use crate::errors::{ErrorType, PipelineError};

/// Daily cap for errors that carry no stable item key.
const UNCATEGORIZED_DAILY_CAP: u32 = 5;

fn enabled() -> bool {
    std::env::var("TELEMETRY_ENABLED")
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn endpoint() -> Option<String> {
    std::env::var("PRISM_TELEMETRY_URL").ok().filter(|u| !u.is_empty())
}

// =============================================================================
// Rate limiting
// =============================================================================

enum Cadence {
    /// Report once per (code, item), then never again.
    OncePerItem,
    /// Report once per (code, item) per calendar day.
    DailyPerItem,
    /// No item key; capped at N reports per day across all items.
    DailyCapped(u32),
}

fn error_cadence(error_type: ErrorType) -> Cadence {
    match error_type {
        // A flaky provider may recover tomorrow; an absent adapter will not.
        ErrorType::ApiFailure | ErrorType::Timeout | ErrorType::RateLimited => Cadence::DailyPerItem,
        ErrorType::Unknown => Cadence::DailyCapped(UNCATEGORIZED_DAILY_CAP),
        _ => Cadence::OncePerItem,
    }
}

/// Persisted dedup state: last report per (code, item) plus per-day counts.
#[derive(Debug, Default, Serialize, Deserialize)]
struct TelemetryState {
    #[serde(default)]
    reported: HashMap<String, DateTime<Utc>>,
    #[serde(default)]
    daily_counts: HashMap<String, HashMap<String, u32>>,
}

pub struct TelemetryReporter {
    state_path: PathBuf,
    state: Mutex<TelemetryState>,
}

impl TelemetryReporter {
    pub fn load(state_path: PathBuf) -> Self {
        let mut state = TelemetryState::default();
        if state_path.exists() {
            match std::fs::read_to_string(&state_path) {
                Ok(content) => match serde_json::from_str::<TelemetryState>(&content) {
                    Ok(loaded) => state = loaded,
                    Err(e) => warn!(error = %e, "failed to parse telemetry state"),
                },
                Err(e) => warn!(error = %e, "failed to read telemetry state"),
            }
        }
        // Old daily buckets only grow the file; today's is the only one that
        // still gates anything.
        let today = Utc::now().format("%Y-%m-%d").to_string();
        state.daily_counts.retain(|date, _| *date == today);

        Self {
            state_path,
            state: Mutex::new(state),
        }
    }

    /// Forward anonymized reports for one run, honoring the rate limits.
    /// Returns immediately; delivery happens on a detached task.
    pub fn report_run(&self, issues: &[ValidationIssue], errors: &[PipelineError]) {
        if !enabled() {
            return;
        }
        let Some(url) = endpoint() else {
            debug!("telemetry enabled but no endpoint configured");
            return;
        };

        let (issue_reports, error_reports) = self.filter_run(issues, errors);
        if issue_reports.is_empty() && error_reports.is_empty() {
            debug!("all telemetry reports rate-limited");
            return;
        }

        info!(
            issues = issue_reports.len(),
            errors = error_reports.len(),
            "forwarding anonymized telemetry"
        );

        let payload = serde_json::json!({
            "issues": issue_reports,
            "errors": error_reports,
        });
        tokio::spawn(async move {
            let client = reqwest::Client::new();
            match client.post(&url).json(&payload).send().await {
                Ok(resp) if resp.status().is_success() => debug!("telemetry delivered"),
                Ok(resp) => debug!(status = %resp.status(), "telemetry endpoint rejected report"),
                Err(e) => debug!(error = %e, "telemetry delivery failed"),
            }
        });
    }

    /// Apply the rate limits, mark survivors as reported, and persist the
    /// state. Returns the anonymized payload entries that may be sent.
    fn filter_run(
        &self,
        issues: &[ValidationIssue],
        errors: &[PipelineError],
    ) -> (Vec<serde_json::Value>, Vec<serde_json::Value>) {
        let mut state = self.state.lock();
        let now = Utc::now();
        let today = now.format("%Y-%m-%d").to_string();

        let mut issue_reports = Vec::new();
        for issue in issues {
            if Self::admit(
                &mut state,
                &issue.code,
                &issue.item,
                &Cadence::DailyPerItem,
                now,
                &today,
            ) {
                issue_reports.push(issue.to_telemetry());
            }
        }

        let mut error_reports = Vec::new();
        for error in errors {
            let code = error.error_type.to_string();
            let cadence = error_cadence(error.error_type);
            if Self::admit(&mut state, &code, &error.item, &cadence, now, &today) {
                error_reports.push(error.to_telemetry());
            }
        }

        if !issue_reports.is_empty() || !error_reports.is_empty() {
            self.persist(&state);
        }
        (issue_reports, error_reports)
    }

    /// Rate-limit check and, when admitted, the bookkeeping for it.
    fn admit(
        state: &mut TelemetryState,
        code: &str,
        item: &str,
        cadence: &Cadence,
        now: DateTime<Utc>,
        today: &str,
    ) -> bool {
        let key = format!("{code}:{item}");

        let allowed = match cadence {
            Cadence::OncePerItem => !state.reported.contains_key(&key),
            Cadence::DailyPerItem => state
                .reported
                .get(&key)
                .map(|last| last.format("%Y-%m-%d").to_string() != today)
                .unwrap_or(true),
            Cadence::DailyCapped(cap) => {
                let count = state
                    .daily_counts
                    .get(today)
                    .and_then(|codes| codes.get(code))
                    .copied()
                    .unwrap_or(0);
                count < *cap
            }
        };

        if !allowed {
            debug!(code, "telemetry report rate-limited");
            return false;
        }

        state.reported.insert(key, now);
        *state
            .daily_counts
            .entry(today.to_string())
            .or_default()
            .entry(code.to_string())
            .or_insert(0) += 1;
        true
    }

    fn persist(&self, state: &TelemetryState) {
        match serde_json::to_string_pretty(state) {
            Ok(json) => {
                if let Some(parent) = self.state_path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                let tmp = self.state_path.with_extension("json.tmp");
                if std::fs::write(&tmp, json)
                    .and_then(|_| std::fs::rename(&tmp, &self.state_path))
                    .is_err()
                {
                    warn!("failed to persist telemetry state");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialise telemetry state"),
        }
    }

    #[cfg(test)]
    fn backdate(&self, code: &str, item: &str, days: i64) {
        let key = format!("{code}:{item}");
        if let Some(last) = self.state.lock().reported.get_mut(&key) {
            *last -= chrono::Duration::days(days);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::quality::{IssueCategory, IssueSeverity};
    use crate::errors::ErrorPhase;

    fn issue(code: &str, item: &str) -> ValidationIssue {
        ValidationIssue::new(
            IssueSeverity::High,
            IssueCategory::Weight,
            code,
            "weight sum is low",
            "check data",
            item,
            "ETF_DECOMPOSITION",
        )
    }

    fn error(error_type: ErrorType, item: &str) -> PipelineError {
        PipelineError::new(
            ErrorPhase::EtfDecomposition,
            error_type,
            item,
            "something went wrong",
        )
    }

    fn reporter(dir: &tempfile::TempDir) -> TelemetryReporter {
        TelemetryReporter::load(dir.path().join(".telemetry_state.json"))
    }

    #[test]
    fn disabled_by_default() {
        // No TELEMETRY_ENABLED in the test environment.
        assert!(!enabled());
    }

    #[test]
    fn structural_errors_report_once_per_item_ever() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = reporter(&dir);

        let errors = vec![error(ErrorType::NoAdapter, "IE00B4L5Y983")];
        let (_, first) = reporter.filter_run(&[], &errors);
        assert_eq!(first.len(), 1);

        // Same run again: fully suppressed.
        let (_, second) = reporter.filter_run(&[], &errors);
        assert!(second.is_empty());

        // A different ISIN is independent.
        let other = vec![error(ErrorType::NoAdapter, "LU0274208692")];
        let (_, third) = reporter.filter_run(&[], &other);
        assert_eq!(third.len(), 1);
    }

    #[test]
    fn dedup_state_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let errors = vec![error(ErrorType::ManualUploadRequired, "IE00B4L5Y983")];
        {
            let reporter = reporter(&dir);
            let (_, sent) = reporter.filter_run(&[], &errors);
            assert_eq!(sent.len(), 1);
        }
        // A persistently-failing ETF stays silent on the next run too.
        let reporter = reporter(&dir);
        let (_, sent) = reporter.filter_run(&[], &errors);
        assert!(sent.is_empty());
    }

    #[test]
    fn transient_errors_report_again_the_next_day() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = reporter(&dir);

        let errors = vec![error(ErrorType::ApiFailure, "IE00B4L5Y983")];
        assert_eq!(reporter.filter_run(&[], &errors).1.len(), 1);
        assert!(reporter.filter_run(&[], &errors).1.is_empty());

        // Yesterday's report no longer blocks today's.
        reporter.backdate("API_FAILURE", "IE00B4L5Y983", 1);
        assert_eq!(reporter.filter_run(&[], &errors).1.len(), 1);
    }

    #[test]
    fn validation_issues_are_daily_per_code_and_item() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = reporter(&dir);

        let issues = vec![issue("WEIGHT_SUM_LOW", "IE00B4L5Y983")];
        assert_eq!(reporter.filter_run(&issues, &[]).0.len(), 1);
        assert!(reporter.filter_run(&issues, &[]).0.is_empty());

        // Different code on the same item reports independently.
        let other = vec![issue("LOW_RESOLUTION_RATE", "IE00B4L5Y983")];
        assert_eq!(reporter.filter_run(&other, &[]).0.len(), 1);

        reporter.backdate("WEIGHT_SUM_LOW", "IE00B4L5Y983", 1);
        assert_eq!(reporter.filter_run(&issues, &[]).0.len(), 1);
    }

    #[test]
    fn uncategorized_errors_cap_at_five_per_day() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = reporter(&dir);

        let errors: Vec<PipelineError> = (0..8)
            .map(|n| error(ErrorType::Unknown, &format!("item-{n}")))
            .collect();
        let (_, sent) = reporter.filter_run(&[], &errors);
        assert_eq!(sent.len(), UNCATEGORIZED_DAILY_CAP as usize);

        // The cap holds across subsequent runs the same day.
        let more = vec![error(ErrorType::Unknown, "item-99")];
        assert!(reporter.filter_run(&[], &more).1.is_empty());
    }

    #[test]
    fn payload_contains_no_identifiers() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = reporter(&dir);

        let issues = vec![issue("WEIGHT_SUM_LOW", "IE00B4L5Y983")];
        let errors = vec![error(ErrorType::ApiFailure, "IE00B4L5Y983")];
        let (issue_reports, error_reports) = reporter.filter_run(&issues, &errors);

        let payload = serde_json::json!({
            "issues": issue_reports,
            "errors": error_reports,
        })
        .to_string();

        assert!(!payload.contains("IE00B4L5Y983"));
        assert!(!payload.contains("something went wrong"));
        assert!(payload.contains("WEIGHT_SUM_LOW"));
        assert!(payload.contains("API_FAILURE"));
    }
}
