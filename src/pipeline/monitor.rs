// =============================================================================
// Pipeline monitor — timings, hive hit rates, and data provenance per run
// =============================================================================

use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

use serde::Serialize;

/// Tracks performance and provenance for one pipeline run. ISIN sets
/// deduplicate so an asset enriched twice counts once.
pub struct PipelineMonitor {
    started: Instant,
    phase_times: BTreeMap<String, f64>,
    hive_hits: HashSet<String>,
    hive_misses: HashSet<String>,
    api_calls: HashSet<String>,
    contributions: HashSet<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorMetrics {
    pub execution_time_seconds: f64,
    pub phase_durations: BTreeMap<String, f64>,
    pub hive_hit_rate: f64,
    pub api_fallback_rate: f64,
    pub total_assets_processed: usize,
    pub hive_hits_count: usize,
    pub hive_misses_count: usize,
    pub api_calls_count: usize,
    pub contributions_count: usize,
}

impl PipelineMonitor {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            phase_times: BTreeMap::new(),
            hive_hits: HashSet::new(),
            hive_misses: HashSet::new(),
            api_calls: HashSet::new(),
            contributions: HashSet::new(),
        }
    }

    pub fn record_phase(&mut self, phase: &str, seconds: f64) {
        self.phase_times
            .insert(phase.to_string(), (seconds * 1e3).round() / 1e3);
    }

    pub fn record_enrichment(&mut self, isin: &str, source: &str) {
        if source == "hive" || source == "local" {
            self.hive_hits.insert(isin.to_string());
        } else {
            self.hive_misses.insert(isin.to_string());
            if !source.is_empty() && source != "unknown" {
                self.api_calls.insert(isin.to_string());
            }
        }
    }

    pub fn record_contribution(&mut self, isin: &str) {
        self.contributions.insert(isin.to_string());
    }

    pub fn metrics(&self) -> MonitorMetrics {
        let total = self.hive_hits.len() + self.hive_misses.len();
        let hit_rate = if total > 0 {
            self.hive_hits.len() as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        MonitorMetrics {
            execution_time_seconds: (self.started.elapsed().as_secs_f64() * 100.0).round() / 100.0,
            phase_durations: self.phase_times.clone(),
            hive_hit_rate: (hit_rate * 10.0).round() / 10.0,
            api_fallback_rate: if total > 0 {
                ((100.0 - hit_rate) * 10.0).round() / 10.0
            } else {
                0.0
            },
            total_assets_processed: total,
            hive_hits_count: self.hive_hits.len(),
            hive_misses_count: self.hive_misses.len(),
            api_calls_count: self.api_calls.len(),
            contributions_count: self.contributions.len(),
        }
    }

    /// Sorted hive interaction log for the health report.
    pub fn hive_log(&self) -> serde_json::Value {
        let mut hits: Vec<_> = self.hive_hits.iter().cloned().collect();
        let mut contributions: Vec<_> = self.contributions.iter().cloned().collect();
        hits.sort();
        contributions.sort();
        serde_json::json!({ "hits": hits, "contributions": contributions })
    }
}

impl Default for PipelineMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enrichment_sources_dedupe_by_isin() {
        let mut monitor = PipelineMonitor::new();
        monitor.record_enrichment("US0378331005", "hive");
        monitor.record_enrichment("US0378331005", "hive");
        monitor.record_enrichment("US5949181045", "api_finnhub");
        monitor.record_enrichment("DE0007164600", "unknown");

        let metrics = monitor.metrics();
        assert_eq!(metrics.hive_hits_count, 1);
        assert_eq!(metrics.hive_misses_count, 2);
        assert_eq!(metrics.api_calls_count, 1);
        assert!((metrics.hive_hit_rate - 33.3).abs() < 0.1);
    }

    #[test]
    fn empty_monitor_reports_zero_rates() {
        let metrics = PipelineMonitor::new().metrics();
        assert_eq!(metrics.hive_hit_rate, 0.0);
        assert_eq!(metrics.api_fallback_rate, 0.0);
        assert_eq!(metrics.total_assets_processed, 0);
    }

    #[test]
    fn phase_times_round_to_millis() {
        let mut monitor = PipelineMonitor::new();
        monitor.record_phase("data_loading", 0.123456);
        assert_eq!(monitor.metrics().phase_durations["data_loading"], 0.123);
    }
}
