// =============================================================================
// Engine configuration — persisted settings plus the data-directory layout
// =============================================================================
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_reporting_currency() -> String {
    "EUR".to_string()
}

fn default_cache_max_age_days() -> i64 {
    7
}

fn default_tier1_threshold() -> f64 {
    1.0
}

fn default_min_resolution_rate() -> f64 {
    0.80
}

fn default_total_tolerance() -> f64 {
    0.01
}

fn default_true() -> bool {
    true
}

fn default_max_inflight_requests() -> usize {
    8
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Tunable engine settings, loaded from `config/engine_config.json` under the
/// data directory. Every field has a serde default so that older JSON files
/// missing new fields still deserialise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Currency every report is expressed in. Positions in any other
    /// currency are flagged, never converted.
    #[serde(default = "default_reporting_currency")]
    pub reporting_currency: String,

    /// Freshness window for automatically sourced holdings tables.
    #[serde(default = "default_cache_max_age_days")]
    pub cache_max_age_days: i64,

    /// Weight threshold (percent) above which a holding is worth external
    /// API budget during resolution.
    #[serde(default = "default_tier1_threshold")]
    pub tier1_threshold: f64,

    /// Target ISIN resolution rate per ETF before a quality issue is raised.
    #[serde(default = "default_min_resolution_rate")]
    pub min_resolution_rate: f64,

    /// Relative tolerance between aggregated and expected portfolio totals.
    #[serde(default = "default_total_tolerance")]
    pub total_tolerance: f64,

    /// Whether newly discovered data may be contributed back to the Hive.
    #[serde(default = "default_true")]
    pub contribute_to_hive: bool,

    /// Global cap on concurrent outbound HTTP requests.
    #[serde(default = "default_max_inflight_requests")]
    pub max_inflight_requests: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reporting_currency: default_reporting_currency(),
            cache_max_age_days: default_cache_max_age_days(),
            tier1_threshold: default_tier1_threshold(),
            min_resolution_rate: default_min_resolution_rate(),
            total_tolerance: default_total_tolerance(),
            contribute_to_hive: true,
            max_inflight_requests: default_max_inflight_requests(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`. Missing file is an
    /// error so the caller can fall back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;
        info!(path = %path.display(), "engine config loaded");
        Ok(config)
    }

    /// Persist the configuration with an atomic write (tmp file + rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise engine config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Data directory layout
// =============================================================================

/// Resolved filesystem layout under `PRISM_DATA_DIR`.
#[derive(Debug, Clone)]
pub struct DataDirs {
    pub root: PathBuf,
}

impl DataDirs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve from `PRISM_DATA_DIR`, defaulting to `./data`.
    pub fn from_env() -> Self {
        let root = std::env::var("PRISM_DATA_DIR").unwrap_or_else(|_| "data".to_string());
        Self::new(root)
    }

    pub fn holdings_cache_dir(&self) -> PathBuf {
        self.root.join("working").join("etf_holdings_cache")
    }

    pub fn community_dir(&self) -> PathBuf {
        self.root.join("community_data").join("etf_holdings")
    }

    pub fn manual_uploads_dir(&self) -> PathBuf {
        self.root.join("inputs").join("manual_holdings")
    }

    pub fn positions_file(&self) -> PathBuf {
        self.root.join("inputs").join("positions.json")
    }

    pub fn enrichment_cache_file(&self) -> PathBuf {
        self.root
            .join("working")
            .join("cache")
            .join("enrichment_cache.json")
    }

    pub fn negative_cache_file(&self) -> PathBuf {
        self.root
            .join("working")
            .join("cache")
            .join("negative_resolutions.json")
    }

    pub fn hive_sync_meta_file(&self) -> PathBuf {
        self.root
            .join("working")
            .join("cache")
            .join("hive_sync_meta.json")
    }

    pub fn telemetry_state_file(&self) -> PathBuf {
        self.root.join("working").join(".telemetry_state.json")
    }

    pub fn asset_universe_file(&self) -> PathBuf {
        self.root.join("config").join("asset_universe.csv")
    }

    pub fn manual_overrides_file(&self) -> PathBuf {
        self.root.join("config").join("manual_overrides.json")
    }

    pub fn provider_config_file(&self, provider: &str) -> PathBuf {
        self.root.join("config").join(format!("{provider}_config.json"))
    }

    pub fn engine_config_file(&self) -> PathBuf {
        self.root.join("config").join("engine_config.json")
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.root.join("outputs")
    }

    pub fn exposure_report_file(&self) -> PathBuf {
        self.outputs_dir().join("true_exposure.csv")
    }

    pub fn breakdown_report_file(&self) -> PathBuf {
        self.outputs_dir().join("holdings_breakdown.csv")
    }

    pub fn health_report_file(&self) -> PathBuf {
        self.outputs_dir().join("pipeline_health.json")
    }

    /// Create every writable directory. Bundled community data is read-only
    /// and intentionally not created here.
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            self.holdings_cache_dir(),
            self.manual_uploads_dir(),
            self.root.join("working").join("cache"),
            self.root.join("config"),
            self.root.join("inputs"),
            self.outputs_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Whether the sealed operating mode is active: provider adapters and
/// browser automation are disabled, leaving cache and manual tiers only.
pub fn sealed_mode() -> bool {
    std::env::var("PRISM_SEALED")
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.reporting_currency, "EUR");
        assert_eq!(cfg.cache_max_age_days, 7);
        assert!((cfg.tier1_threshold - 1.0).abs() < f64::EPSILON);
        assert!((cfg.min_resolution_rate - 0.80).abs() < f64::EPSILON);
        assert!((cfg.total_tolerance - 0.01).abs() < f64::EPSILON);
        assert!(cfg.contribute_to_hive);
        assert_eq!(cfg.max_inflight_requests, 8);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.reporting_currency, "EUR");
        assert_eq!(cfg.cache_max_age_days, 7);
        assert!(cfg.contribute_to_hive);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "tier1_threshold": 0.5, "contribute_to_hive": false }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert!((cfg.tier1_threshold - 0.5).abs() < f64::EPSILON);
        assert!(!cfg.contribute_to_hive);
        assert_eq!(cfg.cache_max_age_days, 7);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine_config.json");

        let mut cfg = EngineConfig::default();
        cfg.cache_max_age_days = 3;
        cfg.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.cache_max_age_days, 3);
        assert_eq!(loaded.reporting_currency, "EUR");
    }

    #[test]
    fn data_dirs_layout_under_root() {
        let dirs = DataDirs::new("/tmp/prism");
        assert!(dirs
            .holdings_cache_dir()
            .ends_with("working/etf_holdings_cache"));
        assert!(dirs.manual_uploads_dir().ends_with("inputs/manual_holdings"));
        assert!(dirs.exposure_report_file().ends_with("outputs/true_exposure.csv"));
        assert!(dirs.asset_universe_file().ends_with("config/asset_universe.csv"));
    }

    #[test]
    fn ensure_creates_writable_directories() {
        let dir = tempfile::tempdir().unwrap();
        let dirs = DataDirs::new(dir.path());
        dirs.ensure().unwrap();
        assert!(dirs.holdings_cache_dir().is_dir());
        assert!(dirs.manual_uploads_dir().is_dir());
        assert!(dirs.outputs_dir().is_dir());
        assert!(!dirs.community_dir().exists());
    }
}
