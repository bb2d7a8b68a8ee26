// =============================================================================
// Holdings cache — tiered resolution for ETF constituent tables
// =============================================================================
//
// Tier order for a lookup:
//   1. Local cache   (instant, offline)       working/etf_holdings_cache/
//   2. Community     (bundled, read-only)     community_data/etf_holdings/
//   3. Adapters      (network, may fail)      via AdapterRegistry
//   4. Manual upload (user action)            inputs/manual_holdings/
//
// In sealed mode tier 3 is disabled and manual upload becomes the only path
// after a cache miss. Local entries expire after the configured freshness
// window; manual uploads are always fresh.
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::adapters::AdapterRegistry;
use crate::contracts::schemas::Holding;
use crate::holdings::normalizer::{normalize_table, read_csv_table, write_holdings_csv};
use crate::runtime_config::DataDirs;

/// Result of a full-cascade holdings lookup.
#[derive(Debug)]
pub enum CacheOutcome {
    Found { holdings: Vec<Holding>, source: String },
    /// Every tier missed; the user must supply the file themselves.
    ManualUploadRequired {
        isin: String,
        provider: Option<String>,
        download_url: Option<String>,
    },
}

/// Per-ETF cache metadata, persisted as `_metadata.json` next to the CSVs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntryMeta {
    pub name: String,
    pub cached_at: DateTime<Utc>,
    pub source: String,
    pub holdings_count: usize,
    pub weight_sum: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub copied_from: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub local_count: usize,
    pub local_fresh: usize,
    pub local_stale: usize,
    pub community_count: usize,
}

pub struct HoldingsCache {
    local_dir: PathBuf,
    community_dir: PathBuf,
    manual_dir: PathBuf,
    max_age: Duration,
    local_meta: RwLock<HashMap<String, CacheEntryMeta>>,
    community_meta: HashMap<String, CacheEntryMeta>,
}

impl HoldingsCache {
    pub fn new(dirs: &DataDirs, max_age_days: i64) -> Result<Self> {
        let local_dir = dirs.holdings_cache_dir();
        let manual_dir = dirs.manual_uploads_dir();
        std::fs::create_dir_all(&local_dir)
            .with_context(|| format!("failed to create {}", local_dir.display()))?;
        std::fs::create_dir_all(&manual_dir)
            .with_context(|| format!("failed to create {}", manual_dir.display()))?;

        let community_dir = dirs.community_dir();
        let local_meta = load_metadata(&local_dir.join("_metadata.json"));
        let community_meta = load_metadata(&community_dir.join("_metadata.json"));

        info!(
            local = local_meta.len(),
            community = community_meta.len(),
            "holdings cache initialised"
        );

        Ok(Self {
            local_dir,
            community_dir,
            manual_dir,
            max_age: Duration::days(max_age_days),
            local_meta: RwLock::new(local_meta),
            community_meta,
        })
    }

    // -------------------------------------------------------------------------
    // Full cascade
    // -------------------------------------------------------------------------

    /// Resolve holdings through all tiers. `sealed` disables the adapter
    /// tier entirely.
    pub async fn get_holdings(
        &self,
        isin: &str,
        registry: Option<&AdapterRegistry>,
        sealed: bool,
    ) -> CacheOutcome {
        // Tier 1 + 2
        if let Some((holdings, source)) = self.lookup_cached(isin) {
            return CacheOutcome::Found { holdings, source };
        }

        // Tier 3
        if !sealed {
            if let Some(registry) = registry {
                match registry.fetch_holdings(isin).await {
                    Ok(Some(holdings)) if !holdings.is_empty() => {
                        self.save_local(isin, &holdings, "adapter", None);
                        return CacheOutcome::Found {
                            holdings,
                            source: "adapter".to_string(),
                        };
                    }
                    Ok(_) => debug!(isin, "no adapter produced holdings"),
                    Err(e) => warn!(isin, error = %e, "adapter tier failed"),
                }
            }
        }

        // Tier 4
        if let Some(holdings) = self.lookup_manual(isin) {
            self.save_local(isin, &holdings, "manual_upload", None);
            return CacheOutcome::Found {
                holdings,
                source: "manual_upload".to_string(),
            };
        }

        let (provider, download_url) = registry
            .and_then(|r| r.provider_hint(isin))
            .map(|h| (Some(h.provider), h.download_url))
            .unwrap_or((None, None));

        CacheOutcome::ManualUploadRequired {
            isin: isin.to_string(),
            provider,
            download_url,
        }
    }

    // -------------------------------------------------------------------------
    // Individual tiers
    // -------------------------------------------------------------------------

    /// Tiers 1-2: fresh local file, else bundled community file (promoted
    /// into the local tier on hit).
    pub fn lookup_cached(&self, isin: &str) -> Option<(Vec<Holding>, String)> {
        if let Some(holdings) = self.from_local(isin) {
            debug!(isin, "found in local cache");
            return Some((holdings, "local_cache".to_string()));
        }
        if let Some(holdings) = self.from_community(isin) {
            debug!(isin, "found in community data");
            self.promote_community(isin, &holdings);
            return Some((holdings, "community".to_string()));
        }
        None
    }

    fn from_local(&self, isin: &str) -> Option<Vec<Holding>> {
        let meta = self.local_meta.read().get(isin).cloned()?;
        if !self.is_fresh(&meta) {
            debug!(isin, "local cache expired");
            return None;
        }
        self.read_table(&self.local_dir.join(format!("{isin}.csv")), isin)
    }

    fn from_community(&self, isin: &str) -> Option<Vec<Holding>> {
        let path = self.community_dir.join(format!("{isin}.csv"));
        if !path.exists() {
            return None;
        }
        self.read_table(&path, isin)
    }

    /// Tier 4: user-placed file named by ISIN. CSV parses natively; Excel
    /// files are flagged because no spreadsheet reader ships with the engine.
    pub fn lookup_manual(&self, isin: &str) -> Option<Vec<Holding>> {
        for candidate in [format!("{isin}.csv"), format!("{}.csv", isin.to_lowercase())] {
            let path = self.manual_dir.join(candidate);
            if path.exists() {
                debug!(isin, "found manual upload");
                return self.read_table(&path, isin);
            }
        }
        for ext in ["xlsx", "xls"] {
            let path = self.manual_dir.join(format!("{isin}.{ext}"));
            if path.exists() {
                warn!(
                    isin,
                    path = %path.display(),
                    "Excel manual upload found but only CSV can be parsed; export the sheet as {isin}.csv"
                );
            }
        }
        None
    }

    fn read_table(&self, path: &std::path::Path, isin: &str) -> Option<Vec<Holding>> {
        match read_csv_table(path) {
            Ok(table) => {
                let holdings = normalize_table(&table, isin);
                if holdings.is_empty() {
                    None
                } else {
                    Some(holdings)
                }
            }
            Err(e) => {
                warn!(isin, error = %e, "failed to read holdings file");
                None
            }
        }
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Write holdings into the local tier and record metadata. Writes are
    /// idempotent: re-running a pipeline overwrites with identical content.
    pub fn save_local(&self, isin: &str, holdings: &[Holding], source: &str, name: Option<&str>) {
        let path = self.local_dir.join(format!("{isin}.csv"));
        if let Err(e) = write_holdings_csv(&path, holdings) {
            warn!(isin, error = %e, "failed to save holdings to local cache");
            return;
        }

        let meta = CacheEntryMeta {
            name: name.unwrap_or(isin).to_string(),
            cached_at: Utc::now(),
            source: source.to_string(),
            holdings_count: holdings.len(),
            weight_sum: holdings.iter().map(|h| h.weight_percentage).sum(),
            copied_from: None,
        };
        self.local_meta.write().insert(isin.to_string(), meta);
        self.persist_metadata();

        info!(isin, count = holdings.len(), source, "saved to local cache");
    }

    fn promote_community(&self, isin: &str, holdings: &[Holding]) {
        let path = self.local_dir.join(format!("{isin}.csv"));
        if let Err(e) = write_holdings_csv(&path, holdings) {
            warn!(isin, error = %e, "failed to promote community data to local cache");
            return;
        }

        let mut meta = self
            .community_meta
            .get(isin)
            .cloned()
            .unwrap_or(CacheEntryMeta {
                name: isin.to_string(),
                cached_at: Utc::now(),
                source: "community".to_string(),
                holdings_count: holdings.len(),
                weight_sum: holdings.iter().map(|h| h.weight_percentage).sum(),
                copied_from: None,
            });
        meta.copied_from = Some("community".to_string());
        meta.cached_at = Utc::now();

        self.local_meta.write().insert(isin.to_string(), meta);
        self.persist_metadata();
        debug!(isin, "promoted community data to local cache");
    }

    fn persist_metadata(&self) {
        let path = self.local_dir.join("_metadata.json");
        let snapshot = self.local_meta.read().clone();
        match serde_json::to_string_pretty(&snapshot) {
            Ok(json) => {
                let tmp = path.with_extension("json.tmp");
                if std::fs::write(&tmp, json)
                    .and_then(|_| std::fs::rename(&tmp, &path))
                    .is_err()
                {
                    warn!("failed to persist cache metadata");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialise cache metadata"),
        }
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    fn is_fresh(&self, meta: &CacheEntryMeta) -> bool {
        // Manual uploads never expire; the user explicitly chose the data.
        if meta.source == "manual_upload" {
            return true;
        }
        Utc::now() - meta.cached_at < self.max_age
    }

    pub fn invalidate(&self, isin: &str) {
        self.local_meta.write().remove(isin);
        self.persist_metadata();
        let path = self.local_dir.join(format!("{isin}.csv"));
        if path.exists() {
            let _ = std::fs::remove_file(path);
        }
        info!(isin, "cache invalidated");
    }

    /// Drop every local-tier entry and file. Community data is bundled and
    /// untouched; manual uploads belong to the user and are kept too.
    pub fn clear_local_cache(&self) {
        self.local_meta.write().clear();
        self.persist_metadata();

        if let Ok(entries) = std::fs::read_dir(&self.local_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "csv") {
                    let _ = std::fs::remove_file(path);
                }
            }
        }
        info!("local cache cleared");
    }

    /// Whether any tier can serve this ISIN without network work: a fresh
    /// local entry, a bundled community file, or a manual upload.
    pub fn has_holdings(&self, isin: &str) -> bool {
        if let Some(meta) = self.local_meta.read().get(isin) {
            if self.is_fresh(meta) {
                return true;
            }
        }
        if self.community_dir.join(format!("{isin}.csv")).exists() {
            return true;
        }
        for ext in ["csv", "xlsx", "xls"] {
            if self.manual_dir.join(format!("{isin}.{ext}")).exists() {
                return true;
            }
        }
        false
    }

    /// All ISINs with holdings available offline: fresh local entries plus
    /// bundled community files, sorted and deduplicated.
    pub fn list_available_isins(&self) -> Vec<String> {
        let mut isins: Vec<String> = self
            .local_meta
            .read()
            .iter()
            .filter(|(_, meta)| self.is_fresh(meta))
            .map(|(isin, _)| isin.clone())
            .collect();

        if let Ok(entries) = std::fs::read_dir(&self.community_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "csv") {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        isins.push(stem.to_string());
                    }
                }
            }
        }

        isins.sort();
        isins.dedup();
        isins
    }

    pub fn stats(&self) -> CacheStats {
        let local = self.local_meta.read();
        let fresh = local.values().filter(|m| self.is_fresh(m)).count();
        CacheStats {
            local_count: local.len(),
            local_fresh: fresh,
            local_stale: local.len() - fresh,
            community_count: self.community_meta.len(),
        }
    }

    pub fn metadata(&self, isin: &str) -> Option<CacheEntryMeta> {
        self.local_meta.read().get(isin).cloned()
    }
}

fn load_metadata(path: &std::path::Path) -> HashMap<String, CacheEntryMeta> {
    if !path.exists() {
        return HashMap::new();
    }
    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<HashMap<String, serde_json::Value>>(&content) {
            Ok(raw) => raw
                .into_iter()
                .filter(|(k, _)| !k.starts_with('_'))
                .filter_map(|(k, v)| serde_json::from_value(v).ok().map(|m| (k, m)))
                .collect(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to parse cache metadata");
                HashMap::new()
            }
        },
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read cache metadata");
            HashMap::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, DataDirs) {
        let dir = tempfile::tempdir().unwrap();
        let dirs = DataDirs::new(dir.path());
        dirs.ensure().unwrap();
        (dir, dirs)
    }

    fn sample_holdings() -> Vec<Holding> {
        let mut apple = Holding::new("AAPL", "Apple Inc.", 10.0);
        apple.isin = Some("US0378331005".into());
        vec![apple, Holding::new("MSFT", "Microsoft Corp", 5.0)]
    }

    #[test]
    fn save_then_lookup_hits_local_tier() {
        let (_tmp, dirs) = setup();
        let cache = HoldingsCache::new(&dirs, 7).unwrap();

        cache.save_local("IE00B4L5Y983", &sample_holdings(), "adapter", Some("Core World"));

        let (holdings, source) = cache.lookup_cached("IE00B4L5Y983").unwrap();
        assert_eq!(source, "local_cache");
        assert_eq!(holdings.len(), 2);
        assert_eq!(holdings[0].name, "Apple Inc.");

        let meta = cache.metadata("IE00B4L5Y983").unwrap();
        assert_eq!(meta.source, "adapter");
        assert_eq!(meta.holdings_count, 2);
        assert!((meta.weight_sum - 15.0).abs() < 1e-9);
    }

    #[test]
    fn metadata_survives_reload() {
        let (_tmp, dirs) = setup();
        {
            let cache = HoldingsCache::new(&dirs, 7).unwrap();
            cache.save_local("IE00B4L5Y983", &sample_holdings(), "adapter", None);
        }
        let cache = HoldingsCache::new(&dirs, 7).unwrap();
        assert!(cache.lookup_cached("IE00B4L5Y983").is_some());
    }

    #[test]
    fn expired_local_entry_misses() {
        let (_tmp, dirs) = setup();
        let cache = HoldingsCache::new(&dirs, 7).unwrap();
        cache.save_local("IE00B4L5Y983", &sample_holdings(), "adapter", None);

        // Backdate the entry past the freshness window.
        {
            let mut meta = cache.local_meta.write();
            meta.get_mut("IE00B4L5Y983").unwrap().cached_at = Utc::now() - Duration::days(8);
        }
        assert!(cache.lookup_cached("IE00B4L5Y983").is_none());
    }

    #[test]
    fn manual_upload_never_expires() {
        let (_tmp, dirs) = setup();
        let cache = HoldingsCache::new(&dirs, 7).unwrap();
        cache.save_local("IE00B4L5Y983", &sample_holdings(), "manual_upload", None);

        {
            let mut meta = cache.local_meta.write();
            meta.get_mut("IE00B4L5Y983").unwrap().cached_at = Utc::now() - Duration::days(400);
        }
        assert!(cache.lookup_cached("IE00B4L5Y983").is_some());
    }

    #[test]
    fn community_hit_promotes_to_local() {
        let (_tmp, dirs) = setup();
        std::fs::create_dir_all(dirs.community_dir()).unwrap();
        std::fs::write(
            dirs.community_dir().join("IE00B4L5Y983.csv"),
            "name,weight,isin\nApple Inc.,10.0,US0378331005\n",
        )
        .unwrap();

        let cache = HoldingsCache::new(&dirs, 7).unwrap();
        let (_, source) = cache.lookup_cached("IE00B4L5Y983").unwrap();
        assert_eq!(source, "community");

        // The promoted copy now serves from the local tier.
        let meta = cache.metadata("IE00B4L5Y983").unwrap();
        assert_eq!(meta.copied_from.as_deref(), Some("community"));
        let (_, source) = cache.lookup_cached("IE00B4L5Y983").unwrap();
        assert_eq!(source, "local_cache");
    }

    #[tokio::test]
    async fn all_tiers_missing_requires_manual_upload() {
        let (_tmp, dirs) = setup();
        let cache = HoldingsCache::new(&dirs, 7).unwrap();

        match cache.get_holdings("IE00B4L5Y983", None, false).await {
            CacheOutcome::ManualUploadRequired { isin, .. } => {
                assert_eq!(isin, "IE00B4L5Y983");
            }
            CacheOutcome::Found { .. } => panic!("expected manual upload requirement"),
        }
    }

    #[tokio::test]
    async fn manual_tier_is_used_and_cached() {
        let (_tmp, dirs) = setup();
        let cache = HoldingsCache::new(&dirs, 7).unwrap();

        std::fs::write(
            dirs.manual_uploads_dir().join("IE00B4L5Y983.csv"),
            "name,weight\nApple Inc.,10.0\n",
        )
        .unwrap();

        match cache.get_holdings("IE00B4L5Y983", None, true).await {
            CacheOutcome::Found { holdings, source } => {
                assert_eq!(source, "manual_upload");
                assert_eq!(holdings.len(), 1);
            }
            CacheOutcome::ManualUploadRequired { .. } => panic!("manual tier should hit"),
        }
        assert_eq!(cache.metadata("IE00B4L5Y983").unwrap().source, "manual_upload");
    }

    #[test]
    fn invalidate_removes_entry_and_file() {
        let (_tmp, dirs) = setup();
        let cache = HoldingsCache::new(&dirs, 7).unwrap();
        cache.save_local("IE00B4L5Y983", &sample_holdings(), "adapter", None);
        assert_eq!(cache.stats().local_count, 1);

        cache.invalidate("IE00B4L5Y983");
        assert_eq!(cache.stats().local_count, 0);
        assert!(cache.lookup_cached("IE00B4L5Y983").is_none());
    }

    #[test]
    fn clear_local_cache_keeps_community_and_manual_data() {
        let (_tmp, dirs) = setup();
        std::fs::create_dir_all(dirs.community_dir()).unwrap();
        std::fs::write(
            dirs.community_dir().join("IE00B5BMR087.csv"),
            "name,weight\nApple Inc.,10.0\n",
        )
        .unwrap();
        std::fs::write(
            dirs.manual_uploads_dir().join("LU0274208692.csv"),
            "name,weight\nSAP SE,10.0\n",
        )
        .unwrap();

        let cache = HoldingsCache::new(&dirs, 7).unwrap();
        cache.save_local("IE00B4L5Y983", &sample_holdings(), "adapter", None);
        cache.clear_local_cache();

        assert_eq!(cache.stats().local_count, 0);
        assert!(cache.lookup_cached("IE00B4L5Y983").is_none());
        // Community tier still serves, manual upload file survives.
        assert!(cache.lookup_cached("IE00B5BMR087").is_some());
        assert!(dirs.manual_uploads_dir().join("LU0274208692.csv").exists());
    }

    #[test]
    fn has_holdings_checks_every_tier() {
        let (_tmp, dirs) = setup();
        std::fs::create_dir_all(dirs.community_dir()).unwrap();
        std::fs::write(
            dirs.community_dir().join("IE00B5BMR087.csv"),
            "name,weight\nApple Inc.,10.0\n",
        )
        .unwrap();
        std::fs::write(
            dirs.manual_uploads_dir().join("LU0274208692.xlsx"),
            "not really a spreadsheet",
        )
        .unwrap();

        let cache = HoldingsCache::new(&dirs, 7).unwrap();
        cache.save_local("IE00B4L5Y983", &sample_holdings(), "adapter", None);

        assert!(cache.has_holdings("IE00B4L5Y983"));
        assert!(cache.has_holdings("IE00B5BMR087"));
        assert!(cache.has_holdings("LU0274208692"));
        assert!(!cache.has_holdings("DE0007164600"));

        // An expired local entry no longer counts.
        {
            let mut meta = cache.local_meta.write();
            meta.get_mut("IE00B4L5Y983").unwrap().cached_at = Utc::now() - Duration::days(8);
        }
        assert!(!cache.has_holdings("IE00B4L5Y983"));
    }

    #[test]
    fn list_available_isins_merges_fresh_local_and_community() {
        let (_tmp, dirs) = setup();
        std::fs::create_dir_all(dirs.community_dir()).unwrap();
        std::fs::write(
            dirs.community_dir().join("IE00B5BMR087.csv"),
            "name,weight\nApple Inc.,10.0\n",
        )
        .unwrap();
        // Overlaps with a local entry: must not appear twice.
        std::fs::write(
            dirs.community_dir().join("IE00B4L5Y983.csv"),
            "name,weight\nApple Inc.,10.0\n",
        )
        .unwrap();

        let cache = HoldingsCache::new(&dirs, 7).unwrap();
        cache.save_local("IE00B4L5Y983", &sample_holdings(), "adapter", None);
        cache.save_local("LU0274208692", &sample_holdings(), "adapter", None);

        // Stale local entries drop out of the listing.
        {
            let mut meta = cache.local_meta.write();
            meta.get_mut("LU0274208692").unwrap().cached_at = Utc::now() - Duration::days(8);
        }

        assert_eq!(
            cache.list_available_isins(),
            vec!["IE00B4L5Y983".to_string(), "IE00B5BMR087".to_string()]
        );
    }
}
