// =============================================================================
// ISIN resolver — priority-ordered resolution cascade with provenance
// =============================================================================
//
// For each (ticker, name, weight, provider_isin?) the cascade stops at the
// first non-null result:
//
//   1. valid provider ISIN            conf 1.00  provider
//   2. manual override map            conf 0.85  manual
//   3. local universe by ticker       conf 0.95  local_cache / local_cache_ticker
//   4. local universe by name alias   conf 0.95  local_cache / local_cache_alias
//   5. legacy enrichment cache        conf 0.95  local_cache / cache
//   6. negative cache hit             conf 0.00  negative_cached (short-circuit)
//   7. Hive by ticker                 conf 0.90  hive / hive_ticker
//   8. Hive by name alias             conf 0.90  hive / hive_alias
//   9. external APIs (Tier-1 only):
//        Wikidata                     conf 0.80  api_wikidata
//        Finnhub                      conf 0.75  api_finnhub
//        YFinance                     conf 0.70  api_yfinance
//
// Rows at-or-below the tier-1 weight threshold that miss steps 1-8 are
// skipped rather than spending external API budget. Anything that exhausts
// the cascade lands in the negative cache.
// =============================================================================

pub mod external;
pub mod negative;
pub mod universe;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::hive::client::HiveClient;
use crate::hive::contributions::{Contribution, ContributionQueue};
use crate::isin::{is_valid_isin, normalize_isin};
use crate::types::ResolutionStatus;

use external::ExternalResolver;
use negative::NegativeCache;
use universe::AssetUniverse;

/// Minimum external-API confidence worth contributing back to the Hive.
const CONTRIBUTION_MIN_CONFIDENCE: f64 = 0.70;
/// Names shorter than this are too noisy to contribute as aliases.
const CONTRIBUTION_MIN_NAME_LEN: usize = 3;

// =============================================================================
// Resolution result
// =============================================================================

/// Outcome of one cascade pass. Invariant: `confidence == 0.0` exactly when
/// `isin` is `None`, and any malformed ISIN resets the result to unresolved.
#[derive(Debug, Clone, Serialize)]
pub struct ResolutionResult {
    pub isin: Option<String>,
    pub status: ResolutionStatus,
    pub source: String,
    pub confidence: f64,
    pub detail: String,
}

impl ResolutionResult {
    pub fn resolved(isin: &str, source: &str, confidence: f64, detail: &str) -> Self {
        match normalize_isin(isin) {
            Some(valid) => Self {
                isin: Some(valid),
                status: ResolutionStatus::Resolved,
                source: source.to_string(),
                confidence: confidence.clamp(0.0, 1.0),
                detail: detail.to_string(),
            },
            None => {
                warn!(isin, "invalid ISIN format in resolution result");
                Self::unresolved("isin_format_invalid")
            }
        }
    }

    pub fn unresolved(detail: &str) -> Self {
        Self {
            isin: None,
            status: ResolutionStatus::Unresolved,
            source: String::new(),
            confidence: 0.0,
            detail: detail.to_string(),
        }
    }

    pub fn skipped(detail: &str) -> Self {
        Self {
            isin: None,
            status: ResolutionStatus::Skipped,
            source: String::new(),
            confidence: 0.0,
            detail: detail.to_string(),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResolutionStats {
    pub total: u32,
    pub resolved: u32,
    pub unresolved: u32,
    pub skipped: u32,
    pub by_source: HashMap<String, u32>,
}

impl ResolutionStats {
    fn record(&mut self, result: &ResolutionResult) {
        self.total += 1;
        match result.status {
            ResolutionStatus::Resolved => self.resolved += 1,
            ResolutionStatus::Unresolved => self.unresolved += 1,
            ResolutionStatus::Skipped => self.skipped += 1,
        }
        *self.by_source.entry(result.detail.clone()).or_insert(0) += 1;
    }

    pub fn resolution_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.resolved as f64 / self.total as f64
        }
    }
}

#[derive(Debug, Clone)]
struct NewEntry {
    isin: String,
    ticker: String,
    name: String,
    source: String,
}

// =============================================================================
// Resolver
// =============================================================================

pub struct IsinResolver {
    universe: Arc<AssetUniverse>,
    overrides: HashMap<String, String>,
    enrichment_cache: HashMap<String, String>,
    negative: NegativeCache,
    hive: Arc<HiveClient>,
    external: Arc<ExternalResolver>,
    contributions: Arc<ContributionQueue>,
    tier1_threshold: f64,
    stats: Mutex<ResolutionStats>,
    newly_resolved: Mutex<Vec<NewEntry>>,
}

impl IsinResolver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        universe: Arc<AssetUniverse>,
        overrides_path: &Path,
        enrichment_cache_path: &Path,
        negative: NegativeCache,
        hive: Arc<HiveClient>,
        external: Arc<ExternalResolver>,
        contributions: Arc<ContributionQueue>,
        tier1_threshold: f64,
    ) -> Self {
        Self {
            universe,
            overrides: load_overrides(overrides_path),
            enrichment_cache: load_enrichment_cache(enrichment_cache_path),
            negative,
            hive,
            external,
            contributions,
            tier1_threshold,
            stats: Mutex::new(ResolutionStats::default()),
            newly_resolved: Mutex::new(Vec::new()),
        }
    }

    /// Resolve a single holding. The cascade is strictly ordered and never
    /// back-tracks within a call.
    pub async fn resolve(
        &self,
        ticker: &str,
        name: &str,
        provider_isin: Option<&str>,
        weight: f64,
    ) -> ResolutionResult {
        let ticker = ticker.trim();
        let name = name.trim();

        let result = self.run_cascade(ticker, name, provider_isin, weight).await;
        self.record(ticker, name, &result);
        result
    }

    async fn run_cascade(
        &self,
        ticker: &str,
        name: &str,
        provider_isin: Option<&str>,
        weight: f64,
    ) -> ResolutionResult {
        // 1. Provider-supplied ISIN.
        if let Some(candidate) = provider_isin {
            if is_valid_isin(candidate) {
                return ResolutionResult::resolved(candidate, "provider", 1.0, "provider");
            }
        }

        // 2. Manual override map.
        if let Some(isin) = self.overrides.get(&ticker.to_uppercase()) {
            return ResolutionResult::resolved(isin, "manual", 0.85, "manual");
        }

        // 3. Local universe by ticker.
        if let Some(isin) = self.universe.lookup_by_ticker(ticker) {
            return ResolutionResult::resolved(&isin, "local_cache", 0.95, "local_cache_ticker");
        }

        // 4. Local universe by name alias.
        if let Some(isin) = self.universe.lookup_by_alias(name) {
            return ResolutionResult::resolved(&isin, "local_cache", 0.95, "local_cache_alias");
        }

        // 5. Legacy enrichment cache.
        if let Some(isin) = self.enrichment_cache.get(&ticker.to_uppercase()) {
            return ResolutionResult::resolved(isin, "local_cache", 0.95, "cache");
        }

        // 6. Negative cache short-circuit: skip all network work.
        if !ticker.is_empty() && self.negative.contains(ticker) {
            debug!(ticker, "negative cache hit");
            return ResolutionResult::unresolved("negative_cached");
        }

        // 7. Hive by ticker.
        if !ticker.is_empty() {
            match self.hive.resolve_ticker(ticker, None).await {
                Ok(Some(isin)) => {
                    return ResolutionResult::resolved(&isin, "hive", 0.90, "hive_ticker")
                }
                Ok(None) => {}
                Err(e) => debug!(ticker, error = %e, "hive ticker lookup failed"),
            }
        }

        // 8. Hive by name alias.
        if !name.is_empty() {
            match self.hive.lookup_alias_isin(name).await {
                Ok(Some(isin)) => {
                    return ResolutionResult::resolved(&isin, "hive", 0.90, "hive_alias")
                }
                Ok(None) => {}
                Err(e) => debug!(name, error = %e, "hive alias lookup failed"),
            }
        }

        // Tier gate: below-threshold rows do not spend external API budget.
        if weight <= self.tier1_threshold {
            return ResolutionResult::skipped("tier2_skipped");
        }

        // 9. External API cascade, stopping at first success.
        match self.external.resolve_wikidata(name, ticker).await {
            Ok(Some(isin)) => {
                return ResolutionResult::resolved(&isin, "api_wikidata", 0.80, "api_wikidata")
            }
            Ok(None) => {}
            Err(e) => debug!(name, error = %e, "wikidata lookup failed"),
        }

        match self.external.resolve_finnhub(ticker).await {
            Ok(Some(isin)) => {
                return ResolutionResult::resolved(&isin, "api_finnhub", 0.75, "api_finnhub")
            }
            Ok(None) => {}
            Err(e) => debug!(ticker, error = %e, "finnhub lookup failed"),
        }

        match self.external.resolve_yfinance(ticker).await {
            Ok(Some(isin)) => {
                return ResolutionResult::resolved(&isin, "api_yfinance", 0.70, "api_yfinance")
            }
            Ok(None) => {}
            Err(e) => debug!(ticker, error = %e, "yfinance lookup failed"),
        }

        // Everything failed: remember the miss so repeat lookups short-circuit.
        if !ticker.is_empty() {
            self.negative.record(ticker);
        }
        ResolutionResult::unresolved("api_all_failed")
    }

    fn record(&self, ticker: &str, name: &str, result: &ResolutionResult) {
        self.stats.lock().record(result);

        if result.status != ResolutionStatus::Resolved {
            return;
        }
        let Some(isin) = result.isin.as_deref() else {
            return;
        };

        // Write-back: anything not already served from the local index is
        // queued for promotion into the universe.
        if result.source != "local_cache" {
            self.newly_resolved.lock().push(NewEntry {
                isin: isin.to_string(),
                ticker: ticker.to_string(),
                name: name.to_string(),
                source: result.source.clone(),
            });
        }

        // Community contribution for external-API finds.
        if result.source.starts_with("api_") && result.confidence >= CONTRIBUTION_MIN_CONFIDENCE {
            if name.len() >= CONTRIBUTION_MIN_NAME_LEN {
                self.contributions.submit(Contribution::Alias {
                    alias: name.to_string(),
                    isin: isin.to_string(),
                });
            }
            if !ticker.is_empty() {
                self.contributions.submit(Contribution::Listing {
                    ticker: ticker.to_string(),
                    isin: isin.to_string(),
                });
            }
        }
    }

    /// Batch-write newly resolved entries into the universe. Called on
    /// pipeline completion; returns the number of entries added.
    pub fn flush_to_universe(&self) -> usize {
        let entries: Vec<NewEntry> = std::mem::take(&mut *self.newly_resolved.lock());
        if entries.is_empty() {
            return 0;
        }

        let mut added = 0;
        for entry in entries {
            if self
                .universe
                .add_entry(&entry.isin, &entry.ticker, &entry.name, &entry.source)
            {
                added += 1;
            }
        }
        if added > 0 {
            info!(added, "flushed newly resolved entries to asset universe");
        }
        added
    }

    pub fn stats(&self) -> ResolutionStats {
        self.stats.lock().clone()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock() = ResolutionStats::default();
        self.external.budget.reset();
    }

    pub fn external_budget(&self) -> external::CallBudgetSnapshot {
        self.external.budget.snapshot()
    }
}

// =============================================================================
// Auxiliary loaders
// =============================================================================

/// User-edited override map: `{ "TICKER": "ISIN", ... }`.
fn load_overrides(path: &Path) -> HashMap<String, String> {
    if !path.exists() {
        return HashMap::new();
    }
    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<HashMap<String, String>>(&content) {
            Ok(raw) => {
                let overrides: HashMap<String, String> = raw
                    .into_iter()
                    .filter_map(|(ticker, isin)| {
                        normalize_isin(&isin).map(|valid| (ticker.to_uppercase(), valid))
                    })
                    .collect();
                info!(count = overrides.len(), "manual overrides loaded");
                overrides
            }
            Err(e) => {
                warn!(error = %e, "failed to parse manual overrides");
                HashMap::new()
            }
        },
        Err(_) => HashMap::new(),
    }
}

/// Legacy per-ticker enrichment cache. Composite and placeholder keys are
/// rejected; only entries carrying a valid ISIN survive.
fn load_enrichment_cache(path: &Path) -> HashMap<String, String> {
    if !path.exists() {
        return HashMap::new();
    }
    match std::fs::read_to_string(path) {
        Ok(content) => {
            match serde_json::from_str::<HashMap<String, serde_json::Value>>(&content) {
                Ok(raw) => {
                    let total = raw.len();
                    let cache: HashMap<String, String> = raw
                        .into_iter()
                        .filter(|(key, _)| {
                            !key.contains('|')
                                && !key.starts_with("FALLBACK")
                                && !key.starts_with("UNRESOLVED")
                        })
                        .filter_map(|(key, value)| {
                            value
                                .get("isin")
                                .and_then(|v| v.as_str())
                                .and_then(normalize_isin)
                                .map(|isin| (key.to_uppercase(), isin))
                        })
                        .collect();
                    info!(
                        valid = cache.len(),
                        filtered = total - cache.len(),
                        "enrichment cache loaded"
                    );
                    cache
                }
                Err(e) => {
                    warn!(error = %e, "failed to parse enrichment cache");
                    HashMap::new()
                }
            }
        }
        Err(_) => HashMap::new(),
    }
}
