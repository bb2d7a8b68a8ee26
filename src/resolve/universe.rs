// =============================================================================
// Asset universe — the local alias/ticker -> ISIN index (asset_universe.csv)
// =============================================================================
//
// Columns: ISIN, TR_Ticker, Yahoo_Ticker, Name, Aliases (pipe-separated),
// Provider, Asset_Class, Source, Added_Date, Last_Verified.
//
// Writes are append-only with ISIN dedup: an ISIN once resolved is never
// deleted, only overwritten by equal-or-better data, which keeps the index
// monotonically more complete across runs.
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::isin::is_valid_isin;

#[derive(Debug, Clone)]
pub struct UniverseRow {
    pub isin: String,
    pub tr_ticker: String,
    pub yahoo_ticker: String,
    pub name: String,
    pub aliases: Vec<String>,
    pub provider: String,
    pub asset_class: String,
    pub source: String,
    pub added_date: String,
    pub last_verified: String,
}

#[derive(Default)]
struct Inner {
    rows: Vec<UniverseRow>,
    ticker_index: HashMap<String, String>,
    alias_index: HashMap<String, String>,
}

pub struct AssetUniverse {
    path: PathBuf,
    inner: RwLock<Inner>,
}

impl AssetUniverse {
    /// Load from CSV. A missing file yields an empty universe, not an error.
    pub fn load(path: PathBuf) -> Self {
        let mut inner = Inner::default();

        if path.exists() {
            match Self::read_rows(&path) {
                Ok(rows) => {
                    inner.rows = rows;
                    Self::rebuild_indexes(&mut inner);
                    info!(
                        entries = inner.rows.len(),
                        tickers = inner.ticker_index.len(),
                        aliases = inner.alias_index.len(),
                        "asset universe loaded"
                    );
                }
                Err(e) => warn!(path = %path.display(), error = %e, "failed to load asset universe"),
            }
        } else {
            warn!(path = %path.display(), "asset universe not found, starting empty");
        }

        Self {
            path,
            inner: RwLock::new(inner),
        }
    }

    fn read_rows(path: &std::path::Path) -> Result<Vec<UniverseRow>> {
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("failed to open {}", path.display()))?;

        let headers: Vec<String> = reader
            .headers()
            .context("missing universe headers")?
            .iter()
            .map(|h| h.to_string())
            .collect();
        let col = |name: &str| headers.iter().position(|h| h == name);

        let isin_col = col("ISIN").context("universe missing ISIN column")?;
        let tr_col = col("TR_Ticker");
        let yahoo_col = col("Yahoo_Ticker");
        let name_col = col("Name");
        let aliases_col = col("Aliases");
        let provider_col = col("Provider");
        let class_col = col("Asset_Class");
        let source_col = col("Source");
        let added_col = col("Added_Date");
        let verified_col = col("Last_Verified");

        let get = |record: &csv::StringRecord, idx: Option<usize>| -> String {
            idx.and_then(|i| record.get(i)).unwrap_or("").trim().to_string()
        };

        let mut rows = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for record in reader.records() {
            let record = record.context("bad universe record")?;
            let isin = record.get(isin_col).unwrap_or("").trim().to_uppercase();
            if !is_valid_isin(&isin) {
                continue;
            }
            // Duplicate ISINs keep the first occurrence only.
            if !seen.insert(isin.clone()) {
                warn!(isin, "duplicate ISIN in asset universe, keeping first");
                continue;
            }
            rows.push(UniverseRow {
                isin,
                tr_ticker: get(&record, tr_col),
                yahoo_ticker: get(&record, yahoo_col),
                name: get(&record, name_col),
                aliases: get(&record, aliases_col)
                    .split('|')
                    .map(|a| a.trim().to_string())
                    .filter(|a| !a.is_empty())
                    .collect(),
                provider: get(&record, provider_col),
                asset_class: get(&record, class_col),
                source: get(&record, source_col),
                added_date: get(&record, added_col),
                last_verified: get(&record, verified_col),
            });
        }
        Ok(rows)
    }

    fn rebuild_indexes(inner: &mut Inner) {
        inner.ticker_index.clear();
        inner.alias_index.clear();
        for row in &inner.rows {
            for ticker in [&row.yahoo_ticker, &row.tr_ticker] {
                if !ticker.is_empty() {
                    inner
                        .ticker_index
                        .entry(ticker.to_uppercase())
                        .or_insert_with(|| row.isin.clone());
                }
            }
            for alias in &row.aliases {
                inner
                    .alias_index
                    .entry(alias.to_uppercase())
                    .or_insert_with(|| row.isin.clone());
            }
        }
    }

    // -------------------------------------------------------------------------
    // Lookups
    // -------------------------------------------------------------------------

    pub fn lookup_by_ticker(&self, ticker: &str) -> Option<String> {
        let key = ticker.trim().to_uppercase();
        if key.is_empty() {
            return None;
        }
        self.inner.read().ticker_index.get(&key).cloned()
    }

    pub fn lookup_by_alias(&self, alias: &str) -> Option<String> {
        let key = alias.trim().to_uppercase();
        if key.is_empty() {
            return None;
        }
        self.inner.read().alias_index.get(&key).cloned()
    }

    /// Name and asset class for a known ISIN, used as the offline
    /// enrichment tier.
    pub fn get_by_isin(&self, isin: &str) -> Option<(String, String)> {
        self.inner
            .read()
            .rows
            .iter()
            .find(|r| r.isin == isin)
            .map(|r| (r.name.clone(), r.asset_class.clone()))
    }

    pub fn len(&self) -> usize {
        self.inner.read().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Add a newly resolved entry. Returns false when the ISIN is invalid or
    /// already present (resolved ISINs are never overwritten downward).
    pub fn add_entry(&self, isin: &str, ticker: &str, name: &str, source: &str) -> bool {
        if !is_valid_isin(isin) {
            return false;
        }

        let mut inner = self.inner.write();
        if inner.rows.iter().any(|r| r.isin == isin) {
            return false;
        }

        inner.rows.push(UniverseRow {
            isin: isin.to_string(),
            tr_ticker: String::new(),
            yahoo_ticker: ticker.to_string(),
            name: name.to_string(),
            aliases: Vec::new(),
            provider: String::new(),
            asset_class: "Stock".to_string(),
            source: source.to_string(),
            added_date: Utc::now().format("%Y-%m-%d").to_string(),
            last_verified: String::new(),
        });

        if !ticker.is_empty() {
            let isin_owned = isin.to_string();
            inner.ticker_index.insert(ticker.to_uppercase(), isin_owned);
        }

        if let Err(e) = Self::write_rows(&self.path, &inner.rows) {
            warn!(error = %e, "failed to persist asset universe");
        }
        info!(isin, ticker, source, "added to asset universe");
        true
    }

    /// Bulk upsert from a Hive identity-domain sync. Existing rows gain
    /// missing tickers/aliases; unknown ISINs become new rows.
    pub fn bulk_upsert(
        &self,
        assets: &[crate::hive::client::AssetEntry],
        listings: &[crate::hive::client::ListingRow],
        aliases: &[crate::hive::client::AliasRow],
    ) -> usize {
        let mut inner = self.inner.write();
        let mut changed = 0usize;

        for asset in assets {
            if !is_valid_isin(&asset.isin) {
                continue;
            }
            if !inner.rows.iter().any(|r| r.isin == asset.isin) {
                inner.rows.push(UniverseRow {
                    isin: asset.isin.clone(),
                    tr_ticker: String::new(),
                    yahoo_ticker: String::new(),
                    name: asset.name.clone(),
                    aliases: Vec::new(),
                    provider: String::new(),
                    asset_class: asset.asset_class.clone(),
                    source: "hive_sync".to_string(),
                    added_date: Utc::now().format("%Y-%m-%d").to_string(),
                    last_verified: Utc::now().format("%Y-%m-%d").to_string(),
                });
                changed += 1;
            }
        }

        for listing in listings {
            if let Some(row) = inner.rows.iter_mut().find(|r| r.isin == listing.isin) {
                if row.yahoo_ticker.is_empty() && !listing.ticker.is_empty() {
                    row.yahoo_ticker = listing.ticker.clone();
                    changed += 1;
                }
            }
        }

        for alias in aliases {
            if let Some(row) = inner.rows.iter_mut().find(|r| r.isin == alias.isin) {
                let exists = row
                    .aliases
                    .iter()
                    .any(|a| a.eq_ignore_ascii_case(&alias.alias));
                if !exists && !alias.alias.is_empty() {
                    row.aliases.push(alias.alias.clone());
                    changed += 1;
                }
            }
        }

        if changed > 0 {
            Self::rebuild_indexes(&mut inner);
            if let Err(e) = Self::write_rows(&self.path, &inner.rows) {
                warn!(error = %e, "failed to persist asset universe after sync");
            }
            info!(changed, total = inner.rows.len(), "asset universe updated from hive");
        }
        changed
    }

    fn write_rows(path: &std::path::Path, rows: &[UniverseRow]) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("csv.tmp");
        {
            let mut writer = csv::Writer::from_path(&tmp)
                .with_context(|| format!("failed to create {}", tmp.display()))?;
            writer.write_record([
                "ISIN",
                "TR_Ticker",
                "Yahoo_Ticker",
                "Name",
                "Aliases",
                "Provider",
                "Asset_Class",
                "Source",
                "Added_Date",
                "Last_Verified",
            ])?;
            for row in rows {
                let aliases = row.aliases.join("|");
                writer.write_record([
                    row.isin.as_str(),
                    row.tr_ticker.as_str(),
                    row.yahoo_ticker.as_str(),
                    row.name.as_str(),
                    aliases.as_str(),
                    row.provider.as_str(),
                    row.asset_class.as_str(),
                    row.source.as_str(),
                    row.added_date.as_str(),
                    row.last_verified.as_str(),
                ])?;
            }
            writer.flush()?;
        }
        std::fs::rename(&tmp, path).context("failed to rename universe tmp file")?;
        Ok(())
    }
}
