// =============================================================================
// Negative resolution cache — remembers tickers that resolved to nothing
// =============================================================================
//
// A ticker that survived the full cascade without an ISIN is recorded here
// so repeat lookups short-circuit before any network work. Entries expire
// after NEGATIVE_TTL; positive knowledge never lives in this cache.
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// How long a failed resolution is remembered.
pub const NEGATIVE_TTL: Duration = Duration::hours(6);

#[derive(Debug, Serialize, Deserialize)]
struct NegativeEntry {
    recorded_at: DateTime<Utc>,
}

pub struct NegativeCache {
    path: PathBuf,
    entries: RwLock<HashMap<String, NegativeEntry>>,
}

impl NegativeCache {
    /// Load from disk, dropping entries that expired while the engine was
    /// down.
    pub fn load(path: PathBuf) -> Self {
        let mut entries: HashMap<String, NegativeEntry> = HashMap::new();
        if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(content) => match serde_json::from_str::<HashMap<String, NegativeEntry>>(&content) {
                    Ok(raw) => {
                        let now = Utc::now();
                        entries = raw
                            .into_iter()
                            .filter(|(_, e)| now - e.recorded_at < NEGATIVE_TTL)
                            .collect();
                    }
                    Err(e) => warn!(error = %e, "failed to parse negative cache"),
                },
                Err(e) => warn!(error = %e, "failed to read negative cache"),
            }
        }
        debug!(entries = entries.len(), "negative cache loaded");
        Self {
            path,
            entries: RwLock::new(entries),
        }
    }

    fn key(ticker: &str) -> String {
        ticker.trim().to_uppercase()
    }

    /// Whether the ticker has a live negative entry.
    pub fn contains(&self, ticker: &str) -> bool {
        let key = Self::key(ticker);
        let entries = self.entries.read();
        match entries.get(&key) {
            Some(entry) => Utc::now() - entry.recorded_at < NEGATIVE_TTL,
            None => false,
        }
    }

    /// Record a failed resolution.
    pub fn record(&self, ticker: &str) {
        let key = Self::key(ticker);
        if key.is_empty() {
            return;
        }
        self.entries.write().insert(
            key,
            NegativeEntry {
                recorded_at: Utc::now(),
            },
        );
        self.persist();
    }

    /// Remove a ticker, e.g. after a manual override appears.
    pub fn forget(&self, ticker: &str) {
        if self.entries.write().remove(&Self::key(ticker)).is_some() {
            self.persist();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn persist(&self) {
        let snapshot = {
            let entries = self.entries.read();
            serde_json::to_string_pretty(&*entries)
        };
        match snapshot {
            Ok(json) => {
                if let Some(parent) = self.path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                let tmp = self.path.with_extension("json.tmp");
                if std::fs::write(&tmp, json)
                    .and_then(|_| std::fs::rename(&tmp, &self.path))
                    .is_err()
                {
                    warn!("failed to persist negative cache");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialise negative cache"),
        }
    }

    #[cfg(test)]
    fn backdate(&self, ticker: &str, age: Duration) {
        if let Some(entry) = self.entries.write().get_mut(&Self::key(ticker)) {
            entry.recorded_at = Utc::now() - age;
        }
    }
}
