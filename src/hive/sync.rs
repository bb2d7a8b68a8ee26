// =============================================================================
// Background identity sync — keeps the local universe near the Hive's state
// =============================================================================
//
// At service construction each table's last-sync timestamp is checked
// independently; any stale table triggers one detached sync task that pulls
// the full {assets, listings, aliases} domain and bulk-upserts it into the
// local universe. The pipeline never waits for this.
// =============================================================================

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::hive::client::HiveClient;
use crate::resolve::universe::AssetUniverse;

/// A table older than this is due for a refresh.
const SYNC_MAX_AGE: Duration = Duration::hours(24);

/// Per-table last-sync timestamps, persisted as JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncMeta {
    pub assets_synced_at: Option<DateTime<Utc>>,
    pub listings_synced_at: Option<DateTime<Utc>>,
    pub aliases_synced_at: Option<DateTime<Utc>>,
}

impl SyncMeta {
    pub fn load(path: &std::path::Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        std::fs::read_to_string(path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default()
    }

    pub fn save(&self, path: &std::path::Path) {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(self) {
            Ok(json) => {
                if std::fs::write(path, json).is_err() {
                    warn!("failed to persist hive sync metadata");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialise hive sync metadata"),
        }
    }

    fn table_is_stale(ts: Option<DateTime<Utc>>) -> bool {
        match ts {
            Some(ts) => Utc::now() - ts > SYNC_MAX_AGE,
            None => true,
        }
    }

    /// Stale when ANY table is due; tables are checked independently.
    pub fn is_stale(&self) -> bool {
        Self::table_is_stale(self.assets_synced_at)
            || Self::table_is_stale(self.listings_synced_at)
            || Self::table_is_stale(self.aliases_synced_at)
    }

    pub fn mark_all_synced(&mut self) {
        let now = Utc::now();
        self.assets_synced_at = Some(now);
        self.listings_synced_at = Some(now);
        self.aliases_synced_at = Some(now);
    }
}

/// Spawn the background sync task if the local index is stale. Returns
/// whether a sync was started.
pub fn spawn_if_stale(
    hive: Arc<HiveClient>,
    universe: Arc<AssetUniverse>,
    meta_path: PathBuf,
) -> bool {
    if !hive.is_configured() {
        debug!("hive not configured, skipping identity sync");
        return false;
    }

    let meta = SyncMeta::load(&meta_path);
    if !meta.is_stale() {
        debug!("local identity tables are fresh, no sync needed");
        return false;
    }

    info!("local identity tables stale, starting background hive sync");
    tokio::spawn(async move {
        match hive.sync_identity_domain().await {
            Ok(domain) => {
                let changed =
                    universe.bulk_upsert(&domain.assets, &domain.listings, &domain.aliases);
                let mut meta = SyncMeta::load(&meta_path);
                meta.mark_all_synced();
                meta.save(&meta_path);
                info!(
                    assets = domain.assets.len(),
                    listings = domain.listings.len(),
                    aliases = domain.aliases.len(),
                    changed,
                    "background hive sync complete"
                );
            }
            Err(e) => warn!(error = %e, "background hive sync failed"),
        }
    });
    true
}
