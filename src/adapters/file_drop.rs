// =============================================================================
// File-drop adapter — user-placed holdings files in the manual inputs dir
// =============================================================================
//
// Always registered first so a file the user dropped in wins over any
// network fetch for the same ISIN.
// =============================================================================

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::adapters::{AdapterError, AdapterResult, HoldingsAdapter};
use crate::holdings::normalizer::{normalize_table, read_csv_table};

pub struct FileDropAdapter {
    dir: PathBuf,
}

impl FileDropAdapter {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, isin: &str) -> Option<PathBuf> {
        for candidate in [format!("{isin}.csv"), format!("{}.csv", isin.to_lowercase())] {
            let path = self.dir.join(candidate);
            if path.exists() {
                return Some(path);
            }
        }
        None
    }
}

#[async_trait]
impl HoldingsAdapter for FileDropAdapter {
    fn provider(&self) -> &str {
        "file_drop"
    }

    fn handles(&self, isin: &str) -> bool {
        self.path_for(isin).is_some()
    }

    async fn fetch_holdings(&self, isin: &str) -> AdapterResult {
        let Some(path) = self.path_for(isin) else {
            return Ok(None);
        };

        debug!(isin, path = %path.display(), "reading dropped holdings file");
        let table = read_csv_table(&path).map_err(|e| AdapterError::Io(e.to_string()))?;
        let holdings = normalize_table(&table, "file_drop");
        if holdings.is_empty() {
            warn!(isin, "dropped file normalized to zero holdings");
            return Ok(None);
        }
        Ok(Some(holdings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_and_normalizes_dropped_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("IE00B4L5Y983.csv"),
            "name,weight,isin\nApple Inc.,0.10,US0378331005\nMicrosoft,0.05,US5949181045\n",
        )
        .unwrap();

        let adapter = FileDropAdapter::new(dir.path().to_path_buf());
        assert!(adapter.handles("IE00B4L5Y983"));
        assert!(!adapter.handles("LU0000000000"));

        let holdings = adapter.fetch_holdings("IE00B4L5Y983").await.unwrap().unwrap();
        assert_eq!(holdings.len(), 2);
        // Decimal weights were auto-scaled.
        assert_eq!(holdings[0].weight_percentage, 10.0);
    }

    #[tokio::test]
    async fn missing_file_is_none_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = FileDropAdapter::new(dir.path().to_path_buf());
        assert!(adapter.fetch_holdings("IE00B4L5Y983").await.unwrap().is_none());
    }
}
