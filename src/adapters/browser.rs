// =============================================================================
// Browser-automation adapter — drives a headless-browser subprocess
// =============================================================================
//
// The actual browser lives in a separate driver process (it navigates the
// product page, dismisses consent modals, clicks through to the download,
// and may intercept JSON holdings endpoints). This adapter owns the child's
// lifecycle and speaks line-delimited JSON over its stdio. A per-child mutex
// serializes commands so concurrent callers cannot desync the protocol.
//
// In sealed environments the driver binary is absent by policy and the
// adapter reports itself unavailable.
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::adapters::{AdapterError, AdapterResult, HoldingsAdapter};
use crate::holdings::normalizer::{normalize_table, read_csv_str};

/// How long a single driver command may run. Page navigation plus a file
/// download is slow; scraping beyond this is a lost cause.
const COMMAND_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);

struct DriverProcess {
    _child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    next_id: u64,
}

#[derive(Debug, Deserialize)]
struct DriverResponse {
    id: u64,
    status: String,
    #[serde(default)]
    csv: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

pub struct BrowserAdapter {
    provider: String,
    driver_bin: PathBuf,
    /// ISINs this provider's product pages cover, mapped to page URLs.
    products: HashMap<String, String>,
    process: Mutex<Option<DriverProcess>>,
    sealed: bool,
}

impl BrowserAdapter {
    pub fn new(
        provider: impl Into<String>,
        driver_bin: PathBuf,
        products: HashMap<String, String>,
        sealed: bool,
    ) -> Self {
        Self {
            provider: provider.into(),
            driver_bin,
            products,
            process: Mutex::new(None),
            sealed,
        }
    }

    async fn send_command(
        &self,
        guard: &mut Option<DriverProcess>,
        action: &str,
        isin: &str,
        url: &str,
    ) -> Result<DriverResponse, AdapterError> {
        if guard.is_none() {
            *guard = Some(self.spawn_driver()?);
        }
        let process = guard.as_mut().expect("driver just spawned");

        process.next_id += 1;
        let id = process.next_id;
        let command = serde_json::json!({
            "id": id,
            "action": action,
            "isin": isin,
            "url": url,
        });

        let mut line = serde_json::to_string(&command)
            .map_err(|e| AdapterError::Io(e.to_string()))?;
        line.push('\n');
        process
            .stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| AdapterError::Io(format!("driver stdin write failed: {e}")))?;
        process
            .stdin
            .flush()
            .await
            .map_err(|e| AdapterError::Io(e.to_string()))?;

        let mut response_line = String::new();
        let read = tokio::time::timeout(
            COMMAND_TIMEOUT,
            process.stdout.read_line(&mut response_line),
        )
        .await
        .map_err(|_| AdapterError::Timeout)?
        .map_err(|e| AdapterError::Io(format!("driver stdout read failed: {e}")))?;

        if read == 0 {
            // Driver died; drop the handle so the next call respawns it.
            *guard = None;
            return Err(AdapterError::Io("driver process closed its stdout".to_string()));
        }

        let response: DriverResponse = serde_json::from_str(response_line.trim())
            .map_err(|e| AdapterError::Parse(format!("bad driver response: {e}")))?;
        if response.id != id {
            *guard = None;
            return Err(AdapterError::Parse(format!(
                "driver response id mismatch: sent {id}, got {}",
                response.id
            )));
        }
        Ok(response)
    }

    fn spawn_driver(&self) -> Result<DriverProcess, AdapterError> {
        info!(provider = %self.provider, driver = %self.driver_bin.display(), "spawning browser driver");
        let mut child = Command::new(&self.driver_bin)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AdapterError::Io(format!("failed to spawn browser driver: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AdapterError::Io("driver has no stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .map(BufReader::new)
            .ok_or_else(|| AdapterError::Io("driver has no stdout".to_string()))?;

        Ok(DriverProcess {
            _child: child,
            stdin,
            stdout,
            next_id: 0,
        })
    }
}

#[async_trait]
impl HoldingsAdapter for BrowserAdapter {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn handles(&self, isin: &str) -> bool {
        !self.sealed && self.products.contains_key(isin)
    }

    fn download_url(&self, isin: &str) -> Option<String> {
        self.products.get(isin).cloned()
    }

    async fn fetch_holdings(&self, isin: &str) -> AdapterResult {
        if self.sealed {
            debug!(isin, "browser automation disabled in sealed mode");
            return Ok(None);
        }
        let Some(url) = self.products.get(isin) else {
            return Ok(None);
        };

        // One command in flight per child; the protocol has no framing
        // beyond line order.
        let mut guard = self.process.lock().await;
        let response = self
            .send_command(&mut *guard, "fetch_holdings", isin, url)
            .await?;

        if response.status != "success" {
            let message = response.error.unwrap_or_else(|| "driver reported failure".into());
            warn!(isin, provider = %self.provider, message, "browser fetch failed");
            return Err(AdapterError::Http(message));
        }

        let Some(csv) = response.csv else {
            return Ok(None);
        };
        let table = read_csv_str(&csv).map_err(|e| AdapterError::Parse(e.to_string()))?;
        let holdings = normalize_table(&table, &self.provider);
        if holdings.is_empty() {
            return Ok(None);
        }
        info!(isin, count = holdings.len(), "holdings captured via browser driver");
        Ok(Some(holdings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(sealed: bool) -> BrowserAdapter {
        let mut products = HashMap::new();
        products.insert(
            "LU0274208692".to_string(),
            "https://example.com/etf/LU0274208692".to_string(),
        );
        BrowserAdapter::new("xtrackers", PathBuf::from("/nonexistent/driver"), products, sealed)
    }

    #[test]
    fn sealed_mode_disables_handling() {
        assert!(adapter(false).handles("LU0274208692"));
        assert!(!adapter(true).handles("LU0274208692"));
    }

    #[test]
    fn download_url_comes_from_product_map() {
        assert_eq!(
            adapter(false).download_url("LU0274208692").as_deref(),
            Some("https://example.com/etf/LU0274208692")
        );
        assert!(adapter(false).download_url("IE00B4L5Y983").is_none());
    }

    #[tokio::test]
    async fn sealed_fetch_short_circuits_without_spawning() {
        let result = adapter(true).fetch_holdings("LU0274208692").await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn missing_driver_binary_is_io_error() {
        let result = adapter(false).fetch_holdings("LU0274208692").await;
        assert!(matches!(result, Err(AdapterError::Io(_))));
    }
}
