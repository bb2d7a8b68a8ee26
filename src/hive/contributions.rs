// =============================================================================
// Contribution queue — fire-and-forget sharing of discoveries with the Hive
// =============================================================================
//
// Pipeline phases enqueue; a detached worker drains. The queue is bounded
// and drops the oldest entry on overflow: the remote service is
// authoritative, local contributions are opportunistic, and losing one is
// cheaper than back-pressuring the pipeline. Worker failures are logged and
// never surfaced.
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::hive::client::{AssetEntry, HiveClient};

const QUEUE_CAPACITY: usize = 256;

/// One unit of community contribution work.
#[derive(Debug, Clone)]
pub enum Contribution {
    Asset(AssetEntry),
    Alias { alias: String, isin: String },
    Listing { ticker: String, isin: String },
    EtfHoldings {
        etf_isin: String,
        holdings: Vec<crate::contracts::schemas::Holding>,
    },
}

struct QueueInner {
    items: VecDeque<Contribution>,
    dropped: u64,
}

/// Bounded contribution queue with a detached drain worker.
pub struct ContributionQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    enabled: bool,
}

impl ContributionQueue {
    pub fn new(enabled: bool) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                dropped: 0,
            }),
            notify: Notify::new(),
            enabled,
        })
    }

    /// Enqueue a contribution. Silently drops when contributions are
    /// disabled, and drops the OLDEST queued item on overflow.
    pub fn submit(&self, contribution: Contribution) {
        if !self.enabled {
            return;
        }
        {
            let mut inner = self.inner.lock();
            if inner.items.len() >= QUEUE_CAPACITY {
                inner.items.pop_front();
                inner.dropped += 1;
            }
            inner.items.push_back(contribution);
        }
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }

    fn pop(&self) -> Option<Contribution> {
        self.inner.lock().items.pop_front()
    }

    /// Spawn the detached worker that drains the queue against the Hive.
    pub fn spawn_worker(self: Arc<Self>, hive: Arc<HiveClient>) {
        let queue = self;
        tokio::spawn(async move {
            loop {
                while let Some(contribution) = queue.pop() {
                    if let Err(e) = deliver(&hive, contribution).await {
                        // Best-effort by contract: log and move on.
                        debug!(error = %e, "hive contribution failed");
                    }
                }
                queue.notify.notified().await;
            }
        });
    }
}

async fn deliver(hive: &HiveClient, contribution: Contribution) -> anyhow::Result<()> {
    if !hive.is_configured() {
        return Ok(());
    }
    match contribution {
        Contribution::Asset(asset) => {
            hive.batch_contribute(std::slice::from_ref(&asset)).await?;
        }
        Contribution::Alias { alias, isin } => {
            hive.contribute_alias(&alias, &isin).await?;
        }
        Contribution::Listing { ticker, isin } => {
            hive.contribute_listing(&ticker, &isin).await?;
        }
        Contribution::EtfHoldings { etf_isin, holdings } => {
            hive.contribute_etf_holdings(&etf_isin, &holdings).await?;
        }
    }
    Ok(())
}

impl std::fmt::Debug for ContributionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ContributionQueue")
            .field("queued", &inner.items.len())
            .field("dropped", &inner.dropped)
            .field("enabled", &self.enabled)
            .finish()
    }
}
