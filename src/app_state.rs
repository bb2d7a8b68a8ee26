// =============================================================================
// Central application state — Prism analytics engine
// =============================================================================
//
// Ties the long-lived services together: the pipeline with its shared
// resolver and caches, the engine configuration, the last run result, and
// the SSE event broadcast. Everything is shared across tasks via
// `Arc<AppState>`.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::api::events::EngineEvent;
use crate::errors::PipelineResult;
use crate::holdings::HoldingsCache;
use crate::pipeline::{Pipeline, ProgressSink};
use crate::runtime_config::{DataDirs, EngineConfig};
use crate::types::PipelinePhase;

/// Broadcast buffer: progress events are snapshots, lagging clients can
/// safely skip.
const EVENT_CHANNEL_CAPACITY: usize = 64;

pub struct AppState {
    pub dirs: DataDirs,
    pub config: RwLock<EngineConfig>,
    pub pipeline: Arc<Pipeline>,
    pub holdings_cache: Arc<HoldingsCache>,
    pub events: broadcast::Sender<EngineEvent>,
    pub last_result: RwLock<Option<PipelineResult>>,
    pipeline_running: AtomicBool,
    pub start_time: std::time::Instant,
    pub session_id: String,
    pub version: &'static str,
}

impl AppState {
    pub fn new(
        dirs: DataDirs,
        config: EngineConfig,
        pipeline: Arc<Pipeline>,
        holdings_cache: Arc<HoldingsCache>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            dirs,
            config: RwLock::new(config),
            pipeline,
            holdings_cache,
            events,
            last_result: RwLock::new(None),
            pipeline_running: AtomicBool::new(false),
            start_time: std::time::Instant::now(),
            session_id: uuid::Uuid::new_v4().to_string(),
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    pub fn is_pipeline_running(&self) -> bool {
        self.pipeline_running.load(Ordering::SeqCst)
    }

    /// Broadcast an event; an error just means nobody is listening.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    /// Run the pipeline, streaming progress over the event channel.
    /// Rejects concurrent runs: returns None when one is already active.
    pub async fn run_pipeline(self: Arc<Self>) -> Option<PipelineResult> {
        if self
            .pipeline_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("pipeline run rejected: another run is active");
            return None;
        }

        let event_state = Arc::clone(&self);
        let sink: ProgressSink = Arc::new(move |phase: PipelinePhase, fraction: f64, message: &str| {
            event_state.emit(EngineEvent::Progress {
                progress: (fraction.clamp(0.0, 1.0) * 100.0).round() as u8,
                message: message.to_string(),
                phase,
            });
        });

        info!("pipeline run starting");
        let artifacts = self.pipeline.run(sink).await;
        self.emit(EngineEvent::PipelineSummary {
            data: artifacts.summary,
        });

        *self.last_result.write() = Some(artifacts.result.clone());
        self.pipeline_running.store(false, Ordering::SeqCst);
        Some(artifacts.result)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
