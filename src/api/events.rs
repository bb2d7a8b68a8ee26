// =============================================================================
// Engine events — SSE stream of progress and summary updates
// =============================================================================
//
// Events fan out through a broadcast channel; every connected client gets
// the same feed. A slow client that lags simply skips ahead (progress
// events are snapshots, not deltas).
// =============================================================================

use std::convert::Infallible;
use std::sync::Arc;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::app_state::AppState;
use crate::types::PipelinePhase;

/// Events pushed to SSE clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    Progress {
        /// 0..=100
        progress: u8,
        message: String,
        phase: PipelinePhase,
    },
    PipelineSummary {
        data: serde_json::Value,
    },
    Heartbeat,
    Connected {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
}

/// Build the SSE response for one client: a `connected` event followed by
/// the live broadcast feed, with protocol-level keep-alives.
pub fn event_stream(state: Arc<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.events.subscribe();
    let connected = EngineEvent::Connected {
        session_id: state.session_id.clone(),
    };

    let stream = futures_util::stream::unfold(
        (Some(connected), receiver),
        |(pending, mut receiver)| async move {
            if let Some(event) = pending {
                return Some((to_sse(&event), (None, receiver)));
            }
            loop {
                match receiver.recv().await {
                    Ok(event) => return Some((to_sse(&event), (None, receiver))),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "SSE client lagged, skipping ahead");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        },
    );

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn to_sse(event: &EngineEvent) -> Result<Event, Infallible> {
    let json = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Ok(Event::default().data(json))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_event_wire_shape() {
        let event = EngineEvent::Progress {
            progress: 42,
            message: "Decomposing 3 ETFs...".to_string(),
            phase: PipelinePhase::Decomposition,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["progress"], 42);
        assert_eq!(json["phase"], "decomposition");
    }

    #[test]
    fn connected_event_uses_camel_case_session_id() {
        let event = EngineEvent::Connected {
            session_id: "abc".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "connected");
        assert_eq!(json["sessionId"], "abc");
    }

    #[test]
    fn heartbeat_is_bare() {
        let json = serde_json::to_value(EngineEvent::Heartbeat).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "heartbeat" }));
    }
}
