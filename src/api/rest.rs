// =============================================================================
// Echo-bridge HTTP server — Axum 0.7
// =============================================================================
//
// The desktop shell talks to the engine either over stdio or over this
// bridge: `POST /command` carries the same envelope as stdin, and
// `GET /events` streams progress as SSE. All endpoints except `/` and
// `/health` require the shared token.
//
// CORS is configured permissively for development; tighten
// `allowed_origins` in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::{validate_headers, validate_token};
use crate::api::commands::{dispatch, CommandEnvelope};
use crate::api::events::event_stream;
use crate::app_state::AppState;

/// Build the echo-bridge router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/", get(root))
        .route("/health", get(health))
        // ── Token-gated ─────────────────────────────────────────────
        .route("/command", post(command))
        .route("/events", get(events))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

async fn root(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "online",
        "mode": "Echo-Bridge",
        "version": state.version,
    }))
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": state.version,
        "sessionId": state.session_id,
    }))
}

async fn command(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    if !validate_headers(&headers) {
        return Json(json!({
            "id": 0,
            "status": "error",
            "error": { "code": "UNAUTHORIZED", "message": "Invalid token" },
        }));
    }

    let envelope: CommandEnvelope = match serde_json::from_str(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            return Json(json!({
                "id": 0,
                "status": "error",
                "error": { "code": "INVALID_JSON", "message": format!("Failed to parse command: {e}") },
            }));
        }
    };

    // Health polls are noisy; only log real commands.
    if envelope.command != "get_health" {
        info!(command = %envelope.command, "echo-bridge command");
    }
    Json(dispatch(&state, envelope).await)
}

#[derive(Deserialize)]
struct EventsQuery {
    token: Option<String>,
}

/// SSE endpoint. EventSource cannot set headers, so the token travels as a
/// query parameter here.
async fn events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<EventsQuery>,
) -> axum::response::Response {
    let authorized = match query.token {
        Some(token) => validate_token(&token),
        None => validate_headers(&headers),
    };
    if !authorized {
        warn!("SSE connection rejected: invalid token");
        return (axum::http::StatusCode::FORBIDDEN, "Invalid or missing token").into_response();
    }

    info!("SSE client connected");
    event_stream(state).into_response()
}
