// =============================================================================
// Command dispatch — shared by the stdio loop and the echo-bridge HTTP API
// =============================================================================
//
// Envelope in:  { "id": ..., "command": "...", "payload": { ... } }
// Envelope out: { "id": ..., "status": "success"|"error",
//                 "data"?: ..., "error"?: { "code", "message" } }
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::holdings::normalizer::{normalize_table, read_csv_str};
use crate::isin::normalize_isin;
use crate::pipeline::loader::{JsonPositionStore, PositionSource};

#[derive(Debug, Deserialize)]
pub struct CommandEnvelope {
    #[serde(default)]
    pub id: Value,
    pub command: String,
    #[serde(default)]
    pub payload: Value,
}

pub fn success(id: &Value, data: Value) -> Value {
    json!({ "id": id, "status": "success", "data": data })
}

pub fn error_response(id: &Value, code: &str, message: &str) -> Value {
    json!({ "id": id, "status": "error", "error": { "code": code, "message": message } })
}

/// Dispatch one command to its handler.
pub async fn dispatch(state: &Arc<AppState>, envelope: CommandEnvelope) -> Value {
    let id = envelope.id.clone();
    match envelope.command.as_str() {
        "get_health" => get_health(state, &id),
        "get_positions" => get_positions(state, &id).await,
        "get_dashboard_data" => get_dashboard_data(state, &id),
        "sync_portfolio" => sync_portfolio(state, &id).await,
        "run_pipeline" => run_pipeline(state, &id).await,
        "upload_holdings" => upload_holdings(state, &id, &envelope.payload),
        "get_true_holdings" => get_true_holdings(state, &id),
        "get_overlap_analysis" => get_overlap_analysis(state, &id),
        "get_pipeline_report" => get_pipeline_report(state, &id),
        other => error_response(&id, "UNKNOWN_COMMAND", &format!("Unknown command: {other}")),
    }
}

// =============================================================================
// Handlers
// =============================================================================

fn get_health(state: &Arc<AppState>, id: &Value) -> Value {
    let cache_stats = state.holdings_cache.stats();
    let available = state.holdings_cache.list_available_isins();
    success(
        id,
        json!({
            "status": "ok",
            "version": state.version,
            "sessionId": state.session_id,
            "uptime_seconds": state.uptime_seconds(),
            "pipeline_running": state.is_pipeline_running(),
            "cache": cache_stats,
            "cached_etfs": available,
        }),
    )
}

async fn get_positions(state: &Arc<AppState>, id: &Value) -> Value {
    let store = JsonPositionStore::new(state.dirs.positions_file());
    match store.list_positions(1).await {
        Ok(positions) => {
            let total_value: f64 = positions.iter().map(|p| p.market_value()).sum();
            success(
                id,
                json!({
                    "positions": positions,
                    "count": positions.len(),
                    "total_value": total_value,
                }),
            )
        }
        Err(e) => error_response(id, "POSITIONS_ERROR", &e.to_string()),
    }
}

/// Aggregate view for the dashboard: top holdings plus sector and geography
/// allocations, read from the latest exposure report.
fn get_dashboard_data(state: &Arc<AppState>, id: &Value) -> Value {
    let rows = match read_exposure_rows(state) {
        Ok(rows) => rows,
        Err(e) => return error_response(id, "DASHBOARD_ERROR", &e),
    };

    let total_value: f64 = rows
        .iter()
        .filter_map(|r| r["total_exposure"].as_f64())
        .sum();

    let mut sectors: BTreeMap<String, f64> = BTreeMap::new();
    let mut geographies: BTreeMap<String, f64> = BTreeMap::new();
    for row in &rows {
        let value = row["total_exposure"].as_f64().unwrap_or(0.0);
        let sector = row["sector"].as_str().unwrap_or("Unknown").to_string();
        let geography = row["geography"].as_str().unwrap_or("Unknown").to_string();
        *sectors.entry(sector).or_insert(0.0) += value;
        *geographies.entry(geography).or_insert(0.0) += value;
    }

    let last_result = state.last_result.read().clone();
    success(
        id,
        json!({
            "total_value": total_value,
            "unique_securities": rows.len(),
            "top_holdings": rows.iter().take(10).collect::<Vec<_>>(),
            "sector_allocation": sectors,
            "geography_allocation": geographies,
            "last_run": last_result,
        }),
    )
}

/// The sync daemon (a separate process) refreshes the position store; this
/// command re-reads it and reports what arrived.
async fn sync_portfolio(state: &Arc<AppState>, id: &Value) -> Value {
    let store = JsonPositionStore::new(state.dirs.positions_file());
    match store.list_positions(1).await {
        Ok(positions) => {
            info!(count = positions.len(), "portfolio store re-read");
            success(
                id,
                json!({
                    "synced": true,
                    "positions": positions.len(),
                }),
            )
        }
        Err(e) => error_response(id, "SYNC_ERROR", &e.to_string()),
    }
}

async fn run_pipeline(state: &Arc<AppState>, id: &Value) -> Value {
    match Arc::clone(state).run_pipeline().await {
        Some(result) => success(
            id,
            json!({
                "success": result.success,
                "etfs_processed": result.etfs_processed,
                "etfs_failed": result.etfs_failed,
                "total_value": result.total_value,
                "quality_score": result.quality_score,
                "error_count": result.errors.len(),
                "harvested": result.harvested_count,
            }),
        ),
        None => error_response(id, "PIPELINE_BUSY", "A pipeline run is already in progress"),
    }
}

/// Accept a user-supplied holdings CSV for one ETF, normalize it, and place
/// it in both the manual uploads directory and the local cache.
fn upload_holdings(state: &Arc<AppState>, id: &Value, payload: &Value) -> Value {
    let Some(isin) = payload
        .get("isin")
        .and_then(|v| v.as_str())
        .and_then(normalize_isin)
    else {
        return error_response(id, "INVALID_ISIN", "payload.isin must be a valid ISIN");
    };
    let Some(content) = payload.get("content").and_then(|v| v.as_str()) else {
        return error_response(id, "MISSING_CONTENT", "payload.content must be CSV text");
    };

    let table = match read_csv_str(content) {
        Ok(table) => table,
        Err(e) => return error_response(id, "PARSE_ERROR", &e.to_string()),
    };
    let holdings = normalize_table(&table, "manual_upload");
    if holdings.is_empty() {
        return error_response(
            id,
            "EMPTY_HOLDINGS",
            "No valid holdings rows found in the uploaded file",
        );
    }

    let replaced = state.holdings_cache.has_holdings(&isin);
    let manual_path = state.dirs.manual_uploads_dir().join(format!("{isin}.csv"));
    if let Err(e) = std::fs::write(&manual_path, content) {
        return error_response(id, "WRITE_ERROR", &e.to_string());
    }
    state
        .holdings_cache
        .save_local(&isin, &holdings, "manual_upload", None);

    let weight_sum: f64 = holdings.iter().map(|h| h.weight_percentage).sum();
    info!(isin = %isin, count = holdings.len(), replaced, "manual holdings uploaded");
    success(
        id,
        json!({
            "isin": isin,
            "holdings_count": holdings.len(),
            "weight_sum": weight_sum,
            "replaced": replaced,
        }),
    )
}

fn get_true_holdings(state: &Arc<AppState>, id: &Value) -> Value {
    match read_exposure_rows(state) {
        Ok(rows) => success(id, json!({ "holdings": rows })),
        Err(_) => success(id, json!({ "holdings": [] })),
    }
}

/// Pairwise ETF overlap from the breakdown report: for each ETF pair, the
/// summed min-weight of shared constituents; plus the most valuable
/// securities held by more than one ETF.
fn get_overlap_analysis(state: &Arc<AppState>, id: &Value) -> Value {
    let path = state.dirs.breakdown_report_file();
    if !path.exists() {
        return success(id, json!({ "etfs": [], "matrix": [], "sharedHoldings": [] }));
    }

    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) => return error_response(id, "OVERLAP_ERROR", &e.to_string()),
    };

    // parent -> (child -> weight); child -> (name, total value, parents)
    let mut weights: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
    let mut children: BTreeMap<String, (String, f64, Vec<String>)> = BTreeMap::new();

    let mut reader = csv::Reader::from_reader(content.as_bytes());
    for record in reader.deserialize::<BTreeMap<String, String>>().flatten() {
        if record.get("source").map(String::as_str) != Some("ETF") {
            continue;
        }
        let (Some(parent), Some(child)) = (record.get("parent_isin"), record.get("child_isin"))
        else {
            continue;
        };
        let weight: f64 = record
            .get("weight_percent")
            .and_then(|w| w.parse().ok())
            .unwrap_or(0.0);
        let value: f64 = record
            .get("value_eur")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0);
        let name = record.get("child_name").cloned().unwrap_or_default();

        *weights
            .entry(parent.clone())
            .or_default()
            .entry(child.clone())
            .or_insert(0.0) += weight;

        let entry = children
            .entry(child.clone())
            .or_insert_with(|| (name, 0.0, Vec::new()));
        entry.1 += value;
        if !entry.2.contains(parent) {
            entry.2.push(parent.clone());
        }
    }

    let etfs: Vec<String> = weights.keys().cloned().collect();
    let matrix: Vec<Vec<f64>> = etfs
        .iter()
        .map(|a| {
            etfs.iter()
                .map(|b| {
                    if a == b {
                        return 100.0;
                    }
                    let overlap: f64 = weights[a]
                        .iter()
                        .filter_map(|(child, w_a)| weights[b].get(child).map(|w_b| w_a.min(*w_b)))
                        .sum();
                    (overlap * 10.0).round() / 10.0
                })
                .collect()
        })
        .collect();

    let mut shared: Vec<Value> = children
        .into_iter()
        .filter(|(_, (_, _, parents))| parents.len() > 1)
        .map(|(_, (name, value, parents))| {
            json!({
                "stock": name,
                "etfs": parents,
                "totalValue": (value * 100.0).round() / 100.0,
            })
        })
        .collect();
    shared.sort_by(|a, b| {
        b["totalValue"]
            .as_f64()
            .unwrap_or(0.0)
            .partial_cmp(&a["totalValue"].as_f64().unwrap_or(0.0))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    shared.truncate(10);

    success(id, json!({ "etfs": etfs, "matrix": matrix, "sharedHoldings": shared }))
}

fn get_pipeline_report(state: &Arc<AppState>, id: &Value) -> Value {
    let path = state.dirs.health_report_file();
    if !path.exists() {
        return success(id, Value::Null);
    }
    match std::fs::read_to_string(&path)
        .map_err(|e| e.to_string())
        .and_then(|content| serde_json::from_str::<Value>(&content).map_err(|e| e.to_string()))
    {
        Ok(report) => success(id, report),
        Err(e) => {
            warn!(error = %e, "failed to read pipeline health report");
            error_response(id, "REPORT_ERROR", &e)
        }
    }
}

// =============================================================================
// Shared readers
// =============================================================================

fn read_exposure_rows(state: &Arc<AppState>) -> Result<Vec<Value>, String> {
    let path = state.dirs.exposure_report_file();
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(&path).map_err(|e| e.to_string())?;
    let mut reader = csv::Reader::from_reader(content.as_bytes());

    let mut rows = Vec::new();
    for record in reader.deserialize::<BTreeMap<String, String>>() {
        let record = record.map_err(|e| e.to_string())?;
        let mut row = serde_json::Map::new();
        for (key, value) in record {
            // Numeric report columns come back as numbers.
            let parsed = match key.as_str() {
                "direct" | "indirect" | "total_exposure" | "portfolio_percentage"
                | "resolution_confidence" => value
                    .parse::<f64>()
                    .map(|n| json!(n))
                    .unwrap_or(Value::String(value)),
                _ => Value::String(value),
            };
            row.insert(key, parsed);
        }
        rows.push(Value::Object(row));
    }
    Ok(rows)
}
