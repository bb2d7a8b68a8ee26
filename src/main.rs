// =============================================================================
// Portfolio Prism Engine — Main Entry Point
// =============================================================================
//
// A single long-lived process that executes bounded pipeline runs on
// demand: Load -> Decompose -> Enrich -> Aggregate -> Report. After startup
// it prints exactly one ready line on stdout, then serves commands either
// as line-delimited JSON on stdin or over the echo-bridge HTTP server
// (`--http`).
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod adapters;
mod api;
mod app_state;
mod contracts;
mod errors;
mod hive;
mod holdings;
mod isin;
mod pipeline;
mod resolve;
mod runtime_config;
mod telemetry;
mod types;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::adapters::browser::BrowserAdapter;
use crate::adapters::file_drop::FileDropAdapter;
use crate::adapters::ishares::ISharesAdapter;
use crate::adapters::AdapterRegistry;
use crate::api::events::EngineEvent;
use crate::app_state::AppState;
use crate::hive::{ContributionQueue, HiveClient};
use crate::holdings::HoldingsCache;
use crate::pipeline::loader::JsonPositionStore;
use crate::pipeline::Pipeline;
use crate::resolve::external::ExternalResolver;
use crate::resolve::negative::NegativeCache;
use crate::resolve::universe::AssetUniverse;
use crate::resolve::IsinResolver;
use crate::runtime_config::{sealed_mode, DataDirs, EngineConfig};

struct CliArgs {
    http: bool,
    host: String,
    port: u16,
}

fn parse_args() -> CliArgs {
    let mut args = CliArgs {
        http: false,
        host: "127.0.0.1".to_string(),
        port: 5001,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--http" => args.http = true,
            "--host" => {
                if let Some(host) = iter.next() {
                    args.host = host;
                }
            }
            "--port" => {
                if let Some(port) = iter.next().and_then(|p| p.parse().ok()) {
                    args.port = port;
                }
            }
            other => warn!(arg = other, "ignoring unknown argument"),
        }
    }
    args
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    // Logs go to stderr: stdout is reserved for the JSON protocol.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = parse_args();
    let sealed = sealed_mode();

    let dirs = DataDirs::from_env();
    if let Err(e) = dirs.ensure() {
        // Fatal initialization failure: non-zero exit per the process contract.
        error!(error = %e, "failed to prepare data directory");
        std::process::exit(1);
    }

    let config = EngineConfig::load(dirs.engine_config_file()).unwrap_or_else(|e| {
        warn!(error = %e, "using default engine config");
        let config = EngineConfig::default();
        if let Err(e) = config.save(dirs.engine_config_file()) {
            warn!(error = %e, "failed to write default engine config");
        }
        config
    });

    info!(
        data_dir = %dirs.root.display(),
        sealed,
        reporting_currency = %config.reporting_currency,
        "Portfolio Prism engine starting"
    );

    // ── 2. Shared services ───────────────────────────────────────────────
    let hive = Arc::new(HiveClient::from_env());
    let contributions = ContributionQueue::new(config.contribute_to_hive);
    Arc::clone(&contributions).spawn_worker(Arc::clone(&hive));

    let universe = Arc::new(AssetUniverse::load(dirs.asset_universe_file()));
    let external = Arc::new(ExternalResolver::from_env());
    let resolver = Arc::new(IsinResolver::new(
        Arc::clone(&universe),
        &dirs.manual_overrides_file(),
        &dirs.enrichment_cache_file(),
        NegativeCache::load(dirs.negative_cache_file()),
        Arc::clone(&hive),
        Arc::clone(&external),
        Arc::clone(&contributions),
        config.tier1_threshold,
    ));

    let holdings_cache = Arc::new(HoldingsCache::new(&dirs, config.cache_max_age_days)?);

    // ── 3. Adapter registry ──────────────────────────────────────────────
    // File drop-in registers first so user-provided files always win.
    let mut registry = AdapterRegistry::new(config.max_inflight_requests);
    registry.register(Arc::new(FileDropAdapter::new(dirs.manual_uploads_dir())));
    registry.register(Arc::new(ISharesAdapter::new(
        dirs.provider_config_file("ishares"),
    )));
    if let Ok(driver) = std::env::var("PRISM_BROWSER_DRIVER") {
        let products = load_browser_products(&dirs);
        info!(products = products.len(), driver, "browser automation adapter registered");
        registry.register(Arc::new(BrowserAdapter::new(
            "browser",
            driver.into(),
            products,
            sealed,
        )));
    }
    let registry = Arc::new(registry);

    // ── 4. Background identity sync (never blocks the pipeline) ─────────
    hive::sync::spawn_if_stale(
        Arc::clone(&hive),
        Arc::clone(&universe),
        dirs.hive_sync_meta_file(),
    );

    // ── 5. Pipeline & state ──────────────────────────────────────────────
    let pipeline = Arc::new(Pipeline::new(
        dirs.clone(),
        config.clone(),
        Arc::new(JsonPositionStore::new(dirs.positions_file())),
        Arc::clone(&holdings_cache),
        registry,
        resolver,
        universe,
        hive,
        external,
        contributions,
        sealed,
    ));

    let state = Arc::new(AppState::new(dirs, config, pipeline, holdings_cache));

    // ── 6. Ready signal ──────────────────────────────────────────────────
    // Exactly one line of JSON on stdout before any protocol traffic.
    println!(
        "{}",
        serde_json::json!({
            "status": "ready",
            "version": state.version,
            "pid": std::process::id(),
        })
    );
    use std::io::Write;
    std::io::stdout().flush().ok();

    // ── 7. Serve ─────────────────────────────────────────────────────────
    if args.http {
        // Heartbeats keep SSE clients confident between pipeline runs.
        let heartbeat_state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(30));
            loop {
                interval.tick().await;
                heartbeat_state.emit(EngineEvent::Heartbeat);
            }
        });

        let bind_addr = std::env::var("PRISM_BIND_ADDR")
            .unwrap_or_else(|_| format!("{}:{}", args.host, args.port));
        let app = api::rest::router(Arc::clone(&state));
        let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
        info!(addr = %bind_addr, "echo-bridge listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                warn!("shutdown signal received");
            })
            .await?;
    } else {
        tokio::select! {
            result = api::stdio::run_stdio_loop(Arc::clone(&state)) => {
                if let Err(e) = result {
                    error!(error = %e, "stdio loop failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("shutdown signal received");
            }
        }
    }

    info!("Portfolio Prism engine shut down complete");
    Ok(())
}

/// Product-page map for the browser-automation adapter:
/// `config/browser_config.json` as `{ "ISIN": "https://..." }`.
fn load_browser_products(dirs: &DataDirs) -> HashMap<String, String> {
    let path = dirs.provider_config_file("browser");
    if !path.exists() {
        return HashMap::new();
    }
    std::fs::read_to_string(&path)
        .ok()
        .and_then(|content| serde_json::from_str(&content).ok())
        .unwrap_or_default()
}
