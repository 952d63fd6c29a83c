// =============================================================================
// Trade Sentinel - Main Entry Point
// =============================================================================
//
// Opens approved trade proposals on the exchange and supervises each open
// position until it exits. The engine starts in Demo mode unless the runtime
// config says otherwise: prices are live, orders are simulated locally.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod analysis;
mod api;
mod app_state;
mod error;
mod events;
mod exchange;
mod execution;
mod exit;
mod gateway;
mod indicators;
mod position_store;
mod runtime_config;
mod types;

#[cfg(test)]
mod testkit;

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::analysis::{IndicatorSource, KlineAnalyzer};
use crate::app_state::AppState;
use crate::exchange::ExchangeClient;
use crate::position_store::PositionRecord;
use crate::runtime_config::RuntimeConfig;

const CONFIG_PATH: &str = "runtime_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Trade Sentinel - Starting Up                      ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env_overrides();
    config.sanitize();

    info!(
        account_mode = %config.account_mode,
        base_url = %config.exchange_base_url,
        interval_secs = config.trading.monitor_interval_secs,
        max_duration_secs = config.trading.max_duration_secs,
        max_trade_amount = config.trading.max_trade_amount,
        "Engine configuration"
    );

    // ── 2. Exchange client ───────────────────────────────────────────────
    let api_key = std::env::var("EXCHANGE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("EXCHANGE_API_SECRET").unwrap_or_default();
    let client = Arc::new(ExchangeClient::new(
        api_key,
        api_secret,
        config.exchange_base_url.clone(),
        config.account_mode,
    )?);

    match client.get_server_time().await {
        Ok(server_ms) => {
            let drift_ms = Utc::now().timestamp_millis() - server_ms;
            info!(server_ms, drift_ms, "Exchange server time");
            if drift_ms.abs() > 1_000 {
                warn!(drift_ms, "Local clock drifts from exchange by more than 1s");
            }
        }
        Err(e) => warn!(error = %e, "Exchange server time unavailable"),
    }

    // ── 3. Indicator snapshots ───────────────────────────────────────────
    let indicators: Option<Arc<dyn IndicatorSource>> = if config.enable_indicator_snapshots {
        Some(Arc::new(KlineAnalyzer::new(
            client.clone(),
            config.snapshot_interval.clone(),
        )))
    } else {
        None
    };

    // ── 4. Shared state ──────────────────────────────────────────────────
    let state = Arc::new(AppState::new(config, client, indicators));

    state.set_close_hook(Arc::new(|record: PositionRecord| {
        info!(
            trade_id = %record.trade_id,
            symbol = %record.symbol,
            reason = ?record.close_reason,
            pnl = ?record.pnl,
            pnl_percent = ?record.pnl_percent,
            checks = record.price_history.len(),
            "Trade report ready"
        );
    }));

    // ── 5. API server ────────────────────────────────────────────────────
    let bind_addr =
        std::env::var("SENTINEL_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "API server listening");

    let app = api::rest::router(state.clone());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received, stopping monitors");

    state.shutdown().await;

    let open = state.executor.store().active_ids().await;
    if !open.is_empty() {
        warn!(count = open.len(), trades = ?open, "Trades left open at shutdown");
    }

    if let Err(e) = state.runtime_config.read().save(CONFIG_PATH) {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }

    info!("Trade Sentinel shut down complete.");
    Ok(())
}
