// =============================================================================
// Central Application State - Trade Sentinel
// =============================================================================
//
// Ties the lifecycle manager, the monitor scheduler, the event bus and the
// runtime configuration together for the API layer and `main`.
//
// Thread safety:
//   - `parking_lot::RwLock` for the mutable configuration.
//   - Arc wrappers for subsystems that manage their own interior mutability.
//   - An atomic counter for connected WebSocket clients.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::analysis::IndicatorSource;
use crate::error::Result;
use crate::events::EventBus;
use crate::execution::{CloseHook, TradeExecutor};
use crate::exit::monitor::MonitorScheduler;
use crate::gateway::PriceGateway;
use crate::position_store::{PositionRecord, TradeProposal};
use crate::runtime_config::RuntimeConfig;
use crate::types::CloseReason;

/// Shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    pub runtime_config: Arc<RwLock<RuntimeConfig>>,
    pub executor: Arc<TradeExecutor>,
    pub scheduler: Arc<MonitorScheduler>,
    pub ws_clients: AtomicU64,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        config: RuntimeConfig,
        gateway: Arc<dyn PriceGateway>,
        indicators: Option<Arc<dyn IndicatorSource>>,
    ) -> Self {
        let executor = Arc::new(TradeExecutor::new(
            gateway,
            EventBus::new(),
            config.trading.clone(),
        ));
        let scheduler = Arc::new(MonitorScheduler::new(executor.clone(), indicators));

        Self {
            runtime_config: Arc::new(RwLock::new(config)),
            executor,
            scheduler,
            ws_clients: AtomicU64::new(0),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn events(&self) -> &EventBus {
        self.executor.events()
    }

    pub fn set_close_hook(&self, hook: CloseHook) {
        self.executor.set_close_hook(hook);
    }

    /// Open a proposal and put the new trade under supervision.
    pub async fn open_and_monitor(&self, proposal: &TradeProposal) -> Result<PositionRecord> {
        let record = self.executor.open(proposal).await?;
        if !self.scheduler.spawn(&record.trade_id) {
            warn!(trade_id = %record.trade_id, "trade opened without a monitor");
        }
        Ok(record)
    }

    /// Cancel the monitor, then close the trade as `manual`.
    ///
    /// If the close fails for a transient reason the monitor is restarted so
    /// the trade does not stay open unsupervised.
    pub async fn force_close(&self, trade_id: &str) -> Result<PositionRecord> {
        let was_monitored = self.scheduler.cancel(trade_id);
        self.scheduler.wait(trade_id).await;

        match self.executor.close(trade_id, CloseReason::Manual).await {
            Ok(record) => {
                info!(trade_id, "trade force closed");
                Ok(record)
            }
            Err(e) => {
                if was_monitored && e.is_retryable() {
                    warn!(trade_id, error = %e, "force close failed, resuming monitor");
                    self.scheduler.spawn(trade_id);
                }
                Err(e)
            }
        }
    }

    /// Cancel every monitor and wait for the tasks to exit.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown_and_wait().await;
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn ws_client_connected(&self) -> u64 {
        self.ws_clients.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn ws_client_disconnected(&self) -> u64 {
        self.ws_clients.fetch_sub(1, Ordering::Relaxed).saturating_sub(1)
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("executor", &self.executor)
            .field("scheduler", &self.scheduler)
            .field("ws_clients", &self.ws_clients.load(Ordering::Relaxed))
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
