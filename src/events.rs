// =============================================================================
// Lifecycle events - broadcast to the UI / notification forwarders
// =============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::types::{CloseReason, OrderSide, Strategy};

/// Capacity of the broadcast ring. Slow subscribers lag and skip.
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TradeEvent {
    Opened {
        trade_id: String,
        symbol: String,
        strategy: Strategy,
        side: OrderSide,
        entry_price: f64,
        take_profit: f64,
        stop_loss: f64,
        quantity: f64,
        at: DateTime<Utc>,
    },
    OpenFailed {
        symbol: String,
        error: String,
        at: DateTime<Utc>,
    },
    MonitorUpdate {
        trade_id: String,
        symbol: String,
        check_count: u64,
        time_label: String,
        current_price: f64,
        entry_price: f64,
        take_profit: f64,
        stop_loss: f64,
        unrealized_pnl: f64,
        pnl_percent: f64,
        rsi: Option<f64>,
        volume_ratio: Option<f64>,
        trailing_stop_active: bool,
        partial_closed: bool,
        at: DateTime<Utc>,
    },
    TrailingActivated {
        trade_id: String,
        symbol: String,
        price: f64,
        at: DateTime<Utc>,
    },
    PartialClosed {
        trade_id: String,
        symbol: String,
        close_quantity: f64,
        close_price: f64,
        remaining_quantity: f64,
        at: DateTime<Utc>,
    },
    Closed {
        trade_id: String,
        symbol: String,
        reason: CloseReason,
        close_price: f64,
        pnl: f64,
        pnl_percent: f64,
        at: DateTime<Utc>,
    },
    MonitorError {
        trade_id: String,
        symbol: String,
        check_count: u64,
        error: String,
        at: DateTime<Utc>,
    },
}

impl TradeEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Opened { .. } => "opened",
            Self::OpenFailed { .. } => "open_failed",
            Self::MonitorUpdate { .. } => "monitor_update",
            Self::TrailingActivated { .. } => "trailing_activated",
            Self::PartialClosed { .. } => "partial_closed",
            Self::Closed { .. } => "closed",
            Self::MonitorError { .. } => "monitor_error",
        }
    }

    pub fn trade_id(&self) -> Option<&str> {
        match self {
            Self::OpenFailed { .. } => None,
            Self::Opened { trade_id, .. }
            | Self::MonitorUpdate { trade_id, .. }
            | Self::TrailingActivated { trade_id, .. }
            | Self::PartialClosed { trade_id, .. }
            | Self::Closed { trade_id, .. }
            | Self::MonitorError { trade_id, .. } => Some(trade_id),
        }
    }
}

/// Fan-out of lifecycle events. Emitting never blocks and never fails.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TradeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn emit(&self, event: TradeEvent) {
        let name = event.name();
        if self.tx.send(event).is_err() {
            debug!(event = name, "no event subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TradeEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
