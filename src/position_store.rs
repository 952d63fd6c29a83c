// =============================================================================
// Position Record Store - one record per trade, keyed by trade id
// =============================================================================
//
// Life-cycle of a record:
//   Open  ->  PartialClosed  ->  Closed
//   Open  ->  Closed (TP / SL / trailing stop / timeout / manual)
//
// Each record sits behind its own `tokio::sync::Mutex` so a close can hold it
// across the gateway round-trip: a competing close waits, then observes
// `Closed` and fails with `AlreadyClosed` instead of submitting a second
// order. The registry map itself is a `parking_lot::RwLock` that is never held
// across an await.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::analysis::IndicatorReadings;
use crate::exit::policy::TrailingUpdate;
use crate::types::{CloseReason, PositionStatus, Strategy};

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// An approved trade decision as handed over by the proposal workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeProposal {
    pub symbol: String,
    /// "long" or "short" (validated on open).
    pub strategy: String,
    pub entry_price: f64,
    pub take_profit: f64,
    pub stop_loss: f64,
    /// Notional in quote currency.
    pub amount: f64,
    #[serde(default)]
    pub proposal_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// One observed price during monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub rsi: Option<f64>,
    pub macd_histogram: Option<f64>,
    pub volume_ratio: Option<f64>,
    pub note: Option<String>,
}

impl PriceSnapshot {
    pub fn new(price: f64, readings: IndicatorReadings) -> Self {
        Self {
            timestamp: Utc::now(),
            price,
            rsi: readings.rsi,
            macd_histogram: readings.macd_histogram,
            volume_ratio: readings.volume_ratio,
            note: None,
        }
    }
}

/// The supervised position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRecord {
    pub trade_id: String,
    pub proposal_id: Option<String>,
    pub order_id: String,

    pub symbol: String,
    pub strategy: Strategy,
    pub entry_price: f64,
    pub take_profit: f64,
    pub stop_loss: f64,
    /// Remaining open quantity. Only ever decreases.
    pub quantity: f64,
    pub amount: f64,

    pub status: PositionStatus,
    pub opened_at: DateTime<Utc>,
    /// Monotonic twin of `opened_at`. The holding deadline counts from it.
    #[serde(skip, default = "Instant::now")]
    pub opened_instant: Instant,

    pub trailing_stop_active: bool,
    /// Favourable extremum for longs (seeded to entry).
    pub highest_price: Option<f64>,
    /// Favourable extremum for shorts (seeded to entry).
    pub lowest_price: Option<f64>,

    pub partial_closed: bool,
    pub partial_close_price: Option<f64>,
    pub partial_close_quantity: Option<f64>,

    pub close_reason: Option<CloseReason>,
    pub close_price: Option<f64>,
    pub pnl: Option<f64>,
    pub pnl_percent: Option<f64>,
    pub closed_at: Option<DateTime<Utc>>,

    pub price_history: Vec<PriceSnapshot>,
}

impl PositionRecord {
    /// Build a fresh open record. `quantity = amount / entry_price`.
    pub fn new(
        trade_id: String,
        order_id: String,
        symbol: &str,
        strategy: Strategy,
        entry_price: f64,
        take_profit: f64,
        stop_loss: f64,
        amount: f64,
        proposal_id: Option<String>,
    ) -> Self {
        let (highest_price, lowest_price) = match strategy {
            Strategy::Long => (Some(entry_price), None),
            Strategy::Short => (None, Some(entry_price)),
        };

        Self {
            trade_id,
            proposal_id,
            order_id,
            symbol: symbol.to_string(),
            strategy,
            entry_price,
            take_profit,
            stop_loss,
            quantity: amount / entry_price,
            amount,
            status: PositionStatus::Open,
            opened_at: Utc::now(),
            opened_instant: Instant::now(),
            trailing_stop_active: false,
            highest_price,
            lowest_price,
            partial_closed: false,
            partial_close_price: None,
            partial_close_quantity: None,
            close_reason: None,
            close_price: None,
            pnl: None,
            pnl_percent: None,
            closed_at: None,
            price_history: Vec::new(),
        }
    }

    /// Direction-correct PnL of closing `quantity` at `price`.
    pub fn leg_pnl(&self, price: f64, quantity: f64) -> f64 {
        self.strategy.direction() * (price - self.entry_price) * quantity
    }

    /// Unrealized PnL of the remaining quantity only.
    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        self.leg_pnl(price, self.quantity)
    }

    /// Unrealized move as a percentage of entry.
    pub fn unrealized_pnl_percent(&self, price: f64) -> f64 {
        self.strategy.direction() * (price - self.entry_price) / self.entry_price * 100.0
    }

    /// PnL realized by the earlier partial close, if one happened.
    pub fn partial_leg_pnl(&self) -> Option<f64> {
        match (self.partial_close_price, self.partial_close_quantity) {
            (Some(price), Some(qty)) if self.partial_closed => Some(self.leg_pnl(price, qty)),
            _ => None,
        }
    }

    /// Extremum tracked for the trailing stop (highest for longs, lowest for
    /// shorts).
    pub fn extremum(&self) -> Option<f64> {
        match self.strategy {
            Strategy::Long => self.highest_price,
            Strategy::Short => self.lowest_price,
        }
    }

    /// Apply the trailing-stop state change produced by an evaluation.
    ///
    /// Activation is sticky and the extremum only moves favourably. Returns
    /// `true` when this call activated the trailing stop.
    pub fn apply_trailing(&mut self, update: TrailingUpdate) -> bool {
        match update {
            TrailingUpdate::Unchanged => false,
            TrailingUpdate::Activate { extremum } => {
                if self.trailing_stop_active {
                    self.extend_extremum(extremum);
                    return false;
                }
                self.trailing_stop_active = true;
                self.set_extremum(extremum);
                true
            }
            TrailingUpdate::Extend { extremum } => {
                if self.trailing_stop_active {
                    self.extend_extremum(extremum);
                }
                false
            }
        }
    }

    fn set_extremum(&mut self, value: f64) {
        match self.strategy {
            Strategy::Long => self.highest_price = Some(value),
            Strategy::Short => self.lowest_price = Some(value),
        }
    }

    fn extend_extremum(&mut self, value: f64) {
        let favourable = match (self.strategy, self.extremum()) {
            (_, None) => true,
            (Strategy::Long, Some(current)) => value > current,
            (Strategy::Short, Some(current)) => value < current,
        };
        if favourable {
            self.set_extremum(value);
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Shared, serialized handle to a single record.
pub type RecordHandle = Arc<Mutex<PositionRecord>>;

/// Registry of every record plus the ordered closed-trade history.
pub struct PositionStore {
    records: RwLock<HashMap<String, RecordHandle>>,
    closed: RwLock<Vec<PositionRecord>>,
}

impl PositionStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            closed: RwLock::new(Vec::new()),
        }
    }

    /// Register a new record. Returns `None` if the id is already taken.
    pub fn insert(&self, record: PositionRecord) -> Option<RecordHandle> {
        let mut records = self.records.write();
        if records.contains_key(&record.trade_id) {
            return None;
        }
        let id = record.trade_id.clone();
        let handle = Arc::new(Mutex::new(record));
        records.insert(id, handle.clone());
        Some(handle)
    }

    pub fn contains(&self, trade_id: &str) -> bool {
        self.records.read().contains_key(trade_id)
    }

    pub fn get(&self, trade_id: &str) -> Option<RecordHandle> {
        self.records.read().get(trade_id).cloned()
    }

    /// Clone of the record as it is right now.
    pub async fn snapshot(&self, trade_id: &str) -> Option<PositionRecord> {
        let handle = self.get(trade_id)?;
        let record = handle.lock().await;
        Some(record.clone())
    }

    pub async fn status(&self, trade_id: &str) -> Option<PositionStatus> {
        let handle = self.get(trade_id)?;
        let status = handle.lock().await.status;
        Some(status)
    }

    /// Trade ids of every record still open or partially closed.
    pub async fn active_ids(&self) -> Vec<String> {
        let handles: Vec<(String, RecordHandle)> = self
            .records
            .read()
            .iter()
            .map(|(id, h)| (id.clone(), h.clone()))
            .collect();

        let mut active = Vec::new();
        for (id, handle) in handles {
            if handle.lock().await.status.is_active() {
                active.push(id);
            }
        }
        active.sort();
        active
    }

    pub fn push_closed(&self, record: PositionRecord) {
        self.closed.write().push(record);
    }

    /// Closed trades in close order (oldest first).
    pub fn closed_history(&self) -> Vec<PositionRecord> {
        self.closed.read().clone()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }
}

impl Default for PositionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PositionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionStore")
            .field("records", &self.records.read().len())
            .field("closed", &self.closed.read().len())
            .finish()
    }
}
