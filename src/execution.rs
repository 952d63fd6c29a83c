// =============================================================================
// Trade Lifecycle - opens trades from approved proposals and closes them with
// a blended realized PnL
// =============================================================================
//
//   open           validate -> size -> LIMIT entry -> record(Open) -> "opened"
//   partial_close  MARKET exit of `partial_tp_ratio` of the remaining quantity
//   close          MARKET exit of the remaining quantity -> pnl -> record(Closed)
//                  -> closed history -> "closed" -> post-close hook
//
// Open is all-or-nothing: no record exists unless the entry order was
// accepted. Close and partial close run with the record's mutex held across
// the gateway round-trip, so a competing close observes `Closed` and fails
// with `AlreadyClosed`. A failed gateway call leaves the record untouched.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{Result, TradeError};
use crate::events::{EventBus, TradeEvent};
use crate::gateway::{OrderRequest, PriceGateway};
use crate::position_store::{PositionRecord, PositionStore, TradeProposal};
use crate::runtime_config::TradingParams;
use crate::types::{CloseReason, OrderSide, PositionStatus, Strategy};

/// Invoked with every finalized record, off the close path.
pub type CloseHook = Arc<dyn Fn(PositionRecord) + Send + Sync>;

/// Result of a partial take-profit request.
#[derive(Debug, Clone)]
pub enum PartialCloseOutcome {
    Executed(PositionRecord),
    /// The record was already partially closed (or is no longer `Open`).
    AlreadyHandled,
}

/// Read-only status view, including unrealized PnL for active trades.
#[derive(Debug, Clone, Serialize)]
pub struct TradeStatusView {
    pub trade_id: String,
    pub symbol: String,
    pub strategy: Strategy,
    pub side: OrderSide,
    pub entry_price: f64,
    pub take_profit: f64,
    pub stop_loss: f64,
    pub quantity: f64,
    pub amount: f64,
    pub status: PositionStatus,
    pub opened_at: DateTime<Utc>,
    pub trailing_stop_active: bool,
    pub partial_closed: bool,
    pub checks: usize,
    pub current_price: Option<f64>,
    pub unrealized_pnl: Option<f64>,
    pub unrealized_pnl_percent: Option<f64>,
    pub close_reason: Option<CloseReason>,
    pub close_price: Option<f64>,
    pub pnl: Option<f64>,
    pub pnl_percent: Option<f64>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl TradeStatusView {
    fn from_record(record: &PositionRecord, current_price: Option<f64>) -> Self {
        Self {
            trade_id: record.trade_id.clone(),
            symbol: record.symbol.clone(),
            strategy: record.strategy,
            side: record.strategy.entry_side(),
            entry_price: record.entry_price,
            take_profit: record.take_profit,
            stop_loss: record.stop_loss,
            quantity: record.quantity,
            amount: record.amount,
            status: record.status,
            opened_at: record.opened_at,
            trailing_stop_active: record.trailing_stop_active,
            partial_closed: record.partial_closed,
            checks: record.price_history.len(),
            current_price,
            unrealized_pnl: current_price.map(|p| record.unrealized_pnl(p)),
            unrealized_pnl_percent: current_price.map(|p| record.unrealized_pnl_percent(p)),
            close_reason: record.close_reason,
            close_price: record.close_price,
            pnl: record.pnl,
            pnl_percent: record.pnl_percent,
            closed_at: record.closed_at,
        }
    }
}

/// Owns the record store and every order that touches it.
pub struct TradeExecutor {
    gateway: Arc<dyn PriceGateway>,
    store: Arc<PositionStore>,
    events: EventBus,
    params: TradingParams,
    close_hook: RwLock<Option<CloseHook>>,
}

impl TradeExecutor {
    pub fn new(gateway: Arc<dyn PriceGateway>, events: EventBus, params: TradingParams) -> Self {
        Self {
            gateway,
            store: Arc::new(PositionStore::new()),
            events,
            params,
            close_hook: RwLock::new(None),
        }
    }

    pub fn store(&self) -> &Arc<PositionStore> {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn gateway(&self) -> &Arc<dyn PriceGateway> {
        &self.gateway
    }

    pub fn params(&self) -> &TradingParams {
        &self.params
    }

    pub fn set_close_hook(&self, hook: CloseHook) {
        *self.close_hook.write() = Some(hook);
    }

    // -------------------------------------------------------------------------
    // Open
    // -------------------------------------------------------------------------

    /// Validate, size, submit the entry order, and create the record.
    pub async fn open(&self, proposal: &TradeProposal) -> Result<PositionRecord> {
        let strategy = match self.validate(proposal) {
            Ok(s) => s,
            Err(e) => {
                warn!(symbol = %proposal.symbol, error = %e, "proposal rejected");
                self.emit_open_failed(&proposal.symbol, &e);
                return Err(e);
            }
        };

        let symbol = proposal.symbol.trim();
        let side = strategy.entry_side();
        let quantity = proposal.amount / proposal.entry_price;

        info!(
            symbol,
            %side,
            %strategy,
            quantity,
            entry_price = proposal.entry_price,
            take_profit = proposal.take_profit,
            stop_loss = proposal.stop_loss,
            "executing trade"
        );

        let order = OrderRequest::limit(symbol, side, quantity, proposal.entry_price);
        let ack = match self.gateway.place_order(&order).await {
            Ok(ack) => ack,
            Err(source) => {
                error!(symbol, error = %source, "entry order placement failed");
                let err = TradeError::OrderPlacement {
                    context: format!("entry {side} {symbol}"),
                    source,
                };
                self.emit_open_failed(symbol, &err);
                return Err(err);
            }
        };

        let mut record = PositionRecord::new(
            new_trade_id(),
            ack.order_id.clone(),
            symbol,
            strategy,
            proposal.entry_price,
            proposal.take_profit,
            proposal.stop_loss,
            proposal.amount,
            proposal.proposal_id.clone(),
        );
        while self.store.insert(record.clone()).is_none() {
            record.trade_id = new_trade_id();
        }

        info!(
            trade_id = %record.trade_id,
            order_id = %ack.order_id,
            simulated = ack.simulated,
            "trade opened"
        );

        self.events.emit(TradeEvent::Opened {
            trade_id: record.trade_id.clone(),
            symbol: record.symbol.clone(),
            strategy,
            side,
            entry_price: record.entry_price,
            take_profit: record.take_profit,
            stop_loss: record.stop_loss,
            quantity: record.quantity,
            at: record.opened_at,
        });

        Ok(record)
    }

    fn validate(&self, proposal: &TradeProposal) -> Result<Strategy> {
        if proposal.symbol.trim().is_empty() {
            return Err(TradeError::Validation("symbol is required".into()));
        }
        let strategy: Strategy = proposal.strategy.parse().map_err(TradeError::Validation)?;
        if !(proposal.entry_price.is_finite() && proposal.entry_price > 0.0) {
            return Err(TradeError::Validation(format!(
                "entry_price must be positive (got {})",
                proposal.entry_price
            )));
        }
        if !(proposal.amount.is_finite() && proposal.amount > 0.0) {
            return Err(TradeError::Validation(format!(
                "amount must be positive (got {})",
                proposal.amount
            )));
        }
        if proposal.amount > self.params.max_trade_amount {
            return Err(TradeError::Validation(format!(
                "amount {} exceeds max_trade_amount ({})",
                proposal.amount, self.params.max_trade_amount
            )));
        }
        Ok(strategy)
    }

    fn emit_open_failed(&self, symbol: &str, err: &TradeError) {
        self.events.emit(TradeEvent::OpenFailed {
            symbol: symbol.to_string(),
            error: err.to_string(),
            at: Utc::now(),
        });
    }

    // -------------------------------------------------------------------------
    // Close
    // -------------------------------------------------------------------------

    /// Close the remaining quantity at market and finalize the record.
    ///
    /// Fails with `AlreadyClosed` on a closed record. A second call is a
    /// caller-side bug, not a no-op.
    pub async fn close(&self, trade_id: &str, reason: CloseReason) -> Result<PositionRecord> {
        let handle = self
            .store
            .get(trade_id)
            .ok_or_else(|| TradeError::NotFound(trade_id.to_string()))?;
        let mut record = handle.lock().await;

        if record.status == PositionStatus::Closed {
            warn!(trade_id, %reason, "close requested on closed trade");
            return Err(TradeError::AlreadyClosed(trade_id.to_string()));
        }

        let side = record.strategy.exit_side();
        let quantity = record.quantity;

        info!(
            trade_id,
            symbol = %record.symbol,
            %side,
            quantity,
            %reason,
            "closing position"
        );

        let close_price = self
            .gateway
            .price(&record.symbol)
            .await
            .map_err(|source| {
                error!(trade_id, error = %source, "close price fetch failed");
                TradeError::OrderPlacement {
                    context: format!("close {trade_id}"),
                    source: source.context("exit price unavailable"),
                }
            })?;

        let order = OrderRequest::market(&record.symbol, side, quantity);
        if let Err(source) = self.gateway.place_order(&order).await {
            error!(trade_id, error = %source, "close order placement failed");
            return Err(TradeError::OrderPlacement {
                context: format!("close {trade_id}"),
                source,
            });
        }

        let mut pnl = record.leg_pnl(close_price, quantity);
        if let Some(partial) = record.partial_leg_pnl() {
            pnl += partial;
        }
        let pnl_percent = if record.amount > 0.0 {
            pnl / record.amount * 100.0
        } else {
            0.0
        };

        let now = Utc::now();
        record.status = PositionStatus::Closed;
        record.close_reason = Some(reason);
        record.close_price = Some(close_price);
        record.pnl = Some(pnl);
        record.pnl_percent = Some(pnl_percent);
        record.closed_at = Some(now);

        let finalized = record.clone();
        drop(record);

        self.store.push_closed(finalized.clone());

        info!(
            trade_id,
            %reason,
            close_price,
            pnl = format!("{pnl:+.4}"),
            pnl_percent = format!("{pnl_percent:.2}"),
            "position closed"
        );

        self.events.emit(TradeEvent::Closed {
            trade_id: finalized.trade_id.clone(),
            symbol: finalized.symbol.clone(),
            reason,
            close_price,
            pnl,
            pnl_percent,
            at: now,
        });

        let hook = self.close_hook.read().clone();
        if let Some(hook) = hook {
            let record = finalized.clone();
            tokio::spawn(async move { hook(record) });
        }

        Ok(finalized)
    }

    // -------------------------------------------------------------------------
    // Partial close
    // -------------------------------------------------------------------------

    /// Sell `partial_tp_ratio` of the remaining quantity at market.
    ///
    /// Allowed once, and only while the record is `Open`.
    pub async fn partial_close(&self, trade_id: &str) -> Result<PartialCloseOutcome> {
        let handle = self
            .store
            .get(trade_id)
            .ok_or_else(|| TradeError::NotFound(trade_id.to_string()))?;
        let mut record = handle.lock().await;

        if record.status == PositionStatus::Closed {
            return Err(TradeError::AlreadyClosed(trade_id.to_string()));
        }
        if record.status != PositionStatus::Open || record.partial_closed {
            return Ok(PartialCloseOutcome::AlreadyHandled);
        }

        let close_qty = record.quantity * self.params.partial_tp_ratio;
        let side = record.strategy.exit_side();

        info!(
            trade_id,
            close_qty,
            ratio_pct = self.params.partial_tp_ratio * 100.0,
            "partial take-profit"
        );

        let close_price = self
            .gateway
            .price(&record.symbol)
            .await
            .map_err(|source| {
                error!(trade_id, error = %source, "partial close price fetch failed");
                TradeError::OrderPlacement {
                    context: format!("partial close {trade_id}"),
                    source: source.context("exit price unavailable"),
                }
            })?;

        let order = OrderRequest::market(&record.symbol, side, close_qty);
        if let Err(source) = self.gateway.place_order(&order).await {
            error!(trade_id, error = %source, "partial close order placement failed");
            return Err(TradeError::OrderPlacement {
                context: format!("partial close {trade_id}"),
                source,
            });
        }

        record.quantity -= close_qty;
        record.status = PositionStatus::PartialClosed;
        record.partial_closed = true;
        record.partial_close_price = Some(close_price);
        record.partial_close_quantity = Some(close_qty);

        info!(
            trade_id,
            close_qty,
            close_price,
            remaining = record.quantity,
            "partial take-profit completed"
        );

        self.events.emit(TradeEvent::PartialClosed {
            trade_id: record.trade_id.clone(),
            symbol: record.symbol.clone(),
            close_quantity: close_qty,
            close_price,
            remaining_quantity: record.quantity,
            at: Utc::now(),
        });

        Ok(PartialCloseOutcome::Executed(record.clone()))
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Current view of a trade. Never mutates the record.
    pub async fn status(&self, trade_id: &str) -> Result<TradeStatusView> {
        let record = self
            .store
            .snapshot(trade_id)
            .await
            .ok_or_else(|| TradeError::NotFound(trade_id.to_string()))?;

        let current_price = if record.status.is_active() {
            match self.gateway.price(&record.symbol).await {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!(trade_id, error = %e, "price unavailable for status");
                    None
                }
            }
        } else {
            None
        };

        Ok(TradeStatusView::from_record(&record, current_price))
    }

    /// Status of every open or partially closed trade.
    pub async fn open_trades(&self) -> Vec<TradeStatusView> {
        let mut views = Vec::new();
        for id in self.store.active_ids().await {
            if let Ok(view) = self.status(&id).await {
                views.push(view);
            }
        }
        views
    }

    /// Closed trades, oldest first.
    pub fn history(&self) -> Vec<PositionRecord> {
        self.store.closed_history()
    }
}

impl std::fmt::Debug for TradeExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradeExecutor")
            .field("store", &self.store)
            .field("params", &self.params)
            .finish()
    }
}

fn new_trade_id() -> String {
    Uuid::new_v4().to_string()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{proposal, MockGateway};
    use crate::types::OrderType;

    fn executor(gateway: Arc<MockGateway>) -> TradeExecutor {
        TradeExecutor::new(gateway, EventBus::new(), TradingParams::default())
    }

    fn executor_with_cap(gateway: Arc<MockGateway>, cap: f64) -> TradeExecutor {
        let params = TradingParams {
            max_trade_amount: cap,
            ..TradingParams::default()
        };
        TradeExecutor::new(gateway, EventBus::new(), params)
    }

    #[tokio::test]
    async fn open_sizes_quantity_and_submits_limit_entry() {
        let gw = MockGateway::with_price(100.0);
        let exec = executor_with_cap(gw.clone(), 1000.0);
        let mut rx = exec.events().subscribe();

        let record = exec.open(&proposal("long", 100.0, 110.0, 95.0, 1000.0)).await.unwrap();

        assert!((record.quantity - 10.0).abs() < 1e-12);
        assert_eq!(record.status, PositionStatus::Open);
        assert_eq!(record.highest_price, Some(100.0));
        assert_eq!(record.lowest_price, None);

        let orders = gw.orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].side, OrderSide::Buy);
        assert_eq!(orders[0].order_type, OrderType::Limit);
        assert_eq!(orders[0].price, Some(100.0));

        assert_eq!(rx.recv().await.unwrap().name(), "opened");
        assert!(exec.store().contains(&record.trade_id));
    }

    #[tokio::test]
    async fn short_opens_with_sell() {
        let gw = MockGateway::with_price(250.0);
        let exec = executor(gw.clone());
        let record = exec.open(&proposal("short", 250.0, 225.0, 260.0, 50.0)).await.unwrap();
        assert!((record.quantity - 0.2).abs() < 1e-12);
        assert_eq!(record.lowest_price, Some(250.0));
        assert_eq!(gw.orders()[0].side, OrderSide::Sell);
    }

    #[tokio::test]
    async fn validation_errors_place_no_orders() {
        let gw = MockGateway::with_price(100.0);
        let exec = executor(gw.clone());

        let mut empty_symbol = proposal("long", 100.0, 110.0, 95.0, 50.0);
        empty_symbol.symbol = "  ".into();

        let cases = vec![
            empty_symbol,
            proposal("sideways", 100.0, 110.0, 95.0, 50.0),
            proposal("long", 0.0, 110.0, 95.0, 50.0),
            proposal("long", 100.0, 110.0, 95.0, 0.0),
            proposal("long", 100.0, 110.0, 95.0, 100.01),
        ];
        for p in cases {
            let err = exec.open(&p).await.unwrap_err();
            assert!(matches!(err, TradeError::Validation(_)), "unexpected {err:?}");
        }
        assert!(gw.orders().is_empty());
        assert_eq!(exec.store().len(), 0);
    }

    #[tokio::test]
    async fn amount_at_cap_is_allowed() {
        let gw = MockGateway::with_price(100.0);
        let exec = executor(gw);
        assert!(exec.open(&proposal("long", 100.0, 110.0, 95.0, 100.0)).await.is_ok());
    }

    #[tokio::test]
    async fn rejected_entry_creates_no_record() {
        let gw = MockGateway::with_price(100.0);
        gw.fail_orders(true);
        let exec = executor(gw);
        let mut rx = exec.events().subscribe();

        let err = exec.open(&proposal("long", 100.0, 110.0, 95.0, 50.0)).await.unwrap_err();
        assert!(matches!(err, TradeError::OrderPlacement { .. }));
        assert_eq!(exec.store().len(), 0);
        assert_eq!(rx.recv().await.unwrap().name(), "open_failed");
    }

    #[tokio::test]
    async fn close_long_computes_pnl_and_records_history() {
        let gw = MockGateway::with_price(100.0);
        let exec = executor_with_cap(gw.clone(), 1000.0);
        let record = exec.open(&proposal("long", 100.0, 110.0, 95.0, 1000.0)).await.unwrap();

        gw.set_price(111.0);
        let closed = exec.close(&record.trade_id, CloseReason::TpHit).await.unwrap();

        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(closed.close_reason, Some(CloseReason::TpHit));
        assert_eq!(closed.close_price, Some(111.0));
        assert!((closed.pnl.unwrap() - 110.0).abs() < 1e-9);
        assert!((closed.pnl_percent.unwrap() - 11.0).abs() < 1e-9);
        assert!(closed.closed_at.is_some());

        let exit = gw.orders().pop().unwrap();
        assert_eq!(exit.side, OrderSide::Sell);
        assert_eq!(exit.order_type, OrderType::Market);
        assert!((exit.quantity - 10.0).abs() < 1e-12);

        assert_eq!(exec.history().len(), 1);
    }

    #[tokio::test]
    async fn close_short_uses_mirrored_pnl() {
        let gw = MockGateway::with_price(200.0);
        let exec = executor(gw.clone());
        let record = exec.open(&proposal("short", 200.0, 180.0, 210.0, 100.0)).await.unwrap();

        gw.set_price(205.0);
        let closed = exec.close(&record.trade_id, CloseReason::Manual).await.unwrap();
        // (200 - 205) * 0.5
        assert!((closed.pnl.unwrap() + 2.5).abs() < 1e-9);
        assert_eq!(gw.orders().pop().unwrap().side, OrderSide::Buy);
    }

    #[tokio::test]
    async fn second_close_fails_with_already_closed() {
        let gw = MockGateway::with_price(100.0);
        let exec = executor(gw.clone());
        let record = exec.open(&proposal("long", 100.0, 110.0, 95.0, 50.0)).await.unwrap();

        exec.close(&record.trade_id, CloseReason::Manual).await.unwrap();
        let orders_after_first = gw.orders().len();

        let err = exec.close(&record.trade_id, CloseReason::Manual).await.unwrap_err();
        assert!(matches!(err, TradeError::AlreadyClosed(_)));
        assert_eq!(gw.orders().len(), orders_after_first);
        assert_eq!(exec.history().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_closes_submit_exactly_one_exit() {
        let gw = MockGateway::with_price(100.0);
        let exec = Arc::new(executor(gw.clone()));
        let record = exec.open(&proposal("long", 100.0, 110.0, 95.0, 50.0)).await.unwrap();

        let a = {
            let exec = exec.clone();
            let id = record.trade_id.clone();
            tokio::spawn(async move { exec.close(&id, CloseReason::Manual).await })
        };
        let b = {
            let exec = exec.clone();
            let id = record.trade_id.clone();
            tokio::spawn(async move { exec.close(&id, CloseReason::Timeout).await })
        };
        let results = [a.await.unwrap(), b.await.unwrap()];

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(TradeError::AlreadyClosed(_)))));
        // one entry + one exit
        assert_eq!(gw.orders().len(), 2);
    }

    #[tokio::test]
    async fn failed_close_leaves_record_open_for_retry() {
        let gw = MockGateway::with_price(100.0);
        let exec = executor(gw.clone());
        let record = exec.open(&proposal("long", 100.0, 110.0, 95.0, 50.0)).await.unwrap();

        gw.fail_orders(true);
        let err = exec.close(&record.trade_id, CloseReason::SlHit).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(exec.store().status(&record.trade_id).await, Some(PositionStatus::Open));

        gw.fail_prices(true);
        gw.fail_orders(false);
        let err = exec.close(&record.trade_id, CloseReason::SlHit).await.unwrap_err();
        assert!(matches!(err, TradeError::OrderPlacement { .. }));
        assert!(err.to_string().contains("exit price unavailable"));
        assert_eq!(gw.orders().len(), 1);

        gw.fail_prices(false);
        assert!(exec.close(&record.trade_id, CloseReason::SlHit).await.is_ok());
        assert!(exec.history().iter().all(|r| r.trade_id == record.trade_id));
    }

    #[tokio::test]
    async fn close_unknown_trade_is_not_found() {
        let exec = executor(MockGateway::with_price(1.0));
        let err = exec.close("nope", CloseReason::Manual).await.unwrap_err();
        assert!(matches!(err, TradeError::NotFound(_)));
    }

    #[tokio::test]
    async fn partial_close_halves_quantity_once_and_blends_pnl() {
        let gw = MockGateway::with_price(100.0);
        let exec = executor_with_cap(gw.clone(), 1000.0);
        let record = exec.open(&proposal("long", 100.0, 120.0, 95.0, 1000.0)).await.unwrap();

        gw.set_price(110.0);
        let outcome = exec.partial_close(&record.trade_id).await.unwrap();
        let PartialCloseOutcome::Executed(after) = outcome else {
            panic!("expected executed partial close");
        };
        assert!((after.quantity - 5.0).abs() < 1e-12);
        assert_eq!(after.status, PositionStatus::PartialClosed);
        assert!(after.partial_closed);
        assert_eq!(after.partial_close_price, Some(110.0));
        assert_eq!(after.partial_close_quantity, Some(5.0));

        // Second request is a no-op that signals already handled.
        assert!(matches!(
            exec.partial_close(&record.trade_id).await.unwrap(),
            PartialCloseOutcome::AlreadyHandled
        ));
        assert_eq!(exec.store().snapshot(&record.trade_id).await.unwrap().quantity, 5.0);

        gw.set_price(121.0);
        let closed = exec.close(&record.trade_id, CloseReason::TpHit).await.unwrap();
        // 5 * 21 + 5 * 10
        assert!((closed.pnl.unwrap() - 155.0).abs() < 1e-9);
        assert!((closed.pnl_percent.unwrap() - 15.5).abs() < 1e-9);
        assert!((gw.orders().pop().unwrap().quantity - 5.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn short_partial_then_close_blends_both_legs() {
        let gw = MockGateway::with_price(100.0);
        let exec = executor_with_cap(gw.clone(), 1000.0);
        let record = exec.open(&proposal("short", 100.0, 80.0, 110.0, 1000.0)).await.unwrap();

        gw.set_price(90.0);
        assert!(matches!(
            exec.partial_close(&record.trade_id).await.unwrap(),
            PartialCloseOutcome::Executed(_)
        ));

        // Final leg closes against the short, above entry.
        gw.set_price(104.0);
        let closed = exec.close(&record.trade_id, CloseReason::SlHit).await.unwrap();
        // 5 * (100 - 90) + 5 * (100 - 104)
        assert!((closed.pnl.unwrap() - 30.0).abs() < 1e-9);
        assert!((closed.pnl_percent.unwrap() - 3.0).abs() < 1e-9);

        let orders = gw.orders();
        assert_eq!(orders.len(), 3);
        assert!(orders[1..].iter().all(|o| o.side == OrderSide::Buy));
        assert!((orders[1].quantity - 5.0).abs() < 1e-12);
        assert!((orders[2].quantity - 5.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn failed_partial_close_leaves_state_untouched() {
        let gw = MockGateway::with_price(100.0);
        let exec = executor(gw.clone());
        let record = exec.open(&proposal("long", 100.0, 120.0, 95.0, 50.0)).await.unwrap();

        gw.fail_orders(true);
        assert!(exec.partial_close(&record.trade_id).await.is_err());
        let snap = exec.store().snapshot(&record.trade_id).await.unwrap();
        assert!(!snap.partial_closed);
        assert_eq!(snap.status, PositionStatus::Open);
        assert!((snap.quantity - 0.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn partial_close_on_closed_trade_is_rejected() {
        let gw = MockGateway::with_price(100.0);
        let exec = executor(gw);
        let record = exec.open(&proposal("long", 100.0, 120.0, 95.0, 50.0)).await.unwrap();
        exec.close(&record.trade_id, CloseReason::Manual).await.unwrap();
        assert!(matches!(
            exec.partial_close(&record.trade_id).await,
            Err(TradeError::AlreadyClosed(_))
        ));
    }

    #[tokio::test]
    async fn status_reports_unrealized_pnl_without_mutating() {
        let gw = MockGateway::with_price(100.0);
        let exec = executor(gw.clone());
        let record = exec.open(&proposal("long", 100.0, 120.0, 95.0, 50.0)).await.unwrap();

        gw.set_price(104.0);
        let before = serde_json::to_string(&exec.store().snapshot(&record.trade_id).await.unwrap()).unwrap();
        for _ in 0..3 {
            let view = exec.status(&record.trade_id).await.unwrap();
            assert_eq!(view.current_price, Some(104.0));
            assert!((view.unrealized_pnl.unwrap() - 2.0).abs() < 1e-9);
            assert!((view.unrealized_pnl_percent.unwrap() - 4.0).abs() < 1e-9);
        }
        let after = serde_json::to_string(&exec.store().snapshot(&record.trade_id).await.unwrap()).unwrap();
        assert_eq!(before, after);

        gw.fail_prices(true);
        let view = exec.status(&record.trade_id).await.unwrap();
        assert_eq!(view.current_price, None);
        assert_eq!(view.unrealized_pnl, None);
    }

    #[tokio::test]
    async fn open_trades_lists_only_active() {
        let gw = MockGateway::with_price(100.0);
        let exec = executor(gw);
        let a = exec.open(&proposal("long", 100.0, 120.0, 95.0, 50.0)).await.unwrap();
        let b = exec.open(&proposal("short", 100.0, 80.0, 105.0, 50.0)).await.unwrap();
        exec.close(&a.trade_id, CloseReason::Manual).await.unwrap();

        let open = exec.open_trades().await;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].trade_id, b.trade_id);

        let closed_view = exec.status(&a.trade_id).await.unwrap();
        assert_eq!(closed_view.current_price, None);
        assert!(closed_view.pnl.is_some());
    }

    #[tokio::test]
    async fn close_hook_receives_finalized_record() {
        let gw = MockGateway::with_price(100.0);
        let exec = executor(gw);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        exec.set_close_hook(Arc::new(move |record: PositionRecord| {
            let _ = tx.send(record);
        }));

        let record = exec.open(&proposal("long", 100.0, 120.0, 95.0, 50.0)).await.unwrap();
        exec.close(&record.trade_id, CloseReason::Manual).await.unwrap();

        let hooked = rx.recv().await.unwrap();
        assert_eq!(hooked.trade_id, record.trade_id);
        assert_eq!(hooked.status, PositionStatus::Closed);
    }
}
