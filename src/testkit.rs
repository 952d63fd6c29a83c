// =============================================================================
// Test doubles for the exchange and indicator collaborators
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::analysis::{IndicatorReadings, IndicatorSource};
use crate::gateway::{OrderAck, OrderRequest, PriceGateway};
use crate::position_store::TradeProposal;

enum PriceSource {
    Fixed(f64),
    /// `prices[k - 1]` is served during the k-th `step` after `start`, so a
    /// monitor polling every `step` sees one path element per check, and a
    /// close issued in the same instant sees the same price.
    Path {
        start: Instant,
        step: Duration,
        prices: Vec<f64>,
    },
}

pub struct MockGateway {
    source: Mutex<PriceSource>,
    orders: Mutex<Vec<OrderRequest>>,
    fail_prices: AtomicBool,
    fail_orders: AtomicBool,
    price_calls: AtomicUsize,
    price_delay: Mutex<Duration>,
}

impl MockGateway {
    fn build(source: PriceSource) -> Arc<Self> {
        Arc::new(Self {
            source: Mutex::new(source),
            orders: Mutex::new(Vec::new()),
            fail_prices: AtomicBool::new(false),
            fail_orders: AtomicBool::new(false),
            price_calls: AtomicUsize::new(0),
            price_delay: Mutex::new(Duration::ZERO),
        })
    }

    pub fn with_price(price: f64) -> Arc<Self> {
        Self::build(PriceSource::Fixed(price))
    }

    pub fn with_path(prices: &[f64], step: Duration) -> Arc<Self> {
        Self::build(PriceSource::Path {
            start: Instant::now(),
            step,
            prices: prices.to_vec(),
        })
    }

    pub fn set_price(&self, price: f64) {
        *self.source.lock() = PriceSource::Fixed(price);
    }

    pub fn fail_prices(&self, fail: bool) {
        self.fail_prices.store(fail, Ordering::SeqCst);
    }

    /// Every price request takes `delay` of (tokio) time to answer.
    pub fn delay_prices(&self, delay: Duration) {
        *self.price_delay.lock() = delay;
    }

    pub fn fail_orders(&self, fail: bool) {
        self.fail_orders.store(fail, Ordering::SeqCst);
    }

    pub fn orders(&self) -> Vec<OrderRequest> {
        self.orders.lock().clone()
    }

    pub fn price_calls(&self) -> usize {
        self.price_calls.load(Ordering::SeqCst)
    }

    fn current(&self) -> f64 {
        match &*self.source.lock() {
            PriceSource::Fixed(p) => *p,
            PriceSource::Path {
                start,
                step,
                prices,
            } => {
                let ticks = (start.elapsed().as_nanos() / step.as_nanos().max(1)) as usize;
                let idx = ticks.saturating_sub(1).min(prices.len().saturating_sub(1));
                prices.get(idx).copied().unwrap_or_default()
            }
        }
    }
}

#[async_trait]
impl PriceGateway for MockGateway {
    async fn price(&self, _symbol: &str) -> Result<f64> {
        self.price_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.price_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_prices.load(Ordering::SeqCst) {
            bail!("price feed unavailable");
        }
        Ok(self.current())
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck> {
        if self.fail_orders.load(Ordering::SeqCst) {
            bail!("order rejected by exchange");
        }
        let mut orders = self.orders.lock();
        orders.push(order.clone());
        Ok(OrderAck {
            order_id: format!("mock-{}", orders.len()),
            simulated: true,
        })
    }

    async fn server_time(&self) -> Result<i64> {
        Ok(chrono::Utc::now().timestamp_millis())
    }
}

/// Indicator source with fixed readings, or a permanent failure.
pub struct MockIndicators {
    readings: Option<IndicatorReadings>,
}

impl MockIndicators {
    pub fn fixed(readings: IndicatorReadings) -> Arc<Self> {
        Arc::new(Self {
            readings: Some(readings),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self { readings: None })
    }
}

#[async_trait]
impl IndicatorSource for MockIndicators {
    async fn snapshot(&self, _symbol: &str) -> Result<IndicatorReadings> {
        match &self.readings {
            Some(r) => Ok(r.clone()),
            None => bail!("analysis service down"),
        }
    }
}

pub fn proposal(strategy: &str, entry: f64, tp: f64, sl: f64, amount: f64) -> TradeProposal {
    TradeProposal {
        symbol: "BTCUSDT".into(),
        strategy: strategy.into(),
        entry_price: entry,
        take_profit: tp,
        stop_loss: sl,
        amount,
        proposal_id: None,
    }
}
