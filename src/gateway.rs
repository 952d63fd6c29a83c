// =============================================================================
// Price / Order Gateway - the exchange boundary seen by the executor
// =============================================================================

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{OrderSide, OrderType};

/// An order to be submitted to the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    /// Required for limit orders; ignored for market orders.
    pub price: Option<f64>,
}

impl OrderRequest {
    pub fn limit(symbol: &str, side: OrderSide, quantity: f64, price: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Limit,
            quantity,
            price: Some(price),
        }
    }

    pub fn market(symbol: &str, side: OrderSide, quantity: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
        }
    }
}

/// Acknowledgement of an accepted order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    /// `true` when the fill was simulated locally (demo mode).
    #[serde(default)]
    pub simulated: bool,
}

/// Pure I/O boundary to the exchange. Implementations carry no trade logic.
#[async_trait]
pub trait PriceGateway: Send + Sync {
    /// Last traded price for `symbol`.
    async fn price(&self, symbol: &str) -> Result<f64>;

    /// Submit an order. Fails on rejection or network error.
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck>;

    /// Exchange server time in epoch milliseconds.
    async fn server_time(&self) -> Result<i64>;
}
