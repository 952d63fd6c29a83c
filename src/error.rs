// =============================================================================
// Trade errors - surfaced synchronously to callers of open / close
// =============================================================================

use thiserror::Error;

/// Errors produced by the trade lifecycle.
#[derive(Error, Debug)]
pub enum TradeError {
    /// Proposal rejected before any order was sent.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The gateway rejected or failed an order. Open aborts with no record;
    /// close / partial close leave the record untouched.
    #[error("Order placement failed for {context}: {source}")]
    OrderPlacement {
        context: String,
        #[source]
        source: anyhow::Error,
    },

    /// Price could not be fetched. Transient.
    #[error("Price fetch failed for {symbol}: {source}")]
    PriceFetch {
        symbol: String,
        #[source]
        source: anyhow::Error,
    },

    /// Attempted to act on a record that is already closed.
    #[error("Trade {0} is already closed")]
    AlreadyClosed(String),

    #[error("Trade not found: {0}")]
    NotFound(String),
}

impl TradeError {
    /// Placement and price failures can be retried on a later tick.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::OrderPlacement { .. } | Self::PriceFetch { .. })
    }
}

pub type Result<T> = std::result::Result<T, TradeError>;
