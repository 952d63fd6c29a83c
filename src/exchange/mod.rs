// =============================================================================
// Exchange Connectivity
// =============================================================================
//
// REST client for a Binance-compatible spot `/api/v3` surface (MEXC by
// default). Implements the `PriceGateway` boundary used by the executor.

pub mod client;

pub use client::{ExchangeClient, Kline};
