// =============================================================================
// Indicator snapshots - best-effort readings for price history enrichment
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::exchange::ExchangeClient;
use crate::indicators;

/// Readings attached to a price snapshot. Any field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndicatorReadings {
    pub rsi: Option<f64>,
    pub macd_histogram: Option<f64>,
    pub volume_ratio: Option<f64>,
}

/// External analysis collaborator. Failures are swallowed by the monitor.
#[async_trait]
pub trait IndicatorSource: Send + Sync {
    async fn snapshot(&self, symbol: &str) -> Result<IndicatorReadings>;
}

/// Number of candles requested per snapshot.
const SNAPSHOT_CANDLES: u32 = 50;

/// Computes readings from recent klines fetched over REST.
pub struct KlineAnalyzer {
    client: Arc<ExchangeClient>,
    interval: String,
}

impl KlineAnalyzer {
    pub fn new(client: Arc<ExchangeClient>, interval: impl Into<String>) -> Self {
        Self {
            client,
            interval: interval.into(),
        }
    }
}

#[async_trait]
impl IndicatorSource for KlineAnalyzer {
    async fn snapshot(&self, symbol: &str) -> Result<IndicatorReadings> {
        let klines = self
            .client
            .get_klines(symbol, &self.interval, SNAPSHOT_CANDLES)
            .await
            .with_context(|| format!("indicator snapshot for {symbol}"))?;

        let closes: Vec<f64> = klines.iter().map(|k| k.close).collect();
        let volumes: Vec<f64> = klines.iter().map(|k| k.volume).collect();
        Ok(readings_from_series(&closes, &volumes))
    }
}

pub fn readings_from_series(closes: &[f64], volumes: &[f64]) -> IndicatorReadings {
    IndicatorReadings {
        rsi: indicators::rsi(closes, indicators::RSI_PERIOD),
        macd_histogram: indicators::macd_histogram(closes),
        volume_ratio: indicators::volume_ratio(volumes, indicators::VOLUME_LOOKBACK),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_series_yields_absent_readings() {
        let r = readings_from_series(&[1.0, 2.0, 3.0], &[1.0, 1.0, 1.0]);
        assert_eq!(r, IndicatorReadings::default());
    }

    #[test]
    fn full_series_yields_all_readings() {
        let closes: Vec<f64> = (0..50).map(|i| 100.0 + (i % 7) as f64).collect();
        let volumes = vec![5.0; 50];
        let r = readings_from_series(&closes, &volumes);
        assert!(r.rsi.is_some());
        assert!(r.macd_histogram.is_some());
        assert_eq!(r.volume_ratio, Some(1.0));
    }
}
