// =============================================================================
// Technical Indicators - snapshot readings attached to monitored prices
// =============================================================================
//
// Pure, side-effect-free helpers. Every public function returns `Option<T>` so
// callers handle insufficient data instead of propagating a sentinel.
//
//   RSI          - Wilder's smoothing, seeded with the SMA of the first
//                  `period` gains / losses.
//   EMA          - multiplier 2 / (period + 1), seeded with an SMA.
//   MACD hist    - (EMA12 − EMA26) minus its EMA9 signal line.
//   Volume ratio - last volume / mean of the preceding `lookback` volumes.
// =============================================================================

pub const RSI_PERIOD: usize = 14;
pub const MACD_FAST: usize = 12;
pub const MACD_SLOW: usize = 26;
pub const MACD_SIGNAL: usize = 9;
pub const VOLUME_LOOKBACK: usize = 20;

/// Most recent RSI value, in [0, 100].
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let period_f = period as f64;

    let (sum_gain, sum_loss) = deltas[..period].iter().fold((0.0_f64, 0.0_f64), |(g, l), &d| {
        if d > 0.0 {
            (g + d, l)
        } else {
            (g, l - d)
        }
    });
    let mut avg_gain = sum_gain / period_f;
    let mut avg_loss = sum_loss / period_f;

    for &delta in &deltas[period..] {
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);
        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;
    }

    let value = if avg_gain == 0.0 && avg_loss == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    };
    value.is_finite().then_some(value)
}

/// Full EMA series. Element `i` corresponds to `values[i + period - 1]`.
pub fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let seed = values[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(values.len() - period + 1);
    out.push(seed);
    let mut prev = seed;
    for &v in &values[period..] {
        let next = v * multiplier + prev * (1.0 - multiplier);
        if !next.is_finite() {
            break;
        }
        out.push(next);
        prev = next;
    }
    out
}

/// Latest MACD histogram value.
pub fn macd_histogram(closes: &[f64]) -> Option<f64> {
    let fast = ema_series(closes, MACD_FAST);
    let slow = ema_series(closes, MACD_SLOW);
    if slow.is_empty() {
        return None;
    }

    // Align the fast series to the slow one (both end at the last close).
    let offset = fast.len().checked_sub(slow.len())?;
    let macd_line: Vec<f64> = slow
        .iter()
        .zip(&fast[offset..])
        .map(|(s, f)| f - s)
        .collect();

    let signal = ema_series(&macd_line, MACD_SIGNAL);
    let hist = macd_line.last()? - signal.last()?;
    hist.is_finite().then_some(hist)
}

/// Ratio of the last volume to the mean of the `lookback` volumes before it.
pub fn volume_ratio(volumes: &[f64], lookback: usize) -> Option<f64> {
    if lookback == 0 || volumes.len() < lookback + 1 {
        return None;
    }
    let (last, rest) = volumes.split_last()?;
    let window = &rest[rest.len() - lookback..];
    let mean = window.iter().sum::<f64>() / lookback as f64;
    if mean <= 0.0 {
        return None;
    }
    let ratio = last / mean;
    ratio.is_finite().then_some(ratio)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsi_requires_period_plus_one_closes() {
        assert_eq!(rsi(&[1.0; 14], 14), None);
        assert_eq!(rsi(&[1.0; 15], 0), None);
    }

    #[test]
    fn rsi_extremes() {
        let rising: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        let falling: Vec<f64> = (0..30).map(|i| 100.0 - i as f64).collect();
        assert_eq!(rsi(&rising, 14), Some(100.0));
        assert_eq!(rsi(&falling, 14), Some(0.0));
        assert_eq!(rsi(&[5.0; 30], 14), Some(50.0));
    }

    #[test]
    fn ema_of_constant_is_constant() {
        let series = ema_series(&[3.0; 10], 4);
        assert_eq!(series.len(), 7);
        assert!(series.iter().all(|v| (v - 3.0).abs() < 1e-12));
    }

    #[test]
    fn macd_histogram_needs_enough_data() {
        assert_eq!(macd_histogram(&[1.0; 20]), None);
        let flat = macd_histogram(&[10.0; 60]).unwrap();
        assert!(flat.abs() < 1e-9);
    }

    #[test]
    fn macd_histogram_positive_on_accelerating_uptrend() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + (i as f64).powi(2) * 0.05).collect();
        assert!(macd_histogram(&closes).unwrap() > 0.0);
    }

    #[test]
    fn volume_ratio_against_trailing_mean() {
        let mut volumes = vec![10.0; 20];
        volumes.push(25.0);
        assert!((volume_ratio(&volumes, 20).unwrap() - 2.5).abs() < 1e-12);
        assert_eq!(volume_ratio(&[0.0; 21], 20), None);
        assert_eq!(volume_ratio(&[1.0; 5], 20), None);
    }
}
