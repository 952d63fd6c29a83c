// =============================================================================
// Runtime Configuration - engine settings with env overrides and atomic save
// =============================================================================
//
// Every tunable parameter of the executor lives here. All fields carry
// `#[serde(default)]` so that adding new fields never breaks loading an older
// config file. Environment variables are applied on top of the file so a
// deployment can override single values without editing JSON.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.
// =============================================================================

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::exit::policy::ExitParams;
use crate::types::AccountMode;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_monitor_interval_secs() -> u64 {
    30
}

fn default_max_duration_secs() -> u64 {
    14_400
}

fn default_trailing_stop_trigger() -> f64 {
    0.02
}

fn default_trailing_stop_distance() -> f64 {
    0.01
}

fn default_partial_tp_ratio() -> f64 {
    0.5
}

fn default_partial_tp_trigger() -> f64 {
    0.5
}

fn default_max_trade_amount() -> f64 {
    100.0
}

fn default_exchange_base_url() -> String {
    "https://api.mexc.com".to_string()
}

fn default_snapshot_interval() -> String {
    "15m".to_string()
}

fn default_true() -> bool {
    true
}

// =============================================================================
// TradingParams
// =============================================================================

/// Monitoring cadence, adaptive-exit thresholds and the per-trade notional cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingParams {
    /// Seconds between price polls for one trade.
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,

    /// Maximum holding time before a timeout close.
    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: u64,

    /// Unrealized profit fraction that arms the trailing stop (0.02 = 2 %).
    #[serde(default = "default_trailing_stop_trigger")]
    pub trailing_stop_trigger: f64,

    /// Distance of the trailing line from the extremum (0.01 = 1 %).
    #[serde(default = "default_trailing_stop_distance")]
    pub trailing_stop_distance: f64,

    /// Fraction of the remaining quantity sold on partial take-profit.
    #[serde(default = "default_partial_tp_ratio")]
    pub partial_tp_ratio: f64,

    /// Fraction of the entry→TP distance that triggers partial take-profit.
    #[serde(default = "default_partial_tp_trigger")]
    pub partial_tp_trigger: f64,

    /// Policy cap on notional per trade (quote currency).
    #[serde(default = "default_max_trade_amount")]
    pub max_trade_amount: f64,
}

impl Default for TradingParams {
    fn default() -> Self {
        Self {
            monitor_interval_secs: default_monitor_interval_secs(),
            max_duration_secs: default_max_duration_secs(),
            trailing_stop_trigger: default_trailing_stop_trigger(),
            trailing_stop_distance: default_trailing_stop_distance(),
            partial_tp_ratio: default_partial_tp_ratio(),
            partial_tp_trigger: default_partial_tp_trigger(),
            max_trade_amount: default_max_trade_amount(),
        }
    }
}

impl TradingParams {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }

    pub fn exit_params(&self) -> ExitParams {
        ExitParams {
            trailing_stop_trigger: self.trailing_stop_trigger,
            trailing_stop_distance: self.trailing_stop_distance,
            partial_tp_trigger: self.partial_tp_trigger,
        }
    }

    /// Reject values that would make the monitor loop or the exit maths
    /// meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.monitor_interval_secs == 0 {
            anyhow::bail!("monitor_interval_secs must be > 0");
        }
        if self.max_duration_secs == 0 {
            anyhow::bail!("max_duration_secs must be > 0");
        }
        if !(self.trailing_stop_trigger > 0.0) {
            anyhow::bail!("trailing_stop_trigger must be > 0 (got {})", self.trailing_stop_trigger);
        }
        if !(self.trailing_stop_distance > 0.0 && self.trailing_stop_distance < 1.0) {
            anyhow::bail!(
                "trailing_stop_distance must be in (0, 1) (got {})",
                self.trailing_stop_distance
            );
        }
        if !(self.partial_tp_ratio > 0.0 && self.partial_tp_ratio < 1.0) {
            anyhow::bail!("partial_tp_ratio must be in (0, 1) (got {})", self.partial_tp_ratio);
        }
        if !(self.partial_tp_trigger > 0.0) {
            anyhow::bail!("partial_tp_trigger must be > 0 (got {})", self.partial_tp_trigger);
        }
        if !(self.max_trade_amount > 0.0) {
            anyhow::bail!("max_trade_amount must be > 0 (got {})", self.max_trade_amount);
        }
        Ok(())
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Demo: orders simulated locally. Live: orders reach the exchange.
    #[serde(default)]
    pub account_mode: AccountMode,

    /// Root of the `/api/v3` REST surface.
    #[serde(default = "default_exchange_base_url")]
    pub exchange_base_url: String,

    /// Kline interval used for indicator snapshots during monitoring.
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval: String,

    /// Attach RSI / MACD / volume readings to price snapshots.
    #[serde(default = "default_true")]
    pub enable_indicator_snapshots: bool,

    #[serde(default)]
    pub trading: TradingParams,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            account_mode: AccountMode::Demo,
            exchange_base_url: default_exchange_base_url(),
            snapshot_interval: default_snapshot_interval(),
            enable_indicator_snapshots: true,
            trading: TradingParams::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            account_mode = %config.account_mode,
            interval_secs = config.trading.monitor_interval_secs,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup. Unparseable values are
    /// logged and ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let t = &mut self.trading;
        override_value(&lookup, "MONITOR_INTERVAL", &mut t.monitor_interval_secs);
        override_value(&lookup, "MAX_DURATION", &mut t.max_duration_secs);
        override_value(&lookup, "TRAILING_STOP_TRIGGER", &mut t.trailing_stop_trigger);
        override_value(&lookup, "TRAILING_STOP_DISTANCE", &mut t.trailing_stop_distance);
        override_value(&lookup, "PARTIAL_TP_RATIO", &mut t.partial_tp_ratio);
        override_value(&lookup, "PARTIAL_TP_TRIGGER", &mut t.partial_tp_trigger);
        override_value(&lookup, "MAX_TRADE_AMOUNT", &mut t.max_trade_amount);

        if let Some(url) = lookup("EXCHANGE_BASE_URL").filter(|u| !u.trim().is_empty()) {
            self.exchange_base_url = url.trim().trim_end_matches('/').to_string();
        }
    }

    /// Replace invalid trading parameters with defaults.
    pub fn sanitize(&mut self) {
        if let Err(e) = self.trading.validate() {
            warn!(error = %e, "invalid trading parameters, reverting to defaults");
            self.trading = TradingParams::default();
        }
    }
}

fn override_value<F, T>(lookup: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => {
            info!(key, %value, "config override from environment");
            *slot = value;
        }
        Err(_) => warn!(key, raw = %raw, "ignoring unparseable config override"),
    }
}
