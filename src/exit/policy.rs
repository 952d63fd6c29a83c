// =============================================================================
// Exit Policy - hard TP/SL, trailing stop, partial take-profit
// =============================================================================
//
// Evaluation order per tick is fixed:
//
//   1. Hard take-profit / stop-loss      -> full close
//   2. Trailing stop (armed at +trigger) -> full close on retrace past the line
//   3. Partial take-profit               -> close a fraction, keep the runner
//
// A full exit short-circuits everything below it, so a single tick never
// yields both a partial and a full exit. The activation tick of the trailing
// stop never closes.
//
// `evaluate` reads the record and never mutates it. Trailing state changes are
// returned as a `TrailingUpdate` for the caller to apply.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::position_store::PositionRecord;
use crate::types::{CloseReason, Strategy};

/// Thresholds for the adaptive exits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExitParams {
    /// Profit fraction that arms the trailing stop.
    pub trailing_stop_trigger: f64,
    /// Trailing line offset from the extremum, as a fraction.
    pub trailing_stop_distance: f64,
    /// Progress toward TP (fraction of entry→TP distance) that fires partial TP.
    pub partial_tp_trigger: f64,
}

impl Default for ExitParams {
    fn default() -> Self {
        Self {
            trailing_stop_trigger: 0.02,
            trailing_stop_distance: 0.01,
            partial_tp_trigger: 0.5,
        }
    }
}

/// Verdict for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitSignal {
    None,
    TakeProfit,
    StopLoss,
    TrailingStop,
    PartialTakeProfit,
}

impl ExitSignal {
    /// Close reason for the signal, if it calls for any action.
    pub fn close_reason(self) -> Option<CloseReason> {
        match self {
            Self::None => None,
            Self::TakeProfit => Some(CloseReason::TpHit),
            Self::StopLoss => Some(CloseReason::SlHit),
            Self::TrailingStop => Some(CloseReason::TrailingStop),
            Self::PartialTakeProfit => Some(CloseReason::PartialTp),
        }
    }

    /// Whether the signal closes the whole remaining position.
    pub fn is_full_exit(self) -> bool {
        matches!(self, Self::TakeProfit | Self::StopLoss | Self::TrailingStop)
    }
}

/// Trailing-stop state change requested by an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TrailingUpdate {
    Unchanged,
    /// Arm the trailing stop and seed the extremum.
    Activate { extremum: f64 },
    /// Price extended favourably; move the extremum.
    Extend { extremum: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub signal: ExitSignal,
    pub trailing: TrailingUpdate,
}

impl Evaluation {
    fn exit(signal: ExitSignal) -> Self {
        Self {
            signal,
            trailing: TrailingUpdate::Unchanged,
        }
    }
}

/// Evaluate all exit rules for `record` at `price`.
pub fn evaluate(record: &PositionRecord, price: f64, params: &ExitParams) -> Evaluation {
    // --- 1. Hard TP / SL ---------------------------------------------------
    if let Some(signal) = hard_exit(record, price) {
        return Evaluation::exit(signal);
    }

    // --- 2. Trailing stop --------------------------------------------------
    let (trailing_signal, trailing) = trailing_stop(record, price, params);
    if trailing_signal == ExitSignal::TrailingStop {
        return Evaluation {
            signal: ExitSignal::TrailingStop,
            trailing,
        };
    }

    // --- 3. Partial take-profit --------------------------------------------
    let signal = if !record.partial_closed && partial_tp_reached(record, price, params) {
        ExitSignal::PartialTakeProfit
    } else {
        ExitSignal::None
    };

    Evaluation { signal, trailing }
}

fn hard_exit(record: &PositionRecord, price: f64) -> Option<ExitSignal> {
    match record.strategy {
        Strategy::Long => {
            if price >= record.take_profit {
                Some(ExitSignal::TakeProfit)
            } else if price <= record.stop_loss {
                Some(ExitSignal::StopLoss)
            } else {
                None
            }
        }
        Strategy::Short => {
            if price <= record.take_profit {
                Some(ExitSignal::TakeProfit)
            } else if price >= record.stop_loss {
                Some(ExitSignal::StopLoss)
            } else {
                None
            }
        }
    }
}

/// Unrealized profit as a fraction of entry (positive = in profit).
pub fn profit_fraction(record: &PositionRecord, price: f64) -> f64 {
    record.strategy.direction() * (price - record.entry_price) / record.entry_price
}

/// Trailing line for `extremum`.
pub fn trailing_line(strategy: Strategy, extremum: f64, distance: f64) -> f64 {
    match strategy {
        Strategy::Long => extremum * (1.0 - distance),
        Strategy::Short => extremum * (1.0 + distance),
    }
}

fn trailing_stop(
    record: &PositionRecord,
    price: f64,
    params: &ExitParams,
) -> (ExitSignal, TrailingUpdate) {
    if profit_fraction(record, price) < params.trailing_stop_trigger {
        return (ExitSignal::None, TrailingUpdate::Unchanged);
    }

    if !record.trailing_stop_active {
        return (ExitSignal::None, TrailingUpdate::Activate { extremum: price });
    }

    let current = record.extremum().unwrap_or(record.entry_price);
    let extends = match record.strategy {
        Strategy::Long => price > current,
        Strategy::Short => price < current,
    };
    let (extremum, update) = if extends {
        (price, TrailingUpdate::Extend { extremum: price })
    } else {
        (current, TrailingUpdate::Unchanged)
    };

    let line = trailing_line(record.strategy, extremum, params.trailing_stop_distance);
    let retraced = match record.strategy {
        Strategy::Long => price <= line,
        Strategy::Short => price >= line,
    };

    if retraced {
        (ExitSignal::TrailingStop, update)
    } else {
        (ExitSignal::None, update)
    }
}

/// Progress toward TP as a fraction of the entry→TP distance, when both the
/// distance and the current profit are positive.
pub fn tp_progress(record: &PositionRecord, price: f64) -> Option<f64> {
    let dir = record.strategy.direction();
    let tp_distance = dir * (record.take_profit - record.entry_price);
    let current_profit = dir * (price - record.entry_price);
    if tp_distance > 0.0 && current_profit > 0.0 {
        Some(current_profit / tp_distance)
    } else {
        None
    }
}

fn partial_tp_reached(record: &PositionRecord, price: f64, params: &ExitParams) -> bool {
    tp_progress(record, price).is_some_and(|p| p >= params.partial_tp_trigger)
}

// =============================================================================
// Tests
// =============================================================================
