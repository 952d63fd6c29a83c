// =============================================================================
// Exit Management Module
// =============================================================================
//
// Pure exit evaluation (hard TP/SL, trailing stop, partial take-profit) and the
// per-trade monitor tasks that poll prices and act on its verdicts.

pub mod policy;
pub mod monitor;
