// =============================================================================
// Exits engine — ATR-scaled stop / take-profit / trailing classifier
// =============================================================================
//
// At most one exit reason per evaluation, in priority order for the active
// direction: stop-loss, take-profit, trailing stop. The trailing stop arms
// once the favorable move reaches `trail_start_r` stop-distances and stays
// armed; from then on the high-water mark ratchets and a reversal of
// `trail_atr_mult * atr` from the extreme fires the exit.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::config::StrategyConfig;
use crate::state::PositionState;
use crate::types::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    SlAtr,
    TpAtr,
    TrailAtr,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SlAtr => "SL_ATR",
            Self::TpAtr => "TP_ATR",
            Self::TrailAtr => "TRAIL_ATR",
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify the exit for the current tick, if any.
///
/// Side effects on `state`: the high-water mark (`peak_price` / `low_price`)
/// and the `trailing_active` latch are updated while evaluating. No exit
/// when `atr <= 0` — a stop scaled by a degenerate ATR is meaningless.
pub fn atr_exit_reason(
    state: &mut PositionState,
    price: f64,
    atr: f64,
    cfg: &StrategyConfig,
) -> Option<ExitReason> {
    if atr <= 0.0 {
        return None;
    }
    let direction = state.direction?;

    let sl = cfg.sl_atr_mult * atr;
    let tp = cfg.tp_atr_mult * atr;
    let trail = cfg.trail_atr_mult * atr;
    let entry = state.entry_price;

    match direction {
        Direction::Long => {
            let diff = price - entry;
            if diff <= -sl {
                return Some(ExitReason::SlAtr);
            }
            if diff >= tp {
                return Some(ExitReason::TpAtr);
            }
            if state.trailing_active || diff >= cfg.trail_start_r * sl {
                state.trailing_active = true;
                state.peak_price = state.peak_price.max(price);
                if price <= state.peak_price - trail {
                    return Some(ExitReason::TrailAtr);
                }
            }
        }
        Direction::Short => {
            let diff = entry - price;
            if diff <= -sl {
                return Some(ExitReason::SlAtr);
            }
            if diff >= tp {
                return Some(ExitReason::TpAtr);
            }
            if state.trailing_active || diff >= cfg.trail_start_r * sl {
                state.trailing_active = true;
                state.low_price = state.low_price.min(price);
                if price >= state.low_price + trail {
                    return Some(ExitReason::TrailAtr);
                }
            }
        }
    }

    None
}
