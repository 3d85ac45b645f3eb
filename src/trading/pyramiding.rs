// =============================================================================
// Pyramiding — scale into winners at fixed favorable-move steps
// =============================================================================

use crate::config::StrategyConfig;

/// Whether another add-on level is due at the current favorable `move_frac`.
///
/// The `max_pyramid_levels` clamp lives here so a move that satisfies the
/// step condition can never over-add inside one tick of the caller's loop.
pub fn maybe_pyramid(cfg: &StrategyConfig, move_frac: f64, added_levels: u32) -> bool {
    if !cfg.pyramiding_enabled {
        return false;
    }
    if added_levels >= cfg.max_pyramid_levels {
        return false;
    }
    move_frac >= (added_levels + 1) as f64 * cfg.pyramid_step
}

/// Quote notional of one add-on order.
pub fn pyramid_add_notional(base_notional: f64, cfg: &StrategyConfig) -> f64 {
    base_notional * cfg.pyramid_add_frac
}
