// =============================================================================
// Gates — startup admission and runtime pause reasons
// =============================================================================

use crate::types::BotContext;

/// Why the loop must idle instead of trade. First matching reason wins.
pub fn pause_reason(ctx: &BotContext) -> Option<&'static str> {
    if !ctx.subscription_active() {
        return Some("subscription_inactive");
    }
    if ctx.control_config.kill_switch {
        return Some("kill_switch");
    }
    if !ctx.control_config.trading_enabled {
        return Some("trading_disabled");
    }
    if ctx.control_config.pause_requested {
        return Some("pause_requested");
    }
    None
}

/// Whether the bot may start at all. `Err` carries the blocking reason.
pub fn startup_gate(ctx: &BotContext) -> Result<(), &'static str> {
    if !ctx.subscription_active() {
        return Err("subscription_not_active");
    }
    if ctx.control_config.admin_override {
        return Err("admin_override");
    }
    if ctx.control_config.kill_switch {
        return Err("kill_switch");
    }
    if !ctx.control_config.trading_enabled {
        return Err("trading_disabled");
    }
    Ok(())
}
