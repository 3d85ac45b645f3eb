// =============================================================================
// Runtime — bootstrap, gates, and the main trading loop
// =============================================================================

pub mod bootstrap;
pub mod gates;
pub mod trading_loop;
