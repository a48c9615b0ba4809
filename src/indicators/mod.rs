// =============================================================================
// Technical indicators used by regime detection and risk sizing
// =============================================================================

pub mod adx;
pub mod atr;
pub mod ema;

pub use adx::calculate_adx;
pub use atr::{calculate_atr, calculate_atr_pct};
pub use ema::{calculate_ema, trend_score};
