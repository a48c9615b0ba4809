// =============================================================================
// Market Regime Classification
// =============================================================================
//
// Classifies a symbol's current behaviour into one of three regimes, used to
// select the fusion weight table. Evaluated top-to-bottom; first match wins:
//
//   1. VOLATILE — ATR% above 4.0 (expansion, wide swings)
//   2. TRENDING — ADX above 25 (persistent directional move)
//   3. RANGING  — ADX below 20 (mean-reverting chop)
//
// Anything in between is ambiguous and falls back to the "default" weight
// table with low confidence.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::indicators::{calculate_adx, calculate_atr_pct};
use crate::market_data::Candle;

/// High-level market regime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarketRegime {
    Trending,
    Ranging,
    Volatile,
}

impl MarketRegime {
    /// Key into the configured per-regime weight tables.
    pub fn weight_key(self) -> &'static str {
        match self {
            Self::Trending => "trending",
            Self::Ranging => "ranging",
            Self::Volatile => "volatile",
        }
    }
}

impl std::fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trending => write!(f, "TRENDING"),
            Self::Ranging => write!(f, "RANGING"),
            Self::Volatile => write!(f, "VOLATILE"),
        }
    }
}

/// Classification result plus the contributing metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeState {
    /// Classified regime; `None` when the rules are ambiguous (callers use
    /// the default weight table).
    pub regime: Option<MarketRegime>,
    pub adx: f64,
    pub atr_pct: f64,
    pub confidence: f64,
}

impl RegimeState {
    /// Weight-table key for this state, `"default"` when ambiguous.
    pub fn weight_key(&self) -> &'static str {
        self.regime.map_or("default", MarketRegime::weight_key)
    }
}

/// Classify the regime from the given candle history (oldest first).
///
/// Works from ADX(14) and ATR% (14); with too little history both indicators
/// read as neutral and the default table applies.
pub fn classify(candles: &[Candle]) -> RegimeState {
    let adx = calculate_adx(candles, 14).unwrap_or(0.0);
    let atr_pct = calculate_atr_pct(candles, 14).unwrap_or(0.0);

    let (regime, confidence) = decide(adx, atr_pct);

    debug!(
        regime = %regime.map(|r| r.to_string()).unwrap_or_else(|| "DEFAULT".into()),
        adx = format!("{adx:.2}"),
        atr_pct = format!("{atr_pct:.3}"),
        confidence = format!("{confidence:.2}"),
        "regime classified"
    );

    RegimeState {
        regime,
        adx,
        atr_pct,
        confidence,
    }
}

fn decide(adx: f64, atr_pct: f64) -> (Option<MarketRegime>, f64) {
    // 1. VOLATILE — expansion dominates everything else.
    if atr_pct > 4.0 {
        let confidence = remap(atr_pct, 4.0, 8.0, 0.65, 1.0);
        return (Some(MarketRegime::Volatile), confidence);
    }

    // 2. TRENDING — persistent directional strength.
    if adx > 25.0 {
        let confidence = remap(adx, 25.0, 50.0, 0.60, 1.0);
        return (Some(MarketRegime::Trending), confidence);
    }

    // 3. RANGING — weak directional movement.
    if adx < 20.0 {
        let confidence = remap(adx, 20.0, 5.0, 0.50, 1.0);
        return (Some(MarketRegime::Ranging), confidence);
    }

    // Ambiguous band (ADX 20..25): defer to the default table.
    (None, 0.30)
}

/// Linearly remap `value` from `[in_lo, in_hi]` to `[out_lo, out_hi]`,
/// clamped to the output range. Input bounds may be in either order.
fn remap(value: f64, in_lo: f64, in_hi: f64, out_lo: f64, out_hi: f64) -> f64 {
    let t = if (in_hi - in_lo).abs() < f64::EPSILON {
        0.5
    } else {
        (value - in_lo) / (in_hi - in_lo)
    };
    out_lo + t.clamp(0.0, 1.0) * (out_hi - out_lo)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volatile_wins_over_trending() {
        let (regime, conf) = decide(40.0, 6.0);
        assert_eq!(regime, Some(MarketRegime::Volatile));
        assert!(conf >= 0.65);
    }

    #[test]
    fn trending_classification() {
        let (regime, _) = decide(35.0, 1.5);
        assert_eq!(regime, Some(MarketRegime::Trending));
    }

    #[test]
    fn ranging_classification() {
        let (regime, _) = decide(12.0, 1.0);
        assert_eq!(regime, Some(MarketRegime::Ranging));
    }

    #[test]
    fn ambiguous_band_is_default() {
        let (regime, conf) = decide(22.0, 1.0);
        assert_eq!(regime, None);
        assert!((conf - 0.30).abs() < 1e-12);
    }

    #[test]
    fn weight_keys() {
        assert_eq!(MarketRegime::Trending.weight_key(), "trending");
        let state = RegimeState {
            regime: None,
            adx: 22.0,
            atr_pct: 1.0,
            confidence: 0.3,
        };
        assert_eq!(state.weight_key(), "default");
    }

    #[test]
    fn classify_with_no_data_uses_default() {
        let state = classify(&[]);
        assert_eq!(state.regime, Some(MarketRegime::Ranging)); // adx 0 < 20
        assert!(state.adx.abs() < f64::EPSILON);
    }

    #[test]
    fn remap_clamps() {
        assert!((remap(0.5, 0.0, 1.0, 0.0, 10.0) - 5.0).abs() < 1e-12);
        assert!((remap(2.0, 0.0, 1.0, 0.0, 10.0) - 10.0).abs() < 1e-12);
        assert!((remap(-1.0, 0.0, 1.0, 0.0, 10.0)).abs() < 1e-12);
    }
}
