// =============================================================================
// Average True Range (ATR) — Wilder's smoothing
// =============================================================================
//
// TR = max(H - L, |H - prevClose|, |L - prevClose|)
// ATR is seeded with the SMA of the first `period` TR values, then smoothed:
//   ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period
// =============================================================================

use crate::market_data::Candle;

/// Most recent ATR over `candles` (oldest first).
///
/// Returns `None` when `period` is zero, when fewer than `period + 1` candles
/// are available, or when any candle carries a non-finite high/low/close.
pub fn calculate_atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    // `f64::max` discards NaN operands; reject poisoned candles before the
    // TR fold sees them.
    if candles
        .iter()
        .any(|c| !(c.high.is_finite() && c.low.is_finite() && c.close.is_finite()))
    {
        return None;
    }

    let true_ranges: Vec<f64> = candles
        .windows(2)
        .map(|pair| {
            let prev_close = pair[0].close;
            let c = &pair[1];
            (c.high - c.low)
                .max((c.high - prev_close).abs())
                .max((c.low - prev_close).abs())
        })
        .collect();

    let period_f = period as f64;
    let mut atr = true_ranges[..period].iter().sum::<f64>() / period_f;

    for &tr in &true_ranges[period..] {
        atr = (atr * (period_f - 1.0) + tr) / period_f;
    }

    atr.is_finite().then_some(atr)
}

/// ATR expressed as a percentage of the latest close. Comparable across
/// assets with different price scales.
pub fn calculate_atr_pct(candles: &[Candle], period: usize) -> Option<f64> {
    let atr = calculate_atr(candles, period)?;
    let last_close = candles.last()?.close;
    if last_close == 0.0 {
        return None;
    }
    Some((atr / last_close) * 100.0)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            open_time: 0,
            close_time: 0,
            open,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn rejects_period_zero_and_short_input() {
        let candles = vec![candle(100.0, 105.0, 95.0, 102.0); 10];
        assert!(calculate_atr(&candles, 0).is_none());
        assert!(calculate_atr(&candles, 14).is_none());
    }

    #[test]
    fn constant_range_converges() {
        // Every bar spans exactly 10; ATR should sit near 10.
        let candles: Vec<Candle> = (0..40)
            .map(|i| {
                let base = 100.0 + i as f64 * 0.1;
                candle(base, base + 5.0, base - 5.0, base)
            })
            .collect();
        let atr = calculate_atr(&candles, 14).unwrap();
        assert!((atr - 10.0).abs() < 1.0, "expected ATR near 10, got {atr}");
    }

    #[test]
    fn gap_widens_true_range() {
        let candles = vec![
            candle(100.0, 105.0, 95.0, 95.0),
            candle(110.0, 115.0, 108.0, 112.0), // gap: |115 - 95| = 20 > 7
            candle(112.0, 118.0, 110.0, 115.0),
            candle(115.0, 120.0, 113.0, 118.0),
        ];
        let atr = calculate_atr(&candles, 3).unwrap();
        assert!(atr > 7.0, "ATR should reflect the gap, got {atr}");
    }

    #[test]
    fn nan_input_yields_none() {
        let mut candles = vec![candle(100.0, 105.0, 95.0, 100.0); 5];
        candles[2].high = f64::NAN;
        assert!(calculate_atr(&candles, 3).is_none());
    }

    #[test]
    fn nan_close_yields_none() {
        // A NaN previous close still leaves `high - low` finite, so the TR
        // fold alone would not catch it.
        let mut candles = vec![candle(100.0, 105.0, 95.0, 100.0); 5];
        candles[1].close = f64::NAN;
        assert!(calculate_atr(&candles, 3).is_none());
        assert!(calculate_atr_pct(&candles, 3).is_none());
    }

    #[test]
    fn pct_variant_scales_by_close() {
        let candles: Vec<Candle> = (0..30)
            .map(|i| {
                let base = 200.0 + i as f64;
                candle(base, base + 4.0, base - 4.0, base + 1.0)
            })
            .collect();
        let atr = calculate_atr(&candles, 14).unwrap();
        let pct = calculate_atr_pct(&candles, 14).unwrap();
        let last_close = candles.last().unwrap().close;
        assert!((pct - atr / last_close * 100.0).abs() < 1e-9);
    }
}
