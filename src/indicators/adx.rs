// =============================================================================
// Average Directional Index (ADX) — trend strength regardless of direction
// =============================================================================
//
// Pipeline: per-bar +DM/-DM and True Range, Wilder-smoothed; +DI/-DI derived
// from the smoothed sums; DX = |+DI - -DI| / (+DI + -DI) * 100; ADX is the
// Wilder-smoothed average of DX.
//
// Reading: ADX > 25 trending, ADX < 20 ranging/choppy.
// =============================================================================

use crate::market_data::Candle;

/// Most recent ADX value. Needs at least `2 * period + 1` candles.
pub fn calculate_adx(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < 2 * period + 1 {
        return None;
    }

    let period_f = period as f64;
    let transitions = candles.len() - 1;

    let mut plus_dm = Vec::with_capacity(transitions);
    let mut minus_dm = Vec::with_capacity(transitions);
    let mut tr_vals = Vec::with_capacity(transitions);

    for pair in candles.windows(2) {
        let (prev, curr) = (&pair[0], &pair[1]);

        let tr = (curr.high - curr.low)
            .max((curr.high - prev.close).abs())
            .max((curr.low - prev.close).abs());

        let up_move = curr.high - prev.high;
        let down_move = prev.low - curr.low;

        plus_dm.push(if up_move > down_move && up_move > 0.0 {
            up_move
        } else {
            0.0
        });
        minus_dm.push(if down_move > up_move && down_move > 0.0 {
            down_move
        } else {
            0.0
        });
        tr_vals.push(tr);
    }

    let mut smooth_plus: f64 = plus_dm[..period].iter().sum();
    let mut smooth_minus: f64 = minus_dm[..period].iter().sum();
    let mut smooth_tr: f64 = tr_vals[..period].iter().sum();

    let mut dx_values = vec![dx(smooth_plus, smooth_minus, smooth_tr)?];

    for i in period..transitions {
        smooth_plus = smooth_plus - smooth_plus / period_f + plus_dm[i];
        smooth_minus = smooth_minus - smooth_minus / period_f + minus_dm[i];
        smooth_tr = smooth_tr - smooth_tr / period_f + tr_vals[i];
        dx_values.push(dx(smooth_plus, smooth_minus, smooth_tr)?);
    }

    if dx_values.len() < period {
        return None;
    }

    let mut adx = dx_values[..period].iter().sum::<f64>() / period_f;
    for &v in &dx_values[period..] {
        adx = (adx * (period_f - 1.0) + v) / period_f;
    }

    adx.is_finite().then_some(adx)
}

/// DX from smoothed directional movement and true range.
fn dx(smooth_plus: f64, smooth_minus: f64, smooth_tr: f64) -> Option<f64> {
    if smooth_tr == 0.0 {
        return None;
    }

    let plus_di = smooth_plus / smooth_tr * 100.0;
    let minus_di = smooth_minus / smooth_tr * 100.0;
    let di_sum = plus_di + minus_di;

    if di_sum == 0.0 {
        // No directional movement at all.
        return Some(0.0);
    }

    let value = (plus_di - minus_di).abs() / di_sum * 100.0;
    value.is_finite().then_some(value)
}
