// =============================================================================
// Exponential Moving Average + directional trend score
// =============================================================================

use crate::types::Direction;

/// EMA series for `closes` with the given look-back `period`.
///
/// The first value is seeded with the SMA of the first `period` closes; the
/// output is empty when the input is shorter than `period` or the period is
/// zero.
pub fn calculate_ema(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }

    let multiplier = 2.0 / (period + 1) as f64;

    let seed: f64 = closes[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return Vec::new();
    }

    let mut result = Vec::with_capacity(closes.len() - period + 1);
    result.push(seed);

    let mut prev = seed;
    for &close in &closes[period..] {
        let ema = close * multiplier + prev * (1.0 - multiplier);
        if !ema.is_finite() {
            break;
        }
        result.push(ema);
        prev = ema;
    }

    result
}

/// Directional trend support score in [0, 1] for a given bias.
///
/// Uses the EMA(9)/EMA(21) stack: 0.5 is neutral; agreement between the
/// stack direction and `bias` pushes the score toward 1.0 proportionally to
/// the normalised EMA separation, disagreement pushes it toward 0.0.
///
/// Returns 0.5 (neutral) when there is not enough data for EMA(21).
pub fn trend_score(closes: &[f64], bias: Direction) -> f64 {
    if closes.len() < 21 {
        return 0.5;
    }

    let ema9 = calculate_ema(closes, 9);
    let ema21 = calculate_ema(closes, 21);

    let (Some(&e9), Some(&e21)) = (ema9.last(), ema21.last()) else {
        return 0.5;
    };
    if e21.abs() < f64::EPSILON {
        return 0.5;
    }

    // Separation in percent, saturating at +-2%.
    let separation = ((e9 - e21) / e21 * 100.0).clamp(-2.0, 2.0);
    let support = separation / 2.0 * bias.sign();

    (0.5 + 0.5 * support).clamp(0.0, 1.0)
}
