// =============================================================================
// Rule engine — candlestick geometry checks over the newest closed bars
// =============================================================================
//
// Each check inspects the tail of the series only; a candidate always refers
// to the most recent bar. Confidence starts at a fixed base and earns
// increments for confirming context:
//
//   base 0.70
//   +0.10  signal-bar volume above 1.5x the 20-bar average
//   +0.10  pattern fires against the prevailing short-term drift (reversal)
//   +0.05  clean wick structure for the pattern
//   +0.05  dominant body on the signal bar
//   capped at 1.00

use chrono::Utc;
use tracing::trace;

use crate::market_data::{closes, Candle, CandleKey};
use crate::types::{Direction, PatternSource};

use super::{DetectionStrategy, PatternCandidate};

const BASE_CONFIDENCE: f64 = 0.70;
const VOLUME_SURGE_RATIO: f64 = 1.5;

pub struct RuleEngine {
    min_candles: usize,
}

impl RuleEngine {
    pub fn new(min_candles: usize) -> Self {
        Self { min_candles }
    }
}

impl DetectionStrategy for RuleEngine {
    fn name(&self) -> &str {
        "rules"
    }

    fn detect(&self, key: &CandleKey, candles: &[Candle]) -> Vec<PatternCandidate> {
        if candles.len() < self.min_candles {
            trace!(series = %key, len = candles.len(), "below rule engine minimum");
            return Vec::new();
        }

        let mut out = Vec::new();
        let mut push = |name: &str, direction: Direction, hit: Option<Hit>| {
            let Some(hit) = hit else { return };
            out.push(PatternCandidate {
                symbol: key.symbol.clone(),
                timeframe: key.interval.clone(),
                pattern_name: name.to_string(),
                direction,
                raw_confidence: confidence(candles, direction, hit),
                detected_at: Utc::now(),
                source: PatternSource::Rule,
            });
        };

        push("bullish_engulfing", Direction::Bullish, bullish_engulfing(candles));
        push("bearish_engulfing", Direction::Bearish, bearish_engulfing(candles));
        push("hammer", Direction::Bullish, hammer(candles));
        push("shooting_star", Direction::Bearish, shooting_star(candles));
        push("morning_star", Direction::Bullish, morning_star(candles));
        push("evening_star", Direction::Bearish, evening_star(candles));
        push(
            "three_white_soldiers",
            Direction::Bullish,
            three_white_soldiers(candles),
        );
        push("three_black_crows", Direction::Bearish, three_black_crows(candles));
        push("dragonfly_doji", Direction::Bullish, dragonfly_doji(candles));
        push("gravestone_doji", Direction::Bearish, gravestone_doji(candles));

        out
    }
}

/// Pattern-specific quality flags feeding the confidence increments.
#[derive(Clone, Copy)]
struct Hit {
    clean_wicks: bool,
    dominant_body: bool,
}

fn confidence(candles: &[Candle], direction: Direction, hit: Hit) -> f64 {
    let mut score = BASE_CONFIDENCE;

    if volume_surge(candles) {
        score += 0.10;
    }
    if is_reversal_context(candles, direction) {
        score += 0.10;
    }
    if hit.clean_wicks {
        score += 0.05;
    }
    if hit.dominant_body {
        score += 0.05;
    }

    score.min(1.0)
}

/// Signal-bar volume relative to the trailing 20-bar average (excluding the
/// signal bar itself).
fn volume_surge(candles: &[Candle]) -> bool {
    if candles.len() < 21 {
        return false;
    }
    let last = candles.len() - 1;
    let avg: f64 = candles[last - 20..last].iter().map(|c| c.volume).sum::<f64>() / 20.0;
    avg > 0.0 && candles[last].volume > avg * VOLUME_SURGE_RATIO
}

/// True when the short-term drift runs against the pattern direction, i.e.
/// the pattern would be a reversal rather than a continuation.
fn is_reversal_context(candles: &[Candle], direction: Direction) -> bool {
    let prices = closes(candles);
    if prices.len() < 11 {
        return false;
    }
    let last = prices.len() - 1;
    let recent: f64 = prices[last - 5..last].iter().sum::<f64>() / 5.0;
    let earlier: f64 = prices[last - 10..last - 5].iter().sum::<f64>() / 5.0;
    match direction {
        Direction::Bullish => recent < earlier,
        Direction::Bearish => recent > earlier,
        Direction::Neutral => false,
    }
}

fn last_two(candles: &[Candle]) -> Option<(&Candle, &Candle)> {
    let n = candles.len();
    (n >= 2).then(|| (&candles[n - 2], &candles[n - 1]))
}

fn last_three(candles: &[Candle]) -> Option<(&Candle, &Candle, &Candle)> {
    let n = candles.len();
    (n >= 3).then(|| (&candles[n - 3], &candles[n - 2], &candles[n - 1]))
}

fn bullish_engulfing(candles: &[Candle]) -> Option<Hit> {
    let (prev, curr) = last_two(candles)?;
    let fires = prev.is_bearish()
        && curr.is_bullish()
        && curr.open <= prev.close
        && curr.close >= prev.open
        && curr.body() > prev.body();
    fires.then(|| Hit {
        clean_wicks: curr.upper_wick() < curr.body() * 0.5,
        dominant_body: curr.body_ratio() > 0.6,
    })
}

fn bearish_engulfing(candles: &[Candle]) -> Option<Hit> {
    let (prev, curr) = last_two(candles)?;
    let fires = prev.is_bullish()
        && curr.is_bearish()
        && curr.open >= prev.close
        && curr.close <= prev.open
        && curr.body() > prev.body();
    fires.then(|| Hit {
        clean_wicks: curr.lower_wick() < curr.body() * 0.5,
        dominant_body: curr.body_ratio() > 0.6,
    })
}

fn hammer(candles: &[Candle]) -> Option<Hit> {
    let curr = candles.last()?;
    let body = curr.body();
    if body <= 0.0 || curr.range() <= 0.0 {
        return None;
    }
    let fires = curr.lower_wick() >= body * 2.0 && curr.upper_wick() <= body * 0.5;
    fires.then(|| Hit {
        clean_wicks: curr.upper_wick() <= body * 0.2,
        dominant_body: curr.lower_wick() >= body * 3.0,
    })
}

fn shooting_star(candles: &[Candle]) -> Option<Hit> {
    let curr = candles.last()?;
    let body = curr.body();
    if body <= 0.0 || curr.range() <= 0.0 {
        return None;
    }
    let fires = curr.upper_wick() >= body * 2.0 && curr.lower_wick() <= body * 0.5;
    fires.then(|| Hit {
        clean_wicks: curr.lower_wick() <= body * 0.2,
        dominant_body: curr.upper_wick() >= body * 3.0,
    })
}

fn morning_star(candles: &[Candle]) -> Option<Hit> {
    let (first, star, third) = last_three(candles)?;
    let fires = first.is_bearish()
        && first.body_ratio() > 0.5
        && star.body_ratio() < 0.3
        && star.body() < first.body() * 0.5
        && third.is_bullish()
        && third.close > (first.open + first.close) / 2.0;
    fires.then(|| Hit {
        clean_wicks: star.range() < first.range(),
        dominant_body: third.body_ratio() > 0.6,
    })
}

fn evening_star(candles: &[Candle]) -> Option<Hit> {
    let (first, star, third) = last_three(candles)?;
    let fires = first.is_bullish()
        && first.body_ratio() > 0.5
        && star.body_ratio() < 0.3
        && star.body() < first.body() * 0.5
        && third.is_bearish()
        && third.close < (first.open + first.close) / 2.0;
    fires.then(|| Hit {
        clean_wicks: star.range() < first.range(),
        dominant_body: third.body_ratio() > 0.6,
    })
}

fn dragonfly_doji(candles: &[Candle]) -> Option<Hit> {
    let curr = candles.last()?;
    let range = curr.range();
    if range <= 0.0 {
        return None;
    }
    let fires = curr.body_ratio() < 0.1 && curr.lower_wick() >= range * 0.6;
    fires.then(|| Hit {
        clean_wicks: curr.upper_wick() <= range * 0.1,
        dominant_body: curr.lower_wick() >= range * 0.75,
    })
}

fn gravestone_doji(candles: &[Candle]) -> Option<Hit> {
    let curr = candles.last()?;
    let range = curr.range();
    if range <= 0.0 {
        return None;
    }
    let fires = curr.body_ratio() < 0.1 && curr.upper_wick() >= range * 0.6;
    fires.then(|| Hit {
        clean_wicks: curr.lower_wick() <= range * 0.1,
        dominant_body: curr.upper_wick() >= range * 0.75,
    })
}

fn three_white_soldiers(candles: &[Candle]) -> Option<Hit> {
    let (a, b, c) = last_three(candles)?;
    let fires = a.is_bullish()
        && b.is_bullish()
        && c.is_bullish()
        && b.close > a.close
        && c.close > b.close
        && b.open >= a.open
        && c.open >= b.open
        && a.body_ratio() > 0.4
        && b.body_ratio() > 0.4
        && c.body_ratio() > 0.4;
    fires.then(|| Hit {
        clean_wicks: c.upper_wick() < c.body() * 0.3,
        dominant_body: c.body() >= b.body(),
    })
}

fn three_black_crows(candles: &[Candle]) -> Option<Hit> {
    let (a, b, c) = last_three(candles)?;
    let fires = a.is_bearish()
        && b.is_bearish()
        && c.is_bearish()
        && b.close < a.close
        && c.close < b.close
        && b.open <= a.open
        && c.open <= b.open
        && a.body_ratio() > 0.4
        && b.body_ratio() > 0.4
        && c.body_ratio() > 0.4;
    fires.then(|| Hit {
        clean_wicks: c.lower_wick() < c.body() * 0.3,
        dominant_body: c.body() >= b.body(),
    })
}
