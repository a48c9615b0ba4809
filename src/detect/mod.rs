// =============================================================================
// Pattern detection — strategy seam plus the merging detector
// =============================================================================
//
// Two strategies ship today: the rule engine (candlestick geometry) and the
// learned classifier (logistic heads over a normalised candle window). The
// detector runs every registered strategy over the same series and merges the
// candidates, recording each one to the detection log.

pub mod learned;
pub mod rules;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::market_data::{Candle, CandleKey};
use crate::store::DetectionLog;
use crate::types::{Direction, PatternSource};

pub use learned::{LearnedClassifier, LogisticSequenceScorer, SequenceScorer};
pub use rules::RuleEngine;

/// A single pattern occurrence before fusion and scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternCandidate {
    pub symbol: String,
    pub timeframe: String,
    pub pattern_name: String,
    pub direction: Direction,
    /// Strategy-local confidence in [0, 1].
    pub raw_confidence: f64,
    pub detected_at: DateTime<Utc>,
    pub source: PatternSource,
}

/// Detection strategy seam. Implementations must be pure over the input
/// series; anything stateful (model lookups) happens through shared handles.
pub trait DetectionStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Candidates found on the given series, oldest candle first. An empty
    /// vec means nothing fired; strategies never error, they fail closed.
    fn detect(&self, key: &CandleKey, candles: &[Candle]) -> Vec<PatternCandidate>;
}

/// Runs all registered strategies and merges their output.
pub struct PatternDetector {
    strategies: Vec<Arc<dyn DetectionStrategy>>,
    log: Arc<dyn DetectionLog>,
}

impl PatternDetector {
    pub fn new(strategies: Vec<Arc<dyn DetectionStrategy>>, log: Arc<dyn DetectionLog>) -> Self {
        Self { strategies, log }
    }

    /// All candidates from all strategies for a series, logged as a side
    /// effect. Candidates are returned in strategy registration order.
    pub fn detect(&self, key: &CandleKey, candles: &[Candle]) -> Vec<PatternCandidate> {
        let mut merged = Vec::new();
        for strategy in &self.strategies {
            let found = strategy.detect(key, candles);
            if !found.is_empty() {
                debug!(
                    series = %key,
                    strategy = strategy.name(),
                    count = found.len(),
                    "patterns detected"
                );
            }
            merged.extend(found);
        }
        for candidate in &merged {
            self.log.record(candidate);
        }
        merged
    }

    /// Every pattern name any registered strategy can emit.
    pub fn catalogue(&self) -> Vec<&'static str> {
        catalogue().to_vec()
    }
}

/// The full pattern vocabulary shared by both strategies and the learner.
pub fn catalogue() -> &'static [&'static str] {
    &[
        "bullish_engulfing",
        "bearish_engulfing",
        "hammer",
        "shooting_star",
        "morning_star",
        "evening_star",
        "three_white_soldiers",
        "three_black_crows",
        "dragonfly_doji",
        "gravestone_doji",
    ]
}

/// Directional bias implied by a pattern name. Unknown names are neutral.
pub fn pattern_direction(name: &str) -> Direction {
    match name {
        "bullish_engulfing" | "hammer" | "morning_star" | "three_white_soldiers"
        | "dragonfly_doji" => Direction::Bullish,
        "bearish_engulfing" | "shooting_star" | "evening_star" | "three_black_crows"
        | "gravestone_doji" => Direction::Bearish,
        _ => Direction::Neutral,
    }
}
