// =============================================================================
// Learned classifier — logistic pattern heads over a normalised candle window
// =============================================================================
//
// The scorer extracts a fixed-width feature window from the newest candles
// and asks the active model snapshot for per-pattern probabilities. The
// classifier wraps that behind the strategy seam and emits a candidate for
// every pattern whose probability clears the gate.
//
// Fails closed: no active model, or too little history, means no scores and
// therefore no learned candidates.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::trace;

use crate::market_data::{Candle, CandleKey};
use crate::model::ModelStore;
use crate::types::PatternSource;

use super::{pattern_direction, DetectionStrategy, PatternCandidate};

/// Per-candle feature count in the window layout.
pub(crate) const FEATURES_PER_CANDLE: usize = 4;

/// Scores a candle series against the learned pattern heads.
pub trait SequenceScorer: Send + Sync {
    /// Per-pattern probabilities for the series tail. Empty map when no
    /// model is available or the series is too short.
    fn score(&self, candles: &[Candle]) -> HashMap<String, f64>;

    /// Feature vector the scorer would feed the model, for capture on fired
    /// alerts. Empty when the series is too short.
    fn features(&self, candles: &[Candle]) -> Vec<f64>;
}

/// Production scorer backed by the shared [`ModelStore`].
pub struct LogisticSequenceScorer {
    store: Arc<ModelStore>,
    namespace: String,
    window: usize,
}

impl LogisticSequenceScorer {
    pub fn new(store: Arc<ModelStore>, namespace: impl Into<String>, window: usize) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            window,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn window(&self) -> usize {
        self.window
    }
}

impl SequenceScorer for LogisticSequenceScorer {
    fn score(&self, candles: &[Candle]) -> HashMap<String, f64> {
        let Some(snapshot) = self.store.active(&self.namespace) else {
            trace!(namespace = %self.namespace, "no active model, learned scoring skipped");
            return HashMap::new();
        };
        let features = window_features(candles, self.window);
        if features.is_empty() {
            return HashMap::new();
        }
        snapshot.predict_all(&features)
    }

    fn features(&self, candles: &[Candle]) -> Vec<f64> {
        window_features(candles, self.window)
    }
}

/// Normalised feature vector over the newest `window` candles.
///
/// Per candle, in order: signed body as a fraction of open, range as a
/// fraction of open, close position within the range, and volume relative to
/// the window mean. Fractions are clamped to tame outliers so weights stay
/// comparable across symbols. Empty when fewer than `window` candles exist.
pub(crate) fn window_features(candles: &[Candle], window: usize) -> Vec<f64> {
    if window == 0 || candles.len() < window {
        return Vec::new();
    }
    let tail = &candles[candles.len() - window..];

    let mean_volume = tail.iter().map(|c| c.volume).sum::<f64>() / window as f64;

    let mut out = Vec::with_capacity(window * FEATURES_PER_CANDLE);
    for c in tail {
        let open = if c.open.abs() < f64::EPSILON { 1.0 } else { c.open };

        out.push(((c.close - c.open) / open).clamp(-0.2, 0.2) * 5.0);
        out.push((c.range() / open).clamp(0.0, 0.2) * 5.0);
        out.push(if c.range() > 0.0 {
            (c.close - c.low) / c.range()
        } else {
            0.5
        });
        out.push(if mean_volume > 0.0 {
            (c.volume / mean_volume).clamp(0.0, 3.0) / 3.0
        } else {
            0.0
        });
    }
    out
}

/// Strategy adapter: learned probabilities above the gate become candidates.
pub struct LearnedClassifier {
    scorer: Arc<dyn SequenceScorer>,
    gate: f64,
}

impl LearnedClassifier {
    pub fn new(scorer: Arc<dyn SequenceScorer>, gate: f64) -> Self {
        Self { scorer, gate }
    }
}

impl DetectionStrategy for LearnedClassifier {
    fn name(&self) -> &str {
        "learned"
    }

    fn detect(&self, key: &CandleKey, candles: &[Candle]) -> Vec<PatternCandidate> {
        let mut found: Vec<PatternCandidate> = self
            .scorer
            .score(candles)
            .into_iter()
            .filter(|(_, prob)| *prob >= self.gate)
            .map(|(pattern, prob)| PatternCandidate {
                symbol: key.symbol.clone(),
                timeframe: key.interval.clone(),
                pattern_name: pattern.clone(),
                direction: pattern_direction(&pattern),
                raw_confidence: prob,
                detected_at: Utc::now(),
                source: PatternSource::Learned,
            })
            .collect();
        // HashMap iteration order is arbitrary; keep output stable.
        found.sort_by(|a, b| a.pattern_name.cmp(&b.pattern_name));
        found
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelSnapshot, ModelStatus, ModelVersion, PatternHead};
    use crate::types::Direction;

    fn candle(open: f64, close: f64) -> Candle {
        Candle {
            open_time: 0,
            close_time: 3_600_000,
            open,
            high: open.max(close) + 0.5,
            low: open.min(close) - 0.5,
            close,
            volume: 100.0,
        }
    }

    fn series(len: usize) -> Vec<Candle> {
        (0..len)
            .map(|i| candle(100.0 + i as f64, 100.5 + i as f64))
            .collect()
    }

    fn promoted_store(window: usize, bias: f64) -> Arc<ModelStore> {
        let store = Arc::new(ModelStore::new());
        let mut heads = HashMap::new();
        heads.insert(
            "hammer".to_string(),
            PatternHead {
                weights: vec![0.0; window * FEATURES_PER_CANDLE],
                bias,
            },
        );
        store.promote(ModelSnapshot {
            version: ModelVersion {
                namespace: "seq16".to_string(),
                version: 1,
                trained_at: Utc::now(),
                metric: 0.6,
                status: ModelStatus::Candidate,
            },
            feature_dim: window * FEATURES_PER_CANDLE,
            heads,
        });
        store
    }

    #[test]
    fn no_model_means_no_scores() {
        let scorer = LogisticSequenceScorer::new(Arc::new(ModelStore::new()), "seq16", 4);
        assert!(scorer.score(&series(10)).is_empty());
    }

    #[test]
    fn short_series_means_no_scores() {
        let scorer = LogisticSequenceScorer::new(promoted_store(8, 2.0), "seq16", 8);
        assert!(scorer.score(&series(4)).is_empty());
        assert!(scorer.features(&series(4)).is_empty());
    }

    #[test]
    fn window_features_layout() {
        let feats = window_features(&series(10), 4);
        assert_eq!(feats.len(), 4 * FEATURES_PER_CANDLE);
        for f in &feats {
            assert!(f.is_finite());
        }
    }

    #[test]
    fn classifier_respects_gate() {
        // bias 2.0 -> sigmoid ~0.88, clears a 0.55 gate.
        let store = promoted_store(4, 2.0);
        let scorer = Arc::new(LogisticSequenceScorer::new(store, "seq16", 4));
        let key = CandleKey::new("BTCUSDT", "1h");

        let pass = LearnedClassifier::new(scorer.clone(), 0.55);
        let found = pass.detect(&key, &series(10));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].pattern_name, "hammer");
        assert_eq!(found[0].direction, Direction::Bullish);
        assert_eq!(found[0].source, PatternSource::Learned);
        assert!(found[0].raw_confidence > 0.85);

        let strict = LearnedClassifier::new(scorer, 0.95);
        assert!(strict.detect(&key, &series(10)).is_empty());
    }

    #[test]
    fn fails_closed_without_model() {
        let scorer = Arc::new(LogisticSequenceScorer::new(
            Arc::new(ModelStore::new()),
            "seq16",
            4,
        ));
        let classifier = LearnedClassifier::new(scorer, 0.1);
        let key = CandleKey::new("BTCUSDT", "1h");
        assert!(classifier.detect(&key, &series(10)).is_empty());
    }
}
