// =============================================================================
// Composite scoring — weighted layer blend, quality tiers, risk levels
// =============================================================================
//
// Four evidence layers feed the composite: the pattern itself, the learned
// validation probability, sentiment mapped into the pattern's direction, and
// the fused market context. A layer with zero confidence is excluded and the
// remaining configured weights are renormalised, so a missing model or a dead
// sentiment feed shifts weight to the layers that still have something to
// say.
//
// The per-layer breakdown is kept on the signal; recomputing the composite
// from the breakdown must reproduce the stored score within 1e-6.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::config::EngineConfig;
use crate::detect::PatternCandidate;
use crate::fusion::FusedSignal;
use crate::indicators::calculate_atr;
use crate::market_data::Candle;
use crate::sentiment::SentimentReading;
use crate::types::{Direction, QualityTier};

/// ATR fallback when the context series is too short: 1% of entry.
const ATR_FALLBACK_PCT: f64 = 0.01;
const ATR_PERIOD: usize = 14;

/// Market-context score haircut applied when timeframes diverge.
const DIVERGENCE_PENALTY: f64 = 0.85;

/// One scored evidence layer in the breakdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerScore {
    pub name: String,
    pub score: f64,
    /// Renormalised weight actually applied.
    pub weight: f64,
    pub explanation: String,
}

/// Entry, stop, and target derived from volatility.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RiskLevels {
    pub entry: f64,
    pub stop: f64,
    pub target: f64,
}

/// A fully scored signal ready for dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeSignal {
    pub symbol: String,
    pub timeframe: String,
    pub pattern_name: String,
    pub direction: Direction,
    pub composite_score: f64,
    pub quality_tier: QualityTier,
    pub layer_breakdown: Vec<LayerScore>,
    pub risk: RiskLevels,
    pub created_at: chrono::DateTime<Utc>,
}

/// Everything the scorer needs for one signal.
pub struct ScoreInputs<'a> {
    pub primary: &'a PatternCandidate,
    /// Learned probability for the primary pattern, when a model is active.
    pub validation: Option<f64>,
    pub sentiment: &'a SentimentReading,
    pub fused: &'a FusedSignal,
    pub context_candles: &'a [Candle],
}

/// Pure scorer; all tunables are copied out of the config at build time.
pub struct CompositeScorer {
    layer_weights: HashMap<String, f64>,
    tier_elite: f64,
    tier_high: f64,
    tier_good: f64,
    stop_atr_mult: f64,
    target_atr_mult: f64,
}

struct Layer {
    name: &'static str,
    score: f64,
    confidence: f64,
    explanation: String,
}

impl CompositeScorer {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            layer_weights: config.layer_weights.clone(),
            tier_elite: config.tier_elite,
            tier_high: config.tier_high,
            tier_good: config.tier_good,
            stop_atr_mult: config.stop_atr_mult,
            target_atr_mult: config.target_atr_mult,
        }
    }

    /// Score one candidate against the full evidence set.
    pub fn score(&self, inputs: &ScoreInputs<'_>) -> CompositeSignal {
        let layers = self.build_layers(inputs);

        // Exclude zero-confidence layers, renormalise what remains.
        let active: Vec<&Layer> = layers.iter().filter(|l| l.confidence > 0.0).collect();
        let weight_sum: f64 = active
            .iter()
            .map(|l| self.layer_weights.get(l.name).copied().unwrap_or(0.0))
            .sum();

        let mut breakdown = Vec::with_capacity(active.len());
        let mut composite = 0.0;
        for layer in &active {
            let raw = self.layer_weights.get(layer.name).copied().unwrap_or(0.0);
            let weight = if weight_sum > 0.0 {
                raw / weight_sum
            } else {
                1.0 / active.len() as f64
            };
            composite += layer.score * weight;
            breakdown.push(LayerScore {
                name: layer.name.to_string(),
                score: layer.score,
                weight,
                explanation: layer.explanation.clone(),
            });
        }
        let composite = composite.clamp(0.0, 1.0);

        let quality_tier = self.tier(composite);
        let risk = self.risk_levels(
            inputs.primary.direction,
            inputs.context_candles,
        );

        debug!(
            symbol = %inputs.primary.symbol,
            pattern = %inputs.primary.pattern_name,
            composite = format!("{composite:.3}"),
            tier = %quality_tier,
            layers = breakdown.len(),
            "composite scored"
        );

        CompositeSignal {
            symbol: inputs.primary.symbol.clone(),
            timeframe: inputs.primary.timeframe.clone(),
            pattern_name: inputs.primary.pattern_name.clone(),
            direction: inputs.primary.direction,
            composite_score: composite,
            quality_tier,
            layer_breakdown: breakdown,
            risk,
            created_at: Utc::now(),
        }
    }

    fn build_layers(&self, inputs: &ScoreInputs<'_>) -> Vec<Layer> {
        let primary = inputs.primary;

        let pattern = Layer {
            name: "pattern",
            score: primary.raw_confidence.clamp(0.0, 1.0),
            confidence: 1.0,
            explanation: format!(
                "{} on {} at {:.0}% confidence",
                primary.pattern_name,
                primary.timeframe,
                primary.raw_confidence * 100.0
            ),
        };

        let validation = match inputs.validation {
            Some(prob) => Layer {
                name: "validation",
                score: prob.clamp(0.0, 1.0),
                confidence: 1.0,
                explanation: format!("model probability {:.0}%", prob * 100.0),
            },
            None => Layer {
                name: "validation",
                score: 0.5,
                confidence: 0.0,
                explanation: "no active model".to_string(),
            },
        };

        // Sentiment polarity mapped into the pattern's direction: supportive
        // sentiment pushes above 0.5, opposing below.
        let directional = inputs.sentiment.score * primary.direction.sign();
        let sentiment = Layer {
            name: "sentiment",
            score: (0.5 + 0.5 * directional).clamp(0.0, 1.0),
            confidence: inputs.sentiment.confidence.clamp(0.0, 1.0),
            explanation: format!(
                "polarity {:+.2} across {} source(s)",
                inputs.sentiment.score,
                inputs.sentiment.sources.len()
            ),
        };

        let fused = inputs.fused;
        let mut context_score = 0.7 * fused.fused_score + 0.3 * fused.alignment_score;
        let mut context_note = format!(
            "fused {:.2}, alignment {:.2}, regime {}",
            fused.fused_score,
            fused.alignment_score,
            fused.regime.weight_key()
        );
        if fused.divergence {
            context_score *= DIVERGENCE_PENALTY;
            context_note.push_str(", timeframes diverge");
        }
        let market_context = Layer {
            name: "market_context",
            score: context_score.clamp(0.0, 1.0),
            confidence: 1.0,
            explanation: context_note,
        };

        vec![pattern, validation, sentiment, market_context]
    }

    /// Tier bucket for a composite score.
    pub fn tier(&self, score: f64) -> QualityTier {
        if score >= self.tier_elite {
            QualityTier::Elite
        } else if score >= self.tier_high {
            QualityTier::High
        } else if score >= self.tier_good {
            QualityTier::Good
        } else {
            QualityTier::Moderate
        }
    }

    /// Volatility-based entry/stop/target. Entry is the latest close; when
    /// the series is too short for ATR the fallback is 1% of entry.
    fn risk_levels(&self, direction: Direction, candles: &[Candle]) -> RiskLevels {
        let entry = candles.last().map(|c| c.close).unwrap_or(0.0);
        let atr = calculate_atr(candles, ATR_PERIOD)
            .unwrap_or(entry * ATR_FALLBACK_PCT);
        let sign = direction.sign();
        RiskLevels {
            entry,
            stop: entry - sign * self.stop_atr_mult * atr,
            target: entry + sign * self.target_atr_mult * atr,
        }
    }
}

/// Recompute a composite score from its stored breakdown. Used to verify the
/// breakdown invariant.
pub fn recompute_from_breakdown(breakdown: &[LayerScore]) -> f64 {
    breakdown
        .iter()
        .map(|l| l.score * l.weight)
        .sum::<f64>()
        .clamp(0.0, 1.0)
}
