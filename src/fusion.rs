// =============================================================================
// Multi-timeframe fusion — regime-weighted blend of per-timeframe evidence
// =============================================================================
//
// For one symbol, fetch and detect on every configured timeframe
// concurrently, then blend the per-timeframe scores using the weight table
// selected by the classified regime. Timeframes that fail to fetch are
// excluded and the remaining weights are renormalised, so one dead feed
// degrades the signal instead of killing it. All timeframes failing is a
// hard error.
//
// Per-timeframe score: 0.6 * best candidate confidence + 0.4 * trend support
// in the candidate's direction. A timeframe with no candidates still
// contributes its (neutral) trend component.

use std::sync::Arc;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::detect::{PatternCandidate, PatternDetector};
use crate::error::SignalError;
use crate::gateway::ProviderGateway;
use crate::indicators::trend_score;
use crate::market_data::{closes, Candle, CandleKey};
use crate::regime::{classify, RegimeState};
use crate::types::Direction;

const CANDIDATE_COMPONENT: f64 = 0.6;
const TREND_COMPONENT: f64 = 0.4;

/// Score and weight for one timeframe that contributed to the fusion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeframeScore {
    pub timeframe: String,
    pub score: f64,
    /// Renormalised weight actually applied.
    pub weight: f64,
    pub candidates: usize,
}

/// The fused view of one symbol across all available timeframes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusedSignal {
    pub symbol: String,
    pub fused_score: f64,
    /// 1.0 when all timeframes agree, falling toward 0.0 as they spread.
    pub alignment_score: f64,
    /// Set when the per-timeframe spread exceeds the divergence threshold.
    pub divergence: bool,
    pub regime: RegimeState,
    pub per_timeframe: Vec<TimeframeScore>,
    /// Strongest candidate across timeframes, weighted by its timeframe.
    pub primary: Option<PatternCandidate>,
}

/// Fusion result plus the candle context needed downstream for risk levels
/// and model features.
#[derive(Debug, Clone)]
pub struct FusionOutcome {
    pub signal: FusedSignal,
    /// Candles of the primary candidate's timeframe (longest available
    /// timeframe when nothing fired).
    pub context_candles: Vec<Candle>,
}

pub struct FusionEngine {
    gateway: Arc<ProviderGateway>,
    detector: Arc<PatternDetector>,
    config: Arc<EngineConfig>,
}

struct TimeframeEvidence {
    timeframe: String,
    candles: Vec<Candle>,
    candidates: Vec<PatternCandidate>,
}

impl FusionEngine {
    pub fn new(
        gateway: Arc<ProviderGateway>,
        detector: Arc<PatternDetector>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            gateway,
            detector,
            config,
        }
    }

    /// Full fusion pass for one symbol.
    pub async fn analyze(&self, symbol: &str) -> Result<FusionOutcome, SignalError> {
        let fetches = self.config.timeframes.iter().map(|tf| {
            let tf = tf.clone();
            async move {
                let result = self
                    .gateway
                    .fetch(symbol, &tf, self.config.lookback)
                    .await;
                (tf, result)
            }
        });

        let mut evidence = Vec::new();
        for (tf, result) in join_all(fetches).await {
            match result {
                Ok(candles) => {
                    let key = CandleKey::new(symbol, tf.clone());
                    let candidates = self.detector.detect(&key, &candles);
                    evidence.push(TimeframeEvidence {
                        timeframe: tf,
                        candles,
                        candidates,
                    });
                }
                Err(e) => {
                    warn!(symbol, timeframe = %tf, error = %e, "timeframe excluded from fusion");
                }
            }
        }

        if evidence.is_empty() {
            return Err(SignalError::DataUnavailable {
                symbol: symbol.to_string(),
                interval: self.config.timeframes.join(","),
            });
        }

        // Regime comes from the longest available timeframe, which is the
        // last one in the configured shortest-first ordering.
        let regime = classify(&evidence.last().map(|e| e.candles.clone()).unwrap_or_default());

        let table = self.config.timeframe_weights(regime.weight_key());
        let raw_weights: Vec<f64> = evidence
            .iter()
            .map(|e| table.get(&e.timeframe).copied().unwrap_or(0.0))
            .collect();
        let weight_sum: f64 = raw_weights.iter().sum();

        // Renormalise over the timeframes that actually survived; an
        // all-zero table degenerates to equal weights.
        let weights: Vec<f64> = if weight_sum > 0.0 {
            raw_weights.iter().map(|w| w / weight_sum).collect()
        } else {
            vec![1.0 / evidence.len() as f64; evidence.len()]
        };

        let scores: Vec<f64> = evidence.iter().map(score_timeframe).collect();

        let fused_score: f64 = scores
            .iter()
            .zip(&weights)
            .map(|(s, w)| s * w)
            .sum();

        let alignment_score = alignment(&scores);
        let spread = spread(&scores);
        let divergence = spread > self.config.divergence_threshold;

        let per_timeframe: Vec<TimeframeScore> = evidence
            .iter()
            .zip(scores.iter().zip(&weights))
            .map(|(e, (score, weight))| TimeframeScore {
                timeframe: e.timeframe.clone(),
                score: *score,
                weight: *weight,
                candidates: e.candidates.len(),
            })
            .collect();

        // Primary = strongest candidate weighted by its timeframe's pull.
        let primary = evidence
            .iter()
            .zip(&weights)
            .flat_map(|(e, w)| e.candidates.iter().map(move |c| (c, *w)))
            .max_by(|(a, wa), (b, wb)| {
                (a.raw_confidence * wa)
                    .partial_cmp(&(b.raw_confidence * wb))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(c, _)| c.clone());

        let context_candles = match &primary {
            Some(p) => evidence
                .iter()
                .find(|e| e.timeframe == p.timeframe)
                .map(|e| e.candles.clone())
                .unwrap_or_default(),
            None => evidence.last().map(|e| e.candles.clone()).unwrap_or_default(),
        };

        debug!(
            symbol,
            fused = format!("{fused_score:.3}"),
            alignment = format!("{alignment_score:.3}"),
            divergence,
            regime = regime.weight_key(),
            timeframes = evidence.len(),
            "fusion complete"
        );

        Ok(FusionOutcome {
            signal: FusedSignal {
                symbol: symbol.to_string(),
                fused_score,
                alignment_score,
                divergence,
                regime,
                per_timeframe,
                primary,
            },
            context_candles,
        })
    }
}

fn score_timeframe(evidence: &TimeframeEvidence) -> f64 {
    let best = evidence
        .candidates
        .iter()
        .max_by(|a, b| {
            a.raw_confidence
                .partial_cmp(&b.raw_confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

    let (confidence, bias) = match best {
        Some(c) => (c.raw_confidence, c.direction),
        None => (0.0, Direction::Neutral),
    };

    let trend = trend_score(&closes(&evidence.candles), bias);
    CANDIDATE_COMPONENT * confidence + TREND_COMPONENT * trend
}

/// Agreement measure from the unweighted score variance. Scores live in
/// [0, 1] so the worst-case variance is 0.25.
fn alignment(scores: &[f64]) -> f64 {
    if scores.len() < 2 {
        return 1.0;
    }
    let mean = scores.iter().sum::<f64>() / scores.len() as f64;
    let variance = scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / scores.len() as f64;
    (1.0 - variance / 0.25).clamp(0.0, 1.0)
}

fn spread(scores: &[f64]) -> f64 {
    let max = scores.iter().cloned().fold(f64::MIN, f64::max);
    let min = scores.iter().cloned().fold(f64::MAX, f64::min);
    (max - min).max(0.0)
}
