// =============================================================================
// Timing agent — tabular action values over quantised feature states
// =============================================================================
//
// A lightweight advisory layer: labeled outcomes replay as episodes that
// nudge per-state action values, and `advise` reads the table back as a
// BUY / SELL / HOLD hint with a confidence. States the agent has never seen
// return HOLD with zero confidence, so the advice can be ignored safely when
// the table is cold.
//
// The taken action moves toward the realised reward: scaled pnl, less a
// switch penalty when the action flips from the previous episode in the same
// state and a time-scaled patience penalty for riding a losing position.
// HOLD decays toward its counterfactual reward of zero.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use crate::detect::pattern_direction;
use crate::store::TradeOutcome;
use crate::types::{Direction, TimingAction};

/// Feature dimensions folded into the state key.
const STATE_DIMS: usize = 4;
/// Quantisation step for each folded dimension.
const BUCKET: f64 = 0.25;

const REWARD_SCALE: f64 = 10.0;
/// Charged when an episode's action differs from the previous one in that state.
const SWITCH_PENALTY: f64 = 0.05;
/// Charged per day a losing position was held before it resolved.
const PATIENCE_PENALTY_PER_DAY: f64 = 0.02;

const ACTIONS: [TimingAction; 3] = [TimingAction::Buy, TimingAction::Sell, TimingAction::Hold];

#[derive(Debug, Clone, Copy, Serialize)]
pub struct TimingAdvice {
    pub action: TimingAction,
    pub confidence: f64,
}

impl TimingAdvice {
    fn hold() -> Self {
        Self {
            action: TimingAction::Hold,
            confidence: 0.0,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct StateEntry {
    values: [f64; 3],
    last_action: Option<usize>,
}

pub struct TimingAgent {
    q: RwLock<HashMap<Vec<i8>, StateEntry>>,
    alpha: f64,
}

impl TimingAgent {
    pub fn new(alpha: f64) -> Self {
        Self {
            q: RwLock::new(HashMap::new()),
            alpha,
        }
    }

    /// Advisory action for the given feature vector.
    pub fn advise(&self, features: &[f64]) -> TimingAdvice {
        let Some(key) = state_key(features) else {
            return TimingAdvice::hold();
        };
        let q = self.q.read();
        let Some(entry) = q.get(&key) else {
            return TimingAdvice::hold();
        };
        let values = &entry.values;

        let (best_idx, best) = values
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, v)| (i, *v))
            .unwrap_or((2, 0.0));

        let mean_rest: f64 = values
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != best_idx)
            .map(|(_, v)| v)
            .sum::<f64>()
            / 2.0;

        TimingAdvice {
            action: ACTIONS[best_idx],
            confidence: (best - mean_rest).clamp(0.0, 1.0),
        }
    }

    /// Replay one labeled outcome as an episode.
    pub fn learn(&self, outcome: &TradeOutcome) {
        let Some(key) = state_key(&outcome.features) else {
            return;
        };
        let action = match pattern_direction(&outcome.pattern_name) {
            Direction::Bullish => TimingAction::Buy,
            Direction::Bearish => TimingAction::Sell,
            Direction::Neutral => return,
        };
        let idx = ACTIONS
            .iter()
            .position(|a| *a == action)
            .expect("action is in the table");

        let mut reward = outcome.pnl * REWARD_SCALE;

        let mut q = self.q.write();
        let entry = q.entry(key).or_default();

        if entry.last_action.is_some_and(|prev| prev != idx) {
            reward -= SWITCH_PENALTY;
        }
        if outcome.pnl < 0.0 {
            let held_days = (outcome.closed_at - outcome.opened_at)
                .num_seconds()
                .max(0) as f64
                / 86_400.0;
            reward -= PATIENCE_PENALTY_PER_DAY * held_days;
        }

        entry.values[idx] += self.alpha * (reward - entry.values[idx]);
        // Counterfactual reward of sitting out is zero.
        entry.values[2] += self.alpha * (0.0 - entry.values[2]);
        entry.last_action = Some(idx);

        debug!(
            action = %action,
            reward = format!("{reward:.3}"),
            value = format!("{:.3}", entry.values[idx]),
            "timing episode applied"
        );
    }

    pub fn known_states(&self) -> usize {
        self.q.read().len()
    }
}

/// Quantise the leading feature dimensions into a discrete state key.
fn state_key(features: &[f64]) -> Option<Vec<i8>> {
    if features.is_empty() {
        return None;
    }
    Some(
        features
            .iter()
            .take(STATE_DIMS)
            .map(|f| ((f / BUCKET).round().clamp(-16.0, 16.0)) as i8)
            .collect(),
    )
}
