// =============================================================================
// Alerts — the persisted record of a fired signal and its delivery state
// =============================================================================

pub mod channels;
pub mod dispatcher;

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::composite::CompositeSignal;
use crate::types::{Direction, QualityTier};

pub use channels::{deliver_with_retry, AlertChannel, LogChannel, WebhookChannel};
pub use dispatcher::{AlertDispatcher, DispatchOutcome};

/// A fired alert. Created once by the dispatcher; delivery bookkeeping and
/// resolution are updated in place through the repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub symbol: String,
    pub timeframe: String,
    pub pattern_name: String,
    pub direction: Direction,
    pub composite_score: f64,
    pub quality_tier: QualityTier,
    pub entry_price: f64,
    pub stop_price: f64,
    pub target_price: f64,
    pub created_at: DateTime<Utc>,
    pub dismissed: bool,
    /// Set once the outcome labeler has closed the book on this alert.
    pub resolved_at: Option<DateTime<Utc>>,
    pub delivered_channels: BTreeSet<String>,
    pub delivery_errors: Vec<String>,
    /// Model feature vector captured at fire time, frozen for the learner.
    pub model_features: Vec<f64>,
}

impl Alert {
    /// Build an alert from a scored signal, capturing the feature vector the
    /// learner will train on once the outcome is known.
    pub fn from_signal(signal: &CompositeSignal, model_features: Vec<f64>) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: signal.symbol.clone(),
            timeframe: signal.timeframe.clone(),
            pattern_name: signal.pattern_name.clone(),
            direction: signal.direction,
            composite_score: signal.composite_score,
            quality_tier: signal.quality_tier,
            entry_price: signal.risk.entry,
            stop_price: signal.risk.stop,
            target_price: signal.risk.target,
            created_at: signal.created_at,
            dismissed: false,
            resolved_at: None,
            delivered_channels: BTreeSet::new(),
            delivery_errors: Vec::new(),
            model_features,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}
