// =============================================================================
// Storage seams — alert repository, outcome journal, detection log
// =============================================================================
//
// The engine talks to storage through three narrow traits so the in-memory
// implementation used here can be swapped for a durable one without touching
// the pipeline. `MemoryStore` implements all three behind parking_lot locks.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use parking_lot::RwLock;

use crate::alerts::Alert;
use crate::detect::PatternCandidate;
use crate::types::QualityTier;

/// Detection log capacity. Oldest entries are evicted first.
const DETECTION_LOG_CAP: usize = 512;

/// A labeled trade result produced by the outcome labeler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeOutcome {
    pub alert_id: Uuid,
    pub symbol: String,
    pub pattern_name: String,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_price: f64,
    /// Signed fractional return of the trade, direction-adjusted.
    pub pnl: f64,
    /// 1.0 for a win, 0.0 for a loss. The learner trains on this directly.
    pub label: f64,
    /// Feature vector frozen on the alert at fire time.
    pub features: Vec<f64>,
}

/// Query shape for listing alerts.
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub symbol: Option<String>,
    pub min_tier: Option<QualityTier>,
    pub include_dismissed: bool,
    pub limit: Option<usize>,
}

pub trait AlertRepo: Send + Sync {
    fn insert_alert(&self, alert: Alert);
    fn get_alert(&self, id: Uuid) -> Option<Alert>;
    /// Matching alerts, newest first.
    fn list_alerts(&self, filter: &AlertFilter) -> Vec<Alert>;
    /// Returns false when the alert does not exist.
    fn mark_dismissed(&self, id: Uuid) -> bool;
    /// Record a delivery attempt for a channel. Success adds the channel to
    /// the delivered set; failure appends to the error log.
    fn record_delivery(&self, id: Uuid, channel: &str, error: Option<String>);
    /// Unresolved, undismissed alerts created at or before the cutoff.
    fn unresolved_before(&self, cutoff: DateTime<Utc>) -> Vec<Alert>;
    /// Check-and-set resolution. Returns false when the alert is missing or
    /// was already resolved, so labeling stays idempotent under races.
    fn mark_resolved(&self, id: Uuid, at: DateTime<Utc>) -> bool;
}

pub trait OutcomeRepo: Send + Sync {
    fn insert_outcome(&self, outcome: TradeOutcome);
    /// Outcomes with sequence number strictly greater than `cursor`, oldest
    /// first, paired with their sequence numbers. Sequence numbers start at 1.
    fn outcomes_since(&self, cursor: u64) -> Vec<(u64, TradeOutcome)>;
}

pub trait DetectionLog: Send + Sync {
    fn record(&self, candidate: &PatternCandidate);
    /// Most recent candidates, newest first.
    fn recent_detections(&self, limit: usize) -> Vec<PatternCandidate>;
}

/// In-memory implementation of all three storage seams.
#[derive(Default)]
pub struct MemoryStore {
    alerts: RwLock<HashMap<Uuid, Alert>>,
    alert_order: RwLock<Vec<Uuid>>,
    outcomes: RwLock<Vec<TradeOutcome>>,
    detections: RwLock<VecDeque<PatternCandidate>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alert_count(&self) -> usize {
        self.alerts.read().len()
    }

    pub fn outcome_count(&self) -> usize {
        self.outcomes.read().len()
    }
}

impl AlertRepo for MemoryStore {
    fn insert_alert(&self, alert: Alert) {
        self.alert_order.write().push(alert.id);
        self.alerts.write().insert(alert.id, alert);
    }

    fn get_alert(&self, id: Uuid) -> Option<Alert> {
        self.alerts.read().get(&id).cloned()
    }

    fn list_alerts(&self, filter: &AlertFilter) -> Vec<Alert> {
        let alerts = self.alerts.read();
        let order = self.alert_order.read();

        let iter = order.iter().rev().filter_map(|id| alerts.get(id)).filter(|a| {
            if !filter.include_dismissed && a.dismissed {
                return false;
            }
            if let Some(symbol) = &filter.symbol {
                if &a.symbol != symbol {
                    return false;
                }
            }
            if let Some(min) = filter.min_tier {
                if a.quality_tier < min {
                    return false;
                }
            }
            true
        });

        match filter.limit {
            Some(n) => iter.take(n).cloned().collect(),
            None => iter.cloned().collect(),
        }
    }

    fn mark_dismissed(&self, id: Uuid) -> bool {
        match self.alerts.write().get_mut(&id) {
            Some(alert) => {
                alert.dismissed = true;
                true
            }
            None => false,
        }
    }

    fn record_delivery(&self, id: Uuid, channel: &str, error: Option<String>) {
        if let Some(alert) = self.alerts.write().get_mut(&id) {
            match error {
                None => {
                    alert.delivered_channels.insert(channel.to_string());
                }
                Some(err) => alert.delivery_errors.push(format!("{channel}: {err}")),
            }
        }
    }

    fn unresolved_before(&self, cutoff: DateTime<Utc>) -> Vec<Alert> {
        self.alerts
            .read()
            .values()
            .filter(|a| !a.is_resolved() && !a.dismissed && a.created_at <= cutoff)
            .cloned()
            .collect()
    }

    fn mark_resolved(&self, id: Uuid, at: DateTime<Utc>) -> bool {
        match self.alerts.write().get_mut(&id) {
            Some(alert) if alert.resolved_at.is_none() => {
                alert.resolved_at = Some(at);
                true
            }
            _ => false,
        }
    }
}

impl OutcomeRepo for MemoryStore {
    fn insert_outcome(&self, outcome: TradeOutcome) {
        self.outcomes.write().push(outcome);
    }

    fn outcomes_since(&self, cursor: u64) -> Vec<(u64, TradeOutcome)> {
        self.outcomes
            .read()
            .iter()
            .enumerate()
            .map(|(i, o)| (i as u64 + 1, o.clone()))
            .filter(|(seq, _)| *seq > cursor)
            .collect()
    }
}

impl DetectionLog for MemoryStore {
    fn record(&self, candidate: &PatternCandidate) {
        let mut log = self.detections.write();
        if log.len() >= DETECTION_LOG_CAP {
            log.pop_front();
        }
        log.push_back(candidate.clone());
    }

    fn recent_detections(&self, limit: usize) -> Vec<PatternCandidate> {
        self.detections
            .read()
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;
    use std::collections::BTreeSet;

    fn alert(symbol: &str, tier: QualityTier) -> Alert {
        Alert {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            timeframe: "1h".to_string(),
            pattern_name: "hammer".to_string(),
            direction: Direction::Bullish,
            composite_score: 0.8,
            quality_tier: tier,
            entry_price: 100.0,
            stop_price: 97.0,
            target_price: 105.0,
            created_at: Utc::now(),
            dismissed: false,
            resolved_at: None,
            delivered_channels: BTreeSet::new(),
            delivery_errors: Vec::new(),
            model_features: Vec::new(),
        }
    }

    #[test]
    fn insert_get_and_list_order() {
        let store = MemoryStore::new();
        let a = alert("BTCUSDT", QualityTier::Good);
        let b = alert("ETHUSDT", QualityTier::High);
        store.insert_alert(a.clone());
        store.insert_alert(b.clone());

        assert_eq!(store.get_alert(a.id).unwrap().symbol, "BTCUSDT");

        let listed = store.list_alerts(&AlertFilter::default());
        assert_eq!(listed.len(), 2);
        // Newest first.
        assert_eq!(listed[0].id, b.id);
    }

    #[test]
    fn filters_by_symbol_tier_and_dismissed() {
        let store = MemoryStore::new();
        let keep = alert("BTCUSDT", QualityTier::Elite);
        let low = alert("BTCUSDT", QualityTier::Moderate);
        let gone = alert("BTCUSDT", QualityTier::Elite);
        let other = alert("ETHUSDT", QualityTier::Elite);
        store.insert_alert(keep.clone());
        store.insert_alert(low);
        store.insert_alert(gone.clone());
        store.insert_alert(other);
        store.mark_dismissed(gone.id);

        let filter = AlertFilter {
            symbol: Some("BTCUSDT".to_string()),
            min_tier: Some(QualityTier::High),
            include_dismissed: false,
            limit: None,
        };
        let listed = store.list_alerts(&filter);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, keep.id);
    }

    #[test]
    fn delivery_bookkeeping() {
        let store = MemoryStore::new();
        let a = alert("BTCUSDT", QualityTier::High);
        let id = a.id;
        store.insert_alert(a);

        store.record_delivery(id, "webhook", None);
        store.record_delivery(id, "log", Some("connection refused".to_string()));

        let fetched = store.get_alert(id).unwrap();
        assert!(fetched.delivered_channels.contains("webhook"));
        assert_eq!(fetched.delivery_errors.len(), 1);
        assert!(fetched.delivery_errors[0].contains("log"));
    }

    #[test]
    fn resolution_is_idempotent() {
        let store = MemoryStore::new();
        let a = alert("BTCUSDT", QualityTier::High);
        let id = a.id;
        store.insert_alert(a);

        assert_eq!(store.unresolved_before(Utc::now()).len(), 1);
        assert!(store.mark_resolved(id, Utc::now()));
        // Second resolution is rejected.
        assert!(!store.mark_resolved(id, Utc::now()));
        assert!(store.unresolved_before(Utc::now()).is_empty());
    }

    #[test]
    fn outcome_cursor_pagination() {
        let store = MemoryStore::new();
        for i in 0..3 {
            store.insert_outcome(TradeOutcome {
                alert_id: Uuid::new_v4(),
                symbol: "BTCUSDT".to_string(),
                pattern_name: "hammer".to_string(),
                opened_at: Utc::now(),
                closed_at: Utc::now(),
                entry_price: 100.0,
                exit_price: 105.0,
                pnl: 0.05,
                label: 1.0,
                features: vec![i as f64],
            });
        }

        let all = store.outcomes_since(0);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].0, 1);

        let tail = store.outcomes_since(2);
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].0, 3);

        assert!(store.outcomes_since(3).is_empty());
    }
}
