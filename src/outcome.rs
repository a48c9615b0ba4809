// =============================================================================
// Outcome labeler — resolves fired alerts against the realised price path
// =============================================================================
//
// Periodically sweeps unresolved alerts older than the grace period and walks
// the bars after the alert fired. First touch of the stop or target closes
// the book; a bar that touches both in the same interval counts as a stop
// (the pessimistic read, since intra-bar ordering is unknown). An alert that
// survives the full horizon is labeled by where the final close sits relative
// to entry.
//
// Resolution is a check-and-set on the alert record, so overlapping sweeps
// can never journal the same outcome twice.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::{interval, Duration as TokioDuration};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::gateway::ProviderGateway;
use crate::market_data::Candle;
use crate::store::{AlertRepo, OutcomeRepo, TradeOutcome};
use crate::alerts::Alert;
use crate::types::Direction;

pub struct OutcomeLabeler {
    gateway: Arc<ProviderGateway>,
    alerts: Arc<dyn AlertRepo>,
    outcomes: Arc<dyn OutcomeRepo>,
    config: Arc<EngineConfig>,
}

/// How an alert's book was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Stop,
    Target,
    Horizon,
}

/// Intra-horizon level touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Touch {
    Stop,
    Target,
}

impl OutcomeLabeler {
    pub fn new(
        gateway: Arc<ProviderGateway>,
        alerts: Arc<dyn AlertRepo>,
        outcomes: Arc<dyn OutcomeRepo>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            gateway,
            alerts,
            outcomes,
            config,
        }
    }

    /// Periodic sweep loop.
    pub async fn run(&self) {
        let mut ticker = interval(TokioDuration::from_secs(self.config.labeler_interval_secs));
        loop {
            ticker.tick().await;
            let labeled = self.run_once(Utc::now()).await;
            if labeled > 0 {
                info!(labeled, "outcome sweep complete");
            }
        }
    }

    /// One sweep pass. Returns the number of alerts resolved.
    pub async fn run_once(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - chrono::Duration::seconds(self.config.label_grace_secs);
        let pending = self.alerts.unresolved_before(cutoff);
        if pending.is_empty() {
            return 0;
        }
        debug!(pending = pending.len(), "sweeping unresolved alerts");

        let lookback = self.config.lookback.max(self.config.horizon_bars + 2);
        let mut labeled = 0;

        for alert in pending {
            let candles = match self
                .gateway
                .fetch(&alert.symbol, &self.config.label_timeframe, lookback)
                .await
            {
                Ok(candles) => candles,
                Err(e) => {
                    warn!(symbol = %alert.symbol, error = %e, "labeling fetch failed, will retry");
                    continue;
                }
            };

            if let Some(outcome) = self.resolve(&alert, &candles) {
                // Check-and-set: a concurrent sweep that got here first wins.
                if self.alerts.mark_resolved(alert.id, outcome.closed_at) {
                    debug!(
                        alert = %alert.id,
                        symbol = %alert.symbol,
                        label = outcome.label,
                        pnl = format!("{:.4}", outcome.pnl),
                        "alert resolved"
                    );
                    self.outcomes.insert_outcome(outcome);
                    labeled += 1;
                }
            }
        }
        labeled
    }

    /// Walk the post-alert bars. `None` when the book cannot be closed yet.
    fn resolve(&self, alert: &Alert, candles: &[Candle]) -> Option<TradeOutcome> {
        let fired_ms = alert.created_at.timestamp_millis();
        let after: Vec<&Candle> = candles
            .iter()
            .filter(|c| c.open_time >= fired_ms)
            .take(self.config.horizon_bars)
            .collect();
        if after.is_empty() {
            return None;
        }

        let mut closed: Option<(Exit, f64, i64)> = None;
        for bar in &after {
            if let Some(hit) = touch(alert, bar) {
                let (exit, price) = match hit {
                    Touch::Stop => (Exit::Stop, alert.stop_price),
                    Touch::Target => (Exit::Target, alert.target_price),
                };
                closed = Some((exit, price, bar.close_time));
                break;
            }
        }

        let (exit, exit_price, closed_ms) = match closed {
            Some(hit) => hit,
            None if after.len() >= self.config.horizon_bars => {
                let last = after.last().expect("non-empty checked above");
                (Exit::Horizon, last.close, last.close_time)
            }
            // Neither level touched and the horizon is still open.
            None => return None,
        };

        let sign = alert.direction.sign();
        let pnl = if alert.entry_price.abs() > f64::EPSILON {
            sign * (exit_price - alert.entry_price) / alert.entry_price
        } else {
            0.0
        };
        let label = match exit {
            Exit::Target => 1.0,
            Exit::Stop => 0.0,
            Exit::Horizon => {
                if pnl > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
        };

        Some(TradeOutcome {
            alert_id: alert.id,
            symbol: alert.symbol.clone(),
            pattern_name: alert.pattern_name.clone(),
            opened_at: alert.created_at,
            closed_at: DateTime::from_timestamp_millis(closed_ms).unwrap_or(alert.created_at),
            entry_price: alert.entry_price,
            exit_price,
            pnl,
            label,
            features: alert.model_features.clone(),
        })
    }
}

/// First-touch check for one bar. Stop wins a same-bar tie.
fn touch(alert: &Alert, bar: &Candle) -> Option<Touch> {
    match alert.direction {
        Direction::Bullish => {
            if bar.low <= alert.stop_price {
                Some(Touch::Stop)
            } else if bar.high >= alert.target_price {
                Some(Touch::Target)
            } else {
                None
            }
        }
        Direction::Bearish => {
            if bar.high >= alert.stop_price {
                Some(Touch::Stop)
            } else if bar.low <= alert.target_price {
                Some(Touch::Target)
            } else {
                None
            }
        }
        Direction::Neutral => None,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SignalError;
    use crate::gateway::provider::CandleProvider;
    use crate::store::MemoryStore;
    use crate::types::QualityTier;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::BTreeSet;
    use std::time::Duration;
    use uuid::Uuid;

    struct SeriesProvider {
        candles: Mutex<Vec<Candle>>,
    }

    #[async_trait]
    impl CandleProvider for SeriesProvider {
        fn name(&self) -> &str {
            "series"
        }

        async fn fetch(
            &self,
            _symbol: &str,
            _interval: &str,
            _lookback: usize,
        ) -> Result<Vec<Candle>, SignalError> {
            Ok(self.candles.lock().clone())
        }
    }

    /// Hourly bars walking from `start` with the given (high, low, close)
    /// triples, ending at the current hour so freshness passes.
    fn bars(start: DateTime<Utc>, path: &[(f64, f64, f64)]) -> Vec<Candle> {
        path.iter()
            .enumerate()
            .map(|(i, (high, low, close))| {
                let open_time = start.timestamp_millis() + i as i64 * 3_600_000;
                Candle {
                    open_time,
                    close_time: open_time + 3_599_999,
                    open: *close,
                    high: *high,
                    low: *low,
                    close: *close,
                    volume: 50.0,
                }
            })
            .collect()
    }

    fn alert(direction: Direction, created_at: DateTime<Utc>) -> Alert {
        Alert {
            id: Uuid::new_v4(),
            symbol: "BTCUSDT".to_string(),
            timeframe: "1h".to_string(),
            pattern_name: "hammer".to_string(),
            direction,
            composite_score: 0.8,
            quality_tier: QualityTier::High,
            entry_price: 100.0,
            stop_price: if direction == Direction::Bullish { 97.0 } else { 103.0 },
            target_price: if direction == Direction::Bullish { 105.0 } else { 95.0 },
            created_at,
            dismissed: false,
            resolved_at: None,
            delivered_channels: BTreeSet::new(),
            delivery_errors: Vec::new(),
            model_features: vec![0.1, 0.2],
        }
    }

    struct Rig {
        labeler: OutcomeLabeler,
        store: Arc<MemoryStore>,
    }

    fn rig(candles: Vec<Candle>, horizon_bars: usize) -> Rig {
        let provider = Arc::new(SeriesProvider {
            candles: Mutex::new(candles),
        });
        let gateway = Arc::new(ProviderGateway::new(
            vec![provider],
            1800,
            Duration::from_secs(1),
            3,
            60,
        ));
        let store = Arc::new(MemoryStore::new());
        let mut config = EngineConfig::default();
        config.horizon_bars = horizon_bars;
        let labeler = OutcomeLabeler::new(
            gateway,
            store.clone(),
            store.clone(),
            Arc::new(config),
        );
        Rig { labeler, store }
    }

    /// Start time such that `n` hourly bars end right at the current hour.
    fn start_for(n: usize) -> DateTime<Utc> {
        let now_ms = Utc::now().timestamp_millis();
        DateTime::from_timestamp_millis(now_ms - n as i64 * 3_600_000).unwrap()
    }

    #[tokio::test]
    async fn target_touch_is_a_win() {
        let start = start_for(4);
        let path = bars(
            start,
            &[
                (101.0, 99.0, 100.5),
                (103.0, 100.0, 102.0),
                (106.0, 101.0, 104.0), // high touches 105 target
                (104.0, 102.0, 103.0),
            ],
        );
        let r = rig(path, 24);
        r.store.insert_alert(alert(Direction::Bullish, start));

        assert_eq!(r.labeler.run_once(Utc::now()).await, 1);
        let outcomes = r.store.outcomes_since(0);
        assert_eq!(outcomes.len(), 1);
        let (_, o) = &outcomes[0];
        assert_eq!(o.label, 1.0);
        assert!((o.exit_price - 105.0).abs() < 1e-9);
        assert!(o.pnl > 0.0);
        assert_eq!(o.features, vec![0.1, 0.2]);
    }

    #[tokio::test]
    async fn stop_touch_is_a_loss() {
        let start = start_for(3);
        let path = bars(
            start,
            &[
                (101.0, 99.0, 100.0),
                (100.0, 96.5, 97.5), // low touches 97 stop
                (99.0, 97.5, 98.0),
            ],
        );
        let r = rig(path, 24);
        r.store.insert_alert(alert(Direction::Bullish, start));

        assert_eq!(r.labeler.run_once(Utc::now()).await, 1);
        let (_, o) = &r.store.outcomes_since(0)[0];
        assert_eq!(o.label, 0.0);
        assert!(o.pnl < 0.0);
    }

    #[tokio::test]
    async fn same_bar_touch_of_both_levels_is_a_stop() {
        let start = start_for(2);
        // One wild bar spans both the 97 stop and the 105 target.
        let path = bars(start, &[(106.0, 96.0, 100.0), (101.0, 99.0, 100.0)]);
        let r = rig(path, 24);
        r.store.insert_alert(alert(Direction::Bullish, start));

        assert_eq!(r.labeler.run_once(Utc::now()).await, 1);
        let (_, o) = &r.store.outcomes_since(0)[0];
        assert_eq!(o.label, 0.0);
        assert!((o.exit_price - 97.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn bearish_levels_are_mirrored() {
        let start = start_for(3);
        let path = bars(
            start,
            &[
                (101.0, 99.0, 100.0),
                (102.0, 94.5, 96.0), // low touches the 95 target
                (97.0, 95.5, 96.0),
            ],
        );
        let r = rig(path, 24);
        r.store.insert_alert(alert(Direction::Bearish, start));

        assert_eq!(r.labeler.run_once(Utc::now()).await, 1);
        let (_, o) = &r.store.outcomes_since(0)[0];
        assert_eq!(o.label, 1.0);
        assert!(o.pnl > 0.0, "short to 95 from 100 is a win, got {}", o.pnl);
    }

    #[tokio::test]
    async fn horizon_expiry_labels_by_final_close() {
        let start = start_for(4);
        // Never touches 97 or 105; ends above entry.
        let path = bars(
            start,
            &[
                (101.0, 99.0, 100.2),
                (102.0, 99.5, 101.0),
                (103.0, 100.0, 102.0),
                (103.0, 101.0, 102.5),
            ],
        );
        let r = rig(path, 3);
        r.store.insert_alert(alert(Direction::Bullish, start));

        assert_eq!(r.labeler.run_once(Utc::now()).await, 1);
        let (_, o) = &r.store.outcomes_since(0)[0];
        assert_eq!(o.label, 1.0);
        // Exit is the close of the third (horizon) bar.
        assert!((o.exit_price - 102.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn open_horizon_with_no_touch_stays_pending() {
        let start = start_for(2);
        let path = bars(start, &[(101.0, 99.0, 100.2), (102.0, 99.5, 101.0)]);
        let r = rig(path, 24);
        r.store.insert_alert(alert(Direction::Bullish, start));

        assert_eq!(r.labeler.run_once(Utc::now()).await, 0);
        assert_eq!(r.store.outcome_count(), 0);
        assert_eq!(r.store.unresolved_before(Utc::now()).len(), 1);
    }

    #[tokio::test]
    async fn grace_period_defers_young_alerts() {
        let start = start_for(2);
        let path = bars(start, &[(106.0, 99.0, 104.0), (105.0, 101.0, 103.0)]);
        let r = rig(path, 24);
        // Fired just now: inside the one-hour grace window.
        r.store.insert_alert(alert(Direction::Bullish, Utc::now()));

        assert_eq!(r.labeler.run_once(Utc::now()).await, 0);
    }

    #[tokio::test]
    async fn repeated_sweeps_are_idempotent() {
        let start = start_for(2);
        let path = bars(start, &[(106.0, 101.0, 104.0), (105.0, 101.0, 103.0)]);
        let r = rig(path, 24);
        r.store.insert_alert(alert(Direction::Bullish, start));

        assert_eq!(r.labeler.run_once(Utc::now()).await, 1);
        assert_eq!(r.labeler.run_once(Utc::now()).await, 0);
        assert_eq!(r.store.outcome_count(), 1);
    }
}
