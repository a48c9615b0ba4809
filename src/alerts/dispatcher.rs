// =============================================================================
// Alert dispatcher — gate, dedup, rate caps, quiet hours, digest bucket
// =============================================================================
//
// One signal travels: score gate -> (symbol, pattern) cool-down -> alert
// record -> delivery. ELITE and HIGH alerts go out immediately; GOOD and
// MODERATE land in the digest bucket flushed on a timer. Push-class channels
// additionally honour quiet hours and their own hour/day rate caps; the log
// channel ignores both so every fired alert is observable.
//
// Cool-down keys are independent per (symbol, pattern): a hammer on BTCUSDT
// does not silence an engulfing on BTCUSDT or a hammer on ETHUSDT.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Timelike, Utc};
use futures_util::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::composite::CompositeSignal;
use crate::config::EngineConfig;
use crate::store::AlertRepo;

use super::channels::{deliver_with_retry, AlertChannel};
use super::Alert;

/// What happened to a submitted signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Alert recorded and delivered immediately.
    Fired(Uuid),
    /// Alert recorded and parked in the digest bucket.
    Queued(Uuid),
    /// Same (symbol, pattern) fired within the cool-down window.
    SuppressedCooldown,
    /// Composite score below the alert gate.
    BelowGate,
}

#[derive(Debug, Default)]
struct KeyState {
    last_fired_at: Option<DateTime<Utc>>,
    suppressed_count: u64,
}

/// Sliding delivery window for the push-channel rate caps.
#[derive(Debug, Default)]
struct RateWindow {
    events: VecDeque<DateTime<Utc>>,
}

impl RateWindow {
    fn prune(&mut self, now: DateTime<Utc>) {
        while let Some(front) = self.events.front() {
            if now - *front > Duration::hours(24) {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    fn allows(&mut self, now: DateTime<Utc>, max_hour: u32, max_day: u32) -> bool {
        self.prune(now);
        let last_hour = self
            .events
            .iter()
            .filter(|t| now - **t <= Duration::hours(1))
            .count() as u32;
        last_hour < max_hour && (self.events.len() as u32) < max_day
    }

    fn record(&mut self, now: DateTime<Utc>) {
        self.events.push_back(now);
    }
}

/// Aggregate dispatch counters for the health surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DispatcherStats {
    pub fired: u64,
    pub queued: u64,
    pub suppressed_cooldown: u64,
    pub below_gate: u64,
    pub digest_pending: usize,
}

pub struct AlertDispatcher {
    channels: Vec<Arc<dyn AlertChannel>>,
    repo: Arc<dyn AlertRepo>,

    min_alert_score: f64,
    cooldown: Duration,
    max_per_hour: u32,
    max_per_day: u32,
    quiet_hours_enabled: bool,
    quiet_start_hour: u32,
    quiet_end_hour: u32,
    quiet_utc_offset: i64,
    delivery_retries: u32,

    keys: Mutex<HashMap<(String, String), KeyState>>,
    digest: Mutex<Vec<Alert>>,
    /// One sliding window per push channel; caps apply independently.
    rate: Mutex<HashMap<String, RateWindow>>,

    fired: AtomicU64,
    queued: AtomicU64,
    suppressed_cooldown: AtomicU64,
    below_gate: AtomicU64,
}

impl AlertDispatcher {
    pub fn new(
        channels: Vec<Arc<dyn AlertChannel>>,
        repo: Arc<dyn AlertRepo>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            channels,
            repo,
            min_alert_score: config.min_alert_score,
            cooldown: Duration::seconds(config.cooldown_secs),
            max_per_hour: config.max_deliveries_per_hour,
            max_per_day: config.max_deliveries_per_day,
            quiet_hours_enabled: config.quiet_hours_enabled,
            quiet_start_hour: config.quiet_start_hour,
            quiet_end_hour: config.quiet_end_hour,
            quiet_utc_offset: config.quiet_hours_utc_offset as i64,
            delivery_retries: config.delivery_retries,
            keys: Mutex::new(HashMap::new()),
            digest: Mutex::new(Vec::new()),
            rate: Mutex::new(HashMap::new()),
            fired: AtomicU64::new(0),
            queued: AtomicU64::new(0),
            suppressed_cooldown: AtomicU64::new(0),
            below_gate: AtomicU64::new(0),
        }
    }

    /// Run one scored signal through the dispatch pipeline.
    pub async fn submit(
        &self,
        signal: &CompositeSignal,
        model_features: Vec<f64>,
        now: DateTime<Utc>,
    ) -> DispatchOutcome {
        if signal.composite_score < self.min_alert_score {
            self.below_gate.fetch_add(1, Ordering::Relaxed);
            debug!(
                symbol = %signal.symbol,
                pattern = %signal.pattern_name,
                score = format!("{:.3}", signal.composite_score),
                "signal below alert gate"
            );
            return DispatchOutcome::BelowGate;
        }

        let key = (signal.symbol.clone(), signal.pattern_name.clone());
        {
            let mut keys = self.keys.lock();
            let state = keys.entry(key).or_default();
            if let Some(last) = state.last_fired_at {
                if now - last < self.cooldown {
                    state.suppressed_count += 1;
                    self.suppressed_cooldown.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        symbol = %signal.symbol,
                        pattern = %signal.pattern_name,
                        suppressed = state.suppressed_count,
                        "alert suppressed by cool-down"
                    );
                    return DispatchOutcome::SuppressedCooldown;
                }
            }
            state.last_fired_at = Some(now);
        }

        let alert = Alert::from_signal(signal, model_features);
        let id = alert.id;
        self.repo.insert_alert(alert.clone());

        info!(
            alert = %id,
            symbol = %alert.symbol,
            pattern = %alert.pattern_name,
            tier = %alert.quality_tier,
            score = format!("{:.3}", alert.composite_score),
            "alert fired"
        );

        if alert.quality_tier.is_priority() {
            self.fired.fetch_add(1, Ordering::Relaxed);
            self.deliver_now(&alert, now).await;
            DispatchOutcome::Fired(id)
        } else {
            self.queued.fetch_add(1, Ordering::Relaxed);
            self.digest.lock().push(alert);
            DispatchOutcome::Queued(id)
        }
    }

    /// Deliver one alert across every channel concurrently. Each channel's
    /// retries are independent so a dead webhook cannot block the log line.
    async fn deliver_now(&self, alert: &Alert, now: DateTime<Utc>) {
        let deliveries = self.channels.iter().filter_map(|channel| {
            if channel.push_class() && !self.push_allowed(channel.name(), now) {
                return None;
            }
            let channel = channel.clone();
            Some(async move {
                let result = deliver_with_retry(channel.as_ref(), alert, self.delivery_retries).await;
                (channel, result)
            })
        });

        for (channel, result) in join_all(deliveries).await {
            match result {
                Ok(()) => {
                    self.repo.record_delivery(alert.id, channel.name(), None);
                    if channel.push_class() {
                        self.record_push(channel.name(), now);
                    }
                }
                Err(e) => {
                    warn!(alert = %alert.id, channel = channel.name(), error = %e, "delivery failed");
                    self.repo
                        .record_delivery(alert.id, channel.name(), Some(e.to_string()));
                }
            }
        }
    }

    /// Flush the digest bucket through every channel. Returns the number of
    /// alerts flushed.
    pub async fn flush_digest(&self, now: DateTime<Utc>) -> usize {
        let batch: Vec<Alert> = std::mem::take(&mut *self.digest.lock());
        if batch.is_empty() {
            return 0;
        }

        info!(count = batch.len(), "flushing alert digest");
        for channel in &self.channels {
            if channel.push_class() && !self.push_allowed(channel.name(), now) {
                continue;
            }
            match channel.send_digest(&batch).await {
                Ok(()) => {
                    for alert in &batch {
                        self.repo.record_delivery(alert.id, channel.name(), None);
                    }
                    if channel.push_class() {
                        self.record_push(channel.name(), now);
                    }
                }
                Err(e) => {
                    warn!(channel = channel.name(), error = %e, "digest delivery failed");
                    for alert in &batch {
                        self.repo
                            .record_delivery(alert.id, channel.name(), Some(e.to_string()));
                    }
                }
            }
        }
        batch.len()
    }

    /// Mark an alert dismissed so it is excluded from listings and labeling.
    pub fn dismiss(&self, id: Uuid) -> bool {
        self.repo.mark_dismissed(id)
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            fired: self.fired.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            suppressed_cooldown: self.suppressed_cooldown.load(Ordering::Relaxed),
            below_gate: self.below_gate.load(Ordering::Relaxed),
            digest_pending: self.digest.lock().len(),
        }
    }

    fn push_allowed(&self, channel: &str, now: DateTime<Utc>) -> bool {
        if self.in_quiet_hours(now) {
            debug!(channel, "push suppressed by quiet hours");
            return false;
        }
        let mut rate = self.rate.lock();
        let window = rate.entry(channel.to_string()).or_default();
        if !window.allows(now, self.max_per_hour, self.max_per_day) {
            warn!(channel, "push suppressed by rate cap");
            return false;
        }
        true
    }

    fn record_push(&self, channel: &str, now: DateTime<Utc>) {
        self.rate
            .lock()
            .entry(channel.to_string())
            .or_default()
            .record(now);
    }

    fn in_quiet_hours(&self, now: DateTime<Utc>) -> bool {
        if !self.quiet_hours_enabled || self.quiet_start_hour == self.quiet_end_hour {
            return false;
        }
        // The window is defined in the configured local timezone.
        let hour = (now + Duration::hours(self.quiet_utc_offset)).hour();
        if self.quiet_start_hour < self.quiet_end_hour {
            hour >= self.quiet_start_hour && hour < self.quiet_end_hour
        } else {
            // Window wraps midnight, e.g. 22..7.
            hour >= self.quiet_start_hour || hour < self.quiet_end_hour
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::composite::{LayerScore, RiskLevels};
    use crate::error::SignalError;
    use crate::store::{AlertFilter, MemoryStore};
    use crate::types::{Direction, QualityTier};
    use async_trait::async_trait;

    struct RecordingChannel {
        name: &'static str,
        push: bool,
        sent: Mutex<Vec<Uuid>>,
        digests: Mutex<Vec<usize>>,
    }

    impl RecordingChannel {
        fn new(name: &'static str, push: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                push,
                sent: Mutex::new(Vec::new()),
                digests: Mutex::new(Vec::new()),
            })
        }

        fn sent_count(&self) -> usize {
            self.sent.lock().len()
        }
    }

    #[async_trait]
    impl AlertChannel for RecordingChannel {
        fn name(&self) -> &str {
            self.name
        }

        fn push_class(&self) -> bool {
            self.push
        }

        async fn send(&self, alert: &Alert) -> Result<(), SignalError> {
            self.sent.lock().push(alert.id);
            Ok(())
        }

        async fn send_digest(&self, alerts: &[Alert]) -> Result<(), SignalError> {
            self.digests.lock().push(alerts.len());
            for alert in alerts {
                self.sent.lock().push(alert.id);
            }
            Ok(())
        }
    }

    fn signal(symbol: &str, pattern: &str, score: f64, tier: QualityTier) -> CompositeSignal {
        CompositeSignal {
            symbol: symbol.to_string(),
            timeframe: "1h".to_string(),
            pattern_name: pattern.to_string(),
            direction: Direction::Bullish,
            composite_score: score,
            quality_tier: tier,
            layer_breakdown: vec![LayerScore {
                name: "pattern".to_string(),
                score,
                weight: 1.0,
                explanation: "test".to_string(),
            }],
            risk: RiskLevels {
                entry: 100.0,
                stop: 97.0,
                target: 105.0,
            },
            created_at: Utc::now(),
        }
    }

    struct Rig {
        dispatcher: AlertDispatcher,
        store: Arc<MemoryStore>,
        webhook: Arc<RecordingChannel>,
        log: Arc<RecordingChannel>,
    }

    fn rig(mutate: impl FnOnce(&mut EngineConfig)) -> Rig {
        let mut config = EngineConfig::default();
        config.quiet_hours_enabled = false;
        mutate(&mut config);

        let store = Arc::new(MemoryStore::new());
        let webhook = RecordingChannel::new("webhook", true);
        let log = RecordingChannel::new("log", false);
        let dispatcher = AlertDispatcher::new(
            vec![webhook.clone(), log.clone()],
            store.clone(),
            &config,
        );
        Rig {
            dispatcher,
            store,
            webhook,
            log,
        }
    }

    #[tokio::test]
    async fn below_gate_records_nothing() {
        let r = rig(|_| {});
        let outcome = r
            .dispatcher
            .submit(
                &signal("BTCUSDT", "hammer", 0.50, QualityTier::Moderate),
                Vec::new(),
                Utc::now(),
            )
            .await;
        assert_eq!(outcome, DispatchOutcome::BelowGate);
        assert_eq!(r.store.alert_count(), 0);
        assert_eq!(r.dispatcher.stats().below_gate, 1);
    }

    #[tokio::test]
    async fn cooldown_suppresses_and_later_refires() {
        let r = rig(|_| {});
        let s = signal("BTCUSDT", "hammer", 0.80, QualityTier::High);
        let t0 = Utc::now();

        let first = r.dispatcher.submit(&s, Vec::new(), t0).await;
        assert!(matches!(first, DispatchOutcome::Fired(_)));

        let again = r.dispatcher.submit(&s, Vec::new(), t0 + Duration::seconds(60)).await;
        assert_eq!(again, DispatchOutcome::SuppressedCooldown);
        assert_eq!(r.store.alert_count(), 1);

        // Past the cool-down the same key fires again.
        let later = r
            .dispatcher
            .submit(&s, Vec::new(), t0 + Duration::seconds(3601))
            .await;
        assert!(matches!(later, DispatchOutcome::Fired(_)));
        assert_eq!(r.store.alert_count(), 2);
    }

    #[tokio::test]
    async fn cooldown_keys_are_independent() {
        let r = rig(|_| {});
        let t0 = Utc::now();
        r.dispatcher
            .submit(&signal("BTCUSDT", "hammer", 0.80, QualityTier::High), Vec::new(), t0)
            .await;

        // Different pattern on the same symbol fires.
        let other_pattern = r
            .dispatcher
            .submit(
                &signal("BTCUSDT", "bullish_engulfing", 0.80, QualityTier::High),
                Vec::new(),
                t0,
            )
            .await;
        assert!(matches!(other_pattern, DispatchOutcome::Fired(_)));

        // Same pattern on a different symbol fires.
        let other_symbol = r
            .dispatcher
            .submit(&signal("ETHUSDT", "hammer", 0.80, QualityTier::High), Vec::new(), t0)
            .await;
        assert!(matches!(other_symbol, DispatchOutcome::Fired(_)));
    }

    #[tokio::test]
    async fn priority_delivers_immediately_lower_tiers_queue() {
        let r = rig(|_| {});
        let t0 = Utc::now();

        let hi = r
            .dispatcher
            .submit(&signal("BTCUSDT", "hammer", 0.80, QualityTier::High), Vec::new(), t0)
            .await;
        assert!(matches!(hi, DispatchOutcome::Fired(_)));
        assert_eq!(r.webhook.sent_count(), 1);
        assert_eq!(r.log.sent_count(), 1);

        let good = r
            .dispatcher
            .submit(
                &signal("ETHUSDT", "hammer", 0.70, QualityTier::Good),
                Vec::new(),
                t0,
            )
            .await;
        assert!(matches!(good, DispatchOutcome::Queued(_)));
        // Nothing extra delivered yet.
        assert_eq!(r.webhook.sent_count(), 1);
        assert_eq!(r.dispatcher.stats().digest_pending, 1);

        let flushed = r.dispatcher.flush_digest(t0).await;
        assert_eq!(flushed, 1);
        assert_eq!(r.webhook.sent_count(), 2);
        assert_eq!(r.webhook.digests.lock().as_slice(), &[1]);
        assert_eq!(r.dispatcher.stats().digest_pending, 0);

        // Delivery bookkeeping landed on the repo.
        let listed = r.store.list_alerts(&AlertFilter::default());
        assert!(listed.iter().all(|a| a.delivered_channels.contains("log")));
    }

    #[tokio::test]
    async fn quiet_hours_suppress_push_but_not_log() {
        let now = Utc::now();
        let r = rig(|c| {
            c.quiet_hours_enabled = true;
            c.quiet_start_hour = now.hour();
            c.quiet_end_hour = (now.hour() + 1) % 24;
        });

        let outcome = r
            .dispatcher
            .submit(&signal("BTCUSDT", "hammer", 0.80, QualityTier::High), Vec::new(), now)
            .await;
        assert!(matches!(outcome, DispatchOutcome::Fired(_)));

        // The alert exists, the log saw it, the webhook stayed silent.
        assert_eq!(r.store.alert_count(), 1);
        assert_eq!(r.log.sent_count(), 1);
        assert_eq!(r.webhook.sent_count(), 0);
    }

    #[tokio::test]
    async fn rate_cap_stops_push_deliveries() {
        let r = rig(|c| {
            c.max_deliveries_per_hour = 1;
        });
        let t0 = Utc::now();

        r.dispatcher
            .submit(&signal("BTCUSDT", "hammer", 0.80, QualityTier::High), Vec::new(), t0)
            .await;
        r.dispatcher
            .submit(&signal("ETHUSDT", "hammer", 0.80, QualityTier::High), Vec::new(), t0)
            .await;

        // Cap of one push per hour: second webhook delivery suppressed.
        assert_eq!(r.webhook.sent_count(), 1);
        assert_eq!(r.log.sent_count(), 2);
    }

    #[tokio::test]
    async fn rate_caps_apply_per_channel() {
        let mut config = EngineConfig::default();
        config.quiet_hours_enabled = false;
        config.max_deliveries_per_hour = 2;

        let store = Arc::new(MemoryStore::new());
        let a = RecordingChannel::new("push_a", true);
        let b = RecordingChannel::new("push_b", true);
        let dispatcher =
            AlertDispatcher::new(vec![a.clone(), b.clone()], store, &config);
        let t0 = Utc::now();

        dispatcher
            .submit(&signal("BTCUSDT", "hammer", 0.80, QualityTier::High), Vec::new(), t0)
            .await;
        dispatcher
            .submit(&signal("ETHUSDT", "hammer", 0.80, QualityTier::High), Vec::new(), t0)
            .await;

        // Each channel has its own budget of two.
        assert_eq!(a.sent_count(), 2);
        assert_eq!(b.sent_count(), 2);

        // A third within the hour exhausts both budgets independently.
        dispatcher
            .submit(&signal("SOLUSDT", "hammer", 0.80, QualityTier::High), Vec::new(), t0)
            .await;
        assert_eq!(a.sent_count(), 2);
        assert_eq!(b.sent_count(), 2);
    }

    #[tokio::test]
    async fn dismiss_marks_alert() {
        let r = rig(|_| {});
        let outcome = r
            .dispatcher
            .submit(&signal("BTCUSDT", "hammer", 0.80, QualityTier::High), Vec::new(), Utc::now())
            .await;
        let DispatchOutcome::Fired(id) = outcome else {
            panic!("expected fired");
        };

        assert!(r.dispatcher.dismiss(id));
        assert!(r.store.get_alert(id).unwrap().dismissed);
        assert!(!r.dispatcher.dismiss(Uuid::new_v4()));
    }

    #[test]
    fn quiet_hour_window_wraps_midnight() {
        let mut config = EngineConfig::default();
        config.quiet_start_hour = 22;
        config.quiet_end_hour = 7;
        let store = Arc::new(MemoryStore::new());
        let d = AlertDispatcher::new(Vec::new(), store, &config);

        let at = |hour: u32| {
            Utc::now()
                .date_naive()
                .and_hms_opt(hour, 30, 0)
                .unwrap()
                .and_utc()
        };
        assert!(d.in_quiet_hours(at(23)));
        assert!(d.in_quiet_hours(at(3)));
        assert!(!d.in_quiet_hours(at(12)));
        assert!(!d.in_quiet_hours(at(7)));
    }

    #[test]
    fn quiet_hours_follow_configured_offset() {
        let mut config = EngineConfig::default();
        config.quiet_start_hour = 22;
        config.quiet_end_hour = 7;
        config.quiet_hours_utc_offset = 3;
        let store = Arc::new(MemoryStore::new());
        let d = AlertDispatcher::new(Vec::new(), store, &config);

        let at = |hour: u32| {
            Utc::now()
                .date_naive()
                .and_hms_opt(hour, 30, 0)
                .unwrap()
                .and_utc()
        };
        // 20:30 UTC is 23:30 local, inside the window.
        assert!(d.in_quiet_hours(at(20)));
        // 05:30 UTC is 08:30 local, outside.
        assert!(!d.in_quiet_hours(at(5)));
        // 01:30 UTC is 04:30 local, inside.
        assert!(d.in_quiet_hours(at(1)));
    }
}
