// =============================================================================
// Scan scheduler — periodic symbol sweeps with bounded parallelism
// =============================================================================
//
// Each cycle races the full symbol universe against the cycle deadline. A
// semaphore caps concurrent symbols; work still pending at the deadline is
// aborted and counted, never awaited into the next cycle. One symbol's
// pipeline is fetch/fuse -> learned validation -> sentiment -> composite ->
// dispatch.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::time::{interval, Duration as TokioDuration, Instant};
use tracing::{debug, info, warn};

use crate::alerts::DispatchOutcome;
use crate::app_state::AppState;
use crate::error::SignalError;

/// Summary of one scan cycle.
#[derive(Debug, Default, Clone)]
pub struct CycleReport {
    pub scanned: usize,
    pub fired: usize,
    pub queued: usize,
    pub suppressed: usize,
    pub below_gate: usize,
    pub errors: usize,
    pub abandoned: usize,
}

/// Periodic scan loop. Runs until the task is aborted.
pub async fn run(app: Arc<AppState>) {
    let mut ticker = interval(TokioDuration::from_secs(app.config.scan_interval_secs));
    loop {
        ticker.tick().await;
        let report = run_cycle(&app, Utc::now()).await;
        info!(
            scanned = report.scanned,
            fired = report.fired,
            queued = report.queued,
            suppressed = report.suppressed,
            errors = report.errors,
            abandoned = report.abandoned,
            "scan cycle complete"
        );
    }
}

/// One full sweep over the configured symbol universe.
pub async fn run_cycle(app: &Arc<AppState>, now: DateTime<Utc>) -> CycleReport {
    let deadline = Instant::now() + TokioDuration::from_secs(app.config.cycle_deadline_secs);
    let semaphore = Arc::new(Semaphore::new(app.config.scan_parallelism.max(1)));

    let mut handles = Vec::with_capacity(app.config.symbols.len());
    for symbol in app.config.symbols.clone() {
        let app = app.clone();
        let semaphore = semaphore.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("scan semaphore never closed");
            process_symbol(&app, &symbol, now).await
        }));
    }

    let mut report = CycleReport::default();
    for mut handle in handles {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, &mut handle).await {
            Ok(Ok(result)) => {
                report.scanned += 1;
                match result {
                    Ok(Some(DispatchOutcome::Fired(_))) => report.fired += 1,
                    Ok(Some(DispatchOutcome::Queued(_))) => report.queued += 1,
                    Ok(Some(DispatchOutcome::SuppressedCooldown)) => report.suppressed += 1,
                    Ok(Some(DispatchOutcome::BelowGate)) => report.below_gate += 1,
                    Ok(None) => {}
                    Err(e) => {
                        report.errors += 1;
                        debug!(error = %e, "symbol scan failed");
                    }
                }
            }
            Ok(Err(join_err)) => {
                report.errors += 1;
                warn!(error = %join_err, "symbol scan task panicked");
            }
            Err(_) => {
                handle.abort();
                report.abandoned += 1;
            }
        }
    }

    if report.abandoned > 0 {
        warn!(abandoned = report.abandoned, "cycle deadline hit, work abandoned");
    }
    report
}

/// The per-symbol pipeline. `Ok(None)` means nothing fired on this symbol.
async fn process_symbol(
    app: &Arc<AppState>,
    symbol: &str,
    now: DateTime<Utc>,
) -> Result<Option<DispatchOutcome>, SignalError> {
    let Some(evaluation) = app.evaluate(symbol).await? else {
        debug!(symbol, "no pattern candidates this cycle");
        return Ok(None);
    };

    let outcome = app
        .dispatcher
        .submit(&evaluation.signal, evaluation.features, now)
        .await;
    Ok(Some(outcome))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{Alert, AlertChannel};
    use crate::config::EngineConfig;
    use crate::error::SignalError;
    use crate::gateway::provider::CandleProvider;
    use crate::market_data::Candle;
    use crate::store::AlertFilter;
    use crate::types::QualityTier;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use uuid::Uuid;

    /// Serves canned candles for configured (symbol, interval) pairs and
    /// fails everything else.
    struct CannedProvider {
        series: HashMap<(String, String), Vec<Candle>>,
    }

    #[async_trait]
    impl CandleProvider for CannedProvider {
        fn name(&self) -> &str {
            "canned"
        }

        async fn fetch(
            &self,
            symbol: &str,
            interval: &str,
            _lookback: usize,
        ) -> Result<Vec<Candle>, SignalError> {
            self.series
                .get(&(symbol.to_string(), interval.to_string()))
                .cloned()
                .ok_or_else(|| SignalError::Malformed("no canned series".into()))
        }
    }

    struct RecordingChannel {
        sent: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl AlertChannel for RecordingChannel {
        fn name(&self) -> &str {
            "recording"
        }

        fn push_class(&self) -> bool {
            false
        }

        async fn send(&self, alert: &Alert) -> Result<(), SignalError> {
            self.sent.lock().push(alert.id);
            Ok(())
        }
    }

    fn candle(open_time: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Candle {
        Candle {
            open_time,
            close_time: open_time + 3_599_999,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Fresh flat hourly series ending in a bullish engulfing pair.
    fn engulfing_series(len: usize) -> Vec<Candle> {
        let now = Utc::now().timestamp_millis();
        let mut series: Vec<Candle> = (0..len - 2)
            .map(|i| {
                let open_time = now - ((len - i) as i64) * 3_600_000;
                candle(open_time, 100.0, 100.6, 99.4, 100.0, 50.0)
            })
            .collect();
        series.push(candle(now - 2 * 3_600_000, 101.0, 101.5, 99.5, 100.0, 50.0));
        series.push(candle(now - 3_600_000, 99.8, 102.6, 99.6, 102.5, 200.0));
        series
    }

    fn app_with_engulfing(symbols: Vec<&str>) -> (Arc<AppState>, Arc<RecordingChannel>) {
        let mut config = EngineConfig::default();
        config.symbols = symbols.iter().map(|s| s.to_string()).collect();
        config.quiet_hours_enabled = false;
        // The canned provider intentionally fails 4h/1d fetches; keep those
        // misses from opening its circuit across repeated cycles.
        config.provider_failure_threshold = 1000;

        let mut series = HashMap::new();
        for symbol in &symbols {
            series.insert(
                (symbol.to_string(), "1h".to_string()),
                engulfing_series(60),
            );
        }
        let provider = Arc::new(CannedProvider { series });

        let channel = Arc::new(RecordingChannel {
            sent: Mutex::new(Vec::new()),
        });

        let app = AppState::build_with(
            config,
            vec![provider],
            Vec::new(), // no sentiment sources: aggregator degrades to neutral
            vec![channel.clone()],
        );
        (app, channel)
    }

    #[tokio::test]
    async fn end_to_end_engulfing_fires_one_alert() {
        let (app, channel) = app_with_engulfing(vec!["BTCUSDT"]);

        let report = run_cycle(&app, Utc::now()).await;
        assert_eq!(report.scanned, 1);
        assert_eq!(report.fired, 1);
        assert_eq!(report.errors, 0);

        let alerts = app.alerts(&AlertFilter::default());
        assert_eq!(alerts.len(), 1);
        let alert = &alerts[0];
        assert_eq!(alert.pattern_name, "bullish_engulfing");
        assert!(alert.quality_tier >= QualityTier::Good, "got {}", alert.quality_tier);
        assert!(alert.stop_price < alert.entry_price);
        assert!(alert.target_price > alert.entry_price);
        assert_eq!(channel.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn repeat_cycle_within_cooldown_is_suppressed() {
        let (app, channel) = app_with_engulfing(vec!["BTCUSDT"]);
        let t0 = Utc::now();

        let first = run_cycle(&app, t0).await;
        assert_eq!(first.fired, 1);

        let second = run_cycle(&app, t0 + chrono::Duration::seconds(120)).await;
        assert_eq!(second.fired, 0);
        assert_eq!(second.suppressed, 1);

        // Still only one alert recorded and one delivery.
        assert_eq!(app.alerts(&AlertFilter::default()).len(), 1);
        assert_eq!(channel.sent.lock().len(), 1);

        // Past the cool-down the same setup fires again.
        let third = run_cycle(&app, t0 + chrono::Duration::seconds(3601)).await;
        assert_eq!(third.fired, 1);
        assert_eq!(app.alerts(&AlertFilter::default()).len(), 2);
    }

    #[tokio::test]
    async fn dismissal_does_not_bypass_cooldown() {
        let (app, channel) = app_with_engulfing(vec!["BTCUSDT"]);
        let t0 = Utc::now();

        let first = run_cycle(&app, t0).await;
        assert_eq!(first.fired, 1);
        let fired = app.alerts(&AlertFilter::default());
        assert!(app.dismiss_alert(fired[0].id));

        // The identical setup inside the cool-down stays suppressed even
        // though the first alert was dismissed.
        let second = run_cycle(&app, t0 + chrono::Duration::seconds(120)).await;
        assert_eq!(second.fired, 0);
        assert_eq!(second.suppressed, 1);

        let all = app.alerts(&AlertFilter {
            include_dismissed: true,
            ..AlertFilter::default()
        });
        assert_eq!(all.len(), 1);
        assert!(all[0].dismissed);
        assert_eq!(channel.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn multiple_symbols_scan_independently() {
        let (app, _channel) = app_with_engulfing(vec!["BTCUSDT", "ETHUSDT", "SOLUSDT"]);

        let report = run_cycle(&app, Utc::now()).await;
        assert_eq!(report.scanned, 3);
        assert_eq!(report.fired, 3);
        assert_eq!(app.alerts(&AlertFilter::default()).len(), 3);
    }

    #[tokio::test]
    async fn unreachable_universe_reports_errors_not_panics() {
        let mut config = EngineConfig::default();
        config.symbols = vec!["BTCUSDT".to_string()];
        let provider = Arc::new(CannedProvider {
            series: HashMap::new(),
        });
        let app = AppState::build_with(config, vec![provider], Vec::new(), Vec::new());

        let report = run_cycle(&app, Utc::now()).await;
        assert_eq!(report.scanned, 1);
        assert_eq!(report.errors, 1);
        assert_eq!(report.fired, 0);
    }
}
