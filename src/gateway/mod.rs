// =============================================================================
// Provider Gateway — ordered fallback with freshness and circuit breaking
// =============================================================================
//
// Tries each configured provider in priority order. A provider is skipped
// while its circuit is open; the circuit opens after a configurable number of
// consecutive failures and the cooldown doubles for each additional failure
// past the threshold. Results whose newest candle closed beyond the freshness
// bound count as a provider failure (stale data is worse than no data).
//
// Per-provider health (last success, consecutive failures, circuit state) is
// exposed as a serialisable snapshot for the operational health surface.
// =============================================================================

pub mod provider;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::SignalError;
use crate::market_data::Candle;
use provider::CandleProvider;

/// Cap on the circuit-open exponent so cooldowns stay bounded.
const MAX_BACKOFF_EXPONENT: u32 = 6;

/// Mutable health record per provider.
#[derive(Debug, Clone, Default)]
struct ProviderHealth {
    consecutive_failures: u32,
    last_success: Option<DateTime<Utc>>,
    last_error: Option<String>,
    degraded_until: Option<DateTime<Utc>>,
}

/// Serialisable per-provider health snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProviderHealthSnapshot {
    pub name: String,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub degraded: bool,
    pub degraded_until: Option<DateTime<Utc>>,
}

/// Gateway over an ordered list of candle providers.
pub struct ProviderGateway {
    providers: Vec<Arc<dyn CandleProvider>>,
    health: RwLock<HashMap<String, ProviderHealth>>,
    freshness_secs: i64,
    fetch_timeout: Duration,
    failure_threshold: u32,
    cooldown_secs: i64,
}

impl ProviderGateway {
    pub fn new(
        providers: Vec<Arc<dyn CandleProvider>>,
        freshness_secs: i64,
        fetch_timeout: Duration,
        failure_threshold: u32,
        cooldown_secs: i64,
    ) -> Self {
        let health = providers
            .iter()
            .map(|p| (p.name().to_string(), ProviderHealth::default()))
            .collect();

        Self {
            providers,
            health: RwLock::new(health),
            freshness_secs,
            fetch_timeout,
            failure_threshold,
            cooldown_secs,
        }
    }

    /// Fetch candles for `(symbol, interval)`, falling through the provider
    /// list on timeout, error, empty response, or stale data.
    ///
    /// Returns `DataUnavailable` once every provider has been exhausted.
    pub async fn fetch(
        &self,
        symbol: &str,
        interval: &str,
        lookback: usize,
    ) -> Result<Vec<Candle>, SignalError> {
        let now = Utc::now();

        for provider in &self.providers {
            let name = provider.name().to_string();

            if self.is_degraded(&name, now) {
                debug!(provider = %name, symbol, interval, "skipping degraded provider");
                continue;
            }

            let result =
                tokio::time::timeout(self.fetch_timeout, provider.fetch(symbol, interval, lookback))
                    .await;

            let outcome = match result {
                Err(_) => Err(SignalError::Timeout(self.fetch_timeout)),
                Ok(Err(e)) => Err(e),
                Ok(Ok(candles)) if candles.is_empty() => {
                    Err(SignalError::EmptyResponse { provider: name.clone() })
                }
                Ok(Ok(candles)) => self.check_freshness(&name, candles, now),
            };

            match outcome {
                Ok(candles) => {
                    self.record_success(&name, now);
                    return Ok(candles);
                }
                Err(e) => {
                    warn!(provider = %name, symbol, interval, error = %e, "provider failed — trying next");
                    self.record_failure(&name, &e, now);
                }
            }
        }

        Err(SignalError::DataUnavailable {
            symbol: symbol.to_string(),
            interval: interval.to_string(),
        })
    }

    /// Reject results whose newest candle closed beyond the freshness bound.
    /// An in-progress candle (close_time in the future) is always fresh.
    fn check_freshness(
        &self,
        provider: &str,
        candles: Vec<Candle>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Candle>, SignalError> {
        let newest = candles
            .last()
            .expect("non-empty checked by caller");

        let age_secs = (now.timestamp_millis() - newest.close_time) / 1000;
        if age_secs > self.freshness_secs {
            return Err(SignalError::StaleData {
                provider: provider.to_string(),
                age_secs,
                bound_secs: self.freshness_secs,
            });
        }

        Ok(candles)
    }

    fn is_degraded(&self, name: &str, now: DateTime<Utc>) -> bool {
        let health = self.health.read();
        health
            .get(name)
            .and_then(|h| h.degraded_until)
            .is_some_and(|until| now < until)
    }

    fn record_success(&self, name: &str, now: DateTime<Utc>) {
        let mut health = self.health.write();
        let entry = health.entry(name.to_string()).or_default();
        entry.consecutive_failures = 0;
        entry.last_success = Some(now);
        entry.last_error = None;
        entry.degraded_until = None;
    }

    fn record_failure(&self, name: &str, error: &SignalError, now: DateTime<Utc>) {
        let mut health = self.health.write();
        let entry = health.entry(name.to_string()).or_default();
        entry.consecutive_failures += 1;
        entry.last_error = Some(error.to_string());

        if entry.consecutive_failures >= self.failure_threshold {
            let exponent = (entry.consecutive_failures - self.failure_threshold)
                .min(MAX_BACKOFF_EXPONENT);
            let cooldown = self.cooldown_secs * (1i64 << exponent);
            entry.degraded_until = Some(now + chrono::Duration::seconds(cooldown));
            warn!(
                provider = %name,
                consecutive_failures = entry.consecutive_failures,
                cooldown_secs = cooldown,
                "provider circuit opened"
            );
        }
    }

    /// Serialisable health snapshot for every configured provider, in
    /// priority order.
    pub fn health_snapshot(&self) -> Vec<ProviderHealthSnapshot> {
        let now = Utc::now();
        let health = self.health.read();

        self.providers
            .iter()
            .map(|p| {
                let h = health.get(p.name()).cloned().unwrap_or_default();
                let degraded = h.degraded_until.is_some_and(|until| now < until);
                ProviderHealthSnapshot {
                    name: p.name().to_string(),
                    consecutive_failures: h.consecutive_failures,
                    last_success: h.last_success,
                    last_error: h.last_error,
                    degraded,
                    degraded_until: h.degraded_until,
                }
            })
            .collect()
    }
}
