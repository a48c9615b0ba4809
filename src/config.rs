// =============================================================================
// Engine Configuration — hot-reloadable settings with atomic save
// =============================================================================
//
// Central configuration hub for the SignalForge engine. Every tunable
// parameter lives here: provider priority, freshness bound, per-regime
// timeframe weight tables, composite layer weights, tier thresholds, alert
// cool-down and rate caps, quiet hours, scan cadence and parallelism, and the
// outcome/learning parameters.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields never
// breaks loading an older config file.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "BNBUSDT".to_string(),
        "SOLUSDT".to_string(),
        "XRPUSDT".to_string(),
    ]
}

fn default_timeframes() -> Vec<String> {
    vec!["1h".to_string(), "4h".to_string(), "1d".to_string()]
}

fn default_providers() -> Vec<ProviderEndpoint> {
    vec![
        ProviderEndpoint {
            name: "primary".to_string(),
            base_url: "https://api.primary-feed.example".to_string(),
        },
        ProviderEndpoint {
            name: "fallback".to_string(),
            base_url: "https://api.fallback-feed.example".to_string(),
        },
    ]
}

fn default_freshness_secs() -> i64 {
    1800
}

fn default_fetch_timeout_secs() -> u64 {
    10
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_provider_cooldown_secs() -> i64 {
    120
}

fn default_lookback() -> usize {
    100
}

fn default_detector_min_candles() -> usize {
    20
}

fn default_learned_window() -> usize {
    16
}

fn default_learned_gate() -> f64 {
    0.55
}

fn default_divergence_threshold() -> f64 {
    0.35
}

fn default_regime_weights() -> HashMap<String, HashMap<String, f64>> {
    let mut tables = HashMap::new();
    tables.insert(
        "trending".to_string(),
        HashMap::from([
            ("1h".to_string(), 0.20),
            ("4h".to_string(), 0.30),
            ("1d".to_string(), 0.50),
        ]),
    );
    tables.insert(
        "ranging".to_string(),
        HashMap::from([
            ("1h".to_string(), 0.50),
            ("4h".to_string(), 0.30),
            ("1d".to_string(), 0.20),
        ]),
    );
    tables.insert(
        "volatile".to_string(),
        HashMap::from([
            ("1h".to_string(), 0.40),
            ("4h".to_string(), 0.40),
            ("1d".to_string(), 0.20),
        ]),
    );
    tables.insert(
        "default".to_string(),
        HashMap::from([
            ("1h".to_string(), 0.34),
            ("4h".to_string(), 0.33),
            ("1d".to_string(), 0.33),
        ]),
    );
    tables
}

fn default_layer_weights() -> HashMap<String, f64> {
    HashMap::from([
        ("pattern".to_string(), 0.40),
        ("validation".to_string(), 0.25),
        ("sentiment".to_string(), 0.15),
        ("market_context".to_string(), 0.20),
    ])
}

fn default_tier_elite() -> f64 {
    0.85
}

fn default_tier_high() -> f64 {
    0.75
}

fn default_tier_good() -> f64 {
    0.65
}

fn default_min_alert_score() -> f64 {
    0.65
}

fn default_cooldown_secs() -> i64 {
    3600
}

fn default_max_per_hour() -> u32 {
    20
}

fn default_max_per_day() -> u32 {
    100
}

fn default_quiet_start_hour() -> u32 {
    22
}

fn default_quiet_end_hour() -> u32 {
    7
}

fn default_digest_flush_secs() -> u64 {
    900
}

fn default_scan_interval_secs() -> u64 {
    60
}

fn default_scan_parallelism() -> usize {
    8
}

fn default_cycle_deadline_secs() -> u64 {
    45
}

fn default_sentiment_ttl_secs() -> i64 {
    300
}

fn default_sentiment_endpoints() -> Vec<SentimentEndpoint> {
    Vec::new()
}

fn default_label_grace_secs() -> i64 {
    3600
}

fn default_labeler_interval_secs() -> u64 {
    120
}

fn default_label_timeframe() -> String {
    "1h".to_string()
}

fn default_horizon_bars() -> usize {
    24
}

fn default_stop_atr_mult() -> f64 {
    1.5
}

fn default_target_atr_mult() -> f64 {
    2.5
}

fn default_learner_interval_secs() -> u64 {
    300
}

fn default_learner_batch_size() -> usize {
    32
}

fn default_learning_rate() -> f64 {
    0.05
}

fn default_promotion_threshold() -> f64 {
    0.58
}

fn default_promotion_min_samples() -> usize {
    50
}

fn default_delivery_retries() -> u32 {
    3
}

// =============================================================================
// Nested config sections
// =============================================================================

/// A single external candle provider, in priority order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEndpoint {
    pub name: String,
    pub base_url: String,
}

/// A configured sentiment source with its blend weight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentEndpoint {
    pub name: String,
    pub base_url: String,
    pub weight: f64,
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level runtime configuration for the SignalForge engine.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // --- Symbol universe & timeframes ----------------------------------------
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Timeframes fused per symbol, shortest first.
    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<String>,

    // --- Provider gateway ----------------------------------------------------
    /// Candle providers in fallback order.
    #[serde(default = "default_providers")]
    pub providers: Vec<ProviderEndpoint>,

    /// Newest candle must have closed within this many seconds.
    #[serde(default = "default_freshness_secs")]
    pub freshness_secs: i64,

    /// Per-provider HTTP timeout.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    /// Consecutive failures before a provider's circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub provider_failure_threshold: u32,

    /// Base cooldown while a provider circuit is open; doubles per additional
    /// failure past the threshold.
    #[serde(default = "default_provider_cooldown_secs")]
    pub provider_cooldown_secs: i64,

    /// Candles fetched per (symbol, timeframe) request.
    #[serde(default = "default_lookback")]
    pub lookback: usize,

    // --- Pattern detection ---------------------------------------------------
    /// Minimum candles the detector needs before emitting anything.
    #[serde(default = "default_detector_min_candles")]
    pub detector_min_candles: usize,

    /// Raw-candle window length consumed by the learned classifier.
    #[serde(default = "default_learned_window")]
    pub learned_window: usize,

    /// Minimum probability for the learned classifier to emit a candidate.
    #[serde(default = "default_learned_gate")]
    pub learned_gate: f64,

    // --- Fusion --------------------------------------------------------------
    /// Per-regime timeframe weight tables. Each table sums to 1.0.
    #[serde(default = "default_regime_weights")]
    pub regime_weights: HashMap<String, HashMap<String, f64>>,

    /// Max/min per-timeframe score spread beyond which divergence is flagged.
    #[serde(default = "default_divergence_threshold")]
    pub divergence_threshold: f64,

    // --- Composite scoring ---------------------------------------------------
    /// Named layer weights; renormalized after excluding zero-confidence
    /// layers.
    #[serde(default = "default_layer_weights")]
    pub layer_weights: HashMap<String, f64>,

    #[serde(default = "default_tier_elite")]
    pub tier_elite: f64,
    #[serde(default = "default_tier_high")]
    pub tier_high: f64,
    #[serde(default = "default_tier_good")]
    pub tier_good: f64,

    /// ATR multiplier for the stop level.
    #[serde(default = "default_stop_atr_mult")]
    pub stop_atr_mult: f64,

    /// ATR multiplier for the target level.
    #[serde(default = "default_target_atr_mult")]
    pub target_atr_mult: f64,

    // --- Alert dispatch ------------------------------------------------------
    /// Minimum composite score for an alert to fire.
    #[serde(default = "default_min_alert_score")]
    pub min_alert_score: f64,

    /// Cool-down per (symbol, pattern) key between fired alerts.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: i64,

    /// Global per-channel delivery caps.
    #[serde(default = "default_max_per_hour")]
    pub max_deliveries_per_hour: u32,
    #[serde(default = "default_max_per_day")]
    pub max_deliveries_per_day: u32,

    /// Quiet hours: push-class channels are suppressed in this local-time
    /// window (alerts are still recorded).
    #[serde(default = "default_true")]
    pub quiet_hours_enabled: bool,
    #[serde(default = "default_quiet_start_hour")]
    pub quiet_start_hour: u32,
    #[serde(default = "default_quiet_end_hour")]
    pub quiet_end_hour: u32,
    /// Offset from UTC, in whole hours, of the timezone the quiet window is
    /// defined in.
    #[serde(default)]
    pub quiet_hours_utc_offset: i32,

    /// Cadence at which the low-priority digest bucket is flushed.
    #[serde(default = "default_digest_flush_secs")]
    pub digest_flush_secs: u64,

    /// Delivery retry attempts per channel before recording a failure.
    #[serde(default = "default_delivery_retries")]
    pub delivery_retries: u32,

    // --- Scan scheduler ------------------------------------------------------
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,

    /// Maximum symbols processed concurrently per cycle.
    #[serde(default = "default_scan_parallelism")]
    pub scan_parallelism: usize,

    /// Overall deadline for one scan cycle; unfinished work is abandoned.
    #[serde(default = "default_cycle_deadline_secs")]
    pub cycle_deadline_secs: u64,

    // --- Sentiment -----------------------------------------------------------
    #[serde(default = "default_sentiment_ttl_secs")]
    pub sentiment_ttl_secs: i64,

    /// Configured sentiment sources (news / social / market-wide).
    #[serde(default = "default_sentiment_endpoints")]
    pub sentiment_endpoints: Vec<SentimentEndpoint>,

    // --- Outcome labeling ----------------------------------------------------
    /// Alerts younger than this are not labeled yet.
    #[serde(default = "default_label_grace_secs")]
    pub label_grace_secs: i64,

    #[serde(default = "default_labeler_interval_secs")]
    pub labeler_interval_secs: u64,

    /// Timeframe of the price path used to resolve outcomes.
    #[serde(default = "default_label_timeframe")]
    pub label_timeframe: String,

    /// Maximum bars before an unresolved alert is labeled by final close.
    #[serde(default = "default_horizon_bars")]
    pub horizon_bars: usize,

    // --- Incremental learner -------------------------------------------------
    #[serde(default = "default_learner_interval_secs")]
    pub learner_interval_secs: u64,

    #[serde(default = "default_learner_batch_size")]
    pub learner_batch_size: usize,

    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    /// Rolling-metric threshold at which a candidate model is promoted.
    #[serde(default = "default_promotion_threshold")]
    pub promotion_threshold: f64,

    /// Minimum outcomes a candidate must have seen before promotion.
    #[serde(default = "default_promotion_min_samples")]
    pub promotion_min_samples: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        // Serde fills every field from its default fn.
        serde_json::from_str("{}").expect("default config must deserialise")
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            timeframes = ?config.timeframes,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise engine config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    /// Weight table for the given regime key, falling back to "default".
    pub fn timeframe_weights(&self, regime: &str) -> HashMap<String, f64> {
        self.regime_weights
            .get(regime)
            .or_else(|| self.regime_weights.get("default"))
            .cloned()
            .unwrap_or_default()
    }

    /// Validate that every regime weight table sums to 1.0 and that layer
    /// weights sum to 1.0 (within floating tolerance).
    pub fn validate(&self) -> Result<()> {
        for (regime, table) in &self.regime_weights {
            let sum: f64 = table.values().sum();
            if (sum - 1.0).abs() > 1e-6 {
                anyhow::bail!("regime '{regime}' timeframe weights sum to {sum}, expected 1.0");
            }
        }
        let layer_sum: f64 = self.layer_weights.values().sum();
        if (layer_sum - 1.0).abs() > 1e-6 {
            anyhow::bail!("layer weights sum to {layer_sum}, expected 1.0");
        }
        if self.tier_elite < self.tier_high || self.tier_high < self.tier_good {
            anyhow::bail!("quality tier thresholds must be non-increasing ELITE >= HIGH >= GOOD");
        }
        if !(-12..=14).contains(&self.quiet_hours_utc_offset) {
            anyhow::bail!(
                "quiet_hours_utc_offset {} outside -12..=14",
                self.quiet_hours_utc_offset
            );
        }
        Ok(())
    }
}
