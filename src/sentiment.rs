// =============================================================================
// Sentiment aggregation — multi-source weighted blend with a TTL cache
// =============================================================================
//
// Sources are polled concurrently and blended by configured weight times
// reported confidence. Readings are cached per symbol for the configured TTL
// and a per-symbol lock collapses concurrent cache misses into one upstream
// round trip. When every source fails the aggregator degrades to a neutral
// reading with zero confidence, cached for a quarter of the TTL so recovery
// is retried sooner.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::SignalError;

/// Blended sentiment for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentReading {
    pub symbol: String,
    /// Blended polarity in [-1, 1].
    pub score: f64,
    /// Blend confidence in [0, 1]; zero means "treat as unknown".
    pub confidence: f64,
    /// Total mention volume across sources.
    pub volume: u64,
    /// Per-source raw polarity, keyed by source name.
    pub sources: HashMap<String, f64>,
    pub expires_at: DateTime<Utc>,
}

impl SentimentReading {
    /// Neutral placeholder used when no source can be reached.
    pub fn neutral(symbol: &str, expires_at: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.to_string(),
            score: 0.0,
            confidence: 0.0,
            volume: 0,
            sources: HashMap::new(),
            expires_at,
        }
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Raw reading from a single source before blending.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceReading {
    pub score: f64,
    pub confidence: f64,
    #[serde(default)]
    pub volume: u64,
}

#[async_trait]
pub trait SentimentSource: Send + Sync {
    fn name(&self) -> &str;
    /// Blend weight relative to the other configured sources.
    fn weight(&self) -> f64;
    async fn poll(&self, symbol: &str) -> Result<SourceReading, SignalError>;
}

/// HTTP sentiment source: GET {base_url}/sentiment?symbol=...
pub struct RestSentimentSource {
    name: String,
    base_url: String,
    weight: f64,
    client: reqwest::Client,
}

impl RestSentimentSource {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, weight: f64) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            weight,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl SentimentSource for RestSentimentSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    async fn poll(&self, symbol: &str) -> Result<SourceReading, SignalError> {
        let url = format!("{}/sentiment?symbol={}", self.base_url, symbol);
        let response = self.client.get(&url).send().await?.error_for_status()?;
        let reading: SourceReading = response
            .json()
            .await
            .map_err(|e| SignalError::Malformed(format!("sentiment payload: {e}")))?;

        if !(-1.0..=1.0).contains(&reading.score) {
            return Err(SignalError::Malformed(format!(
                "sentiment score {} outside [-1, 1]",
                reading.score
            )));
        }
        Ok(reading)
    }
}

pub struct SentimentAggregator {
    sources: Vec<Arc<dyn SentimentSource>>,
    cache: RwLock<HashMap<String, SentimentReading>>,
    /// Per-symbol fetch locks collapsing concurrent misses.
    inflight: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    ttl_secs: i64,
}

impl SentimentAggregator {
    pub fn new(sources: Vec<Arc<dyn SentimentSource>>, ttl_secs: i64) -> Self {
        Self {
            sources,
            cache: RwLock::new(HashMap::new()),
            inflight: tokio::sync::Mutex::new(HashMap::new()),
            ttl_secs,
        }
    }

    /// Current reading for a symbol, served from cache when fresh.
    pub async fn get(&self, symbol: &str) -> SentimentReading {
        let now = Utc::now();
        if let Some(cached) = self.cached(symbol, now) {
            return cached;
        }

        let lock = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(symbol.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        // Another task may have refreshed while we waited.
        let now = Utc::now();
        if let Some(cached) = self.cached(symbol, now) {
            return cached;
        }

        let reading = self.refresh(symbol, now).await;
        self.cache
            .write()
            .insert(symbol.to_string(), reading.clone());
        reading
    }

    fn cached(&self, symbol: &str, now: DateTime<Utc>) -> Option<SentimentReading> {
        self.cache
            .read()
            .get(symbol)
            .filter(|r| r.is_fresh(now))
            .cloned()
    }

    async fn refresh(&self, symbol: &str, now: DateTime<Utc>) -> SentimentReading {
        let polls = self.sources.iter().map(|source| {
            let source = source.clone();
            async move {
                let result = source.poll(symbol).await;
                (source, result)
            }
        });

        let mut blended_score = 0.0;
        let mut mass = 0.0;
        let mut weight_total = 0.0;
        let mut volume = 0u64;
        let mut contributors = HashMap::new();

        for (source, result) in futures_util::future::join_all(polls).await {
            weight_total += source.weight();
            match result {
                Ok(reading) => {
                    let w = source.weight() * reading.confidence.clamp(0.0, 1.0);
                    blended_score += reading.score * w;
                    mass += w;
                    volume += reading.volume;
                    contributors.insert(source.name().to_string(), reading.score);
                }
                Err(e) => {
                    warn!(symbol, source = source.name(), error = %e, "sentiment source failed");
                }
            }
        }

        if contributors.is_empty() || mass <= 0.0 || weight_total <= 0.0 {
            // Short-lived neutral so recovery is retried before a full TTL.
            let expires_at = now + Duration::seconds((self.ttl_secs / 4).max(1));
            debug!(symbol, "all sentiment sources unavailable, serving neutral");
            return SentimentReading::neutral(symbol, expires_at);
        }

        let reading = SentimentReading {
            symbol: symbol.to_string(),
            score: (blended_score / mass).clamp(-1.0, 1.0),
            confidence: (mass / weight_total).clamp(0.0, 1.0),
            volume,
            sources: contributors,
            expires_at: now + Duration::seconds(self.ttl_secs),
        };
        debug!(
            symbol,
            score = format!("{:.3}", reading.score),
            confidence = format!("{:.3}", reading.confidence),
            sources = reading.sources.len(),
            "sentiment refreshed"
        );
        reading
    }
}
