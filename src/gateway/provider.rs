// =============================================================================
// Candle providers — pluggable upstream data sources
// =============================================================================
//
// Every external feed sits behind the `CandleProvider` trait so the gateway
// can iterate a priority-ordered list without caring what backs each entry.
// The REST implementation speaks a klines-style JSON response: an array of
// arrays, numeric fields encoded as strings:
//
//   [[openTime, "open", "high", "low", "close", "volume", closeTime], ...]
// =============================================================================

use async_trait::async_trait;

use crate::error::SignalError;
use crate::market_data::Candle;

/// An upstream OHLCV data source.
#[async_trait]
pub trait CandleProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch up to `lookback` most recent candles, oldest first.
    async fn fetch(
        &self,
        symbol: &str,
        interval: &str,
        lookback: usize,
    ) -> Result<Vec<Candle>, SignalError>;
}

/// REST provider for klines-style candle endpoints.
pub struct RestCandleProvider {
    name: String,
    base_url: String,
    client: reqwest::Client,
}

impl RestCandleProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        timeout: std::time::Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build reqwest client");

        Self {
            name: name.into(),
            base_url: base_url.into(),
            client,
        }
    }

    /// Parse a JSON value that may be either a string or a number into `f64`.
    fn parse_str_f64(val: &serde_json::Value) -> Result<f64, SignalError> {
        if let Some(s) = val.as_str() {
            s.parse::<f64>()
                .map_err(|_| SignalError::Malformed(format!("failed to parse '{s}' as f64")))
        } else if let Some(n) = val.as_f64() {
            Ok(n)
        } else {
            Err(SignalError::Malformed(format!(
                "expected string or number, got: {val}"
            )))
        }
    }

    /// Parse the full array-of-arrays candle payload.
    fn parse_candles(&self, body: &serde_json::Value) -> Result<Vec<Candle>, SignalError> {
        let raw = body
            .as_array()
            .ok_or_else(|| SignalError::Malformed("candle response is not an array".into()))?;

        let mut candles = Vec::with_capacity(raw.len());

        for entry in raw {
            let arr = entry
                .as_array()
                .ok_or_else(|| SignalError::Malformed("candle entry is not an array".into()))?;

            if arr.len() < 7 {
                tracing::warn!(
                    provider = %self.name,
                    elements = arr.len(),
                    "skipping malformed candle entry"
                );
                continue;
            }

            candles.push(Candle {
                open_time: arr[0].as_i64().unwrap_or(0),
                open: Self::parse_str_f64(&arr[1])?,
                high: Self::parse_str_f64(&arr[2])?,
                low: Self::parse_str_f64(&arr[3])?,
                close: Self::parse_str_f64(&arr[4])?,
                volume: Self::parse_str_f64(&arr[5])?,
                close_time: arr[6].as_i64().unwrap_or(0),
            });
        }

        Ok(candles)
    }
}

#[async_trait]
impl CandleProvider for RestCandleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(
        &self,
        symbol: &str,
        interval: &str,
        lookback: usize,
    ) -> Result<Vec<Candle>, SignalError> {
        let url = format!(
            "{}/candles?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, lookback
        );

        let resp = self.client.get(&url).send().await?;

        let status = resp.status();
        let body: serde_json::Value = resp.json().await?;

        if !status.is_success() {
            return Err(SignalError::Malformed(format!(
                "{} returned {status}: {body}",
                self.name
            )));
        }

        let candles = self.parse_candles(&body)?;
        tracing::debug!(
            provider = %self.name,
            symbol,
            interval,
            count = candles.len(),
            "candles fetched"
        );
        Ok(candles)
    }
}

impl std::fmt::Debug for RestCandleProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestCandleProvider")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> RestCandleProvider {
        RestCandleProvider::new("test", "http://localhost", std::time::Duration::from_secs(5))
    }

    #[test]
    fn parse_valid_payload() {
        let body: serde_json::Value = serde_json::from_str(
            r#"[
                [1700000000000, "100.0", "105.0", "98.0", "103.0", "1234.5", 1700003599999],
                [1700003600000, "103.0", "108.0", "101.0", "107.0", "2000.0", 1700007199999]
            ]"#,
        )
        .unwrap();

        let candles = provider().parse_candles(&body).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].open_time, 1_700_000_000_000);
        assert!((candles[0].close - 103.0).abs() < f64::EPSILON);
        assert!((candles[1].volume - 2000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn parse_numeric_fields_without_quotes() {
        let body: serde_json::Value = serde_json::from_str(
            r#"[[1700000000000, 100.0, 105.0, 98.0, 103.0, 1234.5, 1700003599999]]"#,
        )
        .unwrap();
        let candles = provider().parse_candles(&body).unwrap();
        assert_eq!(candles.len(), 1);
        assert!((candles[0].high - 105.0).abs() < f64::EPSILON);
    }

    #[test]
    fn parse_rejects_non_array() {
        let body = serde_json::json!({"error": "nope"});
        assert!(provider().parse_candles(&body).is_err());
    }

    #[test]
    fn parse_skips_short_entries() {
        let body: serde_json::Value = serde_json::from_str(
            r#"[[1700000000000, "100.0"], [1700003600000, "103.0", "108.0", "101.0", "107.0", "2000.0", 1700007199999]]"#,
        )
        .unwrap();
        let candles = provider().parse_candles(&body).unwrap();
        assert_eq!(candles.len(), 1);
    }

    #[test]
    fn parse_bad_number_is_error() {
        let body: serde_json::Value = serde_json::from_str(
            r#"[[1700000000000, "abc", "105.0", "98.0", "103.0", "1.0", 1700003599999]]"#,
        )
        .unwrap();
        assert!(provider().parse_candles(&body).is_err());
    }
}
