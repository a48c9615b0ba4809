// =============================================================================
// Error taxonomy for the detection pipeline
// =============================================================================
//
// Failures local to one symbol, one timeframe, or one channel are contained by
// the caller and never abort a whole scan cycle. The variants here map onto
// the distinct downstream behaviours:
//
//   DataUnavailable   -> "no signal this cycle" for that symbol/timeframe
//   StaleData         -> folded into DataUnavailable at the gateway boundary
//   DeliveryFailure   -> retried with backoff, recorded on alert metadata
//   Timeout           -> treated as failure of the timed-out unit only

use std::time::Duration;

use thiserror::Error;

/// Typed errors for the SignalForge pipeline.
#[derive(Error, Debug)]
pub enum SignalError {
    #[error("no provider could supply candles for {symbol}@{interval}")]
    DataUnavailable { symbol: String, interval: String },

    #[error("stale data from {provider}: newest candle closed {age_secs}s ago (bound {bound_secs}s)")]
    StaleData {
        provider: String,
        age_secs: i64,
        bound_secs: i64,
    },

    #[error("delivery via {channel} failed: {reason}")]
    DeliveryFailure { channel: String, reason: String },

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("provider {provider} returned an empty candle set")]
    EmptyResponse { provider: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed response payload: {0}")]
    Malformed(String),
}

impl SignalError {
    /// Whether a caller-facing API should advise "retry later" (transient)
    /// rather than "no data exists".
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
                | Self::Http(_)
                | Self::DeliveryFailure { .. }
                | Self::StaleData { .. }
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_unavailable_is_not_transient() {
        let err = SignalError::DataUnavailable {
            symbol: "BTCUSDT".into(),
            interval: "1h".into(),
        };
        assert!(!err.is_transient());
        assert!(err.to_string().contains("BTCUSDT@1h"));
    }

    #[test]
    fn timeout_is_transient() {
        let err = SignalError::Timeout(Duration::from_secs(10));
        assert!(err.is_transient());
    }

    #[test]
    fn stale_data_message_contains_bound() {
        let err = SignalError::StaleData {
            provider: "alpha".into(),
            age_secs: 4000,
            bound_secs: 1800,
        };
        assert!(err.is_transient());
        let msg = err.to_string();
        assert!(msg.contains("alpha"));
        assert!(msg.contains("1800"));
    }
}
