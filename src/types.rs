// =============================================================================
// Shared types used across the SignalForge detection engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Directional bias of a detected pattern or signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Bullish,
    Bearish,
    Neutral,
}

impl Direction {
    /// Signed multiplier: +1 bullish, -1 bearish, 0 neutral.
    pub fn sign(self) -> f64 {
        match self {
            Self::Bullish => 1.0,
            Self::Bearish => -1.0,
            Self::Neutral => 0.0,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bullish => write!(f, "BULLISH"),
            Self::Bearish => write!(f, "BEARISH"),
            Self::Neutral => write!(f, "NEUTRAL"),
        }
    }
}

/// Which detection strategy produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatternSource {
    Rule,
    Learned,
}

impl std::fmt::Display for PatternSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rule => write!(f, "rule"),
            Self::Learned => write!(f, "learned"),
        }
    }
}

/// Discrete quality bucket derived from a composite score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QualityTier {
    Moderate,
    Good,
    High,
    Elite,
}

impl QualityTier {
    /// Tiers at or above HIGH are delivered immediately; lower tiers go to
    /// the digest bucket.
    pub fn is_priority(self) -> bool {
        matches!(self, Self::Elite | Self::High)
    }
}

impl std::fmt::Display for QualityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Elite => write!(f, "ELITE"),
            Self::High => write!(f, "HIGH"),
            Self::Good => write!(f, "GOOD"),
            Self::Moderate => write!(f, "MODERATE"),
        }
    }
}

/// Advisory action from the timing agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimingAction {
    Buy,
    Sell,
    Hold,
}

impl std::fmt::Display for TimingAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
            Self::Hold => write!(f, "HOLD"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_sign() {
        assert_eq!(Direction::Bullish.sign(), 1.0);
        assert_eq!(Direction::Bearish.sign(), -1.0);
        assert_eq!(Direction::Neutral.sign(), 0.0);
    }

    #[test]
    fn tier_ordering_and_priority() {
        assert!(QualityTier::Elite > QualityTier::High);
        assert!(QualityTier::High > QualityTier::Good);
        assert!(QualityTier::Good > QualityTier::Moderate);
        assert!(QualityTier::Elite.is_priority());
        assert!(QualityTier::High.is_priority());
        assert!(!QualityTier::Good.is_priority());
    }

    #[test]
    fn display_formats() {
        assert_eq!(format!("{}", Direction::Bullish), "BULLISH");
        assert_eq!(format!("{}", PatternSource::Learned), "learned");
        assert_eq!(format!("{}", QualityTier::Elite), "ELITE");
        assert_eq!(format!("{}", TimingAction::Hold), "HOLD");
    }
}
