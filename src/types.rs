// =============================================================================
// Shared types used across the trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Order side / position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// The side of the stop-loss / take-profit orders that close this position.
    pub fn closing_side(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

impl std::str::FromStr for Side {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            other => anyhow::bail!("unknown side: {other}"),
        }
    }
}

/// Operating mode for the process as a whole. Only `Live` submits real
/// orders; `Paper` and `Backtest` are accepted by configuration but the
/// offline backtest harness itself is out of scope for this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunMode {
    Live,
    Paper,
    Backtest,
}

impl Default for RunMode {
    fn default() -> Self {
        Self::Paper
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "LIVE"),
            Self::Paper => write!(f, "PAPER"),
            Self::Backtest => write!(f, "BACKTEST"),
        }
    }
}

impl std::str::FromStr for RunMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LIVE" => Ok(Self::Live),
            "PAPER" => Ok(Self::Paper),
            "BACKTEST" => Ok(Self::Backtest),
            other => anyhow::bail!("unknown RUN_MODE: {other}"),
        }
    }
}

/// Whether the strategy evaluator runs in single-timeframe or four-timeframe
/// mode (spec.md §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyMode {
    Simple,
    Advanced,
}

impl std::fmt::Display for StrategyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Simple => write!(f, "simple"),
            Self::Advanced => write!(f, "advanced"),
        }
    }
}

impl std::str::FromStr for StrategyMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "simple" => Ok(Self::Simple),
            "advanced" => Ok(Self::Advanced),
            other => anyhow::bail!("unknown strategy mode: {other}"),
        }
    }
}

/// Position sizing mode (spec.md §4.5 / §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SizingMode {
    Fixed,
    Atr,
}

impl std::str::FromStr for SizingMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "atr" => Ok(Self::Atr),
            other => anyhow::bail!("unknown sizing mode: {other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_round_trips_through_display_and_parse() {
        assert_eq!("BUY".parse::<Side>().unwrap(), Side::Buy);
        assert_eq!("sell".parse::<Side>().unwrap(), Side::Sell);
        assert_eq!(Side::Buy.closing_side(), Side::Sell);
        assert_eq!(Side::Sell.closing_side(), Side::Buy);
    }

    #[test]
    fn run_mode_parses_case_insensitively() {
        assert_eq!("live".parse::<RunMode>().unwrap(), RunMode::Live);
        assert!("bogus".parse::<RunMode>().is_err());
    }
}
