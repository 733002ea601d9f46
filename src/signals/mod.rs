// =============================================================================
// Signal engine — strategies turn a candle series into BUY / SELL / HOLD
// =============================================================================

pub mod breakout;
pub mod momentum;

use serde::{Deserialize, Serialize};

use crate::market::Candle;

/// What a strategy wants done this window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

impl std::fmt::Display for SignalAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
            Self::Hold => write!(f, "HOLD"),
        }
    }
}

/// Optional diagnostics attached to a signal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub momentum_bps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realized_vol_pct: Option<f64>,
    /// Volatility-scaled sizing multiplier, clamped to the strategy's bounds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_multiplier: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breakout_high: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breakout_low: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub action: SignalAction,
    pub reason: String,
    #[serde(default)]
    pub metrics: SignalMetrics,
}

impl Signal {
    pub fn hold(reason: impl Into<String>) -> Self {
        Self {
            action: SignalAction::Hold,
            reason: reason.into(),
            metrics: SignalMetrics::default(),
        }
    }
}

/// Common interface both strategies implement.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn evaluate(&self, candles: &[Candle]) -> Signal;
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Build a flat candle series at `price`, 1-minute spacing.
    pub fn flat_candles(price: f64, count: usize) -> Vec<Candle> {
        (0..count)
            .map(|i| Candle {
                timestamp_ms: (i as i64) * 60_000,
                open: price,
                high: price,
                low: price,
                close: price,
            })
            .collect()
    }

    /// Build a series from closes, with a small high/low band around each.
    pub fn candles_from_closes(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle {
                timestamp_ms: (i as i64) * 60_000,
                open: c,
                high: c * 1.001,
                low: c * 0.999,
                close: c,
            })
            .collect()
    }
}
