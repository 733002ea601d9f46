// =============================================================================
// Breakout strategy — close beyond the recent high/low band plus a buffer
// =============================================================================

use tracing::debug;

use crate::market::Candle;
use crate::signals::{Signal, SignalAction, SignalMetrics, Strategy};

pub struct Breakout {
    /// Number of prior bars forming the band (current bar excluded).
    pub lookback: usize,
    /// Buffer in basis points applied on both sides of the band.
    pub buffer_bps: f64,
}

impl Breakout {
    pub fn new(lookback: usize, buffer_bps: f64) -> Result<Self, String> {
        if lookback == 0 {
            return Err("breakout lookback must be positive".to_string());
        }
        if buffer_bps < 0.0 {
            return Err("breakout buffer must be non-negative".to_string());
        }
        Ok(Self {
            lookback,
            buffer_bps,
        })
    }
}

impl Strategy for Breakout {
    fn name(&self) -> &'static str {
        "breakout"
    }

    fn evaluate(&self, candles: &[Candle]) -> Signal {
        if candles.len() < self.lookback + 1 {
            return Signal::hold("insufficient_candles");
        }

        let current = &candles[candles.len() - 1];
        let window = &candles[candles.len() - 1 - self.lookback..candles.len() - 1];

        let band_high = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
        let band_low = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);

        let buffer = self.buffer_bps / 1e4;
        let up_trigger = band_high * (1.0 + buffer);
        let dn_trigger = band_low * (1.0 - buffer);

        let metrics = SignalMetrics {
            breakout_high: Some(band_high),
            breakout_low: Some(band_low),
            ..SignalMetrics::default()
        };

        let (action, reason) = if current.close > up_trigger {
            (SignalAction::Buy, "breakout_up")
        } else if current.close < dn_trigger {
            (SignalAction::Sell, "breakout_dn")
        } else {
            (SignalAction::Hold, "inside_band")
        };

        debug!(
            close = current.close,
            band_high,
            band_low,
            action = %action,
            "breakout evaluated"
        );

        Signal {
            action,
            reason: reason.to_string(),
            metrics,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::test_support::{candles_from_closes, flat_candles};

    #[test]
    fn too_few_candles_holds() {
        let strat = Breakout::new(10, 10.0).unwrap();
        let signal = strat.evaluate(&flat_candles(100.0, 10));
        assert_eq!(signal.action, SignalAction::Hold);
        assert_eq!(signal.reason, "insufficient_candles");
    }

    #[test]
    fn close_above_band_buys() {
        let strat = Breakout::new(5, 10.0).unwrap();
        let mut candles = candles_from_closes(&[100.0, 101.0, 100.5, 99.5, 100.0]);
        // Band high is 101 * 1.001; a close well above clears the 10 bps buffer.
        candles.push(Candle {
            timestamp_ms: 6 * 60_000,
            open: 100.0,
            high: 103.0,
            low: 100.0,
            close: 102.5,
        });
        let signal = strat.evaluate(&candles);
        assert_eq!(signal.action, SignalAction::Buy);
        assert_eq!(signal.reason, "breakout_up");
        assert!(signal.metrics.breakout_high.unwrap() > 100.0);
    }

    #[test]
    fn close_below_band_sells() {
        let strat = Breakout::new(5, 10.0).unwrap();
        let mut candles = candles_from_closes(&[100.0, 101.0, 100.5, 99.5, 100.0]);
        candles.push(Candle {
            timestamp_ms: 6 * 60_000,
            open: 100.0,
            high: 100.0,
            low: 97.0,
            close: 97.5,
        });
        let signal = strat.evaluate(&candles);
        assert_eq!(signal.action, SignalAction::Sell);
        assert_eq!(signal.reason, "breakout_dn");
    }

    #[test]
    fn inside_band_holds() {
        let strat = Breakout::new(5, 10.0).unwrap();
        let candles = candles_from_closes(&[100.0, 101.0, 100.5, 99.5, 100.0, 100.2]);
        let signal = strat.evaluate(&candles);
        assert_eq!(signal.action, SignalAction::Hold);
        assert_eq!(signal.reason, "inside_band");
    }

    #[test]
    fn buffer_suppresses_marginal_breakouts() {
        // With a 100 bps buffer a 0.5% poke above the band is not a breakout.
        let strict = Breakout::new(5, 100.0).unwrap();
        let loose = Breakout::new(5, 1.0).unwrap();

        let mut candles = candles_from_closes(&[100.0; 5]);
        candles.push(Candle {
            timestamp_ms: 6 * 60_000,
            open: 100.0,
            high: 100.7,
            low: 100.0,
            close: 100.6,
        });

        assert_eq!(strict.evaluate(&candles).action, SignalAction::Hold);
        assert_eq!(loose.evaluate(&candles).action, SignalAction::Buy);
    }
}
