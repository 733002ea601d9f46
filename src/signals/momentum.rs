// =============================================================================
// Risk-managed momentum — return-driven signal with volatility-scaled sizing
// =============================================================================
//
// Momentum is the return since M bars ago in basis points. Realized
// volatility is the sample stddev of log returns over the last V bars,
// expressed as percent per bar. The risk multiplier targets a volatility
// level: `t / max(eps, sigma)`, clamped to the configured bounds.
// =============================================================================

use tracing::debug;

use crate::market::Candle;
use crate::signals::{Signal, SignalAction, SignalMetrics, Strategy};

const VOL_EPSILON: f64 = 1e-9;

pub struct RiskManagedMomentum {
    pub momentum_lookback: usize,
    pub volatility_lookback: usize,
    pub entry_bps: f64,
    pub exit_bps: f64,
    pub target_volatility_pct: f64,
    pub min_multiplier: f64,
    pub max_multiplier: f64,
}

impl RiskManagedMomentum {
    pub fn new(
        momentum_lookback: usize,
        volatility_lookback: usize,
        entry_bps: f64,
        exit_bps: f64,
        target_volatility_pct: f64,
        min_multiplier: f64,
        max_multiplier: f64,
    ) -> Result<Self, String> {
        if momentum_lookback == 0 {
            return Err("momentum lookback must be positive".to_string());
        }
        if volatility_lookback <= momentum_lookback {
            return Err(format!(
                "volatility lookback {volatility_lookback} must exceed momentum lookback {momentum_lookback}"
            ));
        }
        if entry_bps <= 0.0 || exit_bps <= 0.0 {
            return Err("entry/exit thresholds must be positive".to_string());
        }
        if target_volatility_pct <= 0.0 {
            return Err("target volatility must be positive".to_string());
        }
        if min_multiplier <= 0.0 || max_multiplier < min_multiplier {
            return Err("multiplier bounds must satisfy 0 < min <= max".to_string());
        }
        Ok(Self {
            momentum_lookback,
            volatility_lookback,
            entry_bps,
            exit_bps,
            target_volatility_pct,
            min_multiplier,
            max_multiplier,
        })
    }

    /// Sample stddev of log returns over the last `volatility_lookback` bars,
    /// as percent per bar.
    fn realized_vol_pct(&self, closes: &[f64]) -> f64 {
        let n = self.volatility_lookback;
        let window = &closes[closes.len() - n - 1..];
        let returns: Vec<f64> = window
            .windows(2)
            .map(|pair| (pair[1] / pair[0]).ln())
            .collect();

        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let var = returns
            .iter()
            .map(|r| (r - mean).powi(2))
            .sum::<f64>()
            / (returns.len() as f64 - 1.0).max(1.0);

        var.sqrt() * 100.0
    }
}

impl Strategy for RiskManagedMomentum {
    fn name(&self) -> &'static str {
        "risk_managed_momentum"
    }

    fn evaluate(&self, candles: &[Candle]) -> Signal {
        if candles.len() < self.volatility_lookback + 1 {
            return Signal::hold("insufficient_candles");
        }

        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let last = closes[closes.len() - 1];
        let reference = closes[closes.len() - 1 - self.momentum_lookback];

        let momentum_bps = (last / reference - 1.0) * 1e4;
        let sigma_pct = self.realized_vol_pct(&closes);
        let risk_multiplier = (self.target_volatility_pct / sigma_pct.max(VOL_EPSILON))
            .clamp(self.min_multiplier, self.max_multiplier);

        let metrics = SignalMetrics {
            momentum_bps: Some(momentum_bps),
            realized_vol_pct: Some(sigma_pct),
            risk_multiplier: Some(risk_multiplier),
            ..SignalMetrics::default()
        };

        let (action, reason) = if momentum_bps > self.entry_bps {
            (SignalAction::Buy, "momentum_up")
        } else if momentum_bps < -self.exit_bps {
            (SignalAction::Sell, "momentum_dn")
        } else {
            (SignalAction::Hold, "momentum_flat")
        };

        debug!(
            momentum_bps,
            sigma_pct,
            risk_multiplier,
            action = %action,
            "momentum evaluated"
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

    fn strategy() -> RiskManagedMomentum {
        RiskManagedMomentum::new(4, 8, 12.0, 8.0, 0.6, 0.6, 2.2).unwrap()
    }

    #[test]
    fn validation_requires_vol_exceeding_momentum() {
        assert!(RiskManagedMomentum::new(24, 24, 12.0, 8.0, 0.6, 0.6, 2.2).is_err());
        assert!(RiskManagedMomentum::new(24, 12, 12.0, 8.0, 0.6, 0.6, 2.2).is_err());
        assert!(RiskManagedMomentum::new(24, 72, 12.0, 8.0, 0.6, 0.6, 2.2).is_ok());
    }

    #[test]
    fn too_few_candles_holds() {
        let strat = strategy();
        let signal = strat.evaluate(&flat_candles(100.0, 8));
        assert_eq!(signal.action, SignalAction::Hold);
        assert_eq!(signal.reason, "insufficient_candles");
    }

    #[test]
    fn flat_series_holds_with_max_multiplier() {
        let strat = strategy();
        let signal = strat.evaluate(&flat_candles(100.0, 20));
        assert_eq!(signal.action, SignalAction::Hold);
        // Zero volatility drives the multiplier to its upper clamp.
        assert!((signal.metrics.risk_multiplier.unwrap() - 2.2).abs() < 1e-9);
        assert!(signal.metrics.momentum_bps.unwrap().abs() < 1e-9);
    }

    #[test]
    fn rising_series_buys() {
        let strat = strategy();
        // 1% rise over the last 4 bars: 100 bps > 12 bps entry.
        let closes = [100.0, 100.0, 100.0, 100.0, 100.0, 100.2, 100.4, 100.7, 101.0];
        let signal = strat.evaluate(&candles_from_closes(&closes));
        assert_eq!(signal.action, SignalAction::Buy);
        assert_eq!(signal.reason, "momentum_up");
        assert!(signal.metrics.momentum_bps.unwrap() > 12.0);
    }

    #[test]
    fn falling_series_sells() {
        let strat = strategy();
        let closes = [100.0, 100.0, 100.0, 100.0, 100.0, 99.8, 99.6, 99.3, 99.0];
        let signal = strat.evaluate(&candles_from_closes(&closes));
        assert_eq!(signal.action, SignalAction::Sell);
        assert_eq!(signal.reason, "momentum_dn");
        assert!(signal.metrics.momentum_bps.unwrap() < -8.0);
    }

    #[test]
    fn multiplier_shrinks_in_high_volatility() {
        let strat = strategy();
        // Violent alternation: sigma far above the 0.6% target.
        let closes = [100.0, 104.0, 97.0, 105.0, 96.0, 106.0, 95.0, 107.0, 94.0];
        let signal = strat.evaluate(&candles_from_closes(&closes));
        let mult = signal.metrics.risk_multiplier.unwrap();
        assert!((mult - 0.6).abs() < 1e-9, "expected lower clamp, got {mult}");
        assert!(signal.metrics.realized_vol_pct.unwrap() > 0.6);
    }

    #[test]
    fn multiplier_stays_within_bounds() {
        let strat = strategy();
        for closes in [
            vec![100.0; 20],
            vec![
                100.0, 100.3, 100.1, 100.4, 100.2, 100.5, 100.3, 100.6, 100.4, 100.7,
            ],
        ] {
            let signal = strat.evaluate(&candles_from_closes(&closes));
            let mult = signal.metrics.risk_multiplier.unwrap();
            assert!((0.6..=2.2).contains(&mult), "multiplier {mult} out of bounds");
        }
    }
}
