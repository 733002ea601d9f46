// =============================================================================
// Auto-recovery policy — bounded retries and the automatic kill-switch
// =============================================================================
//
// Repeated retryable placement failures inside a monotonic window trip the
// kill-switch; so does any UNKNOWN_SUBMIT order older than the configured
// maximum age when the retry path next runs.
// =============================================================================

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::warn;

use crate::config::RecoveryConfig;
use crate::store::model::TradingState;
use crate::types::OrderState;

pub struct AutoRecoveryPolicy {
    max_retries: u32,
    failure_window: Duration,
    failure_threshold: u32,
    unknown_submit_max_age_sec: u64,
    recent_failures: Mutex<VecDeque<Instant>>,
}

impl AutoRecoveryPolicy {
    pub fn new(config: &RecoveryConfig, unknown_submit_max_age_sec: u64) -> Self {
        Self {
            max_retries: config.max_retries,
            failure_window: Duration::from_secs(config.failure_window_sec),
            failure_threshold: config.failure_threshold.max(1),
            unknown_submit_max_age_sec,
            recent_failures: Mutex::new(VecDeque::new()),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn unknown_submit_max_age_sec(&self) -> u64 {
        self.unknown_submit_max_age_sec
    }

    /// Record one retryable failure. Returns true when the failure count
    /// inside the window reaches the threshold — the caller must trip the
    /// kill-switch.
    pub fn record_retryable_failure(&self) -> bool {
        self.record_failure_at(Instant::now())
    }

    fn record_failure_at(&self, now: Instant) -> bool {
        let mut failures = self.recent_failures.lock();
        while failures
            .front()
            .is_some_and(|&t| now.duration_since(t) > self.failure_window)
        {
            failures.pop_front();
        }
        failures.push_back(now);
        let tripped = failures.len() as u32 >= self.failure_threshold;
        if tripped {
            warn!(
                failures = failures.len(),
                window_sec = self.failure_window.as_secs(),
                "retryable-failure threshold reached"
            );
        }
        tripped
    }

    pub fn reset(&self) {
        self.recent_failures.lock().clear();
    }

    /// Ids of UNKNOWN_SUBMIT orders older than the maximum age.
    pub fn aged_unknown_submits(&self, state: &TradingState, now: DateTime<Utc>) -> Vec<String> {
        state
            .orders
            .iter()
            .filter(|o| o.state == OrderState::UnknownSubmit)
            .filter(|o| {
                DateTime::parse_from_rfc3339(&o.updated_at)
                    .map(|updated| {
                        let age = now.signed_duration_since(updated.with_timezone(&Utc));
                        age.num_seconds() >= 0
                            && (age.num_seconds() as u64) > self.unknown_submit_max_age_sec
                    })
                    .unwrap_or(false)
            })
            .map(|o| o.id.clone())
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::model::Order;
    use crate::types::{OrderType, Side};

    fn policy(threshold: u32, window_sec: u64) -> AutoRecoveryPolicy {
        AutoRecoveryPolicy::new(
            &RecoveryConfig {
                max_retries: 2,
                failure_window_sec: window_sec,
                failure_threshold: threshold,
            },
            600,
        )
    }

    #[test]
    fn threshold_trips_within_window() {
        let policy = policy(3, 300);
        let t0 = Instant::now();
        assert!(!policy.record_failure_at(t0));
        assert!(!policy.record_failure_at(t0 + Duration::from_secs(10)));
        assert!(policy.record_failure_at(t0 + Duration::from_secs(20)));
    }

    #[test]
    fn old_failures_age_out_of_the_window() {
        let policy = policy(3, 300);
        let t0 = Instant::now();
        assert!(!policy.record_failure_at(t0));
        assert!(!policy.record_failure_at(t0 + Duration::from_secs(10)));
        // The first two fall outside the window by now.
        assert!(!policy.record_failure_at(t0 + Duration::from_secs(400)));
    }

    #[test]
    fn reset_clears_history() {
        let policy = policy(2, 300);
        let t0 = Instant::now();
        assert!(!policy.record_failure_at(t0));
        policy.reset();
        assert!(!policy.record_failure_at(t0 + Duration::from_secs(1)));
    }

    fn unknown_order(id: &str, updated_at: &str) -> Order {
        Order {
            id: id.to_string(),
            client_order_key: format!("key-{id}"),
            exchange_order_id: None,
            symbol: "BTC_KRW".into(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            price: Some(6000.0),
            qty: Some(1.0),
            remaining_qty: 1.0,
            filled_qty: 0.0,
            avg_fill_price: None,
            amount_krw: None,
            paper: false,
            state: OrderState::UnknownSubmit,
            created_at: updated_at.to_string(),
            updated_at: updated_at.to_string(),
            correlation_id: None,
            strategy_run_id: None,
        }
    }

    #[test]
    fn aged_unknown_submits_are_detected() {
        let policy = policy(3, 300);
        let now: DateTime<Utc> = "2026-03-01T12:00:00Z".parse().unwrap();

        let mut state = TradingState::default();
        state.orders.push(unknown_order("fresh", "2026-03-01T11:58:00Z"));
        state.orders.push(unknown_order("aged", "2026-03-01T11:00:00Z"));

        let aged = policy.aged_unknown_submits(&state, now);
        assert_eq!(aged, vec!["aged".to_string()]);
    }
}
