// =============================================================================
// Health check — operator-visible aggregation over the state document
// =============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::store::model::TradingState;
use crate::types::OrderState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Ok,
    Warn,
    Fail,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::Warn => write!(f, "WARN"),
            Self::Fail => write!(f, "FAIL"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckItem {
    pub name: String,
    pub status: HealthStatus,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checks: Vec<HealthCheckItem>,
    pub checked_at: String,
}

/// Aggregate: UNKNOWN_SUBMIT orders (WARN recent, FAIL aged), live open
/// orders missing exchange ids (WARN), kill-switch (FAIL in strict mode).
pub fn check_health(
    state: &TradingState,
    unknown_submit_max_age_sec: u64,
    strict: bool,
    now: DateTime<Utc>,
) -> HealthReport {
    let mut checks = Vec::new();

    // UNKNOWN_SUBMIT orders.
    let unknown: Vec<_> = state
        .orders
        .iter()
        .filter(|o| o.state == OrderState::UnknownSubmit)
        .collect();
    let aged = unknown
        .iter()
        .filter(|o| {
            DateTime::parse_from_rfc3339(&o.updated_at)
                .map(|updated| {
                    let age = now.signed_duration_since(updated.with_timezone(&Utc));
                    age.num_seconds() >= 0
                        && (age.num_seconds() as u64) > unknown_submit_max_age_sec
                })
                .unwrap_or(true)
        })
        .count();
    checks.push(if unknown.is_empty() {
        HealthCheckItem {
            name: "unknown_submit".into(),
            status: HealthStatus::Ok,
            detail: "no parked orders".into(),
        }
    } else if aged > 0 {
        HealthCheckItem {
            name: "unknown_submit".into(),
            status: HealthStatus::Fail,
            detail: format!("{aged} aged of {} parked orders", unknown.len()),
        }
    } else {
        HealthCheckItem {
            name: "unknown_submit".into(),
            status: HealthStatus::Warn,
            detail: format!("{} recent parked orders", unknown.len()),
        }
    });

    // Live open orders with no exchange id.
    let missing_ids = state
        .orders
        .iter()
        .filter(|o| {
            !o.paper
                && o.state.is_open()
                && o.state != OrderState::UnknownSubmit
                && o.exchange_order_id.is_none()
        })
        .count();
    checks.push(HealthCheckItem {
        name: "exchange_ids".into(),
        status: if missing_ids > 0 {
            HealthStatus::Warn
        } else {
            HealthStatus::Ok
        },
        detail: format!("{missing_ids} live open orders missing exchange ids"),
    });

    // Kill switch.
    checks.push(HealthCheckItem {
        name: "kill_switch".into(),
        status: match (state.settings.kill_switch, strict) {
            (true, true) => HealthStatus::Fail,
            (true, false) => HealthStatus::Warn,
            (false, _) => HealthStatus::Ok,
        },
        detail: if state.settings.kill_switch {
            format!(
                "active ({})",
                state.settings.kill_switch_reason.as_deref().unwrap_or("no reason")
            )
        } else {
            "inactive".into()
        },
    });

    let status = checks
        .iter()
        .map(|c| c.status)
        .max()
        .unwrap_or(HealthStatus::Ok);

    HealthReport {
        status,
        checks,
        checked_at: now.to_rfc3339(),
    }
}
