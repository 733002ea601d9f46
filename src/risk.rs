// =============================================================================
// Risk engine — deterministic pre-trade gate
// =============================================================================
//
// Pure function of (order input, evaluation context, state snapshot). Every
// violated rule is reported — no short-circuit — so operators always see the
// full reason vector. `allowed == reasons.is_empty()`.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::config::RiskLimits;
use crate::orders::OrderInput;
use crate::store::model::TradingState;
use crate::types::Side;

pub const RULE_MAX_CONCURRENT_ORDERS: &str = "MAX_CONCURRENT_ORDERS";
pub const RULE_MIN_ORDER_NOTIONAL_KRW: &str = "MIN_ORDER_NOTIONAL_KRW";
pub const RULE_MAX_ORDER_NOTIONAL_KRW: &str = "MAX_ORDER_NOTIONAL_KRW";
pub const RULE_DAILY_LOSS_LIMIT_KRW: &str = "DAILY_LOSS_LIMIT_KRW";
pub const RULE_AI_MAX_ORDER_NOTIONAL_KRW: &str = "AI_MAX_ORDER_NOTIONAL_KRW";
pub const RULE_AI_MAX_ORDERS_PER_WINDOW: &str = "AI_MAX_ORDERS_PER_WINDOW";
pub const RULE_AI_MAX_TOTAL_EXPOSURE_KRW: &str = "AI_MAX_TOTAL_EXPOSURE_KRW";
pub const RULE_KILL_SWITCH_ACTIVE: &str = "KILL_SWITCH_ACTIVE";

/// Evaluation context supplied by the caller.
#[derive(Debug, Clone)]
pub struct RiskContext {
    /// True when the order originates from AI-steered execution; enables the
    /// AI hard caps.
    pub ai_selected: bool,
    /// Realized PnL for the current (KST) day, when a baseline exists.
    pub daily_realized_pnl_krw: Option<f64>,
    /// Context-driven minimum notional; can only raise the configured floor.
    pub dynamic_min_notional_krw: Option<f64>,
    pub now: DateTime<Utc>,
}

impl RiskContext {
    pub fn plain(now: DateTime<Utc>) -> Self {
        Self {
            ai_selected: false,
            daily_realized_pnl_krw: None,
            dynamic_min_notional_krw: None,
            now,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskMetrics {
    pub notional_krw: f64,
    pub open_orders: usize,
    pub orders_in_ai_window: usize,
    pub holdings_exposure_krw: f64,
    pub open_buy_notional_krw: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskDecision {
    pub allowed: bool,
    pub reasons: Vec<String>,
    pub metrics: RiskMetrics,
    pub checked_at: String,
}

/// Run every rule and collect the violations.
pub fn evaluate(
    limits: &RiskLimits,
    input: &OrderInput,
    ctx: &RiskContext,
    state: &TradingState,
) -> RiskDecision {
    let mut reasons: Vec<String> = Vec::new();

    let notional = input.notional_krw();
    let open_orders = state.orders.iter().filter(|o| o.state.is_open()).count();

    // 1. Concurrent open orders.
    if open_orders >= limits.max_concurrent_orders {
        reasons.push(RULE_MAX_CONCURRENT_ORDERS.to_string());
    }

    // 2. Minimum notional: the symbol override replaces the base floor, and
    //    the dynamic context minimum can only raise the applied value.
    let base_min = limits
        .symbol_min_notional_krw
        .get(input.symbol.as_str())
        .copied()
        .unwrap_or(limits.min_order_notional_krw);
    let applied_min = base_min.max(ctx.dynamic_min_notional_krw.unwrap_or(0.0));
    if notional < applied_min {
        reasons.push(RULE_MIN_ORDER_NOTIONAL_KRW.to_string());
    }

    // 3. Maximum notional.
    if notional > limits.max_order_notional_krw {
        reasons.push(RULE_MAX_ORDER_NOTIONAL_KRW.to_string());
    }

    // 4. Daily loss limit.
    if let Some(pnl) = ctx.daily_realized_pnl_krw {
        if pnl < 0.0 && pnl <= -limits.daily_loss_limit_krw {
            reasons.push(RULE_DAILY_LOSS_LIMIT_KRW.to_string());
        }
    }

    // 5. AI hard caps.
    let orders_in_ai_window = orders_within_window(state, ctx.now, limits.ai_order_count_window_sec);
    let holdings_exposure = holdings_exposure_krw(state);
    let open_buy_notional = open_buy_notional_krw(state);

    if ctx.ai_selected {
        if notional > limits.ai_max_order_notional_krw {
            reasons.push(RULE_AI_MAX_ORDER_NOTIONAL_KRW.to_string());
        }
        // Counts all orders regardless of symbol or side, plus this one.
        if orders_in_ai_window + 1 > limits.ai_max_orders_per_window {
            reasons.push(RULE_AI_MAX_ORDERS_PER_WINDOW.to_string());
        }
        let this_order = if input.side == Side::Buy { notional } else { 0.0 };
        if holdings_exposure + open_buy_notional + this_order > limits.ai_max_total_exposure_krw {
            reasons.push(RULE_AI_MAX_TOTAL_EXPOSURE_KRW.to_string());
        }
    }

    // 6. Kill switch.
    if state.settings.kill_switch {
        reasons.push(RULE_KILL_SWITCH_ACTIVE.to_string());
    }

    let decision = RiskDecision {
        allowed: reasons.is_empty(),
        reasons,
        metrics: RiskMetrics {
            notional_krw: notional,
            open_orders,
            orders_in_ai_window,
            holdings_exposure_krw: holdings_exposure,
            open_buy_notional_krw: open_buy_notional,
        },
        checked_at: ctx.now.to_rfc3339(),
    };

    if !decision.allowed {
        debug!(
            symbol = %input.symbol,
            side = %input.side,
            reasons = %decision.reasons.join(","),
            "risk gate rejected order"
        );
    }
    decision
}

/// Orders created within the trailing window, any symbol, any side.
fn orders_within_window(state: &TradingState, now: DateTime<Utc>, window_sec: u64) -> usize {
    state
        .orders
        .iter()
        .filter(|o| {
            DateTime::parse_from_rfc3339(&o.created_at)
                .map(|created| {
                    let age = now.signed_duration_since(created.with_timezone(&Utc));
                    age.num_seconds() >= 0 && (age.num_seconds() as u64) <= window_sec
                })
                .unwrap_or(false)
        })
        .count()
}

/// Current holdings exposure: KRW-denominated non-KRW currencies with a
/// positive average buy price, from the latest balances snapshot.
fn holdings_exposure_krw(state: &TradingState) -> f64 {
    let Some(snapshot) = state.latest_balances() else {
        return 0.0;
    };
    snapshot
        .items
        .iter()
        .filter(|item| {
            item.unit_currency == "KRW" && item.currency != "KRW" && item.avg_buy_price > 0.0
        })
        .map(|item| (item.balance + item.locked).max(0.0) * item.avg_buy_price)
        .sum()
}

/// Remaining quote value of open buy orders.
fn open_buy_notional_krw(state: &TradingState) -> f64 {
    state
        .orders
        .iter()
        .filter(|o| o.state.is_open() && o.side == Side::Buy)
        .map(|o| o.remaining_notional_krw())
        .sum()
}
