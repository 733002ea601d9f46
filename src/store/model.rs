// =============================================================================
// Durable state document — orders, fills, events, balances, settings
// =============================================================================
//
// This is the single JSON document the state store owns on disk. Field names
// are camelCase on disk so external read-only tools (audit reports) can
// consume the file directly.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::{OrderState, OrderType, Side};

/// One tracked order. Once the state is terminal, price/qty never mutate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    /// Stable local id (UUID v4).
    pub id: String,
    /// Idempotency key, unique per (strategyRunId, symbol, side) unless the
    /// caller supplied one.
    pub client_order_key: String,
    /// Exchange-assigned id; null until the placement is accepted.
    #[serde(default)]
    pub exchange_order_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub qty: Option<f64>,
    #[serde(default)]
    pub remaining_qty: f64,
    #[serde(default)]
    pub filled_qty: f64,
    #[serde(default)]
    pub avg_fill_price: Option<f64>,
    /// Quote-currency amount for market buys.
    #[serde(default)]
    pub amount_krw: Option<f64>,
    /// Immutable after creation.
    #[serde(default)]
    pub paper: bool,
    pub state: OrderState,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub strategy_run_id: Option<String>,
}

impl Order {
    /// Notional in quote currency: `price * qty` when both are known,
    /// otherwise the explicit quote amount.
    pub fn notional_krw(&self) -> f64 {
        match (self.price, self.qty) {
            (Some(p), Some(q)) => p * q,
            _ => self.amount_krw.unwrap_or(0.0),
        }
    }

    /// Quote value still outstanding on an open order.
    pub fn remaining_notional_krw(&self) -> f64 {
        match self.price {
            Some(p) => p * self.remaining_qty,
            None => self.amount_krw.unwrap_or(0.0),
        }
    }
}

/// One execution against an order. `exchange_fill_id` is unique across all
/// fills and is the idempotency key for `apply_fill`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fill {
    pub id: String,
    pub order_id: String,
    pub exchange_fill_id: String,
    pub price: f64,
    pub qty: f64,
    #[serde(default)]
    pub fee: f64,
    pub fill_ts: String,
}

/// Append-only audit record of an order lifecycle step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderEventType {
    New,
    Accepted,
    Partial,
    Filled,
    Canceled,
    Rejected,
    Expired,
    UnknownSubmit,
    ExchangeIdResolved,
    Fill,
}

impl std::fmt::Display for OrderEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "NEW",
            Self::Accepted => "ACCEPTED",
            Self::Partial => "PARTIAL",
            Self::Filled => "FILLED",
            Self::Canceled => "CANCELED",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
            Self::UnknownSubmit => "UNKNOWN_SUBMIT",
            Self::ExchangeIdResolved => "EXCHANGE_ID_RESOLVED",
            Self::Fill => "FILL",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderEvent {
    pub id: String,
    pub order_id: String,
    pub event_type: OrderEventType,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub event_ts: String,
}

/// One currency line inside a balances snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceItem {
    pub currency: String,
    pub unit_currency: String,
    #[serde(default)]
    pub balance: f64,
    #[serde(default)]
    pub locked: f64,
    #[serde(default)]
    pub avg_buy_price: f64,
}

/// Account snapshot; the latest one is authoritative for exposure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalancesSnapshot {
    pub captured_at: String,
    pub source: String,
    pub items: Vec<BalanceItem>,
}

/// Record of a risk-gate rejection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskEvent {
    pub id: String,
    pub severity: String,
    /// Concatenated violated rule names.
    pub rules: String,
    #[serde(default)]
    pub detail: serde_json::Value,
    pub created_at: String,
}

/// Aggregated counters for one realtime strategy run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyRun {
    pub id: String,
    pub symbol: String,
    pub strategy: String,
    pub started_at: String,
    #[serde(default)]
    pub finished_at: Option<String>,
    #[serde(default)]
    pub ticks: u64,
    #[serde(default)]
    pub buy_signals: u64,
    #[serde(default)]
    pub sell_signals: u64,
    #[serde(default)]
    pub orders_attempted: u64,
    #[serde(default)]
    pub orders_placed: u64,
    #[serde(default)]
    pub code: i32,
}

/// One health-check outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemHealthRecord {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub checks: serde_json::Value,
    pub created_at: String,
}

/// One applied AI-settings change (group-level).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentAuditRecord {
    pub id: String,
    pub group: String,
    #[serde(default)]
    pub old_hash: Option<String>,
    pub new_hash: String,
    pub source: String,
    pub created_at: String,
}

/// Daily-PnL baseline captured at the first window of a (KST) day.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyPnlBaseline {
    pub date: String,
    pub equity_krw: f64,
}

/// Engine-owned settings persisted with the state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default = "default_paper_mode")]
    pub paper_mode: bool,
    #[serde(default)]
    pub kill_switch: bool,
    #[serde(default)]
    pub kill_switch_reason: Option<String>,
    #[serde(default)]
    pub daily_pnl_baseline: Option<DailyPnlBaseline>,
}

fn default_paper_mode() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            paper_mode: true,
            kill_switch: false,
            kill_switch_reason: None,
            daily_pnl_baseline: None,
        }
    }
}

/// The single document the state store owns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradingState {
    #[serde(default)]
    pub orders: Vec<Order>,
    #[serde(default)]
    pub order_events: Vec<OrderEvent>,
    #[serde(default)]
    pub fills: Vec<Fill>,
    #[serde(default, rename = "balancesSnapshot")]
    pub balances_snapshots: Vec<BalancesSnapshot>,
    #[serde(default)]
    pub strategy_runs: Vec<StrategyRun>,
    #[serde(default)]
    pub risk_events: Vec<RiskEvent>,
    #[serde(default)]
    pub system_health: Vec<SystemHealthRecord>,
    #[serde(default)]
    pub agent_audit: Vec<AgentAuditRecord>,
    #[serde(default)]
    pub settings: Settings,
}

impl TradingState {
    pub fn find_order(&self, id: &str) -> Option<&Order> {
        self.orders.iter().find(|o| o.id == id)
    }

    pub fn find_order_mut(&mut self, id: &str) -> Option<&mut Order> {
        self.orders.iter_mut().find(|o| o.id == id)
    }

    pub fn find_order_by_key(&self, key: &str) -> Option<&Order> {
        self.orders.iter().find(|o| o.client_order_key == key)
    }

    pub fn open_orders(&self) -> Vec<&Order> {
        self.orders.iter().filter(|o| o.state.is_open()).collect()
    }

    /// Latest balances snapshot (authoritative for exposure), if any.
    pub fn latest_balances(&self) -> Option<&BalancesSnapshot> {
        self.balances_snapshots.last()
    }

    pub fn fills_for_order(&self, order_id: &str) -> Vec<&Fill> {
        self.fills.iter().filter(|f| f.order_id == order_id).collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_deserializes_with_defaults() {
        let state: TradingState = serde_json::from_str("{}").unwrap();
        assert!(state.orders.is_empty());
        assert!(state.settings.paper_mode);
        assert!(!state.settings.kill_switch);
    }

    #[test]
    fn state_file_uses_contract_field_names() {
        let state = TradingState::default();
        let json = serde_json::to_value(&state).unwrap();
        for key in [
            "orders",
            "orderEvents",
            "fills",
            "balancesSnapshot",
            "strategyRuns",
            "riskEvents",
            "systemHealth",
            "agentAudit",
            "settings",
        ] {
            assert!(json.get(key).is_some(), "missing key {key}");
        }
    }

    #[test]
    fn notional_uses_price_qty_then_amount() {
        let mut order = Order {
            id: "o1".into(),
            client_order_key: "k1".into(),
            exchange_order_id: None,
            symbol: "BTC_KRW".into(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            price: Some(6000.0),
            qty: Some(2.0),
            remaining_qty: 2.0,
            filled_qty: 0.0,
            avg_fill_price: None,
            amount_krw: None,
            paper: true,
            state: OrderState::New,
            created_at: "2026-01-01T00:00:00Z".into(),
            updated_at: "2026-01-01T00:00:00Z".into(),
            correlation_id: None,
            strategy_run_id: None,
        };
        assert!((order.notional_krw() - 12_000.0).abs() < f64::EPSILON);

        order.price = None;
        order.qty = None;
        order.amount_krw = Some(9_000.0);
        assert!((order.notional_krw() - 9_000.0).abs() < f64::EPSILON);
    }
}
