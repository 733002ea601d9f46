// =============================================================================
// Order manager — idempotent placement, cancel, fills, UNKNOWN_SUBMIT parking
// =============================================================================
//
// Placement is idempotent by client-order-key: under the state lock, an
// existing order with the same key is returned as-is, which also makes
// crash-retries bypass the risk gate. A placement that raises before a
// response parks the order in UNKNOWN_SUBMIT for later resolution.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::RiskLimits;
use crate::risk::{self, RiskContext, RiskDecision};
use crate::store::model::{Fill, Order, OrderEvent, OrderEventType, RiskEvent};
use crate::store::StateStore;
use crate::symbol::Symbol;
use crate::types::{ExitCode, OpResult, OrderState, OrderType, Side};
use crate::upbit::client::{PlaceOrderRequest, UpbitClient};
use crate::upbit::error::ExchangeError;

/// Exchange capability the manager consumes; tests inject a mock.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn place_order(
        &self,
        request: &PlaceOrderRequest,
    ) -> Result<serde_json::Value, ExchangeError>;

    async fn cancel_order(
        &self,
        exchange_order_id: &str,
    ) -> Result<serde_json::Value, ExchangeError>;

    /// Look an order up by client-order-key (with an optional market hint) —
    /// used to resolve UNKNOWN_SUBMIT and missing exchange ids.
    async fn get_order_status(
        &self,
        client_order_key: &str,
        symbol_hint: Option<&Symbol>,
    ) -> Result<serde_json::Value, ExchangeError>;
}

#[async_trait]
impl OrderGateway for UpbitClient {
    async fn place_order(
        &self,
        request: &PlaceOrderRequest,
    ) -> Result<serde_json::Value, ExchangeError> {
        UpbitClient::place_order(self, request).await
    }

    async fn cancel_order(
        &self,
        exchange_order_id: &str,
    ) -> Result<serde_json::Value, ExchangeError> {
        UpbitClient::cancel_order(self, exchange_order_id).await
    }

    async fn get_order_status(
        &self,
        client_order_key: &str,
        _symbol_hint: Option<&Symbol>,
    ) -> Result<serde_json::Value, ExchangeError> {
        self.get_order_by_identifier(client_order_key).await
    }
}

/// Caller-supplied order intent.
#[derive(Debug, Clone)]
pub struct OrderInput {
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Option<f64>,
    pub qty: Option<f64>,
    pub amount_krw: Option<f64>,
    pub client_order_key: Option<String>,
    pub correlation_id: Option<String>,
    pub strategy_run_id: Option<String>,
}

impl OrderInput {
    /// Quote-currency notional (`price * qty`, or the explicit amount).
    pub fn notional_krw(&self) -> f64 {
        match (self.price, self.qty) {
            (Some(p), Some(q)) => p * q,
            _ => self.amount_krw.unwrap_or(0.0),
        }
    }

    /// Deterministic idempotency key when the caller supplies none.
    fn derived_key(&self) -> String {
        let run = self.strategy_run_id.as_deref().unwrap_or("adhoc");
        format!("{}-{}-{}", run, self.symbol.as_str(), self.side)
    }

    fn validate(&self) -> Result<(), String> {
        match (self.order_type, self.side) {
            (OrderType::Limit, _) => {
                if self.price.is_none() || self.qty.is_none() {
                    return Err("limit order requires price and qty".to_string());
                }
            }
            (OrderType::Market, Side::Buy) => {
                if self.amount_krw.is_none() {
                    return Err("market buy requires amount_krw".to_string());
                }
            }
            (OrderType::Market, Side::Sell) => {
                if self.qty.is_none() {
                    return Err("market sell requires qty".to_string());
                }
            }
        }
        if self.price.is_some_and(|p| p <= 0.0)
            || self.qty.is_some_and(|q| q <= 0.0)
            || self.amount_krw.is_some_and(|a| a <= 0.0)
        {
            return Err("price/qty/amount must be positive".to_string());
        }
        Ok(())
    }
}

/// Execution context for one placement.
#[derive(Debug, Clone)]
pub struct PlaceContext {
    pub paper: bool,
    pub risk: RiskContext,
}

/// Placement result payload.
#[derive(Debug, Clone)]
pub struct PlaceOutcome {
    pub order: Option<Order>,
    pub idempotent_hit: bool,
    pub risk: Option<RiskDecision>,
}

/// Fill application input; `exchange_fill_id` is the idempotency key.
#[derive(Debug, Clone)]
pub struct FillInput {
    pub order_id: String,
    pub exchange_fill_id: String,
    pub price: f64,
    pub qty: f64,
    pub fee: f64,
}

pub struct OrderManager {
    store: Arc<StateStore>,
    gateway: Arc<dyn OrderGateway>,
    limits: RiskLimits,
}

impl OrderManager {
    pub fn new(store: Arc<StateStore>, gateway: Arc<dyn OrderGateway>, limits: RiskLimits) -> Self {
        Self {
            store,
            gateway,
            limits,
        }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    // -------------------------------------------------------------------------
    // Placement
    // -------------------------------------------------------------------------

    pub async fn place_order(
        &self,
        input: OrderInput,
        ctx: PlaceContext,
    ) -> OpResult<PlaceOutcome> {
        if let Err(msg) = input.validate() {
            return OpResult::fail(ExitCode::InvalidArgs, msg);
        }

        let key = input
            .client_order_key
            .clone()
            .unwrap_or_else(|| input.derived_key());

        // Step 2: idempotency check, risk gate, and NEW insert happen under a
        // single state update so a concurrent retry cannot double-insert.
        let mut existing: Option<Order> = None;
        let mut rejected: Option<RiskDecision> = None;
        let mut created: Option<Order> = None;
        let limits = self.limits.clone();
        let risk_ctx = ctx.risk.clone();
        let input_for_apply = input.clone();
        let key_for_apply = key.clone();
        let paper = ctx.paper;

        let update = self.store.update(|state| {
            if let Some(order) = state.find_order_by_key(&key_for_apply) {
                existing = Some(order.clone());
                return;
            }

            let decision = risk::evaluate(&limits, &input_for_apply, &risk_ctx, state);
            if !decision.allowed {
                state.risk_events.push(RiskEvent {
                    id: Uuid::new_v4().to_string(),
                    severity: "HIGH".to_string(),
                    rules: decision.reasons.join(","),
                    detail: serde_json::json!({
                        "symbol": input_for_apply.symbol.as_str(),
                        "side": input_for_apply.side.to_string(),
                        "notionalKrw": decision.metrics.notional_krw,
                        "reasons": decision.reasons,
                        "metrics": decision.metrics,
                    }),
                    created_at: now_rfc3339(),
                });
                rejected = Some(decision);
                return;
            }

            let now = now_rfc3339();
            let order = Order {
                id: Uuid::new_v4().to_string(),
                client_order_key: key_for_apply.clone(),
                exchange_order_id: None,
                symbol: input_for_apply.symbol.as_str().to_string(),
                side: input_for_apply.side,
                order_type: input_for_apply.order_type,
                price: input_for_apply.price,
                qty: input_for_apply.qty,
                remaining_qty: input_for_apply.qty.unwrap_or(0.0),
                filled_qty: 0.0,
                avg_fill_price: None,
                amount_krw: input_for_apply.amount_krw,
                paper,
                state: OrderState::New,
                created_at: now.clone(),
                updated_at: now.clone(),
                correlation_id: input_for_apply.correlation_id.clone(),
                strategy_run_id: input_for_apply.strategy_run_id.clone(),
            };
            state.order_events.push(make_event(
                &order.id,
                OrderEventType::New,
                serde_json::json!({
                    "clientOrderKey": order.client_order_key,
                    "symbol": order.symbol,
                    "side": order.side,
                    "type": order.order_type,
                    "paper": paper,
                }),
            ));
            state.orders.push(order.clone());
            created = Some(order);
        });

        if let Err(e) = update {
            return OpResult::fail(ExitCode::InternalError, e.to_string());
        }

        if let Some(order) = existing {
            info!(order_id = %order.id, key = %key, "idempotent placement hit");
            return OpResult::ok(PlaceOutcome {
                order: Some(order),
                idempotent_hit: true,
                risk: None,
            });
        }

        if let Some(decision) = rejected {
            return OpResult::fail_with(
                ExitCode::RiskRejected,
                decision.reasons.join(","),
                PlaceOutcome {
                    order: None,
                    idempotent_hit: false,
                    risk: Some(decision),
                },
            );
        }

        let order = match created {
            Some(o) => o,
            None => {
                return OpResult::fail(
                    ExitCode::InternalError,
                    "placement produced no order".to_string(),
                )
            }
        };

        if ctx.paper {
            return self.accept_order(&order.id, serde_json::json!({ "paper": true }));
        }

        self.place_live(order, input, key).await
    }

    async fn place_live(
        &self,
        order: Order,
        input: OrderInput,
        key: String,
    ) -> OpResult<PlaceOutcome> {
        let request = PlaceOrderRequest {
            symbol: input.symbol.clone(),
            side: input.side,
            order_type: input.order_type,
            price: input.price,
            qty: input.qty,
            amount_krw: input.amount_krw,
            client_order_key: Some(key),
        };

        match self.gateway.place_order(&request).await {
            Ok(response) => {
                let exchange_id = extract_exchange_order_id(&response);
                let order_id = order.id.clone();
                let update = self.store.update(|state| {
                    if let Some(o) = state.find_order_mut(&order_id) {
                        o.exchange_order_id = exchange_id.clone();
                        o.state = OrderState::Accepted;
                        o.updated_at = now_rfc3339();
                    }
                    state
                        .order_events
                        .push(make_event(&order_id, OrderEventType::Accepted, response.clone()));
                });
                if let Err(e) = update {
                    return OpResult::fail(ExitCode::InternalError, e.to_string());
                }
                match self.store.find_order_by_id(&order_id) {
                    Ok(Some(updated)) => OpResult::ok(PlaceOutcome {
                        order: Some(updated),
                        idempotent_hit: false,
                        risk: None,
                    }),
                    _ => OpResult::fail(ExitCode::InternalError, "order vanished after accept"),
                }
            }
            Err(e) => {
                warn!(order_id = %order.id, error = %e, "placement raised — parking UNKNOWN_SUBMIT");
                let order_id = order.id.clone();
                let message = e.to_string();
                let update = self.store.update(|state| {
                    if let Some(o) = state.find_order_mut(&order_id) {
                        o.state = OrderState::UnknownSubmit;
                        o.updated_at = now_rfc3339();
                    }
                    state.order_events.push(make_event(
                        &order_id,
                        OrderEventType::UnknownSubmit,
                        serde_json::json!({ "error": message }),
                    ));
                });
                if let Err(store_err) = update {
                    return OpResult::fail(ExitCode::InternalError, store_err.to_string());
                }

                let code = if e.is_rate_limited() {
                    ExitCode::RateLimited
                } else if e.is_retryable() {
                    ExitCode::ExchangeRetryable
                } else {
                    ExitCode::ExchangeFatal
                };
                let parked = self.store.find_order_by_id(&order_id).ok().flatten();
                OpResult::fail_with(
                    code,
                    e.to_string(),
                    PlaceOutcome {
                        order: parked,
                        idempotent_hit: false,
                        risk: None,
                    },
                )
            }
        }
    }

    fn accept_order(&self, order_id: &str, payload: serde_json::Value) -> OpResult<PlaceOutcome> {
        let id = order_id.to_string();
        let update = self.store.update(|state| {
            if let Some(o) = state.find_order_mut(&id) {
                o.state = OrderState::Accepted;
                o.updated_at = now_rfc3339();
            }
            state
                .order_events
                .push(make_event(&id, OrderEventType::Accepted, payload.clone()));
        });
        if let Err(e) = update {
            return OpResult::fail(ExitCode::InternalError, e.to_string());
        }
        match self.store.find_order_by_id(&id) {
            Ok(Some(order)) => OpResult::ok(PlaceOutcome {
                order: Some(order),
                idempotent_hit: false,
                risk: None,
            }),
            _ => OpResult::fail(ExitCode::InternalError, "order vanished after accept"),
        }
    }

    // -------------------------------------------------------------------------
    // Cancel
    // -------------------------------------------------------------------------

    pub async fn cancel_order(&self, order_id: &str) -> OpResult<Order> {
        let order = match self.store.find_order_by_id(order_id) {
            Ok(Some(o)) => o,
            Ok(None) => {
                return OpResult::fail(ExitCode::InvalidArgs, format!("unknown order {order_id}"))
            }
            Err(e) => return OpResult::fail(ExitCode::InternalError, e.to_string()),
        };

        if order.state.is_terminal() {
            return OpResult::ok(order);
        }

        if order.paper {
            return self.finish_cancel(order_id, serde_json::json!({ "paper": true }));
        }

        // Resolve a missing exchange id before sending the cancel.
        let exchange_id = match &order.exchange_order_id {
            Some(id) => id.clone(),
            None => {
                let symbol = Symbol::normalize(&order.symbol).ok();
                match self
                    .gateway
                    .get_order_status(&order.client_order_key, symbol.as_ref())
                    .await
                {
                    Ok(response) => match extract_exchange_order_id(&response) {
                        Some(id) => {
                            let oid = order_id.to_string();
                            let resolved = id.clone();
                            let update = self.store.update(|state| {
                                if let Some(o) = state.find_order_mut(&oid) {
                                    o.exchange_order_id = Some(resolved.clone());
                                    o.updated_at = now_rfc3339();
                                }
                                state.order_events.push(make_event(
                                    &oid,
                                    OrderEventType::ExchangeIdResolved,
                                    response.clone(),
                                ));
                            });
                            if let Err(e) = update {
                                return OpResult::fail(ExitCode::InternalError, e.to_string());
                            }
                            id
                        }
                        None => {
                            return OpResult::fail(
                                ExitCode::ReconcileMismatch,
                                format!(
                                    "order {order_id} not resolvable by key {}",
                                    order.client_order_key
                                ),
                            )
                        }
                    },
                    Err(e) => return OpResult::fail(e.exit_code(), e.to_string()),
                }
            }
        };

        let oid = order_id.to_string();
        let mark = self.store.update(|state| {
            if let Some(o) = state.find_order_mut(&oid) {
                if !o.state.is_terminal() {
                    o.state = OrderState::CancelRequested;
                    o.updated_at = now_rfc3339();
                }
            }
        });
        if let Err(e) = mark {
            return OpResult::fail(ExitCode::InternalError, e.to_string());
        }

        match self.gateway.cancel_order(&exchange_id).await {
            Ok(response) => self.finish_cancel(order_id, response),
            Err(e) => OpResult::fail(e.exit_code(), e.to_string()),
        }
    }

    fn finish_cancel(&self, order_id: &str, payload: serde_json::Value) -> OpResult<Order> {
        let id = order_id.to_string();
        let update = self.store.update(|state| {
            if let Some(o) = state.find_order_mut(&id) {
                o.state = OrderState::Canceled;
                o.updated_at = now_rfc3339();
            }
            state
                .order_events
                .push(make_event(&id, OrderEventType::Canceled, payload.clone()));
        });
        if let Err(e) = update {
            return OpResult::fail(ExitCode::InternalError, e.to_string());
        }
        match self.store.find_order_by_id(&id) {
            Ok(Some(order)) => {
                info!(order_id = %id, "order canceled");
                OpResult::ok(order)
            }
            _ => OpResult::fail(ExitCode::InternalError, "order vanished after cancel"),
        }
    }

    // -------------------------------------------------------------------------
    // Fills
    // -------------------------------------------------------------------------

    /// Apply one fill. Duplicate `exchange_fill_id` values are no-ops.
    pub fn apply_fill(&self, fill: FillInput) -> OpResult<Order> {
        let mut missing = false;
        let mut terminal = false;
        let fill_clone = fill.clone();

        let update = self.store.update(|state| {
            if state
                .fills
                .iter()
                .any(|f| f.exchange_fill_id == fill_clone.exchange_fill_id)
            {
                // Idempotent replay.
                return;
            }

            let Some(order) = state.find_order_mut(&fill_clone.order_id) else {
                missing = true;
                return;
            };
            if order.state.is_terminal() {
                terminal = true;
                return;
            }

            order.filled_qty += fill_clone.qty;
            if let Some(total) = order.qty {
                order.remaining_qty = (total - order.filled_qty).max(0.0);
            } else {
                order.remaining_qty = 0.0;
            }
            order.updated_at = now_rfc3339();

            let order_id = order.id.clone();
            let qty_known = order.qty;
            let remaining = order.remaining_qty;

            state.fills.push(Fill {
                id: Uuid::new_v4().to_string(),
                order_id: order_id.clone(),
                exchange_fill_id: fill_clone.exchange_fill_id.clone(),
                price: fill_clone.price,
                qty: fill_clone.qty,
                fee: fill_clone.fee,
                fill_ts: now_rfc3339(),
            });

            // Weighted-average fill price over every fill of this order.
            let (sum_notional, sum_qty) = state
                .fills
                .iter()
                .filter(|f| f.order_id == order_id)
                .fold((0.0, 0.0), |(n, q), f| (n + f.price * f.qty, q + f.qty));

            let new_state = match qty_known {
                Some(_) if remaining > 1e-12 => OrderState::Partial,
                Some(_) => OrderState::Filled,
                None => OrderState::Partial,
            };

            if let Some(order) = state.find_order_mut(&fill_clone.order_id) {
                if sum_qty > 0.0 {
                    order.avg_fill_price = Some(sum_notional / sum_qty);
                }
                order.state = new_state;
            }

            state.order_events.push(make_event(
                &fill_clone.order_id,
                OrderEventType::Fill,
                serde_json::json!({
                    "exchangeFillId": fill_clone.exchange_fill_id,
                    "price": fill_clone.price,
                    "qty": fill_clone.qty,
                    "fee": fill_clone.fee,
                }),
            ));
        });

        if let Err(e) = update {
            return OpResult::fail(ExitCode::InternalError, e.to_string());
        }
        if missing {
            return OpResult::fail(
                ExitCode::InvalidArgs,
                format!("unknown order {}", fill.order_id),
            );
        }
        if terminal {
            return OpResult::fail(
                ExitCode::InvalidArgs,
                format!("order {} is terminal", fill.order_id),
            );
        }
        match self.store.find_order_by_id(&fill.order_id) {
            Ok(Some(order)) => OpResult::ok(order),
            _ => OpResult::fail(ExitCode::InternalError, "order vanished after fill"),
        }
    }

    // -------------------------------------------------------------------------
    // UNKNOWN_SUBMIT resolution
    // -------------------------------------------------------------------------

    /// Reconcile a parked order against the exchange by client-order-key.
    pub async fn resolve_unknown(&self, order_id: &str) -> OpResult<Order> {
        let order = match self.store.find_order_by_id(order_id) {
            Ok(Some(o)) => o,
            Ok(None) => {
                return OpResult::fail(ExitCode::InvalidArgs, format!("unknown order {order_id}"))
            }
            Err(e) => return OpResult::fail(ExitCode::InternalError, e.to_string()),
        };
        if order.state != OrderState::UnknownSubmit {
            return OpResult::fail(
                ExitCode::InvalidArgs,
                format!("order {order_id} is not UNKNOWN_SUBMIT"),
            );
        }

        let symbol = Symbol::normalize(&order.symbol).ok();
        match self
            .gateway
            .get_order_status(&order.client_order_key, symbol.as_ref())
            .await
        {
            Ok(response) => match extract_exchange_order_id(&response) {
                Some(exchange_id) => {
                    let oid = order_id.to_string();
                    let update = self.store.update(|state| {
                        if let Some(o) = state.find_order_mut(&oid) {
                            o.exchange_order_id = Some(exchange_id.clone());
                            o.state = OrderState::Accepted;
                            o.updated_at = now_rfc3339();
                        }
                        state.order_events.push(make_event(
                            &oid,
                            OrderEventType::ExchangeIdResolved,
                            response.clone(),
                        ));
                    });
                    if let Err(e) = update {
                        return OpResult::fail(ExitCode::InternalError, e.to_string());
                    }
                    match self.store.find_order_by_id(&oid) {
                        Ok(Some(o)) => OpResult::ok(o),
                        _ => OpResult::fail(ExitCode::InternalError, "order vanished"),
                    }
                }
                None => OpResult::fail(
                    ExitCode::ReconcileMismatch,
                    format!("no exchange order found for key {}", order.client_order_key),
                ),
            },
            Err(e) => OpResult::fail(e.exit_code(), e.to_string()),
        }
    }

    /// Mark a parked order rejected (operator action).
    pub fn mark_rejected(&self, order_id: &str, reason: &str) -> OpResult<Order> {
        self.close_parked(order_id, OrderState::Rejected, OrderEventType::Rejected, reason)
    }

    /// Force-close a parked order (operator action).
    pub fn force_close(&self, order_id: &str, reason: &str) -> OpResult<Order> {
        self.close_parked(order_id, OrderState::Canceled, OrderEventType::Canceled, reason)
    }

    fn close_parked(
        &self,
        order_id: &str,
        target: OrderState,
        event_type: OrderEventType,
        reason: &str,
    ) -> OpResult<Order> {
        let mut eligible = false;
        let id = order_id.to_string();
        let reason = reason.to_string();
        let update = self.store.update(|state| {
            if let Some(o) = state.find_order_mut(&id) {
                if o.state == OrderState::UnknownSubmit {
                    o.state = target;
                    o.updated_at = now_rfc3339();
                    eligible = true;
                }
            }
            if eligible {
                state.order_events.push(make_event(
                    &id,
                    event_type,
                    serde_json::json!({ "reason": reason }),
                ));
            }
        });
        if let Err(e) = update {
            return OpResult::fail(ExitCode::InternalError, e.to_string());
        }
        if !eligible {
            return OpResult::fail(
                ExitCode::InvalidArgs,
                format!("order {order_id} is not UNKNOWN_SUBMIT"),
            );
        }
        match self.store.find_order_by_id(order_id) {
            Ok(Some(order)) => OpResult::ok(order),
            _ => OpResult::fail(ExitCode::InternalError, "order vanished"),
        }
    }
}

// -----------------------------------------------------------------------------
// Helpers
// -----------------------------------------------------------------------------

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

fn make_event(order_id: &str, event_type: OrderEventType, payload: serde_json::Value) -> OrderEvent {
    OrderEvent {
        id: Uuid::new_v4().to_string(),
        order_id: order_id.to_string(),
        event_type,
        payload,
        event_ts: now_rfc3339(),
    }
}

/// The venue (and its gateways) spell the order id several ways.
fn extract_exchange_order_id(response: &serde_json::Value) -> Option<String> {
    for key in ["uuid", "orderId", "order_id", "id"] {
        match response.get(key) {
            Some(serde_json::Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            Some(serde_json::Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetentionConfig;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    struct MockGateway {
        place_responses: Mutex<VecDeque<Result<serde_json::Value, ExchangeError>>>,
        status_responses: Mutex<VecDeque<Result<serde_json::Value, ExchangeError>>>,
        cancel_responses: Mutex<VecDeque<Result<serde_json::Value, ExchangeError>>>,
        place_calls: std::sync::atomic::AtomicUsize,
    }

    impl MockGateway {
        fn new() -> Self {
            Self {
                place_responses: Mutex::new(VecDeque::new()),
                status_responses: Mutex::new(VecDeque::new()),
                cancel_responses: Mutex::new(VecDeque::new()),
                place_calls: std::sync::atomic::AtomicUsize::new(0),
            }
        }

        fn push_place(&self, response: Result<serde_json::Value, ExchangeError>) {
            self.place_responses.lock().push_back(response);
        }

        fn push_status(&self, response: Result<serde_json::Value, ExchangeError>) {
            self.status_responses.lock().push_back(response);
        }

        fn push_cancel(&self, response: Result<serde_json::Value, ExchangeError>) {
            self.cancel_responses.lock().push_back(response);
        }
    }

    #[async_trait]
    impl OrderGateway for MockGateway {
        async fn place_order(
            &self,
            _request: &PlaceOrderRequest,
        ) -> Result<serde_json::Value, ExchangeError> {
            self.place_calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.place_responses
                .lock()
                .pop_front()
                .unwrap_or(Ok(serde_json::json!({ "uuid": "EX-DEFAULT" })))
        }

        async fn cancel_order(
            &self,
            _exchange_order_id: &str,
        ) -> Result<serde_json::Value, ExchangeError> {
            self.cancel_responses
                .lock()
                .pop_front()
                .unwrap_or(Ok(serde_json::json!({ "uuid": "EX-DEFAULT" })))
        }

        async fn get_order_status(
            &self,
            _client_order_key: &str,
            _symbol_hint: Option<&Symbol>,
        ) -> Result<serde_json::Value, ExchangeError> {
            self.status_responses
                .lock()
                .pop_front()
                .unwrap_or(Ok(serde_json::json!({ "uuid": "EX-LOOKUP" })))
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<StateStore>,
        gateway: Arc<MockGateway>,
        manager: OrderManager,
    }

    fn fixture(limits: RiskLimits) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open(
            dir.path().join("state.json"),
            RetentionConfig::default(),
        ));
        let gateway = Arc::new(MockGateway::new());
        let manager = OrderManager::new(store.clone(), gateway.clone(), limits);
        Fixture {
            _dir: dir,
            store,
            gateway,
            manager,
        }
    }

    fn paper_ctx() -> PlaceContext {
        PlaceContext {
            paper: true,
            risk: RiskContext::plain(Utc::now()),
        }
    }

    fn live_ctx() -> PlaceContext {
        PlaceContext {
            paper: false,
            risk: RiskContext::plain(Utc::now()),
        }
    }

    fn limit_input(symbol: &str, price: f64, qty: f64, key: Option<&str>) -> OrderInput {
        OrderInput {
            symbol: Symbol::normalize(symbol).unwrap(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            price: Some(price),
            qty: Some(qty),
            amount_krw: None,
            client_order_key: key.map(|k| k.to_string()),
            correlation_id: None,
            strategy_run_id: Some("run-1".to_string()),
        }
    }

    #[tokio::test]
    async fn idempotent_placement_returns_same_order() {
        let fx = fixture(RiskLimits::default());

        let first = fx
            .manager
            .place_order(limit_input("BTC_KRW", 6000.0, 1.0, Some("k1")), paper_ctx())
            .await;
        assert!(first.ok);
        let first_order = first.data.unwrap().order.unwrap();
        assert_eq!(first_order.state, OrderState::Accepted);
        assert!(first_order.paper);

        let second = fx
            .manager
            .place_order(limit_input("BTC_KRW", 6000.0, 1.0, Some("k1")), paper_ctx())
            .await;
        assert!(second.ok);
        let outcome = second.data.unwrap();
        assert!(outcome.idempotent_hit);
        assert_eq!(outcome.order.unwrap().id, first_order.id);

        // Only one distinct order exists.
        assert_eq!(fx.store.snapshot().unwrap().orders.len(), 1);
    }

    #[tokio::test]
    async fn derived_key_is_deterministic_across_retries() {
        let fx = fixture(RiskLimits::default());

        let first = fx
            .manager
            .place_order(limit_input("BTC_KRW", 6000.0, 1.0, None), paper_ctx())
            .await;
        let second = fx
            .manager
            .place_order(limit_input("BTC_KRW", 6000.0, 1.0, None), paper_ctx())
            .await;
        assert!(second.data.unwrap().idempotent_hit);
        assert_eq!(
            first.data.unwrap().order.unwrap().client_order_key,
            "run-1-BTC_KRW-buy"
        );
    }

    #[tokio::test]
    async fn min_notional_rejection_surfaces_reason_and_code() {
        let fx = fixture(RiskLimits {
            min_order_notional_krw: 5000.0,
            ..RiskLimits::default()
        });

        let result = fx
            .manager
            .place_order(limit_input("USDT_KRW", 1468.0, 1.0, None), paper_ctx())
            .await;
        assert!(!result.ok);
        assert_eq!(result.code.code(), 3);
        let outcome = result.data.unwrap();
        let decision = outcome.risk.unwrap();
        assert!(decision
            .reasons
            .contains(&crate::risk::RULE_MIN_ORDER_NOTIONAL_KRW.to_string()));

        // Rejection recorded a HIGH risk event; no order inserted.
        let snap = fx.store.snapshot().unwrap();
        assert!(snap.orders.is_empty());
        assert_eq!(snap.risk_events.len(), 1);
        assert_eq!(snap.risk_events[0].severity, "HIGH");
        assert!(snap.risk_events[0].rules.contains("MIN_ORDER_NOTIONAL_KRW"));
    }

    #[tokio::test]
    async fn kill_switch_rejects_before_dispatch() {
        let fx = fixture(RiskLimits::default());
        fx.store
            .update(|s| {
                s.settings.kill_switch = true;
                s.settings.kill_switch_reason = Some("manual".into());
            })
            .unwrap();

        let result = fx
            .manager
            .place_order(limit_input("BTC_KRW", 6000.0, 1.0, None), live_ctx())
            .await;
        assert!(!result.ok);
        assert_eq!(result.code.code(), 3);
        assert!(result
            .data
            .unwrap()
            .risk
            .unwrap()
            .reasons
            .contains(&crate::risk::RULE_KILL_SWITCH_ACTIVE.to_string()));
        // Nothing reached the exchange.
        assert_eq!(
            fx.gateway
                .place_calls
                .load(std::sync::atomic::Ordering::SeqCst),
            0
        );
    }

    #[tokio::test]
    async fn live_placement_persists_exchange_id() {
        let fx = fixture(RiskLimits::default());
        fx.gateway
            .push_place(Ok(serde_json::json!({ "uuid": "EX-123", "state": "wait" })));

        let result = fx
            .manager
            .place_order(limit_input("BTC_KRW", 6000.0, 1.0, None), live_ctx())
            .await;
        assert!(result.ok);
        let order = result.data.unwrap().order.unwrap();
        assert_eq!(order.state, OrderState::Accepted);
        assert_eq!(order.exchange_order_id.as_deref(), Some("EX-123"));
        assert!(!order.paper);

        let snap = fx.store.snapshot().unwrap();
        let kinds: Vec<_> = snap.order_events.iter().map(|e| e.event_type).collect();
        assert_eq!(kinds, vec![OrderEventType::New, OrderEventType::Accepted]);
    }

    #[tokio::test]
    async fn camel_and_snake_exchange_id_keys_are_accepted() {
        for payload in [
            serde_json::json!({ "orderId": 991 }),
            serde_json::json!({ "order_id": "ex-991" }),
            serde_json::json!({ "id": "991" }),
        ] {
            let fx = fixture(RiskLimits::default());
            fx.gateway.push_place(Ok(payload));
            let result = fx
                .manager
                .place_order(limit_input("BTC_KRW", 6000.0, 1.0, None), live_ctx())
                .await;
            let order = result.data.unwrap().order.unwrap();
            assert!(order.exchange_order_id.is_some());
        }
    }

    #[tokio::test]
    async fn placement_error_parks_unknown_submit_with_code() {
        let cases = [
            (
                ExchangeError::Status {
                    status: 429,
                    body: "slow down".into(),
                    retry_after_ms: Some(1000),
                },
                ExitCode::RateLimited,
            ),
            (
                ExchangeError::Transport("connection reset".into()),
                ExitCode::ExchangeRetryable,
            ),
            (
                ExchangeError::Status {
                    status: 400,
                    body: "bad volume".into(),
                    retry_after_ms: None,
                },
                ExitCode::ExchangeFatal,
            ),
        ];

        for (error, expected_code) in cases {
            let fx = fixture(RiskLimits::default());
            fx.gateway.push_place(Err(error));

            let result = fx
                .manager
                .place_order(limit_input("BTC_KRW", 6000.0, 1.0, None), live_ctx())
                .await;
            assert!(!result.ok);
            assert_eq!(result.code, expected_code);
            let parked = result.data.unwrap().order.unwrap();
            assert_eq!(parked.state, OrderState::UnknownSubmit);

            let snap = fx.store.snapshot().unwrap();
            assert!(snap
                .order_events
                .iter()
                .any(|e| e.event_type == OrderEventType::UnknownSubmit));
        }
    }

    #[tokio::test]
    async fn resolve_unknown_restores_accepted() {
        let fx = fixture(RiskLimits::default());
        fx.gateway
            .push_place(Err(ExchangeError::Transport("timeout".into())));

        let result = fx
            .manager
            .place_order(limit_input("BTC_KRW", 6000.0, 1.0, None), live_ctx())
            .await;
        let parked = result.data.unwrap().order.unwrap();

        fx.gateway
            .push_status(Ok(serde_json::json!({ "uuid": "EX-FOUND" })));
        let resolved = fx.manager.resolve_unknown(&parked.id).await;
        assert!(resolved.ok);
        let order = resolved.data.unwrap();
        assert_eq!(order.state, OrderState::Accepted);
        assert_eq!(order.exchange_order_id.as_deref(), Some("EX-FOUND"));

        let snap = fx.store.snapshot().unwrap();
        assert!(snap
            .order_events
            .iter()
            .any(|e| e.event_type == OrderEventType::ExchangeIdResolved));
    }

    #[tokio::test]
    async fn resolve_unknown_without_match_is_reconcile_mismatch() {
        let fx = fixture(RiskLimits::default());
        fx.gateway
            .push_place(Err(ExchangeError::Transport("timeout".into())));
        let parked = fx
            .manager
            .place_order(limit_input("BTC_KRW", 6000.0, 1.0, None), live_ctx())
            .await
            .data
            .unwrap()
            .order
            .unwrap();

        fx.gateway.push_status(Ok(serde_json::json!({})));
        let resolved = fx.manager.resolve_unknown(&parked.id).await;
        assert!(!resolved.ok);
        assert_eq!(resolved.code, ExitCode::ReconcileMismatch);
    }

    #[tokio::test]
    async fn mark_rejected_and_force_close_park_terminal() {
        let fx = fixture(RiskLimits::default());
        fx.gateway
            .push_place(Err(ExchangeError::Transport("t1".into())));
        let parked = fx
            .manager
            .place_order(limit_input("BTC_KRW", 6000.0, 1.0, Some("k1")), live_ctx())
            .await
            .data
            .unwrap()
            .order
            .unwrap();

        let rejected = fx.manager.mark_rejected(&parked.id, "operator");
        assert!(rejected.ok);
        assert_eq!(rejected.data.unwrap().state, OrderState::Rejected);

        // A terminal order cannot be force-closed.
        let closed = fx.manager.force_close(&parked.id, "operator");
        assert!(!closed.ok);
    }

    #[tokio::test]
    async fn cancel_paper_order_is_immediate() {
        let fx = fixture(RiskLimits::default());
        let placed = fx
            .manager
            .place_order(limit_input("BTC_KRW", 6000.0, 1.0, None), paper_ctx())
            .await
            .data
            .unwrap()
            .order
            .unwrap();

        let canceled = fx.manager.cancel_order(&placed.id).await;
        assert!(canceled.ok);
        assert_eq!(canceled.data.unwrap().state, OrderState::Canceled);

        // Cancel of a terminal order is a no-op that still succeeds.
        let again = fx.manager.cancel_order(&placed.id).await;
        assert!(again.ok);
        assert_eq!(again.data.unwrap().state, OrderState::Canceled);
    }

    #[tokio::test]
    async fn cancel_live_resolves_missing_exchange_id_first() {
        let fx = fixture(RiskLimits::default());
        fx.gateway
            .push_place(Err(ExchangeError::Transport("timeout".into())));
        let parked = fx
            .manager
            .place_order(limit_input("BTC_KRW", 6000.0, 1.0, None), live_ctx())
            .await
            .data
            .unwrap()
            .order
            .unwrap();
        assert!(parked.exchange_order_id.is_none());

        fx.gateway
            .push_status(Ok(serde_json::json!({ "uuid": "EX-77" })));
        fx.gateway
            .push_cancel(Ok(serde_json::json!({ "uuid": "EX-77", "state": "cancel" })));

        let canceled = fx.manager.cancel_order(&parked.id).await;
        assert!(canceled.ok);
        let order = canceled.data.unwrap();
        assert_eq!(order.state, OrderState::Canceled);
        assert_eq!(order.exchange_order_id.as_deref(), Some("EX-77"));

        let snap = fx.store.snapshot().unwrap();
        assert!(snap
            .order_events
            .iter()
            .any(|e| e.event_type == OrderEventType::ExchangeIdResolved));
    }

    #[tokio::test]
    async fn fills_accumulate_with_weighted_average() {
        let fx = fixture(RiskLimits::default());
        let order = fx
            .manager
            .place_order(limit_input("BTC_KRW", 6000.0, 2.0, None), paper_ctx())
            .await
            .data
            .unwrap()
            .order
            .unwrap();

        let partial = fx.manager.apply_fill(FillInput {
            order_id: order.id.clone(),
            exchange_fill_id: "xf-1".into(),
            price: 6000.0,
            qty: 1.0,
            fee: 3.0,
        });
        let after_first = partial.data.unwrap();
        assert_eq!(after_first.state, OrderState::Partial);
        assert!((after_first.filled_qty - 1.0).abs() < f64::EPSILON);
        assert!((after_first.remaining_qty - 1.0).abs() < f64::EPSILON);
        assert!((after_first.avg_fill_price.unwrap() - 6000.0).abs() < f64::EPSILON);

        let full = fx.manager.apply_fill(FillInput {
            order_id: order.id.clone(),
            exchange_fill_id: "xf-2".into(),
            price: 6100.0,
            qty: 1.0,
            fee: 3.0,
        });
        let after_second = full.data.unwrap();
        assert_eq!(after_second.state, OrderState::Filled);
        assert!((after_second.filled_qty + after_second.remaining_qty - 2.0).abs() < 1e-12);
        // (6000*1 + 6100*1) / 2
        assert!((after_second.avg_fill_price.unwrap() - 6050.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn duplicate_fill_id_is_a_noop() {
        let fx = fixture(RiskLimits::default());
        let order = fx
            .manager
            .place_order(limit_input("BTC_KRW", 6000.0, 2.0, None), paper_ctx())
            .await
            .data
            .unwrap()
            .order
            .unwrap();

        let fill = FillInput {
            order_id: order.id.clone(),
            exchange_fill_id: "xf-dup".into(),
            price: 6000.0,
            qty: 1.0,
            fee: 0.0,
        };
        fx.manager.apply_fill(fill.clone());
        let replay = fx.manager.apply_fill(fill);
        assert!(replay.ok);
        let after = replay.data.unwrap();
        assert!((after.filled_qty - 1.0).abs() < f64::EPSILON);
        assert_eq!(fx.store.snapshot().unwrap().fills.len(), 1);
    }

    #[tokio::test]
    async fn invalid_input_fails_fast() {
        let fx = fixture(RiskLimits::default());
        let mut input = limit_input("BTC_KRW", 6000.0, 1.0, None);
        input.price = None;
        let result = fx.manager.place_order(input, paper_ctx()).await;
        assert!(!result.ok);
        assert_eq!(result.code, ExitCode::InvalidArgs);
        assert_eq!(
            fx.gateway
                .place_calls
                .load(std::sync::atomic::Ordering::SeqCst),
            0
        );
    }
}
