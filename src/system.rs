// =============================================================================
// Trading system — central hub tying store, market data, orders, and risk
// =============================================================================
//
// Owns the applied AI-settings groups, builds the risk-evaluation context
// (daily PnL, exposure), runs one realtime strategy evaluation per symbol,
// and routes direct placements through the auto-recovery policy.
// =============================================================================

use std::sync::Arc;

use chrono::{FixedOffset, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::ai_settings::{AiSettingsSnapshot, RiskOverlay, StrategyName, StrategySettings};
use crate::config::TradingConfig;
use crate::decision::{DecisionMode, DecisionPolicy, ForceTracker, ResolvedPolicy};
use crate::health::{check_health, HealthReport};
use crate::market::{CandleSource, MarketData};
use crate::orders::{OrderGateway, OrderInput, OrderManager, PlaceContext, PlaceOutcome};
use crate::recovery::AutoRecoveryPolicy;
use crate::risk::RiskContext;
use crate::signals::breakout::Breakout;
use crate::signals::momentum::RiskManagedMomentum;
use crate::signals::{SignalAction, Strategy};
use crate::store::model::{StrategyRun, SystemHealthRecord, TradingState};
use crate::store::StateStore;
use crate::symbol::Symbol;
use crate::types::{ExitCode, OpResult, OrderType, Side};

/// Sizing clamp applied to the strategy's risk multiplier downstream.
const SIZING_MULTIPLIER_MIN: f64 = 0.2;
const SIZING_MULTIPLIER_MAX: f64 = 3.0;

/// The AI-settings groups currently in force.
#[derive(Debug, Clone)]
pub struct AppliedSettings {
    pub execution: crate::ai_settings::ExecutionSettings,
    pub strategy: StrategySettings,
    pub decision: DecisionPolicy,
    pub overlay: Option<RiskOverlay>,
}

impl AppliedSettings {
    pub fn from_snapshot(snapshot: &AiSettingsSnapshot) -> Self {
        Self {
            execution: snapshot.execution.clone(),
            strategy: snapshot.strategy.clone(),
            decision: snapshot.decision.clone(),
            overlay: snapshot.overlay.clone(),
        }
    }
}

/// Per-symbol realtime run counters.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeRunResult {
    pub symbol: String,
    pub ok: bool,
    pub code: i32,
    pub ticks: u64,
    pub buy_signals: u64,
    pub sell_signals: u64,
    pub orders_attempted: u64,
    pub orders_placed: u64,
    pub reason: String,
}

pub struct TradingSystem {
    config: TradingConfig,
    store: Arc<StateStore>,
    candles: Arc<dyn CandleSource>,
    market: Option<Arc<MarketData>>,
    orders: OrderManager,
    applied: RwLock<AppliedSettings>,
    force_tracker: ForceTracker,
    recovery: AutoRecoveryPolicy,
    /// Order attempts left in the current window, shared by all symbol tasks.
    window_attempt_budget: std::sync::atomic::AtomicU32,
}

impl TradingSystem {
    pub fn new(
        config: TradingConfig,
        store: Arc<StateStore>,
        candles: Arc<dyn CandleSource>,
        market: Option<Arc<MarketData>>,
        gateway: Arc<dyn OrderGateway>,
        initial: &AiSettingsSnapshot,
    ) -> Self {
        let orders = OrderManager::new(store.clone(), gateway, config.risk.clone());
        let recovery =
            AutoRecoveryPolicy::new(&config.recovery, config.risk.unknown_submit_max_age_sec);
        Self {
            store,
            candles,
            market,
            orders,
            applied: RwLock::new(AppliedSettings::from_snapshot(initial)),
            force_tracker: ForceTracker::new(),
            recovery,
            config,
            window_attempt_budget: std::sync::atomic::AtomicU32::new(u32::MAX),
        }
    }

    /// Arm the per-window order-attempt budget. The scheduler calls this once
    /// before dispatching the window's symbol tasks.
    pub fn begin_window(&self) {
        let max = self.applied.read().execution.max_order_attempts_per_window;
        self.window_attempt_budget
            .store(max, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn applied(&self) -> AppliedSettings {
        self.applied.read().clone()
    }

    // -------------------------------------------------------------------------
    // AI-settings apply methods (called by the scheduler on diff)
    // -------------------------------------------------------------------------

    pub fn apply_execution_settings(
        &self,
        settings: &crate::ai_settings::ExecutionSettings,
    ) -> Result<(), String> {
        self.applied.write().execution = settings.clone();
        info!(
            symbols = ?settings.symbols,
            order_amount_krw = settings.order_amount_krw,
            window_sec = settings.window_sec,
            "execution settings applied"
        );
        Ok(())
    }

    pub fn apply_strategy_settings(&self, settings: &StrategySettings) -> Result<(), String> {
        // Reject settings a strategy cannot be built from.
        build_strategy(settings)?;
        self.applied.write().strategy = settings.clone();
        info!(strategy = %settings.name, interval = %settings.candle_interval, "strategy settings applied");
        Ok(())
    }

    pub fn apply_decision_policy(&self, policy: &DecisionPolicy) -> Result<(), String> {
        self.applied.write().decision = policy.clone();
        // A new snapshot re-arms any force-once action.
        self.force_tracker.reset();
        info!(mode = ?policy.mode, force = ?policy.force_action, "decision policy applied");
        Ok(())
    }

    pub fn apply_overlay(&self, overlay: Option<&RiskOverlay>) -> Result<(), String> {
        self.applied.write().overlay = overlay.cloned();
        match overlay {
            Some(o) => info!(
                risk_multiplier = o.risk_multiplier,
                regime = o.regime.as_deref().unwrap_or("unknown"),
                "risk overlay applied"
            ),
            None => info!("risk overlay cleared"),
        }
        Ok(())
    }

    /// Apply a kill-switch control. `None` leaves the persisted value alone.
    pub fn apply_kill_switch(&self, desired: Option<bool>) -> Result<bool, String> {
        let Some(desired) = desired else {
            return Ok(false);
        };
        let mut changed = false;
        self.store
            .update(|state| {
                if state.settings.kill_switch != desired {
                    state.settings.kill_switch = desired;
                    state.settings.kill_switch_reason =
                        desired.then(|| "ai_operator".to_string());
                    changed = true;
                }
            })
            .map_err(|e| e.to_string())?;
        if changed {
            warn!(kill_switch = desired, "kill switch changed by AI operator");
        }
        Ok(changed)
    }

    /// Record one applied settings-group change for the agent audit trail.
    pub fn record_agent_audit(&self, group: &str, old_hash: Option<&str>, new_hash: &str, source: &str) {
        let record = crate::store::model::AgentAuditRecord {
            id: Uuid::new_v4().to_string(),
            group: group.to_string(),
            old_hash: old_hash.map(|h| h.to_string()),
            new_hash: new_hash.to_string(),
            source: source.to_string(),
            created_at: Utc::now().to_rfc3339(),
        };
        if let Err(e) = self.store.update(|state| state.agent_audit.push(record.clone())) {
            warn!(error = %e, "failed to record agent audit entry");
        }
    }

    // -------------------------------------------------------------------------
    // Account preflight & daily baseline
    // -------------------------------------------------------------------------

    /// Refresh the balances snapshot from the exchange (live mode only) and
    /// roll the daily-PnL baseline on date change.
    pub async fn preflight_accounts(&self) {
        if let Some(market) = &self.market {
            let paper = self
                .store
                .snapshot()
                .map(|s| s.settings.paper_mode)
                .unwrap_or(true);
            if !paper {
                match market.fetch_balances().await {
                    Ok(snapshot) => {
                        if let Err(e) = self
                            .store
                            .update(|state| state.balances_snapshots.push(snapshot.clone()))
                        {
                            warn!(error = %e, "failed to persist balances snapshot");
                        }
                    }
                    Err(e) => warn!(error = %e, "account preflight failed"),
                }
            }
        }
        self.ensure_daily_baseline();
    }

    fn local_date(&self) -> String {
        let offset = FixedOffset::east_opt(self.config.tz_offset_hours * 3600)
            .unwrap_or_else(|| FixedOffset::east_opt(0).expect("zero offset is valid"));
        Utc::now().with_timezone(&offset).format("%Y-%m-%d").to_string()
    }

    fn ensure_daily_baseline(&self) {
        let today = self.local_date();
        let result = self.store.update(|state| {
            let needs_roll = state
                .settings
                .daily_pnl_baseline
                .as_ref()
                .map(|b| b.date != today)
                .unwrap_or(true);
            if needs_roll {
                if let Some(equity) = equity_krw(state) {
                    state.settings.daily_pnl_baseline =
                        Some(crate::store::model::DailyPnlBaseline {
                            date: today.clone(),
                            equity_krw: equity,
                        });
                }
            }
        });
        if let Err(e) = result {
            warn!(error = %e, "failed to roll daily PnL baseline");
        }
    }

    fn build_risk_context(&self, ai_selected: bool, state: &TradingState) -> RiskContext {
        let today = self.local_date();
        let daily_pnl = state
            .settings
            .daily_pnl_baseline
            .as_ref()
            .filter(|b| b.date == today)
            .and_then(|b| equity_krw(state).map(|equity| equity - b.equity_krw));
        RiskContext {
            ai_selected,
            daily_realized_pnl_krw: daily_pnl,
            dynamic_min_notional_krw: None,
            now: Utc::now(),
        }
    }

    // -------------------------------------------------------------------------
    // Realtime run (one symbol, one window)
    // -------------------------------------------------------------------------

    pub async fn run_realtime(&self, symbol: &Symbol, policy: &ResolvedPolicy) -> RealtimeRunResult {
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now().to_rfc3339();
        let applied = self.applied();

        let mut result = RealtimeRunResult {
            symbol: symbol.as_str().to_string(),
            ok: true,
            code: ExitCode::Ok.code(),
            ticks: 0,
            buy_signals: 0,
            sell_signals: 0,
            orders_attempted: 0,
            orders_placed: 0,
            reason: String::new(),
        };

        // Signal evaluation is skipped entirely in rule mode.
        let signal = if policy.mode == DecisionMode::Rule {
            None
        } else {
            let strategy = match build_strategy(&applied.strategy) {
                Ok(s) => s,
                Err(e) => {
                    result.ok = false;
                    result.code = ExitCode::InternalError.code();
                    result.reason = e;
                    self.record_run(&run_id, symbol, &applied, &result, &started_at);
                    return result;
                }
            };
            let count = candle_count(&applied.strategy);
            match self
                .candles
                .recent_candles(symbol, applied.strategy.candle_interval, count)
                .await
            {
                Ok(candles) => Some(strategy.evaluate(&candles)),
                Err(e) => {
                    result.ok = false;
                    result.code = e.exit_code().code();
                    result.reason = e.to_string();
                    self.record_run(&run_id, symbol, &applied, &result, &started_at);
                    return result;
                }
            }
        };
        result.ticks = 1;

        if let Some(signal) = &signal {
            match signal.action {
                SignalAction::Buy => result.buy_signals = 1,
                SignalAction::Sell => result.sell_signals = 1,
                SignalAction::Hold => {}
            }
        }

        // Resolve the effective action under the decision policy.
        let force_available = policy.force_action.is_some()
            && !(policy.force_once && self.force_tracker.is_consumed(symbol.as_str()));
        let (action, forced) = match policy.mode {
            DecisionMode::Rule => {
                if force_available {
                    (policy.force_action, true)
                } else {
                    (None, false)
                }
            }
            DecisionMode::Override => {
                if force_available {
                    (policy.force_action, true)
                } else {
                    (gate_signal(signal.as_ref(), policy), false)
                }
            }
            DecisionMode::Filter => (gate_signal(signal.as_ref(), policy), false),
        };

        let Some(side) = action else {
            result.reason = signal
                .as_ref()
                .map(|s| s.reason.clone())
                .unwrap_or_else(|| "no_action".to_string());
            self.record_run(&run_id, symbol, &applied, &result, &started_at);
            return result;
        };

        // The window-wide attempt budget bounds how many orders all symbol
        // tasks together may send. Checked before the force is consumed so a
        // skipped attempt leaves the force armed.
        if self
            .window_attempt_budget
            .fetch_update(
                std::sync::atomic::Ordering::SeqCst,
                std::sync::atomic::Ordering::SeqCst,
                |v| v.checked_sub(1),
            )
            .is_err()
        {
            result.reason = "order_attempt_budget_exhausted".to_string();
            self.record_run(&run_id, symbol, &applied, &result, &started_at);
            return result;
        }

        // Sizing: forced amounts are used verbatim; signal-driven orders scale
        // the window budget by the strategy's risk multiplier and the overlay.
        let amount_krw = if forced {
            if policy.force_once {
                self.force_tracker.consume(symbol.as_str());
            }
            policy
                .force_amount_krw
                .unwrap_or(applied.execution.order_amount_krw)
        } else {
            let risk_multiplier = signal
                .as_ref()
                .and_then(|s| s.metrics.risk_multiplier)
                .unwrap_or(1.0)
                .clamp(SIZING_MULTIPLIER_MIN, SIZING_MULTIPLIER_MAX);
            let overlay_multiplier = applied
                .overlay
                .as_ref()
                .map(|o| o.risk_multiplier)
                .unwrap_or(1.0);
            applied.execution.order_amount_krw * risk_multiplier * overlay_multiplier
        };

        let input = match self.build_market_input(symbol, side, amount_krw, &applied, &run_id).await {
            Ok(i) => i,
            Err(e) => {
                result.ok = false;
                result.code = e.exit_code().code();
                result.reason = e.to_string();
                self.record_run(&run_id, symbol, &applied, &result, &started_at);
                return result;
            }
        };

        result.orders_attempted = 1;
        let paper = self
            .store
            .snapshot()
            .map(|s| s.settings.paper_mode)
            .unwrap_or(true);
        let state = self.store.snapshot().unwrap_or_default();
        let ctx = PlaceContext {
            paper,
            risk: self.build_risk_context(true, &state),
        };

        let placed = self.place_order_direct(input, ctx).await;
        if placed.ok {
            result.orders_placed = 1;
            result.reason = format!("{side}_order_placed");
        } else {
            result.ok = false;
            result.code = placed.code.code();
            result.reason = placed
                .error
                .unwrap_or_else(|| "placement failed".to_string());
        }

        self.record_run(&run_id, symbol, &applied, &result, &started_at);
        result
    }

    /// Build the market-order input for a signal/forced action.
    async fn build_market_input(
        &self,
        symbol: &Symbol,
        side: Side,
        amount_krw: f64,
        applied: &AppliedSettings,
        run_id: &str,
    ) -> Result<OrderInput, crate::upbit::error::ExchangeError> {
        let (qty, amount) = match side {
            Side::Buy => (None, Some(amount_krw)),
            Side::Sell => {
                // A market sell is quantity-denominated; convert the quote
                // budget at the latest close.
                let candles = self
                    .candles
                    .recent_candles(symbol, applied.strategy.candle_interval, 1)
                    .await?;
                let last_close = candles.last().map(|c| c.close).unwrap_or(0.0);
                if last_close <= 0.0 {
                    return Err(crate::upbit::error::ExchangeError::InvalidArgument(
                        format!("no reference price for {symbol}"),
                    ));
                }
                (Some(amount_krw / last_close), None)
            }
        };
        Ok(OrderInput {
            symbol: symbol.clone(),
            side,
            order_type: OrderType::Market,
            price: None,
            qty,
            amount_krw: amount,
            client_order_key: None,
            correlation_id: Some(run_id.to_string()),
            strategy_run_id: Some(run_id.to_string()),
        })
    }

    fn record_run(
        &self,
        run_id: &str,
        symbol: &Symbol,
        applied: &AppliedSettings,
        result: &RealtimeRunResult,
        started_at: &str,
    ) {
        let run = StrategyRun {
            id: run_id.to_string(),
            symbol: symbol.as_str().to_string(),
            strategy: applied.strategy.name.to_string(),
            started_at: started_at.to_string(),
            finished_at: Some(Utc::now().to_rfc3339()),
            ticks: result.ticks,
            buy_signals: result.buy_signals,
            sell_signals: result.sell_signals,
            orders_attempted: result.orders_attempted,
            orders_placed: result.orders_placed,
            code: result.code,
        };
        if let Err(e) = self.store.update(|state| state.strategy_runs.push(run.clone())) {
            warn!(error = %e, "failed to record strategy run");
        }
    }

    // -------------------------------------------------------------------------
    // Direct placement with auto-recovery
    // -------------------------------------------------------------------------

    /// Place an order, retrying retryable failures a bounded number of times.
    /// Repeated retryable failures in the window — or any aged UNKNOWN_SUBMIT
    /// order — trip the kill-switch.
    pub async fn place_order_direct(
        &self,
        input: OrderInput,
        ctx: PlaceContext,
    ) -> OpResult<PlaceOutcome> {
        // Aged parked orders block the retry path entirely.
        if let Ok(state) = self.store.snapshot() {
            let aged = self.recovery.aged_unknown_submits(&state, Utc::now());
            if !aged.is_empty() && !state.settings.kill_switch {
                warn!(orders = ?aged, "aged UNKNOWN_SUBMIT orders — tripping kill switch");
                self.activate_kill_switch("aged_unknown_submit");
            }
        }

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let mut this_input = input.clone();
            // Recovery retries are new placements, not crash-replays; a parked
            // order from the previous attempt keeps its own key.
            if attempt > 1 && this_input.client_order_key.is_none() {
                this_input.correlation_id = input.correlation_id.clone();
                this_input.strategy_run_id = input
                    .strategy_run_id
                    .as_ref()
                    .map(|r| format!("{r}-r{attempt}"));
            }

            let result = self.orders.place_order(this_input, ctx.clone()).await;

            let retryable = matches!(
                result.code,
                ExitCode::ExchangeRetryable | ExitCode::RateLimited
            );
            if result.ok || !retryable {
                return result;
            }

            if self.recovery.record_retryable_failure() {
                self.activate_kill_switch("auto_recovery_failure_threshold");
                return result;
            }
            if attempt > self.recovery.max_retries() {
                return result;
            }
            warn!(attempt, code = %result.code, "direct placement failed — retrying");
            tokio::time::sleep(std::time::Duration::from_millis(250 * attempt as u64)).await;
        }
    }

    fn activate_kill_switch(&self, reason: &str) {
        let reason = reason.to_string();
        let result = self.store.update(|state| {
            state.settings.kill_switch = true;
            state.settings.kill_switch_reason = Some(reason.clone());
        });
        match result {
            Ok(()) => warn!(reason = %reason, "kill switch activated"),
            Err(e) => warn!(error = %e, "failed to persist kill switch"),
        }
    }

    // -------------------------------------------------------------------------
    // Health
    // -------------------------------------------------------------------------

    /// Run the health aggregation and append the record.
    pub fn health_check(&self, strict: bool) -> HealthReport {
        let state = self.store.snapshot().unwrap_or_default();
        let report = check_health(
            &state,
            self.recovery.unknown_submit_max_age_sec(),
            strict,
            Utc::now(),
        );
        let record = SystemHealthRecord {
            id: Uuid::new_v4().to_string(),
            status: report.status.to_string(),
            checks: serde_json::to_value(&report.checks).unwrap_or(serde_json::Value::Null),
            created_at: report.checked_at.clone(),
        };
        if let Err(e) = self.store.update(|state| state.system_health.push(record.clone())) {
            warn!(error = %e, "failed to record health check");
        }
        report
    }
}

/// Total account equity in KRW from the latest balances snapshot: cash plus
/// holdings at average buy price.
fn equity_krw(state: &TradingState) -> Option<f64> {
    let snapshot = state.latest_balances()?;
    let mut equity = 0.0;
    for item in &snapshot.items {
        if item.currency == "KRW" {
            equity += item.balance + item.locked;
        } else if item.unit_currency == "KRW" && item.avg_buy_price > 0.0 {
            equity += (item.balance + item.locked).max(0.0) * item.avg_buy_price;
        }
    }
    Some(equity)
}

fn gate_signal(
    signal: Option<&crate::signals::Signal>,
    policy: &ResolvedPolicy,
) -> Option<Side> {
    match signal.map(|s| s.action) {
        Some(SignalAction::Buy) if policy.allow_buy => Some(Side::Buy),
        Some(SignalAction::Sell) if policy.allow_sell => Some(Side::Sell),
        _ => None,
    }
}

fn build_strategy(settings: &StrategySettings) -> Result<Box<dyn Strategy>, String> {
    match settings.name {
        StrategyName::RiskManagedMomentum => Ok(Box::new(RiskManagedMomentum::new(
            settings.momentum_lookback,
            settings.volatility_lookback,
            settings.momentum_entry_bps,
            settings.momentum_exit_bps,
            settings.target_volatility_pct,
            settings.risk_managed_min_multiplier,
            settings.risk_managed_max_multiplier,
        )?)),
        StrategyName::Breakout => Ok(Box::new(Breakout::new(
            settings.breakout_lookback,
            settings.breakout_buffer_bps,
        )?)),
    }
}

fn candle_count(settings: &StrategySettings) -> u32 {
    let needed = match settings.name {
        StrategyName::RiskManagedMomentum => settings.volatility_lookback + 1,
        StrategyName::Breakout => settings.breakout_lookback + 1,
    };
    (needed as u32 + 4).min(200)
}
