// =============================================================================
// Execution scheduler — the window loop
// =============================================================================
//
// Per window: re-read the AI settings when the jittered refresh timer expires,
// apply changed groups (diffed by stringification), refresh the market
// universe when due, filter the symbol set, dispatch one realtime run per
// surviving symbol concurrently, aggregate, sleep. SIGINT/SIGTERM set a stop
// flag checked between windows and inside sleeps; in-flight runs are awaited
// to completion.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::ai_settings::{AiSettingsSnapshot, AiSettingsSource};
use crate::config::TradingConfig;
use crate::symbol::Symbol;
use crate::system::{RealtimeRunResult, TradingSystem};
use crate::types::ExitCode;
use crate::universe::MarketUniverse;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoppedBy {
    Disabled,
    WindowLimit,
    Requested,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceOutcome {
    pub ok: bool,
    pub windows: u64,
    pub stopped_by: StoppedBy,
}

pub struct SchedulerDeps {
    pub config: TradingConfig,
    pub system: Arc<TradingSystem>,
    pub settings: Arc<AiSettingsSource>,
    pub universe: Option<Arc<MarketUniverse>>,
}

/// Cached stringified hashes of the applied settings groups.
#[derive(Default)]
struct GroupHashes {
    execution: Option<String>,
    strategy: Option<String>,
    decision: Option<String>,
    overlay: Option<String>,
    kill_switch: Option<String>,
}

fn hash_of<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// Drive the execution-window loop until stopped.
pub async fn run_execution_service(
    deps: SchedulerDeps,
    stop_after_windows: Option<u64>,
) -> ServiceOutcome {
    if !deps.config.execution_enabled {
        info!("execution service disabled by config");
        return ServiceOutcome {
            ok: true,
            windows: 0,
            stopped_by: StoppedBy::Disabled,
        };
    }

    let stop_flag = Arc::new(AtomicBool::new(false));
    let signal_tasks = install_signal_handlers(stop_flag.clone());

    let outcome = window_loop(&deps, stop_after_windows, &stop_flag).await;

    // Handlers are removed before returning.
    for task in signal_tasks {
        task.abort();
    }

    info!(
        windows = outcome.windows,
        stopped_by = ?outcome.stopped_by,
        "execution service stopped"
    );
    outcome
}

async fn window_loop(
    deps: &SchedulerDeps,
    stop_after_windows: Option<u64>,
    stop_flag: &Arc<AtomicBool>,
) -> ServiceOutcome {
    let restart_delay = Duration::from_secs(deps.config.restart_delay_sec);
    let mut hashes = GroupHashes::default();
    let mut windows: u64 = 0;
    let mut next_refresh_at = Instant::now();
    let mut current: AiSettingsSnapshot = deps.settings.defaults();

    loop {
        if stop_flag.load(Ordering::SeqCst) {
            return ServiceOutcome {
                ok: true,
                windows,
                stopped_by: StoppedBy::Requested,
            };
        }

        // 1. Jittered AI-settings refresh.
        if Instant::now() >= next_refresh_at {
            current = deps.settings.load();
            let jitter_sec = rand::thread_rng()
                .gen_range(deps.config.ai_refresh_min_sec..=deps.config.ai_refresh_max_sec.max(deps.config.ai_refresh_min_sec));
            next_refresh_at = Instant::now() + Duration::from_secs(jitter_sec);
            info!(
                source = %current.source,
                next_refresh_sec = jitter_sec,
                "AI settings refreshed"
            );
            apply_changed_groups(deps, &current, &mut hashes);
        }

        // 2. Market-universe refresh (failure keeps the cached snapshot).
        if let Some(universe) = &deps.universe {
            universe.refresh_if_due().await;
        }

        windows += 1;

        // 4. Execution can be switched off by the operator.
        if !current.execution.enabled {
            debug!("execution disabled by AI settings — idling");
            if reached_limit(stop_after_windows, windows) {
                return ServiceOutcome {
                    ok: true,
                    windows,
                    stopped_by: StoppedBy::WindowLimit,
                };
            }
            if sleep_unless_stopped(stop_flag, restart_delay).await {
                return ServiceOutcome {
                    ok: true,
                    windows,
                    stopped_by: StoppedBy::Requested,
                };
            }
            continue;
        }

        // 5. Effective symbol list through the universe filter.
        let mut symbols: Vec<Symbol> = current
            .execution
            .symbols
            .iter()
            .take(current.execution.max_symbols_per_window)
            .filter_map(|s| Symbol::normalize(s).ok())
            .collect();
        if let Some(universe) = &deps.universe {
            symbols = universe.filter_symbols(&symbols);
        }

        if symbols.is_empty() {
            debug!("no symbols survive the universe filter — idling");
            if reached_limit(stop_after_windows, windows) {
                return ServiceOutcome {
                    ok: true,
                    windows,
                    stopped_by: StoppedBy::WindowLimit,
                };
            }
            if sleep_unless_stopped(stop_flag, restart_delay).await {
                return ServiceOutcome {
                    ok: true,
                    windows,
                    stopped_by: StoppedBy::Requested,
                };
            }
            continue;
        }

        deps.system.preflight_accounts().await;
        deps.system.begin_window();

        // 6–7. One concurrent realtime run per symbol.
        let mut handles = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            let system = deps.system.clone();
            // 6. Per-symbol policy: top-level decision merged with overrides.
            let policy = system.applied().decision.resolve(symbol.as_str());
            handles.push(tokio::spawn(async move {
                system.run_realtime(&symbol, &policy).await
            }));
        }

        let mut results: Vec<RealtimeRunResult> = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => {
                    error!(error = %e, "realtime task panicked");
                    results.push(RealtimeRunResult {
                        symbol: "?".to_string(),
                        ok: false,
                        code: ExitCode::InternalError.code(),
                        ticks: 0,
                        buy_signals: 0,
                        sell_signals: 0,
                        orders_attempted: 0,
                        orders_placed: 0,
                        reason: e.to_string(),
                    });
                }
            }
        }

        // 8. Aggregate and log.
        let ticks: u64 = results.iter().map(|r| r.ticks).sum();
        let buys: u64 = results.iter().map(|r| r.buy_signals).sum();
        let sells: u64 = results.iter().map(|r| r.sell_signals).sum();
        let attempted: u64 = results.iter().map(|r| r.orders_attempted).sum();
        let placed: u64 = results.iter().map(|r| r.orders_placed).sum();
        let failed: Vec<String> = results
            .iter()
            .filter(|r| !r.ok)
            .map(|r| format!("{}:{}", r.symbol, r.code))
            .collect();

        if failed.is_empty() {
            let activity = attempted > 0 || buys + sells > 0;
            if activity || windows % deps.config.heartbeat_every_windows.max(1) == 0 {
                info!(
                    window = windows,
                    ticks,
                    buy_signals = buys,
                    sell_signals = sells,
                    orders_attempted = attempted,
                    orders_placed = placed,
                    "execution window completed"
                );
            }
        } else {
            warn!(
                window = windows,
                failures = %failed.join(","),
                orders_attempted = attempted,
                orders_placed = placed,
                "execution window failed"
            );
        }

        // 9. Window limit, then the cooldown (after any order attempt) and
        // the between-window sleep.
        if reached_limit(stop_after_windows, windows) {
            return ServiceOutcome {
                ok: true,
                windows,
                stopped_by: StoppedBy::WindowLimit,
            };
        }
        if attempted > 0 && current.execution.cooldown_sec > 0 {
            let cooldown = Duration::from_secs(current.execution.cooldown_sec);
            if sleep_unless_stopped(stop_flag, cooldown).await {
                return ServiceOutcome {
                    ok: true,
                    windows,
                    stopped_by: StoppedBy::Requested,
                };
            }
        }
        if sleep_unless_stopped(stop_flag, restart_delay).await {
            return ServiceOutcome {
                ok: true,
                windows,
                stopped_by: StoppedBy::Requested,
            };
        }
    }
}

/// Diff each settings group against its cached hash and apply the changed
/// ones. The hash only advances on a successful apply.
fn apply_changed_groups(
    deps: &SchedulerDeps,
    snapshot: &AiSettingsSnapshot,
    hashes: &mut GroupHashes,
) {
    let execution_hash = hash_of(&snapshot.execution);
    if hashes.execution.as_ref() != Some(&execution_hash) {
        match deps.system.apply_execution_settings(&snapshot.execution) {
            Ok(()) => {
                deps.system.record_agent_audit(
                    "execution",
                    hashes.execution.as_deref(),
                    &execution_hash,
                    &snapshot.source,
                );
                hashes.execution = Some(execution_hash);
            }
            Err(e) => warn!(error = %e, "execution settings apply failed"),
        }
    }

    let strategy_hash = hash_of(&snapshot.strategy);
    if hashes.strategy.as_ref() != Some(&strategy_hash) {
        match deps.system.apply_strategy_settings(&snapshot.strategy) {
            Ok(()) => {
                deps.system.record_agent_audit(
                    "strategy",
                    hashes.strategy.as_deref(),
                    &strategy_hash,
                    &snapshot.source,
                );
                hashes.strategy = Some(strategy_hash);
            }
            Err(e) => warn!(error = %e, "strategy settings apply failed"),
        }
    }

    let decision_hash = hash_of(&snapshot.decision);
    if hashes.decision.as_ref() != Some(&decision_hash) {
        match deps.system.apply_decision_policy(&snapshot.decision) {
            Ok(()) => {
                deps.system.record_agent_audit(
                    "decision",
                    hashes.decision.as_deref(),
                    &decision_hash,
                    &snapshot.source,
                );
                hashes.decision = Some(decision_hash);
            }
            Err(e) => warn!(error = %e, "decision policy apply failed"),
        }
    }

    let overlay_hash = hash_of(&snapshot.overlay);
    if hashes.overlay.as_ref() != Some(&overlay_hash) {
        match deps.system.apply_overlay(snapshot.overlay.as_ref()) {
            Ok(()) => {
                deps.system.record_agent_audit(
                    "overlay",
                    hashes.overlay.as_deref(),
                    &overlay_hash,
                    &snapshot.source,
                );
                hashes.overlay = Some(overlay_hash);
            }
            Err(e) => warn!(error = %e, "overlay apply failed"),
        }
    }

    let kill_hash = hash_of(&snapshot.controls.kill_switch);
    if hashes.kill_switch.as_ref() != Some(&kill_hash) {
        match deps.system.apply_kill_switch(snapshot.controls.kill_switch) {
            Ok(_) => {
                deps.system.record_agent_audit(
                    "killSwitch",
                    hashes.kill_switch.as_deref(),
                    &kill_hash,
                    &snapshot.source,
                );
                hashes.kill_switch = Some(kill_hash);
            }
            Err(e) => warn!(error = %e, "kill switch apply failed"),
        }
    }
}

fn reached_limit(stop_after_windows: Option<u64>, windows: u64) -> bool {
    stop_after_windows.is_some_and(|limit| windows >= limit)
}

/// Sleep in short slices so a stop request interrupts promptly. Returns true
/// when the stop flag fired.
async fn sleep_unless_stopped(stop_flag: &Arc<AtomicBool>, total: Duration) -> bool {
    let slice = Duration::from_millis(200);
    let deadline = Instant::now() + total;
    loop {
        if stop_flag.load(Ordering::SeqCst) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep(slice.min(deadline - now)).await;
    }
}

/// Interrupt/terminate handlers set the stop flag atomically. The returned
/// tasks are aborted when the service exits.
fn install_signal_handlers(stop_flag: Arc<AtomicBool>) -> Vec<tokio::task::JoinHandle<()>> {
    let mut tasks = Vec::new();

    let flag = stop_flag.clone();
    tasks.push(tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received — stop requested");
            flag.store(true, Ordering::SeqCst);
        }
    }));

    #[cfg(unix)]
    {
        let flag = stop_flag;
        tasks.push(tokio::spawn(async move {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    if sigterm.recv().await.is_some() {
                        warn!("SIGTERM received — stop requested");
                        flag.store(true, Ordering::SeqCst);
                    }
                }
                Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
            }
        }));
    }

    tasks
}
