// =============================================================================
// Tidal Spot Engine — Main Entry Point
// =============================================================================
//
// The engine starts in paper mode for safety. Live trading requires both the
// config flag and exchange credentials in the environment.
// =============================================================================

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tidal_bot::ai_settings::AiSettingsSource;
use tidal_bot::audit::JsonlAuditLog;
use tidal_bot::config::TradingConfig;
use tidal_bot::market::{CandleSource, MarketData};
use tidal_bot::orders::OrderGateway;
use tidal_bot::scheduler::{run_execution_service, SchedulerDeps};
use tidal_bot::store::StateStore;
use tidal_bot::symbol::Symbol;
use tidal_bot::system::TradingSystem;
use tidal_bot::types::ExitCode;
use tidal_bot::universe::MarketUniverse;
use tidal_bot::upbit::client::UpbitClient;
use tidal_bot::upbit::rate_limit::RateLimits;

const CONFIG_PATH: &str = "trading_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Tidal Spot Engine — Starting Up                  ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = TradingConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        TradingConfig::default()
    });

    // Override symbols from env if available.
    if let Ok(raw) = std::env::var("TIDAL_SYMBOLS") {
        let symbols: Vec<String> = raw
            .split(',')
            .filter_map(|s| match Symbol::normalize(s.trim()) {
                Ok(sym) => Some(sym.as_str().to_string()),
                Err(e) => {
                    warn!(input = s, error = %e, "ignoring invalid symbol from TIDAL_SYMBOLS");
                    None
                }
            })
            .collect();
        if !symbols.is_empty() {
            config.symbols = symbols;
        }
    }
    if config.symbols.is_empty() {
        config.symbols = vec![config.symbol.clone()];
    }

    let access_key = std::env::var("UPBIT_ACCESS_KEY").unwrap_or_default();
    let secret_key = std::env::var("UPBIT_SECRET_KEY").unwrap_or_default();

    // SAFETY: live trading without credentials falls back to paper.
    if !config.paper_mode && (access_key.is_empty() || secret_key.is_empty()) {
        warn!("live mode requested without exchange credentials — forcing paper mode");
        config.paper_mode = true;
    }

    info!(
        symbols = ?config.symbols,
        paper_mode = config.paper_mode,
        window_sec = config.window_sec,
        "Configured trading universe"
    );

    // ── 2. Exchange client with rate limits and request audit ────────────
    let audit_log = Arc::new(JsonlAuditLog::new(
        &config.audit_log_file,
        config.audit_max_bytes,
        config.audit_prune_ratio,
    ));
    let limits = Arc::new(RateLimits::new(
        config.exchange.public_requests_per_sec,
        config.exchange.private_requests_per_sec,
    ));
    let client = Arc::new(UpbitClient::new(
        access_key,
        secret_key,
        &config.exchange,
        limits,
        Some(audit_log.sink()),
    ));
    let market = Arc::new(MarketData::new(client.clone()));

    // ── 3. Durable state store ───────────────────────────────────────────
    let store = Arc::new(StateStore::open(&config.state_file, config.retention.clone()));
    let paper = config.paper_mode;
    if let Err(e) = store.update(|state| state.settings.paper_mode = paper) {
        warn!(error = %e, "failed to seed paper-mode setting");
    }

    // ── 4. AI settings, market universe, trading system ──────────────────
    let settings = Arc::new(AiSettingsSource::new(&config));
    let universe = Arc::new(MarketUniverse::new(
        market.clone(),
        config.universe.clone(),
        PathBuf::from(&config.universe_snapshot_file),
    ));
    let initial = settings.defaults();
    let system = Arc::new(TradingSystem::new(
        config.clone(),
        store,
        market.clone() as Arc<dyn CandleSource>,
        Some(market.clone()),
        client.clone() as Arc<dyn OrderGateway>,
        &initial,
    ));

    // ── 5. Run the execution service until stopped ───────────────────────
    let outcome = run_execution_service(
        SchedulerDeps {
            config,
            system: system.clone(),
            settings,
            universe: Some(universe),
        },
        None,
    )
    .await;

    let report = system.health_check(false);
    info!(status = %report.status, "final health check");

    if !outcome.ok {
        std::process::exit(ExitCode::InternalError.code());
    }
    info!("Tidal Spot Engine shut down complete.");
    Ok(())
}
