// =============================================================================
// Runtime Configuration — engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Tidal trading engine.  Persistence uses an
// atomic tmp + rename pattern to prevent corruption on crash.  All fields carry
// `#[serde(default)]` so that adding new fields never breaks loading an older
// config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_symbol() -> String {
    "BTC_KRW".to_string()
}

fn default_symbols() -> Vec<String> {
    vec!["BTC_KRW".to_string()]
}

fn default_order_amount_krw() -> f64 {
    10_000.0
}

fn default_window_sec() -> u64 {
    60
}

fn default_cooldown_sec() -> u64 {
    5
}

fn default_restart_delay_sec() -> u64 {
    5
}

fn default_heartbeat_every_windows() -> u64 {
    12
}

fn default_ai_refresh_min_sec() -> u64 {
    1800
}

fn default_ai_refresh_max_sec() -> u64 {
    3600
}

fn default_max_concurrent_orders() -> usize {
    5
}

fn default_min_order_notional_krw() -> f64 {
    5_000.0
}

fn default_max_order_notional_krw() -> f64 {
    1_000_000.0
}

fn default_daily_loss_limit_krw() -> f64 {
    50_000.0
}

fn default_min_order_amount_krw() -> f64 {
    5_000.0
}

fn default_max_order_amount_krw() -> f64 {
    500_000.0
}

fn default_ai_max_order_notional_krw() -> f64 {
    100_000.0
}

fn default_ai_max_orders_per_window() -> usize {
    10
}

fn default_ai_order_count_window_sec() -> u64 {
    3600
}

fn default_ai_max_total_exposure_krw() -> f64 {
    1_000_000.0
}

fn default_unknown_submit_max_age_sec() -> u64 {
    600
}

fn default_public_requests_per_sec() -> usize {
    150
}

fn default_private_requests_per_sec() -> usize {
    140
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    300
}

fn default_request_timeout_sec() -> u64 {
    10
}

fn default_state_file() -> String {
    "tidal_state.json".to_string()
}

fn default_ai_settings_file() -> String {
    "ai_settings.json".to_string()
}

fn default_overlay_file() -> String {
    "ai_overlay.json".to_string()
}

fn default_universe_file() -> String {
    "market_universe.json".to_string()
}

fn default_audit_log_file() -> String {
    "http_audit.jsonl".to_string()
}

fn default_audit_max_bytes() -> u64 {
    5 * 1024 * 1024
}

fn default_audit_prune_ratio() -> f64 {
    0.5
}

fn default_closed_orders() -> usize {
    200
}

fn default_order_events() -> usize {
    1000
}

fn default_fills() -> usize {
    500
}

fn default_strategy_runs() -> usize {
    200
}

fn default_balances_snapshots() -> usize {
    50
}

fn default_risk_events() -> usize {
    200
}

fn default_system_health() -> usize {
    100
}

fn default_agent_audit() -> usize {
    200
}

fn default_quote() -> String {
    "KRW".to_string()
}

fn default_min_acc_trade_value_24h() -> f64 {
    1e10
}

fn default_min_base_len() -> usize {
    2
}

fn default_max_universe_symbols() -> usize {
    10
}

fn default_universe_refresh_sec() -> u64 {
    600
}

fn default_recovery_max_retries() -> u32 {
    2
}

fn default_recovery_failure_window_sec() -> u64 {
    300
}

fn default_recovery_failure_threshold() -> u32 {
    3
}

fn default_tz_offset_hours() -> i32 {
    9
}

// =============================================================================
// Sub-sections
// =============================================================================

/// Hard limits consulted by the risk engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    #[serde(default = "default_max_concurrent_orders")]
    pub max_concurrent_orders: usize,

    /// Base minimum notional; per-symbol overrides and the dynamic context
    /// minimum can only raise it.
    #[serde(default = "default_min_order_notional_krw")]
    pub min_order_notional_krw: f64,

    #[serde(default)]
    pub symbol_min_notional_krw: std::collections::BTreeMap<String, f64>,

    #[serde(default = "default_max_order_notional_krw")]
    pub max_order_notional_krw: f64,

    #[serde(default = "default_daily_loss_limit_krw")]
    pub daily_loss_limit_krw: f64,

    /// Bounds the AI operator's `orderAmountKrw` (clamp range).
    #[serde(default = "default_min_order_amount_krw")]
    pub min_order_amount_krw: f64,
    #[serde(default = "default_max_order_amount_krw")]
    pub max_order_amount_krw: f64,

    // Hard caps applied only when the evaluation context is AI-selected.
    #[serde(default = "default_ai_max_order_notional_krw")]
    pub ai_max_order_notional_krw: f64,
    #[serde(default = "default_ai_max_orders_per_window")]
    pub ai_max_orders_per_window: usize,
    #[serde(default = "default_ai_order_count_window_sec")]
    pub ai_order_count_window_sec: u64,
    #[serde(default = "default_ai_max_total_exposure_krw")]
    pub ai_max_total_exposure_krw: f64,

    #[serde(default = "default_unknown_submit_max_age_sec")]
    pub unknown_submit_max_age_sec: u64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty RiskLimits deserializes")
    }
}

/// Per-second sliding-window request caps and retry policy for the exchange
/// client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default = "default_public_requests_per_sec")]
    pub public_requests_per_sec: usize,
    #[serde(default = "default_private_requests_per_sec")]
    pub private_requests_per_sec: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_request_timeout_sec")]
    pub request_timeout_sec: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty ExchangeConfig deserializes")
    }
}

/// Per-collection caps applied after every state update when
/// `keep_latest_only` is set. Open orders are always preserved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_true")]
    pub keep_latest_only: bool,
    #[serde(default = "default_closed_orders")]
    pub closed_orders: usize,
    #[serde(default = "default_order_events")]
    pub order_events: usize,
    #[serde(default = "default_fills")]
    pub fills: usize,
    #[serde(default = "default_strategy_runs")]
    pub strategy_runs: usize,
    #[serde(default = "default_balances_snapshots")]
    pub balances_snapshots: usize,
    #[serde(default = "default_risk_events")]
    pub risk_events: usize,
    #[serde(default = "default_system_health")]
    pub system_health: usize,
    #[serde(default = "default_agent_audit")]
    pub agent_audit: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty RetentionConfig deserializes")
    }
}

/// Market-universe selection criteria.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniverseConfig {
    #[serde(default = "default_quote")]
    pub quote: String,
    /// Base currencies always admitted regardless of the 24h-value threshold.
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default = "default_min_acc_trade_value_24h")]
    pub min_acc_trade_value_24h: f64,
    #[serde(default = "default_min_base_len")]
    pub min_base_len: usize,
    #[serde(default = "default_max_universe_symbols")]
    pub max_symbols: usize,
    #[serde(default = "default_universe_refresh_sec")]
    pub refresh_sec: u64,
}

impl Default for UniverseConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty UniverseConfig deserializes")
    }
}

/// Auto-recovery policy for direct order placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_recovery_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_recovery_failure_window_sec")]
    pub failure_window_sec: u64,
    #[serde(default = "default_recovery_failure_threshold")]
    pub failure_threshold: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty RecoveryConfig deserializes")
    }
}

// =============================================================================
// TradingConfig
// =============================================================================

/// Top-level runtime configuration for the Tidal engine.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Master switch for the execution service.
    #[serde(default = "default_true")]
    pub execution_enabled: bool,

    /// Paper mode simulates fills locally; no request reaches the exchange.
    #[serde(default = "default_true")]
    pub paper_mode: bool,

    #[serde(default = "default_symbol")]
    pub symbol: String,

    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Quote-currency budget per order before risk/overlay scaling.
    #[serde(default = "default_order_amount_krw")]
    pub order_amount_krw: f64,

    #[serde(default = "default_window_sec")]
    pub window_sec: u64,

    #[serde(default = "default_cooldown_sec")]
    pub cooldown_sec: u64,

    /// Sleep between execution windows.
    #[serde(default = "default_restart_delay_sec")]
    pub restart_delay_sec: u64,

    /// "completed" windows are logged at least every N windows even when no
    /// activity occurred.
    #[serde(default = "default_heartbeat_every_windows")]
    pub heartbeat_every_windows: u64,

    /// AI-settings re-read cadence, randomized per refresh to avoid
    /// synchronized thundering herds across replicas.
    #[serde(default = "default_ai_refresh_min_sec")]
    pub ai_refresh_min_sec: u64,
    #[serde(default = "default_ai_refresh_max_sec")]
    pub ai_refresh_max_sec: u64,

    /// Wall-clock offset for daily-PnL date rollover (KST).
    #[serde(default = "default_tz_offset_hours")]
    pub tz_offset_hours: i32,

    #[serde(default)]
    pub risk: RiskLimits,

    #[serde(default)]
    pub exchange: ExchangeConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub universe: UniverseConfig,

    #[serde(default)]
    pub recovery: RecoveryConfig,

    // --- File paths ----------------------------------------------------------
    #[serde(default = "default_state_file")]
    pub state_file: String,
    #[serde(default = "default_ai_settings_file")]
    pub ai_settings_file: String,
    #[serde(default = "default_overlay_file")]
    pub overlay_file: String,
    #[serde(default = "default_universe_file")]
    pub universe_snapshot_file: String,
    #[serde(default = "default_audit_log_file")]
    pub audit_log_file: String,
    #[serde(default = "default_audit_max_bytes")]
    pub audit_max_bytes: u64,
    #[serde(default = "default_audit_prune_ratio")]
    pub audit_prune_ratio: f64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty TradingConfig deserializes")
    }
}

impl TradingConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            paper_mode = config.paper_mode,
            "trading config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "trading config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = TradingConfig::default();
        assert!(cfg.execution_enabled);
        assert!(cfg.paper_mode);
        assert_eq!(cfg.symbol, "BTC_KRW");
        assert_eq!(cfg.symbols, vec!["BTC_KRW"]);
        assert!((cfg.order_amount_krw - 10_000.0).abs() < f64::EPSILON);
        assert_eq!(cfg.window_sec, 60);
        assert_eq!(cfg.heartbeat_every_windows, 12);
        assert_eq!(cfg.ai_refresh_min_sec, 1800);
        assert_eq!(cfg.ai_refresh_max_sec, 3600);
        assert_eq!(cfg.risk.max_concurrent_orders, 5);
        assert!((cfg.risk.min_order_notional_krw - 5_000.0).abs() < f64::EPSILON);
        assert_eq!(cfg.exchange.public_requests_per_sec, 150);
        assert_eq!(cfg.exchange.private_requests_per_sec, 140);
        assert_eq!(cfg.retention.closed_orders, 200);
        assert_eq!(cfg.universe.min_base_len, 2);
        assert_eq!(cfg.recovery.failure_threshold, 3);
        assert_eq!(cfg.tz_offset_hours, 9);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "paper_mode": false, "symbols": ["ETH_KRW"], "risk": { "max_order_notional_krw": 2000000 } }"#;
        let cfg: TradingConfig = serde_json::from_str(json).unwrap();
        assert!(!cfg.paper_mode);
        assert_eq!(cfg.symbols, vec!["ETH_KRW"]);
        assert!((cfg.risk.max_order_notional_krw - 2_000_000.0).abs() < f64::EPSILON);
        // Untouched sections keep defaults.
        assert_eq!(cfg.risk.max_concurrent_orders, 5);
        assert_eq!(cfg.exchange.max_attempts, 3);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = TradingConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: TradingConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbols, cfg2.symbols);
        assert_eq!(cfg.retention.order_events, cfg2.retention.order_events);
        assert_eq!(cfg.state_file, cfg2.state_file);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut cfg = TradingConfig::default();
        cfg.symbols = vec!["XRP_KRW".to_string(), "BTC_KRW".to_string()];
        cfg.save(&path).unwrap();

        let loaded = TradingConfig::load(&path).unwrap();
        assert_eq!(loaded.symbols, cfg.symbols);
    }
}
