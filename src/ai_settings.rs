// =============================================================================
// AI-operator settings — tolerant file reader with clamped validation
// =============================================================================
//
// An external AI agent steers the engine by writing a JSON settings file. The
// reader never fails: a missing file produces a template, a malformed file
// produces the defaults snapshot tagged `read_error_fallback` (logged once per
// distinct error), and out-of-contract values are clamped into their safe
// ranges with a warning.
// =============================================================================

use std::collections::HashSet;
use std::path::PathBuf;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::TradingConfig;
use crate::decision::DecisionPolicy;
use crate::symbol::{CandleInterval, Symbol};

// -----------------------------------------------------------------------------
// Snapshot types
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSettings {
    pub enabled: bool,
    pub symbol: String,
    pub symbols: Vec<String>,
    pub order_amount_krw: f64,
    pub window_sec: u64,
    pub cooldown_sec: u64,
    pub max_symbols_per_window: usize,
    pub max_order_attempts_per_window: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyName {
    RiskManagedMomentum,
    Breakout,
}

impl std::fmt::Display for StrategyName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RiskManagedMomentum => write!(f, "risk_managed_momentum"),
            Self::Breakout => write!(f, "breakout"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategySettings {
    pub name: StrategyName,
    pub candle_interval: CandleInterval,
    pub momentum_lookback: usize,
    pub volatility_lookback: usize,
    pub momentum_entry_bps: f64,
    pub momentum_exit_bps: f64,
    pub target_volatility_pct: f64,
    pub risk_managed_min_multiplier: f64,
    pub risk_managed_max_multiplier: f64,
    pub breakout_lookback: usize,
    pub breakout_buffer_bps: f64,
}

/// Externally-set risk overlay scaling order sizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskOverlay {
    pub risk_multiplier: f64,
    #[serde(default)]
    pub regime: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlSettings {
    #[serde(default)]
    pub kill_switch: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AiSettingsSnapshot {
    /// "file", "defaults", or "read_error_fallback".
    pub source: String,
    pub loaded_at: String,
    pub meta: serde_json::Value,
    pub execution: ExecutionSettings,
    pub strategy: StrategySettings,
    pub decision: DecisionPolicy,
    pub overlay: Option<RiskOverlay>,
    pub controls: ControlSettings,
}

// -----------------------------------------------------------------------------
// Source
// -----------------------------------------------------------------------------

/// Engine-side defaults the validator falls back to and clamps against.
#[derive(Debug, Clone)]
struct Defaults {
    symbol: String,
    symbols: Vec<String>,
    order_amount_krw: f64,
    window_sec: u64,
    cooldown_sec: u64,
    amount_min_krw: f64,
    amount_max_krw: f64,
}

pub struct AiSettingsSource {
    settings_path: PathBuf,
    overlay_path: PathBuf,
    defaults: Defaults,
    logged_errors: Mutex<HashSet<String>>,
}

impl AiSettingsSource {
    pub fn new(config: &TradingConfig) -> Self {
        Self {
            settings_path: PathBuf::from(&config.ai_settings_file),
            overlay_path: PathBuf::from(&config.overlay_file),
            defaults: Defaults {
                symbol: config.symbol.clone(),
                symbols: config.symbols.clone(),
                order_amount_krw: config.order_amount_krw,
                window_sec: config.window_sec,
                cooldown_sec: config.cooldown_sec,
                amount_min_krw: config.risk.min_order_amount_krw,
                amount_max_krw: config.risk.max_order_amount_krw,
            },
            logged_errors: Mutex::new(HashSet::new()),
        }
    }

    #[cfg(test)]
    fn with_paths(
        mut self,
        settings: impl AsRef<std::path::Path>,
        overlay: impl AsRef<std::path::Path>,
    ) -> Self {
        self.settings_path = settings.as_ref().to_path_buf();
        self.overlay_path = overlay.as_ref().to_path_buf();
        self
    }

    /// The defaults snapshot the engine boots with before the first read.
    pub fn defaults(&self) -> AiSettingsSnapshot {
        self.default_snapshot("defaults")
    }

    /// Read, validate, and clamp the settings file. Never fails.
    pub fn load(&self) -> AiSettingsSnapshot {
        if !self.settings_path.exists() {
            if let Err(e) = self.write_template() {
                self.log_once(format!("template write failed: {e}"));
            } else {
                info!(path = %self.settings_path.display(), "AI settings template created");
            }
            return self.default_snapshot("defaults");
        }

        let content = match std::fs::read_to_string(&self.settings_path) {
            Ok(c) => c,
            Err(e) => {
                self.log_once(format!("settings read failed: {e}"));
                return self.default_snapshot("read_error_fallback");
            }
        };

        let root: serde_json::Value = match serde_json::from_str(&content) {
            Ok(v) => v,
            Err(e) => {
                self.log_once(format!("settings parse failed: {e}"));
                return self.default_snapshot("read_error_fallback");
            }
        };

        let execution = self.validate_execution(root.get("execution"));
        let strategy = self.validate_strategy(root.get("strategy"));
        let decision = self.validate_decision(root.get("decision"), execution.order_amount_krw);
        let overlay = self
            .validate_overlay(root.get("overlay"))
            .or_else(|| self.read_overlay_file());
        let controls = ControlSettings {
            kill_switch: root
                .get("controls")
                .and_then(|c| c.get("killSwitch"))
                .and_then(|v| v.as_bool()),
        };

        AiSettingsSnapshot {
            source: "file".to_string(),
            loaded_at: Utc::now().to_rfc3339(),
            meta: root.get("meta").cloned().unwrap_or(serde_json::Value::Null),
            execution,
            strategy,
            decision,
            overlay,
            controls,
        }
    }

    // -------------------------------------------------------------------------
    // Group validators
    // -------------------------------------------------------------------------

    fn validate_execution(&self, group: Option<&serde_json::Value>) -> ExecutionSettings {
        let d = &self.defaults;
        let symbol = group
            .and_then(|g| g.get("symbol"))
            .and_then(|v| v.as_str())
            .and_then(|s| match Symbol::normalize(s) {
                Ok(sym) => Some(sym.as_str().to_string()),
                Err(e) => {
                    warn!(input = s, error = %e, "execution.symbol invalid — using default");
                    None
                }
            })
            .unwrap_or_else(|| d.symbol.clone());

        let symbols = group
            .and_then(|g| g.get("symbols"))
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str())
                    .filter_map(|s| match Symbol::normalize(s) {
                        Ok(sym) => Some(sym.as_str().to_string()),
                        Err(e) => {
                            warn!(input = s, error = %e, "execution.symbols entry invalid — dropped");
                            None
                        }
                    })
                    .collect::<Vec<_>>()
            })
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| vec![symbol.clone()]);

        ExecutionSettings {
            enabled: group
                .and_then(|g| g.get("enabled"))
                .and_then(|v| v.as_bool())
                .unwrap_or(true),
            symbol,
            symbols,
            order_amount_krw: self.clamp_f64(
                group,
                "execution",
                "orderAmountKrw",
                d.order_amount_krw,
                d.amount_min_krw,
                d.amount_max_krw,
            ),
            window_sec: self.clamp_u64(group, "execution", "windowSec", d.window_sec, 5, 86_400),
            cooldown_sec: self.clamp_u64(group, "execution", "cooldownSec", d.cooldown_sec, 0, 600),
            max_symbols_per_window: self.clamp_u64(group, "execution", "maxSymbolsPerWindow", 3, 1, 20)
                as usize,
            max_order_attempts_per_window: self.clamp_u64(
                group,
                "execution",
                "maxOrderAttemptsPerWindow",
                1,
                1,
                20,
            ) as u32,
        }
    }

    fn validate_strategy(&self, group: Option<&serde_json::Value>) -> StrategySettings {
        let name = group
            .and_then(|g| g.get("name"))
            .and_then(|v| v.as_str())
            .and_then(|s| match s {
                "risk_managed_momentum" => Some(StrategyName::RiskManagedMomentum),
                "breakout" => Some(StrategyName::Breakout),
                other => {
                    warn!(input = other, "strategy.name unrecognized — using default");
                    None
                }
            })
            .unwrap_or(StrategyName::RiskManagedMomentum);

        let candle_interval = group
            .and_then(|g| g.get("candleInterval"))
            .and_then(|v| v.as_str())
            .and_then(|s| match CandleInterval::parse(s) {
                Ok(iv) => Some(iv),
                Err(e) => {
                    warn!(input = s, error = %e, "strategy.candleInterval invalid — using default");
                    None
                }
            })
            .unwrap_or(CandleInterval::Min15);

        let momentum_lookback =
            self.clamp_u64(group, "strategy", "momentumLookback", 24, 12, 72) as usize;
        let volatility_lookback =
            self.clamp_u64(group, "strategy", "volatilityLookback", 72, 48, 144) as usize;

        StrategySettings {
            name,
            candle_interval,
            momentum_lookback,
            volatility_lookback,
            momentum_entry_bps: self.clamp_f64(group, "strategy", "momentumEntryBps", 12.0, 6.0, 30.0),
            momentum_exit_bps: self.clamp_f64(group, "strategy", "momentumExitBps", 8.0, 4.0, 20.0),
            target_volatility_pct: self.clamp_f64(
                group,
                "strategy",
                "targetVolatilityPct",
                0.6,
                0.30,
                1.20,
            ),
            risk_managed_min_multiplier: self.clamp_f64(
                group,
                "strategy",
                "riskManagedMinMultiplier",
                0.6,
                0.40,
                1.00,
            ),
            risk_managed_max_multiplier: self.clamp_f64(
                group,
                "strategy",
                "riskManagedMaxMultiplier",
                2.2,
                1.20,
                2.50,
            ),
            breakout_lookback: self.clamp_u64(group, "strategy", "breakoutLookback", 20, 10, 60)
                as usize,
            breakout_buffer_bps: self.clamp_f64(group, "strategy", "breakoutBufferBps", 10.0, 2.0, 50.0),
        }
    }

    fn validate_decision(
        &self,
        group: Option<&serde_json::Value>,
        order_amount_krw: f64,
    ) -> DecisionPolicy {
        let Some(raw) = group else {
            return DecisionPolicy::default();
        };

        // The file spells actions in uppercase while the engine's Side is
        // lowercase; normalize before the typed parse. Per-symbol keys are
        // normalized to canonical form.
        let mut value = raw.clone();
        lower_force_action(&mut value);
        if let Some(symbols) = value.get_mut("symbols").and_then(|v| v.as_object_mut()) {
            let entries: Vec<(String, serde_json::Value)> = symbols
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            symbols.clear();
            for (key, mut entry) in entries {
                lower_force_action(&mut entry);
                match Symbol::normalize(&key) {
                    Ok(sym) => {
                        symbols.insert(sym.as_str().to_string(), entry);
                    }
                    Err(e) => {
                        warn!(input = %key, error = %e, "decision.symbols key invalid — dropped");
                    }
                }
            }
        }

        let mut policy: DecisionPolicy = match serde_json::from_value(value) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "decision group invalid — using default policy");
                return DecisionPolicy::default();
            }
        };

        // forceAmountKrw clamps to [max(riskMin, order * 0.1), order * 50].
        let force_min = self.defaults.amount_min_krw.max(order_amount_krw * 0.1);
        let force_max = order_amount_krw * 50.0;
        if let Some(amount) = policy.force_amount_krw {
            let clamped = amount.clamp(force_min, force_max);
            if (clamped - amount).abs() > f64::EPSILON {
                warn!(
                    key = "decision.forceAmountKrw",
                    value = amount,
                    min = force_min,
                    max = force_max,
                    "value out of safe range — clamped"
                );
            }
            policy.force_amount_krw = Some(clamped);
        }
        for entry in policy.symbols.values_mut() {
            if let Some(amount) = entry.force_amount_krw {
                entry.force_amount_krw = Some(amount.clamp(force_min, force_max));
            }
        }

        policy
    }

    fn validate_overlay(&self, group: Option<&serde_json::Value>) -> Option<RiskOverlay> {
        let raw = group?;
        let mut overlay: RiskOverlay = match serde_json::from_value(raw.clone()) {
            Ok(o) => o,
            Err(e) => {
                warn!(error = %e, "overlay group invalid — ignored");
                return None;
            }
        };
        let clamped = overlay.risk_multiplier.clamp(0.1, 3.0);
        if (clamped - overlay.risk_multiplier).abs() > f64::EPSILON {
            warn!(
                key = "overlay.riskMultiplier",
                value = overlay.risk_multiplier,
                "value out of safe range — clamped"
            );
        }
        overlay.risk_multiplier = clamped;
        Some(overlay)
    }

    /// The overlay may also arrive through its own file (possibly written
    /// concurrently); read it with the same tolerance.
    fn read_overlay_file(&self) -> Option<RiskOverlay> {
        if !self.overlay_path.exists() {
            return None;
        }
        let content = std::fs::read_to_string(&self.overlay_path).ok()?;
        match serde_json::from_str::<serde_json::Value>(&content) {
            Ok(value) => self.validate_overlay(Some(&value)),
            Err(e) => {
                self.log_once(format!("overlay parse failed: {e}"));
                None
            }
        }
    }

    // -------------------------------------------------------------------------
    // Defaults, template, helpers
    // -------------------------------------------------------------------------

    fn default_snapshot(&self, source: &str) -> AiSettingsSnapshot {
        let d = &self.defaults;
        AiSettingsSnapshot {
            source: source.to_string(),
            loaded_at: Utc::now().to_rfc3339(),
            meta: serde_json::Value::Null,
            execution: ExecutionSettings {
                enabled: true,
                symbol: d.symbol.clone(),
                symbols: if d.symbols.is_empty() {
                    vec![d.symbol.clone()]
                } else {
                    d.symbols.clone()
                },
                order_amount_krw: d
                    .order_amount_krw
                    .clamp(d.amount_min_krw, d.amount_max_krw),
                window_sec: d.window_sec.clamp(5, 86_400),
                cooldown_sec: d.cooldown_sec.min(600),
                max_symbols_per_window: 3,
                max_order_attempts_per_window: 1,
            },
            strategy: StrategySettings {
                name: StrategyName::RiskManagedMomentum,
                candle_interval: CandleInterval::Min15,
                momentum_lookback: 24,
                volatility_lookback: 72,
                momentum_entry_bps: 12.0,
                momentum_exit_bps: 8.0,
                target_volatility_pct: 0.6,
                risk_managed_min_multiplier: 0.6,
                risk_managed_max_multiplier: 2.2,
                breakout_lookback: 20,
                breakout_buffer_bps: 10.0,
            },
            decision: DecisionPolicy::default(),
            overlay: None,
            controls: ControlSettings::default(),
        }
    }

    fn write_template(&self) -> std::io::Result<()> {
        let snapshot = self.default_snapshot("defaults");
        let template = serde_json::json!({
            "version": 1,
            "updatedAt": Utc::now().to_rfc3339(),
            "meta": { "operator": "ai", "note": "edit and save; the engine re-reads periodically" },
            "execution": snapshot.execution,
            "strategy": snapshot.strategy,
            "decision": {
                "mode": "filter",
                "allowBuy": true,
                "allowSell": true,
                "forceAction": null,
                "forceOnce": true,
                "note": null
            },
            "controls": { "killSwitch": null }
        });
        let content = serde_json::to_string_pretty(&template).unwrap_or_default();
        let tmp = self.settings_path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.settings_path)
    }

    fn clamp_f64(
        &self,
        group: Option<&serde_json::Value>,
        group_name: &str,
        key: &str,
        default: f64,
        min: f64,
        max: f64,
    ) -> f64 {
        let value = group
            .and_then(|g| g.get(key))
            .and_then(|v| v.as_f64())
            .filter(|v| v.is_finite())
            .unwrap_or(default);
        let clamped = value.clamp(min, max);
        if (clamped - value).abs() > f64::EPSILON {
            warn!(
                key = format!("{group_name}.{key}"),
                value,
                min,
                max,
                "value out of safe range — clamped"
            );
        }
        clamped
    }

    fn clamp_u64(
        &self,
        group: Option<&serde_json::Value>,
        group_name: &str,
        key: &str,
        default: u64,
        min: u64,
        max: u64,
    ) -> u64 {
        let value = group
            .and_then(|g| g.get(key))
            .and_then(|v| v.as_u64())
            .unwrap_or(default);
        let clamped = value.clamp(min, max);
        if clamped != value {
            warn!(
                key = format!("{group_name}.{key}"),
                value,
                min,
                max,
                "value out of safe range — clamped"
            );
        }
        clamped
    }

    fn log_once(&self, message: String) {
        if self.logged_errors.lock().insert(message.clone()) {
            warn!(error = %message, "AI settings unavailable — falling back to defaults");
        }
    }

    #[cfg(test)]
    fn logged_error_count(&self) -> usize {
        self.logged_errors.lock().len()
    }
}

fn lower_force_action(value: &mut serde_json::Value) {
    if let Some(action) = value.get_mut("forceAction") {
        if let Some(s) = action.as_str() {
            *action = serde_json::Value::String(s.to_lowercase());
        }
    }
}
