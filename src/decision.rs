// =============================================================================
// Decision & execution policy — per-symbol mode resolution and force-once
// =============================================================================
//
// A decision snapshot carries top-level fields plus an optional per-symbol map
// of the same shape. Resolution starts from the top level and shallow-merges
// the symbol entry. Force-once consumption lives in memory only; it does not
// survive a restart.
// =============================================================================

use std::collections::{BTreeMap, HashSet};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::Side;

/// How signals and forced actions combine for a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionMode {
    /// Ignore signals entirely; act only on a forced action.
    Rule,
    /// Run the signal and gate it by allowBuy / allowSell.
    Filter,
    /// A forced action executes regardless of the signal.
    Override,
}

impl Default for DecisionMode {
    fn default() -> Self {
        Self::Filter
    }
}

fn default_true() -> bool {
    true
}

/// Top-level decision snapshot from the AI operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionPolicy {
    #[serde(default)]
    pub mode: DecisionMode,
    #[serde(default = "default_true")]
    pub allow_buy: bool,
    #[serde(default = "default_true")]
    pub allow_sell: bool,
    #[serde(default)]
    pub force_action: Option<Side>,
    #[serde(default)]
    pub force_amount_krw: Option<f64>,
    #[serde(default = "default_true")]
    pub force_once: bool,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub symbols: BTreeMap<String, DecisionOverride>,
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self {
            mode: DecisionMode::Filter,
            allow_buy: true,
            allow_sell: true,
            force_action: None,
            force_amount_krw: None,
            force_once: true,
            note: None,
            symbols: BTreeMap::new(),
        }
    }
}

/// Per-symbol shallow override; absent fields inherit from the top level.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionOverride {
    #[serde(default)]
    pub mode: Option<DecisionMode>,
    #[serde(default)]
    pub allow_buy: Option<bool>,
    #[serde(default)]
    pub allow_sell: Option<bool>,
    #[serde(default)]
    pub force_action: Option<Side>,
    #[serde(default)]
    pub force_amount_krw: Option<f64>,
    #[serde(default)]
    pub force_once: Option<bool>,
    #[serde(default)]
    pub note: Option<String>,
}

/// Effective policy for one symbol after the merge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedPolicy {
    pub mode: DecisionMode,
    pub allow_buy: bool,
    pub allow_sell: bool,
    pub force_action: Option<Side>,
    pub force_amount_krw: Option<f64>,
    pub force_once: bool,
    pub note: Option<String>,
}

impl DecisionPolicy {
    /// Resolve the policy for `symbol`: top-level defaults, shallow-overridden
    /// by the per-symbol entry when present.
    pub fn resolve(&self, symbol: &str) -> ResolvedPolicy {
        let entry = self.symbols.get(symbol);
        ResolvedPolicy {
            mode: entry.and_then(|e| e.mode).unwrap_or(self.mode),
            allow_buy: entry.and_then(|e| e.allow_buy).unwrap_or(self.allow_buy),
            allow_sell: entry.and_then(|e| e.allow_sell).unwrap_or(self.allow_sell),
            force_action: entry
                .and_then(|e| e.force_action)
                .or(self.force_action),
            force_amount_krw: entry
                .and_then(|e| e.force_amount_krw)
                .or(self.force_amount_krw),
            force_once: entry.and_then(|e| e.force_once).unwrap_or(self.force_once),
            note: entry
                .and_then(|e| e.note.clone())
                .or_else(|| self.note.clone()),
        }
    }
}

/// In-memory force-once consumption, keyed by symbol. Reset whenever a new
/// decision snapshot is applied.
#[derive(Default)]
pub struct ForceTracker {
    consumed: Mutex<HashSet<String>>,
}

impl ForceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the force for `symbol` has already been consumed this run.
    pub fn is_consumed(&self, symbol: &str) -> bool {
        self.consumed.lock().contains(symbol)
    }

    /// Mark the force consumed. Returns false if it already was.
    pub fn consume(&self, symbol: &str) -> bool {
        self.consumed.lock().insert(symbol.to_string())
    }

    /// Forget all consumption (called when a new decision snapshot arrives).
    pub fn reset(&self) {
        self.consumed.lock().clear();
    }
}
