// =============================================================================
// Market-universe curator — which symbols the scheduler may trade
// =============================================================================
//
// Periodically combines the venue's market listing (with warning flags) and
// 24h tickers into a curated snapshot. Selection is deterministic: the
// include list is admitted first, then the remaining markets by 24h traded
// value. A refresh failure keeps the previous snapshot.
// =============================================================================

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::UniverseConfig;
use crate::market::{MarketData, MarketInfo, TickerInfo};
use crate::symbol::Symbol;

pub const EXCLUDED_SHORT_BASE: &str = "short_base_symbol";
pub const EXCLUDED_MARKET_WARNING: &str = "market_warning";
pub const EXCLUDED_LOW_VALUE: &str = "low_24h_value";
pub const EXCLUDED_MAX_SYMBOLS: &str = "max_symbols";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketCandidate {
    pub symbol: String,
    pub market: String,
    pub last_price: f64,
    pub change_rate: f64,
    pub acc_trade_value_24h: f64,
    pub selection_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UniverseTotals {
    pub markets: usize,
    pub candidates: usize,
    pub selected: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketUniverseSnapshot {
    pub generated_at: String,
    pub quote: String,
    pub criteria: UniverseConfig,
    pub totals: UniverseTotals,
    pub symbols: Vec<String>,
    pub candidates: Vec<MarketCandidate>,
    pub excluded_counts: BTreeMap<String, u32>,
    pub next_refresh_sec: u64,
}

/// Pure selection over fetched markets + tickers. Deterministic and fully
/// testable without a network.
pub fn select_universe(
    markets: &[MarketInfo],
    tickers: &[TickerInfo],
    criteria: &UniverseConfig,
    now: DateTime<Utc>,
) -> MarketUniverseSnapshot {
    let prefix = format!("{}-", criteria.quote);
    let ticker_by_market: BTreeMap<&str, &TickerInfo> =
        tickers.iter().map(|t| (t.market.as_str(), t)).collect();

    let mut excluded: BTreeMap<String, u32> = BTreeMap::new();
    let mut included: Vec<MarketCandidate> = Vec::new();
    let mut by_value: Vec<MarketCandidate> = Vec::new();
    let mut quote_markets = 0usize;

    for market in markets {
        if !market.market.starts_with(&prefix) {
            continue;
        }
        quote_markets += 1;
        let base = &market.market[prefix.len()..];

        if base.len() < criteria.min_base_len {
            *excluded.entry(EXCLUDED_SHORT_BASE.to_string()).or_default() += 1;
            continue;
        }
        if market.warning {
            *excluded
                .entry(EXCLUDED_MARKET_WARNING.to_string())
                .or_default() += 1;
            continue;
        }

        let ticker = ticker_by_market.get(market.market.as_str());
        let acc_value = ticker.map_or(0.0, |t| t.acc_trade_price_24h);
        let last_price = ticker.map_or(0.0, |t| t.trade_price);
        let change_rate = ticker.map_or(0.0, |t| t.signed_change_rate);

        let symbol = match Symbol::normalize(&market.market) {
            Ok(s) => s.as_str().to_string(),
            Err(_) => continue,
        };

        if criteria.include.iter().any(|b| b == base) {
            included.push(MarketCandidate {
                symbol,
                market: market.market.clone(),
                last_price,
                change_rate,
                acc_trade_value_24h: acc_value,
                selection_reason: "included".to_string(),
            });
        } else if acc_value >= criteria.min_acc_trade_value_24h {
            by_value.push(MarketCandidate {
                symbol,
                market: market.market.clone(),
                last_price,
                change_rate,
                acc_trade_value_24h: acc_value,
                selection_reason: "volume".to_string(),
            });
        } else {
            *excluded.entry(EXCLUDED_LOW_VALUE.to_string()).or_default() += 1;
        }
    }

    // Include-listed symbols keep their configured order; the rest rank by
    // traded value.
    included.sort_by_key(|c| {
        criteria
            .include
            .iter()
            .position(|b| Some(b.as_str()) == c.symbol.split('_').next())
            .unwrap_or(usize::MAX)
    });
    by_value.sort_by(|a, b| {
        b.acc_trade_value_24h
            .partial_cmp(&a.acc_trade_value_24h)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut candidates = included;
    candidates.extend(by_value);

    let candidate_count = candidates.len();
    if candidate_count > criteria.max_symbols {
        let overflow = (candidate_count - criteria.max_symbols) as u32;
        *excluded.entry(EXCLUDED_MAX_SYMBOLS.to_string()).or_default() += overflow;
        candidates.truncate(criteria.max_symbols);
    }

    let symbols: Vec<String> = candidates.iter().map(|c| c.symbol.clone()).collect();

    MarketUniverseSnapshot {
        generated_at: now.to_rfc3339(),
        quote: criteria.quote.clone(),
        criteria: criteria.clone(),
        totals: UniverseTotals {
            markets: quote_markets,
            candidates: candidate_count,
            selected: symbols.len(),
        },
        symbols,
        candidates,
        excluded_counts: excluded,
        next_refresh_sec: criteria.refresh_sec,
    }
}

/// Atomic snapshot write (`.tmp → rename`), matching the state-file pattern.
pub fn write_snapshot(path: &Path, snapshot: &MarketUniverseSnapshot) -> Result<()> {
    let content =
        serde_json::to_string_pretty(snapshot).context("failed to serialise universe snapshot")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, content)
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename universe snapshot to {}", path.display()))?;
    Ok(())
}

/// Stateful curator owned by the scheduler.
pub struct MarketUniverse {
    market: Arc<MarketData>,
    criteria: UniverseConfig,
    snapshot_path: PathBuf,
    cached: RwLock<Option<MarketUniverseSnapshot>>,
    next_refresh_at: Mutex<Option<Instant>>,
}

impl MarketUniverse {
    pub fn new(market: Arc<MarketData>, criteria: UniverseConfig, snapshot_path: PathBuf) -> Self {
        Self {
            market,
            criteria,
            snapshot_path,
            cached: RwLock::new(None),
            next_refresh_at: Mutex::new(None),
        }
    }

    /// Refresh when due. A failed refresh logs and keeps the old snapshot.
    pub async fn refresh_if_due(&self) -> bool {
        {
            let next = self.next_refresh_at.lock();
            if let Some(at) = *next {
                if Instant::now() < at {
                    return false;
                }
            }
        }

        match self.refresh().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "market-universe refresh failed — reusing cached snapshot");
                false
            }
        }
    }

    pub async fn refresh(&self) -> Result<()> {
        // Schedule the next attempt up front so a failing venue is not
        // hammered every window.
        *self.next_refresh_at.lock() =
            Some(Instant::now() + std::time::Duration::from_secs(self.criteria.refresh_sec));

        let markets = self
            .market
            .get_markets()
            .await
            .context("universe: market listing fetch failed")?;

        let prefix = format!("{}-", self.criteria.quote);
        let quote_symbols: Vec<Symbol> = markets
            .iter()
            .filter(|m| m.market.starts_with(&prefix))
            .filter_map(|m| Symbol::normalize(&m.market).ok())
            .collect();
        if quote_symbols.is_empty() {
            anyhow::bail!("universe: no {} markets listed", self.criteria.quote);
        }

        let tickers = self
            .market
            .get_tickers(&quote_symbols)
            .await
            .context("universe: ticker fetch failed")?;

        let snapshot = select_universe(&markets, &tickers, &self.criteria, Utc::now());
        info!(
            selected = snapshot.totals.selected,
            candidates = snapshot.totals.candidates,
            markets = snapshot.totals.markets,
            "market universe refreshed"
        );

        if let Err(e) = write_snapshot(&self.snapshot_path, &snapshot) {
            warn!(error = %e, "failed to persist universe snapshot");
        }
        *self.cached.write() = Some(snapshot);
        Ok(())
    }

    /// Filter a requested symbol list through the cached snapshot. Before the
    /// first successful refresh everything passes through.
    pub fn filter_symbols(&self, requested: &[Symbol]) -> Vec<Symbol> {
        let cached = self.cached.read();
        match cached.as_ref() {
            None => requested.to_vec(),
            Some(snapshot) => {
                let filtered: Vec<Symbol> = requested
                    .iter()
                    .filter(|s| snapshot.symbols.iter().any(|u| u == s.as_str()))
                    .cloned()
                    .collect();
                debug!(
                    requested = requested.len(),
                    surviving = filtered.len(),
                    "universe filter applied"
                );
                filtered
            }
        }
    }

    pub fn snapshot(&self) -> Option<MarketUniverseSnapshot> {
        self.cached.read().clone()
    }

    #[cfg(test)]
    pub fn set_cached(&self, snapshot: MarketUniverseSnapshot) {
        *self.cached.write() = Some(snapshot);
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn market(code: &str, warning: bool) -> MarketInfo {
        MarketInfo {
            market: code.to_string(),
            warning,
        }
    }

    fn ticker(code: &str, acc_value: f64) -> TickerInfo {
        TickerInfo {
            symbol: Symbol::normalize(code).unwrap().as_str().to_string(),
            market: code.to_string(),
            trade_price: 1000.0,
            signed_change_rate: 0.01,
            acc_trade_price_24h: acc_value,
        }
    }

    fn criteria() -> UniverseConfig {
        UniverseConfig {
            quote: "KRW".to_string(),
            include: vec!["BTC".into(), "ETH".into(), "USDT".into()],
            min_acc_trade_value_24h: 2e10,
            min_base_len: 2,
            max_symbols: 4,
            refresh_sec: 600,
        }
    }

    fn now() -> DateTime<Utc> {
        "2026-03-01T09:00:00Z".parse().unwrap()
    }

    #[test]
    fn selection_matches_reference_scenario() {
        let markets = vec![
            market("KRW-BTC", false),
            market("KRW-ETH", false),
            market("KRW-USDT", false),
            market("KRW-XRP", false),
            market("KRW-DOGE", false),
            market("KRW-A", false),
            market("KRW-WARN", true),
        ];
        let tickers = vec![
            ticker("KRW-BTC", 9e10),
            ticker("KRW-ETH", 7e10),
            // Below the value threshold, admitted via the include list.
            ticker("KRW-USDT", 1.5e10),
            ticker("KRW-XRP", 2.5e10),
            ticker("KRW-DOGE", 1e10),
            ticker("KRW-A", 5e10),
            ticker("KRW-WARN", 5e10),
        ];

        let snapshot = select_universe(&markets, &tickers, &criteria(), now());

        assert_eq!(
            snapshot.symbols,
            vec!["BTC_KRW", "ETH_KRW", "USDT_KRW", "XRP_KRW"]
        );
        assert_eq!(snapshot.excluded_counts.get(EXCLUDED_SHORT_BASE), Some(&1));
        assert_eq!(
            snapshot.excluded_counts.get(EXCLUDED_MARKET_WARNING),
            Some(&1)
        );
        assert_eq!(snapshot.excluded_counts.get(EXCLUDED_LOW_VALUE), Some(&1));
        assert_eq!(snapshot.totals.markets, 7);
        assert_eq!(snapshot.totals.selected, 4);

        let usdt = snapshot
            .candidates
            .iter()
            .find(|c| c.symbol == "USDT_KRW")
            .unwrap();
        assert_eq!(usdt.selection_reason, "included");
        let xrp = snapshot
            .candidates
            .iter()
            .find(|c| c.symbol == "XRP_KRW")
            .unwrap();
        assert_eq!(xrp.selection_reason, "volume");
    }

    #[test]
    fn overflow_beyond_max_symbols_is_counted() {
        let markets = vec![
            market("KRW-AAA", false),
            market("KRW-BBB", false),
            market("KRW-CCC", false),
        ];
        let tickers = vec![
            ticker("KRW-AAA", 9e10),
            ticker("KRW-BBB", 8e10),
            ticker("KRW-CCC", 7e10),
        ];
        let mut crit = criteria();
        crit.include = vec![];
        crit.max_symbols = 2;

        let snapshot = select_universe(&markets, &tickers, &crit, now());
        assert_eq!(snapshot.symbols, vec!["AAA_KRW", "BBB_KRW"]);
        assert_eq!(snapshot.excluded_counts.get(EXCLUDED_MAX_SYMBOLS), Some(&1));
        assert_eq!(snapshot.totals.candidates, 3);
    }

    #[test]
    fn non_quote_markets_are_ignored() {
        let markets = vec![market("BTC-ETH", false), market("KRW-BTC", false)];
        let tickers = vec![ticker("KRW-BTC", 9e10)];
        let snapshot = select_universe(&markets, &tickers, &criteria(), now());
        assert_eq!(snapshot.totals.markets, 1);
        assert_eq!(snapshot.symbols, vec!["BTC_KRW"]);
    }

    #[test]
    fn filter_passes_through_until_first_refresh() {
        let client = Arc::new(crate::upbit::client::UpbitClient::new(
            "access",
            "secret",
            &crate::config::ExchangeConfig::default(),
            Arc::new(crate::upbit::rate_limit::RateLimits::new(10, 10)),
            None,
        ));
        let dir = tempfile::tempdir().unwrap();
        let universe = MarketUniverse::new(
            Arc::new(crate::market::MarketData::new(client)),
            criteria(),
            dir.path().join("universe.json"),
        );

        let requested = vec![
            Symbol::normalize("BTC_KRW").unwrap(),
            Symbol::normalize("DOGE_KRW").unwrap(),
        ];
        // No snapshot yet: everything passes through.
        assert_eq!(universe.filter_symbols(&requested), requested);

        // With a cached snapshot only its symbols survive.
        universe.set_cached(select_universe(
            &[market("KRW-BTC", false), market("KRW-ETH", false)],
            &[ticker("KRW-BTC", 9e10), ticker("KRW-ETH", 8e10)],
            &criteria(),
            now(),
        ));
        let filtered = universe.filter_symbols(&requested);
        assert_eq!(filtered, vec![Symbol::normalize("BTC_KRW").unwrap()]);
    }

    #[test]
    fn snapshot_write_is_atomic_and_reparseable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("universe.json");
        let snapshot = select_universe(
            &[market("KRW-BTC", false)],
            &[ticker("KRW-BTC", 9e10)],
            &criteria(),
            now(),
        );

        write_snapshot(&path, &snapshot).unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        let reparsed: MarketUniverseSnapshot = serde_json::from_str(&raw).unwrap();
        assert_eq!(reparsed.symbols, snapshot.symbols);
        assert_eq!(reparsed.next_refresh_sec, 600);
        assert!(!dir.path().join("universe.json.tmp").exists());
    }
}
