// =============================================================================
// Market-data facade — candles, tickers, markets, account preflight
// =============================================================================
//
// Sits on top of the exchange client and converts wire payloads into the
// engine's types. The candle endpoint returns newest-first; the facade
// reverses into strictly ascending order and validates the series.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::store::model::{BalanceItem, BalancesSnapshot};
use crate::symbol::{CandleInterval, Symbol};
use crate::upbit::client::UpbitClient;
use crate::upbit::error::ExchangeError;
use crate::upbit::ws::{TickerStream, TickerStreamOptions, DEFAULT_WS_URL};

/// A single OHLC candle, timestamps in epoch milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// Validate a candle series: strictly ascending timestamps, positive closes,
/// `high >= low`.
pub fn validate_series(candles: &[Candle]) -> Result<(), String> {
    for (i, c) in candles.iter().enumerate() {
        if c.close <= 0.0 {
            return Err(format!("candle {i} has non-positive close {}", c.close));
        }
        if c.high < c.low {
            return Err(format!("candle {i} has high {} < low {}", c.high, c.low));
        }
        if i > 0 && candles[i - 1].timestamp_ms >= c.timestamp_ms {
            return Err(format!(
                "candle {i} timestamp {} not ascending after {}",
                c.timestamp_ms,
                candles[i - 1].timestamp_ms
            ));
        }
    }
    Ok(())
}

/// Ticker summary for one market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerInfo {
    pub symbol: String,
    pub market: String,
    pub trade_price: f64,
    pub signed_change_rate: f64,
    pub acc_trade_price_24h: f64,
}

/// One listed market with its warning flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketInfo {
    pub market: String,
    pub warning: bool,
}

/// Candle access seam consumed by the realtime run (tests inject a fixture).
#[async_trait]
pub trait CandleSource: Send + Sync {
    async fn recent_candles(
        &self,
        symbol: &Symbol,
        interval: CandleInterval,
        count: u32,
    ) -> Result<Vec<Candle>, ExchangeError>;
}

/// Concrete facade over the REST client + WebSocket stream.
pub struct MarketData {
    client: Arc<UpbitClient>,
    ws_url: String,
}

impl MarketData {
    pub fn new(client: Arc<UpbitClient>) -> Self {
        Self {
            client,
            ws_url: DEFAULT_WS_URL.to_string(),
        }
    }

    // -------------------------------------------------------------------------
    // Candles
    // -------------------------------------------------------------------------

    pub async fn get_candles(
        &self,
        symbol: &Symbol,
        interval: CandleInterval,
        count: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let raw = self.client.get_candles(symbol, interval, count).await?;
        let arr = raw
            .as_array()
            .ok_or_else(|| ExchangeError::Decode("candle response is not an array".into()))?;

        let mut candles = Vec::with_capacity(arr.len());
        for entry in arr {
            candles.push(parse_candle(entry)?);
        }
        // Wire order is newest-first.
        candles.reverse();

        validate_series(&candles).map_err(ExchangeError::Decode)?;
        debug!(symbol = %symbol, interval = %interval, count = candles.len(), "candles fetched");
        Ok(candles)
    }

    // -------------------------------------------------------------------------
    // Tickers & markets
    // -------------------------------------------------------------------------

    pub async fn get_tickers(
        &self,
        symbols: &[Symbol],
    ) -> Result<Vec<TickerInfo>, ExchangeError> {
        let raw = self.client.get_tickers(symbols).await?;
        let arr = raw
            .as_array()
            .ok_or_else(|| ExchangeError::Decode("ticker response is not an array".into()))?;
        arr.iter().map(parse_ticker).collect()
    }

    pub async fn get_markets(&self) -> Result<Vec<MarketInfo>, ExchangeError> {
        let raw = self.client.get_markets().await?;
        let arr = raw
            .as_array()
            .ok_or_else(|| ExchangeError::Decode("market response is not an array".into()))?;
        Ok(arr.iter().filter_map(parse_market).collect())
    }

    // -------------------------------------------------------------------------
    // Account preflight
    // -------------------------------------------------------------------------

    /// Fetch account balances and shape them into a snapshot for the state
    /// store.
    pub async fn fetch_balances(&self) -> Result<BalancesSnapshot, ExchangeError> {
        let raw = self.client.get_accounts().await?;
        let arr = raw
            .as_array()
            .ok_or_else(|| ExchangeError::Decode("accounts response is not an array".into()))?;

        let items = arr
            .iter()
            .map(|entry| BalanceItem {
                currency: str_field(entry, "currency"),
                unit_currency: str_field(entry, "unit_currency"),
                balance: num_field(entry, "balance"),
                locked: num_field(entry, "locked"),
                avg_buy_price: num_field(entry, "avg_buy_price"),
            })
            .collect();

        Ok(BalancesSnapshot {
            captured_at: Utc::now().to_rfc3339(),
            source: "exchange".to_string(),
            items,
        })
    }

    // -------------------------------------------------------------------------
    // WebSocket ticker stream
    // -------------------------------------------------------------------------

    pub async fn open_ticker_stream(
        &self,
        opts: TickerStreamOptions,
    ) -> anyhow::Result<TickerStream> {
        TickerStream::open(&self.ws_url, opts).await
    }
}

#[async_trait]
impl CandleSource for MarketData {
    async fn recent_candles(
        &self,
        symbol: &Symbol,
        interval: CandleInterval,
        count: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        self.get_candles(symbol, interval, count).await
    }
}

// -----------------------------------------------------------------------------
// Wire parsing helpers
// -----------------------------------------------------------------------------

fn parse_candle(entry: &serde_json::Value) -> Result<Candle, ExchangeError> {
    let timestamp_ms = entry
        .get("timestamp")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| ExchangeError::Decode("candle missing 'timestamp'".into()))?;
    Ok(Candle {
        timestamp_ms,
        open: require_num(entry, "opening_price")?,
        high: require_num(entry, "high_price")?,
        low: require_num(entry, "low_price")?,
        close: require_num(entry, "trade_price")?,
    })
}

fn parse_ticker(entry: &serde_json::Value) -> Result<TickerInfo, ExchangeError> {
    let market = entry
        .get("market")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ExchangeError::Decode("ticker missing 'market'".into()))?
        .to_string();
    let symbol = Symbol::normalize(&market)
        .map_err(|e| ExchangeError::Decode(format!("bad market '{market}': {e}")))?;
    Ok(TickerInfo {
        symbol: symbol.as_str().to_string(),
        market,
        trade_price: require_num(entry, "trade_price")?,
        signed_change_rate: num_field(entry, "signed_change_rate"),
        acc_trade_price_24h: num_field(entry, "acc_trade_price_24h"),
    })
}

fn parse_market(entry: &serde_json::Value) -> Option<MarketInfo> {
    let market = entry.get("market")?.as_str()?.to_string();
    // Older payloads carry `market_warning: "CAUTION"`; newer ones nest
    // `market_event.warning: true`.
    let warning = entry
        .get("market_warning")
        .and_then(|v| v.as_str())
        .map(|s| s.eq_ignore_ascii_case("caution"))
        .or_else(|| {
            entry
                .get("market_event")
                .and_then(|e| e.get("warning"))
                .and_then(|v| v.as_bool())
        })
        .unwrap_or(false);
    Some(MarketInfo { market, warning })
}

fn require_num(entry: &serde_json::Value, key: &str) -> Result<f64, ExchangeError> {
    match entry.get(key) {
        Some(serde_json::Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| ExchangeError::Decode(format!("field '{key}' is not an f64"))),
        Some(serde_json::Value::String(s)) => s
            .parse::<f64>()
            .map_err(|_| ExchangeError::Decode(format!("field '{key}' is not numeric: {s}"))),
        _ => Err(ExchangeError::Decode(format!("missing field '{key}'"))),
    }
}

fn num_field(entry: &serde_json::Value, key: &str) -> f64 {
    require_num(entry, key).unwrap_or(0.0)
}

fn str_field(entry: &serde_json::Value, key: &str) -> String {
    entry
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn series_validation_catches_violations() {
        let good = vec![
            Candle { timestamp_ms: 1000, open: 10.0, high: 11.0, low: 9.0, close: 10.5 },
            Candle { timestamp_ms: 2000, open: 10.5, high: 12.0, low: 10.0, close: 11.0 },
        ];
        assert!(validate_series(&good).is_ok());

        let unordered = vec![good[1].clone(), good[0].clone()];
        assert!(validate_series(&unordered).is_err());

        let inverted = vec![Candle { timestamp_ms: 1000, open: 10.0, high: 9.0, low: 11.0, close: 10.0 }];
        assert!(validate_series(&inverted).is_err());

        let negative = vec![Candle { timestamp_ms: 1000, open: 10.0, high: 11.0, low: 9.0, close: -1.0 }];
        assert!(validate_series(&negative).is_err());
    }

    #[test]
    fn parse_candle_accepts_numeric_fields() {
        let entry = serde_json::json!({
            "market": "KRW-BTC",
            "timestamp": 1700000000000i64,
            "opening_price": 52000000.0,
            "high_price": 52100000.0,
            "low_price": 51900000.0,
            "trade_price": 52050000.0
        });
        let candle = parse_candle(&entry).unwrap();
        assert_eq!(candle.timestamp_ms, 1_700_000_000_000);
        assert!((candle.close - 52_050_000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn parse_market_reads_both_warning_shapes() {
        let legacy = serde_json::json!({ "market": "KRW-XYZ", "market_warning": "CAUTION" });
        assert!(parse_market(&legacy).unwrap().warning);

        let nested = serde_json::json!({ "market": "KRW-ABC", "market_event": { "warning": true } });
        assert!(parse_market(&nested).unwrap().warning);

        let clean = serde_json::json!({ "market": "KRW-BTC", "market_warning": "NONE" });
        assert!(!parse_market(&clean).unwrap().warning);
    }

    #[test]
    fn parse_ticker_normalizes_symbol() {
        let entry = serde_json::json!({
            "market": "KRW-ETH",
            "trade_price": 3000000.0,
            "signed_change_rate": 0.012,
            "acc_trade_price_24h": 1.5e11
        });
        let ticker = parse_ticker(&entry).unwrap();
        assert_eq!(ticker.symbol, "ETH_KRW");
        assert_eq!(ticker.market, "KRW-ETH");
    }
}
