// =============================================================================
// Upbit REST API Client — JWT-signed requests, retry, endpoint fallback
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. Private requests
// carry a JWT built from the access key, a UUID nonce, and a SHA-512 hash of
// the canonical query; the token itself never reaches a log line.
//
// Every HTTP attempt emits one RequestAuditEvent to the optional sink.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use rand::Rng;
use reqwest::Method;
use serde::Serialize;
use sha2::{Digest, Sha512};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::audit::{AuditSink, RequestAuditEvent};
use crate::config::ExchangeConfig;
use crate::symbol::{CandleInterval, Symbol};
use crate::types::{OrderType, Side};
use crate::upbit::error::ExchangeError;
use crate::upbit::rate_limit::RateLimits;

/// Primary and fallback order endpoints. The venue migrated its order routes
/// once; on 404/405/410 from the primary the client retries the fallback.
const PLACE_PATH: &str = "/v1/orders";
const PLACE_FALLBACK_PATH: &str = "/v1/orders/new";
const CANCEL_PATH: &str = "/v1/order";
const CANCEL_FALLBACK_PATH: &str = "/v1/orders/cancel";

/// Wire-level order placement request.
#[derive(Debug, Clone)]
pub struct PlaceOrderRequest {
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Option<f64>,
    pub qty: Option<f64>,
    /// Quote-currency amount, used by market buys.
    pub amount_krw: Option<f64>,
    pub client_order_key: Option<String>,
}

impl PlaceOrderRequest {
    /// Map to the venue's order body.
    ///
    /// | type + side   | ord_type | price        | volume | side |
    /// |---------------|----------|--------------|--------|------|
    /// | limit, buy    | limit    | price        | qty    | bid  |
    /// | limit, sell   | limit    | price        | qty    | ask  |
    /// | market, buy   | price    | quote amount | —      | bid  |
    /// | market, sell  | market   | —            | qty    | ask  |
    pub fn wire_body(&self) -> Result<serde_json::Value, ExchangeError> {
        let mut body = serde_json::Map::new();
        body.insert(
            "market".to_string(),
            serde_json::Value::String(self.symbol.to_wire()),
        );
        body.insert(
            "side".to_string(),
            serde_json::Value::String(
                match self.side {
                    Side::Buy => "bid",
                    Side::Sell => "ask",
                }
                .to_string(),
            ),
        );

        match (self.order_type, self.side) {
            (OrderType::Limit, _) => {
                let price = self.price.ok_or_else(|| {
                    ExchangeError::InvalidArgument("limit order requires price".into())
                })?;
                let qty = self.qty.ok_or_else(|| {
                    ExchangeError::InvalidArgument("limit order requires qty".into())
                })?;
                body.insert("ord_type".to_string(), "limit".into());
                body.insert("price".to_string(), format_number(price).into());
                body.insert("volume".to_string(), format_number(qty).into());
            }
            (OrderType::Market, Side::Buy) => {
                let amount = self.amount_krw.ok_or_else(|| {
                    ExchangeError::InvalidArgument("market buy requires amount_krw".into())
                })?;
                body.insert("ord_type".to_string(), "price".into());
                body.insert("price".to_string(), format_number(amount).into());
            }
            (OrderType::Market, Side::Sell) => {
                let qty = self.qty.ok_or_else(|| {
                    ExchangeError::InvalidArgument("market sell requires qty".into())
                })?;
                body.insert("ord_type".to_string(), "market".into());
                body.insert("volume".to_string(), format_number(qty).into());
            }
        }

        if let Some(key) = &self.client_order_key {
            body.insert("identifier".to_string(), key.clone().into());
        }

        Ok(serde_json::Value::Object(body))
    }
}

/// Render a price/volume as the venue's stringified decimal.
fn format_number(v: f64) -> String {
    if v == v.trunc() && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        let s = format!("{v:.8}");
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

#[derive(Serialize)]
struct AuthClaims<'a> {
    access_key: &'a str,
    nonce: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    query_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    query_hash_alg: Option<&'static str>,
}

/// Upbit REST client with JWT request signing, two sliding-window rate-limit
/// buckets, retry with exponential backoff, and endpoint fallback.
pub struct UpbitClient {
    access_key: String,
    secret_key: String,
    base_url: String,
    client: reqwest::Client,
    limits: Arc<RateLimits>,
    max_attempts: u32,
    base_delay_ms: u64,
    on_request_event: Option<AuditSink>,
}

impl UpbitClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    pub fn new(
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        config: &ExchangeConfig,
        limits: Arc<RateLimits>,
        on_request_event: Option<AuditSink>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_sec))
            .build()
            .expect("failed to build reqwest client");

        debug!("UpbitClient initialised (base_url=https://api.upbit.com)");

        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            base_url: "https://api.upbit.com".to_string(),
            client,
            limits,
            max_attempts: config.max_attempts.max(1),
            base_delay_ms: config.base_delay_ms.max(1),
            on_request_event,
        }
    }

    // -------------------------------------------------------------------------
    // Signing
    // -------------------------------------------------------------------------

    /// Build the Authorization token for a private request. `canonical` is the
    /// query string (or the body rendered as one); empty means no params.
    fn auth_token(&self, canonical: Option<&str>) -> Result<String, ExchangeError> {
        let (query_hash, query_hash_alg) = match canonical {
            Some(q) if !q.is_empty() => {
                let mut hasher = Sha512::new();
                hasher.update(q.as_bytes());
                (Some(hex::encode(hasher.finalize())), Some("SHA512"))
            }
            _ => (None, None),
        };

        let claims = AuthClaims {
            access_key: &self.access_key,
            nonce: Uuid::new_v4().to_string(),
            query_hash,
            query_hash_alg,
        };

        jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(self.secret_key.as_bytes()),
        )
        .map_err(|e| ExchangeError::Signing(e.to_string()))
    }

    /// Canonical `k=v&...` form of a JSON object body, key-sorted so the hash
    /// is stable regardless of map iteration order.
    fn canonical_body(body: &serde_json::Value) -> String {
        let Some(map) = body.as_object() else {
            return String::new();
        };
        let mut keys: Vec<&String> = map.keys().collect();
        keys.sort();
        keys.iter()
            .map(|k| {
                let v = &map[*k];
                let rendered = match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                format!("{k}={rendered}")
            })
            .collect::<Vec<_>>()
            .join("&")
    }

    // -------------------------------------------------------------------------
    // Core request path: rate limit -> send -> classify -> retry
    // -------------------------------------------------------------------------

    async fn request(
        &self,
        method: Method,
        path: &str,
        query: Option<String>,
        body: Option<serde_json::Value>,
        requires_auth: bool,
    ) -> Result<serde_json::Value, ExchangeError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let started = Instant::now();
            let outcome = self
                .send_once(method.clone(), path, query.as_deref(), body.as_ref(), requires_auth)
                .await;
            let duration_ms = started.elapsed().as_millis() as u64;

            self.emit_audit(&method, path, requires_auth, attempt, duration_ms, &outcome);

            match outcome {
                Ok((_, value)) => return Ok(value),
                Err(e) => {
                    if attempt >= self.max_attempts || !e.is_retryable() {
                        return Err(e);
                    }
                    let delay = self.backoff_delay_ms(attempt, e.retry_after_ms());
                    warn!(
                        path,
                        attempt,
                        delay_ms = delay,
                        error = %e,
                        "retryable exchange error — backing off"
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                }
            }
        }
    }

    async fn send_once(
        &self,
        method: Method,
        path: &str,
        query: Option<&str>,
        body: Option<&serde_json::Value>,
        requires_auth: bool,
    ) -> Result<(u16, serde_json::Value), ExchangeError> {
        if requires_auth {
            self.limits.private.take().await;
        } else {
            self.limits.public.take().await;
        }

        let url = match query {
            Some(q) if !q.is_empty() => format!("{}{}?{}", self.base_url, path, q),
            _ => format!("{}{}", self.base_url, path),
        };

        let mut req = self.client.request(method, &url);

        if requires_auth {
            let canonical = match (query, body) {
                (Some(q), _) => Some(q.to_string()),
                (None, Some(b)) => Some(Self::canonical_body(b)),
                (None, None) => None,
            };
            let token = self.auth_token(canonical.as_deref())?;
            req = req.bearer_auth(token);
        }

        if let Some(b) = body {
            req = req.json(b);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;

        let status = resp.status().as_u16();
        let retry_after_ms = resp
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(|secs| secs * 1000);

        let text = resp
            .text()
            .await
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;

        if !(200..300).contains(&status) {
            return Err(ExchangeError::Status {
                status,
                body: text,
                retry_after_ms,
            });
        }

        let value = if text.trim().is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&text).map_err(|e| ExchangeError::Decode(e.to_string()))?
        };

        Ok((status, value))
    }

    fn backoff_delay_ms(&self, attempt: u32, retry_after_ms: Option<u64>) -> u64 {
        let exp = self.base_delay_ms.saturating_mul(1u64 << (attempt - 1).min(8));
        let jitter = rand::thread_rng().gen_range(0..=self.base_delay_ms / 2 + 1);
        retry_after_ms.unwrap_or(0).max(exp + jitter)
    }

    fn emit_audit(
        &self,
        method: &Method,
        path: &str,
        requires_auth: bool,
        attempt: u32,
        duration_ms: u64,
        outcome: &Result<(u16, serde_json::Value), ExchangeError>,
    ) {
        let Some(sink) = &self.on_request_event else {
            return;
        };
        let event = match outcome {
            Ok((status, _)) => RequestAuditEvent {
                ts: Utc::now().to_rfc3339(),
                method: method.to_string(),
                path: path.to_string(),
                requires_auth,
                attempt,
                status: Some(*status),
                ok: true,
                duration_ms,
                retryable: None,
                error: None,
            },
            Err(e) => RequestAuditEvent {
                ts: Utc::now().to_rfc3339(),
                method: method.to_string(),
                path: path.to_string(),
                requires_auth,
                attempt,
                status: e.status(),
                ok: false,
                duration_ms,
                retryable: Some(e.is_retryable()),
                error: Some(e.to_string()),
            },
        };
        sink(event);
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// GET /v1/market/all — full market listing with warning details.
    pub async fn get_markets(&self) -> Result<serde_json::Value, ExchangeError> {
        self.request(
            Method::GET,
            "/v1/market/all",
            Some("isDetails=true".to_string()),
            None,
            false,
        )
        .await
    }

    /// GET /v1/ticker for a set of markets.
    pub async fn get_tickers(
        &self,
        symbols: &[Symbol],
    ) -> Result<serde_json::Value, ExchangeError> {
        if symbols.is_empty() {
            return Err(ExchangeError::InvalidArgument(
                "ticker request requires at least one symbol".into(),
            ));
        }
        let markets = symbols
            .iter()
            .map(Symbol::to_wire)
            .collect::<Vec<_>>()
            .join(",");
        self.request(
            Method::GET,
            "/v1/ticker",
            Some(format!("markets={markets}")),
            None,
            false,
        )
        .await
    }

    /// GET the candle endpoint for `interval` (newest-first on the wire).
    pub async fn get_candles(
        &self,
        symbol: &Symbol,
        interval: CandleInterval,
        count: u32,
    ) -> Result<serde_json::Value, ExchangeError> {
        let path = interval.endpoint_path();
        let query = format!("market={}&count={}", symbol.to_wire(), count.clamp(1, 200));
        self.request(Method::GET, &path, Some(query), None, false)
            .await
    }

    // -------------------------------------------------------------------------
    // Private endpoints
    // -------------------------------------------------------------------------

    /// GET /v1/accounts (signed).
    pub async fn get_accounts(&self) -> Result<serde_json::Value, ExchangeError> {
        self.request(Method::GET, "/v1/accounts", None, None, true)
            .await
    }

    /// POST the order body (signed), falling back once on 404/405/410.
    pub async fn place_order(
        &self,
        request: &PlaceOrderRequest,
    ) -> Result<serde_json::Value, ExchangeError> {
        let body = request.wire_body()?;
        debug!(
            symbol = %request.symbol,
            side = %request.side,
            order_type = %request.order_type,
            "placing order"
        );

        match self
            .request(Method::POST, PLACE_PATH, None, Some(body.clone()), true)
            .await
        {
            Err(e) if is_fallback_status(&e) => {
                warn!(path = PLACE_PATH, fallback = PLACE_FALLBACK_PATH, "order endpoint fallback");
                self.request(Method::POST, PLACE_FALLBACK_PATH, None, Some(body), true)
                    .await
            }
            other => other,
        }
    }

    /// DELETE the order (signed), falling back once on 404/405/410.
    pub async fn cancel_order(
        &self,
        exchange_order_id: &str,
    ) -> Result<serde_json::Value, ExchangeError> {
        let query = format!("uuid={exchange_order_id}");
        match self
            .request(Method::DELETE, CANCEL_PATH, Some(query.clone()), None, true)
            .await
        {
            Err(e) if is_fallback_status(&e) => {
                warn!(path = CANCEL_PATH, fallback = CANCEL_FALLBACK_PATH, "cancel endpoint fallback");
                self.request(Method::DELETE, CANCEL_FALLBACK_PATH, Some(query), None, true)
                    .await
            }
            other => other,
        }
    }

    /// GET /v1/order by client identifier — used to resolve UNKNOWN_SUBMIT.
    pub async fn get_order_by_identifier(
        &self,
        identifier: &str,
    ) -> Result<serde_json::Value, ExchangeError> {
        self.request(
            Method::GET,
            "/v1/order",
            Some(format!("identifier={identifier}")),
            None,
            true,
        )
        .await
    }

    /// GET /v1/orders/open, optionally scoped to one market.
    pub async fn get_open_orders(
        &self,
        symbol: Option<&Symbol>,
    ) -> Result<serde_json::Value, ExchangeError> {
        let query = symbol.map(|s| format!("market={}", s.to_wire()));
        self.request(Method::GET, "/v1/orders/open", query, None, true)
            .await
    }
}

fn is_fallback_status(e: &ExchangeError) -> bool {
    matches!(e.status(), Some(404) | Some(405) | Some(410))
}

impl std::fmt::Debug for UpbitClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpbitClient")
            .field("access_key", &"<redacted>")
            .field("secret_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn sym(s: &str) -> Symbol {
        Symbol::normalize(s).unwrap()
    }

    #[test]
    fn wire_body_limit_buy() {
        let req = PlaceOrderRequest {
            symbol: sym("BTC_KRW"),
            side: Side::Buy,
            order_type: OrderType::Limit,
            price: Some(6000.0),
            qty: Some(1.0),
            amount_krw: None,
            client_order_key: Some("k1".to_string()),
        };
        let body = req.wire_body().unwrap();
        assert_eq!(body["market"], "KRW-BTC");
        assert_eq!(body["side"], "bid");
        assert_eq!(body["ord_type"], "limit");
        assert_eq!(body["price"], "6000");
        assert_eq!(body["volume"], "1");
        assert_eq!(body["identifier"], "k1");
    }

    #[test]
    fn wire_body_limit_sell() {
        let req = PlaceOrderRequest {
            symbol: sym("ETH_KRW"),
            side: Side::Sell,
            order_type: OrderType::Limit,
            price: Some(2500.5),
            qty: Some(0.25),
            amount_krw: None,
            client_order_key: None,
        };
        let body = req.wire_body().unwrap();
        assert_eq!(body["side"], "ask");
        assert_eq!(body["ord_type"], "limit");
        assert_eq!(body["price"], "2500.5");
        assert_eq!(body["volume"], "0.25");
        assert!(body.get("identifier").is_none());
    }

    #[test]
    fn wire_body_market_buy_uses_quote_amount() {
        let req = PlaceOrderRequest {
            symbol: sym("BTC_KRW"),
            side: Side::Buy,
            order_type: OrderType::Market,
            price: None,
            qty: None,
            amount_krw: Some(9000.0),
            client_order_key: None,
        };
        let body = req.wire_body().unwrap();
        assert_eq!(body["ord_type"], "price");
        assert_eq!(body["price"], "9000");
        assert!(body.get("volume").is_none());
    }

    #[test]
    fn wire_body_market_sell_omits_price() {
        let req = PlaceOrderRequest {
            symbol: sym("BTC_KRW"),
            side: Side::Sell,
            order_type: OrderType::Market,
            price: None,
            qty: Some(0.5),
            amount_krw: None,
            client_order_key: None,
        };
        let body = req.wire_body().unwrap();
        assert_eq!(body["ord_type"], "market");
        assert_eq!(body["volume"], "0.5");
        assert!(body.get("price").is_none());
    }

    #[test]
    fn wire_body_rejects_missing_fields() {
        let req = PlaceOrderRequest {
            symbol: sym("BTC_KRW"),
            side: Side::Buy,
            order_type: OrderType::Limit,
            price: None,
            qty: Some(1.0),
            amount_krw: None,
            client_order_key: None,
        };
        let err = req.wire_body().unwrap_err();
        assert!(matches!(err, ExchangeError::InvalidArgument(_)));
    }

    #[test]
    fn canonical_body_is_key_sorted() {
        let body = serde_json::json!({
            "volume": "1",
            "market": "KRW-BTC",
            "side": "bid",
            "ord_type": "limit",
            "price": "6000"
        });
        assert_eq!(
            UpbitClient::canonical_body(&body),
            "market=KRW-BTC&ord_type=limit&price=6000&side=bid&volume=1"
        );
    }

    #[test]
    fn number_formatting_trims_trailing_zeroes() {
        assert_eq!(format_number(6000.0), "6000");
        assert_eq!(format_number(0.25), "0.25");
        assert_eq!(format_number(0.00012345), "0.00012345");
        assert_eq!(format_number(1468.0), "1468");
    }

    #[test]
    fn auth_token_is_well_formed_jwt() {
        let limits = Arc::new(RateLimits::new(150, 140));
        let client = UpbitClient::new(
            "access",
            "secret",
            &ExchangeConfig::default(),
            limits,
            None,
        );

        let token = client.auth_token(Some("market=KRW-BTC")).unwrap();
        // header.payload.signature
        assert_eq!(token.split('.').count(), 3);

        let no_query = client.auth_token(None).unwrap();
        assert_eq!(no_query.split('.').count(), 3);
        assert_ne!(token, no_query);
    }
}
