// =============================================================================
// Ticker WebSocket stream — subscribe, normalize frames, idempotent close
// =============================================================================
//
// The venue pushes ticker frames as JSON (usually in binary frames). Inbound
// frames are normalized to `TickerFrame` and handed to the caller's callback;
// errors surface through `on_error`. `close()` is idempotent and `closed()`
// resolves exactly once with the close reason.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{oneshot, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::symbol::Symbol;

pub const DEFAULT_WS_URL: &str = "wss://api.upbit.com/websocket/v1";

/// Normalized tick delivered to the `on_ticker` callback.
#[derive(Debug, Clone)]
pub struct TickerFrame {
    /// Canonical `BASE_QUOTE` symbol.
    pub symbol: String,
    /// Wire market code (`KRW-BTC`).
    pub market: String,
    pub trade_price: f64,
    /// "SNAPSHOT" or "REALTIME".
    pub stream_type: String,
    pub timestamp: i64,
}

pub type TickerCallback = Arc<dyn Fn(TickerFrame) + Send + Sync>;
pub type StreamErrorCallback = Arc<dyn Fn(String) + Send + Sync>;

pub struct TickerStreamOptions {
    pub symbols: Vec<Symbol>,
    pub on_ticker: TickerCallback,
    pub on_error: StreamErrorCallback,
}

/// Handle over a running ticker stream.
pub struct TickerStream {
    close_tx: parking_lot::Mutex<Option<oneshot::Sender<()>>>,
    closed_rx: watch::Receiver<Option<String>>,
}

impl TickerStream {
    /// Connect, subscribe to `ticker` for the requested markets, and spawn the
    /// receive loop.
    pub async fn open(url: &str, opts: TickerStreamOptions) -> Result<Self> {
        if opts.symbols.is_empty() {
            anyhow::bail!("ticker stream requires at least one symbol");
        }

        let (ws_stream, _response) = connect_async(url)
            .await
            .context("failed to connect to ticker WebSocket")?;
        info!(url = %url, symbols = opts.symbols.len(), "ticker WebSocket connected");

        let (mut write, mut read) = ws_stream.split();

        let codes: Vec<String> = opts.symbols.iter().map(Symbol::to_wire).collect();
        let subscribe = serde_json::json!([
            { "ticket": Uuid::new_v4().to_string() },
            { "type": "ticker", "codes": codes },
            { "format": "DEFAULT" }
        ]);
        write
            .send(Message::Text(subscribe.to_string()))
            .await
            .context("failed to send ticker subscription")?;

        let (close_tx, mut close_rx) = oneshot::channel::<()>();
        let (closed_tx, closed_rx) = watch::channel::<Option<String>>(None);

        let on_ticker = opts.on_ticker.clone();
        let on_error = opts.on_error.clone();

        tokio::spawn(async move {
            let reason: String = loop {
                tokio::select! {
                    _ = &mut close_rx => {
                        break "client_close".to_string();
                    }
                    frame = read.next() => match frame {
                        Some(Ok(msg)) => {
                            let payload: Option<String> = match msg {
                                Message::Text(text) => Some(text),
                                Message::Binary(bytes) => {
                                    String::from_utf8(bytes).ok()
                                }
                                Message::Close(frame) => {
                                    break frame
                                        .map(|f| format!("server_close: {}", f.reason))
                                        .unwrap_or_else(|| "server_close".to_string());
                                }
                                // Ping/Pong handled by tungstenite.
                                _ => None,
                            };
                            if let Some(text) = payload {
                                match parse_ticker_frame(&text) {
                                    Ok(Some(tick)) => {
                                        debug!(symbol = %tick.symbol, price = tick.trade_price, "tick");
                                        on_ticker(tick);
                                    }
                                    Ok(None) => {}
                                    Err(e) => {
                                        warn!(error = %e, "failed to parse ticker frame");
                                        on_error(format!("parse_error: {e}"));
                                    }
                                }
                            }
                        }
                        Some(Err(e)) => {
                            on_error(format!("stream_error: {e}"));
                            break format!("stream_error: {e}");
                        }
                        None => {
                            break "stream_ended".to_string();
                        }
                    }
                }
            };
            // First send wins; later loop exits are unreachable because we
            // break out immediately.
            let _ = closed_tx.send(Some(reason));
        });

        Ok(Self {
            close_tx: parking_lot::Mutex::new(Some(close_tx)),
            closed_rx,
        })
    }

    /// Request the stream to stop. Safe to call more than once; only the first
    /// call has any effect.
    pub fn close(&self) {
        if let Some(tx) = self.close_tx.lock().take() {
            let _ = tx.send(());
        }
    }

    /// Resolve once the stream has stopped, with the close reason. Multiple
    /// waiters all observe the same reason.
    pub async fn closed(&self) -> String {
        let mut rx = self.closed_rx.clone();
        loop {
            if let Some(reason) = rx.borrow().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return "task_dropped".to_string();
            }
        }
    }
}

/// Parse one inbound frame. Non-ticker frames yield `Ok(None)`.
fn parse_ticker_frame(text: &str) -> Result<Option<TickerFrame>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("frame is not valid JSON")?;

    match root.get("type").and_then(|v| v.as_str()) {
        Some("ticker") => {}
        _ => return Ok(None),
    }

    let market = root
        .get("code")
        .and_then(|v| v.as_str())
        .context("ticker frame missing 'code'")?
        .to_string();
    let symbol = Symbol::normalize(&market)
        .map_err(|e| anyhow::anyhow!("bad market code '{market}': {e}"))?;

    let trade_price = root
        .get("trade_price")
        .and_then(|v| v.as_f64())
        .context("ticker frame missing 'trade_price'")?;

    let stream_type = root
        .get("stream_type")
        .and_then(|v| v.as_str())
        .unwrap_or("REALTIME")
        .to_string();

    let timestamp = root.get("timestamp").and_then(|v| v.as_i64()).unwrap_or(0);

    Ok(Some(TickerFrame {
        symbol: symbol.as_str().to_string(),
        market,
        trade_price,
        stream_type,
        timestamp,
    }))
}
