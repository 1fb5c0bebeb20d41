// =============================================================================
// Tick transport — WebSocket ingress for mark-price / ticker feeds
// =============================================================================
//
// Connects to the exchange's public WebSocket, subscribes to the configured
// channels, and forwards parsed ticks to the caller via an mpsc channel.
// Reconnects with exponential backoff (5s initial, doubling, capped at
// 300s, up to 10 attempts) and treats 60s of silence as a dead connection.
// =============================================================================

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use crate::candle::{Tick, TickTimestamp};
use crate::errors::EngineError;

const INITIAL_BACKOFF_SECS: u64 = 5;
const MAX_BACKOFF_SECS: u64 = 300;
const MAX_RECONNECT_ATTEMPTS: u32 = 10;
const SILENCE_TIMEOUT_SECS: u64 = 60;

/// Runs the tick feed until the reconnect budget is exhausted. Parsed ticks
/// are sent on `tx`; the caller owns the receiving end and feeds them to a
/// `CandleAggregator`.
pub async fn run_tick_feed(url: &str, symbols: Vec<String>, tx: mpsc::Sender<Tick>) -> Result<(), EngineError> {
    let mut attempt = 0u32;
    let mut backoff = INITIAL_BACKOFF_SECS;

    loop {
        match connect_and_stream(url, &symbols, &tx).await {
            Ok(()) => {
                info!("tick feed closed cleanly");
                attempt = 0;
                backoff = INITIAL_BACKOFF_SECS;
            }
            Err(e) => {
                attempt += 1;
                warn!(attempt, error = %e, "tick feed disconnected");
                if attempt >= MAX_RECONNECT_ATTEMPTS {
                    error!(attempt, "exhausted reconnect budget, giving up");
                    return Err(EngineError::Transient(format!(
                        "tick feed gave up after {attempt} attempts: {e}"
                    )));
                }
            }
        }

        tokio::time::sleep(Duration::from_secs(backoff)).await;
        backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
    }
}

async fn connect_and_stream(url: &str, symbols: &[String], tx: &mpsc::Sender<Tick>) -> Result<(), EngineError> {
    info!(url, "connecting to tick feed");
    let (ws_stream, _response) = connect_async(url)
        .await
        .map_err(|e| EngineError::Transient(format!("failed to connect: {e}")))?;

    let (mut write, mut read) = ws_stream.split();

    let subscribe = serde_json::json!({
        "type": "subscribe",
        "payload": {
            "channels": [{ "name": "v2/ticker", "symbols": symbols }]
        }
    });
    write
        .send(Message::Text(subscribe.to_string()))
        .await
        .map_err(|e| EngineError::Transient(format!("failed to send subscribe: {e}")))?;

    loop {
        let next = timeout(Duration::from_secs(SILENCE_TIMEOUT_SECS), read.next()).await;
        match next {
            Ok(Some(Ok(Message::Text(text)))) => {
                if let Some(tick) = parse_tick_message(&text) {
                    if tx.send(tick).await.is_err() {
                        return Ok(());
                    }
                }
            }
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(e))) => return Err(EngineError::Transient(format!("websocket read error: {e}"))),
            Ok(None) => return Ok(()),
            Err(_) => {
                return Err(EngineError::Transient(format!(
                    "no inbound message for {SILENCE_TIMEOUT_SECS}s, connection considered dead"
                )))
            }
        }
    }
}

/// Parses one of the two accepted inbound shapes. Unrecognized `type`
/// values, and malformed payloads, are dropped with a warning rather than
/// propagated — the analytic core has no use for a single bad tick.
fn parse_tick_message(text: &str) -> Option<Tick> {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "dropping malformed tick payload");
            return None;
        }
    };

    let msg_type = value.get("type")?.as_str()?;
    let (symbol, price) = match msg_type {
        "mark_price" => (value.get("symbol")?.as_str()?, value.get("price")?),
        "v2/ticker" => (value.get("symbol")?.as_str()?, value.get("mark_price")?),
        _ => return None,
    };

    let price = parse_numeric_field(price)?;
    let timestamp = value.get("timestamp")?;
    let timestamp = if let Some(n) = timestamp.as_f64() {
        TickTimestamp::Numeric(n)
    } else if let Some(s) = timestamp.as_str() {
        TickTimestamp::Iso8601(s.to_string())
    } else {
        warn!("dropping tick with unparseable timestamp");
        return None;
    };

    Some(Tick {
        symbol: symbol.to_string(),
        price,
        volume: 0.0,
        timestamp,
    })
}

fn parse_numeric_field(value: &serde_json::Value) -> Option<f64> {
    value.as_f64().or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mark_price_shape() {
        let text = r#"{"type":"mark_price","symbol":"SOLUSD","price":"150.25","timestamp":1700000000000000}"#;
        let tick = parse_tick_message(text).unwrap();
        assert_eq!(tick.symbol, "SOLUSD");
        assert!((tick.price - 150.25).abs() < 1e-9);
    }

    #[test]
    fn parses_v2_ticker_shape() {
        let text = r#"{"type":"v2/ticker","symbol":"SOLUSD","mark_price":150.30,"timestamp":1700000000000000}"#;
        let tick = parse_tick_message(text).unwrap();
        assert!((tick.price - 150.30).abs() < 1e-9);
    }

    #[test]
    fn unrecognized_type_is_dropped() {
        let text = r#"{"type":"heartbeat"}"#;
        assert!(parse_tick_message(text).is_none());
    }

    #[test]
    fn malformed_json_is_dropped_not_panicking() {
        assert!(parse_tick_message("{not json").is_none());
    }
}
