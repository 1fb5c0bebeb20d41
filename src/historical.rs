// =============================================================================
// Historical candle loader — chunked fetch with dedup and retry
// =============================================================================
//
// Splits a `[start, end)` range into at most 2,000-candle chunks, fetches
// each chunk through the exchange client with up to 3 retries, deduplicates
// by timestamp, and returns candles sorted ascending. Rate-limit errors get
// a longer backoff than ordinary transient failures. A chunk that exhausts
// its retries is logged and skipped rather than aborting the whole fetch;
// the call only errors if zero candles came back overall.
// =============================================================================

use std::collections::BTreeMap;

use tokio::time::{sleep, Duration};
use tracing::{info, warn};

use crate::candle::Candle;
use crate::errors::{EngineError, EngineResult};
use crate::exchange::ExchangeClient;

const MAX_CANDLES_PER_CHUNK: i64 = 2000;
const MAX_RETRIES: u32 = 3;

pub struct HistoricalDataLoader<C: ExchangeClient> {
    client: C,
}

/// Splits `[start, end)` into chunks of at most `MAX_CANDLES_PER_CHUNK`
/// candles, given the timeframe's width in seconds.
fn chunk_ranges(start: i64, end: i64, timeframe_seconds: i64) -> Vec<(i64, i64)> {
    let max_duration = MAX_CANDLES_PER_CHUNK * timeframe_seconds;
    let mut chunks = Vec::new();
    let mut current = start;
    while current < end {
        let chunk_end = (current + max_duration).min(end);
        chunks.push((current, chunk_end));
        current = chunk_end;
    }
    chunks
}

fn retry_delay(retry: u32, timeframe_seconds: i64, rate_limited: bool) -> Duration {
    if rate_limited {
        Duration::from_secs_f64(5.0 * 2f64.powi(retry as i32))
    } else {
        let base = if timeframe_seconds < 3600 { 0.5 } else { 0.1 };
        Duration::from_secs_f64(base * 2f64.powi(retry as i32))
    }
}

impl<C: ExchangeClient> HistoricalDataLoader<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }

    /// Fetches historical candles for `symbol` between `start` and `end`
    /// (inclusive of `start`, exclusive of `end`), both in seconds.
    /// `resolution` is the exchange's timeframe string (e.g. "15m").
    pub async fn fetch_range(
        &self,
        symbol: &str,
        resolution: &str,
        timeframe_seconds: i64,
        start: i64,
        end: i64,
    ) -> EngineResult<Vec<Candle>> {
        if start >= end {
            return Err(EngineError::InputInvalid(format!(
                "start ({start}) must be before end ({end})"
            )));
        }

        let chunks = chunk_ranges(start, end, timeframe_seconds);
        info!(symbol, resolution, chunk_count = chunks.len(), "fetching historical candles");

        let mut by_timestamp: BTreeMap<i64, Candle> = BTreeMap::new();

        for (i, (chunk_start, chunk_end)) in chunks.iter().enumerate() {
            let mut attempt = 0;
            loop {
                match self.client.get_history_candles(symbol, resolution, *chunk_start, *chunk_end).await {
                    Ok(payload) => {
                        for candle in parse_candles(&payload)? {
                            by_timestamp.insert(candle.timestamp, candle);
                        }
                        break;
                    }
                    Err(e) => {
                        attempt += 1;
                        let rate_limited = matches!(&e, EngineError::Transient(msg) if msg.contains("429"));
                        if attempt >= MAX_RETRIES {
                            warn!(symbol, chunk = i, error = %e, "chunk fetch exhausted retries, skipping chunk");
                            break;
                        }
                        warn!(symbol, chunk = i, attempt, error = %e, "retrying chunk fetch");
                        sleep(retry_delay(attempt, timeframe_seconds, rate_limited)).await;
                    }
                }
            }
        }

        if by_timestamp.is_empty() {
            return Err(EngineError::ExchangeSemantic(format!(
                "no candles retrieved for {symbol} between {start} and {end}"
            )));
        }

        Ok(by_timestamp.into_values().collect())
    }
}

fn parse_candles(payload: &serde_json::Value) -> EngineResult<Vec<Candle>> {
    let result = payload
        .get("result")
        .ok_or_else(|| EngineError::ExchangeSemantic("history response missing 'result'".to_string()))?;
    serde_json::from_value(result.clone())
        .map_err(|e| EngineError::ExchangeSemantic(format!("failed to parse candle history: {e}")))
}

/// In-memory stand-in for `DeltaExchangeClient` used to exercise
/// `HistoricalDataLoader` without a live exchange, per the trait boundary
/// this loader is generic over.
#[cfg(test)]
struct FakeExchangeClient {
    candles_by_chunk: std::sync::Mutex<Vec<Vec<Candle>>>,
}

#[cfg(test)]
impl ExchangeClient for FakeExchangeClient {
    async fn get_history_candles(
        &self,
        _symbol: &str,
        _resolution: &str,
        _start: i64,
        _end: i64,
    ) -> EngineResult<serde_json::Value> {
        let mut remaining = self.candles_by_chunk.lock().unwrap();
        if remaining.is_empty() {
            return Ok(serde_json::json!({ "result": [] }));
        }
        let chunk = remaining.remove(0);
        Ok(serde_json::json!({ "result": chunk }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(ts: i64) -> Candle {
        Candle {
            timestamp: ts,
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.5,
            volume: 10.0,
            tick_count: 1,
        }
    }

    #[test]
    fn chunk_ranges_split_on_2000_candle_boundary() {
        let timeframe_seconds = 900; // 15m
        let start = 0;
        let end = timeframe_seconds * 5000; // 5000 candles worth
        let chunks = chunk_ranges(start, end, timeframe_seconds);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], (0, timeframe_seconds * 2000));
        assert_eq!(chunks[2].1, end);
    }

    #[test]
    fn single_small_range_is_one_chunk() {
        let chunks = chunk_ranges(0, 900 * 10, 900);
        assert_eq!(chunks, vec![(0, 9000)]);
    }

    #[test]
    fn intraday_retry_delay_is_shorter_base_than_daily() {
        let intraday = retry_delay(0, 900, false);
        let daily = retry_delay(0, 86400, false);
        assert!(intraday > daily);
    }

    #[test]
    fn rate_limited_backoff_exceeds_ordinary_backoff() {
        let ordinary = retry_delay(1, 900, false);
        let limited = retry_delay(1, 900, true);
        assert!(limited > ordinary);
    }

    #[tokio::test]
    async fn fetch_range_dedups_and_sorts_across_chunks() {
        let fake = FakeExchangeClient {
            candles_by_chunk: std::sync::Mutex::new(vec![
                vec![candle(100), candle(200)],
                vec![candle(200), candle(300)],
            ]),
        };
        let loader = HistoricalDataLoader::new(fake);
        let candles = loader.fetch_range("SOLUSD", "15m", 900, 0, 1800).await.unwrap();
        let timestamps: Vec<i64> = candles.iter().map(|c| c.timestamp).collect();
        assert_eq!(timestamps, vec![100, 200, 300]);
    }

    struct PartiallyFailingExchangeClient {
        fail_start: i64,
    }

    impl ExchangeClient for PartiallyFailingExchangeClient {
        async fn get_history_candles(
            &self,
            _symbol: &str,
            _resolution: &str,
            start: i64,
            _end: i64,
        ) -> EngineResult<serde_json::Value> {
            if start == self.fail_start {
                return Err(EngineError::Transient("simulated outage".to_string()));
            }
            Ok(serde_json::json!({ "result": [candle(start)] }))
        }
    }

    #[tokio::test]
    async fn chunk_that_exhausts_retries_is_skipped_not_aborted() {
        let fake = PartiallyFailingExchangeClient { fail_start: 0 };
        let loader = HistoricalDataLoader::new(fake);
        let chunk_span = 900 * 2000;
        let candles = loader
            .fetch_range("SOLUSD", "15m", 900, 0, chunk_span * 2)
            .await
            .unwrap();
        // The first chunk (start=0) exhausts retries and is skipped; the
        // second still lands in the result.
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].timestamp, chunk_span);
    }

    #[tokio::test]
    async fn all_chunks_failing_returns_error() {
        let fake = PartiallyFailingExchangeClient { fail_start: 0 };
        let loader = HistoricalDataLoader::new(fake);
        assert!(loader.fetch_range("SOLUSD", "15m", 900, 0, 900).await.is_err());
    }

    #[tokio::test]
    async fn invalid_range_is_rejected_before_any_fetch() {
        let fake = FakeExchangeClient {
            candles_by_chunk: std::sync::Mutex::new(vec![]),
        };
        let loader = HistoricalDataLoader::new(fake);
        assert!(loader.fetch_range("SOLUSD", "15m", 900, 100, 50).await.is_err());
    }
}
