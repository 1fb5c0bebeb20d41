// =============================================================================
// Candle aggregation — tick stream to fixed-interval OHLCV
// =============================================================================
//
// Buckets a per-symbol tick stream into fixed-interval candles. At most one
// candle is open per symbol at any time; a bucket rollover finalizes the open
// candle, emits it, and opens the next one seeded from the triggering tick.
//
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::EngineError;

/// A finalized or in-progress OHLCV candle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Bucket-start timestamp, in seconds, always a multiple of the
    /// timeframe interval.
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
    /// Number of ticks folded into this candle. Internal bookkeeping, but
    /// included on the wire for parity with historical exports.
    #[serde(default)]
    pub tick_count: u64,
}

impl Candle {
    fn new(bucket_start: i64, price: f64) -> Self {
        Self {
            timestamp: bucket_start,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 0.0,
            tick_count: 1,
        }
    }

    fn update(&mut self, price: f64, volume: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume += volume;
        self.tick_count += 1;
    }

    /// True if the candle satisfies the invariants a finalized candle must
    /// hold. Used to drop malformed candles before they reach history.
    pub fn is_valid(&self, interval_secs: i64) -> bool {
        self.low <= self.open.min(self.close)
            && self.high >= self.open.max(self.close)
            && self.high >= self.low
            && self.open > 0.0
            && self.high > 0.0
            && self.low > 0.0
            && self.close > 0.0
            && self.volume >= 0.0
            && self.timestamp % interval_secs == 0
    }
}

/// Raw inbound tick before timestamp normalization.
#[derive(Debug, Clone)]
pub struct Tick {
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
    /// Raw timestamp, in whatever unit the feed produced it in.
    pub timestamp: TickTimestamp,
}

/// The accepted shapes of an inbound timestamp (§4.1 normalization rule).
#[derive(Debug, Clone)]
pub enum TickTimestamp {
    Numeric(f64),
    Iso8601(String),
}

/// Coerce any accepted timestamp shape to integer seconds.
///
/// Values above 10^12 are treated as microseconds, above 10^10 as
/// milliseconds, otherwise seconds (fractional part truncated). ISO-8601
/// strings are parsed as RFC3339, falling back to a naive (UTC-assumed)
/// parse for strings without an offset.
pub fn normalize_timestamp(ts: &TickTimestamp) -> Result<i64, EngineError> {
    match ts {
        TickTimestamp::Numeric(n) => {
            if !n.is_finite() {
                return Err(EngineError::InputInvalid(format!(
                    "non-finite timestamp: {n}"
                )));
            }
            let magnitude = n.abs();
            let secs = if magnitude > 1e12 {
                n / 1_000_000.0
            } else if magnitude > 1e10 {
                n / 1_000.0
            } else {
                *n
            };
            Ok(secs.trunc() as i64)
        }
        TickTimestamp::Iso8601(s) => {
            if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
                return Ok(dt.timestamp());
            }
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
                .map(|naive| naive.and_utc().timestamp())
                .map_err(|e| EngineError::InputInvalid(format!("unparseable timestamp {s}: {e}")))
        }
    }
}

/// Builds fixed-interval OHLCV candles from a per-symbol tick stream.
///
/// Holds at most one open candle per symbol. `on_tick` returns a finalized
/// candle whenever a bucket rollover occurs; callers dispatch it as a
/// `CandleClosed` event to the SMC engine for that symbol.
pub struct CandleAggregator {
    interval_secs: i64,
    open: std::collections::HashMap<String, Candle>,
}

impl CandleAggregator {
    pub fn new(interval_secs: i64) -> Self {
        assert!(interval_secs > 0, "timeframe interval must be positive");
        Self {
            interval_secs,
            open: std::collections::HashMap::new(),
        }
    }

    fn bucket_start(&self, ts: i64) -> i64 {
        ts.div_euclid(self.interval_secs) * self.interval_secs
    }

    /// Process one tick. Malformed ticks (non-positive price, unparseable
    /// timestamp) are logged and dropped; this never fails fatally.
    ///
    /// Returns `Some(candle)` if this tick rolled over a bucket boundary,
    /// finalizing the previous open candle for this symbol.
    pub fn on_tick(&mut self, tick: &Tick) -> Option<Candle> {
        if tick.price <= 0.0 {
            warn!(symbol = %tick.symbol, price = tick.price, "dropping tick with non-positive price");
            return None;
        }

        let ts = match normalize_timestamp(&tick.timestamp) {
            Ok(ts) => ts,
            Err(e) => {
                warn!(symbol = %tick.symbol, error = %e, "dropping tick with bad timestamp");
                return None;
            }
        };

        let bucket = self.bucket_start(ts);

        let closed = match self.open.get(&tick.symbol) {
            None => None,
            Some(candle) if candle.timestamp == bucket => None,
            Some(_) => self.open.remove(&tick.symbol).and_then(|c| self.finalize(&tick.symbol, c)),
        };

        self.open
            .entry(tick.symbol.clone())
            .and_modify(|c| c.update(tick.price, tick.volume))
            .or_insert_with(|| Candle::new(bucket, tick.price));

        closed
    }

    fn finalize(&self, symbol: &str, candle: Candle) -> Option<Candle> {
        if !candle.is_valid(self.interval_secs) {
            warn!(symbol, ?candle, "dropping invalid candle at finalize");
            return None;
        }
        Some(candle)
    }

    /// Finalize every open candle, e.g. on shutdown. Returns one finalized
    /// candle per symbol that had an open candle.
    pub fn flush(&mut self) -> Vec<(String, Candle)> {
        let mut out = Vec::new();
        let drained: Vec<(String, Candle)> = self.open.drain().collect();
        for (symbol, candle) in drained {
            if let Some(candle) = self.finalize(&symbol, candle) {
                out.push((symbol, candle));
            }
        }
        out
    }

    pub fn current_candle(&self, symbol: &str) -> Option<&Candle> {
        self.open.get(symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(symbol: &str, price: f64, ts: i64) -> Tick {
        Tick {
            symbol: symbol.to_string(),
            price,
            volume: 0.0,
            timestamp: TickTimestamp::Numeric(ts as f64),
        }
    }

    #[test]
    fn single_bucket_accumulation() {
        // S1. Timeframe 900s, ticks within one bucket, no rollover until flush.
        let mut agg = CandleAggregator::new(900);
        let t0 = 1_696_118_400_i64;
        assert!(agg.on_tick(&tick("SOLUSD", 100.0, t0)).is_none());
        assert!(agg.on_tick(&tick("SOLUSD", 101.0, t0 + 60)).is_none());
        assert!(agg.on_tick(&tick("SOLUSD", 99.5, t0 + 120)).is_none());
        assert!(agg.on_tick(&tick("SOLUSD", 100.5, t0 + 300)).is_none());

        let flushed = agg.flush();
        assert_eq!(flushed.len(), 1);
        let (sym, candle) = &flushed[0];
        assert_eq!(sym, "SOLUSD");
        assert_eq!(candle.timestamp, t0);
        assert_eq!(candle.open, 100.0);
        assert_eq!(candle.high, 101.0);
        assert_eq!(candle.low, 99.5);
        assert_eq!(candle.close, 100.5);
        assert_eq!(candle.tick_count, 4);
    }

    #[test]
    fn bucket_rollover_emits_exactly_once() {
        // S2. One more tick after S1 that belongs to the next bucket.
        let mut agg = CandleAggregator::new(900);
        let t0 = 1_696_118_400_i64;
        agg.on_tick(&tick("SOLUSD", 100.0, t0));
        agg.on_tick(&tick("SOLUSD", 101.0, t0 + 60));
        agg.on_tick(&tick("SOLUSD", 99.5, t0 + 120));
        agg.on_tick(&tick("SOLUSD", 100.5, t0 + 300));

        let closed = agg.on_tick(&tick("SOLUSD", 102.0, t0 + 900));
        let closed = closed.expect("bucket rollover should finalize previous candle");
        assert_eq!(closed.timestamp, t0);
        assert_eq!(closed.close, 100.5);

        let current = agg.current_candle("SOLUSD").unwrap();
        assert_eq!(current.timestamp, t0 + 900);
        assert_eq!(current.open, 102.0);
        assert_eq!(current.high, 102.0);
        assert_eq!(current.low, 102.0);
        assert_eq!(current.tick_count, 1);
    }

    #[test]
    fn non_positive_price_is_dropped() {
        let mut agg = CandleAggregator::new(60);
        assert!(agg.on_tick(&tick("SOLUSD", -1.0, 0)).is_none());
        assert!(agg.current_candle("SOLUSD").is_none());
    }

    #[test]
    fn microsecond_timestamp_is_normalized() {
        let mut agg = CandleAggregator::new(60);
        let ts_micros = 1_696_118_400_000_000_f64;
        agg.on_tick(&Tick {
            symbol: "SOLUSD".into(),
            price: 10.0,
            volume: 0.0,
            timestamp: TickTimestamp::Numeric(ts_micros),
        });
        let c = agg.current_candle("SOLUSD").unwrap();
        assert_eq!(c.timestamp, 1_696_118_400 / 60 * 60);
    }

    #[test]
    fn iso8601_timestamp_parses() {
        let ts = normalize_timestamp(&TickTimestamp::Iso8601(
            "2023-10-01T00:00:00Z".to_string(),
        ))
        .unwrap();
        assert_eq!(ts, 1_696_118_400);
    }

    #[test]
    fn flush_with_no_open_candles_is_empty() {
        let mut agg = CandleAggregator::new(60);
        assert!(agg.flush().is_empty());
    }

    #[test]
    fn independent_symbols_do_not_interfere() {
        let mut agg = CandleAggregator::new(60);
        agg.on_tick(&tick("SOLUSD", 100.0, 0));
        agg.on_tick(&tick("AAVEUSD", 200.0, 0));
        assert_eq!(agg.current_candle("SOLUSD").unwrap().open, 100.0);
        assert_eq!(agg.current_candle("AAVEUSD").unwrap().open, 200.0);
    }
}
