// =============================================================================
// Average True Range — used to cap order block thickness
// =============================================================================

use crate::candle::Candle;

const ATR_WINDOW: usize = 200;

/// Computes ATR over the trailing 200 closed candles as
/// `mean(TR) / (5 / len)`, where `len` is a configured constant (default 5).
///
/// Returns `None` until at least 200 candles exist.
pub fn calculate_atr(candles: &[Candle], len: f64) -> Option<f64> {
    if candles.len() < ATR_WINDOW {
        return None;
    }
    let window = &candles[candles.len() - ATR_WINDOW..];

    let mut tr_sum = 0.0;
    let mut tr_count = 0usize;
    for i in 1..window.len() {
        let h = window[i].high;
        let l = window[i].low;
        let pc = window[i - 1].close;
        let tr = (h - l).max((h - pc).abs()).max((l - pc).abs());
        tr_sum += tr;
        tr_count += 1;
    }

    if tr_count == 0 {
        return None;
    }
    let base_atr = tr_sum / tr_count as f64;
    Some(base_atr / (5.0 / len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_candles(n: usize, price: f64) -> Vec<Candle> {
        (0..n)
            .map(|i| Candle {
                timestamp: i as i64 * 60,
                open: price,
                high: price,
                low: price,
                close: price,
                volume: 0.0,
                tick_count: 1,
            })
            .collect()
    }

    #[test]
    fn returns_none_before_window_fills() {
        let candles = flat_candles(199, 100.0);
        assert!(calculate_atr(&candles, 5.0).is_none());
    }

    #[test]
    fn flat_candles_have_zero_atr() {
        let candles = flat_candles(200, 100.0);
        assert_eq!(calculate_atr(&candles, 5.0), Some(0.0));
    }

    #[test]
    fn only_trailing_window_is_used() {
        let mut candles = flat_candles(199, 100.0);
        // One violently volatile candle far in the past, then 200 flat ones.
        candles.push(Candle {
            timestamp: 199 * 60,
            open: 100.0,
            high: 500.0,
            low: 1.0,
            close: 100.0,
            volume: 0.0,
            tick_count: 1,
        });
        candles.extend(flat_candles(200, 100.0));
        let atr = calculate_atr(&candles, 5.0).unwrap();
        assert_eq!(atr, 0.0);
    }
}
