// =============================================================================
// CSV export — writes fetched candle history to disk for offline analysis
// =============================================================================
//
// Mirrors the directory layout of the scriptable analysis tooling this
// system replaces: `<base>/<symbol>/<timeframe>/<symbol>_<timeframe>_<start>
// _to_<end>.csv`, sorted ascending by timestamp with a human-readable
// `datetime` column prepended.
// =============================================================================

use std::path::PathBuf;

use chrono::{TimeZone, Utc};

use crate::candle::Candle;
use crate::errors::{EngineError, EngineResult};

pub struct CsvExporter {
    base_output_path: PathBuf,
}

impl CsvExporter {
    pub fn new(base_output_path: impl Into<PathBuf>) -> Self {
        Self {
            base_output_path: base_output_path.into(),
        }
    }

    fn directory_for(&self, symbol: &str, timeframe: &str) -> PathBuf {
        self.base_output_path.join(symbol).join(timeframe)
    }

    fn filename_for(symbol: &str, timeframe: &str, start_date: &str, end_date: &str) -> String {
        format!("{symbol}_{timeframe}_{start_date}_to_{end_date}.csv")
    }

    /// Writes `candles` (already sorted ascending by the caller) to CSV and
    /// returns the file path. Refuses an empty candle set rather than
    /// writing a header-only file nobody asked for.
    pub fn export(
        &self,
        candles: &[Candle],
        symbol: &str,
        timeframe: &str,
        start_date: &str,
        end_date: &str,
    ) -> EngineResult<PathBuf> {
        if candles.is_empty() {
            return Err(EngineError::InputInvalid("no candle data to export".to_string()));
        }

        let dir = self.directory_for(symbol, timeframe);
        std::fs::create_dir_all(&dir)
            .map_err(|e| EngineError::StateCorruption(format!("cannot create export dir: {e}")))?;

        let file_path = dir.join(Self::filename_for(symbol, timeframe, start_date, end_date));

        let mut writer = csv::Writer::from_path(&file_path)
            .map_err(|e| EngineError::StateCorruption(format!("cannot open csv writer: {e}")))?;

        writer
            .write_record(["datetime", "timestamp", "open", "high", "low", "close", "volume"])
            .map_err(|e| EngineError::StateCorruption(format!("csv header write failed: {e}")))?;

        let mut sorted: Vec<&Candle> = candles.iter().collect();
        sorted.sort_by_key(|c| c.timestamp);

        for candle in sorted {
            let datetime = Utc
                .timestamp_opt(candle.timestamp, 0)
                .single()
                .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default();

            writer
                .write_record([
                    datetime,
                    candle.timestamp.to_string(),
                    candle.open.to_string(),
                    candle.high.to_string(),
                    candle.low.to_string(),
                    candle.close.to_string(),
                    candle.volume.to_string(),
                ])
                .map_err(|e| EngineError::StateCorruption(format!("csv row write failed: {e}")))?;
        }

        writer
            .flush()
            .map_err(|e| EngineError::StateCorruption(format!("csv flush failed: {e}")))?;

        Ok(file_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(ts: i64, price: f64) -> Candle {
        Candle {
            timestamp: ts,
            open: price,
            high: price + 1.0,
            low: price - 1.0,
            close: price,
            volume: 10.0,
            tick_count: 1,
        }
    }

    #[test]
    fn exports_sorted_rows_with_datetime_column() {
        let dir = std::env::temp_dir().join(format!("smc_csv_test_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let exporter = CsvExporter::new(&dir);

        let candles = vec![candle(1_700_001_800, 101.0), candle(1_700_000_900, 100.0)];
        let path = exporter.export(&candles, "SOLUSD", "15m", "2023-11-14", "2023-11-15").unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "datetime,timestamp,open,high,low,close,volume");
        assert!(lines[1].contains("1700000900"));
        assert!(lines[2].contains("1700001800"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn empty_candle_set_is_rejected() {
        let dir = std::env::temp_dir().join(format!("smc_csv_empty_{}", std::process::id()));
        let exporter = CsvExporter::new(&dir);
        assert!(exporter.export(&[], "SOLUSD", "15m", "2023-11-14", "2023-11-15").is_err());
    }
}
