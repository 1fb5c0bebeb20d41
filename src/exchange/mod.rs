pub mod delta;

pub use delta::DeltaExchangeClient;

use crate::errors::EngineResult;

/// The subset of exchange REST operations the analytic/execution layers
/// depend on. Lets `HistoricalDataLoader` (and, in tests, anything else
/// that only needs candle history) run against an in-memory fake instead
/// of a live `DeltaExchangeClient`.
///
/// Uses native `async fn` in a trait rather than `#[async_trait]`: every
/// caller is generic over `C: ExchangeClient`, never a `dyn ExchangeClient`,
/// so the lack of dyn-compatibility costs nothing here.
pub trait ExchangeClient {
    async fn get_history_candles(
        &self,
        symbol: &str,
        resolution: &str,
        start: i64,
        end: i64,
    ) -> EngineResult<serde_json::Value>;
}

impl ExchangeClient for DeltaExchangeClient {
    async fn get_history_candles(
        &self,
        symbol: &str,
        resolution: &str,
        start: i64,
        end: i64,
    ) -> EngineResult<serde_json::Value> {
        DeltaExchangeClient::get_history_candles(self, symbol, resolution, start, end).await
    }
}
