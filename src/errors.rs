// =============================================================================
// Error taxonomy for the analytic core
// =============================================================================
//
// Analytic components (candle aggregation, SMC structure, OB lifecycle,
// position/order tracking) return `Result<T, EngineError>` for failures that
// are part of their contract. I/O-heavy components (persistence, exchange
// REST, historical fetch) use `anyhow::Result` with `.context(...)` instead,
// since their failures are not meant to be pattern-matched by callers.
// =============================================================================

use thiserror::Error;

/// The five-category failure taxonomy used across the analytic core.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed tick, malformed candle, unknown symbol. Caller should log
    /// and drop the offending item, not halt.
    #[error("malformed input: {0}")]
    InputInvalid(String),

    /// Network error, 5xx, rate limit. Already retried with bounded
    /// exponential backoff by the caller; this variant carries the terminal
    /// failure after the retry budget is exhausted.
    #[error("transient transport failure: {0}")]
    Transient(String),

    /// Order rejected, position absent, insufficient funds. Never retried
    /// silently — always surfaced to the caller.
    #[error("exchange rejected operation: {0}")]
    ExchangeSemantic(String),

    /// Unreadable or schema-mismatched state snapshot. The offending file
    /// has already been quarantined by the time this is raised.
    #[error("state file corrupt: {0}")]
    StateCorruption(String),

    /// OHLC impossible, OB with top <= btm, position opened when one
    /// exists. Indicates a bug upstream; made loud but never panics.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
