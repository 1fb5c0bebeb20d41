// =============================================================================
// Runtime Configuration — symbols, sub-accounts, persisted atomically
// =============================================================================
//
// Central configuration hub for the engine. Every tunable lives here so the
// process can be restarted against the same config without special casing.
// All fields carry `#[serde(default = "...")]` so that adding new fields
// never breaks loading an older config file.
//
// Persistence uses the same atomic tmp + rename pattern as the trading
// state snapshots (see `persistence.rs`), kept separate here because the
// config file is hand-edited far more often than the state files.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::smc::MitigationRule;

fn default_timeframe_minutes() -> u32 {
    15
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_mitigation_rule() -> MitigationRule {
    MitigationRule::default()
}

fn default_penetration_pct() -> f64 {
    0.20
}

/// Exchange-side contract specification for one symbol, used for order
/// payload construction and price rounding.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SymbolSpec {
    pub product_id: i64,
    pub qty_per_contract: f64,
    pub min_quantity: u64,
    pub tick_size: f64,
}

/// Capital allocation and leverage for one order-block freshness class
/// within a sub-account.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ObClassParams {
    pub position_size_pct: f64,
    pub leverage: f64,
}

/// Sub-account sizing configuration, keyed by order-block type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAccountConfig {
    pub fresh: ObClassParams,
    pub breaker: ObClassParams,
    #[serde(default)]
    pub initial_capital_per_symbol: f64,
    #[serde(default)]
    pub symbols: Vec<String>,
}

impl Default for SubAccountConfig {
    fn default() -> Self {
        Self {
            fresh: ObClassParams {
                position_size_pct: 0.40,
                leverage: 20.0,
            },
            breaker: ObClassParams {
                position_size_pct: 0.30,
                leverage: 10.0,
            },
            initial_capital_per_symbol: 100.0,
            symbols: Vec::new(),
        }
    }
}

/// Top-level runtime configuration.
///
/// Every field has a serde default so older JSON configs missing new
/// fields still deserialize correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub symbols: HashMap<String, SymbolSpec>,

    #[serde(default)]
    pub sub_accounts: HashMap<String, SubAccountConfig>,

    #[serde(default = "default_timeframe_minutes")]
    pub timeframe_minutes: u32,

    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default = "default_mitigation_rule")]
    pub mitigation_rule: MitigationRule,

    #[serde(default = "default_penetration_pct")]
    pub penetration_pct: f64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbols: HashMap::new(),
            sub_accounts: HashMap::new(),
            timeframe_minutes: default_timeframe_minutes(),
            data_dir: default_data_dir(),
            mitigation_rule: default_mitigation_rule(),
            penetration_pct: default_penetration_pct(),
        }
    }
}

impl RuntimeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbol_count = config.symbols.len(),
            sub_accounts = config.sub_accounts.len(),
            timeframe_minutes = config.timeframe_minutes,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename). Prevents corruption if the process
    /// crashes mid-write.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    pub fn symbol_spec(&self, symbol: &str) -> Option<&SymbolSpec> {
        self.symbols.get(symbol)
    }

    pub fn timeframe_seconds(&self) -> i64 {
        self.timeframe_minutes as i64 * 60
    }
}
