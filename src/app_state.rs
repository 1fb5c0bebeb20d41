// =============================================================================
// Central application state — composition root tying the engine together
// =============================================================================
//
// AppState owns the long-lived subsystems every task needs a handle to: the
// per-symbol SMC engines (via `OBManager`), one `PositionTracker` and
// `OrderTracker` per configured sub-account, the runtime configuration, and
// the state persistence layer. Each subsystem manages its own interior
// mutability; `AppState` itself is immutable once constructed and is always
// shared behind `Arc`.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::ob_manager::OBManager;
use crate::order::OrderTracker;
use crate::persistence::StatePersistence;
use crate::position::PositionTracker;
use crate::runtime_config::RuntimeConfig;
use crate::smc::EngineConfig;

pub struct AppState {
    /// Monotonically increasing version counter, bumped on every meaningful
    /// state mutation so downstream consumers can detect staleness.
    pub state_version: AtomicU64,

    pub runtime_config: RwLock<RuntimeConfig>,
    pub ob_manager: Arc<OBManager>,

    /// Keyed by sub-account name, mirroring `runtime_config.sub_accounts`.
    pub position_trackers: HashMap<String, Arc<PositionTracker>>,
    pub order_trackers: HashMap<String, Arc<RwLock<OrderTracker>>>,

    pub persistence: Arc<StatePersistence>,
}

impl AppState {
    pub fn new(config: RuntimeConfig, engine_config: EngineConfig, persistence: StatePersistence) -> Self {
        let mut position_trackers = HashMap::new();
        let mut order_trackers = HashMap::new();

        for (account_name, account_config) in &config.sub_accounts {
            let tracker = PositionTracker::new(
                account_name.clone(),
                account_config.symbols.clone(),
                account_config.initial_capital_per_symbol,
            );
            position_trackers.insert(account_name.clone(), Arc::new(tracker));
            order_trackers.insert(
                account_name.clone(),
                Arc::new(RwLock::new(OrderTracker::new(account_name.clone()))),
            );
        }

        let ob_manager = Arc::new(OBManager::new(engine_config));
        for symbol in config.symbols.keys() {
            ob_manager.register_symbol(symbol);
        }

        info!(
            sub_accounts = position_trackers.len(),
            symbols = config.symbols.len(),
            "application state initialized"
        );

        Self {
            state_version: AtomicU64::new(1),
            runtime_config: RwLock::new(config),
            ob_manager,
            position_trackers,
            order_trackers,
            persistence: Arc::new(persistence),
        }
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    pub fn position_tracker(&self, account: &str) -> Option<&Arc<PositionTracker>> {
        self.position_trackers.get(account)
    }

    pub fn order_tracker(&self, account: &str) -> Option<&Arc<RwLock<OrderTracker>>> {
        self.order_trackers.get(account)
    }

    /// Snapshots every sub-account's positions to its own file and the
    /// shared OB manager's aggregate stats, using the same atomic-write
    /// path for every file.
    pub fn persist_all(&self) -> crate::errors::EngineResult<()> {
        for (account, tracker) in &self.position_trackers {
            let filename = StatePersistence::positions_filename(account);
            self.persistence.atomic_write(&filename, &tracker.snapshot())?;
        }
        let ob_stats = self.ob_manager.stats();
        self.persistence.atomic_write(&StatePersistence::capital_filename(), &ob_stats)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime_config::{ObClassParams, SubAccountConfig, SymbolSpec};

    fn test_config() -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        config.symbols.insert(
            "SOLUSD".to_string(),
            SymbolSpec {
                product_id: 1,
                qty_per_contract: 1.0,
                min_quantity: 1,
                tick_size: 0.01,
            },
        );
        config.sub_accounts.insert(
            "account_1".to_string(),
            SubAccountConfig {
                fresh: ObClassParams {
                    position_size_pct: 0.40,
                    leverage: 20.0,
                },
                breaker: ObClassParams {
                    position_size_pct: 0.30,
                    leverage: 10.0,
                },
                initial_capital_per_symbol: 100.0,
                symbols: vec!["SOLUSD".to_string()],
            },
        );
        config
    }

    #[test]
    fn builds_one_tracker_pair_per_sub_account() {
        let dir = std::env::temp_dir().join(format!("smc_appstate_test_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let persistence = StatePersistence::new(&dir).unwrap();

        let state = AppState::new(test_config(), EngineConfig::default(), persistence);
        assert!(state.position_tracker("account_1").is_some());
        assert!(state.order_tracker("account_1").is_some());
        assert_eq!(
            state.position_tracker("account_1").unwrap().capital_for("SOLUSD"),
            100.0
        );

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn version_counter_increments() {
        let dir = std::env::temp_dir().join(format!("smc_appstate_version_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let persistence = StatePersistence::new(&dir).unwrap();
        let state = AppState::new(test_config(), EngineConfig::default(), persistence);
        assert_eq!(state.current_state_version(), 1);
        state.increment_version();
        assert_eq!(state.current_state_version(), 2);
        std::fs::remove_dir_all(&dir).ok();
    }
}
