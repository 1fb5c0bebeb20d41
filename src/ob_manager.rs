// =============================================================================
// OBManager — multi-symbol registry of SMC engines
// =============================================================================
//
// Forwards closed candles to the right engine, tracks aggregate statistics,
// and exposes the cross-symbol query surface (active OBs, market structure,
// touch/penetration checks). State persistence is triggered explicitly by
// the caller through `StatePersistence` rather than an injected singleton —
// the source's `get_state_manager()` is replaced by an explicit parameter.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::candle::Candle;
use crate::smc::{EngineConfig, MarketStructureSnapshot, ObEvent, OrderBlock, SMCEngine};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ObManagerStats {
    pub obs_created: u64,
    pub obs_became_breaker: u64,
    pub obs_invalidated: u64,
    pub obs_by_symbol: HashMap<String, u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchDirection {
    Bullish,
    Bearish,
}

#[derive(Debug, Clone)]
pub struct TouchMatch {
    pub direction: TouchDirection,
    pub ob: OrderBlock,
    pub entry_level: f64,
}

pub struct OBManager {
    engines: RwLock<HashMap<String, SMCEngine>>,
    stats: RwLock<ObManagerStats>,
    engine_config: EngineConfig,
}

impl OBManager {
    pub fn new(engine_config: EngineConfig) -> Self {
        Self {
            engines: RwLock::new(HashMap::new()),
            stats: RwLock::new(ObManagerStats::default()),
            engine_config,
        }
    }

    pub fn register_symbol(&self, symbol: &str) {
        let mut engines = self.engines.write();
        engines
            .entry(symbol.to_string())
            .or_insert_with(|| SMCEngine::new(self.engine_config));
        self.stats
            .write()
            .obs_by_symbol
            .entry(symbol.to_string())
            .or_insert(0);
        info!(symbol, "registered symbol with OB manager");
    }

    /// Forwards a closed candle to the symbol's engine. Returns the events
    /// produced, which the caller dispatches (e.g. to cancel resting orders
    /// on `Invalidated`, or to persist a snapshot).
    pub fn on_candle_close(&self, symbol: &str, candle: Candle) -> Vec<ObEvent> {
        self.register_symbol(symbol);
        let events = {
            let mut engines = self.engines.write();
            let engine = engines.get_mut(symbol).expect("registered above");
            engine.process_candle(candle)
        };

        if !events.is_empty() {
            let mut stats = self.stats.write();
            for event in &events {
                match event {
                    ObEvent::Created { .. } => {
                        stats.obs_created += 1;
                        *stats.obs_by_symbol.entry(symbol.to_string()).or_insert(0) += 1;
                    }
                    ObEvent::BecameBreaker { .. } => stats.obs_became_breaker += 1,
                    ObEvent::Invalidated { .. } => stats.obs_invalidated += 1,
                }
            }
            debug!(symbol, event_count = events.len(), "candle close produced OB events");
        }

        events
    }

    pub fn active_obs(&self, symbol: &str) -> Option<(Vec<OrderBlock>, Vec<OrderBlock>)> {
        let engines = self.engines.read();
        engines.get(symbol).map(|e| {
            let (bull, bear) = e.active_obs();
            (bull.to_vec(), bear.to_vec())
        })
    }

    pub fn market_structure(&self, symbol: &str) -> Option<MarketStructureSnapshot> {
        self.engines.read().get(symbol).map(|e| e.market_structure())
    }

    /// Checks whether `price` has entered the penetration zone of any
    /// active order block. Bullish blocks are checked before bearish; the
    /// first match wins.
    pub fn touch_check(&self, symbol: &str, price: f64, penetration_pct: f64) -> Option<TouchMatch> {
        let engines = self.engines.read();
        let engine = engines.get(symbol)?;
        let (bullish, bearish) = engine.active_obs();

        for ob in bullish {
            let depth = (ob.top - ob.btm) * penetration_pct;
            let entry = ob.top - depth;
            if price <= entry {
                return Some(TouchMatch {
                    direction: TouchDirection::Bullish,
                    ob: ob.clone(),
                    entry_level: entry,
                });
            }
        }
        for ob in bearish {
            let depth = (ob.top - ob.btm) * penetration_pct;
            let entry = ob.btm + depth;
            if price >= entry {
                return Some(TouchMatch {
                    direction: TouchDirection::Bearish,
                    ob: ob.clone(),
                    entry_level: entry,
                });
            }
        }
        None
    }

    pub fn stats(&self) -> ObManagerStats {
        self.stats.read().clone()
    }
}
