// =============================================================================
// SMCEngine — one per symbol
// =============================================================================
//
// Maintains the full (unbounded) candle history, ATR, pivots, the BOS/CHoCH
// structure machine, and the live/historical order block lists. On each
// closed candle it produces zero or more events, delivered in the order
// they occur: creation on this bar always precedes mitigation checks on this
// bar, and a freshly created block can never be mitigated on its own bar.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::candle::Candle;
use crate::smc::atr::calculate_atr;
use crate::smc::order_block::{MitigationRule, ObTransition, OrderBlock};
use crate::smc::pivots::{is_pivot_high, is_pivot_low};
use crate::smc::structure::{MachineState, ObRequest, Structure, StructureEvent};

pub const MIN_CANDLES_FOR_ATR: usize = 200;
const DEFAULT_MSLEN: usize = 5;
const DEFAULT_ATR_LEN: f64 = 5.0;

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub mslen: usize,
    pub atr_len: f64,
    pub mitigation_rule: MitigationRule,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mslen: DEFAULT_MSLEN,
            atr_len: DEFAULT_ATR_LEN,
            mitigation_rule: MitigationRule::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ObEvent {
    Created { bull: bool, ob: OrderBlock },
    BecameBreaker { bull: bool, ob: OrderBlock },
    Invalidated { bull: bool, ob: OrderBlock },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketStructureSnapshot {
    pub trend: i8,
    pub bos_level: Option<f64>,
    pub choch_level: Option<f64>,
    pub last_event: StructureEvent,
}

pub struct SMCEngine {
    config: EngineConfig,
    candles: Vec<Candle>,
    structure: Structure,
    bullish_active: Vec<OrderBlock>,
    bearish_active: Vec<OrderBlock>,
    bullish_all: Vec<OrderBlock>,
    bearish_all: Vec<OrderBlock>,
    /// `(bar, price)` pairs, confirmable `mslen` bars after the fact.
    /// Nothing downstream consumes these yet.
    pivot_highs: Vec<(usize, f64)>,
    pivot_lows: Vec<(usize, f64)>,
}

impl SMCEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            candles: Vec::new(),
            structure: Structure::default(),
            bullish_active: Vec::new(),
            bearish_active: Vec::new(),
            bullish_all: Vec::new(),
            bearish_all: Vec::new(),
            pivot_highs: Vec::new(),
            pivot_lows: Vec::new(),
        }
    }

    pub fn pivot_highs(&self) -> &[(usize, f64)] {
        &self.pivot_highs
    }

    pub fn pivot_lows(&self) -> &[(usize, f64)] {
        &self.pivot_lows
    }

    pub fn candle_count(&self) -> usize {
        self.candles.len()
    }

    pub fn active_obs(&self) -> (&[OrderBlock], &[OrderBlock]) {
        (&self.bullish_active, &self.bearish_active)
    }

    pub fn all_obs(&self) -> (&[OrderBlock], &[OrderBlock]) {
        (&self.bullish_all, &self.bearish_all)
    }

    pub fn market_structure(&self) -> MarketStructureSnapshot {
        MarketStructureSnapshot {
            trend: self.structure.trend,
            bos_level: self.structure.bos,
            choch_level: self.structure.choch,
            last_event: self.structure.last_event,
        }
    }

    /// Processes one closed candle, returning every event it produced in
    /// order. Buffers silently (emitting nothing) until 200 candles exist.
    pub fn process_candle(&mut self, candle: Candle) -> Vec<ObEvent> {
        self.candles.push(candle);
        let bar = self.candles.len() - 1;

        if self.candles.len() < MIN_CANDLES_FOR_ATR {
            return Vec::new();
        }

        let atr = calculate_atr(&self.candles, self.config.atr_len)
            .expect("atr available once window fills");

        let (open, high, low, close) = {
            let c = &self.candles[bar];
            (c.open, c.high, c.low, c.close)
        };
        let prev = if bar > 0 {
            let p = &self.candles[bar - 1];
            Some((p.open, p.close))
        } else {
            None
        };

        self.detect_pivots(bar);

        let mut events = Vec::new();

        let outcome = self.structure.step(&self.candles, bar, open, high, low, close, prev);
        for req in outcome.ob_requests {
            let ob = self.create_order_block(bar, req, atr);
            let bull = ob.bull;
            if bull {
                self.bullish_active.insert(0, ob.clone());
                self.bullish_all.insert(0, ob.clone());
            } else {
                self.bearish_active.insert(0, ob.clone());
                self.bearish_all.insert(0, ob.clone());
            }
            events.push(ObEvent::Created { bull, ob });
        }

        self.run_mitigation(bar, open, high, low, close, &mut events);

        events
    }

    /// Confirms a pivot `mslen` bars back, once both of its windows are
    /// fully known. Runs unconditionally on every candle, same as the
    /// structure machine, even though nothing downstream reads the result
    /// yet.
    fn detect_pivots(&mut self, bar: usize) {
        let mslen = self.config.mslen;
        if bar < mslen {
            return;
        }
        let center = bar - mslen;
        if is_pivot_high(&self.candles, center, mslen) {
            self.pivot_highs.push((center, self.candles[center].high));
        }
        if is_pivot_low(&self.candles, center, mslen) {
            self.pivot_lows.push((center, self.candles[center].low));
        }
    }

    fn create_order_block(&self, bar: usize, req: ObRequest, atr: f64) -> OrderBlock {
        // Opposite-direction search: a bullish OB anchors on the lowest low
        // since the anchor; a bearish OB anchors on the highest high.
        let use_max = !req.bullish;
        let offset = find_structure_point(&self.candles, bar, req.anchor, use_max);
        let origin_idx = bar - offset;
        let origin = &self.candles[origin_idx];

        let (top, btm) = if req.bullish {
            let btm = origin.low;
            let top = origin.high.min(origin.low + atr);
            (top, btm)
        } else {
            let top = origin.high;
            let btm = origin.low.max(origin.high - atr);
            (top, btm)
        };
        let dir = if origin.close >= origin.open { 1 } else { -1 };

        OrderBlock::new(req.bullish, top, btm, origin_idx, origin.volume, dir)
    }

    fn run_mitigation(
        &mut self,
        bar: usize,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        events: &mut Vec<ObEvent>,
    ) {
        let rule = self.config.mitigation_rule;

        mitigate_list(&mut self.bullish_active, bar, open, high, low, close, rule, true, events);
        mitigate_list(&mut self.bearish_active, bar, open, high, low, close, rule, false, events);

        sync_invalidations(&self.bullish_active, &mut self.bullish_all);
        sync_invalidations(&self.bearish_active, &mut self.bearish_all);

        self.bullish_active.retain(|ob| !ob.invalidated);
        self.bearish_active.retain(|ob| !ob.invalidated);
    }

    pub fn structure_state(&self) -> MachineState {
        self.structure.state
    }
}

fn mitigate_list(
    list: &mut [OrderBlock],
    bar: usize,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    rule: MitigationRule,
    bull: bool,
    events: &mut Vec<ObEvent>,
) {
    for ob in list.iter_mut() {
        if let Some(transition) = ob.check_mitigation(bar, open, high, low, close, rule) {
            match transition {
                ObTransition::BecameBreaker => {
                    events.push(ObEvent::BecameBreaker {
                        bull,
                        ob: ob.clone(),
                    });
                }
                ObTransition::Invalidated => {
                    events.push(ObEvent::Invalidated {
                        bull,
                        ob: ob.clone(),
                    });
                }
            }
        }
    }
}

fn sync_invalidations(active: &[OrderBlock], all: &mut [OrderBlock]) {
    for ob in active {
        if ob.invalidated {
            if let Some(hist) = all.iter_mut().find(|h| h.loc == ob.loc && h.bull == ob.bull) {
                *hist = ob.clone();
            }
        } else if ob.is_breaker {
            if let Some(hist) = all.iter_mut().find(|h| h.loc == ob.loc && h.bull == ob.bull) {
                *hist = ob.clone();
            }
        }
    }
}

/// Searches backward from `current_bar` toward `anchor` for the most
/// extreme price in the search direction, then applies the length
/// adjustment: if the bar one step closer to `current_bar` than the found
/// extremum is itself more extreme in the same direction, the search
/// shifts to that bar instead. Returns the offset from `current_bar`.
pub(crate) fn find_structure_point(candles: &[Candle], current_bar: usize, anchor: usize, use_max: bool) -> usize {
    let search_range = current_bar.saturating_sub(anchor).max(1);

    let mut best_offset = 0usize;
    let mut best_val = if use_max {
        candles[current_bar].high
    } else {
        candles[current_bar].low
    };

    for i in 1..=search_range {
        if i > current_bar {
            break;
        }
        let idx = current_bar - i;
        let val = if use_max { candles[idx].high } else { candles[idx].low };
        let better = if use_max { val > best_val } else { val < best_val };
        if better {
            best_val = val;
            best_offset = i;
        }
    }

    if best_offset > 0 {
        let k = current_bar - best_offset;
        let next_idx = k + 1;
        if next_idx < candles.len() && next_idx <= current_bar {
            let next_val = if use_max {
                candles[next_idx].high
            } else {
                candles[next_idx].low
            };
            let next_better = if use_max {
                next_val > best_val
            } else {
                next_val < best_val
            };
            if next_better {
                best_offset -= 1;
            }
        }
    }

    best_offset
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_candle(i: usize, price: f64) -> Candle {
        Candle {
            timestamp: i as i64 * 900,
            open: price,
            high: price + 0.1,
            low: price - 0.1,
            close: price,
            volume: 1.0,
            tick_count: 1,
        }
    }

    #[test]
    fn buffers_silently_until_200_candles() {
        let mut engine = SMCEngine::new(EngineConfig::default());
        for i in 0..199 {
            let events = engine.process_candle(flat_candle(i, 100.0));
            assert!(events.is_empty());
        }
        assert_eq!(engine.candle_count(), 199);
    }

    #[test]
    fn pivot_detection_is_reachable_from_process_candle() {
        let mut engine = SMCEngine::new(EngineConfig::default());
        for i in 0..221 {
            let price = if i == 205 { 110.0 } else { 100.0 };
            engine.process_candle(flat_candle(i, price));
        }
        assert!(engine.pivot_highs().iter().any(|&(bar, _)| bar == 205));
    }

    #[test]
    fn find_structure_point_picks_extremum_in_range() {
        let candles = vec![
            flat_candle(0, 100.0),
            flat_candle(1, 95.0),
            flat_candle(2, 97.0),
            flat_candle(3, 99.0),
        ];
        // Searching for the lowest low between anchor=0 and current_bar=3.
        let offset = find_structure_point(&candles, 3, 0, false);
        // bar 1 (offset 2) has the lowest low of 94.9; length adjustment
        // only shifts toward bar 2 if bar 2 is *more* extreme, which it
        // isn't, so the offset should point at bar 1.
        assert_eq!(3 - offset, 1);
    }
}
