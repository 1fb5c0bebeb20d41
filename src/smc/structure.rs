// =============================================================================
// Market structure state machine — BOS/CHoCH tracking
// =============================================================================
//
// Runtime type-switching on structure state (as in the original Python,
// where state is a bare int) is replaced here with a tagged variant, per the
// redesign note: `Init`, `SeekingFirstBreak`, `Tracking { trend }`.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::candle::Candle;
use crate::smc::engine::find_structure_point;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineState {
    Init,
    SeekingFirstBreak,
    Tracking { trend: i8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StructureEvent {
    None,
    Bos,
    Choch,
    Sweep,
}

/// Per-symbol market structure state. Lives for the process lifetime and is
/// mutated only on candle close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Structure {
    pub state: MachineState,
    pub trend: i8,
    pub bos: Option<f64>,
    pub choch: Option<f64>,
    /// Running extreme of the current leg (highest high in an uptrend,
    /// lowest low in a downtrend).
    pub main: f64,
    /// Bar index of the current structure anchor.
    pub loc: usize,
    /// Bar index `main` was last updated at — distinct from `loc`, which
    /// only moves on a structure event.
    pub temp: usize,
    /// Extended anchor recorded when a sweep occurs.
    pub xloc: usize,
    pub last_event: StructureEvent,
    /// Running high of the current leg since the last crossover event.
    up: Option<f64>,
    /// Running low of the current leg since the last crossover event.
    dn: Option<f64>,
}

impl Default for Structure {
    fn default() -> Self {
        Self {
            state: MachineState::Init,
            trend: 0,
            bos: None,
            choch: None,
            main: 0.0,
            loc: 0,
            temp: 0,
            xloc: 0,
            last_event: StructureEvent::None,
            up: None,
            dn: None,
        }
    }
}

/// One candle's worth of structure-machine output: at most one bullish and
/// one bearish order block request, plus the event that fired.
#[derive(Debug, Clone, Copy)]
pub struct ObRequest {
    pub bullish: bool,
    /// Bar index the structure anchor was set at when the break occurred;
    /// used as the backward-search bound for the order block's origin.
    pub anchor: usize,
}

#[derive(Debug, Default, Clone)]
pub struct StepOutcome {
    /// Every order block requested on this candle — a bar can both break
    /// structure and flip trend via CHoCH, firing two requests.
    pub ob_requests: Vec<ObRequest>,
}

impl StepOutcome {
    fn one(req: ObRequest) -> Self {
        Self {
            ob_requests: vec![req],
        }
    }
}

impl Structure {
    /// Advances the state machine by one closed candle. `bar` is the
    /// absolute index of `candle` within the engine's full history.
    /// `candles` is the full history up to and including `bar`, needed for
    /// the backward structure-point searches done on a break.
    pub fn step(
        &mut self,
        candles: &[Candle],
        bar: usize,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        prev: Option<(f64, f64)>, // (prev_open, prev_close) for color confirmation
    ) -> StepOutcome {
        // Crossover tracking: the running high/low since the last time
        // either extreme was broken. Updated every candle regardless of
        // state.
        let up = *self.up.get_or_insert(high);
        let dn = *self.dn.get_or_insert(low);
        let mut crossup = false;
        let mut crossdn = false;
        if high > up {
            self.up = Some(high);
            self.dn = Some(low);
            crossup = true;
        }
        if low < dn {
            self.up = Some(high);
            self.dn = Some(low);
            crossdn = true;
        }

        match self.state {
            MachineState::Init => {
                self.bos = Some(high);
                self.choch = Some(low);
                self.main = 0.0;
                self.loc = bar;
                self.temp = bar;
                self.xloc = bar;
                self.state = MachineState::SeekingFirstBreak;
                StepOutcome::default()
            }
            MachineState::SeekingFirstBreak => self.step_seeking(bar, low, high, close),
            MachineState::Tracking { trend } => self.step_tracking(
                candles, bar, open, high, low, close, trend, prev, crossup, crossdn,
            ),
        }
    }

    fn step_seeking(&mut self, bar: usize, low: f64, high: f64, close: f64) -> StepOutcome {
        let choch = self.choch.expect("choch set after Init");
        let bos = self.bos.expect("bos set after Init");

        if low <= choch && close >= choch {
            self.choch = Some(low);
            self.xloc = bar;
            self.last_event = StructureEvent::Sweep;
            return StepOutcome::default();
        }
        if high >= bos && close <= bos {
            self.bos = Some(high);
            self.xloc = bar;
            self.last_event = StructureEvent::Sweep;
            return StepOutcome::default();
        }

        if close <= choch {
            // Bearish CHoCH: birth a bullish order block, flip trend down.
            let anchor = self.loc;
            self.trend = -1;
            self.choch = Some(bos);
            self.bos = None;
            self.loc = bar;
            self.main = low;
            self.temp = bar;
            self.xloc = bar;
            self.state = MachineState::Tracking { trend: -1 };
            self.last_event = StructureEvent::Choch;
            return StepOutcome::one(ObRequest {
                bullish: true,
                anchor,
            });
        }
        if close >= bos {
            let anchor = self.loc;
            self.trend = 1;
            // choch is left untouched: the opposite-side reference is
            // already the level that hasn't broken yet.
            self.bos = None;
            self.loc = bar;
            self.main = high;
            self.temp = bar;
            self.xloc = bar;
            self.state = MachineState::Tracking { trend: 1 };
            self.last_event = StructureEvent::Bos;
            return StepOutcome::one(ObRequest {
                bullish: false,
                anchor,
            });
        }

        StepOutcome::default()
    }

    #[allow(clippy::too_many_arguments)]
    fn step_tracking(
        &mut self,
        candles: &[Candle],
        bar: usize,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        trend: i8,
        prev: Option<(f64, f64)>,
        crossup: bool,
        crossdn: bool,
    ) -> StepOutcome {
        if trend == 1 {
            if high >= self.main {
                self.main = high;
                self.temp = bar;
            }
        } else if low <= self.main {
            self.main = low;
            self.temp = bar;
        }

        // BOS formation: the leg crosses its running extreme on a
        // trend-colored candle, confirmed by the previous candle also
        // closing in the trend direction.
        if self.bos.is_none() {
            let triggers = if trend == 1 {
                crossdn && close < open
            } else {
                crossup && close > open
            };
            if triggers {
                if let Some((prev_open, prev_close)) = prev {
                    let prev_confirms = if trend == 1 {
                        prev_close < prev_open
                    } else {
                        prev_close > prev_open
                    };
                    if prev_confirms {
                        self.bos = Some(self.main);
                        self.loc = self.temp;
                        self.xloc = self.loc;
                    }
                }
            }
        }

        let mut outcome = StepOutcome::default();

        // BOS break.
        if let Some(bos) = self.bos {
            if trend == 1 {
                if high >= bos && close <= bos {
                    self.bos = Some(high);
                    self.xloc = bar;
                    self.last_event = StructureEvent::Sweep;
                    return StepOutcome::default();
                }
            } else if low <= bos && close >= bos {
                self.bos = Some(low);
                self.xloc = bar;
                self.last_event = StructureEvent::Sweep;
                return StepOutcome::default();
            }

            let broke = if trend == 1 { close >= bos } else { close <= bos };
            if broke {
                let anchor = self.loc;
                // Re-derive the opposite-side reference from the actual
                // price structure rather than leaving it stale.
                let use_max = trend == -1;
                let offset = find_structure_point(candles, bar, self.loc, use_max);
                let origin_idx = bar - offset;
                let level = if use_max {
                    candles[origin_idx].high
                } else {
                    candles[origin_idx].low
                };
                self.xloc = bar;
                self.bos = None;
                self.choch = Some(level);
                self.loc = origin_idx;
                self.last_event = StructureEvent::Bos;
                outcome.ob_requests.push(ObRequest {
                    bullish: trend == 1,
                    anchor,
                });
            }
        }

        // CHoCH (trend flip). Runs unconditionally after the BOS-break
        // check above — a candle can both break BOS and flip trend.
        let choch_outcome = self.check_choch(candles, bar, high, low, close, trend);
        outcome.ob_requests.extend(choch_outcome.ob_requests);
        outcome
    }

    fn check_choch(
        &mut self,
        candles: &[Candle],
        bar: usize,
        high: f64,
        low: f64,
        close: f64,
        trend: i8,
    ) -> StepOutcome {
        let choch = match self.choch {
            Some(c) => c,
            None => return StepOutcome::default(),
        };

        if trend == 1 {
            if low <= choch && close >= choch {
                self.choch = Some(low);
                self.xloc = bar;
                self.last_event = StructureEvent::Sweep;
                return StepOutcome::default();
            }
            if close <= choch {
                let anchor = self.loc;
                let use_max = true;
                let offset = find_structure_point(candles, bar, self.loc, use_max);
                let origin_idx = bar - offset;
                let high_val = candles[origin_idx].high;
                self.choch = Some(match self.bos {
                    None => high_val,
                    Some(bos) => bos,
                });
                self.bos = None;
                self.trend = -1;
                self.main = low;
                self.loc = bar;
                self.temp = bar;
                self.xloc = bar;
                self.state = MachineState::Tracking { trend: -1 };
                self.last_event = StructureEvent::Choch;
                return StepOutcome::one(ObRequest {
                    bullish: false,
                    anchor,
                });
            }
        } else {
            if high >= choch && close <= choch {
                self.choch = Some(high);
                self.xloc = bar;
                self.last_event = StructureEvent::Sweep;
                return StepOutcome::default();
            }
            if close >= choch {
                let anchor = self.loc;
                let use_max = false;
                let offset = find_structure_point(candles, bar, self.loc, use_max);
                let origin_idx = bar - offset;
                let low_val = candles[origin_idx].low;
                self.choch = Some(match self.bos {
                    None => low_val,
                    Some(bos) => bos,
                });
                self.bos = None;
                self.trend = 1;
                self.main = high;
                self.loc = bar;
                self.temp = bar;
                self.xloc = bar;
                self.state = MachineState::Tracking { trend: 1 };
                self.last_event = StructureEvent::Choch;
                return StepOutcome::one(ObRequest {
                    bullish: true,
                    anchor,
                });
            }
        }

        StepOutcome::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            timestamp: 0,
            open,
            high,
            low,
            close,
            volume: 1.0,
            tick_count: 1,
        }
    }

    #[test]
    fn init_seeds_bos_and_choch_then_moves_to_seeking() {
        let mut s = Structure::default();
        let candles = vec![candle(100.0, 101.0, 99.0, 100.5)];
        s.step(&candles, 0, 100.0, 101.0, 99.0, 100.5, None);
        assert_eq!(s.state, MachineState::SeekingFirstBreak);
        assert_eq!(s.bos, Some(101.0));
        assert_eq!(s.choch, Some(99.0));
    }

    #[test]
    fn choch_break_flips_trend_and_requests_bullish_ob() {
        let mut s = Structure::default();
        let candles = vec![
            candle(100.0, 101.0, 99.0, 100.5),
            candle(99.0, 99.2, 95.0, 96.0),
        ];
        s.step(&candles[..1], 0, 100.0, 101.0, 99.0, 100.5, None);
        let out = s.step(&candles, 1, 99.0, 99.2, 95.0, 96.0, None);
        assert_eq!(out.ob_requests.len(), 1);
        assert!(out.ob_requests[0].bullish);
        assert_eq!(s.trend, -1);
        assert!(matches!(s.state, MachineState::Tracking { trend: -1 }));
        // Bearish CHoCH: new choch takes the old bos level, not the broken low.
        assert_eq!(s.choch, Some(101.0));
    }

    #[test]
    fn bullish_break_leaves_choch_untouched() {
        let mut s = Structure::default();
        let candles = vec![
            candle(100.0, 101.0, 99.0, 100.5),
            candle(101.0, 102.0, 100.5, 101.5),
        ];
        s.step(&candles[..1], 0, 100.0, 101.0, 99.0, 100.5, None);
        let out = s.step(&candles, 1, 101.0, 102.0, 100.5, 101.5, None);
        assert_eq!(out.ob_requests.len(), 1);
        assert!(!out.ob_requests[0].bullish);
        assert_eq!(s.trend, 1);
        // Bullish break is a no-op on choch: it still holds the original low.
        assert_eq!(s.choch, Some(99.0));
        assert_eq!(s.bos, None);
    }

    #[test]
    fn downsweep_extends_choch_without_ob() {
        let mut s = Structure::default();
        let candles = vec![
            candle(100.0, 101.0, 99.0, 100.5),
            candle(99.0, 100.0, 98.0, 99.5),
        ];
        // low dips to/below choch (99.0) but closes back above it.
        s.step(&candles[..1], 0, 100.0, 101.0, 99.0, 100.5, None);
        let out = s.step(&candles, 1, 99.0, 100.0, 98.0, 99.5, None);
        assert!(out.ob_requests.is_empty());
        assert_eq!(s.choch, Some(98.0));
        assert_eq!(s.last_event, StructureEvent::Sweep);
    }
}
