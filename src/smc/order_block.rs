// =============================================================================
// Order Block — a price zone derived from the candle preceding a BOS/CHoCH
// =============================================================================

use serde::{Deserialize, Serialize};

/// The rule used to decide whether price has touched an order block deeply
/// enough to mitigate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MitigationRule {
    /// Uses candle open/close (the default).
    Close,
    /// Uses candle high/low.
    Wick,
    /// Uses the order block's own midpoint as the threshold.
    Avg,
}

impl Default for MitigationRule {
    fn default() -> Self {
        Self::Close
    }
}

/// Derived classification of an order block's lifecycle stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObType {
    Fresh,
    Breaker,
    Invalidated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBlock {
    pub bull: bool,
    pub top: f64,
    pub btm: f64,
    pub avg: f64,
    /// Origin bar index (the candle this OB was derived from).
    pub loc: usize,
    pub vol: f64,
    /// Origin candle color: +1 bullish close, -1 bearish close.
    pub dir: i8,
    pub is_breaker: bool,
    pub breaker_bar: Option<usize>,
    pub invalidated: bool,
    pub invalidation_bar: Option<usize>,
}

impl OrderBlock {
    pub fn new(bull: bool, top: f64, btm: f64, loc: usize, vol: f64, dir: i8) -> Self {
        debug_assert!(top > btm, "order block top must exceed btm");
        Self {
            bull,
            top,
            btm,
            avg: (top + btm) / 2.0,
            loc,
            vol,
            dir,
            is_breaker: false,
            breaker_bar: None,
            invalidated: false,
            invalidation_bar: None,
        }
    }

    pub fn ob_type(&self) -> ObType {
        if self.invalidated {
            ObType::Invalidated
        } else if self.is_breaker {
            ObType::Breaker
        } else {
            ObType::Fresh
        }
    }

    /// Applies one candle's open/high/low/close against the mitigation
    /// rule, transitioning `fresh -> breaker` or `breaker -> invalidated`.
    /// A block cannot transition on its own creation bar. Returns the
    /// transition that occurred, if any.
    pub fn check_mitigation(
        &mut self,
        bar: usize,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        rule: MitigationRule,
    ) -> Option<ObTransition> {
        if self.invalidated || bar == self.loc {
            return None;
        }

        if self.bull {
            if !self.is_breaker {
                let breached = match rule {
                    MitigationRule::Close => open.min(close) < self.btm,
                    MitigationRule::Wick => low < self.btm,
                    MitigationRule::Avg => open.min(close) < self.avg,
                };
                if breached {
                    self.is_breaker = true;
                    self.breaker_bar = Some(bar);
                    return Some(ObTransition::BecameBreaker);
                }
            } else {
                let breached = match rule {
                    MitigationRule::Close => open.max(close) > self.top,
                    MitigationRule::Wick => high > self.top,
                    MitigationRule::Avg => open.max(close) > self.avg,
                };
                if breached {
                    self.invalidated = true;
                    self.invalidation_bar = Some(bar);
                    return Some(ObTransition::Invalidated);
                }
            }
        } else if !self.is_breaker {
            let breached = match rule {
                MitigationRule::Close => open.max(close) > self.top,
                MitigationRule::Wick => high > self.top,
                MitigationRule::Avg => open.max(close) > self.avg,
            };
            if breached {
                self.is_breaker = true;
                self.breaker_bar = Some(bar);
                return Some(ObTransition::BecameBreaker);
            }
        } else {
            let breached = match rule {
                MitigationRule::Close => open.min(close) < self.btm,
                MitigationRule::Wick => low < self.btm,
                MitigationRule::Avg => open.min(close) < self.avg,
            };
            if breached {
                self.invalidated = true;
                self.invalidation_bar = Some(bar);
                return Some(ObTransition::Invalidated);
            }
        }

        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObTransition {
    BecameBreaker,
    Invalidated,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bullish_mitigation_to_breaker_to_invalidated() {
        // S4: active bullish OB top=100.4, btm=100.0.
        let mut ob = OrderBlock::new(true, 100.4, 100.0, 0, 0.0, 1);
        let t1 = ob.check_mitigation(1, 100.2, 100.2, 99.4, 99.5, MitigationRule::Close);
        assert_eq!(t1, Some(ObTransition::BecameBreaker));
        assert_eq!(ob.ob_type(), ObType::Breaker);

        let t2 = ob.check_mitigation(2, 100.1, 101.1, 100.0, 101.0, MitigationRule::Close);
        assert_eq!(t2, Some(ObTransition::Invalidated));
        assert_eq!(ob.ob_type(), ObType::Invalidated);
    }

    #[test]
    fn cannot_mitigate_on_creation_bar() {
        let mut ob = OrderBlock::new(true, 100.4, 100.0, 5, 0.0, 1);
        let t = ob.check_mitigation(5, 90.0, 90.0, 80.0, 80.0, MitigationRule::Close);
        assert_eq!(t, None);
    }

    #[test]
    fn invalidated_block_never_transitions_again() {
        let mut ob = OrderBlock::new(true, 100.4, 100.0, 0, 0.0, 1);
        ob.check_mitigation(1, 100.2, 100.2, 99.4, 99.5, MitigationRule::Close);
        ob.check_mitigation(2, 100.1, 101.1, 100.0, 101.0, MitigationRule::Close);
        let t3 = ob.check_mitigation(3, 50.0, 50.0, 10.0, 10.0, MitigationRule::Close);
        assert_eq!(t3, None);
    }

    #[test]
    fn bearish_mitigation_mirrors_bullish() {
        let mut ob = OrderBlock::new(false, 100.0, 99.0, 0, 0.0, -1);
        let t1 = ob.check_mitigation(1, 99.5, 99.6, 99.3, 100.2, MitigationRule::Close);
        assert_eq!(t1, Some(ObTransition::BecameBreaker));
        let t2 = ob.check_mitigation(2, 99.2, 99.3, 98.0, 98.5, MitigationRule::Close);
        assert_eq!(t2, Some(ObTransition::Invalidated));
    }
}
