// =============================================================================
// Position tracking and sizing — per sub-account capital and position ledger
// =============================================================================
//
// One `PositionTracker` per sub-account. Capital is tracked per symbol, never
// debited on open — only credited (or debited, on a loss) when a position
// closes or partially exits. At most one open position per symbol per
// tracker; the same symbol may be open simultaneously across two different
// sub-accounts, since each owns an independent tracker.
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::{EngineError, EngineResult};

/// Capital allocation and leverage for a given order-block freshness class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObClass {
    Fresh,
    Breaker,
}

#[derive(Debug, Clone, Copy)]
pub struct SizingParams {
    pub position_size_pct: f64,
    pub leverage: f64,
}

impl SizingParams {
    pub fn for_class(class: ObClass) -> Self {
        match class {
            ObClass::Fresh => Self {
                position_size_pct: 0.40,
                leverage: 20.0,
            },
            ObClass::Breaker => Self {
                position_size_pct: 0.30,
                leverage: 10.0,
            },
        }
    }
}

/// Per-symbol contract specification used for sizing.
#[derive(Debug, Clone, Copy)]
pub struct SymbolSpec {
    pub qty_per_contract: f64,
    pub min_quantity: u64,
}

/// Result of a successful position-size calculation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizingResult {
    pub contracts: u64,
    pub position_value: f64,
    pub capital_used: f64,
}

/// Computes the maximum whole-contract position fitting within the
/// leveraged buying power for `capital`, rounded down. Returns `None` when
/// the resulting size is below the symbol's minimum order quantity.
pub fn calculate_position(
    capital: f64,
    class: ObClass,
    entry_price: f64,
    spec: SymbolSpec,
) -> EngineResult<Option<SizingResult>> {
    if capital <= 0.0 {
        return Err(EngineError::InputInvalid(format!("capital must be positive: {capital}")));
    }
    if entry_price <= 0.0 {
        return Err(EngineError::InputInvalid(format!(
            "entry price must be positive: {entry_price}"
        )));
    }

    let params = SizingParams::for_class(class);
    let capital_to_use = capital * params.position_size_pct;
    let buying_power = capital_to_use * params.leverage;
    let max_position_size = buying_power / entry_price;
    let max_contracts = (max_position_size / spec.qty_per_contract).floor();

    if max_contracts < 0.0 || (max_contracts as u64) < spec.min_quantity {
        warn!(
            max_contracts,
            min_quantity = spec.min_quantity,
            "insufficient capital for minimum order size"
        );
        return Ok(None);
    }

    let contracts = max_contracts as u64;
    let position_value = contracts as f64 * spec.qty_per_contract * entry_price;
    let capital_used = position_value / params.leverage;

    Ok(Some(SizingResult {
        contracts,
        position_value,
        capital_used,
    }))
}

/// Liquidation threshold fraction applied against the entry price, minus a
/// 5% safety buffer for fees (`safety_factor = 0.95`).
const LIQUIDATION_SAFETY_FACTOR: f64 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

/// `entry * (1 - threshold)` for longs, `entry * (1 + threshold)` for
/// shorts, where `threshold = (1/leverage) * 0.95`.
pub fn calculate_liquidation_level(entry_price: f64, direction: Direction, leverage: f64) -> f64 {
    let threshold = (1.0 / leverage) * LIQUIDATION_SAFETY_FACTOR;
    match direction {
        Direction::Long => entry_price * (1.0 - threshold),
        Direction::Short => entry_price * (1.0 + threshold),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub size: u64,
    pub entry_time: String,
    pub ob_class: ObClass,
    pub leverage: f64,
    pub capital_used: f64,
    pub position_value: f64,
    pub liquidation_level: f64,
    pub ob_top: f64,
    pub ob_btm: f64,
    pub ob_creation_bar: usize,
    pub entry_bar: usize,
    #[serde(default)]
    pub highest_price: Option<f64>,
    #[serde(default)]
    pub lowest_price: Option<f64>,
    #[serde(default)]
    pub trailing_sl: Option<f64>,
    #[serde(default)]
    pub partial_exited: bool,
    #[serde(default)]
    pub partial_exit_price: Option<f64>,
    #[serde(default)]
    pub remaining_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedPosition {
    #[serde(flatten)]
    pub position: Position,
    pub exit_price: f64,
    pub exit_time: String,
    pub exit_reason: String,
    pub exit_bar: usize,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub fees: f64,
    pub capital_after: f64,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct SymbolStats {
    trades: u64,
    wins: u64,
    losses: u64,
    pnl: f64,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Statistics {
    pub account: String,
    pub total_trades: u64,
    pub winning_trades: u64,
    pub losing_trades: u64,
    pub win_rate_pct: f64,
    pub total_pnl: f64,
    pub total_fees: f64,
    pub net_pnl: f64,
    pub total_capital: f64,
    pub initial_capital: f64,
    pub total_return_pct: f64,
    pub open_positions: usize,
}

#[derive(Serialize, Deserialize)]
struct PersistedState {
    account_name: String,
    symbols: Vec<String>,
    capital: HashMap<String, f64>,
    peak_capital: HashMap<String, f64>,
    positions: HashMap<String, Position>,
    closed_positions: Vec<ClosedPosition>,
}

/// Tracks open positions and per-symbol capital for a single sub-account.
/// Every mutating method acquires the write lock for the smallest scope it
/// can; callers never see partially-updated state.
pub struct PositionTracker {
    account_name: String,
    symbols: Vec<String>,
    initial_capital_per_symbol: f64,
    capital: RwLock<HashMap<String, f64>>,
    peak_capital: RwLock<HashMap<String, f64>>,
    positions: RwLock<HashMap<String, Position>>,
    closed_positions: RwLock<Vec<ClosedPosition>>,
    stats_by_symbol: RwLock<HashMap<String, SymbolStats>>,
}

impl PositionTracker {
    pub fn new(account_name: impl Into<String>, symbols: Vec<String>, initial_capital_per_symbol: f64) -> Self {
        let account_name = account_name.into();
        let capital = symbols
            .iter()
            .map(|s| (s.clone(), initial_capital_per_symbol))
            .collect::<HashMap<_, _>>();
        let peak_capital = capital.clone();
        let stats_by_symbol = symbols
            .iter()
            .map(|s| (s.clone(), SymbolStats::default()))
            .collect();

        info!(account = %account_name, ?symbols, initial_capital_per_symbol, "position tracker initialized");

        Self {
            account_name,
            symbols,
            initial_capital_per_symbol,
            capital: RwLock::new(capital),
            peak_capital: RwLock::new(peak_capital),
            positions: RwLock::new(HashMap::new()),
            closed_positions: RwLock::new(Vec::new()),
            stats_by_symbol: RwLock::new(stats_by_symbol),
        }
    }

    pub fn capital_for(&self, symbol: &str) -> f64 {
        self.capital.read().get(symbol).copied().unwrap_or(0.0)
    }

    pub fn total_capital(&self) -> f64 {
        self.capital.read().values().sum()
    }

    pub fn has_position(&self, symbol: &str) -> bool {
        self.positions.read().contains_key(symbol)
    }

    pub fn position(&self, symbol: &str) -> Option<Position> {
        self.positions.read().get(symbol).cloned()
    }

    pub fn can_enter(&self, symbol: &str, required_capital: f64) -> Result<(), String> {
        if !self.symbols.iter().any(|s| s == symbol) {
            return Err(format!("symbol {symbol} not tracked by account {}", self.account_name));
        }
        if self.has_position(symbol) {
            return Err(format!("already has an open position in {symbol}"));
        }
        let available = self.capital_for(symbol);
        if required_capital > 0.0 && available < required_capital {
            return Err(format!(
                "insufficient capital: need {required_capital:.2}, have {available:.2}"
            ));
        }
        Ok(())
    }

    /// One position per symbol. Does not touch capital: the ledger is only
    /// adjusted on close or partial exit.
    pub fn open_position(&self, position: Position) -> EngineResult<()> {
        self.can_enter(&position.symbol, position.capital_used)
            .map_err(EngineError::InvariantViolation)?;

        let symbol = position.symbol.clone();
        info!(
            account = %self.account_name,
            symbol = %symbol,
            direction = ?position.direction,
            size = position.size,
            entry_price = position.entry_price,
            "position opened"
        );
        self.positions.write().insert(symbol, position);
        Ok(())
    }

    pub fn update_position(&self, symbol: &str, f: impl FnOnce(&mut Position)) -> bool {
        let mut positions = self.positions.write();
        match positions.get_mut(symbol) {
            Some(pos) => {
                f(pos);
                true
            }
            None => {
                warn!(symbol, "cannot update: no open position");
                false
            }
        }
    }

    pub fn partial_exit(&self, symbol: &str, exit_price: f64, exit_size: u64, pnl: f64, fees: f64) -> bool {
        let mut positions = self.positions.write();
        let Some(pos) = positions.get_mut(symbol) else {
            warn!(symbol, "cannot partial exit: no open position");
            return false;
        };
        pos.partial_exited = true;
        pos.partial_exit_price = Some(exit_price);
        pos.remaining_size = pos.size.saturating_sub(exit_size);
        drop(positions);

        *self.capital.write().entry(symbol.to_string()).or_insert(0.0) += pnl - fees;

        info!(
            account = %self.account_name,
            symbol,
            exit_size,
            exit_price,
            pnl,
            fees,
            "partial exit recorded"
        );
        true
    }

    /// Closes a position, updating the capital ledger, peak capital, and
    /// per-symbol win/loss statistics, then moves it into history.
    pub fn close_position(
        &self,
        symbol: &str,
        exit_price: f64,
        exit_reason: &str,
        pnl: f64,
        fees: f64,
        exit_bar: usize,
    ) -> Option<ClosedPosition> {
        let position = self.positions.write().remove(symbol)?;

        let pnl_pct = if position.capital_used > 0.0 {
            (pnl / position.capital_used) * 100.0
        } else {
            0.0
        };

        let capital_after = {
            let mut capital = self.capital.write();
            let entry = capital.entry(symbol.to_string()).or_insert(0.0);
            *entry += pnl - fees;
            let after = *entry;
            let mut peak = self.peak_capital.write();
            let peak_entry = peak.entry(symbol.to_string()).or_insert(after);
            if after > *peak_entry {
                *peak_entry = after;
            }
            after
        };

        {
            let mut stats = self.stats_by_symbol.write();
            let entry = stats.entry(symbol.to_string()).or_default();
            entry.trades += 1;
            entry.pnl += pnl;
            if pnl > 0.0 {
                entry.wins += 1;
            } else {
                entry.losses += 1;
            }
        }

        let closed = ClosedPosition {
            position,
            exit_price,
            exit_time: Utc::now().to_rfc3339(),
            exit_reason: exit_reason.to_string(),
            exit_bar,
            pnl,
            pnl_pct,
            fees,
            capital_after,
        };

        info!(
            account = %self.account_name,
            symbol,
            result = if pnl > 0.0 { "win" } else { "loss" },
            pnl,
            pnl_pct,
            exit_reason,
            "position closed"
        );

        self.closed_positions.write().push(closed.clone());
        Some(closed)
    }

    pub fn statistics(&self) -> Statistics {
        let total_capital = self.total_capital();
        let initial_capital = self.initial_capital_per_symbol * self.symbols.len() as f64;
        let total_return_pct = if initial_capital > 0.0 {
            (total_capital - initial_capital) / initial_capital * 100.0
        } else {
            0.0
        };

        let stats = self.stats_by_symbol.read();
        let (total_trades, wins, losses, total_pnl) = stats.values().fold(
            (0u64, 0u64, 0u64, 0.0f64),
            |(t, w, l, pnl), s| (t + s.trades, w + s.wins, l + s.losses, pnl + s.pnl),
        );
        let total_fees = self
            .closed_positions
            .read()
            .iter()
            .map(|c| c.fees)
            .sum::<f64>();
        let win_rate_pct = if total_trades > 0 {
            wins as f64 / total_trades as f64 * 100.0
        } else {
            0.0
        };

        Statistics {
            account: self.account_name.clone(),
            total_trades,
            winning_trades: wins,
            losing_trades: losses,
            win_rate_pct,
            total_pnl,
            total_fees,
            net_pnl: total_pnl - total_fees,
            total_capital,
            initial_capital,
            total_return_pct,
            open_positions: self.positions.read().len(),
        }
    }

    pub fn snapshot(&self) -> serde_json::Value {
        let state = PersistedState {
            account_name: self.account_name.clone(),
            symbols: self.symbols.clone(),
            capital: self.capital.read().clone(),
            peak_capital: self.peak_capital.read().clone(),
            positions: self.positions.read().clone(),
            closed_positions: self.closed_positions.read().clone(),
        };
        serde_json::to_value(state).expect("position state always serializes")
    }

    pub fn restore(&self, snapshot: serde_json::Value) -> EngineResult<()> {
        let state: PersistedState = serde_json::from_value(snapshot)
            .map_err(|e| EngineError::StateCorruption(e.to_string()))?;
        *self.capital.write() = state.capital;
        *self.peak_capital.write() = state.peak_capital;
        *self.positions.write() = state.positions;
        *self.closed_positions.write() = state.closed_positions;
        Ok(())
    }
}

/// Rounds `value` to the nearest multiple of `tick_size` using half-away-
/// from-zero rounding, the standard exchange convention when the source
/// was silent on the tie-breaking rule.
pub fn round_to_tick(value: f64, tick_size: f64) -> f64 {
    if tick_size <= 0.0 {
        return value;
    }
    let units = value / tick_size;
    let rounded = if units >= 0.0 {
        (units + 0.5).floor()
    } else {
        (units - 0.5).ceil()
    };
    rounded * tick_size
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> SymbolSpec {
        SymbolSpec {
            qty_per_contract: 1.0,
            min_quantity: 1,
        }
    }

    #[test]
    fn fresh_ob_sizing_matches_reference_example() {
        // capital=1000, fresh OB (40%, 20x), entry=150.50 -> 53 contracts.
        let result = calculate_position(1000.0, ObClass::Fresh, 150.50, spec())
            .unwrap()
            .unwrap();
        assert_eq!(result.contracts, 53);
        assert!((result.position_value - 7976.5).abs() < 1e-6);
    }

    #[test]
    fn breaker_ob_uses_lower_allocation_and_leverage() {
        let result = calculate_position(1000.0, ObClass::Breaker, 150.50, spec())
            .unwrap()
            .unwrap();
        // 1000 * 0.30 * 10 / 150.50 = 19.93 -> 19 contracts.
        assert_eq!(result.contracts, 19);
    }

    #[test]
    fn below_minimum_quantity_returns_none() {
        let tiny_spec = SymbolSpec {
            qty_per_contract: 1.0,
            min_quantity: 1000,
        };
        let result = calculate_position(1000.0, ObClass::Fresh, 150.50, tiny_spec).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn non_positive_capital_is_rejected() {
        assert!(calculate_position(0.0, ObClass::Fresh, 150.0, spec()).is_err());
    }

    #[test]
    fn liquidation_level_long_vs_short() {
        let long_liq = calculate_liquidation_level(150.0, Direction::Long, 20.0);
        let short_liq = calculate_liquidation_level(150.0, Direction::Short, 20.0);
        assert!((long_liq - 142.875).abs() < 1e-6);
        assert!((short_liq - 157.125).abs() < 1e-6);
    }

    #[test]
    fn capital_is_never_debited_on_open_only_on_close() {
        let tracker = PositionTracker::new("account_1", vec!["SOLUSD".to_string()], 100.0);
        let pos = Position {
            symbol: "SOLUSD".to_string(),
            direction: Direction::Long,
            entry_price: 150.0,
            size: 10,
            entry_time: "t0".to_string(),
            ob_class: ObClass::Fresh,
            leverage: 20.0,
            capital_used: 75.0,
            position_value: 1500.0,
            liquidation_level: 142.875,
            ob_top: 151.0,
            ob_btm: 149.0,
            ob_creation_bar: 5,
            entry_bar: 6,
            highest_price: None,
            lowest_price: None,
            trailing_sl: None,
            partial_exited: false,
            partial_exit_price: None,
            remaining_size: 10,
        };
        tracker.open_position(pos).unwrap();
        assert_eq!(tracker.capital_for("SOLUSD"), 100.0);

        tracker.close_position("SOLUSD", 155.0, "take_profit", 50.0, 2.0, 7);
        assert_eq!(tracker.capital_for("SOLUSD"), 148.0);
        assert!(!tracker.has_position("SOLUSD"));
    }

    #[test]
    fn one_position_per_symbol_is_enforced() {
        let tracker = PositionTracker::new("account_1", vec!["SOLUSD".to_string()], 100.0);
        let pos = Position {
            symbol: "SOLUSD".to_string(),
            direction: Direction::Long,
            entry_price: 150.0,
            size: 10,
            entry_time: "t0".to_string(),
            ob_class: ObClass::Fresh,
            leverage: 20.0,
            capital_used: 75.0,
            position_value: 1500.0,
            liquidation_level: 142.875,
            ob_top: 151.0,
            ob_btm: 149.0,
            ob_creation_bar: 5,
            entry_bar: 6,
            highest_price: None,
            lowest_price: None,
            trailing_sl: None,
            partial_exited: false,
            partial_exit_price: None,
            remaining_size: 10,
        };
        tracker.open_position(pos.clone()).unwrap();
        assert!(tracker.open_position(pos).is_err());
    }

    #[test]
    fn half_away_from_zero_tick_rounding() {
        assert!((round_to_tick(100.25, 0.5) - 100.5).abs() < 1e-9);
        assert!((round_to_tick(100.24, 0.5) - 100.0).abs() < 1e-9);
        assert!((round_to_tick(-100.25, 0.5) - (-100.5)).abs() < 1e-9);
    }
}
