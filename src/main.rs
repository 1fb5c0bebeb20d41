// =============================================================================
// smc-engine — Main Entry Point
// =============================================================================
//
// Wiring: tick feed -> candle aggregator -> SMC engine (via OBManager) ->
// touch/entry checks against active order blocks -> position/order trackers
// -> periodic atomic persistence. One tick feed and one candle aggregator
// per tracked symbol; one PositionTracker/OrderTracker pair per sub-account.
// =============================================================================

mod app_state;
mod candle;
mod csv_export;
mod errors;
mod exchange;
mod historical;
mod ob_manager;
mod order;
mod persistence;
mod position;
mod runtime_config;
mod smc;
mod ticker;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::candle::{Candle, CandleAggregator, Tick};
use crate::csv_export::CsvExporter;
use crate::exchange::DeltaExchangeClient;
use crate::historical::HistoricalDataLoader;
use crate::ob_manager::{ObManagerStats, TouchDirection};
use crate::order::{OrderSide, OrderType};
use crate::persistence::StatePersistence;
use crate::position::{ObClass, Position, SymbolSpec as SizingSymbolSpec};
use crate::runtime_config::RuntimeConfig;
use crate::smc::{EngineConfig, ObEvent};

const RUNTIME_CONFIG_PATH: &str = "runtime_config.json";
const PERSIST_INTERVAL_SECS: u64 = 30;
const WS_URL: &str = "wss://socket.delta.exchange";
const REST_BASE_URL: &str = "https://api.delta.exchange";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("smc-engine starting up");

    let config = RuntimeConfig::load(RUNTIME_CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load runtime config, using defaults");
        RuntimeConfig::default()
    });

    if config.symbols.is_empty() {
        warn!("no symbols configured; the engine has nothing to track");
    }

    let persistence = StatePersistence::new(&config.data_dir)?;
    let symbols: Vec<String> = config.symbols.keys().cloned().collect();
    let timeframe_seconds = config.timeframe_seconds();

    let state = Arc::new(AppState::new(config, EngineConfig::default(), persistence));

    // ── Restore prior state, if any ─────────────────────────────────────
    for (account, tracker) in &state.position_trackers {
        if let Ok(Some(snapshot)) = state
            .persistence
            .safe_load::<serde_json::Value>(&StatePersistence::positions_filename(account))
        {
            if let Err(e) = tracker.restore(snapshot) {
                error!(account, error = %e, "failed to restore position snapshot, starting flat");
            } else {
                info!(account, "restored position snapshot");
            }
        }
    }

    if std::env::var("SMC_BACKFILL_ON_START").as_deref() == Ok("1") {
        let data_dir = state.runtime_config.read().data_dir.clone();
        if let Err(e) = backfill_history(&symbols, timeframe_seconds, &data_dir).await {
            warn!(error = %e, "historical backfill failed, continuing with live data only");
        }
    }

    // ── Tick ingress + candle aggregation, one task per symbol ──────────
    let (tick_tx, mut tick_rx) = mpsc::channel::<Tick>(4096);

    {
        let feed_symbols = symbols.clone();
        let tx = tick_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = ticker::run_tick_feed(WS_URL, feed_symbols, tx).await {
                error!(error = %e, "tick feed terminated");
            }
        });
    }
    drop(tick_tx);

    let analysis_state = state.clone();
    let aggregation_task = tokio::spawn(async move {
        let mut aggregator = CandleAggregator::new(timeframe_seconds);
        while let Some(tick) = tick_rx.recv().await {
            let symbol = tick.symbol.clone();
            if let Some(candle) = aggregator.on_tick(&tick) {
                dispatch_closed_candle(&analysis_state, &symbol, candle).await;
            }
            dispatch_touch_check(&analysis_state, &symbol, tick.price).await;
        }

        for (symbol, candle) in aggregator.flush() {
            dispatch_closed_candle(&analysis_state, &symbol, candle).await;
        }
        info!("tick channel closed, aggregator drained");
    });

    // ── Periodic persistence snapshot ────────────────────────────────────
    let persist_state = state.clone();
    let persist_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(PERSIST_INTERVAL_SECS));
        loop {
            interval.tick().await;
            if let Err(e) = persist_state.persist_all() {
                error!(error = %e, "periodic state persistence failed");
            }
        }
    });

    // ── Graceful shutdown ─────────────────────────────────────────────────
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        result = aggregation_task => {
            if let Err(e) = result {
                error!(error = %e, "aggregation task panicked");
            }
        }
    }

    persist_task.abort();
    if let Err(e) = state.persist_all() {
        error!(error = %e, "final state persistence failed");
    } else {
        info!("final state persisted, shutting down");
    }

    Ok(())
}

/// Forwards a finalized candle to the OB manager and reacts to the events it
/// produces: a freshly invalidated OB cancels any resting orders tied to it.
async fn dispatch_closed_candle(state: &Arc<AppState>, symbol: &str, candle: Candle) {
    let events = state.ob_manager.on_candle_close(symbol, candle);
    if events.is_empty() {
        return;
    }

    state.increment_version();
    for event in &events {
        match event {
            ObEvent::Created { bull, ob } => {
                info!(symbol, bull, top = ob.top, btm = ob.btm, "order block created");
            }
            ObEvent::BecameBreaker { bull, ob } => {
                info!(symbol, bull, top = ob.top, btm = ob.btm, "order block became breaker");
            }
            ObEvent::Invalidated { bull, ob } => {
                info!(symbol, bull, top = ob.top, btm = ob.btm, "order block invalidated, cancelling resting orders");
                let ob_id = format!("{symbol}:{}:{}", ob.loc, if *bull { "bull" } else { "bear" });
                for tracker in state.order_trackers.values() {
                    tracker.write().cancel_orders_by_ob(&ob_id, "order block invalidated");
                }
            }
        }
    }

    log_stats(&state.ob_manager.stats());
}

/// One-shot backfill of the last day of candles per symbol, exported to CSV
/// alongside the live data directory. Opt-in via `SMC_BACKFILL_ON_START=1`
/// since it requires REST credentials and is not needed for live trading.
async fn backfill_history(symbols: &[String], timeframe_seconds: i64, data_dir: &str) -> anyhow::Result<()> {
    let api_key = std::env::var("DELTA_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("DELTA_API_SECRET").unwrap_or_default();
    let client = DeltaExchangeClient::new(api_key, api_secret, REST_BASE_URL);
    let loader = HistoricalDataLoader::new(client);
    let exporter = CsvExporter::new(format!("{data_dir}/historical"));

    let resolution = format!("{}m", timeframe_seconds / 60);
    let end = chrono::Utc::now().timestamp();
    let start = end - 86_400;

    for symbol in symbols {
        match loader.fetch_range(symbol, &resolution, timeframe_seconds, start, end).await {
            Ok(candles) if !candles.is_empty() => {
                let start_date = chrono::Utc::now().format("%Y-%m-%d").to_string();
                let path = exporter.export(&candles, symbol, &resolution, &start_date, &start_date)?;
                info!(symbol, candles = candles.len(), path = %path.display(), "backfilled historical candles");
            }
            Ok(_) => warn!(symbol, "backfill returned no candles"),
            Err(e) => warn!(symbol, error = %e, "backfill fetch failed"),
        }
    }
    Ok(())
}

fn log_stats(stats: &ObManagerStats) {
    info!(
        created = stats.obs_created,
        breaker = stats.obs_became_breaker,
        invalidated = stats.obs_invalidated,
        "order block lifecycle stats"
    );
}

/// Checks the latest tick against every sub-account's active order blocks
/// for `symbol` and opens a position when price touches a valid entry level
/// and no position is already open for that symbol in that account.
async fn dispatch_touch_check(state: &Arc<AppState>, symbol: &str, price: f64) {
    let config = state.runtime_config.read();
    let penetration_pct = config.penetration_pct;
    let Some(symbol_spec) = config.symbol_spec(symbol).copied() else {
        return;
    };
    let sub_accounts: Vec<String> = config.sub_accounts.keys().cloned().collect();
    drop(config);

    let Some(touch) = state.ob_manager.touch_check(symbol, price, penetration_pct) else {
        return;
    };

    for account in sub_accounts {
        let Some(tracker) = state.position_tracker(&account) else { continue };
        if tracker.has_position(symbol) {
            continue;
        }

        let class = if touch.ob.is_breaker { ObClass::Breaker } else { ObClass::Fresh };
        let spec = SizingSymbolSpec {
            qty_per_contract: symbol_spec.qty_per_contract,
            min_quantity: symbol_spec.min_quantity,
        };
        let capital = tracker.capital_for(symbol);

        let sizing = match position::calculate_position(capital, class, touch.entry_level, spec) {
            Ok(Some(result)) => result,
            Ok(None) => continue,
            Err(e) => {
                warn!(symbol, account, error = %e, "position sizing failed");
                continue;
            }
        };

        let direction = match touch.direction {
            TouchDirection::Bullish => position::Direction::Long,
            TouchDirection::Bearish => position::Direction::Short,
        };
        let leverage = position::SizingParams::for_class(class).leverage;
        let liquidation_level = position::calculate_liquidation_level(touch.entry_level, direction, leverage);

        let position = Position {
            symbol: symbol.to_string(),
            direction,
            entry_price: touch.entry_level,
            size: sizing.contracts,
            entry_time: chrono::Utc::now().to_rfc3339(),
            ob_class: class,
            leverage,
            capital_used: sizing.capital_used,
            position_value: sizing.position_value,
            liquidation_level,
            ob_top: touch.ob.top,
            ob_btm: touch.ob.btm,
            ob_creation_bar: touch.ob.loc,
            entry_bar: touch.ob.loc,
            highest_price: None,
            lowest_price: None,
            trailing_sl: None,
            partial_exited: false,
            partial_exit_price: None,
            remaining_size: sizing.contracts,
        };

        if let Err(e) = tracker.open_position(position) {
            warn!(symbol, account, error = %e, "failed to open position");
            continue;
        }

        if let Some(order_tracker) = state.order_tracker(&account) {
            let ob_id = format!("{symbol}:{}:{}", touch.ob.loc, if touch.ob.bull { "bull" } else { "bear" });
            let side = match direction {
                position::Direction::Long => OrderSide::Buy,
                position::Direction::Short => OrderSide::Sell,
            };
            order_tracker.write().add_order(
                0,
                symbol,
                side,
                OrderType::Market,
                sizing.contracts,
                Some(touch.entry_level),
                &ob_id,
            );
        }

        state.increment_version();
        info!(symbol, account, contracts = sizing.contracts, entry = touch.entry_level, "position opened from touch check");
    }
}
