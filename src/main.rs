// swap-maker: single-instrument perp maker decision engine.
//
// Process shape: a handful of intake tasks push typed events onto bounded
// channels; one decision-loop task is their sole consumer. The loop wakes on
// the next event (coalescing anything else already queued) or a 5s
// heartbeat, takes a state snapshot, and runs risk -> plan -> execute.
use std::sync::Arc;

use log::{info, warn};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};

use swap_maker::config::{load_config, Config};
use swap_maker::exchange::{LiveExchange, SimExchange, VenueClient};
use swap_maker::executor::OrderExecutor;
use swap_maker::intake::{connect_cex_feed, connect_dex_price, connect_user_stream, FeedClock};
use swap_maker::monitor::{EfficiencyMonitor, LatencyAuditor};
use swap_maker::notifier::{NoopNotifier, Notifier, TelegramNotifier};
use swap_maker::planner::plan;
use swap_maker::risk::{Regime, RiskEvaluator};
use swap_maker::state::{MarketEvent, StateStore, UserEvent};

const MARKET_CHANNEL_CAPACITY: usize = 1024;
const USER_CHANNEL_CAPACITY: usize = 256;
const HEARTBEAT_MS: u64 = 5_000;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn now_us() -> u64 {
    chrono::Utc::now().timestamp_micros().max(0) as u64
}

struct SyncUpdate {
    fills: u64,
    realized_pnl: f64,
    equity: f64,
    balance: f64,
}

fn build_notifier(config: &Config) -> Arc<dyn Notifier> {
    match (&config.telegram_bot_token, &config.telegram_chat_id) {
        (Some(token), Some(chat_id)) => Arc::new(TelegramNotifier::new(token.clone(), chat_id.clone())),
        _ => Arc::new(NoopNotifier),
    }
}

fn build_venue(config: &Config) -> Arc<dyn VenueClient> {
    let shadow_mode = std::env::var("MM_SHADOW_MODE").map(|v| v != "0").unwrap_or(true);
    if shadow_mode {
        info!("running in shadow mode against an in-memory venue double");
        return Arc::new(SimExchange::new(10_000.0, config.taker_fee_rate));
    }
    let base_url = std::env::var("VENUE_BASE_URL").unwrap_or_else(|_| "https://api.hyperliquid.xyz".to_string());
    let account_address = std::env::var("VENUE_ACCOUNT_ADDRESS").expect("VENUE_ACCOUNT_ADDRESS must be set");
    let asset_idx: u32 = std::env::var("VENUE_ASSET_INDEX").unwrap_or_else(|_| "0".to_string()).parse().expect("VENUE_ASSET_INDEX must be a u32");
    Arc::new(LiveExchange::new(base_url, account_address, config.wallet.private_key.clone(), asset_idx, config.symbol.clone()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init();

    let config_path = std::env::var("MM_CONFIG_PATH").unwrap_or_else(|_| "config.yaml".to_string());
    let config = load_config(&config_path)?;
    info!("loaded config for {}", config.symbol);

    let venue = build_venue(&config);
    let notifier = build_notifier(&config);

    let dex_window_ms = 3_600_000;
    let cex_window_ms = 3_600_000;
    let volume_window_ms = config.volume_window_sec as i64 * 1000;
    let imbalance_window_ms = config.imbalance_window_sec.max(1) as i64 * 1000;
    let state = Arc::new(StateStore::new(dex_window_ms, cex_window_ms, volume_window_ms, imbalance_window_ms));

    // Seed state from the venue before accepting any stream events.
    match venue.query_positions().await {
        Ok(pos) => state.set_position(swap_maker::state::Position {
            qty: pos.qty,
            entry_price: pos.entry_price,
            unrealized_pnl: pos.unrealized_pnl,
        }),
        Err(e) => warn!("failed to seed position at startup: {e}"),
    }

    let (market_tx, mut market_rx) = mpsc::channel::<MarketEvent>(MARKET_CHANNEL_CAPACITY);
    let (user_tx, mut user_rx) = mpsc::channel::<UserEvent>(USER_CHANNEL_CAPACITY);
    let (reconnect_tx, mut reconnect_rx) = mpsc::channel::<()>(4);
    let feed_clock = FeedClock::new(now_ms());

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    tokio::spawn(connect_dex_price(config.dex_ws_url.clone(), market_tx.clone(), feed_clock.clone()));
    if let Some(cex_url) = config.cex_ws_url.clone() {
        tokio::spawn(connect_cex_feed(cex_url, market_tx.clone(), feed_clock.clone(), config.imbalance_depth_levels));
    }
    tokio::spawn(connect_user_stream(format!("{}/user", config.dex_ws_url), user_tx.clone(), feed_clock.clone(), reconnect_tx));

    {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => {}
                _ = sigterm.recv() => {}
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        });
    }

    let mut executor = OrderExecutor::new(venue.clone(), notifier.clone(), config.price_decimals, config.qty_decimals);
    let mut risk_evaluator = RiskEvaluator::new();
    let mut efficiency_monitor = EfficiencyMonitor::new(3.0, now_ms());
    let mut last_regime = Regime::Normal;
    let mut last_tick_ms = now_ms();
    let mut latency_auditor = LatencyAuditor::default();
    let mut last_latency_report_ms = now_ms();
    const LATENCY_REPORT_INTERVAL_MS: i64 = 30_000;

    // Periodic HTTP sync of fills/pnl/equity, preferred over local counters
    // by the efficiency monitor once available. Results are handed back to
    // the decision loop over a channel since EfficiencyMonitor isn't shared.
    let (sync_tx, mut sync_rx) = mpsc::channel::<SyncUpdate>(4);
    {
        let venue = venue.clone();
        let sync_interval = config.sync_interval_sec;
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(sync_interval.max(1)));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let (Ok(balance), Ok(history)) = (venue.query_balance().await, venue.query_history_orders(100).await) {
                            let fills = history.iter().filter(|h| h.status == "filled").count() as u64;
                            let pnl: f64 = history.iter().map(|h| h.realized_pnl).sum();
                            let update = SyncUpdate { fills, realized_pnl: pnl, equity: balance.equity, balance: balance.balance };
                            if sync_tx.send(update).await.is_err() {
                                break;
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() { break; }
                    }
                }
            }
        });
    }

    loop {
        let woke_at_us = now_us();
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            maybe_event = market_rx.recv() => {
                let Some(event) = maybe_event else { break };
                state.apply_market_event(&event);
                drain_market_events(&mut market_rx, &state);
            }
            maybe_event = user_rx.recv() => {
                let Some(event) = maybe_event else { break };
                handle_user_event(&state, &mut efficiency_monitor, &event);
                drain_user_events(&mut user_rx, &state, &mut efficiency_monitor);
            }
            maybe_sync = sync_rx.recv() => {
                if let Some(update) = maybe_sync {
                    efficiency_monitor.update_synced_stats(update.fills, update.realized_pnl, update.equity, update.balance);
                }
            }
            maybe_reconnect = reconnect_rx.recv() => {
                if maybe_reconnect.is_some() {
                    info!("user stream (re)connected, resyncing positions and open orders");
                    executor.reconcile_after_reconnect(&state).await;
                }
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(HEARTBEAT_MS)) => {}
        }

        let now = now_ms();
        let dt_ms = now - last_tick_ms;
        last_tick_ms = now;

        if feed_clock.is_stalled(now, config.dex_staleness_sec.max(config.cex_staleness_sec)) {
            warn!("market data feed stalled, cancelling all orders");
            executor.cancel_all(&state).await;
            continue;
        }

        let snapshot = state.snapshot(now);
        let regime = risk_evaluator.evaluate(&snapshot, &config);
        if regime != last_regime {
            info!("regime transition: {:?} -> {:?}", last_regime, regime);
            last_regime = regime.clone();
        }

        let plan_result = plan(&snapshot, &regime, &config);
        if plan_result.trigger_recovery {
            risk_evaluator.enter_recovery(now, config.stop_loss_cooldown_sec);
            notifier.notify_critical("stop-loss triggered, entering recovery").await;
        }
        if !plan_result.actions.is_empty() {
            executor.execute(&state, &mut efficiency_monitor, &plan_result.actions).await;
        }

        let orders = [snapshot.order(swap_maker::state::Side::Buy), snapshot.order(swap_maker::state::Side::Sell)];
        efficiency_monitor.update(snapshot.dex_price, &orders, dt_ms, now);
        if efficiency_monitor.should_report(config.efficiency_report_interval_sec, now) {
            if let Some(report) = efficiency_monitor.report(now) {
                info!(
                    "efficiency report: tier1={:.1}% tier2={:.1}% out_of_band={:.1}% fills={} pnl=${:.4}",
                    report.tier1_pct, report.tier2_pct, report.out_of_band_pct, report.fills, report.realized_pnl
                );
            }
        }

        latency_auditor.record(woke_at_us, now_us());
        if now - last_latency_report_ms >= LATENCY_REPORT_INTERVAL_MS {
            info!("{}", latency_auditor.report());
            last_latency_report_ms = now;
        }
    }

    info!("shutting down, cancelling all tracked orders");
    executor.cancel_all(&state).await;
    Ok(())
}

fn drain_market_events(rx: &mut mpsc::Receiver<MarketEvent>, state: &StateStore) {
    while let Ok(event) = rx.try_recv() {
        state.apply_market_event(&event);
    }
}

fn handle_user_event(state: &StateStore, monitor: &mut EfficiencyMonitor, event: &UserEvent) {
    state.apply_user_event(event);
    if let UserEvent::Order { status, pnl, fee, .. } = event {
        if matches!(status, swap_maker::state::OrderStatus::Filled | swap_maker::state::OrderStatus::PartiallyFilled) {
            monitor.record_fill(pnl.unwrap_or(0.0), fee.unwrap_or(0.0));
        }
    }
}

fn drain_user_events(rx: &mut mpsc::Receiver<UserEvent>, state: &StateStore, monitor: &mut EfficiencyMonitor) {
    while let Ok(event) = rx.try_recv() {
        handle_user_event(state, monitor, &event);
    }
}
