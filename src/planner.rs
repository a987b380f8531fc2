use crate::config::Config;
use crate::risk::Regime;
use crate::state::{OpenOrder, Side, Snapshot};

const CEX_DANGER_THRESHOLD_BPS: f64 = 2.0;

#[derive(Debug, Clone)]
pub enum PlannedAction {
    Cancel { cl_ord_id: String, side: Side },
    Place { side: Side, price: f64, qty: f64, reduce_only: bool },
    MarketReduce { side: Side, qty: f64 },
}

#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub actions: Vec<PlannedAction>,
    /// Set when the plan is a stop-loss flatten; the caller should move the
    /// risk evaluator into Recovery once the flatten is submitted.
    pub trigger_recovery: bool,
}

fn clamp(v: f64, lo: f64, hi: f64) -> f64 {
    v.max(lo).min(hi)
}

fn interpolate(min: f64, max: f64, fraction: f64) -> f64 {
    min + (max - min) * clamp(fraction, 0.0, 1.0)
}

/// Pure decision function: given a snapshot and a regime, produce the set of
/// cancels and new orders that bring the book toward the desired bracket.
pub fn plan(snap: &Snapshot, regime: &Regime, config: &Config) -> Plan {
    let mut plan = Plan::default();

    // Stop-loss always takes priority over everything else. `pending_close`
    // suppresses duplicate flatten attempts until the venue reports the
    // position actually flat.
    if config.stop_loss_usd > 0.0 && !snap.position.is_flat() && !snap.pending_close {
        let pnl = effective_pnl(snap);
        if pnl < -config.stop_loss_usd {
            for side in [Side::Buy, Side::Sell] {
                if let Some(order) = snap.order(side) {
                    plan.actions.push(PlannedAction::Cancel { cl_ord_id: order.cl_ord_id.clone(), side });
                }
            }
            let exit_side = if snap.position.qty > 0.0 { Side::Sell } else { Side::Buy };
            plan.actions.push(PlannedAction::MarketReduce { side: exit_side, qty: snap.position.qty.abs() });
            plan.trigger_recovery = true;
            return plan;
        }
    }

    // No new quotes while in a defensive regime; just cancel everything.
    if matches!(regime, Regime::Guard { .. } | Regime::Stale { .. } | Regime::Recovery { .. }) {
        for side in [Side::Buy, Side::Sell] {
            if let Some(order) = snap.order(side) {
                plan.actions.push(PlannedAction::Cancel { cl_ord_id: order.cl_ord_id.clone(), side });
            }
        }
        return plan;
    }

    // Aggressive profit-take pre-empts limit-quote planning for this tick.
    if !snap.position.is_flat() && !snap.pending_close {
        let pnl = effective_pnl(snap);
        if pnl > config.min_profit_usd {
            let exit_side = if snap.position.qty > 0.0 { Side::Sell } else { Side::Buy };
            for side in [Side::Buy, Side::Sell] {
                if let Some(order) = snap.order(side) {
                    plan.actions.push(PlannedAction::Cancel { cl_ord_id: order.cl_ord_id.clone(), side });
                }
            }
            plan.actions.push(PlannedAction::MarketReduce { side: exit_side, qty: snap.position.qty.abs() });
            return plan;
        }
    }

    let vol_cutoff = snap.now_ms - config.volatility_window_sec as i64 * 1000;
    let volatility_bps = snap.dex_window.volatility_bps(vol_cutoff);
    let vol_ratio = clamp(volatility_bps / config.volatility_threshold_bps.max(1e-9), 0.0, 1.0);

    let tight = interpolate(config.order_distance_tight_min_bps, config.order_distance_tight_max_bps, vol_ratio);
    let far = interpolate(config.order_distance_far_min_bps, config.order_distance_far_max_bps, vol_ratio);
    let mut cancel = interpolate(config.cancel_distance_min_bps, config.cancel_distance_max_bps, vol_ratio);
    if cancel >= tight {
        cancel = tight - 0.1;
    }

    let inv_fraction = if config.max_position > 0.0 {
        clamp(snap.position.qty / config.max_position, -1.0, 1.0)
    } else {
        0.0
    };
    let skew = clamp(inv_fraction * config.max_skew_bps, -config.max_skew_bps, config.max_skew_bps);

    let mut allowed_sides = allowed_sides(regime, snap, config);

    // Inventory at the cap: only the exit side may trade.
    if snap.position.qty.abs() >= config.max_position {
        let exit_side = if snap.position.qty > 0.0 { Side::Sell } else { Side::Buy };
        allowed_sides = vec![exit_side];
    }

    let mut target_distance = |side: Side| -> f64 {
        let risky = match regime {
            Regime::Caution { near_side } => Some(side.opposite() == *near_side),
            _ => None,
        };
        match risky {
            Some(true) => far,
            _ => {
                let base = tight + if side == Side::Buy { skew } else { -skew };
                base.max(0.0)
            }
        }
    };

    for side in [Side::Buy, Side::Sell] {
        if let Some(order) = snap.order(side) {
            let distance_bps = (order.price - snap.dex_price).abs() / snap.dex_price * 10_000.0;
            let target = target_distance(side);
            let lower = target - (tight - cancel);
            let upper = target + (config.rebalance_distance_bps - tight);
            let out_of_band = distance_bps < lower || distance_bps > upper;

            let cex_danger = snap.cex_price.map(|cex| match side {
                Side::Buy => (cex - order.price) / cex * 10_000.0 < CEX_DANGER_THRESHOLD_BPS,
                Side::Sell => (order.price - cex) / cex * 10_000.0 < CEX_DANGER_THRESHOLD_BPS,
            }).unwrap_or(false);

            if out_of_band || cex_danger {
                plan.actions.push(PlannedAction::Cancel { cl_ord_id: order.cl_ord_id.clone(), side });
            }
        }
    }

    // Defer new placements to next tick when any cancel is in flight.
    if !plan.actions.is_empty() {
        return plan;
    }

    let in_cooldown = snap.position.is_flat()
        && snap.last_fill_ts_ms > 0
        && snap.now_ms - snap.last_fill_ts_ms < config.fill_cooldown_sec as i64 * 1000;
    if in_cooldown {
        return plan;
    }

    for side in [Side::Buy, Side::Sell] {
        if !allowed_sides.contains(&side) {
            continue;
        }
        if snap.order(side).is_some() {
            continue;
        }
        let distance = target_distance(side);
        let mut price = match side {
            Side::Buy => snap.dex_price * (1.0 - distance / 10_000.0),
            Side::Sell => snap.dex_price * (1.0 + distance / 10_000.0),
        };

        let reduce_only = !snap.position.is_flat()
            && ((side == Side::Sell && snap.position.qty > 0.0) || (side == Side::Buy && snap.position.qty < 0.0));
        if reduce_only {
            let margin = config.taker_fee_rate + config.min_profit_bps / 10_000.0;
            let breakeven = match side {
                Side::Sell => snap.position.entry_price * (1.0 + margin),
                Side::Buy => snap.position.entry_price * (1.0 - margin),
            };
            price = match side {
                Side::Sell => price.max(breakeven),
                Side::Buy => price.min(breakeven),
            };
        }

        let qty = if reduce_only { snap.position.qty.abs() } else { config.order_size };
        let price = snap_to_tick(price, config.tick_size, side);
        plan.actions.push(PlannedAction::Place { side, price, qty, reduce_only });
    }

    plan
}

fn allowed_sides(regime: &Regime, snap: &Snapshot, config: &Config) -> Vec<Side> {
    match regime {
        Regime::Normal => vec![Side::Buy, Side::Sell],
        Regime::Caution { near_side } => {
            if config.caution_other_side_enabled {
                vec![Side::Buy, Side::Sell]
            } else {
                vec![*near_side]
            }
        }
        _ => {
            let _ = snap;
            vec![]
        }
    }
}

fn effective_pnl(snap: &Snapshot) -> f64 {
    snap.position.unrealized_pnl
}

fn snap_to_tick(price: f64, tick_size: f64, side: Side) -> f64 {
    if tick_size <= 0.0 {
        return price;
    }
    match side {
        Side::Buy => (price / tick_size).floor() * tick_size,
        Side::Sell => (price / tick_size).ceil() * tick_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateStore;

    fn config_s1() -> Config {
        Config {
            wallet: crate::config::WalletConfig { chain: "arbitrum".into(), private_key: "0xabc".into() },
            symbol: "BTC-USD".into(),
            order_size: 0.01,
            max_position: 0.05,
            order_distance_tight_min_bps: 10.0,
            order_distance_tight_max_bps: 10.0,
            order_distance_far_min_bps: 25.0,
            order_distance_far_max_bps: 25.0,
            cancel_distance_min_bps: 5.0,
            cancel_distance_max_bps: 5.0,
            rebalance_distance_bps: 30.0,
            max_skew_bps: 0.0,
            volatility_window_sec: 60,
            volatility_threshold_bps: 20.0,
            amplitude_window_sec: 10,
            amplitude_ratio_threshold: 0.5,
            amplitude_warn_ratio_threshold: 0.3,
            velocity_check_window_sec: 1,
            velocity_tick_threshold: 3,
            velocity_warn_tick_threshold: 2,
            volume_window_sec: 60,
            volume_min_samples: 10,
            volume_warn_ratio: 2.5,
            volume_guard_ratio: 4.0,
            risk_guard_cooldown_sec: 15,
            risk_recovery_stable_sec: 15,
            caution_other_side_enabled: true,
            spread_threshold_bps: 50.0,
            spread_warn_bps: 20.0,
            spread_recovery_bps: 0.0,
            spread_recovery_sec: 0,
            dex_staleness_sec: 5,
            cex_staleness_sec: 5,
            taker_fee_rate: 0.0004,
            min_profit_bps: 2.0,
            fill_cooldown_sec: 10,
            min_profit_usd: 0.0,
            stop_loss_usd: 0.0,
            stop_loss_cooldown_sec: 600,
            recovery_window_sec: 300,
            recovery_volatility_bps: 25.0,
            recovery_check_interval_sec: 300,
            imbalance_guard_enabled: false,
            imbalance_depth_levels: 0,
            imbalance_window_sec: 0,
            imbalance_guard_threshold: 0.0,
            imbalance_warn_threshold: 0.0,
            tick_size: 0.01,
            price_decimals: 2,
            qty_decimals: 3,
            dex_ws_url: "wss://example/dex".into(),
            cex_ws_url: None,
            binance_symbol: None,
            telegram_bot_token: None,
            telegram_chat_id: None,
            efficiency_report_interval_sec: 300,
            sync_interval_sec: 60,
        }
    }

    #[test]
    fn s1_normal_bracket_is_symmetric_at_zero_skew() {
        let store = StateStore::new(3_600_000, 3_600_000, 60_000, 60_000);
        store.apply_market_event(&crate::state::MarketEvent::DexPrice { ts_ms: 1_000, last_price: 60_000.0 });
        let snap = store.snapshot(1_000);
        let cfg = config_s1();
        let plan = plan(&snap, &Regime::Normal, &cfg);
        let buy = plan.actions.iter().find_map(|a| match a {
            PlannedAction::Place { side: Side::Buy, price, .. } => Some(*price),
            _ => None,
        }).unwrap();
        let sell = plan.actions.iter().find_map(|a| match a {
            PlannedAction::Place { side: Side::Sell, price, .. } => Some(*price),
            _ => None,
        }).unwrap();
        assert!((buy - 59_940.0).abs() < 1e-6);
        assert!((sell - 60_060.0).abs() < 1e-6);
    }

    #[test]
    fn s1_sell_order_too_close_to_dex_price_is_cancelled() {
        let store = StateStore::new(3_600_000, 3_600_000, 60_000, 60_000);
        store.apply_market_event(&crate::state::MarketEvent::DexPrice { ts_ms: 2_000, last_price: 60_030.0 });
        store.set_order(Side::Sell, Some(OpenOrder {
            cl_ord_id: "mm-sell-aaaaaaaa".into(),
            side: Side::Sell,
            price: 60_060.0,
            qty: 0.01,
            reduce_only: false,
        }));
        let snap = store.snapshot(2_000);
        let cfg = config_s1();
        let plan = plan(&snap, &Regime::Normal, &cfg);
        assert!(matches!(plan.actions[0], PlannedAction::Cancel { side: Side::Sell, .. }));
        assert_eq!(plan.actions.len(), 1);
    }

    #[test]
    fn guard_regime_cancels_and_places_nothing() {
        let store = StateStore::new(3_600_000, 3_600_000, 60_000, 60_000);
        store.apply_market_event(&crate::state::MarketEvent::DexPrice { ts_ms: 1_000, last_price: 60_000.0 });
        store.set_order(Side::Buy, Some(OpenOrder {
            cl_ord_id: "mm-buy-aaaaaaaa".into(),
            side: Side::Buy,
            price: 59_940.0,
            qty: 0.01,
            reduce_only: false,
        }));
        let snap = store.snapshot(1_000);
        let cfg = config_s1();
        let regime = Regime::Guard { reason: "test".into(), cooldown_until_ms: 2_000 };
        let plan = plan(&snap, &regime, &cfg);
        assert_eq!(plan.actions.len(), 1);
        assert!(matches!(plan.actions[0], PlannedAction::Cancel { .. }));
    }

    #[test]
    fn cex_danger_cancels_buy_even_when_dex_distance_is_fine() {
        let store = StateStore::new(3_600_000, 3_600_000, 60_000, 60_000);
        store.apply_market_event(&crate::state::MarketEvent::DexPrice { ts_ms: 1_000, last_price: 60_000.0 });
        store.apply_market_event(&crate::state::MarketEvent::CexBookTicker { ts_ms: 1_000, bid: 59_950.5, ask: 59_951.5 });
        store.set_order(Side::Buy, Some(OpenOrder {
            cl_ord_id: "mm-buy-aaaaaaaa".into(),
            side: Side::Buy,
            price: 59_950.0,
            qty: 0.01,
            reduce_only: false,
        }));
        let snap = store.snapshot(1_000);
        let cfg = config_s1();
        let plan = plan(&snap, &Regime::Normal, &cfg);
        assert!(plan.actions.iter().any(|a| matches!(a, PlannedAction::Cancel { side: Side::Buy, .. })));
    }

    #[test]
    fn stop_loss_flattens_and_requests_recovery() {
        let store = StateStore::new(3_600_000, 3_600_000, 60_000, 60_000);
        store.apply_market_event(&crate::state::MarketEvent::DexPrice { ts_ms: 1_000, last_price: 54_000.0 });
        store.set_position(crate::state::Position { qty: 0.01, entry_price: 60_000.0, unrealized_pnl: -60.0 });
        let snap = store.snapshot(1_000);
        let mut cfg = config_s1();
        cfg.stop_loss_usd = 50.0;
        let plan = plan(&snap, &Regime::Normal, &cfg);
        assert!(plan.trigger_recovery);
        assert!(plan.actions.iter().any(|a| matches!(a, PlannedAction::MarketReduce { side: Side::Sell, qty } if (*qty - 0.01).abs() < 1e-9)));
    }

    #[test]
    fn pending_close_suppresses_duplicate_flatten() {
        let store = StateStore::new(3_600_000, 3_600_000, 60_000, 60_000);
        store.apply_market_event(&crate::state::MarketEvent::DexPrice { ts_ms: 1_000, last_price: 54_000.0 });
        store.set_position(crate::state::Position { qty: 0.01, entry_price: 60_000.0, unrealized_pnl: -60.0 });
        store.begin_pending_close();
        // position as reported still lags behind the optimistic zero (e.g. a
        // stale user-stream sample); pending_close must suppress re-submission.
        store.set_position(crate::state::Position { qty: 0.01, entry_price: 60_000.0, unrealized_pnl: -60.0 });
        let snap = store.snapshot(1_000);
        assert!(snap.pending_close);
        let mut cfg = config_s1();
        cfg.stop_loss_usd = 50.0;
        let plan = plan(&snap, &Regime::Normal, &cfg);
        assert!(!plan.trigger_recovery);
        assert!(plan.actions.iter().all(|a| !matches!(a, PlannedAction::MarketReduce { .. })));
    }
}
