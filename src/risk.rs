use crate::config::Config;
use crate::state::Side;
use crate::state::Snapshot;

/// Output of the risk evaluator: a pure function of a state snapshot and the
/// configured thresholds. Never has side effects and never emits orders.
#[derive(Debug, Clone, PartialEq)]
pub enum Regime {
    Stale { which: StaleFeed },
    Recovery { next_check_at_ms: i64 },
    Guard { reason: String, cooldown_until_ms: i64 },
    Caution { near_side: Side },
    Normal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleFeed {
    Dex,
    Cex,
}

/// Tracks the hysteresis state the evaluator needs across ticks: how long
/// things have been calm, and when a guard/recovery cooldown expires.
pub struct RiskEvaluator {
    guard_cooldown_until_ms: Option<i64>,
    guard_reason: Option<String>,
    stable_since_ms: Option<i64>,
    stale_cooldown_until_ms: Option<i64>,
    stale_which: Option<StaleFeed>,
    stale_stable_since_ms: Option<i64>,
    recovery_until: Option<i64>,
    recovery_next_check_ms: i64,
}

impl RiskEvaluator {
    pub fn new() -> Self {
        RiskEvaluator {
            guard_cooldown_until_ms: None,
            guard_reason: None,
            stable_since_ms: None,
            stale_cooldown_until_ms: None,
            stale_which: None,
            stale_stable_since_ms: None,
            recovery_until: None,
            recovery_next_check_ms: 0,
        }
    }

    /// Enters Recovery immediately, e.g. after a stop-loss flatten.
    pub fn enter_recovery(&mut self, now_ms: i64, cooldown_sec: u64) {
        self.recovery_until = Some(now_ms + cooldown_sec as i64 * 1000);
        self.recovery_next_check_ms = now_ms;
    }

    pub fn evaluate(&mut self, snap: &Snapshot, config: &Config) -> Regime {
        let now = snap.now_ms;

        let dex_stale = now - snap.dex_ts_ms > config.dex_staleness_sec as i64 * 1000;
        let cex_configured = config.cex_ws_url.is_some() || config.binance_symbol.is_some();
        let cex_stale = cex_configured && now - snap.cex_ts_ms > config.cex_staleness_sec as i64 * 1000;

        if dex_stale || cex_stale {
            let which = if dex_stale { StaleFeed::Dex } else { StaleFeed::Cex };
            self.stale_stable_since_ms = None;
            let until = now + config.risk_guard_cooldown_sec as i64 * 1000;
            self.stale_cooldown_until_ms = Some(until);
            self.stale_which = Some(which);
            return Regime::Stale { which };
        }

        if let Some(until) = self.recovery_until {
            if now < self.recovery_next_check_ms {
                return Regime::Recovery { next_check_at_ms: until };
            }
            self.recovery_next_check_ms = now + config.recovery_check_interval_sec as i64 * 1000;
            let cutoff = now - config.recovery_window_sec as i64 * 1000;
            let vol = snap.cex_window.volatility_bps(cutoff);
            if vol <= config.recovery_volatility_bps {
                self.recovery_until = None;
            } else {
                return Regime::Recovery { next_check_at_ms: until };
            }
        }

        let (guard, guard_reason) = self.guard_conditions(snap, config);
        let (caution, near_side) = self.caution_conditions(snap, config);

        if let Some(until) = self.stale_cooldown_until_ms {
            let calm = !guard && !caution;
            if now < until || !calm {
                if !calm {
                    self.stale_stable_since_ms = None;
                }
                let which = self.stale_which.unwrap_or(StaleFeed::Dex);
                return Regime::Stale { which };
            }
            let stable_since = *self.stale_stable_since_ms.get_or_insert(now);
            if now - stable_since < config.risk_recovery_stable_sec as i64 * 1000 {
                let which = self.stale_which.unwrap_or(StaleFeed::Dex);
                return Regime::Stale { which };
            }
            self.stale_cooldown_until_ms = None;
            self.stale_which = None;
            self.stale_stable_since_ms = None;
        }

        if guard {
            self.stable_since_ms = None;
            let until = now + config.risk_guard_cooldown_sec as i64 * 1000;
            self.guard_cooldown_until_ms = Some(until);
            self.guard_reason = Some(guard_reason.clone());
            return Regime::Guard { reason: guard_reason, cooldown_until_ms: until };
        }

        if let Some(until) = self.guard_cooldown_until_ms {
            let calm = !caution;
            if now < until || !calm {
                if !calm {
                    self.stable_since_ms = None;
                }
                let reason = self.guard_reason.clone().unwrap_or_default();
                return Regime::Guard { reason, cooldown_until_ms: until };
            }
            let stable_since = *self.stable_since_ms.get_or_insert(now);
            if now - stable_since < config.risk_recovery_stable_sec as i64 * 1000 {
                let reason = self.guard_reason.clone().unwrap_or_default();
                return Regime::Guard { reason, cooldown_until_ms: until };
            }
            self.guard_cooldown_until_ms = None;
            self.guard_reason = None;
            self.stable_since_ms = None;
        }

        if caution {
            return Regime::Caution { near_side: near_side.unwrap_or(Side::Buy) };
        }

        Regime::Normal
    }

    fn spread_bps(&self, snap: &Snapshot) -> Option<f64> {
        let cex = snap.cex_price?;
        if snap.dex_price == 0.0 {
            return None;
        }
        Some((cex - snap.dex_price).abs() / snap.dex_price * 10_000.0)
    }

    fn guard_conditions(&self, snap: &Snapshot, config: &Config) -> (bool, String) {
        if let Some(spread) = self.spread_bps(snap) {
            if spread > config.spread_threshold_bps {
                return (true, format!("spread {:.2}bps over guard threshold", spread));
            }
        }
        let amp_cutoff = snap.now_ms - config.amplitude_window_sec as i64 * 1000;
        let amplitude = snap.cex_window_or_dex(config).amplitude_bps(amp_cutoff);
        let tight = config.order_distance_tight_min_bps;
        if amplitude > config.amplitude_ratio_threshold * tight {
            return (true, format!("amplitude {:.2}bps over guard threshold", amplitude));
        }
        let vel_cutoff = snap.now_ms - config.velocity_check_window_sec as i64 * 1000;
        let direction = snap.cex_window_or_dex(config).consecutive_direction(vel_cutoff);
        if direction.unsigned_abs() >= config.velocity_tick_threshold {
            return (true, "velocity guard threshold breached".to_string());
        }
        let vol_cutoff = snap.now_ms - config.volume_window_sec as i64 * 1000;
        if let Some((ratio, ..)) = snap.volume_window.volume_ratio(vol_cutoff, config.volume_min_samples) {
            if ratio > config.volume_guard_ratio {
                return (true, format!("volume ratio {:.2}x over guard threshold", ratio));
            }
        }
        (false, String::new())
    }

    fn caution_conditions(&self, snap: &Snapshot, config: &Config) -> (bool, Option<Side>) {
        let mut caution = false;
        let mut pressure_side: Option<Side> = None;

        if let Some(spread) = self.spread_bps(snap) {
            if spread > config.spread_warn_bps {
                caution = true;
            }
        }
        let amp_cutoff = snap.now_ms - config.amplitude_window_sec as i64 * 1000;
        let amplitude = snap.cex_window_or_dex(config).amplitude_bps(amp_cutoff);
        let tight = config.order_distance_tight_min_bps;
        if amplitude > config.amplitude_warn_ratio_threshold * tight {
            caution = true;
        }
        let vel_cutoff = snap.now_ms - config.velocity_check_window_sec as i64 * 1000;
        let direction = snap.cex_window_or_dex(config).consecutive_direction(vel_cutoff);
        if direction.unsigned_abs() >= config.velocity_warn_tick_threshold {
            caution = true;
            pressure_side = Some(if direction > 0 { Side::Buy } else { Side::Sell });
        }
        let vol_cutoff = snap.now_ms - config.volume_window_sec as i64 * 1000;
        if let Some((ratio, ..)) = snap.volume_window.volume_ratio(vol_cutoff, config.volume_min_samples) {
            if ratio > config.volume_warn_ratio {
                caution = true;
            }
        }
        if config.imbalance_guard_enabled {
            let imb_cutoff = snap.now_ms - config.imbalance_window_sec as i64 * 1000;
            if let Some(avg) = snap.imbalance_window.average_since(imb_cutoff, 3) {
                if avg.abs() > config.imbalance_warn_threshold {
                    caution = true;
                    pressure_side = Some(if avg > 0.0 { Side::Buy } else { Side::Sell });
                }
            }
        }

        (caution, pressure_side)
    }
}

impl Default for RiskEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl Snapshot {
    /// Volatility/amplitude/velocity metrics prefer the CEX window when a
    /// CEX feed is configured, falling back to the DEX window otherwise.
    fn cex_window_or_dex(&self, config: &Config) -> &crate::windows::RollingWindow {
        if config.cex_ws_url.is_some() || config.binance_symbol.is_some() {
            &self.cex_window
        } else {
            &self.dex_window
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Position, StateStore};

    fn base_config() -> Config {
        Config {
            wallet: crate::config::WalletConfig { chain: "arbitrum".into(), private_key: "0xabc".into() },
            symbol: "BTC-USD".into(),
            order_size: 0.01,
            max_position: 0.05,
            order_distance_tight_min_bps: 10.0,
            order_distance_tight_max_bps: 20.0,
            order_distance_far_min_bps: 25.0,
            order_distance_far_max_bps: 50.0,
            cancel_distance_min_bps: 5.0,
            cancel_distance_max_bps: 10.0,
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
            cex_ws_url: Some("wss://example/cex".into()),
            binance_symbol: None,
            telegram_bot_token: None,
            telegram_chat_id: None,
            efficiency_report_interval_sec: 300,
            sync_interval_sec: 60,
        }
    }

    #[test]
    fn fresh_feeds_with_tight_spread_are_normal() {
        let store = StateStore::new(3_600_000, 3_600_000, 60_000, 60_000);
        store.apply_market_event(&crate::state::MarketEvent::DexPrice { ts_ms: 1_000, last_price: 60_000.0 });
        store.apply_market_event(&crate::state::MarketEvent::CexBookTicker { ts_ms: 1_000, bid: 59_999.0, ask: 60_001.0 });
        let snap = store.snapshot(1_000);
        let mut eval = RiskEvaluator::new();
        assert_eq!(eval.evaluate(&snap, &base_config()), Regime::Normal);
    }

    #[test]
    fn stale_dex_feed_is_reported() {
        let store = StateStore::new(3_600_000, 3_600_000, 60_000, 60_000);
        store.apply_market_event(&crate::state::MarketEvent::DexPrice { ts_ms: 0, last_price: 60_000.0 });
        let snap = store.snapshot(10_000);
        let mut eval = RiskEvaluator::new();
        assert_eq!(eval.evaluate(&snap, &base_config()), Regime::Stale { which: StaleFeed::Dex });
    }

    #[test]
    fn wide_spread_trips_guard() {
        let store = StateStore::new(3_600_000, 3_600_000, 60_000, 60_000);
        store.apply_market_event(&crate::state::MarketEvent::DexPrice { ts_ms: 1_000, last_price: 60_000.0 });
        store.apply_market_event(&crate::state::MarketEvent::CexBookTicker { ts_ms: 1_000, bid: 60_049.0, ask: 60_051.0 });
        let snap = store.snapshot(1_000);
        let mut eval = RiskEvaluator::new();
        match eval.evaluate(&snap, &base_config()) {
            Regime::Guard { .. } => {}
            other => panic!("expected Guard, got {:?}", other),
        }
    }

    #[test]
    fn guard_requires_stable_period_before_clearing() {
        let store = StateStore::new(3_600_000, 3_600_000, 60_000, 60_000);
        store.apply_market_event(&crate::state::MarketEvent::DexPrice { ts_ms: 0, last_price: 60_000.0 });
        store.apply_market_event(&crate::state::MarketEvent::CexBookTicker { ts_ms: 0, bid: 60_049.0, ask: 60_051.0 });
        let mut eval = RiskEvaluator::new();
        let snap0 = store.snapshot(0);
        let cfg = base_config();
        assert!(matches!(eval.evaluate(&snap0, &cfg), Regime::Guard { .. }));

        // spread calms down immediately but cooldown + stable period haven't elapsed
        store.apply_market_event(&crate::state::MarketEvent::DexPrice { ts_ms: 1_000, last_price: 60_000.0 });
        store.apply_market_event(&crate::state::MarketEvent::CexBookTicker { ts_ms: 1_000, bid: 59_999.0, ask: 60_001.0 });
        let snap1 = store.snapshot(1_000);
        assert!(matches!(eval.evaluate(&snap1, &cfg), Regime::Guard { .. }));

        let snap2 = store.snapshot(16_000);
        assert!(matches!(eval.evaluate(&snap2, &cfg), Regime::Guard { .. }));

        let snap3 = store.snapshot(32_000);
        assert_eq!(eval.evaluate(&snap3, &cfg), Regime::Normal);
    }

    #[test]
    fn stale_requires_stable_period_before_clearing() {
        let store = StateStore::new(3_600_000, 3_600_000, 60_000, 60_000);
        store.apply_market_event(&crate::state::MarketEvent::DexPrice { ts_ms: 0, last_price: 60_000.0 });
        store.apply_market_event(&crate::state::MarketEvent::CexBookTicker { ts_ms: 0, bid: 59_999.0, ask: 60_001.0 });
        let mut eval = RiskEvaluator::new();
        let cfg = base_config();

        // dex feed goes stale
        let snap0 = store.snapshot(10_000);
        assert_eq!(eval.evaluate(&snap0, &cfg), Regime::Stale { which: StaleFeed::Dex });

        // a single fresh dex sample arrives right away; cooldown + stable period haven't elapsed
        store.apply_market_event(&crate::state::MarketEvent::DexPrice { ts_ms: 10_001, last_price: 60_000.0 });
        store.apply_market_event(&crate::state::MarketEvent::CexBookTicker { ts_ms: 10_001, bid: 59_999.0, ask: 60_001.0 });
        let snap1 = store.snapshot(10_001);
        assert_eq!(eval.evaluate(&snap1, &cfg), Regime::Stale { which: StaleFeed::Dex });

        // cooldown (15s) elapses; this tick starts the stable-period clock
        store.apply_market_event(&crate::state::MarketEvent::DexPrice { ts_ms: 26_000, last_price: 60_000.0 });
        store.apply_market_event(&crate::state::MarketEvent::CexBookTicker { ts_ms: 26_000, bid: 59_999.0, ask: 60_001.0 });
        let snap2 = store.snapshot(26_000);
        assert_eq!(eval.evaluate(&snap2, &cfg), Regime::Stale { which: StaleFeed::Dex });

        // another risk_recovery_stable_sec (15s) of continuous calm clears it
        store.apply_market_event(&crate::state::MarketEvent::DexPrice { ts_ms: 42_000, last_price: 60_000.0 });
        store.apply_market_event(&crate::state::MarketEvent::CexBookTicker { ts_ms: 42_000, bid: 59_999.0, ask: 60_001.0 });
        let snap3 = store.snapshot(42_000);
        assert_eq!(eval.evaluate(&snap3, &cfg), Regime::Normal);
    }

    #[test]
    fn recovery_holds_until_volatility_window_calms() {
        let store = StateStore::new(3_600_000, 3_600_000, 60_000, 60_000);
        store.apply_market_event(&crate::state::MarketEvent::DexPrice { ts_ms: 0, last_price: 60_000.0 });
        store.apply_market_event(&crate::state::MarketEvent::CexBookTicker { ts_ms: 0, bid: 59_999.0, ask: 60_001.0 });
        let mut eval = RiskEvaluator::new();
        eval.enter_recovery(0, 600);
        let cfg = base_config();
        let snap = store.snapshot(0);
        assert!(matches!(eval.evaluate(&snap, &cfg), Regime::Recovery { .. }));
        let _ = Position::default();
    }
}
