use std::collections::VecDeque;

use crate::state::{OpenOrder, Side};

const TIER1_BPS: f64 = 10.0;
const TIER2_BPS: f64 = 30.0;
const LATENCY_SAMPLE_CAP: usize = 10_000;
const LATENCY_TOO_SLOW_US: u64 = 50_000;

#[derive(Debug, Clone, Copy, Default)]
struct Buckets {
    tier1_notional_time: f64,
    tier2_notional_time: f64,
    out_of_band_notional_time: f64,
    warmup_notional_time: f64,
    total_order_notional_time: f64,
    total_time: f64,
    orders: u64,
    cancels: u64,
    fills: u64,
    realized_pnl: f64,
    fees_paid: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct SyncedStats {
    fills: Option<u64>,
    realized_pnl: Option<f64>,
    equity: Option<f64>,
    balance: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct EfficiencyReport {
    pub total_time_sec: f64,
    pub tier1_pct: f64,
    pub tier2_pct: f64,
    pub out_of_band_pct: f64,
    pub warmup_pct: f64,
    pub eligible_ratio: f64,
    pub weighted_efficiency: f64,
    pub orders: u64,
    pub cancels: u64,
    pub fills: u64,
    pub realized_pnl: f64,
    pub fees_paid: f64,
    pub equity: Option<f64>,
    pub balance: Option<f64>,
}

/// Tracks how much resting-order notional-time falls within each distance
/// band versus the mark price, plus basic order/cancel/fill counters. This
/// is purely an observability aid: it never feeds back into planning.
pub struct EfficiencyMonitor {
    stats: Buckets,
    synced: SyncedStats,
    order_id: [Option<String>; 2],
    order_start_ms: [Option<i64>; 2],
    min_rest_ms: i64,
    last_report_ms: i64,
}

impl EfficiencyMonitor {
    pub fn new(min_rest_sec: f64, now_ms: i64) -> Self {
        EfficiencyMonitor {
            stats: Buckets::default(),
            synced: SyncedStats::default(),
            order_id: [None, None],
            order_start_ms: [None, None],
            min_rest_ms: (min_rest_sec * 1000.0) as i64,
            last_report_ms: now_ms,
        }
    }

    pub fn update(&mut self, mark_price: f64, orders: &[Option<&OpenOrder>; 2], dt_ms: i64, now_ms: i64) {
        if dt_ms <= 0 || mark_price <= 0.0 {
            return;
        }
        let dt = dt_ms as f64 / 1000.0;
        self.stats.total_time += dt;

        for side in [Side::Buy, Side::Sell] {
            self.sync_order_state(side, orders[side as usize], now_ms);
        }

        for side in [Side::Buy, Side::Sell] {
            let Some(order) = orders[side as usize] else { continue };
            let Some(start) = self.order_start_ms[side as usize] else { continue };

            let notional = order.qty.abs() * mark_price;
            self.stats.total_order_notional_time += notional * dt;

            if now_ms - start < self.min_rest_ms {
                self.stats.warmup_notional_time += notional * dt;
                continue;
            }

            let distance_bps = (order.price - mark_price).abs() / mark_price * 10_000.0;
            if distance_bps <= TIER1_BPS {
                self.stats.tier1_notional_time += notional * dt;
            } else if distance_bps <= TIER2_BPS {
                self.stats.tier2_notional_time += notional * dt;
            } else {
                self.stats.out_of_band_notional_time += notional * dt;
            }
        }
    }

    fn sync_order_state(&mut self, side: Side, order: Option<&OpenOrder>, now_ms: i64) {
        let idx = side as usize;
        match order {
            None => {
                self.order_id[idx] = None;
                self.order_start_ms[idx] = None;
            }
            Some(o) => {
                if self.order_id[idx].as_deref() != Some(o.cl_ord_id.as_str()) {
                    self.order_id[idx] = Some(o.cl_ord_id.clone());
                    self.order_start_ms[idx] = Some(now_ms);
                }
            }
        }
    }

    pub fn record_order(&mut self) {
        self.stats.orders += 1;
    }

    pub fn record_cancel(&mut self) {
        self.stats.cancels += 1;
    }

    pub fn orders_recorded(&self) -> u64 {
        self.stats.orders
    }

    pub fn cancels_recorded(&self) -> u64 {
        self.stats.cancels
    }

    pub fn record_fill(&mut self, pnl: f64, fee: f64) {
        self.stats.fills += 1;
        self.stats.realized_pnl += pnl;
        self.stats.fees_paid += fee;
    }

    pub fn update_synced_stats(&mut self, fills: u64, pnl: f64, equity: f64, balance: f64) {
        self.synced.fills = Some(fills);
        self.synced.realized_pnl = Some(pnl);
        self.synced.equity = Some(equity);
        self.synced.balance = Some(balance);
    }

    pub fn should_report(&self, interval_sec: u64, now_ms: i64) -> bool {
        now_ms - self.last_report_ms >= interval_sec as i64 * 1000
    }

    /// Produces a report and resets the accumulating counters (synced stats
    /// persist across reports, matching the upstream polling cadence).
    pub fn report(&mut self, now_ms: i64) -> Option<EfficiencyReport> {
        let total = self.stats.total_time;
        let total_notional = self.stats.total_order_notional_time;
        if total == 0.0 || total_notional == 0.0 {
            self.last_report_ms = now_ms;
            return None;
        }

        let tier1_pct = self.stats.tier1_notional_time / total_notional * 100.0;
        let tier2_pct = self.stats.tier2_notional_time / total_notional * 100.0;
        let out_of_band_pct = self.stats.out_of_band_notional_time / total_notional * 100.0;
        let warmup_pct = self.stats.warmup_notional_time / total_notional * 100.0;

        let point_weighted = self.stats.tier1_notional_time + self.stats.tier2_notional_time * 0.5;
        let weighted_efficiency = point_weighted / total_notional * 100.0;
        let eligible_ratio = (self.stats.tier1_notional_time + self.stats.tier2_notional_time) / total_notional * 100.0;

        let fills = self.synced.fills.unwrap_or(self.stats.fills);
        let realized_pnl = self.synced.realized_pnl.unwrap_or(self.stats.realized_pnl);

        let report = EfficiencyReport {
            total_time_sec: total,
            tier1_pct,
            tier2_pct,
            out_of_band_pct,
            warmup_pct,
            eligible_ratio,
            weighted_efficiency,
            orders: self.stats.orders,
            cancels: self.stats.cancels,
            fills,
            realized_pnl,
            fees_paid: self.stats.fees_paid,
            equity: self.synced.equity,
            balance: self.synced.balance,
        };

        self.stats = Buckets::default();
        self.last_report_ms = now_ms;
        Some(report)
    }
}

/// Records wake-to-decision round-trip latency for the decision loop.
/// Ported from the teacher's L2-receipt latency auditor; the thing being
/// timed changes (event arrival -> plan applied) but the p95 bookkeeping
/// doesn't.
#[derive(Debug, Default)]
pub struct LatencyAuditor {
    samples: VecDeque<u64>,
}

impl LatencyAuditor {
    pub fn record(&mut self, woke_at_us: u64, decided_at_us: u64) {
        let delta = decided_at_us.saturating_sub(woke_at_us);
        if self.samples.len() >= LATENCY_SAMPLE_CAP {
            self.samples.pop_front();
        }
        self.samples.push_back(delta);
    }

    pub fn p95_us(&self) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }
        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        sorted[(sorted.len() as f64 * 0.95) as usize]
    }

    pub fn is_too_slow(&self) -> bool {
        self.p95_us() > LATENCY_TOO_SLOW_US
    }

    pub fn report(&self) -> String {
        if self.samples.is_empty() {
            return "no samples yet".to_string();
        }
        let avg = self.samples.iter().sum::<u64>() / self.samples.len() as u64;
        format!("tick latency: avg={}us p95={}us too_slow={}", avg, self.p95_us(), self.is_too_slow())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(side: Side, price: f64) -> OpenOrder {
        OpenOrder { cl_ord_id: format!("mm-{}-00000000", side.as_str()), side, price, qty: 0.01, reduce_only: false }
    }

    #[test]
    fn no_data_report_is_none() {
        let mut mon = EfficiencyMonitor::new(3.0, 0);
        assert!(mon.report(1_000).is_none());
    }

    #[test]
    fn order_inside_tier1_band_accrues_after_warmup() {
        let mut mon = EfficiencyMonitor::new(3.0, 0);
        let buy = order(Side::Buy, 59_995.0);
        let orders = [Some(&buy), None];
        mon.update(60_000.0, &orders, 1_000, 1_000);
        // still warming up
        mon.update(60_000.0, &orders, 3_000, 4_000);
        let report = mon.report(4_000).unwrap();
        assert!(report.tier1_pct > 0.0);
        assert_eq!(report.warmup_pct, 0.0);
    }

    #[test]
    fn order_switching_cl_ord_id_resets_warmup_clock() {
        let mut mon = EfficiencyMonitor::new(3.0, 0);
        let first = order(Side::Buy, 59_995.0);
        mon.update(60_000.0, &[Some(&first), None], 5_000, 5_000);
        let mut second = order(Side::Buy, 59_995.0);
        second.cl_ord_id = "mm-buy-11111111".into();
        mon.update(60_000.0, &[Some(&second), None], 1_000, 6_000);
        let report = mon.report(6_000).unwrap();
        assert!(report.warmup_pct > 0.0);
    }

    #[test]
    fn record_fill_accumulates_pnl_and_fees() {
        let mut mon = EfficiencyMonitor::new(3.0, 0);
        mon.record_fill(1.5, 0.02);
        mon.record_fill(-0.5, 0.02);
        let buy = order(Side::Buy, 59_995.0);
        mon.update(60_000.0, &[Some(&buy), None], 10_000, 10_000);
        let report = mon.report(10_000).unwrap();
        assert!((report.realized_pnl - 1.0).abs() < 1e-9);
        assert!((report.fees_paid - 0.04).abs() < 1e-9);
    }

    #[test]
    fn synced_stats_override_local_counters() {
        let mut mon = EfficiencyMonitor::new(3.0, 0);
        mon.record_fill(1.0, 0.0);
        mon.update_synced_stats(42, 99.5, 1_000.0, 900.0);
        let buy = order(Side::Buy, 59_995.0);
        mon.update(60_000.0, &[Some(&buy), None], 10_000, 10_000);
        let report = mon.report(10_000).unwrap();
        assert_eq!(report.fills, 42);
        assert_eq!(report.realized_pnl, 99.5);
        assert_eq!(report.equity, Some(1_000.0));
    }

    #[test]
    fn latency_auditor_flags_slow_p95() {
        let mut auditor = LatencyAuditor::default();
        for _ in 0..20 {
            auditor.record(0, 1_000);
        }
        auditor.record(0, 60_000);
        assert!(auditor.p95_us() >= 1_000);
        assert!(!auditor.report().is_empty());
    }
}
