use std::collections::HashMap;
use std::sync::Arc;

use log::{error, info, warn};

use crate::exchange::{generate_cl_ord_id, VenueClient};
use crate::monitor::EfficiencyMonitor;
use crate::notifier::Notifier;
use crate::planner::PlannedAction;
use crate::state::{OpenOrder, Side, StateStore};

/// Submits planner actions to the venue and reconciles the executor's view
/// of in-flight cancels against authoritative order events. One action is
/// submitted at a time; transport failures are logged and not retried
/// within the same tick.
pub struct OrderExecutor {
    venue: Arc<dyn VenueClient>,
    notifier: Arc<dyn Notifier>,
    pending_cancels: HashMap<String, Side>,
    price_decimals: u32,
    qty_decimals: u32,
}

impl OrderExecutor {
    pub fn new(venue: Arc<dyn VenueClient>, notifier: Arc<dyn Notifier>, price_decimals: u32, qty_decimals: u32) -> Self {
        OrderExecutor {
            venue,
            notifier,
            pending_cancels: HashMap::new(),
            price_decimals,
            qty_decimals,
        }
    }

    /// Applies every action in a plan, in order, updating `state` as each
    /// venue call completes.
    pub async fn execute(&mut self, state: &StateStore, monitor: &mut EfficiencyMonitor, actions: &[PlannedAction]) {
        for action in actions {
            match action {
                PlannedAction::Cancel { cl_ord_id, side } => self.cancel(state, monitor, cl_ord_id, *side).await,
                PlannedAction::Place { side, price, qty, reduce_only } => {
                    self.place(state, monitor, *side, *price, *qty, *reduce_only).await
                }
                PlannedAction::MarketReduce { side, qty } => self.market_reduce(state, *side, *qty).await,
            }
        }
    }

    async fn place(&mut self, state: &StateStore, monitor: &mut EfficiencyMonitor, side: Side, price: f64, qty: f64, reduce_only: bool) {
        let role = if reduce_only { "reduce" } else { "mm" };
        let cl_ord_id = generate_cl_ord_id(role, Some(side));
        let price = round_to(price, self.price_decimals);
        let qty = round_to(qty, self.qty_decimals);

        match self.venue.place_order(side, price, qty, &cl_ord_id, reduce_only).await {
            Ok(resp) if resp.is_success() => {
                state.set_order(
                    side,
                    Some(OpenOrder { cl_ord_id: cl_ord_id.clone(), side, price, qty, reduce_only }),
                );
                monitor.record_order();
                info!("placed {} order {} {}@{}", side.as_str(), cl_ord_id, qty, price);
            }
            Ok(resp) => {
                error!("order {cl_ord_id} rejected: {resp}");
                self.notifier.notify_high(&format!("order rejected: {resp}")).await;
            }
            Err(e) => {
                error!("failed to place {} order: {e}", side.as_str());
                self.notifier.notify_high(&format!("failed to place order: {e}")).await;
            }
        }
    }

    async fn cancel(&mut self, state: &StateStore, monitor: &mut EfficiencyMonitor, cl_ord_id: &str, side: Side) {
        self.pending_cancels.insert(cl_ord_id.to_string(), side);
        match self.venue.cancel_order(cl_ord_id).await {
            Ok(()) => {
                state.set_order(side, None);
                self.pending_cancels.remove(cl_ord_id);
                monitor.record_cancel();
            }
            Err(e) => {
                warn!("failed to cancel {cl_ord_id}: {e}");
            }
        }
    }

    async fn market_reduce(&mut self, state: &StateStore, side: Side, qty: f64) {
        let cl_ord_id = generate_cl_ord_id("stoploss", Some(side));
        // The venue has no market order type in this contract; an
        // aggressively-priced reduce-only limit crossing the book behaves as
        // an immediate fill in both the sim double and a live IOC order.
        let price = match side {
            Side::Buy => f64::MAX,
            Side::Sell => 0.0,
        };
        match self.venue.place_order(side, price, round_to(qty, self.qty_decimals), &cl_ord_id, true).await {
            Ok(resp) if resp.is_success() => {
                info!("submitted flatten {} {qty} via {cl_ord_id}", side.as_str());
                state.set_order(side, None);
                state.begin_pending_close();
            }
            Ok(resp) => {
                error!("flatten order {cl_ord_id} rejected: {resp}");
                self.notifier.notify_critical(&format!("flatten order rejected: {resp}")).await;
            }
            Err(e) => {
                error!("failed to submit flatten order: {e}");
                self.notifier.notify_critical(&format!("failed to flatten position: {e}")).await;
            }
        }
    }

    /// Cancels every order we believe is resting, used on shutdown and
    /// after a reconnect before resyncing from the venue.
    pub async fn cancel_all(&mut self, state: &StateStore) {
        let snap = state.snapshot(0);
        let ids: Vec<String> = [Side::Buy, Side::Sell]
            .into_iter()
            .filter_map(|s| snap.order(s).map(|o| o.cl_ord_id.clone()))
            .collect();
        if ids.is_empty() {
            return;
        }
        if let Err(e) = self.venue.cancel_orders(&ids).await {
            error!("batch cancel failed: {e}");
        }
        state.set_order(Side::Buy, None);
        state.set_order(Side::Sell, None);
        self.pending_cancels.clear();
    }

    /// Re-establishes ground truth from the venue after a user-stream
    /// reconnect: cancel everything locally tracked, then adopt whatever the
    /// venue reports as open. Any order the venue reports that we don't
    /// recognize is treated as an orphan and cancelled immediately.
    pub async fn reconcile_after_reconnect(&mut self, state: &StateStore) {
        self.cancel_all(state).await;
        match self.venue.query_open_orders().await {
            Ok(orders) => {
                for order in orders {
                    warn!("orphan order {} found on reconnect, cancelling", order.cl_ord_id);
                    if let Err(e) = self.venue.cancel_order(&order.cl_ord_id).await {
                        error!("failed to cancel orphan {}: {e}", order.cl_ord_id);
                    }
                }
            }
            Err(e) => error!("failed to query open orders during reconciliation: {e}"),
        }
        match self.venue.query_positions().await {
            Ok(pos) => {
                state.set_position(crate::state::Position {
                    qty: pos.qty,
                    entry_price: pos.entry_price,
                    unrealized_pnl: pos.unrealized_pnl,
                });
            }
            Err(e) => error!("failed to query positions during reconciliation: {e}"),
        }
    }

    pub fn pending_cancel_count(&self) -> usize {
        self.pending_cancels.len()
    }
}

fn round_to(v: f64, decimals: u32) -> f64 {
    let factor = 10_f64.powi(decimals as i32);
    (v * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::SimExchange;
    use crate::notifier::NoopNotifier;

    #[tokio::test]
    async fn place_action_updates_state_on_success() {
        let venue: Arc<dyn VenueClient> = Arc::new(SimExchange::new(10_000.0, 0.00035));
        let notifier: Arc<dyn Notifier> = Arc::new(NoopNotifier);
        let mut exec = OrderExecutor::new(venue, notifier, 2, 3);
        let state = StateStore::new(3_600_000, 3_600_000, 60_000, 60_000);
        let mut monitor = EfficiencyMonitor::new(3.0, 0);

        exec.execute(&state, &mut monitor, &[PlannedAction::Place { side: Side::Buy, price: 59_940.0, qty: 0.01, reduce_only: false }]).await;

        let snap = state.snapshot(0);
        assert!(snap.order(Side::Buy).is_some());
    }

    #[tokio::test]
    async fn cancel_action_clears_tracked_order() {
        let venue: Arc<dyn VenueClient> = Arc::new(SimExchange::new(10_000.0, 0.00035));
        let notifier: Arc<dyn Notifier> = Arc::new(NoopNotifier);
        let mut exec = OrderExecutor::new(venue, notifier, 2, 3);
        let state = StateStore::new(3_600_000, 3_600_000, 60_000, 60_000);
        let mut monitor = EfficiencyMonitor::new(3.0, 0);
        exec.execute(&state, &mut monitor, &[PlannedAction::Place { side: Side::Sell, price: 60_060.0, qty: 0.01, reduce_only: false }]).await;
        let cl_ord_id = state.snapshot(0).order(Side::Sell).unwrap().cl_ord_id.clone();

        exec.execute(&state, &mut monitor, &[PlannedAction::Cancel { cl_ord_id, side: Side::Sell }]).await;

        assert!(state.snapshot(0).order(Side::Sell).is_none());
    }

    #[tokio::test]
    async fn place_and_cancel_are_recorded_on_the_monitor() {
        let venue: Arc<dyn VenueClient> = Arc::new(SimExchange::new(10_000.0, 0.00035));
        let notifier: Arc<dyn Notifier> = Arc::new(NoopNotifier);
        let mut exec = OrderExecutor::new(venue, notifier, 2, 3);
        let state = StateStore::new(3_600_000, 3_600_000, 60_000, 60_000);
        let mut monitor = EfficiencyMonitor::new(3.0, 0);

        exec.execute(&state, &mut monitor, &[PlannedAction::Place { side: Side::Buy, price: 59_940.0, qty: 0.01, reduce_only: false }]).await;
        let cl_ord_id = state.snapshot(0).order(Side::Buy).unwrap().cl_ord_id.clone();
        exec.execute(&state, &mut monitor, &[PlannedAction::Cancel { cl_ord_id, side: Side::Buy }]).await;

        // `update` needs at least one tick of order-notional-time recorded
        // before `report` will return anything.
        monitor.update(60_000.0, &[None, None], 1_000, 1_000);
        let report = monitor.report(1_000);
        assert!(report.is_none());
        assert_eq!(monitor.orders_recorded(), 1);
        assert_eq!(monitor.cancels_recorded(), 1);
    }
}
