use std::sync::Mutex;

use crate::windows::RollingWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

/// A single order we believe is resting on the venue.
#[derive(Debug, Clone)]
pub struct OpenOrder {
    pub cl_ord_id: String,
    pub side: Side,
    pub price: f64,
    pub qty: f64,
    pub reduce_only: bool,
}

/// Current signed inventory. `qty == 0` implies `entry_price == 0`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Position {
    pub qty: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
}

impl Position {
    pub fn is_flat(&self) -> bool {
        self.qty.abs() < 1e-9
    }
}

/// Events produced by the DEX and CEX market-data intake tasks.
#[derive(Debug, Clone)]
pub enum MarketEvent {
    DexPrice { ts_ms: i64, last_price: f64 },
    CexBookTicker { ts_ms: i64, bid: f64, ask: f64 },
    CexKlineClosed { ts_ms: i64, quote_volume: f64 },
    CexDepth { ts_ms: i64, bid_notional: f64, ask_notional: f64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderStatus {
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

/// Events produced by the user (private) stream.
#[derive(Debug, Clone)]
pub enum UserEvent {
    Order {
        ts_ms: i64,
        cl_ord_id: String,
        side: Side,
        status: OrderStatus,
        price: f64,
        qty: f64,
        leaves_qty: Option<f64>,
        pnl: Option<f64>,
        fee: Option<f64>,
    },
    Position {
        ts_ms: i64,
        qty: f64,
        entry_price: f64,
        mark_price: Option<f64>,
    },
}

/// A coherent point-in-time copy taken by the decision loop before planning.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub now_ms: i64,
    pub dex_price: f64,
    pub dex_ts_ms: i64,
    pub cex_price: Option<f64>,
    pub cex_ts_ms: i64,
    pub position: Position,
    pub order: [Option<OpenOrder>; 2], // indexed by Side as 0=buy,1=sell
    pub last_fill_ts_ms: i64,
    pub pending_close: bool,
    pub dex_window: RollingWindow,
    pub cex_window: RollingWindow,
    pub volume_window: RollingWindow,
    pub imbalance_window: RollingWindow,
}

impl Snapshot {
    pub fn order(&self, side: Side) -> Option<&OpenOrder> {
        self.order[side as usize].as_ref()
    }
}

/// The only shared mutable resource in the engine. Every field is updated
/// under the same lock; readers take a coherent snapshot rather than peeking
/// at individual fields.
pub struct StateStore {
    inner: Mutex<Inner>,
}

struct Inner {
    dex_price: f64,
    dex_ts_ms: i64,
    cex_price: Option<f64>,
    cex_ts_ms: i64,
    position: Position,
    order: [Option<OpenOrder>; 2],
    last_fill_ts_ms: i64,
    pending_close: bool,
    dex_window: RollingWindow,
    cex_window: RollingWindow,
    volume_window: RollingWindow,
    imbalance_window: RollingWindow,
}

impl StateStore {
    pub fn new(
        dex_window_ms: i64,
        cex_window_ms: i64,
        volume_window_ms: i64,
        imbalance_window_ms: i64,
    ) -> Self {
        StateStore {
            inner: Mutex::new(Inner {
                dex_price: 0.0,
                dex_ts_ms: 0,
                cex_price: None,
                cex_ts_ms: 0,
                position: Position::default(),
                order: [None, None],
                last_fill_ts_ms: 0,
                pending_close: false,
                dex_window: RollingWindow::new(dex_window_ms),
                cex_window: RollingWindow::new(cex_window_ms),
                volume_window: RollingWindow::new(volume_window_ms),
                imbalance_window: RollingWindow::new(imbalance_window_ms),
            }),
        }
    }

    pub fn apply_market_event(&self, event: &MarketEvent) {
        let mut inner = self.inner.lock().expect("state store lock poisoned");
        match *event {
            MarketEvent::DexPrice { ts_ms, last_price } => {
                inner.dex_price = last_price;
                inner.dex_ts_ms = ts_ms;
                inner.dex_window.append(ts_ms, last_price);
            }
            MarketEvent::CexBookTicker { ts_ms, bid, ask } => {
                let mid = (bid + ask) / 2.0;
                inner.cex_price = Some(mid);
                inner.cex_ts_ms = ts_ms;
                inner.cex_window.append(ts_ms, mid);
            }
            MarketEvent::CexKlineClosed { ts_ms, quote_volume } => {
                inner.volume_window.append(ts_ms, quote_volume);
            }
            MarketEvent::CexDepth { ts_ms, bid_notional, ask_notional } => {
                let total = bid_notional + ask_notional;
                if total > 0.0 {
                    let imbalance = (bid_notional - ask_notional) / total;
                    inner.imbalance_window.append(ts_ms, imbalance);
                }
            }
        }
    }

    pub fn apply_user_event(&self, event: &UserEvent) {
        let mut inner = self.inner.lock().expect("state store lock poisoned");
        match event {
            UserEvent::Order { ts_ms, side, status, price, qty, leaves_qty, .. } => {
                match status {
                    OrderStatus::Open => {
                        // placement confirmation handled by the executor directly via
                        // set_order(); an unexpected "open" with no tracked order is an
                        // orphan and is dealt with by the executor's reconciliation path.
                    }
                    OrderStatus::PartiallyFilled => {
                        if let Some(remaining) = leaves_qty {
                            if let Some(o) = inner.order[*side as usize].as_mut() {
                                o.qty = *remaining;
                            }
                        }
                        inner.last_fill_ts_ms = (*ts_ms).max(inner.last_fill_ts_ms);
                    }
                    OrderStatus::Filled => {
                        inner.order[*side as usize] = None;
                        inner.last_fill_ts_ms = (*ts_ms).max(inner.last_fill_ts_ms);
                    }
                    OrderStatus::Cancelled | OrderStatus::Rejected => {
                        inner.order[*side as usize] = None;
                    }
                }
                let _ = (price, qty);
            }
            UserEvent::Position { ts_ms, qty, entry_price, mark_price } => {
                let delta = (*qty - inner.position.qty).abs();
                let implicit_fill = delta > 1e-6 && *ts_ms - inner.last_fill_ts_ms > 1_000;
                inner.position.qty = *qty;
                inner.position.entry_price = *entry_price;
                if let Some(mark) = mark_price {
                    inner.position.unrealized_pnl = (*mark - *entry_price) * *qty;
                }
                if inner.position.is_flat() {
                    inner.pending_close = false;
                }
                if implicit_fill {
                    inner.last_fill_ts_ms = *ts_ms;
                }
            }
        }
    }

    pub fn set_order(&self, side: Side, order: Option<OpenOrder>) {
        let mut inner = self.inner.lock().expect("state store lock poisoned");
        inner.order[side as usize] = order;
    }

    pub fn record_fill(&self, ts_ms: i64, pnl: Option<f64>) {
        let mut inner = self.inner.lock().expect("state store lock poisoned");
        inner.last_fill_ts_ms = inner.last_fill_ts_ms.max(ts_ms);
        let _ = pnl;
    }

    pub fn set_position(&self, position: Position) {
        let mut inner = self.inner.lock().expect("state store lock poisoned");
        inner.position = position;
    }

    /// Marks a market-reduce flatten as submitted: suppresses duplicate
    /// stop-loss/profit-take attempts until the venue reports the position
    /// flat, and zeroes the locally tracked position optimistically in the
    /// meantime.
    pub fn begin_pending_close(&self) {
        let mut inner = self.inner.lock().expect("state store lock poisoned");
        inner.pending_close = true;
        inner.position = Position::default();
    }

    pub fn snapshot(&self, now_ms: i64) -> Snapshot {
        let inner = self.inner.lock().expect("state store lock poisoned");
        Snapshot {
            now_ms,
            dex_price: inner.dex_price,
            dex_ts_ms: inner.dex_ts_ms,
            cex_price: inner.cex_price,
            cex_ts_ms: inner.cex_ts_ms,
            position: inner.position,
            order: [inner.order[0].clone(), inner.order[1].clone()],
            last_fill_ts_ms: inner.last_fill_ts_ms,
            pending_close: inner.pending_close,
            dex_window: inner.dex_window.clone(),
            cex_window: inner.cex_window.clone(),
            volume_window: inner.volume_window.clone(),
            imbalance_window: inner.imbalance_window.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_position_has_zero_entry() {
        let p = Position::default();
        assert!(p.is_flat());
        assert_eq!(p.entry_price, 0.0);
    }

    #[test]
    fn filled_order_clears_tracked_side() {
        let store = StateStore::new(3_600_000, 3_600_000, 60_000, 60_000);
        store.set_order(
            Side::Buy,
            Some(OpenOrder {
                cl_ord_id: "mm-buy-aaaaaaaa".into(),
                side: Side::Buy,
                price: 100.0,
                qty: 1.0,
                reduce_only: false,
            }),
        );
        store.apply_user_event(&UserEvent::Order {
            ts_ms: 1_000,
            cl_ord_id: "mm-buy-aaaaaaaa".into(),
            side: Side::Buy,
            status: OrderStatus::Filled,
            price: 100.0,
            qty: 1.0,
            leaves_qty: None,
            pnl: None,
            fee: None,
        });
        let snap = store.snapshot(1_000);
        assert!(snap.order(Side::Buy).is_none());
        assert_eq!(snap.last_fill_ts_ms, 1_000);
    }

    #[test]
    fn partial_fill_is_non_terminal_and_updates_qty() {
        let store = StateStore::new(3_600_000, 3_600_000, 60_000, 60_000);
        store.set_order(
            Side::Sell,
            Some(OpenOrder {
                cl_ord_id: "mm-sell-bbbbbbbb".into(),
                side: Side::Sell,
                price: 100.0,
                qty: 1.0,
                reduce_only: false,
            }),
        );
        store.apply_user_event(&UserEvent::Order {
            ts_ms: 1_000,
            cl_ord_id: "mm-sell-bbbbbbbb".into(),
            side: Side::Sell,
            status: OrderStatus::PartiallyFilled,
            price: 100.0,
            qty: 0.4,
            leaves_qty: Some(0.6),
            pnl: None,
            fee: None,
        });
        let snap = store.snapshot(1_000);
        let order = snap.order(Side::Sell).expect("order still tracked");
        assert_eq!(order.qty, 0.6);
    }

    #[test]
    fn pending_close_clears_once_position_observed_flat() {
        let store = StateStore::new(3_600_000, 3_600_000, 60_000, 60_000);
        store.set_position(Position { qty: 0.01, entry_price: 60_000.0, unrealized_pnl: 10.0 });
        store.begin_pending_close();
        let snap = store.snapshot(1_000);
        assert!(snap.pending_close);
        assert!(snap.position.is_flat());

        store.apply_user_event(&UserEvent::Position { ts_ms: 2_000, qty: 0.01, entry_price: 60_000.0, mark_price: None });
        assert!(store.snapshot(2_000).pending_close);

        store.apply_user_event(&UserEvent::Position { ts_ms: 3_000, qty: 0.0, entry_price: 0.0, mark_price: None });
        assert!(!store.snapshot(3_000).pending_close);
    }
}
