// Event Intake — adapters mapping external push feeds onto the typed
// MarketEvent / UserEvent enums the decision loop consumes. Reconnection
// loop and stall detection follow the same shape as the teacher's
// `connect_and_listen` (exponential backoff, short poll so shutdown is
// observed promptly).
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use log::{error, info, warn};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

use crate::state::{MarketEvent, OrderStatus, Side, UserEvent};

const RECONNECT_BACKOFF_START_SECS: u64 = 1;
const RECONNECT_BACKOFF_MAX_SECS: u64 = 32;

/// Shared last-message timestamp used for stall detection across feeds.
pub struct FeedClock {
    last_ms: AtomicI64,
}

impl FeedClock {
    pub fn new(now_ms: i64) -> Arc<Self> {
        Arc::new(FeedClock { last_ms: AtomicI64::new(now_ms) })
    }

    pub fn touch(&self, now_ms: i64) {
        self.last_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn is_stalled(&self, now_ms: i64, timeout_sec: u64) -> bool {
        now_ms - self.last_ms.load(Ordering::Relaxed) > timeout_sec as i64 * 1000
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Deserialize)]
struct DexTickerMsg {
    last_price: f64,
}

#[derive(Deserialize)]
struct CexBookTickerMsg {
    bid: f64,
    ask: f64,
}

#[derive(Deserialize)]
struct CexKlineMsg {
    closed: bool,
    quote_volume: f64,
}

#[derive(Deserialize)]
struct CexDepthMsg {
    bids: Vec<(f64, f64)>,
    asks: Vec<(f64, f64)>,
}

#[derive(Deserialize)]
#[serde(tag = "channel", content = "data")]
enum UserStreamMsg {
    #[serde(rename = "order")]
    Order {
        cl_ord_id: String,
        side: String,
        status: String,
        price: f64,
        qty: f64,
        #[serde(default)]
        leaves_qty: Option<f64>,
        #[serde(default)]
        pnl: Option<f64>,
        #[serde(default)]
        fee: Option<f64>,
    },
    #[serde(rename = "position")]
    Position {
        qty: f64,
        entry_price: f64,
        #[serde(default)]
        mark_price: Option<f64>,
    },
}

/// Connects to the DEX last-price feed and forwards a `MarketEvent::DexPrice`
/// for every tick, reconnecting with exponential backoff on drop.
pub async fn connect_dex_price(url: String, tx: mpsc::Sender<MarketEvent>, clock: Arc<FeedClock>) {
    let mut backoff = RECONNECT_BACKOFF_START_SECS;
    loop {
        match connect_async(&url).await {
            Ok((mut ws, _)) => {
                info!("dex price feed connected");
                backoff = RECONNECT_BACKOFF_START_SECS;
                while let Some(msg) = ws.next().await {
                    match msg {
                        Ok(Message::Text(text)) => {
                            if let Ok(parsed) = serde_json::from_str::<DexTickerMsg>(&text) {
                                let ts = now_ms();
                                clock.touch(ts);
                                if tx.send(MarketEvent::DexPrice { ts_ms: ts, last_price: parsed.last_price }).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                        Ok(Message::Close(_)) | Err(_) => break,
                        _ => {}
                    }
                }
                warn!("dex price feed disconnected, reconnecting");
            }
            Err(e) => {
                error!("dex price feed connect failed: {e}");
            }
        }
        tokio::time::sleep(Duration::from_secs(backoff)).await;
        backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX_SECS);
    }
}

/// Connects to a CEX feed carrying book-ticker, closed-kline, and optional
/// depth messages, forwarding the corresponding `MarketEvent` variants.
pub async fn connect_cex_feed(url: String, tx: mpsc::Sender<MarketEvent>, clock: Arc<FeedClock>, depth_levels: usize) {
    let mut backoff = RECONNECT_BACKOFF_START_SECS;
    loop {
        match connect_async(&url).await {
            Ok((mut ws, _)) => {
                info!("cex feed connected");
                backoff = RECONNECT_BACKOFF_START_SECS;
                while let Some(msg) = ws.next().await {
                    let text = match msg {
                        Ok(Message::Text(t)) => t,
                        Ok(Message::Close(_)) | Err(_) => break,
                        _ => continue,
                    };
                    let ts = now_ms();
                    clock.touch(ts);
                    if let Ok(book) = serde_json::from_str::<CexBookTickerMsg>(&text) {
                        if tx.send(MarketEvent::CexBookTicker { ts_ms: ts, bid: book.bid, ask: book.ask }).await.is_err() {
                            return;
                        }
                        continue;
                    }
                    if let Ok(kline) = serde_json::from_str::<CexKlineMsg>(&text) {
                        if kline.closed
                            && tx.send(MarketEvent::CexKlineClosed { ts_ms: ts, quote_volume: kline.quote_volume }).await.is_err()
                        {
                            return;
                        }
                        continue;
                    }
                    if depth_levels > 0 {
                        if let Ok(depth) = serde_json::from_str::<CexDepthMsg>(&text) {
                            let bid_notional: f64 = depth.bids.iter().take(depth_levels).map(|(p, q)| p * q).sum();
                            let ask_notional: f64 = depth.asks.iter().take(depth_levels).map(|(p, q)| p * q).sum();
                            if tx.send(MarketEvent::CexDepth { ts_ms: ts, bid_notional, ask_notional }).await.is_err() {
                                return;
                            }
                        }
                    }
                }
                warn!("cex feed disconnected, reconnecting");
            }
            Err(e) => {
                error!("cex feed connect failed: {e}");
            }
        }
        tokio::time::sleep(Duration::from_secs(backoff)).await;
        backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX_SECS);
    }
}

/// Connects to the private user stream (order and position updates). Every
/// successful connect (including the first) sends on `reconnected` so the
/// decision loop can resync positions and open orders against the venue
/// before trusting local bookkeeping again.
pub async fn connect_user_stream(
    url: String,
    tx: mpsc::Sender<UserEvent>,
    clock: Arc<FeedClock>,
    reconnected: mpsc::Sender<()>,
) {
    let mut backoff = RECONNECT_BACKOFF_START_SECS;
    loop {
        match connect_async(&url).await {
            Ok((mut ws, _)) => {
                info!("user stream connected");
                backoff = RECONNECT_BACKOFF_START_SECS;
                if reconnected.send(()).await.is_err() {
                    return;
                }
                while let Some(msg) = ws.next().await {
                    let text = match msg {
                        Ok(Message::Text(t)) => t,
                        Ok(Message::Close(_)) | Err(_) => break,
                        _ => continue,
                    };
                    let ts = now_ms();
                    clock.touch(ts);
                    match serde_json::from_str::<UserStreamMsg>(&text) {
                        Ok(UserStreamMsg::Order { cl_ord_id, side, status, price, qty, leaves_qty, pnl, fee }) => {
                            let side = if side == "buy" { Side::Buy } else { Side::Sell };
                            let status = match status.as_str() {
                                "open" => OrderStatus::Open,
                                "partially_filled" => OrderStatus::PartiallyFilled,
                                "filled" => OrderStatus::Filled,
                                "cancelled" => OrderStatus::Cancelled,
                                _ => OrderStatus::Rejected,
                            };
                            let event = UserEvent::Order { ts_ms: ts, cl_ord_id, side, status, price, qty, leaves_qty, pnl, fee };
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        Ok(UserStreamMsg::Position { qty, entry_price, mark_price }) => {
                            let event = UserEvent::Position { ts_ms: ts, qty, entry_price, mark_price };
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!("unrecognized user-stream payload, ignoring: {e}");
                        }
                    }
                }
                warn!("user stream disconnected, reconnecting");
            }
            Err(e) => {
                error!("user stream connect failed: {e}");
            }
        }
        tokio::time::sleep(Duration::from_secs(backoff)).await;
        backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX_SECS);
    }
}
