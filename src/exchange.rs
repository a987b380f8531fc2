use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use log::warn;
use rand::Rng;

use crate::error::EngineError;
use crate::signing::{sign_cancel_action, sign_l1_action, ActionWire, LimitOrderWire, OrderRequest, OrderTypeWire};
use crate::state::Side;

/// A venue-reported open order.
#[derive(Debug, Clone)]
pub struct VenueOrder {
    pub cl_ord_id: String,
    pub side: Side,
    pub price: f64,
    pub qty: f64,
    pub status: String,
}

/// A venue-reported position for the configured symbol.
#[derive(Debug, Clone, Copy, Default)]
pub struct VenuePosition {
    pub qty: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Balance {
    pub equity: f64,
    pub balance: f64,
}

#[derive(Debug, Clone)]
pub struct HistoricalOrder {
    pub status: String,
    pub updated_at_ms: i64,
    pub realized_pnl: f64,
}

#[derive(Debug, Clone)]
pub struct PlaceOrderResponse {
    pub code: i32,
    pub message: String,
}

impl PlaceOrderResponse {
    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

/// The venue client's contract: order placement/cancellation, and the
/// read-only queries the efficiency monitor's periodic sync uses.
#[async_trait]
pub trait VenueClient: Send + Sync {
    async fn place_order(
        &self,
        side: Side,
        price: f64,
        qty: f64,
        cl_ord_id: &str,
        reduce_only: bool,
    ) -> Result<PlaceOrderResponse, EngineError>;

    async fn cancel_order(&self, cl_ord_id: &str) -> Result<(), EngineError>;

    async fn cancel_orders(&self, cl_ord_ids: &[String]) -> Result<(), EngineError>;

    async fn query_positions(&self) -> Result<VenuePosition, EngineError>;

    async fn query_open_orders(&self) -> Result<Vec<VenueOrder>, EngineError>;

    async fn query_balance(&self) -> Result<Balance, EngineError>;

    async fn query_history_orders(&self, limit: usize) -> Result<Vec<HistoricalOrder>, EngineError>;
}

/// In-memory venue double. Fills are immediate whenever a resting order's
/// price would cross the last quoted mark; used in shadow/paper mode and by
/// tests.
pub struct SimExchange {
    inner: Mutex<SimState>,
}

struct SimState {
    balance: f64,
    position: VenuePosition,
    orders: HashMap<String, VenueOrder>,
    taker_fee_rate: f64,
    mark_price: f64,
}

impl SimExchange {
    pub fn new(starting_balance: f64, taker_fee_rate: f64) -> Self {
        SimExchange {
            inner: Mutex::new(SimState {
                balance: starting_balance,
                position: VenuePosition::default(),
                orders: HashMap::new(),
                taker_fee_rate,
                mark_price: 0.0,
            }),
        }
    }

    /// Advances the simulated mark price and fills any resting order that
    /// price would cross.
    pub fn set_mark_price(&self, mark_price: f64) {
        let mut inner = self.inner.lock().expect("sim exchange lock poisoned");
        inner.mark_price = mark_price;
        let crossed: Vec<String> = inner
            .orders
            .iter()
            .filter(|(_, o)| match o.side {
                Side::Buy => mark_price <= o.price,
                Side::Sell => mark_price >= o.price,
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in crossed {
            if let Some(order) = inner.orders.remove(&id) {
                let signed_qty = match order.side {
                    Side::Buy => order.qty,
                    Side::Sell => -order.qty,
                };
                let new_qty = inner.position.qty + signed_qty;
                if inner.position.qty == 0.0 || inner.position.qty.signum() == signed_qty.signum() {
                    let total_cost = inner.position.entry_price * inner.position.qty.abs()
                        + order.price * order.qty;
                    inner.position.entry_price = if new_qty.abs() > 1e-12 {
                        total_cost / new_qty.abs()
                    } else {
                        0.0
                    };
                } else if new_qty.abs() < 1e-12 {
                    inner.position.entry_price = 0.0;
                }
                inner.position.qty = new_qty;
                inner.balance -= order.price * order.qty * inner.taker_fee_rate;
            }
        }
    }
}

#[async_trait]
impl VenueClient for SimExchange {
    async fn place_order(
        &self,
        side: Side,
        price: f64,
        qty: f64,
        cl_ord_id: &str,
        _reduce_only: bool,
    ) -> Result<PlaceOrderResponse, EngineError> {
        let mut inner = self.inner.lock().expect("sim exchange lock poisoned");
        inner.orders.insert(
            cl_ord_id.to_string(),
            VenueOrder { cl_ord_id: cl_ord_id.to_string(), side, price, qty, status: "open".into() },
        );
        Ok(PlaceOrderResponse { code: 0, message: "ok".into() })
    }

    async fn cancel_order(&self, cl_ord_id: &str) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().expect("sim exchange lock poisoned");
        inner.orders.remove(cl_ord_id);
        Ok(())
    }

    async fn cancel_orders(&self, cl_ord_ids: &[String]) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().expect("sim exchange lock poisoned");
        for id in cl_ord_ids {
            inner.orders.remove(id);
        }
        Ok(())
    }

    async fn query_positions(&self) -> Result<VenuePosition, EngineError> {
        let inner = self.inner.lock().expect("sim exchange lock poisoned");
        Ok(inner.position)
    }

    async fn query_open_orders(&self) -> Result<Vec<VenueOrder>, EngineError> {
        let inner = self.inner.lock().expect("sim exchange lock poisoned");
        Ok(inner.orders.values().cloned().collect())
    }

    async fn query_balance(&self) -> Result<Balance, EngineError> {
        let inner = self.inner.lock().expect("sim exchange lock poisoned");
        Ok(Balance { equity: inner.balance, balance: inner.balance })
    }

    async fn query_history_orders(&self, _limit: usize) -> Result<Vec<HistoricalOrder>, EngineError> {
        Ok(Vec::new())
    }
}

/// Wraps a single perp-swap asset's signed REST trading API.
pub struct LiveExchange {
    base_url: String,
    account_address: String,
    private_key: String,
    client: reqwest::Client,
    asset_idx: u32,
    symbol: String,
    /// Maps our local `cl_ord_id` to the venue-assigned numeric `oid`,
    /// learned from the place-order ack. Cancellation is keyed on `oid`, the
    /// only identifier the venue itself understands.
    oids: Mutex<HashMap<String, u64>>,
}

impl LiveExchange {
    pub fn new(base_url: String, account_address: String, private_key: String, asset_idx: u32, symbol: String) -> Self {
        LiveExchange {
            base_url,
            account_address,
            private_key,
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("failed to build http client"),
            asset_idx,
            symbol,
            oids: Mutex::new(HashMap::new()),
        }
    }

    fn next_nonce(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock before epoch")
            .as_millis() as u64
    }

    async fn post_exchange(&self, payload: serde_json::Value) -> Result<serde_json::Value, EngineError> {
        let resp = self
            .client
            .post(format!("{}/exchange", self.base_url))
            .json(&payload)
            .send()
            .await
            .map_err(|e| EngineError::transport(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(EngineError::RateLimited);
        }
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| EngineError::protocol(format!("bad exchange response: {e}")))?;
        if !status.is_success() {
            return Err(EngineError::transport(format!("exchange returned {status}: {body}")));
        }
        Ok(body)
    }
}

#[async_trait]
impl VenueClient for LiveExchange {
    async fn place_order(
        &self,
        side: Side,
        price: f64,
        qty: f64,
        cl_ord_id: &str,
        reduce_only: bool,
    ) -> Result<PlaceOrderResponse, EngineError> {
        let order = OrderRequest {
            asset: self.asset_idx,
            is_buy: side == Side::Buy,
            limit_px: float_to_wire(price),
            sz: float_to_wire(qty),
            reduce_only,
            order_type: OrderTypeWire::Limit(LimitOrderWire { tif: "Alo".to_string() }),
        };
        let action = ActionWire { r#type: "order".to_string(), orders: vec![order], grouping: "na".to_string() };
        let nonce = self.next_nonce();
        let (signature, action_json) = sign_l1_action(&self.private_key, action, nonce).await?;
        // cl_ord_id is never sent over the wire in this order type; we learn
        // the venue's own oid from this ack and index it under cl_ord_id for
        // later cancellation.
        let payload = serde_json::json!({
            "action": action_json,
            "nonce": nonce,
            "signature": signature,
            "vaultAddress": serde_json::Value::Null,
        });
        let body = self.post_exchange(payload).await?;
        let statuses = body
            .pointer("/response/data/statuses")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let failed = statuses.iter().any(|s| s.get("error").is_some());
        if failed {
            return Ok(PlaceOrderResponse { code: 1, message: body.to_string() });
        }
        if let Some(oid) = statuses.iter().find_map(|s| {
            s.pointer("/resting/oid")
                .or_else(|| s.pointer("/filled/oid"))
                .and_then(|v| v.as_u64())
        }) {
            self.oids.lock().expect("oid map lock poisoned").insert(cl_ord_id.to_string(), oid);
        } else {
            warn!("order {cl_ord_id} acked with no resting/filled oid in the response, cancellation will fail until resolved");
        }
        Ok(PlaceOrderResponse { code: 0, message: "ok".into() })
    }

    async fn cancel_order(&self, cl_ord_id: &str) -> Result<(), EngineError> {
        let oid = self
            .oids
            .lock()
            .expect("oid map lock poisoned")
            .get(cl_ord_id)
            .copied()
            .ok_or_else(|| EngineError::protocol(format!("no venue oid known for {cl_ord_id}")))?;
        let nonce = self.next_nonce();
        let (signature, action_json) = sign_cancel_action(&self.private_key, self.asset_idx, oid, nonce).await?;
        let payload = serde_json::json!({
            "action": action_json,
            "nonce": nonce,
            "signature": signature,
            "vaultAddress": serde_json::Value::Null,
        });
        self.post_exchange(payload).await?;
        self.oids.lock().expect("oid map lock poisoned").remove(cl_ord_id);
        Ok(())
    }

    async fn cancel_orders(&self, cl_ord_ids: &[String]) -> Result<(), EngineError> {
        for id in cl_ord_ids {
            self.cancel_order(id).await?;
        }
        Ok(())
    }

    async fn query_positions(&self) -> Result<VenuePosition, EngineError> {
        let payload = serde_json::json!({ "type": "clearinghouseState", "user": self.account_address });
        let resp = self
            .client
            .post(format!("{}/info", self.base_url))
            .json(&payload)
            .send()
            .await
            .map_err(|e| EngineError::transport(e.to_string()))?;
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| EngineError::protocol(format!("bad info response: {e}")))?;
        let positions = body.pointer("/assetPositions").and_then(|v| v.as_array()).cloned().unwrap_or_default();
        for p in positions {
            let coin = p.pointer("/position/coin").and_then(|v| v.as_str()).unwrap_or_default();
            if coin == self.symbol {
                let qty: f64 = p.pointer("/position/szi").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0);
                let entry: f64 = p.pointer("/position/entryPx").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0);
                let upnl: f64 = p.pointer("/position/unrealizedPnl").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0);
                return Ok(VenuePosition { qty, entry_price: entry, unrealized_pnl: upnl });
            }
        }
        Ok(VenuePosition::default())
    }

    async fn query_open_orders(&self) -> Result<Vec<VenueOrder>, EngineError> {
        let payload = serde_json::json!({ "type": "openOrders", "user": self.account_address });
        let resp = self
            .client
            .post(format!("{}/info", self.base_url))
            .json(&payload)
            .send()
            .await
            .map_err(|e| EngineError::transport(e.to_string()))?;
        let body: Vec<serde_json::Value> = resp
            .json()
            .await
            .map_err(|e| EngineError::protocol(format!("bad info response: {e}")))?;
        let mut out = Vec::new();
        for o in body {
            let coin = o.get("coin").and_then(|v| v.as_str()).unwrap_or_default();
            if coin != self.symbol {
                continue;
            }
            let side = if o.get("side").and_then(|v| v.as_str()) == Some("B") { Side::Buy } else { Side::Sell };
            let price: f64 = o.get("limitPx").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0);
            let qty: f64 = o.get("sz").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0);
            let cl_ord_id = o.get("cloid").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            out.push(VenueOrder { cl_ord_id, side, price, qty, status: "open".into() });
        }
        Ok(out)
    }

    async fn query_balance(&self) -> Result<Balance, EngineError> {
        let payload = serde_json::json!({ "type": "clearinghouseState", "user": self.account_address });
        let resp = self
            .client
            .post(format!("{}/info", self.base_url))
            .json(&payload)
            .send()
            .await
            .map_err(|e| EngineError::transport(e.to_string()))?;
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| EngineError::protocol(format!("bad info response: {e}")))?;
        let equity: f64 = body
            .pointer("/marginSummary/accountValue")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0);
        let withdrawable: f64 = body.get("withdrawable").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0);
        Ok(Balance { equity, balance: withdrawable })
    }

    async fn query_history_orders(&self, limit: usize) -> Result<Vec<HistoricalOrder>, EngineError> {
        let payload = serde_json::json!({ "type": "historicalOrders", "user": self.account_address });
        let resp = self
            .client
            .post(format!("{}/info", self.base_url))
            .json(&payload)
            .send()
            .await
            .map_err(|e| EngineError::transport(e.to_string()))?;
        let body: Vec<serde_json::Value> = resp
            .json()
            .await
            .map_err(|e| EngineError::protocol(format!("bad info response: {e}")))?;
        Ok(body
            .into_iter()
            .take(limit)
            .map(|o| HistoricalOrder {
                status: o.get("status").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                updated_at_ms: o.get("statusTimestamp").and_then(|v| v.as_i64()).unwrap_or(0),
                realized_pnl: o.get("closedPnl").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0),
            })
            .collect())
    }
}

/// Generates a client-order-id of the form `{role}[-{side}]-{8 hex}`.
pub fn generate_cl_ord_id(role: &str, side: Option<Side>) -> String {
    let suffix: u32 = rand::thread_rng().gen();
    match side {
        Some(s) => format!("{}-{}-{:08x}", role, s.as_str(), suffix),
        None => format!("{}-{:08x}", role, suffix),
    }
}

pub fn round_f64(val: f64, decimals: u32) -> f64 {
    let factor = 10_f64.powi(decimals as i32);
    (val * factor).round() / factor
}

/// Matches the venue SDK's `float_to_wire`: round to 8 decimals, then strip
/// trailing zeros.
pub fn float_to_wire(x: f64) -> String {
    let rounded = format!("{:.8}", x);
    if rounded.contains('.') {
        rounded.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        rounded
    }
}

impl fmt::Display for PlaceOrderResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code={} message={}", self.code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sim_exchange_tracks_simultaneous_buy_and_sell_brackets() {
        let sim = SimExchange::new(10_000.0, 0.00035);
        sim.place_order(Side::Buy, 59_940.0, 0.01, "mm-buy-aaaaaaaa", false).await.unwrap();
        sim.place_order(Side::Sell, 60_060.0, 0.01, "mm-sell-bbbbbbbb", false).await.unwrap();
        let open = sim.query_open_orders().await.unwrap();
        assert_eq!(open.len(), 2);
    }

    #[tokio::test]
    async fn sim_exchange_fills_crossed_order_and_updates_position() {
        let sim = SimExchange::new(10_000.0, 0.00035);
        sim.place_order(Side::Buy, 59_940.0, 0.01, "mm-buy-aaaaaaaa", false).await.unwrap();
        sim.set_mark_price(59_900.0);
        let pos = sim.query_positions().await.unwrap();
        assert!((pos.qty - 0.01).abs() < 1e-9);
        assert_eq!(pos.entry_price, 59_940.0);
        let open = sim.query_open_orders().await.unwrap();
        assert!(open.is_empty());
    }

    #[test]
    fn float_to_wire_strips_trailing_zeros() {
        assert_eq!(float_to_wire(60_000.100), "60000.1");
        assert_eq!(float_to_wire(60_000.0), "60000");
    }

    #[test]
    fn cl_ord_id_has_expected_shape() {
        let id = generate_cl_ord_id("mm", Some(Side::Buy));
        assert!(id.starts_with("mm-buy-"));
        assert_eq!(id.len(), "mm-buy-".len() + 8);
    }
}
