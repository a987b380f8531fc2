use std::fmt;
use std::path::Path;

use serde::Deserialize;

/// Wallet credentials for the venue's signature handshake. `Debug` is
/// hand-written so the private key never ends up in a log line.
#[derive(Clone, Deserialize)]
pub struct WalletConfig {
    pub chain: String,
    pub private_key: String,
}

impl fmt::Debug for WalletConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletConfig")
            .field("chain", &self.chain)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

fn default_amplitude_window_sec() -> u64 {
    10
}
fn default_amplitude_ratio_threshold() -> f64 {
    0.5
}
fn default_amplitude_warn_ratio_threshold() -> f64 {
    0.3
}
fn default_velocity_check_window_sec() -> u64 {
    1
}
fn default_velocity_tick_threshold() -> u32 {
    3
}
fn default_velocity_warn_tick_threshold() -> u32 {
    2
}
fn default_volume_window_sec() -> u64 {
    60
}
fn default_volume_min_samples() -> usize {
    10
}
fn default_volume_warn_ratio() -> f64 {
    2.5
}
fn default_volume_guard_ratio() -> f64 {
    4.0
}
fn default_risk_guard_cooldown_sec() -> u64 {
    15
}
fn default_risk_recovery_stable_sec() -> u64 {
    15
}
fn default_caution_other_side_enabled() -> bool {
    true
}
fn default_dex_staleness_sec() -> u64 {
    5
}
fn default_cex_staleness_sec() -> u64 {
    5
}
fn default_taker_fee_rate() -> f64 {
    0.0004
}
fn default_min_profit_bps() -> f64 {
    2.0
}
fn default_fill_cooldown_sec() -> u64 {
    10
}
fn default_min_profit_usd() -> f64 {
    0.0
}
fn default_stop_loss_cooldown_sec() -> u64 {
    600
}
fn default_recovery_window_sec() -> u64 {
    300
}
fn default_recovery_volatility_bps() -> f64 {
    25.0
}
fn default_recovery_check_interval_sec() -> u64 {
    300
}
fn default_max_skew_bps() -> f64 {
    0.0
}
fn default_rebalance_distance_bps() -> f64 {
    30.0
}
fn default_efficiency_report_interval_sec() -> u64 {
    300
}
fn default_sync_interval_sec() -> u64 {
    60
}
fn default_tick_size() -> f64 {
    0.01
}
fn default_price_decimals() -> u32 {
    2
}
fn default_qty_decimals() -> u32 {
    3
}

/// Everything the maker decision engine is configured with. Loaded once at
/// startup from a YAML file and never mutated afterwards; components that
/// need an environment override (`RUST_LOG`, socket URLs) read it directly
/// in `main`, not here.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub wallet: WalletConfig,
    pub symbol: String,
    pub order_size: f64,
    pub max_position: f64,

    pub order_distance_tight_min_bps: f64,
    pub order_distance_tight_max_bps: f64,
    pub order_distance_far_min_bps: f64,
    pub order_distance_far_max_bps: f64,
    pub cancel_distance_min_bps: f64,
    pub cancel_distance_max_bps: f64,
    #[serde(default = "default_rebalance_distance_bps")]
    pub rebalance_distance_bps: f64,

    #[serde(default = "default_max_skew_bps")]
    pub max_skew_bps: f64,

    pub volatility_window_sec: u64,
    pub volatility_threshold_bps: f64,
    #[serde(default = "default_amplitude_window_sec")]
    pub amplitude_window_sec: u64,
    #[serde(default = "default_amplitude_ratio_threshold")]
    pub amplitude_ratio_threshold: f64,
    #[serde(default = "default_amplitude_warn_ratio_threshold")]
    pub amplitude_warn_ratio_threshold: f64,
    #[serde(default = "default_velocity_check_window_sec")]
    pub velocity_check_window_sec: u64,
    #[serde(default = "default_velocity_tick_threshold")]
    pub velocity_tick_threshold: u32,
    #[serde(default = "default_velocity_warn_tick_threshold")]
    pub velocity_warn_tick_threshold: u32,
    #[serde(default = "default_volume_window_sec")]
    pub volume_window_sec: u64,
    #[serde(default = "default_volume_min_samples")]
    pub volume_min_samples: usize,
    #[serde(default = "default_volume_warn_ratio")]
    pub volume_warn_ratio: f64,
    #[serde(default = "default_volume_guard_ratio")]
    pub volume_guard_ratio: f64,
    #[serde(default = "default_risk_guard_cooldown_sec")]
    pub risk_guard_cooldown_sec: u64,
    #[serde(default = "default_risk_recovery_stable_sec")]
    pub risk_recovery_stable_sec: u64,
    #[serde(default = "default_caution_other_side_enabled")]
    pub caution_other_side_enabled: bool,

    pub spread_threshold_bps: f64,
    pub spread_warn_bps: f64,
    #[serde(default)]
    pub spread_recovery_bps: f64,
    #[serde(default)]
    pub spread_recovery_sec: u64,

    #[serde(default = "default_dex_staleness_sec")]
    pub dex_staleness_sec: u64,
    #[serde(default = "default_cex_staleness_sec")]
    pub cex_staleness_sec: u64,

    #[serde(default = "default_taker_fee_rate")]
    pub taker_fee_rate: f64,
    #[serde(default = "default_min_profit_bps")]
    pub min_profit_bps: f64,
    #[serde(default = "default_fill_cooldown_sec")]
    pub fill_cooldown_sec: u64,
    #[serde(default = "default_min_profit_usd")]
    pub min_profit_usd: f64,

    #[serde(default)]
    pub stop_loss_usd: f64,
    #[serde(default = "default_stop_loss_cooldown_sec")]
    pub stop_loss_cooldown_sec: u64,
    #[serde(default = "default_recovery_window_sec")]
    pub recovery_window_sec: u64,
    #[serde(default = "default_recovery_volatility_bps")]
    pub recovery_volatility_bps: f64,
    #[serde(default = "default_recovery_check_interval_sec")]
    pub recovery_check_interval_sec: u64,

    #[serde(default)]
    pub imbalance_guard_enabled: bool,
    #[serde(default)]
    pub imbalance_depth_levels: usize,
    #[serde(default)]
    pub imbalance_window_sec: u64,
    #[serde(default)]
    pub imbalance_guard_threshold: f64,
    #[serde(default)]
    pub imbalance_warn_threshold: f64,

    #[serde(default = "default_tick_size")]
    pub tick_size: f64,
    #[serde(default = "default_price_decimals")]
    pub price_decimals: u32,
    #[serde(default = "default_qty_decimals")]
    pub qty_decimals: u32,

    pub dex_ws_url: String,
    #[serde(default)]
    pub cex_ws_url: Option<String>,
    #[serde(default)]
    pub binance_symbol: Option<String>,

    #[serde(default)]
    pub telegram_bot_token: Option<String>,
    #[serde(default)]
    pub telegram_chat_id: Option<String>,

    #[serde(default = "default_efficiency_report_interval_sec")]
    pub efficiency_report_interval_sec: u64,
    #[serde(default = "default_sync_interval_sec")]
    pub sync_interval_sec: u64,
}

/// Loads and validates configuration from a YAML file.
pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("config file not found at {}: {}", path.display(), e))?;
    let config: Config = serde_yaml::from_str(&text)?;
    Ok(config)
}
