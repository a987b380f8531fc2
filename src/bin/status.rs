// Companion status binary: reuses the core Config and VenueClient contract to
// print a one-shot account report. Thin by design — it never talks to the
// venue directly, only through the same trait the engine's executor uses.
use std::sync::Arc;

use swap_maker::config::load_config;
use swap_maker::exchange::{LiveExchange, VenueClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    dotenvy::dotenv().ok();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.yaml".to_string());
    let config = load_config(&config_path)?;

    let base_url = std::env::var("VENUE_BASE_URL").unwrap_or_else(|_| "https://api.hyperliquid.xyz".to_string());
    let account_address = std::env::var("VENUE_ACCOUNT_ADDRESS")
        .map_err(|_| anyhow::anyhow!("VENUE_ACCOUNT_ADDRESS must be set"))?;
    let asset_idx: u32 = std::env::var("VENUE_ASSET_INDEX").unwrap_or_else(|_| "0".to_string()).parse()?;

    let venue: Arc<dyn VenueClient> = Arc::new(LiveExchange::new(
        base_url,
        account_address,
        config.wallet.private_key.clone(),
        asset_idx,
        config.symbol.clone(),
    ));

    let balance = venue.query_balance().await?;
    let position = venue.query_positions().await?;
    let open_orders = venue.query_open_orders().await?;
    let history = venue.query_history_orders(20).await?;

    println!("Account status for {}", config.symbol);
    println!("  Equity:  ${:.2}", balance.equity);
    println!("  Balance: ${:.2}", balance.balance);
    println!("  Position: {:.4} @ {:.2} (upnl ${:.2})", position.qty, position.entry_price, position.unrealized_pnl);
    println!("  Open orders: {}", open_orders.len());
    for o in &open_orders {
        println!("    {:?} {} {:.4} @ {:.2}", o.side, o.status, o.qty, o.price);
    }
    println!("  Recent history ({} entries):", history.len());
    for h in history.iter().take(10) {
        println!("    {} pnl=${:.4} at {}", h.status, h.realized_pnl, h.updated_at_ms);
    }

    Ok(())
}
