//! Binary entry point for the event publisher
//! Run with: cargo run --bin publisher

use anyhow::Result;
use portfolio_engine::config::Config;
use portfolio_engine::publisher;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("info,portfolio_engine=debug")
        .init();

    println!("📮 Portfolio Engine Event Publisher");

    let config = Config::from_env();
    config.print_config();

    publisher::run(&config.publisher, &config.data.data_dir).await?;

    println!("✅ Event feed fully published");
    Ok(())
}
