use clap::Parser;
use flashblocks_monitor::Args;

use dotenv::dotenv;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenv().ok();
    Args::parse().run().await
}
