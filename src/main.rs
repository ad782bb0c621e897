//! Tether daemon entry point.

use log::info;

mod config;
mod discovery;
mod errors;
mod haproxy;
mod router;
#[cfg(test)]
mod test_utils;
mod types;

use config::Config;
use router::Router;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting tether with config: {:?}", cfg);

    let router = Router::new(&cfg)?;
    router.run().await?;
    Ok(())
}
