//! Relay server binary
//!
//! Configuration comes from `MURMUR_*` environment variables; see
//! [`murmur::Config`] for the full list and defaults.

use murmur::{Config, RelayServer};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().init();

    let config = Config::from_env();
    info!("relay configuration: {:?}", config);

    let mut server = RelayServer::new(config);
    if let Err(e) = server.start().await {
        error!("relay error: {}", e);
        return Err(e.into());
    }

    Ok(())
}
