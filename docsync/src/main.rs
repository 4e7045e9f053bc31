use std::sync::Arc;

use docsync::{ServerConfig, SyncServer};
use log::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = ServerConfig::from_env()?;
    info!("Starting docsync on {}...", config.bind_addr);

    let server = Arc::new(SyncServer::new(config)?);
    let listener = server.bind().await?;

    let running = Arc::clone(&server);
    let mut serve = tokio::spawn(async move { running.serve(listener).await });

    let result = tokio::select! {
        result = &mut serve => result?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Interrupt received, shutting down");
            server.shutdown();
            serve.await?
        }
    };

    if let Err(e) = &result {
        error!("Server stopped with error: {e}");
    }
    Ok(result?)
}
