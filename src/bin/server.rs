use clap::Parser;
use pgwired::config::Config;
use pgwired::engine::LiteralEngine;
use pgwired::server::Server;
use pgwired::Error;
use tracing::{debug, info};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = Config::parse();

    let _ = tracing_subscriber::fmt()
        .try_init()
        .map_err(|e| debug!("Failed to initialize global tracing: {}", e));

    let authenticator = config.authenticator();
    let server = Server::bind(config, LiteralEngine::new(), authenticator).await?;
    let handle = server.handle();

    let interrupt = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received interrupt, shutting down");
            interrupt.stop();
        }
    });

    server.serve().await?;
    handle.wait_for_stop().await;
    Ok(())
}
