use log::{error, info};
use momentum_trader::{
    init_logging, shutdown_channel, AppConfig, Engine, EngineError, HttpTickerExtractor,
    MemoryTradeStore, SimVendorClient,
};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    init_logging("info");
    if let Err(err) = run().await {
        error!("fatal: {}", err);
        std::process::exit(err.exit_code());
    }
}

async fn run() -> Result<(), EngineError> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/config.yaml".to_string());
    let config = AppConfig::load(&config_path)?;
    info!(
        "starting momentum trader (paper session, provider {})",
        config.news.provider_code
    );

    let store = Arc::new(MemoryTradeStore::new());
    let extractor = Arc::new(HttpTickerExtractor::new(&config.extractor.url)?);
    // Paper session: the live TWS adapter is a deployment-time VendorClient.
    let (client, _sim) = SimVendorClient::paper_session();

    let (controller, _shutdown) = shutdown_channel();
    {
        let controller = controller.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                controller.trigger();
            }
        });
    }

    Engine::new(config)
        .run(Box::new(client), store, extractor, controller)
        .await
}
