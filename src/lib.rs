pub mod alerts;
pub mod broker;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod extractor;
pub mod indicators;
pub mod model;
pub mod shutdown;
pub mod stages;
pub mod store;
pub mod types;

pub use broker::{BrokerBridge, SimHandle, SimScript, SimVendorClient, VendorClient};
pub use config::AppConfig;
pub use engine::Engine;
pub use error::EngineError;
pub use extractor::{HttpTickerExtractor, TickerExtractor};
pub use model::{Direction, Position, PositionStatus, TickerEvent, TradeSignal};
pub use shutdown::{shutdown_channel, Shutdown, ShutdownController};
pub use store::{MemoryTradeStore, TradeStore};
pub use types::{Price, Symbol};

/// Initialize logging with the given default filter; `RUST_LOG` overrides.
pub fn init_logging(default_level: &str) {
    let env = env_logger::Env::default().default_filter_or(default_level);
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .try_init();
}
