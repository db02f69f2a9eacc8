use crate::error::EngineError;
use log::warn;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level application configuration, loaded from YAML.
/// Every key has a default; a missing config file runs the engine with the
/// defaults below.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub news: NewsConfig,
    pub detection: DetectionConfig,
    pub risk: RiskConfig,
    pub extractor: ExtractorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: i32,
    /// Primary listing exchange stamped on equity contracts.
    pub primary_exchange: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4001,
            client_id: 1,
            primary_exchange: "NASDAQ".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NewsConfig {
    /// Provider code used in the broad-tape subscription contract
    /// (symbol `"{P}:{P}_ALL"`, exchange `P`).
    pub provider_code: String,
}

impl Default for NewsConfig {
    fn default() -> Self {
        Self {
            provider_code: "BZ".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub worker_count: usize,
    /// Price-shock multiplier applied to ATR(10).
    pub price_mult: Decimal,
    /// Volume-shock multiplier applied to the volume SMA.
    pub vol_mult: Decimal,
    /// Per-symbol suppression window after a signal, in seconds.
    pub cooldown_secs: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            price_mult: Decimal::new(3, 0),
            vol_mult: Decimal::new(5, 0),
            cooldown_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Fraction of account value risked per trade.
    pub per_trade_fraction: Decimal,
    /// Take-profit distance as a fraction of entry price.
    pub take_profit_pct: Decimal,
    /// Time stop, in seconds from entry.
    pub max_hold_secs: u64,
    /// Account summary tag used as the sizing base
    /// (equity vs. net liquidation vs. cash is broker-account specific).
    pub account_value_tag: String,
    /// Short entries are rejected unless enabled; no locate path exists.
    pub allow_short: bool,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            per_trade_fraction: Decimal::new(1, 2), // 0.01
            take_profit_pct: Decimal::new(2, 2),    // 0.02
            max_hold_secs: 600,
            account_value_tag: "NetLiquidation".to_string(),
            allow_short: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    /// Ticker-extractor collaborator endpoint (`POST /extract`).
    pub url: String,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8000/extract".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a YAML file. A missing file is not an error:
    /// the engine runs with defaults, matching the behavior operators expect
    /// from a fresh checkout. A present-but-invalid file is a `Config` error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_yaml(&contents),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    "config file {} not found, using default configuration",
                    path.display()
                );
                Ok(Self::default())
            }
            Err(err) => Err(EngineError::Config(format!(
                "failed to read {}: {}",
                path.display(),
                err
            ))),
        }
    }

    pub fn from_yaml(contents: &str) -> Result<Self, EngineError> {
        serde_yaml::from_str(contents)
            .map_err(|err| EngineError::Config(format!("invalid configuration: {}", err)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.broker.host, "127.0.0.1");
        assert_eq!(config.broker.port, 4001);
        assert_eq!(config.news.provider_code, "BZ");
        assert_eq!(config.detection.worker_count, 4);
        assert_eq!(config.detection.price_mult, Decimal::new(3, 0));
        assert_eq!(config.detection.vol_mult, Decimal::new(5, 0));
        assert_eq!(config.detection.cooldown_secs, 300);
        assert_eq!(config.risk.per_trade_fraction, Decimal::new(1, 2));
        assert_eq!(config.risk.take_profit_pct, Decimal::new(2, 2));
        assert_eq!(config.risk.max_hold_secs, 600);
        assert!(!config.risk.allow_short);
    }

    #[test]
    fn test_partial_yaml_overrides() {
        let yaml = r#"
broker:
  host: "10.0.0.5"
  port: 7496
detection:
  worker_count: 8
  cooldown_secs: 60
"#;
        let config = AppConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.broker.host, "10.0.0.5");
        assert_eq!(config.broker.port, 7496);
        // untouched sections keep defaults
        assert_eq!(config.broker.client_id, 1);
        assert_eq!(config.detection.worker_count, 8);
        assert_eq!(config.detection.cooldown_secs, 60);
        assert_eq!(config.news.provider_code, "BZ");
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        let err = AppConfig::from_yaml("broker: [not, a, map]").unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = AppConfig::load("/nonexistent/config.yaml").unwrap();
        assert_eq!(config.broker.port, 4001);
    }
}
