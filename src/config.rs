//! Configuration surface: environment-driven with sane defaults.

use crate::engine::RiskLimits;
use crate::fix::codec::Codec;
use rust_decimal::Decimal;
use std::time::Duration;

/// All recognized options. Every field can be overridden through an
/// `ATLAS_*` environment variable.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// FIX listener port.
    pub listen_port: u16,
    /// Operational HTTP/WebSocket API port.
    pub api_port: u16,
    pub max_order_price: Decimal,
    pub max_order_quantity: u64,
    pub max_orders_per_symbol: usize,
    pub heartbeat_interval_seconds: u64,
    /// BeginString allow-list; the first entry is stamped on outbound
    /// messages.
    pub accepted_versions: Vec<String>,
    /// Optional extra field delimiter accepted on decode (e.g. '|') for
    /// hand-written test input.
    pub test_mode_delimiter: Option<char>,
    pub risk_check_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            listen_port: 9878,
            api_port: 8080,
            max_order_price: Decimal::from(10_000),
            max_order_quantity: 1_000_000,
            max_orders_per_symbol: 10_000,
            heartbeat_interval_seconds: 30,
            accepted_versions: vec!["FIX.4.2".to_string(), "FIX.4.4".to_string()],
            test_mode_delimiter: None,
            risk_check_enabled: true,
        }
    }
}

impl EngineConfig {
    /// Reads overrides from the environment. Unparseable values fall back
    /// to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            listen_port: env_parse("ATLAS_LISTEN_PORT", defaults.listen_port),
            api_port: env_parse("ATLAS_API_PORT", defaults.api_port),
            max_order_price: env_parse("ATLAS_MAX_ORDER_PRICE", defaults.max_order_price),
            max_order_quantity: env_parse("ATLAS_MAX_ORDER_QUANTITY", defaults.max_order_quantity),
            max_orders_per_symbol: env_parse(
                "ATLAS_MAX_ORDERS_PER_SYMBOL",
                defaults.max_orders_per_symbol,
            ),
            heartbeat_interval_seconds: env_parse(
                "ATLAS_HEARTBEAT_INTERVAL_SECONDS",
                defaults.heartbeat_interval_seconds,
            ),
            accepted_versions: std::env::var("ATLAS_ACCEPTED_VERSIONS")
                .ok()
                .map(|raw| {
                    raw.split(',')
                        .map(|v| v.trim().to_string())
                        .filter(|v| !v.is_empty())
                        .collect::<Vec<_>>()
                })
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.accepted_versions),
            test_mode_delimiter: std::env::var("ATLAS_TEST_MODE_DELIMITER")
                .ok()
                .and_then(|raw| raw.chars().next()),
            risk_check_enabled: env_parse("ATLAS_RISK_CHECK_ENABLED", defaults.risk_check_enabled),
        }
    }

    pub fn risk_limits(&self) -> RiskLimits {
        RiskLimits {
            enabled: self.risk_check_enabled,
            max_order_price: self.max_order_price,
            max_order_quantity: self.max_order_quantity,
            max_orders_per_symbol: self.max_orders_per_symbol,
        }
    }

    pub fn codec(&self) -> Codec {
        Codec::new(
            self.accepted_versions.clone(),
            self.test_mode_delimiter.map(|c| c as u8),
        )
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.listen_port, 9878);
        assert_eq!(config.heartbeat_interval_seconds, 30);
        assert_eq!(config.accepted_versions, vec!["FIX.4.2", "FIX.4.4"]);
        assert!(config.risk_check_enabled);
        assert_eq!(config.risk_limits().max_order_quantity, 1_000_000);
        assert_eq!(config.codec().begin_string(), "FIX.4.2");
    }

    #[test]
    fn config_deserializes_with_partial_fields() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "listen_port": 7000, "accepted_versions": ["FIX.4.4"] }"#)
                .unwrap();
        assert_eq!(config.listen_port, 7000);
        assert_eq!(config.accepted_versions, vec!["FIX.4.4"]);
        assert_eq!(config.api_port, 8080, "unspecified fields keep defaults");
    }
}
