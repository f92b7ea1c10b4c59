//! Gateway configuration file.
//!
//! # Example TOML
//!
//! ```toml
//! [gateway]
//! name = "Battery Monitor"
//! report_interval_ms = 5000
//!
//! [connection]
//! host = "0.0.0.0"
//! port = 20000
//! bus_name = "can0"
//!
//! [[signals]]
//! name = "soc"
//! address = "0x355:0:16:le:u16"
//!
//! [[signals]]
//! name = "voltage"
//! address = { address = 0x356, bit_offset = 0, bit_length = 16, byte_ordering = "le", data_type = "int16" }
//! rate_limit_ms = 1000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::error::{GatewayError, Result};
use crate::core::signal::CanbusSignalReference;
use crate::protocols::cannelloni::CannelloniParamsConfig;

use super::address::{parse_signal_address, validate_signal};

/// Complete gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Gateway settings.
    #[serde(default)]
    pub gateway: GatewaySettings,

    /// Cannelloni connection parameters.
    #[serde(default)]
    pub connection: CannelloniParamsConfig,

    /// Signals to subscribe and report.
    #[serde(default)]
    pub signals: Vec<SignalDef>,
}

/// `[gateway]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    /// Gateway name used in logs.
    #[serde(default = "default_gateway_name")]
    pub name: String,

    /// Interval between signal reports in milliseconds.
    #[serde(default = "default_report_interval_ms")]
    pub report_interval_ms: u64,
}

fn default_gateway_name() -> String {
    "cangw".to_string()
}

fn default_report_interval_ms() -> u64 {
    5000
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            name: default_gateway_name(),
            report_interval_ms: default_report_interval_ms(),
        }
    }
}

/// Signal address: shorthand string or explicit fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalAddress {
    /// `"address:bit_offset:bit_length[:order[:type]]"`
    Shorthand(String),
    /// Explicit table.
    Explicit(CanbusSignalReference),
}

impl SignalAddress {
    /// Resolve to a validated signal reference.
    pub fn resolve(&self) -> Result<CanbusSignalReference> {
        match self {
            Self::Shorthand(s) => parse_signal_address(s),
            Self::Explicit(signal) => {
                validate_signal(signal)?;
                Ok(*signal)
            }
        }
    }
}

/// `[[signals]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalDef {
    /// Signal name.
    pub name: String,

    /// Signal location.
    pub address: SignalAddress,

    /// Expect extended-format frames even for addresses up to 0x7FF.
    #[serde(default)]
    pub force_extended: bool,

    /// Minimum interval between deliveries in milliseconds.
    #[serde(default)]
    pub rate_limit_ms: Option<u64>,

    /// Change mask over the first eight payload bytes. 0 fires on every frame.
    #[serde(default)]
    pub data_filter: u64,
}

impl SignalDef {
    /// Rate limit as a duration.
    pub fn rate_limit(&self) -> Option<Duration> {
        self.rate_limit_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

impl GatewayConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: GatewayConfig = toml::from_str(s)
            .map_err(|e| GatewayError::Config(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Check connection parameters and every signal.
    pub fn validate(&self) -> Result<()> {
        self.connection.to_config().validate()?;
        if self.gateway.report_interval_ms == 0 {
            return Err(GatewayError::Config(
                "report_interval_ms must be greater than zero".into(),
            ));
        }
        let mut names = std::collections::HashSet::new();
        for signal in &self.signals {
            if signal.name.trim().is_empty() {
                return Err(GatewayError::Config("Signal name must not be empty".into()));
            }
            if !names.insert(signal.name.as_str()) {
                return Err(GatewayError::Config(format!(
                    "Duplicate signal name: {}",
                    signal.name
                )));
            }
            signal.address.resolve().map_err(|e| {
                GatewayError::Config(format!("Signal '{}': {}", signal.name, e))
            })?;
        }
        Ok(())
    }

    /// Report interval as a duration.
    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.gateway.report_interval_ms)
    }

    /// Serialize to TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| GatewayError::Internal(format!("Cannot serialize configuration: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::signal::{BitDataType, ByteOrdering};

    const SAMPLE: &str = r#"
[gateway]
name = "Battery Monitor"
report_interval_ms = 1000

[connection]
host = "127.0.0.1"
port = 20000
bus_name = "can1"
reconnect_delay_secs = 10

[[signals]]
name = "soc"
address = "0x355:0:16:le:u16"

[[signals]]
name = "voltage"
address = { address = 0x356, bit_length = 16, byte_ordering = "le", data_type = "int16" }
rate_limit_ms = 500
data_filter = 0xFFFF
"#;

    #[test]
    fn test_parse_sample() {
        let config = GatewayConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.gateway.name, "Battery Monitor");
        assert_eq!(config.report_interval(), Duration::from_secs(1));
        assert_eq!(config.connection.port, 20000);
        assert_eq!(config.connection.to_config().bus_name, "can1");
        assert_eq!(config.signals.len(), 2);

        let soc = config.signals[0].address.resolve().unwrap();
        assert_eq!(soc.address, 0x355);
        assert_eq!(soc.data_type, BitDataType::UInt16);
        assert_eq!(config.signals[0].rate_limit(), None);

        let voltage = &config.signals[1];
        let sig = voltage.address.resolve().unwrap();
        assert_eq!(sig.address, 0x356);
        assert_eq!(sig.bit_offset, 0);
        assert_eq!(sig.byte_ordering, ByteOrdering::LittleEndian);
        assert_eq!(sig.data_type, BitDataType::Int16);
        assert_eq!(voltage.rate_limit(), Some(Duration::from_millis(500)));
        assert_eq!(voltage.data_filter, 0xFFFF);
    }

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::from_toml_str("").unwrap();
        assert_eq!(config.gateway.name, "cangw");
        assert_eq!(config.gateway.report_interval_ms, 5000);
        assert_eq!(config.connection.port, 2947);
        assert!(config.signals.is_empty());
    }

    #[test]
    fn test_invalid_signal_is_rejected() {
        let err = GatewayConfig::from_toml_str(
            r#"
[[signals]]
name = "bad"
address = "0x355:0"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Signal 'bad'"));
    }

    #[test]
    fn test_duplicate_signal_names() {
        let err = GatewayConfig::from_toml_str(
            r#"
[[signals]]
name = "a"
address = "0x1:0:8"

[[signals]]
name = "a"
address = "0x2:0:8"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[test]
    fn test_toml_round_trip() {
        let config = GatewayConfig::from_toml_str(SAMPLE).unwrap();
        let text = config.to_toml_string().unwrap();
        let back = GatewayConfig::from_toml_str(&text).unwrap();
        assert_eq!(back.signals.len(), 2);
        assert_eq!(back.signals[1].address, config.signals[1].address);
    }

    #[test]
    fn test_load_missing_file() {
        assert!(GatewayConfig::load("/nonexistent/cangw.toml").is_err());
    }
}
