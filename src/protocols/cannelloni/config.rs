//! Cannelloni connection configuration types

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::error::{GatewayError, Result};

/// Default Cannelloni UDP port.
pub const DEFAULT_PORT: u16 = 2947;

/// Cannelloni connection configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CannelloniConfig {
    /// Local host name or address to bind.
    pub host: String,

    /// Local UDP port to bind.
    pub port: u16,

    /// Name of the CAN bus served by this connection.
    pub bus_name: String,

    /// Delay before a reconnect attempt. Zero connects immediately.
    pub reconnect_delay: Duration,

    /// Upper bound on waiting for `open()` and `close()`.
    pub shutdown_timeout: Duration,

    /// Receive buffer size in bytes.
    pub recv_buffer_size: usize,

    /// Emit raw datagrams to the channel log handler.
    pub log_raw_packets: bool,
}

impl Default for CannelloniConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            bus_name: "can0".to_string(),
            reconnect_delay: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(5),
            recv_buffer_size: 65535,
            log_raw_packets: false,
        }
    }
}

impl CannelloniConfig {
    /// Create a configuration bound to `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Set bus name.
    #[must_use]
    pub fn with_bus_name(mut self, bus_name: impl Into<String>) -> Self {
        self.bus_name = bus_name.into();
        self
    }

    /// Set reconnect delay.
    #[must_use]
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set open/close timeout.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set receive buffer size.
    #[must_use]
    pub fn with_recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = size;
        self
    }

    /// Enable or disable raw packet logging.
    #[must_use]
    pub fn with_log_raw_packets(mut self, enable: bool) -> Self {
        self.log_raw_packets = enable;
        self
    }

    /// The `host:port` endpoint.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check the configuration for values that can never work.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(GatewayError::Config("host must not be empty".into()));
        }
        if self.bus_name.trim().is_empty() {
            return Err(GatewayError::Config("bus_name must not be empty".into()));
        }
        if self.shutdown_timeout.is_zero() {
            return Err(GatewayError::Config(
                "shutdown_timeout must be greater than zero".into(),
            ));
        }
        if self.recv_buffer_size == 0 {
            return Err(GatewayError::Config(
                "recv_buffer_size must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Cannelloni connection parameters (deserialized from JSON or TOML).
///
/// # Example JSON
/// ```json
/// {
///     "host": "0.0.0.0",
///     "port": 20000,
///     "bus_name": "can0",
///     "reconnect_delay_secs": 60,
///     "shutdown_timeout_ms": 5000
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CannelloniParamsConfig {
    /// Local host name or address to bind.
    #[serde(default = "default_host")]
    pub host: String,

    /// Local UDP port to bind.
    #[serde(default = "default_port")]
    pub port: u16,

    /// CAN bus name.
    #[serde(default = "default_bus_name")]
    pub bus_name: String,

    /// Reconnect delay in seconds.
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,

    /// Open/close timeout in milliseconds.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Receive buffer size in bytes.
    #[serde(default = "default_recv_buffer_size")]
    pub recv_buffer_size: usize,

    /// Emit raw datagrams to the channel log handler.
    #[serde(default)]
    pub log_raw_packets: bool,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_bus_name() -> String {
    "can0".to_string()
}

fn default_reconnect_delay_secs() -> u64 {
    60
}

fn default_shutdown_timeout_ms() -> u64 {
    5000
}

fn default_recv_buffer_size() -> usize {
    65535
}

impl Default for CannelloniParamsConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            bus_name: default_bus_name(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            recv_buffer_size: default_recv_buffer_size(),
            log_raw_packets: false,
        }
    }
}

impl CannelloniParamsConfig {
    /// Convert to CannelloniConfig.
    pub fn to_config(&self) -> CannelloniConfig {
        CannelloniConfig::new(self.host.clone(), self.port)
            .with_bus_name(self.bus_name.clone())
            .with_reconnect_delay(Duration::from_secs(self.reconnect_delay_secs))
            .with_shutdown_timeout(Duration::from_millis(self.shutdown_timeout_ms))
            .with_recv_buffer_size(self.recv_buffer_size)
            .with_log_raw_packets(self.log_raw_packets)
    }
}

impl From<&CannelloniConfig> for CannelloniParamsConfig {
    fn from(config: &CannelloniConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            bus_name: config.bus_name.clone(),
            reconnect_delay_secs: config.reconnect_delay.as_secs(),
            shutdown_timeout_ms: config.shutdown_timeout.as_millis() as u64,
            recv_buffer_size: config.recv_buffer_size,
            log_raw_packets: config.log_raw_packets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CannelloniConfig::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 2947);
        assert_eq!(config.bus_name, "can0");
        assert_eq!(config.reconnect_delay, Duration::from_secs(60));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(config.endpoint(), "localhost:2947");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = CannelloniConfig::new("0.0.0.0", 20000)
            .with_bus_name("vcan1")
            .with_reconnect_delay(Duration::ZERO)
            .with_shutdown_timeout(Duration::from_millis(250))
            .with_log_raw_packets(true);

        assert_eq!(config.endpoint(), "0.0.0.0:20000");
        assert_eq!(config.bus_name, "vcan1");
        assert!(config.reconnect_delay.is_zero());
        assert!(config.log_raw_packets);
    }

    #[test]
    fn test_validate() {
        assert!(CannelloniConfig::new("", 1).validate().is_err());
        assert!(CannelloniConfig::default()
            .with_bus_name(" ")
            .validate()
            .is_err());
        assert!(CannelloniConfig::default()
            .with_shutdown_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(CannelloniConfig::default()
            .with_recv_buffer_size(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_params_defaults_from_json() {
        let params: CannelloniParamsConfig = serde_json::from_str(r#"{"port": 20000}"#).unwrap();
        let config = params.to_config();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 20000);
        assert_eq!(config.reconnect_delay, Duration::from_secs(60));
        assert_eq!(config.shutdown_timeout, Duration::from_millis(5000));
        assert_eq!(config.recv_buffer_size, 65535);
    }

    #[test]
    fn test_params_from_toml() {
        let params: CannelloniParamsConfig = toml::from_str(
            r#"
            host = "127.0.0.1"
            port = 3000
            bus_name = "can1"
            reconnect_delay_secs = 0
            shutdown_timeout_ms = 100
            log_raw_packets = true
            "#,
        )
        .unwrap();
        let config = params.to_config();
        assert_eq!(config.endpoint(), "127.0.0.1:3000");
        assert_eq!(config.bus_name, "can1");
        assert!(config.reconnect_delay.is_zero());
        assert_eq!(config.shutdown_timeout, Duration::from_millis(100));
        assert!(config.log_raw_packets);

        let back = CannelloniParamsConfig::from(&config);
        assert_eq!(back.port, 3000);
        assert_eq!(back.shutdown_timeout_ms, 100);
    }
}
