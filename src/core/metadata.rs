//! Connection metadata.
//!
//! Each bus connection type describes its parameters and an example
//! configuration. The CLI uses the registry to print `describe` and
//! `example` output.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Value type of a connection parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    String,
    Integer,
    Boolean,
}

/// Metadata for a single configuration parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterMetadata {
    /// Internal parameter name (used in config).
    pub name: &'static str,
    /// Human-readable display name.
    pub display_name: &'static str,
    /// Description of the parameter.
    pub description: &'static str,
    /// Whether this parameter is required.
    pub required: bool,
    /// Default value if not specified.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    /// Type of the parameter.
    pub param_type: ParameterType,
}

impl ParameterMetadata {
    /// Create a new required parameter.
    pub const fn required(
        name: &'static str,
        display_name: &'static str,
        description: &'static str,
        param_type: ParameterType,
    ) -> Self {
        Self {
            name,
            display_name,
            description,
            required: true,
            default_value: None,
            param_type,
        }
    }

    /// Create a new optional parameter with a default value.
    pub fn optional(
        name: &'static str,
        display_name: &'static str,
        description: &'static str,
        param_type: ParameterType,
        default_value: Value,
    ) -> Self {
        Self {
            name,
            display_name,
            description,
            required: false,
            default_value: Some(default_value),
            param_type,
        }
    }
}

/// Metadata for a driver implementation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverMetadata {
    /// Internal driver name (used in config).
    pub name: &'static str,
    /// Human-readable display name.
    pub display_name: &'static str,
    /// Description of the driver.
    pub description: &'static str,
    /// Whether this is the recommended driver.
    pub is_recommended: bool,
    /// Example configuration JSON.
    pub example_config: Value,
    /// Available configuration parameters.
    pub parameters: Vec<ParameterMetadata>,
}

/// Metadata for a protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolMetadata {
    /// Internal protocol name.
    pub name: &'static str,
    /// Human-readable display name.
    pub display_name: &'static str,
    /// Description of the protocol.
    pub description: &'static str,
    /// Protocol type identifier (e.g., "canbus").
    pub protocol_type: &'static str,
    /// Available drivers for this protocol.
    pub drivers: Vec<DriverMetadata>,
}

/// Registry of all available protocols and drivers.
pub struct ProtocolRegistry {
    protocols: Vec<ProtocolMetadata>,
}

impl ProtocolRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            protocols: Vec::new(),
        }
    }

    /// Register a protocol.
    pub fn register(&mut self, protocol: ProtocolMetadata) {
        self.protocols.push(protocol);
    }

    /// Get all registered protocols.
    pub fn protocols(&self) -> &[ProtocolMetadata] {
        &self.protocols
    }

    /// Get a protocol by name.
    pub fn get_protocol(&self, name: &str) -> Option<&ProtocolMetadata> {
        self.protocols
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    /// Find a driver by name across all protocols.
    pub fn find_driver(&self, name: &str) -> Option<(&ProtocolMetadata, &DriverMetadata)> {
        self.protocols.iter().find_map(|p| {
            p.drivers
                .iter()
                .find(|d| d.name.eq_ignore_ascii_case(name))
                .map(|d| (p, d))
        })
    }

    /// All example configurations as (protocol_type, label, config) tuples.
    pub fn get_examples(&self) -> Vec<(&'static str, String, Value)> {
        let mut examples = Vec::new();
        for protocol in &self.protocols {
            for driver in &protocol.drivers {
                let label = if driver.is_recommended {
                    format!(
                        "{} - {} (Recommended)",
                        protocol.display_name, driver.display_name
                    )
                } else {
                    format!("{} - {}", protocol.display_name, driver.display_name)
                };
                examples.push((protocol.protocol_type, label, driver.example_config.clone()));
            }
        }
        examples
    }
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Trait for types that can provide their own metadata.
pub trait HasMetadata {
    /// Get the metadata for this type.
    fn metadata() -> DriverMetadata;
}

/// Build the global protocol registry.
fn build_registry() -> ProtocolRegistry {
    use crate::protocols::cannelloni::CannelloniConnection;

    let mut registry = ProtocolRegistry::new();
    registry.register(ProtocolMetadata {
        name: "cannelloni",
        display_name: "Cannelloni",
        description: "CAN bus frames tunneled over UDP",
        protocol_type: "canbus",
        drivers: vec![CannelloniConnection::metadata()],
    });
    registry
}

/// Global protocol registry instance.
static PROTOCOL_REGISTRY: Lazy<ProtocolRegistry> = Lazy::new(build_registry);

/// Get the global protocol registry.
pub fn get_protocol_registry() -> &'static ProtocolRegistry {
    &PROTOCOL_REGISTRY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_creation() {
        let registry = get_protocol_registry();
        assert!(!registry.protocols().is_empty());
        let cannelloni = registry.get_protocol("cannelloni").unwrap();
        assert_eq!(cannelloni.drivers.len(), 1);
        assert_eq!(cannelloni.drivers[0].display_name, "Cannelloni Client");
        assert!(registry.get_protocol("modbus").is_none());
        assert!(registry.get_protocol("Cannelloni").is_some());

        let (protocol, driver) = registry.find_driver("cannelloni").unwrap();
        assert_eq!(protocol.protocol_type, "canbus");
        assert!(driver.parameters.iter().any(|p| p.name == "port"));
    }

    #[test]
    fn test_get_examples() {
        let registry = get_protocol_registry();
        let examples = registry.get_examples();
        assert_eq!(examples.len(), 1);
        let (protocol_type, label, config) = &examples[0];
        assert_eq!(*protocol_type, "canbus");
        assert!(label.ends_with("(Recommended)"));
        assert_eq!(config["port"], 20000);
    }

    #[test]
    fn test_parameter_constructors() {
        let required = ParameterMetadata::required("host", "Host", "Bind host", ParameterType::String);
        assert!(required.required);
        assert!(required.default_value.is_none());

        let optional = ParameterMetadata::optional(
            "port",
            "Port",
            "Bind port",
            ParameterType::Integer,
            serde_json::json!(2947),
        );
        assert!(!optional.required);
        let json = serde_json::to_value(&optional).unwrap();
        assert_eq!(json["param_type"], "integer");
        assert_eq!(json["default_value"], 2947);
    }
}
