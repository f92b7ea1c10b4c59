//! Gateway assembly.
//!
//! Loads a TOML configuration, creates the connection and resolves the
//! signals it reports.

pub mod address;
pub mod config;
pub mod factory;

pub use address::{parse_bus_address, parse_signal_address};
pub use config::{GatewayConfig, GatewaySettings, SignalAddress, SignalDef};
pub use factory::{create_connection, resolve_signals, sample_signals, subscribe_signals, ResolvedSignal};
