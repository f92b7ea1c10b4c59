//! Cannelloni Protocol Implementation (CAN over UDP)
//!
//! Receives CAN bus traffic tunneled over UDP by a Cannelloni bridge.
//! This implementation supports:
//! - Incremental decoding of Cannelloni DATA batches (classic, FD and RTR frames)
//! - A live cache of the latest frame per address with bit-field extraction
//! - Per-address subscriptions with change filters, multiplexing and rate limits
//! - Automatic rebinding after transport failures with a fixed delay
//!
//! ## Example
//!
//! ```rust,ignore
//! use cangw::protocols::cannelloni::{CannelloniConfig, CannelloniConnection};
//! use cangw::core::signal::CanbusSignalReference;
//!
//! let conn = CannelloniConnection::new(CannelloniConfig::new("0.0.0.0", 20000));
//! conn.open().await?;
//!
//! // Poll a signal from the cache
//! let soc = CanbusSignalReference::new(0x355, 0, 16);
//! if let Some(value) = conn.data().get_number(&soc) {
//!     println!("SOC: {}", value);
//! }
//! ```

mod client;
mod config;
mod subscription;

pub use client::{CannelloniConnection, ConnectFuture};
pub use config::{CannelloniConfig, CannelloniParamsConfig, DEFAULT_PORT};
pub use subscription::{CanbusSubscription, SubscriptionKind, SubscriptionRegistry};
