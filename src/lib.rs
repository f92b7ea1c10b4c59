//! # CAN Gateway (cangw)
//!
//! A CAN-bus-over-UDP gateway client for the Cannelloni tunneling protocol.
//!
//! ## Features
//!
//! - **Incremental Decoding**: Cannelloni batches are decoded as bytes arrive
//! - **Signal Cache**: Latest frame per address with bit-field extraction
//! - **Subscriptions**: Per-address listeners with change filters and rate limits
//! - **Resilient**: Fixed-delay reconnect until the connection is closed
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use cangw::prelude::*;
//! use cangw::protocols::cannelloni::{CannelloniConfig, CannelloniConnection};
//!
//! let conn = CannelloniConnection::new(CannelloniConfig::new("0.0.0.0", 20000));
//! conn.open().await?;
//!
//! let soc = CanbusSignalReference::new(0x355, 0, 16).with_ordering(ByteOrdering::LittleEndian);
//! let value = conn.data().get_number(&soc);
//! ```
//!
//! ## Modules
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`core`] | Frames, signals, errors, connection traits, logging |
//! | [`codec`] | Cannelloni decoder/encoder, bit-field extraction |
//! | [`store`] | `CanbusData` frame cache |
//! | [`protocols`] | `CannelloniConnection` |
//! | [`gateway`] | TOML configuration and signal wiring |

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod codec;
pub mod core;
pub mod gateway;
pub mod protocols;
pub mod store;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::core::{
        error::{GatewayError, Result},
        frame::CanbusFrame,
        signal::*,
        traits::*,
    };
    pub use crate::store::CanbusData;
}

// Re-export core types at crate root for convenience
pub use crate::core::error::{GatewayError, Result};
pub use crate::core::frame::CanbusFrame;
pub use crate::core::signal::{BitDataType, ByteOrdering, CanbusSignalReference, Number};
pub use crate::core::traits::{CanbusConnection, CanbusFrameListener, ConnectionState};

// Re-export store and protocol types
pub use crate::protocols::cannelloni::{CannelloniConfig, CannelloniConnection};
pub use crate::store::CanbusData;
