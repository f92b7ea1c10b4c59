//! Core abstractions for the CAN gateway.
//!
//! This module provides the frame and signal model plus the traits every bus
//! connection implements.

pub mod error;
pub mod frame;
pub mod logging;
pub mod metadata;
pub mod signal;
pub mod traits;

pub use error::{GatewayError, Result};
pub use frame::*;
pub use signal::*;
pub use traits::*;
