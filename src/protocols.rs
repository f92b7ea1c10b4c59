//! Protocol implementations.
//!
//! Each protocol module provides a [`CanbusConnection`](crate::core::traits::CanbusConnection)
//! for one transport.

pub mod cannelloni;
