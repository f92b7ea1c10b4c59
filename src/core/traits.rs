//! Core traits for CAN bus connections.
//!
//! # Trait Overview
//!
//! ```text
//! CanbusFrameListener   // receives frames for a subscription or monitor
//! CanbusConnection      // open/close, subscribe/unsubscribe, monitor
//! ```
//!
//! Components that consume bus traffic depend only on [`CanbusConnection`];
//! the socket and decoder behind it are never exposed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::error::Result;
use crate::core::frame::CanbusFrame;

/// Data filter value that matches every frame.
pub const NO_DATA_FILTER: u64 = 0;

/// Connection state of a bus connection.
///
/// Exactly one state holds at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No socket and no pending connect.
    #[default]
    Closed,

    /// A connect attempt is in flight or waiting on the reconnect timer.
    ConnectionScheduled,

    /// Socket bound and receiving.
    Connected,
}

impl ConnectionState {
    /// Check if currently connected.
    #[inline]
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if fully closed.
    #[inline]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Closed => "Closed",
            Self::ConnectionScheduled => "ConnectionScheduled",
            Self::Connected => "Connected",
        };
        write!(f, "{}", s)
    }
}

/// Receiver of bus frames.
///
/// Called from the connection's receive task, so implementations should
/// return quickly and hand heavy work off elsewhere. Any
/// `Fn(&CanbusFrame) + Send + Sync` closure is a listener.
pub trait CanbusFrameListener: Send + Sync {
    /// Handle a received frame.
    fn canbus_frame_received(&self, frame: &CanbusFrame);
}

impl<F> CanbusFrameListener for F
where
    F: Fn(&CanbusFrame) + Send + Sync,
{
    fn canbus_frame_received(&self, frame: &CanbusFrame) {
        self(frame)
    }
}

/// Connection diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostics {
    /// Protocol name.
    pub protocol: String,

    /// Connection state.
    pub connection_state: ConnectionState,

    /// Datagrams received.
    pub datagrams_received: u64,

    /// Frames decoded.
    pub frames_received: u64,

    /// Transport errors.
    pub error_count: u64,

    /// Last transport error.
    pub last_error: Option<String>,

    /// Protocol-specific information.
    #[serde(default)]
    pub extra: serde_json::Value,
}

impl Diagnostics {
    /// Create new diagnostics.
    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            connection_state: ConnectionState::Closed,
            datagrams_received: 0,
            frames_received: 0,
            error_count: 0,
            last_error: None,
            extra: serde_json::Value::Null,
        }
    }
}

/// A connection to a CAN bus.
///
/// Subscriptions are unique per address: subscribing again to an address
/// replaces the earlier subscription (last writer wins) and logs a warning.
///
/// This trait uses `async_trait` so it can be used as `dyn CanbusConnection`.
#[async_trait]
pub trait CanbusConnection: Send + Sync {
    /// Name of the bus this connection serves.
    fn bus_name(&self) -> &str;

    /// Open the connection, waiting a bounded time for it to be established.
    async fn open(&self) -> Result<()>;

    /// Close the connection and stop reconnecting. Never fails.
    async fn close(&self) -> Result<()>;

    /// Whether the connection is established.
    fn is_established(&self) -> bool;

    /// Whether the connection is fully closed.
    fn is_closed(&self) -> bool;

    /// Subscribe to frames at `address`.
    ///
    /// Addresses above `0x7FF`, or any address when `force_extended` is set,
    /// match extended-format frames only. The listener fires when bits
    /// selected by `data_filter` differ from the last delivered frame;
    /// [`NO_DATA_FILTER`] fires on every frame. `rate_limit` drops deliveries
    /// that come sooner than the limit after the previous one.
    fn subscribe(
        &self,
        address: u32,
        force_extended: bool,
        rate_limit: Option<Duration>,
        data_filter: u64,
        listener: Arc<dyn CanbusFrameListener>,
    ) -> Result<()>;

    /// Subscribe to a multiplexed address.
    ///
    /// `identifier_mask` selects the sub-identifier bits of the payload.
    /// Each entry of `data_filters` holds a sub-identifier value in its
    /// identifier bits and the change mask for that value in the rest.
    fn subscribe_multiplexed(
        &self,
        address: u32,
        force_extended: bool,
        rate_limit: Option<Duration>,
        identifier_mask: u64,
        data_filters: Vec<u64>,
        listener: Arc<dyn CanbusFrameListener>,
    ) -> Result<()>;

    /// Remove the subscription at `address`. Idempotent.
    fn unsubscribe(&self, address: u32, force_extended: bool) -> Result<()>;

    /// Deliver every frame to `listener`, suspending subscriptions.
    fn monitor(&self, listener: Arc<dyn CanbusFrameListener>) -> Result<()>;

    /// Stop monitoring and resume subscriptions.
    fn unmonitor(&self) -> Result<()>;

    /// Whether monitor mode is active.
    fn is_monitoring(&self) -> bool;

    /// Check that the connection can currently receive traffic.
    async fn verify_connectivity(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_connection_state() {
        assert!(!ConnectionState::Closed.is_connected());
        assert!(ConnectionState::Connected.is_connected());
        assert!(ConnectionState::Closed.is_closed());
        assert!(!ConnectionState::ConnectionScheduled.is_closed());
        assert_eq!(ConnectionState::default(), ConnectionState::Closed);
        assert_eq!(
            ConnectionState::ConnectionScheduled.to_string(),
            "ConnectionScheduled"
        );
    }

    #[test]
    fn test_closure_listener() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let listener: Arc<dyn CanbusFrameListener> = Arc::new(move |_: &CanbusFrame| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        listener.canbus_frame_received(&CanbusFrame::classic(0x1, vec![1]));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_diagnostics_serialize() {
        let diag = Diagnostics::new("cannelloni");
        let json = serde_json::to_value(&diag).unwrap();
        assert_eq!(json["connection_state"], "closed");
        assert_eq!(json["frames_received"], 0);
    }
}
