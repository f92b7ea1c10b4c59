//! Channel logging infrastructure.
//!
//! A connection reports lifecycle events and, optionally, the raw datagrams
//! it receives to a pluggable [`ChannelLogHandler`]. This sits beside the
//! `tracing` output and lets an embedding application keep its own
//! per-connection history.
//!
//! # Example
//!
//! ```ignore
//! use cangw::core::logging::{ChannelLogConfig, ChannelLogEvent, ChannelLogHandler};
//!
//! struct History(Mutex<Vec<ChannelLogEvent>>);
//!
//! #[async_trait]
//! impl ChannelLogHandler for History {
//!     async fn on_log(&self, _channel_id: u32, event: ChannelLogEvent) {
//!         self.0.lock().unwrap().push(event);
//!     }
//! }
//!
//! let conn = CannelloniConnection::new(config);
//! conn.set_log_handler(Arc::new(History(Mutex::new(Vec::new()))));
//! conn.set_log_config(ChannelLogConfig::all().with_max_packet_size(64));
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::traits::ConnectionState;

// ============================================================================
// Packets
// ============================================================================

/// Direction of a logged datagram relative to this side of the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketDirection {
    Send,
    Receive,
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Send => "tx",
            Self::Receive => "rx",
        })
    }
}

/// Where a logged datagram came from and what it carried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketMetadata {
    protocol: &'static str,
    /// Remote peer address.
    pub peer: String,
    /// Frames decoded from the datagram.
    pub frames: usize,
}

impl PacketMetadata {
    /// Metadata for a Cannelloni datagram.
    pub fn cannelloni(peer: impl Into<String>, frames: usize) -> Self {
        Self {
            protocol: "cannelloni",
            peer: peer.into(),
            frames,
        }
    }

    pub fn protocol_name(&self) -> &str {
        self.protocol
    }
}

/// Stage of the connection an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorContext {
    /// Binding the socket.
    Connection,
    /// Reading from the socket.
    Receive,
    /// Handing a frame to a subscriber.
    Dispatch,
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connection => "connection",
            Self::Receive => "receive",
            Self::Dispatch => "dispatch",
        })
    }
}

// ============================================================================
// Events
// ============================================================================

/// Kind of a [`ChannelLogEvent`], used to filter what reaches the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEventType {
    Connected,
    Disconnected,
    Error,
    ReconnectScheduled,
    StateChanged,
    RawPacket,
}

impl LogEventType {
    const fn bit(self) -> u8 {
        1 << self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
            Self::ReconnectScheduled => "reconnect_scheduled",
            Self::StateChanged => "state_changed",
            Self::RawPacket => "raw_packet",
        }
    }
}

/// Event reported by a connection.
#[derive(Debug, Clone)]
pub enum ChannelLogEvent {
    /// Socket bound and receiving.
    Connected {
        timestamp: SystemTime,
        /// Local address the socket is bound to.
        endpoint: String,
        /// Time taken to bind.
        duration_ms: u64,
    },
    /// Socket released. `reason` is `None` when the connection was closed
    /// on request.
    Disconnected {
        timestamp: SystemTime,
        reason: Option<String>,
    },
    Error {
        timestamp: SystemTime,
        error: String,
        context: ErrorContext,
    },
    ReconnectScheduled {
        timestamp: SystemTime,
        /// Reconnects scheduled over the connection's lifetime.
        attempt: u64,
        delay_ms: u64,
    },
    StateChanged {
        timestamp: SystemTime,
        old_state: ConnectionState,
        new_state: ConnectionState,
    },
    /// Datagram as received, truncated to the configured size.
    RawPacket {
        timestamp: SystemTime,
        direction: PacketDirection,
        data: Vec<u8>,
        metadata: PacketMetadata,
    },
}

impl ChannelLogEvent {
    pub fn timestamp(&self) -> SystemTime {
        match self {
            Self::Connected { timestamp, .. }
            | Self::Disconnected { timestamp, .. }
            | Self::Error { timestamp, .. }
            | Self::ReconnectScheduled { timestamp, .. }
            | Self::StateChanged { timestamp, .. }
            | Self::RawPacket { timestamp, .. } => *timestamp,
        }
    }

    pub fn kind(&self) -> LogEventType {
        match self {
            Self::Connected { .. } => LogEventType::Connected,
            Self::Disconnected { .. } => LogEventType::Disconnected,
            Self::Error { .. } => LogEventType::Error,
            Self::ReconnectScheduled { .. } => LogEventType::ReconnectScheduled,
            Self::StateChanged { .. } => LogEventType::StateChanged,
            Self::RawPacket { .. } => LogEventType::RawPacket,
        }
    }
}

// ============================================================================
// Config
// ============================================================================

/// Which events reach the channel log handler.
///
/// The default passes every lifecycle event and no raw packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelLogConfig {
    events: u8,
    /// Longest raw packet passed on, in bytes. 0 means no limit.
    max_packet_size: usize,
}

impl Default for ChannelLogConfig {
    fn default() -> Self {
        Self::all().with_raw_packets(false)
    }
}

impl ChannelLogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event including raw packets.
    pub fn all() -> Self {
        Self {
            events: u8::MAX,
            max_packet_size: 0,
        }
    }

    /// No events.
    pub fn disabled() -> Self {
        Self {
            events: 0,
            max_packet_size: 0,
        }
    }

    #[must_use]
    pub fn with_raw_packets(mut self, enable: bool) -> Self {
        if enable {
            self.events |= LogEventType::RawPacket.bit();
        } else {
            self.events &= !LogEventType::RawPacket.bit();
        }
        self
    }

    #[must_use]
    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    pub fn is_enabled(&self, kind: LogEventType) -> bool {
        self.events & kind.bit() != 0
    }

    pub fn should_log_raw_packets(&self) -> bool {
        self.is_enabled(LogEventType::RawPacket)
    }

    pub fn should_log(&self, event: &ChannelLogEvent) -> bool {
        self.is_enabled(event.kind())
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Receiver of channel log events.
///
/// Uses `async_trait` so handlers can be stored as `Arc<dyn ChannelLogHandler>`.
#[async_trait]
pub trait ChannelLogHandler: Send + Sync {
    async fn on_log(&self, channel_id: u32, event: ChannelLogEvent);
}

/// Forwards channel events to `tracing`, tagged with the bus name.
#[cfg(feature = "tracing-support")]
pub struct TracingLogHandler {
    bus_name: String,
}

#[cfg(feature = "tracing-support")]
impl TracingLogHandler {
    pub fn new(bus_name: impl Into<String>) -> Self {
        Self {
            bus_name: bus_name.into(),
        }
    }
}

#[cfg(feature = "tracing-support")]
#[async_trait]
impl ChannelLogHandler for TracingLogHandler {
    async fn on_log(&self, channel_id: u32, event: ChannelLogEvent) {
        use tracing::{debug, error, info, trace, warn};

        let bus = self.bus_name.as_str();
        match &event {
            ChannelLogEvent::Connected {
                endpoint,
                duration_ms,
                ..
            } => {
                info!(channel_id, bus, %endpoint, duration_ms, "CAN bus listening");
            }
            ChannelLogEvent::Disconnected {
                reason: Some(reason),
                ..
            } => {
                warn!(channel_id, bus, %reason, "CAN bus connection lost");
            }
            ChannelLogEvent::Disconnected { reason: None, .. } => {
                info!(channel_id, bus, "CAN bus connection closed");
            }
            ChannelLogEvent::Error { error, context, .. } => {
                error!(channel_id, bus, %error, %context, "CAN bus error");
            }
            ChannelLogEvent::ReconnectScheduled {
                attempt, delay_ms, ..
            } => {
                info!(channel_id, bus, attempt, delay_ms, "CAN bus reconnect scheduled");
            }
            ChannelLogEvent::RawPacket {
                direction,
                data,
                metadata,
                ..
            } => {
                let hex: String = data.iter().map(|b| format!("{:02X}", b)).collect();
                trace!(
                    channel_id,
                    bus,
                    protocol = metadata.protocol_name(),
                    peer = %metadata.peer,
                    %direction,
                    size = data.len(),
                    data = %hex,
                    "Datagram"
                );
            }
            ChannelLogEvent::StateChanged {
                old_state,
                new_state,
                ..
            } => {
                debug!(channel_id, bus, %old_state, %new_state, "CAN bus state changed");
            }
        }
    }
}

// ============================================================================
// Log Context
// ============================================================================

/// Handler and filter held by one connection.
///
/// Every method is synchronous so it can be called from state transitions
/// made under a lock. Events that pass the filter are handed to the handler
/// on a spawned task; without a tokio runtime they are dropped.
#[derive(Clone)]
pub struct LogContext {
    channel_id: u32,
    handler: Option<Arc<dyn ChannelLogHandler>>,
    config: ChannelLogConfig,
}

impl LogContext {
    pub fn new(channel_id: u32) -> Self {
        Self {
            channel_id,
            handler: None,
            config: ChannelLogConfig::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: ChannelLogConfig) -> Self {
        self.config = config;
        self
    }

    pub fn set_handler(&mut self, handler: Arc<dyn ChannelLogHandler>) {
        self.handler = Some(handler);
    }

    pub fn set_config(&mut self, config: ChannelLogConfig) {
        self.config = config;
    }

    pub fn config(&self) -> &ChannelLogConfig {
        &self.config
    }

    fn emit(&self, event: ChannelLogEvent) {
        let Some(handler) = &self.handler else {
            return;
        };
        if !self.config.should_log(&event) {
            return;
        }
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            let handler = Arc::clone(handler);
            let channel_id = self.channel_id;
            rt.spawn(async move { handler.on_log(channel_id, event).await });
        }
    }

    pub fn log_connected(&self, endpoint: impl Into<String>, duration_ms: u64) {
        self.emit(ChannelLogEvent::Connected {
            timestamp: SystemTime::now(),
            endpoint: endpoint.into(),
            duration_ms,
        });
    }

    pub fn log_disconnected(&self, reason: Option<String>) {
        self.emit(ChannelLogEvent::Disconnected {
            timestamp: SystemTime::now(),
            reason,
        });
    }

    pub fn log_error(&self, error: impl Into<String>, context: ErrorContext) {
        self.emit(ChannelLogEvent::Error {
            timestamp: SystemTime::now(),
            error: error.into(),
            context,
        });
    }

    pub fn log_reconnect_scheduled(&self, attempt: u64, delay_ms: u64) {
        self.emit(ChannelLogEvent::ReconnectScheduled {
            timestamp: SystemTime::now(),
            attempt,
            delay_ms,
        });
    }

    /// Report a state transition. Unchanged states are not reported.
    pub fn log_state_changed(&self, old_state: ConnectionState, new_state: ConnectionState) {
        if old_state != new_state {
            self.emit(ChannelLogEvent::StateChanged {
                timestamp: SystemTime::now(),
                old_state,
                new_state,
            });
        }
    }

    pub fn log_raw_packet(&self, direction: PacketDirection, data: &[u8], metadata: PacketMetadata) {
        if self.handler.is_none() || !self.config.should_log_raw_packets() {
            return;
        }
        let max = self.config.max_packet_size;
        let kept = if max > 0 { &data[..data.len().min(max)] } else { data };
        self.emit(ChannelLogEvent::RawPacket {
            timestamp: SystemTime::now(),
            direction,
            data: kept.to_vec(),
            metadata,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    struct ChannelHandler(mpsc::UnboundedSender<(u32, ChannelLogEvent)>);

    #[async_trait]
    impl ChannelLogHandler for ChannelHandler {
        async fn on_log(&self, channel_id: u32, event: ChannelLogEvent) {
            let _ = self.0.send((channel_id, event));
        }
    }

    fn context(config: ChannelLogConfig) -> (LogContext, mpsc::UnboundedReceiver<(u32, ChannelLogEvent)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut ctx = LogContext::new(20000).with_config(config);
        ctx.set_handler(Arc::new(ChannelHandler(tx)));
        (ctx, rx)
    }

    #[test]
    fn test_log_config() {
        let config = ChannelLogConfig::new();
        assert!(config.is_enabled(LogEventType::Connected));
        assert!(config.is_enabled(LogEventType::StateChanged));
        assert!(!config.should_log_raw_packets());

        assert!(ChannelLogConfig::all().should_log_raw_packets());

        let config = ChannelLogConfig::disabled();
        assert!(!config.is_enabled(LogEventType::Connected));

        let config = ChannelLogConfig::disabled().with_raw_packets(true);
        assert!(config.should_log_raw_packets());
        assert!(!config.is_enabled(LogEventType::Error));
    }

    #[test]
    fn test_event_kind() {
        let event = ChannelLogEvent::Error {
            timestamp: SystemTime::UNIX_EPOCH,
            error: "boom".into(),
            context: ErrorContext::Dispatch,
        };
        assert_eq!(event.kind(), LogEventType::Error);
        assert_eq!(event.kind().as_str(), "error");
        assert_eq!(event.timestamp(), SystemTime::UNIX_EPOCH);
        assert_eq!(ErrorContext::Dispatch.to_string(), "dispatch");
        assert_eq!(PacketMetadata::cannelloni("peer", 3).protocol_name(), "cannelloni");
    }

    #[tokio::test]
    async fn test_raw_packets_are_truncated() {
        let (ctx, mut rx) = context(ChannelLogConfig::all().with_max_packet_size(4));
        ctx.log_raw_packet(
            PacketDirection::Receive,
            &[0u8; 10],
            PacketMetadata::cannelloni("127.0.0.1:20000", 0),
        );

        let (channel_id, event) = rx.recv().await.unwrap();
        assert_eq!(channel_id, 20000);
        match event {
            ChannelLogEvent::RawPacket { data, direction, .. } => {
                assert_eq!(data.len(), 4);
                assert_eq!(direction.to_string(), "rx");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_filtered_events_are_dropped() {
        let (ctx, mut rx) = context(ChannelLogConfig::new());
        ctx.log_raw_packet(PacketDirection::Receive, &[1, 2], PacketMetadata::cannelloni("p", 0));
        ctx.log_state_changed(ConnectionState::Closed, ConnectionState::Closed);
        ctx.log_disconnected(None);

        let (_, event) = rx.recv().await.unwrap();
        assert_eq!(event.kind(), LogEventType::Disconnected);
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_no_runtime_drops_events() {
        let seen = Arc::new(Mutex::new(0usize));
        struct Counting(Arc<Mutex<usize>>);
        #[async_trait]
        impl ChannelLogHandler for Counting {
            async fn on_log(&self, _channel_id: u32, _event: ChannelLogEvent) {
                *self.0.lock().unwrap() += 1;
            }
        }
        let mut ctx = LogContext::new(1);
        ctx.set_handler(Arc::new(Counting(Arc::clone(&seen))));
        ctx.log_connected("0.0.0.0:20000", 1);
        assert_eq!(*seen.lock().unwrap(), 0);
    }

    #[cfg(feature = "tracing-support")]
    #[tokio::test]
    async fn test_tracing_handler_accepts_every_event() {
        let handler = TracingLogHandler::new("can0");
        let now = SystemTime::now();
        let events = [
            ChannelLogEvent::Connected {
                timestamp: now,
                endpoint: "0.0.0.0:20000".into(),
                duration_ms: 1,
            },
            ChannelLogEvent::Disconnected {
                timestamp: now,
                reason: Some("socket closed".into()),
            },
            ChannelLogEvent::Disconnected {
                timestamp: now,
                reason: None,
            },
            ChannelLogEvent::RawPacket {
                timestamp: now,
                direction: PacketDirection::Receive,
                data: vec![0x02, 0x00],
                metadata: PacketMetadata::cannelloni("peer", 0),
            },
        ];
        for event in events {
            handler.on_log(7, event).await;
        }
    }
}
