//! Cannelloni client connection.
//!
//! Binds a UDP socket, decodes incoming Cannelloni batches into the shared
//! [`CanbusData`] cache and dispatches frames to subscribers. Transport
//! failures schedule a reconnect after a fixed delay until the connection is
//! closed.

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::BytesMut;
use futures::future::{self, BoxFuture, FutureExt, Shared};
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time;

use crate::codec::cannelloni::{CannelloniFrameDecoder, DecoderStats};
use crate::core::error::{GatewayError, Result};
use crate::core::frame::CanbusFrame;
use crate::core::logging::{
    ChannelLogConfig, ChannelLogHandler, ErrorContext, LogContext, PacketDirection, PacketMetadata,
};
use crate::core::traits::{CanbusConnection, CanbusFrameListener, ConnectionState, Diagnostics};
use crate::store::CanbusData;

use super::config::CannelloniConfig;
use super::subscription::{CanbusSubscription, SubscriptionRegistry};

/// Shareable result of a pending connect.
pub type ConnectFuture = Shared<BoxFuture<'static, Result<()>>>;

// ============================================================================
// Link state
// ============================================================================

/// Reconnect timer waiting to fire.
struct PendingTimer {
    id: u64,
    abort: AbortHandle,
    future: ConnectFuture,
}

/// Bound socket and its receive task.
struct Channel {
    generation: u64,
    local_addr: SocketAddr,
    close_tx: oneshot::Sender<()>,
    reader: JoinHandle<()>,
}

/// Everything guarded by the connection lock.
///
/// `generation` advances on every start and stop, so a bind or receive task
/// from an earlier generation can tell it has been superseded.
#[derive(Default)]
struct LinkState {
    shutdown: bool,
    generation: u64,
    timer_seq: u64,
    timer: Option<PendingTimer>,
    starting: Option<ConnectFuture>,
    channel: Option<Channel>,
}

impl LinkState {
    fn status(&self) -> ConnectionState {
        if self.channel.is_some() {
            ConnectionState::Connected
        } else if self.starting.is_some() || self.timer.is_some() {
            ConnectionState::ConnectionScheduled
        } else {
            ConnectionState::Closed
        }
    }

    fn is_idle(&self) -> bool {
        self.timer.is_none() && self.starting.is_none() && self.channel.is_none()
    }

    /// Cancel the timer, abandon any bind in flight and signal the channel
    /// to close. Returns the local address and receive task of the channel.
    fn stop(&mut self) -> Option<(SocketAddr, JoinHandle<()>)> {
        if let Some(timer) = self.timer.take() {
            timer.abort.abort();
        }
        self.starting = None;
        self.generation += 1;
        let Channel {
            local_addr,
            close_tx,
            reader,
            ..
        } = self.channel.take()?;
        // the reader may already be gone
        let _ = close_tx.send(());
        Some((local_addr, reader))
    }
}

#[derive(Debug, Default)]
struct Counters {
    datagrams: AtomicU64,
    frames: AtomicU64,
    deliveries: AtomicU64,
    errors: AtomicU64,
    reconnects: AtomicU64,
    listener_panics: AtomicU64,
}

// ============================================================================
// Inner
// ============================================================================

struct Inner {
    config: CannelloniConfig,
    data: Arc<CanbusData>,
    link: Mutex<LinkState>,
    subscriptions: Mutex<SubscriptionRegistry>,
    log: RwLock<LogContext>,
    counters: Counters,
    last_error: Mutex<Option<String>>,
    decoder_stats: Mutex<DecoderStats>,
}

impl Inner {
    fn endpoint(&self) -> String {
        self.config.endpoint()
    }

    /// Run `f` under the connection lock and report any state change.
    fn with_link<R>(&self, f: impl FnOnce(&mut LinkState) -> R) -> R {
        let mut link = self.link.lock().unwrap_or_else(PoisonError::into_inner);
        let old = link.status();
        let result = f(&mut link);
        let new = link.status();
        drop(link);

        if old != new {
            #[cfg(feature = "tracing-support")]
            tracing::debug!("Cannelloni @ {} {} -> {}", self.endpoint(), old, new);
            self.log
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .log_state_changed(old, new);
        }
        result
    }

    fn status(&self) -> ConnectionState {
        self.link.lock().unwrap_or_else(PoisonError::into_inner).status()
    }

    fn record_error(&self, err: &GatewayError, context: ErrorContext) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(err.to_string());
        self.log
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .log_error(err.to_string(), context);
    }

    /// Start binding, or join a bind already in flight.
    fn start_locked(self: &Arc<Self>, link: &mut LinkState) -> ConnectFuture {
        if let Some(starting) = &link.starting {
            return starting.clone();
        }
        if link.channel.is_some() {
            return future::ready(Ok(())).boxed().shared();
        }

        link.generation += 1;
        let generation = link.generation;

        #[cfg(feature = "tracing-support")]
        tracing::info!("Connecting to Cannelloni @ {}", self.endpoint());

        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move { inner.connect(generation).await });
        let starting = async move {
            handle
                .await
                .map_err(|e| GatewayError::Internal(format!("Connect task failed: {}", e)))?
        }
        .boxed()
        .shared();
        link.starting = Some(starting.clone());
        starting
    }

    fn start(self: &Arc<Self>) -> ConnectFuture {
        self.with_link(|link| self.start_locked(link))
    }

    /// Bind the socket and spawn the receive task.
    async fn connect(self: Arc<Self>, generation: u64) -> Result<()> {
        let started = Instant::now();
        let bound = async {
            let socket =
                UdpSocket::bind((self.config.host.as_str(), self.config.port)).await?;
            socket.set_broadcast(true)?;
            let local_addr = socket.local_addr()?;
            Ok::<_, std::io::Error>((socket, local_addr))
        }
        .await;

        let (socket, local_addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                let err = GatewayError::Io(e);
                self.connect_failed(generation, &err);
                return Err(err);
            }
        };

        let attached = self.with_link(|link| {
            if link.shutdown || link.generation != generation {
                return false;
            }
            let (close_tx, close_rx) = oneshot::channel();
            let inner = Arc::clone(&self);
            let reader = tokio::spawn(async move {
                let receiving =
                    AssertUnwindSafe(Arc::clone(&inner).receive_loop(socket, close_rx, generation));
                if receiving.catch_unwind().await.is_err() {
                    inner.transport_failed(
                        generation,
                        GatewayError::Internal("Receive task panicked".into()),
                    );
                }
            });
            link.channel = Some(Channel {
                generation,
                local_addr,
                close_tx,
                reader,
            });
            link.starting = None;
            true
        });

        if !attached {
            #[cfg(feature = "tracing-support")]
            tracing::debug!(
                "Discarding Cannelloni socket {} bound after the connection was stopped",
                local_addr
            );
            return Err(GatewayError::Closed);
        }

        #[cfg(feature = "tracing-support")]
        tracing::info!("Connected to Cannelloni @ {}", local_addr);
        self.log.read().unwrap_or_else(PoisonError::into_inner).log_connected(
            local_addr.to_string(),
            started.elapsed().as_millis() as u64,
        );
        Ok(())
    }

    fn connect_failed(self: &Arc<Self>, generation: u64, err: &GatewayError) {
        self.record_error(err, ErrorContext::Connection);
        if err.is_transient() {
            #[cfg(feature = "tracing-support")]
            tracing::warn!("Unable to connect to Cannelloni @ {}: {}", self.endpoint(), err);
        } else {
            #[cfg(feature = "tracing-support")]
            tracing::error!("Error connecting to Cannelloni @ {}: {}", self.endpoint(), err);
        }

        self.with_link(|link| {
            if link.generation != generation {
                return;
            }
            link.starting = None;
            if !link.shutdown {
                self.schedule_connect_locked(link);
            }
        });
    }

    /// Handle loss of the socket for `generation`.
    ///
    /// Only the first report for the current channel schedules a reconnect;
    /// later reports for the same or an older channel are ignored.
    fn transport_failed(self: &Arc<Self>, generation: u64, err: GatewayError) {
        let current = self.with_link(|link| {
            match &link.channel {
                Some(channel) if channel.generation == generation => {}
                _ => return false,
            }
            link.channel = None;
            if !link.shutdown {
                self.schedule_connect_locked(link);
            }
            true
        });
        if !current {
            return;
        }

        self.record_error(&err, ErrorContext::Receive);
        if err.is_transient() {
            #[cfg(feature = "tracing-support")]
            tracing::warn!(
                "Connection to Cannelloni @ {} closed: {}; will auto-reconnect",
                self.endpoint(),
                err
            );
        } else {
            #[cfg(feature = "tracing-support")]
            tracing::error!(
                "Connection to Cannelloni @ {} failed: {}; will auto-reconnect",
                self.endpoint(),
                err
            );
        }
        self.log
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .log_disconnected(Some(err.to_string()));
    }

    /// Arm the reconnect timer, or return the one already armed.
    fn schedule_connect_locked(self: &Arc<Self>, link: &mut LinkState) -> ConnectFuture {
        self.schedule_connect_after(link, None)
    }

    /// Arm the reconnect timer. The delay starts once `released` has
    /// finished, so the new bind never races the old socket.
    fn schedule_connect_after(
        self: &Arc<Self>,
        link: &mut LinkState,
        released: Option<JoinHandle<()>>,
    ) -> ConnectFuture {
        if let Some(timer) = &link.timer {
            return timer.future.clone();
        }

        let delay = self.config.reconnect_delay;
        link.timer_seq += 1;
        let id = link.timer_seq;
        let attempt = self.counters.reconnects.fetch_add(1, Ordering::Relaxed) + 1;

        #[cfg(feature = "tracing-support")]
        tracing::info!(
            "Scheduling attempt to connect to Cannelloni @ {} in {}s",
            self.endpoint(),
            delay.as_secs()
        );
        self.log
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .log_reconnect_scheduled(attempt, delay.as_millis() as u64);

        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if let Some(reader) = released {
                inner.release_reader(reader).await;
            }
            if !delay.is_zero() {
                time::sleep(delay).await;
            }
            if !inner.timer_fired(id) {
                return Err(GatewayError::Closed);
            }
            inner.start().await
        });
        let abort = handle.abort_handle();
        let future = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(GatewayError::Closed),
                Err(e) => Err(GatewayError::Internal(format!("Reconnect task failed: {}", e))),
            }
        }
        .boxed()
        .shared();

        link.timer = Some(PendingTimer {
            id,
            abort,
            future: future.clone(),
        });
        future
    }

    /// Wait at most `shutdown_timeout` for a stopped receive task, aborting
    /// it when the wait runs out.
    async fn release_reader(&self, reader: JoinHandle<()>) {
        let abort = reader.abort_handle();
        let wait = self.config.shutdown_timeout;
        match time::timeout(wait, reader).await {
            Ok(Ok(())) => {}
            Ok(Err(_e)) => {
                #[cfg(feature = "tracing-support")]
                tracing::warn!("Cannelloni receive task ended abnormally: {}", _e);
            }
            Err(_) => {
                #[cfg(feature = "tracing-support")]
                tracing::warn!(
                    "Error waiting for Cannelloni connection to close gracefully: timed out after {:?}",
                    wait
                );
                abort.abort();
            }
        }
    }

    /// Disarm timer `id`. Returns whether a connect should follow.
    fn timer_fired(&self, id: u64) -> bool {
        self.with_link(|link| {
            match &link.timer {
                Some(timer) if timer.id == id => link.timer = None,
                _ => return false,
            }
            !link.shutdown
        })
    }

    async fn receive_loop(
        self: Arc<Self>,
        socket: UdpSocket,
        mut close_rx: oneshot::Receiver<()>,
        generation: u64,
    ) {
        let mut buf = vec![0u8; self.config.recv_buffer_size];
        let mut pending = BytesMut::new();
        let mut decoder = CannelloniFrameDecoder::new();

        let failure = loop {
            tokio::select! {
                _ = &mut close_rx => break None,
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, peer)) => {
                        self.handle_datagram(&buf[..len], peer, &mut pending, &mut decoder);
                    }
                    Err(e) => break Some(e),
                },
            }
        };
        drop(socket);

        if let Some(e) = failure {
            self.transport_failed(generation, GatewayError::Io(e));
            return;
        }

        #[cfg(feature = "tracing-support")]
        tracing::info!("Closed connection to Cannelloni @ {}", self.endpoint());
    }

    fn handle_datagram(
        &self,
        datagram: &[u8],
        peer: SocketAddr,
        pending: &mut BytesMut,
        decoder: &mut CannelloniFrameDecoder,
    ) {
        self.counters.datagrams.fetch_add(1, Ordering::Relaxed);

        pending.extend_from_slice(datagram);
        let frames = decoder.decode_all(pending);
        *self.decoder_stats.lock().unwrap_or_else(PoisonError::into_inner) = decoder.stats();

        if self.config.log_raw_packets {
            self.log.read().unwrap_or_else(PoisonError::into_inner).log_raw_packet(
                PacketDirection::Receive,
                datagram,
                PacketMetadata::cannelloni(peer.to_string(), frames.len()),
            );
        }
        if frames.is_empty() {
            return;
        }

        self.counters
            .frames
            .fetch_add(frames.len() as u64, Ordering::Relaxed);
        self.data.update(frames.iter().cloned());
        self.dispatch(&frames);
    }

    fn dispatch(&self, frames: &[CanbusFrame]) {
        let now = Instant::now();
        for frame in frames {
            #[cfg(feature = "tracing-support")]
            tracing::debug!("CAN {} <= {}", self.config.bus_name, frame);

            let listener = self
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .route(frame, now);
            let Some(listener) = listener else {
                continue;
            };
            self.counters.deliveries.fetch_add(1, Ordering::Relaxed);
            // a panicking listener only loses its own delivery
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| {
                listener.canbus_frame_received(frame);
            }));
            if let Err(payload) = delivered {
                self.counters.listener_panics.fetch_add(1, Ordering::Relaxed);
                let err = GatewayError::Internal(format!(
                    "Listener for CAN frame {} panicked: {}",
                    frame,
                    panic_message(payload.as_ref())
                ));
                #[cfg(feature = "tracing-support")]
                tracing::error!("CAN bus [{}]: {}", self.config.bus_name, err);
                self.record_error(&err, ErrorContext::Dispatch);
            }
        }
    }

    fn register(&self, sub: CanbusSubscription) {
        #[cfg(feature = "tracing-support")]
        let desc = sub.to_string();

        let replaced = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribe(sub);

        if let Some(_old) = replaced {
            #[cfg(feature = "tracing-support")]
            tracing::warn!(
                "Subscription to CAN bus [{}] {} replaced by new subscription",
                self.config.bus_name,
                _old
            );
        }
        #[cfg(feature = "tracing-support")]
        tracing::info!("Subscribed to CAN bus [{}]: {}", self.config.bus_name, desc);
    }
}

// ============================================================================
// CannelloniConnection
// ============================================================================

/// Cannelloni CAN-over-UDP connection.
///
/// # Example
///
/// ```rust,ignore
/// use cangw::protocols::cannelloni::{CannelloniConfig, CannelloniConnection};
///
/// let conn = CannelloniConnection::new(CannelloniConfig::new("0.0.0.0", 20000));
/// conn.open().await?;
/// conn.subscribe(0x351, false, None, 0, Arc::new(|f: &CanbusFrame| println!("{}", f)))?;
/// ```
pub struct CannelloniConnection {
    inner: Arc<Inner>,
}

impl CannelloniConnection {
    /// Create a closed connection with a fresh cache.
    pub fn new(config: CannelloniConfig) -> Self {
        Self::with_data(config, Arc::new(CanbusData::new()))
    }

    /// Create a closed connection feeding an existing cache.
    pub fn with_data(config: CannelloniConfig, data: Arc<CanbusData>) -> Self {
        let log = LogContext::new(u32::from(config.port))
            .with_config(ChannelLogConfig::default().with_raw_packets(config.log_raw_packets));
        Self {
            inner: Arc::new(Inner {
                config,
                data,
                link: Mutex::new(LinkState::default()),
                subscriptions: Mutex::new(SubscriptionRegistry::new()),
                log: RwLock::new(log),
                counters: Counters::default(),
                last_error: Mutex::new(None),
                decoder_stats: Mutex::new(DecoderStats::default()),
            }),
        }
    }

    /// Human-readable name of this connection type.
    pub fn display_name(&self) -> &'static str {
        "Cannelloni Client"
    }

    /// Connection configuration.
    pub fn config(&self) -> &CannelloniConfig {
        &self.inner.config
    }

    /// Shared frame cache fed by this connection.
    pub fn data(&self) -> Arc<CanbusData> {
        Arc::clone(&self.inner.data)
    }

    /// Current connection state.
    pub fn status(&self) -> ConnectionState {
        self.inner.status()
    }

    /// Local address of the bound socket.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .channel
            .as_ref()
            .map(|c| c.local_addr)
    }

    /// Set the channel log handler.
    pub fn set_log_handler(&self, handler: Arc<dyn ChannelLogHandler>) {
        self.inner
            .log
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set_handler(handler);
    }

    /// Set the channel log configuration.
    pub fn set_log_config(&self, config: ChannelLogConfig) {
        self.inner
            .log
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set_config(config);
    }

    /// Open the connection.
    ///
    /// Joins a bind already in flight; a pending reconnect timer is
    /// cancelled in favour of binding now. Waits at most `shutdown_timeout`.
    pub async fn open(&self) -> Result<()> {
        let starting = self.inner.with_link(|link| {
            if link.channel.is_some() {
                return None;
            }
            link.shutdown = false;
            if link.starting.is_none() {
                if let Some(timer) = link.timer.take() {
                    timer.abort.abort();
                }
            }
            Some(self.inner.start_locked(link))
        });
        let Some(starting) = starting else {
            return Ok(());
        };

        let wait = self.inner.config.shutdown_timeout;
        let cause = match time::timeout(wait, starting).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e,
            Err(_) => GatewayError::Timeout(wait),
        };
        Err(GatewayError::Connection(format!(
            "Failed to open connection to Cannelloni @ {}: {}",
            self.inner.endpoint(),
            cause
        )))
    }

    /// Schedule a connect after the reconnect delay.
    ///
    /// Returns the pending connect, shared with any timer already armed.
    /// Must be called from within a tokio runtime.
    pub fn open_later(&self) -> Result<ConnectFuture> {
        require_runtime()?;
        Ok(self.inner.with_link(|link| {
            link.shutdown = false;
            self.inner.schedule_connect_locked(link)
        }))
    }

    /// Close the connection and stop reconnecting. Never fails.
    ///
    /// Waits at most `shutdown_timeout` for the receive task to finish.
    pub async fn close(&self) -> Result<()> {
        let channel = self.inner.with_link(|link| {
            if link.shutdown && link.is_idle() {
                return None;
            }
            link.shutdown = true;
            Some(link.stop())
        });
        let Some(channel) = channel else {
            return Ok(());
        };

        if let Some((_local_addr, reader)) = channel {
            #[cfg(feature = "tracing-support")]
            tracing::info!("Closing connection to Cannelloni @ {}", _local_addr);

            self.inner.release_reader(reader).await;
            self.inner
                .log
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .log_disconnected(None);
        }
        Ok(())
    }

    /// Drop the current socket and schedule a new connect.
    ///
    /// Does nothing once the connection has been closed.
    pub fn restart(&self) -> Result<()> {
        require_runtime()?;
        self.inner.with_link(|link| {
            if link.shutdown {
                return;
            }
            #[cfg(feature = "tracing-support")]
            tracing::info!("Restarting connection to Cannelloni @ {}", self.inner.endpoint());
            let released = link.stop().map(|(_, reader)| reader);
            self.inner.schedule_connect_after(link, released);
        });
        Ok(())
    }

    /// Apply changed settings by restarting the connection.
    pub fn configuration_changed(&self) -> Result<()> {
        self.restart()
    }

    /// Connection diagnostics.
    pub fn diagnostics(&self) -> Diagnostics {
        let inner = &self.inner;
        let mut diag = Diagnostics::new("cannelloni");
        diag.connection_state = self.status();
        diag.datagrams_received = inner.counters.datagrams.load(Ordering::Relaxed);
        diag.frames_received = inner.counters.frames.load(Ordering::Relaxed);
        diag.error_count = inner.counters.errors.load(Ordering::Relaxed);
        diag.last_error = inner.last_error.lock().unwrap_or_else(PoisonError::into_inner).clone();

        let decoder = *inner.decoder_stats.lock().unwrap_or_else(PoisonError::into_inner);
        let (subscriptions, monitoring) = {
            let subs = inner.subscriptions.lock().unwrap_or_else(PoisonError::into_inner);
            (subs.len(), subs.is_monitoring())
        };
        diag.extra = serde_json::json!({
            "bus_name": inner.config.bus_name,
            "endpoint": inner.endpoint(),
            "local_addr": self.local_addr().map(|a| a.to_string()),
            "reconnects_scheduled": inner.counters.reconnects.load(Ordering::Relaxed),
            "deliveries": inner.counters.deliveries.load(Ordering::Relaxed),
            "listener_panics": inner.counters.listener_panics.load(Ordering::Relaxed),
            "batches": decoder.batches,
            "skipped_headers": decoder.skipped_headers,
            "discarded": decoder.discarded,
            "last_seq": decoder.last_seq,
            "subscriptions": subscriptions,
            "monitoring": monitoring,
            "cached_addresses": inner.data.len(),
            "data_timestamp": inner.data.data_timestamp_millis(),
        });
        diag
    }

    #[cfg(test)]
    fn channel_generation(&self) -> Option<u64> {
        self.inner
            .link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .channel
            .as_ref()
            .map(|c| c.generation)
    }

    #[cfg(test)]
    fn timer_pending(&self) -> bool {
        self.inner.link.lock().unwrap_or_else(PoisonError::into_inner).timer.is_some()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

fn require_runtime() -> Result<()> {
    tokio::runtime::Handle::try_current()
        .map(|_| ())
        .map_err(|_| GatewayError::Internal("No tokio runtime available".into()))
}

impl Drop for CannelloniConnection {
    fn drop(&mut self) {
        let mut link = self.inner.link.lock().unwrap_or_else(PoisonError::into_inner);
        link.shutdown = true;
        if let Some((_, reader)) = link.stop() {
            reader.abort();
        }
    }
}

impl fmt::Display for CannelloniConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CannelloniCanbusConnection@{}:{}",
            self.inner.config.host, self.inner.config.port
        )
    }
}

impl fmt::Debug for CannelloniConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CannelloniConnection")
            .field("config", &self.inner.config)
            .field("status", &self.status())
            .finish()
    }
}

#[async_trait]
impl CanbusConnection for CannelloniConnection {
    fn bus_name(&self) -> &str {
        &self.inner.config.bus_name
    }

    async fn open(&self) -> Result<()> {
        CannelloniConnection::open(self).await
    }

    async fn close(&self) -> Result<()> {
        CannelloniConnection::close(self).await
    }

    fn is_established(&self) -> bool {
        self.status().is_connected()
    }

    fn is_closed(&self) -> bool {
        self.status().is_closed()
    }

    fn subscribe(
        &self,
        address: u32,
        force_extended: bool,
        rate_limit: Option<Duration>,
        data_filter: u64,
        listener: Arc<dyn CanbusFrameListener>,
    ) -> Result<()> {
        self.inner.register(CanbusSubscription::new(
            address,
            force_extended,
            rate_limit,
            data_filter,
            listener,
        ));
        Ok(())
    }

    fn subscribe_multiplexed(
        &self,
        address: u32,
        force_extended: bool,
        rate_limit: Option<Duration>,
        identifier_mask: u64,
        data_filters: Vec<u64>,
        listener: Arc<dyn CanbusFrameListener>,
    ) -> Result<()> {
        let sub = CanbusSubscription::multiplexed(
            address,
            force_extended,
            rate_limit,
            identifier_mask,
            data_filters,
            listener,
        )?;
        self.inner.register(sub);
        Ok(())
    }

    fn unsubscribe(&self, address: u32, _force_extended: bool) -> Result<()> {
        let removed = self
            .inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unsubscribe(address);
        if let Some(_sub) = removed {
            #[cfg(feature = "tracing-support")]
            tracing::info!(
                "Unsubscribed from CAN bus [{}]: {}",
                self.inner.config.bus_name,
                _sub
            );
        }
        Ok(())
    }

    fn monitor(&self, listener: Arc<dyn CanbusFrameListener>) -> Result<()> {
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .monitor(listener);
        #[cfg(feature = "tracing-support")]
        tracing::info!("Monitoring CAN bus [{}]", self.inner.config.bus_name);
        Ok(())
    }

    fn unmonitor(&self) -> Result<()> {
        let was_monitoring = self
            .inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unmonitor();
        if was_monitoring {
            #[cfg(feature = "tracing-support")]
            tracing::info!("Stopped monitoring CAN bus [{}]", self.inner.config.bus_name);
        }
        Ok(())
    }

    fn is_monitoring(&self) -> bool {
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_monitoring()
    }

    async fn verify_connectivity(&self) -> Result<()> {
        if self.status().is_connected() {
            Ok(())
        } else {
            Err(GatewayError::NotConnected)
        }
    }
}

// ============================================================================
// HasMetadata Implementation
// ============================================================================

use crate::core::metadata::{DriverMetadata, HasMetadata, ParameterMetadata, ParameterType};

impl HasMetadata for CannelloniConnection {
    fn metadata() -> DriverMetadata {
        DriverMetadata {
            name: "cannelloni",
            display_name: "Cannelloni Client",
            description: "CAN bus frames tunneled over UDP with the Cannelloni protocol.",
            is_recommended: true,
            example_config: serde_json::json!({
                "host": "0.0.0.0",
                "port": 20000,
                "bus_name": "can0",
                "reconnect_delay_secs": 60,
                "shutdown_timeout_ms": 5000
            }),
            parameters: vec![
                ParameterMetadata::optional(
                    "host",
                    "Host",
                    "Local host name or address to bind",
                    ParameterType::String,
                    serde_json::json!("localhost"),
                ),
                ParameterMetadata::optional(
                    "port",
                    "Port",
                    "Local UDP port to bind",
                    ParameterType::Integer,
                    serde_json::json!(2947),
                ),
                ParameterMetadata::optional(
                    "bus_name",
                    "Bus Name",
                    "Name of the CAN bus served by the connection",
                    ParameterType::String,
                    serde_json::json!("can0"),
                ),
                ParameterMetadata::optional(
                    "reconnect_delay_secs",
                    "Reconnect Delay (s)",
                    "Delay before reconnecting after a failure, 0 to reconnect immediately",
                    ParameterType::Integer,
                    serde_json::json!(60),
                ),
                ParameterMetadata::optional(
                    "shutdown_timeout_ms",
                    "Shutdown Timeout (ms)",
                    "Maximum wait when opening or closing the connection",
                    ParameterType::Integer,
                    serde_json::json!(5000),
                ),
                ParameterMetadata::optional(
                    "recv_buffer_size",
                    "Receive Buffer Size",
                    "Receive buffer size in bytes",
                    ParameterType::Integer,
                    serde_json::json!(65535),
                ),
                ParameterMetadata::optional(
                    "log_raw_packets",
                    "Log Raw Packets",
                    "Forward raw datagrams to the channel log handler",
                    ParameterType::Boolean,
                    serde_json::json!(false),
                ),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::cannelloni::encode_batch;
    use crate::core::logging::{ChannelLogEvent, LogEventType};
    use crate::core::signal::{CanbusSignalReference, Number};
    use tokio::sync::mpsc;

    fn test_config(port: u16) -> CannelloniConfig {
        CannelloniConfig::new("127.0.0.1", port)
            .with_bus_name("test0")
            .with_reconnect_delay(Duration::from_secs(60))
            .with_shutdown_timeout(Duration::from_secs(2))
    }

    async fn send(conn: &CannelloniConnection, seq: u8, frames: &[CanbusFrame]) {
        let target = conn.local_addr().expect("bound");
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let batch = encode_batch(seq, frames).unwrap();
        sender.send_to(&batch, target).await.unwrap();
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
        time::timeout(Duration::from_secs(2), async {
            while !cond() {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }

    #[tokio::test]
    async fn test_open_and_close() {
        let conn = CannelloniConnection::new(test_config(0));
        assert!(conn.is_closed());

        conn.open().await.unwrap();
        assert!(conn.is_established());
        assert!(!conn.is_closed());
        assert!(conn.local_addr().is_some());
        assert!(conn.verify_connectivity().await.is_ok());

        // second open joins the established connection
        conn.open().await.unwrap();

        conn.close().await.unwrap();
        assert!(conn.is_closed());
        assert!(!conn.timer_pending());
        assert!(conn.local_addr().is_none());
        assert!(matches!(
            conn.verify_connectivity().await,
            Err(GatewayError::NotConnected)
        ));

        conn.close().await.unwrap();
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_open_fails_when_port_in_use() {
        let blocker = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = blocker.local_addr().unwrap().port();
        let conn = CannelloniConnection::new(test_config(port));

        let err = conn.open().await.unwrap_err();
        assert!(matches!(err, GatewayError::Connection(_)));
        assert!(err.to_string().contains("Failed to open connection to Cannelloni"));
        assert_eq!(conn.status(), ConnectionState::ConnectionScheduled);
        assert!(conn.timer_pending());

        let diag = conn.diagnostics();
        assert_eq!(diag.error_count, 1);
        assert!(diag.last_error.is_some());
        assert_eq!(diag.extra["reconnects_scheduled"], 1);

        conn.close().await.unwrap();
        assert!(conn.is_closed());
        assert!(!conn.timer_pending());
    }

    #[tokio::test]
    async fn test_double_failure_schedules_one_reconnect() {
        let conn = CannelloniConnection::new(test_config(0));
        conn.open().await.unwrap();
        let generation = conn.channel_generation().unwrap();

        let lost = || GatewayError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        conn.inner.transport_failed(generation, lost());
        conn.inner.transport_failed(generation, lost());

        assert_eq!(conn.status(), ConnectionState::ConnectionScheduled);
        assert_eq!(conn.diagnostics().extra["reconnects_scheduled"], 1);
        assert_eq!(conn.diagnostics().error_count, 1);

        let first = conn.inner.with_link(|link| conn.inner.schedule_connect_locked(link));
        let second = conn.inner.with_link(|link| conn.inner.schedule_connect_locked(link));
        assert_eq!(conn.diagnostics().extra["reconnects_scheduled"], 1);
        drop((first, second));

        conn.close().await.unwrap();
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_zero_delay_reconnects_immediately() {
        let conn = CannelloniConnection::new(test_config(0).with_reconnect_delay(Duration::ZERO));
        conn.open().await.unwrap();
        let generation = conn.channel_generation().unwrap();

        conn.inner.transport_failed(
            generation,
            GatewayError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset)),
        );
        assert!(wait_for(|| conn.is_established()).await);
        assert_ne!(conn.channel_generation(), Some(generation));

        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_later_and_restart() {
        let conn = CannelloniConnection::new(test_config(0).with_reconnect_delay(Duration::ZERO));
        let pending = conn.open_later().unwrap();
        pending.await.unwrap();
        assert!(conn.is_established());

        let before = conn.channel_generation();
        conn.configuration_changed().unwrap();
        assert!(wait_for(|| conn.is_established() && conn.channel_generation() != before).await);

        conn.close().await.unwrap();
        conn.restart().unwrap();
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_datagram_updates_cache_and_subscribers() {
        let conn = CannelloniConnection::new(test_config(0));
        conn.open().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.subscribe(
            0x351,
            false,
            None,
            0,
            Arc::new(move |f: &CanbusFrame| {
                let _ = tx.send(f.clone());
            }),
        )
        .unwrap();

        let frames = [
            CanbusFrame::classic(0x351, vec![0x02, 0x3A, 0x00, 0x64]),
            CanbusFrame::classic(0x355, vec![0x00, 0x50]),
        ];
        send(&conn, 1, &frames).await;

        let received = time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, frames[0]);

        let data = conn.data();
        assert!(wait_for(|| data.len() == 2).await);
        let soc = CanbusSignalReference::new(0x355, 0, 16);
        assert_eq!(data.get_number(&soc), Some(Number::I16(0x50)));
        assert!(data.data_timestamp().is_some());

        let diag = conn.diagnostics();
        assert_eq!(diag.datagrams_received, 1);
        assert_eq!(diag.frames_received, 2);
        assert_eq!(diag.extra["last_seq"], 1);

        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_monitor_receives_all_frames() {
        let conn = CannelloniConnection::new(test_config(0));
        conn.open().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.monitor(Arc::new(move |f: &CanbusFrame| {
            let _ = tx.send(f.address());
        }))
        .unwrap();
        assert!(conn.is_monitoring());

        send(
            &conn,
            0,
            &[CanbusFrame::classic(0x1, vec![1]), CanbusFrame::extended(0x1234, vec![2])],
        )
        .await;

        let mut seen = Vec::new();
        for _ in 0..2 {
            seen.push(
                time::timeout(Duration::from_secs(2), rx.recv())
                    .await
                    .unwrap()
                    .unwrap(),
            );
        }
        assert_eq!(seen, vec![0x1, 0x1234]);

        conn.unmonitor().unwrap();
        assert!(!conn.is_monitoring());
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_panicking_listener_keeps_receiving() {
        let conn = CannelloniConnection::new(test_config(0));
        conn.open().await.unwrap();
        conn.subscribe(
            0x1,
            false,
            None,
            0,
            Arc::new(|f: &CanbusFrame| {
                if f.address() == 0x1 {
                    panic!("listener failed");
                }
            }),
        )
        .unwrap();

        send(&conn, 0, &[CanbusFrame::classic(0x1, vec![1])]).await;
        send(&conn, 1, &[CanbusFrame::classic(0x2, vec![2])]).await;

        let data = conn.data();
        assert!(wait_for(|| data.frame(0x2).is_some()).await);
        assert!(conn.is_established());

        let diag = conn.diagnostics();
        assert_eq!(diag.extra["listener_panics"], 1);
        assert_eq!(diag.error_count, 1);
        assert!(diag.last_error.unwrap().contains("listener failed"));

        conn.close().await.unwrap();
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_close_during_open() {
        let port = std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let conn = CannelloniConnection::new(test_config(port));

        let (opened, closed) = tokio::join!(conn.open(), conn.close());
        let err = opened.unwrap_err();
        assert!(matches!(err, GatewayError::Connection(_)));
        assert!(err.to_string().contains("Connection closed"));
        assert!(closed.is_ok());
        assert!(conn.is_closed());
        assert!(!conn.timer_pending());
        assert!(conn.local_addr().is_none());

        // the abandoned socket is gone
        assert!(std::net::UdpSocket::bind(("127.0.0.1", port)).is_ok());
    }

    #[tokio::test]
    async fn test_restart_rebinds_same_port() {
        let port = std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let conn = CannelloniConnection::new(test_config(port).with_reconnect_delay(Duration::ZERO));
        conn.open().await.unwrap();

        for _ in 0..3 {
            let before = conn.channel_generation();
            conn.restart().unwrap();
            assert!(wait_for(|| conn.is_established() && conn.channel_generation() != before).await);
        }
        assert_eq!(conn.local_addr().map(|a| a.port()), Some(port));
        assert_eq!(conn.diagnostics().error_count, 0);

        conn.close().await.unwrap();
    }

    struct RecordingHandler(mpsc::UnboundedSender<LogEventType>);

    #[async_trait]
    impl ChannelLogHandler for RecordingHandler {
        async fn on_log(&self, _channel_id: u32, event: ChannelLogEvent) {
            let _ = self.0.send(event.kind());
        }
    }

    #[tokio::test]
    async fn test_close_without_socket_logs_nothing() {
        let conn = CannelloniConnection::new(test_config(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.set_log_handler(Arc::new(RecordingHandler(tx)));

        conn.close().await.unwrap();
        time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        conn.open().await.unwrap();
        conn.close().await.unwrap();
        let disconnected = time::timeout(Duration::from_secs(2), async {
            while let Some(kind) = rx.recv().await {
                if kind == LogEventType::Disconnected {
                    return true;
                }
            }
            false
        })
        .await;
        assert!(matches!(disconnected, Ok(true)));
    }

    #[test]
    fn test_subscribe_validation() {
        let conn = CannelloniConnection::new(test_config(0));
        let listener: Arc<dyn CanbusFrameListener> = Arc::new(|_: &CanbusFrame| {});
        assert!(conn
            .subscribe_multiplexed(0x10, false, None, 0, vec![1], Arc::clone(&listener))
            .is_err());
        assert!(conn
            .subscribe_multiplexed(0x10, false, None, 0xFF, vec![0x01], Arc::clone(&listener))
            .is_ok());
        assert!(conn.unsubscribe(0x10, false).is_ok());
        assert!(conn.unsubscribe(0x10, false).is_ok());
    }

    #[test]
    fn test_display_and_metadata() {
        let conn = CannelloniConnection::new(CannelloniConfig::default());
        assert_eq!(conn.to_string(), "CannelloniCanbusConnection@localhost:2947");
        assert_eq!(conn.display_name(), "Cannelloni Client");
        assert_eq!(conn.bus_name(), "can0");

        let meta = CannelloniConnection::metadata();
        assert_eq!(meta.name, "cannelloni");
        assert!(meta.parameters.iter().all(|p| !p.required));
    }

    #[test]
    fn test_open_later_requires_runtime() {
        let conn = CannelloniConnection::new(test_config(0));
        assert!(matches!(conn.open_later(), Err(GatewayError::Internal(_))));
    }
}
