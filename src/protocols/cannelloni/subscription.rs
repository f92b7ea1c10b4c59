//! Subscription registry and frame dispatch.
//!
//! The registry decides which listener receives a frame. It is kept behind
//! the connection's lock and returns the listeners to call, so listeners run
//! without the lock held and may themselves subscribe or unsubscribe.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::error::{GatewayError, Result};
use crate::core::frame::{CanbusFrame, CAN_SFF_MASK};
use crate::core::traits::{CanbusFrameListener, NO_DATA_FILTER};

/// Change detection applied to frames at a subscribed address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionKind {
    /// Fire when bits selected by the mask change.
    Filter {
        /// Mask over the first eight payload bytes (big-endian).
        data_filter: u64,
    },

    /// Fire per sub-identifier embedded in the payload.
    Multiplexed {
        /// Mask selecting the sub-identifier bits.
        identifier_mask: u64,
        /// One entry per recognized sub-identifier: identifier bits plus
        /// the change mask in the remaining bits.
        data_filters: Vec<u64>,
    },
}

/// A registered interest in frames at one address.
#[derive(Clone)]
pub struct CanbusSubscription {
    address: u32,
    force_extended: bool,
    rate_limit: Option<Duration>,
    kind: SubscriptionKind,
    listener: Arc<dyn CanbusFrameListener>,
}

impl CanbusSubscription {
    /// Create a single-filter subscription.
    pub fn new(
        address: u32,
        force_extended: bool,
        rate_limit: Option<Duration>,
        data_filter: u64,
        listener: Arc<dyn CanbusFrameListener>,
    ) -> Self {
        Self {
            address,
            force_extended,
            rate_limit: rate_limit.filter(|d| !d.is_zero()),
            kind: SubscriptionKind::Filter { data_filter },
            listener,
        }
    }

    /// Create a multiplexed subscription.
    pub fn multiplexed(
        address: u32,
        force_extended: bool,
        rate_limit: Option<Duration>,
        identifier_mask: u64,
        data_filters: Vec<u64>,
        listener: Arc<dyn CanbusFrameListener>,
    ) -> Result<Self> {
        if identifier_mask == 0 {
            return Err(GatewayError::Config(
                "Multiplexed subscription requires a non-zero identifier mask".into(),
            ));
        }
        if data_filters.is_empty() {
            return Err(GatewayError::Config(
                "Multiplexed subscription requires at least one data filter".into(),
            ));
        }
        Ok(Self {
            address,
            force_extended,
            rate_limit: rate_limit.filter(|d| !d.is_zero()),
            kind: SubscriptionKind::Multiplexed {
                identifier_mask,
                data_filters,
            },
            listener,
        })
    }

    /// Subscribed address.
    pub fn address(&self) -> u32 {
        self.address
    }

    /// Whether extended-format frames are expected.
    pub fn is_extended(&self) -> bool {
        self.force_extended || self.address > CAN_SFF_MASK
    }

    /// Minimum interval between deliveries.
    pub fn rate_limit(&self) -> Option<Duration> {
        self.rate_limit
    }

    /// Change detection in use.
    pub fn kind(&self) -> &SubscriptionKind {
        &self.kind
    }

    /// Whether any change filter is configured.
    pub fn has_filter(&self) -> bool {
        !matches!(
            self.kind,
            SubscriptionKind::Filter {
                data_filter: NO_DATA_FILTER
            }
        )
    }

    /// Whether `frame` belongs to this subscription.
    pub fn matches(&self, frame: &CanbusFrame) -> bool {
        frame.address() == self.address && frame.is_extended() == self.is_extended()
    }
}

impl fmt::Debug for CanbusSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CanbusSubscription")
            .field("address", &format_args!("0x{:X}", self.address))
            .field("extended", &self.is_extended())
            .field("rate_limit", &self.rate_limit)
            .field("kind", &self.kind)
            .finish()
    }
}

impl fmt::Display for CanbusSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CanbusSubscription{{0x{:X}", self.address)?;
        if let Some(limit) = self.rate_limit {
            write!(f, ", limit={}ms", limit.as_millis())?;
        }
        match &self.kind {
            SubscriptionKind::Filter { data_filter } if *data_filter != NO_DATA_FILTER => {
                write!(f, ", filter=0x{:016X}", data_filter)?
            }
            SubscriptionKind::Filter { .. } => {}
            SubscriptionKind::Multiplexed {
                identifier_mask,
                data_filters,
            } => write!(
                f,
                ", mux=0x{:016X}, filters={}",
                identifier_mask,
                data_filters.len()
            )?,
        }
        f.write_str("}")
    }
}

/// Delivery history of one subscription.
struct SubscriptionState {
    sub: CanbusSubscription,
    last_delivery: Option<Instant>,
    last_word: Option<u64>,
    last_mux_words: HashMap<u64, u64>,
}

impl SubscriptionState {
    fn new(sub: CanbusSubscription) -> Self {
        Self {
            sub,
            last_delivery: None,
            last_word: None,
            last_mux_words: HashMap::new(),
        }
    }

    /// Decide whether to deliver `frame`, recording the delivery if so.
    fn accept(&mut self, frame: &CanbusFrame, now: Instant) -> bool {
        if !self.sub.matches(frame) {
            return false;
        }
        let word = frame.data_word();

        let mux = match &self.sub.kind {
            SubscriptionKind::Filter { data_filter } => {
                if *data_filter != NO_DATA_FILTER {
                    if let Some(last) = self.last_word {
                        if (last ^ word) & data_filter == 0 {
                            return false;
                        }
                    }
                }
                None
            }
            SubscriptionKind::Multiplexed {
                identifier_mask,
                data_filters,
            } => {
                let mux = word & identifier_mask;
                let Some(filter) = data_filters.iter().find(|f| *f & identifier_mask == mux) else {
                    return false;
                };
                let change_mask = filter & !identifier_mask;
                if change_mask != 0 {
                    if let Some(last) = self.last_mux_words.get(&mux) {
                        if (last ^ word) & change_mask == 0 {
                            return false;
                        }
                    }
                }
                Some(mux)
            }
        };

        if let (Some(limit), Some(last)) = (self.sub.rate_limit, self.last_delivery) {
            if now.saturating_duration_since(last) < limit {
                return false;
            }
        }

        self.last_delivery = Some(now);
        match mux {
            Some(mux) => {
                self.last_mux_words.insert(mux, word);
            }
            None => self.last_word = Some(word),
        }
        true
    }
}

/// Subscriptions of one connection, keyed by address.
#[derive(Default)]
pub struct SubscriptionRegistry {
    subscriptions: HashMap<u32, SubscriptionState>,
    monitor: Option<Arc<dyn CanbusFrameListener>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription, returning the one it replaced.
    pub fn subscribe(&mut self, sub: CanbusSubscription) -> Option<CanbusSubscription> {
        self.subscriptions
            .insert(sub.address, SubscriptionState::new(sub))
            .map(|old| old.sub)
    }

    /// Remove the subscription at `address`.
    pub fn unsubscribe(&mut self, address: u32) -> Option<CanbusSubscription> {
        self.subscriptions.remove(&address).map(|old| old.sub)
    }

    /// Enter monitor mode.
    pub fn monitor(&mut self, listener: Arc<dyn CanbusFrameListener>) {
        self.monitor = Some(listener);
    }

    /// Leave monitor mode.
    pub fn unmonitor(&mut self) -> bool {
        self.monitor.take().is_some()
    }

    /// Whether monitor mode is active.
    pub fn is_monitoring(&self) -> bool {
        self.monitor.is_some()
    }

    /// Subscription at `address`.
    pub fn get(&self, address: u32) -> Option<&CanbusSubscription> {
        self.subscriptions.get(&address).map(|s| &s.sub)
    }

    /// Number of subscriptions.
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Whether there are no subscriptions.
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Listener that should receive `frame`, if any.
    ///
    /// In monitor mode every frame goes to the monitor and subscription
    /// history is left untouched.
    pub fn route(
        &mut self,
        frame: &CanbusFrame,
        now: Instant,
    ) -> Option<Arc<dyn CanbusFrameListener>> {
        if let Some(monitor) = &self.monitor {
            return Some(Arc::clone(monitor));
        }
        let state = self.subscriptions.get_mut(&frame.address())?;
        if state.accept(frame, now) {
            Some(Arc::clone(&state.sub.listener))
        } else {
            None
        }
    }
}
