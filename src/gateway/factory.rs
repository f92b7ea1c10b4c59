//! Connection factory.
//!
//! Creates a [`CannelloniConnection`] from configuration and wires the
//! configured signals to it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::core::error::Result;
use crate::core::signal::{CanbusSignalReference, Number};
use crate::core::traits::{CanbusConnection, CanbusFrameListener, NO_DATA_FILTER};
use crate::protocols::cannelloni::CannelloniConnection;
use crate::store::CanbusData;

use super::config::GatewayConfig;

/// A configured signal with its address resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSignal {
    pub name: String,
    pub reference: CanbusSignalReference,
    pub force_extended: bool,
    pub rate_limit: Option<Duration>,
    pub data_filter: u64,
}

/// Create a closed connection from configuration.
pub fn create_connection(config: &GatewayConfig) -> Result<CannelloniConnection> {
    let conn_config = config.connection.to_config();
    conn_config.validate()?;
    Ok(CannelloniConnection::new(conn_config))
}

/// Resolve every configured signal.
pub fn resolve_signals(config: &GatewayConfig) -> Result<Vec<ResolvedSignal>> {
    // Pre-allocate
    let mut signals = Vec::with_capacity(config.signals.len());
    for def in &config.signals {
        signals.push(ResolvedSignal {
            name: def.name.clone(),
            reference: def.address.resolve()?,
            force_extended: def.force_extended,
            rate_limit: def.rate_limit(),
            data_filter: def.data_filter,
        });
    }
    Ok(signals)
}

/// Subscribe once per address used by `signals`.
///
/// Signals sharing an address share one subscription: the data filters are
/// combined (any unfiltered signal makes the subscription unfiltered), the
/// shortest rate limit applies and extended format is forced if any signal
/// asks for it. Returns the number of subscriptions made.
pub fn subscribe_signals(
    conn: &dyn CanbusConnection,
    signals: &[ResolvedSignal],
    listener: Arc<dyn CanbusFrameListener>,
) -> Result<usize> {
    struct Merged {
        force_extended: bool,
        rate_limit: Option<Duration>,
        data_filter: u64,
    }

    let mut by_address: BTreeMap<u32, Merged> = BTreeMap::new();
    for signal in signals {
        let address = signal.reference.address;
        match by_address.get_mut(&address) {
            None => {
                by_address.insert(
                    address,
                    Merged {
                        force_extended: signal.force_extended,
                        rate_limit: signal.rate_limit,
                        data_filter: signal.data_filter,
                    },
                );
            }
            Some(merged) => {
                merged.force_extended |= signal.force_extended;
                merged.rate_limit = match (merged.rate_limit, signal.rate_limit) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    _ => None,
                };
                merged.data_filter =
                    if merged.data_filter == NO_DATA_FILTER || signal.data_filter == NO_DATA_FILTER {
                        NO_DATA_FILTER
                    } else {
                        merged.data_filter | signal.data_filter
                    };
            }
        }
    }

    for (address, merged) in &by_address {
        conn.subscribe(
            *address,
            merged.force_extended,
            merged.rate_limit,
            merged.data_filter,
            Arc::clone(&listener),
        )?;
    }
    Ok(by_address.len())
}

/// Extract the current value of every signal from the cache.
pub fn sample_signals<'a>(
    data: &CanbusData,
    signals: &'a [ResolvedSignal],
) -> Vec<(&'a str, Option<Number>)> {
    signals
        .iter()
        .map(|s| (s.name.as_str(), data.get_number(&s.reference)))
        .collect()
}
