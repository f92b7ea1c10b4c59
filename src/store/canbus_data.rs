//! Live cache of the latest frame per bus address.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};

use crate::codec::byte_order::{extract_bytes, extract_number};
use crate::core::frame::CanbusFrame;
use crate::core::signal::{CanbusSignalReference, Number};

#[derive(Debug, Clone, Default)]
struct CacheState {
    frames: HashMap<u32, CanbusFrame>,
    timestamp: Option<DateTime<Utc>>,
}

/// Thread-safe cache of the most recent frame seen at each address.
///
/// Frames and the data timestamp change together under one write lock, so
/// readers never observe a partially applied batch. Extraction takes a read
/// lock and may run in parallel with other readers.
///
/// # Example
///
/// ```rust,ignore
/// use cangw::store::CanbusData;
///
/// let data = CanbusData::new();
/// data.update([frame]);
/// let soc = data.get_number(&CanbusSignalReference::new(0x355, 0, 16));
/// ```
#[derive(Debug, Default)]
pub struct CanbusData {
    state: RwLock<CacheState>,
}

/// Write access to the cache for the duration of one update batch.
pub struct MutableCanbusData<'a> {
    frames: &'a mut HashMap<u32, CanbusFrame>,
    changed: bool,
}

impl MutableCanbusData<'_> {
    /// Store a frame, replacing any earlier frame at its address.
    pub fn save_frame(&mut self, frame: CanbusFrame) {
        let address = frame.address();
        if self.frames.get(&address) != Some(&frame) {
            self.changed = true;
        }
        self.frames.insert(address, frame);
    }

    /// Store each frame in order.
    pub fn save_data<I>(&mut self, frames: I)
    where
        I: IntoIterator<Item = CanbusFrame>,
    {
        for frame in frames {
            self.save_frame(frame);
        }
    }

    /// Remove the frame at `address`.
    pub fn remove(&mut self, address: u32) -> Option<CanbusFrame> {
        let removed = self.frames.remove(&address);
        if removed.is_some() {
            self.changed = true;
        }
        removed
    }

    /// Remove every frame.
    pub fn clear(&mut self) {
        if !self.frames.is_empty() {
            self.changed = true;
        }
        self.frames.clear();
    }

    /// Whether this batch has modified the cache so far.
    pub fn has_changes(&self) -> bool {
        self.changed
    }

    /// Frame currently stored at `address`.
    pub fn frame(&self, address: u32) -> Option<&CanbusFrame> {
        self.frames.get(&address)
    }
}

impl CanbusData {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a batch of changes atomically.
    ///
    /// The action runs while the write lock is held. The data timestamp is
    /// set to the current time only when the action returns `true`.
    pub fn perform_updates<F>(&self, action: F) -> &Self
    where
        F: FnOnce(&mut MutableCanbusData<'_>) -> bool,
    {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let CacheState { frames, timestamp } = &mut *state;
        let mut m = MutableCanbusData {
            frames,
            changed: false,
        };
        if action(&mut m) {
            *timestamp = Some(Utc::now());
        }
        self
    }

    /// Save one decoded batch, stamping it only if something changed.
    ///
    /// Returns whether the timestamp advanced.
    pub fn update<I>(&self, frames: I) -> bool
    where
        I: IntoIterator<Item = CanbusFrame>,
    {
        let mut stamped = false;
        self.perform_updates(|m| {
            m.save_data(frames);
            stamped = m.has_changes();
            stamped
        });
        stamped
    }

    /// Deep point-in-time copy.
    pub fn copy(&self) -> CanbusData {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner).clone();
        CanbusData {
            state: RwLock::new(state),
        }
    }

    /// Time of the most recent stamped batch.
    pub fn data_timestamp(&self) -> Option<DateTime<Utc>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner).timestamp
    }

    /// Time of the most recent stamped batch in epoch milliseconds.
    pub fn data_timestamp_millis(&self) -> Option<i64> {
        self.data_timestamp().map(|t| t.timestamp_millis())
    }

    /// Latest frame at `address`.
    pub fn frame(&self, address: u32) -> Option<CanbusFrame> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .frames
            .get(&address)
            .cloned()
    }

    /// Extract a numeric signal from the latest frame at its address.
    ///
    /// Returns `None` if no frame has been seen at the address yet, if the
    /// frame is a remote request, or if the bit range does not fit.
    pub fn get_number(&self, signal: &CanbusSignalReference) -> Option<Number> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let frame = state.frames.get(&signal.address)?;
        if frame.is_remote() {
            return None;
        }
        extract_number(frame.data(), signal)
    }

    /// Extract the raw bytes of a signal from the latest frame at its address.
    pub fn get_bytes(&self, signal: &CanbusSignalReference) -> Option<Vec<u8>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let frame = state.frames.get(&signal.address)?;
        if frame.is_remote() {
            return None;
        }
        extract_bytes(frame.data(), signal)
    }

    /// Addresses with a cached frame, sorted.
    pub fn addresses(&self) -> Vec<u32> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let mut addresses: Vec<u32> = state.frames.keys().copied().collect();
        addresses.sort_unstable();
        addresses
    }

    /// Number of cached addresses.
    pub fn len(&self) -> usize {
        self.state.read().unwrap_or_else(PoisonError::into_inner).frames.len()
    }

    /// Whether no frame has been cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every frame and the timestamp.
    pub fn clear(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.frames.clear();
        state.timestamp = None;
    }
}

impl Clone for CanbusData {
    fn clone(&self) -> Self {
        self.copy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::signal::{BitDataType, ByteOrdering};
    use std::sync::Arc;

    #[test]
    fn test_missing_address_is_none() {
        let data = CanbusData::new();
        assert!(data.get_number(&CanbusSignalReference::new(0x1, 0, 8)).is_none());
        assert!(data.get_bytes(&CanbusSignalReference::new(0x1, 0, 8)).is_none());
        assert!(data.data_timestamp().is_none());
    }

    #[test]
    fn test_update_overwrites_by_address() {
        let data = CanbusData::new();
        assert!(data.update([CanbusFrame::classic(0x355, vec![0x00, 0x50])]));
        assert!(data.update([CanbusFrame::classic(0x355, vec![0x00, 0x51])]));
        assert_eq!(data.len(), 1);
        let soc = CanbusSignalReference::new(0x355, 0, 16).with_data_type(BitDataType::UInt16);
        assert_eq!(data.get_number(&soc), Some(Number::I16(0x51)));
    }

    #[test]
    fn test_unchanged_batch_keeps_timestamp() {
        let data = CanbusData::new();
        let frame = CanbusFrame::classic(0x10, vec![1]);
        assert!(data.update([frame.clone()]));
        let stamp = data.data_timestamp();
        assert!(stamp.is_some());
        assert!(!data.update([frame]));
        assert_eq!(data.data_timestamp(), stamp);
    }

    #[test]
    fn test_perform_updates_predicate() {
        let data = CanbusData::new();
        data.perform_updates(|m| {
            m.save_frame(CanbusFrame::classic(0x1, vec![1]));
            false
        });
        assert_eq!(data.len(), 1);
        assert!(data.data_timestamp().is_none());

        data.perform_updates(|m| {
            assert!(m.frame(0x1).is_some());
            m.remove(0x1);
            true
        });
        assert!(data.is_empty());
        assert!(data.data_timestamp_millis().is_some());
    }

    #[test]
    fn test_copy_is_independent() {
        let data = CanbusData::new();
        data.update([CanbusFrame::classic(0x1, vec![1])]);
        let snapshot = data.copy();
        data.update([CanbusFrame::classic(0x2, vec![2])]);
        assert_eq!(snapshot.addresses(), vec![0x1]);
        assert_eq!(data.addresses(), vec![0x1, 0x2]);
        assert!(snapshot.data_timestamp().is_some());
    }

    #[test]
    fn test_remote_frame_has_no_signal() {
        let data = CanbusData::new();
        data.update([CanbusFrame::remote(0x7DF, 8)]);
        assert!(data.frame(0x7DF).is_some());
        assert!(data.get_number(&CanbusSignalReference::new(0x7DF, 0, 8)).is_none());
    }

    #[test]
    fn test_get_bytes_little_endian() {
        let data = CanbusData::new();
        data.update([CanbusFrame::classic(0x356, vec![0x10, 0x27, 0x64, 0x00])]);
        let sig = CanbusSignalReference::new(0x356, 0, 16).with_ordering(ByteOrdering::LittleEndian);
        assert_eq!(data.get_bytes(&sig), Some(vec![0x10, 0x27]));
        assert_eq!(
            data.get_number(&sig.with_data_type(BitDataType::UInt16)),
            Some(Number::I16(10_000))
        );
    }

    #[test]
    fn test_concurrent_readers() {
        let data = Arc::new(CanbusData::new());
        data.update([CanbusFrame::classic(0x1, vec![0, 42])]);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let data = Arc::clone(&data);
                std::thread::spawn(move || {
                    let sig = CanbusSignalReference::new(0x1, 0, 16);
                    for _ in 0..100 {
                        assert_eq!(data.get_number(&sig), Some(Number::I16(42)));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_cache_usable_after_panicking_update() {
        let data = CanbusData::new();
        data.update([CanbusFrame::classic(0x1, vec![0, 42])]);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            data.perform_updates(|_| panic!("update failed"));
        }));
        assert!(result.is_err());

        let sig = CanbusSignalReference::new(0x1, 0, 16);
        assert_eq!(data.get_number(&sig), Some(Number::I16(42)));
        assert!(data.update([CanbusFrame::classic(0x2, vec![7])]));
        assert_eq!(data.addresses(), vec![0x1, 0x2]);
    }
}
