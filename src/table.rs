//! Per-channel measurement table
//!
//! The table is the data-plane hub: the ingest loop merges incoming frames
//! into it, analysis tasks write derived metrics back, and control-plane
//! callbacks read consistent snapshots out of it.
//!
//! # Locking
//!
//! Each channel record is guarded by its own reader-writer lock, and the
//! subscription flag is a separate atomic so the ingest hot path can gate
//! callback scheduling without touching the record lock. A snapshot is a
//! clone taken under the read lock, so it never mixes keys from two
//! different updates.

use crate::error::Result;
use crate::types::{keys, validate_channel, Frame, Snapshot, MAX_CHANNELS};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

struct ChannelSlot {
    record: RwLock<HashMap<String, f64>>,
    subscribed: AtomicBool,
}

impl ChannelSlot {
    fn new() -> Self {
        Self {
            record: RwLock::new(HashMap::new()),
            subscribed: AtomicBool::new(false),
        }
    }
}

/// Keyed measurement store covering every channel for the life of the service.
///
/// Records are allocated up front for all [`MAX_CHANNELS`] channels; they are
/// never created on first use and never destroyed before shutdown.
/// Unsubscribed channels still receive updates, so resuming a subscription
/// yields fresh data.
pub struct ChannelTable {
    slots: Vec<ChannelSlot>,
}

impl Default for ChannelTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelTable {
    /// Create a table with a record for every channel.
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_CHANNELS).map(|_| ChannelSlot::new()).collect(),
        }
    }

    fn slot(&self, channel: usize) -> Result<&ChannelSlot> {
        validate_channel(channel)?;
        Ok(&self.slots[channel])
    }

    /// Enable callback evaluation for data arriving on `channel`.
    pub fn subscribe(&self, channel: usize) -> Result<()> {
        self.slot(channel)?.subscribed.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Disable callback evaluation for `channel`. Table updates continue.
    pub fn unsubscribe(&self, channel: usize) -> Result<()> {
        self.slot(channel)?
            .subscribed
            .store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Whether data arriving on `channel` triggers callback evaluation.
    pub fn is_subscribed(&self, channel: usize) -> Result<bool> {
        Ok(self.slot(channel)?.subscribed.load(Ordering::SeqCst))
    }

    /// Merge a frame into the channel record and recompute derived metrics.
    ///
    /// After the base merge, `dvdt` is set to `(v - v_prev) / (t - t_prev)`
    /// when the frame carries both `voltage` and `timestamp` and prior values
    /// exist; otherwise `dvdt` is left unchanged. Returns `true` if any entry
    /// changed.
    ///
    /// Applying the same frame twice is idempotent only up to `dvdt`, which
    /// shifts because the prior values shift.
    pub fn update_from(&self, channel: usize, frame: &Frame) -> Result<bool> {
        let slot = self.slot(channel)?;
        let mut record = slot
            .record
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let prev_voltage = record.get(keys::VOLTAGE).copied();
        let prev_timestamp = record.get(keys::TIMESTAMP).copied();

        let mut changed = false;
        for (key, value) in frame {
            if record.get(key) != Some(value) {
                record.insert(key.clone(), *value);
                changed = true;
            }
        }

        if let (Some(v), Some(t), Some(v_prev), Some(t_prev)) = (
            frame.get(keys::VOLTAGE).copied(),
            frame.get(keys::TIMESTAMP).copied(),
            prev_voltage,
            prev_timestamp,
        ) {
            let dt = t - t_prev;
            if dt != 0.0 {
                let dvdt = (v - v_prev) / dt;
                if record.get(keys::DVDT) != Some(&dvdt) {
                    record.insert(keys::DVDT.to_string(), dvdt);
                    changed = true;
                }
            } else {
                tracing::trace!(channel, "repeated timestamp, dvdt unchanged");
            }
        }

        Ok(changed)
    }

    /// Write a single derived metric without touching `dvdt`.
    ///
    /// Used by the analysis tasks to publish filter and fit outputs.
    pub fn insert(&self, channel: usize, key: &str, value: f64) -> Result<bool> {
        let slot = self.slot(channel)?;
        let mut record = slot
            .record
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let changed = record.get(key) != Some(&value);
        if changed {
            record.insert(key.to_string(), value);
        }
        Ok(changed)
    }

    /// An immutable copy of the channel's current measurements.
    pub fn snapshot(&self, channel: usize) -> Result<Snapshot> {
        let slot = self.slot(channel)?;
        let record = slot.record.read().unwrap_or_else(PoisonError::into_inner);
        Ok(record.clone())
    }

    fn value(&self, channel: usize, key: &str) -> Result<f64> {
        let slot = self.slot(channel)?;
        let record = slot.record.read().unwrap_or_else(PoisonError::into_inner);
        Ok(record.get(key).copied().unwrap_or(0.0))
    }

    /// Latest voltage, or `0.0` when no measurement has arrived yet.
    pub fn voltage(&self, channel: usize) -> Result<f64> {
        self.value(channel, keys::VOLTAGE)
    }

    /// Latest current, or `0.0` when no measurement has arrived yet.
    pub fn current(&self, channel: usize) -> Result<f64> {
        self.value(channel, keys::CURRENT)
    }

    /// Latest voltage slope, or `0.0` when it has not been derived yet.
    pub fn dvdt(&self, channel: usize) -> Result<f64> {
        self.value(channel, keys::DVDT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(entries: &[(&str, f64)]) -> Frame {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_update_and_snapshot() {
        let table = ChannelTable::new();
        let changed = table
            .update_from(3, &frame(&[(keys::VOLTAGE, 3.6), (keys::CURRENT, 1.5)]))
            .unwrap();
        assert!(changed);

        let snap = table.snapshot(3).unwrap();
        assert_eq!(snap.get(keys::VOLTAGE), Some(&3.6));
        assert_eq!(snap.get(keys::CURRENT), Some(&1.5));
    }

    #[test]
    fn test_unchanged_frame_reports_no_change() {
        let table = ChannelTable::new();
        let f = frame(&[(keys::VOLTAGE, 3.6)]);
        assert!(table.update_from(0, &f).unwrap());
        assert!(!table.update_from(0, &f).unwrap());
    }

    #[test]
    fn test_dvdt_derivation() {
        let table = ChannelTable::new();
        table
            .update_from(0, &frame(&[(keys::VOLTAGE, 3.0), (keys::TIMESTAMP, 10.0)]))
            .unwrap();
        // No prior values on the first frame.
        assert_eq!(table.dvdt(0).unwrap(), 0.0);

        table
            .update_from(0, &frame(&[(keys::VOLTAGE, 3.2), (keys::TIMESTAMP, 12.0)]))
            .unwrap();
        let dvdt = table.dvdt(0).unwrap();
        assert!((dvdt - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_dvdt_unchanged_without_timestamp() {
        let table = ChannelTable::new();
        table
            .update_from(0, &frame(&[(keys::VOLTAGE, 3.0), (keys::TIMESTAMP, 1.0)]))
            .unwrap();
        table
            .update_from(0, &frame(&[(keys::VOLTAGE, 3.5), (keys::TIMESTAMP, 2.0)]))
            .unwrap();
        let before = table.dvdt(0).unwrap();

        // Voltage-only frame: base merge happens, dvdt stays.
        table.update_from(0, &frame(&[(keys::VOLTAGE, 4.0)])).unwrap();
        assert_eq!(table.dvdt(0).unwrap(), before);
        assert_eq!(table.voltage(0).unwrap(), 4.0);
    }

    #[test]
    fn test_subscribe_roundtrip() {
        let table = ChannelTable::new();
        assert!(!table.is_subscribed(5).unwrap());
        table.subscribe(5).unwrap();
        assert!(table.is_subscribed(5).unwrap());
        table.unsubscribe(5).unwrap();
        assert!(!table.is_subscribed(5).unwrap());
    }

    #[test]
    fn test_updates_continue_while_unsubscribed() {
        let table = ChannelTable::new();
        table
            .update_from(2, &frame(&[(keys::VOLTAGE, 3.9)]))
            .unwrap();
        assert_eq!(table.voltage(2).unwrap(), 3.9);
    }

    #[test]
    fn test_invalid_channel_rejected() {
        let table = ChannelTable::new();
        assert!(table.snapshot(MAX_CHANNELS).is_err());
        assert!(table.subscribe(MAX_CHANNELS).is_err());
        assert!(table.update_from(MAX_CHANNELS, &Frame::new()).is_err());
    }

    #[test]
    fn test_snapshots_never_tear() {
        use std::sync::Arc;

        let table = Arc::new(ChannelTable::new());
        let writer_table = Arc::clone(&table);

        // Writer keeps voltage == timestamp; a torn snapshot would mix
        // values from two different updates and break the equality.
        let writer = std::thread::spawn(move || {
            for i in 0..500 {
                let value = i as f64;
                writer_table
                    .update_from(
                        0,
                        &frame(&[(keys::VOLTAGE, value), (keys::TIMESTAMP, value)]),
                    )
                    .unwrap();
            }
        });

        for _ in 0..500 {
            let snap = table.snapshot(0).unwrap();
            if let (Some(v), Some(t)) = (snap.get(keys::VOLTAGE), snap.get(keys::TIMESTAMP)) {
                assert_eq!(v, t);
            }
        }
        writer.join().unwrap();
    }

    #[test]
    fn test_accessors_return_sentinel_when_absent() {
        let table = ChannelTable::new();
        assert_eq!(table.voltage(0).unwrap(), 0.0);
        assert_eq!(table.current(0).unwrap(), 0.0);
        assert_eq!(table.dvdt(0).unwrap(), 0.0);
    }
}
