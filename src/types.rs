//! Core data types for the cycler control plane
//!
//! This module contains the fundamental data structures shared by the
//! control and data planes: channel identifiers, measurement frames,
//! step limits, and the fixed-shape telemetry wire record.
//!
//! # Main Types
//!
//! - [`Frame`] / [`Snapshot`] - A map from metric name to the most recent value
//! - [`StepLimit`] - A termination predicate `(metric, threshold)`
//! - [`FrameRecord`] - The fixed little-endian record read from the telemetry
//!   character device
//!
//! # Metric Keys
//!
//! Measurements are keyed by short ASCII names. The canonical keys produced
//! by the real-time core are [`keys::VOLTAGE`], [`keys::CURRENT`],
//! [`keys::TEMPERATURE`] and [`keys::TIMESTAMP`]; the data plane derives
//! [`keys::DVDT`], [`keys::VOLTAGE_FILTERED`], [`keys::DVDT_FIT`] and
//! [`keys::RESISTANCE`] on top of those.

use crate::error::{CyclerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Number of electrochemical test channels driven by the service.
///
/// Channel identifiers are `0..MAX_CHANNELS`; records for every channel
/// exist for the life of the service.
pub const MAX_CHANNELS: usize = 32;

/// Canonical metric key names.
pub mod keys {
    /// Cell terminal voltage in volts.
    pub const VOLTAGE: &str = "voltage";
    /// Channel current in amperes (positive = charge).
    pub const CURRENT: &str = "current";
    /// Cell temperature in degrees Celsius.
    pub const TEMPERATURE: &str = "temperature";
    /// Measurement timestamp in seconds, as stamped by the real-time core.
    pub const TIMESTAMP: &str = "timestamp";
    /// Voltage slope between the two most recent frames, volts per second.
    pub const DVDT: &str = "dvdt";
    /// Exponentially smoothed voltage.
    pub const VOLTAGE_FILTERED: &str = "voltage_filtered";
    /// Voltage slope estimated from a polynomial fit over recent frames.
    pub const DVDT_FIT: &str = "dvdt_fit";
    /// Internal resistance in ohms, derived by the DCIM procedure.
    pub const RESISTANCE: &str = "resistance";
}

/// One record of measurements for one channel at one moment.
pub type Frame = HashMap<String, f64>;

/// An internally consistent copy of a channel's current measurements.
///
/// A snapshot never mixes values from two different updates.
pub type Snapshot = HashMap<String, f64>;

/// Return an error if `channel` is outside `[0, MAX_CHANNELS)`.
pub fn validate_channel(channel: usize) -> Result<()> {
    if channel < MAX_CHANNELS {
        Ok(())
    } else {
        Err(CyclerError::InvalidChannel(channel))
    }
}

/// Look up a metric in a snapshot.
pub fn metric(snapshot: &Snapshot, key: &str) -> Option<f64> {
    snapshot.get(key).copied()
}

/// Direction of a step-limit comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LimitDirection {
    /// Trip when the metric rises to or above the threshold (charge tests).
    #[default]
    Rising,
    /// Trip when the metric falls to or below the threshold (discharge tests).
    Falling,
}

/// A termination predicate over the live measurement table.
///
/// A list of step limits is reached when at least one entry's metric is
/// present in the current snapshot and crosses its threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepLimit {
    /// Metric key to watch, e.g. `"voltage"`.
    pub metric: String,
    /// Threshold value in the metric's unit.
    pub threshold: f64,
    /// Comparison direction; defaults to [`LimitDirection::Rising`].
    #[serde(default)]
    pub direction: LimitDirection,
}

impl StepLimit {
    /// Create a rising-edge limit (`metric >= threshold`).
    pub fn rising(metric: impl Into<String>, threshold: f64) -> Self {
        Self {
            metric: metric.into(),
            threshold,
            direction: LimitDirection::Rising,
        }
    }

    /// Create a falling-edge limit (`metric <= threshold`).
    pub fn falling(metric: impl Into<String>, threshold: f64) -> Self {
        Self {
            metric: metric.into(),
            threshold,
            direction: LimitDirection::Falling,
        }
    }

    /// Whether this limit trips for the given snapshot.
    ///
    /// A missing metric never trips.
    pub fn is_reached(&self, snapshot: &Snapshot) -> bool {
        match metric(snapshot, &self.metric) {
            Some(value) => match self.direction {
                LimitDirection::Rising => value >= self.threshold,
                LimitDirection::Falling => value <= self.threshold,
            },
            None => false,
        }
    }
}

/// Whether any limit in the list trips for the given snapshot.
pub fn limits_reached(limits: &[StepLimit], snapshot: &Snapshot) -> bool {
    limits.iter().any(|limit| limit.is_reached(snapshot))
}

/// Size in bytes of one telemetry wire record.
pub const RECORD_SIZE: usize = 40;

/// Validity flag: the `voltage` field holds a measurement.
pub const FLAG_VOLTAGE: u32 = 1 << 0;
/// Validity flag: the `current` field holds a measurement.
pub const FLAG_CURRENT: u32 = 1 << 1;
/// Validity flag: the `temperature` field holds a measurement.
pub const FLAG_TEMPERATURE: u32 = 1 << 2;
/// Validity flag: the `timestamp` field holds a measurement.
pub const FLAG_TIMESTAMP: u32 = 1 << 3;

/// One fixed-shape telemetry record as written by the real-time core.
///
/// Layout (little-endian): `channel: u32`, `flags: u32`, then `voltage`,
/// `current`, `temperature`, `timestamp` as `f64`. Fields whose flag bit is
/// clear carry no measurement and are ignored on decode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameRecord {
    pub channel: u32,
    pub flags: u32,
    pub voltage: f64,
    pub current: f64,
    pub temperature: f64,
    pub timestamp: f64,
}

impl FrameRecord {
    /// Decode a record from exactly [`RECORD_SIZE`] bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != RECORD_SIZE {
            return Err(CyclerError::Transport(format!(
                "malformed telemetry record: expected {} bytes, got {}",
                RECORD_SIZE,
                bytes.len()
            )));
        }

        let u32_at = |offset: usize| {
            u32::from_le_bytes([
                bytes[offset],
                bytes[offset + 1],
                bytes[offset + 2],
                bytes[offset + 3],
            ])
        };
        let f64_at = |offset: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[offset..offset + 8]);
            f64::from_le_bytes(raw)
        };

        Ok(Self {
            channel: u32_at(0),
            flags: u32_at(4),
            voltage: f64_at(8),
            current: f64_at(16),
            temperature: f64_at(24),
            timestamp: f64_at(32),
        })
    }

    /// Encode this record into its wire form.
    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut out = [0u8; RECORD_SIZE];
        out[0..4].copy_from_slice(&self.channel.to_le_bytes());
        out[4..8].copy_from_slice(&self.flags.to_le_bytes());
        out[8..16].copy_from_slice(&self.voltage.to_le_bytes());
        out[16..24].copy_from_slice(&self.current.to_le_bytes());
        out[24..32].copy_from_slice(&self.temperature.to_le_bytes());
        out[32..40].copy_from_slice(&self.timestamp.to_le_bytes());
        out
    }

    /// Convert the flagged fields into a measurement frame.
    pub fn into_frame(self) -> Frame {
        let mut frame = Frame::new();
        if self.flags & FLAG_VOLTAGE != 0 {
            frame.insert(keys::VOLTAGE.to_string(), self.voltage);
        }
        if self.flags & FLAG_CURRENT != 0 {
            frame.insert(keys::CURRENT.to_string(), self.current);
        }
        if self.flags & FLAG_TEMPERATURE != 0 {
            frame.insert(keys::TEMPERATURE.to_string(), self.temperature);
        }
        if self.flags & FLAG_TIMESTAMP != 0 {
            frame.insert(keys::TIMESTAMP.to_string(), self.timestamp);
        }
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(entries: &[(&str, f64)]) -> Snapshot {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_validate_channel_bounds() {
        assert!(validate_channel(0).is_ok());
        assert!(validate_channel(MAX_CHANNELS - 1).is_ok());
        assert!(validate_channel(MAX_CHANNELS).is_err());
    }

    #[test]
    fn test_rising_limit() {
        let limit = StepLimit::rising(keys::VOLTAGE, 4.2);
        assert!(!limit.is_reached(&snapshot(&[(keys::VOLTAGE, 4.1)])));
        assert!(limit.is_reached(&snapshot(&[(keys::VOLTAGE, 4.2)])));
        assert!(limit.is_reached(&snapshot(&[(keys::VOLTAGE, 4.3)])));
    }

    #[test]
    fn test_falling_limit() {
        let limit = StepLimit::falling(keys::VOLTAGE, 2.8);
        assert!(!limit.is_reached(&snapshot(&[(keys::VOLTAGE, 3.0)])));
        assert!(limit.is_reached(&snapshot(&[(keys::VOLTAGE, 2.8)])));
    }

    #[test]
    fn test_missing_metric_never_trips() {
        let limit = StepLimit::rising(keys::TEMPERATURE, 45.0);
        assert!(!limit.is_reached(&snapshot(&[(keys::VOLTAGE, 4.5)])));
        assert!(!limits_reached(&[limit], &Snapshot::new()));
    }

    #[test]
    fn test_record_roundtrip_flags() {
        let record = FrameRecord {
            channel: 7,
            flags: FLAG_VOLTAGE | FLAG_TIMESTAMP,
            voltage: 3.7,
            current: 99.0,
            temperature: 99.0,
            timestamp: 12.5,
        };
        let decoded = FrameRecord::decode(&record.encode()).unwrap();
        assert_eq!(decoded, record);

        let frame = decoded.into_frame();
        assert_eq!(frame.get(keys::VOLTAGE), Some(&3.7));
        assert_eq!(frame.get(keys::TIMESTAMP), Some(&12.5));
        // Unflagged fields carry no measurement.
        assert!(!frame.contains_key(keys::CURRENT));
        assert!(!frame.contains_key(keys::TEMPERATURE));
    }

    #[test]
    fn test_record_decode_rejects_short_input() {
        assert!(FrameRecord::decode(&[0u8; RECORD_SIZE - 1]).is_err());
    }

    #[test]
    fn test_step_limit_serde_defaults_direction() {
        let limit: StepLimit =
            serde_json::from_str(r#"{"metric": "voltage", "threshold": 4.2}"#).unwrap();
        assert_eq!(limit.direction, LimitDirection::Rising);
    }
}
