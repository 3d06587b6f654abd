//! Hardware driver interface for channel control
//!
//! This module provides a common trait for the low-level channel driver
//! running on the companion real-time core, enabling both real hardware
//! drivers and a dummy implementation for host testing.
//!
//! All four control primitives are synchronous and side-effectful. They
//! are safe to invoke concurrently from distinct worker threads as long
//! as the calls target distinct channels; the orchestrator keeps at most
//! one command in flight per channel by gating each follow-up command on
//! a data-plane callback.

use crate::error::{CyclerError, Result};
use crate::types::validate_channel;
use std::sync::{Mutex, PoisonError};

/// Default charge/discharge current magnitude limit for the dummy driver, in amperes.
pub const DEFAULT_MAX_CURRENT_A: f64 = 10.0;

/// Default voltage limit for the dummy driver, in volts.
pub const DEFAULT_MAX_VOLTAGE_V: f64 = 5.0;

/// Unified interface for channel control hardware.
///
/// Implementations must be `Send + Sync`: commands are issued from
/// dispatcher worker threads. Failures are reported as typed errors and
/// logged at the task boundary; the task itself does not retry.
pub trait ChannelDriver: Send + Sync {
    /// Drive the channel at a constant current (positive = charge).
    fn constant_current(&self, channel: usize, amps: f64) -> Result<()>;

    /// Hold the channel at a constant voltage.
    fn constant_voltage(&self, channel: usize, volts: f64) -> Result<()>;

    /// Put the channel into a rest state (open circuit, still measuring).
    fn rest(&self, channel: usize) -> Result<()>;

    /// Turn the channel off.
    fn off(&self, channel: usize) -> Result<()>;
}

/// One control operation as observed by the dummy driver.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverOp {
    ConstantCurrent { channel: usize, amps: f64 },
    ConstantVoltage { channel: usize, volts: f64 },
    Rest { channel: usize },
    Off { channel: usize },
}

/// Safe operating limits enforced by the dummy driver.
#[derive(Debug, Clone, Copy)]
pub struct DriverLimits {
    /// Maximum current magnitude in amperes.
    pub max_current_a: f64,
    /// Maximum voltage in volts.
    pub max_voltage_v: f64,
}

impl Default for DriverLimits {
    fn default() -> Self {
        Self {
            max_current_a: DEFAULT_MAX_CURRENT_A,
            max_voltage_v: DEFAULT_MAX_VOLTAGE_V,
        }
    }
}

/// Dummy channel driver for host testing.
///
/// Prints each operation to stdout, validates protocol ranges the way the
/// real driver does, and records every accepted operation so tests can
/// assert on command order.
#[derive(Debug, Default)]
pub struct DummyDriver {
    limits: DriverLimits,
    ops: Mutex<Vec<DriverOp>>,
}

impl DummyDriver {
    /// Create a dummy driver with default limits.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a dummy driver with explicit safe operating limits.
    pub fn with_limits(limits: DriverLimits) -> Self {
        Self {
            limits,
            ops: Mutex::new(Vec::new()),
        }
    }

    /// All operations accepted so far, in issue order.
    pub fn ops(&self) -> Vec<DriverOp> {
        self.ops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drain and return the recorded operations.
    pub fn take_ops(&self) -> Vec<DriverOp> {
        std::mem::take(&mut *self.ops.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn record(&self, op: DriverOp) {
        self.ops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(op);
    }

    fn check_current(&self, channel: usize, amps: f64) -> Result<()> {
        if amps.is_finite() && amps.abs() <= self.limits.max_current_a {
            Ok(())
        } else {
            Err(CyclerError::CurrentOutOfRange { channel, amps })
        }
    }

    fn check_voltage(&self, channel: usize, volts: f64) -> Result<()> {
        if volts.is_finite() && volts >= 0.0 && volts <= self.limits.max_voltage_v {
            Ok(())
        } else {
            Err(CyclerError::VoltageOutOfRange { channel, volts })
        }
    }
}

impl ChannelDriver for DummyDriver {
    fn constant_current(&self, channel: usize, amps: f64) -> Result<()> {
        validate_channel(channel)?;
        self.check_current(channel, amps)?;
        println!("[driver] channel {channel}: constant current {amps} A");
        tracing::debug!(channel, amps, "constant current");
        self.record(DriverOp::ConstantCurrent { channel, amps });
        Ok(())
    }

    fn constant_voltage(&self, channel: usize, volts: f64) -> Result<()> {
        validate_channel(channel)?;
        self.check_voltage(channel, volts)?;
        println!("[driver] channel {channel}: constant voltage {volts} V");
        tracing::debug!(channel, volts, "constant voltage");
        self.record(DriverOp::ConstantVoltage { channel, volts });
        Ok(())
    }

    fn rest(&self, channel: usize) -> Result<()> {
        validate_channel(channel)?;
        println!("[driver] channel {channel}: rest");
        tracing::debug!(channel, "rest");
        self.record(DriverOp::Rest { channel });
        Ok(())
    }

    fn off(&self, channel: usize) -> Result<()> {
        validate_channel(channel)?;
        println!("[driver] channel {channel}: off");
        tracing::debug!(channel, "off");
        self.record(DriverOp::Off { channel });
        Ok(())
    }
}
