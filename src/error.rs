//! Error handling for the cycler service
//!
//! This module defines the crate-wide error type and a Result alias.
//! Driver and transport failures are recoverable and handled at task
//! boundaries; invalid channels and bad configuration are programming
//! errors surfaced to the calling API.

use crate::types::MAX_CHANNELS;
use thiserror::Error;

/// Main error type for cycler operations
#[derive(Error, Debug)]
pub enum CyclerError {
    /// A hardware command failed on the real-time core
    #[error("driver error on channel {channel}: {message}")]
    Driver { channel: usize, message: String },

    /// Requested current is outside the channel's safe operating range
    #[error("current {amps} A out of range on channel {channel}")]
    CurrentOutOfRange { channel: usize, amps: f64 },

    /// Requested voltage is outside the channel's safe operating range
    #[error("voltage {volts} V out of range on channel {channel}")]
    VoltageOutOfRange { channel: usize, volts: f64 },

    /// Channel identifier is not in `[0, MAX_CHANNELS)`
    #[error("invalid channel {0} (valid channels are 0..{MAX_CHANNELS})")]
    InvalidChannel(usize),

    /// Telemetry transport read failure or malformed record
    #[error("transport error: {0}")]
    Transport(String),

    /// Invalid configuration value
    #[error("configuration error: {0}")]
    Config(String),

    /// Operation attempted while the service is shutting down
    #[error("service is shutting down")]
    ShuttingDown,

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CyclerError {
    /// Wrap a hardware failure message for a channel.
    pub fn driver(channel: usize, message: impl Into<String>) -> Self {
        CyclerError::Driver {
            channel,
            message: message.into(),
        }
    }
}

/// Result type alias for cycler operations
pub type Result<T> = std::result::Result<T, CyclerError>;
