//! Error types for puck-rs.
//!
//! Three failure classes reach callers: transport/IO errors reported by the
//! BLE stack, validation errors rejected before any I/O, and decode errors
//! for payloads that don't match the puck's wire layout. None of them are
//! retried internally; retry policy belongs to the caller.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// All errors produced by this crate.
#[derive(Debug, Error)]
pub enum PuckError {
    /// The underlying BLE stack reported a failure (connect, read, write,
    /// subscribe, or service discovery).
    #[error("bluetooth transport error: {0}")]
    Transport(#[from] btleplug::Error),

    /// No Bluetooth adapter is present on this machine.
    #[error("no bluetooth adapter found")]
    NoAdapter,

    /// The peripheral does not expose an expected GATT characteristic.
    #[error("characteristic {0} not found on peripheral")]
    CharacteristicNotFound(Uuid),

    /// No matching peripheral was discovered before the scan timeout.
    #[error("no puck found within {0:?}")]
    ScanTimeout(Duration),

    /// A sampling period outside the supported range was rejected before
    /// any transport write.
    #[error("sampling period {requested:?} outside supported range {min:?}..={max:?}")]
    InvalidPeriod {
        requested: Duration,
        min: Duration,
        max: Duration,
    },

    /// A notification or read payload was too short for its field layout.
    #[error("payload too short: expected at least {expected} bytes, got {actual}")]
    ShortPayload { expected: usize, actual: usize },

    /// The BLE stack has no signal-strength reading for this peripheral.
    #[error("rssi unavailable for peripheral")]
    RssiUnavailable,
}

/// Result alias used throughout the crate.
pub type Result<T, E = PuckError> = std::result::Result<T, E>;
