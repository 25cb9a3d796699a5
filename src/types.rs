//! Data types produced by the puck session.

/// A single 3-axis movement sample decoded from one BLE notification.
///
/// Axes carry the raw unsigned 16-bit wire values widened to `f32`; no unit
/// conversion is applied (scaling is a consumer concern). A fresh value is
/// constructed per notification and never mutated afterwards.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vector3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// Lifecycle state of the session's BLE link.
///
/// Mirrors what the transport reports; the session invents no intermediate
/// states of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No active link. Initial state, and the terminal state of every
    /// connection attempt, successful or not.
    #[default]
    Disconnected,
    /// `connect()` is in flight: the transport link and the setup sequence
    /// (battery read, period read, stream enable) have not yet completed.
    Connecting,
    /// Link established and the setup sequence finished; telemetry is live.
    Connected,
    /// `disconnect()` is releasing the transport.
    Disconnecting,
}
