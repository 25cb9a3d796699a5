//! # puck-rs
//!
//! Async Rust client for the handlebar-mounted puck sensor: connection
//! lifecycle, sampling configuration, and live telemetry over Bluetooth Low
//! Energy.
//!
//! The puck exposes a private movement service (3-axis sensor stream,
//! enable/disable config, sampling period) alongside the standard battery
//! service. This crate wraps one peripheral in a [`session::PuckSession`]
//! that runs the connect/configure sequence, keeps battery, signal strength,
//! and sampling period current, and streams decoded movement vectors to any
//! number of subscribers.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::time::Duration;
//! use puck_rs::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let device = PuckScanner::new(ScanConfig::default()).find_first().await?;
//!     let session = device.into_session(SessionConfig::default());
//!     session.connect().await?;
//!
//!     session.write_gyro_period(Duration::from_millis(500)).await?;
//!
//!     let mut gyro = session.gyro();
//!     while let Ok(v) = gyro.recv().await {
//!         println!("x={} y={} z={}", v.x, v.y, v.z);
//!     }
//!     session.disconnect().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the commonly needed types |
//! | [`scanner`] | Peripheral discovery with an explicit scan configuration |
//! | [`session`] | Connection lifecycle, accessors, and telemetry streams |
//! | [`transport`] | The GATT transport seam and its btleplug implementation |
//! | [`protocol`] | GATT UUIDs and wire-format codecs |
//! | [`types`] | Sensor sample and connection-state types |
//! | [`error`] | Typed error taxonomy |

pub mod error;
pub mod protocol;
pub mod scanner;
pub mod session;
pub mod transport;
pub mod types;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
pub mod prelude {
    pub use crate::error::{PuckError, Result};
    pub use crate::scanner::{PuckDevice, PuckScanner, ScanConfig};
    pub use crate::session::{PuckSession, SessionConfig};
    pub use crate::types::{ConnectionState, Vector3};
}
