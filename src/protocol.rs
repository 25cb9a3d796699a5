//! GATT profile and wire-format codecs for the handlebar puck.
//!
//! Custom UUIDs belong to the puck vendor namespace
//! `0137XXXX-7b58-4dda-af7b-4b87d25b4296`; battery reporting uses the
//! standard Bluetooth SIG battery service. All identifiers are compile-time
//! constants — they never change at runtime and uniquely select the
//! characteristic to address for every operation.
//!
//! Multi-octet fields within a GATT profile are transmitted least significant
//! octet first (little endian); every decoder here follows that rule.

use std::time::Duration;

use uuid::Uuid;

use crate::error::{PuckError, Result};
use crate::types::Vector3;

// ── UUIDs ─────────────────────────────────────────────────────────────────────

const PUCK_UUID_BASE: u128 = 0x01370000_7b58_4dda_af7b_4b87d25b4296;

/// Build a vendor UUID from its 16-bit shortcode (the `XXXX` in
/// `0137XXXX-7b58-4dda-af7b-4b87d25b4296`).
const fn puck_uuid(short: u16) -> Uuid {
    Uuid::from_u128(PUCK_UUID_BASE | ((short as u128) << 96))
}

/// Primary movement service advertised by every puck.
///
/// Also used as the scan filter to pick pucks out of nearby BLE peripherals.
pub const MOVEMENT_SERVICE: Uuid = puck_uuid(0x9a00);

/// 3-axis movement data characteristic (notify).
///
/// Each notification carries one [`Vector3`] sample; see [`decode_vector3`].
pub const MOVEMENT_DATA_CHARACTERISTIC: Uuid = puck_uuid(0x9a01);

/// Stream enable/disable configuration characteristic (write).
///
/// Accepts the fixed 2-byte payloads [`GYRO_ENABLE`] and [`GYRO_DISABLE`].
pub const MOVEMENT_CONFIG_CHARACTERISTIC: Uuid = puck_uuid(0x9a02);

/// Sampling-period characteristic (read/write).
///
/// A single byte in units of 10 ms; see [`encode_period`] / [`decode_period`].
pub const MOVEMENT_PERIOD_CHARACTERISTIC: Uuid = puck_uuid(0x9a03);

/// Standard Bluetooth SIG battery service.
pub const BATTERY_SERVICE: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);

/// Standard battery level characteristic (read, notify where supported).
pub const BATTERY_LEVEL_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);

// ── Characteristic resolution ─────────────────────────────────────────────────

/// The addressable data points of the puck's GATT profile.
///
/// A pure service/characteristic mapping: resolving either UUID involves no
/// I/O and cannot fail, since every value is a compile-time constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PuckCharacteristic {
    /// Live 3-axis samples (notify).
    MovementData,
    /// Stream enable/disable (write).
    MovementConfig,
    /// Sampling period (read/write).
    MovementPeriod,
    /// Battery percentage (read/notify).
    BatteryLevel,
}

impl PuckCharacteristic {
    /// The service this characteristic lives under.
    pub const fn service(self) -> Uuid {
        match self {
            Self::MovementData | Self::MovementConfig | Self::MovementPeriod => MOVEMENT_SERVICE,
            Self::BatteryLevel => BATTERY_SERVICE,
        }
    }

    /// The characteristic's own UUID.
    pub const fn uuid(self) -> Uuid {
        match self {
            Self::MovementData => MOVEMENT_DATA_CHARACTERISTIC,
            Self::MovementConfig => MOVEMENT_CONFIG_CHARACTERISTIC,
            Self::MovementPeriod => MOVEMENT_PERIOD_CHARACTERISTIC,
            Self::BatteryLevel => BATTERY_LEVEL_CHARACTERISTIC,
        }
    }
}

// ── Configuration payloads ────────────────────────────────────────────────────

/// Config payload that starts the movement stream.
pub const GYRO_ENABLE: [u8; 2] = [0x7F, 0x00];

/// Config payload that stops the movement stream.
pub const GYRO_DISABLE: [u8; 2] = [0x00, 0x00];

// ── Sampling period ───────────────────────────────────────────────────────────

/// Shortest sampling period the puck accepts.
pub const PERIOD_MIN: Duration = Duration::from_millis(100);

/// Longest sampling period the puck accepts (the full single-byte range).
pub const PERIOD_MAX: Duration = Duration::from_millis(2550);

/// Encode a sampling period into its single-byte wire form (units of 10 ms).
///
/// Periods outside [`PERIOD_MIN`]..=[`PERIOD_MAX`] are rejected with
/// [`PuckError::InvalidPeriod`] before any I/O can happen. Valid periods are
/// rounded to the nearest 10 ms step, so
/// `decode_period(encode_period(p)?)` lands within 10 ms of `p`.
///
/// # Example
///
/// ```
/// # use std::time::Duration;
/// # use puck_rs::protocol::encode_period;
/// assert_eq!(encode_period(Duration::from_millis(500)).unwrap(), 50);
/// assert!(encode_period(Duration::from_millis(50)).is_err());
/// ```
pub fn encode_period(period: Duration) -> Result<u8> {
    if period < PERIOD_MIN || period > PERIOD_MAX {
        return Err(PuckError::InvalidPeriod {
            requested: period,
            min: PERIOD_MIN,
            max: PERIOD_MAX,
        });
    }
    // Range check above guarantees the rounded value fits in one byte.
    Ok(((period.as_millis() as u64 + 5) / 10) as u8)
}

/// Decode a wire-format period byte back into a duration (`byte × 10 ms`).
///
/// Total over the byte range: every input maps to a valid, if unvalidated,
/// duration — including 0, which the puck itself never reports.
pub fn decode_period(byte: u8) -> Duration {
    Duration::from_millis(byte as u64 * 10)
}

// ── Movement samples ──────────────────────────────────────────────────────────

fn read_u16_le(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

/// Decode a movement notification into a [`Vector3`].
///
/// Wire layout: three little-endian unsigned 16-bit axes at byte offsets
/// 0, 2, and 4, widened to `f32` without unit conversion. Value ranges are
/// not validated (the firmware is trusted); a buffer shorter than 6 bytes
/// fails with [`PuckError::ShortPayload`] and produces no partial result.
pub fn decode_vector3(data: &[u8]) -> Result<Vector3> {
    if data.len() < 6 {
        return Err(PuckError::ShortPayload {
            expected: 6,
            actual: data.len(),
        });
    }
    Ok(Vector3 {
        x: read_u16_le(data, 0) as f32,
        y: read_u16_le(data, 2) as f32,
        z: read_u16_le(data, 4) as f32,
    })
}

// ── Battery ───────────────────────────────────────────────────────────────────

/// Decode a battery level payload: a single unsigned byte, percent (0–100).
///
/// Fails with [`PuckError::ShortPayload`] on an empty payload.
pub fn decode_battery_level(data: &[u8]) -> Result<u8> {
    data.first().copied().ok_or(PuckError::ShortPayload {
        expected: 1,
        actual: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn characteristic_resolution_is_fixed() {
        assert_eq!(
            PuckCharacteristic::MovementData.service(),
            MOVEMENT_SERVICE
        );
        assert_eq!(
            PuckCharacteristic::MovementPeriod.uuid().to_string(),
            "01379a03-7b58-4dda-af7b-4b87d25b4296"
        );
        assert_eq!(
            PuckCharacteristic::BatteryLevel.uuid().to_string(),
            "00002a19-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(PuckCharacteristic::BatteryLevel.service(), BATTERY_SERVICE);
    }

    #[test]
    fn period_roundtrip_within_wire_granularity() {
        // Quantization law: decode(encode(p)) within ±10 ms for every valid p.
        for ms in (100..=2550).step_by(7) {
            let period = Duration::from_millis(ms);
            let byte = encode_period(period).unwrap();
            let decoded = decode_period(byte);
            let diff = if decoded > period {
                decoded - period
            } else {
                period - decoded
            };
            assert!(
                diff <= Duration::from_millis(10),
                "{ms} ms decoded to {decoded:?}"
            );
        }
    }

    #[test]
    fn period_encoding_boundaries() {
        assert_eq!(encode_period(Duration::from_millis(100)).unwrap(), 10);
        assert_eq!(encode_period(Duration::from_millis(500)).unwrap(), 50);
        assert_eq!(encode_period(Duration::from_millis(2550)).unwrap(), 255);
        // Rounds to the nearest 10 ms step.
        assert_eq!(encode_period(Duration::from_millis(104)).unwrap(), 10);
        assert_eq!(encode_period(Duration::from_millis(105)).unwrap(), 11);
    }

    #[test]
    fn period_out_of_range_rejected() {
        for ms in [0u64, 99, 2551, 10_000] {
            let err = encode_period(Duration::from_millis(ms)).unwrap_err();
            assert!(matches!(err, PuckError::InvalidPeriod { .. }), "{ms} ms");
        }
    }

    #[test]
    fn decode_period_is_total() {
        assert_eq!(decode_period(0), Duration::ZERO);
        assert_eq!(decode_period(50), Duration::from_millis(500));
        assert_eq!(decode_period(255), Duration::from_millis(2550));
    }

    #[test]
    fn vector3_little_endian_fields() {
        let v = decode_vector3(&[0x01, 0x00, 0x34, 0x12, 0xFF, 0xFF]).unwrap();
        assert_eq!(v, Vector3 { x: 1.0, y: 0x1234 as f32, z: 65535.0 });

        // Trailing bytes beyond the fixed layout are ignored.
        let v = decode_vector3(&[2, 0, 3, 0, 4, 0, 0xAA, 0xBB]).unwrap();
        assert_eq!(v, Vector3 { x: 2.0, y: 3.0, z: 4.0 });
    }

    #[test]
    fn vector3_rejects_short_buffer() {
        for len in 0..6 {
            let err = decode_vector3(&vec![0u8; len]).unwrap_err();
            assert!(
                matches!(err, PuckError::ShortPayload { expected: 6, actual } if actual == len)
            );
        }
    }

    #[test]
    fn battery_level_first_byte() {
        assert_eq!(decode_battery_level(&[42]).unwrap(), 42);
        assert_eq!(decode_battery_level(&[80, 0x99]).unwrap(), 80);
        assert!(matches!(
            decode_battery_level(&[]),
            Err(PuckError::ShortPayload { expected: 1, actual: 0 })
        ));
    }
}
