//! ThermoBeacon manufacturer payload decoder.
//!
//! ThermoBeacons advertise two payload shapes under the same manufacturer id:
//! a 20-byte status frame with no measurements, and a data frame with
//! little-endian fields at fixed offsets:
//!
//! | offset    | type      | field                    | scale   |
//! |-----------|-----------|--------------------------|---------|
//! | `[8:10)`  | `u16`     | battery voltage (mV)     | / 1000  |
//! | `[10:12)` | `i16/u16` | temperature (°C)         | / 16    |
//! | `[12:14)` | `u16`     | relative humidity (%)    | / 16    |
//! | `[14:18)` | `u32`     | uptime (s)               | none    |
//!
//! Older firmware only fills the temperature and humidity words and treats
//! temperature as unsigned; see [`ProtocolRevision`].

use thiserror::Error;

/// Length of the status/keep-alive frame that carries no reading.
pub const STATUS_FRAME_LEN: usize = 20;

/// Minimum payload length for the legacy revision (temperature + humidity).
pub const LEGACY_MIN_LEN: usize = 14;

/// Minimum payload length for the extended revision (adds voltage + uptime).
pub const EXTENDED_MIN_LEN: usize = 18;

const VOLTAGE: usize = 8;
const TEMPERATURE: usize = 10;
const HUMIDITY: usize = 12;
const UPTIME: usize = 14;

/// Error types for decoding ThermoBeacon payloads.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Payload does not cover the fields required by the selected revision
    #[error("Payload too short: {len} bytes, need at least {min}")]
    TooShort { len: usize, min: usize },
}

/// Which payload layout to assume for data frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ProtocolRevision {
    /// Pick by length: 18 bytes or more is extended, otherwise legacy
    #[default]
    Auto,
    /// Unsigned temperature, no voltage or uptime
    Legacy,
    /// Signed temperature with voltage and uptime
    Extended,
}

impl std::fmt::Display for ProtocolRevision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolRevision::Auto => write!(f, "auto"),
            ProtocolRevision::Legacy => write!(f, "legacy"),
            ProtocolRevision::Extended => write!(f, "extended"),
        }
    }
}

/// A decoded ThermoBeacon measurement.
///
/// `voltage` and `uptime` are `None` for readings decoded with the legacy
/// layout, which does not carry them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    /// Temperature in Celsius
    pub temperature: f64,
    /// Relative humidity in percent
    pub humidity: f64,
    /// Battery voltage in Volts
    pub voltage: Option<f64>,
    /// Seconds since the beacon booted
    pub uptime: Option<u32>,
}

/// The status variant, kept only for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusFrame {
    /// Raw payload as lowercase hex
    pub hex: String,
}

/// Result of classifying a manufacturer payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Status(StatusFrame),
    Reading(SensorReading),
}

fn u16_at(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn i16_at(data: &[u8], offset: usize) -> i16 {
    i16::from_le_bytes([data[offset], data[offset + 1]])
}

fn u32_at(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Decode a ThermoBeacon manufacturer payload (without the company id).
///
/// Exactly [`STATUS_FRAME_LEN`] bytes is always the status variant. Any other
/// length is a data frame decoded according to `revision`.
///
/// # Errors
/// Returns [`DecodeError::TooShort`] when the payload does not reach the
/// minimum length of the revision in play.
pub fn decode(data: &[u8], revision: ProtocolRevision) -> Result<Payload, DecodeError> {
    if data.len() == STATUS_FRAME_LEN {
        return Ok(Payload::Status(StatusFrame {
            hex: hex::encode(data),
        }));
    }

    let extended = match revision {
        ProtocolRevision::Auto => data.len() >= EXTENDED_MIN_LEN,
        ProtocolRevision::Legacy => false,
        ProtocolRevision::Extended => true,
    };

    let reading = if extended {
        decode_extended(data)?
    } else {
        decode_legacy(data)?
    };

    Ok(Payload::Reading(reading))
}

fn decode_legacy(data: &[u8]) -> Result<SensorReading, DecodeError> {
    if data.len() < LEGACY_MIN_LEN {
        return Err(DecodeError::TooShort {
            len: data.len(),
            min: LEGACY_MIN_LEN,
        });
    }

    Ok(SensorReading {
        temperature: f64::from(u16_at(data, TEMPERATURE)) / 16.0,
        humidity: f64::from(u16_at(data, HUMIDITY)) / 16.0,
        voltage: None,
        uptime: None,
    })
}

fn decode_extended(data: &[u8]) -> Result<SensorReading, DecodeError> {
    if data.len() < EXTENDED_MIN_LEN {
        return Err(DecodeError::TooShort {
            len: data.len(),
            min: EXTENDED_MIN_LEN,
        });
    }

    Ok(SensorReading {
        temperature: f64::from(i16_at(data, TEMPERATURE)) / 16.0,
        humidity: f64::from(u16_at(data, HUMIDITY)) / 16.0,
        voltage: Some(f64::from(u16_at(data, VOLTAGE)) / 1000.0),
        uptime: Some(u32_at(data, UPTIME)),
    })
}
