//! # Charger/Inverter Register Protocol
//!
//! Low-level definitions for the request/response register protocol spoken by the
//! bidirectional charger/inverter over CAN:
//!
//! - **Identifiers**: [`Address`] derives the request and response CAN identifiers.
//! - **Frames**: [`Frame`] is a raw bus frame; [`Response`] is a decoded reply.
//! - **Scaled scalars**: [`Scalar`] describes a 16-bit register holding `raw × factor`,
//!   with [`encode_scalar`] / [`decode_scalar`] doing the conversion.
//! - **Modes**: [`Mode`] enumerates the operating modes the sequencer can request.
//!
//! Bitfield registers live in [`crate::bitfield`].

use crate::{Error, Result};
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Identifier base for frames sent to the device.
pub const REQUEST_ID_BASE: u32 = 0x000C_0500;
/// Identifier base for frames sent by the device.
pub const RESPONSE_ID_BASE: u32 = 0x000C_0400;

/// Number of bytes used by the register code at the start of every frame body.
pub const CODE_LENGTH: usize = 2;
/// Number of bytes carried by a register value.
pub const VALUE_LENGTH: usize = 2;

/// Desired battery power the device starts with.
pub const DEFAULT_DESIRED_POWER: f64 = 1000.0;
/// Lowest charge power the unit can be commanded to (57.6 V × 14 A).
pub const CHARGE_POWER_MIN: f64 = 806.4;
/// Highest charge power the unit can be commanded to.
pub const CHARGE_POWER_MAX: f64 = 4200.0;
/// Voltage written to the CV setpoint when the battery current reads zero.
pub const FALLBACK_CV_VOLTAGE: f64 = 52.0;
/// Nominal CV voltage used to derive the initial CC setpoint.
pub const NOMINAL_CV_VOLTAGE: f64 = 56.0;

/// Base address of a charger/inverter on the bus.
///
/// The request and response identifiers are fixed offsets from this address. Both
/// identifier ranges are 0x100 wide, so no two addresses ever share an identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Address(u8);

impl Address {
    pub const fn new(address: u8) -> Self {
        Self(address)
    }

    /// Identifier used for frames sent to the device.
    pub const fn request_id(&self) -> u32 {
        REQUEST_ID_BASE + self.0 as u32
    }

    /// Identifier used by the device for its replies.
    pub const fn response_id(&self) -> u32 {
        RESPONSE_ID_BASE + self.0 as u32
    }
}

impl Deref for Address {
    type Target = u8;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<u8> for Address {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// A raw frame as carried by the bus (extended identifier, up to 8 data bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: u32,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(id: u32, data: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            data: data.into(),
        }
    }

    /// Builds a request frame: little-endian `code` followed by `payload` (0 or 2 bytes).
    pub fn request(address: Address, code: u16, payload: &[u8]) -> Self {
        let mut data = Vec::with_capacity(CODE_LENGTH + payload.len());
        data.extend_from_slice(&code.to_le_bytes());
        data.extend_from_slice(payload);
        Self::new(address.request_id(), data)
    }
}

/// A reply frame split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Frame identifier minus this device's response identifier; `0` for our own replies.
    pub offset: i64,
    pub code: u16,
    pub payload: Vec<u8>,
}

impl Response {
    /// Splits a received frame relative to `address`.
    ///
    /// Returns `None` when the frame is too short to carry a register code.
    pub fn from_frame(address: Address, frame: &Frame) -> Option<Self> {
        if frame.data.len() < CODE_LENGTH {
            return None;
        }
        Some(Self {
            offset: frame.id as i64 - address.response_id() as i64,
            code: u16::from_le_bytes([frame.data[0], frame.data[1]]),
            payload: frame.data[CODE_LENGTH..].to_vec(),
        })
    }
}

/// Clamps `value` into the closed range spanned by `min` and `max`.
///
/// This is the median of the three values, so a swapped pair of bounds still
/// yields a value inside them.
pub fn clamp3(min: f64, value: f64, max: f64) -> f64 {
    let mut values = [min, value, max];
    values.sort_by(|a, b| a.total_cmp(b));
    values[1]
}

/// Encodes a physical value into a 2-byte little-endian register payload.
///
/// The value is clamped into `[min, max]`, divided by `factor` and truncated.
/// Results in `0..=65535` are encoded unsigned, negative results down to `-32768`
/// as two's complement. Returns `None` for non-finite input or a result that
/// does not fit 16 bits.
pub fn encode_scalar(value: f64, factor: f64, min: f64, max: f64) -> Option<[u8; 2]> {
    if !value.is_finite() || !factor.is_finite() || factor == 0.0 {
        return None;
    }
    let raw = (clamp3(min, value, max) / factor).trunc();
    if (0.0..=u16::MAX as f64).contains(&raw) {
        Some((raw as u16).to_le_bytes())
    } else if (i16::MIN as f64..0.0).contains(&raw) {
        Some((raw as i16).to_le_bytes())
    } else {
        None
    }
}

/// Decodes a 2-byte little-endian register payload into a physical value.
pub fn decode_scalar(bytes: [u8; 2], factor: f64, signed: bool) -> f64 {
    let raw = if signed {
        i16::from_le_bytes(bytes) as f64
    } else {
        u16::from_le_bytes(bytes) as f64
    };
    raw * factor
}

/// Takes the first two payload bytes, failing with [`Error::MalformedPayload`].
pub fn value_bytes(code: u16, payload: &[u8]) -> Result<[u8; 2]> {
    match payload {
        [lo, hi, ..] => Ok([*lo, *hi]),
        _ => Err(Error::MalformedPayload {
            code,
            len: payload.len(),
        }),
    }
}

/// Describes a scaled scalar register.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scalar {
    pub code: u16,
    pub factor: f64,
    pub signed: bool,
    /// Legal write range; `None` for read-only registers.
    pub limits: Option<(f64, f64)>,
}

impl Scalar {
    const fn read_only(code: u16, factor: f64) -> Self {
        Self {
            code,
            factor,
            signed: false,
            limits: None,
        }
    }

    const fn read_write(code: u16, factor: f64, min: f64, max: f64) -> Self {
        Self {
            code,
            factor,
            signed: false,
            limits: Some((min, max)),
        }
    }

    /// Decodes a response payload for this register.
    pub fn decode(&self, payload: &[u8]) -> Result<f64> {
        Ok(decode_scalar(
            value_bytes(self.code, payload)?,
            self.factor,
            self.signed,
        ))
    }

    /// Clamps and encodes `value` for a write to this register.
    pub fn encode(&self, value: f64) -> Result<[u8; 2]> {
        if !value.is_finite() {
            return Err(Error::NotANumber { code: self.code });
        }
        let (min, max) = self
            .limits
            .unwrap_or((f64::NEG_INFINITY, f64::INFINITY));
        encode_scalar(value, self.factor, min, max).ok_or(Error::OutOfRange {
            code: self.code,
            value,
        })
    }

    /// The value a write of `value` will actually leave in the register.
    pub fn quantize(&self, value: f64) -> Result<f64> {
        Ok(decode_scalar(self.encode(value)?, self.factor, self.signed))
    }
}

// AC input
pub const AC_INPUT_VOLTAGE: Scalar = Scalar::read_only(0x0050, 0.1);
pub const AC_INPUT_CURRENT: Scalar = Scalar::read_only(0x0053, 0.1);
pub const AC_INPUT_FREQUENCY: Scalar = Scalar::read_only(0x0056, 0.01);

// AC output
pub const AC_OUTPUT_VOLTAGE: Scalar = Scalar::read_only(0x0108, 0.1);
pub const AC_OUTPUT_CURRENT: Scalar = Scalar::read_only(0x012B, 0.1);
pub const AC_OUTPUT_FREQUENCY: Scalar = Scalar::read_only(0x0105, 0.01);
pub const AC_OUTPUT_LOAD_PERCENT: Scalar = Scalar::read_only(0x010B, 1.0);
pub const AC_OUTPUT_WATT_HI: Scalar = Scalar::read_only(0x010E, 0.1);
pub const AC_OUTPUT_WATT_LO: Scalar = Scalar::read_only(0x010F, 0.1);
pub const AC_OUTPUT_VA_HI: Scalar = Scalar::read_only(0x0114, 0.1);
pub const AC_OUTPUT_VA_LO: Scalar = Scalar::read_only(0x0115, 0.1);

// Battery
pub const BATTERY_VOLTAGE: Scalar = Scalar::read_only(0x011A, 0.01);
/// Positive values mean current flowing into the battery.
pub const BATTERY_CURRENT: Scalar = Scalar {
    code: 0x011B,
    factor: 0.01,
    signed: true,
    limits: None,
};

pub const INTERNAL_TEMPERATURE: Scalar = Scalar::read_only(0x0062, 0.1);

// Charge curve, [EEPROM] backed
pub const CURVE_CC: Scalar = Scalar::read_write(0x00B0, 0.01, 14.0, 70.0);
pub const CURVE_CV: Scalar = Scalar::read_write(0x00B1, 0.01, 48.0, 56.0);
pub const CURVE_FV: Scalar = Scalar::read_write(0x00B2, 0.01, 40.0, 60.0);
pub const CURVE_TC: Scalar = Scalar::read_write(0x00B3, 0.01, 1.4, 21.0);

// Charge curve timeouts in minutes
pub const CURVE_CC_TIMEOUT: Scalar = Scalar::read_write(0x00B5, 1.0, 60.0, 64800.0);
pub const CURVE_CV_TIMEOUT: Scalar = Scalar::read_write(0x00B6, 1.0, 60.0, 64800.0);
pub const CURVE_FV_TIMEOUT: Scalar = Scalar::read_write(0x00B7, 1.0, 60.0, 64800.0);

// Battery triggers, [EEPROM] backed
pub const BAT_ALARM_VOLTAGE: Scalar = Scalar::read_write(0x00B9, 0.01, 37.6, 50.0);
pub const BAT_SHUTDOWN_VOLTAGE: Scalar = Scalar::read_write(0x00BA, 0.01, 36.8, 48.0);
pub const BAT_RECHARGE_VOLTAGE: Scalar = Scalar::read_write(0x00BB, 0.01, 36.8, 60.0);

/// Combines a 32-bit quantity split over a hi/lo register pair.
pub fn decode_pair(hi: [u8; 2], lo: [u8; 2], factor: f64) -> f64 {
    let raw = (u16::from_le_bytes(hi) as u32) << 16 | u16::from_le_bytes(lo) as u32;
    raw as f64 * factor
}

/// Operating mode requested from the unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
#[repr(u8)]
pub enum Mode {
    /// Charger off, output routing enabled but idle.
    #[default]
    Off = 0,
    /// Battery charging from the AC input.
    Charge = 1,
    /// Battery discharge with bypass routing.
    Discharge = 2,
}

impl TryFrom<u8> for Mode {
    type Error = Error;
    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Mode::Off),
            1 => Ok(Mode::Charge),
            2 => Ok(Mode::Discharge),
            _ => Err(Error::InvalidMode(value)),
        }
    }
}

impl FromStr for Mode {
    type Err = Error;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" | "standby" | "0" => Ok(Mode::Off),
            "charge" | "1" => Ok(Mode::Charge),
            "discharge" | "2" => Ok(Mode::Discharge),
            _ => Err(Error::UnknownMode(s.to_string())),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Off => write!(f, "OFF"),
            Mode::Charge => write!(f, "CHARGE"),
            Mode::Discharge => write!(f, "DISCHARGE"),
        }
    }
}
