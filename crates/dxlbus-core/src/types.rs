//! Core types used throughout dxlbus.
//!
//! These types describe motors and register values independently of any
//! particular wire protocol.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Identifier of one motor on the bus.
///
/// Valid IDs are `0..=252`. Values `253..=255` are reserved by the bus
/// protocol (254 is the broadcast address) and can never name a motor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MotorId(u8);

impl MotorId {
    /// Highest ID a motor may carry.
    pub const MAX: u8 = 252;

    /// Raw broadcast address. Not a valid `MotorId`.
    pub const BROADCAST: u8 = 0xFE;

    /// Create a `MotorId`, rejecting reserved values.
    pub fn new(id: u8) -> Result<Self> {
        if id > Self::MAX {
            return Err(Error::InvalidParameter(format!(
                "motor id {id} is reserved (valid range 0..={})",
                Self::MAX
            )));
        }
        Ok(MotorId(id))
    }

    /// Return the raw ID byte.
    pub fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for MotorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for MotorId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let raw: u8 = s
            .trim()
            .parse()
            .map_err(|_| Error::InvalidParameter(format!("invalid motor id: {s}")))?;
        MotorId::new(raw)
    }
}

/// Byte width of a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    One,
    Two,
    Four,
}

impl Width {
    /// Number of bytes occupied on the wire.
    pub fn bytes(self) -> usize {
        match self {
            Width::One => 1,
            Width::Two => 2,
            Width::Four => 4,
        }
    }

    /// Map a byte count back to a width, if it is one of 1, 2 or 4.
    pub fn from_bytes(n: usize) -> Option<Self> {
        match n {
            1 => Some(Width::One),
            2 => Some(Width::Two),
            4 => Some(Width::Four),
            _ => None,
        }
    }

    /// Largest unsigned value representable at this width.
    pub fn max_unsigned(self) -> u32 {
        match self {
            Width::One => u8::MAX as u32,
            Width::Two => u16::MAX as u32,
            Width::Four => u32::MAX,
        }
    }

    fn bits(self) -> u32 {
        self.bytes() as u32 * 8
    }
}

/// Access mode of a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

impl Access {
    pub fn is_writable(self) -> bool {
        self == Access::ReadWrite
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Access::ReadOnly => "R",
            Access::ReadWrite => "RW",
        })
    }
}

/// Memory area a register lives in.
///
/// EEPROM registers hold persistent configuration (ID, baud rate, limits);
/// RAM registers hold volatile runtime state (torque enable, goals, present
/// values).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Area {
    Eeprom,
    Ram,
}

impl fmt::Display for Area {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Area::Eeprom => "EEPROM",
            Area::Ram => "RAM",
        })
    }
}

/// A fixed-width unsigned register value.
///
/// The wire representation is little-endian at the register's width.
/// Registers that hold signed quantities (velocities, positions in
/// extended mode) store two's complement; use [`to_signed`](Self::to_signed)
/// to interpret them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegisterValue {
    width: Width,
    raw: u32,
}

impl RegisterValue {
    /// Create a value from its raw unsigned representation.
    ///
    /// Returns `None` if `raw` does not fit in `width`.
    pub fn new(width: Width, raw: u32) -> Option<Self> {
        (raw <= width.max_unsigned()).then_some(RegisterValue { width, raw })
    }

    /// Create a value from a signed integer.
    ///
    /// Accepts anything in `-(2^(bits-1))..=2^bits - 1`; negative values are
    /// stored as two's complement. Returns `None` outside that range.
    pub fn from_signed(width: Width, value: i64) -> Option<Self> {
        let bits = width.bits();
        let min = -(1i64 << (bits - 1));
        let max = (1i64 << bits) - 1;
        if value < min || value > max {
            return None;
        }
        let raw = (value as u64 & width.max_unsigned() as u64) as u32;
        Some(RegisterValue { width, raw })
    }

    pub fn width(&self) -> Width {
        self.width
    }

    /// The raw unsigned value.
    pub fn raw(&self) -> u32 {
        self.raw
    }

    /// Interpret the value as a two's complement signed integer.
    pub fn to_signed(&self) -> i64 {
        let bits = self.width.bits();
        let sign_bit = 1u64 << (bits - 1);
        let raw = self.raw as u64;
        if raw & sign_bit != 0 {
            raw as i64 - (1i64 << bits)
        } else {
            raw as i64
        }
    }

    /// Encode as little-endian bytes of the value's width.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.raw.to_le_bytes()[..self.width.bytes()].to_vec()
    }

    /// Decode little-endian bytes. The slice length must equal the width.
    pub fn from_le_bytes(width: Width, bytes: &[u8]) -> Result<Self> {
        if bytes.len() != width.bytes() {
            return Err(Error::Protocol(format!(
                "expected {} data bytes, got {}",
                width.bytes(),
                bytes.len()
            )));
        }
        let raw = bytes
            .iter()
            .rev()
            .fold(0u32, |acc, &b| (acc << 8) | b as u32);
        Ok(RegisterValue { width, raw })
    }
}

impl fmt::Display for RegisterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.raw, f)
    }
}

/// Wire protocol revision spoken on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    V1,
    V2,
}

impl ProtocolVersion {
    /// Map a decimal version number (as found in configuration tables).
    pub fn from_decimal(version: f64) -> Result<Self> {
        if version == 1.0 {
            Ok(ProtocolVersion::V1)
        } else if version == 2.0 {
            Ok(ProtocolVersion::V2)
        } else {
            Err(Error::InvalidParameter(format!(
                "unknown protocol version: {version}"
            )))
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolVersion::V1 => write!(f, "1.0"),
            ProtocolVersion::V2 => write!(f, "2.0"),
        }
    }
}

impl FromStr for ProtocolVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let version: f64 = s
            .trim()
            .parse()
            .map_err(|_| Error::InvalidParameter(format!("invalid protocol version: {s}")))?;
        ProtocolVersion::from_decimal(version)
    }
}
