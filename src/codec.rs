//! Register payload decoding.
//!
//! The MCP39F501 returns register contents least-significant byte first. The
//! telemetry block read from 0x0004 is 28 bytes long:
//!
//! | offset | field              | type |
//! |--------|--------------------|------|
//! | 0      | current RMS        | u32  |
//! | 4      | voltage RMS        | u16  |
//! | 6      | active power       | u32  |
//! | 10     | reactive power     | i32  |
//! | 14     | apparent power     | u32  |
//! | 18     | power factor       | i16  |
//! | 20     | line frequency     | u16  |
//! | 22     | thermistor voltage | u16  |
//! | 24     | event flags        | u16  |
//! | 26     | system status      | u16  |

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{ExchangeError, Result};

/// Length of the telemetry block.
pub const TELEMETRY_LEN: usize = 28;

/// Version string reported before the device has been queried.
pub const UNKNOWN_VERSION: &str = "0000-00-00";

/// Bit offset of the digital inputs in the system status register.
const DIGITAL_INPUT_SHIFT: u16 = 3;

pub fn le_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

pub fn le_i16(bytes: &[u8], offset: usize) -> i16 {
    le_u16(bytes, offset) as i16
}

pub fn le_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

pub fn le_i32(bytes: &[u8], offset: usize) -> i32 {
    le_u32(bytes, offset) as i32
}

/// Check that a payload has exactly the length the caller asked for.
pub fn expect_len(payload: &[u8], expected: usize) -> Result<()> {
    if payload.len() < expected {
        return Err(ExchangeError::TooShort {
            expected,
            received: payload.len(),
        }
        .into());
    }
    if payload.len() > expected {
        return Err(ExchangeError::TooLong {
            expected,
            received: payload.len(),
        }
        .into());
    }
    Ok(())
}

// ============================================================================
// Telemetry
// ============================================================================

/// Decoded electrical measurements and status bits.
///
/// Values are raw register units; scaling depends on the calibration of the
/// board the sensor is fitted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Telemetry {
    pub current_rms: u32,
    pub voltage_rms: u16,
    pub active_power: u32,
    pub reactive_power: i32,
    pub apparent_power: u32,
    /// Signed, full scale 0x7FFF = 1.0.
    pub power_factor: i16,
    pub line_frequency: u16,
    pub thermistor_voltage: u16,
    pub event_flags: EventFlags,
    pub system_status: u16,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self {
            current_rms: 0,
            voltage_rms: 0,
            active_power: 0,
            reactive_power: 0,
            apparent_power: 0,
            power_factor: i16::MAX,
            line_frequency: 0,
            thermistor_voltage: 0,
            event_flags: EventFlags::empty(),
            system_status: 0,
        }
    }
}

impl Telemetry {
    /// Decode the 28-byte block read from 0x0004.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        expect_len(payload, TELEMETRY_LEN)?;
        Ok(Self {
            current_rms: le_u32(payload, 0),
            voltage_rms: le_u16(payload, 4),
            active_power: le_u32(payload, 6),
            reactive_power: le_i32(payload, 10),
            apparent_power: le_u32(payload, 14),
            power_factor: le_i16(payload, 18),
            line_frequency: le_u16(payload, 20),
            thermistor_voltage: le_u16(payload, 22),
            event_flags: EventFlags::from_bits(le_u16(payload, 24)),
            system_status: le_u16(payload, 26),
        })
    }

    /// State of digital input `port` (taken modulo 4).
    pub fn digital_input(&self, port: u8) -> bool {
        let port = port % 4;
        (self.system_status >> DIGITAL_INPUT_SHIFT) & (1 << port) != 0
    }

    /// Power factor as a ratio in roughly -1.0..=1.0.
    pub fn power_factor_ratio(&self) -> f32 {
        self.power_factor as f32 / i16::MAX as f32
    }
}

// ============================================================================
// Events
// ============================================================================

/// Event bits shared by the flag, enable, test, clear and mask registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventFlags(u16);

impl EventFlags {
    pub const OVER_CURRENT: Self = Self(0x8000);
    pub const OVER_VOLTAGE: Self = Self(0x4000);
    pub const OVER_POWER: Self = Self(0x2000);
    pub const UNDER_VOLTAGE: Self = Self(0x1000);
    pub const OVER_FREQUENCY: Self = Self(0x0800);
    pub const UNDER_FREQUENCY: Self = Self(0x0400);
    pub const OVER_TEMPERATURE: Self = Self(0x0200);
    pub const UNDER_TEMPERATURE: Self = Self(0x0100);
    pub const VOLTAGE_SAG: Self = Self(0x0080);
    pub const VOLTAGE_SURGE: Self = Self(0x0040);

    const NAMES: [(EventFlags, &'static str); 10] = [
        (Self::OVER_CURRENT, "OC"),
        (Self::OVER_VOLTAGE, "OV"),
        (Self::OVER_POWER, "OP"),
        (Self::UNDER_VOLTAGE, "UV"),
        (Self::OVER_FREQUENCY, "OF"),
        (Self::UNDER_FREQUENCY, "UF"),
        (Self::OVER_TEMPERATURE, "OT"),
        (Self::UNDER_TEMPERATURE, "UT"),
        (Self::VOLTAGE_SAG, "VSA"),
        (Self::VOLTAGE_SURGE, "VSU"),
    ];

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for EventFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for EventFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("-")?;
        }
        Ok(())
    }
}

// ============================================================================
// Digital I/O configuration
// ============================================================================

/// Pin mode codes for the four DIO pins (3 bits each, register 0x0046).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DioConfig {
    pub dio0: u8,
    pub dio1: u8,
    pub dio2: u8,
    pub dio3: u8,
}

impl DioConfig {
    pub fn new(dio0: u8, dio1: u8, dio2: u8, dio3: u8) -> Self {
        Self {
            dio0,
            dio1,
            dio2,
            dio3,
        }
    }

    /// Packed register value; out-of-range modes are masked to 3 bits.
    pub fn to_register(self) -> u16 {
        let m = |v: u8| (v & 0x07) as u16;
        m(self.dio3) << 9 | m(self.dio2) << 6 | m(self.dio1) << 3 | m(self.dio0)
    }
}

// ============================================================================
// Firmware version
// ============================================================================

/// Render the two-byte version register as `YYYY-MM-DD`.
///
/// The high nibble of the first byte is the year after 2000, its low nibble
/// the month, and the second byte the day in BCD.
pub fn decode_version(payload: &[u8]) -> Result<String> {
    expect_len(payload, 2)?;
    let mut text = *b"0000-00-00";
    text[0] = b'2';
    nibble_field(&mut text[2..4], payload[0] >> 4);
    nibble_field(&mut text[5..7], payload[0] & 0x0F);
    text[8] = bcd_digit(payload[1] >> 4);
    text[9] = bcd_digit(payload[1] & 0x0F);
    // every byte written above is ASCII
    Ok(text.iter().map(|&b| b as char).collect())
}

/// Two-digit decimal field from a single nibble (0..=15).
fn nibble_field(out: &mut [u8], nibble: u8) {
    if nibble > 9 {
        out[0] = b'1';
    }
    out[1] = b'0' + nibble % 10;
}

fn bcd_digit(nibble: u8) -> u8 {
    b"0123456789ABCDEF"[(nibble & 0x0F) as usize]
}
