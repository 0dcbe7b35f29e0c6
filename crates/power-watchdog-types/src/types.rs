//! Core measurement and device types for Power Watchdog units.

use core::fmt;

use bytes::{Buf, BufMut};
use time::{Duration, OffsetDateTime};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{ParseError, ParseResult};
use crate::protocol::LINE_BLOCK_SIZE;

/// Divisor for voltage, current, power and energy fields.
const FIXED_POINT_SCALE: f64 = 10_000.0;

/// Divisor for the frequency field.
const FREQUENCY_SCALE: f64 = 100.0;

/// Instantaneous state of one AC line.
///
/// Values are scaled from the device's fixed-point integers and are not
/// rounded; display rounding is left to the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LineMeasurement {
    /// Input voltage in volts.
    pub input_voltage: f64,
    /// Current in amperes.
    pub current: f64,
    /// Active power in watts.
    pub power: f64,
    /// Cumulative energy in kWh.
    pub energy: f64,
    /// Output voltage in volts.
    pub output_voltage: f64,
    /// Line frequency in hertz.
    pub frequency: f64,
    /// Device-defined error code (0-9).
    pub error_code: u8,
    /// Device status byte.
    pub status: u8,
    /// Whether the unit is boosting the output voltage.
    pub boost: bool,
}

impl LineMeasurement {
    /// Decode one 34-byte line block starting at `offset` within `data`.
    ///
    /// Layout (big-endian `i32` unless noted):
    ///
    /// | Bytes | Field |
    /// |-------|-------|
    /// | 0-3 | input voltage / 10000 |
    /// | 4-7 | current / 10000 |
    /// | 8-11 | power / 10000 |
    /// | 12-15 | energy / 10000 |
    /// | 16-19 | unused |
    /// | 20-23 | output voltage / 10000 |
    /// | 24, 25 | unused (backlight, neutral detection) |
    /// | 26 | boost flag (u8, nonzero = boosting) |
    /// | 27 | unused (temperature) |
    /// | 28-31 | frequency / 100 |
    /// | 32 | error code (u8) |
    /// | 33 | status (u8) |
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::InsufficientBytes`] if fewer than 34 bytes are
    /// available after `offset`.
    #[must_use = "parsing returns a Result that should be handled"]
    pub fn from_bytes(data: &[u8], offset: usize) -> ParseResult<Self> {
        let needed = offset.saturating_add(LINE_BLOCK_SIZE);
        if data.len() < needed {
            return Err(ParseError::InsufficientBytes {
                expected: needed,
                actual: data.len(),
            });
        }

        let mut buf = &data[offset..needed];
        let input_voltage = f64::from(buf.get_i32()) / FIXED_POINT_SCALE;
        let current = f64::from(buf.get_i32()) / FIXED_POINT_SCALE;
        let power = f64::from(buf.get_i32()) / FIXED_POINT_SCALE;
        let energy = f64::from(buf.get_i32()) / FIXED_POINT_SCALE;
        buf.advance(4);
        let output_voltage = f64::from(buf.get_i32()) / FIXED_POINT_SCALE;
        buf.advance(2);
        let boost = buf.get_u8() != 0;
        buf.advance(1);
        let frequency = f64::from(buf.get_i32()) / FREQUENCY_SCALE;
        let error_code = buf.get_u8();
        let status = buf.get_u8();

        Ok(Self {
            input_voltage,
            current,
            power,
            energy,
            output_voltage,
            frequency,
            error_code,
            status,
            boost,
        })
    }

    /// Encode this measurement back into a 34-byte line block.
    ///
    /// Values are rounded to the nearest fixed-point step. Unused bytes are
    /// zero.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; LINE_BLOCK_SIZE] {
        let mut out = Vec::with_capacity(LINE_BLOCK_SIZE);
        out.put_i32(to_fixed(self.input_voltage, FIXED_POINT_SCALE));
        out.put_i32(to_fixed(self.current, FIXED_POINT_SCALE));
        out.put_i32(to_fixed(self.power, FIXED_POINT_SCALE));
        out.put_i32(to_fixed(self.energy, FIXED_POINT_SCALE));
        out.put_i32(0);
        out.put_i32(to_fixed(self.output_voltage, FIXED_POINT_SCALE));
        out.put_u8(0);
        out.put_u8(0);
        out.put_u8(u8::from(self.boost));
        out.put_u8(0);
        out.put_i32(to_fixed(self.frequency, FREQUENCY_SCALE));
        out.put_u8(self.error_code);
        out.put_u8(self.status);

        let mut block = [0u8; LINE_BLOCK_SIZE];
        block.copy_from_slice(&out);
        block
    }
}

fn to_fixed(value: f64, scale: f64) -> i32 {
    // `as` saturates on overflow and maps NaN to 0.
    (value * scale).round() as i32
}

/// Decoded body of a DLReport packet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DlReport {
    /// A 34-byte body from a single-line (30A) unit.
    Single(LineMeasurement),
    /// A 68-byte body from a dual-line (50A) unit.
    Dual(LineMeasurement, LineMeasurement),
}

impl DlReport {
    /// Decode a DLReport body, choosing the topology from its length.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::UnexpectedBodyLength`] for any length other
    /// than 34 or 68.
    #[must_use = "parsing returns a Result that should be handled"]
    pub fn from_body(body: &[u8]) -> ParseResult<Self> {
        match body.len() {
            LINE_BLOCK_SIZE => Ok(DlReport::Single(LineMeasurement::from_bytes(body, 0)?)),
            len if len == 2 * LINE_BLOCK_SIZE => Ok(DlReport::Dual(
                LineMeasurement::from_bytes(body, 0)?,
                LineMeasurement::from_bytes(body, LINE_BLOCK_SIZE)?,
            )),
            other => Err(ParseError::UnexpectedBodyLength(other)),
        }
    }

    /// Line 1 of the report.
    #[must_use]
    pub fn line1(&self) -> &LineMeasurement {
        match self {
            DlReport::Single(line) | DlReport::Dual(line, _) => line,
        }
    }

    /// Line 2 of the report, if the unit is dual-line.
    #[must_use]
    pub fn line2(&self) -> Option<&LineMeasurement> {
        match self {
            DlReport::Single(_) => None,
            DlReport::Dual(_, line) => Some(line),
        }
    }

    /// Re-encode the report as a DLReport body.
    #[must_use]
    pub fn to_body(&self) -> Vec<u8> {
        let mut body = self.line1().to_bytes().to_vec();
        if let Some(line2) = self.line2() {
            body.extend_from_slice(&line2.to_bytes());
        }
        body
    }
}

/// Most recent decoded state of a device.
///
/// `updated_at == None` means no report has ever been decoded; consumers
/// should treat that as "not ready" rather than as a device reporting zero.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct WatchdogSnapshot {
    /// Line 1 measurement.
    pub line1: LineMeasurement,
    /// Line 2 measurement. Only meaningful when `has_line2` is set.
    pub line2: LineMeasurement,
    /// Whether the last report carried a second line.
    pub has_line2: bool,
    /// When the last report was decoded.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub updated_at: Option<OffsetDateTime>,
    /// Hex of the packet that produced this snapshot.
    pub raw_hex: String,
}

impl WatchdogSnapshot {
    /// Apply a decoded report.
    ///
    /// A single-line report clears `has_line2` but leaves the previous
    /// line 2 values in place.
    pub fn apply(&mut self, report: &DlReport, raw: &[u8], at: OffsetDateTime) {
        self.line1 = *report.line1();
        match report.line2() {
            Some(line2) => {
                self.line2 = *line2;
                self.has_line2 = true;
            }
            None => self.has_line2 = false,
        }
        self.updated_at = Some(at);
        self.raw_hex = hex::encode(raw);
    }

    /// Whether at least one report has been decoded.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.updated_at.is_some()
    }

    /// Number of lines the last report carried (0 if not ready).
    #[must_use]
    pub fn line_count(&self) -> usize {
        match (self.is_ready(), self.has_line2) {
            (false, _) => 0,
            (true, false) => 1,
            (true, true) => 2,
        }
    }

    /// Iterate over the lines present in the last report.
    pub fn lines(&self) -> impl Iterator<Item = &LineMeasurement> {
        [&self.line1, &self.line2]
            .into_iter()
            .take(self.line_count())
    }

    /// Time elapsed since the last decode, or `None` if not ready.
    #[must_use]
    pub fn age(&self, now: OffsetDateTime) -> Option<Duration> {
        self.updated_at.map(|at| now - at)
    }
}

/// Hardware generation inferred from the advertisement name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum Generation {
    /// `PM...` names.
    Gen1 = 1,
    /// `WD_...` names.
    Gen2 = 2,
}

impl Generation {
    /// Generation number (1 or 2).
    #[must_use]
    pub fn number(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen{}", self.number())
    }
}

/// Number of AC lines a unit reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum LineTopology {
    /// 30A single line.
    Single,
    /// 50A dual line (L1 + L2).
    Double,
    /// Not derivable from the name.
    Unknown,
}

impl LineTopology {
    /// Lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            LineTopology::Single => "single",
            LineTopology::Double => "double",
            LineTopology::Unknown => "unknown",
        }
    }
}

impl fmt::Display for LineTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a device derived from its advertisement name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DiscoveredDevice {
    /// BLE address. Empty until filled in by the scanner.
    pub address: String,
    /// Advertisement name the device was classified from.
    pub name: String,
    /// Hardware generation.
    pub generation: Generation,
    /// Device type code (`E7`, `PMD`, ...).
    pub device_type: String,
    /// Line topology.
    pub topology: LineTopology,
}

impl DiscoveredDevice {
    /// Set the BLE address.
    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }
}
