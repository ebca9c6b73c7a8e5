//! Fixed-size binary sample records.
//!
//! Two layouts exist, both packed little-endian with 1-byte alignment:
//!
//! ```text
//! wire:  | channel: i8 | value: u8/u16 | tick: u32      |   6 / 7 bytes
//! log:   | channel: i8 | value: u8/u16 | timestamp: u64 |  10 / 11 bytes
//! ```
//!
//! The value width is picked once per capture session and carried through the
//! whole pipeline as the type parameter `T: SampleValue`.
//!
//! Negative channels are reserved. On the wire, channel `-1` carries control
//! codes (`0xFE` tick/sync, `0xFF` end of stream). In the log, a negative channel
//! `!i` marks a synthetic tick broadcast of channel `i`'s last known value.

use crate::error::{AppResult, ScopeError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire channel carrying control codes.
pub const CONTROL_CHANNEL: i8 = -1;
/// Control value: periodic tick; also the mandatory first record of a stream.
pub const TICK_CODE: u16 = 0xFE;
/// Control value: end of scope mode.
pub const END_CODE: u16 = 0xFF;

/// Sample value width of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueWidth {
    /// 8-bit values (digital pins, 8-bit ADC)
    Bits8,
    /// 16-bit values
    Bits16,
}

impl ValueWidth {
    /// Parses a bit count as found in configuration and metadata.
    pub fn from_bits(bits: u32) -> AppResult<Self> {
        match bits {
            8 => Ok(ValueWidth::Bits8),
            16 => Ok(ValueWidth::Bits16),
            other => Err(ScopeError::UnsupportedBits(other)),
        }
    }

    /// Number of value bits.
    pub fn bits(self) -> u32 {
        match self {
            ValueWidth::Bits8 => 8,
            ValueWidth::Bits16 => 16,
        }
    }

    /// Size in bytes of one value.
    pub fn value_size(self) -> usize {
        (self.bits() / 8) as usize
    }

    /// Size in bytes of one wire record.
    pub fn wire_record_size(self) -> usize {
        1 + self.value_size() + 4
    }

    /// Size in bytes of one log record.
    pub fn log_record_size(self) -> usize {
        1 + self.value_size() + 8
    }
}

impl fmt::Display for ValueWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-bit", self.bits())
    }
}

/// Integer type usable as a sample value.
///
/// Implemented for `u8` and `u16`. Callers of [`SampleValue::read_le`] and
/// [`SampleValue::write_le`] guarantee slices of at least [`SampleValue::SIZE`] bytes.
pub trait SampleValue:
    Copy + Default + PartialEq + Eq + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    /// Width tag of this type.
    const WIDTH: ValueWidth;
    /// Encoded size in bytes.
    const SIZE: usize;

    /// Decodes a little-endian value from the start of `bytes`.
    fn read_le(bytes: &[u8]) -> Self;

    /// Encodes the value little-endian into the start of `out`.
    fn write_le(self, out: &mut [u8]);

    /// Widens the value for comparisons against control codes.
    fn to_u16(self) -> u16;

    /// Non-zero values count as "high" for edge triggering.
    fn is_high(self) -> bool {
        self.to_u16() != 0
    }
}

impl SampleValue for u8 {
    const WIDTH: ValueWidth = ValueWidth::Bits8;
    const SIZE: usize = 1;

    fn read_le(bytes: &[u8]) -> Self {
        bytes[0]
    }

    fn write_le(self, out: &mut [u8]) {
        out[0] = self;
    }

    fn to_u16(self) -> u16 {
        u16::from(self)
    }
}

impl SampleValue for u16 {
    const WIDTH: ValueWidth = ValueWidth::Bits16;
    const SIZE: usize = 2;

    fn read_le(bytes: &[u8]) -> Self {
        u16::from_le_bytes([bytes[0], bytes[1]])
    }

    fn write_le(self, out: &mut [u8]) {
        out[..2].copy_from_slice(&self.to_le_bytes());
    }

    fn to_u16(self) -> u16 {
        self
    }
}

/// Control codes recognised on negative wire channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCode {
    /// Periodic tick (and initial sync)
    Tick,
    /// End of stream
    End,
}

/// A record as sent by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireSample<T: SampleValue> {
    /// Channel index; negative means control record.
    pub channel: i8,
    /// Channel value or control code.
    pub value: T,
    /// Free-running device tick counter.
    pub tick: u32,
}

impl<T: SampleValue> WireSample<T> {
    /// Encoded size in bytes.
    pub const SIZE: usize = 1 + T::SIZE + 4;

    /// Creates a wire record.
    pub fn new(channel: i8, value: T, tick: u32) -> Self {
        Self {
            channel,
            value,
            tick,
        }
    }

    /// Decodes one record from the start of `bytes`, or `None` if it is too short.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        let channel = bytes[0] as i8;
        let value = T::read_le(&bytes[1..]);
        let tick_at = 1 + T::SIZE;
        let tick = u32::from_le_bytes([
            bytes[tick_at],
            bytes[tick_at + 1],
            bytes[tick_at + 2],
            bytes[tick_at + 3],
        ]);
        Some(Self {
            channel,
            value,
            tick,
        })
    }

    /// Encodes the record into the start of `out` (at least `SIZE` bytes).
    pub fn encode_into(&self, out: &mut [u8]) {
        out[0] = self.channel as u8;
        self.value.write_le(&mut out[1..]);
        let tick_at = 1 + T::SIZE;
        out[tick_at..tick_at + 4].copy_from_slice(&self.tick.to_le_bytes());
    }

    /// Encodes the record into a new buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; Self::SIZE];
        self.encode_into(&mut out);
        out
    }

    /// Control code carried by this record, if it is a control record.
    pub fn control_code(&self) -> Option<ControlCode> {
        if self.channel >= 0 {
            return None;
        }
        match self.value.to_u16() {
            TICK_CODE => Some(ControlCode::Tick),
            END_CODE => Some(ControlCode::End),
            _ => None,
        }
    }

    /// True for the record that must open every stream.
    pub fn is_sync(&self) -> bool {
        self.channel == CONTROL_CHANNEL && self.value.to_u16() == TICK_CODE
    }
}

/// A record as stored in the log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSample<T: SampleValue> {
    /// Channel index; negative marks a synthetic tick record (`!channel`).
    pub channel: i8,
    /// Channel value.
    pub value: T,
    /// Absolute time in 100 ns units since the Unix epoch.
    pub timestamp: u64,
}

impl<T: SampleValue> LogSample<T> {
    /// Encoded size in bytes.
    pub const SIZE: usize = 1 + T::SIZE + 8;

    /// Creates a log record for a real channel edge.
    pub fn new(channel: i8, value: T, timestamp: u64) -> Self {
        Self {
            channel,
            value,
            timestamp,
        }
    }

    /// Creates a synthetic tick record repeating the value of `channel`.
    pub fn tick(channel: usize, value: T, timestamp: u64) -> Self {
        Self {
            channel: !(channel as i8),
            value,
            timestamp,
        }
    }

    /// True for synthetic tick records.
    pub fn is_tick(&self) -> bool {
        self.channel < 0
    }

    /// The channel this record describes, with tick tagging removed.
    pub fn source_channel(&self) -> usize {
        if self.channel < 0 {
            (!self.channel) as usize
        } else {
            self.channel as usize
        }
    }

    /// Decodes one record from the start of `bytes`, or `None` if it is too short.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        let channel = bytes[0] as i8;
        let value = T::read_le(&bytes[1..]);
        let ts_at = 1 + T::SIZE;
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&bytes[ts_at..ts_at + 8]);
        Some(Self {
            channel,
            value,
            timestamp: u64::from_le_bytes(ts),
        })
    }

    /// Encodes the record into the start of `out` (at least `SIZE` bytes).
    pub fn encode_into(&self, out: &mut [u8]) {
        out[0] = self.channel as u8;
        self.value.write_le(&mut out[1..]);
        let ts_at = 1 + T::SIZE;
        out[ts_at..ts_at + 8].copy_from_slice(&self.timestamp.to_le_bytes());
    }

    /// Encodes the record into a new buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; Self::SIZE];
        self.encode_into(&mut out);
        out
    }
}
