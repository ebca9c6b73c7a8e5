//! Session metadata stored at the tail of a finalized log file.
//!
//! When a capture stops, the channel table and the value width are appended
//! after the sample data as UTF-8 text, followed by the byte offset where that
//! text begins:
//!
//! ```text
//! | records ... | pin\t0\tstart\tinput\n ... bits\t8\n | data_end: u64 LE |
//! ```
//!
//! The trailing block is optional. It counts as present only if the final
//! 8 bytes point inside the file, the text between that offset and the pointer
//! parses, and the data length is a whole number of records. Otherwise the
//! whole file is sample data, and the channel table can be inferred from the
//! records with [`infer_channels`].

use crate::data::sample::{LogSample, SampleValue, ValueWidth};
use crate::error::{AppResult, ScopeError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, warn};

/// Upper bound on the size of a metadata block; larger blocks are not metadata.
const MAX_METADATA_LEN: u64 = 64 * 1024;

/// Records inspected when inferring channels from an unfinalized log.
const INFERENCE_PROBE: usize = i8::MAX as usize + 1;

/// Function assigned to a device pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PinType {
    /// Unused
    #[default]
    None,
    /// Digital output
    Output,
    /// Digital input
    Input,
    /// Digital input with pull-up
    Pullup,
    /// PWM output
    Pwm,
    /// Analog input
    Adc,
}

impl PinType {
    const ALL: [PinType; 6] = [
        PinType::None,
        PinType::Output,
        PinType::Input,
        PinType::Pullup,
        PinType::Pwm,
        PinType::Adc,
    ];

    /// Name used in metadata and configuration.
    pub fn as_str(self) -> &'static str {
        match self {
            PinType::None => "none",
            PinType::Output => "output",
            PinType::Input => "input",
            PinType::Pullup => "pullup",
            PinType::Pwm => "pwm",
            PinType::Adc => "adc",
        }
    }
}

impl fmt::Display for PinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PinType {
    type Err = ScopeError;

    /// Accepts the type name or its numeric code.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(code) = s.parse::<usize>() {
            return PinType::ALL
                .get(code)
                .copied()
                .ok_or_else(|| ScopeError::InvalidMetadata(format!("unknown pin type code {code}")));
        }
        PinType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ScopeError::InvalidMetadata(format!("unknown pin type '{s}'")))
    }
}

/// One channel of the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinDefinition {
    /// Channel index as used in records
    pub index: usize,
    /// Display name
    pub name: String,
    /// Pin function
    #[serde(rename = "type", default)]
    pub pin_type: PinType,
}

impl PinDefinition {
    /// Creates a pin definition.
    pub fn new(index: usize, name: impl Into<String>, pin_type: PinType) -> Self {
        Self {
            index,
            name: name.into(),
            pin_type,
        }
    }
}

/// Channel table and value width of one capture session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMetadata {
    /// Channel definitions, ordered by index
    pub pins: Vec<PinDefinition>,
    /// Value width of every record in the log
    pub width: ValueWidth,
}

impl SessionMetadata {
    /// Creates metadata; pins are sorted by index.
    pub fn new(mut pins: Vec<PinDefinition>, width: ValueWidth) -> Self {
        pins.sort_by_key(|p| p.index);
        Self { pins, width }
    }

    /// Number of channel slots (highest index + 1).
    pub fn channel_count(&self) -> usize {
        self.pins.iter().map(|p| p.index + 1).max().unwrap_or(0)
    }

    /// Definition of channel `index`, if any.
    pub fn pin(&self, index: usize) -> Option<&PinDefinition> {
        self.pins.iter().find(|p| p.index == index)
    }

    /// Renders the text part of the metadata block.
    pub fn to_text(&self) -> String {
        let mut text = String::new();
        for pin in &self.pins {
            text.push_str(&format!(
                "pin\t{}\t{}\t{}\n",
                pin.index,
                pin.name,
                pin.pin_type.as_str()
            ));
        }
        text.push_str(&format!("bits\t{}\n", self.width.bits()));
        text
    }

    /// Parses the text part of a metadata block.
    pub fn parse(text: &str) -> AppResult<Self> {
        let mut pins = Vec::new();
        let mut width = None;

        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let fields: Vec<&str> = line.split('\t').collect();
            match fields.as_slice() {
                ["pin", index, name, rest @ ..] => {
                    let index = index.trim().parse::<usize>().map_err(|_| {
                        ScopeError::InvalidMetadata(format!("bad pin index in '{line}'"))
                    })?;
                    let pin_type = match rest.first() {
                        Some(t) => t.parse()?,
                        None => PinType::None,
                    };
                    pins.push(PinDefinition::new(index, *name, pin_type));
                }
                ["bits", bits] => {
                    let bits = bits.trim().parse::<u32>().map_err(|_| {
                        ScopeError::InvalidMetadata(format!("bad bit width in '{line}'"))
                    })?;
                    width = Some(ValueWidth::from_bits(bits)?);
                }
                _ => {
                    return Err(ScopeError::InvalidMetadata(format!(
                        "unrecognised line '{line}'"
                    )))
                }
            }
        }

        let width =
            width.ok_or_else(|| ScopeError::InvalidMetadata("missing bits line".to_string()))?;
        Ok(Self::new(pins, width))
    }

    /// Appends the metadata block to the end of `file`. Returns the data end offset.
    pub fn append_to(&self, file: &mut File) -> AppResult<u64> {
        let data_end = file.seek(SeekFrom::End(0))?;
        let mut block = self.to_text().into_bytes();
        block.extend_from_slice(&data_end.to_le_bytes());
        file.write_all(&block)?;
        file.flush()?;
        debug!(data_end, pins = self.pins.len(), "metadata block appended");
        Ok(data_end)
    }

    /// Reads the trailing metadata block of the log at `path`.
    ///
    /// Returns the metadata and the byte offset where sample data ends, or `None`
    /// if the file carries no valid block. Only failures to read the file are errors.
    pub fn read_from<P: AsRef<Path>>(path: P) -> AppResult<Option<(Self, u64)>> {
        let mut file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        if len < 8 {
            return Ok(None);
        }

        let pointer_at = len - 8;
        file.seek(SeekFrom::Start(pointer_at))?;
        let mut pointer = [0u8; 8];
        file.read_exact(&mut pointer)?;
        let data_end = u64::from_le_bytes(pointer);

        if data_end > pointer_at || pointer_at - data_end > MAX_METADATA_LEN {
            return Ok(None);
        }

        file.seek(SeekFrom::Start(data_end))?;
        let mut raw = vec![0u8; (pointer_at - data_end) as usize];
        file.read_exact(&mut raw)?;

        let Ok(text) = String::from_utf8(raw) else {
            debug!(path = %path.as_ref().display(), "trailing block is not text");
            return Ok(None);
        };
        let metadata = match Self::parse(&text) {
            Ok(metadata) => metadata,
            Err(e) => {
                debug!(path = %path.as_ref().display(), error = %e, "no metadata block");
                return Ok(None);
            }
        };

        if data_end % metadata.width.log_record_size() as u64 != 0 {
            warn!(
                path = %path.as_ref().display(),
                data_end,
                "metadata ignored: data length is not a whole number of records"
            );
            return Ok(None);
        }

        Ok(Some((metadata, data_end)))
    }
}

/// Infers the channel table of a log without metadata.
///
/// The device opens a session by reporting each channel in order, so the
/// leading records whose channel equals their position name the channels
/// `1..=n`.
pub fn infer_channels<T: SampleValue, P: AsRef<Path>>(path: P) -> AppResult<Vec<PinDefinition>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut buf = vec![0u8; LogSample::<T>::SIZE];
    let mut pins = Vec::new();

    for i in 0..INFERENCE_PROBE {
        if reader.read_exact(&mut buf).is_err() {
            break;
        }
        let Some(sample) = LogSample::<T>::decode(&buf) else {
            break;
        };
        if sample.channel < 0 || sample.channel as usize != i {
            break;
        }
        pins.push(PinDefinition::new(i, (i + 1).to_string(), PinType::None));
    }
    Ok(pins)
}

/// What is known about a log file before reading its samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogInfo {
    /// Channel table and value width
    pub metadata: SessionMetadata,
    /// Byte offset where sample data ends, for finalized logs
    pub data_end: Option<u64>,
    /// True if the channel table was inferred rather than read
    pub inferred: bool,
}

impl LogInfo {
    /// Reads the metadata of `path`, falling back to inference with `fallback_width`.
    pub fn inspect<P: AsRef<Path>>(path: P, fallback_width: ValueWidth) -> AppResult<Self> {
        if let Some((metadata, data_end)) = SessionMetadata::read_from(path.as_ref())? {
            return Ok(Self {
                metadata,
                data_end: Some(data_end),
                inferred: false,
            });
        }

        let pins = match fallback_width {
            ValueWidth::Bits8 => infer_channels::<u8, _>(path.as_ref())?,
            ValueWidth::Bits16 => infer_channels::<u16, _>(path.as_ref())?,
        };
        debug!(channels = pins.len(), "channels inferred from leading records");
        Ok(Self {
            metadata: SessionMetadata::new(pins, fallback_width),
            data_end: None,
            inferred: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn sample_metadata() -> SessionMetadata {
        SessionMetadata::new(
            vec![
                PinDefinition::new(1, "led", PinType::Output),
                PinDefinition::new(0, "button", PinType::Pullup),
                PinDefinition::new(2, "light", PinType::Adc),
            ],
            ValueWidth::Bits16,
        )
    }

    #[test]
    fn test_text_format() {
        let text = sample_metadata().to_text();
        assert_eq!(
            text,
            "pin\t0\tbutton\tpullup\npin\t1\tled\toutput\npin\t2\tlight\tadc\nbits\t16\n"
        );
    }

    #[test]
    fn test_parse_accepts_numeric_types() {
        let parsed = SessionMetadata::parse("pin\t0\ta\t2\npin\t3\tb\t5\nbits\t8\n").unwrap();
        assert_eq!(parsed.pins[0].pin_type, PinType::Input);
        assert_eq!(parsed.pins[1].pin_type, PinType::Adc);
        assert_eq!(parsed.width, ValueWidth::Bits8);
        assert_eq!(parsed.channel_count(), 4);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(SessionMetadata::parse("pin\t0\ta\tinput\n").is_err());
        assert!(SessionMetadata::parse("bits\t12\n").is_err());
        assert!(SessionMetadata::parse("hello\n").is_err());
        assert!(SessionMetadata::parse("pin\tx\ta\tinput\nbits\t8\n").is_err());
    }

    #[test]
    fn test_append_and_read_back() {
        let mut tmp = NamedTempFile::new().unwrap();
        for i in 0..5u64 {
            tmp.write_all(&LogSample::<u16>::new(0, 1, i).to_bytes())
                .unwrap();
        }
        let metadata = sample_metadata();
        let data_end = metadata.append_to(tmp.as_file_mut()).unwrap();
        assert_eq!(data_end, 5 * LogSample::<u16>::SIZE as u64);

        let (read, end) = SessionMetadata::read_from(tmp.path()).unwrap().unwrap();
        assert_eq!(read, metadata);
        assert_eq!(end, data_end);
    }

    #[test]
    fn test_plain_log_has_no_metadata() {
        let mut tmp = NamedTempFile::new().unwrap();
        for i in 0..4u64 {
            tmp.write_all(&LogSample::<u8>::new(i as i8, 0, 1_700_000_000_000 + i).to_bytes())
                .unwrap();
        }
        assert!(SessionMetadata::read_from(tmp.path()).unwrap().is_none());

        let info = LogInfo::inspect(tmp.path(), ValueWidth::Bits8).unwrap();
        assert!(info.inferred);
        assert_eq!(info.data_end, None);
        let names: Vec<&str> = info.metadata.pins.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["1", "2", "3", "4"]);
    }

    #[test]
    fn test_tiny_file() {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(&[1, 2, 3]).unwrap();
        assert!(SessionMetadata::read_from(tmp.path()).unwrap().is_none());
    }
}
