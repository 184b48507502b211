//! Diffusion strength (b-value) decoding and the sub-series keys built
//! from it.

use std::cmp::Ordering;
use std::fmt;

use dicom::core::Tag;

/// Vendors prefix masked b-values with 10^9 (`1000000800` means 800).
const VENDOR_MASK: u64 = 1_000_000_000;

/// Where a diffusion strength candidate was read from, in decode order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrengthSource {
    /// Diffusion b-value (0018,9087).
    Public,
    /// Siemens private (0019,100C).
    Siemens,
    /// GE/Philips private (0043,1039).
    GeneralElectric,
}

impl StrengthSource {
    pub const PRIORITY: [StrengthSource; 3] = [
        StrengthSource::Public,
        StrengthSource::Siemens,
        StrengthSource::GeneralElectric,
    ];

    pub fn tag(self) -> Tag {
        match self {
            StrengthSource::Public => Tag(0x0018, 0x9087),
            StrengthSource::Siemens => Tag(0x0019, 0x100C),
            StrengthSource::GeneralElectric => Tag(0x0043, 0x1039),
        }
    }
}

impl fmt::Display for StrengthSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = self.tag();
        write!(f, "({:04X},{:04X})", tag.0, tag.1)
    }
}

/// Undecoded value of a diffusion strength attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum RawStrength {
    /// Binary numeric VR values.
    Numbers(Vec<f64>),
    /// Text VR, multiple values separated by `\`.
    Text(String),
    /// Value of unknown VR (private tags read implicitly).
    Bytes(Vec<u8>),
}

impl fmt::Display for RawStrength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawStrength::Numbers(values) => {
                let parts: Vec<_> = values.iter().map(f64::to_string).collect();
                f.write_str(&parts.join("\\"))
            }
            RawStrength::Text(text) => f.write_str(text),
            RawStrength::Bytes(bytes) => write!(f, "{bytes:02x?}"),
        }
    }
}

/// How a strength value was recovered, kept for the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMethod {
    Numeric,
    MultiValue,
    DelimitedBytes,
    DoubleBytes,
    TextBytes,
}

impl RawStrength {
    pub fn decode(&self) -> Option<(u32, DecodeMethod)> {
        match self {
            RawStrength::Numbers(values) => match values.as_slice() {
                [] => None,
                [single] => to_strength(*single).map(|b| (b, DecodeMethod::Numeric)),
                [first, ..] => {
                    to_masked_strength(*first).map(|b| (b, DecodeMethod::MultiValue))
                }
            },
            RawStrength::Text(text) => decode_text(text),
            RawStrength::Bytes(bytes) => {
                if !is_numeric_text(bytes) {
                    let raw: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
                    return to_strength(f64::from_le_bytes(raw))
                        .map(|b| (b, DecodeMethod::DoubleBytes));
                }
                let text = std::str::from_utf8(bytes).ok()?;
                decode_text(text).map(|(b, method)| match method {
                    DecodeMethod::MultiValue => (b, DecodeMethod::DelimitedBytes),
                    _ => (b, DecodeMethod::TextBytes),
                })
            }
        }
    }
}

/// Numeric text as written into private tags: digits, sign, point, `\\`
/// separators, space or NUL padding, with at least one digit. Anything
/// else is read as a little-endian double.
fn is_numeric_text(bytes: &[u8]) -> bool {
    bytes.iter().any(u8::is_ascii_digit)
        && bytes
            .iter()
            .all(|b| b.is_ascii_digit() || matches!(*b, b'.' | b'-' | b'+' | b'\\' | b' ' | 0))
}

fn decode_text(text: &str) -> Option<(u32, DecodeMethod)> {
    let text = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    if text.contains('\\') {
        let first = text.split('\\').next()?.trim().parse::<f64>().ok()?;
        return to_masked_strength(first).map(|b| (b, DecodeMethod::MultiValue));
    }
    let value = text.parse::<f64>().ok()?;
    to_strength(value).map(|b| (b, DecodeMethod::Numeric))
}

fn to_strength(value: f64) -> Option<u32> {
    if !value.is_finite() || value < 0.0 || value > f64::from(u32::MAX) {
        return None;
    }
    Some(value.round() as u32)
}

fn to_masked_strength(value: f64) -> Option<u32> {
    let value = to_strength(value)?;
    Some((u64::from(value) % VENDOR_MASK) as u32)
}

/// Result of running the fallback chain on one slice.
#[derive(Debug, Clone, PartialEq)]
pub enum StrengthReading {
    Decoded {
        value: u32,
        source: StrengthSource,
        method: DecodeMethod,
    },
    /// No source decoded; `tried` lists what was present.
    Undecodable { tried: Vec<String> },
}

/// First decodable candidate in [`StrengthSource::PRIORITY`] order.
pub fn read_strength(candidates: &[(StrengthSource, RawStrength)]) -> StrengthReading {
    for source in StrengthSource::PRIORITY {
        let decoded = candidates
            .iter()
            .filter(|(s, _)| *s == source)
            .find_map(|(_, raw)| raw.decode());
        if let Some((value, method)) = decoded {
            return StrengthReading::Decoded {
                value,
                source,
                method,
            };
        }
    }
    StrengthReading::Undecodable {
        tried: candidates
            .iter()
            .map(|(source, raw)| format!("{source}={raw}"))
            .collect(),
    }
}

/// Base of a sub-series key, before disambiguation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyBase {
    /// Non-diffusion sequences have a single partition.
    NotApplicable,
    Strength(u32),
    /// Strength could not be decoded.
    Unknown,
}

/// Identity of a sub-series within its series. A non-zero `suffix` marks
/// a partition created because its base key was already taken at the same
/// spatial position by a different image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubSeriesKey {
    pub base: KeyBase,
    pub suffix: u32,
}

impl SubSeriesKey {
    pub const NOT_APPLICABLE: SubSeriesKey = SubSeriesKey {
        base: KeyBase::NotApplicable,
        suffix: 0,
    };

    pub fn strength(value: u32) -> Self {
        Self {
            base: KeyBase::Strength(value),
            suffix: 0,
        }
    }

    pub fn unknown(suffix: u32) -> Self {
        Self {
            base: KeyBase::Unknown,
            suffix,
        }
    }

    pub fn with_suffix(self, suffix: u32) -> Self {
        Self { suffix, ..self }
    }

    pub fn is_unknown(&self) -> bool {
        self.base == KeyBase::Unknown
    }

    pub fn is_suffixed(&self) -> bool {
        self.suffix > 0
    }

    pub fn strength_value(&self) -> Option<u32> {
        match self.base {
            KeyBase::Strength(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for SubSeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.base {
            KeyBase::NotApplicable => f.write_str("N/A")?,
            KeyBase::Strength(value) => write!(f, "{value}")?,
            KeyBase::Unknown => f.write_str("Unknown")?,
        }
        if self.suffix > 0 {
            write!(f, "-{}", self.suffix)?;
        }
        Ok(())
    }
}

impl PartialOrd for SubSeriesKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SubSeriesKey {
    fn cmp(&self, other: &Self) -> Ordering {
        fn rank(base: KeyBase) -> (u8, u32) {
            match base {
                KeyBase::NotApplicable => (0, 0),
                KeyBase::Strength(v) => (1, v),
                KeyBase::Unknown => (2, 0),
            }
        }
        rank(self.base)
            .cmp(&rank(other.base))
            .then(self.suffix.cmp(&other.suffix))
    }
}
