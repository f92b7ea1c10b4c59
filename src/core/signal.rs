//! Signal descriptors and extracted values.
//!
//! A signal is a bit range inside the payload of the frame observed at a
//! bus address. [`CanbusSignalReference`] names that range; extraction yields
//! a [`Number`] whose width is the smallest that holds the value exactly.

use std::fmt;
use std::str::FromStr;

use num_bigint::BigInt;
use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize, Serializer};

use crate::core::error::{GatewayError, Result};

// ============================================================================
// Byte Ordering
// ============================================================================

/// Byte ordering of the frame payload when read as one integer.
///
/// Bit offsets always count from the least significant bit of that integer.
/// In big-endian order the last payload byte holds bits 0..8; in
/// little-endian order the first payload byte does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ByteOrdering {
    /// Most significant byte first.
    #[default]
    #[serde(rename = "be", alias = "big", alias = "big_endian", alias = "BigEndian")]
    BigEndian,

    /// Least significant byte first.
    #[serde(rename = "le", alias = "little", alias = "little_endian", alias = "LittleEndian")]
    LittleEndian,
}

impl ByteOrdering {
    /// Short name used in configuration.
    pub const fn key(&self) -> &'static str {
        match self {
            Self::BigEndian => "be",
            Self::LittleEndian => "le",
        }
    }
}

impl FromStr for ByteOrdering {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("be") || s.eq_ignore_ascii_case("big") {
            Ok(Self::BigEndian)
        } else if s.eq_ignore_ascii_case("le") || s.eq_ignore_ascii_case("little") {
            Ok(Self::LittleEndian)
        } else {
            Err(GatewayError::Config(format!(
                "Invalid byte ordering: {}. Expected 'be' or 'le'",
                s
            )))
        }
    }
}

impl fmt::Display for ByteOrdering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

// ============================================================================
// Bit Data Type
// ============================================================================

/// Interpretation hint for extracted bits.
///
/// Signed types sign-extend from the signal's bit length. Fixed-width types
/// keep at most their own width of low-order bits. `Integer` and
/// `UnsignedInteger` have no width limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BitDataType {
    /// Single bit flag.
    #[serde(rename = "bit", alias = "bool")]
    Bit,
    #[serde(rename = "int8", alias = "i8")]
    Int8,
    #[serde(rename = "uint8", alias = "u8")]
    UInt8,
    #[serde(rename = "int16", alias = "i16")]
    Int16,
    #[serde(rename = "uint16", alias = "u16")]
    UInt16,
    #[serde(rename = "int32", alias = "i32")]
    Int32,
    /// Unsigned 32-bit integer (default).
    #[default]
    #[serde(rename = "uint32", alias = "u32")]
    UInt32,
    #[serde(rename = "int64", alias = "i64")]
    Int64,
    #[serde(rename = "uint64", alias = "u64")]
    UInt64,
    /// IEEE 754 single precision; requires a 32-bit signal.
    #[serde(rename = "float32", alias = "f32")]
    Float32,
    /// IEEE 754 double precision; requires a 64-bit signal.
    #[serde(rename = "float64", alias = "f64")]
    Float64,
    /// Arbitrary-width signed integer.
    #[serde(rename = "integer", alias = "int")]
    Integer,
    /// Arbitrary-width unsigned integer.
    #[serde(rename = "unsigned_integer", alias = "uint")]
    UnsignedInteger,
}

impl BitDataType {
    /// All data types, in declaration order.
    pub const ALL: [BitDataType; 13] = [
        Self::Bit,
        Self::Int8,
        Self::UInt8,
        Self::Int16,
        Self::UInt16,
        Self::Int32,
        Self::UInt32,
        Self::Int64,
        Self::UInt64,
        Self::Float32,
        Self::Float64,
        Self::Integer,
        Self::UnsignedInteger,
    ];

    /// Short name used in signal shorthand.
    pub const fn key(&self) -> &'static str {
        match self {
            Self::Bit => "bit",
            Self::Int8 => "i8",
            Self::UInt8 => "u8",
            Self::Int16 => "i16",
            Self::UInt16 => "u16",
            Self::Int32 => "i32",
            Self::UInt32 => "u32",
            Self::Int64 => "i64",
            Self::UInt64 => "u64",
            Self::Float32 => "f32",
            Self::Float64 => "f64",
            Self::Integer => "int",
            Self::UnsignedInteger => "uint",
        }
    }

    /// Maximum number of bits the type keeps, if bounded.
    pub const fn bit_width(&self) -> Option<u32> {
        match self {
            Self::Bit => Some(1),
            Self::Int8 | Self::UInt8 => Some(8),
            Self::Int16 | Self::UInt16 => Some(16),
            Self::Int32 | Self::UInt32 | Self::Float32 => Some(32),
            Self::Int64 | Self::UInt64 | Self::Float64 => Some(64),
            Self::Integer | Self::UnsignedInteger => None,
        }
    }

    /// Whether extracted bits are sign-extended.
    pub const fn is_signed(&self) -> bool {
        matches!(
            self,
            Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64 | Self::Integer
        )
    }

    /// Whether the bits encode an IEEE 754 float.
    pub const fn is_float(&self) -> bool {
        matches!(self, Self::Float32 | Self::Float64)
    }
}

impl FromStr for BitDataType {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_ascii_lowercase();
        let found = Self::ALL.iter().copied().find(|t| {
            t.key() == lower
                || match t {
                    Self::Bit => lower == "bool",
                    Self::Int8 => lower == "int8",
                    Self::UInt8 => lower == "uint8",
                    Self::Int16 => lower == "int16",
                    Self::UInt16 => lower == "uint16",
                    Self::Int32 => lower == "int32",
                    Self::UInt32 => lower == "uint32",
                    Self::Int64 => lower == "int64",
                    Self::UInt64 => lower == "uint64",
                    Self::Float32 => lower == "float32" || lower == "float",
                    Self::Float64 => lower == "float64" || lower == "double",
                    Self::Integer => lower == "integer",
                    Self::UnsignedInteger => lower == "unsigned_integer",
                }
        });
        found.ok_or_else(|| GatewayError::Config(format!("Invalid data type: {}", s)))
    }
}

impl fmt::Display for BitDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

// ============================================================================
// Signal Reference
// ============================================================================

/// Descriptor of one signal within the frame at a bus address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CanbusSignalReference {
    /// Bus address of the frame holding the signal.
    pub address: u32,

    /// Offset of the least significant bit.
    #[serde(default)]
    pub bit_offset: u32,

    /// Number of bits.
    pub bit_length: u32,

    /// Payload byte ordering.
    #[serde(default)]
    pub byte_ordering: ByteOrdering,

    /// Value interpretation.
    #[serde(default)]
    pub data_type: BitDataType,
}

impl CanbusSignalReference {
    /// Create a big-endian, unsigned 32-bit signal reference.
    pub fn new(address: u32, bit_offset: u32, bit_length: u32) -> Self {
        Self {
            address,
            bit_offset,
            bit_length,
            byte_ordering: ByteOrdering::default(),
            data_type: BitDataType::default(),
        }
    }

    /// Set the byte ordering.
    #[must_use]
    pub fn with_ordering(mut self, ordering: ByteOrdering) -> Self {
        self.byte_ordering = ordering;
        self
    }

    /// Set the data type.
    #[must_use]
    pub fn with_data_type(mut self, data_type: BitDataType) -> Self {
        self.data_type = data_type;
        self
    }

    /// Whether both offset and length fall on byte boundaries.
    #[inline]
    pub fn is_byte_aligned(&self) -> bool {
        self.bit_offset % 8 == 0 && self.bit_length % 8 == 0
    }
}

impl fmt::Display for CanbusSignalReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0x{:X}:{}:{}:{}:{}",
            self.address, self.bit_offset, self.bit_length, self.byte_ordering, self.data_type
        )
    }
}

// ============================================================================
// Number
// ============================================================================

/// Value extracted from a signal.
///
/// Integers are narrowed to the smallest variant that holds them exactly,
/// trying 16, 32 and 64 bits before falling back to arbitrary precision.
/// Callers must handle every variant rather than assume a width.
#[derive(Debug, Clone, PartialEq)]
pub enum Number {
    I16(i16),
    I32(i32),
    I64(i64),
    Big(BigInt),
    F32(f32),
    F64(f64),
}

impl Number {
    /// Narrow a signed 64-bit value.
    pub fn narrow_i64(v: i64) -> Self {
        if let Ok(v) = i16::try_from(v) {
            Self::I16(v)
        } else if let Ok(v) = i32::try_from(v) {
            Self::I32(v)
        } else {
            Self::I64(v)
        }
    }

    /// Narrow an unsigned 64-bit value.
    pub fn narrow_u64(v: u64) -> Self {
        match i64::try_from(v) {
            Ok(v) => Self::narrow_i64(v),
            Err(_) => Self::Big(BigInt::from(v)),
        }
    }

    /// Narrow an arbitrary-precision value.
    pub fn narrow_big(v: BigInt) -> Self {
        match v.to_i64() {
            Some(v) => Self::narrow_i64(v),
            None => Self::Big(v),
        }
    }

    /// Whether the value is an integer.
    pub fn is_integer(&self) -> bool {
        !matches!(self, Self::F32(_) | Self::F64(_))
    }

    /// Value as `i64`, if it is an integer within range.
    pub fn to_i64(&self) -> Option<i64> {
        match self {
            Self::I16(v) => Some(*v as i64),
            Self::I32(v) => Some(*v as i64),
            Self::I64(v) => Some(*v),
            Self::Big(v) => v.to_i64(),
            Self::F32(_) | Self::F64(_) => None,
        }
    }

    /// Value as `f64` (may lose precision for wide integers).
    pub fn to_f64(&self) -> f64 {
        match self {
            Self::I16(v) => *v as f64,
            Self::I32(v) => *v as f64,
            Self::I64(v) => *v as f64,
            Self::Big(v) => v.to_f64().unwrap_or(f64::NAN),
            Self::F32(v) => *v as f64,
            Self::F64(v) => *v,
        }
    }
}

impl From<i64> for Number {
    fn from(v: i64) -> Self {
        Self::narrow_i64(v)
    }
}

impl From<u64> for Number {
    fn from(v: u64) -> Self {
        Self::narrow_u64(v)
    }
}

impl From<BigInt> for Number {
    fn from(v: BigInt) -> Self {
        Self::narrow_big(v)
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::I16(v) => write!(f, "{}", v),
            Self::I32(v) => write!(f, "{}", v),
            Self::I64(v) => write!(f, "{}", v),
            Self::Big(v) => write!(f, "{}", v),
            Self::F32(v) => write!(f, "{}", v),
            Self::F64(v) => write!(f, "{}", v),
        }
    }
}

impl Serialize for Number {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::I16(v) => serializer.serialize_i16(*v),
            Self::I32(v) => serializer.serialize_i32(*v),
            Self::I64(v) => serializer.serialize_i64(*v),
            // JSON numbers cannot carry arbitrary precision
            Self::Big(v) => serializer.serialize_str(&v.to_string()),
            Self::F32(v) => serializer.serialize_f32(*v),
            Self::F64(v) => serializer.serialize_f64(*v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_narrowing_prefers_smallest() {
        assert_eq!(Number::narrow_u64(0x7FFF), Number::I16(0x7FFF));
        assert_eq!(Number::narrow_u64(0xFFFF), Number::I32(0xFFFF));
        assert_eq!(Number::narrow_u64(0xFFFF_FFFF), Number::I64(0xFFFF_FFFF));
        assert_eq!(
            Number::narrow_u64(u64::MAX),
            Number::Big(BigInt::from(u64::MAX))
        );
        assert_eq!(Number::narrow_i64(-1), Number::I16(-1));
        assert_eq!(Number::narrow_i64(-40_000), Number::I32(-40_000));
    }

    #[test]
    fn test_narrow_big() {
        assert_eq!(Number::narrow_big(BigInt::from(12)), Number::I16(12));
        let wide: BigInt = BigInt::from(u64::MAX) * 4;
        assert_eq!(Number::narrow_big(wide.clone()), Number::Big(wide));
    }

    #[test]
    fn test_data_type_parse() {
        assert_eq!("u16".parse::<BitDataType>().unwrap(), BitDataType::UInt16);
        assert_eq!("UInt16".parse::<BitDataType>().unwrap(), BitDataType::UInt16);
        assert_eq!("float".parse::<BitDataType>().unwrap(), BitDataType::Float32);
        assert!("u17".parse::<BitDataType>().is_err());
    }

    #[test]
    fn test_ordering_parse() {
        assert_eq!("LE".parse::<ByteOrdering>().unwrap(), ByteOrdering::LittleEndian);
        assert_eq!("big".parse::<ByteOrdering>().unwrap(), ByteOrdering::BigEndian);
        assert!("middle".parse::<ByteOrdering>().is_err());
    }

    #[test]
    fn test_signal_defaults() {
        let sig = CanbusSignalReference::new(0x351, 8, 16);
        assert_eq!(sig.data_type, BitDataType::UInt32);
        assert_eq!(sig.byte_ordering, ByteOrdering::BigEndian);
        assert!(sig.is_byte_aligned());
        assert!(!CanbusSignalReference::new(0x351, 3, 16).is_byte_aligned());
        assert_eq!(sig.to_string(), "0x351:8:16:be:u32");
    }

    #[test]
    fn test_signal_deserialize_defaults() {
        let sig: CanbusSignalReference =
            serde_json::from_str(r#"{"address": 849, "bit_length": 16}"#).unwrap();
        assert_eq!(sig.bit_offset, 0);
        assert_eq!(sig.data_type, BitDataType::UInt32);

        let sig: CanbusSignalReference = serde_json::from_str(
            r#"{"address": 1, "bit_length": 8, "byte_ordering": "le", "data_type": "i8"}"#,
        )
        .unwrap();
        assert_eq!(sig.byte_ordering, ByteOrdering::LittleEndian);
        assert_eq!(sig.data_type, BitDataType::Int8);
    }

    #[test]
    fn test_number_serialize() {
        assert_eq!(serde_json::to_string(&Number::I16(5)).unwrap(), "5");
        let big = Number::Big(BigInt::from(u64::MAX));
        assert_eq!(
            serde_json::to_string(&big).unwrap(),
            "\"18446744073709551615\""
        );
    }
}
