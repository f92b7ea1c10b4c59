//! Bit-field extraction with configurable byte ordering.
//!
//! The frame payload is read as a single unsigned integer in the signal's
//! byte ordering, and a signal selects `bit_length` bits starting
//! `bit_offset` bits above the least significant bit. Byte-aligned ranges
//! are sliced straight out of the payload; anything else goes through an
//! arbitrary-precision shift and mask. Both paths feed the same
//! interpretation step, so they agree on every value.

use num_bigint::{BigInt, BigUint};
use num_traits::{One, ToPrimitive};

use crate::core::signal::{BitDataType, ByteOrdering, CanbusSignalReference, Number};

/// Bits selected from a payload, before interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RawBits {
    /// Up to 64 bits.
    Word(u64),
    /// More than 64 bits.
    Wide(BigUint),
}

/// Extract a signal value from a frame payload.
///
/// Returns `None` when the bit range is empty or extends past the payload,
/// or when a float type is requested for a range of the wrong width.
pub fn extract_number(data: &[u8], signal: &CanbusSignalReference) -> Option<Number> {
    let (raw, len) = select(data, signal)?;
    interpret(raw, len, signal.data_type)
}

/// Extract the raw bytes of a signal from a frame payload.
///
/// The result holds `ceil(bit_length / 8)` bytes in the signal's byte
/// ordering. For byte-aligned ranges this is exactly the payload slice.
pub fn extract_bytes(data: &[u8], signal: &CanbusSignalReference) -> Option<Vec<u8>> {
    let (raw, len) = select_bits(data, signal.bit_offset, signal.bit_length, signal.byte_ordering)?;
    let n = len.div_ceil(8) as usize;
    let mut out = match raw {
        RawBits::Word(v) => v.to_be_bytes()[8 - n..].to_vec(),
        RawBits::Wide(v) => {
            let bytes = v.to_bytes_be();
            let mut out = vec![0u8; n.saturating_sub(bytes.len())];
            out.extend_from_slice(&bytes);
            out
        }
    };
    if signal.byte_ordering == ByteOrdering::LittleEndian {
        out.reverse();
    }
    Some(out)
}

/// Select the signal bits, trimmed to the data type's width.
fn select(data: &[u8], signal: &CanbusSignalReference) -> Option<(RawBits, u32)> {
    let (raw, len) = select_bits(data, signal.bit_offset, signal.bit_length, signal.byte_ordering)?;
    match signal.data_type.bit_width() {
        Some(width) if width < len => Some((truncate(raw, width), width)),
        _ => Some((raw, len)),
    }
}

fn select_bits(
    data: &[u8],
    bit_offset: u32,
    bit_length: u32,
    ordering: ByteOrdering,
) -> Option<(RawBits, u32)> {
    let total_bits = (data.len() as u64) * 8;
    if bit_length == 0 || bit_offset as u64 + bit_length as u64 > total_bits {
        return None;
    }

    if bit_offset % 8 == 0 && bit_length % 8 == 0 {
        let count = (bit_length / 8) as usize;
        let start = match ordering {
            ByteOrdering::LittleEndian => (bit_offset / 8) as usize,
            ByteOrdering::BigEndian => data.len() - ((bit_offset + bit_length) / 8) as usize,
        };
        let slice = &data[start..start + count];
        return Some((read_aligned(slice, ordering), bit_length));
    }

    let whole = match ordering {
        ByteOrdering::BigEndian => BigUint::from_bytes_be(data),
        ByteOrdering::LittleEndian => BigUint::from_bytes_le(data),
    };
    let mask = (BigUint::one() << bit_length) - BigUint::one();
    let value = (whole >> bit_offset) & mask;
    let raw = if bit_length <= 64 {
        RawBits::Word(value.to_u64().unwrap_or(0))
    } else {
        RawBits::Wide(value)
    };
    Some((raw, bit_length))
}

fn read_aligned(slice: &[u8], ordering: ByteOrdering) -> RawBits {
    if slice.len() > 8 {
        return RawBits::Wide(match ordering {
            ByteOrdering::BigEndian => BigUint::from_bytes_be(slice),
            ByteOrdering::LittleEndian => BigUint::from_bytes_le(slice),
        });
    }
    let mut buf = [0u8; 8];
    let value = match ordering {
        ByteOrdering::BigEndian => {
            buf[8 - slice.len()..].copy_from_slice(slice);
            u64::from_be_bytes(buf)
        }
        ByteOrdering::LittleEndian => {
            buf[..slice.len()].copy_from_slice(slice);
            u64::from_le_bytes(buf)
        }
    };
    RawBits::Word(value)
}

fn truncate(raw: RawBits, width: u32) -> RawBits {
    match raw {
        RawBits::Word(v) => RawBits::Word(v & low_mask(width)),
        RawBits::Wide(v) => {
            let mask = (BigUint::one() << width) - BigUint::one();
            // every bounded type is at most 64 bits wide
            RawBits::Word((v & mask).to_u64().unwrap_or(0))
        }
    }
}

#[inline]
fn low_mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

fn interpret(raw: RawBits, len: u32, data_type: BitDataType) -> Option<Number> {
    match data_type {
        BitDataType::Float32 => match (raw, len) {
            (RawBits::Word(v), 32) => Some(Number::F32(f32::from_bits(v as u32))),
            _ => None,
        },
        BitDataType::Float64 => match (raw, len) {
            (RawBits::Word(v), 64) => Some(Number::F64(f64::from_bits(v))),
            _ => None,
        },
        t if t.is_signed() => Some(match raw {
            RawBits::Word(v) => Number::narrow_i64(sign_extend(v, len)),
            RawBits::Wide(v) => {
                let top_set = v.bit((len - 1) as u64);
                let v = BigInt::from(v);
                if top_set {
                    Number::narrow_big(v - (BigInt::one() << len))
                } else {
                    Number::narrow_big(v)
                }
            }
        }),
        _ => Some(match raw {
            RawBits::Word(v) => Number::narrow_u64(v),
            RawBits::Wide(v) => Number::narrow_big(BigInt::from(v)),
        }),
    }
}

#[inline]
fn sign_extend(v: u64, len: u32) -> i64 {
    if len >= 64 {
        return v as i64;
    }
    let shift = 64 - len;
    ((v << shift) as i64) >> shift
}
