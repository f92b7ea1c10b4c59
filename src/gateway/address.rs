//! Signal address parsing.
//!
//! Converts shorthand signal strings to [`CanbusSignalReference`] values.

use crate::core::error::{GatewayError, Result};
use crate::core::frame::{CANFD_MAX_DLEN, CAN_EFF_MASK};
use crate::core::signal::{BitDataType, ByteOrdering, CanbusSignalReference};

/// Largest payload in bits.
const MAX_PAYLOAD_BITS: u32 = (CANFD_MAX_DLEN as u32) * 8;

/// Parse a shorthand signal string into a `CanbusSignalReference`.
///
/// # Format
///
/// `"address:bit_offset:bit_length[:order[:type]]"`
///
/// - `address`: hex (`0x351`) or decimal (`849`) bus address
/// - `order`: `be` (default) or `le`
/// - `type`: data type name such as `u16`, `i32`, `f32` (default `u32`)
///
/// # Examples
///
/// - `"0x351:0:16"` → address=0x351, offset=0, length=16, big-endian, u32
/// - `"0x355:16:16:le:u16"` → little-endian u16 at bits 16..32
pub fn parse_signal_address(address: &str) -> Result<CanbusSignalReference> {
    // Use splitn to avoid Vec allocation
    let mut parts = address.trim().splitn(5, ':');

    let address_str = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| GatewayError::Config("Empty signal address".into()))?;
    let (offset_str, length_str) = match (parts.next(), parts.next()) {
        (Some(offset), Some(length)) => (offset, length),
        _ => {
            return Err(GatewayError::Config(format!(
                "Invalid signal address format: {}. Expected 'address:bit_offset:bit_length'",
                address
            )))
        }
    };

    let bus_address = parse_bus_address(address_str)?;
    let bit_offset = offset_str
        .parse::<u32>()
        .map_err(|_| GatewayError::Config(format!("Invalid bit_offset: {}", offset_str)))?;
    let bit_length = length_str
        .parse::<u32>()
        .map_err(|_| GatewayError::Config(format!("Invalid bit_length: {}", length_str)))?;

    let mut signal = CanbusSignalReference::new(bus_address, bit_offset, bit_length);
    if let Some(order) = parts.next() {
        signal = signal.with_ordering(order.parse::<ByteOrdering>()?);
    }
    if let Some(data_type) = parts.next() {
        signal = signal.with_data_type(data_type.parse::<BitDataType>()?);
    }

    validate_signal(&signal)?;
    Ok(signal)
}

/// Parse a bus address in hex (`0x` prefix) or decimal.
pub fn parse_bus_address(address: &str) -> Result<u32> {
    let address = address.trim();
    let parsed = match address
        .strip_prefix("0x")
        .or_else(|| address.strip_prefix("0X"))
    {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => address.parse::<u32>(),
    };
    let value =
        parsed.map_err(|_| GatewayError::Config(format!("Invalid bus address: {}", address)))?;
    if value > CAN_EFF_MASK {
        return Err(GatewayError::Config(format!(
            "Bus address out of range: {} (max 0x{:X})",
            address, CAN_EFF_MASK
        )));
    }
    Ok(value)
}

/// Check that a signal can be extracted from some frame.
pub fn validate_signal(signal: &CanbusSignalReference) -> Result<()> {
    if signal.address > CAN_EFF_MASK {
        return Err(GatewayError::Config(format!(
            "Bus address out of range: 0x{:X}",
            signal.address
        )));
    }
    if signal.bit_length == 0 {
        return Err(GatewayError::Config("bit_length must be at least 1".into()));
    }
    if signal.bit_offset.saturating_add(signal.bit_length) > MAX_PAYLOAD_BITS {
        return Err(GatewayError::Config(format!(
            "Signal {} exceeds the {} bit payload limit",
            signal, MAX_PAYLOAD_BITS
        )));
    }
    match signal.data_type {
        BitDataType::Float32 if signal.bit_length != 32 => Err(GatewayError::Config(format!(
            "Signal {} must be 32 bits long for f32",
            signal
        ))),
        BitDataType::Float64 if signal.bit_length != 64 => Err(GatewayError::Config(format!(
            "Signal {} must be 64 bits long for f64",
            signal
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_signal_address() {
        let sig = parse_signal_address("0x351:0:16").unwrap();
        assert_eq!(sig.address, 0x351);
        assert_eq!(sig.bit_offset, 0);
        assert_eq!(sig.bit_length, 16);
        assert_eq!(sig.byte_ordering, ByteOrdering::BigEndian);
        assert_eq!(sig.data_type, BitDataType::UInt32);
    }

    #[test]
    fn test_parse_signal_address_with_order_and_type() {
        let sig = parse_signal_address("849:16:16:le:i16").unwrap();
        assert_eq!(sig.address, 0x351);
        assert_eq!(sig.bit_offset, 16);
        assert_eq!(sig.byte_ordering, ByteOrdering::LittleEndian);
        assert_eq!(sig.data_type, BitDataType::Int16);
        assert_eq!(sig.to_string(), "0x351:16:16:le:i16");
    }

    #[test]
    fn test_parse_signal_address_round_trips_display() {
        let sig = parse_signal_address("0x18FF50E5:3:5:be:u8").unwrap();
        assert_eq!(parse_signal_address(&sig.to_string()).unwrap(), sig);
    }

    #[test]
    fn test_parse_signal_address_errors() {
        assert!(parse_signal_address("").is_err());
        assert!(parse_signal_address("0x351").is_err());
        assert!(parse_signal_address("0x351:0").is_err());
        assert!(parse_signal_address("0xZZ:0:8").is_err());
        assert!(parse_signal_address("0x351:x:8").is_err());
        assert!(parse_signal_address("0x351:0:0").is_err());
        assert!(parse_signal_address("0x351:0:8:middle").is_err());
        assert!(parse_signal_address("0x351:0:8:be:u128").is_err());
        assert!(parse_signal_address("0x351:508:8").is_err());
        assert!(parse_signal_address("0x351:0:16:be:f32").is_err());
    }

    #[test]
    fn test_parse_bus_address() {
        assert_eq!(parse_bus_address("0x7FF").unwrap(), 0x7FF);
        assert_eq!(parse_bus_address("0X10").unwrap(), 0x10);
        assert_eq!(parse_bus_address(" 100 ").unwrap(), 100);
        assert_eq!(parse_bus_address("0x1FFFFFFF").unwrap(), CAN_EFF_MASK);
        assert!(parse_bus_address("0x20000000").is_err());
        assert!(parse_bus_address("-1").is_err());
    }
}
