//! CAN bus frame model.
//!
//! A [`CanbusFrame`] is one message observed on the bus. The raw 32-bit
//! identifier word carries the 11/29-bit address in its low bits and three
//! flag bits above it, exactly as tunneled over Cannelloni.

use std::fmt;

use bytes::Bytes;

/// Extended (29-bit) frame format flag.
pub const CAN_EFF_FLAG: u32 = 0x8000_0000;

/// Remote transmission request flag.
pub const CAN_RTR_FLAG: u32 = 0x4000_0000;

/// Error frame flag.
pub const CAN_ERR_FLAG: u32 = 0x2000_0000;

/// Mask for a standard (11-bit) address.
pub const CAN_SFF_MASK: u32 = 0x0000_07FF;

/// Mask for an extended (29-bit) address.
pub const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;

/// Maximum payload of a classic CAN frame.
pub const CAN_MAX_DLEN: usize = 8;

/// Maximum payload of a CAN FD frame.
pub const CANFD_MAX_DLEN: usize = 64;

/// CAN FD bit-rate switch flag.
pub const CANFD_BRS: u8 = 0x01;

/// CAN FD error state indicator flag.
pub const CANFD_ESI: u8 = 0x02;

/// One CAN bus message.
///
/// Frames are immutable and compare structurally. For a remote transmission
/// request `data` holds the single raw size byte instead of a payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanbusFrame {
    id_flags: u32,
    fd: bool,
    fd_flags: u8,
    data: Bytes,
}

impl CanbusFrame {
    /// Create a frame from its raw identifier word and payload.
    ///
    /// `fd` marks a CAN FD frame; `fd_flags` is only meaningful when it is set.
    pub fn from_parts(id_flags: u32, fd: bool, fd_flags: u8, data: impl Into<Bytes>) -> Self {
        Self {
            id_flags,
            fd,
            fd_flags: if fd { fd_flags } else { 0 },
            data: data.into(),
        }
    }

    /// Create a classic data frame.
    ///
    /// Addresses above `0x7FF` automatically use the extended format.
    pub fn classic(address: u32, data: impl Into<Bytes>) -> Self {
        Self::from_parts(id_word(address, false), false, 0, data)
    }

    /// Create a classic data frame, forcing the extended format.
    pub fn extended(address: u32, data: impl Into<Bytes>) -> Self {
        Self::from_parts(id_word(address, true), false, 0, data)
    }

    /// Create a CAN FD data frame.
    pub fn fd(address: u32, fd_flags: u8, data: impl Into<Bytes>) -> Self {
        Self::from_parts(id_word(address, false), true, fd_flags, data)
    }

    /// Create a remote transmission request carrying the requested length.
    pub fn remote(address: u32, dlc: u8) -> Self {
        Self::from_parts(
            id_word(address, false) | CAN_RTR_FLAG,
            false,
            0,
            vec![dlc & 0x0F],
        )
    }

    /// Bus address with all flag bits stripped.
    #[inline]
    pub fn address(&self) -> u32 {
        self.id_flags & CAN_EFF_MASK
    }

    /// Raw identifier word including flag bits.
    #[inline]
    pub fn id_flags(&self) -> u32 {
        self.id_flags
    }

    /// Whether the frame uses the 29-bit extended format.
    #[inline]
    pub fn is_extended(&self) -> bool {
        self.id_flags & CAN_EFF_FLAG != 0
    }

    /// Whether this is a remote transmission request.
    #[inline]
    pub fn is_remote(&self) -> bool {
        self.id_flags & CAN_RTR_FLAG != 0
    }

    /// Whether this is an error frame.
    #[inline]
    pub fn is_error(&self) -> bool {
        self.id_flags & CAN_ERR_FLAG != 0
    }

    /// Whether this is a CAN FD frame.
    #[inline]
    pub fn is_fd(&self) -> bool {
        self.fd
    }

    /// CAN FD flags (zero for classic frames).
    #[inline]
    pub fn fd_flags(&self) -> u8 {
        self.fd_flags
    }

    /// Payload bytes, or the raw size byte for a remote request.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Payload as a shared buffer.
    pub fn data_bytes(&self) -> Bytes {
        self.data.clone()
    }

    /// Data length code: the requested length for a remote request,
    /// otherwise the payload length.
    pub fn dlc(&self) -> usize {
        if self.is_remote() {
            self.data.first().map(|b| (b & 0x0F) as usize).unwrap_or(0)
        } else {
            self.data.len()
        }
    }

    /// First eight payload bytes as a big-endian word, zero padded.
    ///
    /// Used for subscription data filters, which address the classic
    /// eight-byte payload.
    pub fn data_word(&self) -> u64 {
        if self.is_remote() {
            return 0;
        }
        let mut buf = [0u8; 8];
        let n = self.data.len().min(8);
        buf[..n].copy_from_slice(&self.data[..n]);
        u64::from_be_bytes(buf)
    }
}

fn id_word(address: u32, force_extended: bool) -> u32 {
    let address = address & CAN_EFF_MASK;
    if force_extended || address > CAN_SFF_MASK {
        address | CAN_EFF_FLAG
    } else {
        address
    }
}

impl fmt::Display for CanbusFrame {
    /// Formats the frame in `candump` style, e.g. `123#ABCD` or `12345678##1AB`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_extended() {
            write!(f, "{:08X}", self.address())?;
        } else {
            write!(f, "{:03X}", self.address())?;
        }
        if self.is_remote() {
            return write!(f, "#R{}", self.dlc());
        }
        if self.fd {
            write!(f, "##{:X}", self.fd_flags & 0x0F)?;
        } else {
            f.write_str("#")?;
        }
        for b in self.data.iter() {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_strips_flags() {
        let frame = CanbusFrame::from_parts(
            CAN_EFF_FLAG | CAN_ERR_FLAG | 0x1ABC_DEF0,
            false,
            0,
            vec![],
        );
        assert_eq!(frame.address(), 0x1ABC_DEF0);
        assert!(frame.is_extended());
        assert!(frame.is_error());
        assert!(!frame.is_remote());
    }

    #[test]
    fn test_classic_picks_format_from_address() {
        assert!(!CanbusFrame::classic(0x7FF, vec![1]).is_extended());
        assert!(CanbusFrame::classic(0x800, vec![1]).is_extended());
        assert!(CanbusFrame::extended(0x10, vec![1]).is_extended());
    }

    #[test]
    fn test_remote_frame() {
        let frame = CanbusFrame::remote(0x123, 6);
        assert!(frame.is_remote());
        assert_eq!(frame.data(), &[6]);
        assert_eq!(frame.dlc(), 6);
        assert_eq!(frame.data_word(), 0);
    }

    #[test]
    fn test_fd_flags_ignored_for_classic() {
        let frame = CanbusFrame::from_parts(0x100, false, CANFD_BRS, vec![1, 2]);
        assert_eq!(frame.fd_flags(), 0);
        let frame = CanbusFrame::fd(0x100, CANFD_BRS, vec![0; 12]);
        assert!(frame.is_fd());
        assert_eq!(frame.fd_flags(), CANFD_BRS);
    }

    #[test]
    fn test_data_word_padding() {
        let frame = CanbusFrame::classic(0x1, vec![0xAB, 0xCD]);
        assert_eq!(frame.data_word(), 0xABCD_0000_0000_0000);
    }

    #[test]
    fn test_display() {
        assert_eq!(CanbusFrame::classic(0x123, vec![0xAB, 0xCD]).to_string(), "123#ABCD");
        assert_eq!(CanbusFrame::remote(0x7DF, 8).to_string(), "7DF#R8");
        assert_eq!(
            CanbusFrame::classic(0x18FF_0001, vec![0x01]).to_string(),
            "18FF0001#01"
        );
        assert_eq!(CanbusFrame::fd(0x10, CANFD_BRS, vec![0xFF]).to_string(), "010##1FF");
    }
}
