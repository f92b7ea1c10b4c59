//! Cannelloni wire codec.
//!
//! Cannelloni tunnels batches of CAN frames over UDP. Every batch starts
//! with a five byte header followed by the declared number of frames:
//!
//! ```text
//! header:  version:u8 (=2) | opcode:u8 (0 = DATA) | seq:u8 | count:u16be
//! frame:   id_flags:u32be | size:u8 | [fd_flags:u8] | data[len]
//! ```
//!
//! The size byte marks a CAN FD frame with its high bit, in which case the
//! low seven bits are the length and a flags byte follows. Classic frames
//! use the low four bits, where 9 to 15 read as 8 bytes like a CAN DLC.
//! Remote requests carry no data bytes. An FD length above 64 means the
//! stream is out of step: buffered input is dropped and decoding resumes at
//! the next batch header.
//!
//! # Example
//!
//! ```rust,ignore
//! use bytes::BytesMut;
//! use cangw::codec::cannelloni::CannelloniFrameDecoder;
//!
//! let mut decoder = CannelloniFrameDecoder::new();
//! let mut buf = BytesMut::from(&[0x02, 0x00, 0x00, 0x00, 0x01][..]);
//! buf.extend_from_slice(&[0x00, 0x00, 0x01, 0x23, 0x02, 0xAB, 0xCD]);
//! let frame = decoder.decode(&mut buf).unwrap();
//! assert_eq!(frame.address(), 0x123);
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::core::error::{GatewayError, Result};
use crate::core::frame::{CanbusFrame, CANFD_MAX_DLEN, CAN_MAX_DLEN, CAN_RTR_FLAG};

/// Supported protocol version.
pub const CANNELLONI_VERSION: u8 = 2;

/// Length of the batch header.
pub const HEADER_LEN: usize = 5;

/// Length of the per-frame identifier word plus size byte.
pub const FRAME_HEADER_LEN: usize = 5;

/// Size byte flag marking a CAN FD frame.
pub const CANFD_FRAME_FLAG: u8 = 0x80;

/// Length bits of an FD size byte.
const FD_LEN_MASK: u8 = 0x7F;

/// Length bits of a classic size byte.
const CLASSIC_LEN_MASK: u8 = 0x0F;

/// Cannelloni operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Data = 0,
    Ack = 1,
    Nack = 2,
}

impl OpCode {
    /// Try to create from the wire value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Data),
            1 => Some(Self::Ack),
            2 => Some(Self::Nack),
            _ => None,
        }
    }
}

// ============================================================================
// Decoder
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecoderState {
    /// Waiting for a batch header.
    Header,
    /// Decoding frames of the current batch.
    CanFrame { remaining: u16 },
}

enum FrameStep {
    Incomplete,
    Frame(CanbusFrame),
    Corrupt,
}

/// Decoder counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    /// Batch headers accepted.
    pub batches: u64,
    /// Frames emitted.
    pub frames: u64,
    /// Headers skipped for an unsupported version or opcode.
    pub skipped_headers: u64,
    /// Times buffered input was dropped after an impossible frame length.
    pub discarded: u64,
    /// Sequence number of the last accepted header.
    pub last_seq: Option<u8>,
}

/// Incremental Cannelloni decoder.
///
/// Bytes are appended to a caller-owned buffer and [`decode`] is called until
/// it returns `None`. A unit (header or frame) is only consumed once it is
/// fully available, so the buffer can grow by arbitrary chunks between calls.
///
/// [`decode`]: CannelloniFrameDecoder::decode
#[derive(Debug, Clone)]
pub struct CannelloniFrameDecoder {
    state: DecoderState,
    stats: DecoderStats,
}

impl CannelloniFrameDecoder {
    /// Create a decoder waiting for a batch header.
    pub fn new() -> Self {
        Self {
            state: DecoderState::Header,
            stats: DecoderStats::default(),
        }
    }

    /// Decode the next frame from `src`.
    ///
    /// Returns `None` when more input is needed. Unsupported headers are
    /// skipped and decoding continues with the following bytes. A frame with
    /// an impossible length empties `src` and abandons the batch.
    pub fn decode(&mut self, src: &mut BytesMut) -> Option<CanbusFrame> {
        loop {
            match self.state {
                DecoderState::Header => {
                    if src.len() < HEADER_LEN {
                        return None;
                    }
                    let version = src[0];
                    let opcode = src[1];
                    let seq = src[2];
                    let count = u16::from_be_bytes([src[3], src[4]]);
                    src.advance(HEADER_LEN);

                    if version != CANNELLONI_VERSION || OpCode::from_u8(opcode) != Some(OpCode::Data) {
                        self.stats.skipped_headers += 1;
                        #[cfg(feature = "tracing-support")]
                        tracing::debug!(
                            "Skipping Cannelloni header: version={}, opcode={}",
                            version,
                            opcode
                        );
                        continue;
                    }

                    self.stats.batches += 1;
                    self.stats.last_seq = Some(seq);
                    if count > 0 {
                        self.state = DecoderState::CanFrame { remaining: count };
                    }
                }
                DecoderState::CanFrame { remaining } => {
                    let frame = match Self::decode_frame(src) {
                        FrameStep::Incomplete => return None,
                        FrameStep::Frame(frame) => frame,
                        FrameStep::Corrupt => {
                            self.stats.discarded += 1;
                            #[cfg(feature = "tracing-support")]
                            tracing::debug!(
                                "Dropping {} buffered bytes after bad CAN FD length, {} frames lost",
                                src.len(),
                                remaining
                            );
                            src.clear();
                            self.state = DecoderState::Header;
                            return None;
                        }
                    };
                    self.state = if remaining > 1 {
                        DecoderState::CanFrame {
                            remaining: remaining - 1,
                        }
                    } else {
                        DecoderState::Header
                    };
                    self.stats.frames += 1;
                    return Some(frame);
                }
            }
        }
    }

    /// Decode every frame currently available in `src`.
    pub fn decode_all(&mut self, src: &mut BytesMut) -> Vec<CanbusFrame> {
        let mut frames = Vec::new();
        while let Some(frame) = self.decode(src) {
            frames.push(frame);
        }
        frames
    }

    fn decode_frame(src: &mut BytesMut) -> FrameStep {
        if src.len() < FRAME_HEADER_LEN {
            return FrameStep::Incomplete;
        }
        let id_flags = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        let size = src[4];
        let fd = size & CANFD_FRAME_FLAG != 0;
        let remote = id_flags & CAN_RTR_FLAG != 0;
        let (len, header_len) = if fd {
            let len = (size & FD_LEN_MASK) as usize;
            if len > CANFD_MAX_DLEN && !remote {
                return FrameStep::Corrupt;
            }
            (len, FRAME_HEADER_LEN + 1)
        } else {
            (((size & CLASSIC_LEN_MASK) as usize).min(CAN_MAX_DLEN), FRAME_HEADER_LEN)
        };
        let payload_len = if remote { 0 } else { len };
        if src.len() < header_len + payload_len {
            return FrameStep::Incomplete;
        }

        let fd_flags = if fd { src[FRAME_HEADER_LEN] } else { 0 };
        src.advance(header_len);
        let data = if remote {
            Bytes::copy_from_slice(&[size])
        } else {
            src.split_to(payload_len).freeze()
        };
        FrameStep::Frame(CanbusFrame::from_parts(id_flags, fd, fd_flags, data))
    }

    /// Whether the decoder is between batches.
    pub fn is_idle(&self) -> bool {
        self.state == DecoderState::Header
    }

    /// Frames still expected in the current batch.
    pub fn remaining(&self) -> u16 {
        match self.state {
            DecoderState::Header => 0,
            DecoderState::CanFrame { remaining } => remaining,
        }
    }

    /// Decoder counters.
    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// Return to the header state, abandoning any partial batch.
    pub fn reset(&mut self) {
        self.state = DecoderState::Header;
    }
}

impl Default for CannelloniFrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Encoder
// ============================================================================

/// Encode one DATA batch.
///
/// Remote requests are written with their stored size byte and no payload.
pub fn encode_batch(seq: u8, frames: &[CanbusFrame]) -> Result<BytesMut> {
    let count = u16::try_from(frames.len())
        .map_err(|_| GatewayError::invalid_data("Too many frames for one Cannelloni batch"))?;
    let mut dst = BytesMut::with_capacity(HEADER_LEN + frames.len() * (FRAME_HEADER_LEN + 8));
    dst.put_u8(CANNELLONI_VERSION);
    dst.put_u8(OpCode::Data as u8);
    dst.put_u8(seq);
    dst.put_u16(count);
    for frame in frames {
        encode_frame(frame, &mut dst)?;
    }
    Ok(dst)
}

/// Append one frame in wire format.
pub fn encode_frame(frame: &CanbusFrame, dst: &mut BytesMut) -> Result<()> {
    dst.put_u32(frame.id_flags());
    if frame.is_remote() {
        let size = frame.data().first().copied().unwrap_or(0) & !CANFD_FRAME_FLAG;
        dst.put_u8(size);
        return Ok(());
    }

    let len = frame.data().len();
    if frame.is_fd() {
        if len > CANFD_MAX_DLEN {
            return Err(GatewayError::invalid_data(format!(
                "CAN FD payload too long: {} bytes",
                len
            )));
        }
        dst.put_u8(CANFD_FRAME_FLAG | len as u8);
        dst.put_u8(frame.fd_flags());
    } else {
        if len > CAN_MAX_DLEN {
            return Err(GatewayError::invalid_data(format!(
                "CAN payload too long: {} bytes",
                len
            )));
        }
        dst.put_u8(len as u8);
    }
    dst.put_slice(frame.data());
    Ok(())
}
