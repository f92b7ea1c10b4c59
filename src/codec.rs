//! Wire and payload codecs.
//!
//! - [`cannelloni`]: incremental decoder and batch encoder for the
//!   Cannelloni CAN-over-UDP protocol
//! - [`byte_order`]: bit-field extraction from frame payloads

pub mod byte_order;
pub mod cannelloni;

pub use byte_order::{extract_bytes, extract_number};
pub use cannelloni::{encode_batch, CannelloniFrameDecoder, DecoderStats};
