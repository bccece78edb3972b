//! Wire codec for the tracer's two binary protocols:
//!
//! - [`packet`]: the 32-bit big-endian trace packet stream (addresses, reads,
//!   writes, timestamps).
//! - [`hook`]: the 32-byte I/O hook burst tunnelled through writes to the
//!   hook address.
//!
//! Both formats are decoded with explicit shifts rather than unaligned loads
//! or native-endian reinterpretation, since the wire format is fixed
//! big-endian/little-endian regardless of host byte order.

pub mod hook;
pub mod packet;

pub use hook::IOHookBuffer;
pub use packet::{MemPacket, PacketType};

use thiserror::Error;

/// Errors raised while decoding wire data.
///
/// The codec itself has no fallible paths over well-formed 32-bit/32-byte
/// inputs; this exists for the inputs whose shape is checked before they
/// reach the codec (e.g. a caller handing over fewer than 4 bytes).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("expected {expected} bytes, got {got}")]
    ShortBuffer { expected: usize, got: usize },
}
