//! # Serial Frame Codec
//!
//! Frames [`Packet`]s for the serial link and recovers them from a byte
//! stream that may deliver partial frames, drop bytes or corrupt them.
//!
//! ## Wire Format
//! ```text
//! [Magic(4)] [Body(PACKET_SIZE)] [Checksum(1)]
//! ```
//! The checksum is the XOR of every body byte.
//!
//! ## Resynchronization
//! When the head of the buffer is not the magic number the decoder drops one
//! byte at a time until the head is the magic number or a prefix of it, and
//! reports how many bytes it dropped. A frame that starts at any later offset
//! is therefore never lost. A frame whose checksum fails is discarded whole;
//! it is never retried.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace};

use crate::core::packet::{Packet, PACKET_SIZE};
use crate::error::GatewayError;

/// Frame prefix identifying the start of every frame
pub const FRAME_MAGIC: [u8; 4] = [0xFF, 0xFE, 0xFD, 0xFC];

const MAGIC_LEN: usize = FRAME_MAGIC.len();

/// Total on-wire frame length; independent of the packet variant
pub const FRAME_SIZE: usize = MAGIC_LEN + PACKET_SIZE + 1;

/// XOR of all bytes in `body`
#[inline]
pub fn checksum(body: &[u8]) -> u8 {
    body.iter().fold(0, |acc, b| acc ^ b)
}

/// Encode a packet into a complete wire frame
pub fn encode(packet: &Packet) -> [u8; FRAME_SIZE] {
    let body = packet.to_body();
    let mut frame = [0u8; FRAME_SIZE];
    frame[..MAGIC_LEN].copy_from_slice(&FRAME_MAGIC);
    frame[MAGIC_LEN..MAGIC_LEN + PACKET_SIZE].copy_from_slice(&body);
    frame[FRAME_SIZE - 1] = checksum(&body);
    frame
}

/// Outcome of evaluating the head of a decode buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeResult {
    /// A magic-matched, checksum-valid frame
    Complete { packet: Packet, consumed: usize },
    /// A full frame whose checksum trailer did not match; discarded
    ChecksumBad { consumed: usize },
    /// A checksum-valid frame carrying an unknown packet type; discarded
    Malformed { consumed: usize },
    /// Leading bytes were not the magic number and were dropped
    BadMagic { dropped: usize },
    /// Not enough bytes for a full frame yet
    Incomplete,
}

/// Returns true if `bytes` is the magic number or a prefix of it
#[inline]
fn is_magic_prefix(bytes: &[u8]) -> bool {
    let n = bytes.len().min(MAGIC_LEN);
    bytes[..n] == FRAME_MAGIC[..n]
}

/// Evaluate the frame at the head of `buf`, consuming what it decides on
fn decode_frame(buf: &mut BytesMut) -> DecodeResult {
    let skip = (0..buf.len())
        .find(|&i| is_magic_prefix(&buf[i..]))
        .unwrap_or(buf.len());
    if skip > 0 {
        buf.advance(skip);
        trace!(dropped = skip, "Dropped bytes while resynchronizing");
        return DecodeResult::BadMagic { dropped: skip };
    }

    if buf.len() < FRAME_SIZE {
        return DecodeResult::Incomplete;
    }

    let frame = buf.split_to(FRAME_SIZE);
    let mut body = [0u8; PACKET_SIZE];
    body.copy_from_slice(&frame[MAGIC_LEN..MAGIC_LEN + PACKET_SIZE]);

    if checksum(&body) != frame[FRAME_SIZE - 1] {
        return DecodeResult::ChecksumBad {
            consumed: FRAME_SIZE,
        };
    }

    match Packet::from_body(&body) {
        Some(packet) => DecodeResult::Complete {
            packet,
            consumed: FRAME_SIZE,
        },
        None => DecodeResult::Malformed {
            consumed: FRAME_SIZE,
        },
    }
}

/// Per-stream decode state
///
/// Holds the bytes of the frame in progress between calls. The accumulator
/// never performs I/O; callers feed it whatever they read and act on the
/// returned [`DecodeResult`]. When one chunk may carry several frames, keep
/// calling [`FrameAccumulator::poll_frame`] until it returns `Incomplete`.
#[derive(Debug, Default)]
pub struct FrameAccumulator {
    buf: BytesMut,
}

impl FrameAccumulator {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(FRAME_SIZE * 2),
        }
    }

    /// Append `bytes` and evaluate the frame at the head of the accumulator
    pub fn decode_incremental(&mut self, bytes: &[u8]) -> DecodeResult {
        self.buf.extend_from_slice(bytes);
        self.poll_frame()
    }

    /// Evaluate the accumulator again without new input
    pub fn poll_frame(&mut self) -> DecodeResult {
        decode_frame(&mut self.buf)
    }

    /// Number of bytes held for the frame in progress
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// Events yielded by [`SerialCodec`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialEvent {
    Packet(Packet),
    ChecksumBad,
    Malformed,
    BadMagic { dropped: usize },
}

/// Tokio codec for the serial link
///
/// Framing failures are yielded as events rather than errors so a
/// `FramedRead` keeps running across corrupted input.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialCodec;

impl Decoder for SerialCodec {
    type Item = SerialEvent;
    type Error = GatewayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let event = match decode_frame(src) {
            DecodeResult::Incomplete => return Ok(None),
            DecodeResult::Complete { packet, .. } => SerialEvent::Packet(packet),
            DecodeResult::ChecksumBad { .. } => SerialEvent::ChecksumBad,
            DecodeResult::Malformed { .. } => SerialEvent::Malformed,
            DecodeResult::BadMagic { dropped } => SerialEvent::BadMagic { dropped },
        };
        Ok(Some(event))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(event) => Ok(Some(event)),
            None => {
                if !src.is_empty() {
                    debug!(bytes = src.len(), "Discarding partial frame at end of stream");
                    src.clear();
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Packet> for SerialCodec {
    type Error = GatewayError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(FRAME_SIZE);
        dst.extend_from_slice(&encode(&item));
        Ok(())
    }
}
