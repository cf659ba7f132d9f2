//! # Network Messages
//!
//! Application-level messages exchanged with the operator over TLS, and the
//! Tokio codecs for both ends of the connection.
//!
//! Every message starts with a tag byte:
//!
//! | Tag | Value | Direction | Payload |
//! |---|---|---|---|
//! | Error/Ack | 0 | out | 1 byte result code |
//! | Status | 1 | out | 2 x u32 |
//! | Message | 2 | out | 32 raw bytes |
//! | Command | 3 | in | 1 byte command key + 2 x u32 |
//!
//! Integers are in network byte order (big-endian).

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace};

use crate::core::packet::{DATA_LEN, PARAM_COUNT};
use crate::error::{GatewayError, Result};

/// Leading byte of every network message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetTag {
    /// Command result; also used for plain acknowledgements
    Error,
    Status,
    Message,
    Command,
}

impl NetTag {
    pub fn tag_byte(self) -> u8 {
        match self {
            NetTag::Error => 0,
            NetTag::Status => 1,
            NetTag::Message => 2,
            NetTag::Command => 3,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(NetTag::Error),
            1 => Some(NetTag::Status),
            2 => Some(NetTag::Message),
            3 => Some(NetTag::Command),
            _ => None,
        }
    }
}

const PARAMS_LEN: usize = PARAM_COUNT * 4;

/// Length of an inbound command message, tag included
pub const COMMAND_LEN: usize = 2 + PARAMS_LEN;
/// Length of an outbound acknowledgement, tag included
pub const ACK_LEN: usize = 2;
/// Length of an outbound status message, tag included
pub const STATUS_LEN: usize = 1 + PARAMS_LEN;
/// Length of an outbound text message, tag included
pub const TEXT_LEN: usize = 1 + DATA_LEN;

fn ensure_len(buf: &[u8], needed: usize) -> Result<()> {
    if buf.len() < needed {
        return Err(GatewayError::Truncated {
            needed,
            got: buf.len(),
        });
    }
    Ok(())
}

fn read_params(buf: &[u8]) -> Result<[u32; PARAM_COUNT]> {
    ensure_len(buf, PARAMS_LEN)?;
    let mut params = [0u32; PARAM_COUNT];
    for (i, param) in params.iter_mut().enumerate() {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&buf[i * 4..i * 4 + 4]);
        *param = u32::from_be_bytes(raw);
    }
    Ok(params)
}

/// Operator command as received from the network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperatorCommand {
    /// ASCII command key (`w`, `s`, `a`, ...)
    pub key: u8,
    pub params: [u32; PARAM_COUNT],
}

impl OperatorCommand {
    pub fn new(key: u8, params: [u32; PARAM_COUNT]) -> Self {
        Self { key, params }
    }

    /// Parse a full command message, tag byte included
    pub fn parse(buf: &[u8]) -> Result<Self> {
        ensure_len(buf, COMMAND_LEN)?;
        if buf[0] != NetTag::Command.tag_byte() {
            return Err(GatewayError::UnexpectedTag(buf[0]));
        }
        Ok(Self {
            key: buf[1],
            params: read_params(&buf[2..])?,
        })
    }

    pub fn to_bytes(&self) -> [u8; COMMAND_LEN] {
        let mut out = [0u8; COMMAND_LEN];
        out[0] = NetTag::Command.tag_byte();
        out[1] = self.key;
        for (i, param) in self.params.iter().enumerate() {
            out[2 + i * 4..6 + i * 4].copy_from_slice(&param.to_be_bytes());
        }
        out
    }
}

/// Message sent from the gateway to the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayMessage {
    /// Result code: `ResponseCode::Ok` on success, otherwise the failing opcode
    Ack { code: u8 },
    /// Controller telemetry
    Status { params: [u32; PARAM_COUNT] },
    /// Free text copied verbatim from the controller
    Text { data: [u8; DATA_LEN] },
}

impl GatewayMessage {
    pub fn tag(&self) -> NetTag {
        match self {
            GatewayMessage::Ack { .. } => NetTag::Error,
            GatewayMessage::Status { .. } => NetTag::Status,
            GatewayMessage::Text { .. } => NetTag::Message,
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            GatewayMessage::Ack { .. } => ACK_LEN,
            GatewayMessage::Status { .. } => STATUS_LEN,
            GatewayMessage::Text { .. } => TEXT_LEN,
        }
    }

    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_u8(self.tag().tag_byte());
        match self {
            GatewayMessage::Ack { code } => dst.put_u8(*code),
            GatewayMessage::Status { params } => {
                for param in params {
                    dst.put_u32(*param);
                }
            }
            GatewayMessage::Text { data } => dst.put_slice(data),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.to_vec()
    }

    /// Parse one outbound message from the head of `buf`
    ///
    /// Returns the message and the number of bytes it occupied.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize)> {
        ensure_len(buf, 1)?;
        match NetTag::from_byte(buf[0]) {
            Some(NetTag::Error) => {
                ensure_len(buf, ACK_LEN)?;
                Ok((GatewayMessage::Ack { code: buf[1] }, ACK_LEN))
            }
            Some(NetTag::Status) => {
                ensure_len(buf, STATUS_LEN)?;
                let params = read_params(&buf[1..])?;
                Ok((GatewayMessage::Status { params }, STATUS_LEN))
            }
            Some(NetTag::Message) => {
                ensure_len(buf, TEXT_LEN)?;
                let mut data = [0u8; DATA_LEN];
                data.copy_from_slice(&buf[1..TEXT_LEN]);
                Ok((GatewayMessage::Text { data }, TEXT_LEN))
            }
            _ => Err(GatewayError::UnexpectedTag(buf[0])),
        }
    }
}

/// Unit decoded from the operator's byte stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundFrame {
    Command(OperatorCommand),
    /// A tag byte the gateway does not handle; exactly one byte was consumed
    Ignored(u8),
}

/// Server-side codec: operator commands in, gateway messages out
#[derive(Debug, Default, Clone, Copy)]
pub struct GatewayCodec;

impl Decoder for GatewayCodec {
    type Item = InboundFrame;
    type Error = GatewayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let Some(&tag) = src.first() else {
            return Ok(None);
        };

        if tag != NetTag::Command.tag_byte() {
            src.advance(1);
            trace!(tag, "Skipping unhandled network tag");
            return Ok(Some(InboundFrame::Ignored(tag)));
        }

        if src.len() < COMMAND_LEN {
            return Ok(None);
        }

        let frame = src.split_to(COMMAND_LEN);
        OperatorCommand::parse(&frame).map(|cmd| Some(InboundFrame::Command(cmd)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                if !src.is_empty() {
                    debug!(bytes = src.len(), "Discarding partial command at end of stream");
                    src.clear();
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<GatewayMessage> for GatewayCodec {
    type Error = GatewayError;

    fn encode(&mut self, item: GatewayMessage, dst: &mut BytesMut) -> Result<()> {
        item.encode_into(dst);
        Ok(())
    }
}

/// Client-side codec: operator commands out, gateway messages in
#[derive(Debug, Default, Clone, Copy)]
pub struct OperatorCodec;

impl Decoder for OperatorCodec {
    type Item = GatewayMessage;
    type Error = GatewayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            let Some(&tag) = src.first() else {
                return Ok(None);
            };
            let needed = match NetTag::from_byte(tag) {
                Some(NetTag::Error) => ACK_LEN,
                Some(NetTag::Status) => STATUS_LEN,
                Some(NetTag::Message) => TEXT_LEN,
                _ => {
                    src.advance(1);
                    trace!(tag, "Skipping unknown gateway tag");
                    continue;
                }
            };
            if src.len() < needed {
                return Ok(None);
            }
            let (message, used) = GatewayMessage::parse(&src[..needed])?;
            src.advance(used);
            return Ok(Some(message));
        }
    }
}

impl Encoder<OperatorCommand> for OperatorCodec {
    type Error = GatewayError;

    fn encode(&mut self, item: OperatorCommand, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(&item.to_bytes());
        Ok(())
    }
}
