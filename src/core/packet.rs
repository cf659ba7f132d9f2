//! # Serial Packet
//!
//! The typed unit of exchange with the embedded controller.
//!
//! Every packet has the same body size regardless of its variant. Fields that a
//! variant does not use are still present on the wire and left zeroed.
//!
//! ## Body Layout (little-endian, matching the controller)
//! ```text
//! [Type(1)] [Command(1)] [Pad(2)] [Data(32)] [Param0(4)] [Param1(4)]
//! ```

/// Size of the free-form data field
pub const DATA_LEN: usize = 32;

/// Number of numeric parameters carried by a packet
pub const PARAM_COUNT: usize = 2;

/// Serialized body size; identical for every variant
pub const PACKET_SIZE: usize = 1 + 1 + 2 + DATA_LEN + PARAM_COUNT * 4;

const DATA_OFFSET: usize = 4;
const PARAMS_OFFSET: usize = DATA_OFFSET + DATA_LEN;

/// Packet variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Command,
    Response,
    Error,
    Message,
    Hello,
}

impl PacketType {
    /// Wire identifier byte
    pub fn type_byte(self) -> u8 {
        match self {
            PacketType::Command => 0,
            PacketType::Response => 1,
            PacketType::Error => 2,
            PacketType::Message => 3,
            PacketType::Hello => 4,
        }
    }

    /// Parse a wire identifier byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(PacketType::Command),
            1 => Some(PacketType::Response),
            2 => Some(PacketType::Error),
            3 => Some(PacketType::Message),
            4 => Some(PacketType::Hello),
            _ => None,
        }
    }
}

/// Opcodes carried by `Command` packets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandOpcode {
    Forward,
    Reverse,
    TurnLeft,
    TurnRight,
    Stop,
    GetStats,
    ClearStats,
    ManualNav,
}

impl CommandOpcode {
    pub fn opcode(self) -> u8 {
        match self {
            CommandOpcode::Forward => 0,
            CommandOpcode::Reverse => 1,
            CommandOpcode::TurnLeft => 2,
            CommandOpcode::TurnRight => 3,
            CommandOpcode::Stop => 4,
            CommandOpcode::GetStats => 5,
            CommandOpcode::ClearStats => 6,
            CommandOpcode::ManualNav => 7,
        }
    }

    pub fn from_opcode(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(CommandOpcode::Forward),
            1 => Some(CommandOpcode::Reverse),
            2 => Some(CommandOpcode::TurnLeft),
            3 => Some(CommandOpcode::TurnRight),
            4 => Some(CommandOpcode::Stop),
            5 => Some(CommandOpcode::GetStats),
            6 => Some(CommandOpcode::ClearStats),
            7 => Some(CommandOpcode::ManualNav),
            _ => None,
        }
    }

    /// Map an operator key to an opcode (case-insensitive)
    ///
    /// `w/s/a/d/p/c/g/t` map to forward, reverse, turn-left, turn-right,
    /// stop, clear-stats, get-stats and manual-nav.
    pub fn from_key(key: u8) -> Option<Self> {
        match key.to_ascii_lowercase() {
            b'w' => Some(CommandOpcode::Forward),
            b's' => Some(CommandOpcode::Reverse),
            b'a' => Some(CommandOpcode::TurnLeft),
            b'd' => Some(CommandOpcode::TurnRight),
            b'p' => Some(CommandOpcode::Stop),
            b'c' => Some(CommandOpcode::ClearStats),
            b'g' => Some(CommandOpcode::GetStats),
            b't' => Some(CommandOpcode::ManualNav),
            _ => None,
        }
    }
}

/// Opcodes carried by `Response` packets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseCode {
    Ok,
    Status,
    BadPacket,
    BadChecksum,
    BadCommand,
    BadResponse,
}

impl ResponseCode {
    pub fn code(self) -> u8 {
        match self {
            ResponseCode::Ok => 0,
            ResponseCode::Status => 1,
            ResponseCode::BadPacket => 2,
            ResponseCode::BadChecksum => 3,
            ResponseCode::BadCommand => 4,
            ResponseCode::BadResponse => 5,
        }
    }

    pub fn from_code(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(ResponseCode::Ok),
            1 => Some(ResponseCode::Status),
            2 => Some(ResponseCode::BadPacket),
            3 => Some(ResponseCode::BadChecksum),
            4 => Some(ResponseCode::BadCommand),
            5 => Some(ResponseCode::BadResponse),
            _ => None,
        }
    }
}

/// A decoded serial packet
///
/// `data` is a fixed-width field. It is not guaranteed to contain a NUL and
/// must never be treated as a C string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub command: u8,
    pub params: [u32; PARAM_COUNT],
    pub data: [u8; DATA_LEN],
}

impl Packet {
    /// A zeroed packet of the given variant
    pub fn new(packet_type: PacketType) -> Self {
        Self {
            packet_type,
            command: 0,
            params: [0; PARAM_COUNT],
            data: [0; DATA_LEN],
        }
    }

    /// Startup greeting sent to the controller
    pub fn hello() -> Self {
        Self::new(PacketType::Hello)
    }

    pub fn command(opcode: CommandOpcode, params: [u32; PARAM_COUNT]) -> Self {
        Self {
            command: opcode.opcode(),
            params,
            ..Self::new(PacketType::Command)
        }
    }

    pub fn response(code: ResponseCode, params: [u32; PARAM_COUNT]) -> Self {
        Self {
            command: code.code(),
            params,
            ..Self::new(PacketType::Response)
        }
    }

    /// Error report for the command with the given raw opcode
    pub fn error(opcode: u8) -> Self {
        Self {
            command: opcode,
            ..Self::new(PacketType::Error)
        }
    }

    /// Text message; input longer than the data field is truncated
    pub fn message(text: &[u8]) -> Self {
        let mut data = [0u8; DATA_LEN];
        let len = text.len().min(DATA_LEN);
        data[..len].copy_from_slice(&text[..len]);
        Self {
            data,
            ..Self::new(PacketType::Message)
        }
    }

    /// Serialize the packet body
    pub fn to_body(&self) -> [u8; PACKET_SIZE] {
        let mut body = [0u8; PACKET_SIZE];
        body[0] = self.packet_type.type_byte();
        body[1] = self.command;
        body[DATA_OFFSET..PARAMS_OFFSET].copy_from_slice(&self.data);
        for (i, param) in self.params.iter().enumerate() {
            let start = PARAMS_OFFSET + i * 4;
            body[start..start + 4].copy_from_slice(&param.to_le_bytes());
        }
        body
    }

    /// Parse a packet body
    ///
    /// Returns `None` if the type byte is not a known variant.
    pub fn from_body(body: &[u8; PACKET_SIZE]) -> Option<Self> {
        let packet_type = PacketType::from_byte(body[0])?;

        let mut data = [0u8; DATA_LEN];
        data.copy_from_slice(&body[DATA_OFFSET..PARAMS_OFFSET]);

        let mut params = [0u32; PARAM_COUNT];
        for (i, param) in params.iter_mut().enumerate() {
            let start = PARAMS_OFFSET + i * 4;
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&body[start..start + 4]);
            *param = u32::from_le_bytes(raw);
        }

        Some(Self {
            packet_type,
            command: body[1],
            params,
            data,
        })
    }
}
