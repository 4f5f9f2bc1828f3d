use std::fmt;

use crate::utils::error::BridgeError;

pub const HEADER_LEN: usize = 10;

/// ICF of a command that expects a response.
pub const ICF_COMMAND: u8 = 0x80;
/// ICF of a response.
pub const ICF_RESPONSE: u8 = 0xC0;
/// Gateway count sent in responses.
pub const GCT_DEFAULT: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandCode {
    AreaRead,
    AreaWrite,
    StatusRead,
}

impl CommandCode {
    pub fn code(&self) -> u16 {
        match self {
            CommandCode::AreaRead => 0x0101,
            CommandCode::AreaWrite => 0x0102,
            CommandCode::StatusRead => 0x0601,
        }
    }

    /// Read-type commands carry a data payload in their response.
    pub fn returns_data(&self) -> bool {
        !matches!(self, CommandCode::AreaWrite)
    }
}

impl TryFrom<u16> for CommandCode {
    type Error = BridgeError;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        match code {
            0x0101 => Ok(CommandCode::AreaRead),
            0x0102 => Ok(CommandCode::AreaWrite),
            0x0601 => Ok(CommandCode::StatusRead),
            other => Err(BridgeError::UnsupportedCommand(other)),
        }
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandCode::AreaRead => "MEMORY AREA READ",
            CommandCode::AreaWrite => "MEMORY AREA WRITE",
            CommandCode::StatusRead => "CONTROLLER STATUS READ",
        };
        write!(f, "{:04X} ({})", self.code(), name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinsHeader {
    pub icf: u8,
    pub rsv: u8,
    pub gct: u8,
    pub dna: u8,
    pub da1: u8,
    pub da2: u8,
    pub sna: u8,
    pub sa1: u8,
    pub sa2: u8,
    pub sid: u8,
}

impl FinsHeader {
    pub fn from_bytes(bytes: &[u8; HEADER_LEN]) -> Self {
        Self {
            icf: bytes[0],
            rsv: bytes[1],
            gct: bytes[2],
            dna: bytes[3],
            da1: bytes[4],
            da2: bytes[5],
            sna: bytes[6],
            sa1: bytes[7],
            sa2: bytes[8],
            sid: bytes[9],
        }
    }

    /// Header of the response to a request from `client_node`.
    pub fn response(client_node: u8, own_node: u8, sid: u8) -> Self {
        Self {
            icf: ICF_RESPONSE,
            rsv: 0x00,
            gct: GCT_DEFAULT,
            dna: 0x00,
            da1: client_node,
            da2: 0x00,
            sna: 0x00,
            sa1: own_node,
            sa2: 0x00,
            sid,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        [
            self.icf, self.rsv, self.gct, self.dna, self.da1, self.da2, self.sna, self.sa1,
            self.sa2, self.sid,
        ]
    }
}

/// Memory area, 3-byte address (word + bit) and item count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AreaSpec {
    pub area: u8,
    pub address: [u8; 3],
    pub count: u16,
}

impl AreaSpec {
    pub fn word_address(&self) -> u16 {
        u16::from_be_bytes([self.address[0], self.address[1]])
    }

    pub fn bit(&self) -> u8 {
        self.address[2]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinsCommand {
    AreaRead(AreaSpec),
    AreaWrite(AreaSpec, Vec<u8>),
    StatusRead,
}

impl FinsCommand {
    pub fn code(&self) -> CommandCode {
        match self {
            FinsCommand::AreaRead(_) => CommandCode::AreaRead,
            FinsCommand::AreaWrite(_, _) => CommandCode::AreaWrite,
            FinsCommand::StatusRead => CommandCode::StatusRead,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinsRequest {
    pub header: FinsHeader,
    pub command: FinsCommand,
}

impl FinsRequest {
    pub fn source_node(&self) -> u8 {
        self.header.sa1
    }

    pub fn destination_node(&self) -> u8 {
        self.header.da1
    }

    pub fn sequence_id(&self) -> u8 {
        self.header.sid
    }

    pub fn command_code(&self) -> CommandCode {
        self.command.code()
    }
}

impl fmt::Display for FinsRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cmd {} node {}->{} sid {:02X}",
            self.command_code(),
            self.source_node(),
            self.destination_node(),
            self.sequence_id()
        )?;
        match &self.command {
            FinsCommand::AreaRead(spec) => write!(
                f,
                " area {:02X} addr {}.{:02} count {}",
                spec.area,
                spec.word_address(),
                spec.bit(),
                spec.count
            ),
            FinsCommand::AreaWrite(spec, payload) => write!(
                f,
                " area {:02X} addr {}.{:02} count {} payload {} bytes",
                spec.area,
                spec.word_address(),
                spec.bit(),
                spec.count,
                payload.len()
            ),
            FinsCommand::StatusRead => Ok(()),
        }
    }
}
