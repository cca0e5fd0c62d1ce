//! Packet types: fixed header, JSON body, and the integer-coded enums
//! both carry on the wire.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::{NodeId, ProtocolError, HEADER_SIZE, UNASSIGNED_NODE};

// ============================================================================
// Enumerations
// ============================================================================

/// Kind of process at either end of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminalType {
    None,
    MatchingServer,
    MatchingClient,
    RoomServer,
    PacketGenerator,
    MonitoringServer,
    ConfigServer,
    ConnectionServer,
}

impl From<TerminalType> for i32 {
    fn from(t: TerminalType) -> i32 {
        match t {
            TerminalType::None => 0,
            TerminalType::MatchingServer => 1,
            TerminalType::MatchingClient => 2,
            TerminalType::RoomServer => 3,
            TerminalType::PacketGenerator => 4,
            TerminalType::MonitoringServer => 5,
            TerminalType::ConfigServer => 6,
            TerminalType::ConnectionServer => 7,
        }
    }
}

impl TryFrom<i32> for TerminalType {
    type Error = ProtocolError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => TerminalType::None,
            1 => TerminalType::MatchingServer,
            2 => TerminalType::MatchingClient,
            3 => TerminalType::RoomServer,
            4 => TerminalType::PacketGenerator,
            5 => TerminalType::MonitoringServer,
            6 => TerminalType::ConfigServer,
            7 => TerminalType::ConnectionServer,
            other => return Err(ProtocolError::UnknownTerminal(other)),
        })
    }
}

/// Operation carried in the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum Command {
    NotSet,
    IdRequest,
    IdResponse,
    ListRequest,
    ListResponse,
    IdVerify,
    IdVerifyResponse,
    IdTransmit,
    IdTransmitResponse,
    HealthCheckRequest,
    HealthCheckResponse,
}

impl From<Command> for i32 {
    fn from(c: Command) -> i32 {
        match c {
            Command::NotSet => 0,
            Command::IdRequest => 1,
            Command::IdResponse => 2,
            Command::ListRequest => 3,
            Command::ListResponse => 4,
            Command::IdVerify => 5,
            Command::IdVerifyResponse => 6,
            Command::IdTransmit => 7,
            Command::IdTransmitResponse => 8,
            Command::HealthCheckRequest => 9,
            Command::HealthCheckResponse => 10,
        }
    }
}

impl TryFrom<i32> for Command {
    type Error = ProtocolError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => Command::NotSet,
            1 => Command::IdRequest,
            2 => Command::IdResponse,
            3 => Command::ListRequest,
            4 => Command::ListResponse,
            5 => Command::IdVerify,
            6 => Command::IdVerifyResponse,
            7 => Command::IdTransmit,
            8 => Command::IdTransmitResponse,
            9 => Command::HealthCheckRequest,
            10 => Command::HealthCheckResponse,
            other => return Err(ProtocolError::UnknownCommand(other)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum Status {
    None,
    Success,
    Fail,
    NotSet,
}

impl From<Status> for i32 {
    fn from(s: Status) -> i32 {
        match s {
            Status::None => 0,
            Status::Success => 1,
            Status::Fail => 2,
            Status::NotSet => 3,
        }
    }
}

impl TryFrom<i32> for Status {
    type Error = ProtocolError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => Status::None,
            1 => Status::Success,
            2 => Status::Fail,
            3 => Status::NotSet,
            other => return Err(ProtocolError::UnknownStatus(other)),
        })
    }
}

// ============================================================================
// Header
// ============================================================================

/// Fixed-layout packet header. `length` is the byte length of the body
/// that immediately follows and is overwritten by [`crate::pack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub length: i32,
    pub src_type: TerminalType,
    pub src_code: NodeId,
    pub dst_type: TerminalType,
    pub dst_code: NodeId,
}

impl Header {
    pub fn new(
        src_type: TerminalType,
        src_code: NodeId,
        dst_type: TerminalType,
        dst_code: NodeId,
    ) -> Self {
        Self {
            length: 0,
            src_type,
            src_code,
            dst_type,
            dst_code,
        }
    }

    /// Header for a message from a matching server to the authority.
    pub fn to_authority(src_code: NodeId) -> Self {
        Self::new(
            TerminalType::MatchingServer,
            src_code,
            TerminalType::ConfigServer,
            UNASSIGNED_NODE,
        )
    }

    /// Header for a message between two matching servers.
    pub fn to_peer(src_code: NodeId, dst_code: NodeId) -> Self {
        Self::new(
            TerminalType::MatchingServer,
            src_code,
            TerminalType::MatchingServer,
            dst_code,
        )
    }

    pub fn write_to<B: BufMut>(&self, dst: &mut B) {
        dst.put_i32_le(self.length);
        dst.put_i32_le(self.src_type.into());
        dst.put_i32_le(self.src_code);
        dst.put_i32_le(self.dst_type.into());
        dst.put_i32_le(self.dst_code);
    }

    /// Read a header from the first [`HEADER_SIZE`] bytes of `src`.
    pub fn read_from(mut src: &[u8]) -> Result<Self, ProtocolError> {
        if src.len() < HEADER_SIZE {
            return Err(ProtocolError::Undersized {
                size: src.len(),
                min: HEADER_SIZE,
            });
        }
        let length = src.get_i32_le();
        let src_type = TerminalType::try_from(src.get_i32_le())?;
        let src_code = src.get_i32_le();
        let dst_type = TerminalType::try_from(src.get_i32_le())?;
        let dst_code = src.get_i32_le();
        Ok(Self {
            length,
            src_type,
            src_code,
            dst_type,
            dst_code,
        })
    }
}

// ============================================================================
// Body / Packet
// ============================================================================

/// Packet body. `data1`/`data2` are free-form and interpreted per command:
/// node IDs for ID/verify traffic, node ID + IP for list responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Body {
    pub cmd: Command,
    pub status: Status,
    #[serde(default)]
    pub data1: String,
    #[serde(default)]
    pub data2: String,
}

/// A decoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub body: Body,
}

impl Packet {
    pub fn command(&self) -> Command {
        self.body.cmd
    }

    pub fn status(&self) -> Status {
        self.body.status
    }

    /// The sender's node code as claimed in the header.
    pub fn sender(&self) -> NodeId {
        self.header.src_code
    }

    /// Interpret `data1` as a node code.
    pub fn data1_node_id(&self) -> Option<NodeId> {
        self.body.data1.trim().parse().ok()
    }
}
