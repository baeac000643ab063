use std::{fmt, io, net::SocketAddr, str::FromStr};

use serde::{Deserialize, Serialize};

/// Datagrams larger than this are truncated by the receiver and fail to decode.
pub const MAX_DATAGRAM: usize = 64 * 1024;

/// Identifies one write attempt across the whole cluster.
///
/// The origin address is part of the id, so two replicas can never hand out
/// the same id. On the wire it travels as `"host:port:seq"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WriteId {
    pub origin: SocketAddr,
    pub seq: u64,
}

impl WriteId {
    pub fn new(origin: SocketAddr, seq: u64) -> Self {
        Self { origin, seq }
    }
}

impl fmt::Display for WriteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.origin, self.seq)
    }
}

impl FromStr for WriteId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (origin, seq) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("write id '{s}' has no sequence number"))?;
        let origin = origin
            .parse()
            .map_err(|err| format!("write id '{s}' has a bad origin: {err}"))?;
        let seq = seq
            .parse()
            .map_err(|err| format!("write id '{s}' has a bad sequence number: {err}"))?;
        Ok(Self { origin, seq })
    }
}

impl TryFrom<String> for WriteId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<WriteId> for String {
    fn from(id: WriteId) -> Self {
        id.to_string()
    }
}

/// Where a reply goes: the client address plus the request number the client
/// attached, which replies echo back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requester {
    pub addr: SocketAddr,
    pub request: Option<u64>,
}

impl Requester {
    pub fn new(addr: SocketAddr, request: Option<u64>) -> Self {
        Self { addr, request }
    }
}

impl From<SocketAddr> for Requester {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr, None)
    }
}

/// Every datagram exchanged between clients and replicas.
///
/// `request` is optional on the client-facing messages. A replica copies the
/// number from `client_write`/`client_read` into the matching result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    ClientWrite {
        keys: Vec<String>,
        values: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request: Option<u64>,
    },
    ClientRead {
        key: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request: Option<u64>,
    },
    Write {
        id: WriteId,
        keys: Vec<String>,
        values: Vec<String>,
        from: SocketAddr,
    },
    Acknowledge {
        id: WriteId,
        from: SocketAddr,
    },
    ClientWriteAck {
        id: WriteId,
    },
    WriteOrder {
        id: WriteId,
        index: u64,
    },
    WriteResult {
        key: Vec<String>,
        value: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request: Option<u64>,
    },
    ReadResult {
        key: Vec<String>,
        value: Vec<Option<String>>,
        order_index: Vec<Option<u64>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request: Option<u64>,
    },
    Exit,
}

impl Message {
    /// The `type` tag this message carries on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::ClientWrite { .. } => "client_write",
            Message::ClientRead { .. } => "client_read",
            Message::Write { .. } => "write",
            Message::Acknowledge { .. } => "acknowledge",
            Message::ClientWriteAck { .. } => "client_write_ack",
            Message::WriteOrder { .. } => "write_order",
            Message::WriteResult { .. } => "write_result",
            Message::ReadResult { .. } => "read_result",
            Message::Exit => "exit",
        }
    }

    /// Request number of a client-facing message, if it carries one.
    pub fn request(&self) -> Option<u64> {
        match self {
            Message::ClientWrite { request, .. }
            | Message::ClientRead { request, .. }
            | Message::WriteResult { request, .. }
            | Message::ReadResult { request, .. } => *request,
            _ => None,
        }
    }
}

pub fn encode(message: &Message) -> io::Result<Vec<u8>> {
    serde_json::to_vec(message).map_err(to_io_error)
}

pub fn decode(datagram: &[u8]) -> io::Result<Message> {
    serde_json::from_slice(datagram).map_err(to_io_error)
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
