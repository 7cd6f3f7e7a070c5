//! Packets exchanged on a logical channel
//!
//! Every packet is self-describing through its [`PacketType`]. Control
//! payloads are JSON; DATA carries a short binary header followed by the
//! block bytes.

use crate::error::{FerryError, Result};
use ferry_types::{BandwidthLimit, ErrorCode, TaskKey, TransferMode};
use serde::{Deserialize, Serialize};

/// Wire protocol revision announced in AUTHENT
pub const PROTOCOL_VERSION: u32 = 1;

const FLAG_COMPRESSED: u8 = 0b0000_0001;
const DATA_HEADER_LEN: usize = 8 + 1 + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Authent = 1,
    Request = 2,
    Data = 3,
    EndTransfer = 4,
    EndRequest = 5,
    Valid = 6,
    Error = 7,
    Shutdown = 8,
    Block = 9,
    Stop = 10,
    Cancel = 11,
    Bandwidth = 12,
    KeepAlive = 13,
    Test = 14,
    Information = 15,
    Business = 16,
    RankAck = 17,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => PacketType::Authent,
            2 => PacketType::Request,
            3 => PacketType::Data,
            4 => PacketType::EndTransfer,
            5 => PacketType::EndRequest,
            6 => PacketType::Valid,
            7 => PacketType::Error,
            8 => PacketType::Shutdown,
            9 => PacketType::Block,
            10 => PacketType::Stop,
            11 => PacketType::Cancel,
            12 => PacketType::Bandwidth,
            13 => PacketType::KeepAlive,
            14 => PacketType::Test,
            15 => PacketType::Information,
            16 => PacketType::Business,
            17 => PacketType::RankAck,
            _ => return None,
        })
    }

    /// Largest payload accepted for this type
    pub fn max_payload(self, max_blocksize: u32) -> usize {
        match self {
            // Block, header, digest, and room for incompressible data.
            PacketType::Data => max_blocksize as usize + DATA_HEADER_LEN + 255 + 1024,
            PacketType::Valid | PacketType::Information => 4 * 1024 * 1024,
            _ => 64 * 1024,
        }
    }
}

// ============================================================================
// Payloads
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authent {
    pub host_id: String,
    /// Challenge the receiver must answer in its proof; empty once answered
    pub nonce: String,
    /// Hex SHA-256 over the host id, its shared key and the peer's nonce;
    /// empty in the opening hello
    pub proof: String,
    pub version: u32,
    pub use_compression: bool,
    pub use_block_digest: bool,
    pub answer: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub special_id: i64,
    pub requester: String,
    pub requested: String,
    pub rule_id: String,
    pub filename: String,
    pub file_info: String,
    pub mode: TransferMode,
    pub blocksize: u32,
    /// Proposed resume rank; the answer carries the agreed one.
    pub rank: u64,
    pub file_size: Option<u64>,
    pub use_digest: bool,
    pub compression: bool,
    pub block_digest: bool,
    pub answer: bool,
}

impl TransferRequest {
    pub fn key(&self) -> TaskKey {
        TaskKey::new(self.special_id, self.requester.clone(), self.requested.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBlock {
    pub rank: u64,
    pub compressed: bool,
    /// Hex SHA-256 of the uncompressed block when per-block digests are on
    pub digest: Option<String>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndTransfer {
    /// Whole-file digest
    pub digest: Option<String>,
    /// Number of blocks sent
    pub rank: u64,
    pub answer: bool,
}

/// Blocks the receiver has written and persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankAck {
    pub rank: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndRequest {
    pub code: ErrorCode,
    pub message: Option<String>,
    pub answer: bool,
}

/// Positive answer to a control or information request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Valid {
    pub code: ErrorCode,
    pub info: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPacket {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyedControl {
    pub key: TaskKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthPacket {
    /// New limits, or `None` to only query them
    pub set: Option<BandwidthLimit>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InfoKind {
    Exist,
    List,
    MlsDetail,
    MlsList,
    Transfer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InformationPacket {
    pub kind: InfoKind,
    pub rule_id: String,
    pub filename: Option<String>,
    pub key: Option<TaskKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessPacket {
    pub name: String,
    pub args: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestPacket {
    pub message: String,
    pub answer: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flag {
    pub value: bool,
}

// ============================================================================
// Packet
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Authent(Authent),
    Request(TransferRequest),
    Data(DataBlock),
    EndTransfer(EndTransfer),
    EndRequest(EndRequest),
    Valid(Valid),
    Error(ErrorPacket),
    /// `value` asks the peer to restart after shutting down
    Shutdown(Flag),
    /// `value` blocks new requests, `false` lifts the block
    Block(Flag),
    Stop(KeyedControl),
    Cancel(KeyedControl),
    Bandwidth(BandwidthPacket),
    /// `value` marks the echo
    KeepAlive(Flag),
    Test(TestPacket),
    Information(InformationPacket),
    Business(BusinessPacket),
    RankAck(RankAck),
}

impl Packet {
    pub fn kind(&self) -> PacketType {
        match self {
            Packet::Authent(_) => PacketType::Authent,
            Packet::Request(_) => PacketType::Request,
            Packet::Data(_) => PacketType::Data,
            Packet::EndTransfer(_) => PacketType::EndTransfer,
            Packet::EndRequest(_) => PacketType::EndRequest,
            Packet::Valid(_) => PacketType::Valid,
            Packet::Error(_) => PacketType::Error,
            Packet::Shutdown(_) => PacketType::Shutdown,
            Packet::Block(_) => PacketType::Block,
            Packet::Stop(_) => PacketType::Stop,
            Packet::Cancel(_) => PacketType::Cancel,
            Packet::Bandwidth(_) => PacketType::Bandwidth,
            Packet::KeepAlive(_) => PacketType::KeepAlive,
            Packet::Test(_) => PacketType::Test,
            Packet::Information(_) => PacketType::Information,
            Packet::Business(_) => PacketType::Business,
            Packet::RankAck(_) => PacketType::RankAck,
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Packet::Error(ErrorPacket {
            code,
            message: message.into(),
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            Packet::Data(block) => encode_data(block)?,
            Packet::Authent(p) => serde_json::to_vec(p)?,
            Packet::Request(p) => serde_json::to_vec(p)?,
            Packet::EndTransfer(p) => serde_json::to_vec(p)?,
            Packet::EndRequest(p) => serde_json::to_vec(p)?,
            Packet::Valid(p) => serde_json::to_vec(p)?,
            Packet::Error(p) => serde_json::to_vec(p)?,
            Packet::Shutdown(p) | Packet::Block(p) | Packet::KeepAlive(p) => serde_json::to_vec(p)?,
            Packet::Stop(p) | Packet::Cancel(p) => serde_json::to_vec(p)?,
            Packet::Bandwidth(p) => serde_json::to_vec(p)?,
            Packet::Test(p) => serde_json::to_vec(p)?,
            Packet::Information(p) => serde_json::to_vec(p)?,
            Packet::Business(p) => serde_json::to_vec(p)?,
            Packet::RankAck(p) => serde_json::to_vec(p)?,
        };
        Ok(bytes)
    }

    pub fn decode(kind: PacketType, payload: &[u8]) -> Result<Self> {
        fn json<T: serde::de::DeserializeOwned>(kind: PacketType, payload: &[u8]) -> Result<T> {
            serde_json::from_slice(payload)
                .map_err(|e| FerryError::Protocol(format!("malformed {kind:?} packet: {e}")))
        }

        Ok(match kind {
            PacketType::Data => Packet::Data(decode_data(payload)?),
            PacketType::Authent => Packet::Authent(json(kind, payload)?),
            PacketType::Request => Packet::Request(json(kind, payload)?),
            PacketType::EndTransfer => Packet::EndTransfer(json(kind, payload)?),
            PacketType::EndRequest => Packet::EndRequest(json(kind, payload)?),
            PacketType::Valid => Packet::Valid(json(kind, payload)?),
            PacketType::Error => Packet::Error(json(kind, payload)?),
            PacketType::Shutdown => Packet::Shutdown(json(kind, payload)?),
            PacketType::Block => Packet::Block(json(kind, payload)?),
            PacketType::Stop => Packet::Stop(json(kind, payload)?),
            PacketType::Cancel => Packet::Cancel(json(kind, payload)?),
            PacketType::Bandwidth => Packet::Bandwidth(json(kind, payload)?),
            PacketType::KeepAlive => Packet::KeepAlive(json(kind, payload)?),
            PacketType::Test => Packet::Test(json(kind, payload)?),
            PacketType::Information => Packet::Information(json(kind, payload)?),
            PacketType::Business => Packet::Business(json(kind, payload)?),
            PacketType::RankAck => Packet::RankAck(json(kind, payload)?),
        })
    }
}

fn encode_data(block: &DataBlock) -> Result<Vec<u8>> {
    let digest = block.digest.as_deref().unwrap_or("").as_bytes();
    if digest.len() > u8::MAX as usize {
        return Err(FerryError::Protocol("block digest too long".into()));
    }

    let mut out = Vec::with_capacity(DATA_HEADER_LEN + digest.len() + block.payload.len());
    out.extend_from_slice(&block.rank.to_be_bytes());
    out.push(if block.compressed { FLAG_COMPRESSED } else { 0 });
    out.push(digest.len() as u8);
    out.extend_from_slice(digest);
    out.extend_from_slice(&block.payload);
    Ok(out)
}

fn decode_data(payload: &[u8]) -> Result<DataBlock> {
    if payload.len() < DATA_HEADER_LEN {
        return Err(FerryError::Protocol("truncated DATA header".into()));
    }
    let mut rank = [0u8; 8];
    rank.copy_from_slice(&payload[..8]);
    let flags = payload[8];
    let digest_len = payload[9] as usize;
    let body = &payload[DATA_HEADER_LEN..];
    if body.len() < digest_len {
        return Err(FerryError::Protocol("truncated DATA digest".into()));
    }
    let digest = if digest_len == 0 {
        None
    } else {
        Some(
            std::str::from_utf8(&body[..digest_len])
                .map_err(|_| FerryError::Protocol("DATA digest is not text".into()))?
                .to_string(),
        )
    };

    Ok(DataBlock {
        rank: u64::from_be_bytes(rank),
        compressed: flags & FLAG_COMPRESSED != 0,
        digest,
        payload: body[digest_len..].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_header_carries_rank_flags_and_digest() {
        let block = DataBlock {
            rank: 41,
            compressed: true,
            digest: Some("abcd".into()),
            payload: vec![1, 2, 3],
        };
        let bytes = Packet::Data(block.clone()).encode().unwrap();
        assert_eq!(bytes.len(), DATA_HEADER_LEN + 4 + 3);
        assert_eq!(Packet::decode(PacketType::Data, &bytes).unwrap(), Packet::Data(block));
    }

    #[test]
    fn truncated_data_is_a_protocol_error() {
        assert!(matches!(
            Packet::decode(PacketType::Data, &[0, 1, 2]),
            Err(FerryError::Protocol(_))
        ));
        let mut bytes = vec![0u8; DATA_HEADER_LEN];
        bytes[9] = 10;
        assert!(Packet::decode(PacketType::Data, &bytes).is_err());
    }

    #[test]
    fn malformed_json_is_a_protocol_error() {
        assert!(matches!(
            Packet::decode(PacketType::Request, b"{not json"),
            Err(FerryError::Protocol(_))
        ));
    }

    #[test]
    fn every_type_code_maps_back() {
        for code in 1..=17u8 {
            let kind = PacketType::from_u8(code).unwrap();
            assert_eq!(kind as u8, code);
        }
        assert_eq!(PacketType::from_u8(0), None);
        assert_eq!(PacketType::from_u8(18), None);
    }
}
