use glam::Vec3;
use rkyv::{Archive, Deserialize, Serialize, rancor};

pub const MAX_PACKET_SIZE: usize = 1200;
pub const PROTOCOL_VERSION: u32 = 1;
pub const PROTOCOL_MAGIC: u32 = 0x5445_5448;
pub const DEFAULT_PORT: u16 = 27115;

/// Server slot capacity.
pub const MAX_PLAYERS: usize = 64;

/// Connect-token signing keys must be exactly this long.
pub const KEY_BYTES: usize = 32;

const SEQUENCE_WRAP_THRESHOLD: u32 = u32::MAX / 2;

/// Connected-client handle: slot index in the low word, slot generation in
/// the high word. Generations start odd (free) and are bumped on every
/// connect and disconnect, so a handle from a previous occupant of the slot
/// can never validate again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, Serialize, Deserialize)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub struct ClientId(pub u64);

impl ClientId {
    pub fn new(generation: u32, slot: u32) -> Self {
        Self(((generation as u64) << 32) | slot as u64)
    }

    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn slot(self) -> u32 {
        self.0 as u32
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.slot(), self.generation())
    }
}

/// User-assigned replicated-object handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, Serialize, Deserialize)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub struct ObjectId(pub u64);

/// Replicated state of one object.
#[derive(Debug, Clone, Copy, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct ClientData {
    pub moving: bool,
    pub position: Vec3,
    pub direction: Vec3,
}

impl Default for ClientData {
    fn default() -> Self {
        Self {
            moving: false,
            position: Vec3::ZERO,
            direction: Vec3::Z,
        }
    }
}

/// Delivery class of a message channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, Serialize, Deserialize)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub enum Reliability {
    Reliable,
    Unreliable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub struct PacketHeader {
    pub magic: u32,
    pub version: u32,
    pub sequence: u32,
    pub ack: u32,
    pub ack_bitfield: u32,
}

impl PacketHeader {
    pub fn new(sequence: u32, ack: u32, ack_bitfield: u32) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
            sequence,
            ack,
            ack_bitfield,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == PROTOCOL_MAGIC && self.version == PROTOCOL_VERSION
    }
}

#[inline]
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}

/// Payload messages riding inside `PacketType::Messages`. Command and reply
/// kinds are direction-specific; a message arriving at the wrong endpoint
/// is dropped.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum Message {
    /// Dictionary hash tables, sent reliably right after accept. Clients
    /// hold all other traffic until this is installed.
    SendManifest {
        seeds: [u32; 3],
        hash_len: u32,
        mask: u32,
        assignment: Vec<u64>,
        rank: Vec<u32>,
    },
    /// Client-issued command executed on the server.
    ClientCommand {
        id: u32,
        query_id: u64,
        payload: Vec<u8>,
    },
    /// Server-issued command executed on a client.
    ServerCommand {
        id: u32,
        query_id: u64,
        payload: Vec<u8>,
    },
    /// Client's answer to a `ServerCommand` query.
    ClientReply {
        id: u32,
        query_id: u64,
        payload: Vec<u8>,
    },
    /// Server's answer to a `ClientCommand` query.
    ServerReply {
        id: u32,
        query_id: u64,
        payload: Vec<u8>,
    },
    ObjectCreate {
        object: ObjectId,
        data: ClientData,
    },
    ObjectUpdate {
        object: ObjectId,
        data: ClientData,
    },
    ObjectDelete {
        object: ObjectId,
    },
}

/// One channel-stamped message inside a packet.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Envelope {
    pub channel: Reliability,
    pub seq: u64,
    pub message: Message,
}

#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum PacketType {
    ConnectionRequest { token: Vec<u8> },
    ConnectionAccepted { client_id: ClientId },
    ConnectionDenied { reason: String },
    Messages { entries: Vec<Envelope> },
    Ping { timestamp: u64 },
    Pong { timestamp: u64 },
    Disconnect,
}

#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: PacketType,
}

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("deserialization failed: {0}")]
    Deserialize(rancor::Error),
}

impl Packet {
    pub fn new(header: PacketHeader, payload: PacketType) -> Self {
        Self { header, payload }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, PacketError> {
        rkyv::to_bytes::<rancor::Error>(self)
            .map(|aligned| aligned.into_vec())
            .map_err(PacketError::Serialize)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, PacketError> {
        rkyv::from_bytes::<Self, rancor::Error>(data).map_err(PacketError::Deserialize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_comparison_wraps() {
        assert!(sequence_greater_than(2, 1));
        assert!(!sequence_greater_than(1, 2));
        assert!(sequence_greater_than(0, u32::MAX));
        assert!(!sequence_greater_than(u32::MAX, 0));
    }

    #[test]
    fn client_id_packing() {
        let id = ClientId::new(6, 41);
        assert_eq!(id.generation(), 6);
        assert_eq!(id.slot(), 41);
        assert_eq!(id.0, (6u64 << 32) | 41);
    }

    #[test]
    fn packet_round_trip() {
        let packet = Packet::new(
            PacketHeader::new(5, 4, 0b111),
            PacketType::Messages {
                entries: vec![Envelope {
                    channel: Reliability::Reliable,
                    seq: 9,
                    message: Message::ObjectCreate {
                        object: ObjectId(3),
                        data: ClientData {
                            moving: true,
                            position: Vec3::new(1.0, 2.0, 3.0),
                            direction: Vec3::X,
                        },
                    },
                }],
            },
        );

        let bytes = packet.serialize().unwrap();
        let back = Packet::deserialize(&bytes).unwrap();
        assert_eq!(packet.header, back.header);
        match back.payload {
            PacketType::Messages { entries } => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].seq, 9);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn stale_magic_rejected() {
        let mut header = PacketHeader::new(0, 0, 0);
        assert!(header.is_valid());
        header.magic ^= 1;
        assert!(!header.is_valid());
    }
}
