//! Wire protocol shared by front-ends and replicas: a fixed binary header
//! followed by a type-dependent payload.

mod framing;
mod packet;
mod payload;

pub use framing::{recv_packet, send_packet};
pub use packet::{
    now_millis, Header, PacketType, RawPacket, HEADER_LEN, MESSAGE_MAX,
    PAYLOAD_MAX, SEQUENCE,
};
pub use payload::{
    ClientUpdate, CoordinatorUpdate, MessageRecord, MessageUpdate, Payload,
    RecordKind, ReplicaUpdate,
};

/// Replica identifier type. Identifiers are totally ordered and the highest
/// live one wins elections.
pub type ReplicaId = u32;

/// Cluster-wide connection identifier, carried on the wire wherever a
/// front-end connection has to be named across replicas.
pub type SocketId = u64;
