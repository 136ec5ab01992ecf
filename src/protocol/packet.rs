//! Packet header layout and packet type identifiers.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::protocol::Payload;
use crate::utils::ChatError;

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Length in bytes of the fixed header: type, sequence, payload length and
/// timestamp, all big-endian.
pub const HEADER_LEN: usize = 16;

/// Maximum accepted payload length. Larger announcements end the connection.
pub const PAYLOAD_MAX: usize = 64 * 1024;

/// Maximum length in bytes of a chat message text.
pub const MESSAGE_MAX: usize = 256;

/// Value written into every header's sequence field. Never validated.
pub const SEQUENCE: u16 = 1;

/// Packet type identifiers, stable across the cluster.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
#[repr(u16)]
pub enum PacketType {
    Data = 1,
    Command = 2,
    KeepAlive = 3,
    ServerMessage = 4,
    UpdateDisconnect = 5,
    UpdateMessage = 6,
    UpdateLogin = 7,
    UpdateReplica = 8,
    ElectionStart = 9,
    ElectionAnswer = 10,
    ElectionCoordinator = 11,
    Link = 12,
}

impl TryFrom<u16> for PacketType {
    type Error = ChatError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => PacketType::Data,
            2 => PacketType::Command,
            3 => PacketType::KeepAlive,
            4 => PacketType::ServerMessage,
            5 => PacketType::UpdateDisconnect,
            6 => PacketType::UpdateMessage,
            7 => PacketType::UpdateLogin,
            8 => PacketType::UpdateReplica,
            9 => PacketType::ElectionStart,
            10 => PacketType::ElectionAnswer,
            11 => PacketType::ElectionCoordinator,
            12 => PacketType::Link,
            _ => {
                return Err(ChatError::msg(format!(
                    "unknown packet type {}",
                    value
                )))
            }
        })
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Fixed-size packet header.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Header {
    /// Raw packet type; may be unknown to this build.
    pub kind: u16,
    pub sequence: u16,
    pub length: u32,
    pub timestamp: u64,
}

impl Header {
    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.kind);
        buf.put_u16(self.sequence);
        buf.put_u32(self.length);
        buf.put_u64(self.timestamp);
    }

    pub(crate) fn decode(mut raw: &[u8]) -> Header {
        debug_assert_eq!(raw.len(), HEADER_LEN);
        Header {
            kind: raw.get_u16(),
            sequence: raw.get_u16(),
            length: raw.get_u32(),
            timestamp: raw.get_u64(),
        }
    }
}

/// A received packet whose payload has not been decoded yet.
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub header: Header,
    pub body: Bytes,
}

impl RawPacket {
    /// Known packet type of this packet, or `None` for an unknown one.
    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::try_from(self.header.kind).ok()
    }

    /// Decodes the payload according to the header's type.
    pub fn payload(&self) -> Result<Payload, ChatError> {
        let ptype = PacketType::try_from(self.header.kind)?;
        Payload::decode(ptype, self.body.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let header = Header {
            kind: PacketType::ElectionCoordinator as u16,
            sequence: SEQUENCE,
            length: 0x0102_0304,
            timestamp: 42,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);
        assert_eq!(&buf[..8], &[0, 11, 0, 1, 1, 2, 3, 4]);
        assert_eq!(Header::decode(&buf), header);
    }

    #[test]
    fn packet_type_ids() {
        assert_eq!(PacketType::try_from(1), Ok(PacketType::Data));
        assert_eq!(PacketType::try_from(12), Ok(PacketType::Link));
        assert!(PacketType::try_from(0).is_err());
        assert!(PacketType::try_from(13).is_err());
    }
}
