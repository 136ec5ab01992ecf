//! Packet payloads and their binary encoding.

use crate::protocol::packet::{
    now_millis, Header, PacketType, HEADER_LEN, MESSAGE_MAX, PAYLOAD_MAX,
    SEQUENCE,
};
use crate::protocol::{ReplicaId, SocketId};
use crate::utils::ChatError;

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Kind of a message record.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
#[repr(u16)]
pub enum RecordKind {
    /// Notice generated by a replica.
    Server = 1,
    /// Text typed by a user.
    User = 2,
    /// Login request carrying the group name.
    Login = 3,
}

impl TryFrom<u16> for RecordKind {
    type Error = ChatError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(RecordKind::Server),
            2 => Ok(RecordKind::User),
            3 => Ok(RecordKind::Login),
            _ => Err(ChatError::msg(format!("unknown record kind {}", value))),
        }
    }
}

/// A chat message, login request or server notice.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct MessageRecord {
    pub sender: String,
    pub kind: RecordKind,
    pub timestamp: u64,
    /// Reconnect listen port of the sending front-end; only meaningful in
    /// login records.
    pub port: u16,
    pub text: String,
}

impl MessageRecord {
    /// Composes a record stamped with the current time. Text longer than
    /// `MESSAGE_MAX` bytes is cut at the last char boundary that fits.
    pub fn new(
        sender: impl Into<String>,
        kind: RecordKind,
        text: impl Into<String>,
    ) -> Self {
        MessageRecord {
            sender: sender.into(),
            kind,
            timestamp: now_millis(),
            port: 0,
            text: truncated(text.into(), MESSAGE_MAX),
        }
    }

    /// Composes a login record for `user` joining `group`, reachable for
    /// reconnection on `port`.
    pub fn login(user: impl Into<String>, group: &str, port: u16) -> Self {
        let mut record = Self::new(user, RecordKind::Login, group);
        record.port = port;
        record
    }

    /// Cuts the text down to `MESSAGE_MAX` bytes, for records that arrive
    /// from the wire.
    pub fn bounded(mut self) -> Self {
        self.text = truncated(self.text, MESSAGE_MAX);
        self
    }

    /// Composes a server notice.
    pub fn server(sender: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(sender, RecordKind::Server, text)
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        put_str(buf, &self.sender);
        buf.put_u16(self.kind as u16);
        buf.put_u64(self.timestamp);
        buf.put_u16(self.port);
        put_str(buf, &self.text);
    }

    pub(crate) fn decode(buf: &mut Bytes) -> Result<Self, ChatError> {
        let sender = get_str(buf)?;
        let kind = RecordKind::try_from(get_u16(buf)?)?;
        let timestamp = get_u64(buf)?;
        let port = get_u16(buf)?;
        let text = get_str(buf)?;
        Ok(MessageRecord {
            sender,
            kind,
            timestamp,
            port,
            text,
        })
    }
}

/// Announcement of a replica: its identifier and where it listens.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ReplicaUpdate {
    pub id: ReplicaId,
    pub port: u16,
    /// Host to reach the replica at; empty means the address the packet
    /// arrived from.
    pub host: String,
}

impl ReplicaUpdate {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.id);
        buf.put_u16(self.port);
        put_str(buf, &self.host);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ChatError> {
        Ok(ReplicaUpdate {
            id: get_u32(buf)?,
            port: get_u16(buf)?,
            host: get_str(buf)?,
        })
    }
}

/// Registration of a front-end, enough to rebuild its session elsewhere and
/// to reconnect to it after a failover.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ClientUpdate {
    pub ip: String,
    pub port: u16,
    pub socket: SocketId,
    pub login: MessageRecord,
}

impl ClientUpdate {
    fn encode(&self, buf: &mut BytesMut) {
        put_str(buf, &self.ip);
        buf.put_u16(self.port);
        buf.put_u64(self.socket);
        self.login.encode(buf);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ChatError> {
        Ok(ClientUpdate {
            ip: get_str(buf)?,
            port: get_u16(buf)?,
            socket: get_u64(buf)?,
            login: MessageRecord::decode(buf)?,
        })
    }
}

/// A message posted to a group, relayed between replicas.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct MessageUpdate {
    pub group: String,
    pub origin: SocketId,
    pub record: MessageRecord,
}

impl MessageUpdate {
    fn encode(&self, buf: &mut BytesMut) {
        put_str(buf, &self.group);
        buf.put_u64(self.origin);
        self.record.encode(buf);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ChatError> {
        Ok(MessageUpdate {
            group: get_str(buf)?,
            origin: get_u64(buf)?,
            record: MessageRecord::decode(buf)?,
        })
    }
}

/// Old-socket to new-socket translation table announced by a new leader.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct CoordinatorUpdate {
    pub translation: Vec<(SocketId, SocketId)>,
}

impl CoordinatorUpdate {
    /// Most pairs one announcement can carry within `PAYLOAD_MAX`.
    pub const MAX_PAIRS: usize = (PAYLOAD_MAX - 2) / 16;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.translation.len() as u16);
        for &(old, new) in &self.translation {
            buf.put_u64(old);
            buf.put_u64(new);
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ChatError> {
        let count = get_u16(buf)? as usize;
        let mut translation = Vec::with_capacity(count);
        for _ in 0..count {
            translation.push((get_u64(buf)?, get_u64(buf)?));
        }
        Ok(CoordinatorUpdate { translation })
    }
}

/// Decoded packet payload, one variant per packet type.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Payload {
    /// Chat message from a front-end, or a message delivered to one.
    Data(MessageRecord),
    /// Login request from a front-end, or a refusal notice sent back.
    Command(MessageRecord),
    KeepAlive,
    ServerMessage(MessageRecord),
    UpdateDisconnect(SocketId),
    UpdateMessage(MessageUpdate),
    UpdateLogin(ClientUpdate),
    UpdateReplica(ReplicaUpdate),
    ElectionStart,
    ElectionAnswer,
    ElectionCoordinator(CoordinatorUpdate),
    /// First packet of a replica-to-replica connection.
    Link(ReplicaUpdate),
}

impl Payload {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Payload::Data(_) => PacketType::Data,
            Payload::Command(_) => PacketType::Command,
            Payload::KeepAlive => PacketType::KeepAlive,
            Payload::ServerMessage(_) => PacketType::ServerMessage,
            Payload::UpdateDisconnect(_) => PacketType::UpdateDisconnect,
            Payload::UpdateMessage(_) => PacketType::UpdateMessage,
            Payload::UpdateLogin(_) => PacketType::UpdateLogin,
            Payload::UpdateReplica(_) => PacketType::UpdateReplica,
            Payload::ElectionStart => PacketType::ElectionStart,
            Payload::ElectionAnswer => PacketType::ElectionAnswer,
            Payload::ElectionCoordinator(_) => PacketType::ElectionCoordinator,
            Payload::Link(_) => PacketType::Link,
        }
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        match self {
            Payload::Data(record)
            | Payload::Command(record)
            | Payload::ServerMessage(record) => record.encode(buf),
            Payload::KeepAlive
            | Payload::ElectionStart
            | Payload::ElectionAnswer => {}
            Payload::UpdateDisconnect(socket) => buf.put_u64(*socket),
            Payload::UpdateMessage(update) => update.encode(buf),
            Payload::UpdateLogin(update) => update.encode(buf),
            Payload::UpdateReplica(update) | Payload::Link(update) => {
                update.encode(buf)
            }
            Payload::ElectionCoordinator(update) => update.encode(buf),
        }
    }

    /// Composes the whole packet, header included, into one contiguous
    /// buffer.
    pub fn to_packet(&self) -> Result<Bytes, ChatError> {
        if let Payload::ElectionCoordinator(update) = self {
            if update.translation.len() > CoordinatorUpdate::MAX_PAIRS {
                return Err(ChatError::msg(format!(
                    "translation table of {} pairs exceeds {}",
                    update.translation.len(),
                    CoordinatorUpdate::MAX_PAIRS
                )));
            }
        }
        let mut buf = BytesMut::with_capacity(HEADER_LEN + 64);
        buf.resize(HEADER_LEN, 0);
        self.encode_body(&mut buf);

        let length = buf.len() - HEADER_LEN;
        if length > PAYLOAD_MAX {
            return Err(ChatError::msg(format!(
                "payload of {:?} too large: {} bytes",
                self.packet_type(),
                length
            )));
        }
        let header = Header {
            kind: self.packet_type() as u16,
            sequence: SEQUENCE,
            length: length as u32,
            timestamp: now_millis(),
        };
        let mut head = BytesMut::with_capacity(HEADER_LEN);
        header.encode(&mut head);
        buf[..HEADER_LEN].copy_from_slice(&head);
        Ok(buf.freeze())
    }

    /// Decodes a payload body of the given packet type.
    pub fn decode(ptype: PacketType, mut body: Bytes) -> Result<Self, ChatError> {
        let buf = &mut body;
        let payload = match ptype {
            PacketType::Data => Payload::Data(MessageRecord::decode(buf)?),
            PacketType::Command => {
                Payload::Command(MessageRecord::decode(buf)?)
            }
            PacketType::KeepAlive => Payload::KeepAlive,
            PacketType::ServerMessage => {
                Payload::ServerMessage(MessageRecord::decode(buf)?)
            }
            PacketType::UpdateDisconnect => {
                Payload::UpdateDisconnect(get_u64(buf)?)
            }
            PacketType::UpdateMessage => {
                Payload::UpdateMessage(MessageUpdate::decode(buf)?)
            }
            PacketType::UpdateLogin => {
                Payload::UpdateLogin(ClientUpdate::decode(buf)?)
            }
            PacketType::UpdateReplica => {
                Payload::UpdateReplica(ReplicaUpdate::decode(buf)?)
            }
            PacketType::ElectionStart => Payload::ElectionStart,
            PacketType::ElectionAnswer => Payload::ElectionAnswer,
            PacketType::ElectionCoordinator => {
                Payload::ElectionCoordinator(CoordinatorUpdate::decode(buf)?)
            }
            PacketType::Link => Payload::Link(ReplicaUpdate::decode(buf)?),
        };
        Ok(payload)
    }
}

/// Cuts `s` down to at most `max` bytes without splitting a char.
fn truncated(mut s: String, max: usize) -> String {
    if s.len() > max {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
    s
}

fn put_str(buf: &mut BytesMut, s: &str) {
    let s = truncated(s.to_string(), u16::MAX as usize);
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn need(buf: &Bytes, n: usize) -> Result<(), ChatError> {
    if buf.remaining() < n {
        Err(ChatError::msg(format!(
            "payload truncated: need {} more bytes, have {}",
            n,
            buf.remaining()
        )))
    } else {
        Ok(())
    }
}

fn get_u16(buf: &mut Bytes) -> Result<u16, ChatError> {
    need(buf, 2)?;
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut Bytes) -> Result<u32, ChatError> {
    need(buf, 4)?;
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut Bytes) -> Result<u64, ChatError> {
    need(buf, 8)?;
    Ok(buf.get_u64())
}

fn get_str(buf: &mut Bytes) -> Result<String, ChatError> {
    let len = get_u16(buf)? as usize;
    need(buf, len)?;
    Ok(String::from_utf8(buf.split_to(len).to_vec())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body_of(packet: &Bytes) -> Bytes {
        packet.slice(HEADER_LEN..)
    }

    #[test]
    fn record_survives_codec() -> Result<(), ChatError> {
        let mut record =
            MessageRecord::new("alice", RecordKind::User, "héllo there");
        record.timestamp = 1_700_000_000_123;
        let packet = Payload::Data(record.clone()).to_packet()?;

        let header = Header::decode(&packet[..HEADER_LEN]);
        assert_eq!(header.kind, PacketType::Data as u16);
        assert_eq!(header.sequence, SEQUENCE);
        assert_eq!(header.length as usize, packet.len() - HEADER_LEN);

        let decoded = Payload::decode(PacketType::Data, body_of(&packet))?;
        assert_eq!(decoded, Payload::Data(record));
        Ok(())
    }

    #[test]
    fn long_text_truncated() {
        let text = "é".repeat(200);
        let record = MessageRecord::new("bob1", RecordKind::User, text);
        assert!(record.text.len() <= MESSAGE_MAX);
        assert_eq!(record.text.len(), MESSAGE_MAX);
        assert!(record.text.chars().all(|c| c == 'é'));
    }

    #[test]
    fn login_update_nests_record() -> Result<(), ChatError> {
        let update = ClientUpdate {
            ip: "127.0.0.1".into(),
            port: 40123,
            socket: (3 << 48) | 17,
            login: MessageRecord::login("carol", "rustaceans", 40123),
        };
        let packet = Payload::UpdateLogin(update.clone()).to_packet()?;
        match Payload::decode(PacketType::UpdateLogin, body_of(&packet))? {
            Payload::UpdateLogin(decoded) => {
                assert_eq!(decoded, update);
                assert_eq!(decoded.login.kind, RecordKind::Login);
                assert_eq!(decoded.login.text, "rustaceans");
            }
            other => panic!("unexpected payload {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn coordinator_table() -> Result<(), ChatError> {
        let update = CoordinatorUpdate {
            translation: vec![(1, 100), (2, 200), (3, 300)],
        };
        let packet =
            Payload::ElectionCoordinator(update.clone()).to_packet()?;
        // count + three pairs
        assert_eq!(packet.len(), HEADER_LEN + 2 + 3 * 16);
        assert_eq!(
            Payload::decode(PacketType::ElectionCoordinator, body_of(&packet))?,
            Payload::ElectionCoordinator(update)
        );
        Ok(())
    }

    #[test]
    fn coordinator_table_bounded() -> Result<(), ChatError> {
        let pairs = |n: u64| CoordinatorUpdate {
            translation: (0..n).map(|i| (i, i + 1_000_000)).collect(),
        };
        let full = pairs(CoordinatorUpdate::MAX_PAIRS as u64);
        let packet = Payload::ElectionCoordinator(full.clone()).to_packet()?;
        assert!(packet.len() - HEADER_LEN <= PAYLOAD_MAX);
        assert_eq!(
            Payload::decode(PacketType::ElectionCoordinator, body_of(&packet))?,
            Payload::ElectionCoordinator(full)
        );

        let over = pairs(CoordinatorUpdate::MAX_PAIRS as u64 + 1);
        assert!(Payload::ElectionCoordinator(over).to_packet().is_err());
        Ok(())
    }

    #[test]
    fn inbound_text_bounded() {
        let record = MessageRecord {
            text: "y".repeat(MESSAGE_MAX * 3),
            ..MessageRecord::new("alice", RecordKind::User, "")
        };
        assert_eq!(record.bounded().text.len(), MESSAGE_MAX);
    }

    #[test]
    fn empty_bodies() -> Result<(), ChatError> {
        for payload in
            [Payload::KeepAlive, Payload::ElectionStart, Payload::ElectionAnswer]
        {
            let packet = payload.to_packet()?;
            assert_eq!(packet.len(), HEADER_LEN);
        }
        Ok(())
    }

    #[test]
    fn truncated_body_rejected() -> Result<(), ChatError> {
        let packet = Payload::UpdateDisconnect(77).to_packet()?;
        let short = packet.slice(HEADER_LEN..HEADER_LEN + 5);
        assert!(Payload::decode(PacketType::UpdateDisconnect, short).is_err());
        Ok(())
    }

    #[test]
    fn bad_record_kind_rejected() {
        let mut buf = BytesMut::new();
        put_str(&mut buf, "dave");
        buf.put_u16(9);
        buf.put_u64(0);
        buf.put_u16(0);
        put_str(&mut buf, "x");
        assert!(Payload::decode(PacketType::Data, buf.freeze()).is_err());
    }
}
