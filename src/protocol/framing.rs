//! Packet framing over async byte streams.

use std::io::ErrorKind;

use crate::protocol::packet::{Header, RawPacket, HEADER_LEN, PAYLOAD_MAX};
use crate::protocol::Payload;
use crate::utils::ChatError;

use bytes::Bytes;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Receives one packet from `reader`: the fixed header first, then exactly
/// the announced number of payload bytes. Returns:
///   - `Ok(Some(packet))` on a complete packet
///   - `Ok(None)` if the peer closed the connection cleanly between packets
///   - `Err(err)` on I/O error, a close in the middle of a packet, or an
///     oversized length announcement
///
/// Not cancellation-safe: a packet interrupted midway is lost, so callers
/// drop the connection whenever a receive gets cancelled.
pub async fn recv_packet<R>(reader: &mut R) -> Result<Option<RawPacket>, ChatError>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut head[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ChatError::msg(format!(
                "connection closed after {} header bytes",
                filled
            )));
        }
        filled += n;
    }

    let header = Header::decode(&head);
    let length = header.length as usize;
    if length > PAYLOAD_MAX {
        return Err(ChatError::msg(format!(
            "announced payload length {} exceeds {}",
            length, PAYLOAD_MAX
        )));
    }

    let mut body = vec![0u8; length];
    if let Err(e) = reader.read_exact(&mut body).await {
        return Err(if e.kind() == ErrorKind::UnexpectedEof {
            ChatError::msg(format!(
                "connection closed inside a {}-byte payload",
                length
            ))
        } else {
            e.into()
        });
    }

    Ok(Some(RawPacket {
        header,
        body: Bytes::from(body),
    }))
}

/// Sends one packet to `writer` as a single contiguous buffer.
pub async fn send_packet<W>(writer: &mut W, payload: &Payload) -> Result<(), ChatError>
where
    W: AsyncWrite + Unpin,
{
    let packet = payload.to_packet()?;
    writer.write_all(&packet).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MessageRecord, PacketType, RecordKind};
    use bytes::{BufMut, BytesMut};
    use tokio::io;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn record_across_stream() -> Result<(), ChatError> {
        let (mut client, mut server) = io::duplex(4096);
        let record = MessageRecord::new("erin", RecordKind::User, "ping");
        send_packet(&mut client, &Payload::Data(record.clone())).await?;
        send_packet(&mut client, &Payload::KeepAlive).await?;

        let first = recv_packet(&mut server).await?.expect("first packet");
        assert_eq!(first.packet_type(), Some(PacketType::Data));
        assert_eq!(first.payload()?, Payload::Data(record));
        let second = recv_packet(&mut server).await?.expect("second packet");
        assert_eq!(second.payload()?, Payload::KeepAlive);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn partial_writes_reassembled() -> Result<(), ChatError> {
        let (mut client, mut server) = io::duplex(4096);
        let packet = Payload::UpdateDisconnect(9).to_packet()?;
        let writer = tokio::spawn(async move {
            for chunk in packet.chunks(3) {
                client.write_all(chunk).await?;
                client.flush().await?;
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
            Ok::<_, std::io::Error>(client)
        });
        let got = recv_packet(&mut server).await?.expect("packet");
        assert_eq!(got.payload()?, Payload::UpdateDisconnect(9));
        writer.await??;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn orderly_close_is_none() -> Result<(), ChatError> {
        let (client, mut server) = io::duplex(64);
        drop(client);
        assert!(recv_packet(&mut server).await?.is_none());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_mid_packet_is_error() -> Result<(), ChatError> {
        let (mut client, mut server) = io::duplex(64);
        let packet = Payload::UpdateDisconnect(9).to_packet()?;
        client.write_all(&packet[..HEADER_LEN + 2]).await?;
        drop(client);
        assert!(recv_packet(&mut server).await.is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn oversized_length_rejected() -> Result<(), ChatError> {
        let (mut client, mut server) = io::duplex(64);
        let mut head = BytesMut::new();
        head.put_u16(PacketType::Data as u16);
        head.put_u16(1);
        head.put_u32(PAYLOAD_MAX as u32 + 1);
        head.put_u64(0);
        client.write_all(&head).await?;
        assert!(recv_packet(&mut server).await.is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_type_still_framed() -> Result<(), ChatError> {
        let (mut client, mut server) = io::duplex(64);
        let mut raw = BytesMut::new();
        raw.put_u16(99);
        raw.put_u16(1);
        raw.put_u32(2);
        raw.put_u64(0);
        raw.put_slice(b"zz");
        client.write_all(&raw).await?;
        let got = recv_packet(&mut server).await?.expect("packet");
        assert_eq!(got.packet_type(), None);
        assert_eq!(got.body.as_ref(), b"zz");
        assert!(got.payload().is_err());
        Ok(())
    }
}
