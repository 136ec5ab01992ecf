//! One established connection, as seen by everyone who sends on it.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::protocol::{Payload, SocketId};
use crate::utils::ChatError;

use bytes::Bytes;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::time::{self, Duration};

/// How long a graceful close waits for queued packets to drain.
pub(crate) const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Item on a link's outbound queue.
#[derive(Debug)]
enum Outbound {
    Packet(Bytes),
    /// Packets written back to back, taking a single queue slot.
    Batch(Vec<Bytes>),
    /// Write side is closed once everything queued before it is written.
    Close,
}

/// Sending side of a connection plus a forced-close signal for the task
/// that owns the receiving side. Packets go through a bounded queue drained
/// by a dedicated messenger task, so a peer that stops reading never blocks
/// the senders.
#[derive(Debug)]
pub(crate) struct Link {
    pub(crate) socket: SocketId,
    pub(crate) peer: SocketAddr,

    tx_send: mpsc::Sender<Outbound>,

    /// Flipped to true once the link is shut down, locally or because the
    /// messenger task hit a write error.
    tx_close: Arc<watch::Sender<bool>>,
}

impl Link {
    /// Wraps `writer` and spawns its messenger task; at most `queue_cap`
    /// packets wait to be written.
    pub(crate) fn new(
        me: String,
        socket: SocketId,
        peer: SocketAddr,
        writer: OwnedWriteHalf,
        queue_cap: usize,
    ) -> Arc<Self> {
        let (tx_send, rx_send) = mpsc::channel(queue_cap.max(1));
        let (tx_close, _) = watch::channel(false);
        let tx_close = Arc::new(tx_close);

        tokio::spawn(Self::messenger_task(
            me,
            socket,
            writer,
            rx_send,
            tx_close.clone(),
        ));

        Arc::new(Link {
            socket,
            peer,
            tx_send,
            tx_close,
        })
    }

    /// Queues one packet. Packets are written in queue order and never
    /// interleave on the wire. Fails without waiting if the queue is full
    /// or the link is closed.
    pub(crate) fn send(&self, payload: &Payload) -> Result<(), ChatError> {
        self.send_packet(payload.to_packet()?)
    }

    /// Queues an already composed packet.
    pub(crate) fn send_packet(&self, packet: Bytes) -> Result<(), ChatError> {
        self.enqueue(Outbound::Packet(packet))
    }

    /// Queues several packets as one unit, so a snapshot larger than the
    /// queue still fits.
    pub(crate) fn send_batch(&self, packets: Vec<Bytes>) -> Result<(), ChatError> {
        self.enqueue(Outbound::Batch(packets))
    }

    fn enqueue(&self, item: Outbound) -> Result<(), ChatError> {
        match self.tx_send.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ChatError::msg(format!(
                "send queue of {:#x} is full",
                self.socket
            ))),
            Err(TrySendError::Closed(_)) => Err(ChatError::msg(format!(
                "link {:#x} is closed",
                self.socket
            ))),
        }
    }

    /// Shuts the connection down at once: queued packets are dropped, the
    /// write side is closed and the receiving task is told to stop.
    pub(crate) fn shutdown(&self) {
        self.tx_close.send_replace(true);
    }

    /// Closes the connection after the packets already queued are written,
    /// falling back to `shutdown()` if that takes longer than
    /// `CLOSE_GRACE`.
    pub(crate) async fn close(&self) {
        let mut rx_close = self.closed();
        if self.tx_send.try_send(Outbound::Close).is_ok() {
            let drained = time::timeout(CLOSE_GRACE, async {
                while !*rx_close.borrow_and_update() {
                    if rx_close.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await;
            if drained.is_ok() {
                return;
            }
        }
        self.shutdown();
    }

    /// Receiver that observes the link being closed.
    pub(crate) fn closed(&self) -> watch::Receiver<bool> {
        self.tx_close.subscribe()
    }

    /// Drains the outbound queue into the socket until the queue is closed,
    /// a write fails or the link is shut down.
    async fn messenger_task(
        me: String,
        socket: SocketId,
        mut writer: OwnedWriteHalf,
        mut rx_send: mpsc::Receiver<Outbound>,
        tx_close: Arc<watch::Sender<bool>>,
    ) {
        let mut rx_close = tx_close.subscribe();

        'drain: while !*rx_close.borrow_and_update() {
            let packets = tokio::select! {
                _ = rx_close.changed() => break,

                item = rx_send.recv() => match item {
                    Some(Outbound::Packet(packet)) => vec![packet],
                    Some(Outbound::Batch(packets)) => packets,
                    Some(Outbound::Close) | None => break,
                },
            };

            for packet in packets {
                tokio::select! {
                    written = writer.write_all(&packet) => {
                        if let Err(e) = written {
                            pf_debug!(me; "write to {:#x} failed: {}", socket, e);
                            break 'drain;
                        }
                    }
                    _ = rx_close.changed() => break 'drain,
                }
            }
        }

        drop(rx_send);
        let _ = writer.shutdown().await;
        tx_close.send_replace(true);
        pf_trace!(me; "messenger of {:#x} exited", socket);
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.tx_close.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{recv_packet, MessageRecord, RecordKind};
    use tokio::net::{TcpListener, TcpSocket, TcpStream};

    async fn connected_pair(
        port: u16,
        recv_buf: Option<u32>,
    ) -> Result<(TcpStream, TcpStream), ChatError> {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let listener = TcpListener::bind(addr).await?;
        let socket = TcpSocket::new_v4()?;
        if let Some(size) = recv_buf {
            socket.set_recv_buffer_size(size)?;
        }
        let (client, accepted) =
            tokio::join!(socket.connect(addr), listener.accept());
        Ok((client?, accepted?.0))
    }

    fn chat(text: &str) -> Payload {
        Payload::Data(MessageRecord::new("alice", RecordKind::User, text))
    }

    /// Sends until the queue refuses; the peer on the other end never reads.
    async fn fill_queue(link: &Link) -> Result<usize, ChatError> {
        let text = "x".repeat(250);
        time::timeout(Duration::from_secs(10), async {
            let mut sent = 0;
            while link.send(&chat(&text)).is_ok() {
                sent += 1;
                tokio::task::yield_now().await;
            }
            sent
        })
        .await
        .map_err(ChatError::from)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn packets_written_in_order() -> Result<(), ChatError> {
        let (mut client, server) = connected_pair(54801, None).await?;
        let (_reader, writer) = server.into_split();
        let addr = client.local_addr()?;
        let link = Link::new("t".into(), 7, addr, writer, 16);

        link.send(&chat("one"))?;
        link.send(&chat("two"))?;
        link.close().await;
        assert!(*link.closed().borrow());

        for text in ["one", "two"] {
            match recv_packet(&mut client).await?.map(|p| p.payload()) {
                Some(Ok(Payload::Data(record))) => assert_eq!(record.text, text),
                other => panic!("expected {}, got {:?}", text, other),
            }
        }
        assert!(recv_packet(&mut client).await?.is_none());
        assert!(link.send(&chat("three")).is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stalled_reader_never_blocks_sender() -> Result<(), ChatError> {
        let (client, server) = connected_pair(54802, Some(4096)).await?;
        let (_reader, writer) = server.into_split();
        let link = Link::new("t".into(), 8, client.local_addr()?, writer, 64);
        assert!(fill_queue(&link).await? >= 64);

        // forced shutdown does not wait for the stuck write
        let mut rx_close = link.closed();
        link.shutdown();
        time::timeout(Duration::from_secs(1), async {
            while !*rx_close.borrow_and_update() {
                rx_close.changed().await?;
            }
            Ok::<_, ChatError>(())
        })
        .await??;
        assert!(link.send(&chat("late")).is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn graceful_close_gives_up_on_stalled_reader() -> Result<(), ChatError> {
        let (client, server) = connected_pair(54803, Some(4096)).await?;
        let (_reader, writer) = server.into_split();
        let link = Link::new("t".into(), 9, client.local_addr()?, writer, 64);
        fill_queue(&link).await?;

        time::timeout(CLOSE_GRACE * 4, link.close()).await?;
        assert!(*link.closed().borrow());
        Ok(())
    }
}
