//! Per-connection handling: classification of accepted connections, the
//! front-end loop and the peer replica loop.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::protocol::{
    recv_packet, PacketType, Payload, RawPacket, ReplicaId, ReplicaUpdate,
    SocketId,
};
use crate::server::directory::ReplicaInfo;
use crate::server::link::Link;
use crate::server::ReplicaManager;
use crate::utils::{tcp_connect_with_retry, ChatError};

use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{self, Duration};

/// Why a connection loop ended.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum LoopExit {
    /// Global stop requested.
    Stop,
    /// Orderly close by the remote end, a receive error, or a local
    /// forced close.
    Closed,
    /// Nothing received within the receive timeout.
    Timeout,
}

impl ReplicaManager {
    /// Accepts inbound connections until stop, spawning one unclassified
    /// handler task per connection.
    pub(crate) async fn run_acceptor(self: Arc<Self>, listener: TcpListener) {
        let mut rx_stop = self.tx_stop.subscribe();
        pf_debug!(self.me; "acceptor started");

        while !self.stopping() {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let socket = self.new_socket_id();
                        pf_debug!(self.me; "accepted {} as {:#x}", addr, socket);
                        let manager = self.clone();
                        self.spawn_task(async move {
                            manager.handle_unclassified(stream, addr, socket).await
                        })
                        .await;
                    }
                    Err(e) => {
                        pf_warn!(self.me; "error accepting connection: {}", e);
                    }
                },

                _ = rx_stop.changed() => break,
            }
        }

        pf_debug!(self.me; "acceptor exited");
    }

    /// Waits for the first packet of an accepted connection and turns the
    /// connection into a front-end or a peer replica connection.
    async fn handle_unclassified(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
        socket: SocketId,
    ) {
        let (mut reader, writer) = stream.into_split();
        let mut rx_stop = self.tx_stop.subscribe();
        if *rx_stop.borrow() {
            return;
        }
        let received = tokio::select! {
            received = time::timeout(self.user_timeout(),
                                     recv_packet(&mut reader)) => received,
            _ = rx_stop.changed() => return,
        };
        let first = match received {
            Ok(Ok(Some(packet))) => packet,
            Ok(Ok(None)) => {
                pf_debug!(self.me; "{} closed before identifying", addr);
                return;
            }
            Ok(Err(e)) => {
                pf_warn!(self.me; "error reading from {}: {}", addr, e);
                return;
            }
            Err(_) => {
                pf_warn!(self.me; "{} never identified itself", addr);
                return;
            }
        };
        let link = self.new_link(socket, addr, writer);

        match first.payload() {
            Ok(Payload::Command(login)) => {
                self.register_link(&link, true).await;
                match self.process_new_client(&login, &link).await {
                    Ok(true) => self.run_front_end(link, reader).await,
                    Ok(false) => {
                        self.deregister_link(&link, true).await;
                        link.close().await;
                    }
                    Err(e) => {
                        pf_error!(self.me; "error processing login from {}: {}",
                                           addr, e);
                        if let Err(e) = self.close_session(socket).await {
                            pf_error!(self.me; "error closing session {:#x}: {}",
                                               socket, e);
                        }
                        self.deregister_link(&link, true).await;
                        link.close().await;
                    }
                }
            }

            Ok(Payload::Link(update)) => {
                let host = if update.host.is_empty() {
                    addr.ip().to_string()
                } else {
                    update.host
                };
                let info = ReplicaInfo {
                    id: update.id,
                    port: update.port,
                    host,
                };
                pf_info!(self.me; "replica {} linked from {}", info.id, addr);

                self.register_link(&link, false).await;
                self.directory.register_replica(socket, info).await;
                if self.is_leader().await {
                    if let Err(e) = self.catch_up(&link, update.id).await {
                        pf_warn!(self.me; "error catching up replica {}: {}",
                                          update.id, e);
                    }
                }
                self.run_peer(link, reader).await;
            }

            Ok(other) => {
                pf_warn!(self.me; "unexpected first packet {:?} from {}",
                                  other.packet_type(), addr);
            }
            Err(e) => {
                pf_warn!(self.me; "invalid first packet from {}: {}", addr, e);
            }
        }
    }

    /// Adds `link` to the front-end or the replica link table.
    pub(crate) async fn register_link(&self, link: &Arc<Link>, front_end: bool) {
        let table = if front_end { &self.fe_links } else { &self.rm_links };
        let mut links = table.acquire_write().await;
        links.insert(link.socket, link.clone());
        table.release_write(links);
    }

    /// Removes `link` from its table, unless its socket has been taken over
    /// by another link meanwhile.
    pub(crate) async fn deregister_link(&self, link: &Arc<Link>, front_end: bool) {
        let table = if front_end { &self.fe_links } else { &self.rm_links };
        let mut links = table.acquire_write().await;
        if links.get(&link.socket).is_some_and(|l| Arc::ptr_eq(l, link)) {
            links.remove(&link.socket);
        }
        table.release_write(links);
    }

    /// Receives one packet, bounded by `timeout`, unless stop or a forced
    /// close comes first.
    async fn next_packet(
        &self,
        link: &Link,
        reader: &mut OwnedReadHalf,
        timeout: Duration,
    ) -> Result<RawPacket, LoopExit> {
        if self.stopping() {
            return Err(LoopExit::Stop);
        }
        let mut rx_stop = self.tx_stop.subscribe();
        let mut rx_close = link.closed();
        if *rx_stop.borrow() {
            return Err(LoopExit::Stop);
        }
        if *rx_close.borrow() {
            return Err(LoopExit::Closed);
        }

        tokio::select! {
            _ = rx_stop.changed() => Err(LoopExit::Stop),
            _ = rx_close.changed() => Err(LoopExit::Closed),
            received = time::timeout(timeout, recv_packet(reader)) => {
                match received {
                    Ok(Ok(Some(packet))) => Ok(packet),
                    Ok(Ok(None)) => Err(LoopExit::Closed),
                    Ok(Err(e)) => {
                        pf_debug!(self.me; "receive on {:#x} failed: {}",
                                           link.socket, e);
                        Err(LoopExit::Closed)
                    }
                    Err(_) => Err(LoopExit::Timeout),
                }
            }
        }
    }

    /// Front-end connection loop. On exit the disconnect is replicated and
    /// the session is closed, unless the replica is stopping.
    pub(crate) async fn run_front_end(
        self: Arc<Self>,
        link: Arc<Link>,
        mut reader: OwnedReadHalf,
    ) {
        let timeout = self.user_timeout();
        let exit = loop {
            let packet = match self.next_packet(&link, &mut reader, timeout).await {
                Ok(packet) => packet,
                Err(exit) => break exit,
            };

            match packet.packet_type() {
                Some(PacketType::Data) => match packet.payload() {
                    Ok(Payload::Data(record)) => {
                        if let Err(e) =
                            self.relay_client_message(link.socket, record).await
                        {
                            pf_error!(self.me; "error relaying message from {:#x}: {}",
                                               link.socket, e);
                        }
                    }
                    Ok(_) | Err(_) => {
                        pf_warn!(self.me; "malformed data packet from {:#x}",
                                          link.socket);
                    }
                },
                Some(PacketType::KeepAlive) => {}
                _ => {
                    pf_warn!(self.me; "ignoring packet type {} from front-end {:#x}",
                                      packet.header.kind, link.socket);
                }
            }
        };

        pf_debug!(self.me; "front-end {:#x} loop ended: {:?}", link.socket, exit);
        if exit != LoopExit::Stop && !self.stopping() {
            // local removal first: no later catch-up snapshot may carry it
            if let Err(e) = self.close_session(link.socket).await {
                pf_error!(self.me; "error closing session {:#x}: {}",
                                   link.socket, e);
            }
            self.broadcast_update(&Payload::UpdateDisconnect(link.socket))
                .await;
            self.deregister_link(&link, true).await;
        }
        if exit == LoopExit::Timeout {
            link.shutdown();
        }
    }

    /// Peer replica connection loop. If the peer was the leader, its loss
    /// starts an election.
    pub(crate) async fn run_peer(
        self: Arc<Self>,
        link: Arc<Link>,
        mut reader: OwnedReadHalf,
    ) {
        let timeout = self.replica_timeout();
        let exit = loop {
            let packet = match self.next_packet(&link, &mut reader, timeout).await {
                Ok(packet) => packet,
                Err(exit) => break exit,
            };

            let payload = match packet.payload() {
                Ok(payload) => payload,
                Err(e) => {
                    pf_warn!(self.me; "ignoring packet type {} from replica link {:#x}: {}",
                                      packet.header.kind, link.socket, e);
                    continue;
                }
            };
            if let Err(e) = self.dispatch_peer_packet(&link, payload).await {
                pf_error!(self.me; "error handling packet from {:#x}: {}",
                                   link.socket, e);
            }
        };

        self.deregister_link(&link, false).await;
        let buddy = self.directory.remove_replica(link.socket).await;
        match &buddy {
            Some(info) => {
                pf_info!(self.me; "link to replica {} ended: {:?}", info.id, exit)
            }
            None => pf_debug!(self.me; "link {:#x} ended: {:?}", link.socket, exit),
        }

        if exit != LoopExit::Stop && !self.stopping() {
            if let Some(info) = buddy {
                if info.id == self.leader_id().await
                    && !self.apply_deferred_coordinator().await
                    && !self.election_running()
                {
                    let manager = self.clone();
                    self.spawn_task(async move {
                        manager.run_election(Some(info.id)).await
                    })
                    .await;
                }
            }
        }
        if exit == LoopExit::Timeout {
            link.shutdown();
        }
    }

    async fn dispatch_peer_packet(
        self: &Arc<Self>,
        link: &Arc<Link>,
        payload: Payload,
    ) -> Result<(), ChatError> {
        match payload {
            Payload::UpdateLogin(update) => self.apply_login_update(&update).await?,
            Payload::UpdateMessage(update) => {
                self.apply_message_update(&update).await?
            }
            Payload::UpdateDisconnect(socket) => {
                self.apply_disconnect(socket).await?
            }
            Payload::UpdateReplica(update) => {
                let manager = self.clone();
                let from = link.peer;
                self.spawn_task(async move {
                    manager.apply_replica_update(update, from).await
                })
                .await;
            }
            Payload::ElectionStart => self.on_election_start(link).await?,
            Payload::ElectionAnswer => self.on_election_answer(link.socket).await,
            Payload::ElectionCoordinator(update) => {
                self.on_coordinator(link.socket, update).await?
            }
            Payload::KeepAlive => {}
            other => {
                pf_warn!(self.me; "ignoring {:?} from replica link {:#x}",
                                  other.packet_type(), link.socket);
            }
        }
        Ok(())
    }

    /// Opens an outbound link to replica `id` at `addr`, introduces this
    /// replica with a LINK packet and starts the peer loop on it.
    pub(crate) async fn connect_to_replica(
        self: &Arc<Self>,
        id: ReplicaId,
        addr: SocketAddr,
    ) -> Result<SocketId, ChatError> {
        let stream =
            tcp_connect_with_retry(addr, self.config.connect_retries).await?;
        let socket = self.new_socket_id();
        let (reader, writer) = stream.into_split();
        let link = self.new_link(socket, addr, writer);

        link.send(&Payload::Link(ReplicaUpdate {
            id: self.id,
            port: self.listen_addr.port(),
            host: String::new(),
        }))?;

        self.register_link(&link, false).await;
        let info = ReplicaInfo {
            id,
            port: addr.port(),
            host: addr.ip().to_string(),
        };
        self.directory.register_replica(socket, info).await;
        pf_info!(self.me; "linked to replica {} at {}", id, addr);

        let manager = self.clone();
        self.spawn_task(async move { manager.run_peer(link, reader).await })
            .await;
        Ok(socket)
    }
}
