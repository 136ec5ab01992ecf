//! Leader election (modified bully) and the front-end handoff performed by
//! a replica that becomes leader.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::protocol::{CoordinatorUpdate, Payload, ReplicaId, SocketId};
use crate::server::directory::ClientInfo;
use crate::server::link::Link;
use crate::server::{LeaderPointer, ReplicaManager};
use crate::utils::{tcp_connect_with_retry, ChatError};

use tokio::net::tcp::OwnedReadHalf;
use tokio::time;

/// State of the current election attempt; reset on every retry.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ElectionRound {
    /// Higher replicas that answered this attempt.
    pub answered: HashSet<ReplicaId>,

    pub started: bool,

    /// Leader announced (or re-affirmed) by a coordinator during this
    /// attempt.
    pub coordinator: Option<ReplicaId>,
}

impl ReplicaManager {
    /// Runs an election unless one is already running. `presumed_dead` names
    /// the leader whose loss triggered it, if any; its replica entries are
    /// dropped first.
    pub(crate) async fn run_election(
        self: &Arc<Self>,
        presumed_dead: Option<ReplicaId>,
    ) {
        if self
            .election_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        if let Some(dead) = presumed_dead {
            let sockets = self.directory.remove_replica_by_id(dead).await;
            let links: Vec<Arc<Link>> = {
                let mut rm_links = self.rm_links.acquire_write().await;
                sockets.iter().filter_map(|s| rm_links.remove(s)).collect()
            };
            for link in links {
                link.shutdown();
            }
        }

        let previous = self.leader_id().await;
        let timeout = self.election_timeout();
        let mut attempt: u32 = 0;

        while !self.stopping() {
            attempt += 1;
            {
                let mut round = self.election.acquire_write().await;
                *round = ElectionRound {
                    answered: HashSet::new(),
                    started: true,
                    coordinator: None,
                };
            }

            let higher: Vec<SocketId> = self
                .directory
                .list_replicas()
                .await
                .into_iter()
                .filter(|(_, info)| info.id > self.id)
                .map(|(socket, _)| socket)
                .collect();
            pf_info!(self.me; "election attempt {} after leader {}, {} higher replicas",
                              attempt, previous, higher.len());

            if higher.is_empty() {
                self.become_leader().await;
                break;
            }
            self.send_to_replicas(&higher, &Payload::ElectionStart).await;

            time::sleep(timeout).await;
            if self.round_settled(previous).await {
                break;
            }
            if self.election.acquire_read().await.answered.is_empty() {
                pf_info!(self.me; "no higher replica answered");
                self.become_leader().await;
                break;
            }

            time::sleep(timeout).await;
            if self.round_settled(previous).await {
                break;
            }
            pf_info!(self.me; "answered but no coordinator, restarting election");
        }

        self.election.acquire_write().await.started = false;
        self.election_started.store(false, Ordering::SeqCst);
        let leader = self.leader_id().await;
        pf_info!(self.me; "election finished, leader is {}", leader);
    }

    /// True once a coordinator was seen in this attempt or the leader
    /// pointer moved away from `previous`.
    async fn round_settled(&self, previous: ReplicaId) -> bool {
        if self.leader_id().await != previous {
            return true;
        }
        self.election.acquire_read().await.coordinator.is_some()
    }

    /// Takes over leadership: reconnects to every known front-end, migrates
    /// their sessions to the new sockets, announces the translation to all
    /// peers and starts serving the reconnected front-ends.
    pub(crate) async fn become_leader(self: &Arc<Self>) {
        pf_info!(self.me; "becoming leader");
        *self.leader.acquire_write().await = LeaderPointer {
            id: self.id,
            port: self.listen_addr.port(),
            socket: None,
        };
        self.election.acquire_write().await.coordinator = Some(self.id);

        let local: HashSet<SocketId> =
            self.fe_links.acquire_read().await.keys().copied().collect();
        let mut translation = Vec::new();
        let mut fresh = Vec::new();
        for client in self.directory.list_clients().await {
            if translation.len() == CoordinatorUpdate::MAX_PAIRS {
                pf_warn!(self.me; "translation table full, retiring front-end of {}",
                                  client.login.sender);
                continue;
            }
            if local.contains(&client.socket) {
                translation.push((client.socket, client.socket));
                continue;
            }
            match self.reach_front_end(&client).await {
                Ok((link, reader)) => {
                    pf_debug!(self.me; "front-end {:#x} now on {:#x}",
                                       client.socket, link.socket);
                    translation.push((client.socket, link.socket));
                    fresh.push((link, reader));
                }
                Err(e) => {
                    pf_warn!(self.me; "cannot reach front-end of {} at {}:{}: {}",
                                      client.login.sender, client.ip,
                                      client.port, e);
                }
            }
        }

        for session in self.directory.migrate(&translation).await {
            if let Err(e) = self.retire_session(&session).await {
                pf_error!(self.me; "error retiring session {:#x}: {}",
                                   session.socket, e);
            }
        }

        pf_info!(self.me; "announcing leadership with {} front-ends",
                          translation.len());
        self.broadcast_update(&Payload::ElectionCoordinator(CoordinatorUpdate {
            translation,
        }))
        .await;

        for (link, reader) in fresh {
            self.register_link(&link, true).await;
            let manager = self.clone();
            self.spawn_task(async move { manager.run_front_end(link, reader).await })
                .await;
        }
    }

    /// Opens a fresh connection to a front-end's reconnect listener.
    async fn reach_front_end(
        &self,
        client: &ClientInfo,
    ) -> Result<(Arc<Link>, OwnedReadHalf), ChatError> {
        let addr = client.addr()?;
        let stream = tcp_connect_with_retry(addr, 0).await?;
        let (reader, writer) = stream.into_split();
        Ok((self.new_link(self.new_socket_id(), addr, writer), reader))
    }

    /// Applies a coordinator kept aside while the previous leader was still
    /// linked. Returns true if it moved the leader pointer.
    pub(crate) async fn apply_deferred_coordinator(&self) -> bool {
        let Some((socket, update)) =
            self.deferred_coordinator.acquire_write().await.take()
        else {
            return false;
        };
        let before = self.leader_id().await;
        if let Err(e) = self.on_coordinator(socket, update).await {
            pf_error!(self.me; "error applying deferred coordinator: {}", e);
        }
        self.leader_id().await != before
    }

    /// Handles an election start from a lower replica: always answer. A
    /// leader re-affirms itself instead of electing again; anyone else
    /// starts an election of its own if none is running.
    pub(crate) async fn on_election_start(
        self: &Arc<Self>,
        link: &Arc<Link>,
    ) -> Result<(), ChatError> {
        if let Err(e) = link.send(&Payload::ElectionAnswer) {
            pf_debug!(self.me; "error answering election on {:#x}: {}",
                               link.socket, e);
        }

        if self.is_leader().await {
            // empty translation: re-affirms leadership without re-keying
            link.send(&Payload::ElectionCoordinator(CoordinatorUpdate::default()))?;
        } else if !self.election_running() {
            let manager = self.clone();
            self.spawn_task(async move { manager.run_election(None).await })
                .await;
        }
        Ok(())
    }

    /// Records an election answer from the replica on `socket`.
    pub(crate) async fn on_election_answer(&self, socket: SocketId) {
        match self.directory.lookup_replica(socket).await {
            Some(info) => {
                pf_debug!(self.me; "replica {} answered", info.id);
                self.election.acquire_write().await.answered.insert(info.id);
            }
            None => {
                pf_warn!(self.me; "answer from unknown link {:#x}", socket);
            }
        }
    }

    /// Handles a coordinator announcement from the replica on `socket`.
    /// Adopted only from a replica that outranks this one. One that ranks
    /// below a still linked leader is kept aside until that leader is found
    /// dead. Once adopted, a non-empty translation table re-keys every
    /// session and client.
    pub(crate) async fn on_coordinator(
        &self,
        socket: SocketId,
        update: CoordinatorUpdate,
    ) -> Result<(), ChatError> {
        let Some(sender) = self.directory.lookup_replica(socket).await else {
            pf_warn!(self.me; "coordinator from unknown link {:#x}", socket);
            return Ok(());
        };
        self.election.acquire_write().await.answered.insert(sender.id);

        if sender.id <= self.id {
            pf_info!(self.me; "ignoring coordinator from lower replica {}",
                              sender.id);
            return Ok(());
        }
        let current = self.leader().await;
        if sender.id < current.id
            && current.id != self.id
            && self.directory.has_replica(current.id).await
        {
            pf_info!(self.me; "deferring coordinator from {}, leader {} still linked",
                              sender.id, current.id);
            *self.deferred_coordinator.acquire_write().await = Some((socket, update));
            return Ok(());
        }

        *self.leader.acquire_write().await = LeaderPointer {
            id: sender.id,
            port: sender.port,
            socket: Some(socket),
        };
        self.election.acquire_write().await.coordinator = Some(sender.id);
        *self.deferred_coordinator.acquire_write().await = None;
        if current.id != sender.id {
            pf_info!(self.me; "replica {} is the new leader", sender.id);
        }

        if !update.translation.is_empty() {
            for session in self.directory.migrate(&update.translation).await {
                self.retire_session(&session).await?;
            }
        }
        Ok(())
    }
}
