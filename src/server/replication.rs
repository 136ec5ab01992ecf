//! Replication engine: fan-out of state changes to peer replicas and the
//! appliers that replay them locally, plus the session bookkeeping shared
//! by both paths.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::chat::{JoinOutcome, NOTICE_SENDER};
use crate::protocol::{
    ClientUpdate, MessageRecord, MessageUpdate, Payload, RecordKind,
    ReplicaUpdate, SocketId,
};
use crate::server::directory::{ClientInfo, SessionInfo};
use crate::server::link::Link;
use crate::server::ReplicaManager;
use crate::utils::ChatError;

use futures::future::{BoxFuture, FutureExt};


impl ReplicaManager {
    /// Sends `payload` to every linked replica. Best-effort: a failed send
    /// is logged and does not keep the others from being attempted.
    pub(crate) async fn broadcast_update(&self, payload: &Payload) {
        let links: Vec<Arc<Link>> = {
            let rm_links = self.rm_links.acquire_read().await;
            rm_links.values().cloned().collect()
        };
        self.send_to_links(&links, payload);
    }

    /// Sends `payload` to the replica links keyed by `sockets`.
    pub(crate) async fn send_to_replicas(
        &self,
        sockets: &[SocketId],
        payload: &Payload,
    ) {
        let links: Vec<Arc<Link>> = {
            let rm_links = self.rm_links.acquire_read().await;
            sockets
                .iter()
                .filter_map(|s| rm_links.get(s).cloned())
                .collect()
        };
        self.send_to_links(&links, payload);
    }

    /// Queues `payload` on every link in `links`; a link that refuses it is
    /// skipped.
    fn send_to_links(&self, links: &[Arc<Link>], payload: &Payload) {
        if links.is_empty() {
            return;
        }
        let packet = match payload.to_packet() {
            Ok(packet) => packet,
            Err(e) => {
                pf_error!(self.me; "error composing {:?}: {}",
                                   payload.packet_type(), e);
                return;
            }
        };
        for link in links {
            if let Err(e) = link.send_packet(packet.clone()) {
                if *payload == Payload::KeepAlive {
                    pf_trace!(self.me; "keep-alive to {:#x} failed: {}",
                                       link.socket, e);
                } else {
                    pf_debug!(self.me; "send of {:?} to {:#x} failed: {}",
                                       payload.packet_type(), link.socket, e);
                }
            }
        }
    }

    /// Delivers `record` to every session of `group` with a live front-end
    /// link on this replica.
    async fn deliver(&self, group: &str, record: &MessageRecord) {
        let sockets = self.directory.sessions_in_group(group).await;
        if sockets.is_empty() {
            return;
        }
        let links: Vec<Arc<Link>> = {
            let fe_links = self.fe_links.acquire_read().await;
            sockets
                .iter()
                .filter_map(|s| fe_links.get(s).cloned())
                .collect()
        };
        let payload = Payload::Data(record.clone());
        self.send_to_links(&links, &payload);
    }

    /// Persists `record` to the group's history and delivers it to the
    /// group's local sessions.
    pub(crate) async fn post_to_group(
        &self,
        group: &str,
        record: &MessageRecord,
    ) -> Result<(), ChatError> {
        self.lobby.post(group, record).await?;
        self.deliver(group, record).await;
        Ok(())
    }

    /// Posts a server notice to every active group.
    pub async fn broadcast_server_message(
        &self,
        text: &str,
    ) -> Result<(), ChatError> {
        let record = MessageRecord::server(NOTICE_SENDER, text);
        for group in self.lobby.group_names().await {
            self.post_to_group(&group, &record).await?;
        }
        Ok(())
    }

    /// Handles a chat message received from the front-end on `socket`:
    /// replicate first, then post to the session's group.
    pub(crate) async fn relay_client_message(
        &self,
        socket: SocketId,
        record: MessageRecord,
    ) -> Result<(), ChatError> {
        let Some(session) = self.directory.lookup_session(socket).await else {
            pf_warn!(self.me; "message on {:#x} without a session", socket);
            return Ok(());
        };
        let record = MessageRecord {
            sender: session.user.clone(),
            kind: RecordKind::User,
            ..record
        }
        .bounded();

        let update = MessageUpdate {
            group: session.group.clone(),
            origin: socket,
            record: record.clone(),
        };
        self.broadcast_update(&Payload::UpdateMessage(update)).await;
        self.post_to_group(&session.group, &record).await
    }

    /// Handles the login of a front-end that connected to this replica.
    /// Returns `Ok(false)` if the login was refused.
    pub(crate) async fn process_new_client(
        &self,
        login: &MessageRecord,
        link: &Arc<Link>,
    ) -> Result<bool, ChatError> {
        let update = ClientUpdate {
            ip: link.peer.ip().to_string(),
            port: login.port,
            socket: link.socket,
            login: login.clone(),
        };
        if !self.process_login(&update, Some(link)).await? {
            return Ok(false);
        }
        self.broadcast_update(&Payload::UpdateLogin(update)).await;
        Ok(true)
    }

    /// Joins the logged-in user to its group and registers the session and
    /// the client. With `master` set, the client is on this replica: it is
    /// told about a refusal, or sent the recent history on success.
    pub(crate) async fn process_login(
        &self,
        update: &ClientUpdate,
        master: Option<&Arc<Link>>,
    ) -> Result<bool, ChatError> {
        let user = &update.login.sender;
        let group = &update.login.text;

        match self.lobby.join(user, group).await? {
            JoinOutcome::Refused(reason) => {
                pf_info!(self.me; "login of {} to {} refused: {}",
                                  user, group, reason);
                if let Some(link) = master {
                    let notice = MessageRecord::server(user.clone(), reason);
                    if let Err(e) = link.send(&Payload::Command(notice)) {
                        pf_debug!(self.me; "error sending refusal: {}", e);
                    }
                }
                Ok(false)
            }

            JoinOutcome::Joined { notice } => {
                if let Some(notice) = notice {
                    self.deliver(group, &notice).await;
                }
                self.directory
                    .register_session(SessionInfo {
                        socket: update.socket,
                        user: user.clone(),
                        group: group.clone(),
                    })
                    .await;
                self.directory.register_client(ClientInfo::from(update)).await;
                pf_info!(self.me; "{} joined {} on {:#x}", user, group, update.socket);

                if let Some(link) = master {
                    let history = self
                        .lobby
                        .recover_history(group, self.config.history_depth)
                        .await?;
                    let packets = history
                        .into_iter()
                        .map(|record| Payload::Data(record).to_packet())
                        .collect::<Result<Vec<_>, _>>()?;
                    link.send_batch(packets)?;
                }
                Ok(true)
            }
        }
    }

    /// Removes the session and client registered on `socket` and signs the
    /// user out of its group. Unknown sockets are a no-op.
    pub(crate) async fn close_session(
        &self,
        socket: SocketId,
    ) -> Result<(), ChatError> {
        self.directory.remove_client(socket).await;
        if let Some(session) = self.directory.remove_session(socket).await {
            self.retire_session(&session).await?;
        }
        Ok(())
    }

    /// Signs out a session already removed from the directory.
    pub(crate) async fn retire_session(
        &self,
        session: &SessionInfo,
    ) -> Result<(), ChatError> {
        pf_info!(self.me; "{} left {} on {:#x}",
                          session.user, session.group, session.socket);
        if let Some(notice) =
            self.lobby.leave(&session.user, &session.group).await?
        {
            self.deliver(&session.group, &notice).await;
        }
        Ok(())
    }

    /// Applies a replicated login.
    pub(crate) async fn apply_login_update(
        &self,
        update: &ClientUpdate,
    ) -> Result<(), ChatError> {
        if self.directory.lookup_session(update.socket).await.is_some() {
            pf_debug!(self.me; "login of {:#x} already known", update.socket);
            return Ok(());
        }
        if !self.process_login(update, None).await? {
            pf_warn!(self.me; "replicated login of {} on {:#x} refused locally",
                              update.login.sender, update.socket);
        }
        Ok(())
    }

    /// Applies a replicated chat message: persisted to the named group's
    /// history with its original sender and kind.
    pub(crate) async fn apply_message_update(
        &self,
        update: &MessageUpdate,
    ) -> Result<(), ChatError> {
        pf_debug!(self.me; "{} posted to {} via {:#x}",
                           update.record.sender, update.group, update.origin);
        let record = update.record.clone().bounded();
        self.post_to_group(&update.group, &record).await
    }

    /// Applies a replicated disconnect; idempotent.
    pub(crate) async fn apply_disconnect(
        &self,
        socket: SocketId,
    ) -> Result<(), ChatError> {
        self.close_session(socket).await
    }

    /// Applies a replica announcement by linking to the announced replica,
    /// unless it is this replica or already linked. Boxed, since linking
    /// spawns the peer loop that calls back into this.
    pub(crate) fn apply_replica_update(
        self: Arc<Self>,
        update: ReplicaUpdate,
        from: SocketAddr,
    ) -> BoxFuture<'static, ()> {
        async move {
            if update.id == self.id
                || self.directory.has_replica(update.id).await
            {
                pf_debug!(self.me; "replica {} already known", update.id);
                return;
            }
            let host = if update.host.is_empty() {
                from.ip().to_string()
            } else {
                update.host
            };
            let addr: SocketAddr =
                match format!("{}:{}", host, update.port).parse() {
                    Ok(addr) => addr,
                    Err(e) => {
                        pf_warn!(self.me; "bad address for replica {}: {}",
                                          update.id, e);
                        return;
                    }
                };
            if let Err(e) = self.connect_to_replica(update.id, addr).await {
                pf_warn!(self.me; "error linking to replica {}: {}", update.id, e);
            }
        }
        .boxed()
    }
}
