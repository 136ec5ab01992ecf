//! Replica manager: accepts front-ends and peer replicas, replicates state
//! changes to peers, elects a new leader when the current one fails and
//! hands its front-ends over.

mod catchup;
mod directory;
mod election;
mod handler;
mod heartbeat;
mod link;
mod replication;


use std::collections::HashMap;
use std::fmt::Write;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

pub use directory::{ClientInfo, ReplicaInfo, SessionInfo};
pub use election::ElectionRound;

use crate::chat::Lobby;
use crate::protocol::{CoordinatorUpdate, ReplicaId, SocketId};
use crate::utils::{tcp_bind_with_retry, ChatError, Monitor};

use directory::Directory;
use link::Link;

use futures::future;

use serde::Deserialize;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicaConfig {
    /// Number of history records replayed to a freshly logged-in client.
    pub history_depth: usize,

    /// Maximum concurrent sessions per user.
    pub max_sessions: usize,

    /// Receive timeout on front-end connections.
    pub user_timeout_ms: u64,

    /// Receive timeout on replica connections.
    pub replica_timeout_ms: u64,

    /// Interval of keep-alives sent to peer replicas.
    pub keep_alive_interval_ms: u64,

    /// Wait of each election step.
    pub election_timeout_ms: u64,

    /// Root directory of history files; each replica uses its own
    /// `replica<id>` subdirectory.
    pub hist_dir: String,

    /// Connection retries when linking to a replica.
    pub connect_retries: u8,

    /// Capacity of each connection's outbound packet queue.
    pub link_queue_cap: usize,
}

#[allow(clippy::derivable_impls)]
impl Default for ReplicaConfig {
    fn default() -> Self {
        ReplicaConfig {
            history_depth: 10,
            max_sessions: 2,
            user_timeout_ms: 60_000,
            replica_timeout_ms: 5_000,
            keep_alive_interval_ms: 1_000,
            election_timeout_ms: 1_000,
            hist_dir: "/tmp/replichat".into(),
            connect_retries: 3,
            link_queue_cap: 1024,
        }
    }
}

/// Replica to link to at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bootstrap {
    pub id: ReplicaId,
    pub addr: SocketAddr,
}

/// Who this replica believes is the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaderPointer {
    pub id: ReplicaId,
    pub port: u16,
    /// Link to the leader; `None` when this replica is the leader.
    pub socket: Option<SocketId>,
}

/// One replica of the chat backend. Constructed once per replica and shared
/// by all of its tasks.
pub struct ReplicaManager {
    id: ReplicaId,

    /// Logging prefix.
    me: String,

    listen_addr: SocketAddr,
    config: ReplicaConfig,

    lobby: Lobby,
    directory: Directory,

    /// Map from socket -> links of connected front-ends.
    fe_links: Monitor<HashMap<SocketId, Arc<Link>>>,

    /// Map from socket -> links of connected replicas.
    rm_links: Monitor<HashMap<SocketId, Arc<Link>>>,

    /// Join handles of every spawned task.
    tasks: Monitor<Vec<JoinHandle<()>>>,

    leader: Monitor<LeaderPointer>,
    election: Monitor<ElectionRound>,
    election_started: AtomicBool,

    /// Coordinator from a replica ranking below the current, still linked,
    /// leader; applied once that leader is lost.
    deferred_coordinator: Monitor<Option<(SocketId, CoordinatorUpdate)>>,

    stopping: AtomicBool,
    tx_stop: watch::Sender<bool>,

    next_socket: AtomicU64,
}

impl ReplicaManager {
    /// Binds the listening socket, starts the acceptor and keep-alive tasks
    /// and, unless this replica is the bootstrap leader itself, links to the
    /// bootstrap leader.
    pub async fn new_and_setup(
        id: ReplicaId,
        bind_addr: SocketAddr,
        bootstrap: Option<Bootstrap>,
        config_str: Option<&str>,
    ) -> Result<Arc<Self>, ChatError> {
        let me = format!("r{}", id);
        let config = parsed_config!(config_str => ReplicaConfig;
                                    history_depth, max_sessions,
                                    user_timeout_ms, replica_timeout_ms,
                                    keep_alive_interval_ms,
                                    election_timeout_ms, hist_dir,
                                    connect_retries, link_queue_cap)?;
        if id as u64 >= (1 << 16) {
            return logged_err!(me; "replica id {} out of range", id);
        }
        if config.max_sessions == 0 {
            return logged_err!(me; "invalid config.max_sessions '{}'",
                                   config.max_sessions);
        }
        if config.keep_alive_interval_ms == 0
            || config.keep_alive_interval_ms >= config.replica_timeout_ms
        {
            return logged_err!(me; "keep-alive interval {} must be within (0, {})",
                                   config.keep_alive_interval_ms,
                                   config.replica_timeout_ms);
        }
        if config.link_queue_cap == 0 {
            return logged_err!(me; "invalid config.link_queue_cap '{}'",
                                   config.link_queue_cap);
        }
        if config.election_timeout_ms == 0 || config.user_timeout_ms == 0 {
            return logged_err!(me; "timeouts must be positive");
        }

        let listener =
            tcp_bind_with_retry(bind_addr, config.connect_retries).await?;
        let listen_addr = listener.local_addr()?;

        let hist_dir =
            PathBuf::from(&config.hist_dir).join(format!("replica{}", id));
        let lobby =
            Lobby::new_and_setup(me.clone(), hist_dir, config.max_sessions)
                .await?;

        let leader = match bootstrap {
            Some(b) if b.id != id => LeaderPointer {
                id: b.id,
                port: b.addr.port(),
                socket: None,
            },
            _ => LeaderPointer {
                id,
                port: listen_addr.port(),
                socket: None,
            },
        };

        let (tx_stop, _) = watch::channel(false);
        let manager = Arc::new(ReplicaManager {
            id,
            me,
            listen_addr,
            config,
            lobby,
            directory: Directory::new(),
            fe_links: Monitor::new("fe_links", HashMap::new()),
            rm_links: Monitor::new("rm_links", HashMap::new()),
            tasks: Monitor::new("tasks", Vec::new()),
            leader: Monitor::new("leader", leader),
            election: Monitor::new("election", ElectionRound::default()),
            election_started: AtomicBool::new(false),
            deferred_coordinator: Monitor::new("deferred_coordinator", None),
            stopping: AtomicBool::new(false),
            tx_stop,
            next_socket: AtomicU64::new(1),
        });

        let acceptor = manager.clone();
        manager
            .spawn_task(async move { acceptor.run_acceptor(listener).await })
            .await;
        let keeper = manager.clone();
        manager
            .spawn_task(async move { keeper.run_keep_alive().await })
            .await;

        if let Some(b) = bootstrap.filter(|b| b.id != id) {
            if let Err(e) = manager.link_to_leader(b).await {
                manager.stop().await;
                return Err(e);
            }
        }

        pf_info!(manager.me; "listening on {}, leader is {}",
                             listen_addr, leader.id);
        Ok(manager)
    }

    /// Links to the bootstrap leader. A replica that outranks the leader
    /// claims leadership once catch-up had time to arrive.
    async fn link_to_leader(
        self: &Arc<Self>,
        bootstrap: Bootstrap,
    ) -> Result<(), ChatError> {
        let socket = self.connect_to_replica(bootstrap.id, bootstrap.addr).await?;
        self.leader.acquire_write().await.socket = Some(socket);

        if self.id > bootstrap.id {
            let manager = self.clone();
            self.spawn_task(async move {
                tokio::time::sleep(manager.election_timeout()).await;
                if !manager.stopping() && manager.leader_id().await < manager.id {
                    pf_info!(manager.me; "outranking leader {}, claiming leadership",
                                         bootstrap.id);
                    manager.run_election(None).await;
                }
            })
            .await;
        }
        Ok(())
    }

    /// Waits for the termination signal, then stops the replica.
    pub async fn run(
        &self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), ChatError> {
        while !*rx_term.borrow() {
            if rx_term.changed().await.is_err() {
                break;
            }
        }
        self.stop().await;
        Ok(())
    }

    /// Stops the replica: every loop is told to exit, every link is closed
    /// (forcibly if it does not drain within the grace) and every task is
    /// joined. Calling it again is a no-op.
    pub async fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        pf_info!(self.me; "stopping");

        if self.is_leader().await && self.rm_links.acquire_read().await.is_empty() {
            if let Err(e) =
                self.broadcast_server_message("Server is shutting down.").await
            {
                pf_warn!(self.me; "error sending shutdown notice: {}", e);
            }
        }

        self.tx_stop.send_replace(true);
        let links: Vec<Arc<Link>> = {
            let fe_links = self.fe_links.acquire_read().await;
            let rm_links = self.rm_links.acquire_read().await;
            fe_links.values().chain(rm_links.values()).cloned().collect()
        };
        future::join_all(links.iter().map(|link| link.close())).await;

        loop {
            let handles = std::mem::take(&mut *self.tasks.acquire_write().await);
            if handles.is_empty() {
                break;
            }
            for result in future::join_all(handles).await {
                if let Err(e) = result {
                    pf_warn!(self.me; "task ended abnormally: {}", e);
                }
            }
        }
        pf_info!(self.me; "stopped");
    }

    /// Spawns a task tracked for joining at shutdown.
    pub(crate) async fn spawn_task<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        let mut tasks = self.tasks.acquire_write().await;
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
        self.tasks.release_write(tasks);
    }

    /// Wraps the write half of a connection to `peer` into a link.
    pub(crate) fn new_link(
        &self,
        socket: SocketId,
        peer: SocketAddr,
        writer: OwnedWriteHalf,
    ) -> Arc<Link> {
        Link::new(
            self.me.clone(),
            socket,
            peer,
            writer,
            self.config.link_queue_cap,
        )
    }

    /// Allocates a cluster-wide unique socket identifier.
    pub(crate) fn new_socket_id(&self) -> SocketId {
        ((self.id as SocketId) << 48)
            | self.next_socket.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    fn user_timeout(&self) -> Duration {
        Duration::from_millis(self.config.user_timeout_ms)
    }

    fn replica_timeout(&self) -> Duration {
        Duration::from_millis(self.config.replica_timeout_ms)
    }

    fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.config.election_timeout_ms)
    }

    pub fn id(&self) -> ReplicaId {
        self.id
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn lobby(&self) -> &Lobby {
        &self.lobby
    }

    pub async fn leader(&self) -> LeaderPointer {
        *self.leader.acquire_read().await
    }

    pub async fn leader_id(&self) -> ReplicaId {
        self.leader.acquire_read().await.id
    }

    pub async fn is_leader(&self) -> bool {
        self.leader_id().await == self.id
    }

    pub fn election_running(&self) -> bool {
        self.election_started.load(Ordering::SeqCst)
    }

    /// Identifiers of the replicas this replica is linked to.
    pub async fn replica_ids(&self) -> Vec<ReplicaId> {
        let mut ids: Vec<_> = self
            .directory
            .list_replicas()
            .await
            .into_iter()
            .map(|(_, info)| info.id)
            .collect();
        ids.dedup();
        ids
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        self.directory.list_sessions().await
    }

    pub async fn session(&self, socket: SocketId) -> Option<SessionInfo> {
        self.directory.lookup_session(socket).await
    }

    pub async fn clients(&self) -> Vec<ClientInfo> {
        self.directory.list_clients().await
    }

    /// Human-readable dump of this replica's tables.
    pub async fn state_summary(&self) -> String {
        let leader = self.leader().await;
        let mut out = String::new();
        let _ = writeln!(
            out,
            "replica {} on {}, leader {} (port {}, link {:?})",
            self.id, self.listen_addr, leader.id, leader.port, leader.socket
        );
        for (socket, info) in self.directory.list_replicas().await {
            let _ = writeln!(
                out,
                "  replica {} at {}:{} via {:#x}",
                info.id, info.host, info.port, socket
            );
        }
        for client in self.clients().await {
            let _ = writeln!(
                out,
                "  client {:#x} at {}:{} as {}",
                client.socket, client.ip, client.port, client.login.sender
            );
        }
        for session in self.sessions().await {
            let _ = writeln!(
                out,
                "  session {:#x} of {} in {}",
                session.socket, session.user, session.group
            );
        }
        let fe_count = self.fe_links.acquire_read().await.len();
        let rm_count = self.rm_links.acquire_read().await.len();
        let _ = writeln!(out, "  {} front-end links, {} replica links",
                         fe_count, rm_count);
        out
    }

    /// Summary of active groups and their members.
    pub async fn groups_summary(&self) -> String {
        let mut out = String::new();
        for group in self.lobby.group_names().await {
            let members = self.lobby.members(&group).await;
            let _ = writeln!(out, "  {}: {}", group, members.join(", "));
        }
        out
    }
}
