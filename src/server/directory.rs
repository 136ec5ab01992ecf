//! Membership and session directory: who is connected where, as seen by
//! this replica.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::protocol::{ClientUpdate, MessageRecord, ReplicaId, SocketId};
use crate::utils::{ChatError, Monitor};

/// A peer replica reachable through some link.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ReplicaInfo {
    pub id: ReplicaId,
    pub port: u16,
    pub host: String,
}

impl ReplicaInfo {
    /// Address the replica listens on.
    pub fn addr(&self) -> Result<SocketAddr, ChatError> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}

/// A logged-in front-end connection bound to a user and a group.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct SessionInfo {
    pub socket: SocketId,
    pub user: String,
    pub group: String,
}

/// A front-end registration, kept so that a future leader can reconnect to
/// it.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ClientInfo {
    pub socket: SocketId,
    pub ip: String,
    pub port: u16,
    pub login: MessageRecord,
}

impl ClientInfo {
    /// Reconnect address of the front-end.
    pub fn addr(&self) -> Result<SocketAddr, ChatError> {
        Ok(format!("{}:{}", self.ip, self.port).parse()?)
    }

    pub fn to_update(&self) -> ClientUpdate {
        ClientUpdate {
            ip: self.ip.clone(),
            port: self.port,
            socket: self.socket,
            login: self.login.clone(),
        }
    }
}

impl From<&ClientUpdate> for ClientInfo {
    fn from(update: &ClientUpdate) -> Self {
        ClientInfo {
            socket: update.socket,
            ip: update.ip.clone(),
            port: update.port,
            login: update.login.clone(),
        }
    }
}

/// Replica, session and client tables, each behind its own monitor. Lookups
/// of unknown sockets return `None`.
#[derive(Debug)]
pub(crate) struct Directory {
    replicas: Monitor<HashMap<SocketId, ReplicaInfo>>,
    sessions: Monitor<HashMap<SocketId, SessionInfo>>,
    clients: Monitor<HashMap<SocketId, ClientInfo>>,
}

impl Directory {
    pub(crate) fn new() -> Self {
        Directory {
            replicas: Monitor::new("replicas", HashMap::new()),
            sessions: Monitor::new("sessions", HashMap::new()),
            clients: Monitor::new("clients", HashMap::new()),
        }
    }

    pub(crate) async fn register_replica(
        &self,
        socket: SocketId,
        info: ReplicaInfo,
    ) {
        let mut replicas = self.replicas.acquire_write().await;
        replicas.insert(socket, info);
        self.replicas.release_write(replicas);
    }

    pub(crate) async fn lookup_replica(
        &self,
        socket: SocketId,
    ) -> Option<ReplicaInfo> {
        let replicas = self.replicas.acquire_read().await;
        replicas.get(&socket).cloned()
    }

    pub(crate) async fn remove_replica(
        &self,
        socket: SocketId,
    ) -> Option<ReplicaInfo> {
        let mut replicas = self.replicas.acquire_write().await;
        replicas.remove(&socket)
    }

    /// Removes every entry of replica `id`, returning the sockets they were
    /// keyed by.
    pub(crate) async fn remove_replica_by_id(
        &self,
        id: ReplicaId,
    ) -> Vec<SocketId> {
        let mut replicas = self.replicas.acquire_write().await;
        let sockets: Vec<SocketId> = replicas
            .iter()
            .filter(|(_, info)| info.id == id)
            .map(|(&socket, _)| socket)
            .collect();
        for socket in &sockets {
            replicas.remove(socket);
        }
        sockets
    }

    pub(crate) async fn has_replica(&self, id: ReplicaId) -> bool {
        let replicas = self.replicas.acquire_read().await;
        replicas.values().any(|info| info.id == id)
    }

    /// All known replicas, ordered by identifier.
    pub(crate) async fn list_replicas(&self) -> Vec<(SocketId, ReplicaInfo)> {
        let replicas = self.replicas.acquire_read().await;
        let mut list: Vec<_> = replicas
            .iter()
            .map(|(&socket, info)| (socket, info.clone()))
            .collect();
        list.sort_by_key(|(_, info)| info.id);
        list
    }

    pub(crate) async fn register_session(&self, info: SessionInfo) {
        let mut sessions = self.sessions.acquire_write().await;
        sessions.insert(info.socket, info);
        self.sessions.release_write(sessions);
    }

    pub(crate) async fn lookup_session(
        &self,
        socket: SocketId,
    ) -> Option<SessionInfo> {
        let sessions = self.sessions.acquire_read().await;
        sessions.get(&socket).cloned()
    }

    pub(crate) async fn remove_session(
        &self,
        socket: SocketId,
    ) -> Option<SessionInfo> {
        let mut sessions = self.sessions.acquire_write().await;
        sessions.remove(&socket)
    }

    pub(crate) async fn list_sessions(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.acquire_read().await;
        let mut list: Vec<_> = sessions.values().cloned().collect();
        list.sort_by_key(|s| s.socket);
        list
    }

    /// Sockets of all sessions joined to `group`.
    pub(crate) async fn sessions_in_group(&self, group: &str) -> Vec<SocketId> {
        let sessions = self.sessions.acquire_read().await;
        sessions
            .values()
            .filter(|s| s.group == group)
            .map(|s| s.socket)
            .collect()
    }

    pub(crate) async fn register_client(&self, info: ClientInfo) {
        let mut clients = self.clients.acquire_write().await;
        clients.insert(info.socket, info);
        self.clients.release_write(clients);
    }

    pub(crate) async fn remove_client(
        &self,
        socket: SocketId,
    ) -> Option<ClientInfo> {
        let mut clients = self.clients.acquire_write().await;
        clients.remove(&socket)
    }

    pub(crate) async fn list_clients(&self) -> Vec<ClientInfo> {
        let clients = self.clients.acquire_read().await;
        let mut list: Vec<_> = clients.values().cloned().collect();
        list.sort_by_key(|c| c.socket);
        list
    }

    /// Runs `f` on the registered clients, in socket order, while the
    /// client table is held, so no registration or removal lands in the
    /// middle of it.
    pub(crate) async fn with_clients<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&[&ClientInfo]) -> R,
    {
        let clients = self.clients.acquire_read().await;
        let mut list: Vec<&ClientInfo> = clients.values().collect();
        list.sort_by_key(|c| c.socket);
        let result = f(&list);
        drop(list);
        self.clients.release_read(clients);
        result
    }

    /// Re-keys sessions and clients from old to new sockets following
    /// `translation`. Entries not named in the table are dropped from both
    /// tables; the dropped sessions are returned so their users can be
    /// signed out.
    pub(crate) async fn migrate(
        &self,
        translation: &[(SocketId, SocketId)],
    ) -> Vec<SessionInfo> {
        let mut clients = self.clients.acquire_write().await;
        let mut sessions = self.sessions.acquire_write().await;

        let mut new_clients = HashMap::with_capacity(translation.len());
        let mut new_sessions = HashMap::with_capacity(translation.len());
        for &(old, new) in translation {
            if let Some(mut session) = sessions.remove(&old) {
                session.socket = new;
                new_sessions.insert(new, session);
            }
            if let Some(mut client) = clients.remove(&old) {
                client.socket = new;
                new_clients.insert(new, client);
            }
        }

        let mut retired: Vec<SessionInfo> =
            sessions.drain().map(|(_, s)| s).collect();
        retired.sort_by_key(|s| s.socket);
        *sessions = new_sessions;
        *clients = new_clients;

        self.sessions.release_write(sessions);
        self.clients.release_write(clients);
        retired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn session(socket: SocketId, user: &str) -> SessionInfo {
        SessionInfo {
            socket,
            user: user.into(),
            group: "hikers".into(),
        }
    }

    fn client(socket: SocketId, user: &str) -> ClientInfo {
        ClientInfo {
            socket,
            ip: "127.0.0.1".into(),
            port: 40000 + socket as u16,
            login: MessageRecord::login(user, "hikers", 40000 + socket as u16),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn lookup_unknown_is_none() {
        let directory = Directory::new();
        assert_eq!(directory.lookup_session(7).await, None);
        assert_eq!(directory.lookup_replica(7).await, None);
        assert_eq!(directory.remove_session(7).await, None);
        assert_eq!(directory.remove_client(7).await, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn replicas_by_id() {
        let directory = Directory::new();
        for (socket, id) in [(10, 3), (11, 1), (12, 2)] {
            let info = ReplicaInfo {
                id,
                port: 50000 + id as u16,
                host: "127.0.0.1".into(),
            };
            directory.register_replica(socket, info).await;
        }
        let ids: Vec<_> = directory
            .list_replicas()
            .await
            .into_iter()
            .map(|(_, info)| info.id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(directory.has_replica(3).await);
        assert_eq!(directory.remove_replica_by_id(3).await, vec![10]);
        assert!(directory.remove_replica_by_id(3).await.is_empty());
        assert!(!directory.has_replica(3).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn migrate_rekeys_and_retires() {
        let directory = Directory::new();
        for (socket, user) in [(1, "alice"), (2, "bobby"), (3, "carol")] {
            directory.register_session(session(socket, user)).await;
            directory.register_client(client(socket, user)).await;
        }

        let retired = directory.migrate(&[(1, 101), (2, 102)]).await;
        assert_eq!(retired, vec![session(3, "carol")]);

        assert_eq!(directory.lookup_session(1).await, None);
        assert_eq!(directory.lookup_session(101).await, Some(session(101, "alice")));
        assert_eq!(directory.lookup_session(102).await.map(|s| s.user), Some("bobby".into()));
        let clients: Vec<_> =
            directory.list_clients().await.iter().map(|c| c.socket).collect();
        assert_eq!(clients, vec![101, 102]);
        // reconnect port survives the re-keying
        assert_eq!(directory.list_clients().await[0].port, 40001);
        assert_eq!(directory.sessions_in_group("hikers").await.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn client_snapshot_holds_off_removal() {
        let directory = Arc::new(Directory::new());
        for (socket, user) in [(2, "bobby"), (1, "alice")] {
            directory.register_client(client(socket, user)).await;
        }

        let removed = Arc::new(AtomicBool::new(false));
        let seen = directory
            .with_clients(|clients| {
                let (task_directory, task_removed) = (directory.clone(), removed.clone());
                tokio::spawn(async move {
                    let (directory, removed) = (task_directory, task_removed);
                    directory.remove_client(2).await;
                    removed.store(true, Ordering::SeqCst);
                });
                std::thread::sleep(Duration::from_millis(100));
                assert!(!removed.load(Ordering::SeqCst));
                clients.iter().map(|c| c.socket).collect::<Vec<_>>()
            })
            .await;
        assert_eq!(seen, vec![1, 2]);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(removed.load(Ordering::SeqCst));
        assert_eq!(directory.list_clients().await.len(), 1);
    }
}
