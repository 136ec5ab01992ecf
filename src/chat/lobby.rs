//! Users, groups and the session cap.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use crate::chat::{valid_name, HistoryFile};
use crate::protocol::MessageRecord;
use crate::utils::{ChatError, Monitor};

use tokio::fs;

/// Sender name used on notices generated by replicas.
pub const NOTICE_SENDER: &str = "server";

/// A user with at least one open session.
#[derive(Debug, Default)]
pub struct User {
    pub name: String,

    /// Map from group name -> number of open sessions in it.
    pub sessions: HashMap<String, usize>,
}

impl User {
    /// Total number of open sessions across groups.
    pub fn total_sessions(&self) -> usize {
        self.sessions.values().sum()
    }
}

/// A group with at least one member.
#[derive(Debug)]
pub struct Group {
    pub name: String,
    pub members: HashSet<String>,
    pub history: HistoryFile,
}

/// Result of a join attempt.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum JoinOutcome {
    /// Session counted; carries the "joined" notice already persisted to the
    /// group's history if this is the user's first session in the group.
    Joined { notice: Option<MessageRecord> },

    /// Login refused, with the reason to show to the user.
    Refused(String),
}

/// Directory of active users and groups. Owns every `User` and `Group`;
/// dropping an entry from its table is where its lifetime ends.
#[derive(Debug)]
pub struct Lobby {
    /// Logging prefix of the owning node.
    me: String,

    hist_dir: PathBuf,
    max_sessions: usize,

    users: Monitor<HashMap<String, User>>,
    groups: Monitor<HashMap<String, Group>>,
}

impl Lobby {
    /// Creates an empty lobby keeping group histories under `hist_dir`.
    pub async fn new_and_setup(
        me: impl Into<String>,
        hist_dir: impl Into<PathBuf>,
        max_sessions: usize,
    ) -> Result<Self, ChatError> {
        let hist_dir = hist_dir.into();
        fs::create_dir_all(&hist_dir).await?;
        Ok(Lobby {
            me: me.into(),
            hist_dir,
            max_sessions,
            users: Monitor::new("users", HashMap::new()),
            groups: Monitor::new("groups", HashMap::new()),
        })
    }

    /// Finds the named group or creates it, opening its history file.
    async fn find_or_create<'a>(
        &self,
        groups: &'a mut HashMap<String, Group>,
        name: &str,
    ) -> Result<&'a mut Group, ChatError> {
        if !groups.contains_key(name) {
            let path = self.hist_dir.join(format!("{}.hist", name));
            let history = HistoryFile::open(&path).await?;
            pf_debug!(self.me; "opened group '{}' with {} records",
                               name, history.count());
            groups.insert(
                name.to_string(),
                Group {
                    name: name.to_string(),
                    members: HashSet::new(),
                    history,
                },
            );
        }
        groups
            .get_mut(name)
            .ok_or_else(|| ChatError::msg(format!("group '{}' vanished", name)))
    }

    /// Opens one session of `user` in `group`, enforcing the session cap.
    pub async fn join(
        &self,
        user: &str,
        group: &str,
    ) -> Result<JoinOutcome, ChatError> {
        if !valid_name(user) || !valid_name(group) {
            return Ok(JoinOutcome::Refused(format!(
                "Connection was refused: invalid user or group name ({}, {})",
                user, group
            )));
        }

        let mut users = self.users.acquire_write().await;
        let entry = users.entry(user.to_string()).or_insert_with(|| User {
            name: user.to_string(),
            ..Default::default()
        });
        if entry.total_sessions() >= self.max_sessions {
            pf_info!(self.me; "user '{}' refused: {} sessions open",
                              user, entry.total_sessions());
            return Ok(JoinOutcome::Refused(format!(
                "Connection was refused: exceeds MAX_SESSIONS ({})",
                self.max_sessions
            )));
        }

        let mut groups = self.groups.acquire_write().await;
        let target = self.find_or_create(&mut groups, group).await?;
        target.members.insert(user.to_string());

        let count = entry.sessions.entry(group.to_string()).or_insert(0);
        *count += 1;
        let notice = if *count == 1 {
            let notice = MessageRecord::server(
                NOTICE_SENDER,
                format!("User [{}] has joined.", user),
            );
            target.history.append(&notice).await?;
            Some(notice)
        } else {
            None
        };

        self.groups.release_write(groups);
        self.users.release_write(users);
        Ok(JoinOutcome::Joined { notice })
    }

    /// Closes one session of `user` in `group`. Returns the "disconnected"
    /// notice persisted to the group's history if that was the user's last
    /// session in the group. Unknown users or groups are a no-op.
    pub async fn leave(
        &self,
        user: &str,
        group: &str,
    ) -> Result<Option<MessageRecord>, ChatError> {
        let mut users = self.users.acquire_write().await;
        let Some(entry) = users.get_mut(user) else {
            return Ok(None);
        };
        let Some(count) = entry.sessions.get_mut(group) else {
            return Ok(None);
        };
        *count -= 1;
        if *count > 0 {
            return Ok(None);
        }
        entry.sessions.remove(group);
        if entry.sessions.is_empty() {
            users.remove(user);
        }

        let mut groups = self.groups.acquire_write().await;
        let mut notice = None;
        if let Some(target) = groups.get_mut(group) {
            target.members.remove(user);
            let record = MessageRecord::server(
                NOTICE_SENDER,
                format!("User [{}] has disconnected.", user),
            );
            target.history.append(&record).await?;
            notice = Some(record);

            if target.members.is_empty() {
                groups.remove(group);
                pf_debug!(self.me; "group '{}' has no members left", group);
            }
        }

        self.groups.release_write(groups);
        self.users.release_write(users);
        Ok(notice)
    }

    /// Persists `record` to the named group's history, creating the group
    /// if needed.
    pub async fn post(
        &self,
        group: &str,
        record: &MessageRecord,
    ) -> Result<(), ChatError> {
        let mut groups = self.groups.acquire_write().await;
        let target = self.find_or_create(&mut groups, group).await?;
        target.history.append(record).await?;
        if target.members.is_empty() {
            // created only to hold the record
            groups.remove(group);
        }
        Ok(())
    }

    /// Returns up to `n` most recent records of the named group.
    pub async fn recover_history(
        &self,
        group: &str,
        n: usize,
    ) -> Result<Vec<MessageRecord>, ChatError> {
        let groups = self.groups.acquire_read().await;
        match groups.get(group) {
            Some(target) => target.history.recover(n).await,
            None => Ok(vec![]),
        }
    }

    /// Names of all active groups.
    pub async fn group_names(&self) -> Vec<String> {
        let groups = self.groups.acquire_read().await;
        let mut names: Vec<_> = groups.keys().cloned().collect();
        names.sort();
        names
    }

    /// Members of the named group, sorted.
    pub async fn members(&self, group: &str) -> Vec<String> {
        let groups = self.groups.acquire_read().await;
        let mut members: Vec<_> = groups
            .get(group)
            .map(|g| g.members.iter().cloned().collect::<Vec<String>>())
            .unwrap_or_default();
        members.sort();
        members
    }

    /// Number of sessions `user` currently holds.
    pub async fn session_count(&self, user: &str) -> usize {
        let users = self.users.acquire_read().await;
        users.get(user).map_or(0, User::total_sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RecordKind;

    async fn fresh_lobby(dir: &str, cap: usize) -> Result<Lobby, ChatError> {
        let _ = fs::remove_dir_all(dir).await;
        Lobby::new_and_setup("t", dir, cap).await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn join_posts_notice_once() -> Result<(), ChatError> {
        let lobby = fresh_lobby("/tmp/replichat-test-lobby-join", 2).await?;
        match lobby.join("alice", "rustaceans").await? {
            JoinOutcome::Joined { notice: Some(n) } => {
                assert_eq!(n.text, "User [alice] has joined.");
                assert_eq!(n.kind, RecordKind::Server);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(
            lobby.join("alice", "rustaceans").await?,
            JoinOutcome::Joined { notice: None }
        );
        assert_eq!(lobby.session_count("alice").await, 2);
        assert_eq!(lobby.members("rustaceans").await, vec!["alice"]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cap_refuses_third_session() -> Result<(), ChatError> {
        let lobby = fresh_lobby("/tmp/replichat-test-lobby-cap", 2).await?;
        lobby.join("bobby", "group.one").await?;
        lobby.join("bobby", "group.two").await?;
        match lobby.join("bobby", "group.one").await? {
            JoinOutcome::Refused(reason) => assert_eq!(
                reason,
                "Connection was refused: exceeds MAX_SESSIONS (2)"
            ),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(lobby.session_count("bobby").await, 2);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalid_names_refused() -> Result<(), ChatError> {
        let lobby = fresh_lobby("/tmp/replichat-test-lobby-names", 2).await?;
        assert!(matches!(
            lobby.join("x", "rustaceans").await?,
            JoinOutcome::Refused(_)
        ));
        assert!(matches!(
            lobby.join("carol", "../etc").await?,
            JoinOutcome::Refused(_)
        ));
        assert!(lobby.group_names().await.is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn leave_drops_empty_group_keeps_history() -> Result<(), ChatError> {
        let lobby = fresh_lobby("/tmp/replichat-test-lobby-leave", 2).await?;
        lobby.join("dave1", "hikers").await?;
        lobby
            .post("hikers", &MessageRecord::new("dave1", RecordKind::User, "hi"))
            .await?;

        let notice = lobby.leave("dave1", "hikers").await?;
        assert_eq!(
            notice.map(|n| n.text),
            Some("User [dave1] has disconnected.".into())
        );
        assert!(lobby.group_names().await.is_empty());
        assert_eq!(lobby.session_count("dave1").await, 0);

        // leaving again is a no-op
        assert_eq!(lobby.leave("dave1", "hikers").await?, None);

        lobby.join("erin1", "hikers").await?;
        let history = lobby.recover_history("hikers", 10).await?;
        let texts: Vec<_> = history.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(
            texts,
            vec![
                "User [dave1] has joined.",
                "hi",
                "User [dave1] has disconnected.",
                "User [erin1] has joined.",
            ]
        );
        Ok(())
    }
}
