//! Catch-up snapshot the leader hands to a newly linked replica.

use std::sync::Arc;

use crate::protocol::{Payload, ReplicaId, ReplicaUpdate};
use crate::server::link::Link;
use crate::server::ReplicaManager;
use crate::utils::ChatError;

impl ReplicaManager {
    /// Sends the replica on `link` one replica update for every other known
    /// replica, then one login update for every registered front-end, all
    /// queued as a single batch.
    ///
    /// The link is already registered for broadcasts when this runs, and
    /// the batch is queued while the client table is held. A front-end
    /// leaving concurrently is either missing from the snapshot or has its
    /// disconnect queued behind its login, since sessions are closed
    /// locally before the disconnect is broadcast. A duplicated login is
    /// skipped by the receiver.
    pub(crate) async fn catch_up(
        &self,
        link: &Arc<Link>,
        new_id: ReplicaId,
    ) -> Result<(), ChatError> {
        let mut packets = Vec::new();
        for (_, info) in self.directory.list_replicas().await {
            if info.id == new_id {
                continue;
            }
            packets.push(
                Payload::UpdateReplica(ReplicaUpdate {
                    id: info.id,
                    port: info.port,
                    host: info.host,
                })
                .to_packet()?,
            );
        }
        let peers = packets.len();

        let clients = self
            .directory
            .with_clients(|clients| {
                for client in clients {
                    packets.push(
                        Payload::UpdateLogin(client.to_update()).to_packet()?,
                    );
                }
                link.send_batch(packets)?;
                Ok::<_, ChatError>(clients.len())
            })
            .await?;
        pf_info!(self.me; "caught up replica {}: {} peers, {} front-ends",
                          new_id, peers, clients);
        Ok(())
    }
}
