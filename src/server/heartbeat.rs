//! Keep-alive traffic on replica links, so that a silent but healthy peer
//! never trips the receive timeout.

use std::sync::Arc;

use crate::protocol::Payload;
use crate::server::ReplicaManager;

use tokio::time::{self, Duration, MissedTickBehavior};

impl ReplicaManager {
    /// Sends a KEEP_ALIVE to every linked replica once per interval until
    /// stop.
    pub(crate) async fn run_keep_alive(self: Arc<Self>) {
        let mut rx_stop = self.tx_stop.subscribe();
        let mut interval = time::interval(Duration::from_millis(
            self.config.keep_alive_interval_ms,
        ));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        pf_debug!(self.me; "keep-alive task started");

        while !self.stopping() {
            tokio::select! {
                _ = interval.tick() => {
                    self.broadcast_update(&Payload::KeepAlive).await;
                },

                _ = rx_stop.changed() => break,
            }
        }

        pf_debug!(self.me; "keep-alive task exited");
    }
}
