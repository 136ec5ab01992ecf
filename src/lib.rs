//! Replichat: a replicated chat backend. Front-ends log into the leader
//! replica, which replicates every state change to its peers; when the
//! leader fails, the surviving replicas elect a new one that reconnects to
//! every front-end.

#[macro_use]
mod utils;

pub mod chat;
pub mod client;
pub mod protocol;
pub mod server;

pub use utils::{logger_init, ChatError, Monitor};

pub use client::{FrontEnd, FrontEndConfig, FrontEndEvent};
pub use server::{Bootstrap, LeaderPointer, ReplicaConfig, ReplicaManager};
