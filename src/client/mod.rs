//! Front-end side of the chat backend: one user session in one group,
//! following the leader across failovers.

mod endpoint;

pub use endpoint::{FrontEnd, FrontEndConfig, FrontEndEvent};
