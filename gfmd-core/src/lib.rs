//! gfmd-core
//!
//! Runtime-agnostic building blocks for the gfmd metadata-replication core:
//! - the peer abstraction and its arena ([`peer`])
//! - the metadata-host registry and cluster/election model ([`mdhost`])
//! - the transaction-id multiplexed async RPC completion table ([`async_mux`])
//! - connection backoff ([`reconnect`])
//! - TCP setup helpers ([`tcp`])
//! - the error taxonomy ([`error`])

#![deny(unsafe_code)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::match_same_arms)]

pub mod async_mux;
pub mod error;
pub mod mdhost;
pub mod peer;
pub mod reconnect;
pub mod tcp;

pub mod prelude {
    pub use crate::async_mux::{AsyncMux, Outcome, PendingCall, Xid};
    pub use crate::error::{ChannelError, GfmdError, Result};
    pub use crate::mdhost::{MdHost, MdHostRegistry};
    pub use crate::peer::{AuthKind, Peer, PeerId, PeerKind, PeerTable};
    pub use crate::reconnect::ReconnectState;
}
