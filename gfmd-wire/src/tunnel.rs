//! Remote-peer tunneling: `REMOTE_PEER_ALLOC`, `REMOTE_PEER_FREE`, and
//! `REMOTE_RPC` forwarding.
//!
//! A remote peer has no connection of its own — it is a logical endpoint
//! (typically a storage-host connection the far side of the gfmd channel
//! physically owns) addressed through its parent local peer. This plays the
//! forwarding role the source gives a message proxy: requests tagged with a
//! remote peer id are relayed to whatever channel actually reaches that
//! peer, and the reply is relayed back untouched.
//!
//! Grounded on the bidirectional-forwarding shape of a frontend/backend
//! proxy, adapted from "forward a frame, relay the reply" to "forward an
//! RPC, relay its outcome" since the gfmd channel is request/response rather
//! than a message-passing pub/sub pattern.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use gfmd_core::async_mux::Outcome;
use gfmd_core::error::{ChannelError, Result};
use gfmd_core::peer::{AuthKind, LocalPeerState, PeerId, PeerTable};

use crate::args::{ArgDecoder, ArgEncoder};
use crate::channel::{GfmdChannel, InboundRequest};
use crate::opcode::Opcode;

/// How long a tunneled `REMOTE_RPC` waits for the far side before giving up
/// and answering `OperationTimedOut` to the original caller.
pub const REMOTE_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Wire encoding of [`AuthKind`] for `REMOTE_PEER_ALLOC`'s `auth_kind` arg.
fn decode_auth_kind(v: i32) -> Option<AuthKind> {
    match v {
        0 => Some(AuthKind::EndUser),
        1 => Some(AuthKind::StorageHost),
        2 => Some(AuthKind::MetadataHost),
        _ => None,
    }
}

/// Tracks, for each remote peer, the channel that can actually reach it.
/// A remote peer with no registered target (the common case: the side
/// holding the real connection hasn't attached yet, or never will) answers
/// `INVALID_REMOTE_PEER` to any `REMOTE_RPC` addressed to it.
#[derive(Default)]
pub struct TunnelRouter {
    targets: DashMap<PeerId, Arc<GfmdChannel>>,
}

impl TunnelRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach_target(&self, remote_id: PeerId, channel: Arc<GfmdChannel>) {
        self.targets.insert(remote_id, channel);
    }

    pub fn detach_target(&self, remote_id: PeerId) {
        self.targets.remove(&remote_id);
    }

    /// Handle `REMOTE_PEER_ALLOC`: args are `(l peer_id, i auth_kind, s
    /// user, s host, i family, i transport, i port)`, result `()`. The
    /// slave supplies the id that will later correlate `REMOTE_RPC` and
    /// `REMOTE_PEER_FREE` calls to this peer — the master does not mint and
    /// hand back one of its own.
    pub fn handle_alloc(&self, table: &PeerTable, parent: PeerId, args: &[u8]) -> (ChannelError, Vec<u8>) {
        let mut dec = ArgDecoder::new(args);
        let decoded = (|| -> Result<_> {
            let peer_id = dec.get_i64()? as u64;
            let auth_kind = dec.get_i32()?;
            let user = dec.get_str()?;
            let host = dec.get_str()?;
            let address_family = dec.get_i32()?;
            let transport = dec.get_i32()?;
            let port = dec.get_i32()? as u16;
            Ok((peer_id, auth_kind, user, host, address_family, transport, port))
        })();
        let (peer_id, auth_kind, user, host, address_family, transport, port) = match decoded {
            Ok(v) => v,
            Err(_) => return (ChannelError::Protocol, Vec::new()),
        };
        let Some(auth_kind) = decode_auth_kind(auth_kind) else {
            return (ChannelError::Protocol, Vec::new());
        };

        match table.insert_remote(parent, peer_id, auth_kind, user, host, address_family, transport, port) {
            Ok(_) => (ChannelError::NoError, Vec::new()),
            Err(e) => (e.to_channel_error(), Vec::new()),
        }
    }

    /// Handle `REMOTE_PEER_FREE`.
    ///
    /// The source's `remote_peer_free_by_id` inverts this check (acts as if
    /// a *found* peer were the error case); here a peer that exists is freed
    /// and answered `NoError`, and only a lookup miss is
    /// `INVALID_REMOTE_PEER`.
    pub fn handle_free(&self, table: &PeerTable, parent: PeerId, args: &[u8]) -> (ChannelError, Vec<u8>) {
        let mut dec = ArgDecoder::new(args);
        let remote_id = match dec.get_i64() {
            Ok(v) => v as PeerId,
            Err(_) => return (ChannelError::Protocol, Vec::new()),
        };

        match table.get_remote_child(parent, remote_id) {
            Ok(peer) => {
                table.free_request(peer.id);
                self.detach_target(remote_id);
                (ChannelError::NoError, Vec::new())
            }
            Err(_) => (ChannelError::InvalidRemotePeer, Vec::new()),
        }
    }

    /// Handle `REMOTE_RPC`: args are `<remote_peer_id:l> <inner_opcode:i>
    /// <inner_args...>`. Forwards the inner request to the registered
    /// target and blocks for its reply (or a timeout / disconnect).
    pub fn handle_remote_rpc(&self, table: &PeerTable, parent: PeerId, args: &[u8]) -> (ChannelError, Vec<u8>) {
        let mut dec = ArgDecoder::new(args);
        let (remote_id, inner_opcode) = match (|| -> Result<_> {
            Ok((dec.get_i64()? as PeerId, dec.get_i32()?))
        })() {
            Ok(v) => v,
            Err(_) => return (ChannelError::Protocol, Vec::new()),
        };
        let inner_args = dec.remaining();

        if table.get_remote_child(parent, remote_id).is_err() {
            return (ChannelError::InvalidRemotePeer, Vec::new());
        }
        let Some(target) = self.targets.get(&remote_id).map(|t| t.clone()) else {
            return (ChannelError::InvalidRemotePeer, Vec::new());
        };
        let Some(opcode) = Opcode::from_i32(inner_opcode) else {
            return (ChannelError::Protocol, Vec::new());
        };

        let call = match target.send_request(opcode, inner_args) {
            Ok(c) => c,
            Err(_) => return (ChannelError::ConnectionAborted, Vec::new()),
        };
        match call.wait_timeout(REMOTE_RPC_TIMEOUT) {
            Some(Outcome::Reply { errcode, payload }) => (errcode, payload),
            Some(Outcome::Disconnected) => (ChannelError::ConnectionAborted, Vec::new()),
            None => (ChannelError::OperationTimedOut, Vec::new()),
        }
    }

    /// Dispatch any of the three tunneling opcodes and send the reply on
    /// `channel`, given the local peer id that owns this inbound
    /// connection (`parent`). Returns `false` if `req.opcode` is not one of
    /// the tunneling opcodes, leaving the caller to handle it instead.
    #[must_use]
    pub fn dispatch(&self, table: &PeerTable, channel: &Arc<GfmdChannel>, parent: PeerId, req: &InboundRequest) -> bool {
        let (errcode, payload) = match req.opcode {
            Opcode::RemotePeerAlloc => self.handle_alloc(table, parent, &req.args),
            Opcode::RemotePeerFree => self.handle_free(table, parent, &req.args),
            Opcode::RemoteRpc => self.handle_remote_rpc(table, parent, &req.args),
            _ => return false,
        };
        let _ = channel.send_response(req.xid, errcode, &payload);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_peer(table: &PeerTable) -> PeerId {
        table.insert_local(AuthKind::MetadataHost, LocalPeerState::new(None)).id
    }

    fn alloc_args(peer_id: i64) -> Vec<u8> {
        ArgEncoder::new()
            .put_i64(peer_id)
            .put_i32(1) // auth_kind: StorageHost
            .put_str("user")
            .put_str("host")
            .put_i32(2)
            .put_i32(1)
            .put_i32(4000)
            .finish()
    }

    #[test]
    fn alloc_then_free_round_trip() {
        let table = PeerTable::new();
        let router = TunnelRouter::new();
        let parent = local_peer(&table);

        let (code, payload) = router.handle_alloc(&table, parent, &alloc_args(7));
        assert_eq!(code, ChannelError::NoError);
        assert!(payload.is_empty(), "ALLOC's result is () per the wire contract");

        let free_args = ArgEncoder::new().put_i64(7).finish();
        let (code, _) = router.handle_free(&table, parent, &free_args);
        assert_eq!(code, ChannelError::NoError);
    }

    #[test]
    fn free_of_unknown_remote_peer_is_invalid_remote_peer_not_success() {
        let table = PeerTable::new();
        let router = TunnelRouter::new();
        let parent = local_peer(&table);

        let free_args = ArgEncoder::new().put_i64(999_999).finish();
        let (code, _) = router.handle_free(&table, parent, &free_args);
        assert_eq!(code, ChannelError::InvalidRemotePeer);
    }

    #[test]
    fn remote_rpc_without_an_attached_target_is_invalid_remote_peer() {
        let table = PeerTable::new();
        let router = TunnelRouter::new();
        let parent = local_peer(&table);

        let (_, _) = router.handle_alloc(&table, parent, &alloc_args(7));

        let rpc_args = ArgEncoder::new()
            .put_i64(7)
            .put_i32(Opcode::JournalSend as i32)
            .finish();
        let (code, _) = router.handle_remote_rpc(&table, parent, &rpc_args);
        assert_eq!(code, ChannelError::InvalidRemotePeer);
    }

    #[test]
    fn remote_rpc_rejects_peer_not_owned_by_caller() {
        let table = PeerTable::new();
        let router = TunnelRouter::new();
        let owner = local_peer(&table);
        let impostor = local_peer(&table);

        let (_, _) = router.handle_alloc(&table, owner, &alloc_args(7));

        let rpc_args = ArgEncoder::new()
            .put_i64(7)
            .put_i32(Opcode::JournalSend as i32)
            .finish();
        let (code, _) = router.handle_remote_rpc(&table, impostor, &rpc_args);
        assert_eq!(code, ChannelError::InvalidRemotePeer);
    }

    #[test]
    fn alloc_honors_the_caller_supplied_auth_kind_and_identity() {
        let table = PeerTable::new();
        let router = TunnelRouter::new();
        let parent = local_peer(&table);

        let args = ArgEncoder::new()
            .put_i64(3)
            .put_i32(0) // EndUser, not the old hardcoded StorageHost
            .put_str("alice")
            .put_str("client.example")
            .put_i32(2)
            .put_i32(1)
            .put_i32(5000)
            .finish();
        let (code, _) = router.handle_alloc(&table, parent, &args);
        assert_eq!(code, ChannelError::NoError);

        let peer = table.get_remote_child(parent, 3).unwrap();
        assert_eq!(peer.auth_kind, AuthKind::EndUser);
        assert_eq!(peer.as_remote().user, "alice");
        assert_eq!(peer.as_remote().host, "client.example");
    }
}
