//! Peer abstraction: a connection endpoint, local or tunneled.
//!
//! A [`Peer`] is either a [`LocalPeerState`] (owns a byte-stream connection
//! and an async RPC multiplexer) or a [`RemotePeerState`] (no connection of
//! its own; tunneled through a parent local peer). Peers live in a
//! [`PeerTable`] arena keyed by [`PeerId`]; the table never reuses a slot
//! until a dedicated closer worker has observed both a zero reference count
//! and an idle (`!busy`) peer, mirroring the source's `peer_free_request` /
//! `peer_closer` split between "requested" and "actually freed".

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{ChannelError, GfmdError, Result};

/// Stable process-wide identity for a peer. Never reused.
pub type PeerId = u64;

/// Opaque cookie identifying a pending "new generation" reservation, handed
/// out by the inode layer (out of scope here) and merely tracked per-peer so
/// it can be finalized if the peer disappears first.
pub type GenerationCookie = u64;

/// The kind of principal a peer has authenticated as. `SWITCH_GFMD_CHANNEL`
/// is only accepted from peers whose auth kind is `MetadataHost`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthKind {
    EndUser,
    StorageHost,
    MetadataHost,
}

/// A single outstanding "new generation" reservation. Finalized with
/// [`ChannelError::ConnectionAborted`] if the owning peer is freed before the
/// inode layer (out of scope here) resolves it normally.
#[derive(Debug)]
pub struct PendingGeneration {
    pub cookie: GenerationCookie,
    pub inode: u64,
}

#[derive(Default)]
struct PendingState {
    by_fd: Option<PendingGeneration>,
    by_cookie: HashMap<GenerationCookie, PendingGeneration>,
}

impl PendingState {
    fn finalize_all(&mut self) -> Vec<PendingGeneration> {
        let mut drained: Vec<PendingGeneration> = self.by_cookie.drain().map(|(_, v)| v).collect();
        if let Some(p) = self.by_fd.take() {
            drained.push(p);
        }
        drained
    }
}

/// Something a local peer can half-close to release a thread blocked in
/// read or write, without the peer table depending on a particular
/// transport crate.
pub trait PeerConnection: Send + Sync {
    fn shutdown(&self);
}

impl PeerConnection for std::net::TcpStream {
    fn shutdown(&self) {
        let _ = std::net::TcpStream::shutdown(self, std::net::Shutdown::Both);
    }
}

/// State specific to a local peer: an owned connection plus the table of
/// remote peers tunneled through it.
pub struct LocalPeerState {
    /// Address of the remote end, for logging; `None` for an in-process pair.
    pub peer_addr: Option<std::net::SocketAddr>,
    connection: Mutex<Option<Arc<dyn PeerConnection>>>,
    /// The async-RPC multiplexer handle this peer owns (design §3). Created
    /// eagerly so a peer can be constructed and wired to its transport in
    /// either order.
    pub async_mux: Arc<crate::async_mux::AsyncMux>,
    children: Mutex<Vec<PeerId>>,
}

impl LocalPeerState {
    #[must_use]
    pub fn new(peer_addr: Option<std::net::SocketAddr>) -> Self {
        Self {
            peer_addr,
            connection: Mutex::new(None),
            async_mux: Arc::new(crate::async_mux::AsyncMux::new()),
            children: Mutex::new(Vec::new()),
        }
    }

    /// Attach the byte-stream connection this peer owns. Called once the
    /// transport is available; a peer with no connection attached (an
    /// in-process pair, or one not yet wired up) simply has nothing to
    /// half-close.
    pub fn attach_connection(&self, connection: Arc<dyn PeerConnection>) {
        *self.connection.lock() = Some(connection);
    }

    #[must_use]
    pub fn connection(&self) -> Option<Arc<dyn PeerConnection>> {
        self.connection.lock().clone()
    }

    /// Half-close the owned connection, if any, and resolve every
    /// multiplexed call as disconnected so a thread blocked in
    /// `wait_timeout` is woken rather than left hanging until its timeout.
    pub fn shutdown(&self) {
        if let Some(conn) = self.connection.lock().take() {
            conn.shutdown();
        }
        self.async_mux.disconnect_all();
    }

    fn add_child(&self, id: PeerId) {
        self.children.lock().push(id);
    }

    fn remove_child(&self, id: PeerId) {
        self.children.lock().retain(|c| *c != id);
    }

    fn children_snapshot(&self) -> Vec<PeerId> {
        self.children.lock().clone()
    }
}

/// State specific to a remote (tunneled) peer. Carries only endpoint
/// metadata; the connection it rides on belongs to `parent`.
pub struct RemotePeerState {
    pub parent: PeerId,
    /// The peer id the far side (the slave that allocated this remote peer)
    /// uses to address it in `REMOTE_RPC`/`REMOTE_PEER_FREE` — not the same
    /// number space as this table's own local peer ids.
    pub caller_peer_id: u64,
    pub user: String,
    pub host: String,
    pub address_family: i32,
    pub transport: i32,
    pub port: u16,
}

/// Tagged-variant replacement for the source's `peer_ops` vtable: a peer is
/// either local or remote, never anything else, so downcasting is a safe
/// variant check rather than an unchecked cast.
pub enum PeerKind {
    Local(LocalPeerState),
    Remote(RemotePeerState),
}

/// A connection endpoint: local socket peer or tunneled remote peer.
pub struct Peer {
    pub id: PeerId,
    pub auth_kind: AuthKind,
    principal: Mutex<Option<String>>,
    refcount: AtomicI64,
    free_requested: AtomicBool,
    busy: AtomicBool,
    protocol_error: AtomicBool,
    pending: Mutex<PendingState>,
    pub kind: PeerKind,
}

impl Peer {
    fn new(id: PeerId, auth_kind: AuthKind, kind: PeerKind) -> Self {
        Self {
            id,
            auth_kind,
            principal: Mutex::new(None),
            refcount: AtomicI64::new(0),
            free_requested: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            protocol_error: AtomicBool::new(false),
            pending: Mutex::new(PendingState::default()),
            kind,
        }
    }

    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self.kind, PeerKind::Local(_))
    }

    #[must_use]
    pub fn is_remote(&self) -> bool {
        matches!(self.kind, PeerKind::Remote(_))
    }

    /// Downcast to the local variant. Mismatched kind is a programming
    /// error in the caller, not a recoverable condition, so this panics
    /// rather than returning `None` — mirroring `peer_to_local_peer`'s
    /// `gflog_fatal` on a bad cast in the source.
    #[must_use]
    pub fn as_local(&self) -> &LocalPeerState {
        match &self.kind {
            PeerKind::Local(l) => l,
            PeerKind::Remote(_) => panic!("peer {} is not a local peer", self.id),
        }
    }

    /// See [`Peer::as_local`].
    #[must_use]
    pub fn as_remote(&self) -> &RemotePeerState {
        match &self.kind {
            PeerKind::Remote(r) => r,
            PeerKind::Local(_) => panic!("peer {} is not a remote peer", self.id),
        }
    }

    /// get-port: the remote end's port, if known.
    #[must_use]
    pub fn get_port(&self) -> Option<u16> {
        match &self.kind {
            PeerKind::Local(l) => l.peer_addr.map(|a| a.port()),
            PeerKind::Remote(r) => Some(r.port),
        }
    }

    /// get-parent: only a remote peer has one.
    #[must_use]
    pub fn get_parent(&self) -> Option<PeerId> {
        match &self.kind {
            PeerKind::Remote(r) => Some(r.parent),
            PeerKind::Local(_) => None,
        }
    }

    /// shutdown: half-close the owned connection. A remote peer owns no
    /// connection of its own (§4.1: `get-connection` on a remote peer
    /// returns the parent's), so this is a no-op for one — tearing down the
    /// parent is what actually closes the socket.
    pub fn shutdown(&self) {
        if let PeerKind::Local(l) = &self.kind {
            l.shutdown();
        }
    }

    pub fn set_principal(&self, name: impl Into<String>) {
        *self.principal.lock() = Some(name.into());
    }

    #[must_use]
    pub fn principal(&self) -> Option<String> {
        self.principal.lock().clone()
    }

    /// Increment the reference count. Pair with [`Peer::del_ref`].
    pub fn add_ref(&self) {
        self.refcount.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrement the reference count, returning the count observed after
    /// decrementing. Callers that need to wake the closer when this reaches
    /// zero should go through [`PeerTable::del_ref`] instead, which does so
    /// automatically.
    fn del_ref_raw(&self) -> i64 {
        self.refcount.fetch_sub(1, Ordering::SeqCst) - 1
    }

    #[must_use]
    pub fn refcount(&self) -> i64 {
        self.refcount.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
    }

    #[must_use]
    pub fn free_requested(&self) -> bool {
        self.free_requested.load(Ordering::SeqCst)
    }

    pub fn record_protocol_error(&self) {
        self.protocol_error.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn had_protocol_error(&self) -> bool {
        self.protocol_error.load(Ordering::SeqCst)
    }

    pub fn add_pending_by_cookie(&self, p: PendingGeneration) {
        self.pending.lock().by_cookie.insert(p.cookie, p);
    }

    pub fn take_pending_by_cookie(&self, cookie: GenerationCookie) -> Option<PendingGeneration> {
        self.pending.lock().by_cookie.remove(&cookie)
    }

    pub fn set_pending_by_fd(&self, p: PendingGeneration) {
        self.pending.lock().by_fd = Some(p);
    }

    pub fn take_pending_by_fd(&self) -> Option<PendingGeneration> {
        self.pending.lock().by_fd.take()
    }
}

/// Arena of all known peers plus the async closer worker's work queue.
///
/// Lock order: `closing` is always taken without holding any per-peer lock,
/// matching the outermost-first order in the concurrency model (peer-table
/// sits above peer-internal locks).
pub struct PeerTable {
    entries: dashmap::DashMap<PeerId, Arc<Peer>>,
    next_id: AtomicU64,
    closing: Mutex<VecDeque<PeerId>>,
    closing_cond: Condvar,
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: dashmap::DashMap::new(),
            next_id: AtomicU64::new(1),
            closing: Mutex::new(VecDeque::new()),
            closing_cond: Condvar::new(),
        }
    }

    fn alloc_id(&self) -> PeerId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Insert a freshly-accepted or freshly-connected local peer.
    pub fn insert_local(&self, auth_kind: AuthKind, state: LocalPeerState) -> Arc<Peer> {
        let id = self.alloc_id();
        let peer = Arc::new(Peer::new(id, auth_kind, PeerKind::Local(state)));
        self.entries.insert(id, peer.clone());
        peer
    }

    /// Insert a remote peer tunneled through `parent`, correlated by the
    /// `caller_peer_id` the allocating slave supplied on the wire (design
    /// §4.5/§6: `REMOTE_PEER_ALLOC` does not hand back a master-minted id —
    /// the slave's own id is what later `REMOTE_RPC`/`REMOTE_PEER_FREE`
    /// calls use). Internally this table still needs a globally unique key,
    /// so the slot is addressed by a parent+caller-id composite; that
    /// composite never crosses the wire.
    pub fn insert_remote(
        &self,
        parent: PeerId,
        caller_peer_id: u64,
        auth_kind: AuthKind,
        user: impl Into<String>,
        host: impl Into<String>,
        address_family: i32,
        transport: i32,
        port: u16,
    ) -> Result<Arc<Peer>> {
        let parent_peer = self.entries.get(&parent).ok_or(GfmdError::UnknownPeer(parent))?;
        if !parent_peer.is_local() {
            return Err(GfmdError::Channel(ChannelError::InvalidRemotePeer));
        }
        let id = Self::composite_remote_id(parent, caller_peer_id);
        let peer = Arc::new(Peer::new(
            id,
            auth_kind,
            PeerKind::Remote(RemotePeerState {
                parent,
                caller_peer_id,
                user: user.into(),
                host: host.into(),
                address_family,
                transport,
                port,
            }),
        ));
        parent_peer.as_local().add_child(id);
        self.entries.insert(id, peer.clone());
        Ok(peer)
    }

    fn composite_remote_id(parent: PeerId, caller_peer_id: u64) -> PeerId {
        (parent << 32) | (caller_peer_id & 0xFFFF_FFFF)
    }

    #[must_use]
    pub fn get(&self, id: PeerId) -> Option<Arc<Peer>> {
        self.entries.get(&id).map(|e| e.clone())
    }

    /// Look up a remote peer by the caller-supplied id it was allocated
    /// with, requiring that its parent matches `expected_parent`. This is
    /// the `REMOTE_RPC`/`REMOTE_PEER_FREE` lookup path: a slave's tunneled
    /// calls may only reach remote peers it created under its own local
    /// peer.
    pub fn get_remote_child(&self, expected_parent: PeerId, caller_peer_id: u64) -> Result<Arc<Peer>> {
        let id = Self::composite_remote_id(expected_parent, caller_peer_id);
        let peer = self
            .entries
            .get(&id)
            .map(|e| e.clone())
            .ok_or(GfmdError::Channel(ChannelError::InvalidRemotePeer))?;
        match &peer.kind {
            PeerKind::Remote(r) if r.parent == expected_parent => Ok(peer.clone()),
            _ => Err(GfmdError::Channel(ChannelError::InvalidRemotePeer)),
        }
    }

    /// get-connection: a remote peer owns none, so resolve through its
    /// parent chain.
    #[must_use]
    pub fn get_connection(&self, id: PeerId) -> Option<Arc<dyn PeerConnection>> {
        let peer = self.get(id)?;
        match &peer.kind {
            PeerKind::Local(l) => l.connection(),
            PeerKind::Remote(r) => self.get_connection(r.parent),
        }
    }

    /// get-async-mux: likewise resolved through the parent for a remote
    /// peer, since a tunneled request is ultimately answered over the
    /// parent's channel.
    #[must_use]
    pub fn get_async_mux(&self, id: PeerId) -> Option<Arc<crate::async_mux::AsyncMux>> {
        let peer = self.get(id)?;
        match &peer.kind {
            PeerKind::Local(l) => Some(l.async_mux.clone()),
            PeerKind::Remote(r) => self.get_async_mux(r.parent),
        }
    }

    /// notice-disconnected: the transport observed the connection go away;
    /// route this peer through the same half-close-and-reclaim path as an
    /// explicit free request.
    pub fn notice_disconnected(&self, id: PeerId) {
        self.free_request(id);
    }

    /// Decrement a peer's reference count and wake the closer if it can now
    /// be reclaimed.
    pub fn del_ref(&self, id: PeerId) {
        if let Some(peer) = self.entries.get(&id) {
            let remaining = peer.del_ref_raw();
            if remaining == 0 && peer.free_requested() {
                self.wake_closer(id);
            }
        }
    }

    /// Half-close and enqueue a peer for asynchronous reclamation. Mirrors
    /// `peer_free_request`: idempotent, safe to call more than once. The
    /// half-close happens immediately, here, not at finalization time — a
    /// thread blocked reading/writing this peer's connection must wake
    /// before the closer ever gets to it.
    pub fn free_request(&self, id: PeerId) {
        if let Some(peer) = self.entries.get(&id) {
            peer.free_requested.store(true, Ordering::SeqCst);
            peer.shutdown();
        } else {
            return;
        }
        self.wake_closer(id);
    }

    fn wake_closer(&self, id: PeerId) {
        let mut q = self.closing.lock();
        if !q.contains(&id) {
            q.push_back(id);
        }
        self.closing_cond.notify_one();
    }

    fn ready_to_free(&self, id: PeerId) -> bool {
        self.entries
            .get(&id)
            .map(|p| p.free_requested() && p.refcount() <= 0 && !p.is_busy())
            .unwrap_or(true) // already gone: treat as done
    }

    /// Finalize the free of a single peer: drop it from the table, finalize
    /// any pending-new-generation entries with `ConnectionAborted`, detach
    /// from a local parent's child list, and recursively free any remote
    /// children of a local peer being freed.
    fn finalize_free(&self, id: PeerId) {
        let Some((_, peer)) = self.entries.remove(&id) else {
            return;
        };
        let dropped = peer.pending.lock().finalize_all();
        drop(dropped); // the inode layer would be notified here; out of scope

        match &peer.kind {
            PeerKind::Local(local) => {
                for child in local.children_snapshot() {
                    self.free_request(child);
                }
            }
            PeerKind::Remote(remote) => {
                if let Some(parent) = self.entries.get(&remote.parent) {
                    parent.as_local().remove_child(id);
                }
            }
        }
        tracing::debug!(peer_id = id, "peer freed");
    }

    /// Run the dedicated closer worker: wait for an entry on the closing
    /// queue that is both unreferenced and idle, then free it. Call this
    /// from its own thread; it returns only when `shutdown` is observed.
    pub fn run_closer(&self, shutdown: &AtomicBool) {
        let mut guard = self.closing.lock();
        loop {
            if shutdown.load(Ordering::Relaxed) {
                return;
            }
            if let Some(pos) = guard.iter().position(|id| self.ready_to_free(*id)) {
                let id = guard.remove(pos).expect("position came from this deque");
                drop(guard);
                self.finalize_free(id);
                guard = self.closing.lock();
                continue;
            }
            // Bounded wait so a shutdown request is noticed promptly even
            // with no peers pending.
            self.closing_cond
                .wait_for(&mut guard, std::time::Duration::from_millis(200));
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(table: &PeerTable) -> Arc<Peer> {
        table.insert_local(AuthKind::MetadataHost, LocalPeerState::new(None))
    }

    #[test]
    fn free_is_deferred_while_referenced() {
        let table = PeerTable::new();
        let peer = local(&table);
        peer.add_ref();
        table.free_request(peer.id);
        // still present: refcount > 0
        assert!(table.get(peer.id).is_some());
        table.del_ref(peer.id);
        // a manual closer step (inline, no background thread) would now free it
        assert!(table.ready_to_free(peer.id));
    }

    #[test]
    fn free_deferred_while_busy() {
        let table = PeerTable::new();
        let peer = local(&table);
        peer.set_busy(true);
        table.free_request(peer.id);
        assert!(!table.ready_to_free(peer.id));
        peer.set_busy(false);
        assert!(table.ready_to_free(peer.id));
    }

    #[test]
    fn remote_peer_requires_local_parent() {
        let table = PeerTable::new();
        let parent = local(&table);
        let remote = table
            .insert_remote(parent.id, 1, AuthKind::EndUser, "user", "host", 2, 1, 4000)
            .unwrap();
        assert!(remote.is_remote());
        assert_eq!(remote.as_remote().parent, parent.id);

        let err = table.insert_remote(remote.id, 1, AuthKind::EndUser, "user", "host", 2, 1, 4001);
        assert!(err.is_err());
    }

    #[test]
    fn closing_a_local_peer_frees_its_remote_children() {
        let table = PeerTable::new();
        let parent = local(&table);
        let child = table
            .insert_remote(parent.id, 1, AuthKind::EndUser, "user", "host", 2, 1, 4000)
            .unwrap();

        table.free_request(parent.id);
        table.finalize_free(parent.id);
        // the child was queued for free as a side effect
        assert!(table.ready_to_free(child.id) || table.get(child.id).is_none());
    }

    #[test]
    fn pending_generation_finalizes_on_free() {
        let table = PeerTable::new();
        let peer = local(&table);
        peer.add_pending_by_cookie(PendingGeneration {
            cookie: 7,
            inode: 42,
        });
        table.free_request(peer.id);
        table.finalize_free(peer.id);
        assert!(table.get(peer.id).is_none());
    }

    #[test]
    #[should_panic(expected = "is not a local peer")]
    fn downcast_mismatch_panics() {
        let table = PeerTable::new();
        let parent = local(&table);
        let remote = table
            .insert_remote(parent.id, 1, AuthKind::EndUser, "user", "host", 2, 1, 4000)
            .unwrap();
        let _ = remote.as_local();
    }

    #[test]
    fn free_request_half_closes_the_owned_connection() {
        struct Recording(Arc<AtomicBool>);
        impl PeerConnection for Recording {
            fn shutdown(&self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let table = PeerTable::new();
        let peer = local(&table);
        let closed = Arc::new(AtomicBool::new(false));
        peer.as_local().attach_connection(Arc::new(Recording(closed.clone())));

        table.free_request(peer.id);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn get_connection_and_async_mux_resolve_through_remote_parent() {
        let table = PeerTable::new();
        let parent = local(&table);
        let closed = Arc::new(AtomicBool::new(false));
        struct Recording(Arc<AtomicBool>);
        impl PeerConnection for Recording {
            fn shutdown(&self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }
        parent.as_local().attach_connection(Arc::new(Recording(closed)));
        let remote = table
            .insert_remote(parent.id, 1, AuthKind::EndUser, "user", "host", 2, 1, 4000)
            .unwrap();

        assert!(table.get_connection(remote.id).is_some());
        assert!(table.get_async_mux(remote.id).is_some());
        assert_eq!(remote.get_parent(), Some(parent.id));
        assert_eq!(remote.get_port(), Some(4000));
    }
}
