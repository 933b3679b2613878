//! Metadata host (`mdhost`) registry: the directory of known metadata
//! servers, cluster membership, master election state, and the read-only
//! flag that gates mutating operations when replication cannot be trusted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::error::{GfmdError, Result};
use crate::peer::PeerId;

/// Mutable per-host fields, guarded by a lock private to each entry so that
/// modifying one host never blocks lookups of another (matching the
/// per-mdhost mutex sitting below the registry's global lock in the lock
/// order).
#[derive(Debug, Default)]
struct MdHostState {
    peer: Option<PeerId>,
    is_up: bool,
    is_master: bool,
    last_fetch_seqnum: u64,
    is_received_seqnum: bool,
    in_first_sync: bool,
    reader_open: bool,
}

/// A single known metadata server, including the local node itself.
pub struct MdHost {
    pub name: String,
    pub port: u16,
    pub cluster: String,
    pub is_self: bool,
    pub is_master_candidate: bool,
    pub is_default_master: AtomicBool,
    state: RwLock<MdHostState>,
}

impl MdHost {
    fn new(name: String, port: u16, cluster: String, is_self: bool) -> Self {
        Self {
            name,
            port,
            cluster,
            is_self,
            is_master_candidate: true,
            is_default_master: AtomicBool::new(false),
            state: RwLock::new(MdHostState::default()),
        }
    }

    #[must_use]
    pub fn is_up(&self) -> bool {
        self.state.read().is_up
    }

    #[must_use]
    pub fn is_master(&self) -> bool {
        self.state.read().is_master
    }

    #[must_use]
    pub fn last_fetch_seqnum(&self) -> u64 {
        self.state.read().last_fetch_seqnum
    }

    pub fn set_last_fetch_seqnum(&self, sn: u64) {
        self.state.write().last_fetch_seqnum = sn;
    }

    #[must_use]
    pub fn is_received_seqnum(&self) -> bool {
        self.state.read().is_received_seqnum
    }

    pub fn set_is_received_seqnum(&self, v: bool) {
        self.state.write().is_received_seqnum = v;
    }

    #[must_use]
    pub fn is_in_first_sync(&self) -> bool {
        self.state.read().in_first_sync
    }

    pub fn set_is_in_first_sync(&self, v: bool) {
        self.state.write().in_first_sync = v;
    }

    #[must_use]
    pub fn has_reader(&self) -> bool {
        self.state.read().reader_open
    }

    pub fn set_reader_open(&self, v: bool) {
        self.state.write().reader_open = v;
    }

    #[must_use]
    pub fn peer(&self) -> Option<PeerId> {
        self.state.read().peer
    }

    pub fn set_peer(&self, peer: Option<PeerId>) {
        let mut s = self.state.write();
        s.peer = peer;
        s.is_up = peer.is_some();
    }

    fn set_is_master(&self, v: bool) {
        self.state.write().is_master = v;
    }

    /// `true` if this host should participate in synchronous replication
    /// quorum: same cluster as the master, not self, up, has a reader open,
    /// and not still catching up via first-sync.
    #[must_use]
    pub fn is_sync_replication(&self, master_cluster: &str) -> bool {
        !self.is_self && self.cluster == master_cluster
    }

    /// `true` if this host is eligible right now for a synchronous send:
    /// synchronous by cluster, connected, with an open reader, and past
    /// first-sync.
    #[must_use]
    pub fn is_sync_send_eligible(&self, master_cluster: &str) -> bool {
        self.is_sync_replication(master_cluster)
            && self.is_up()
            && self.has_reader()
            && !self.is_in_first_sync()
    }
}

/// The registry of known metadata hosts plus the master-election and
/// read-only state derived from it.
pub struct MdHostRegistry {
    hosts: RwLock<HashMap<String, std::sync::Arc<MdHost>>>,
    self_name: String,
    master_name: RwLock<Option<String>>,
    read_only: AtomicBool,
    current_seqnum: AtomicU64,
}

impl MdHostRegistry {
    #[must_use]
    pub fn new(self_name: impl Into<String>) -> Self {
        Self {
            hosts: RwLock::new(HashMap::new()),
            self_name: self_name.into(),
            master_name: RwLock::new(None),
            read_only: AtomicBool::new(false),
            current_seqnum: AtomicU64::new(0),
        }
    }

    /// Register a host. Returns [`GfmdError::HostExists`] if the name is
    /// already present, matching `mdhost_enter`'s rejection of duplicates.
    pub fn enter(&self, name: impl Into<String>, port: u16, cluster: impl Into<String>) -> Result<std::sync::Arc<MdHost>> {
        let name = name.into();
        let mut hosts = self.hosts.write();
        if hosts.contains_key(&name) {
            return Err(GfmdError::HostExists(name));
        }
        let is_self = name == self.self_name;
        let host = std::sync::Arc::new(MdHost::new(name.clone(), port, cluster.into(), is_self));
        hosts.insert(name, host.clone());
        Ok(host)
    }

    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<std::sync::Arc<MdHost>> {
        self.hosts.read().get(name).cloned()
    }

    #[must_use]
    pub fn lookup_self(&self) -> Option<std::sync::Arc<MdHost>> {
        self.lookup(&self.self_name)
    }

    /// Look up the current master. There is always at most one (the
    /// "single master" invariant); `None` only during an election window.
    #[must_use]
    pub fn lookup_master(&self) -> Option<std::sync::Arc<MdHost>> {
        let name = self.master_name.read().clone()?;
        self.lookup(&name)
    }

    pub fn for_each(&self, mut f: impl FnMut(&std::sync::Arc<MdHost>)) {
        for host in self.hosts.read().values() {
            f(host);
        }
    }

    pub fn remove_in_cache(&self, name: &str) {
        if let Some(host) = self.hosts.write().remove(name) {
            host.set_peer(None);
        }
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.hosts.read().len()
    }

    /// Disconnect a host (idempotent): clears its peer and liveness.
    pub fn disconnect(&self, name: &str) {
        if let Some(host) = self.lookup(name) {
            host.set_peer(None);
        }
    }

    /// Promote `self` to master: demotes any other host's master flag,
    /// clears read-only, and records the new master name. Mirrors
    /// `mdhost_set_self_as_master`'s "disconnect every other master
    /// claimant" behavior by clearing their `is_master` flags.
    pub fn set_self_as_master(&self) {
        let hosts = self.hosts.read();
        for host in hosts.values() {
            host.set_is_master(host.is_self);
        }
        drop(hosts);
        *self.master_name.write() = Some(self.self_name.clone());
        self.read_only.store(false, Ordering::SeqCst);
    }

    /// Record which host is currently master (used when the local node is
    /// a slave learning about the master from configuration/election).
    pub fn set_master(&self, name: &str) -> Result<()> {
        let hosts = self.hosts.read();
        if !hosts.contains_key(name) {
            return Err(GfmdError::UnknownHost(name.to_string()));
        }
        for host in hosts.values() {
            host.set_is_master(host.name == name);
        }
        drop(hosts);
        *self.master_name.write() = Some(name.to_string());
        Ok(())
    }

    #[must_use]
    pub fn self_is_master(&self) -> bool {
        self.lookup_self().map(|h| h.is_master()).unwrap_or(false)
    }

    #[must_use]
    pub fn self_name(&self) -> &str {
        &self.self_name
    }

    #[must_use]
    pub fn master_cluster(&self) -> Option<String> {
        self.lookup_master().map(|h| h.cluster.clone())
    }

    /// Flip the local node's read-only flag. Set when self is a slave whose
    /// journal reader has expired, or when self is master but has lost
    /// every synchronous slave; cleared on becoming master or on recovery.
    pub fn set_read_only(&self, v: bool) {
        let was = self.read_only.swap(v, Ordering::SeqCst);
        if was != v {
            if v {
                tracing::warn!("local node entering read-only mode");
            } else {
                tracing::info!("local node leaving read-only mode");
            }
        }
    }

    #[must_use]
    pub fn self_is_readonly(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    /// Recompute read-only status for a slave: true iff self is not master
    /// and self's reader has expired (i.e. it is out of sync with the
    /// master and cannot safely serve reads that assume freshness).
    pub fn recompute_slave_readonly(&self, reader_expired: bool) {
        if self.self_is_master() {
            self.set_read_only(false);
        } else {
            self.set_read_only(reader_expired);
        }
    }

    #[must_use]
    pub fn current_seqnum(&self) -> u64 {
        self.current_seqnum.load(Ordering::SeqCst)
    }

    pub fn set_current_seqnum(&self, sn: u64) {
        self.current_seqnum.store(sn, Ordering::SeqCst);
    }

    /// `true` if any non-sync (async) replication target exists, used by
    /// the async-sender worker to decide whether to wake at all.
    #[must_use]
    pub fn has_async_replication_target(&self) -> bool {
        let Some(master_cluster) = self.master_cluster() else {
            return false;
        };
        let hosts = self.hosts.read();
        hosts
            .values()
            .any(|h| !h.is_self && h.cluster != master_cluster && h.is_up())
    }

    /// All hosts eligible for synchronous send right now.
    #[must_use]
    pub fn sync_targets(&self) -> Vec<std::sync::Arc<MdHost>> {
        let Some(master_cluster) = self.master_cluster() else {
            return Vec::new();
        };
        self.hosts
            .read()
            .values()
            .filter(|h| h.is_sync_send_eligible(&master_cluster))
            .cloned()
            .collect()
    }

    /// All hosts eligible for asynchronous send right now (up, not self,
    /// not synchronously replicated).
    #[must_use]
    pub fn async_targets(&self) -> Vec<std::sync::Arc<MdHost>> {
        let Some(master_cluster) = self.master_cluster() else {
            return Vec::new();
        };
        self.hosts
            .read()
            .values()
            .filter(|h| !h.is_self && h.is_up() && !h.is_sync_replication(&master_cluster))
            .cloned()
            .collect()
    }
}
