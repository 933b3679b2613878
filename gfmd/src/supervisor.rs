//! Slave-side connection supervisor (design §4.6): holds a single
//! persistent connection to the master, handling the `SWITCH_GFMD_CHANNEL`
//! handshake, local-peer installation, and reconnect backoff. Exits its loop
//! once this node becomes master itself — there is no "master connects to
//! itself" case.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gfmd_core::error::Result;
use gfmd_core::mdhost::MdHostRegistry;
use gfmd_core::peer::{AuthKind, LocalPeerState, PeerTable};
use gfmd_core::reconnect::ReconnectState;
use gfmd_core::tcp::connect_with_timeout;
use gfmd_wire::channel::{decode_switch_response, encode_switch_request, spawn_reader_thread, GfmdChannel};
use gfmd_wire::opcode::Opcode;
use gfmd_wire::tunnel::TunnelRouter;

use crate::journal::JournalChannel;

/// Protocol version sent in `SWITCH_GFMD_CHANNEL`. Bumped whenever the wire
/// format changes in a way old and new peers cannot both speak.
pub const CHANNEL_PROTOCOL_VERSION: i32 = 1;

pub struct ConnectionSupervisor {
    master_addr: SocketAddr,
    self_name: String,
    registry: Arc<MdHostRegistry>,
    peers: Arc<PeerTable>,
    tunnel: Arc<TunnelRouter>,
    journal: Arc<JournalChannel>,
    connect_timeout: Duration,
    shutdown: AtomicBool,
}

impl ConnectionSupervisor {
    #[must_use]
    pub fn new(
        master_addr: SocketAddr,
        self_name: impl Into<String>,
        registry: Arc<MdHostRegistry>,
        peers: Arc<PeerTable>,
        tunnel: Arc<TunnelRouter>,
        journal: Arc<JournalChannel>,
    ) -> Self {
        Self {
            master_addr,
            self_name: self_name.into(),
            registry,
            peers,
            tunnel,
            journal,
            connect_timeout: Duration::from_secs(5),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Run the connect/handshake/serve loop until shutdown is requested or
    /// this node is promoted to master. Call on its own thread.
    pub fn run(&self, backoff_base: Duration, backoff_max: Duration) {
        let mut backoff = ReconnectState::new(backoff_base, backoff_max);
        while !self.shutdown.load(Ordering::Relaxed) {
            if self.registry.self_is_master() {
                tracing::info!("local node is now master; connection supervisor exiting");
                return;
            }

            match self.connect_and_serve() {
                Ok(()) => {
                    // Clean disconnect (e.g. master-initiated). Retry
                    // immediately on the next loop iteration, still subject
                    // to the backoff schedule below if it fails repeatedly.
                    backoff.reset();
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt = backoff.attempt(), "connection to master failed");
                }
            }

            if self.shutdown.load(Ordering::Relaxed) {
                return;
            }
            std::thread::sleep(backoff.next_delay());
        }
    }

    fn connect_and_serve(&self) -> Result<()> {
        let stream = connect_with_timeout(self.master_addr, self.connect_timeout)?;
        let reader = stream.try_clone()?;
        let shutdown_handle = stream.try_clone()?;

        let local_peer = self
            .peers
            .insert_local(AuthKind::MetadataHost, LocalPeerState::new(Some(self.master_addr)));
        local_peer.as_local().attach_connection(Arc::new(shutdown_handle));
        let channel = GfmdChannel::with_mux(Box::new(stream), local_peer.as_local().async_mux.clone());

        let cookie: i64 = 0; // opaque, non-security-bearing (design §9)
        let call = channel.send_request(Opcode::SwitchGfmdChannel, &encode_switch_request(CHANNEL_PROTOCOL_VERSION, cookie))?;
        let assigned_cookie = match call.wait_timeout(self.connect_timeout) {
            Some(gfmd_core::async_mux::Outcome::Reply { errcode, payload }) if errcode.is_success() => {
                decode_switch_response(&payload)?
            }
            Some(gfmd_core::async_mux::Outcome::Reply { errcode, .. }) => {
                return Err(gfmd_core::error::GfmdError::Channel(errcode));
            }
            Some(gfmd_core::async_mux::Outcome::Disconnected) => {
                return Err(gfmd_core::error::GfmdError::Channel(
                    gfmd_core::error::ChannelError::ConnectionAborted,
                ));
            }
            None => return Err(gfmd_core::error::GfmdError::TimedOut(self.connect_timeout)),
        };
        tracing::debug!(assigned_cookie, "gfmd channel established with master");

        self.journal.add_slave(self.self_name.clone(), channel.clone());

        let ready_args = gfmd_wire::args::ArgEncoder::new()
            .put_i64(self.registry.current_seqnum() as i64)
            .finish();
        channel.send_request(Opcode::JournalReadyToRecv, &ready_args)?;

        let registry = self.registry.clone();
        let tunnel = self.tunnel.clone();
        let peers = self.peers.clone();
        let journal = self.journal.clone();
        let self_name = self.self_name.clone();
        let local_id = local_peer.id;

        let handle = spawn_reader_thread(channel.clone(), reader, move |ch, req| {
            if tunnel.dispatch(&peers, ch, local_id, &req) {
                return;
            }
            match req.opcode {
                Opcode::JournalSend => {
                    let mut dec = gfmd_wire::args::ArgDecoder::new(&req.args);
                    let decoded = (|| -> gfmd_core::error::Result<_> {
                        let from_sn = dec.get_i64()? as u64;
                        let to_sn = dec.get_i64()? as u64;
                        let _records = dec.get_bytes()?;
                        Ok((from_sn, to_sn))
                    })();
                    if let Ok((_from_sn, to_sn)) = decoded {
                        journal.record_ack(&self_name, to_sn);
                        registry.set_current_seqnum(to_sn);
                    }
                    let _ = ch.send_response(req.xid, gfmd_core::error::ChannelError::NoError, &[]);
                }
                _ => {
                    let _ = ch.send_response(req.xid, gfmd_core::error::ChannelError::Protocol, &[]);
                }
            }
        });

        let _ = handle.join();
        self.peers.free_request(local_id);
        self.journal.remove_slave(&self.self_name);
        Ok(())
    }
}
