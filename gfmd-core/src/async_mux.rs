//! Transaction-id multiplexed async RPC completions over a single duplex
//! stream.
//!
//! One [`AsyncMux`] is owned per local peer. Sending a request allocates a
//! fresh xid and registers a [`Completion`] keyed by it; the reader thread
//! that drains replies off the wire looks up the xid and resolves the
//! completion. If the connection drops with outstanding xids, every
//! remaining completion is resolved via its disconnect path instead,
//! mirroring the source's per-xid `disconnect_callback` cleanup.
//!
//! This replaces the source's pattern of heap-allocating a distinct closure
//! per in-flight request (with its own free function) with one structured
//! completion type that knows how to deliver either outcome.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::error::ChannelError;

/// Transaction id: chosen by the sender, echoed by the responder.
pub type Xid = u32;

/// The outcome delivered to a registered completion: either a reply payload
/// (with its already-decoded error code) or "the connection went away while
/// this was outstanding".
pub enum Outcome {
    Reply { errcode: ChannelError, payload: Vec<u8> },
    Disconnected,
}

/// What a caller gets back when it sends an async request. For the
/// synchronous send path (`4.4.3`), block on [`PendingCall::wait`]; for the
/// purely asynchronous path (`4.4.4`), drop it and let the mux resolve it in
/// the background via [`AsyncMux::register_fire_and_forget`] instead.
struct Slot {
    outcome: Mutex<Option<Outcome>>,
    cond: Condvar,
}

impl Slot {
    fn new() -> Self {
        Self {
            outcome: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    fn resolve(&self, outcome: Outcome) {
        let mut guard = self.outcome.lock();
        if guard.is_none() {
            *guard = Some(outcome);
            self.cond.notify_all();
        }
    }
}

/// A handle to an in-flight request's eventual completion.
pub struct PendingCall {
    slot: std::sync::Arc<Slot>,
}

impl PendingCall {
    /// Block until the reply arrives or the connection drops. Returns
    /// `None` on timeout, leaving the completion registered so a later
    /// reply (if it still arrives) is simply dropped as late.
    #[must_use]
    pub fn wait_timeout(&self, timeout: std::time::Duration) -> Option<Outcome> {
        let mut guard = self.slot.outcome.lock();
        if guard.is_none() {
            let result = self.slot.cond.wait_for(&mut guard, timeout);
            if result.timed_out() && guard.is_none() {
                return None;
            }
        }
        guard.take()
    }
}

enum Registration {
    /// Someone is (or may be) blocked in [`PendingCall::wait_timeout`].
    Waited(std::sync::Arc<Slot>),
    /// Purely asynchronous: just invoke the callback from the reader thread
    /// when the reply (or disconnect) arrives.
    Callback(Box<dyn FnOnce(Outcome) + Send>),
}

/// Per-peer table from outstanding xid to how to deliver its eventual
/// outcome.
pub struct AsyncMux {
    next_xid: AtomicU32,
    inflight: Mutex<HashMap<Xid, Registration>>,
}

impl Default for AsyncMux {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncMux {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_xid: AtomicU32::new(1),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    fn alloc_xid(&self) -> Xid {
        self.next_xid.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a request that a caller will block on via [`PendingCall`].
    /// Returns the xid to put on the wire and the handle to wait on.
    pub fn register_waited(&self) -> (Xid, PendingCall) {
        let xid = self.alloc_xid();
        let slot = std::sync::Arc::new(Slot::new());
        self.inflight
            .lock()
            .insert(xid, Registration::Waited(slot.clone()));
        (xid, PendingCall { slot })
    }

    /// Register a request whose outcome is delivered purely by callback from
    /// the reader thread, never blocked on.
    pub fn register_fire_and_forget(&self, on_done: impl FnOnce(Outcome) + Send + 'static) -> Xid {
        let xid = self.alloc_xid();
        self.inflight
            .lock()
            .insert(xid, Registration::Callback(Box::new(on_done)));
        xid
    }

    /// Called by the reader thread on a decoded response frame.
    pub fn deliver_reply(&self, xid: Xid, errcode: ChannelError, payload: Vec<u8>) {
        let reg = self.inflight.lock().remove(&xid);
        match reg {
            Some(Registration::Waited(slot)) => slot.resolve(Outcome::Reply { errcode, payload }),
            Some(Registration::Callback(f)) => f(Outcome::Reply { errcode, payload }),
            None => {
                tracing::warn!(xid, "reply for unknown or already-resolved xid, dropping");
            }
        }
    }

    /// Called when the underlying connection is torn down: every
    /// outstanding registration is resolved as disconnected.
    pub fn disconnect_all(&self) {
        let mut inflight = self.inflight.lock();
        for (_, reg) in inflight.drain() {
            match reg {
                Registration::Waited(slot) => slot.resolve(Outcome::Disconnected),
                Registration::Callback(f) => f(Outcome::Disconnected),
            }
        }
    }

    #[must_use]
    pub fn inflight_count(&self) -> usize {
        self.inflight.lock().len()
    }
}
