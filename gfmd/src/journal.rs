//! Journal channel: sync (quorum) and async replication of journal records
//! to slave metadata hosts, plus first-sync bootstrap and sequence-number
//! tracking (design §4.4).
//!
//! A commit on the master calls [`JournalChannel::commit`], which appends to
//! the in-memory record log and, for every slave classified sync by
//! cluster, drains that slave's backlog as contiguous `JOURNAL_SEND(from_sn,
//! to_sn, records)` batches (§4.4.2) before blocking on a quorum of
//! acknowledgments (§4.4.3) or timing out. Async targets are drained by a
//! background thread on a fixed poll interval instead of being woken per
//! commit. A newly attached sync slave that is behind the tail of the log
//! runs its own first-sync worker (§4.4.4), draining its backlog in the
//! background until caught up before it counts toward any quorum.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use gfmd_core::error::{GfmdError, Result};
use gfmd_core::mdhost::MdHostRegistry;
use gfmd_wire::args::ArgEncoder;
use gfmd_wire::channel::GfmdChannel;
use gfmd_wire::opcode::Opcode;

/// A single journal record: an opaque, already-serialized metadata
/// operation plus the sequence number it was assigned at commit time.
/// Record contents are out of scope here (design non-goals: fd/inode
/// management); only the replication envelope is modeled.
#[derive(Debug, Clone)]
pub struct JournalRecord {
    pub seqnum: u64,
    pub payload: Vec<u8>,
}

/// What [`JournalLog::fetch`] returns for a read starting at a given
/// sequence number.
enum FetchResult {
    /// Nothing at or past `min_seqnum` yet.
    NoRecords,
    /// A contiguous batch `[from_sn, to_sn]`, concatenated in commit order.
    Batch { from_sn: u64, to_sn: u64, bytes: Vec<u8> },
}

/// The master's retained tail of committed records, playing the role of the
/// on-disk journal file a real reader reopens against (design §4.4.1/§4.4.2).
/// Retention is bounded: once a record falls off the back of the window, a
/// reader asking for anything at or before it gets `EXPIRED` rather than a
/// silently truncated batch, matching the slave-fatal "log trimmed past
/// cursor" outcome.
struct JournalLog {
    records: Mutex<VecDeque<JournalRecord>>,
    retain: usize,
}

impl JournalLog {
    fn new(retain: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            retain,
        }
    }

    fn append(&self, record: JournalRecord) {
        let mut recs = self.records.lock().unwrap();
        recs.push_back(record);
        while recs.len() > self.retain {
            recs.pop_front();
        }
    }

    /// `journal_fetch`: read a contiguous batch at or after `min_seqnum`.
    /// `host_name` is only used to label a returned [`GfmdError::ReaderExpired`].
    fn fetch(&self, host_name: &str, min_seqnum: u64) -> Result<FetchResult> {
        let recs = self.records.lock().unwrap();
        let Some(oldest) = recs.front().map(|r| r.seqnum) else {
            return Ok(FetchResult::NoRecords);
        };
        if min_seqnum < oldest {
            return Err(GfmdError::ReaderExpired(host_name.to_string()));
        }
        let batch: Vec<&JournalRecord> = recs.iter().filter(|r| r.seqnum >= min_seqnum).collect();
        let Some(&first) = batch.first() else {
            return Ok(FetchResult::NoRecords);
        };
        let from_sn = first.seqnum;
        let to_sn = batch.last().unwrap().seqnum;
        let mut bytes = Vec::new();
        for record in &batch {
            bytes.extend_from_slice(&record.payload);
        }
        Ok(FetchResult::Batch { from_sn, to_sn, bytes })
    }
}

/// Per-slave bookkeeping the journal channel needs to drive its send loop
/// and decide whether that slave counts toward a sync quorum.
struct SlaveQueue {
    host_name: String,
    channel: Arc<GfmdChannel>,
    /// Highest seqnum sent to this slave so far (§4.4.2 step 4's cursor).
    last_fetched: AtomicU64,
    /// Highest seqnum this slave has acknowledged.
    acked_seqnum: AtomicU64,
    /// Set once the slave has exhausted first-sync bootstrap and is caught
    /// up to the tail of the log; until then it is not sync-eligible even
    /// if otherwise classified sync (design §4.4.4).
    first_sync_done: AtomicBool,
}

/// Drives replication of committed journal records to every known slave.
pub struct JournalChannel {
    registry: Arc<MdHostRegistry>,
    log: JournalLog,
    slaves: Mutex<Vec<Arc<SlaveQueue>>>,
    quorum_cond: Condvar,
    quorum_lock: Mutex<()>,
    sync_timeout: Duration,
    async_interval: Duration,
    shutdown: AtomicBool,
}

/// Retained record window. Generous enough that, in practice, only a slave
/// that has been disconnected far longer than any reasonable reconnect
/// backoff hits `EXPIRED`; an administrator reseeding that slave's log is
/// the documented recovery path (design §7).
const DEFAULT_RETAIN: usize = 10_000;

/// How long a newly attached sync slave's first-sync worker waits before
/// its first catch-up pass (design §4.4.4: "waits a short delay").
const FIRST_SYNC_START_DELAY: Duration = Duration::from_millis(50);

impl JournalChannel {
    #[must_use]
    pub fn new(registry: Arc<MdHostRegistry>, sync_timeout: Duration, async_interval: Duration) -> Self {
        Self {
            registry,
            log: JournalLog::new(DEFAULT_RETAIN),
            slaves: Mutex::new(Vec::new()),
            quorum_cond: Condvar::new(),
            quorum_lock: Mutex::new(()),
            sync_timeout,
            async_interval,
            shutdown: AtomicBool::new(false),
        }
    }

    /// Register a newly connected slave's send channel. If the slave is
    /// classified synchronous by cluster, this schedules a background
    /// first-sync job (§4.4.4) that drains its backlog before it starts
    /// counting toward any quorum; callers that need deterministic control
    /// over that transition (tests) can still call
    /// [`JournalChannel::mark_first_sync_done`] directly.
    pub fn add_slave(self: &Arc<Self>, host_name: impl Into<String>, channel: Arc<GfmdChannel>) {
        let host_name = host_name.into();
        let slave = Arc::new(SlaveQueue {
            host_name: host_name.clone(),
            channel,
            last_fetched: AtomicU64::new(0),
            acked_seqnum: AtomicU64::new(0),
            first_sync_done: AtomicBool::new(false),
        });
        self.slaves.lock().unwrap().push(slave);
        self.spawn_first_sync_if_sync_target(host_name);
    }

    pub fn remove_slave(&self, host_name: &str) {
        self.slaves.lock().unwrap().retain(|s| s.host_name != host_name);
    }

    pub fn mark_first_sync_done(&self, host_name: &str) {
        if let Some(slave) = self.find_slave(host_name) {
            slave.first_sync_done.store(true, Ordering::SeqCst);
        }
    }

    fn find_slave(&self, host_name: &str) -> Option<Arc<SlaveQueue>> {
        self.slaves.lock().unwrap().iter().find(|s| s.host_name == host_name).cloned()
    }

    fn is_sync_slave(&self, host_name: &str) -> bool {
        let master_cluster = self.registry.master_cluster().unwrap_or_default();
        self.registry
            .lookup(host_name)
            .is_some_and(|host| host.is_sync_replication(&master_cluster))
    }

    fn spawn_first_sync_if_sync_target(self: &Arc<Self>, host_name: String) {
        if !self.is_sync_slave(&host_name) {
            return;
        }
        let this = self.clone();
        std::thread::Builder::new()
            .name("gfmd-first-sync".into())
            .spawn(move || this.run_first_sync(host_name))
            .expect("failed to spawn first-sync worker");
    }

    /// First-sync bootstrap for one newly attached slave (design §4.4.4):
    /// wait a short delay, confirm the slave is still behind and has a live
    /// reader, mark it in-first-sync so synchronous commits skip it, then
    /// loop sending batches until the log reports no more records.
    fn run_first_sync(&self, host_name: String) {
        std::thread::sleep(FIRST_SYNC_START_DELAY);

        let Some(slave) = self.find_slave(&host_name) else {
            return;
        };
        if slave.first_sync_done.load(Ordering::SeqCst) {
            return;
        }
        let Some(host) = self.registry.lookup(&host_name) else {
            return;
        };
        if !host.has_reader() {
            return;
        }

        host.set_is_in_first_sync(true);
        loop {
            let min = slave.last_fetched.load(Ordering::SeqCst) + 1;
            match self.log.fetch(&host_name, min) {
                Ok(FetchResult::NoRecords) => break,
                Ok(FetchResult::Batch { from_sn, to_sn, bytes }) => {
                    slave.last_fetched.store(to_sn, Ordering::SeqCst);
                    self.send_batch(&slave, from_sn, to_sn, bytes);
                }
                Err(GfmdError::ReaderExpired(name)) => {
                    tracing::error!(slave = %name, "journal reader expired during first sync");
                    host.set_reader_open(false);
                    host.set_is_in_first_sync(false);
                    return;
                }
                Err(e) => {
                    tracing::warn!(error = %e, slave = %host_name, "first-sync send error");
                    break;
                }
            }
        }
        host.set_is_in_first_sync(false);
        slave.first_sync_done.store(true, Ordering::SeqCst);
    }

    /// Commit a record: append it to the log, drain every sync-classified
    /// slave's backlog up to and including it, then block on a quorum of
    /// sync-eligible slaves acknowledging it (or time out). Async targets
    /// are not drained here; the background fan-out thread handles them.
    pub fn commit(&self, record: JournalRecord) -> Result<()> {
        self.registry.set_current_seqnum(record.seqnum);
        self.log.append(record.clone());

        let master_cluster = self.registry.master_cluster().unwrap_or_default();
        let slaves = self.slaves.lock().unwrap().clone();
        let mut sync_targets = Vec::new();
        for slave in &slaves {
            let Some(host) = self.registry.lookup(&slave.host_name) else {
                continue;
            };
            if !host.is_sync_replication(&master_cluster) {
                continue;
            }
            self.send_batch_loop(slave, &host, record.seqnum);
            if host.is_sync_send_eligible(&master_cluster) && slave.first_sync_done.load(Ordering::SeqCst) {
                sync_targets.push(slave.clone());
            }
        }

        if sync_targets.is_empty() {
            return Ok(());
        }
        self.wait_for_quorum(&sync_targets, record.seqnum)
    }

    /// Drain `slave`'s backlog as contiguous batches until it reaches
    /// `target_seqnum` or the log reports no more records (design §4.4.2
    /// step 4: "may loop draining until to_sn >= journal_sync_info.seqnum").
    fn send_batch_loop(&self, slave: &Arc<SlaveQueue>, host: &gfmd_core::mdhost::MdHost, target_seqnum: u64) {
        loop {
            let min = slave.last_fetched.load(Ordering::SeqCst) + 1;
            match self.log.fetch(&slave.host_name, min) {
                Ok(FetchResult::NoRecords) => break,
                Ok(FetchResult::Batch { from_sn, to_sn, bytes }) => {
                    slave.last_fetched.store(to_sn, Ordering::SeqCst);
                    self.send_batch(slave, from_sn, to_sn, bytes);
                    if to_sn >= target_seqnum {
                        break;
                    }
                }
                Err(GfmdError::ReaderExpired(name)) => {
                    tracing::error!(slave = %name, "journal reader expired, marking out of sync");
                    host.set_reader_open(false);
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, slave = %slave.host_name, "journal send loop error");
                    break;
                }
            }
        }
    }

    /// Send one `JOURNAL_SEND(from_sn, to_sn, bytes)` frame. The reply
    /// callback frees the closure and, in the sync path, advances the
    /// slave's acked cursor and wakes anyone blocked in
    /// [`JournalChannel::wait_for_quorum`].
    fn send_batch(&self, slave: &Arc<SlaveQueue>, from_sn: u64, to_sn: u64, bytes: Vec<u8>) {
        let args = ArgEncoder::new().put_i64(from_sn as i64).put_i64(to_sn as i64).put_bytes(&bytes).finish();
        let slave2 = slave.clone();
        let _ = slave.channel.send_request_fire_and_forget(Opcode::JournalSend, &args, move |outcome| {
            if let gfmd_core::async_mux::Outcome::Reply { errcode, .. } = outcome {
                if errcode.is_success() {
                    slave2.acked_seqnum.fetch_max(to_sn, Ordering::SeqCst);
                }
            }
        });
    }

    /// Block until every slave in `targets` has acknowledged `seqnum`, or
    /// the configured sync timeout elapses (design §4.4.3: a slow sync
    /// slave fails its own commit wait, it does not fail the commit for
    /// everyone else — the master still considers the commit durable once
    /// its own log append succeeded).
    fn wait_for_quorum(&self, targets: &[Arc<SlaveQueue>], seqnum: u64) -> Result<()> {
        let deadline = Instant::now() + self.sync_timeout;
        loop {
            if targets
                .iter()
                .all(|s| s.acked_seqnum.load(Ordering::SeqCst) >= seqnum)
            {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(GfmdError::TimedOut(self.sync_timeout));
            }
            let guard = self.quorum_lock.lock().unwrap();
            let _ = self
                .quorum_cond
                .wait_timeout(guard, deadline.saturating_duration_since(now).min(Duration::from_millis(50)));
        }
    }

    /// Acknowledge a seqnum for a slave from the reader thread handling its
    /// `JOURNAL_SEND` responses, then wake anyone blocked in
    /// [`JournalChannel::wait_for_quorum`].
    pub fn record_ack(&self, host_name: &str, seqnum: u64) {
        if let Some(slave) = self.find_slave(host_name) {
            slave.acked_seqnum.fetch_max(seqnum, Ordering::SeqCst);
        }
        self.quorum_cond.notify_all();
    }

    /// Background fan-out loop for asynchronous replication targets: every
    /// `async_interval`, drain each async-eligible slave's backlog up to the
    /// current tail. Fixed at 500ms in the source (design §4.4.4); run this
    /// on its own thread.
    pub fn run_async_fanout(&self) {
        while !self.shutdown.load(Ordering::Relaxed) {
            std::thread::sleep(self.async_interval);
            let master_cluster = self.registry.master_cluster().unwrap_or_default();
            let target_seqnum = self.registry.current_seqnum();
            for slave in self.slaves.lock().unwrap().iter() {
                let Some(host) = self.registry.lookup(&slave.host_name) else {
                    continue;
                };
                if !host.is_sync_replication(&master_cluster) {
                    self.send_batch_loop(slave, &host, target_seqnum);
                }
            }
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gfmd_core::mdhost::MdHostRegistry;

    fn registry() -> Arc<MdHostRegistry> {
        Arc::new(MdHostRegistry::new("master"))
    }

    #[test]
    fn commit_with_no_slaves_does_not_block() {
        let channel = JournalChannel::new(registry(), Duration::from_millis(50), Duration::from_millis(500));
        channel
            .commit(JournalRecord {
                seqnum: 1,
                payload: vec![1, 2, 3],
            })
            .unwrap();
    }

    #[test]
    fn commit_with_no_sync_targets_does_not_block() {
        let reg = registry();
        let channel = JournalChannel::new(reg, Duration::from_millis(50), Duration::from_millis(500));
        let result = channel.commit(JournalRecord {
            seqnum: 7,
            payload: vec![],
        });
        assert!(result.is_ok());
    }

    /// A slave in a different cluster than the master is async-classified:
    /// `commit` must not send to it immediately, and must not block waiting
    /// for it.
    #[test]
    fn commit_does_not_send_to_async_slave_immediately() {
        let reg = Arc::new(MdHostRegistry::new("master"));
        reg.enter("master", 601, "A").unwrap();
        reg.set_self_as_master();
        reg.enter("async-slave", 601, "B").unwrap();

        let channel = Arc::new(JournalChannel::new(reg, Duration::from_millis(50), Duration::from_millis(500)));
        let sink: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));

        struct SharedWriter(Arc<Mutex<Vec<u8>>>);
        impl std::io::Write for SharedWriter {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let gfmd_channel = GfmdChannel::new(Box::new(SharedWriter(sink.clone())));
        channel.add_slave("async-slave", gfmd_channel);

        channel
            .commit(JournalRecord {
                seqnum: 1,
                payload: vec![9, 9],
            })
            .unwrap();

        assert!(sink.lock().unwrap().is_empty(), "async slave must not be sent to at commit time");
    }

    /// The retained window bounds how far behind a slave's cursor may fall
    /// before a reopen is refused with `EXPIRED` (design §4.4.1).
    #[test]
    fn fetch_past_the_retained_window_is_reader_expired() {
        let log = JournalLog::new(2);
        for seqnum in 1..=5u64 {
            log.append(JournalRecord {
                seqnum,
                payload: vec![seqnum as u8],
            });
        }
        // only seqnums 4 and 5 remain retained; asking for 1 must fail.
        let err = log.fetch("slave1", 1).unwrap_err();
        assert!(matches!(err, GfmdError::ReaderExpired(ref name) if name == "slave1"));
        assert!(err.is_slave_fatal());
    }

    #[test]
    fn fetch_within_the_window_returns_a_contiguous_batch() {
        let log = JournalLog::new(10);
        for seqnum in 1..=5u64 {
            log.append(JournalRecord {
                seqnum,
                payload: vec![seqnum as u8],
            });
        }
        match log.fetch("slave1", 2).unwrap() {
            FetchResult::Batch { from_sn, to_sn, bytes } => {
                assert_eq!(from_sn, 2);
                assert_eq!(to_sn, 5);
                assert_eq!(bytes, vec![2, 3, 4, 5]);
            }
            FetchResult::NoRecords => panic!("expected a batch"),
        }
    }

    #[test]
    fn fetch_past_the_tail_reports_no_records() {
        let log = JournalLog::new(10);
        log.append(JournalRecord { seqnum: 1, payload: vec![1] });
        assert!(matches!(log.fetch("slave1", 2).unwrap(), FetchResult::NoRecords));
    }
}
