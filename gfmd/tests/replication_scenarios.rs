//! End-to-end replication scenarios driven over real loopback TCP
//! connections, one per named scenario in the seed test suite: happy-path
//! sync commit, a slow slave timing out its quorum wait without failing
//! the commit, async fan-out draining a differently-clustered slave on its
//! own interval, and first-sync interleaving with ongoing commits.

use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use gfmd_core::error::{ChannelError, GfmdError};
use gfmd_core::mdhost::MdHostRegistry;
use gfmd::journal::{JournalChannel, JournalRecord};
use gfmd_wire::channel::{spawn_reader_thread, GfmdChannel};
use gfmd_wire::opcode::Opcode;

/// Connect two loopback `TcpStream`s to each other.
fn connected_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    (client, server)
}

/// Wire up a master-side channel with its own reader thread (needed so
/// responses flowing back from the slave are delivered into the mux) and a
/// slave-side channel whose `on_request` handler answers `JOURNAL_SEND`
/// after an optional artificial delay.
fn spawn_slave_channel(stream: TcpStream, reply_delay: Duration, received: Arc<Mutex<Vec<u64>>>) -> Arc<GfmdChannel> {
    let reader = stream.try_clone().unwrap();
    let channel = GfmdChannel::new(Box::new(stream));
    spawn_reader_thread(channel.clone(), reader, move |ch, req| {
        if req.opcode == Opcode::JournalSend {
            let mut dec = gfmd_wire::args::ArgDecoder::new(&req.args);
            let decoded = (|| -> gfmd_core::error::Result<_> {
                let from_sn = dec.get_i64()? as u64;
                let to_sn = dec.get_i64()? as u64;
                let _bytes = dec.get_bytes()?;
                Ok((from_sn, to_sn))
            })();
            if let Ok((_from_sn, to_sn)) = decoded {
                received.lock().unwrap().push(to_sn);
            }
            if !reply_delay.is_zero() {
                std::thread::sleep(reply_delay);
            }
            let _ = ch.send_response(req.xid, ChannelError::NoError, &[]);
        }
    });
    channel
}

fn spawn_master_side(stream: TcpStream) -> Arc<GfmdChannel> {
    let reader = stream.try_clone().unwrap();
    let channel = GfmdChannel::new(Box::new(stream));
    spawn_reader_thread(channel.clone(), reader, |_ch, _req| {});
    channel
}

#[test]
fn happy_path_sync_commit_one_slave() {
    let reg = Arc::new(MdHostRegistry::new("master"));
    reg.enter("master", 601, "A").unwrap();
    reg.set_self_as_master();
    let slave_host = reg.enter("slave1", 601, "A").unwrap();
    slave_host.set_peer(Some(1));
    slave_host.set_reader_open(true);

    let (master_stream, slave_stream) = connected_pair();
    let master_channel = spawn_master_side(master_stream);
    let received = Arc::new(Mutex::new(Vec::new()));
    let _slave_channel = spawn_slave_channel(slave_stream, Duration::ZERO, received.clone());

    let journal = Arc::new(JournalChannel::new(reg, Duration::from_secs(2), Duration::from_millis(500)));
    journal.add_slave("slave1", master_channel);
    journal.mark_first_sync_done("slave1");

    for seqnum in 1..=5u64 {
        journal
            .commit(JournalRecord {
                seqnum,
                payload: vec![0xAB; 4],
            })
            .unwrap();
    }

    assert_eq!(*received.lock().unwrap(), vec![1, 2, 3, 4, 5]);
}

#[test]
fn slow_slave_times_out_its_quorum_wait() {
    let reg = Arc::new(MdHostRegistry::new("master"));
    reg.enter("master", 601, "A").unwrap();
    reg.set_self_as_master();
    let slave_host = reg.enter("slave1", 601, "A").unwrap();
    slave_host.set_peer(Some(1));
    slave_host.set_reader_open(true);

    let (master_stream, slave_stream) = connected_pair();
    let master_channel = spawn_master_side(master_stream);
    let received = Arc::new(Mutex::new(Vec::new()));
    // Slave replies well past the configured sync timeout.
    let _slave_channel = spawn_slave_channel(slave_stream, Duration::from_millis(400), received);

    let journal = Arc::new(JournalChannel::new(reg, Duration::from_millis(80), Duration::from_millis(500)));
    journal.add_slave("slave1", master_channel);
    journal.mark_first_sync_done("slave1");

    let result = journal.commit(JournalRecord {
        seqnum: 1,
        payload: vec![],
    });

    assert!(matches!(result, Err(GfmdError::TimedOut(_))), "expected a quorum timeout, got {result:?}");
}

#[test]
fn async_fan_out_drains_a_differently_clustered_slave() {
    let reg = Arc::new(MdHostRegistry::new("master"));
    reg.enter("master", 601, "A").unwrap();
    reg.set_self_as_master();
    // cluster B: not a sync target relative to master's cluster A.
    let async_host = reg.enter("async-slave", 601, "B").unwrap();
    async_host.set_peer(Some(2));
    async_host.set_reader_open(true);

    let (master_stream, slave_stream) = connected_pair();
    let master_channel = spawn_master_side(master_stream);
    let received = Arc::new(Mutex::new(Vec::new()));
    let _slave_channel = spawn_slave_channel(slave_stream, Duration::ZERO, received.clone());

    let journal = Arc::new(JournalChannel::new(reg, Duration::from_millis(200), Duration::from_millis(50)));
    journal.add_slave("async-slave", master_channel);

    for seqnum in 1..=3u64 {
        journal
            .commit(JournalRecord {
                seqnum,
                payload: vec![1],
            })
            .unwrap();
    }
    // Commits to an async-only target must not block waiting for an ack.
    assert!(received.lock().unwrap().is_empty(), "async slave must not be sent to synchronously at commit time");

    let fanout = journal.clone();
    std::thread::spawn(move || fanout.run_async_fanout());

    let deadline = Instant::now() + Duration::from_millis(800);
    while received.lock().unwrap().len() < 3 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    journal.shutdown();

    assert_eq!(*received.lock().unwrap(), vec![1, 2, 3]);
}

#[test]
fn first_sync_interleaves_with_ongoing_commits() {
    let reg = Arc::new(MdHostRegistry::new("master"));
    reg.enter("master", 601, "A").unwrap();
    reg.set_self_as_master();
    let slave_host = reg.enter("slave1", 601, "A").unwrap();
    slave_host.set_peer(Some(1));
    slave_host.set_reader_open(true);

    let (master_stream, slave_stream) = connected_pair();
    let master_channel = spawn_master_side(master_stream);
    let received = Arc::new(Mutex::new(Vec::new()));
    // The slave acks slowly enough that a quorum wait would be observable,
    // but well inside the configured sync timeout.
    let ack_delay = Duration::from_millis(150);
    let _slave_channel = spawn_slave_channel(slave_stream, ack_delay, received.clone());

    let journal = Arc::new(JournalChannel::new(reg, Duration::from_secs(2), Duration::from_millis(500)));
    journal.add_slave("slave1", master_channel);

    // Still in first sync: this slave must not be waited on, even though it
    // is classified sync by cluster.
    let started = Instant::now();
    journal
        .commit(JournalRecord {
            seqnum: 1,
            payload: vec![],
        })
        .unwrap();
    assert!(
        started.elapsed() < ack_delay,
        "commit during first-sync must not block on the bootstrapping slave's ack"
    );

    journal.mark_first_sync_done("slave1");

    // Now the slave counts toward quorum: the commit must observe its ack,
    // which only arrives after `ack_delay`.
    let started = Instant::now();
    journal
        .commit(JournalRecord {
            seqnum: 2,
            payload: vec![],
        })
        .unwrap();
    assert!(
        started.elapsed() >= ack_delay,
        "commit after first-sync completes must wait for the now-eligible slave's ack"
    );

    assert_eq!(*received.lock().unwrap(), vec![1, 2]);
}
