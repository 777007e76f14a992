//! Cluster scenario tests.
//!
//! Multi-server consensus over an in-memory network: elections,
//! replication, partitions, log overwrite, snapshot catch-up, and
//! membership changes, driven deterministically through the engine's
//! synchronous surface.

mod common;

use common::{bootstrap, heartbeat, pump, pump_all, test_options, Net, Node};
use tempfile::tempdir;
use uuid::Uuid;

use regatta::log::LogEntry;
use regatta::rpc::{AppendRequest, Envelope, Message};
use regatta::{CommandStatus, NextEntry, Raft, RegattaError, Role, ServerId};

/// Drain everything queued for the application on `node`.
fn drain(node: &Node) -> Vec<NextEntry> {
    let mut entries = Vec::new();
    while let Some(entry) = node.raft.next_entry() {
        entries.push(entry);
    }
    entries
}

/// The last command payload delivered to the application on `node`.
fn last_data(node: &Node) -> Option<Vec<u8>> {
    drain(node)
        .into_iter()
        .filter(|e| !e.is_snapshot)
        .next_back()
        .map(|e| e.data.as_slice().to_vec())
}

// ============================================================================
// Single server
// ============================================================================

#[test]
fn test_single_server_cluster_commits_after_one_fsync() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("s1.db");
    let net = Net::new();
    net.register("tcp:127.0.0.1:6641");

    Raft::create_cluster(&path, "tcp:127.0.0.1:6641", b"{}").unwrap();
    let raft = Raft::open(&path, net.transport("tcp:127.0.0.1:6641"), test_options()).unwrap();
    raft.take_leadership();
    assert!(raft.is_leader());

    let cmd = raft.execute(b"cmd1".to_vec(), None);
    raft.flush();
    assert_eq!(cmd.status(), CommandStatus::Success);
    assert_eq!(raft.commit_index(), 2);

    let snapshot = raft.next_entry().unwrap();
    assert!(snapshot.is_snapshot);
    assert_eq!(snapshot.data.as_slice(), b"{}");
    let entry = raft.next_entry().unwrap();
    assert_eq!(entry.data.as_slice(), b"cmd1");
    assert_eq!(entry.eid, cmd.eid());
    assert!(!entry.is_snapshot);
    raft.close();
}

#[test]
fn test_persistence_roundtrip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("s1.db");
    let net = Net::new();
    net.register("tcp:127.0.0.1:6641");

    Raft::create_cluster(&path, "tcp:127.0.0.1:6641", b"{}").unwrap();
    let before = Raft::read_metadata(&path).unwrap();

    let (term, last_index, sid) = {
        let raft =
            Raft::open(&path, net.transport("tcp:127.0.0.1:6641"), test_options()).unwrap();
        raft.take_leadership();
        raft.execute(b"a".to_vec(), None);
        raft.execute(b"b".to_vec(), None);
        raft.flush();
        let state = (raft.term(), raft.last_log_index(), raft.server_id());
        raft.close();
        state
    };

    let raft = Raft::open(&path, net.transport("tcp:127.0.0.1:6641"), test_options()).unwrap();
    assert_eq!(raft.term(), term);
    assert_eq!(raft.last_log_index(), last_index);
    assert_eq!(raft.server_id(), sid);
    assert_eq!(raft.servers(), before.servers);

    let after = Raft::read_metadata(&path).unwrap();
    assert_eq!(after.cid, before.cid);
    assert_eq!(after.sid, before.sid);
    assert_eq!(after.local, before.local);
    raft.close();
}

#[test]
fn test_snapshot_threshold_drives_compaction() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("s1.db");
    let net = Net::new();
    net.register("tcp:127.0.0.1:6641");

    Raft::create_cluster(&path, "tcp:127.0.0.1:6641", b"{}").unwrap();
    let raft = Raft::open(&path, net.transport("tcp:127.0.0.1:6641"), test_options()).unwrap();
    raft.take_leadership();
    assert!(!raft.should_snapshot());

    for i in 0..4u8 {
        raft.execute(vec![b'x', i], None);
    }
    raft.flush();
    assert!(raft.should_snapshot());

    raft.store_snapshot(b"compacted".to_vec()).unwrap();
    assert!(!raft.should_snapshot());
    assert_eq!(raft.last_log_index(), raft.commit_index());
    raft.close();
}

// ============================================================================
// Replication
// ============================================================================

#[test]
fn test_three_server_commit() {
    let dir = tempdir().unwrap();
    let net = Net::new();
    let nodes = bootstrap(dir.path(), &net, 3);
    let leader = &nodes[0];

    let cmd = leader.raft.execute(b"x".to_vec(), None);
    pump_all(&net, &nodes);
    assert_eq!(cmd.status(), CommandStatus::Success);
    assert_eq!(leader.raft.commit_index(), cmd.index());

    // The next heartbeat spreads the commit index.
    heartbeat(leader);
    pump_all(&net, &nodes);
    for node in &nodes {
        assert_eq!(node.raft.commit_index(), cmd.index());
        assert_eq!(last_data(node).as_deref(), Some(&b"x"[..]));
    }
}

#[test]
fn test_duplicate_append_is_idempotent() {
    let dir = tempdir().unwrap();
    let net = Net::new();
    let nodes = bootstrap(dir.path(), &net, 3);

    let cmd = nodes[0].raft.execute(b"dup".to_vec(), None);
    nodes[0].raft.flush();

    // Deliver the same AppendEntries to S2 twice.
    let envelopes = net.take(&nodes[1].address);
    assert!(!envelopes.is_empty());
    for envelope in &envelopes {
        nodes[1].raft.deliver(envelope.clone());
    }
    nodes[1].raft.flush();
    let log_end = nodes[1].raft.last_log_index();
    for envelope in &envelopes {
        nodes[1].raft.deliver(envelope.clone());
    }
    nodes[1].raft.flush();
    assert_eq!(nodes[1].raft.last_log_index(), log_end);

    pump_all(&net, &nodes);
    assert_eq!(cmd.status(), CommandStatus::Success);
}

// ============================================================================
// Partitions and elections
// ============================================================================

#[test]
fn test_leader_partition_and_step_down() {
    let dir = tempdir().unwrap();
    let net = Net::new();
    let nodes = bootstrap(dir.path(), &net, 3);
    let (s1, s2, s3) = (&nodes[0], &nodes[1], &nodes[2]);
    let old_term = s1.raft.term();

    // Isolate the leader; S2 campaigns and wins with S3's vote.
    net.block(&s1.address);
    s2.raft.take_leadership();
    pump_all(&net, &nodes);
    assert_eq!(s2.raft.role(), Role::Leader);
    assert!(s2.raft.term() > old_term);
    // S2's first heartbeats already went out when it won.
    assert_eq!(s3.raft.leader(), Some(s2.raft.server_id()));
    assert_eq!(s1.raft.role(), Role::Leader); // oblivious

    // After the heal, the deposed leader's stale-term heartbeats are
    // rejected, and the replies carrying the new term depose it.
    net.unblock(&s1.address);
    heartbeat(s1);
    pump_all(&net, &nodes);
    assert_eq!(s1.raft.role(), Role::Follower);
    assert_eq!(s1.raft.term(), s2.raft.term());
    assert_eq!(s2.raft.role(), Role::Leader);

    heartbeat(s2);
    pump_all(&net, &nodes);
    assert_eq!(s1.raft.leader(), Some(s2.raft.server_id()));
    assert_eq!(s3.raft.leader(), Some(s2.raft.server_id()));
}

#[test]
fn test_log_overwrite_after_partition() {
    let dir = tempdir().unwrap();
    let net = Net::new();
    let nodes = bootstrap(dir.path(), &net, 3);
    let (s1, s2, s3) = (&nodes[0], &nodes[1], &nodes[2]);
    let base_commit = s1.raft.commit_index();

    // S1 appends locally but can't reach anyone.
    net.block(&s2.address);
    net.block(&s3.address);
    let doomed = s1.raft.execute(b"a".to_vec(), None);
    s1.raft.flush();
    let conflict_index = doomed.index();
    assert_eq!(doomed.status(), CommandStatus::Incomplete);
    assert_eq!(s1.raft.commit_index(), base_commit);
    let old_term = s1.raft.term();

    // The majority side elects S2, which commits its own entry at the
    // same index.
    net.block(&s1.address);
    net.unblock(&s2.address);
    net.unblock(&s3.address);
    s2.raft.take_leadership();
    pump_all(&net, &nodes);
    assert!(s2.raft.is_leader());
    let winner = s2.raft.execute(b"b".to_vec(), None);
    pump_all(&net, &nodes);
    assert_eq!(winner.status(), CommandStatus::Success);
    assert_eq!(winner.index(), conflict_index);

    // The heal: S1 steps down, truncates its conflicting entry, and takes
    // the new leader's.
    net.unblock(&s1.address);
    heartbeat(s2);
    pump_all(&net, &nodes);
    assert_eq!(s1.raft.role(), Role::Follower);
    assert_eq!(doomed.status(), CommandStatus::LostLeadership);
    assert_eq!(s1.raft.log_term(conflict_index), s2.raft.log_term(conflict_index));
    assert_eq!(s1.raft.commit_index(), s2.raft.commit_index());
    assert_eq!(last_data(s1).as_deref(), Some(&b"b"[..]));
    assert_ne!(old_term, s2.raft.term());
}

// ============================================================================
// Snapshot transfer
// ============================================================================

#[test]
fn test_snapshot_catchup_after_compaction() {
    let dir = tempdir().unwrap();
    let net = Net::new();
    let nodes = bootstrap(dir.path(), &net, 3);
    let (s1, s3) = (&nodes[0], &nodes[2]);

    // S3 misses a batch of commits, which then get compacted away.
    net.block(&s3.address);
    for i in 0..4u8 {
        s1.raft.execute(vec![b'v', i], None);
        pump_all(&net, &nodes);
    }
    let commit = s1.raft.commit_index();
    assert!(s3.raft.commit_index() < commit);

    // A snapshot bigger than one chunk forces a multi-chunk transfer.
    let image: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    s1.raft.store_snapshot(image.clone()).unwrap();
    assert_eq!(s1.raft.commit_index(), commit);

    net.unblock(&s3.address);
    heartbeat(s1);
    pump_all(&net, &nodes);

    assert_eq!(s3.raft.commit_index(), commit);
    assert_eq!(s3.raft.last_log_index(), commit);
    assert_eq!(s3.raft.servers(), s1.raft.servers());
    let delivered = drain(s3);
    let snapshot = delivered
        .iter()
        .rfind(|e| e.is_snapshot)
        .expect("snapshot delivered");
    assert_eq!(snapshot.data.as_slice(), image.as_slice());

    // Replication continues normally past the snapshot.
    let cmd = s1.raft.execute(b"after".to_vec(), None);
    pump_all(&net, &nodes);
    heartbeat(s1);
    pump_all(&net, &nodes);
    assert_eq!(cmd.status(), CommandStatus::Success);
    assert_eq!(s3.raft.commit_index(), cmd.index());
    assert_eq!(last_data(s3).as_deref(), Some(&b"after"[..]));
}

// ============================================================================
// Membership changes
// ============================================================================

#[test]
fn test_add_server_expands_majority() {
    let dir = tempdir().unwrap();
    let net = Net::new();
    let mut nodes = bootstrap(dir.path(), &net, 3);

    // S4 joins: catch-up, configuration append, commit, acknowledgement.
    let address = "tcp:127.0.0.4:6641".to_string();
    net.register(&address);
    let path = dir.path().join("s4.db");
    let raft = Raft::join_cluster(
        &path,
        &address,
        &[nodes[0].address.clone()],
        None,
        net.transport(&address),
        test_options(),
    )
    .unwrap();
    nodes.push(Node { raft, address });
    pump_all(&net, &nodes);
    heartbeat(&nodes[0]);
    pump_all(&net, &nodes);

    assert!(!nodes[3].raft.is_joining());
    for node in &nodes {
        assert_eq!(node.raft.servers().len(), 4);
    }

    // Four members need three acks to commit.
    net.block(&nodes[2].address);
    net.block(&nodes[3].address);
    let cmd = nodes[0].raft.execute(b"w".to_vec(), None);
    pump_all(&net, &nodes);
    assert_eq!(cmd.status(), CommandStatus::Incomplete);

    net.unblock(&nodes[2].address);
    heartbeat(&nodes[0]);
    pump_all(&net, &nodes);
    assert_eq!(cmd.status(), CommandStatus::Success);
}

#[test]
fn test_remove_server_shrinks_majority() {
    let dir = tempdir().unwrap();
    let net = Net::new();
    let nodes = bootstrap(dir.path(), &net, 3);
    let (s1, s2, s3) = (&nodes[0], &nodes[1], &nodes[2]);

    // The leader cannot remove itself without a transfer.
    assert!(matches!(
        s1.raft.leave(),
        Err(RegattaError::NotSupported(_))
    ));

    s3.raft.leave().unwrap();
    pump_all(&net, &nodes);
    heartbeat(s1);
    pump_all(&net, &nodes);

    assert_eq!(s1.raft.servers().len(), 2);
    assert_eq!(s2.raft.servers().len(), 2);
    assert!(!s1.raft.servers().contains_key(&s3.raft.server_id()));

    // Two members commit on their own now.
    let cmd = s1.raft.execute(b"post-remove".to_vec(), None);
    pump(&net, &[s1, s2]);
    assert_eq!(cmd.status(), CommandStatus::Success);
}

#[test]
fn test_truncating_config_entry_reverts_membership() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("s1.db");
    let net = Net::new();
    net.register("tcp:127.0.0.1:6641");

    Raft::create_cluster(&path, "tcp:127.0.0.1:6641", b"{}").unwrap();
    let raft = Raft::open(&path, net.transport("tcp:127.0.0.1:6641"), test_options()).unwrap();
    let original = raft.servers();
    let cid = raft.cluster_id();
    let me = raft.server_id();

    // An uncommitted configuration arrives from one leader...
    let mut expanded = original.clone();
    expanded.insert(ServerId::generate(), "tcp:127.0.0.9:6641".to_string());
    let leader_a = ServerId::generate();
    raft.deliver(Envelope {
        to: Some(me),
        from: leader_a,
        cluster: cid,
        message: Message::AppendRequest(AppendRequest {
            term: 2,
            leader_sid: leader_a,
            prev_log_index: 1,
            prev_log_term: 0,
            leader_commit: 1,
            entries: vec![LogEntry::servers(2, expanded.clone())],
        }),
    });
    raft.flush();
    assert_eq!(raft.servers(), expanded);

    // ...and is overwritten by the next leader's conflicting entry:
    // membership reverts to the prior committed configuration.
    let leader_b = ServerId::generate();
    raft.deliver(Envelope {
        to: Some(me),
        from: leader_b,
        cluster: cid,
        message: Message::AppendRequest(AppendRequest {
            term: 3,
            leader_sid: leader_b,
            prev_log_index: 1,
            prev_log_term: 0,
            leader_commit: 1,
            entries: vec![LogEntry::data(3, b"y".to_vec(), Uuid::new_v4())],
        }),
    });
    raft.flush();
    assert_eq!(raft.servers(), original);
    raft.close();
}
