//! Shared harness for cluster tests: an in-memory network of per-address
//! message queues, with partitioning, plus deterministic pump/bootstrap
//! helpers driving the engines through their synchronous surface.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use regatta::rpc::Envelope;
use regatta::{Raft, RaftOptions, Result, ServerId, Session, Transport};

/// The in-memory network. One queue per registered address; blocking an
/// address partitions it in both directions.
#[derive(Clone, Default)]
pub struct Net {
    inner: Arc<Mutex<NetInner>>,
}

#[derive(Default)]
struct NetInner {
    queues: HashMap<String, VecDeque<Envelope>>,
    blocked: HashSet<String>,
}

impl Net {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, address: &str) {
        self.inner
            .lock()
            .queues
            .entry(address.to_string())
            .or_default();
    }

    /// Partition an address: nothing in, nothing out.
    pub fn block(&self, address: &str) {
        self.inner.lock().blocked.insert(address.to_string());
    }

    pub fn unblock(&self, address: &str) {
        self.inner.lock().blocked.remove(address);
    }

    /// Drain everything queued for an address.
    pub fn take(&self, address: &str) -> Vec<Envelope> {
        match self.inner.lock().queues.get_mut(address) {
            Some(queue) => queue.drain(..).collect(),
            None => Vec::new(),
        }
    }

    pub fn transport(&self, owner: &str) -> Arc<dyn Transport> {
        Arc::new(NetTransport {
            net: self.clone(),
            owner: owner.to_string(),
        })
    }

    fn connected(&self, from: &str, to: &str) -> bool {
        let inner = self.inner.lock();
        inner.queues.contains_key(to)
            && !inner.blocked.contains(from)
            && !inner.blocked.contains(to)
    }

    fn push(&self, from: &str, to: &str, envelope: Envelope) {
        let mut inner = self.inner.lock();
        if inner.blocked.contains(from) || inner.blocked.contains(to) {
            return;
        }
        if let Some(queue) = inner.queues.get_mut(to) {
            queue.push_back(envelope);
        }
    }
}

struct NetTransport {
    net: Net,
    owner: String,
}

impl Transport for NetTransport {
    fn connect(&self, address: &str) -> Box<dyn Session> {
        Box::new(NetSession {
            net: self.net.clone(),
            owner: self.owner.clone(),
            target: address.to_string(),
        })
    }
}

struct NetSession {
    net: Net,
    owner: String,
    target: String,
}

impl Session for NetSession {
    fn send(&mut self, envelope: &Envelope) -> Result<()> {
        self.net.push(&self.owner, &self.target, envelope.clone());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.net.connected(&self.owner, &self.target)
    }

    fn seqno(&self) -> u64 {
        u64::from(self.is_connected())
    }
}

/// One server in a test cluster.
pub struct Node {
    pub raft: Raft,
    pub address: String,
}

/// Long election timers (elections only via `take_leadership`), heartbeats
/// on every `step`, small snapshot threshold.
pub fn test_options() -> RaftOptions {
    RaftOptions {
        election_timeout_base: Duration::from_secs(600),
        election_timeout_range: Duration::from_millis(1),
        heartbeat_interval: Duration::ZERO,
        snapshot_threshold: 4,
        ..RaftOptions::default()
    }
}

/// Make a leader send its heartbeats now.
pub fn heartbeat(node: &Node) {
    node.raft.step();
}

/// Deliver queued messages and run durability waiters until the network
/// goes quiet.
///
/// Like a real host transport, the pump attaches a return session for each
/// sender before delivering (the learn-on-first-RPC rule); replies can then
/// reach peers the receiver has no configured address for yet.
pub fn pump(net: &Net, nodes: &[&Node]) {
    let directory: HashMap<ServerId, String> = nodes
        .iter()
        .map(|node| (node.raft.server_id(), node.address.clone()))
        .collect();

    for _ in 0..200 {
        let mut delivered = false;
        for node in nodes {
            for envelope in net.take(&node.address) {
                if let Some(address) = directory.get(&envelope.from) {
                    let transport = net.transport(&node.address);
                    node.raft
                        .attach_session(envelope.from, transport.connect(address));
                }
                node.raft.deliver(envelope);
                delivered = true;
            }
            node.raft.flush();
        }
        if !delivered {
            return;
        }
    }
    panic!("network did not quiesce");
}

pub fn pump_all(net: &Net, nodes: &[Node]) {
    let refs: Vec<&Node> = nodes.iter().collect();
    pump(net, &refs);
}

/// Build an `n`-server cluster: the first server creates it and takes
/// leadership, the rest join one at a time.
pub fn bootstrap(dir: &Path, net: &Net, n: usize) -> Vec<Node> {
    let addresses: Vec<String> = (0..n)
        .map(|i| format!("tcp:127.0.0.{}:6641", i + 1))
        .collect();
    for address in &addresses {
        net.register(address);
    }

    let path = dir.join("s1.db");
    Raft::create_cluster(&path, &addresses[0], b"{}").unwrap();
    let raft = Raft::open(&path, net.transport(&addresses[0]), test_options()).unwrap();
    raft.take_leadership();
    raft.flush();
    assert!(raft.is_leader());

    let mut nodes = vec![Node {
        raft,
        address: addresses[0].clone(),
    }];

    for (i, address) in addresses.iter().enumerate().skip(1) {
        let path = dir.join(format!("s{}.db", i + 1));
        let raft = Raft::join_cluster(
            &path,
            address,
            std::slice::from_ref(&addresses[0]),
            None,
            net.transport(address),
            test_options(),
        )
        .unwrap();
        nodes.push(Node {
            raft,
            address: address.clone(),
        });

        pump_all(net, &nodes);
        // Propagate the committed configuration to everyone.
        heartbeat(&nodes[0]);
        pump_all(net, &nodes);
        assert!(!nodes[i].raft.is_joining(), "server {} failed to join", i + 1);
    }
    nodes
}
