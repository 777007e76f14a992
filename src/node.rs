//! The consensus core.
//!
//! One [`Raft`] drives a single server of a cluster: the role state machine
//! (follower, candidate, leader), elections, log replication, commit-index
//! advancement, snapshot transfer, and single-server membership change.
//!
//! All consensus state lives in one place, owned behind a lock and driven
//! either by the async [`Raft::run`] event loop (production) or by the
//! synchronous [`Raft::deliver`] / [`Raft::step`] / [`Raft::flush`] surface
//! (embedding and tests). The only other thread is the durability worker,
//! which fsyncs the cluster log and publishes a durable sequence number.
//!
//! Persistence discipline: any state change observable to a peer through an
//! RPC reply is durable before the reply is sent. Such replies are held on
//! a waiter gated on the durability worker's sequence number — one waiter
//! per appended batch, granted vote, or locally written command.

use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::command::{command_pair, Command, CommandCompleter, CommandStatus};
use crate::config::RaftOptions;
use crate::durability::DurabilityWorker;
use crate::error::{RegattaError, Result};
use crate::log::{EntryPayload, LogEntry, RaftLog};
use crate::membership::{Phase, Server, ServerConfig, ServerMap};
use crate::rpc::{
    AppendReply, AppendRequest, Envelope, InstallSnapshotReply, InstallSnapshotRequest,
    Message, ServerReply, ServerRequest, ServerStatus, VoteReply, VoteRequest,
};
use crate::session::{Session, SessionRegistry, Transport};
use crate::storage::{Header, LogFile, LogRecord, Replay, SnapshotRecord};
use crate::types::{Address, ClusterId, LogIndex, ServerId, Term};

/// Role of a server within its cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Passive: responds to RPCs, waits out the election timer.
    Follower,
    /// Actively seeking election.
    Candidate,
    /// Handling client requests and replication.
    Leader,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

/// One committed item handed to the application: either a state-machine
/// snapshot to load, or a command to apply.
#[derive(Debug, Clone)]
pub struct NextEntry {
    pub data: Arc<Vec<u8>>,
    pub eid: Uuid,
    pub is_snapshot: bool,
}

/// Metadata of an on-disk cluster log, read without resuming the server.
#[derive(Debug, Clone)]
pub struct ClusterMetadata {
    pub cid: ClusterId,
    pub sid: ServerId,
    /// The log's file name.
    pub name: String,
    /// Our address in the latest configuration, if we are in it.
    pub local: Option<String>,
    pub servers: ServerConfig,
}

/// Fields of an accepted AppendEntries request that the deferred reply
/// needs; the entries themselves are not kept.
#[derive(Debug, Clone)]
struct AppendMeta {
    from: ServerId,
    prev_log_index: LogIndex,
    prev_log_term: Term,
    n_entries: u64,
    leader_commit: LogIndex,
}

impl AppendMeta {
    fn of(rq: &AppendRequest, from: ServerId) -> Self {
        Self {
            from,
            prev_log_index: rq.prev_log_index,
            prev_log_term: rq.prev_log_term,
            n_entries: rq.entries.len() as u64,
            leader_commit: rq.leader_commit,
        }
    }
}

/// A deferred action gated on a durability sequence number.
#[derive(Debug)]
struct Waiter {
    seqno: u64,
    kind: WaiterKind,
}

#[derive(Debug)]
enum WaiterKind {
    /// A locally written command became durable: advance our own match
    /// index, which may advance the commit index.
    Command { index: LogIndex },
    /// Entries appended for the leader became durable: send the reply.
    Append { meta: AppendMeta },
    /// A granted vote became durable: send the grant.
    Vote,
}

/// Outcome of the AppendEntries consistency-and-splice step.
enum Splice {
    /// Inconsistent with our log; reply failure immediately.
    Reject,
    /// Nothing new was written; reply success immediately.
    Accept,
    /// Entries were written; the reply follows durability.
    Pending,
}

/// Handle onto one running Raft server.
pub struct Raft {
    inner: Arc<Mutex<RaftInner>>,
    inbound_tx: mpsc::UnboundedSender<Envelope>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    shutdown: Arc<Notify>,
}

struct RaftInner {
    options: RaftOptions,
    storage: LogFile,

    // Persistent derived state: updated on stable storage before replying
    // to RPCs, recoverable from the header, snapshot, and records.
    cid: Option<ClusterId>,
    sid: ServerId,
    header_written: bool,

    // Persistent state on all servers.
    current_term: Term,
    voted_for: Option<ServerId>,
    log: RaftLog,

    // Volatile state.
    role: Role,
    commit_index: LogIndex,
    last_applied: LogIndex,
    applied_eid: Uuid,
    leader: Option<ServerId>,

    servers: ServerMap,
    local_address: String,

    // Leaders only; reinitialized after becoming leader.
    add_servers: ServerMap,
    remove_server: Option<Server>,
    commands: HashMap<LogIndex, CommandCompleter>,

    // Candidates only; reinitialized at the start of an election.
    n_votes: usize,

    // Durability handshake.
    durability: DurabilityWorker,
    waiters: VecDeque<Waiter>,
    vote_waiter_pending: bool,
    write_failed_term: Option<Term>,

    // Sessions.
    transport: Arc<dyn Transport>,
    registry: SessionRegistry,

    // Joining an existing cluster.
    joining: bool,

    // Timers.
    election_deadline: Instant,
    ping_deadline: Instant,

    // Snapshot being received, accumulated chunk by chunk.
    snapshot_buf: Vec<u8>,

    // Committed items awaiting pickup by the application.
    delivery: VecDeque<NextEntry>,

    shutdown: bool,
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(60 * 60 * 24 * 365)
}

/// State folded out of an on-disk record stream.
struct Folded {
    cid: Option<ClusterId>,
    sid: Option<ServerId>,
    current_term: Term,
    voted_for: Option<ServerId>,
    log: RaftLog,
    has_snapshot: bool,
}

fn fold_replay(path: &Path, replay: Replay) -> Result<Folded> {
    let mut folded = Folded {
        cid: None,
        sid: None,
        current_term: 0,
        voted_for: None,
        log: RaftLog::new(),
        has_snapshot: false,
    };

    if let Some(header) = replay.header {
        folded.cid = Some(header.cluster_id);
        folded.sid = Some(header.server_id);
    }
    if let Some(snapshot) = replay.snapshot {
        folded.log.reset_snapshot(
            snapshot.prev_index,
            snapshot.prev_term,
            snapshot.prev_eid,
            snapshot.prev_servers,
            snapshot.data,
        );
        folded.has_snapshot = true;
    }

    for record in replay.records {
        // A leader can replicate entries from earlier terms, so a record's
        // term may precede the current term; the current term itself never
        // goes backwards.
        if record.term > folded.current_term {
            folded.current_term = record.term;
            folded.voted_for = None;
        }

        if let Some(vote) = record.vote {
            match folded.voted_for {
                None => folded.voted_for = Some(vote),
                Some(prior) if prior != vote => {
                    return Err(RegattaError::corrupt(
                        path,
                        format!("term {} votes for both {prior} and {vote}", record.term),
                    ));
                }
                Some(_) => {}
            }
            continue;
        }

        let Some(index) = record.index else {
            continue; // bare term advance
        };
        if index < folded.log.log_end() {
            folded.log.truncate(index);
        } else if index > folded.log.log_end() {
            return Err(RegattaError::corrupt(
                path,
                format!(
                    "log record index {index} skips past expected {}",
                    folded.log.log_end()
                ),
            ));
        }
        if record.term < folded.log.last_term() {
            return Err(RegattaError::corrupt(
                path,
                format!(
                    "log record index {index} term {} precedes previous entry's term {}",
                    record.term,
                    folded.log.last_term()
                ),
            ));
        }

        if let Some(servers) = record.servers {
            folded.log.append(LogEntry::servers(record.term, servers));
        } else if let Some(data) = record.data {
            let Some(eid) = record.eid else {
                return Err(RegattaError::corrupt(
                    path,
                    format!("log record index {index} has data but no eid"),
                ));
            };
            folded
                .log
                .append(LogEntry::data(record.term, data.into_vec(), eid));
        } else {
            return Err(RegattaError::corrupt(
                path,
                format!("log record index {index} has neither data nor servers"),
            ));
        }
    }

    Ok(folded)
}

/// The record sequence of a full log rewrite: header, snapshot, the
/// remaining entries, and the current term and vote. The term is redundant
/// when an entry above carries it; the vote never is.
fn snapshot_records(
    cid: ClusterId,
    sid: ServerId,
    log: &RaftLog,
    current_term: Term,
    voted_for: Option<ServerId>,
) -> Result<Vec<serde_json::Value>> {
    let mut records = Vec::with_capacity(log.len() + 3);
    records.push(serde_json::to_value(Header {
        cluster_id: cid,
        server_id: sid,
    })?);
    records.push(serde_json::to_value(SnapshotRecord {
        prev_term: log.prev_term(),
        prev_index: log.prev_index(),
        prev_eid: log.prev_eid(),
        prev_servers: log.prev_servers().clone(),
        data: Arc::clone(log.snapshot()),
    })?);
    for index in log.log_start()..log.log_end() {
        if let Some(entry) = log.entry(index) {
            records.push(serde_json::to_value(LogRecord::entry(index, entry))?);
        }
    }
    records.push(serde_json::to_value(LogRecord::state(
        current_term,
        voted_for,
    ))?);
    Ok(records)
}

impl Raft {
    /// Create a new cluster consisting of the single server at
    /// `local_address`, with `data` as the initial state-machine snapshot.
    ///
    /// This only creates the on-disk log in `path`, which must not already
    /// exist; use [`Raft::open`] to start operating the server.
    pub fn create_cluster(
        path: impl AsRef<Path>,
        local_address: &str,
        data: &[u8],
    ) -> Result<()> {
        Address::parse(local_address)?;

        let cid = ClusterId::generate();
        let sid = ServerId::generate();
        let mut config = ServerConfig::new();
        config.insert(sid, local_address.to_string());

        let mut log = RaftLog::new();
        log.reset_snapshot(1, 0, Uuid::new_v4(), config, Arc::new(data.to_vec()));

        let mut file = LogFile::create(path)?;
        for record in snapshot_records(cid, sid, &log, 0, None)? {
            file.append(&record)?;
        }
        file.sync_handle().sync_all()?;
        info!(cluster = %cid.short(), server = %sid.short(), "created cluster");
        Ok(())
    }

    /// Resume the local server of an existing cluster from its log.
    pub fn open(
        path: impl AsRef<Path>,
        transport: Arc<dyn Transport>,
        options: RaftOptions,
    ) -> Result<Raft> {
        let (storage, replay) = LogFile::open(path)?;
        if replay.header.is_none() || replay.snapshot.is_none() {
            return Err(RegattaError::NotInitialized(
                storage.path().display().to_string(),
            ));
        }
        let folded = fold_replay(storage.path(), replay)?;
        let (Some(cid), Some(sid)) = (folded.cid, folded.sid) else {
            return Err(RegattaError::NotInitialized(
                storage.path().display().to_string(),
            ));
        };

        let config = folded.log.latest_config();
        let Some(local_address) = config.get(&sid).cloned() else {
            return Err(RegattaError::NotInCluster);
        };

        Ok(Raft::build(
            storage,
            folded,
            Some(cid),
            sid,
            true,
            local_address,
            false,
            Vec::new(),
            transport,
            options,
        ))
    }

    /// Add this server to an existing cluster.
    ///
    /// Creates the local log in `path` if needed; if the file exists it
    /// must be from a previous join attempt, which resumes. `remotes` are
    /// addresses of existing cluster members; reaching any one of them
    /// (transitively, the leader) suffices. If `cid` is given, only the
    /// cluster with that id is joined.
    pub fn join_cluster(
        path: impl AsRef<Path>,
        local_address: &str,
        remotes: &[String],
        cid: Option<ClusterId>,
        transport: Arc<dyn Transport>,
        options: RaftOptions,
    ) -> Result<Raft> {
        Address::parse(local_address)?;
        for remote in remotes {
            Address::parse(remote)?;
        }

        let (mut storage, replay) = LogFile::open_or_create(path)?;
        let folded = fold_replay(storage.path(), replay)?;

        if let (Some(want), Some(have)) = (cid, folded.cid) {
            if want != have {
                return Err(RegattaError::ClusterMismatch {
                    expected: want,
                    actual: have,
                });
            }
        }

        let mut known_cid = folded.cid;
        let mut header_written = known_cid.is_some();
        let sid = match folded.sid {
            Some(sid) => sid,
            None => {
                let sid = ServerId::generate();
                if let Some(cid) = cid {
                    storage.append(&Header {
                        cluster_id: cid,
                        server_id: sid,
                    })?;
                    known_cid = Some(cid);
                    header_written = true;
                }
                sid
            }
        };

        let config = folded.log.latest_config();
        let joining = !config.contains_key(&sid);
        let local_address = match config.get(&sid) {
            Some(stored) => {
                if stored != local_address {
                    warn!(
                        stored = %stored,
                        "using local server address from the cluster log"
                    );
                }
                stored.clone()
            }
            None => local_address.to_string(),
        };

        Ok(Raft::build(
            storage,
            folded,
            known_cid,
            sid,
            header_written,
            local_address,
            joining,
            remotes.to_vec(),
            transport,
            options,
        ))
    }

    /// Read the identity stored in a cluster log without resuming it.
    pub fn read_metadata(path: impl AsRef<Path>) -> Result<ClusterMetadata> {
        let (storage, replay) = LogFile::open(path)?;
        let folded = fold_replay(storage.path(), replay)?;
        let (Some(cid), Some(sid)) = (folded.cid, folded.sid) else {
            return Err(RegattaError::NotInitialized(
                storage.path().display().to_string(),
            ));
        };
        let servers = folded.log.latest_config();
        Ok(ClusterMetadata {
            cid,
            sid,
            name: storage.path().display().to_string(),
            local: servers.get(&sid).cloned(),
            servers,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        storage: LogFile,
        folded: Folded,
        cid: Option<ClusterId>,
        sid: ServerId,
        header_written: bool,
        local_address: String,
        joining: bool,
        remotes: Vec<String>,
        transport: Arc<dyn Transport>,
        options: RaftOptions,
    ) -> Raft {
        let durability = DurabilityWorker::spawn(storage.sync_handle());
        let prev_index = folded.log.prev_index();
        let prev_eid = folded.log.prev_eid();

        let mut inner = RaftInner {
            options,
            storage,
            cid,
            sid,
            header_written,
            current_term: folded.current_term,
            voted_for: folded.voted_for,
            log: folded.log,
            role: Role::Follower,
            commit_index: prev_index,
            last_applied: prev_index,
            applied_eid: prev_eid,
            leader: None,
            servers: ServerMap::new(),
            local_address,
            add_servers: ServerMap::new(),
            remove_server: None,
            commands: HashMap::new(),
            n_votes: 0,
            durability,
            waiters: VecDeque::new(),
            vote_waiter_pending: false,
            write_failed_term: None,
            transport,
            registry: SessionRegistry::new(),
            joining,
            election_deadline: Instant::now(),
            ping_deadline: Instant::now(),
            snapshot_buf: Vec::new(),
            delivery: VecDeque::new(),
            shutdown: false,
        };
        inner.reset_election_timer();
        inner.refresh_servers_from_log();

        if folded.has_snapshot && !inner.joining {
            // The application loads the snapshot before any entries.
            inner.delivery.push_back(NextEntry {
                data: Arc::clone(inner.log.snapshot()),
                eid: inner.log.prev_eid(),
                is_snapshot: true,
            });
        }
        if inner.joining {
            for address in &remotes {
                let transport = Arc::clone(&inner.transport);
                inner.registry.ensure_pending(address, transport.as_ref());
            }
            for address in remotes {
                inner.send_join_request(&address);
            }
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Raft {
            inner: Arc::new(Mutex::new(inner)),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Channel for the host transport to feed inbound envelopes into
    /// [`Raft::run`].
    pub fn sender(&self) -> mpsc::UnboundedSender<Envelope> {
        self.inbound_tx.clone()
    }

    /// Hand one inbound envelope to the engine synchronously.
    pub fn deliver(&self, envelope: Envelope) {
        self.inner.lock().receive(envelope);
    }

    /// Adopt a session learned from an incoming connection, keyed by the
    /// sender id taken from its first RPC.
    pub fn attach_session(&self, sid: ServerId, session: Box<dyn Session>) {
        self.inner.lock().registry.attach(sid, session);
    }

    /// One cooperative iteration: maintain sessions, run due timers, fire
    /// waiters whose writes have become durable. Non-blocking.
    pub fn step(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if inner.shutdown {
            return;
        }
        inner.tick_sessions();
        inner.handle_timers(now);
        let committed = inner.durability.handle().committed();
        inner.waiters_run(committed);
    }

    /// Block until everything requested so far is durable, then fire the
    /// released waiters. Embedding and test convenience.
    pub fn flush(&self) {
        let handle = self.inner.lock().durability.handle();
        handle.wait_committed(handle.requested());
        let committed = handle.committed();
        self.inner.lock().waiters_run(committed);
    }

    /// Drive the server: inbound envelopes, timers, and durability
    /// completions, until [`Raft::close`] is called.
    pub async fn run(&self) {
        if self.inner.lock().shutdown {
            return;
        }
        let Some(mut inbound) = self.inbound_rx.lock().take() else {
            warn!("run() called twice");
            return;
        };
        let mut durable = self.inner.lock().durability.subscribe();

        loop {
            if self.inner.lock().shutdown {
                break;
            }
            self.inner.lock().tick_sessions();
            let deadline = self.inner.lock().next_deadline();

            tokio::select! {
                _ = self.shutdown.notified() => break,
                maybe = inbound.recv() => match maybe {
                    Some(envelope) => self.inner.lock().receive(envelope),
                    None => break,
                },
                changed = durable.changed() => {
                    if changed.is_err() {
                        break; // worker shut down
                    }
                    let committed = *durable.borrow_and_update();
                    self.inner.lock().waiters_run(committed);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    self.inner.lock().handle_timers(Instant::now());
                }
            }
        }
    }

    /// Shut down: complete outstanding commands with
    /// [`CommandStatus::ShutDown`], stop the durability worker, close all
    /// sessions.
    pub fn close(&self) {
        self.inner.lock().close();
        self.shutdown.notify_waiters();
    }

    /// Submit a command for replication. Leader-only; elsewhere the
    /// command completes immediately as [`CommandStatus::NotLeader`].
    ///
    /// `prereq`, if given, must match the entry id of the last entry in
    /// the leader's log, or the command completes as
    /// [`CommandStatus::BadPrereq`].
    pub fn execute(&self, data: Vec<u8>, prereq: Option<Uuid>) -> Command {
        self.inner.lock().execute_data(data, prereq)
    }

    /// Whether a committed entry is waiting for the application.
    pub fn has_next_entry(&self) -> bool {
        !self.inner.lock().delivery.is_empty()
    }

    /// Pop the next committed entry for the application, in log order.
    pub fn next_entry(&self) -> Option<NextEntry> {
        self.inner.lock().delivery.pop_front()
    }

    /// Whether enough applied entries have accumulated that the
    /// application should supply a fresh snapshot.
    pub fn should_snapshot(&self) -> bool {
        let inner = self.inner.lock();
        !inner.joining
            && inner.last_applied + 1 - inner.log.log_start() >= inner.options.snapshot_threshold
    }

    /// Compact the log: fold everything up to `last_applied` into the
    /// given state-machine snapshot and atomically rewrite the cluster
    /// log.
    pub fn store_snapshot(&self, data: Vec<u8>) -> Result<()> {
        self.inner.lock().store_snapshot(data)
    }

    /// Campaign for leadership now instead of waiting out a timer.
    pub fn take_leadership(&self) {
        let mut inner = self.inner.lock();
        if inner.role != Role::Leader && !inner.joining && !inner.shutdown {
            inner.start_election();
        }
    }

    /// Hand leadership to another server.
    pub fn transfer_leadership(&self) -> Result<()> {
        Err(RegattaError::NotSupported("leadership transfer"))
    }

    /// Ask the cluster to remove this server. Must not be the leader
    /// (that would require a leadership transfer first).
    pub fn leave(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.role == Role::Leader {
            return Err(RegattaError::NotSupported(
                "removing the leader requires a leadership transfer",
            ));
        }
        let sid = inner.sid;
        let Some(leader) = inner.leader.filter(|leader| *leader != sid) else {
            return Err(RegattaError::NotLeader { leader: None });
        };
        inner.send(
            leader,
            Message::RemoveServerRequest(ServerRequest { sid, address: None }),
        );
        Ok(())
    }

    pub fn server_id(&self) -> ServerId {
        self.inner.lock().sid
    }

    pub fn cluster_id(&self) -> Option<ClusterId> {
        self.inner.lock().cid
    }

    pub fn local_address(&self) -> String {
        self.inner.lock().local_address.clone()
    }

    pub fn role(&self) -> Role {
        self.inner.lock().role
    }

    pub fn is_leader(&self) -> bool {
        self.inner.lock().role == Role::Leader
    }

    pub fn leader(&self) -> Option<ServerId> {
        self.inner.lock().leader
    }

    pub fn term(&self) -> Term {
        self.inner.lock().current_term
    }

    pub fn commit_index(&self) -> LogIndex {
        self.inner.lock().commit_index
    }

    pub fn is_joining(&self) -> bool {
        self.inner.lock().joining
    }

    /// The latest membership this server knows, committed or not.
    pub fn servers(&self) -> ServerConfig {
        self.inner.lock().log.latest_config()
    }

    /// Index of the last entry in the log.
    pub fn last_log_index(&self) -> LogIndex {
        self.inner.lock().log.last_index()
    }

    /// Term recorded at `index`, if the log covers it.
    pub fn log_term(&self, index: LogIndex) -> Option<Term> {
        self.inner.lock().log.term_at(index)
    }
}

impl RaftInner {
    // ---------------- inbound dispatch ----------------

    fn receive(&mut self, envelope: Envelope) {
        if self.shutdown {
            return;
        }
        match envelope.validate(self.sid, self.cid) {
            Ok(Some(learned)) => {
                info!(cluster = %learned.short(), "learned cluster ID");
                self.cid = Some(learned);
                self.maybe_write_header();
            }
            Ok(None) => {}
            Err(err) => {
                info!(kind = envelope.message.kind(), error = %err, "dropping RPC");
                return;
            }
        }

        let from = envelope.from;
        match envelope.message {
            Message::Hello => {}
            Message::AppendRequest(rq) => self.handle_append_request(from, rq),
            Message::AppendReply(rpy) => self.handle_append_reply(from, rpy),
            Message::VoteRequest(rq) => self.handle_vote_request(from, rq),
            Message::VoteReply(rpy) => self.handle_vote_reply(from, rpy),
            Message::AddServerRequest(rq) => self.handle_add_server_request(from, rq),
            Message::AddServerReply(rpy) => self.handle_add_server_reply(from, rpy),
            Message::RemoveServerRequest(rq) => self.handle_remove_server_request(from, rq),
            Message::RemoveServerReply(rpy) => self.handle_remove_server_reply(from, rpy),
            Message::InstallSnapshotRequest(rq) => {
                self.handle_install_snapshot_request(from, rq)
            }
            Message::InstallSnapshotReply(rpy) => {
                self.handle_install_snapshot_reply(from, rpy)
            }
        }
    }

    fn maybe_write_header(&mut self) {
        if self.header_written {
            return;
        }
        let Some(cid) = self.cid else { return };
        match self.storage.append(&Header {
            cluster_id: cid,
            server_id: self.sid,
        }) {
            Ok(()) => {
                self.header_written = true;
                self.durability.request();
            }
            Err(err) => warn!(error = %err, "failed to write log header"),
        }
    }

    // ---------------- terms and roles ----------------

    /// Process a term received in an RPC. Returns false if the message
    /// carries a stale term and must be rejected.
    fn receive_term(&mut self, term: Term) -> bool {
        if term > self.current_term {
            if let Err(err) = self.set_term(term, None) {
                warn!(error = %err, "failed to persist term advance");
                return false;
            }
            // Whoever led the old term doesn't lead this one.
            self.leader = None;
            self.become_follower();
        }
        term >= self.current_term
    }

    fn set_term(&mut self, term: Term, vote: Option<ServerId>) -> Result<()> {
        self.storage.append(&LogRecord::state(term, vote))?;
        self.durability.request();
        self.current_term = term;
        self.voted_for = vote;
        Ok(())
    }

    fn become_follower(&mut self) {
        if self.role == Role::Follower {
            return;
        }
        info!(term = self.current_term, "became follower");
        self.role = Role::Follower;
        self.leader = None;
        self.reset_election_timer();

        // Notify originators about lost leadership. We do not reverse any
        // membership change already in the log: until told otherwise, the
        // newest configuration is the one to use.
        let adds: Vec<Option<ServerId>> =
            self.add_servers.iter().map(|s| s.reply_to).collect();
        for reply_to in adds {
            self.send_server_reply(reply_to, false, ServerStatus::LostLeadership);
        }
        self.add_servers = ServerMap::new();
        if let Some(removed) = self.remove_server.take() {
            self.send_server_reply(removed.reply_to, true, ServerStatus::LostLeadership);
        }
        self.complete_all_commands(CommandStatus::LostLeadership);
    }

    fn start_election(&mut self) {
        debug_assert!(self.role != Role::Leader);
        debug_assert!(self.commands.is_empty());
        self.role = Role::Candidate;
        self.leader = None;
        self.n_votes = 0;

        let term = self.current_term + 1;
        if let Err(err) = self.set_term(term, Some(self.sid)) {
            warn!(error = %err, "failed to persist candidacy; standing down");
            self.role = Role::Follower;
            return;
        }
        info!(term = self.current_term, "starting election");
        self.reset_election_timer();

        let last_log_index = self.log.last_index();
        let last_log_term = self.log.last_term();
        for server in self.servers.iter_mut() {
            server.voted = false;
        }
        for sid in self.servers.sids() {
            if sid == self.sid {
                continue;
            }
            self.send(
                sid,
                Message::VoteRequest(VoteRequest {
                    term: self.current_term,
                    last_log_index,
                    last_log_term,
                }),
            );
        }
        // Our own vote.
        self.accept_vote(self.sid, true);
    }

    fn accept_vote(&mut self, from: ServerId, granted: bool) {
        let Some(server) = self.servers.get_mut(from) else {
            return;
        };
        if server.voted {
            return;
        }
        server.voted = true;
        if granted {
            self.n_votes += 1;
            if self.servers.is_majority(self.n_votes) {
                self.become_leader();
            }
        }
    }

    fn become_leader(&mut self) {
        debug_assert!(self.role != Role::Leader);
        info!(
            term = self.current_term,
            votes = self.n_votes,
            servers = self.servers.len(),
            "elected leader"
        );
        self.role = Role::Leader;
        self.leader = Some(self.sid);
        self.election_deadline = far_future();

        let log_end = self.log.log_end();
        for server in self.servers.iter_mut() {
            server.init_leader(log_end);
        }
        self.send_heartbeats();
    }

    // ---------------- timers ----------------

    fn reset_election_timer(&mut self) {
        let range = self.options.election_timeout_range.as_millis() as u64;
        let jitter = if range == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..range)
        };
        self.election_deadline =
            Instant::now() + self.options.election_timeout_base + Duration::from_millis(jitter);
    }

    fn handle_timers(&mut self, now: Instant) {
        if !self.joining && self.role != Role::Leader && now >= self.election_deadline {
            self.start_election();
        }
        if self.role == Role::Leader && now >= self.ping_deadline {
            self.send_heartbeats();
        }
    }

    fn next_deadline(&self) -> Instant {
        let mut deadline = if self.joining {
            far_future()
        } else {
            self.election_deadline
        };
        if self.role == Role::Leader {
            deadline = deadline.min(self.ping_deadline);
        }
        deadline
    }

    // ---------------- the log and durability ----------------

    /// Append an entry and its record. On a storage error the in-memory
    /// append is rolled back and every further append this term fails too:
    /// a hole in the record stream would break log contiguity.
    fn write_entry(&mut self, entry: LogEntry) -> Result<LogIndex> {
        if self.write_failed_term == Some(self.current_term) {
            return Err(RegattaError::StickyWrite(self.current_term));
        }
        let index = self.log.log_end();
        let record = LogRecord::entry(index, &entry);
        self.log.append(entry);
        if let Err(err) = self.storage.append(&record) {
            self.log.truncate(index);
            self.write_failed_term = Some(self.current_term);
            return Err(err);
        }
        Ok(index)
    }

    fn waiters_run(&mut self, committed: u64) {
        loop {
            match self.waiters.front() {
                Some(waiter) if waiter.seqno <= committed => {}
                _ => break,
            }
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            match waiter.kind {
                WaiterKind::Command { index } => {
                    self.update_match_index(self.sid, index);
                }
                WaiterKind::Append { meta } => {
                    self.send_append_reply(meta, true);
                }
                WaiterKind::Vote => {
                    self.vote_waiter_pending = false;
                    if let Some(vote) = self.voted_for {
                        if vote != self.sid {
                            self.send(
                                vote,
                                Message::VoteReply(VoteReply {
                                    term: self.current_term,
                                    vote_granted: true,
                                }),
                            );
                        }
                    }
                }
            }
        }
    }

    // ---------------- elections ----------------

    fn handle_vote_request(&mut self, from: ServerId, rq: VoteRequest) {
        if let Some(granted) = self.consider_vote(from, &rq) {
            self.send(
                from,
                Message::VoteReply(VoteReply {
                    term: self.current_term,
                    vote_granted: granted,
                }),
            );
        }
    }

    /// Decide on a vote request. `None` means no reply now: either the
    /// grant awaits durability, or a previous grant does (never grant
    /// twice in a term).
    fn consider_vote(&mut self, from: ServerId, rq: &VoteRequest) -> Option<bool> {
        if !self.receive_term(rq.term) {
            return Some(false);
        }
        if self.vote_waiter_pending {
            return None;
        }
        match self.voted_for {
            Some(vote) if vote == from => return Some(true), // resend
            Some(_) => return Some(false),
            None => {}
        }
        if !self.log.is_up_to_date(rq.last_log_index, rq.last_log_term) {
            return Some(false);
        }

        self.voted_for = Some(from);
        if let Err(err) = self
            .storage
            .append(&LogRecord::state(self.current_term, Some(from)))
        {
            // An unpersistable grant is no grant; the timer fires again.
            warn!(error = %err, "failed to persist vote");
            self.voted_for = None;
            return None;
        }
        self.reset_election_timer();
        let seqno = self.durability.request();
        self.waiters.push_back(Waiter {
            seqno,
            kind: WaiterKind::Vote,
        });
        self.vote_waiter_pending = true;
        None
    }

    fn handle_vote_reply(&mut self, from: ServerId, rpy: VoteReply) {
        if !self.receive_term(rpy.term) {
            return;
        }
        if self.role != Role::Candidate || from == self.sid {
            return;
        }
        if self.servers.contains(from) {
            self.accept_vote(from, rpy.vote_granted);
        }
    }

    // ---------------- replication: follower side ----------------

    fn handle_append_request(&mut self, from: ServerId, rq: AppendRequest) {
        // We accept AppendEntries from a leader outside our latest
        // configuration: a new server must accept the entries that
        // precede the configuration entry adding it.
        if !self.receive_term(rq.term) {
            self.send_append_reply(AppendMeta::of(&rq, from), false);
            return;
        }
        if self.role == Role::Candidate {
            // Someone else won this term.
            self.become_follower();
        }
        self.reset_election_timer();
        self.leader = Some(rq.leader_sid);

        match self.splice(&rq) {
            Splice::Reject => self.send_append_reply(AppendMeta::of(&rq, from), false),
            Splice::Accept => self.send_append_reply(AppendMeta::of(&rq, from), true),
            Splice::Pending => {
                let seqno = self.durability.request();
                self.waiters.push_back(Waiter {
                    seqno,
                    kind: WaiterKind::Append {
                        meta: AppendMeta::of(&rq, from),
                    },
                });
            }
        }
    }

    /// Align the request with our snapshot prefix, then run the
    /// consistency check and splice.
    ///
    /// The common case has every entry at `log_start` or above. A request
    /// may instead lie entirely below the snapshot (it concerns committed,
    /// discarded data: vacuously fine), end exactly at the snapshot
    /// sentinel (only the terms can be compared), or straddle it (trim the
    /// prefix, keeping the entry at the sentinel for term validation).
    fn splice(&mut self, rq: &AppendRequest) -> Splice {
        let first_entry_index = rq.prev_log_index + 1;
        let nth_entry_index = rq.prev_log_index + rq.entries.len() as u64;

        if first_entry_index >= self.log.log_start() {
            return self.append_entries(rq.prev_log_index, rq.prev_log_term, &rq.entries);
        }

        if nth_entry_index < self.log.log_start() - 1 {
            return Splice::Accept;
        }

        if nth_entry_index == self.log.log_start() - 1 {
            let ok = match rq.entries.last() {
                Some(entry) => entry.term == self.log.prev_term(),
                None => rq.prev_log_term == self.log.prev_term(),
            };
            return if ok { Splice::Accept } else { Splice::Reject };
        }

        let ofs = (self.log.log_start() - first_entry_index) as usize;
        let prev_log_term = rq.entries[ofs - 1].term;
        self.append_entries(self.log.log_start() - 1, prev_log_term, &rq.entries[ofs..])
    }

    fn append_entries(
        &mut self,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: &[LogEntry],
    ) -> Splice {
        // Consistency check: the entry just before the new ones must match.
        if prev_log_index < self.log.prev_index() {
            return Splice::Reject; // stale
        } else if prev_log_index == self.log.prev_index() {
            if prev_log_term != self.log.prev_term() {
                return Splice::Reject;
            }
        } else if prev_log_index < self.log.log_end() {
            if self.log.term_at(prev_log_index) != Some(prev_log_term) {
                return Splice::Reject;
            }
        } else {
            return Splice::Reject; // gap past our log end
        }

        // Skip entries we already have; a conflicting term truncates the
        // suffix. Committed entries are never in conflict: a majority
        // holds them (Log Matching).
        let mut i = 0usize;
        let mut servers_changed = false;
        loop {
            if i >= entries.len() {
                return Splice::Accept; // nothing new
            }
            let index = prev_log_index + 1 + i as u64;
            if index >= self.log.log_end() {
                break;
            }
            if self.log.term_at(index) != Some(entries[i].term) {
                debug_assert!(index > self.commit_index);
                if self.log.truncate(index) {
                    servers_changed = true;
                }
                break;
            }
            i += 1;
        }

        let mut failed = false;
        for entry in &entries[i..] {
            let is_servers = entry.payload.is_servers();
            if let Err(err) = self.write_entry(entry.clone()) {
                warn!(error = %err, "failed to append replicated entry");
                failed = true;
                break;
            }
            if is_servers {
                servers_changed = true;
            }
        }
        if servers_changed {
            self.refresh_servers_from_log();
        }
        if failed {
            Splice::Reject
        } else {
            Splice::Pending
        }
    }

    fn send_append_reply(&mut self, meta: AppendMeta, success: bool) {
        if success && meta.leader_commit > self.commit_index {
            let new_commit = meta
                .leader_commit
                .min(meta.prev_log_index + meta.n_entries);
            if new_commit > self.commit_index {
                self.update_commit_index(new_commit);
            }
        }
        let reply = AppendReply {
            term: self.current_term,
            log_end: self.log.log_end(),
            prev_log_index: meta.prev_log_index,
            prev_log_term: meta.prev_log_term,
            n_entries: meta.n_entries,
            success,
        };
        self.send(meta.from, Message::AppendReply(reply));
    }

    // ---------------- replication: leader side ----------------

    fn peer(&self, sid: ServerId) -> Option<&Server> {
        if sid == self.sid {
            return None;
        }
        self.servers.get(sid).or_else(|| self.add_servers.get(sid))
    }

    fn peer_mut(&mut self, sid: ServerId) -> Option<&mut Server> {
        if sid == self.sid {
            return None;
        }
        if self.servers.contains(sid) {
            self.servers.get_mut(sid)
        } else {
            self.add_servers.get_mut(sid)
        }
    }

    fn peer_address(&self, sid: ServerId) -> Option<String> {
        self.servers
            .get(sid)
            .map(|s| s.address.clone())
            .or_else(|| self.add_servers.get(sid).map(|s| s.address.clone()))
            .or_else(|| {
                self.remove_server
                    .as_ref()
                    .filter(|s| s.sid == sid)
                    .map(|s| s.address.clone())
            })
    }

    fn send_heartbeats(&mut self) {
        for sid in self.servers.sids() {
            if sid != self.sid {
                self.send_append_entries(sid, 0);
            }
        }
        self.ping_deadline = Instant::now() + self.options.heartbeat_interval;
    }

    fn send_append_entries(&mut self, to: ServerId, n: usize) {
        let Some(peer) = self.peer(to) else { return };
        let next_index = peer.next_index;
        if next_index < self.log.log_start() {
            self.send_install_snapshot(to, 0);
            return;
        }
        let prev_log_index = next_index - 1;
        let Some(prev_log_term) = self.log.term_at(prev_log_index) else {
            debug!(peer = %to.short(), next_index, "peer beyond our log; skipping append");
            return;
        };
        let entries = if n == 0 {
            Vec::new()
        } else {
            self.log.entries_from(next_index, n)
        };
        let rq = AppendRequest {
            term: self.current_term,
            leader_sid: self.sid,
            prev_log_index,
            prev_log_term,
            leader_commit: self.commit_index,
            entries,
        };
        self.send(to, Message::AppendRequest(rq));
    }

    fn handle_append_reply(&mut self, from: ServerId, rpy: AppendReply) {
        if !self.receive_term(rpy.term) {
            return;
        }
        if self.role != Role::Leader {
            debug!("append reply while not leader");
            return;
        }
        // Replies come from configured peers and from servers still being
        // added.
        if self.peer(from).is_none() {
            debug!(peer = %from.short(), "append reply from unknown server");
            return;
        }

        if rpy.success {
            let min_index = rpy.prev_log_index + rpy.n_entries + 1;
            if let Some(server) = self.peer_mut(from) {
                if server.next_index < min_index {
                    server.next_index = min_index;
                }
            }
            self.update_match_index(from, min_index - 1);
        } else if let Some(server) = self.peer_mut(from) {
            // Back off; the follower's log end caps the retry point.
            if server.next_index > 1 {
                server.next_index = (server.next_index - 1).min(rpy.log_end);
            }
        }

        let Some(peer) = self.peer(from) else { return };
        let next_index = peer.next_index;
        let phase = peer.phase;
        if next_index < self.log.log_start() {
            self.send_install_snapshot(from, 0);
        } else if next_index < self.log.log_end() {
            self.send_append_entries(from, 1);
        } else if phase == Phase::Catchup {
            if let Some(server) = self.peer_mut(from) {
                server.phase = Phase::CaughtUp;
            }
            self.run_reconfigure();
        }
    }

    fn update_match_index(&mut self, sid: ServerId, min_index: LogIndex) {
        if self.role != Role::Leader {
            return;
        }
        {
            let server = if self.servers.contains(sid) {
                self.servers.get_mut(sid)
            } else {
                self.add_servers.get_mut(sid)
            };
            let Some(server) = server else { return };
            if server.match_index >= min_index {
                return;
            }
            server.match_index = min_index;
        }

        // Find the highest current-term index replicated on a majority of
        // the configured servers. The scan must not stop at the first
        // index missing a majority: an entry from an older term commits
        // only as a side effect of a later current-term entry.
        let mut target = None;
        let start = (self.commit_index + 1).max(self.log.log_start());
        for n in start..self.log.log_end() {
            if self.log.term_at(n) == Some(self.current_term) {
                let count = self.servers.iter().filter(|s| s.match_index >= n).count();
                if self.servers.is_majority(count) {
                    target = Some(n);
                }
            }
        }
        if let Some(n) = target {
            if n > self.commit_index {
                debug!(commit_index = n, "majority replicated, committing");
                self.update_commit_index(n);
            }
        }
    }

    fn update_commit_index(&mut self, new_commit_index: LogIndex) {
        debug_assert!(new_commit_index >= self.commit_index);
        self.commit_index = new_commit_index;

        while self.commit_index > self.last_applied {
            self.last_applied += 1;
            let index = self.last_applied;
            let Some(entry) = self.log.entry(index) else {
                debug_assert!(false, "applied index outside the log");
                break;
            };
            let payload = entry.payload.clone();
            debug!(index, "applying log entry");

            let is_servers = payload.is_servers();
            if let EntryPayload::Data { data, eid } = payload {
                self.applied_eid = eid;
                self.delivery.push_back(NextEntry {
                    data,
                    eid,
                    is_snapshot: false,
                });
            }
            if self.role == Role::Leader {
                if let Some(completer) = self.commands.remove(&index) {
                    completer.complete(CommandStatus::Success);
                }
                if is_servers {
                    self.run_reconfigure();
                }
            }
        }
    }

    // ---------------- commands ----------------

    fn execute_data(&mut self, data: Vec<u8>, prereq: Option<Uuid>) -> Command {
        let eid = Uuid::new_v4();
        if self.role == Role::Leader {
            if let Some(prereq) = prereq {
                if prereq != self.log.last_eid() {
                    let (command, completer) = command_pair(self.log.log_end(), eid);
                    completer.complete(CommandStatus::BadPrereq);
                    return command;
                }
            }
        }
        self.submit(EntryPayload::Data {
            data: Arc::new(data),
            eid,
        })
    }

    fn submit(&mut self, payload: EntryPayload) -> Command {
        let eid = match &payload {
            EntryPayload::Data { eid, .. } => *eid,
            EntryPayload::Servers { .. } => Uuid::nil(),
        };
        let index = self.log.log_end();
        let (command, completer) = command_pair(index, eid);

        if self.role != Role::Leader {
            completer.complete(CommandStatus::NotLeader);
            return command;
        }
        if self.shutdown {
            completer.complete(CommandStatus::ShutDown);
            return command;
        }

        let is_servers = matches!(payload, EntryPayload::Servers { .. });
        let entry = LogEntry {
            term: self.current_term,
            payload,
        };
        match self.write_entry(entry) {
            Ok(index) => {
                self.commands.insert(index, completer);
                let seqno = self.durability.request();
                self.waiters.push_back(Waiter {
                    seqno,
                    kind: WaiterKind::Command { index },
                });
                // A logged configuration takes effect right away, commit
                // or no commit.
                if is_servers {
                    self.refresh_servers_from_log();
                }
            }
            Err(err) => {
                warn!(error = %err, "could not append command; stepping down");
                completer.complete(CommandStatus::LostLeadership);
                self.become_follower();
                return command;
            }
        }

        // Push the entry right away to peers already at the tip; everyone
        // else is paced by their replies.
        let tip = self.log.log_end() - 1;
        for sid in self.servers.sids() {
            if sid == self.sid {
                continue;
            }
            if self.servers.get(sid).map(|s| s.next_index) == Some(tip) {
                self.send_append_entries(sid, 1);
                if let Some(server) = self.servers.get_mut(sid) {
                    server.next_index += 1;
                }
            }
        }
        command
    }

    fn complete_all_commands(&mut self, status: CommandStatus) {
        for (_, completer) in self.commands.drain() {
            completer.complete(status);
        }
    }

    // ---------------- membership ----------------

    fn refresh_servers_from_log(&mut self) {
        let config = self.log.latest_config();
        self.servers.apply_config(&config, self.log.log_end());
        if self.joining && config.contains_key(&self.sid) {
            info!("now in the cluster configuration");
            self.joining = false;
            self.registry.clear_pending();
        }
    }

    fn leader_hint(&self) -> (Option<String>, Option<ServerId>) {
        let Some(leader) = self.leader else {
            return (None, None);
        };
        let address = if leader == self.sid {
            Some(self.local_address.clone())
        } else {
            self.servers.get(leader).map(|s| s.address.clone())
        };
        (address, Some(leader))
    }

    fn send_server_reply(&mut self, to: Option<ServerId>, remove: bool, status: ServerStatus) {
        let Some(to) = to else { return };
        let (leader_address, leader_sid) = self.leader_hint();
        let reply = ServerReply {
            status,
            leader_address,
            leader_sid,
        };
        let message = if remove {
            Message::RemoveServerReply(reply)
        } else {
            Message::AddServerReply(reply)
        };
        self.send(to, message);
    }

    fn handle_add_server_request(&mut self, from: ServerId, rq: ServerRequest) {
        if let Some(status) = self.consider_add_server(from, &rq) {
            info!(server = %rq.sid.short(), status = %status, "add server");
            self.send_server_reply(Some(from), false, status);
        }
    }

    fn consider_add_server(&mut self, from: ServerId, rq: &ServerRequest) -> Option<ServerStatus> {
        if self.role != Role::Leader {
            return Some(ServerStatus::NotLeader);
        }

        if let Some(existing) = self.servers.get(rq.sid) {
            let (phase, reply_to) = (existing.phase, existing.reply_to);
            // A scheduled removal is canceled by adding the server back.
            if phase == Phase::Remove {
                if let Some(server) = self.servers.get_mut(rq.sid) {
                    server.phase = Phase::Stable;
                    server.reply_to = None;
                }
                self.send_server_reply(reply_to, true, ServerStatus::Canceled);
                return Some(ServerStatus::Ok);
            }
            if phase != Phase::Stable {
                return Some(ServerStatus::InProgress);
            }
            return Some(ServerStatus::NoOp);
        }

        if self
            .remove_server
            .as_ref()
            .is_some_and(|s| s.sid == rq.sid)
        {
            return Some(ServerStatus::Committing);
        }
        if self.add_servers.contains(rq.sid) {
            return Some(ServerStatus::InProgress);
        }

        let Some(address) = rq.address.clone() else {
            warn!(server = %rq.sid.short(), "add server request without address");
            return None;
        };
        if let Err(err) = Address::parse(&address) {
            warn!(server = %rq.sid.short(), error = %err, "bad address in add server request");
            return None;
        }

        let mut server = Server::new(rq.sid, address);
        server.init_leader(self.log.log_end());
        server.phase = Phase::Catchup;
        server.reply_to = Some(from);
        self.add_servers.insert(server);
        info!(server = %rq.sid.short(), "adding server, starting catch-up");

        // Start (or resume) populating the new server's log. For a fresh
        // server this degenerates into an InstallSnapshot followed by
        // AppendEntries; a retry of an interrupted add resumes where it
        // left off.
        self.send_append_entries(rq.sid, 0);
        None
    }

    fn handle_add_server_reply(&mut self, _from: ServerId, rpy: ServerReply) {
        if !self.joining {
            return;
        }
        match rpy.status {
            ServerStatus::Ok => {
                if self.servers.contains(self.sid) {
                    info!("join complete");
                    self.joining = false;
                    self.registry.clear_pending();
                }
            }
            ServerStatus::NotLeader => {
                if let Some(address) = rpy.leader_address {
                    debug!(leader = %address, "redirecting join to leader");
                    let transport = Arc::clone(&self.transport);
                    self.registry.ensure_pending(&address, transport.as_ref());
                    self.send_join_request(&address);
                }
            }
            other => debug!(status = %other, "join attempt refused"),
        }
    }

    fn handle_remove_server_request(&mut self, from: ServerId, rq: ServerRequest) {
        if let Some(status) = self.consider_remove_server(from, &rq) {
            info!(server = %rq.sid.short(), status = %status, "remove server");
            self.send_server_reply(Some(from), true, status);
        }
    }

    fn consider_remove_server(
        &mut self,
        from: ServerId,
        rq: &ServerRequest,
    ) -> Option<ServerStatus> {
        if self.role != Role::Leader {
            return Some(ServerStatus::NotLeader);
        }
        if rq.sid == self.sid {
            // Removing the leader takes a leadership transfer first.
            warn!("refusing to remove ourselves from the cluster");
            return Some(ServerStatus::NoOp);
        }

        // Removing a server still being added cancels the addition.
        if let Some(target) = self.add_servers.remove(rq.sid) {
            self.send_server_reply(target.reply_to, false, ServerStatus::Canceled);
            return Some(ServerStatus::Ok);
        }

        let Some(target) = self.servers.get(rq.sid) else {
            return Some(ServerStatus::NoOp);
        };
        match target.phase {
            Phase::Committing => return Some(ServerStatus::Committing),
            Phase::Remove => return Some(ServerStatus::InProgress),
            Phase::Stable | Phase::Catchup | Phase::CaughtUp => {}
        }

        // At least one server must survive. Pending additions don't
        // count; they could still fail.
        let remaining = self
            .servers
            .iter()
            .filter(|s| s.sid != rq.sid && s.phase != Phase::Remove)
            .count();
        if remaining == 0 {
            return Some(ServerStatus::Empty);
        }

        if let Some(target) = self.servers.get_mut(rq.sid) {
            target.phase = Phase::Remove;
            target.reply_to = Some(from);
        }
        self.run_reconfigure();
        None
    }

    fn handle_remove_server_reply(&mut self, _from: ServerId, rpy: ServerReply) {
        info!(status = %rpy.status, "remove server reply");
    }

    /// The reconfiguration driver. Runs whenever the commit index crosses
    /// a configuration entry or a catch-up completes; at most one
    /// configuration change is ever in flight.
    fn run_reconfigure(&mut self) {
        debug_assert!(self.role == Role::Leader);

        // Reconfiguration only progresses when configuration changes
        // commit.
        if self.log.has_uncommitted_config(self.commit_index) {
            return;
        }

        // Whatever was waiting for a configuration commit is done now.
        let committed: Vec<(ServerId, Option<ServerId>)> = self
            .servers
            .iter()
            .filter(|s| s.phase == Phase::Committing)
            .map(|s| (s.sid, s.reply_to))
            .collect();
        for (sid, reply_to) in committed {
            if let Some(server) = self.servers.get_mut(sid) {
                server.phase = Phase::Stable;
                server.reply_to = None;
            }
            info!(server = %sid.short(), "server addition committed");
            self.send_server_reply(reply_to, false, ServerStatus::Ok);
        }
        if let Some(removed) = self.remove_server.take() {
            info!(server = %removed.sid.short(), "server removal committed");
            // The acknowledgement goes out over whatever session is left,
            // then the removed server's session is dropped.
            self.send_server_reply(removed.reply_to, true, ServerStatus::Ok);
            self.registry.remove(removed.sid);
        }

        // Promote one caught-up server into the configuration.
        let caught_up = self
            .add_servers
            .iter()
            .find(|s| s.phase == Phase::CaughtUp)
            .map(|s| s.sid);
        if let Some(sid) = caught_up {
            if let Some(mut server) = self.add_servers.remove(sid) {
                server.phase = Phase::Committing;
                self.servers.insert(server);
            }
            info!(server = %sid.short(), "logging configuration with added server");
            let servers = self.servers.to_config();
            let _ = self.submit(EntryPayload::Servers { servers });
            return;
        }

        // Or schedule one removal. The new configuration must be logged:
        // leader completeness is defined against the newest configuration.
        let to_remove = self
            .servers
            .iter()
            .find(|s| s.phase == Phase::Remove)
            .map(|s| s.sid);
        if let Some(sid) = to_remove {
            if let Some(server) = self.servers.remove(sid) {
                self.remove_server = Some(server);
            }
            info!(server = %sid.short(), "logging configuration without removed server");
            let servers = self.servers.to_config();
            let _ = self.submit(EntryPayload::Servers { servers });
        }
    }

    // ---------------- snapshots ----------------

    /// Size of the snapshot chunk at `offset`: capped, and never splitting
    /// a multi-byte codepoint when the snapshot is UTF-8 text.
    fn snapshot_chunk_at(&self, offset: usize) -> usize {
        let snapshot = self.log.snapshot();
        if offset >= snapshot.len() {
            return 0;
        }
        let mut chunk = self.options.snapshot_chunk_size.min(snapshot.len() - offset);
        if self.log.snapshot_is_text() {
            while chunk > 0
                && offset + chunk < snapshot.len()
                && (snapshot[offset + chunk] & 0xc0) == 0x80
            {
                chunk -= 1;
            }
        }
        chunk
    }

    fn send_install_snapshot(&mut self, to: ServerId, offset: u64) {
        let offset = offset as usize;
        let chunk = self.snapshot_chunk_at(offset);
        let snapshot = Arc::clone(self.log.snapshot());
        let rq = InstallSnapshotRequest {
            term: self.current_term,
            last_index: self.log.prev_index(),
            last_term: self.log.prev_term(),
            last_eid: self.log.prev_eid(),
            last_servers: self.log.prev_servers().clone(),
            length: snapshot.len() as u64,
            offset: offset as u64,
            data: snapshot[offset..offset + chunk].to_vec(),
        };
        self.send(to, Message::InstallSnapshotRequest(rq));
    }

    fn handle_install_snapshot_request(&mut self, from: ServerId, rq: InstallSnapshotRequest) {
        self.install_snapshot(from, &rq);
        let reply = InstallSnapshotReply {
            term: self.current_term,
            last_index: rq.last_index,
            last_term: rq.last_term,
            next_offset: rq.offset + rq.data.len() as u64,
        };
        self.send(from, Message::InstallSnapshotReply(reply));
    }

    fn install_snapshot(&mut self, from: ServerId, rq: &InstallSnapshotRequest) {
        if !self.receive_term(rq.term) {
            return;
        }
        if self.role == Role::Candidate {
            self.become_follower();
        }
        self.reset_election_timer();
        self.leader = Some(from);

        // Chunks accumulate in order; a chunk at the current buffer
        // length resumes, anything else is discarded.
        let offset = rq.offset as usize;
        self.snapshot_buf.truncate(offset);
        if self.snapshot_buf.len() == offset {
            self.snapshot_buf.extend_from_slice(&rq.data);
        }
        if self.snapshot_buf.len() as u64 != rq.length {
            return; // more chunks to come
        }

        let data = std::mem::take(&mut self.snapshot_buf);
        if !self.log.install_snapshot(
            rq.last_index,
            rq.last_term,
            rq.last_eid,
            rq.last_servers.clone(),
            data,
        ) {
            debug!("snapshot covers less than ours; ignoring");
            return;
        }
        info!(
            last_index = rq.last_index,
            last_term = rq.last_term,
            "installed snapshot"
        );

        if rq.last_index > self.commit_index {
            self.commit_index = rq.last_index;
        }
        if self.commit_index > self.last_applied {
            self.last_applied = self.commit_index;
            self.applied_eid = rq.last_eid;
            // The application restarts from the snapshot image.
            self.delivery.clear();
            self.delivery.push_back(NextEntry {
                data: Arc::clone(self.log.snapshot()),
                eid: rq.last_eid,
                is_snapshot: true,
            });
        }
        self.refresh_servers_from_log();

        if let Err(err) = self.save_snapshot() {
            warn!(error = %err, "could not save installed snapshot");
        }
    }

    fn handle_install_snapshot_reply(&mut self, from: ServerId, rpy: InstallSnapshotReply) {
        if !self.receive_term(rpy.term) {
            return;
        }
        if self.peer(from).is_none() {
            debug!(peer = %from.short(), "snapshot reply from unknown server");
            return;
        }

        if rpy.last_index != self.log.prev_index() || rpy.last_term != self.log.prev_term() {
            info!(
                peer = %from.short(),
                "peer installed an out-of-date snapshot, starting over"
            );
            self.send_install_snapshot(from, 0);
            return;
        }

        let length = self.log.snapshot().len() as u64;
        if rpy.next_offset < length {
            self.send_install_snapshot(from, rpy.next_offset);
            return;
        }
        if rpy.next_offset == length {
            info!(
                peer = %from.short(),
                last_index = rpy.last_index,
                "snapshot installed on peer"
            );
        } else {
            warn!(peer = %from.short(), "peer reported overlength snapshot");
        }
        let log_end = self.log.log_end();
        if let Some(server) = self.peer_mut(from) {
            server.next_index = log_end;
        }
        self.send_append_entries(from, 0);
    }

    fn save_snapshot(&mut self) -> Result<()> {
        let Some(cid) = self.cid else {
            return Err(RegattaError::NotInitialized(
                self.storage.path().display().to_string(),
            ));
        };
        let records = snapshot_records(
            cid,
            self.sid,
            &self.log,
            self.current_term,
            self.voted_for,
        )?;
        self.storage.replace(|file| {
            for record in &records {
                file.append(record)?;
            }
            Ok(())
        })?;
        self.header_written = true;
        self.durability.retarget(self.storage.sync_handle());
        self.durability.request();
        Ok(())
    }

    fn store_snapshot(&mut self, data: Vec<u8>) -> Result<()> {
        let new_start = self.last_applied + 1;
        let Some(prev_term) = self.log.term_at(self.last_applied) else {
            return Err(RegattaError::NotSupported(
                "snapshot point outside the log",
            ));
        };
        let prev_servers = self.log.config_at(self.last_applied);
        self.log.compact(
            new_start,
            prev_term,
            self.applied_eid,
            prev_servers,
            Arc::new(data),
        );
        self.save_snapshot()
    }

    // ---------------- sessions and sending ----------------

    fn send(&mut self, to: ServerId, message: Message) {
        if to == self.sid {
            warn!("attempting to send RPC to self; dropping");
            return;
        }
        let envelope = Envelope {
            to: Some(to),
            from: self.sid,
            cluster: self.cid,
            message,
        };
        if let Some(address) = self.peer_address(to) {
            let transport = Arc::clone(&self.transport);
            self.registry.ensure(to, &address, transport.as_ref());
        }
        if !self.registry.send_to(to, &envelope) {
            debug!(
                peer = %to.short(),
                kind = envelope.message.kind(),
                "no connection, dropping RPC"
            );
        }
    }

    fn send_join_request(&mut self, address: &str) {
        let envelope = Envelope {
            to: None,
            from: self.sid,
            cluster: self.cid,
            message: Message::AddServerRequest(ServerRequest {
                sid: self.sid,
                address: Some(self.local_address.clone()),
            }),
        };
        self.registry.send_pending(address, &envelope);
    }

    fn tick_sessions(&mut self) {
        if self.shutdown {
            return;
        }
        let mut peers: Vec<(ServerId, String)> = self
            .servers
            .iter()
            .filter(|s| s.sid != self.sid)
            .map(|s| (s.sid, s.address.clone()))
            .collect();
        peers.extend(
            self.add_servers
                .iter()
                .map(|s| (s.sid, s.address.clone())),
        );
        for (sid, address) in peers {
            let transport = Arc::clone(&self.transport);
            self.registry.ensure(sid, &address, transport.as_ref());
        }

        for sid in self.registry.reconnected() {
            if !self.joining {
                self.send(sid, Message::Hello);
            }
        }
        if self.joining {
            for address in self.registry.pending_reconnected() {
                self.send_join_request(&address);
            }
        }
    }

    fn close(&mut self) {
        if self.shutdown {
            return;
        }
        self.shutdown = true;
        info!("shutting down");
        self.complete_all_commands(CommandStatus::ShutDown);
        self.waiters.clear();
        self.durability.shutdown();
        self.registry.clear();
    }
}

impl Drop for RaftInner {
    fn drop(&mut self) {
        self.close();
    }
}
