//! RPC message definitions and the common envelope.
//!
//! Every message travels in an [`Envelope`] carrying the destination server
//! (`to`), the sender (`from`), and the cluster id. Requests and replies are
//! independent one-way messages: a reply is simply another envelope sent
//! back, possibly much later (for example, after a durability barrier).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{RegattaError, Result};
use crate::log::LogEntry;
use crate::membership::ServerConfig;
use crate::types::{ClusterId, LogIndex, ServerId, Term};

/// The common envelope around every RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Receiver. Optional only on Hello and AddServer requests, where the
    /// sender may not know its peer yet.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<ServerId>,
    /// Sender, learned by the receiver on first contact.
    pub from: ServerId,
    /// Cluster id. Optional only on Hello and AddServer requests; adopted
    /// by a receiver that has none, otherwise it must match.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterId>,
    #[serde(flatten)]
    pub message: Message,
}

impl Envelope {
    /// Validate the envelope against our own identity.
    ///
    /// Returns the cluster id to adopt, if the envelope taught us one.
    /// Errors are protocol violations; the caller drops the message.
    pub fn validate(
        &self,
        us: ServerId,
        cluster: Option<ClusterId>,
    ) -> Result<Option<ClusterId>> {
        let exempt = matches!(
            self.message,
            Message::Hello | Message::AddServerRequest(_)
        );

        let mut learned = None;
        match (self.cluster, cluster) {
            (Some(theirs), Some(ours)) if theirs != ours => {
                return Err(RegattaError::ClusterMismatch {
                    expected: ours,
                    actual: theirs,
                });
            }
            (Some(theirs), None) => learned = Some(theirs),
            (None, _) if !exempt => {
                return Err(RegattaError::Rpc("missing cluster id".to_string()));
            }
            _ => {}
        }

        match self.to {
            Some(to) if to != us => {
                return Err(RegattaError::Misrouted { to, us });
            }
            None if !exempt => {
                return Err(RegattaError::Rpc("missing destination".to_string()));
            }
            _ => {}
        }

        Ok(learned)
    }
}

/// All RPCs exchanged between servers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum Message {
    /// Introduces the sender on a fresh connection.
    Hello,
    AppendRequest(AppendRequest),
    AppendReply(AppendReply),
    VoteRequest(VoteRequest),
    VoteReply(VoteReply),
    AddServerRequest(ServerRequest),
    AddServerReply(ServerReply),
    RemoveServerRequest(ServerRequest),
    RemoveServerReply(ServerReply),
    InstallSnapshotRequest(InstallSnapshotRequest),
    InstallSnapshotReply(InstallSnapshotReply),
}

impl Message {
    /// Wire name, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello => "hello",
            Message::AppendRequest(_) => "append_request",
            Message::AppendReply(_) => "append_reply",
            Message::VoteRequest(_) => "vote_request",
            Message::VoteReply(_) => "vote_reply",
            Message::AddServerRequest(_) => "add_server_request",
            Message::AddServerReply(_) => "add_server_reply",
            Message::RemoveServerRequest(_) => "remove_server_request",
            Message::RemoveServerReply(_) => "remove_server_reply",
            Message::InstallSnapshotRequest(_) => "install_snapshot_request",
            Message::InstallSnapshotReply(_) => "install_snapshot_reply",
        }
    }
}

/// AppendEntries request (leader to follower). `entries[i]` is for index
/// `prev_log_index + 1 + i`. A heartbeat has no entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendRequest {
    /// Leader's term.
    pub term: Term,
    /// So followers can redirect clients.
    pub leader_sid: ServerId,
    /// Log entry just before the new ones.
    pub prev_log_index: LogIndex,
    /// Term of the `prev_log_index` entry.
    pub prev_log_term: Term,
    /// Leader's commit index.
    pub leader_commit: LogIndex,
    pub entries: Vec<LogEntry>,
}

/// AppendEntries reply (follower to leader).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendReply {
    /// Current term, for the leader to update itself.
    pub term: Term,
    /// The follower's log end, to let the leader cap `next_index`.
    pub log_end: LogIndex,
    /// Copied from the request.
    pub prev_log_index: LogIndex,
    /// Copied from the request.
    pub prev_log_term: Term,
    /// Copied from the request.
    pub n_entries: u64,
    pub success: bool,
}

/// RequestVote (candidate to everyone).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    /// Candidate's term.
    pub term: Term,
    /// Index of the candidate's last log entry.
    pub last_log_index: LogIndex,
    /// Term of the candidate's last log entry.
    pub last_log_term: Term,
}

/// RequestVote reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteReply {
    /// Current term, for the candidate to update itself.
    pub term: Term,
    pub vote_granted: bool,
}

/// AddServer or RemoveServer request (client or joining server to leader).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRequest {
    /// Server to add or remove.
    pub sid: ServerId,
    /// Address, for adds only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// AddServer or RemoveServer reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerReply {
    pub status: ServerStatus,
    /// Leader hint for redirection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader_sid: Option<ServerId>,
}

/// Outcome of a membership-change request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerStatus {
    /// Only the leader can add or remove servers.
    NotLeader,
    /// Nothing to do: target already in (or already absent from) the
    /// configuration.
    NoOp,
    /// An identical operation is already in progress.
    InProgress,
    /// The server was unreachable, or became unreachable partway through
    /// the initial log copy. Retrying resumes where it left off.
    Timeout,
    /// The operation was initiated but this server lost leadership.
    LostLeadership,
    /// Canceled by submission of the opposite operation for the same
    /// server.
    Canceled,
    /// The opposite operation for this server has been logged but not yet
    /// committed; retry once it commits.
    Committing,
    /// Removal refused because the cluster would be left empty (scheduled
    /// or uncommitted additions are not counted; they could still fail).
    Empty,
    #[serde(rename = "success")]
    Ok,
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServerStatus::NotLeader => "not-leader",
            ServerStatus::NoOp => "no-op",
            ServerStatus::InProgress => "in-progress",
            ServerStatus::Timeout => "timeout",
            ServerStatus::LostLeadership => "lost-leadership",
            ServerStatus::Canceled => "canceled",
            ServerStatus::Committing => "committing",
            ServerStatus::Empty => "empty",
            ServerStatus::Ok => "success",
        };
        f.write_str(s)
    }
}

/// One chunk of a snapshot stream (leader to follower).
///
/// Chunks are byte-contiguous: `0 <= offset < offset + chunk <= length`.
/// When the snapshot is valid UTF-8 the chunk boundary never splits a
/// multi-byte codepoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// Leader's term.
    pub term: Term,
    /// The snapshot replaces everything up to and including this index.
    pub last_index: LogIndex,
    /// Term of `last_index`.
    pub last_term: Term,
    /// Entry id as of `last_index`.
    pub last_eid: Uuid,
    /// Membership as of `last_index`.
    pub last_servers: ServerConfig,
    /// Total snapshot length in bytes.
    pub length: u64,
    /// Offset of this chunk.
    pub offset: u64,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Snapshot chunk acknowledgement (follower to leader).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotReply {
    /// Current term, for the leader to update itself.
    pub term: Term,
    /// Repeated from the request.
    pub last_index: LogIndex,
    /// Repeated from the request.
    pub last_term: Term,
    /// Where the leader should resume sending.
    pub next_offset: u64,
}
