//! Cluster membership bookkeeping.
//!
//! A cluster configuration is a map from server ID to address. The engine
//! tracks one [`Server`] record per known server, carrying the leader-side
//! replication state and the membership-change lifecycle [`Phase`].

use std::collections::{BTreeMap, HashMap};

use crate::types::{LogIndex, ServerId};

/// A committed cluster configuration: server ID to address.
pub type ServerConfig = BTreeMap<ServerId, String>;

/// Membership-change lifecycle of one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Not being changed.
    Stable,
    /// Being added: populating the new server's log.
    Catchup,
    /// Being added: waiting for the previous configuration to commit.
    CaughtUp,
    /// Waiting for the new configuration to commit.
    Committing,
    /// Scheduled for removal.
    Remove,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Stable => "stable",
            Phase::Catchup => "catchup",
            Phase::CaughtUp => "caught-up",
            Phase::Committing => "committing",
            Phase::Remove => "remove",
        };
        f.write_str(s)
    }
}

/// One known server and its per-peer state.
#[derive(Debug)]
pub struct Server {
    pub sid: ServerId,
    pub address: String,

    /// Volatile state on candidates: has this server's vote reply been
    /// counted this election?
    pub voted: bool,

    /// Volatile state on leaders: index of the next log entry to send.
    pub next_index: LogIndex,
    /// Volatile state on leaders: highest index known replicated here.
    pub match_index: LogIndex,
    /// Membership-change lifecycle marker.
    pub phase: Phase,
    /// Originator of the AddServer/RemoveServer request, for the reply.
    pub reply_to: Option<ServerId>,
}

impl Server {
    pub fn new(sid: ServerId, address: impl Into<String>) -> Self {
        Self {
            sid,
            address: address.into(),
            voted: false,
            next_index: 0,
            match_index: 0,
            phase: Phase::Stable,
            reply_to: None,
        }
    }

    /// Reinitialize the leader-side replication state for this server.
    pub fn init_leader(&mut self, log_end: LogIndex) {
        self.next_index = log_end;
        self.match_index = 0;
        self.phase = Phase::Stable;
    }
}

/// The set of servers in (or entering) the configuration.
#[derive(Debug, Default)]
pub struct ServerMap {
    servers: HashMap<ServerId, Server>,
}

impl ServerMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn contains(&self, sid: ServerId) -> bool {
        self.servers.contains_key(&sid)
    }

    pub fn get(&self, sid: ServerId) -> Option<&Server> {
        self.servers.get(&sid)
    }

    pub fn get_mut(&mut self, sid: ServerId) -> Option<&mut Server> {
        self.servers.get_mut(&sid)
    }

    pub fn insert(&mut self, server: Server) {
        self.servers.insert(server.sid, server);
    }

    pub fn remove(&mut self, sid: ServerId) -> Option<Server> {
        self.servers.remove(&sid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Server> {
        self.servers.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Server> {
        self.servers.values_mut()
    }

    /// Snapshot of the member IDs, for iteration that mutates the map.
    pub fn sids(&self) -> Vec<ServerId> {
        self.servers.keys().copied().collect()
    }

    /// True if `count` servers are a majority of this configuration.
    pub fn is_majority(&self, count: usize) -> bool {
        count > self.servers.len() / 2
    }

    /// Encode the current membership as a configuration map.
    pub fn to_config(&self) -> ServerConfig {
        self.servers
            .values()
            .map(|s| (s.sid, s.address.clone()))
            .collect()
    }

    /// Reconcile this map against a new configuration, keeping the
    /// bookkeeping of servers that stay.
    ///
    /// Newly added servers start with `voted = true` so that a vote reply
    /// arriving for an election begun under the old configuration is not
    /// double counted.
    pub fn apply_config(&mut self, config: &ServerConfig, log_end: LogIndex) {
        let stale: Vec<ServerId> = self
            .servers
            .keys()
            .copied()
            .filter(|sid| !config.contains_key(sid))
            .collect();
        for sid in stale {
            self.servers.remove(&sid);
            tracing::info!(server = %sid.short(), "server removed from configuration");
        }

        for (sid, address) in config {
            if !self.servers.contains_key(sid) {
                tracing::info!(server = %sid.short(), "server added to configuration");
                let mut server = Server::new(*sid, address.clone());
                server.voted = true;
                server.init_leader(log_end);
                self.servers.insert(*sid, server);
            }
        }
    }
}
