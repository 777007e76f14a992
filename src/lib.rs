//! Regatta is a Raft consensus engine for a replicated configuration
//! database: a small cluster of servers (typically 3 to 7) maintaining a
//! strongly-consistent, linearizable command log.
//!
//! The engine implements leader election, log replication, commit-index
//! advancement, single-server membership change, snapshot-based log
//! compaction, and a crash-safe persistence protocol over an append-only
//! cluster log. It does not carry its own wire transport or application
//! state machine: the host supplies sessions through the [`Transport`]
//! contract, feeds inbound messages to [`Raft::deliver`] (or the channel
//! behind [`Raft::run`]), and consumes committed entries in log order via
//! [`Raft::next_entry`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use regatta::{Raft, RaftOptions};
//!
//! # fn transport() -> Arc<dyn regatta::Transport> { unimplemented!() }
//! # fn main() -> regatta::Result<()> {
//! Raft::create_cluster("cluster.db", "tcp:10.0.0.1:6641", b"{}")?;
//! let raft = Raft::open("cluster.db", transport(), RaftOptions::default())?;
//!
//! let mut command = raft.execute(b"set a 1".to_vec(), None);
//! # let _ = &mut command;
//! // ... drive raft.run() and await command.wait() ...
//! # Ok(())
//! # }
//! ```

// Panics can break consensus; propagate errors instead.
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod command;
pub mod config;
pub mod durability;
pub mod error;
pub mod log;
pub mod membership;
pub mod node;
pub mod rpc;
pub mod session;
pub mod storage;
pub mod types;

pub use command::{Command, CommandStatus};
pub use config::RaftOptions;
pub use error::{RegattaError, Result};
pub use log::{EntryPayload, LogEntry, RaftLog};
pub use membership::{Phase, Server, ServerConfig, ServerMap};
pub use node::{ClusterMetadata, NextEntry, Raft, Role};
pub use rpc::{Envelope, Message, ServerStatus};
pub use session::{Session, SessionRegistry, Transport};
pub use types::{Address, ClusterId, LogIndex, ServerId, Term, DEFAULT_PORT};
