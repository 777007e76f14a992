//! Error types for the Regatta consensus engine.
//!
//! This module provides a unified error type [`RegattaError`] for all engine
//! operations, along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Storage**: I/O failures and corrupt on-disk records. A corrupt record
//!   is fatal when resuming a cluster log; a trailing partial record is not
//!   (it is treated as a crash during append and discarded).
//! - **Protocol**: malformed, misrouted, or wrong-cluster RPCs. These are
//!   absorbed at the receive boundary: the message is dropped and logged,
//!   the session stays up.
//! - **Role**: operations that require leadership submitted elsewhere.
//! - **Lifecycle**: operations against a shut-down or uninitialized engine.

use std::io;
use thiserror::Error;

use crate::types::{ClusterId, ServerId, Term};

/// Main error type for Regatta operations.
#[derive(Error, Debug)]
pub enum RegattaError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{path}: {message}")]
    Corrupt { path: String, message: String },

    #[error("{0}: not a fully initialized cluster log")]
    NotInitialized(String),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("malformed RPC: {0}")]
    Rpc(String),

    #[error("wrong cluster {actual} (expected {expected})")]
    ClusterMismatch {
        expected: ClusterId,
        actual: ClusterId,
    },

    #[error("misrouted message (addressed to {to} but we're {us})")]
    Misrouted { to: ServerId, us: ServerId },

    #[error("not the leader. Leader is: {leader:?}")]
    NotLeader { leader: Option<ServerId> },

    #[error("server does not belong to cluster")]
    NotInCluster,

    #[error("invalid address {address}: {message}")]
    InvalidAddress { address: String, message: String },

    #[error("log write failed in term {0}; refusing further appends this term")]
    StickyWrite(Term),

    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    #[error("engine is shut down")]
    ShutDown,
}

impl RegattaError {
    /// Build a corrupt-record error for the log at `path`.
    pub(crate) fn corrupt(path: &std::path::Path, message: impl Into<String>) -> Self {
        RegattaError::Corrupt {
            path: path.display().to_string(),
            message: message.into(),
        }
    }

    /// True for transient failures that a caller may reasonably retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RegattaError::NotLeader { .. } | RegattaError::Io(_))
    }
}

/// Result type alias for Regatta operations.
pub type Result<T> = std::result::Result<T, RegattaError>;
