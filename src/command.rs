//! Client command handles.
//!
//! `execute` hands back a [`Command`]: a cheap, cloneable handle that
//! resolves once the entry commits (or the attempt fails). Dropping every
//! handle abandons interest in the outcome; the entry itself is unaffected.

use tokio::sync::watch;
use uuid::Uuid;

use crate::types::LogIndex;

/// Outcome of a submitted command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// Still in progress.
    Incomplete,
    /// Committed and applied.
    Success,
    /// This server was not the leader.
    NotLeader,
    /// Leadership was lost before the entry committed. The command may or
    /// may not still commit under the new leader.
    LostLeadership,
    /// The prerequisite entry id did not match the log.
    BadPrereq,
    /// The server shut down before the entry committed.
    ShutDown,
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CommandStatus::Incomplete => "operation still in progress",
            CommandStatus::Success => "success",
            CommandStatus::NotLeader => "not leader",
            CommandStatus::LostLeadership => "lost leadership",
            CommandStatus::BadPrereq => "prerequisite mismatch",
            CommandStatus::ShutDown => "server shutdown",
        };
        f.write_str(s)
    }
}

/// Handle onto one submitted command.
#[derive(Debug, Clone)]
pub struct Command {
    index: LogIndex,
    eid: Uuid,
    status: watch::Receiver<CommandStatus>,
}

impl Command {
    /// The log index the command was (or would have been) appended at.
    pub fn index(&self) -> LogIndex {
        self.index
    }

    /// The entry id, usable as a prerequisite for a follow-up command.
    pub fn eid(&self) -> Uuid {
        self.eid
    }

    /// Current status without blocking.
    pub fn status(&self) -> CommandStatus {
        *self.status.borrow()
    }

    /// Wait until the command leaves [`CommandStatus::Incomplete`].
    pub async fn wait(&mut self) -> CommandStatus {
        loop {
            let status = *self.status.borrow_and_update();
            if status != CommandStatus::Incomplete {
                return status;
            }
            if self.status.changed().await.is_err() {
                return CommandStatus::ShutDown;
            }
        }
    }
}

/// Engine-side completion end of a [`Command`].
#[derive(Debug)]
pub(crate) struct CommandCompleter {
    status: watch::Sender<CommandStatus>,
}

impl CommandCompleter {
    pub(crate) fn complete(&self, status: CommandStatus) {
        debug_assert!(status != CommandStatus::Incomplete);
        let _ = self.status.send(status);
    }
}

/// Create a linked command handle and completer.
pub(crate) fn command_pair(index: LogIndex, eid: Uuid) -> (Command, CommandCompleter) {
    let (tx, rx) = watch::channel(CommandStatus::Incomplete);
    (
        Command {
            index,
            eid,
            status: rx,
        },
        CommandCompleter { status: tx },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        let (cmd, completer) = command_pair(2, Uuid::new_v4());
        assert_eq!(cmd.status(), CommandStatus::Incomplete);
        completer.complete(CommandStatus::Success);
        assert_eq!(cmd.status(), CommandStatus::Success);
    }

    #[tokio::test]
    async fn test_wait_resolves() {
        let (mut cmd, completer) = command_pair(2, Uuid::new_v4());
        let waiter = tokio::spawn(async move { cmd.wait().await });
        completer.complete(CommandStatus::LostLeadership);
        assert_eq!(waiter.await.unwrap(), CommandStatus::LostLeadership);
    }

    #[tokio::test]
    async fn test_dropped_completer_reads_shutdown() {
        let (mut cmd, completer) = command_pair(2, Uuid::new_v4());
        drop(completer);
        assert_eq!(cmd.wait().await, CommandStatus::ShutDown);
    }
}
