use super::message::PeerID;
use crate::error::Result;
use crate::store;

use itertools::Itertools as _;
use std::collections::HashMap;
use uuid::Uuid;

/// A command ID, unique across the cluster.
pub type CommandID = Uuid;

/// A client command routed through the cluster. Commands originate in the
/// command server; mutating commands received on a follower are escalated to
/// the leader and handed back, completed, when its response returns.
#[derive(Clone, Debug)]
pub struct Command {
    pub id: CommandID,
    /// The request payload: a store statement.
    pub request: String,
    /// Read-only commands may run on any node without escalation.
    pub read_only: bool,
    /// The response payload, attached on completion.
    pub response: Option<Result<Vec<u8>>>,
    pub complete: bool,
    /// The peer that escalated this command, when set by the leader.
    pub initiating_peer: Option<PeerID>,
}

impl Command {
    pub fn new(request: impl Into<String>, read_only: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            request: request.into(),
            read_only,
            response: None,
            complete: false,
            initiating_peer: None,
        }
    }
}

/// The command server boundary. The server produces and consumes application
/// commands and owns the worker threads that execute them; the node hands it
/// escalated commands to run and completed commands to finish.
pub trait CommandServer: Send + Sync {
    /// Enqueues a command for processing.
    fn accept_command(&self, command: Command);

    /// Receives a completed command, response attached.
    fn complete_command(&self, command: Command);

    /// Abandons a queued command, if it hasn't started.
    fn cancel_command(&self, _id: CommandID) {}
}

/// Follower-side tracking of commands escalated to the leader, keyed by
/// command ID. Entries live from escalation until the leader responds or the
/// leader is lost (commands are then requeued locally).
#[derive(Default)]
pub struct Escalations {
    commands: HashMap<CommandID, Command>,
}

impl Escalations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes ownership of an escalated command.
    pub fn insert(&mut self, command: Command) {
        self.commands.insert(command.id, command);
    }

    /// Removes and returns an escalated command.
    pub fn remove(&mut self, id: &CommandID) -> Option<Command> {
        self.commands.remove(id)
    }

    /// Removes and returns all escalated commands, sorted by ID for
    /// determinism.
    pub fn drain(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.commands).into_values().sorted_by_key(|c| c.id).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// The request payloads of outstanding escalations, for diagnostics.
    pub fn requests(&self) -> Vec<String> {
        self.commands.values().map(|c| c.request.clone()).sorted().collect()
    }
}

/// Peeks a peer command against a store handle. Pure: reads only the handle
/// and the command, never cluster or node state, so any thread may call it
/// at any time. Serves read-only commands from committed state and returns
/// true; mutating commands are refused with false and must take the
/// replication path.
pub fn peek_peer_command(db: &dyn store::Handle, command: &mut Command) -> bool {
    if !command.read_only {
        return false;
    }
    command.response = Some(db.read(&command.request));
    command.complete = true;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Memory, Store as _};
    use pretty_assertions::assert_eq;

    #[test]
    fn tracks_escalated_commands() {
        let mut escalations = Escalations::new();
        assert!(escalations.is_empty());

        let command = Command::new("SET a 1", false);
        let id = command.id;
        escalations.insert(command);
        escalations.insert(Command::new("SET b 2", false));
        assert_eq!(escalations.len(), 2);
        assert_eq!(escalations.requests(), vec!["SET a 1".to_string(), "SET b 2".to_string()]);

        let removed = escalations.remove(&id).expect("command not found");
        assert_eq!(removed.request, "SET a 1");
        assert_eq!(escalations.remove(&id).map(|c| c.id), None);

        assert_eq!(escalations.drain().len(), 1);
        assert!(escalations.is_empty());
    }

    #[test]
    fn peek_serves_reads_and_refuses_writes() -> crate::error::Result<()> {
        let store = Memory::new();
        let mut db = store.handle();
        db.begin()?;
        db.mutate("SET a 1")?;
        db.commit()?;

        let mut read = Command::new("GET a", true);
        assert!(peek_peer_command(db.as_ref(), &mut read));
        assert!(read.complete);
        assert_eq!(read.response, Some(Ok(b"1".to_vec())));

        let mut write = Command::new("SET a 2", false);
        assert!(!peek_peer_command(db.as_ref(), &mut write));
        assert!(!write.complete);
        Ok(())
    }
}
