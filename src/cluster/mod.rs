//! The replication and role state machine: peer management, the
//! election/standup protocol, commit replication with ordering guarantees,
//! parallel replication with conflict retry, and the escalation protocol.

mod escalation;
mod message;
mod node;
mod notifier;
mod peer;
mod replicator;
mod server;
pub mod transport;

pub use escalation::{peek_peer_command, Command, CommandID, CommandServer, Escalations};
pub use message::{
    CommitCount, ConsistencyLevel, Envelope, Message, PeerID, PeerResponse, Priority, Ticks,
    TransactionID,
};
pub use node::{CommitState, Node, Options, PeerStatus, Shared, State, Status, PRIORITY_NOT_READY};
pub use notifier::{Notifier, Wait};
pub use peer::{backoff, Peer, Peers};
pub use server::{NodeHandle, Request, Server};
pub use transport::{Event, Transport};
